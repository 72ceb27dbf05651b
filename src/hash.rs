//! Stable fingerprints for resource descriptions.
//!
//! Cached objects are keyed by a 64-bit [`Fingerprint`] computed over every field of
//! a description that affects the identity of the object it builds. The hasher is
//! xxh3 with a fixed seed, so fingerprints are stable across runs and processes.
//!
//! Descriptions implement [`Hash`] and are fed through a [`DescriptionHasher`]:
//!
//! ```
//! # use scoria::hash::{DescriptionHasher, Fingerprint};
//! # use std::hash::{Hash, Hasher};
//! let mut hasher = DescriptionHasher::new();
//! (800u32, 600u32).hash(&mut hasher);
//! let fingerprint: Fingerprint = hasher.finish_fingerprint();
//! assert_eq!(fingerprint, Fingerprint::of(&(800u32, 600u32)));
//! ```

use std::{fmt, hash::Hash, hash::Hasher};

use xxhash_rust::xxh3::Xxh3;

/// 64-bit identity of a description.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    pub fn of<T: Hash + ?Sized>(value: &T) -> Self {
        let mut hasher = DescriptionHasher::new();
        value.hash(&mut hasher);
        hasher.finish_fingerprint()
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({:016x})", self.0)
    }
}

/// Incremental [`Hasher`] producing [`Fingerprint`]s.
#[derive(Clone)]
pub struct DescriptionHasher {
    inner: Xxh3,
}

impl Default for DescriptionHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptionHasher {
    pub fn new() -> Self {
        Self {
            inner: Xxh3::new(),
        }
    }

    /// Mixes another value into the running fingerprint.
    pub fn mix<T: Hash + ?Sized>(&mut self, value: &T) -> &mut Self {
        value.hash(self);
        self
    }

    pub fn finish_fingerprint(&self) -> Fingerprint {
        Fingerprint(self.inner.digest())
    }
}

impl Hasher for DescriptionHasher {
    fn finish(&self) -> u64 {
        self.inner.digest()
    }

    fn write(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable() {
        let a = Fingerprint::of(&("pipeline", 800u32, 600u32, true));
        let b = Fingerprint::of(&("pipeline", 800u32, 600u32, true));
        assert_eq!(a, b);
    }

    #[test]
    fn test_field_order_matters() {
        assert_ne!(
            Fingerprint::of(&(800u32, 600u32)),
            Fingerprint::of(&(600u32, 800u32))
        );
    }

    #[test]
    fn test_mix_matches_hash() {
        let mut hasher = DescriptionHasher::new();
        hasher.mix(&1u64).mix(&"color");
        assert_eq!(hasher.finish_fingerprint(), Fingerprint::of(&(1u64, "color")));
    }
}
