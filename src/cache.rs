//! Timestamp-aged object cache.
//!
//! [`TimedCache`] maps a key (usually a [`Fingerprint`](crate::hash::Fingerprint))
//! to a shared asset and the last time it was requested. The cache is the only
//! long-term owner of its assets. Callers receive an [`Arc`] clone and are expected
//! to drop it when they stop using the object; once nobody but the cache holds an
//! asset and it has been idle for long enough, [`TimedCache::sweep`] drops it.
//!
//! ```
//! # use scoria::cache::TimedCache;
//! # use std::sync::Arc;
//! let mut cache = TimedCache::<u64, String>::new();
//! let asset = cache.get_or_insert_with(7, 0, || "render pass".to_string());
//! assert!(Arc::ptr_eq(&asset, &cache.get_or_insert_with(7, 5, || unreachable!())));
//!
//! // Still referenced: never evicted.
//! assert_eq!(cache.sweep(100_000, 12_000), 0);
//! drop(asset);
//! assert_eq!(cache.sweep(100_000, 12_000), 1);
//! ```

use std::{collections::HashMap, hash::Hash, sync::Arc};

/// A cached asset together with the timestamp of its most recent request.
#[derive(Debug)]
pub struct CacheEntry<A> {
    pub asset: Arc<A>,
    pub last_access: u64,
}

impl<A> CacheEntry<A> {
    /// Returns true if the cache holds the only reference to the asset and the entry
    /// has not been requested for more than `idle_threshold` milliseconds.
    pub fn is_evictable(&self, now: u64, idle_threshold: u64) -> bool {
        Arc::strong_count(&self.asset) == 1 && now.saturating_sub(self.last_access) > idle_threshold
    }
}

#[derive(Debug)]
pub struct TimedCache<K, A> {
    entries: HashMap<K, CacheEntry<A>>,
}

impl<K, A> Default for TimedCache<K, A> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Copy, A> TimedCache<K, A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up an entry without refreshing its timestamp.
    pub fn find(&self, key: K) -> Option<&CacheEntry<A>> {
        self.entries.get(&key)
    }

    /// Refreshes the timestamp of an entry. Returns false if there is no such entry.
    pub fn touch(&mut self, key: K, now: u64) -> bool {
        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.last_access = entry.last_access.max(now);
                true
            }
            None => false,
        }
    }

    /// Inserts an asset, returning the asset previously stored under `key`.
    pub fn insert(&mut self, key: K, asset: Arc<A>, now: u64) -> Option<Arc<A>> {
        self.entries
            .insert(
                key,
                CacheEntry {
                    asset,
                    last_access: now,
                },
            )
            .map(|old| old.asset)
    }

    /// Returns the cached asset for `key`, refreshing its timestamp, or builds and
    /// inserts a new one. Build failures are returned to the caller and leave the
    /// cache untouched.
    pub fn get_or_try_insert_with<E>(
        &mut self,
        key: K,
        now: u64,
        build: impl FnOnce() -> Result<A, E>,
    ) -> Result<Arc<A>, E> {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.last_access = entry.last_access.max(now);
            return Ok(entry.asset.clone());
        }
        let asset = Arc::new(build()?);
        self.insert(key, asset.clone(), now);
        Ok(asset)
    }

    pub fn get_or_insert_with(&mut self, key: K, now: u64, build: impl FnOnce() -> A) -> Arc<A> {
        match self.get_or_try_insert_with(key, now, || Ok::<_, std::convert::Infallible>(build())) {
            Ok(asset) => asset,
            Err(never) => match never {},
        }
    }

    /// Drops every entry that only the cache still references and that has been idle
    /// for longer than `idle_threshold` milliseconds. Returns the number of evicted
    /// entries.
    pub fn sweep(&mut self, now: u64, idle_threshold: u64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !entry.is_evictable(now, idle_threshold));
        before - self.entries.len()
    }

    /// Drops every entry regardless of age or outstanding references.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &CacheEntry<A>)> {
        self.entries.iter()
    }
}
