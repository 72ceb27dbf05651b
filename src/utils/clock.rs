use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

/// A source of monotonic millisecond timestamps used to age cache entries.
pub trait Clock: Send + Sync + 'static {
    /// Milliseconds elapsed since an arbitrary, fixed origin. Never decreases.
    fn now_millis(&self) -> u64;
}

/// [`Clock`] backed by [`Instant`], counting from its construction.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// [`Clock`] that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Moves the clock forward by `millis`.
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::Relaxed);
    }

    pub fn set(&self, millis: u64) {
        self.now.fetch_max(millis, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}

impl<T: Clock> Clock for std::sync::Arc<T> {
    fn now_millis(&self) -> u64 {
        T::now_millis(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_never_goes_back() {
        let clock = ManualClock::new(100);
        clock.advance(50);
        assert_eq!(clock.now_millis(), 150);
        clock.set(20);
        assert_eq!(clock.now_millis(), 150);
        clock.set(400);
        assert_eq!(clock.now_millis(), 400);
    }
}
