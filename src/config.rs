//! Context configuration.
//!
//! [`ContextConfig`] derives [`serde::Deserialize`] so applications can embed it in
//! their own settings files. Every field has a default matching the values the
//! engine has always shipped with.

use serde::Deserialize;

/// Tunables for a [`GraphicsContext`](crate::context::GraphicsContext).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Number of frames the CPU may record ahead of the GPU. Each
    /// [`BindingSet`](crate::descriptor::BindingSet) keeps this many copies of its
    /// descriptors and uniform buffers.
    pub frames_in_flight: usize,

    /// An unreferenced cache entry is evicted once it has not been requested for
    /// longer than this many milliseconds.
    pub cache_idle_threshold_ms: u64,

    /// Minimum delay between two sweeps triggered by
    /// [`GraphicsContext::tick`](crate::context::GraphicsContext::tick).
    pub sweep_interval_ms: u64,

    /// Timeout passed to fence waits, in nanoseconds.
    pub fence_timeout_ns: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 3,
            cache_idle_threshold_ms: 12_000,
            sweep_interval_ms: 1_000,
            fence_timeout_ns: u64::MAX,
        }
    }
}

impl ContextConfig {
    pub fn with_frames_in_flight(mut self, frames_in_flight: usize) -> Self {
        assert!(frames_in_flight > 0, "frames_in_flight must be at least 1");
        self.frames_in_flight = frames_in_flight;
        self
    }
}
