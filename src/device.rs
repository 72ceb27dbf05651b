//! The shared device handle.
//!
//! A [`Device`] wraps the [`Backend`] chosen at startup together with the limits it
//! reported. It is reference-counted for cheap sharing: every object that owns a
//! GPU handle keeps a clone so it can release the handle when dropped, which also
//! guarantees that the backend outlives everything allocated from it.
//!
//! ```
//! # use scoria::{Device, backend::headless::HeadlessBackend};
//! let device = Device::new(HeadlessBackend::new());
//! assert_eq!(device.name(), "headless");
//! assert_eq!(device.aligned_dynamic_uniform_size(100), 256);
//! ```

use std::{fmt::Debug, ops::Deref, sync::Arc};

use ash::vk;

use crate::backend::{Backend, DeviceLimits};

/// A trait for types created from a [`Device`].
pub trait HasDevice {
    fn device(&self) -> &Device;
}

#[derive(Clone)]
pub struct Device(Arc<DeviceInner>);

struct DeviceInner {
    backend: Box<dyn Backend>,
    limits: DeviceLimits,
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Device {}
impl Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Device").field(&self.0.backend.name()).finish()
    }
}

impl Device {
    pub fn new(backend: impl Backend) -> Self {
        Self::from_boxed(Box::new(backend))
    }

    pub fn from_boxed(backend: Box<dyn Backend>) -> Self {
        let limits = backend.limits();
        tracing::info!(backend = backend.name(), ?limits, "Device created");
        Self(Arc::new(DeviceInner { backend, limits }))
    }

    pub fn limits(&self) -> &DeviceLimits {
        &self.0.limits
    }

    pub fn backend(&self) -> &dyn Backend {
        self.0.backend.as_ref()
    }

    /// Names `handle` in debugging tools.
    pub fn name_object<T: vk::Handle>(&self, handle: T, name: &str) {
        self.0.backend.set_object_name(T::TYPE, handle.as_raw(), name);
    }

    /// Rounds `size` up to the minimum uniform buffer offset alignment, so that
    /// consecutive dynamic uniform blocks can share one buffer.
    pub fn aligned_dynamic_uniform_size(&self, size: vk::DeviceSize) -> vk::DeviceSize {
        let alignment = self.0.limits.min_uniform_buffer_offset_alignment.max(1);
        size.next_multiple_of(alignment)
    }
}

impl Deref for Device {
    type Target = dyn Backend;

    fn deref(&self) -> &Self::Target {
        self.0.backend.as_ref()
    }
}

impl HasDevice for Device {
    fn device(&self) -> &Device {
        self
    }
}
