//! GPU buffers.
//!
//! - **[`Buffer::new_private`]**: GPU-exclusive memory. Use for scratch buffers and
//!   any data generated entirely on the GPU.
//! - **[`Buffer::new_host`]**: CPU-writable memory. Use for uniform blocks and other
//!   data rewritten by the CPU every frame.
//!
//! Memory itself is managed by the [`Backend`](crate::backend::Backend); the
//! Vulkan backend allocates through VMA.

use std::fmt::Debug;

use ash::vk;

use crate::{
    Device, HasDevice,
    error::{Error, Result},
    utils::AsVkHandle,
};

pub struct Buffer {
    device: Device,
    buffer: vk::Buffer,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    device_address: vk::DeviceAddress,
    host_visible: bool,
}

impl Buffer {
    /// Create a buffer that is accessible exclusively from the GPU.
    pub fn new_private(
        device: Device,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        Self::new(device, size, alignment, usage, false)
    }

    /// Create a buffer the CPU can write with [`write`](Self::write).
    pub fn new_host(
        device: Device,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        Self::new(device, size, alignment, usage, true)
    }

    fn new(
        device: Device,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        host_visible: bool,
    ) -> Result<Self> {
        let raw = device
            .create_buffer(size, alignment, usage, host_visible)
            .map_err(|err| match err {
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                    Error::OutOfDeviceMemory {
                        what: "buffer",
                        size,
                    }
                }
                err => Error::Vulkan(err),
            })?;
        Ok(Self {
            device,
            buffer: raw.buffer,
            size,
            usage,
            device_address: raw.device_address,
            host_visible,
        })
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Zero unless created with `SHADER_DEVICE_ADDRESS` usage.
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    pub fn is_host_visible(&self) -> bool {
        self.host_visible
    }

    /// Copies `data` into the buffer at `offset`.
    pub fn write(&self, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        debug_assert!(offset + data.len() as vk::DeviceSize <= self.size);
        if !self.host_visible {
            tracing::warn!(buffer = ?self.buffer, "Writing to a buffer that isn't host visible");
        }
        self.device.write_buffer(self.buffer, offset, data)?;
        Ok(())
    }

    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.buffer,
            offset: 0,
            range: self.size,
        }
    }
}

impl HasDevice for Buffer {
    fn device(&self) -> &Device {
        &self.device
    }
}
impl Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("handle", &self.buffer)
            .field("size", &self.size)
            .field("device_address", &self.device_address)
            .field("host_visible", &self.host_visible)
            .finish_non_exhaustive()
    }
}
impl AsVkHandle for Buffer {
    type Handle = vk::Buffer;
    fn vk_handle(&self) -> Self::Handle {
        self.buffer
    }
}
impl Drop for Buffer {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{FailurePoint, HeadlessBackend};

    #[test]
    fn test_out_of_memory_is_reported() {
        let backend = HeadlessBackend::new();
        let device = Device::new(backend.clone());
        backend.fail_next(FailurePoint::CreateBuffer);
        let err = Buffer::new_private(device, 4096, 256, vk::BufferUsageFlags::STORAGE_BUFFER)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::OutOfDeviceMemory {
                what: "buffer",
                size: 4096
            }
        ));
    }

    #[test]
    fn test_write_and_drop() {
        let backend = HeadlessBackend::new();
        let device = Device::new(backend.clone());
        let buffer = Buffer::new_host(device, 16, 16, vk::BufferUsageFlags::UNIFORM_BUFFER).unwrap();
        buffer.write(8, &[7; 8]).unwrap();
        let contents = backend.buffer_contents(buffer.vk_handle()).unwrap();
        assert_eq!(&contents[8..], &[7; 8]);
        drop(buffer);
        assert_eq!(backend.live_objects(), 0);
    }
}
