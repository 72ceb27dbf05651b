//! Sampler descriptions and objects.
//!
//! Samplers are immutable and small, so the [`GraphicsContext`](crate::GraphicsContext)
//! caches one per distinct [`SamplerDescription`] instead of handing out fresh
//! ones for every texture.

use ash::vk;
use std::fmt::Debug;

use crate::{Device, HasDevice, error::Result, utils::AsVkHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerDescription {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
    /// Requests the device's maximum anisotropy.
    pub anisotropy: bool,
    /// Enables depth comparison, for shadow maps.
    pub compare_op: Option<vk::CompareOp>,
    pub border_color: vk::BorderColor,
}

impl Default for SamplerDescription {
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            anisotropy: false,
            compare_op: None,
            border_color: vk::BorderColor::FLOAT_OPAQUE_BLACK,
        }
    }
}

impl SamplerDescription {
    pub const NEAREST_CLAMP: Self = Self {
        mag_filter: vk::Filter::NEAREST,
        min_filter: vk::Filter::NEAREST,
        mipmap_mode: vk::SamplerMipmapMode::NEAREST,
        address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
        anisotropy: false,
        compare_op: None,
        border_color: vk::BorderColor::FLOAT_OPAQUE_BLACK,
    };

    /// Builds the create info, clamping anisotropy to `max_anisotropy`.
    pub fn create_info(&self, max_anisotropy: f32) -> vk::SamplerCreateInfo<'static> {
        let anisotropy = self.anisotropy && max_anisotropy > 1.0;
        vk::SamplerCreateInfo::default()
            .mag_filter(self.mag_filter)
            .min_filter(self.min_filter)
            .mipmap_mode(self.mipmap_mode)
            .address_mode_u(self.address_mode)
            .address_mode_v(self.address_mode)
            .address_mode_w(self.address_mode)
            .anisotropy_enable(anisotropy)
            .max_anisotropy(if anisotropy { max_anisotropy } else { 1.0 })
            .compare_enable(self.compare_op.is_some())
            .compare_op(self.compare_op.unwrap_or(vk::CompareOp::ALWAYS))
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(self.border_color)
    }
}

pub struct Sampler {
    device: Device,
    handle: vk::Sampler,
    description: SamplerDescription,
}
impl Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.handle.fmt(f)
    }
}
impl HasDevice for Sampler {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl Sampler {
    pub fn new(device: Device, description: SamplerDescription) -> Result<Self> {
        let handle = device.create_sampler(&description)?;
        Ok(Self {
            device,
            handle,
            description,
        })
    }

    pub fn description(&self) -> &SamplerDescription {
        &self.description
    }
}

impl AsVkHandle for Sampler {
    type Handle = vk::Sampler;

    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}
impl Drop for Sampler {
    fn drop(&mut self) {
        self.device.destroy_sampler(self.handle);
    }
}
