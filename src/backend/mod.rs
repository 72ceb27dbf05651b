//! Graphics API backends.
//!
//! Every object in this crate talks to the GPU through a [`Backend`] trait object
//! owned by the [`Device`](crate::Device). The backend is chosen once, when the
//! device is created, and the rest of the crate never needs to know which one it is.
//!
//! Two backends ship with the crate:
//!
//! - [`VulkanBackend`](vulkan::VulkanBackend) drives a real Vulkan device through
//!   `ash`, allocating memory with VMA. Enabled by the `vulkan` feature.
//! - [`HeadlessBackend`](headless::HeadlessBackend) hands out fake handles and
//!   records every call it receives. It is used to test and validate frame logic
//!   without a GPU, and can be told to fail specific calls.
//!
//! The trait speaks in raw `ash::vk` handles and structures so that the objects
//! built on top of it ([`Pipeline`](crate::pipeline::Pipeline),
//! [`CommandBuffer`](crate::command::CommandBuffer), ...) can own them and release
//! them on drop, the same way they would over a plain `ash::Device`.

pub mod headless;
#[cfg(feature = "vulkan")]
pub mod vulkan;

use ash::prelude::VkResult;
use ash::vk;

use crate::{
    command::CommandBufferKind,
    description::{FrameBufferDescription, PipelineDescription, RenderPassDescription},
    sampler::SamplerDescription,
};

/// Device capabilities the frame logic depends on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceLimits {
    pub max_samples: vk::SampleCountFlags,
    pub max_texture_units: u32,
    pub min_uniform_buffer_offset_alignment: vk::DeviceSize,
    pub max_anisotropy: f32,
    pub min_acceleration_structure_scratch_offset_alignment: vk::DeviceSize,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_samples: vk::SampleCountFlags::TYPE_1,
            max_texture_units: 16,
            min_uniform_buffer_offset_alignment: 256,
            max_anisotropy: 1.0,
            min_acceleration_structure_scratch_offset_alignment: 128,
        }
    }
}

/// A buffer allocated by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawBuffer {
    pub buffer: vk::Buffer,
    /// Zero unless the buffer was created with `SHADER_DEVICE_ADDRESS` usage.
    pub device_address: vk::DeviceAddress,
}

/// An acceleration structure together with the buffer backing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawAccelerationStructure {
    pub raw: vk::AccelerationStructureKHR,
    pub buffer: vk::Buffer,
    pub device_address: vk::DeviceAddress,
}

/// Render pass and frame buffer a secondary command buffer continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inheritance {
    pub render_pass: vk::RenderPass,
    pub frame_buffer: vk::Framebuffer,
}

/// The operations the rest of the crate needs from a graphics API.
///
/// `destroy_*` and `free_*` calls are only made once per handle, after the last
/// command buffer referencing the object has completed.
pub trait Backend: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn limits(&self) -> DeviceLimits;

    /// Blocks until every queue is idle.
    fn wait_idle(&self) -> VkResult<()>;

    /// Attaches a debug name to an object, for validation messages and capture
    /// tools. Backends without debug tooling ignore it.
    fn set_object_name(&self, object_type: vk::ObjectType, handle: u64, name: &str);

    fn create_render_pass(&self, desc: &RenderPassDescription) -> VkResult<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);

    fn create_frame_buffer(&self, desc: &FrameBufferDescription) -> VkResult<vk::Framebuffer>;
    fn destroy_frame_buffer(&self, frame_buffer: vk::Framebuffer);

    /// Builds the pipeline state object. `render_pass` is `None` for compute and
    /// ray tracing shaders.
    fn create_pipeline(
        &self,
        desc: &PipelineDescription,
        render_pass: Option<vk::RenderPass>,
    ) -> VkResult<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    fn create_sampler(&self, desc: &SamplerDescription) -> VkResult<vk::Sampler>;
    fn destroy_sampler(&self, sampler: vk::Sampler);

    fn allocate_command_buffer(
        &self,
        kind: CommandBufferKind,
        level: vk::CommandBufferLevel,
    ) -> VkResult<vk::CommandBuffer>;
    fn free_command_buffer(&self, kind: CommandBufferKind, command_buffer: vk::CommandBuffer);

    /// Creates an unsignaled fence.
    fn create_fence(&self) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        inheritance: Option<Inheritance>,
    ) -> VkResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;

    /// Submits a primary command buffer on the queue serving `kind`, signaling
    /// `fence` on completion.
    fn queue_submit(
        &self,
        kind: CommandBufferKind,
        command_buffer: vk::CommandBuffer,
        fence: vk::Fence,
    ) -> VkResult<()>;

    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        dependency_info: &vk::DependencyInfo<'_>,
    );
    fn cmd_begin_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::RenderPassBeginInfo<'_>,
        contents: vk::SubpassContents,
    );
    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer);
    fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );
    fn cmd_execute_commands(
        &self,
        command_buffer: vk::CommandBuffer,
        secondaries: &[vk::CommandBuffer],
    );
    fn cmd_build_acceleration_structures(
        &self,
        command_buffer: vk::CommandBuffer,
        infos: &[vk::AccelerationStructureBuildGeometryInfoKHR<'_>],
        build_range_infos: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    );

    fn allocate_descriptor_sets(
        &self,
        layout: vk::DescriptorSetLayout,
        count: usize,
    ) -> VkResult<Vec<vk::DescriptorSet>>;
    fn free_descriptor_sets(&self, sets: &[vk::DescriptorSet]);

    /// Applies every write in one call. Either all writes are applied or, on error,
    /// none of them are.
    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) -> VkResult<()>;

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        host_visible: bool,
    ) -> VkResult<RawBuffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);

    /// Copies `data` into a host-visible buffer at `offset`.
    fn write_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, data: &[u8])
    -> VkResult<()>;

    fn create_acceleration_structure(
        &self,
        ty: vk::AccelerationStructureTypeKHR,
        size: vk::DeviceSize,
    ) -> VkResult<RawAccelerationStructure>;
    fn destroy_acceleration_structure(&self, accel_struct: &RawAccelerationStructure);

    fn acceleration_structure_build_sizes(
        &self,
        info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        max_primitive_counts: &[u32],
    ) -> vk::AccelerationStructureBuildSizesInfoKHR<'static>;
}
