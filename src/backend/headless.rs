//! A backend without a GPU.
//!
//! [`HeadlessBackend`] hands out unique fake handles, keeps host-side copies of
//! buffer contents and records every call it receives as a [`Call`]. It shares its
//! state between clones, so a test can keep one clone to inspect what the
//! [`Device`](crate::Device) owning the other one did:
//!
//! ```
//! # use scoria::{Device, backend::headless::{Call, HeadlessBackend}};
//! let backend = HeadlessBackend::new();
//! let device = Device::new(backend.clone());
//! device.wait_idle().unwrap();
//! assert_eq!(backend.calls(), vec![Call::WaitIdle]);
//! ```
//!
//! Failures can be injected per [`FailurePoint`] to exercise error paths.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use ash::{
    prelude::VkResult,
    vk::{self, Handle},
};

use super::{Backend, DeviceLimits, Inheritance, RawAccelerationStructure, RawBuffer};
use crate::{
    command::CommandBufferKind,
    description::{FrameBufferDescription, PipelineDescription, RenderPassDescription},
    sampler::SamplerDescription,
};

/// Device address of the first buffer. Every buffer gets its own 1 MiB-aligned range.
const ADDRESS_BASE: vk::DeviceAddress = 0x1_0000_0000;
const ADDRESS_STRIDE: vk::DeviceAddress = 0x10_0000;

/// A write recorded by [`Backend::update_descriptor_sets`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedWrite {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    WaitIdle,
    SetObjectName {
        object_type: vk::ObjectType,
        handle: u64,
        name: String,
    },
    CreateRenderPass {
        render_pass: vk::RenderPass,
        attachments: usize,
        clear: bool,
    },
    DestroyRenderPass(vk::RenderPass),
    CreateFrameBuffer {
        frame_buffer: vk::Framebuffer,
        width: u32,
        height: u32,
        layer: u32,
    },
    DestroyFrameBuffer(vk::Framebuffer),
    CreatePipeline {
        pipeline: vk::Pipeline,
        shader: String,
        render_pass: Option<vk::RenderPass>,
    },
    DestroyPipeline(vk::Pipeline),
    CreateSampler(vk::Sampler),
    DestroySampler(vk::Sampler),
    AllocateCommandBuffer {
        command_buffer: vk::CommandBuffer,
        kind: CommandBufferKind,
        level: vk::CommandBufferLevel,
    },
    FreeCommandBuffer(vk::CommandBuffer),
    CreateFence(vk::Fence),
    DestroyFence(vk::Fence),
    WaitForFence(vk::Fence),
    ResetFence(vk::Fence),
    BeginCommandBuffer {
        command_buffer: vk::CommandBuffer,
        inheritance: Option<Inheritance>,
    },
    EndCommandBuffer(vk::CommandBuffer),
    QueueSubmit {
        kind: CommandBufferKind,
        command_buffer: vk::CommandBuffer,
        fence: vk::Fence,
    },
    PipelineBarrier {
        command_buffer: vk::CommandBuffer,
        memory_barriers: Vec<(vk::PipelineStageFlags2, vk::PipelineStageFlags2)>,
        image_barriers: Vec<(vk::Image, vk::ImageLayout, vk::ImageLayout)>,
    },
    BeginRenderPass {
        command_buffer: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        frame_buffer: vk::Framebuffer,
        contents: vk::SubpassContents,
    },
    EndRenderPass(vk::CommandBuffer),
    BindPipeline {
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    ExecuteCommands {
        command_buffer: vk::CommandBuffer,
        secondaries: Vec<vk::CommandBuffer>,
    },
    BuildAccelerationStructure {
        command_buffer: vk::CommandBuffer,
        dst: vk::AccelerationStructureKHR,
        scratch_address: vk::DeviceAddress,
        geometry_count: u32,
        primitive_count: u32,
    },
    AllocateDescriptorSets(Vec<vk::DescriptorSet>),
    FreeDescriptorSets(Vec<vk::DescriptorSet>),
    UpdateDescriptorSets(Vec<RecordedWrite>),
    CreateBuffer {
        buffer: vk::Buffer,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    },
    DestroyBuffer(vk::Buffer),
    WriteBuffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        len: usize,
    },
    CreateAccelerationStructure {
        raw: vk::AccelerationStructureKHR,
        size: vk::DeviceSize,
    },
    DestroyAccelerationStructure(vk::AccelerationStructureKHR),
}

/// Calls that can be made to fail with [`HeadlessBackend::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    CreateRenderPass,
    CreateFrameBuffer,
    CreatePipeline,
    CreateSampler,
    BeginCommandBuffer,
    QueueSubmit,
    WaitForFence,
    AllocateDescriptorSets,
    UpdateDescriptorSets,
    CreateBuffer,
    WriteBuffer,
    CreateAccelerationStructure,
}

impl FailurePoint {
    fn error(self) -> vk::Result {
        match self {
            Self::CreateBuffer | Self::CreateAccelerationStructure => {
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            }
            Self::AllocateDescriptorSets => vk::Result::ERROR_OUT_OF_POOL_MEMORY,
            Self::WriteBuffer => vk::Result::ERROR_MEMORY_MAP_FAILED,
            Self::WaitForFence => vk::Result::TIMEOUT,
            Self::QueueSubmit => vk::Result::ERROR_DEVICE_LOST,
            _ => vk::Result::ERROR_UNKNOWN,
        }
    }
}

struct HostBuffer {
    data: Vec<u8>,
    host_visible: bool,
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    failures: HashMap<FailurePoint, usize>,
    buffers: HashMap<vk::Buffer, HostBuffer>,
    live: HashSet<u64>,
}

#[derive(Clone)]
pub struct HeadlessBackend {
    limits: DeviceLimits,
    next_handle: Arc<AtomicU64>,
    state: Arc<Mutex<State>>,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self {
            limits: DeviceLimits::default(),
            next_handle: Arc::new(AtomicU64::new(1)),
            state: Arc::default(),
        }
    }

    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Every call received so far, oldest first.
    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Number of recorded calls matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.state().calls.iter().filter(|call| predicate(call)).count()
    }

    /// Makes the next call through `point` fail.
    pub fn fail_next(&self, point: FailurePoint) {
        self.fail_times(point, 1);
    }

    /// Makes the next `times` calls through `point` fail.
    pub fn fail_times(&self, point: FailurePoint, times: usize) {
        *self.state().failures.entry(point).or_default() += times;
    }

    /// Host copy of a buffer's contents.
    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.state().buffers.get(&buffer).map(|b| b.data.clone())
    }

    /// Number of objects created and not yet destroyed.
    pub fn live_objects(&self) -> usize {
        self.state().live.len()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, point: FailurePoint) -> VkResult<()> {
        let mut state = self.state();
        match state.failures.get_mut(&point) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                tracing::debug!(?point, "Injected failure");
                Err(point.error())
            }
            _ => Ok(()),
        }
    }

    fn record(&self, call: Call) {
        self.state().calls.push(call);
    }

    fn create<T: Handle>(&self) -> T {
        let raw = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.state().live.insert(raw);
        T::from_raw(raw)
    }

    fn release<T: Handle>(&self, handle: T) {
        let raw = handle.as_raw();
        if !self.state().live.remove(&raw) {
            tracing::error!(handle = raw, "Released a handle that is not alive");
        }
    }
}

impl Backend for HeadlessBackend {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn wait_idle(&self) -> VkResult<()> {
        self.record(Call::WaitIdle);
        Ok(())
    }

    fn set_object_name(&self, object_type: vk::ObjectType, handle: u64, name: &str) {
        self.record(Call::SetObjectName {
            object_type,
            handle,
            name: name.to_owned(),
        });
    }

    fn create_render_pass(&self, desc: &RenderPassDescription) -> VkResult<vk::RenderPass> {
        self.check(FailurePoint::CreateRenderPass)?;
        let render_pass = self.create();
        self.record(Call::CreateRenderPass {
            render_pass,
            attachments: desc.attachments.len(),
            clear: desc.clear,
        });
        Ok(render_pass)
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.release(render_pass);
        self.record(Call::DestroyRenderPass(render_pass));
    }

    fn create_frame_buffer(&self, desc: &FrameBufferDescription) -> VkResult<vk::Framebuffer> {
        self.check(FailurePoint::CreateFrameBuffer)?;
        let frame_buffer = self.create();
        self.record(Call::CreateFrameBuffer {
            frame_buffer,
            width: desc.width,
            height: desc.height,
            layer: desc.layer,
        });
        Ok(frame_buffer)
    }

    fn destroy_frame_buffer(&self, frame_buffer: vk::Framebuffer) {
        self.release(frame_buffer);
        self.record(Call::DestroyFrameBuffer(frame_buffer));
    }

    fn create_pipeline(
        &self,
        desc: &PipelineDescription,
        render_pass: Option<vk::RenderPass>,
    ) -> VkResult<vk::Pipeline> {
        self.check(FailurePoint::CreatePipeline)?;
        let pipeline = self.create();
        self.record(Call::CreatePipeline {
            pipeline,
            shader: desc.shader.name().to_string(),
            render_pass,
        });
        Ok(pipeline)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.release(pipeline);
        self.record(Call::DestroyPipeline(pipeline));
    }

    fn create_sampler(&self, _desc: &SamplerDescription) -> VkResult<vk::Sampler> {
        self.check(FailurePoint::CreateSampler)?;
        let sampler = self.create();
        self.record(Call::CreateSampler(sampler));
        Ok(sampler)
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.release(sampler);
        self.record(Call::DestroySampler(sampler));
    }

    fn allocate_command_buffer(
        &self,
        kind: CommandBufferKind,
        level: vk::CommandBufferLevel,
    ) -> VkResult<vk::CommandBuffer> {
        let command_buffer = self.create();
        self.record(Call::AllocateCommandBuffer {
            command_buffer,
            kind,
            level,
        });
        Ok(command_buffer)
    }

    fn free_command_buffer(&self, _kind: CommandBufferKind, command_buffer: vk::CommandBuffer) {
        self.release(command_buffer);
        self.record(Call::FreeCommandBuffer(command_buffer));
    }

    fn create_fence(&self) -> VkResult<vk::Fence> {
        let fence = self.create();
        self.record(Call::CreateFence(fence));
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.release(fence);
        self.record(Call::DestroyFence(fence));
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> VkResult<()> {
        self.check(FailurePoint::WaitForFence)?;
        self.record(Call::WaitForFence(fence));
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        self.record(Call::ResetFence(fence));
        Ok(())
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        inheritance: Option<Inheritance>,
    ) -> VkResult<()> {
        self.check(FailurePoint::BeginCommandBuffer)?;
        self.record(Call::BeginCommandBuffer {
            command_buffer,
            inheritance,
        });
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.record(Call::EndCommandBuffer(command_buffer));
        Ok(())
    }

    fn queue_submit(
        &self,
        kind: CommandBufferKind,
        command_buffer: vk::CommandBuffer,
        fence: vk::Fence,
    ) -> VkResult<()> {
        self.check(FailurePoint::QueueSubmit)?;
        self.record(Call::QueueSubmit {
            kind,
            command_buffer,
            fence,
        });
        Ok(())
    }

    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        dependency_info: &vk::DependencyInfo<'_>,
    ) {
        // SAFETY: the counts and pointers were set together by the slice setters.
        let (memory, images) = unsafe {
            (
                slice_or_empty(
                    dependency_info.p_memory_barriers,
                    dependency_info.memory_barrier_count,
                ),
                slice_or_empty(
                    dependency_info.p_image_memory_barriers,
                    dependency_info.image_memory_barrier_count,
                ),
            )
        };
        self.record(Call::PipelineBarrier {
            command_buffer,
            memory_barriers: memory
                .iter()
                .map(|b| (b.src_stage_mask, b.dst_stage_mask))
                .collect(),
            image_barriers: images
                .iter()
                .map(|b| (b.image, b.old_layout, b.new_layout))
                .collect(),
        });
    }

    fn cmd_begin_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::RenderPassBeginInfo<'_>,
        contents: vk::SubpassContents,
    ) {
        self.record(Call::BeginRenderPass {
            command_buffer,
            render_pass: begin_info.render_pass,
            frame_buffer: begin_info.framebuffer,
            contents,
        });
    }

    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        self.record(Call::EndRenderPass(command_buffer));
    }

    fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.record(Call::BindPipeline {
            command_buffer,
            bind_point,
            pipeline,
        });
    }

    fn cmd_execute_commands(
        &self,
        command_buffer: vk::CommandBuffer,
        secondaries: &[vk::CommandBuffer],
    ) {
        self.record(Call::ExecuteCommands {
            command_buffer,
            secondaries: secondaries.to_vec(),
        });
    }

    fn cmd_build_acceleration_structures(
        &self,
        command_buffer: vk::CommandBuffer,
        infos: &[vk::AccelerationStructureBuildGeometryInfoKHR<'_>],
        build_range_infos: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    ) {
        for (info, ranges) in infos.iter().zip(build_range_infos) {
            self.record(Call::BuildAccelerationStructure {
                command_buffer,
                dst: info.dst_acceleration_structure,
                // SAFETY: device builds always set the device address variant.
                scratch_address: unsafe { info.scratch_data.device_address },
                geometry_count: info.geometry_count,
                primitive_count: ranges.iter().map(|r| r.primitive_count).sum(),
            });
        }
    }

    fn allocate_descriptor_sets(
        &self,
        _layout: vk::DescriptorSetLayout,
        count: usize,
    ) -> VkResult<Vec<vk::DescriptorSet>> {
        self.check(FailurePoint::AllocateDescriptorSets)?;
        let sets: Vec<vk::DescriptorSet> = (0..count).map(|_| self.create()).collect();
        self.record(Call::AllocateDescriptorSets(sets.clone()));
        Ok(sets)
    }

    fn free_descriptor_sets(&self, sets: &[vk::DescriptorSet]) {
        for set in sets {
            self.release(*set);
        }
        self.record(Call::FreeDescriptorSets(sets.to_vec()));
    }

    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) -> VkResult<()> {
        self.check(FailurePoint::UpdateDescriptorSets)?;
        self.record(Call::UpdateDescriptorSets(
            writes
                .iter()
                .map(|w| RecordedWrite {
                    set: w.dst_set,
                    binding: w.dst_binding,
                    ty: w.descriptor_type,
                    count: w.descriptor_count,
                })
                .collect(),
        ));
        Ok(())
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        host_visible: bool,
    ) -> VkResult<RawBuffer> {
        self.check(FailurePoint::CreateBuffer)?;
        debug_assert!(alignment <= ADDRESS_STRIDE);
        let buffer: vk::Buffer = self.create();
        let device_address = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            ADDRESS_BASE + buffer.as_raw() * ADDRESS_STRIDE
        } else {
            0
        };
        self.state().buffers.insert(
            buffer,
            HostBuffer {
                data: vec![0; size as usize],
                host_visible,
            },
        );
        self.record(Call::CreateBuffer {
            buffer,
            size,
            usage,
        });
        Ok(RawBuffer {
            buffer,
            device_address,
        })
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.release(buffer);
        self.state().buffers.remove(&buffer);
        self.record(Call::DestroyBuffer(buffer));
    }

    fn write_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> VkResult<()> {
        self.check(FailurePoint::WriteBuffer)?;
        {
            let mut state = self.state();
            let target = state
                .buffers
                .get_mut(&buffer)
                .ok_or(vk::Result::ERROR_UNKNOWN)?;
            if !target.host_visible {
                return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
            }
            let start = offset as usize;
            let end = start + data.len();
            if end > target.data.len() {
                return Err(vk::Result::ERROR_UNKNOWN);
            }
            target.data[start..end].copy_from_slice(data);
        }
        self.record(Call::WriteBuffer {
            buffer,
            offset,
            len: data.len(),
        });
        Ok(())
    }

    fn create_acceleration_structure(
        &self,
        _ty: vk::AccelerationStructureTypeKHR,
        size: vk::DeviceSize,
    ) -> VkResult<RawAccelerationStructure> {
        self.check(FailurePoint::CreateAccelerationStructure)?;
        let backing = self.create_buffer(
            size,
            256,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            false,
        )?;
        let raw = self.create();
        self.record(Call::CreateAccelerationStructure { raw, size });
        Ok(RawAccelerationStructure {
            raw,
            buffer: backing.buffer,
            device_address: backing.device_address,
        })
    }

    fn destroy_acceleration_structure(&self, accel_struct: &RawAccelerationStructure) {
        self.release(accel_struct.raw);
        self.record(Call::DestroyAccelerationStructure(accel_struct.raw));
        self.destroy_buffer(accel_struct.buffer);
    }

    /// Sizes grow linearly with the primitive count. The scratch size is deliberately
    /// not a multiple of any power of two above 4.
    fn acceleration_structure_build_sizes(
        &self,
        _info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        max_primitive_counts: &[u32],
    ) -> vk::AccelerationStructureBuildSizesInfoKHR<'static> {
        let primitives: u64 = max_primitive_counts.iter().map(|&c| c as u64).sum();
        vk::AccelerationStructureBuildSizesInfoKHR::default()
            .acceleration_structure_size(1024 + 64 * primitives)
            .build_scratch_size(100 * primitives + 36)
            .update_scratch_size(50 * primitives + 36)
    }
}

/// # Safety
/// `ptr` must point to `count` valid elements when `count` is non-zero.
unsafe fn slice_or_empty<'a, T>(ptr: *const T, count: u32) -> &'a [T] {
    if count == 0 || ptr.is_null() {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(ptr, count as usize) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_unique_and_tracked() {
        let backend = HeadlessBackend::new();
        let a = backend.create_fence().unwrap();
        let b = backend.create_fence().unwrap();
        assert_ne!(a, b);
        assert_eq!(backend.live_objects(), 2);
        backend.destroy_fence(a);
        backend.destroy_fence(b);
        assert_eq!(backend.live_objects(), 0);
    }

    #[test]
    fn test_injected_failures_are_consumed() {
        let backend = HeadlessBackend::new();
        backend.fail_times(FailurePoint::CreateBuffer, 2);
        let usage = vk::BufferUsageFlags::UNIFORM_BUFFER;
        assert_eq!(
            backend.create_buffer(16, 16, usage, true).unwrap_err(),
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
        );
        assert!(backend.create_buffer(16, 16, usage, true).is_err());
        assert!(backend.create_buffer(16, 16, usage, true).is_ok());
    }

    #[test]
    fn test_buffer_writes_are_kept() {
        let backend = HeadlessBackend::new();
        let raw = backend
            .create_buffer(8, 4, vk::BufferUsageFlags::UNIFORM_BUFFER, true)
            .unwrap();
        backend.write_buffer(raw.buffer, 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(
            backend.buffer_contents(raw.buffer).unwrap(),
            vec![0, 0, 0, 0, 1, 2, 3, 4]
        );
        assert!(backend.write_buffer(raw.buffer, 6, &[0; 4]).is_err());
    }

    #[test]
    fn test_device_addresses_respect_alignment() {
        let backend = HeadlessBackend::new();
        let raw = backend
            .create_buffer(
                100,
                256,
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                false,
            )
            .unwrap();
        assert_ne!(raw.device_address, 0);
        assert_eq!(raw.device_address % 256, 0);
    }
}
