//! [`Backend`] over a Vulkan device.
//!
//! The application creates the instance, picks the physical device and creates the
//! logical device with the queues it wants. [`VulkanBackend`] then takes over the
//! objects this crate needs: command pools, descriptor pools and buffer memory,
//! which is allocated through VMA.
//!
//! The device must have `synchronization2` enabled. Acceleration structure support
//! requires `VK_KHR_acceleration_structure` and `bufferDeviceAddress`.
//!
//! The backend does not own the device. Drop it before destroying the device.

use std::{
    collections::HashMap,
    ffi::CString,
    sync::{Mutex, MutexGuard, PoisonError},
};

use ash::prelude::VkResult;
use ash::{ext, khr, vk};
use smallvec::SmallVec;
use vk_mem::Alloc;

use super::{Backend, DeviceLimits, Inheritance, RawAccelerationStructure, RawBuffer};
use crate::{
    command::CommandBufferKind,
    description::{FrameBufferDescription, PipelineDescription, RenderPassDescription},
    sampler::SamplerDescription,
    shader::ShaderKind,
    texture::TextureKind,
    utils::AsVkHandle,
};

const DESCRIPTOR_POOL_MAX_SETS: u32 = 256;

/// A queue and the family it was created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueInfo {
    pub family: u32,
    pub queue: vk::Queue,
}

/// Queues serving each [`CommandBufferKind`]. Kinds without a dedicated queue are
/// submitted on the graphics queue.
#[derive(Debug, Clone, Copy)]
pub struct Queues {
    pub graphics: QueueInfo,
    pub compute: Option<QueueInfo>,
    pub ray_tracing: Option<QueueInfo>,
}

struct QueueSlot {
    info: QueueInfo,
    /// Guards both the queue and the pool, which Vulkan requires to be externally
    /// synchronized.
    pool: Mutex<vk::CommandPool>,
}

#[derive(Default)]
struct DescriptorPools {
    pools: Vec<vk::DescriptorPool>,
    owners: HashMap<vk::DescriptorSet, vk::DescriptorPool>,
}

pub struct VulkanBackend {
    device: ash::Device,
    allocator: vk_mem::Allocator,
    acceleration_structure: Option<khr::acceleration_structure::Device>,
    debug_utils: Option<ext::debug_utils::Device>,
    limits: DeviceLimits,
    queues: [QueueSlot; 3],
    descriptor_pools: Mutex<DescriptorPools>,
    allocations: Mutex<HashMap<vk::Buffer, vk_mem::Allocation>>,
}

// SAFETY: every handle that Vulkan requires to be externally synchronized is
// guarded by a mutex. Allocations are only touched while holding `allocations`.
unsafe impl Send for VulkanBackend {}
unsafe impl Sync for VulkanBackend {}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl VulkanBackend {
    /// Wraps `device`. Set `ray_tracing` when `VK_KHR_acceleration_structure` was
    /// enabled on it.
    pub fn new(
        instance: &ash::Instance,
        device: ash::Device,
        physical_device: vk::PhysicalDevice,
        queues: Queues,
        ray_tracing: bool,
    ) -> VkResult<Self> {
        let mut allocator_info = vk_mem::AllocatorCreateInfo::new(instance, &device, physical_device);
        if ray_tracing {
            allocator_info.flags |= vk_mem::AllocatorCreateFlags::BUFFER_DEVICE_ADDRESS;
        }
        let allocator = unsafe { vk_mem::Allocator::new(allocator_info)? };

        let limits = Self::query_limits(instance, physical_device, ray_tracing);
        let acceleration_structure =
            ray_tracing.then(|| khr::acceleration_structure::Device::new(instance, &device));

        let slot = |info: QueueInfo| -> VkResult<QueueSlot> {
            let pool = unsafe {
                device.create_command_pool(
                    &vk::CommandPoolCreateInfo::default()
                        .queue_family_index(info.family)
                        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER),
                    None,
                )?
            };
            Ok(QueueSlot {
                info,
                pool: Mutex::new(pool),
            })
        };
        let queues = [
            slot(queues.graphics)?,
            slot(queues.compute.unwrap_or(queues.graphics))?,
            slot(queues.ray_tracing.or(queues.compute).unwrap_or(queues.graphics))?,
        ];

        tracing::info!(
            ray_tracing,
            max_samples = ?limits.max_samples,
            "Vulkan backend initialized"
        );
        Ok(Self {
            device,
            allocator,
            acceleration_structure,
            debug_utils: None,
            limits,
            queues,
            descriptor_pools: Mutex::default(),
            allocations: Mutex::default(),
        })
    }

    fn query_limits(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        ray_tracing: bool,
    ) -> DeviceLimits {
        let mut acceleration_structure =
            vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut properties = vk::PhysicalDeviceProperties2::default();
        if ray_tracing {
            properties = properties.push_next(&mut acceleration_structure);
        }
        unsafe { instance.get_physical_device_properties2(physical_device, &mut properties) };
        let limits = properties.properties.limits;

        let sample_counts =
            limits.framebuffer_color_sample_counts & limits.framebuffer_depth_sample_counts;
        let max_samples = [
            vk::SampleCountFlags::TYPE_64,
            vk::SampleCountFlags::TYPE_32,
            vk::SampleCountFlags::TYPE_16,
            vk::SampleCountFlags::TYPE_8,
            vk::SampleCountFlags::TYPE_4,
            vk::SampleCountFlags::TYPE_2,
        ]
        .into_iter()
        .find(|&count| sample_counts.contains(count))
        .unwrap_or(vk::SampleCountFlags::TYPE_1);

        let defaults = DeviceLimits::default();
        DeviceLimits {
            max_samples,
            max_texture_units: limits.max_per_stage_descriptor_samplers,
            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
            max_anisotropy: limits.max_sampler_anisotropy,
            min_acceleration_structure_scratch_offset_alignment: if ray_tracing {
                acceleration_structure.min_acceleration_structure_scratch_offset_alignment
                    as vk::DeviceSize
            } else {
                defaults.min_acceleration_structure_scratch_offset_alignment
            },
        }
    }

    /// Forwards object names to `VK_EXT_debug_utils`, which must be enabled on
    /// `instance`.
    pub fn with_debug_utils(mut self, instance: &ash::Instance) -> Self {
        self.debug_utils = Some(ext::debug_utils::Device::new(instance, &self.device));
        self
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    fn queue(&self, kind: CommandBufferKind) -> &QueueSlot {
        match kind {
            CommandBufferKind::Graphics => &self.queues[0],
            CommandBufferKind::Compute => &self.queues[1],
            CommandBufferKind::RayTracing => &self.queues[2],
        }
    }

    fn create_descriptor_pool(&self) -> VkResult<vk::DescriptorPool> {
        let mut sizes: SmallVec<[vk::DescriptorPoolSize; 6]> = [
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::DescriptorType::STORAGE_IMAGE,
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            vk::DescriptorType::STORAGE_BUFFER,
        ]
        .into_iter()
        .map(|ty| vk::DescriptorPoolSize {
            ty,
            descriptor_count: DESCRIPTOR_POOL_MAX_SETS * 4,
        })
        .collect();
        if self.acceleration_structure.is_some() {
            sizes.push(vk::DescriptorPoolSize {
                ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                descriptor_count: DESCRIPTOR_POOL_MAX_SETS,
            });
        }
        unsafe {
            self.device.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::default()
                    .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
                    .max_sets(DESCRIPTOR_POOL_MAX_SETS)
                    .pool_sizes(&sizes),
                None,
            )
        }
    }

    fn acceleration_structure_ext(&self) -> VkResult<&khr::acceleration_structure::Device> {
        self.acceleration_structure.as_ref().ok_or_else(|| {
            tracing::error!("Acceleration structures used without VK_KHR_acceleration_structure");
            vk::Result::ERROR_EXTENSION_NOT_PRESENT
        })
    }

    fn create_graphics_pipeline(
        &self,
        desc: &PipelineDescription,
        render_pass: vk::RenderPass,
    ) -> VkResult<vk::Pipeline> {
        let shader = &desc.shader;
        let stages: SmallVec<[vk::PipelineShaderStageCreateInfo; 4]> = shader
            .stages()
            .iter()
            .map(|stage| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage.stage)
                    .module(stage.module)
                    .name(&stage.entry_point)
            })
            .collect();

        let vertex_bindings;
        let mut vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
        if let Some(input) = shader.vertex_input() {
            vertex_bindings = [vk::VertexInputBindingDescription {
                binding: 0,
                stride: input.stride,
                input_rate: vk::VertexInputRate::VERTEX,
            }];
            vertex_input = vertex_input
                .vertex_binding_descriptions(&vertex_bindings)
                .vertex_attribute_descriptions(&input.attributes);
        }

        let input_assembly =
            vk::PipelineInputAssemblyStateCreateInfo::default().topology(desc.draw_type.as_raw());
        let viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(desc.polygon_mode.as_raw())
            .cull_mode(desc.cull_mode.as_raw())
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(desc.depth_bias)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let stencil = desc.stencil.unwrap_or_default().as_raw();
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(desc.depth_test)
            .depth_write_enable(desc.depth_write)
            .depth_compare_op(desc.depth_compare_op)
            .stencil_test_enable(desc.stencil.is_some())
            .front(stencil)
            .back(stencil);

        let color_count = desc.color_targets.len() + usize::from(desc.swapchain_target);
        let blend_attachments: SmallVec<[vk::PipelineColorBlendAttachmentState; 4]> = (0
            ..color_count)
            .map(|_| vk::PipelineColorBlendAttachmentState {
                blend_enable: desc.transparency.into(),
                src_color_blend_factor: desc.blend_src,
                dst_color_blend_factor: desc.blend_dst,
                color_blend_op: vk::BlendOp::ADD,
                src_alpha_blend_factor: desc.blend_src,
                dst_alpha_blend_factor: desc.blend_dst,
                alpha_blend_op: vk::BlendOp::ADD,
                color_write_mask: vk::ColorComponentFlags::RGBA,
            })
            .collect();
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(shader.pipeline_layout())
            .render_pass(render_pass)
            .subpass(0);
        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
                .map_err(|(_, err)| err)?
        };
        pipelines
            .into_iter()
            .next()
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)
    }

    fn create_compute_pipeline(&self, desc: &PipelineDescription) -> VkResult<vk::Pipeline> {
        let Some(stage) = desc.shader.stages().first() else {
            tracing::error!(shader = desc.shader.name(), "Compute shader has no stage");
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        };
        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage.stage)
                    .module(stage.module)
                    .name(&stage.entry_point),
            )
            .layout(desc.shader.pipeline_layout());
        let pipelines = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
                .map_err(|(_, err)| err)?
        };
        pipelines
            .into_iter()
            .next()
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)
    }
}

impl Backend for VulkanBackend {
    fn name(&self) -> &'static str {
        "vulkan"
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn wait_idle(&self) -> VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }

    fn set_object_name(&self, object_type: vk::ObjectType, handle: u64, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            tracing::warn!(name, "Object name contains a nul byte");
            return;
        };
        let info = vk::DebugUtilsObjectNameInfoEXT {
            object_type,
            object_handle: handle,
            ..Default::default()
        }
        .object_name(&name);
        if let Err(err) = unsafe { debug_utils.set_debug_utils_object_name(&info) } {
            tracing::warn!(%err, ?object_type, "Failed to name object");
        }
    }

    fn create_render_pass(&self, desc: &RenderPassDescription) -> VkResult<vk::RenderPass> {
        let load_op = if desc.clear {
            vk::AttachmentLoadOp::CLEAR
        } else {
            vk::AttachmentLoadOp::LOAD
        };
        let attachments: SmallVec<[vk::AttachmentDescription; 4]> = desc
            .attachments
            .iter()
            .enumerate()
            .map(|(i, texture)| {
                let (working, final_layout) = desc.attachment_layouts(i);
                vk::AttachmentDescription {
                    format: texture.format(),
                    samples: vk::SampleCountFlags::TYPE_1,
                    load_op,
                    store_op: vk::AttachmentStoreOp::STORE,
                    stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                    stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                    // Attachments are transitioned to their working layout before the
                    // pass begins. Cleared contents need not be preserved.
                    initial_layout: if desc.clear {
                        vk::ImageLayout::UNDEFINED
                    } else {
                        working
                    },
                    final_layout,
                    ..Default::default()
                }
            })
            .collect();

        let mut color_refs: SmallVec<[vk::AttachmentReference; 4]> = SmallVec::new();
        let mut depth_ref = None;
        for (i, texture) in desc.attachments.iter().enumerate() {
            let reference = vk::AttachmentReference {
                attachment: i as u32,
                layout: desc.attachment_layouts(i).0,
            };
            if texture.kind().is_depth() {
                depth_ref = Some(reference);
            } else {
                color_refs.push(reference);
            }
        }
        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if let Some(depth_ref) = &depth_ref {
            subpass = subpass.depth_stencil_attachment(depth_ref);
        }
        unsafe {
            self.device.create_render_pass(
                &vk::RenderPassCreateInfo::default()
                    .attachments(&attachments)
                    .subpasses(std::slice::from_ref(&subpass)),
                None,
            )
        }
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(render_pass, None) }
    }

    fn create_frame_buffer(&self, desc: &FrameBufferDescription) -> VkResult<vk::Framebuffer> {
        let views: SmallVec<[vk::ImageView; 4]> = desc
            .attachments
            .iter()
            .map(|texture| {
                if texture.kind() == TextureKind::DepthArray {
                    texture.layer_view(desc.layer)
                } else {
                    texture.image_view()
                }
            })
            .collect();
        unsafe {
            self.device.create_framebuffer(
                &vk::FramebufferCreateInfo::default()
                    .render_pass(desc.render_pass.vk_handle())
                    .attachments(&views)
                    .width(desc.width)
                    .height(desc.height)
                    .layers(1),
                None,
            )
        }
    }

    fn destroy_frame_buffer(&self, frame_buffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(frame_buffer, None) }
    }

    fn create_pipeline(
        &self,
        desc: &PipelineDescription,
        render_pass: Option<vk::RenderPass>,
    ) -> VkResult<vk::Pipeline> {
        match (desc.shader.kind(), render_pass) {
            (ShaderKind::Graphics, Some(render_pass)) => {
                self.create_graphics_pipeline(desc, render_pass)
            }
            (ShaderKind::Compute, _) => self.create_compute_pipeline(desc),
            (ShaderKind::Graphics, None) => {
                tracing::error!(shader = desc.shader.name(), "Graphics pipeline without a render pass");
                Err(vk::Result::ERROR_INITIALIZATION_FAILED)
            }
            (ShaderKind::RayTracing, _) => {
                tracing::error!(
                    shader = desc.shader.name(),
                    "Ray tracing pipelines are built by the renderer"
                );
                Err(vk::Result::ERROR_FEATURE_NOT_PRESENT)
            }
        }
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) }
    }

    fn create_sampler(&self, desc: &SamplerDescription) -> VkResult<vk::Sampler> {
        let info = desc.create_info(self.limits.max_anisotropy);
        unsafe { self.device.create_sampler(&info, None) }
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) }
    }

    fn allocate_command_buffer(
        &self,
        kind: CommandBufferKind,
        level: vk::CommandBufferLevel,
    ) -> VkResult<vk::CommandBuffer> {
        let pool = lock(&self.queue(kind).pool);
        let buffers = unsafe {
            self.device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::default()
                    .command_pool(*pool)
                    .level(level)
                    .command_buffer_count(1),
            )?
        };
        buffers
            .into_iter()
            .next()
            .ok_or(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
    }

    fn free_command_buffer(&self, kind: CommandBufferKind, command_buffer: vk::CommandBuffer) {
        let pool = lock(&self.queue(kind).pool);
        unsafe { self.device.free_command_buffers(*pool, &[command_buffer]) }
    }

    fn create_fence(&self) -> VkResult<vk::Fence> {
        unsafe { self.device.create_fence(&vk::FenceCreateInfo::default(), None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        inheritance: Option<Inheritance>,
    ) -> VkResult<()> {
        let mut flags = vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT;
        // Ignored for primaries, required for every secondary.
        let mut inheritance_info = vk::CommandBufferInheritanceInfo::default();
        if let Some(inheritance) = inheritance {
            flags |= vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE;
            inheritance_info = inheritance_info
                .render_pass(inheritance.render_pass)
                .subpass(0)
                .framebuffer(inheritance.frame_buffer);
        }
        unsafe {
            self.device.begin_command_buffer(
                command_buffer,
                &vk::CommandBufferBeginInfo::default()
                    .flags(flags)
                    .inheritance_info(&inheritance_info),
            )
        }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device.end_command_buffer(command_buffer) }
    }

    fn queue_submit(
        &self,
        kind: CommandBufferKind,
        command_buffer: vk::CommandBuffer,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let slot = self.queue(kind);
        let _pool = lock(&slot.pool);
        unsafe {
            self.device.queue_submit2(
                slot.info.queue,
                &[vk::SubmitInfo2::default().command_buffer_infos(&[
                    vk::CommandBufferSubmitInfo {
                        command_buffer,
                        ..Default::default()
                    },
                ])],
                fence,
            )
        }
    }

    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        dependency_info: &vk::DependencyInfo<'_>,
    ) {
        unsafe {
            self.device
                .cmd_pipeline_barrier2(command_buffer, dependency_info)
        }
    }

    fn cmd_begin_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::RenderPassBeginInfo<'_>,
        contents: vk::SubpassContents,
    ) {
        unsafe {
            self.device
                .cmd_begin_render_pass(command_buffer, begin_info, contents)
        }
    }

    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_render_pass(command_buffer) }
    }

    fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        unsafe {
            self.device
                .cmd_bind_pipeline(command_buffer, bind_point, pipeline)
        }
    }

    fn cmd_execute_commands(
        &self,
        command_buffer: vk::CommandBuffer,
        secondaries: &[vk::CommandBuffer],
    ) {
        unsafe {
            self.device
                .cmd_execute_commands(command_buffer, secondaries)
        }
    }

    fn cmd_build_acceleration_structures(
        &self,
        command_buffer: vk::CommandBuffer,
        infos: &[vk::AccelerationStructureBuildGeometryInfoKHR<'_>],
        build_range_infos: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    ) {
        let Ok(ext) = self.acceleration_structure_ext() else {
            return;
        };
        unsafe { ext.cmd_build_acceleration_structures(command_buffer, infos, build_range_infos) }
    }

    fn allocate_descriptor_sets(
        &self,
        layout: vk::DescriptorSetLayout,
        count: usize,
    ) -> VkResult<Vec<vk::DescriptorSet>> {
        let layouts = vec![layout; count];
        let mut pools = lock(&self.descriptor_pools);
        let attempt = |pool: vk::DescriptorPool| unsafe {
            self.device.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::default()
                    .descriptor_pool(pool)
                    .set_layouts(&layouts),
            )
        };
        let result = match pools.pools.last() {
            Some(&pool) => attempt(pool).map(|sets| (pool, sets)),
            None => Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY),
        };
        let (pool, sets) = match result {
            Ok(allocated) => allocated,
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {
                let pool = self.create_descriptor_pool()?;
                pools.pools.push(pool);
                tracing::debug!(pools = pools.pools.len(), "Descriptor pool added");
                (pool, attempt(pool)?)
            }
            Err(err) => return Err(err),
        };
        pools.owners.extend(sets.iter().map(|&set| (set, pool)));
        Ok(sets)
    }

    fn free_descriptor_sets(&self, sets: &[vk::DescriptorSet]) {
        let mut pools = lock(&self.descriptor_pools);
        for set in sets {
            let Some(pool) = pools.owners.remove(set) else {
                tracing::warn!(?set, "Freeing a descriptor set this backend did not allocate");
                continue;
            };
            if let Err(err) = unsafe { self.device.free_descriptor_sets(pool, &[*set]) } {
                tracing::error!(%err, "Failed to free descriptor set");
            }
        }
    }

    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) -> VkResult<()> {
        unsafe { self.device.update_descriptor_sets(writes, &[]) };
        Ok(())
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        host_visible: bool,
    ) -> VkResult<RawBuffer> {
        let allocation_info = if host_visible {
            vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferHost,
                flags: vk_mem::AllocationCreateFlags::MAPPED
                    | vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                required_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
                ..Default::default()
            }
        } else {
            vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferDevice,
                flags: vk_mem::AllocationCreateFlags::empty(),
                ..Default::default()
            }
        };
        let (buffer, allocation) = unsafe {
            self.allocator.create_buffer_with_alignment(
                &vk::BufferCreateInfo {
                    size,
                    usage,
                    ..Default::default()
                },
                &allocation_info,
                alignment,
            )?
        };
        let device_address = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            unsafe {
                self.device
                    .get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer))
            }
        } else {
            0
        };
        lock(&self.allocations).insert(buffer, allocation);
        Ok(RawBuffer {
            buffer,
            device_address,
        })
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let Some(mut allocation) = lock(&self.allocations).remove(&buffer) else {
            tracing::warn!(?buffer, "Destroying a buffer this backend did not allocate");
            return;
        };
        unsafe { self.allocator.destroy_buffer(buffer, &mut allocation) }
    }

    fn write_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> VkResult<()> {
        let allocations = lock(&self.allocations);
        let allocation = allocations
            .get(&buffer)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        let info = unsafe { self.allocator.get_allocation_info(allocation) };
        if info.mapped_data.is_null() {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        if offset + data.len() as vk::DeviceSize > info.size {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        // SAFETY: the allocation is persistently mapped, coherent and large enough.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                (info.mapped_data as *mut u8).add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }

    fn create_acceleration_structure(
        &self,
        ty: vk::AccelerationStructureTypeKHR,
        size: vk::DeviceSize,
    ) -> VkResult<RawAccelerationStructure> {
        let ext = self.acceleration_structure_ext()?;
        let backing = self.create_buffer(
            size,
            256,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            false,
        )?;
        let raw = unsafe {
            ext.create_acceleration_structure(
                &vk::AccelerationStructureCreateInfoKHR::default()
                    .buffer(backing.buffer)
                    .size(size)
                    .ty(ty),
                None,
            )
        };
        let raw = match raw {
            Ok(raw) => raw,
            Err(err) => {
                self.destroy_buffer(backing.buffer);
                return Err(err);
            }
        };
        let device_address = unsafe {
            ext.get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR::default()
                    .acceleration_structure(raw),
            )
        };
        Ok(RawAccelerationStructure {
            raw,
            buffer: backing.buffer,
            device_address,
        })
    }

    fn destroy_acceleration_structure(&self, accel_struct: &RawAccelerationStructure) {
        if let Ok(ext) = self.acceleration_structure_ext() {
            unsafe { ext.destroy_acceleration_structure(accel_struct.raw, None) }
        }
        self.destroy_buffer(accel_struct.buffer);
    }

    fn acceleration_structure_build_sizes(
        &self,
        info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        max_primitive_counts: &[u32],
    ) -> vk::AccelerationStructureBuildSizesInfoKHR<'static> {
        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        if let Ok(ext) = self.acceleration_structure_ext() {
            unsafe {
                ext.get_acceleration_structure_build_sizes(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    info,
                    max_primitive_counts,
                    &mut sizes,
                )
            }
        }
        sizes
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            if let Err(err) = self.device.device_wait_idle() {
                tracing::error!(%err, "Failed to wait for the device before teardown");
            }
            let pools = std::mem::take(&mut *lock(&self.descriptor_pools));
            for pool in pools.pools {
                self.device.destroy_descriptor_pool(pool, None);
            }
            for slot in &self.queues {
                self.device.destroy_command_pool(*lock(&slot.pool), None);
            }
            let allocations = std::mem::take(&mut *lock(&self.allocations));
            if !allocations.is_empty() {
                tracing::warn!(count = allocations.len(), "Buffers still alive at teardown");
            }
            for (buffer, mut allocation) in allocations {
                self.allocator.destroy_buffer(buffer, &mut allocation);
            }
        }
    }
}
