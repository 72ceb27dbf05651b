//! Per-frame descriptor sets.
//!
//! A [`BindingSet`] owns one descriptor set per frame in flight, allocated from a
//! [`BindingSchema`]. Resources are assigned by name and only reach the GPU on
//! [`update`](BindingSet::update), which brings the copy of one frame slot up to
//! date right before it is bound. The copies of other slots may still be read by
//! frames executing on the GPU and are left alone.
//!
//! Two kinds of staleness are tracked separately:
//! - Uniform contents. Every uniform block keeps a CPU mirror. Writing to it marks
//!   the block for upload in every slot.
//! - Descriptor contents. Assigning a different resource marks the descriptor set
//!   of every slot for rewriting.
//!
//! ```
//! # use ash::vk;
//! # use scoria::{Device, backend::headless::HeadlessBackend};
//! # use scoria::command::{CommandBuffer, CommandBufferKind};
//! # use scoria::descriptor::BindingSet;
//! # use scoria::shader::{BindingSchema, DescriptorKind, DescriptorSchema, UniformMember};
//! let device = Device::new(HeadlessBackend::new());
//! let schema = BindingSchema {
//!     set: 0,
//!     layout: vk::DescriptorSetLayout::null(),
//!     descriptors: vec![
//!         DescriptorSchema::new("Light", 0, DescriptorKind::UniformBuffer).with_block(
//!             16,
//!             vec![UniformMember { name: "intensity".into(), offset: 0, size: 4 }],
//!         ),
//!     ],
//! };
//! let mut set = BindingSet::new(device.clone(), &schema, 2).unwrap();
//! set.set_uniform("Light", "intensity", &4.0f32);
//!
//! let mut cmd = CommandBuffer::new_primary(device, CommandBufferKind::Graphics, u64::MAX).unwrap();
//! cmd.begin_recording().unwrap();
//! set.update(&mut cmd, 0).unwrap();
//! assert!(!set.has_pending_uniform("Light", 0));
//! assert!(set.has_pending_uniform("Light", 1));
//! ```

use std::{fmt::Debug, ops::Range, sync::Arc};

use ash::vk;
use bitvec::vec::BitVec;
use smallvec::SmallVec;

use crate::{
    Device, HasDevice,
    buffer::Buffer,
    command::CommandBuffer,
    error::Result,
    rtx::AccelerationStructure,
    shader::{BindingSchema, DescriptorKind, DescriptorSchema},
    texture::{TextureKind, TextureRef},
    tracking::Access,
    utils::AsVkHandle,
};

struct UniformBlock {
    /// CPU mirror of the block.
    data: Vec<u8>,
    /// One per frame slot. Empty for dynamic blocks until a buffer is assigned.
    buffers: SmallVec<[Option<Arc<Buffer>>; 3]>,
    has_updated: BitVec,
    dynamic_offset: u32,
}

enum Resource {
    Textures {
        textures: Vec<TextureRef>,
        mip_level: Option<u32>,
    },
    Uniform(UniformBlock),
    StorageBuffers(Vec<Arc<Buffer>>),
    AccelerationStructures(Vec<Arc<AccelerationStructure>>),
}

struct Binding {
    schema: DescriptorSchema,
    resource: Resource,
}

/// Layout and access a texture is transitioned to before a shader reads it.
fn texture_target(
    texture: TextureKind,
    descriptor: DescriptorKind,
    mip_level: Option<u32>,
) -> (vk::ImageLayout, Access) {
    match (texture, descriptor) {
        (TextureKind::Depth | TextureKind::DepthArray, _) => (
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            Access::DEPTH_READ,
        ),
        (_, DescriptorKind::StorageImage) => {
            (vk::ImageLayout::GENERAL, Access::SHADER_READ_WRITE)
        }
        (TextureKind::Color3D, _) => (vk::ImageLayout::GENERAL, Access::SHADER_READ),
        (TextureKind::Cube, _) => (
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Access::SHADER_READ,
        ),
        (TextureKind::Color, _) if mip_level.is_some() => {
            (vk::ImageLayout::GENERAL, Access::SHADER_READ)
        }
        (TextureKind::Color, _) => (
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Access::SHADER_READ,
        ),
    }
}

fn same_resources<T: ?Sized>(a: &[Arc<T>], b: &[Arc<T>]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(a, b)| Arc::ptr_eq(a, b))
}

fn find_binding<'a>(
    set_name: &str,
    bindings: &'a mut [Binding],
    name: &str,
) -> Option<&'a mut Binding> {
    let found = bindings.iter_mut().find(|b| b.schema.name == name);
    if found.is_none() {
        tracing::warn!(set = set_name, member = name, "Unknown binding");
    }
    found
}

/// Descriptor writes of one slot, referencing infos stored alongside.
enum WriteSource {
    Images(Range<usize>),
    Buffers(Range<usize>),
    AccelerationStructures(Range<usize>),
}

/// Descriptor sets of every frame slot. Command buffers that bind them hold a
/// clone until they complete, so the sets outlive the [`BindingSet`] if needed.
struct DescriptorSets {
    device: Device,
    sets: SmallVec<[vk::DescriptorSet; 3]>,
}

impl Drop for DescriptorSets {
    fn drop(&mut self) {
        self.device.free_descriptor_sets(&self.sets);
    }
}

/// One descriptor set per frame in flight, kept in sync with the resources
/// assigned to it.
pub struct BindingSet {
    device: Device,
    name: String,
    set: u32,
    sets: Arc<DescriptorSets>,
    /// Sorted by binding number.
    bindings: Vec<Binding>,
    descriptor_dirty: BitVec,
}

impl BindingSet {
    pub fn new(device: Device, schema: &BindingSchema, frames_in_flight: usize) -> Result<Self> {
        let frames = frames_in_flight.max(1);
        let alignment = device.limits().min_uniform_buffer_offset_alignment;

        let mut bindings = Vec::with_capacity(schema.descriptors.len());
        for descriptor in &schema.descriptors {
            let resource = match descriptor.kind {
                DescriptorKind::SampledImage | DescriptorKind::StorageImage => Resource::Textures {
                    textures: Vec::new(),
                    mip_level: None,
                },
                DescriptorKind::UniformBuffer => {
                    let buffers = (0..frames)
                        .map(|_| {
                            Buffer::new_host(
                                device.clone(),
                                (descriptor.size as vk::DeviceSize).max(1),
                                alignment,
                                vk::BufferUsageFlags::UNIFORM_BUFFER,
                            )
                            .map(|buffer| Some(Arc::new(buffer)))
                        })
                        .collect::<Result<_>>()?;
                    Resource::Uniform(UniformBlock {
                        data: vec![0; descriptor.size as usize],
                        buffers,
                        has_updated: BitVec::repeat(false, frames),
                        dynamic_offset: 0,
                    })
                }
                DescriptorKind::DynamicUniformBuffer => Resource::Uniform(UniformBlock {
                    data: vec![0; descriptor.size as usize],
                    buffers: SmallVec::from_elem(None, frames),
                    has_updated: BitVec::repeat(false, frames),
                    dynamic_offset: 0,
                }),
                DescriptorKind::StorageBuffer => Resource::StorageBuffers(Vec::new()),
                DescriptorKind::AccelerationStructure => {
                    Resource::AccelerationStructures(Vec::new())
                }
            };
            bindings.push(Binding {
                schema: descriptor.clone(),
                resource,
            });
        }
        bindings.sort_by_key(|b| b.schema.binding);

        let sets = Arc::new(DescriptorSets {
            device: device.clone(),
            sets: device
                .allocate_descriptor_sets(schema.layout, frames)?
                .into_iter()
                .collect(),
        });
        Ok(Self {
            device,
            name: format!("set{}", schema.set),
            set: schema.set,
            sets,
            bindings,
            descriptor_dirty: BitVec::repeat(true, frames),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets the debug name. Each slot's descriptor set is named `name[frame]`.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        for (frame, set) in self.sets.sets.iter().enumerate() {
            self.device
                .name_object(*set, &format!("{}[{frame}]", self.name));
        }
    }

    /// Index of this set in the pipeline layout.
    pub fn set_index(&self) -> u32 {
        self.set
    }

    pub fn frames_in_flight(&self) -> usize {
        self.sets.sets.len()
    }

    pub fn descriptor_set(&self, frame: usize) -> vk::DescriptorSet {
        self.sets.sets[frame]
    }

    /// Whether the descriptor set of `frame` will be rewritten on the next update.
    pub fn is_dirty(&self, frame: usize) -> bool {
        self.descriptor_dirty[frame]
    }

    /// Whether the mirror of `block` still has to be uploaded for `frame`.
    pub fn has_pending_uniform(&self, block: &str, frame: usize) -> bool {
        self.bindings.iter().any(|b| match &b.resource {
            Resource::Uniform(uniform) if b.schema.name == block => uniform.has_updated[frame],
            _ => false,
        })
    }

    pub fn set_texture(&mut self, name: &str, texture: &TextureRef) {
        self.set_textures(name, std::slice::from_ref(texture), None, false);
    }

    /// Assigns an array of textures, optionally restricted to a single mip level.
    ///
    /// The descriptor is rewritten when the textures or the mip level differ from
    /// the assigned ones, when a texture was written since it was last assigned, or
    /// when `force_refresh` is set.
    pub fn set_textures(
        &mut self,
        name: &str,
        textures: &[TextureRef],
        mip_level: Option<u32>,
        force_refresh: bool,
    ) {
        let Some(binding) = find_binding(&self.name, &mut self.bindings, name) else {
            return;
        };
        let Resource::Textures {
            textures: bound,
            mip_level: bound_mip_level,
        } = &mut binding.resource
        else {
            tracing::warn!(set = %self.name, member = name, kind = ?binding.schema.kind, "Binding is not a texture");
            return;
        };
        let capacity = binding.schema.count as usize;
        if textures.len() > capacity {
            tracing::warn!(
                set = %self.name,
                member = name,
                count = textures.len(),
                capacity,
                "Too many textures, extra ones are ignored"
            );
        }
        let textures = &textures[..textures.len().min(capacity)];

        let mut dirty = force_refresh
            || *bound_mip_level != mip_level
            || !same_resources(bound, textures);
        for texture in textures {
            if texture.is_updated() {
                texture.set_updated(false);
                dirty = true;
            }
        }
        if dirty {
            *bound = textures.to_vec();
            *bound_mip_level = mip_level;
            self.descriptor_dirty.fill(true);
        }
    }

    /// Copies `value` into `member` of the uniform block `block`.
    pub fn set_uniform<T: bytemuck::NoUninit>(&mut self, block: &str, member: &str, value: &T) {
        let bytes = bytemuck::bytes_of(value);
        self.set_uniform_bytes(block, member, bytes, bytes.len());
    }

    /// Copies the first `size` bytes of `data` into `member`. Writes are clamped
    /// to the member size.
    pub fn set_uniform_bytes(&mut self, block: &str, member: &str, data: &[u8], size: usize) {
        let Some(binding) = find_binding(&self.name, &mut self.bindings, block) else {
            return;
        };
        let Resource::Uniform(uniform) = &mut binding.resource else {
            tracing::warn!(set = %self.name, member = block, "Binding is not a uniform block");
            return;
        };
        let Some(target) = binding.schema.member(member) else {
            tracing::warn!(set = %self.name, block, member, "Unknown uniform member");
            return;
        };
        let len = size.min(data.len());
        if len > target.size as usize {
            tracing::warn!(
                set = %self.name,
                block,
                member,
                len,
                member_size = target.size,
                "Uniform write truncated"
            );
        }
        let len = len.min(target.size as usize);
        let start = target.offset as usize;
        let Some(dst) = uniform.data.get_mut(start..start + len) else {
            tracing::warn!(set = %self.name, block, member, "Uniform member lies outside its block");
            return;
        };
        dst.copy_from_slice(&data[..len]);
        uniform.has_updated.fill(true);
    }

    /// Replaces the contents of the whole uniform block.
    pub fn set_uniform_block(&mut self, block: &str, data: &[u8]) {
        let Some(binding) = find_binding(&self.name, &mut self.bindings, block) else {
            return;
        };
        let Resource::Uniform(uniform) = &mut binding.resource else {
            tracing::warn!(set = %self.name, member = block, "Binding is not a uniform block");
            return;
        };
        if data.len() != uniform.data.len() {
            tracing::warn!(
                set = %self.name,
                block,
                len = data.len(),
                block_size = uniform.data.len(),
                "Uniform block size mismatch"
            );
        }
        let len = data.len().min(uniform.data.len());
        uniform.data[..len].copy_from_slice(&data[..len]);
        uniform.has_updated.fill(true);
    }

    /// Backs `name` with `buffer` in every frame slot.
    ///
    /// This is how dynamic uniform blocks get their buffer. For storage buffer
    /// bindings it is the same as [`set_storage_buffers`](Self::set_storage_buffers)
    /// with a single buffer.
    pub fn set_buffer(&mut self, name: &str, buffer: Arc<Buffer>) {
        if self
            .bindings
            .iter()
            .any(|b| b.schema.name == name && matches!(b.resource, Resource::StorageBuffers(_)))
        {
            self.set_storage_buffers(name, vec![buffer]);
            return;
        }
        let Some(binding) = find_binding(&self.name, &mut self.bindings, name) else {
            return;
        };
        let Resource::Uniform(uniform) = &mut binding.resource else {
            tracing::warn!(set = %self.name, member = name, kind = ?binding.schema.kind, "Binding is not a buffer");
            return;
        };
        if (buffer.size() as usize) < uniform.data.len() {
            tracing::warn!(
                set = %self.name,
                member = name,
                size = buffer.size(),
                block_size = uniform.data.len(),
                "Buffer is smaller than the uniform block"
            );
        }
        if uniform
            .buffers
            .iter()
            .all(|b| b.as_ref().is_some_and(|b| Arc::ptr_eq(b, &buffer)))
        {
            return;
        }
        uniform.buffers.fill(Some(buffer));
        uniform.has_updated.fill(true);
        self.descriptor_dirty.fill(true);
    }

    pub fn set_storage_buffer(&mut self, name: &str, buffer: Arc<Buffer>) {
        self.set_storage_buffers(name, vec![buffer]);
    }

    pub fn set_storage_buffers(&mut self, name: &str, buffers: Vec<Arc<Buffer>>) {
        let Some(binding) = find_binding(&self.name, &mut self.bindings, name) else {
            return;
        };
        let Resource::StorageBuffers(bound) = &mut binding.resource else {
            tracing::warn!(set = %self.name, member = name, "Binding is not a storage buffer");
            return;
        };
        if !same_resources(bound, &buffers) {
            *bound = buffers;
            self.descriptor_dirty.fill(true);
        }
    }

    pub fn set_acceleration_structure(&mut self, name: &str, structure: Arc<AccelerationStructure>) {
        self.set_acceleration_structures(name, vec![structure]);
    }

    pub fn set_acceleration_structures(
        &mut self,
        name: &str,
        structures: Vec<Arc<AccelerationStructure>>,
    ) {
        let Some(binding) = find_binding(&self.name, &mut self.bindings, name) else {
            return;
        };
        let Resource::AccelerationStructures(bound) = &mut binding.resource else {
            tracing::warn!(set = %self.name, member = name, "Binding is not an acceleration structure");
            return;
        };
        if !same_resources(bound, &structures) {
            *bound = structures;
            self.descriptor_dirty.fill(true);
        }
    }

    pub fn is_dynamic(&self, name: &str) -> bool {
        self.bindings
            .iter()
            .any(|b| b.schema.name == name && b.schema.kind == DescriptorKind::DynamicUniformBuffer)
    }

    /// Offset into the buffer of a dynamic uniform block, `None` for other bindings.
    pub fn dynamic_offset(&self, name: &str) -> Option<u32> {
        self.bindings.iter().find_map(|b| match &b.resource {
            Resource::Uniform(uniform)
                if b.schema.name == name
                    && b.schema.kind == DescriptorKind::DynamicUniformBuffer =>
            {
                Some(uniform.dynamic_offset)
            }
            _ => None,
        })
    }

    pub fn set_dynamic_offset(&mut self, name: &str, offset: u32) {
        let alignment = self.device.limits().min_uniform_buffer_offset_alignment;
        let Some(binding) = find_binding(&self.name, &mut self.bindings, name) else {
            return;
        };
        match &mut binding.resource {
            Resource::Uniform(uniform)
                if binding.schema.kind == DescriptorKind::DynamicUniformBuffer =>
            {
                if offset as vk::DeviceSize % alignment != 0 {
                    tracing::warn!(set = %self.name, member = name, offset, alignment, "Unaligned dynamic offset");
                }
                uniform.dynamic_offset = offset;
            }
            _ => {
                tracing::warn!(set = %self.name, member = name, "Binding is not a dynamic uniform block");
            }
        }
    }

    /// Offsets of every dynamic uniform block in binding order, as expected when
    /// binding the set.
    pub fn dynamic_offsets(&self) -> SmallVec<[u32; 4]> {
        self.bindings
            .iter()
            .filter(|b| b.schema.kind == DescriptorKind::DynamicUniformBuffer)
            .filter_map(|b| match &b.resource {
                Resource::Uniform(uniform) => Some(uniform.dynamic_offset),
                _ => None,
            })
            .collect()
    }

    /// GPU buffer backing the uniform block `name` in `frame`.
    pub fn uniform_buffer(&self, name: &str, frame: usize) -> Option<&Arc<Buffer>> {
        self.bindings.iter().find_map(|b| match &b.resource {
            Resource::Uniform(uniform) if b.schema.name == name => {
                uniform.buffers.get(frame)?.as_ref()
            }
            _ => None,
        })
    }

    /// Writes the descriptor sets of every frame slot.
    pub fn init_update(&mut self) -> Result<()> {
        for frame in 0..self.sets.sets.len() {
            self.write_descriptors(frame)?;
            self.descriptor_dirty.set(frame, false);
        }
        Ok(())
    }

    /// Brings the copy of `frame` up to date. `cmd` must be recording and no
    /// render pass may be open, since textures are transitioned here.
    pub fn update(&mut self, cmd: &mut CommandBuffer, frame: usize) -> Result<()> {
        assert!(
            frame < self.sets.sets.len(),
            "frame slot {frame} out of range for {} frames in flight",
            self.sets.sets.len()
        );
        // The frame reads these until it completes, even if this set is dropped.
        cmd.retain(self.sets.clone());

        for binding in &mut self.bindings {
            let Resource::Uniform(uniform) = &mut binding.resource else {
                continue;
            };
            if let Some(buffer) = &uniform.buffers[frame] {
                cmd.retain(buffer.clone());
            }
            if binding.schema.kind == DescriptorKind::DynamicUniformBuffer
                || !uniform.has_updated[frame]
            {
                continue;
            }
            if let Some(buffer) = &uniform.buffers[frame] {
                let len = uniform.data.len().min(buffer.size() as usize);
                buffer.write(0, &uniform.data[..len])?;
            }
            uniform.has_updated.set(frame, false);
        }

        for binding in &self.bindings {
            let Resource::Textures {
                textures,
                mip_level,
            } = &binding.resource
            else {
                continue;
            };
            for texture in textures {
                let (layout, access) = texture_target(texture.kind(), binding.schema.kind, *mip_level);
                cmd.transition_image(texture.as_ref(), access, layout)?;
            }
        }
        if cmd.has_pending_barriers() {
            cmd.emit_barriers()?;
        }

        if self.descriptor_dirty[frame] {
            self.write_descriptors(frame)?;
            self.descriptor_dirty.set(frame, false);
        }
        Ok(())
    }

    /// Rewrites every binding of the set of `frame` in a single call.
    fn write_descriptors(&self, frame: usize) -> Result<()> {
        let set = self.sets.sets[frame];
        let mut image_infos: Vec<vk::DescriptorImageInfo> = Vec::new();
        let mut buffer_infos: Vec<vk::DescriptorBufferInfo> = Vec::new();
        let mut structures: Vec<vk::AccelerationStructureKHR> = Vec::new();
        let mut sources: Vec<(&DescriptorSchema, WriteSource)> = Vec::new();

        for binding in &self.bindings {
            let schema = &binding.schema;
            match &binding.resource {
                Resource::Textures {
                    textures,
                    mip_level,
                } => {
                    if textures.is_empty() {
                        tracing::debug!(set = %self.name, member = %schema.name, "No texture assigned");
                        continue;
                    }
                    let start = image_infos.len();
                    image_infos.extend(textures.iter().map(|texture| {
                        let (layout, _) = texture_target(texture.kind(), schema.kind, *mip_level);
                        vk::DescriptorImageInfo {
                            image_layout: layout,
                            ..texture.descriptor_info(*mip_level)
                        }
                    }));
                    sources.push((schema, WriteSource::Images(start..image_infos.len())));
                }
                Resource::Uniform(uniform) => {
                    let Some(buffer) = uniform.buffers.get(frame).and_then(Option::as_ref) else {
                        tracing::warn!(set = %self.name, member = %schema.name, "No buffer assigned to uniform block, skipping");
                        continue;
                    };
                    let start = buffer_infos.len();
                    buffer_infos.push(vk::DescriptorBufferInfo {
                        buffer: buffer.vk_handle(),
                        offset: 0,
                        range: if schema.size == 0 {
                            vk::WHOLE_SIZE
                        } else {
                            schema.size as vk::DeviceSize
                        },
                    });
                    sources.push((schema, WriteSource::Buffers(start..buffer_infos.len())));
                }
                Resource::StorageBuffers(buffers) => {
                    if buffers.is_empty() {
                        tracing::warn!(set = %self.name, member = %schema.name, "Storage buffer binding is empty, skipping");
                        continue;
                    }
                    let start = buffer_infos.len();
                    buffer_infos.extend(buffers.iter().map(|b| b.descriptor_info()));
                    sources.push((schema, WriteSource::Buffers(start..buffer_infos.len())));
                }
                Resource::AccelerationStructures(bound) => {
                    if bound.is_empty() {
                        tracing::warn!(set = %self.name, member = %schema.name, "Acceleration structure binding is empty, skipping");
                        continue;
                    }
                    let start = structures.len();
                    structures.extend(bound.iter().map(|s| s.vk_handle()));
                    sources.push((
                        schema,
                        WriteSource::AccelerationStructures(start..structures.len()),
                    ));
                }
            }
        }

        let mut structure_writes: Vec<vk::WriteDescriptorSetAccelerationStructureKHR> = sources
            .iter()
            .filter_map(|(_, source)| match source {
                WriteSource::AccelerationStructures(range) => Some(
                    vk::WriteDescriptorSetAccelerationStructureKHR::default()
                        .acceleration_structures(&structures[range.clone()]),
                ),
                _ => None,
            })
            .collect();
        let mut structure_writes = structure_writes.iter_mut();

        let writes: Vec<vk::WriteDescriptorSet> = sources
            .iter()
            .filter_map(|(schema, source)| {
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(schema.binding)
                    .descriptor_type(schema.kind.as_raw());
                Some(match source {
                    WriteSource::Images(range) => write.image_info(&image_infos[range.clone()]),
                    WriteSource::Buffers(range) => write.buffer_info(&buffer_infos[range.clone()]),
                    WriteSource::AccelerationStructures(range) => write
                        .descriptor_count(range.len() as u32)
                        .push_next(structure_writes.next()?),
                })
            })
            .collect();

        if writes.is_empty() {
            return Ok(());
        }
        self.device.update_descriptor_sets(&writes)?;
        tracing::trace!(set = %self.name, frame, writes = writes.len(), "Descriptor set written");
        Ok(())
    }
}

impl Debug for BindingSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindingSet")
            .field("name", &self.name)
            .field("set", &self.set)
            .field("frames_in_flight", &self.sets.sets.len())
            .field("bindings", &self.bindings.len())
            .finish()
    }
}
impl HasDevice for BindingSet {
    fn device(&self) -> &Device {
        &self.device
    }
}
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::headless::{Call, FailurePoint, HeadlessBackend, RecordedWrite},
        command::CommandBufferKind,
        error::Error,
        shader::UniformMember,
        texture::TextureView,
    };
    use ash::vk::Handle;
    use glam::Mat4;

    fn camera_schema() -> DescriptorSchema {
        DescriptorSchema::new("Camera", 0, DescriptorKind::UniformBuffer).with_block(
            80,
            vec![
                UniformMember {
                    name: "viewProj".into(),
                    offset: 0,
                    size: 64,
                },
                UniformMember {
                    name: "position".into(),
                    offset: 64,
                    size: 16,
                },
            ],
        )
    }

    fn schema(descriptors: Vec<DescriptorSchema>) -> BindingSchema {
        BindingSchema {
            set: 0,
            layout: vk::DescriptorSetLayout::from_raw(0x40),
            descriptors,
        }
    }

    fn texture(kind: TextureKind, raw: u64) -> TextureRef {
        Arc::new(TextureView::new(
            kind,
            vk::Extent2D {
                width: 64,
                height: 64,
            },
            vk::Format::R8G8B8A8_UNORM,
            vk::Image::from_raw(raw),
            vk::ImageView::from_raw(raw + 1),
            vk::Sampler::from_raw(raw + 2),
        ))
    }

    fn recording(device: &Device) -> CommandBuffer {
        let mut cmd =
            CommandBuffer::new_primary(device.clone(), CommandBufferKind::Graphics, u64::MAX)
                .unwrap();
        cmd.begin_recording().unwrap();
        cmd
    }

    fn descriptor_writes(backend: &HeadlessBackend) -> Vec<Vec<RecordedWrite>> {
        backend
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::UpdateDescriptorSets(writes) => Some(writes),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_uniform_flushes_only_the_updated_slot() {
        let backend = HeadlessBackend::new();
        let device = Device::new(backend.clone());
        let mut set = BindingSet::new(device.clone(), &schema(vec![camera_schema()]), 2).unwrap();
        let mut cmd = recording(&device);

        let view_proj = Mat4::from_scale(glam::Vec3::new(2.0, 3.0, 4.0));
        set.set_uniform("Camera", "viewProj", &view_proj);
        assert!(set.has_pending_uniform("Camera", 0));
        assert!(set.has_pending_uniform("Camera", 1));

        set.update(&mut cmd, 0).unwrap();
        assert!(!set.has_pending_uniform("Camera", 0));
        assert!(set.has_pending_uniform("Camera", 1));

        let slot0 = set.uniform_buffer("Camera", 0).unwrap().vk_handle();
        let slot1 = set.uniform_buffer("Camera", 1).unwrap().vk_handle();
        let contents = backend.buffer_contents(slot0).unwrap();
        assert_eq!(&contents[..64], bytemuck::bytes_of(&view_proj));
        assert_eq!(&contents[64..], &[0; 16]);
        assert!(backend.buffer_contents(slot1).unwrap().iter().all(|&b| b == 0));

        // The mirror is uploaded once per slot.
        backend.clear_calls();
        set.update(&mut cmd, 0).unwrap();
        assert_eq!(backend.count(|c| matches!(c, Call::WriteBuffer { .. })), 0);
        set.update(&mut cmd, 1).unwrap();
        assert_eq!(backend.count(|c| matches!(c, Call::WriteBuffer { .. })), 1);
        assert_eq!(
            &backend.buffer_contents(slot1).unwrap()[..64],
            bytemuck::bytes_of(&view_proj)
        );
    }

    #[test]
    fn test_partial_and_whole_block_writes() {
        let backend = HeadlessBackend::new();
        let device = Device::new(backend.clone());
        let mut set = BindingSet::new(device.clone(), &schema(vec![camera_schema()]), 1).unwrap();
        let mut cmd = recording(&device);

        set.set_uniform_block("Camera", &[1; 80]);
        set.set_uniform_bytes("Camera", "position", &[9; 32], 8);
        set.update(&mut cmd, 0).unwrap();

        let buffer = set.uniform_buffer("Camera", 0).unwrap().vk_handle();
        let contents = backend.buffer_contents(buffer).unwrap();
        assert_eq!(&contents[..64], &[1; 64]);
        assert_eq!(&contents[64..72], &[9; 8]);
        assert_eq!(&contents[72..], &[1; 8]);
    }

    #[test]
    fn test_unknown_names_are_ignored() {
        let backend = HeadlessBackend::new();
        let device = Device::new(backend.clone());
        let mut set = BindingSet::new(device.clone(), &schema(vec![camera_schema()]), 2).unwrap();
        set.init_update().unwrap();

        set.set_uniform("Camera", "missing", &1.0f32);
        set.set_uniform("Missing", "viewProj", &1.0f32);
        set.set_texture("Missing", &texture(TextureKind::Color, 0x100));
        assert!(!set.has_pending_uniform("Camera", 0));
        assert!(!set.is_dirty(0));
        assert!(!set.is_dirty(1));
    }

    #[test]
    fn test_failed_write_keeps_the_slot_dirty() {
        let backend = HeadlessBackend::new();
        let device = Device::new(backend.clone());
        let mut set = BindingSet::new(device.clone(), &schema(vec![camera_schema()]), 2).unwrap();
        let mut cmd = recording(&device);

        backend.fail_next(FailurePoint::UpdateDescriptorSets);
        assert!(matches!(
            set.update(&mut cmd, 0),
            Err(Error::Vulkan(_))
        ));
        assert!(set.is_dirty(0));
        assert!(descriptor_writes(&backend).is_empty());

        set.update(&mut cmd, 0).unwrap();
        assert!(!set.is_dirty(0));
        assert!(set.is_dirty(1));
        let writes = descriptor_writes(&backend);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0][0].set, set.descriptor_set(0));
    }

    #[test]
    fn test_empty_buffer_bindings_are_skipped() {
        let backend = HeadlessBackend::new();
        let device = Device::new(backend.clone());
        let mut set = BindingSet::new(
            device.clone(),
            &schema(vec![
                camera_schema(),
                DescriptorSchema::new("Particles", 1, DescriptorKind::StorageBuffer),
                DescriptorSchema::new("Scene", 2, DescriptorKind::AccelerationStructure),
            ]),
            1,
        )
        .unwrap();
        let mut cmd = recording(&device);

        set.update(&mut cmd, 0).unwrap();
        let writes = descriptor_writes(&backend);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].len(), 1);
        assert_eq!(writes[0][0].binding, 0);
        assert!(writes.iter().flatten().all(|w| w.count > 0));

        let particles = Arc::new(
            Buffer::new_private(device.clone(), 1024, 16, vk::BufferUsageFlags::STORAGE_BUFFER)
                .unwrap(),
        );
        set.set_storage_buffer("Particles", particles.clone());
        assert!(set.is_dirty(0));
        backend.clear_calls();
        set.update(&mut cmd, 0).unwrap();
        let writes = descriptor_writes(&backend);
        assert_eq!(writes[0].len(), 2);
        assert_eq!(writes[0][1].binding, 1);
        assert_eq!(writes[0][1].ty, vk::DescriptorType::STORAGE_BUFFER);
        assert_eq!(writes[0][1].count, 1);

        // Assigning the same buffer again changes nothing.
        set.set_storage_buffer("Particles", particles);
        assert!(!set.is_dirty(0));
    }

    #[test]
    fn test_texture_dirtiness() {
        let backend = HeadlessBackend::new();
        let device = Device::new(backend.clone());
        let mut set = BindingSet::new(
            device.clone(),
            &schema(vec![DescriptorSchema::new(
                "albedo",
                0,
                DescriptorKind::SampledImage,
            )]),
            2,
        )
        .unwrap();
        let albedo = texture(TextureKind::Color, 0x100);
        set.set_texture("albedo", &albedo);
        set.init_update().unwrap();
        assert!(!set.is_dirty(0) && !set.is_dirty(1));

        set.set_texture("albedo", &albedo);
        assert!(!set.is_dirty(0));

        albedo.set_updated(true);
        set.set_texture("albedo", &albedo);
        assert!(set.is_dirty(0) && set.is_dirty(1));
        assert!(!albedo.is_updated());
        set.init_update().unwrap();

        set.set_textures("albedo", std::slice::from_ref(&albedo), Some(2), false);
        assert!(set.is_dirty(0));
        set.init_update().unwrap();

        set.set_textures("albedo", std::slice::from_ref(&albedo), Some(2), true);
        assert!(set.is_dirty(0));
        set.init_update().unwrap();

        set.set_texture("albedo", &texture(TextureKind::Color, 0x200));
        assert!(set.is_dirty(1));
    }

    #[test]
    fn test_textures_are_transitioned_in_one_barrier() {
        let backend = HeadlessBackend::new();
        let device = Device::new(backend.clone());
        let mut set = BindingSet::new(
            device.clone(),
            &schema(vec![
                DescriptorSchema::new("albedo", 0, DescriptorKind::SampledImage),
                DescriptorSchema::new("shadow", 1, DescriptorKind::SampledImage),
                DescriptorSchema::new("output", 2, DescriptorKind::StorageImage),
            ]),
            1,
        )
        .unwrap();
        let albedo = texture(TextureKind::Color, 0x100);
        let shadow = texture(TextureKind::Depth, 0x200);
        let output = texture(TextureKind::Color, 0x300);
        set.set_textures("albedo", std::slice::from_ref(&albedo), Some(1), false);
        set.set_texture("shadow", &shadow);
        set.set_texture("output", &output);

        let mut cmd = recording(&device);
        backend.clear_calls();
        set.update(&mut cmd, 0).unwrap();

        let barriers: Vec<Vec<(vk::Image, vk::ImageLayout, vk::ImageLayout)>> = backend
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::PipelineBarrier { image_barriers, .. } => Some(image_barriers),
                _ => None,
            })
            .collect();
        assert_eq!(barriers.len(), 1);
        assert_eq!(
            barriers[0],
            vec![
                (albedo.image(), vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL),
                (
                    shadow.image(),
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
                ),
                (output.image(), vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL),
            ]
        );
        assert_eq!(shadow.layout(), vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL);

        // Layouts are already in place on the next frame. Only the storage image
        // still needs its write-after-write dependency.
        backend.clear_calls();
        set.update(&mut cmd, 0).unwrap();
        let calls = backend.calls();
        let next: Vec<_> = calls
            .iter()
            .filter_map(|call| match call {
                Call::PipelineBarrier {
                    memory_barriers,
                    image_barriers,
                    ..
                } => Some((memory_barriers.len(), image_barriers.len())),
                _ => None,
            })
            .collect();
        assert_eq!(next, vec![(1, 0)]);
    }

    #[test]
    fn test_dynamic_blocks_use_the_assigned_buffer() {
        let backend = HeadlessBackend::new();
        let device = Device::new(backend.clone());
        let mut set = BindingSet::new(
            device.clone(),
            &schema(vec![
                DescriptorSchema::new("Object", 0, DescriptorKind::DynamicUniformBuffer)
                    .with_block(
                        64,
                        vec![UniformMember {
                            name: "model".into(),
                            offset: 0,
                            size: 64,
                        }],
                    ),
            ]),
            2,
        )
        .unwrap();
        assert!(set.is_dynamic("Object"));
        assert!(set.uniform_buffer("Object", 0).is_none());
        assert_eq!(set.dynamic_offset("Object"), Some(0));

        let mut cmd = recording(&device);
        backend.clear_calls();
        set.update(&mut cmd, 0).unwrap();
        // Nothing to point the descriptor at yet.
        assert!(descriptor_writes(&backend).is_empty());

        let buffer = Arc::new(
            Buffer::new_host(
                device.clone(),
                device.aligned_dynamic_uniform_size(64) * 16,
                256,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
            )
            .unwrap(),
        );
        set.set_buffer("Object", buffer.clone());
        set.set_uniform("Object", "model", &Mat4::IDENTITY);
        set.set_dynamic_offset("Object", 512);
        assert_eq!(set.dynamic_offsets().as_slice(), &[512]);

        backend.clear_calls();
        set.update(&mut cmd, 0).unwrap();
        assert_eq!(backend.count(|c| matches!(c, Call::WriteBuffer { .. })), 0);
        let writes = descriptor_writes(&backend);
        assert_eq!(writes[0][0].ty, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC);
        assert!(Arc::ptr_eq(set.uniform_buffer("Object", 1).unwrap(), &buffer));
    }

    #[test]
    fn test_drop_frees_everything() {
        let backend = HeadlessBackend::new();
        let device = Device::new(backend.clone());
        let set = BindingSet::new(device, &schema(vec![camera_schema()]), 3).unwrap();
        assert_eq!(set.frames_in_flight(), 3);
        drop(set);
        assert_eq!(backend.live_objects(), 0);
    }

    #[test]
    fn test_sets_outlive_the_frame_that_used_them() {
        let backend = HeadlessBackend::new();
        let device = Device::new(backend.clone());
        let mut set = BindingSet::new(device.clone(), &schema(vec![camera_schema()]), 2).unwrap();
        let sets = vec![set.descriptor_set(0), set.descriptor_set(1)];

        let mut cmd = recording(&device);
        set.update(&mut cmd, 0).unwrap();
        cmd.end_recording().unwrap();
        cmd.submit().unwrap();

        backend.clear_calls();
        drop(set);
        // Only the uniform buffer of the slot the frame did not use goes away.
        assert_eq!(backend.count(|c| matches!(c, Call::FreeDescriptorSets(_))), 0);
        assert_eq!(backend.count(|c| matches!(c, Call::DestroyBuffer(_))), 1);

        cmd.wait().unwrap();
        assert!(backend.calls().contains(&Call::FreeDescriptorSets(sets)));
        assert_eq!(backend.count(|c| matches!(c, Call::DestroyBuffer(_))), 2);
        drop(cmd);
        assert_eq!(backend.live_objects(), 0);
    }

    #[test]
    fn test_set_name_names_every_slot() {
        let backend = HeadlessBackend::new();
        let device = Device::new(backend.clone());
        let mut set = BindingSet::new(device, &schema(vec![camera_schema()]), 2).unwrap();
        assert_eq!(set.name(), "set0");

        backend.clear_calls();
        set.set_name("camera");
        assert_eq!(set.name(), "camera");
        let named: Vec<(vk::ObjectType, u64, String)> = backend
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::SetObjectName {
                    object_type,
                    handle,
                    name,
                } => Some((object_type, handle, name)),
                _ => None,
            })
            .collect();
        assert_eq!(
            named,
            vec![
                (
                    vk::ObjectType::DESCRIPTOR_SET,
                    set.descriptor_set(0).as_raw(),
                    "camera[0]".to_owned()
                ),
                (
                    vk::ObjectType::DESCRIPTOR_SET,
                    set.descriptor_set(1).as_raw(),
                    "camera[1]".to_owned()
                ),
            ]
        );
    }
}
