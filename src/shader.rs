//! The shader interface consumed by pipelines and binding sets.
//!
//! Compiling and reflecting shaders is the renderer's job. Pipelines need the
//! compiled stages and the pipeline layout; binding sets need the reflected layout
//! of one descriptor set, described by a [`BindingSchema`].

use std::{ffi::CString, fmt::Debug, sync::Arc};

use ash::vk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderKind {
    Graphics,
    Compute,
    RayTracing,
}

impl ShaderKind {
    pub fn bind_point(self) -> vk::PipelineBindPoint {
        match self {
            Self::Graphics => vk::PipelineBindPoint::GRAPHICS,
            Self::Compute => vk::PipelineBindPoint::COMPUTE,
            Self::RayTracing => vk::PipelineBindPoint::RAY_TRACING_KHR,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShaderStage {
    pub stage: vk::ShaderStageFlags,
    pub module: vk::ShaderModule,
    pub entry_point: CString,
}

/// Vertex layout of a graphics shader. A single interleaved binding.
#[derive(Debug, Clone, Default)]
pub struct VertexInput {
    pub stride: u32,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
}

/// The kind of resource a descriptor binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    /// Combined image sampler.
    SampledImage,
    /// Storage image.
    StorageImage,
    UniformBuffer,
    /// Uniform buffer bound with a per-draw offset.
    DynamicUniformBuffer,
    StorageBuffer,
    AccelerationStructure,
}

impl DescriptorKind {
    pub fn as_raw(self) -> vk::DescriptorType {
        match self {
            Self::SampledImage => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            Self::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
            Self::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            Self::DynamicUniformBuffer => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            Self::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            Self::AccelerationStructure => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        }
    }

    pub fn is_image(self) -> bool {
        matches!(self, Self::SampledImage | Self::StorageImage)
    }

    pub fn is_uniform(self) -> bool {
        matches!(self, Self::UniformBuffer | Self::DynamicUniformBuffer)
    }
}

/// A named member of a uniform block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformMember {
    pub name: String,
    pub offset: u32,
    pub size: u32,
}

/// One binding of a descriptor set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorSchema {
    pub name: String,
    pub binding: u32,
    pub kind: DescriptorKind,
    /// Array length of the binding.
    pub count: u32,
    /// Size in bytes of a uniform block. Zero for other kinds.
    pub size: u32,
    pub members: Vec<UniformMember>,
}

impl DescriptorSchema {
    pub fn new(name: impl Into<String>, binding: u32, kind: DescriptorKind) -> Self {
        Self {
            name: name.into(),
            binding,
            kind,
            count: 1,
            size: 0,
            members: Vec::new(),
        }
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    /// Declares a uniform block of `size` bytes made of `members`.
    pub fn with_block(mut self, size: u32, members: Vec<UniformMember>) -> Self {
        debug_assert!(members.iter().all(|m| m.offset + m.size <= size));
        self.size = size;
        self.members = members;
        self
    }

    pub fn member(&self, name: &str) -> Option<&UniformMember> {
        self.members.iter().find(|m| m.name == name)
    }
}

/// Reflected layout of one descriptor set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSchema {
    pub set: u32,
    pub layout: vk::DescriptorSetLayout,
    pub descriptors: Vec<DescriptorSchema>,
}

impl BindingSchema {
    pub fn descriptor(&self, name: &str) -> Option<&DescriptorSchema> {
        self.descriptors.iter().find(|d| d.name == name)
    }
}

/// A compiled, reflected shader program.
pub trait Shader: Send + Sync + Debug + 'static {
    fn name(&self) -> &str;
    fn kind(&self) -> ShaderKind;
    fn stages(&self) -> &[ShaderStage];
    fn pipeline_layout(&self) -> vk::PipelineLayout;

    /// `None` for shaders without vertex attributes.
    fn vertex_input(&self) -> Option<&VertexInput> {
        None
    }

    /// Layout of descriptor set `set`, if the program declares one.
    fn binding_schema(&self, set: u32) -> Option<&BindingSchema>;
}

pub type ShaderRef = Arc<dyn Shader>;

/// [`Shader`] over externally compiled modules and reflection data.
#[derive(Debug, Clone)]
pub struct ShaderProgram {
    pub name: String,
    pub kind: ShaderKind,
    pub stages: Vec<ShaderStage>,
    pub layout: vk::PipelineLayout,
    pub vertex_input: Option<VertexInput>,
    pub schemas: Vec<BindingSchema>,
}

impl ShaderProgram {
    pub fn new(name: impl Into<String>, kind: ShaderKind, layout: vk::PipelineLayout) -> Self {
        Self {
            name: name.into(),
            kind,
            stages: Vec::new(),
            layout,
            vertex_input: None,
            schemas: Vec::new(),
        }
    }

    pub fn with_stage(mut self, stage: ShaderStage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn with_vertex_input(mut self, vertex_input: VertexInput) -> Self {
        self.vertex_input = Some(vertex_input);
        self
    }

    pub fn with_schema(mut self, schema: BindingSchema) -> Self {
        self.schemas.push(schema);
        self
    }
}

impl Shader for ShaderProgram {
    fn name(&self) -> &str {
        &self.name
    }
    fn kind(&self) -> ShaderKind {
        self.kind
    }
    fn stages(&self) -> &[ShaderStage] {
        &self.stages
    }
    fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.layout
    }
    fn vertex_input(&self) -> Option<&VertexInput> {
        self.vertex_input.as_ref()
    }
    fn binding_schema(&self, set: u32) -> Option<&BindingSchema> {
        self.schemas.iter().find(|s| s.set == set)
    }
}
