//! Resource descriptions.
//!
//! A description is a plain value naming everything an object depends on. Two
//! descriptions that hash to the same [`Fingerprint`](crate::hash::Fingerprint)
//! resolve to the same cached object, so every [`Hash`] impl here feeds every
//! field that changes the object being built. Textures are hashed by identity and
//! by the handles they currently resolve to.
//!
//! Descriptions are built with struct update syntax:
//!
//! ```ignore
//! let desc = PipelineDescription {
//!     swapchain_target: true,
//!     depth_target: Some(depth.clone()),
//!     ..PipelineDescription::new(shader.clone())
//! };
//! let pipeline = context.get_pipeline(&desc)?;
//! ```

use std::{
    hash::{Hash, Hasher},
    sync::Arc,
};

use ash::vk;

use crate::{
    pipeline::RenderPass,
    shader::{ShaderKind, ShaderRef},
    texture::{TextureRef, hash_texture, hash_textures},
    utils::AsVkHandle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
    FrontAndBack,
}

impl CullMode {
    pub fn as_raw(self) -> vk::CullModeFlags {
        match self {
            Self::None => vk::CullModeFlags::NONE,
            Self::Front => vk::CullModeFlags::FRONT,
            Self::Back => vk::CullModeFlags::BACK,
            Self::FrontAndBack => vk::CullModeFlags::FRONT_AND_BACK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PolygonMode {
    #[default]
    Fill,
    Line,
    Point,
}

impl PolygonMode {
    pub fn as_raw(self) -> vk::PolygonMode {
        match self {
            Self::Fill => vk::PolygonMode::FILL,
            Self::Line => vk::PolygonMode::LINE,
            Self::Point => vk::PolygonMode::POINT,
        }
    }
}

/// Primitive topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DrawType {
    #[default]
    Triangles,
    TriangleStrip,
    Lines,
    Points,
}

impl DrawType {
    pub fn as_raw(self) -> vk::PrimitiveTopology {
        match self {
            Self::Triangles => vk::PrimitiveTopology::TRIANGLE_LIST,
            Self::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
            Self::Lines => vk::PrimitiveTopology::LINE_LIST,
            Self::Points => vk::PrimitiveTopology::POINT_LIST,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilState {
    pub compare_op: vk::CompareOp,
    pub fail_op: vk::StencilOp,
    pub depth_fail_op: vk::StencilOp,
    pub pass_op: vk::StencilOp,
    pub reference: u32,
    pub mask: u32,
}

impl Default for StencilState {
    fn default() -> Self {
        Self {
            compare_op: vk::CompareOp::ALWAYS,
            fail_op: vk::StencilOp::KEEP,
            depth_fail_op: vk::StencilOp::KEEP,
            pass_op: vk::StencilOp::KEEP,
            reference: 0,
            mask: 0xff,
        }
    }
}

impl StencilState {
    pub fn as_raw(&self) -> vk::StencilOpState {
        vk::StencilOpState {
            fail_op: self.fail_op,
            pass_op: self.pass_op,
            depth_fail_op: self.depth_fail_op,
            compare_op: self.compare_op,
            compare_mask: self.mask,
            write_mask: self.mask,
            reference: self.reference,
        }
    }
}

/// Everything a pipeline state object and its render targets depend on.
#[derive(Debug, Clone)]
pub struct PipelineDescription {
    pub shader: ShaderRef,
    pub cull_mode: CullMode,
    pub polygon_mode: PolygonMode,
    pub draw_type: DrawType,
    pub depth_bias: bool,
    pub transparency: bool,
    pub blend_src: vk::BlendFactor,
    pub blend_dst: vk::BlendFactor,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare_op: vk::CompareOp,
    /// `None` disables the stencil test.
    pub stencil: Option<StencilState>,
    pub color_targets: Vec<TextureRef>,
    pub depth_target: Option<TextureRef>,
    /// Layered depth target. One frame buffer is built per layer.
    pub depth_array_target: Option<TextureRef>,
    /// Render into the current swapchain image.
    pub swapchain_target: bool,
    pub clear_targets: bool,
    pub clear_color: [f32; 4],
    /// Not part of the fingerprint.
    pub debug_name: Option<String>,
}

impl PipelineDescription {
    pub fn new(shader: ShaderRef) -> Self {
        Self {
            shader,
            cull_mode: CullMode::default(),
            polygon_mode: PolygonMode::default(),
            draw_type: DrawType::default(),
            depth_bias: false,
            transparency: false,
            blend_src: vk::BlendFactor::SRC_ALPHA,
            blend_dst: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            depth_test: true,
            depth_write: true,
            depth_compare_op: vk::CompareOp::LESS_OR_EQUAL,
            stencil: None,
            color_targets: Vec::new(),
            depth_target: None,
            depth_array_target: None,
            swapchain_target: false,
            clear_targets: false,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            debug_name: None,
        }
    }

    /// Compute and ray tracing pipelines have no render targets.
    pub fn is_graphics(&self) -> bool {
        self.shader.kind() == ShaderKind::Graphics
    }

    /// The depth attachment, whichever kind it is.
    pub fn depth_attachment(&self) -> Option<&TextureRef> {
        self.depth_target
            .as_ref()
            .or(self.depth_array_target.as_ref())
    }
}

impl Hash for PipelineDescription {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.shader) as *const () as usize).hash(state);
        self.shader.name().hash(state);
        self.cull_mode.hash(state);
        self.polygon_mode.hash(state);
        self.draw_type.hash(state);
        self.depth_bias.hash(state);
        self.transparency.hash(state);
        if self.transparency {
            self.blend_src.hash(state);
            self.blend_dst.hash(state);
        }
        self.depth_test.hash(state);
        self.depth_write.hash(state);
        self.depth_compare_op.hash(state);
        self.stencil.hash(state);
        hash_textures(&self.color_targets, state);
        self.clear_targets.hash(state);
        if self.clear_targets {
            for channel in self.clear_color {
                channel.to_bits().hash(state);
            }
        }
        for target in [&self.depth_target, &self.depth_array_target] {
            target.is_some().hash(state);
            if let Some(texture) = target {
                hash_texture(texture, state);
            }
        }
        self.swapchain_target.hash(state);
    }
}

/// Attachments of a single-subpass render pass. Color attachments come first,
/// followed by at most one depth attachment.
#[derive(Debug, Clone)]
pub struct RenderPassDescription {
    pub attachments: Vec<TextureRef>,
    /// Clear every attachment on load instead of preserving it.
    pub clear: bool,
    /// The first attachment is a swapchain image and ends in the present layout.
    pub swapchain_target: bool,
}

impl RenderPassDescription {
    pub fn color_attachments(&self) -> impl Iterator<Item = &TextureRef> {
        self.attachments.iter().filter(|t| !t.kind().is_depth())
    }

    pub fn depth_attachment(&self) -> Option<&TextureRef> {
        self.attachments.iter().find(|t| t.kind().is_depth())
    }

    /// Layout attachment `index` is in during the pass and after it. Attachments
    /// are transitioned to the first one before the pass begins.
    pub fn attachment_layouts(&self, index: usize) -> (vk::ImageLayout, vk::ImageLayout) {
        let depth = self.attachments[index].kind().is_depth();
        if depth {
            let layout = vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL;
            (layout, layout)
        } else if self.swapchain_target && index == 0 {
            (
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
            )
        } else {
            let layout = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;
            (layout, layout)
        }
    }
}

impl Hash for RenderPassDescription {
    fn hash<H: Hasher>(&self, state: &mut H) {
        hash_textures(&self.attachments, state);
        self.clear.hash(state);
        self.swapchain_target.hash(state);
    }
}

#[derive(Debug, Clone)]
pub struct FrameBufferDescription {
    pub render_pass: Arc<RenderPass>,
    pub attachments: Vec<TextureRef>,
    pub width: u32,
    pub height: u32,
    /// Array layer of layered attachments this frame buffer renders into.
    pub layer: u32,
    /// Renders into a swapchain image.
    pub screen: bool,
}

impl Hash for FrameBufferDescription {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.attachments.len().hash(state);
        self.width.hash(state);
        self.height.hash(state);
        self.layer.hash(state);
        self.render_pass.vk_handle().hash(state);
        self.screen.hash(state);
        for texture in &self.attachments {
            hash_texture(texture, state);
        }
    }
}
