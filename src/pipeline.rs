//! Render passes, frame buffers and pipelines.
//!
//! These objects are never created directly by the renderer. They are built by
//! the [`GraphicsContext`](crate::GraphicsContext) from a description the first
//! time it is requested and shared from its cache afterwards.
//!
//! # Key Types
//!
//! - [`RenderPass`]: a single-subpass render pass over a fixed attachment list.
//! - [`FrameBuffer`]: the attachments a render pass writes to, at one layer.
//! - [`Pipeline`]: a pipeline state object, plus the render pass and frame buffers
//!   it renders into when it is a graphics pipeline.
//!
//! Binding a graphics pipeline opens its render pass. The render scope stays open
//! until another pipeline is bound or the pipeline is unbound, see
//! [`CommandBuffer::bind_pipeline`](crate::command::CommandBuffer::bind_pipeline).

use std::{
    fmt::Debug,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use ash::vk;
use smallvec::SmallVec;

use crate::{
    Device, HasDevice,
    backend::Inheritance,
    command::CommandBuffer,
    description::{FrameBufferDescription, PipelineDescription, RenderPassDescription},
    error::Result,
    hash::Fingerprint,
    texture::TextureRef,
    tracking::Access,
    utils::AsVkHandle,
};

pub struct RenderPass {
    device: Device,
    handle: vk::RenderPass,
    description: RenderPassDescription,
}

impl RenderPass {
    pub fn new(device: Device, description: RenderPassDescription) -> Result<Self> {
        let handle = device.create_render_pass(&description)?;
        Ok(Self {
            device,
            handle,
            description,
        })
    }

    pub fn description(&self) -> &RenderPassDescription {
        &self.description
    }

    pub fn attachment_count(&self) -> usize {
        self.description.attachments.len()
    }

    /// One clear value per attachment. Depth clears to the far plane.
    pub fn clear_values(&self, clear_color: [f32; 4]) -> SmallVec<[vk::ClearValue; 4]> {
        self.description
            .attachments
            .iter()
            .map(|texture| {
                if texture.kind().is_depth() {
                    vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue {
                            depth: 1.0,
                            stencil: 0,
                        },
                    }
                } else {
                    vk::ClearValue {
                        color: vk::ClearColorValue {
                            float32: clear_color,
                        },
                    }
                }
            })
            .collect()
    }
}

impl Debug for RenderPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderPass")
            .field("handle", &self.handle)
            .field("attachments", &self.description.attachments.len())
            .field("clear", &self.description.clear)
            .finish()
    }
}
impl HasDevice for RenderPass {
    fn device(&self) -> &Device {
        &self.device
    }
}
impl AsVkHandle for RenderPass {
    type Handle = vk::RenderPass;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}
impl Drop for RenderPass {
    fn drop(&mut self) {
        self.device.destroy_render_pass(self.handle);
    }
}

pub struct FrameBuffer {
    device: Device,
    handle: vk::Framebuffer,
    description: FrameBufferDescription,
}

impl FrameBuffer {
    pub fn new(device: Device, description: FrameBufferDescription) -> Result<Self> {
        let handle = device.create_frame_buffer(&description)?;
        Ok(Self {
            device,
            handle,
            description,
        })
    }

    pub fn render_pass(&self) -> &Arc<RenderPass> {
        &self.description.render_pass
    }

    pub fn attachments(&self) -> &[TextureRef] {
        &self.description.attachments
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.description.width,
            height: self.description.height,
        }
    }

    pub fn layer(&self) -> u32 {
        self.description.layer
    }
}

impl Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("handle", &self.handle)
            .field("extent", &self.extent())
            .field("layer", &self.description.layer)
            .finish()
    }
}
impl HasDevice for FrameBuffer {
    fn device(&self) -> &Device {
        &self.device
    }
}
impl AsVkHandle for FrameBuffer {
    type Handle = vk::Framebuffer;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}
impl Drop for FrameBuffer {
    fn drop(&mut self) {
        self.device.destroy_frame_buffer(self.handle);
    }
}

/// A pipeline state object together with the targets it renders into.
pub struct Pipeline {
    device: Device,
    handle: vk::Pipeline,
    fingerprint: Fingerprint,
    description: PipelineDescription,
    render_pass: Option<Arc<RenderPass>>,
    frame_buffers: Vec<Arc<FrameBuffer>>,
    /// Index of the swapchain image being rendered, shared with the context.
    current_image: Arc<AtomicUsize>,
}

impl Pipeline {
    pub(crate) fn new(
        device: Device,
        fingerprint: Fingerprint,
        description: PipelineDescription,
        render_pass: Option<Arc<RenderPass>>,
        frame_buffers: Vec<Arc<FrameBuffer>>,
        current_image: Arc<AtomicUsize>,
    ) -> Result<Self> {
        debug_assert_eq!(render_pass.is_some(), description.is_graphics());
        let handle =
            device.create_pipeline(&description, render_pass.as_ref().map(|r| r.vk_handle()))?;
        if let Some(name) = &description.debug_name {
            device.name_object(handle, name);
        }
        Ok(Self {
            device,
            handle,
            fingerprint,
            description,
            render_pass,
            frame_buffers,
            current_image,
        })
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn description(&self) -> &PipelineDescription {
        &self.description
    }

    pub fn name(&self) -> &str {
        self.description
            .debug_name
            .as_deref()
            .unwrap_or_else(|| self.description.shader.name())
    }

    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.description.shader.kind().bind_point()
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.description.shader.pipeline_layout()
    }

    pub fn render_pass(&self) -> Option<&Arc<RenderPass>> {
        self.render_pass.as_ref()
    }

    pub fn frame_buffers(&self) -> &[Arc<FrameBuffer>] {
        &self.frame_buffers
    }

    /// The frame buffer rendered into when bound at `layer`: the current swapchain
    /// image for swapchain pipelines, `layer` for layered depth targets.
    pub fn frame_buffer(&self, layer: u32) -> Option<&Arc<FrameBuffer>> {
        if self.frame_buffers.is_empty() {
            return None;
        }
        let index = if self.description.swapchain_target {
            self.current_image.load(Ordering::Acquire) % self.frame_buffers.len()
        } else if self.description.depth_array_target.is_some() {
            let layer = layer as usize;
            if layer >= self.frame_buffers.len() {
                tracing::warn!(
                    pipeline = self.name(),
                    layer,
                    layers = self.frame_buffers.len(),
                    "Layer out of range, rendering to the last layer"
                );
            }
            layer.min(self.frame_buffers.len() - 1)
        } else {
            0
        };
        self.frame_buffers.get(index)
    }

    /// Render pass and frame buffer a secondary command buffer recorded for this
    /// pipeline continues.
    pub fn inheritance(&self, layer: u32) -> Option<Inheritance> {
        let render_pass = self.render_pass.as_ref()?;
        let frame_buffer = self.frame_buffer(layer)?;
        Some(Inheritance {
            render_pass: render_pass.vk_handle(),
            frame_buffer: frame_buffer.vk_handle(),
        })
    }

    /// Opens the render scope of this pipeline and binds it. Returns the frame
    /// buffer the scope renders into.
    pub(crate) fn bind(
        &self,
        cmd: &mut CommandBuffer,
        layer: u32,
        contents: vk::SubpassContents,
    ) -> Result<Option<Arc<FrameBuffer>>> {
        let target = self.frame_buffer(layer).cloned();
        if let (Some(render_pass), Some(frame_buffer)) = (self.render_pass.as_ref(), &target) {
            let description = render_pass.description();
            for (i, texture) in frame_buffer.attachments().iter().enumerate() {
                let (layout, _) = description.attachment_layouts(i);
                let access = if texture.kind().is_depth() {
                    Access::EARLY_FRAGMENT_TEST_WRITE
                } else {
                    Access::COLOR_ATTACHMENT_WRITE
                };
                cmd.transition_image(texture.as_ref(), access, layout)?;
            }
            cmd.emit_barriers()?;

            let clear_values = render_pass.clear_values(self.description.clear_color);
            let begin_info = vk::RenderPassBeginInfo::default()
                .render_pass(render_pass.vk_handle())
                .framebuffer(frame_buffer.vk_handle())
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D::default(),
                    extent: frame_buffer.extent(),
                })
                .clear_values(&clear_values);
            self.device
                .cmd_begin_render_pass(cmd.vk_handle(), &begin_info, contents);
        }
        self.device
            .cmd_bind_pipeline(cmd.vk_handle(), self.bind_point(), self.handle);
        Ok(target)
    }

    /// Closes the render scope opened by [`bind`](Self::bind).
    pub(crate) fn end(&self, cmd: &mut CommandBuffer, frame_buffer: Option<&FrameBuffer>) {
        let (Some(render_pass), Some(frame_buffer)) = (self.render_pass.as_ref(), frame_buffer)
        else {
            return;
        };
        self.device.cmd_end_render_pass(cmd.vk_handle());
        let description = render_pass.description();
        for (i, texture) in frame_buffer.attachments().iter().enumerate() {
            let (_, final_layout) = description.attachment_layouts(i);
            texture.with_state(&mut |state| state.layout = final_layout);
        }
    }
}

impl Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name())
            .field("handle", &self.handle)
            .field("fingerprint", &self.fingerprint)
            .field("frame_buffers", &self.frame_buffers.len())
            .finish()
    }
}
impl HasDevice for Pipeline {
    fn device(&self) -> &Device {
        &self.device
    }
}
impl AsVkHandle for Pipeline {
    type Handle = vk::Pipeline;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}
impl Drop for Pipeline {
    fn drop(&mut self) {
        self.device.destroy_pipeline(self.handle);
    }
}
