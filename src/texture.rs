//! The texture interface consumed by descriptions and binding sets.
//!
//! Image creation, uploads and format conversion belong to the renderer. This crate
//! only needs to know what a texture *is* (its [`TextureKind`], extent and format),
//! which handles back it, and which state it is currently in so that binding-set
//! updates can transition it before use.
//!
//! [`TextureView`] is a ready-made implementation over raw handles for renderers
//! that manage image memory themselves.

use std::{
    fmt::Debug,
    hash::{Hash, Hasher},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use ash::vk;

use crate::tracking::ResourceState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureKind {
    Color,
    Color3D,
    Cube,
    Depth,
    DepthArray,
}

impl TextureKind {
    pub fn is_depth(self) -> bool {
        matches!(self, Self::Depth | Self::DepthArray)
    }
}

/// A GPU image that can be attached to a render pass or bound to a binding set.
pub trait Texture: Send + Sync + Debug + 'static {
    fn kind(&self) -> TextureKind;
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn format(&self) -> vk::Format;

    /// Array layers, or cube faces for [`TextureKind::Cube`].
    fn layer_count(&self) -> u32 {
        1
    }

    fn image(&self) -> vk::Image;

    /// View covering every mip level and layer.
    fn image_view(&self) -> vk::ImageView;

    /// View covering a single mip level. Defaults to the full view.
    fn mip_view(&self, mip_level: u32) -> vk::ImageView {
        let _ = mip_level;
        self.image_view()
    }

    /// View of a single array layer, used to render into one layer of a layered
    /// target. Defaults to the full view.
    fn layer_view(&self, layer: u32) -> vk::ImageView {
        let _ = layer;
        self.image_view()
    }

    fn sampler(&self) -> vk::Sampler;

    fn aspects(&self) -> vk::ImageAspectFlags {
        if self.kind().is_depth() {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        }
    }

    /// Runs `f` with exclusive access to the tracked state of this texture.
    fn with_state(&self, f: &mut dyn FnMut(&mut ResourceState));

    /// Returns the current layout.
    fn layout(&self) -> vk::ImageLayout {
        let mut layout = vk::ImageLayout::UNDEFINED;
        self.with_state(&mut |state| layout = state.layout);
        layout
    }

    /// Whether the contents were written since the last call to
    /// [`set_updated(false)`](Self::set_updated).
    fn is_updated(&self) -> bool;

    fn set_updated(&self, updated: bool);

    /// Image descriptor for this texture, optionally restricted to one mip level.
    fn descriptor_info(&self, mip_level: Option<u32>) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.sampler(),
            image_view: match mip_level {
                Some(level) => self.mip_view(level),
                None => self.image_view(),
            },
            image_layout: self.layout(),
        }
    }
}

pub type TextureRef = Arc<dyn Texture>;

/// Hashes the identity of `texture` together with its current view, layout and
/// sampler.
///
/// Objects built while an attachment was in one layout are not reused once it has
/// moved to another.
pub(crate) fn hash_texture<H: Hasher>(texture: &TextureRef, state: &mut H) {
    (Arc::as_ptr(texture) as *const () as usize).hash(state);
    texture.kind().hash(state);
    texture.width().hash(state);
    texture.height().hash(state);
    texture.format().hash(state);
    texture.layer_count().hash(state);
    texture.image().hash(state);
    texture.layout().hash(state);
    texture.image_view().hash(state);
    texture.sampler().hash(state);
}

pub(crate) fn hash_textures<H: Hasher>(textures: &[TextureRef], state: &mut H) {
    textures.len().hash(state);
    for texture in textures {
        hash_texture(texture, state);
    }
}

/// [`Texture`] over externally owned handles.
#[derive(Debug)]
pub struct TextureView {
    kind: TextureKind,
    extent: vk::Extent2D,
    format: vk::Format,
    layer_count: u32,
    image: vk::Image,
    view: vk::ImageView,
    mip_views: Vec<vk::ImageView>,
    layer_views: Vec<vk::ImageView>,
    sampler: vk::Sampler,
    state: Mutex<ResourceState>,
    updated: AtomicBool,
}

impl TextureView {
    pub fn new(
        kind: TextureKind,
        extent: vk::Extent2D,
        format: vk::Format,
        image: vk::Image,
        view: vk::ImageView,
        sampler: vk::Sampler,
    ) -> Self {
        Self {
            kind,
            extent,
            format,
            layer_count: if kind == TextureKind::Cube { 6 } else { 1 },
            image,
            view,
            mip_views: Vec::new(),
            layer_views: Vec::new(),
            sampler,
            state: Mutex::new(ResourceState::default()),
            updated: AtomicBool::new(false),
        }
    }

    pub fn with_layer_count(mut self, layer_count: u32) -> Self {
        self.layer_count = layer_count;
        self
    }

    pub fn with_mip_views(mut self, mip_views: Vec<vk::ImageView>) -> Self {
        self.mip_views = mip_views;
        self
    }

    pub fn with_layer_views(mut self, layer_views: Vec<vk::ImageView>) -> Self {
        self.layer_views = layer_views;
        self
    }

    /// Sets the state the image is in before this crate first touches it.
    pub fn with_initial_state(self, state: ResourceState) -> Self {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        self
    }
}

impl Texture for TextureView {
    fn kind(&self) -> TextureKind {
        self.kind
    }
    fn width(&self) -> u32 {
        self.extent.width
    }
    fn height(&self) -> u32 {
        self.extent.height
    }
    fn format(&self) -> vk::Format {
        self.format
    }
    fn layer_count(&self) -> u32 {
        self.layer_count
    }
    fn image(&self) -> vk::Image {
        self.image
    }
    fn image_view(&self) -> vk::ImageView {
        self.view
    }
    fn mip_view(&self, mip_level: u32) -> vk::ImageView {
        self.mip_views
            .get(mip_level as usize)
            .copied()
            .unwrap_or(self.view)
    }
    fn layer_view(&self, layer: u32) -> vk::ImageView {
        self.layer_views
            .get(layer as usize)
            .copied()
            .unwrap_or(self.view)
    }
    fn sampler(&self) -> vk::Sampler {
        self.sampler
    }
    fn with_state(&self, f: &mut dyn FnMut(&mut ResourceState)) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut *state)
    }
    fn is_updated(&self) -> bool {
        self.updated.load(Ordering::Acquire)
    }
    fn set_updated(&self, updated: bool) {
        self.updated.store(updated, Ordering::Release);
    }
}
