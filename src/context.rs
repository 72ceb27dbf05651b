//! The graphics context: object caches and per-frame bookkeeping.
//!
//! [`GraphicsContext`] turns descriptions into long-lived objects. Every `get_*`
//! call fingerprints the description, returns the cached object on a hit and
//! builds it through the backend on a miss. The renderer never tracks object
//! identity itself; it describes what it needs every frame and drops the returned
//! [`Arc`] when done.
//!
//! Cached objects that nobody holds and that have not been requested for a while
//! are evicted by [`clear_unused`](GraphicsContext::clear_unused), which
//! [`tick`](GraphicsContext::tick) runs at most once per sweep interval.
//!
//! ```
//! # use scoria::{Device, GraphicsContext, ContextConfig, backend::headless::HeadlessBackend};
//! # use scoria::sampler::SamplerDescription;
//! let context = GraphicsContext::new(Device::new(HeadlessBackend::new()), ContextConfig::default());
//! let a = context.get_sampler(&SamplerDescription::default()).unwrap();
//! let b = context.get_sampler(&SamplerDescription::default()).unwrap();
//! assert!(std::sync::Arc::ptr_eq(&a, &b));
//! ```

use std::{
    any::Any,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use ash::vk;

use crate::{
    Device, HasDevice,
    cache::TimedCache,
    command::{CommandBuffer, CommandBufferKind},
    config::ContextConfig,
    description::{FrameBufferDescription, PipelineDescription, RenderPassDescription},
    descriptor::BindingSet,
    error::{Error, Result},
    hash::{DescriptionHasher, Fingerprint},
    pipeline::{FrameBuffer, Pipeline, RenderPass},
    sampler::{Sampler, SamplerDescription},
    shader::BindingSchema,
    texture::{TextureRef, hash_texture},
    utils::{Clock, MonotonicClock},
};

#[derive(Default)]
struct Caches {
    pipelines: TimedCache<Fingerprint, Pipeline>,
    render_passes: TimedCache<Fingerprint, RenderPass>,
    frame_buffers: TimedCache<Fingerprint, FrameBuffer>,
    samplers: TimedCache<Fingerprint, Sampler>,
}

impl Caches {
    /// Sweeps pipelines first so the render passes and frame buffers they release
    /// can go in the same pass.
    fn sweep(&mut self, now: u64, idle_threshold: u64) -> usize {
        let pipelines = self.pipelines.sweep(now, idle_threshold);
        let frame_buffers = self.frame_buffers.sweep(now, idle_threshold);
        let render_passes = self.render_passes.sweep(now, idle_threshold);
        let samplers = self.samplers.sweep(now, idle_threshold);
        let total = pipelines + frame_buffers + render_passes + samplers;
        if total > 0 {
            tracing::debug!(
                pipelines,
                frame_buffers,
                render_passes,
                samplers,
                "Evicted unused cache entries"
            );
        }
        total
    }

    /// Evicts every unreferenced entry regardless of when it was last requested.
    fn evict_unreferenced(&mut self) -> usize {
        self.sweep(u64::MAX, 0)
    }
}

/// Number of entries in each cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub pipelines: usize,
    pub render_passes: usize,
    pub frame_buffers: usize,
    pub samplers: usize,
}

type Deferred = Box<dyn Any + Send + Sync>;

pub struct GraphicsContext {
    device: Device,
    config: ContextConfig,
    clock: Arc<dyn Clock>,
    caches: Mutex<Caches>,
    swapchain_images: Mutex<Vec<TextureRef>>,
    current_image: Arc<AtomicUsize>,
    last_sweep: AtomicU64,
    frame_slot: AtomicUsize,
    deferred: Mutex<Vec<Vec<Deferred>>>,
}

impl GraphicsContext {
    pub fn new(device: Device, config: ContextConfig) -> Self {
        Self::with_clock(device, config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(device: Device, config: ContextConfig, clock: Arc<dyn Clock>) -> Self {
        assert!(config.frames_in_flight > 0, "frames_in_flight must be at least 1");
        let now = clock.now_millis();
        let deferred = (0..config.frames_in_flight).map(|_| Vec::new()).collect();
        Self {
            device,
            config,
            clock,
            caches: Mutex::default(),
            swapchain_images: Mutex::default(),
            current_image: Arc::default(),
            last_sweep: AtomicU64::new(now),
            frame_slot: AtomicUsize::new(0),
            deferred: Mutex::new(deferred),
        }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn frames_in_flight(&self) -> usize {
        self.config.frames_in_flight
    }

    /// Current time on the context clock, in milliseconds.
    pub fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    fn caches(&self) -> MutexGuard<'_, Caches> {
        self.caches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cache_stats(&self) -> CacheStats {
        let caches = self.caches();
        CacheStats {
            pipelines: caches.pipelines.len(),
            render_passes: caches.render_passes.len(),
            frame_buffers: caches.frame_buffers.len(),
            samplers: caches.samplers.len(),
        }
    }

    pub fn set_swapchain_images(&self, images: Vec<TextureRef>) {
        *self
            .swapchain_images
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = images;
        self.current_image.store(0, Ordering::Release);
    }

    pub fn swapchain_images(&self) -> Vec<TextureRef> {
        self.swapchain_images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sets the swapchain image the next frame renders into.
    pub fn set_current_image(&self, index: usize) {
        self.current_image.store(index, Ordering::Release);
    }

    pub fn current_image(&self) -> usize {
        self.current_image.load(Ordering::Acquire)
    }

    fn current_swapchain_image(&self) -> Option<TextureRef> {
        let images = self
            .swapchain_images
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if images.is_empty() {
            return None;
        }
        images.get(self.current_image() % images.len()).cloned()
    }

    /// Fingerprint of `desc` as seen by the pipeline cache. Swapchain pipelines also
    /// depend on the current swapchain image.
    pub fn pipeline_fingerprint(&self, desc: &PipelineDescription) -> Fingerprint {
        let mut hasher = DescriptionHasher::new();
        hasher.mix(desc);
        if desc.swapchain_target
            && let Some(image) = self.current_swapchain_image()
        {
            hash_texture(&image, &mut hasher);
        }
        hasher.finish_fingerprint()
    }

    /// Returns the pipeline for `desc`, building it with its render pass and frame
    /// buffers on first use.
    pub fn get_pipeline(&self, desc: &PipelineDescription) -> Result<Arc<Pipeline>> {
        let fingerprint = self.pipeline_fingerprint(desc);
        let now = self.now();
        let swapchain_images = if desc.swapchain_target {
            self.swapchain_images()
        } else {
            Vec::new()
        };
        let mut caches = self.caches();
        if caches.pipelines.touch(fingerprint, now)
            && let Some(entry) = caches.pipelines.find(fingerprint)
        {
            return Ok(entry.asset.clone());
        }

        let (render_pass, frame_buffers) = if desc.is_graphics() {
            let targets = self.frame_buffer_targets(desc, &swapchain_images);
            // Swapchain pipelines build their render pass against the current image.
            let first = if desc.swapchain_target && !targets.is_empty() {
                targets.get(self.current_image() % targets.len())
            } else {
                targets.first()
            };
            let Some(first) = first else {
                tracing::warn!(
                    shader = desc.shader.name(),
                    "Graphics pipeline without render targets"
                );
                return Err(Error::NoRenderTargets(desc.shader.name().to_string()));
            };
            let render_pass = self.render_pass_locked(
                &mut caches,
                RenderPassDescription {
                    attachments: first.0.clone(),
                    clear: desc.clear_targets,
                    swapchain_target: desc.swapchain_target,
                },
                now,
            )?;
            let mut frame_buffers = Vec::with_capacity(targets.len());
            for (attachments, layer) in targets {
                let (width, height) = attachments
                    .first()
                    .map(|t| (t.width(), t.height()))
                    .unwrap_or_default();
                frame_buffers.push(self.frame_buffer_locked(
                    &mut caches,
                    FrameBufferDescription {
                        render_pass: render_pass.clone(),
                        attachments,
                        width,
                        height,
                        layer,
                        screen: desc.swapchain_target,
                    },
                    now,
                )?);
            }
            (Some(render_pass), frame_buffers)
        } else {
            (None, Vec::new())
        };

        let pipeline = Pipeline::new(
            self.device.clone(),
            fingerprint,
            desc.clone(),
            render_pass,
            frame_buffers,
            self.current_image.clone(),
        )?;
        tracing::debug!(pipeline = ?pipeline, "Pipeline created");
        let pipeline = Arc::new(pipeline);
        caches.pipelines.insert(fingerprint, pipeline.clone(), now);
        Ok(pipeline)
    }

    /// Attachment lists and layers of the frame buffers a pipeline renders into.
    fn frame_buffer_targets(
        &self,
        desc: &PipelineDescription,
        swapchain_images: &[TextureRef],
    ) -> Vec<(Vec<TextureRef>, u32)> {
        let with_depth = |mut attachments: Vec<TextureRef>| {
            attachments.extend(desc.depth_attachment().cloned());
            attachments
        };
        if desc.swapchain_target {
            swapchain_images
                .iter()
                .map(|image| {
                    let mut attachments = vec![image.clone()];
                    attachments.extend(desc.color_targets.iter().cloned());
                    (with_depth(attachments), 0)
                })
                .collect()
        } else if let Some(depth_array) = &desc.depth_array_target {
            (0..depth_array.layer_count().max(1))
                .map(|layer| (with_depth(desc.color_targets.clone()), layer))
                .collect()
        } else {
            vec![(with_depth(desc.color_targets.clone()), 0)]
        }
    }

    pub fn get_render_pass(&self, desc: &RenderPassDescription) -> Result<Arc<RenderPass>> {
        let now = self.now();
        let mut caches = self.caches();
        self.render_pass_locked(&mut caches, desc.clone(), now)
    }

    fn render_pass_locked(
        &self,
        caches: &mut Caches,
        desc: RenderPassDescription,
        now: u64,
    ) -> Result<Arc<RenderPass>> {
        let fingerprint = Fingerprint::of(&desc);
        caches
            .render_passes
            .get_or_try_insert_with(fingerprint, now, || {
                RenderPass::new(self.device.clone(), desc)
            })
    }

    pub fn get_frame_buffer(&self, desc: &FrameBufferDescription) -> Result<Arc<FrameBuffer>> {
        let now = self.now();
        let mut caches = self.caches();
        self.frame_buffer_locked(&mut caches, desc.clone(), now)
    }

    fn frame_buffer_locked(
        &self,
        caches: &mut Caches,
        desc: FrameBufferDescription,
        now: u64,
    ) -> Result<Arc<FrameBuffer>> {
        let fingerprint = Fingerprint::of(&desc);
        caches
            .frame_buffers
            .get_or_try_insert_with(fingerprint, now, || {
                FrameBuffer::new(self.device.clone(), desc)
            })
    }

    pub fn get_sampler(&self, desc: &SamplerDescription) -> Result<Arc<Sampler>> {
        let now = self.now();
        let fingerprint = Fingerprint::of(desc);
        self.caches()
            .samplers
            .get_or_try_insert_with(fingerprint, now, || {
                Sampler::new(self.device.clone(), *desc)
            })
    }

    /// Evicts every cached object that only the cache references and that has not
    /// been requested for longer than `idle_threshold_ms`. Returns the number of
    /// evicted objects.
    pub fn clear_unused(&self, idle_threshold_ms: u64) -> usize {
        let now = self.now();
        self.caches().sweep(now, idle_threshold_ms)
    }

    /// Runs [`clear_unused`](Self::clear_unused) with the configured idle threshold
    /// if the sweep interval has elapsed since the last sweep.
    pub fn tick(&self) -> usize {
        let now = self.now();
        let last = self.last_sweep.load(Ordering::Relaxed);
        if now.saturating_sub(last) < self.config.sweep_interval_ms {
            return 0;
        }
        self.last_sweep.store(now, Ordering::Relaxed);
        self.clear_unused(self.config.cache_idle_threshold_ms)
    }

    /// Keeps `item` alive until the current frame slot begins again, when the GPU is
    /// guaranteed to be done with it.
    pub fn defer_release<T: Any + Send + Sync>(&self, item: T) {
        let slot = self.frame_slot.load(Ordering::Acquire);
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner)[slot].push(Box::new(item));
    }

    /// Starts frame slot `slot`, releasing what was deferred the last time it ran.
    /// The caller must have waited for that frame's command buffer.
    pub fn begin_frame(&self, slot: usize) {
        let slot = slot % self.config.frames_in_flight;
        self.frame_slot.store(slot, Ordering::Release);
        let released = std::mem::take(
            &mut self.deferred.lock().unwrap_or_else(PoisonError::into_inner)[slot],
        );
        drop(released);
    }

    /// Waits for the device, then replaces the swapchain images, drops every
    /// unreferenced cached object and flushes every deferred release.
    pub fn resize(&self, images: Vec<TextureRef>) -> Result<()> {
        self.device.wait_idle()?;
        self.set_swapchain_images(images);
        let evicted = self.caches().evict_unreferenced();
        let deferred: Vec<Vec<Deferred>> = self
            .deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter_mut()
            .map(std::mem::take)
            .collect();
        drop(deferred);
        tracing::info!(evicted, "Swapchain resized");
        Ok(())
    }

    pub fn aligned_dynamic_uniform_size(&self, size: vk::DeviceSize) -> vk::DeviceSize {
        self.device.aligned_dynamic_uniform_size(size)
    }

    pub fn create_command_buffer(&self, kind: CommandBufferKind) -> Result<CommandBuffer> {
        CommandBuffer::new_primary(self.device.clone(), kind, self.config.fence_timeout_ns)
    }

    pub fn create_secondary_command_buffer(&self, kind: CommandBufferKind) -> Result<CommandBuffer> {
        CommandBuffer::new_secondary(self.device.clone(), kind)
    }

    /// Creates a binding set with one copy per frame in flight.
    pub fn create_binding_set(&self, schema: &BindingSchema) -> Result<BindingSet> {
        BindingSet::new(self.device.clone(), schema, self.config.frames_in_flight)
    }
}

impl HasDevice for GraphicsContext {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl Drop for GraphicsContext {
    fn drop(&mut self) {
        if let Err(err) = self.device.wait_idle() {
            tracing::error!(%err, "Failed to wait for the device before teardown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::headless::{Call, HeadlessBackend},
        description::{CullMode, DrawType, PolygonMode},
        shader::{ShaderKind, ShaderProgram, ShaderRef},
        texture::{TextureKind, TextureView},
        utils::{AsVkHandle, ManualClock},
    };
    use ash::vk::Handle;
    use std::collections::HashSet;

    fn shader(kind: ShaderKind, name: &str) -> ShaderRef {
        Arc::new(ShaderProgram::new(
            name,
            kind,
            vk::PipelineLayout::from_raw(0x10),
        ))
    }

    fn texture(kind: TextureKind, width: u32, height: u32, raw: u64) -> Arc<TextureView> {
        let format = if kind.is_depth() {
            vk::Format::D32_SFLOAT
        } else {
            vk::Format::B8G8R8A8_UNORM
        };
        Arc::new(TextureView::new(
            kind,
            vk::Extent2D { width, height },
            format,
            vk::Image::from_raw(raw),
            vk::ImageView::from_raw(raw + 1),
            vk::Sampler::null(),
        ))
    }

    fn context(config: ContextConfig) -> (HeadlessBackend, Arc<ManualClock>, GraphicsContext) {
        let backend = HeadlessBackend::new();
        let clock = Arc::new(ManualClock::new(0));
        let context = GraphicsContext::with_clock(Device::new(backend.clone()), config, clock.clone());
        (backend, clock, context)
    }

    fn color_pipeline(target: &TextureRef) -> PipelineDescription {
        PipelineDescription {
            color_targets: vec![target.clone()],
            ..PipelineDescription::new(shader(ShaderKind::Graphics, "forward"))
        }
    }

    #[test]
    fn test_pipeline_cache_is_idempotent() {
        let (backend, _, context) = context(ContextConfig::default());
        let target: TextureRef = texture(TextureKind::Color, 256, 256, 0x100);
        let desc = color_pipeline(&target);

        let a = context.get_pipeline(&desc).unwrap();
        let b = context.get_pipeline(&desc.clone()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.frame_buffers().len(), 1);
        assert!(a.render_pass().is_some());
        assert_eq!(backend.count(|c| matches!(c, Call::CreatePipeline { .. })), 1);
        assert_eq!(backend.count(|c| matches!(c, Call::CreateRenderPass { .. })), 1);
        assert_eq!(backend.count(|c| matches!(c, Call::CreateFrameBuffer { .. })), 1);

        // Naming a pipeline does not make it a different one.
        let named = PipelineDescription {
            debug_name: Some("forward opaque".into()),
            ..desc
        };
        assert!(Arc::ptr_eq(&a, &context.get_pipeline(&named).unwrap()));
        assert_eq!(
            context.cache_stats(),
            CacheStats {
                pipelines: 1,
                render_passes: 1,
                frame_buffers: 1,
                samplers: 0,
            }
        );
    }

    #[test]
    fn test_compute_pipelines_have_no_targets() {
        let (backend, _, context) = context(ContextConfig::default());
        let desc = PipelineDescription::new(shader(ShaderKind::Compute, "cull"));
        let pipeline = context.get_pipeline(&desc).unwrap();
        assert!(pipeline.render_pass().is_none());
        assert!(pipeline.frame_buffers().is_empty());
        assert_eq!(pipeline.bind_point(), vk::PipelineBindPoint::COMPUTE);
        assert_eq!(backend.count(|c| matches!(c, Call::CreateRenderPass { .. })), 0);
    }

    #[test]
    fn test_graphics_pipeline_needs_a_target() {
        let (backend, _, context) = context(ContextConfig::default());
        let desc = PipelineDescription::new(shader(ShaderKind::Graphics, "orphan"));
        assert!(matches!(
            context.get_pipeline(&desc),
            Err(Error::NoRenderTargets(name)) if name == "orphan"
        ));
        assert_eq!(backend.count(|c| matches!(c, Call::CreatePipeline { .. })), 0);
        assert_eq!(context.cache_stats(), CacheStats::default());
    }

    #[test]
    fn test_distinct_descriptions_do_not_collide() {
        let (_, _, context) = context(ContextConfig::default());
        let target: TextureRef = texture(TextureKind::Color, 256, 256, 0x100);
        let base = color_pipeline(&target);

        let mut fingerprints = HashSet::new();
        let mut count = 0;
        for cull_mode in [CullMode::None, CullMode::Front, CullMode::Back, CullMode::FrontAndBack] {
            for polygon_mode in [PolygonMode::Fill, PolygonMode::Line, PolygonMode::Point] {
                for draw_type in [
                    DrawType::Triangles,
                    DrawType::TriangleStrip,
                    DrawType::Lines,
                    DrawType::Points,
                ] {
                    for bits in 0..16u32 {
                        let desc = PipelineDescription {
                            cull_mode,
                            polygon_mode,
                            draw_type,
                            depth_test: bits & 1 != 0,
                            depth_write: bits & 2 != 0,
                            depth_bias: bits & 4 != 0,
                            clear_targets: bits & 8 != 0,
                            ..base.clone()
                        };
                        fingerprints.insert(context.pipeline_fingerprint(&desc));
                        count += 1;
                    }
                }
            }
        }
        assert_eq!(count, 768);
        assert_eq!(fingerprints.len(), count);

        // Blend factors only matter with transparency on.
        let opaque = PipelineDescription {
            blend_src: vk::BlendFactor::ONE,
            ..base.clone()
        };
        assert_eq!(
            context.pipeline_fingerprint(&opaque),
            context.pipeline_fingerprint(&base)
        );
        let blended = |blend_src| PipelineDescription {
            transparency: true,
            blend_src,
            ..base.clone()
        };
        assert_ne!(
            context.pipeline_fingerprint(&blended(vk::BlendFactor::ONE)),
            context.pipeline_fingerprint(&blended(vk::BlendFactor::SRC_ALPHA))
        );

        // Same shader name, different shader object.
        let other_shader = PipelineDescription {
            shader: shader(ShaderKind::Graphics, "forward"),
            ..base.clone()
        };
        assert_ne!(
            context.pipeline_fingerprint(&other_shader),
            context.pipeline_fingerprint(&base)
        );
    }

    #[test]
    fn test_eviction_requires_idle_and_unreferenced() {
        let (backend, clock, context) = context(ContextConfig::default());
        let target: TextureRef = texture(TextureKind::Color, 256, 256, 0x100);
        let desc = color_pipeline(&target);
        let pipeline = context.get_pipeline(&desc).unwrap();

        clock.advance(20_000);
        assert_eq!(context.clear_unused(12_000), 0);
        assert_eq!(context.cache_stats().pipelines, 1);

        drop(pipeline);
        // Requesting it again refreshes its timestamp.
        drop(context.get_pipeline(&desc).unwrap());
        clock.advance(5_000);
        assert_eq!(context.clear_unused(12_000), 0);

        // The pipeline releases its render pass and frame buffer in the same sweep.
        clock.advance(10_000);
        assert_eq!(context.clear_unused(12_000), 3);
        assert_eq!(context.cache_stats(), CacheStats::default());
        assert_eq!(backend.live_objects(), 0);
    }

    #[test]
    fn test_swapchain_pipeline_renders_into_every_image() {
        let (backend, _, context) = context(ContextConfig::default());
        let images: Vec<TextureRef> = (0..3)
            .map(|i| texture(TextureKind::Color, 800, 600, 0x1000 + i * 0x10) as TextureRef)
            .collect();
        let depth: TextureRef = texture(TextureKind::Depth, 800, 600, 0x2000);
        context.set_swapchain_images(images.clone());

        let desc = PipelineDescription {
            swapchain_target: true,
            depth_target: Some(depth.clone()),
            clear_targets: true,
            ..PipelineDescription::new(shader(ShaderKind::Graphics, "present"))
        };
        let pipeline = context.get_pipeline(&desc).unwrap();
        assert_eq!(pipeline.frame_buffers().len(), 3);
        for (frame_buffer, image) in pipeline.frame_buffers().iter().zip(&images) {
            assert_eq!(
                frame_buffer.extent(),
                vk::Extent2D {
                    width: 800,
                    height: 600
                }
            );
            assert!(Arc::ptr_eq(&frame_buffer.attachments()[0], image));
            assert!(Arc::ptr_eq(&frame_buffer.attachments()[1], &depth));
        }
        assert_eq!(backend.count(|c| matches!(c, Call::CreatePipeline { .. })), 1);
        assert_eq!(backend.count(|c| matches!(c, Call::CreateFrameBuffer { .. })), 3);
        assert_eq!(backend.count(|c| matches!(c, Call::CreateRenderPass { .. })), 1);

        backend.clear_calls();
        assert!(Arc::ptr_eq(&pipeline, &context.get_pipeline(&desc).unwrap()));
        assert!(backend.calls().is_empty());

        // The next image gets its own pipeline, bound to that image.
        context.set_current_image(1);
        let next = context.get_pipeline(&desc).unwrap();
        assert!(!Arc::ptr_eq(&pipeline, &next));
        let frame_buffer = next.frame_buffer(0).unwrap();
        assert!(Arc::ptr_eq(&frame_buffer.attachments()[0], &images[1]));
    }

    #[test]
    fn test_layered_depth_gets_a_frame_buffer_per_layer() {
        let (_, _, context) = context(ContextConfig::default());
        let cascades: TextureRef = Arc::new(
            TextureView::new(
                TextureKind::DepthArray,
                vk::Extent2D {
                    width: 1024,
                    height: 1024,
                },
                vk::Format::D32_SFLOAT,
                vk::Image::from_raw(0x300),
                vk::ImageView::from_raw(0x301),
                vk::Sampler::null(),
            )
            .with_layer_count(4),
        );
        let desc = PipelineDescription {
            depth_array_target: Some(cascades),
            ..PipelineDescription::new(shader(ShaderKind::Graphics, "shadow"))
        };
        let pipeline = context.get_pipeline(&desc).unwrap();
        let layers: Vec<u32> = pipeline.frame_buffers().iter().map(|f| f.layer()).collect();
        assert_eq!(layers, vec![0, 1, 2, 3]);
        assert_eq!(pipeline.frame_buffer(2).unwrap().layer(), 2);
        assert_eq!(pipeline.frame_buffer(9).unwrap().layer(), 3);
    }

    #[test]
    fn test_binding_a_pipeline_opens_its_render_pass() {
        let (backend, _, context) = context(ContextConfig::default());
        let images: Vec<TextureRef> = vec![texture(TextureKind::Color, 800, 600, 0x1000)];
        context.set_swapchain_images(images.clone());
        let desc = PipelineDescription {
            swapchain_target: true,
            ..PipelineDescription::new(shader(ShaderKind::Graphics, "present"))
        };
        let pipeline = context.get_pipeline(&desc).unwrap();
        let compute = context
            .get_pipeline(&PipelineDescription::new(shader(ShaderKind::Compute, "post")))
            .unwrap();

        let mut cmd = context.create_command_buffer(CommandBufferKind::Graphics).unwrap();
        cmd.begin_recording().unwrap();
        backend.clear_calls();
        cmd.bind_pipeline(&pipeline).unwrap();
        cmd.bind_pipeline(&pipeline).unwrap();
        assert_eq!(backend.count(|c| matches!(c, Call::BeginRenderPass { .. })), 1);
        assert_eq!(backend.count(|c| matches!(c, Call::BindPipeline { .. })), 1);
        assert_eq!(images[0].layout(), vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

        // Switching to a compute pipeline closes the render pass.
        cmd.bind_pipeline(&compute).unwrap();
        assert_eq!(backend.count(|c| matches!(c, Call::EndRenderPass(_))), 1);
        assert_eq!(images[0].layout(), vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(backend.count(|c| matches!(c, Call::BeginRenderPass { .. })), 1);

        cmd.end_recording().unwrap();
        assert_eq!(backend.count(|c| matches!(c, Call::EndRenderPass(_))), 1);
    }

    #[test]
    fn test_switching_graphics_pipelines_closes_the_previous_pass() {
        let (backend, _, context) = context(ContextConfig::default());
        let target: TextureRef = texture(TextureKind::Color, 256, 256, 0x100);
        let opaque = context.get_pipeline(&color_pipeline(&target)).unwrap();
        let decals = context
            .get_pipeline(&PipelineDescription {
                color_targets: vec![target.clone()],
                ..PipelineDescription::new(shader(ShaderKind::Graphics, "decals"))
            })
            .unwrap();
        assert!(!Arc::ptr_eq(&opaque, &decals));

        let mut cmd = context.create_command_buffer(CommandBufferKind::Graphics).unwrap();
        cmd.begin_recording().unwrap();
        backend.clear_calls();
        cmd.bind_pipeline(&opaque).unwrap();
        cmd.bind_pipeline(&decals).unwrap();

        let render_pass = decals.render_pass().unwrap().vk_handle();
        let frame_buffer = decals.frame_buffer(0).unwrap().vk_handle();
        let scopes: Vec<Call> = backend
            .calls()
            .into_iter()
            .filter(|c| {
                matches!(
                    c,
                    Call::BeginRenderPass { .. } | Call::EndRenderPass(_) | Call::BindPipeline { .. }
                )
            })
            .collect();
        let begin = Call::BeginRenderPass {
            command_buffer: cmd.vk_handle(),
            render_pass,
            frame_buffer,
            contents: vk::SubpassContents::INLINE,
        };
        let bind = |pipeline: &Arc<Pipeline>| Call::BindPipeline {
            command_buffer: cmd.vk_handle(),
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            pipeline: pipeline.vk_handle(),
        };
        assert_eq!(
            scopes,
            vec![
                begin.clone(),
                bind(&opaque),
                Call::EndRenderPass(cmd.vk_handle()),
                begin,
                bind(&decals),
            ]
        );

        // Rebinding the bound pipeline records nothing.
        backend.clear_calls();
        cmd.bind_pipeline(&decals).unwrap();
        assert!(backend.calls().is_empty());
        assert!(Arc::ptr_eq(cmd.bound_pipeline().unwrap(), &decals));
        cmd.end_recording().unwrap();
    }

    #[test]
    fn test_layout_change_builds_new_targets() {
        let (backend, _, context) = context(ContextConfig::default());
        let target: TextureRef = texture(TextureKind::Color, 256, 256, 0x100);
        let desc = color_pipeline(&target);
        let before = context.get_pipeline(&desc).unwrap();

        target.with_state(&mut |state| state.layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        let after = context.get_pipeline(&desc).unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(backend.count(|c| matches!(c, Call::CreateRenderPass { .. })), 2);
        assert_eq!(backend.count(|c| matches!(c, Call::CreateFrameBuffer { .. })), 2);
        assert!(Arc::ptr_eq(&after, &context.get_pipeline(&desc).unwrap()));
    }

    #[test]
    fn test_named_pipelines_are_labelled() {
        let (backend, _, context) = context(ContextConfig::default());
        let target: TextureRef = texture(TextureKind::Color, 256, 256, 0x100);
        let pipeline = context
            .get_pipeline(&PipelineDescription {
                debug_name: Some("forward opaque".into()),
                ..color_pipeline(&target)
            })
            .unwrap();
        assert!(backend.calls().contains(&Call::SetObjectName {
            object_type: vk::ObjectType::PIPELINE,
            handle: pipeline.vk_handle().as_raw(),
            name: "forward opaque".into(),
        }));
    }

    #[test]
    fn test_samplers_are_shared_by_description() {
        let (backend, _, context) = context(ContextConfig::default());
        let linear = SamplerDescription::default();
        let a = context.get_sampler(&linear).unwrap();
        let b = context.get_sampler(&linear).unwrap();
        let nearest = context.get_sampler(&SamplerDescription::NEAREST_CLAMP).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &nearest));
        assert_eq!(backend.count(|c| matches!(c, Call::CreateSampler(_))), 2);
    }

    #[test]
    fn test_tick_respects_the_sweep_interval() {
        let (_, clock, context) = context(ContextConfig {
            cache_idle_threshold_ms: 12_000,
            sweep_interval_ms: 1_000,
            ..ContextConfig::default()
        });
        drop(context.get_sampler(&SamplerDescription::default()).unwrap());

        clock.advance(500);
        assert_eq!(context.tick(), 0);
        clock.advance(13_000);
        assert_eq!(context.tick(), 1);
        assert_eq!(context.cache_stats().samplers, 0);

        drop(context.get_sampler(&SamplerDescription::default()).unwrap());
        clock.advance(500);
        assert_eq!(context.tick(), 0);
    }

    #[test]
    fn test_deferred_releases_wait_for_their_slot() {
        let (_, _, context) = context(ContextConfig::default().with_frames_in_flight(2));
        let marker = Arc::new(());
        context.begin_frame(0);
        context.defer_release(marker.clone());

        context.begin_frame(1);
        assert_eq!(Arc::strong_count(&marker), 2);
        context.begin_frame(2);
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn test_resize_flushes_everything() {
        let (backend, _, context) = context(ContextConfig::default());
        let old: Vec<TextureRef> = vec![texture(TextureKind::Color, 800, 600, 0x1000)];
        context.set_swapchain_images(old);
        context.set_current_image(0);
        let desc = PipelineDescription {
            swapchain_target: true,
            ..PipelineDescription::new(shader(ShaderKind::Graphics, "present"))
        };
        drop(context.get_pipeline(&desc).unwrap());
        let marker = Arc::new(());
        context.defer_release(marker.clone());

        let new: Vec<TextureRef> = vec![
            texture(TextureKind::Color, 1920, 1080, 0x4000),
            texture(TextureKind::Color, 1920, 1080, 0x4010),
        ];
        backend.clear_calls();
        context.resize(new).unwrap();
        assert_eq!(backend.count(|c| matches!(c, Call::WaitIdle)), 1);
        assert_eq!(context.cache_stats(), CacheStats::default());
        assert_eq!(Arc::strong_count(&marker), 1);
        assert_eq!(context.current_image(), 0);

        let pipeline = context.get_pipeline(&desc).unwrap();
        assert_eq!(pipeline.frame_buffers().len(), 2);
        assert_eq!(pipeline.frame_buffers()[0].extent().width, 1920);
    }

    #[test]
    fn test_binding_sets_follow_frames_in_flight() {
        let (_, _, context) = context(ContextConfig::default().with_frames_in_flight(2));
        let schema = BindingSchema {
            set: 1,
            layout: vk::DescriptorSetLayout::from_raw(0x50),
            descriptors: Vec::new(),
        };
        let set = context.create_binding_set(&schema).unwrap();
        assert_eq!(set.frames_in_flight(), 2);
        assert_eq!(set.set_index(), 1);
    }
}
