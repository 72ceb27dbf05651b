//! # Command Recording
//!
//! A [`CommandBuffer`] wraps one API command buffer and the fence that tracks its
//! execution. Buffers are created once per frame slot and reused: every frame the
//! same buffer goes through
//!
//! ```text
//! Idle -> Recording -> Ended -> Submitted -> Idle
//!  |        begin        end      submit    wait
//! ```
//!
//! and every operation checks that it is called from a state that allows it.
//! Illegal calls never reach the device. They are logged and return
//! [`Error::InvalidState`].
//!
//! During recording the buffer is also responsible for:
//! - Synchronization. Resource transitions requested through
//!   [`transition_image`](CommandBuffer::transition_image) and
//!   [`memory_barrier`](CommandBuffer::memory_barrier) are batched and emitted as a
//!   single barrier right before they are needed.
//! - Resource lifetimes. Pipelines, secondary buffers and anything passed to
//!   [`retain`](CommandBuffer::retain) are kept alive until the GPU is done with
//!   them, that is until the next [`wait`](CommandBuffer::wait).
//! - Render scopes. Binding a graphics pipeline opens its render pass, which stays
//!   open until another pipeline is bound, the pipeline is unbound or recording ends.
//!
//! ## Example Usage
//!
//! ```
//! # use scoria::{Device, backend::headless::HeadlessBackend};
//! # use scoria::command::{CommandBuffer, CommandBufferKind, CommandBufferState};
//! let device = Device::new(HeadlessBackend::new());
//! let mut cmd = CommandBuffer::new_primary(device, CommandBufferKind::Graphics, u64::MAX).unwrap();
//!
//! // Submitting before anything was recorded is rejected.
//! assert!(cmd.submit().is_err());
//!
//! cmd.begin_recording().unwrap();
//! cmd.end_recording().unwrap();
//! cmd.submit().unwrap();
//! cmd.wait().unwrap();
//! assert_eq!(cmd.state(), CommandBufferState::Idle);
//! ```

use std::{any::Any, fmt::Debug, sync::Arc};

use ash::vk;

use crate::{
    Device, HasDevice,
    backend::Inheritance,
    error::{Error, Result},
    pipeline::{FrameBuffer, Pipeline},
    texture::Texture,
    tracking::{Access, MemoryBarrier},
    utils::AsVkHandle,
};

/// Lifecycle of a [`CommandBuffer`].
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum CommandBufferState {
    /// Nothing recorded. Ready to begin.
    Idle,

    /// Currently being recorded with commands.
    Recording,

    /// Recording finished, ready for submission or for execution by a primary buffer.
    Ended,

    /// Submitted to a queue. The fence signals when execution completes.
    Submitted,
}

/// The queue a command buffer is submitted to.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum CommandBufferKind {
    Graphics,
    Compute,
    RayTracing,
}

/// Deferred work run at the start of the next recording.
pub type Task = Box<dyn FnOnce(&mut CommandBuffer) -> Result<()> + Send>;

struct BoundPipeline {
    pipeline: Arc<Pipeline>,
    layer: u32,
    frame_buffer: Option<Arc<FrameBuffer>>,
}

pub struct CommandBuffer {
    device: Device,
    handle: vk::CommandBuffer,
    kind: CommandBufferKind,
    primary: bool,
    state: CommandBufferState,
    /// Only primary buffers are submitted, so only they own a fence.
    fence: Option<vk::Fence>,
    fence_timeout_ns: u64,
    tasks: Vec<Task>,
    bound: Option<BoundPipeline>,

    /// Accumulated global memory barrier emitted with the next barrier batch.
    pending_memory_barrier: MemoryBarrier,
    /// Accumulated image barriers emitted with the next barrier batch.
    pending_image_barriers: Vec<vk::ImageMemoryBarrier2<'static>>,

    /// Secondary buffers executed by this one, released on completion.
    secondaries: Vec<Arc<CommandBuffer>>,
    /// Objects that must outlive the GPU work recorded so far.
    retained: Vec<Box<dyn Any + Send + Sync>>,
}
// SAFETY: the pending image barriers never carry a `p_next` chain.
unsafe impl Send for CommandBuffer {}
unsafe impl Sync for CommandBuffer {}

impl CommandBuffer {
    pub fn new_primary(device: Device, kind: CommandBufferKind, fence_timeout_ns: u64) -> Result<Self> {
        let handle = device.allocate_command_buffer(kind, vk::CommandBufferLevel::PRIMARY)?;
        let fence = match device.create_fence() {
            Ok(fence) => fence,
            Err(err) => {
                device.free_command_buffer(kind, handle);
                return Err(err.into());
            }
        };
        Ok(Self::from_raw(device, handle, kind, true, Some(fence), fence_timeout_ns))
    }

    pub fn new_secondary(device: Device, kind: CommandBufferKind) -> Result<Self> {
        let handle = device.allocate_command_buffer(kind, vk::CommandBufferLevel::SECONDARY)?;
        Ok(Self::from_raw(device, handle, kind, false, None, u64::MAX))
    }

    fn from_raw(
        device: Device,
        handle: vk::CommandBuffer,
        kind: CommandBufferKind,
        primary: bool,
        fence: Option<vk::Fence>,
        fence_timeout_ns: u64,
    ) -> Self {
        Self {
            device,
            handle,
            kind,
            primary,
            state: CommandBufferState::Idle,
            fence,
            fence_timeout_ns,
            tasks: Vec::new(),
            bound: None,
            pending_memory_barrier: MemoryBarrier::default(),
            pending_image_barriers: Vec::new(),
            secondaries: Vec::new(),
            retained: Vec::new(),
        }
    }

    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    pub fn kind(&self) -> CommandBufferKind {
        self.kind
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    /// The pipeline whose render scope is currently open.
    pub fn bound_pipeline(&self) -> Option<&Arc<Pipeline>> {
        self.bound.as_ref().map(|b| &b.pipeline)
    }

    /// Number of tasks waiting for the next [`begin_recording`](Self::begin_recording).
    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    fn expect_state(&self, operation: &'static str, expected: CommandBufferState) -> Result<()> {
        if self.state != expected {
            tracing::error!(
                command_buffer = ?self.handle,
                operation,
                state = ?self.state,
                "Illegal command buffer transition"
            );
            return Err(Error::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    fn expect_primary(&self, operation: &'static str) -> Result<()> {
        if !self.primary {
            tracing::error!(command_buffer = ?self.handle, operation, "Not a primary command buffer");
            return Err(Error::NotPrimary(operation));
        }
        Ok(())
    }

    /// Queues `task` to run right after the next [`begin_recording`](Self::begin_recording).
    pub fn add_task(&mut self, task: impl FnOnce(&mut CommandBuffer) -> Result<()> + Send + 'static) {
        self.tasks.push(Box::new(task));
    }

    /// Begins recording a primary buffer and runs the queued tasks in the order they
    /// were added. If a task fails, the remaining ones are discarded and the error is
    /// returned with the buffer left `Recording`.
    pub fn begin_recording(&mut self) -> Result<()> {
        self.expect_primary("begin_recording")?;
        self.expect_state("begin_recording", CommandBufferState::Idle)?;
        self.device.begin_command_buffer(self.handle, None)?;
        self.state = CommandBufferState::Recording;

        let tasks = std::mem::take(&mut self.tasks);
        for task in tasks {
            task(self)?;
        }
        Ok(())
    }

    /// Begins recording a secondary buffer, optionally continuing a render pass.
    pub fn begin_recording_secondary(&mut self, inheritance: Option<Inheritance>) -> Result<()> {
        if self.primary {
            tracing::error!(command_buffer = ?self.handle, "Not a secondary command buffer");
            return Err(Error::NotSecondary("begin_recording_secondary"));
        }
        self.expect_state("begin_recording_secondary", CommandBufferState::Idle)?;
        self.device.begin_command_buffer(self.handle, inheritance)?;
        self.state = CommandBufferState::Recording;
        Ok(())
    }

    /// Returns an ended secondary buffer to `Idle` so it can be recorded again.
    pub fn reset_secondary(&mut self) -> Result<()> {
        if self.primary {
            return Err(Error::NotSecondary("reset_secondary"));
        }
        self.expect_state("reset_secondary", CommandBufferState::Ended)?;
        self.retained.clear();
        self.state = CommandBufferState::Idle;
        Ok(())
    }

    /// Binds `pipeline`, opening its render scope at layer 0 with inline contents.
    pub fn bind_pipeline(&mut self, pipeline: &Arc<Pipeline>) -> Result<()> {
        self.bind_pipeline_with(pipeline, 0, vk::SubpassContents::INLINE)
    }

    /// Binds `pipeline`, rendering into `layer` of a layered depth target.
    ///
    /// The render scope of a different bound pipeline is closed first. Binding the
    /// pipeline that is already bound at the same layer does nothing. Use
    /// `SECONDARY_COMMAND_BUFFERS` contents when the scope will be filled by
    /// [`execute_secondary`](Self::execute_secondary).
    pub fn bind_pipeline_with(
        &mut self,
        pipeline: &Arc<Pipeline>,
        layer: u32,
        contents: vk::SubpassContents,
    ) -> Result<()> {
        self.expect_state("bind_pipeline", CommandBufferState::Recording)?;
        if let Some(bound) = &self.bound
            && Arc::ptr_eq(&bound.pipeline, pipeline)
            && bound.layer == layer
        {
            return Ok(());
        }
        self.end_bound_pipeline();

        let frame_buffer = if self.primary {
            pipeline.bind(self, layer, contents)?
        } else {
            // Secondaries continue the render pass they inherited.
            self.device
                .cmd_bind_pipeline(self.handle, pipeline.bind_point(), pipeline.vk_handle());
            None
        };
        self.retain(pipeline.clone());
        self.bound = Some(BoundPipeline {
            pipeline: pipeline.clone(),
            layer,
            frame_buffer,
        });
        Ok(())
    }

    /// Closes the render scope of the bound pipeline, if any.
    pub fn unbind_pipeline(&mut self) -> Result<()> {
        self.expect_state("unbind_pipeline", CommandBufferState::Recording)?;
        self.end_bound_pipeline();
        Ok(())
    }

    fn end_bound_pipeline(&mut self) {
        if let Some(bound) = self.bound.take()
            && self.primary
        {
            bound.pipeline.end(self, bound.frame_buffer.as_deref());
        }
    }

    /// Closes a still-open render scope, emits pending barriers and ends recording.
    pub fn end_recording(&mut self) -> Result<()> {
        self.expect_state("end_recording", CommandBufferState::Recording)?;
        self.end_bound_pipeline();
        self.emit_barriers()?;
        self.device.end_command_buffer(self.handle)?;
        self.state = CommandBufferState::Ended;
        Ok(())
    }

    /// Submits an ended primary buffer. Its fence signals on completion.
    pub fn submit(&mut self) -> Result<()> {
        self.expect_primary("submit")?;
        self.expect_state("submit", CommandBufferState::Ended)?;
        let Some(fence) = self.fence else {
            return Err(Error::NotPrimary("submit"));
        };
        self.device.queue_submit(self.kind, self.handle, fence)?;
        self.state = CommandBufferState::Submitted;
        Ok(())
    }

    /// Blocks until a submitted buffer completes, then releases everything it
    /// retained and returns to `Idle`.
    pub fn wait(&mut self) -> Result<()> {
        self.expect_state("wait", CommandBufferState::Submitted)?;
        let Some(fence) = self.fence else {
            return Err(Error::NotPrimary("wait"));
        };
        self.device.wait_for_fence(fence, self.fence_timeout_ns)?;
        self.device.reset_fence(fence)?;
        self.state = CommandBufferState::Idle;
        self.secondaries.clear();
        self.retained.clear();
        Ok(())
    }

    /// Waits for a submitted buffer. Does nothing on an idle one.
    pub fn flush(&mut self) -> Result<()> {
        match self.state {
            CommandBufferState::Idle => Ok(()),
            CommandBufferState::Submitted => self.wait(),
            state => {
                tracing::error!(command_buffer = ?self.handle, ?state, "Flushing a command buffer that was never submitted");
                Err(Error::InvalidState {
                    operation: "flush",
                    state,
                })
            }
        }
    }

    /// Ends, submits and waits for the work recorded so far, then begins recording
    /// again. Blocks the calling thread.
    pub fn submit_and_rerecord(&mut self) -> Result<()> {
        self.expect_primary("submit_and_rerecord")?;
        self.expect_state("submit_and_rerecord", CommandBufferState::Recording)?;
        self.end_recording()?;
        self.submit()?;
        self.wait()?;
        self.begin_recording()
    }

    /// Records an ended secondary buffer into this one and keeps it alive until
    /// this buffer completes.
    pub fn execute_secondary(&mut self, secondary: Arc<CommandBuffer>) -> Result<()> {
        self.expect_primary("execute_secondary")?;
        self.expect_state("execute_secondary", CommandBufferState::Recording)?;
        if secondary.primary {
            tracing::error!(command_buffer = ?secondary.handle, "Executing a primary command buffer");
            return Err(Error::NotSecondary("execute_secondary"));
        }
        if secondary.state != CommandBufferState::Ended {
            tracing::error!(
                command_buffer = ?secondary.handle,
                state = ?secondary.state,
                "Executing a secondary command buffer that has not ended"
            );
            return Err(Error::InvalidState {
                operation: "execute_secondary",
                state: secondary.state,
            });
        }
        self.emit_barriers()?;
        self.device
            .cmd_execute_commands(self.handle, &[secondary.handle]);
        self.secondaries.push(secondary);
        Ok(())
    }

    /// Keeps `item` alive until the work recorded so far has completed.
    pub fn retain<T: Any + Send + Sync>(&mut self, item: T) {
        self.retained.push(Box::new(item));
    }

    /// Adds a global memory barrier to the pending batch.
    ///
    /// - `before`: access that must complete first
    /// - `after`: access that waits for it
    pub fn memory_barrier(&mut self, before: Access, after: Access) {
        self.pending_memory_barrier |= MemoryBarrier {
            src: before,
            dst: after,
        };
    }

    /// Transitions `texture` for `access` in `layout`, adding the barrier it needs
    /// to the pending batch. Nothing is recorded for a texture already in that
    /// state.
    pub fn transition_image(
        &mut self,
        texture: &dyn Texture,
        access: Access,
        layout: vk::ImageLayout,
    ) -> Result<()> {
        self.expect_state("transition_image", CommandBufferState::Recording)?;
        let mut barrier = MemoryBarrier::default();
        let mut old_layout = vk::ImageLayout::UNDEFINED;
        texture.with_state(&mut |state| {
            old_layout = state.layout;
            barrier = state.transition(access, old_layout != layout);
            state.layout = layout;
        });
        if old_layout != layout {
            self.pending_image_barriers.push(vk::ImageMemoryBarrier2 {
                src_stage_mask: barrier.src.stage,
                src_access_mask: barrier.src.access,
                dst_stage_mask: barrier.dst.stage,
                dst_access_mask: barrier.dst.access,
                old_layout,
                new_layout: layout,
                image: texture.image(),
                subresource_range: vk::ImageSubresourceRange {
                    aspect_mask: texture.aspects(),
                    base_mip_level: 0,
                    level_count: vk::REMAINING_MIP_LEVELS,
                    base_array_layer: 0,
                    layer_count: vk::REMAINING_ARRAY_LAYERS,
                },
                ..Default::default()
            });
        } else if !barrier.is_empty() {
            self.pending_memory_barrier |= barrier;
        }
        Ok(())
    }

    pub fn has_pending_barriers(&self) -> bool {
        !self.pending_memory_barrier.is_empty() || !self.pending_image_barriers.is_empty()
    }

    /// Records every pending barrier in a single barrier call.
    pub fn emit_barriers(&mut self) -> Result<()> {
        self.expect_state("emit_barriers", CommandBufferState::Recording)?;
        if !self.has_pending_barriers() {
            return Ok(());
        }
        let memory_barrier = std::mem::take(&mut self.pending_memory_barrier);
        let memory_barriers = [vk::MemoryBarrier2 {
            src_stage_mask: memory_barrier.src.stage,
            src_access_mask: memory_barrier.src.access,
            dst_stage_mask: memory_barrier.dst.stage,
            dst_access_mask: memory_barrier.dst.access,
            ..Default::default()
        }];
        let memory_barriers: &[vk::MemoryBarrier2] = if memory_barrier.is_empty() {
            &[]
        } else {
            &memory_barriers
        };
        self.device.cmd_pipeline_barrier(
            self.handle,
            &vk::DependencyInfo::default()
                .memory_barriers(memory_barriers)
                .image_memory_barriers(&self.pending_image_barriers),
        );
        self.pending_image_barriers.clear();
        Ok(())
    }
}

impl Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("primary", &self.primary)
            .field("state", &self.state)
            .finish()
    }
}
impl AsVkHandle for CommandBuffer {
    type Handle = vk::CommandBuffer;

    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}
impl HasDevice for CommandBuffer {
    fn device(&self) -> &Device {
        &self.device
    }
}
impl Drop for CommandBuffer {
    fn drop(&mut self) {
        match self.state {
            CommandBufferState::Submitted => {
                tracing::warn!(
                    "Dropping CommandBuffer {:?} before it was waited on, waiting now",
                    self.handle
                );
                if let Err(err) = self.wait() {
                    tracing::error!(command_buffer = ?self.handle, %err, "Failed to wait for command buffer");
                    if let Err(err) = self.device.wait_idle() {
                        tracing::error!(
                            command_buffer = ?self.handle,
                            %err,
                            "Failed to wait for the device, releasing a command buffer that may still be executing"
                        );
                    }
                }
            }
            CommandBufferState::Recording => {
                tracing::warn!("Dropping CommandBuffer {:?} while recording", self.handle);
            }
            _ => (),
        }
        self.bound = None;
        self.secondaries.clear();
        self.retained.clear();
        self.device.free_command_buffer(self.kind, self.handle);
        if let Some(fence) = self.fence.take() {
            self.device.destroy_fence(fence);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{Call, FailurePoint, HeadlessBackend};
    use std::sync::Mutex;

    fn primary() -> (HeadlessBackend, CommandBuffer) {
        let backend = HeadlessBackend::new();
        let device = Device::new(backend.clone());
        let cmd = CommandBuffer::new_primary(device, CommandBufferKind::Graphics, u64::MAX).unwrap();
        (backend, cmd)
    }

    #[test]
    fn test_full_cycle() {
        let (backend, mut cmd) = primary();
        cmd.begin_recording().unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Recording);
        cmd.end_recording().unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Ended);
        cmd.submit().unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Submitted);
        cmd.wait().unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Idle);

        assert_eq!(backend.count(|c| matches!(c, Call::QueueSubmit { .. })), 1);
        assert_eq!(backend.count(|c| matches!(c, Call::WaitForFence(_))), 1);
        assert_eq!(backend.count(|c| matches!(c, Call::ResetFence(_))), 1);
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        let (backend, mut cmd) = primary();
        let calls_before = backend.calls().len();

        assert!(matches!(
            cmd.submit(),
            Err(Error::InvalidState {
                operation: "submit",
                state: CommandBufferState::Idle
            })
        ));
        assert!(cmd.end_recording().is_err());
        assert!(cmd.wait().is_err());
        assert!(cmd.unbind_pipeline().is_err());
        // Nothing reached the device.
        assert_eq!(backend.calls().len(), calls_before);
        assert_eq!(cmd.state(), CommandBufferState::Idle);

        cmd.begin_recording().unwrap();
        assert!(cmd.begin_recording().is_err());
        assert!(cmd.submit().is_err());
        cmd.end_recording().unwrap();
        assert!(cmd.end_recording().is_err());
        cmd.submit().unwrap();
        assert!(cmd.submit().is_err());
        assert!(cmd.begin_recording().is_err());
        cmd.wait().unwrap();
    }

    #[test]
    fn test_tasks_run_once_in_order() {
        let (_backend, mut cmd) = primary();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            cmd.add_task(move |cmd| {
                assert_eq!(cmd.state(), CommandBufferState::Recording);
                order.lock().unwrap().push(i);
                Ok(())
            });
        }
        assert_eq!(cmd.pending_tasks(), 3);
        cmd.begin_recording().unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(cmd.pending_tasks(), 0);

        cmd.end_recording().unwrap();
        cmd.submit().unwrap();
        cmd.wait().unwrap();
        cmd.begin_recording().unwrap();
        assert_eq!(order.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_primary_only_operations() {
        let backend = HeadlessBackend::new();
        let device = Device::new(backend);
        let mut secondary = CommandBuffer::new_secondary(device, CommandBufferKind::Graphics).unwrap();
        assert!(matches!(
            secondary.begin_recording(),
            Err(Error::NotPrimary("begin_recording"))
        ));
        secondary.begin_recording_secondary(None).unwrap();
        secondary.end_recording().unwrap();
        assert!(matches!(secondary.submit(), Err(Error::NotPrimary("submit"))));
        secondary.reset_secondary().unwrap();
        assert_eq!(secondary.state(), CommandBufferState::Idle);

        let (_backend, mut cmd) = primary();
        assert!(matches!(
            cmd.begin_recording_secondary(None),
            Err(Error::NotSecondary(_))
        ));
    }

    #[test]
    fn test_execute_secondary() {
        let backend = HeadlessBackend::new();
        let device = Device::new(backend.clone());
        let mut cmd =
            CommandBuffer::new_primary(device.clone(), CommandBufferKind::Graphics, u64::MAX).unwrap();
        let mut secondary = CommandBuffer::new_secondary(device, CommandBufferKind::Graphics).unwrap();
        let secondary_handle = secondary.vk_handle();

        secondary.begin_recording_secondary(None).unwrap();
        let recording = Arc::new(secondary);
        cmd.begin_recording().unwrap();
        // Still recording: rejected.
        assert!(cmd.execute_secondary(recording.clone()).is_err());

        let mut secondary = Arc::into_inner(recording).unwrap();
        secondary.end_recording().unwrap();
        let secondary = Arc::new(secondary);
        cmd.execute_secondary(secondary.clone()).unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Recording);
        assert_eq!(Arc::strong_count(&secondary), 2);

        cmd.end_recording().unwrap();
        cmd.submit().unwrap();
        cmd.wait().unwrap();
        assert_eq!(Arc::strong_count(&secondary), 1);
        assert!(backend.calls().contains(&Call::ExecuteCommands {
            command_buffer: cmd.vk_handle(),
            secondaries: vec![secondary_handle],
        }));
    }

    #[test]
    fn test_flush() {
        let (_backend, mut cmd) = primary();
        cmd.flush().unwrap();
        cmd.begin_recording().unwrap();
        assert!(cmd.flush().is_err());
        cmd.end_recording().unwrap();
        assert!(cmd.flush().is_err());
        cmd.submit().unwrap();
        cmd.flush().unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Idle);
    }

    #[test]
    fn test_submit_and_rerecord() {
        let (backend, mut cmd) = primary();
        assert!(cmd.submit_and_rerecord().is_err());
        cmd.begin_recording().unwrap();
        cmd.submit_and_rerecord().unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Recording);
        assert_eq!(backend.count(|c| matches!(c, Call::WaitForFence(_))), 1);
        assert_eq!(backend.count(|c| matches!(c, Call::BeginCommandBuffer { .. })), 2);
    }

    #[test]
    fn test_failed_submit_keeps_state() {
        let (backend, mut cmd) = primary();
        cmd.begin_recording().unwrap();
        cmd.end_recording().unwrap();
        backend.fail_next(FailurePoint::QueueSubmit);
        assert!(matches!(
            cmd.submit(),
            Err(Error::Vulkan(vk::Result::ERROR_DEVICE_LOST))
        ));
        assert_eq!(cmd.state(), CommandBufferState::Ended);
        cmd.submit().unwrap();
        cmd.wait().unwrap();
    }

    #[test]
    fn test_barriers_are_batched() {
        let (backend, mut cmd) = primary();
        cmd.begin_recording().unwrap();
        cmd.memory_barrier(Access::COPY_WRITE, Access::SHADER_READ);
        cmd.memory_barrier(Access::COLOR_ATTACHMENT_WRITE, Access::SHADER_READ);
        assert!(cmd.has_pending_barriers());
        cmd.emit_barriers().unwrap();
        assert!(!cmd.has_pending_barriers());
        // Nothing pending: no second call.
        cmd.emit_barriers().unwrap();
        cmd.end_recording().unwrap();

        let barriers: Vec<_> = backend
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::PipelineBarrier {
                    memory_barriers, ..
                } => Some(memory_barriers),
                _ => None,
            })
            .collect();
        assert_eq!(barriers.len(), 1);
        assert_eq!(
            barriers[0],
            vec![(
                vk::PipelineStageFlags2::COPY | vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags2::ALL_COMMANDS
            )]
        );
    }

    #[test]
    fn test_drop_releases_handles() {
        let (backend, mut cmd) = primary();
        cmd.begin_recording().unwrap();
        cmd.end_recording().unwrap();
        cmd.submit().unwrap();
        drop(cmd);
        // Waited on drop, then freed.
        assert_eq!(backend.count(|c| matches!(c, Call::WaitForFence(_))), 1);
        assert_eq!(backend.count(|c| matches!(c, Call::WaitIdle)), 0);
        assert_eq!(backend.live_objects(), 0);
    }

    #[test]
    fn test_drop_falls_back_to_device_idle() {
        let (backend, mut cmd) = primary();
        cmd.begin_recording().unwrap();
        cmd.end_recording().unwrap();
        cmd.submit().unwrap();
        backend.fail_next(FailurePoint::WaitForFence);
        drop(cmd);
        assert_eq!(backend.count(|c| matches!(c, Call::WaitIdle)), 1);
        assert_eq!(backend.live_objects(), 0);
    }
}
