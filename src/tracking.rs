//! Resource state tracking and barrier computation.
//!
//! Every texture that a [`BindingSet`](crate::descriptor::BindingSet) transitions
//! carries a [`ResourceState`]: the last write access, the earliest pipeline stage
//! that has read it since, and its current image layout. Asking for a new
//! [`Access`] yields the minimal [`MemoryBarrier`] that makes the previous write
//! visible, which the [`CommandBuffer`](crate::command::CommandBuffer) accumulates
//! and emits in a single barrier call.
//!
//! # Key Types
//!
//! - [`Access`]: a pipeline stage mask paired with an access mask.
//! - [`ResourceState`]: the tracked history of one resource.
//! - [`MemoryBarrier`]: source and destination accesses of one barrier.

use std::{
    fmt::Debug,
    ops::{BitOr, BitOrAssign},
};

use ash::vk;

/// When (stage) and how (access) a resource is used.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug, Hash)]
pub struct Access {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}
impl BitOr for Access {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self {
            stage: self.stage | rhs.stage,
            access: self.access | rhs.access,
        }
    }
}
impl BitOrAssign for Access {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = *self | rhs;
    }
}

impl Access {
    pub const NONE: Access = Access {
        stage: vk::PipelineStageFlags2::NONE,
        access: vk::AccessFlags2::NONE,
    };
    pub const FRAGMENT_SAMPLED_READ: Access = Access {
        stage: vk::PipelineStageFlags2::FRAGMENT_SHADER,
        access: vk::AccessFlags2::SHADER_SAMPLED_READ,
    };
    /// Any shader stage reading a sampled or storage image.
    pub const SHADER_READ: Access = Access {
        stage: vk::PipelineStageFlags2::ALL_COMMANDS,
        access: vk::AccessFlags2::SHADER_READ,
    };
    /// Any shader stage reading and writing a storage image.
    pub const SHADER_READ_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::ALL_COMMANDS,
        access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::SHADER_READ.as_raw() | vk::AccessFlags2::SHADER_WRITE.as_raw(),
        ),
    };
    pub const DEPTH_READ: Access = Access {
        stage: vk::PipelineStageFlags2::from_raw(
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw()
                | vk::PipelineStageFlags2::FRAGMENT_SHADER.as_raw(),
        ),
        access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
                | vk::AccessFlags2::SHADER_SAMPLED_READ.as_raw(),
        ),
    };
    pub const COLOR_ATTACHMENT_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
    };
    pub const EARLY_FRAGMENT_TEST_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS,
        access: vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
    };
    pub const COPY_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::COPY,
        access: vk::AccessFlags2::TRANSFER_WRITE,
    };
    /// Reads and writes of acceleration structures and their scratch memory during builds.
    pub const ACCELERATION_STRUCTURE_BUILD: Access = Access {
        stage: vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
        access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR.as_raw()
                | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR.as_raw(),
        ),
    };
    pub const ALL_COMMANDS: Access = Access {
        stage: vk::PipelineStageFlags2::ALL_COMMANDS,
        access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::MEMORY_READ.as_raw() | vk::AccessFlags2::MEMORY_WRITE.as_raw(),
        ),
    };

    pub fn is_readonly(&self) -> bool {
        !self.access.is_empty() && (self.access & !utils::ALL_READ_BITS).is_empty()
    }
}

/// Source and destination of a pipeline barrier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryBarrier {
    pub src: Access,
    pub dst: Access,
}
impl MemoryBarrier {
    pub fn is_empty(&self) -> bool {
        self.src.stage.is_empty() && self.dst.stage.is_empty()
    }
}
impl BitOr for MemoryBarrier {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self {
            src: self.src | rhs.src,
            dst: self.dst | rhs.dst,
        }
    }
}
impl BitOrAssign for MemoryBarrier {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = *self | rhs;
    }
}

/// Access history of a single resource.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct ResourceState {
    /// Most recent write. The source of the next barrier.
    pub write: Access,
    /// Earliest stages that have read the resource since `write`.
    pub reads: vk::PipelineStageFlags2,
    /// Current image layout. Unused for buffers.
    pub layout: vk::ImageLayout,
}
impl Debug for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceState")
            .field("write_stage", &self.write.stage)
            .field("write_access", &self.write.access)
            .field("reads", &self.reads)
            .field("layout", &self.layout)
            .finish()
    }
}

impl ResourceState {
    pub fn new(access: Access, layout: vk::ImageLayout) -> Self {
        Self {
            write: access,
            reads: vk::PipelineStageFlags2::empty(),
            layout,
        }
    }

    /// Records `next` as the newest access and returns the barrier it requires.
    ///
    /// - A resource that was never written needs no barrier unless its layout changes.
    /// - A read at a stage already covered by an earlier read needs nothing; a read at
    ///   an earlier stage only needs an execution dependency.
    /// - A write after reads needs an execution dependency on those reads (plus the
    ///   destination access when the layout changes, since the transition itself writes).
    /// - A write after a write needs the full memory barrier.
    pub fn transition(&mut self, next: Access, with_layout_transition: bool) -> MemoryBarrier {
        let mut barrier = MemoryBarrier {
            src: self.write,
            dst: next,
        };
        let never_written = self.write == Access::NONE;
        if never_written {
            barrier = if with_layout_transition {
                MemoryBarrier {
                    src: Access::NONE,
                    dst: next,
                }
            } else {
                MemoryBarrier::default()
            };
        } else if next.is_readonly() && !with_layout_transition {
            match utils::compare_pipeline_stages(self.reads, next.stage) {
                Some(ordering) if ordering.is_gt() => {
                    barrier.src = Access {
                        stage: self.reads,
                        access: vk::AccessFlags2::empty(),
                    };
                    barrier.dst.access = vk::AccessFlags2::empty();
                }
                Some(_) => barrier = MemoryBarrier::default(),
                None => {}
            }
        } else if !self.reads.is_empty() {
            barrier.src = Access {
                stage: self.reads,
                access: vk::AccessFlags2::empty(),
            };
            if !with_layout_transition {
                barrier.dst.access = vk::AccessFlags2::empty();
            }
        }

        if next.is_readonly() {
            self.reads = utils::earlier_stage(self.reads, next.stage);
        } else {
            self.write = next;
            self.reads = vk::PipelineStageFlags2::empty();
        }
        barrier
    }
}

mod utils {
    use ash::vk;
    use std::cmp::Ordering;

    pub const ALL_READ_BITS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
        vk::AccessFlags2::INDIRECT_COMMAND_READ.as_raw()
            | vk::AccessFlags2::INDEX_READ.as_raw()
            | vk::AccessFlags2::VERTEX_ATTRIBUTE_READ.as_raw()
            | vk::AccessFlags2::UNIFORM_READ.as_raw()
            | vk::AccessFlags2::INPUT_ATTACHMENT_READ.as_raw()
            | vk::AccessFlags2::SHADER_READ.as_raw()
            | vk::AccessFlags2::COLOR_ATTACHMENT_READ.as_raw()
            | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
            | vk::AccessFlags2::TRANSFER_READ.as_raw()
            | vk::AccessFlags2::HOST_READ.as_raw()
            | vk::AccessFlags2::MEMORY_READ.as_raw()
            | vk::AccessFlags2::SHADER_SAMPLED_READ.as_raw()
            | vk::AccessFlags2::SHADER_STORAGE_READ.as_raw()
            | vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR.as_raw()
            | vk::AccessFlags2::SHADER_BINDING_TABLE_READ_KHR.as_raw(),
    );

    /// Stage orderings within which "earlier" is meaningful.
    const ORDERS: [&[vk::PipelineStageFlags2]; 3] = [
        &[
            vk::PipelineStageFlags2::DRAW_INDIRECT,
            vk::PipelineStageFlags2::INDEX_INPUT,
            vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
            vk::PipelineStageFlags2::VERTEX_SHADER,
            vk::PipelineStageFlags2::TESSELLATION_CONTROL_SHADER,
            vk::PipelineStageFlags2::TESSELLATION_EVALUATION_SHADER,
            vk::PipelineStageFlags2::GEOMETRY_SHADER,
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS,
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
            vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        ],
        &[
            vk::PipelineStageFlags2::DRAW_INDIRECT,
            vk::PipelineStageFlags2::COMPUTE_SHADER,
        ],
        &[
            vk::PipelineStageFlags2::DRAW_INDIRECT,
            vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
        ],
    ];

    /// `Some(Less)` if `a` runs before `b` in some pipeline, `None` if they are unordered.
    pub fn compare_pipeline_stages(
        a: vk::PipelineStageFlags2,
        b: vk::PipelineStageFlags2,
    ) -> Option<Ordering> {
        if a == b {
            return Some(Ordering::Equal);
        }
        ORDERS.iter().find_map(|order| {
            let first = order.iter().position(|&x| a.contains(x))?;
            let second = order.iter().position(|&x| b.contains(x))?;
            Some(first.cmp(&second))
        })
    }

    pub fn earlier_stage(
        a: vk::PipelineStageFlags2,
        b: vk::PipelineStageFlags2,
    ) -> vk::PipelineStageFlags2 {
        match compare_pipeline_stages(a, b) {
            Some(ordering) if ordering.is_le() => a,
            Some(_) => b,
            None => a | b,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::utils::*;
    use super::*;

    #[test]
    fn test_compare_pipeline_stages() {
        assert!(
            compare_pipeline_stages(
                vk::PipelineStageFlags2::VERTEX_SHADER,
                vk::PipelineStageFlags2::FRAGMENT_SHADER
            )
            .unwrap()
            .is_lt()
        );
        assert!(
            compare_pipeline_stages(
                vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
                vk::PipelineStageFlags2::FRAGMENT_SHADER
            )
            .is_none()
        );
        assert_eq!(
            earlier_stage(
                vk::PipelineStageFlags2::VERTEX_SHADER,
                vk::PipelineStageFlags2::COPY
            ),
            vk::PipelineStageFlags2::VERTEX_SHADER | vk::PipelineStageFlags2::COPY
        );
    }

    /// Never written, sampled for the first time: only the layout change matters.
    #[test]
    fn test_first_use_with_layout_change() {
        let mut state = ResourceState::default();
        let barrier = state.transition(Access::FRAGMENT_SAMPLED_READ, true);
        assert_eq!(barrier.src, Access::NONE);
        assert_eq!(barrier.dst, Access::FRAGMENT_SAMPLED_READ);

        let mut state = ResourceState::default();
        assert!(state.transition(Access::FRAGMENT_SAMPLED_READ, false).is_empty());
    }

    /// Render target written, then sampled in the next pass.
    #[test]
    fn test_write_then_sample() {
        let mut state = ResourceState::new(
            Access::COLOR_ATTACHMENT_WRITE,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        let barrier = state.transition(Access::FRAGMENT_SAMPLED_READ, true);
        assert_eq!(barrier.src, Access::COLOR_ATTACHMENT_WRITE);
        assert_eq!(barrier.dst, Access::FRAGMENT_SAMPLED_READ);
        assert_eq!(state.reads, vk::PipelineStageFlags2::FRAGMENT_SHADER);

        // Sampling again at the same stage is already visible.
        assert!(state.transition(Access::FRAGMENT_SAMPLED_READ, false).is_empty());
    }

    /// Write - Read - Write: the second write only waits on the read.
    #[test]
    fn test_write_after_read() {
        let mut state = ResourceState::new(Access::COPY_WRITE, vk::ImageLayout::GENERAL);
        state.transition(Access::FRAGMENT_SAMPLED_READ, false);
        let barrier = state.transition(Access::COLOR_ATTACHMENT_WRITE, false);
        assert_eq!(barrier.src.stage, vk::PipelineStageFlags2::FRAGMENT_SHADER);
        assert!(barrier.src.access.is_empty());
        assert!(barrier.dst.access.is_empty());
        assert_eq!(state.write, Access::COLOR_ATTACHMENT_WRITE);
        assert!(state.reads.is_empty());
    }
}
