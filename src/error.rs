//! Error types.
//!
//! Misuse that can be recovered locally (an unknown binding name, a zero-count
//! descriptor write) is logged and ignored by the caller-facing APIs and never
//! surfaces here. Everything in [`Error`] means the frame cannot proceed.

use ash::vk;

use crate::command::CommandBufferState;

/// Errors that abort the current frame.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A command buffer operation was called from a state that does not allow it.
    #[error("{operation} is not allowed while the command buffer is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: CommandBufferState,
    },

    /// An operation reserved for primary command buffers was called on a secondary one.
    #[error("{0} requires a primary command buffer")]
    NotPrimary(&'static str),

    /// An operation reserved for secondary command buffers was called on a primary one.
    #[error("{0} requires a secondary command buffer")]
    NotSecondary(&'static str),

    /// A bottom-level build was requested with neither geometries nor build ranges.
    #[error("bottom-level acceleration structure build requested without geometries or build ranges")]
    EmptyBuildRequest,

    /// A bottom-level build was requested with a build range count that does not
    /// match its geometry count.
    #[error("bottom-level acceleration structure build has {geometries} geometries but {ranges} build ranges")]
    MismatchedBuildRanges { geometries: usize, ranges: usize },

    /// A graphics pipeline was requested without color, depth or swapchain targets.
    #[error("graphics pipeline for shader {0:?} has no render targets")]
    NoRenderTargets(String),

    /// The device could not allocate memory for an object the frame depends on.
    #[error("out of device memory while allocating {what} ({size} bytes)")]
    OutOfDeviceMemory { what: &'static str, size: u64 },

    #[error(transparent)]
    Vulkan(#[from] vk::Result),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
