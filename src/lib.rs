//! # Scoria
//!
//! The object caching and frame synchronization core of a Vulkan renderer.
//!
//! A renderer built on Scoria describes what it wants to draw every frame and lets
//! the crate work out which GPU objects that takes. Pipelines, render passes,
//! frame buffers and samplers are built on first use, shared by every caller that
//! describes the same thing, and released once nobody has used them for a while.
//!
//! ## Overview
//!
//! ### Device and backends
//!
//! A [`Device`] wraps a [`Backend`](backend::Backend), the only part of the crate
//! that talks to the graphics API. [`VulkanBackend`](backend::vulkan::VulkanBackend)
//! drives a real device. [`HeadlessBackend`](backend::headless::HeadlessBackend)
//! records every call and is what the tests run against.
//!
//! ### Object caches
//!
//! [`GraphicsContext`] owns one [`TimedCache`](cache::TimedCache) per object kind.
//! Descriptions are reduced to a [`Fingerprint`](hash::Fingerprint), so two
//! descriptions that would build the same object share it:
//!
//! ```
//! # use scoria::{Device, GraphicsContext, ContextConfig, backend::headless::HeadlessBackend};
//! # use scoria::sampler::SamplerDescription;
//! let context = GraphicsContext::new(Device::new(HeadlessBackend::new()), ContextConfig::default());
//! let sampler = context.get_sampler(&SamplerDescription::NEAREST_CLAMP).unwrap();
//! assert_eq!(context.cache_stats().samplers, 1);
//! # drop(sampler);
//! ```
//!
//! ### Command buffers
//!
//! [`CommandBuffer`](command::CommandBuffer) enforces the begin, record, end,
//! submit, wait cycle and opens and closes render passes as pipelines are bound.
//! Image layout transitions are collected from [`tracking`] and flushed as a single
//! barrier.
//!
//! ### Binding sets
//!
//! A [`BindingSet`](descriptor::BindingSet) keeps one descriptor set and one
//! uniform buffer per frame in flight and rewrites only the copies that changed.
//!
//! ### Ray tracing
//!
//! [`AccelerationStructureBatcher`](rtx::AccelerationStructureBatcher) queues
//! bottom level builds and records them together, sharing one scratch buffer.
//!
//! ## Feature Flags
//!
//! - `vulkan` (default) - Enables [`VulkanBackend`](backend::vulkan::VulkanBackend)
//!   and its VMA dependency.

pub mod backend;
pub mod buffer;
pub mod cache;
pub mod command;
pub mod config;
pub mod context;
pub mod description;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod hash;
pub mod pipeline;
pub mod rtx;
pub mod sampler;
pub mod shader;
pub mod texture;
pub mod tracking;
pub mod utils;

pub use config::ContextConfig;
pub use context::GraphicsContext;
pub use device::{Device, HasDevice};
pub use error::{Error, Result};

pub use ash;

pub mod prelude {
    pub use crate::{
        ContextConfig, Device, GraphicsContext, HasDevice, ash,
        ash::vk,
        command::{CommandBuffer, CommandBufferKind, CommandBufferState},
        description::{FrameBufferDescription, PipelineDescription, RenderPassDescription},
        descriptor::BindingSet,
        rtx::AccelerationStructureBatcher,
        sampler::SamplerDescription,
        shader::{Shader, ShaderRef},
        texture::{Texture, TextureRef},
        tracking::{Access, ResourceState},
        utils::AsVkHandle,
    };
}
