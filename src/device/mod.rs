//! GPU Device Boundary
//!
//! The skinning core decides *when* and *how large* GPU resources are; the
//! device decides *how* they are created. Everything the core needs from the
//! GPU goes through the [`SkinDevice`] trait:
//!
//! - `create_buffer` / `destroy_buffer` with opaque [`BufferHandle`]s
//! - `submit` of a recorded [`SkinCommandList`], returning a [`FenceId`]
//! - fence queries and blocking waits
//!
//! Two backends are provided:
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`WgpuSkinDevice`] | Real GPU execution through `wgpu` |
//! | [`HeadlessDevice`] | CPU recording backend (servers, tools, tests) |
//!
//! Fences are ordered: once fence `N` is signaled, every fence `< N` is too.

mod command;
mod headless;
mod wgpu_device;

pub use command::{
    ComputeDispatch, MorphNormalizeParams, MorphUpdateParams, RecomputeTangentsParams,
    ResourceAccess, SkinCommand, SkinCommandList, SkinDispatchParams, SkinKernel,
    SkinPermutation,
};
pub use headless::{FenceMode, HeadlessDevice};
pub use wgpu_device::{SkinPipelines, WgpuSkinDevice};

use bitflags::bitflags;
use slotmap::new_key_type;

use crate::errors::Result;

new_key_type! {
    /// Opaque handle to a device buffer. Only the device dereferences it.
    pub struct BufferHandle;
}

bitflags! {
    /// Buffer usage flags understood by every backend.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsage: u32 {
        const VERTEX   = 1 << 0;
        const INDEX    = 1 << 1;
        const UNIFORM  = 1 << 2;
        const STORAGE  = 1 << 3;
        const COPY_DST = 1 << 4;
        const COPY_SRC = 1 << 5;
    }
}

impl BufferUsage {
    /// Converts to the equivalent `wgpu` usage set.
    #[must_use]
    pub fn to_wgpu(self) -> wgpu::BufferUsages {
        let mut usage = wgpu::BufferUsages::empty();
        if self.contains(Self::VERTEX) {
            usage |= wgpu::BufferUsages::VERTEX;
        }
        if self.contains(Self::INDEX) {
            usage |= wgpu::BufferUsages::INDEX;
        }
        if self.contains(Self::UNIFORM) {
            usage |= wgpu::BufferUsages::UNIFORM;
        }
        if self.contains(Self::STORAGE) {
            usage |= wgpu::BufferUsages::STORAGE;
        }
        if self.contains(Self::COPY_DST) {
            usage |= wgpu::BufferUsages::COPY_DST;
        }
        if self.contains(Self::COPY_SRC) {
            usage |= wgpu::BufferUsages::COPY_SRC;
        }
        usage
    }
}

/// Describes a buffer to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub label: &'static str,
    pub size: u64,
    pub usage: BufferUsage,
}

/// Identifies a queue submission. Signaled once the GPU finished it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FenceId(pub(crate) u64);

impl FenceId {
    /// A fence that is always signaled (nothing was ever submitted with it).
    pub const NONE: FenceId = FenceId(0);

    #[inline]
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub(crate) fn next(self) -> FenceId {
        FenceId(self.0 + 1)
    }
}

/// Platform capabilities relevant to skinning, queried once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub compute_shaders: bool,
    pub max_storage_buffer_binding_size: u64,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            compute_shaders: true,
            max_storage_buffer_binding_size: 128 << 20,
        }
    }
}

/// The generic GPU resource allocator consumed by the skinning core.
pub trait SkinDevice {
    /// Capabilities of the underlying adapter.
    fn capabilities(&self) -> DeviceCapabilities;

    /// Creates a buffer. Failure maps to [`crate::SkinError::ResourceExhaustion`].
    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle>;

    /// Destroys a buffer. The caller guarantees no submitted work still reads it.
    fn destroy_buffer(&self, handle: BufferHandle);

    /// The fence the next call to [`SkinDevice::submit`] will return.
    fn next_fence(&self) -> FenceId;

    /// Submits recorded commands for execution.
    fn submit(&self, commands: SkinCommandList) -> Result<FenceId>;

    /// Non-blocking fence query.
    fn is_fence_signaled(&self, fence: FenceId) -> bool;

    /// Blocks until the fence is signaled.
    fn wait_fence(&self, fence: FenceId);
}
