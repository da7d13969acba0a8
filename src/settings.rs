//! Skinning Settings
//!
//! Runtime configuration for the skinning pipeline.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use myth_skinning::settings::{SkinningSettings, CommitPolicy};
//!
//! let settings = SkinningSettings {
//!     commit_policy: CommitPolicy::DeferUntilPreFrame,
//!     ..Default::default()
//! };
//! ```
//!
//! All values are plain data and can be loaded from any serde format.
//! Call [`SkinningSettings::validated`] before handing user supplied values
//! to the renderer.

use serde::{Deserialize, Serialize};

/// Largest number of items a single batched morph dispatch can address.
///
/// Parameter blocks reserve one extra entry so the shader's binary search
/// always has an upper sentinel.
pub const MORPH_BATCH_TABLE_CAPACITY: usize = 128;

/// When a staged snapshot is committed (processed) on the render thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CommitPolicy {
    /// Process the snapshot as soon as its render command is consumed.
    #[default]
    Immediate,
    /// Stage the snapshot and process it at the next pre-frame commit point
    /// ([`crate::renderer::SkinningRenderer::pre_frame_commit`]).
    DeferUntilPreFrame,
}

/// Which sections are allowed into the skin cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SkinCacheMode {
    /// Skin cache disabled; every section renders through its uncached path.
    Disabled,
    /// Every section with bone influences is cached.
    #[default]
    Enabled,
    /// Only sections that need tangent recomputation are cached.
    RecomputeTangentsOnly,
}

/// Tangent recomputation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RecomputeTangents {
    /// Never recompute tangents.
    Off,
    /// Recompute for every cached section.
    All,
    /// Recompute only for sections whose material asks for it.
    #[default]
    MaterialDriven,
}

/// Skin cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkinCacheSettings {
    pub mode: SkinCacheMode,
    /// Soft budget for all cached output buffers, in bytes.
    pub budget_bytes: u64,
    pub recompute_tangents: RecomputeTangents,
    /// Free output buffers idle for longer than this many frames are destroyed.
    pub max_idle_frames: u32,
}

impl Default for SkinCacheSettings {
    fn default() -> Self {
        Self {
            mode: SkinCacheMode::Enabled,
            budget_bytes: 128 * 1024 * 1024,
            recompute_tangents: RecomputeTangents::MaterialDriven,
            max_idle_frames: 60,
        }
    }
}

/// Snapshot object-pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPoolSettings {
    /// When false, snapshot storage is dropped instead of recycled.
    pub enabled: bool,
    /// Number of allocations between two low-water-mark cleanups.
    pub cleanup_interval: u32,
}

impl Default for SnapshotPoolSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            cleanup_interval: 1000,
        }
    }
}

/// LOD selection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LodSettings {
    /// Scale applied to the computed screen radius, clamped to `[0.25, 1.0]`.
    pub radius_scale: f32,
    /// When false, the finest LOD is always selected.
    pub enabled: bool,
}

impl Default for LodSettings {
    fn default() -> Self {
        Self {
            radius_scale: 1.0,
            enabled: true,
        }
    }
}

/// Morph target configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MorphSettings {
    /// Blend morph targets with compute dispatches when available.
    pub use_gpu: bool,
    /// Morph targets (or normalize permutations) handled per dispatch.
    pub dispatch_batch_size: usize,
    /// Weights that differ by less than this are considered unchanged.
    pub weight_threshold: f32,
    /// Absolute weights below this are culled from the active list.
    pub min_blend_weight: f32,
    /// Absolute weights above this are culled from the active list.
    pub max_blend_weight: f32,
}

impl Default for MorphSettings {
    fn default() -> Self {
        Self {
            use_gpu: true,
            dispatch_batch_size: MORPH_BATCH_TABLE_CAPACITY - 1,
            weight_threshold: 1e-8,
            min_blend_weight: 1e-8,
            max_blend_weight: 5.0,
        }
    }
}

/// Top-level configuration for the skinning pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkinningSettings {
    pub skin_cache: SkinCacheSettings,
    pub snapshot_pool: SnapshotPoolSettings,
    pub lod: LodSettings,
    pub morph: MorphSettings,
    pub commit_policy: CommitPolicy,
    /// Free bone/cloth buffers idle for longer than this many frames are destroyed.
    pub bone_pool_max_idle_frames: u32,
}

impl Default for SkinningSettings {
    fn default() -> Self {
        Self {
            skin_cache: SkinCacheSettings::default(),
            snapshot_pool: SnapshotPoolSettings::default(),
            lod: LodSettings::default(),
            morph: MorphSettings::default(),
            commit_policy: CommitPolicy::Immediate,
            bone_pool_max_idle_frames: 120,
        }
    }
}

impl SkinningSettings {
    /// Returns a copy with every value clamped into its supported range.
    #[must_use]
    pub fn validated(&self) -> Self {
        let mut out = self.clone();

        let batch = out.morph.dispatch_batch_size;
        if batch == 0 || batch >= MORPH_BATCH_TABLE_CAPACITY {
            let clamped = batch.clamp(1, MORPH_BATCH_TABLE_CAPACITY - 1);
            log::warn!("Morph dispatch batch size {batch} out of range, using {clamped}");
            out.morph.dispatch_batch_size = clamped;
        }

        out.lod.radius_scale = out.lod.radius_scale.clamp(0.25, 1.0);
        out.morph.min_blend_weight = out.morph.min_blend_weight.max(0.0);
        out.morph.max_blend_weight = out.morph.max_blend_weight.max(out.morph.min_blend_weight);
        out.snapshot_pool.cleanup_interval = out.snapshot_pool.cleanup_interval.max(1);
        out
    }
}
