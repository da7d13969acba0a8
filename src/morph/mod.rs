//! Morph targets.
//!
//! - [`MorphTargetSet`]: per-LOD deltas, bounds, affected sections and
//!   vertex permutations
//! - [`MorphQuantization`]: fixed-point scale for GPU accumulation
//! - [`plan_batches`]: splitting work items into bounded dispatches
//! - [`MorphVertexBuffer`]: the blended per-vertex delta buffer

mod batch;
mod buffer;
mod quantize;
mod target;

pub use batch::{DispatchBatch, MORPH_WORKGROUP_SIZE, plan_batches};
pub use buffer::{
    MORPH_VERTEX_STRIDE, MorphGpuVertex, MorphVertexBuffer, blend_morphs_cpu,
    blend_morphs_quantized,
};
pub use quantize::{I24_MAX, MorphQuantization};
pub use target::{
    MorphBounds, MorphDelta, MorphPermutation, MorphTarget, MorphTargetSet, PackedMorphDelta,
};

/// A morph target with a non-negligible weight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActiveMorphTarget {
    /// Mesh-wide morph index.
    pub index: u32,
    pub weight: f32,
}
