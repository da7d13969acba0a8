//! Mesh-side inputs to the skinning pipeline.
//!
//! - [`SkinnedMeshRenderData`]: the static asset (LODs, sections, static
//!   vertex buffers, morph targets, inverse bind pose)
//! - [`SkeletonPose`]: the per-frame bone pose from animation
//! - [`ClothSimData`]: per-region cloth simulation results

mod cloth;
mod pose;
mod render_data;

pub use cloth::{CLOTH_VERTEX_STRIDE, ClothGpuVertex, ClothSimData};
pub use pose::SkeletonPose;
pub use render_data::{
    LodInfo, LodRenderData, POSITION_STRIDE, RenderSection, SkinnedMeshRenderData,
    StaticVertexBuffers, TANGENT_STRIDE,
};
