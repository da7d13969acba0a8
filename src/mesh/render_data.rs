use glam::Mat4;

use crate::device::BufferHandle;
use crate::morph::MorphTargetSet;

/// Bytes per vertex of a skinned position stream (`vec3<f32>`).
pub const POSITION_STRIDE: u64 = 12;
/// Bytes per vertex of a tangent stream (two packed `snorm8x4` normals).
pub const TANGENT_STRIDE: u64 = 8;

/// Static vertex streams of one LOD, uploaded once at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticVertexBuffers {
    pub positions: BufferHandle,
    pub tangents: BufferHandle,
    pub skin_weights: BufferHandle,
    pub indices: BufferHandle,
    /// Per-vertex cloth mapping data, present when any section is simulated.
    pub cloth_mapping: Option<BufferHandle>,
}

/// A contiguous run of vertices and triangles drawn with one material.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderSection {
    pub base_vertex_index: u32,
    pub num_vertices: u32,
    pub base_index: u32,
    pub num_triangles: u32,
    /// Section-local bone index → skeleton bone index.
    pub bone_map: Vec<u16>,
    /// Zero means the section is rigid and never skinned.
    pub max_bone_influences: u32,
    /// The section's material asks for recomputed tangents.
    pub recompute_tangents: bool,
    /// Cloth simulation region driving this section.
    pub cloth_region: Option<usize>,
}

impl RenderSection {
    #[must_use]
    pub fn has_bone_influences(&self) -> bool {
        self.max_bone_influences > 0 && self.num_vertices > 0
    }

    /// Bytes of one 3x4 bone matrix buffer for this section.
    #[must_use]
    pub fn bone_buffer_size(&self) -> u64 {
        self.bone_map.len() as u64 * crate::vertex_factory::BONE_MATRIX_STRIDE
    }
}

#[derive(Debug, Clone)]
pub struct LodRenderData {
    pub num_vertices: u32,
    pub sections: Vec<RenderSection>,
    pub buffers: StaticVertexBuffers,
    pub morph_targets: MorphTargetSet,
}

impl LodRenderData {
    #[must_use]
    pub fn has_cloth(&self) -> bool {
        self.sections.iter().any(|s| s.cloth_region.is_some())
    }
}

/// Screen-size thresholds of one LOD.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LodInfo {
    /// Fraction of the screen (diameter) at which this LOD becomes eligible.
    pub screen_size: f32,
    /// Extra screen size required before dropping back to a finer LOD.
    pub hysteresis: f32,
}

/// Immutable render-side description of a skinned mesh asset.
#[derive(Debug, Clone)]
pub struct SkinnedMeshRenderData {
    pub name: String,
    pub lods: Vec<LodRenderData>,
    pub lod_info: Vec<LodInfo>,
    /// Inverse bind pose per skeleton bone.
    pub inverse_bind_matrices: Vec<Mat4>,
    /// Number of morph targets; weight arrays are indexed by morph index.
    pub num_morph_targets: usize,
}

impl SkinnedMeshRenderData {
    #[must_use]
    pub fn num_lods(&self) -> usize {
        self.lods.len()
    }

    #[must_use]
    pub fn num_bones(&self) -> usize {
        self.inverse_bind_matrices.len()
    }
}
