use glam::Mat4;
use slotmap::new_key_type;

use crate::device::BufferHandle;
use crate::mesh::{POSITION_STRIDE, RenderSection, StaticVertexBuffers, TANGENT_STRIDE};
use crate::pool::{PooledBuffer, SKIN_CACHE_BUCKETS};
use crate::tracker::DoubleBufferedResourceTracker;
use crate::vertex_factory::{FactoryKind, VertexFactoryId};

new_key_type! {
    /// Handle to a [`SkinCacheEntry`], owned by the mesh object section.
    pub struct SkinCacheEntryKey;
}

/// Cloth inputs of a cached skinning dispatch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClothSkinInputs {
    pub simulation: BufferHandle,
    pub mapping: BufferHandle,
    pub local_to_cloth: Mat4,
    pub blend_weight: f32,
}

/// Everything the skin cache needs to skin one section this frame.
#[derive(Debug, Clone, Copy)]
pub struct SkinCacheRequest<'a> {
    pub section_index: usize,
    pub section: &'a RenderSection,
    pub buffers: &'a StaticVertexBuffers,
    pub factory: VertexFactoryId,
    pub kind: FactoryKind,
    pub bones: BufferHandle,
    pub previous_bones: BufferHandle,
    pub morph: Option<BufferHandle>,
    pub cloth: Option<ClothSkinInputs>,
    pub revision: u32,
    pub previous_revision: u32,
    /// The section's material asks for recomputed tangents.
    pub material_recompute_tangents: bool,
}

#[derive(Debug)]
pub(crate) struct OutputBuffers {
    pub positions: PooledBuffer,
    pub tangents: PooledBuffer,
}

/// Cached skinning output of one section.
#[derive(Debug)]
pub struct SkinCacheEntry {
    pub(crate) section_index: usize,
    pub(crate) num_vertices: u32,
    pub(crate) footprint: u64,
    pub(crate) tracker: DoubleBufferedResourceTracker<VertexFactoryId, OutputBuffers>,
    pub(crate) current_slot: usize,
    pub(crate) previous_slot: usize,
    pub(crate) revision: u32,
    pub(crate) recompute_tangents: bool,
}

impl SkinCacheEntry {
    #[must_use]
    pub fn section_index(&self) -> usize {
        self.section_index
    }

    #[must_use]
    pub fn num_vertices(&self) -> u32 {
        self.num_vertices
    }

    /// Pooled bytes held by this entry (both slots).
    #[must_use]
    pub fn footprint(&self) -> u64 {
        self.footprint
    }

    #[must_use]
    pub fn revision(&self) -> u32 {
        self.revision
    }

    #[must_use]
    pub fn recompute_tangents(&self) -> bool {
        self.recompute_tangents
    }

    pub(crate) fn handles(&self) -> impl Iterator<Item = BufferHandle> + '_ {
        self.tracker
            .payloads()
            .flat_map(|o| [o.positions.handle(), o.tangents.handle()])
    }
}

/// Pooled bytes an entry of `num_vertices` needs, or `None` if a stream is
/// larger than the biggest output bucket.
#[must_use]
pub fn entry_footprint(num_vertices: u32) -> Option<u64> {
    let positions = SKIN_CACHE_BUCKETS.pooled_size(u64::from(num_vertices) * POSITION_STRIDE)?;
    let tangents = SKIN_CACHE_BUCKETS.pooled_size(u64::from(num_vertices) * TANGENT_STRIDE)?;
    Some(2 * (positions + tangents))
}
