use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::mesh::RenderSection;

/// One vertex displacement of a morph target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MorphDelta {
    /// LOD-wide vertex index.
    pub vertex_index: u32,
    pub position_delta: Vec3,
    pub normal_delta: Vec3,
}

/// A morph target's deltas for one LOD.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MorphTarget {
    pub name: String,
    pub deltas: Vec<MorphDelta>,
}

/// Per-morph absolute delta bounds; `xyz` for position, `w` for normals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MorphBounds {
    pub min: Vec4,
    pub max: Vec4,
}

impl MorphBounds {
    pub const ZERO: MorphBounds = MorphBounds {
        min: Vec4::ZERO,
        max: Vec4::ZERO,
    };

    /// Largest absolute value per axis.
    #[must_use]
    pub fn abs_max(&self) -> Vec4 {
        self.min.abs().max(self.max.abs())
    }
}

/// A set of vertices affected by exactly the same morph targets.
///
/// Normalization divides by the accumulated absolute weight of the morphs
/// touching a vertex, so all vertices of a permutation share one divisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MorphPermutation {
    pub morphs: SmallVec<[u32; 4]>,
    /// First entry in [`MorphTargetSet::permutation_vertices`].
    pub vertex_start: u32,
    pub vertex_count: u32,
}

/// Packed delta as stored in the GPU delta buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PackedMorphDelta {
    pub vertex_index: u32,
    pub position_delta: [f32; 3],
    pub normal_delta: [f32; 3],
}

/// All morph targets of one LOD, plus the derived data used for batching.
///
/// Morph indices are mesh-wide: every LOD's set has the same length, and a
/// morph with no vertices in this LOD simply has no deltas.
#[derive(Debug, Clone, Default)]
pub struct MorphTargetSet {
    targets: Vec<MorphTarget>,
    delta_offsets: Vec<u32>,
    bounds: Vec<MorphBounds>,
    sections: Vec<SmallVec<[u32; 4]>>,
    permutations: Vec<MorphPermutation>,
    permutation_vertices: Vec<u32>,
}

impl MorphTargetSet {
    /// Builds the set and precomputes bounds, affected sections and
    /// vertex permutations.
    #[must_use]
    pub fn new(targets: Vec<MorphTarget>, sections: &[RenderSection]) -> Self {
        let mut delta_offsets = Vec::with_capacity(targets.len());
        let mut offset = 0u32;
        for target in &targets {
            delta_offsets.push(offset);
            offset += target.deltas.len() as u32;
        }

        let bounds = targets.iter().map(compute_bounds).collect();
        let affected = targets
            .iter()
            .map(|t| affected_sections(t, sections))
            .collect();
        let (permutations, permutation_vertices) = build_permutations(&targets);

        Self {
            targets,
            delta_offsets,
            bounds,
            sections: affected,
            permutations,
            permutation_vertices,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// True when at least one morph target has deltas in this LOD.
    #[must_use]
    pub fn has_deltas(&self) -> bool {
        self.targets.iter().any(|t| !t.deltas.is_empty())
    }

    #[must_use]
    pub fn targets(&self) -> &[MorphTarget] {
        &self.targets
    }

    #[must_use]
    pub fn target(&self, index: usize) -> Option<&MorphTarget> {
        self.targets.get(index)
    }

    #[must_use]
    pub fn bounds(&self) -> &[MorphBounds] {
        &self.bounds
    }

    /// Offset of a morph's first delta in the packed delta buffer.
    #[must_use]
    pub fn delta_offset(&self, index: usize) -> u32 {
        self.delta_offsets[index]
    }

    /// Section indices touched by a morph.
    #[must_use]
    pub fn sections_of(&self, index: usize) -> &[u32] {
        self.sections.get(index).map_or(&[], |s| s.as_slice())
    }

    #[must_use]
    pub fn permutations(&self) -> &[MorphPermutation] {
        &self.permutations
    }

    #[must_use]
    pub fn permutation_vertices(&self) -> &[u32] {
        &self.permutation_vertices
    }

    #[must_use]
    pub fn total_deltas(&self) -> usize {
        self.targets.iter().map(|t| t.deltas.len()).sum()
    }

    /// Deltas of every morph back to back, in morph order.
    #[must_use]
    pub fn packed_deltas(&self) -> Vec<PackedMorphDelta> {
        self.targets
            .iter()
            .flat_map(|t| t.deltas.iter())
            .map(|d| PackedMorphDelta {
                vertex_index: d.vertex_index,
                position_delta: d.position_delta.to_array(),
                normal_delta: d.normal_delta.to_array(),
            })
            .collect()
    }
}

fn compute_bounds(target: &MorphTarget) -> MorphBounds {
    if target.deltas.is_empty() {
        return MorphBounds::ZERO;
    }
    let mut min = Vec4::splat(f32::MAX);
    let mut max = Vec4::splat(f32::MIN);
    for delta in &target.deltas {
        let n = delta.normal_delta;
        let normal_min = n.x.min(n.y).min(n.z);
        let normal_max = n.x.max(n.y).max(n.z);
        min = min.min(delta.position_delta.extend(normal_min));
        max = max.max(delta.position_delta.extend(normal_max));
    }
    MorphBounds { min, max }
}

fn affected_sections(target: &MorphTarget, sections: &[RenderSection]) -> SmallVec<[u32; 4]> {
    let mut out = SmallVec::new();
    for (index, section) in sections.iter().enumerate() {
        let start = section.base_vertex_index;
        let end = start + section.num_vertices;
        if target
            .deltas
            .iter()
            .any(|d| d.vertex_index >= start && d.vertex_index < end)
        {
            out.push(index as u32);
        }
    }
    out
}

fn build_permutations(targets: &[MorphTarget]) -> (Vec<MorphPermutation>, Vec<u32>) {
    let mut per_vertex: FxHashMap<u32, SmallVec<[u32; 4]>> = FxHashMap::default();
    for (morph, target) in targets.iter().enumerate() {
        for delta in &target.deltas {
            let set = per_vertex.entry(delta.vertex_index).or_default();
            if set.last() != Some(&(morph as u32)) {
                set.push(morph as u32);
            }
        }
    }

    let mut groups: FxHashMap<SmallVec<[u32; 4]>, Vec<u32>> = FxHashMap::default();
    for (vertex, morphs) in per_vertex {
        groups.entry(morphs).or_default().push(vertex);
    }

    // Stable order so uploads are deterministic.
    let mut groups: Vec<_> = groups.into_iter().collect();
    groups.sort_unstable_by(|a, b| a.0.cmp(&b.0));

    let mut permutations = Vec::with_capacity(groups.len());
    let mut vertices = Vec::new();
    for (morphs, mut group) in groups {
        group.sort_unstable();
        permutations.push(MorphPermutation {
            morphs,
            vertex_start: vertices.len() as u32,
            vertex_count: group.len() as u32,
        });
        vertices.extend(group);
    }
    (permutations, vertices)
}
