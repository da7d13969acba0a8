//! Dynamic Skinning Snapshot
//!
//! Everything the render thread needs to skin one instance for one frame,
//! captured on the simulation thread:
//!
//! - reference-to-local bone matrices (current, optionally previous)
//! - active morph targets and their weights
//! - cloth simulation results per region and the cloth blend weight
//! - the component transform and an optional forced LOD
//!
//! A snapshot is immutable from the moment it is built until its storage goes
//! back to the [`SnapshotPool`]. It holds data for the whole mesh, not for one
//! LOD, so the render thread is free to pick the LOD itself.
//!
//! ```text
//! sim thread                          render thread
//! ──────────                          ─────────────
//! SnapshotBuilder::build ─► queue ─► stage (live) ─► commit
//!                                       │
//!                                       ▼  replaced by the next snapshot
//!                                    previous (FenceGuarded) ─► SnapshotPool::free
//! ```

mod pool;

pub use pool::SnapshotPool;

use glam::Mat4;

use crate::mesh::{ClothSimData, SkeletonPose};
use crate::morph::{ActiveMorphTarget, MorphTargetSet};
use crate::settings::MorphSettings;

#[derive(Debug)]
pub(crate) struct SnapshotData {
    ref_to_local: Vec<Mat4>,
    previous_ref_to_local: Vec<Mat4>,
    has_previous: bool,
    active_morphs: Vec<ActiveMorphTarget>,
    cloth: Vec<Option<ClothSimData>>,
    cloth_blend_weight: f32,
    component_to_world: Mat4,
    forced_lod: Option<usize>,
    revision: u32,
}

impl Default for SnapshotData {
    fn default() -> Self {
        Self {
            ref_to_local: Vec::new(),
            previous_ref_to_local: Vec::new(),
            has_previous: false,
            active_morphs: Vec::new(),
            cloth: Vec::new(),
            cloth_blend_weight: 0.0,
            component_to_world: Mat4::IDENTITY,
            forced_lod: None,
            revision: 0,
        }
    }
}

impl SnapshotData {
    /// Clears contents, keeping allocations.
    pub(crate) fn reset(&mut self) {
        self.ref_to_local.clear();
        self.previous_ref_to_local.clear();
        self.has_previous = false;
        self.active_morphs.clear();
        self.cloth.clear();
        self.cloth_blend_weight = 0.0;
        self.component_to_world = Mat4::IDENTITY;
        self.forced_lod = None;
        self.revision = 0;
    }
}

/// Immutable per-frame skinning state of one instance.
#[derive(Debug)]
pub struct DynamicSkinningSnapshot {
    data: Box<SnapshotData>,
}

impl DynamicSkinningSnapshot {
    fn into_data(self) -> Box<SnapshotData> {
        self.data
    }

    #[must_use]
    pub fn ref_to_local(&self) -> &[Mat4] {
        &self.data.ref_to_local
    }

    #[must_use]
    pub fn previous_ref_to_local(&self) -> Option<&[Mat4]> {
        self.data
            .has_previous
            .then_some(self.data.previous_ref_to_local.as_slice())
    }

    /// Active morphs sorted by morph index.
    #[must_use]
    pub fn active_morphs(&self) -> &[ActiveMorphTarget] {
        &self.data.active_morphs
    }

    #[must_use]
    pub fn num_weighted_active_morphs(&self) -> usize {
        self.data
            .active_morphs
            .iter()
            .filter(|m| m.weight != 0.0)
            .count()
    }

    /// Cloth simulation result of `region`, if it was simulated this frame.
    #[must_use]
    pub fn cloth(&self, region: usize) -> Option<&ClothSimData> {
        self.data.cloth.get(region).and_then(Option::as_ref)
    }

    #[must_use]
    pub fn has_cloth(&self) -> bool {
        self.data.cloth.iter().any(Option::is_some)
    }

    #[must_use]
    pub fn cloth_blend_weight(&self) -> f32 {
        self.data.cloth_blend_weight
    }

    #[must_use]
    pub fn component_to_world(&self) -> Mat4 {
        self.data.component_to_world
    }

    #[must_use]
    pub fn forced_lod(&self) -> Option<usize> {
        self.data.forced_lod
    }

    #[must_use]
    pub fn revision(&self) -> u32 {
        self.data.revision
    }

    /// True when both snapshots blend the same morphs with weights closer
    /// than `threshold`.
    #[must_use]
    pub fn active_morphs_equal(&self, other: &DynamicSkinningSnapshot, threshold: f32) -> bool {
        let a = &self.data.active_morphs;
        let b = &other.data.active_morphs;
        a.len() == b.len()
            && a.iter()
                .zip(b)
                .all(|(x, y)| x.index == y.index && (x.weight - y.weight).abs() < threshold)
    }

    /// Section indices of `set` touched by at least one active morph.
    #[must_use]
    pub fn morph_sections(&self, set: &MorphTargetSet) -> Vec<u32> {
        let mut sections: Vec<u32> = self
            .data
            .active_morphs
            .iter()
            .flat_map(|m| set.sections_of(m.index as usize).iter().copied())
            .collect();
        sections.sort_unstable();
        sections.dedup();
        sections
    }
}

/// Simulation-side inputs of one snapshot.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotInputs<'a> {
    pub pose: &'a SkeletonPose,
    /// Last frame's pose, for motion vectors.
    pub previous_pose: Option<&'a SkeletonPose>,
    pub inverse_bind: &'a [Mat4],
    /// Weight per mesh-wide morph index.
    pub morph_weights: &'a [f32],
    /// Simulation result per cloth region.
    pub cloth: &'a [Option<ClothSimData>],
    pub cloth_blend_weight: f32,
    pub component_to_world: Mat4,
    pub forced_lod: Option<usize>,
    pub revision: u32,
}

/// Builds snapshots into pooled storage.
pub struct SnapshotBuilder<'a> {
    pool: &'a SnapshotPool,
    min_blend_weight: f32,
    max_blend_weight: f32,
}

impl<'a> SnapshotBuilder<'a> {
    #[must_use]
    pub fn new(pool: &'a SnapshotPool, morph: &MorphSettings) -> Self {
        Self {
            pool,
            min_blend_weight: morph.min_blend_weight,
            max_blend_weight: morph.max_blend_weight,
        }
    }

    #[must_use]
    pub fn build(&self, inputs: &SnapshotInputs<'_>) -> DynamicSkinningSnapshot {
        let mut data = self.pool.allocate();

        inputs
            .pose
            .write_ref_to_local(inputs.inverse_bind, &mut data.ref_to_local);
        if let Some(previous) = inputs.previous_pose {
            previous.write_ref_to_local(inputs.inverse_bind, &mut data.previous_ref_to_local);
            data.has_previous = true;
        }

        data.active_morphs.extend(
            inputs
                .morph_weights
                .iter()
                .enumerate()
                .filter(|(_, w)| {
                    let w = w.abs();
                    w >= self.min_blend_weight && w <= self.max_blend_weight
                })
                .map(|(index, &weight)| ActiveMorphTarget {
                    index: index as u32,
                    weight,
                }),
        );

        data.cloth.extend(inputs.cloth.iter().cloned());
        data.cloth_blend_weight = inputs.cloth_blend_weight;
        data.component_to_world = inputs.component_to_world;
        data.forced_lod = inputs.forced_lod;
        data.revision = inputs.revision;

        DynamicSkinningSnapshot { data }
    }
}
