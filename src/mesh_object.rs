//! Skeletal Mesh GPU Object
//!
//! Render-thread owner of one skinned instance's GPU state: vertex factories
//! and the morph vertex buffer of every LOD, the skin cache entries of the
//! LOD in use, and the snapshots the GPU may be reading.
//!
//! # Snapshot lifecycle
//!
//! ```text
//!           stage()                 commit()                next stage()
//!   Idle ───────────► SnapshotQueued ───────► live (fenced) ─────────────► previous
//!     ▲                                                                      │
//!     └────────────────────── fence signaled, storage freed ◄── AwaitingFence┘
//! ```
//!
//! `stage` always runs when a snapshot arrives. `commit` processes it either
//! right away or at the renderer's pre-frame commit point, depending on the
//! [`CommitPolicy`](crate::settings::CommitPolicy). A snapshot that is
//! replaced before it was committed was never read by the GPU and is freed
//! at once; its "morphs changed" flag carries over to the replacement.

use std::sync::Arc;

use crate::device::{FenceId, SkinDevice};
use crate::errors::{Result, SkinError};
use crate::fence::FenceGuarded;
use crate::frame::FrameContext;
use crate::lod::{BoundingSphere, LodSelector, LodView};
use crate::mesh::{ClothSimData, LodRenderData, RenderSection, SkinnedMeshRenderData};
use crate::morph::MorphVertexBuffer;
use crate::render_queue::InstanceId;
use crate::renderer::SkinningResources;
use crate::settings::LodSettings;
use crate::skin_cache::{ClothSkinInputs, SkinCacheEntryKey, SkinCacheRequest};
use crate::snapshot::DynamicSkinningSnapshot;
use crate::vertex_factory::{GpuSkinVertexFactory, SectionFactories, VertexSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshObjectState {
    /// Nothing staged and no snapshot the GPU may still read.
    Idle,
    /// A snapshot is staged and waits for its commit.
    SnapshotQueued,
    /// A committed snapshot (live or previous) waits for its frame fence.
    AwaitingFence,
}

#[derive(Debug)]
struct LiveSnapshot {
    snapshot: DynamicSkinningSnapshot,
    /// Frame fence of the commit that read it; `None` until committed.
    fence: Option<FenceId>,
}

#[derive(Debug, Clone, Copy)]
struct PendingCommit {
    frame_to_prepare: u64,
    revision: u32,
    morph_needs_update: bool,
}

#[derive(Debug)]
struct MeshObjectLod {
    factories: Vec<SectionFactories>,
    morph_buffer: MorphVertexBuffer,
}

impl MeshObjectLod {
    fn new(lod: &LodRenderData) -> Self {
        let factories = lod
            .sections
            .iter()
            .enumerate()
            .map(|(index, section)| {
                let has_morph = (0..lod.morph_targets.len())
                    .any(|m| lod.morph_targets.sections_of(m).contains(&(index as u32)));
                SectionFactories::new(has_morph, section.cloth_region.is_some())
            })
            .collect();
        Self {
            factories,
            morph_buffer: MorphVertexBuffer::new(lod.num_vertices),
        }
    }
}

#[derive(Debug)]
pub struct SkeletalMeshGPUObject {
    id: InstanceId,
    mesh: Arc<SkinnedMeshRenderData>,
    lods: Vec<MeshObjectLod>,
    live: Option<LiveSnapshot>,
    previous: Option<FenceGuarded<DynamicSkinningSnapshot>>,
    pending: Option<PendingCommit>,
    cache_entries: Vec<Option<SkinCacheEntryKey>>,
    processed_lod: Option<usize>,
    last_revision: Option<u32>,
    last_frame_prepared: Option<u64>,
    lod_selector: LodSelector,
}

impl SkeletalMeshGPUObject {
    #[must_use]
    pub fn new(id: InstanceId, mesh: Arc<SkinnedMeshRenderData>) -> Self {
        let lods = mesh.lods.iter().map(MeshObjectLod::new).collect();
        log::debug!("Created GPU object for '{}' ({:?}, {} LODs)", mesh.name, id, mesh.num_lods());
        Self {
            id,
            mesh,
            lods,
            live: None,
            previous: None,
            pending: None,
            cache_entries: Vec::new(),
            processed_lod: None,
            last_revision: None,
            last_frame_prepared: None,
            lod_selector: LodSelector::new(),
        }
    }

    // ── Snapshot handoff ───────────────────────────────────────────────────

    /// Makes `snapshot` the live snapshot and queues it for commit.
    pub fn stage(
        &mut self,
        device: &dyn SkinDevice,
        snapshot: DynamicSkinningSnapshot,
        frame_to_prepare: u64,
        revision: u32,
        res: &mut SkinningResources,
    ) {
        let threshold = res.settings.morph.weight_threshold;
        let mut morph_needs_update = self
            .live
            .as_ref()
            .is_none_or(|live| !live.snapshot.active_morphs_equal(&snapshot, threshold));

        if let Some(pending) = self.pending.take() {
            morph_needs_update |= pending.morph_needs_update;
        }

        if let Some(old) = self.live.take() {
            match old.fence {
                None => res.free_snapshot(old.snapshot),
                Some(fence) => {
                    if let Some(previous) = self.previous.take() {
                        res.retire_snapshot(previous, device);
                    }
                    self.previous = Some(FenceGuarded::new(old.snapshot, fence));
                }
            }
        }

        self.live = Some(LiveSnapshot {
            snapshot,
            fence: None,
        });
        self.pending = Some(PendingCommit {
            frame_to_prepare,
            revision,
            morph_needs_update,
        });
    }

    /// Processes the staged snapshot, if any. Returns whether work was recorded.
    pub fn commit(&mut self, ctx: &mut FrameContext<'_>, res: &mut SkinningResources) -> Result<bool> {
        let Some(pending) = self.pending.take() else {
            return Ok(false);
        };
        self.process(ctx, res, pending)?;
        if let Some(live) = &mut self.live {
            live.fence = Some(ctx.frame_fence());
        }
        self.last_revision = Some(pending.revision);
        self.last_frame_prepared = Some(pending.frame_to_prepare);
        Ok(true)
    }

    /// Frees the previous snapshot once its fence signaled.
    pub fn reclaim(&mut self, device: &dyn SkinDevice, res: &mut SkinningResources) {
        if let Some(previous) = self.previous.take() {
            match previous.try_take(device) {
                Ok(snapshot) => res.free_snapshot(snapshot),
                Err(previous) => self.previous = Some(previous),
            }
        }
    }

    fn process(
        &mut self,
        ctx: &mut FrameContext<'_>,
        res: &mut SkinningResources,
        pending: PendingCommit,
    ) -> Result<()> {
        let mesh = Arc::clone(&self.mesh);
        let Some(live) = &self.live else {
            return Ok(());
        };
        let snapshot = &live.snapshot;
        if mesh.lods.is_empty() {
            return Ok(());
        }

        let lod = snapshot
            .forced_lod()
            .unwrap_or(self.lod_selector.min_desired_lod())
            .min(mesh.lods.len() - 1);
        let lod_data = &mesh.lods[lod];

        let mut morph_needs_update = pending.morph_needs_update;
        if self.processed_lod != Some(lod) {
            for slot in &mut self.cache_entries {
                res.skin_cache.release(ctx, slot);
            }
            self.cache_entries = vec![None; lod_data.sections.len()];
            self.processed_lod = Some(lod);
            morph_needs_update = true;
        }
        self.lod_selector.set_current_lod(lod);

        let revision = pending.revision;
        let previous_revision = self.last_revision.unwrap_or(revision);
        let lod_object = &mut self.lods[lod];

        // Morph targets
        let use_gpu_morph = res.capabilities.compute_shaders && res.settings.morph.use_gpu;
        let set = &lod_data.morph_targets;
        let mut morph_active = snapshot.num_weighted_active_morphs() > 0 && set.has_deltas();
        if morph_active
            && let Err(err) = lod_object.morph_buffer.ensure_initialized(ctx, set, use_gpu_morph)
        {
            res.log_failure_once(&err);
            morph_active = false;
        }
        if morph_active {
            if morph_needs_update || !lod_object.morph_buffer.has_been_updated() {
                if use_gpu_morph {
                    lod_object.morph_buffer.update_gpu(
                        ctx,
                        set,
                        snapshot.active_morphs(),
                        res.settings.morph.dispatch_batch_size,
                    );
                } else {
                    lod_object.morph_buffer.update_cpu(ctx, set, snapshot.active_morphs());
                }
            }
        } else {
            lod_object.morph_buffer.clear_if_needed(ctx);
        }
        let morph_sections = if morph_active {
            snapshot.morph_sections(set)
        } else {
            Vec::new()
        };
        let morph_handle = lod_object.morph_buffer.handle();

        // Sections
        for (index, section) in lod_data.sections.iter().enumerate() {
            let cloth_sim = section
                .cloth_region
                .and_then(|region| snapshot.cloth(region))
                .filter(|_| lod_data.buffers.cloth_mapping.is_some());
            let use_morph = morph_sections.binary_search(&(index as u32)).is_ok();
            let factory = lod_object.factories[index].select(cloth_sim.is_some(), use_morph);

            if !section.has_bone_influences() {
                res.skin_cache.release(ctx, &mut self.cache_entries[index]);
                continue;
            }

            if let Err(err) = upload_section_data(ctx, res, factory, snapshot, section, cloth_sim, revision) {
                if !matches!(err, SkinError::ResourceExhaustion { .. }) {
                    return Err(err);
                }
                res.log_failure_once(&err);
                res.skin_cache.release(ctx, &mut self.cache_entries[index]);
                continue;
            }

            let (Some(bones), Some(previous_bones)) = (factory.bones.buffer(false), factory.bones.buffer(true))
            else {
                continue;
            };
            let cloth = cloth_sim.and_then(|sim| {
                Some(ClothSkinInputs {
                    simulation: factory.cloth.as_ref()?.buffer()?,
                    mapping: lod_data.buffers.cloth_mapping?,
                    local_to_cloth: sim.local_to_world.inverse() * snapshot.component_to_world(),
                    blend_weight: snapshot.cloth_blend_weight(),
                })
            });

            let request = SkinCacheRequest {
                section_index: index,
                section,
                buffers: &lod_data.buffers,
                factory: factory.id(),
                kind: factory.kind(),
                bones,
                previous_bones,
                morph: if use_morph { morph_handle } else { None },
                cloth,
                revision,
                previous_revision,
                material_recompute_tangents: section.recompute_tangents,
            };
            res.skin_cache
                .process_entry(ctx, &request, &mut self.cache_entries[index])?;
        }

        log::trace!(
            "{:?} committed revision {} at LOD {} for frame {}",
            self.id,
            revision,
            lod,
            pending.frame_to_prepare
        );
        Ok(())
    }

    // ── LOD ────────────────────────────────────────────────────────────────

    pub fn update_lod(
        &mut self,
        view: &LodView,
        bounds: &BoundingSphere,
        frame_number: u64,
        settings: &LodSettings,
    ) {
        self.lod_selector
            .update_for_view(view, bounds, &self.mesh.lod_info, frame_number, settings);
    }

    // ── Draw-time queries ──────────────────────────────────────────────────

    /// Where `section` of the processed LOD reads its vertices.
    #[must_use]
    pub fn vertex_source(&self, section: usize, res: &SkinningResources) -> Option<VertexSource> {
        let lod = self.processed_lod?;
        let lod_data = &self.mesh.lods[lod];
        let lod_object = &self.lods[lod];
        let factories = lod_object.factories.get(section)?;

        if let Some(key) = self.cache_entries.get(section).copied().flatten()
            && let Some(buffers) = res.skin_cache.vertex_source(key)
        {
            return Some(VertexSource::Passthrough {
                factory: factories.passthrough_id(),
                buffers,
            });
        }

        Some(VertexSource::original(
            factories,
            &lod_data.buffers,
            lod_object.morph_buffer.handle(),
            &lod_data.sections[section],
        ))
    }

    // ── Teardown ───────────────────────────────────────────────────────────

    /// Returns every GPU resource and snapshot, fence-gated on the current frame.
    pub fn release(&mut self, ctx: &mut FrameContext<'_>, res: &mut SkinningResources) {
        for slot in &mut self.cache_entries {
            res.skin_cache.release(ctx, slot);
        }
        self.cache_entries.clear();

        for lod in &mut self.lods {
            for factories in &mut lod.factories {
                factories.release(ctx, &mut res.bone_pool, &mut res.cloth_pool);
            }
            lod.morph_buffer.release(ctx);
        }

        self.pending = None;
        if let Some(live) = self.live.take() {
            match live.fence {
                Some(fence) => res.retire_snapshot(FenceGuarded::new(live.snapshot, fence), ctx.device()),
                None => res.free_snapshot(live.snapshot),
            }
        }
        if let Some(previous) = self.previous.take() {
            res.retire_snapshot(previous, ctx.device());
        }
        self.processed_lod = None;
        log::debug!("Released GPU object {:?}", self.id);
    }

    // ── Accessors ──────────────────────────────────────────────────────────

    #[must_use]
    pub fn id(&self) -> InstanceId {
        self.id
    }

    #[must_use]
    pub fn mesh(&self) -> &Arc<SkinnedMeshRenderData> {
        &self.mesh
    }

    #[must_use]
    pub fn state(&self, device: &dyn SkinDevice) -> MeshObjectState {
        let live_in_flight = self
            .live
            .as_ref()
            .and_then(|live| live.fence)
            .is_some_and(|fence| !device.is_fence_signaled(fence));
        if self.pending.is_some() {
            MeshObjectState::SnapshotQueued
        } else if live_in_flight || self.previous.as_ref().is_some_and(|p| !p.is_ready(device)) {
            MeshObjectState::AwaitingFence
        } else {
            MeshObjectState::Idle
        }
    }

    /// LOD of the last commit.
    #[must_use]
    pub fn processed_lod(&self) -> Option<usize> {
        self.processed_lod
    }

    #[must_use]
    pub fn lod_selector(&self) -> &LodSelector {
        &self.lod_selector
    }

    #[must_use]
    pub fn live_snapshot(&self) -> Option<&DynamicSkinningSnapshot> {
        self.live.as_ref().map(|l| &l.snapshot)
    }

    #[must_use]
    pub fn has_previous_snapshot(&self) -> bool {
        self.previous.is_some()
    }

    #[must_use]
    pub fn last_revision(&self) -> Option<u32> {
        self.last_revision
    }

    #[must_use]
    pub fn last_frame_prepared(&self) -> Option<u64> {
        self.last_frame_prepared
    }

    #[must_use]
    pub fn cache_entry(&self, section: usize) -> Option<SkinCacheEntryKey> {
        self.cache_entries.get(section).copied().flatten()
    }
}

fn upload_section_data(
    ctx: &mut FrameContext<'_>,
    res: &mut SkinningResources,
    factory: &mut GpuSkinVertexFactory,
    snapshot: &DynamicSkinningSnapshot,
    section: &RenderSection,
    cloth_sim: Option<&ClothSimData>,
    revision: u32,
) -> Result<()> {
    if let Some(previous) = snapshot.previous_ref_to_local() {
        factory
            .bones
            .update(ctx, &mut res.bone_pool, previous, &section.bone_map, revision, true)?;
    }
    factory.bones.update(
        ctx,
        &mut res.bone_pool,
        snapshot.ref_to_local(),
        &section.bone_map,
        revision,
        false,
    )?;

    if let (Some(sim), Some(cloth)) = (cloth_sim, factory.cloth.as_mut()) {
        cloth.update(ctx, &mut res.cloth_pool, sim, snapshot.cloth_blend_weight())?;
    }
    Ok(())
}
