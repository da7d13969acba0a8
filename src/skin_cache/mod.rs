//! Skin Cache
//!
//! Skins each section once per frame with a compute pass and keeps the
//! result in pooled output buffers. Draw calls (main view, shadows,
//! velocity) then read the cached vertices through a passthrough factory
//! instead of re-skinning in every vertex shader.
//!
//! # Frame protocol
//!
//! ```text
//! begin_frame()                      reset counters, outputs not readable
//!   process_entry(section) × N       allocate / dispatch into current slot
//! transition_all_to_readable()       one barrier over everything written
//!   vertex_source(entry)             draw-time lookup
//! end_frame()                        trim idle pooled buffers
//! ```
//!
//! # Memory policy
//!
//! Entries are admitted greedily against `budget_bytes`. A section that does
//! not fit is rendered uncached and its requirement is added to
//! [`SkinCache::extra_required_memory`]; it retries next frame. Tangent
//! scratch buffers count against the same budget for the frame that uses
//! them. A section whose scratch does not fit loses its entry.
//!
//! Each entry double-buffers its outputs through a
//! [`DoubleBufferedResourceTracker`](crate::tracker::DoubleBufferedResourceTracker):
//! the current slot receives this revision, the other keeps the previous one
//! for motion vectors. A slot that already holds the requested
//! `(factory, revision)` is not dispatched again.

mod entry;
pub mod tangents;

pub use entry::{
    ClothSkinInputs, SkinCacheEntry, SkinCacheEntryKey, SkinCacheRequest, entry_footprint,
};

use glam::Mat4;
use rustc_hash::FxHashSet;
use slotmap::SlotMap;
use smallvec::SmallVec;

use self::entry::OutputBuffers;
use self::tangents::{TANGENT_WORKGROUP_SIZE, accumulator_size};
use crate::device::{
    BufferHandle, DeviceCapabilities, RecomputeTangentsParams, ResourceAccess,
    SkinDispatchParams, SkinDevice, SkinKernel, SkinPermutation,
};
use crate::errors::{Result, SkinError};
use crate::frame::FrameContext;
use crate::mesh::{POSITION_STRIDE, TANGENT_STRIDE};
use crate::pool::{PoolStats, SkinCacheBufferPool};
use crate::settings::{RecomputeTangents, SkinCacheMode, SkinCacheSettings};
use crate::tracker::DoubleBufferedResourceTracker;
use crate::vertex_factory::{FactoryCaps, FactoryKind, PassthroughBuffers};

/// Threads per skinning workgroup.
pub const SKIN_WORKGROUP_SIZE: u32 = 64;

/// Per-frame counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkinCacheFrameStats {
    pub cached_sections: u32,
    pub uncached_sections: u32,
    pub skin_dispatches: u32,
    pub skipped_dispatches: u32,
    pub tangent_dispatches: u32,
}

pub struct SkinCache {
    settings: SkinCacheSettings,
    inert: bool,
    entries: SlotMap<SkinCacheEntryKey, SkinCacheEntry>,
    pool: SkinCacheBufferPool,
    used_bytes: u64,
    /// Tangent scratch acquired this frame.
    scratch_bytes: u64,
    extra_required: u64,
    written: Vec<BufferHandle>,
    written_entries: FxHashSet<SkinCacheEntryKey>,
    readable: bool,
    logged_failures: FxHashSet<&'static str>,
    stats: SkinCacheFrameStats,
}

impl SkinCache {
    /// Creates the cache. Whether it is active is decided here, once.
    #[must_use]
    pub fn new(settings: SkinCacheSettings, capabilities: DeviceCapabilities) -> Self {
        let inert = if !capabilities.compute_shaders {
            log::warn!("Skin cache inert: {}", SkinError::CapabilityUnsupported("compute shaders".into()));
            true
        } else if settings.mode == SkinCacheMode::Disabled {
            log::info!("Skin cache disabled by settings");
            true
        } else {
            log::info!(
                "Skin cache enabled ({:?}, budget {} bytes)",
                settings.mode,
                settings.budget_bytes
            );
            false
        };

        Self {
            settings,
            inert,
            entries: SlotMap::with_key(),
            pool: SkinCacheBufferPool::new(),
            used_bytes: 0,
            scratch_bytes: 0,
            extra_required: 0,
            written: Vec::new(),
            written_entries: FxHashSet::default(),
            readable: false,
            logged_failures: FxHashSet::default(),
            stats: SkinCacheFrameStats::default(),
        }
    }

    // ── Frame boundary ─────────────────────────────────────────────────────

    pub fn begin_frame(&mut self, device: &dyn SkinDevice) {
        self.extra_required = 0;
        self.scratch_bytes = 0;
        self.written.clear();
        self.written_entries.clear();
        self.readable = false;
        self.stats = SkinCacheFrameStats::default();
        self.pool.reclaim(device);
    }

    /// One barrier making every output written this frame readable.
    pub fn transition_all_to_readable(&mut self, ctx: &mut FrameContext<'_>) {
        if !self.written.is_empty() {
            ctx.transition(&self.written, ResourceAccess::Readable);
        }
        self.readable = true;
    }

    pub fn end_frame(&mut self, device: &dyn SkinDevice) {
        self.pool.trim(device, self.settings.max_idle_frames);
    }

    // ── Entries ────────────────────────────────────────────────────────────

    /// Creates or updates the entry of one section and records its dispatches.
    ///
    /// Returns `Ok(false)` when the section must use its uncached path this
    /// frame: inert cache, no bone influences, filtered by mode, a request
    /// whose inputs the factory cannot read, over budget, or out of memory.
    /// Any entry the section held is released in that case.
    pub fn process_entry(
        &mut self,
        ctx: &mut FrameContext<'_>,
        request: &SkinCacheRequest<'_>,
        slot: &mut Option<SkinCacheEntryKey>,
    ) -> Result<bool> {
        let recompute = match self.settings.recompute_tangents {
            RecomputeTangents::Off => false,
            RecomputeTangents::All => true,
            RecomputeTangents::MaterialDriven => request.material_recompute_tangents,
        };

        let eligible = !self.inert
            && request.section.has_bone_influences()
            && (self.settings.mode != SkinCacheMode::RecomputeTangentsOnly || recompute)
            && self.request_is_valid(request);
        if !eligible {
            self.release(ctx, slot);
            self.stats.uncached_sections += 1;
            return Ok(false);
        }

        let num_vertices = request.section.num_vertices;
        let reusable = slot.filter(|k| {
            self.entries
                .get(*k)
                .is_some_and(|e| e.num_vertices == num_vertices && e.section_index == request.section_index)
        });
        let key = if let Some(key) = reusable {
            key
        } else {
            self.release(ctx, slot);
            match self.create_entry(ctx, request)? {
                Some(key) => {
                    *slot = Some(key);
                    key
                }
                None => {
                    self.stats.uncached_sections += 1;
                    return Ok(false);
                }
            }
        };

        if !self.dispatch_entry(ctx, key, request, recompute)? {
            self.release(ctx, slot);
            self.stats.uncached_sections += 1;
            return Ok(false);
        }
        self.stats.cached_sections += 1;
        Ok(true)
    }

    /// Checks the request's extra inputs against what its factory reads.
    fn request_is_valid(&mut self, request: &SkinCacheRequest<'_>) -> bool {
        let caps = request.kind.caps();
        let reason = if request.kind == FactoryKind::Passthrough {
            Some("passthrough factory cannot be skinned")
        } else if request.morph.is_some() && !caps.contains(FactoryCaps::HAS_MORPH_DATA) {
            Some("morph buffer bound to a factory without morph data")
        } else if request.cloth.is_some() && !caps.contains(FactoryCaps::HAS_CLOTH_DATA) {
            Some("cloth inputs bound to a factory without cloth data")
        } else {
            None
        };
        match reason {
            Some(reason) => {
                if self.logged_failures.insert(reason) {
                    log::error!(
                        "Skin cache rejected section {} ({:?} factory): {reason}",
                        request.section_index,
                        request.kind
                    );
                }
                false
            }
            None => true,
        }
    }

    fn create_entry(
        &mut self,
        ctx: &mut FrameContext<'_>,
        request: &SkinCacheRequest<'_>,
    ) -> Result<Option<SkinCacheEntryKey>> {
        let num_vertices = request.section.num_vertices;
        let Some(footprint) = entry_footprint(num_vertices) else {
            self.log_failure_once(&SkinError::exhausted(
                "Skin Cache Output",
                u64::from(num_vertices) * POSITION_STRIDE,
                "section exceeds largest output bucket",
            ));
            return Ok(None);
        };

        if self.used_bytes + self.scratch_bytes + footprint > self.settings.budget_bytes {
            self.extra_required += footprint;
            log::debug!(
                "Skin cache over budget: section {} needs {} bytes ({} / {} used)",
                request.section_index,
                footprint,
                self.used_bytes + self.scratch_bytes,
                self.settings.budget_bytes
            );
            return Ok(None);
        }

        let device = ctx.device();
        let mut acquired: SmallVec<[crate::pool::PooledBuffer; 4]> = SmallVec::new();
        let sizes = [
            u64::from(num_vertices) * POSITION_STRIDE,
            u64::from(num_vertices) * TANGENT_STRIDE,
            u64::from(num_vertices) * POSITION_STRIDE,
            u64::from(num_vertices) * TANGENT_STRIDE,
        ];
        for size in sizes {
            match self.pool.acquire(device, size) {
                Ok(buffer) => acquired.push(buffer),
                Err(err @ SkinError::ResourceExhaustion { .. }) => {
                    // Never handed to the GPU, safe to return immediately.
                    for buffer in acquired.drain(..) {
                        self.pool.release(buffer);
                    }
                    self.log_failure_once(&err);
                    return Ok(None);
                }
                Err(err) => {
                    for buffer in acquired.drain(..) {
                        self.pool.release(buffer);
                    }
                    return Err(err);
                }
            }
        }

        let mut buffers = acquired.into_iter();
        let (Some(p0), Some(t0), Some(p1), Some(t1)) =
            (buffers.next(), buffers.next(), buffers.next(), buffers.next())
        else {
            return Ok(None);
        };

        self.used_bytes += footprint;
        let key = self.entries.insert(SkinCacheEntry {
            section_index: request.section_index,
            num_vertices,
            footprint,
            tracker: DoubleBufferedResourceTracker::new([
                OutputBuffers {
                    positions: p0,
                    tangents: t0,
                },
                OutputBuffers {
                    positions: p1,
                    tangents: t1,
                },
            ]),
            current_slot: 0,
            previous_slot: 0,
            revision: request.revision,
            recompute_tangents: false,
        });
        Ok(Some(key))
    }

    fn dispatch_entry(
        &mut self,
        ctx: &mut FrameContext<'_>,
        key: SkinCacheEntryKey,
        request: &SkinCacheRequest<'_>,
        recompute: bool,
    ) -> Result<bool> {
        let entry = &mut self.entries[key];
        entry.recompute_tangents = recompute;
        entry.revision = request.revision;

        let retagged = entry.tracker.advance(
            request.factory,
            request.revision,
            request.factory,
            request.previous_revision,
        );
        let Some(current) = entry.tracker.find(request.factory, request.revision) else {
            log::error!("Skin cache tracker lost the current revision of section {}", request.section_index);
            return Ok(false);
        };
        let previous = entry
            .tracker
            .find(request.factory, request.previous_revision)
            .unwrap_or(current);
        entry.current_slot = current;
        entry.previous_slot = previous;

        let mut targets: SmallVec<[(usize, BufferHandle); 2]> = SmallVec::new();
        targets.push((current, request.bones));
        if previous != current {
            targets.push((previous, request.previous_bones));
        }

        let mut jobs: SmallVec<[(BufferHandle, BufferHandle, BufferHandle); 2]> = SmallVec::new();
        for (slot, bones) in targets {
            if retagged.contains(&slot) {
                let out = entry.tracker.payload(slot);
                jobs.push((out.positions.handle(), out.tangents.handle(), bones));
            } else if slot == current {
                self.stats.skipped_dispatches += 1;
            }
        }
        let footprint = entry.footprint;

        let scratch = if recompute && !jobs.is_empty() {
            match self.acquire_scratch(ctx, request, footprint)? {
                Some(scratch) => Some(scratch),
                None => return Ok(false),
            }
        } else {
            None
        };

        self.written.extend(self.entries[key].handles());
        self.written_entries.insert(key);
        if !jobs.is_empty() {
            // Outputs written after the barrier need another one before drawing.
            self.readable = false;
        }

        for (positions, tangents, bones) in jobs {
            self.record_skin(ctx, request, positions, tangents, bones);
            if let Some(scratch) = &scratch {
                self.record_tangents(ctx, request, scratch.handle(), positions, tangents);
            }
        }
        if let Some(scratch) = scratch {
            self.pool.release_after(scratch, ctx.frame_fence());
        }
        Ok(true)
    }

    /// Scratch for one section's tangent recompute, charged to the budget.
    ///
    /// `Ok(None)` when it does not fit the budget or the pool is exhausted.
    fn acquire_scratch(
        &mut self,
        ctx: &FrameContext<'_>,
        request: &SkinCacheRequest<'_>,
        footprint: u64,
    ) -> Result<Option<crate::pool::PooledBuffer>> {
        let size = accumulator_size(request.section.num_vertices);
        let charged = SkinCacheBufferPool::pooled_size(size).unwrap_or(size);
        if self.used_bytes + self.scratch_bytes + charged > self.settings.budget_bytes {
            self.extra_required += footprint + charged;
            log::debug!(
                "Skin cache over budget: tangent scratch of section {} needs {} bytes",
                request.section_index,
                charged
            );
            return Ok(None);
        }
        match self.pool.acquire(ctx.device(), size) {
            Ok(scratch) => {
                self.scratch_bytes += scratch.size();
                Ok(Some(scratch))
            }
            Err(err @ SkinError::ResourceExhaustion { .. }) => {
                self.log_failure_once(&err);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn record_skin(
        &mut self,
        ctx: &mut FrameContext<'_>,
        request: &SkinCacheRequest<'_>,
        positions: BufferHandle,
        tangents: BufferHandle,
        bones: BufferHandle,
    ) {
        let section = request.section;
        let statics = request.buffers;

        let mut permutation = SkinPermutation::empty();
        let mut bindings: SmallVec<[BufferHandle; 8]> = SmallVec::from_slice(&[
            positions,
            tangents,
            bones,
            statics.positions,
            statics.tangents,
            statics.skin_weights,
        ]);
        if let Some(morph) = request.morph {
            permutation |= SkinPermutation::MORPH;
            bindings.push(morph);
        }
        if let Some(cloth) = request.cloth {
            permutation |= SkinPermutation::CLOTH;
            bindings.push(cloth.simulation);
            bindings.push(cloth.mapping);
        }

        let params = SkinDispatchParams {
            local_to_cloth: request
                .cloth
                .map_or(Mat4::IDENTITY, |c| c.local_to_cloth)
                .to_cols_array_2d(),
            base_vertex_index: section.base_vertex_index,
            num_vertices: section.num_vertices,
            max_bone_influences: section.max_bone_influences,
            cloth_blend_weight: request.cloth.map_or(0.0, |c| c.blend_weight),
        };

        ctx.transition(&[positions, tangents], ResourceAccess::Writable);
        ctx.dispatch(
            SkinKernel::SkinVertices(permutation),
            &bindings,
            &params,
            [section.num_vertices.div_ceil(SKIN_WORKGROUP_SIZE), 1, 1],
        );
        self.stats.skin_dispatches += 1;
    }

    fn record_tangents(
        &mut self,
        ctx: &mut FrameContext<'_>,
        request: &SkinCacheRequest<'_>,
        scratch: BufferHandle,
        positions: BufferHandle,
        tangents: BufferHandle,
    ) {
        let section = request.section;

        let params = RecomputeTangentsParams {
            base_index: section.base_index,
            num_triangles: section.num_triangles,
            base_vertex_index: section.base_vertex_index,
            num_vertices: section.num_vertices,
        };

        ctx.clear_buffer(scratch);
        ctx.transition(&[positions], ResourceAccess::Readable);
        ctx.transition(&[scratch], ResourceAccess::Writable);
        ctx.dispatch(
            SkinKernel::RecomputeTangentsPerTriangle,
            &[scratch, positions, request.buffers.indices],
            &params,
            [section.num_triangles.div_ceil(TANGENT_WORKGROUP_SIZE), 1, 1],
        );
        ctx.transition(&[scratch], ResourceAccess::Readable);
        ctx.dispatch(
            SkinKernel::RecomputeTangentsPerVertex,
            &[tangents, scratch, request.buffers.tangents],
            &params,
            [section.num_vertices.div_ceil(TANGENT_WORKGROUP_SIZE), 1, 1],
        );
        self.stats.tangent_dispatches += 2;
    }

    /// Releases the entry in `slot` (if any). Its buffers return to the pool
    /// once the current frame's fence signals.
    pub fn release(&mut self, ctx: &FrameContext<'_>, slot: &mut Option<SkinCacheEntryKey>) {
        let Some(key) = slot.take() else {
            return;
        };
        let Some(entry) = self.entries.remove(key) else {
            return;
        };
        self.used_bytes -= entry.footprint;
        for out in entry.tracker.into_payloads() {
            self.pool.release_after(out.positions, ctx.frame_fence());
            self.pool.release_after(out.tangents, ctx.frame_fence());
        }
    }

    /// Passthrough buffers of an entry.
    ///
    /// # Panics
    ///
    /// Panics if the entry was written this frame and
    /// [`Self::transition_all_to_readable`] has not run since.
    #[must_use]
    pub fn vertex_source(&self, key: SkinCacheEntryKey) -> Option<PassthroughBuffers> {
        let entry = self.entries.get(key)?;
        assert!(
            self.readable || !self.written_entries.contains(&key),
            "skin cache output of section {} read before transition_all_to_readable",
            entry.section_index
        );
        let current = entry.tracker.payload(entry.current_slot);
        let previous = entry.tracker.payload(entry.previous_slot);
        Some(PassthroughBuffers {
            positions: current.positions.handle(),
            previous_positions: previous.positions.handle(),
            tangents: current.tangents.handle(),
        })
    }

    /// Destroys all pooled memory. Every entry must have been released.
    pub fn shutdown(&mut self, device: &dyn SkinDevice) {
        if !self.entries.is_empty() {
            log::warn!("Skin cache shut down with {} live entries", self.entries.len());
        }
        self.pool.destroy_all(device);
    }

    fn log_failure_once(&mut self, err: &SkinError) {
        if self.logged_failures.insert(err.failure_class()) {
            log::warn!("Skin cache falling back to uncached skinning: {err}");
        }
    }

    // ── Queries ────────────────────────────────────────────────────────────

    #[must_use]
    pub fn is_inert(&self) -> bool {
        self.inert
    }

    #[must_use]
    pub fn settings(&self) -> &SkinCacheSettings {
        &self.settings
    }

    /// Bytes that would have been needed this frame beyond the budget.
    #[must_use]
    pub fn extra_required_memory(&self) -> u64 {
        self.extra_required
    }

    /// Bytes charged to the budget: live entries plus this frame's scratch.
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes + self.scratch_bytes
    }

    #[must_use]
    pub fn entry(&self, key: SkinCacheEntryKey) -> Option<&SkinCacheEntry> {
        self.entries.get(key)
    }

    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_readable(&self) -> bool {
        self.readable
    }

    #[must_use]
    pub fn frame_stats(&self) -> SkinCacheFrameStats {
        self.stats
    }

    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}
