//! Skinning Renderer
//!
//! Render-thread orchestrator. Owns every [`SkeletalMeshGPUObject`], the
//! bone/cloth pools and the skin cache; consumes the render command queue.
//!
//! # Frame flow
//!
//! ```text
//! let mut ctx = renderer.begin_frame(&device);   // reclaim fenced resources
//! renderer.update_lod(id, &view, &bounds);        // per view, optional
//! renderer.process_commands(&mut ctx)?;           // stage (+ immediate commit)
//! renderer.pre_frame_commit(&mut ctx)?;           // deferred commits
//! renderer.transition_all_to_readable(&mut ctx);  // one barrier
//! renderer.vertex_source(id, section);            // draw calls
//! renderer.end_frame(ctx)?;                       // submit, trim pools
//! ```

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::device::{BufferHandle, DeviceCapabilities, FenceId, SkinDevice};
use crate::errors::{Result, SkinError};
use crate::fence::{FenceGuarded, drain_ready};
use crate::frame::FrameContext;
use crate::lod::{BoundingSphere, LodView};
use crate::mesh_object::SkeletalMeshGPUObject;
use crate::pool::{BoneBufferPool, ClothBufferPool};
use crate::render_queue::{
    InstanceId, RenderCommand, RenderCommandReceiver, RenderCommandSender,
    render_command_channel,
};
use crate::settings::{CommitPolicy, SkinningSettings};
use crate::skin_cache::SkinCache;
use crate::snapshot::{DynamicSkinningSnapshot, SnapshotPool};
use crate::vertex_factory::VertexSource;

/// Shared render-thread state every mesh object works against.
pub struct SkinningResources {
    pub settings: SkinningSettings,
    pub capabilities: DeviceCapabilities,
    pub skin_cache: SkinCache,
    pub bone_pool: BoneBufferPool,
    pub cloth_pool: ClothBufferPool,
    snapshot_pool: Arc<SnapshotPool>,
    retired_snapshots: Vec<FenceGuarded<DynamicSkinningSnapshot>>,
    pending_destroys: Vec<FenceGuarded<BufferHandle>>,
    logged_failures: FxHashSet<&'static str>,
}

impl SkinningResources {
    #[must_use]
    pub fn new(settings: SkinningSettings, capabilities: DeviceCapabilities) -> Self {
        let settings = settings.validated();
        Self {
            skin_cache: SkinCache::new(settings.skin_cache.clone(), capabilities),
            snapshot_pool: Arc::new(SnapshotPool::new(settings.snapshot_pool.clone())),
            settings,
            capabilities,
            bone_pool: BoneBufferPool::new(),
            cloth_pool: ClothBufferPool::new(),
            retired_snapshots: Vec::new(),
            pending_destroys: Vec::new(),
            logged_failures: FxHashSet::default(),
        }
    }

    #[must_use]
    pub fn snapshot_pool(&self) -> &Arc<SnapshotPool> {
        &self.snapshot_pool
    }

    pub(crate) fn free_snapshot(&self, snapshot: DynamicSkinningSnapshot) {
        self.snapshot_pool.free(snapshot);
    }

    /// Frees `guarded` now if its fence signaled, otherwise once it does.
    pub(crate) fn retire_snapshot(
        &mut self,
        guarded: FenceGuarded<DynamicSkinningSnapshot>,
        device: &dyn SkinDevice,
    ) {
        match guarded.try_take(device) {
            Ok(snapshot) => self.snapshot_pool.free(snapshot),
            Err(guarded) => self.retired_snapshots.push(guarded),
        }
    }

    pub(crate) fn log_failure_once(&mut self, err: &SkinError) {
        if self.logged_failures.insert(err.failure_class()) {
            log::warn!("Skinning falling back for this section: {err}");
        }
    }

    fn reclaim(&mut self, device: &dyn SkinDevice) {
        for snapshot in drain_ready(&mut self.retired_snapshots, device) {
            self.snapshot_pool.free(snapshot);
        }
        for buffer in drain_ready(&mut self.pending_destroys, device) {
            device.destroy_buffer(buffer);
        }
        self.bone_pool.reclaim(device);
        self.cloth_pool.reclaim(device);
    }

    /// Snapshots waiting on a fence outside their mesh objects.
    #[must_use]
    pub fn retired_snapshot_count(&self) -> usize {
        self.retired_snapshots.len()
    }
}

pub struct SkinningRenderer {
    resources: SkinningResources,
    objects: FxHashMap<InstanceId, SkeletalMeshGPUObject>,
    sender: RenderCommandSender,
    receiver: RenderCommandReceiver,
    deferred: Vec<InstanceId>,
    frame_number: u64,
}

impl SkinningRenderer {
    #[must_use]
    pub fn new(settings: SkinningSettings, capabilities: DeviceCapabilities) -> Self {
        let (sender, receiver) = render_command_channel();
        Self {
            resources: SkinningResources::new(settings, capabilities),
            objects: FxHashMap::default(),
            sender,
            receiver,
            deferred: Vec::new(),
            frame_number: 0,
        }
    }

    /// Sender for the simulation thread.
    #[must_use]
    pub fn command_sender(&self) -> RenderCommandSender {
        self.sender.clone()
    }

    #[must_use]
    pub fn snapshot_pool(&self) -> Arc<SnapshotPool> {
        Arc::clone(&self.resources.snapshot_pool)
    }

    // ── Frame flow ─────────────────────────────────────────────────────────

    /// Starts a frame: reclaims everything whose fence signaled.
    pub fn begin_frame<'d>(&mut self, device: &'d dyn SkinDevice) -> FrameContext<'d> {
        self.frame_number += 1;
        self.resources.reclaim(device);
        for object in self.objects.values_mut() {
            object.reclaim(device, &mut self.resources);
        }
        self.resources.skin_cache.begin_frame(device);
        FrameContext::new(device, self.frame_number)
    }

    /// Consumes every queued render command. Returns how many were handled.
    ///
    /// A failing command does not stop the rest; each failure is logged and
    /// the first one is returned once the queue is drained.
    pub fn process_commands(&mut self, ctx: &mut FrameContext<'_>) -> Result<usize> {
        let commands: Vec<RenderCommand> = self.receiver.drain().collect();
        let count = commands.len();
        let mut first_error = None;
        for command in commands {
            if let Err(err) = self.handle_command(ctx, command) {
                log::error!("Render command failed: {err}");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(count), Err)
    }

    fn handle_command(&mut self, ctx: &mut FrameContext<'_>, command: RenderCommand) -> Result<()> {
        match command {
            RenderCommand::CreateMeshObject { id, mesh } => {
                if let Some(mut old) = self.objects.insert(id, SkeletalMeshGPUObject::new(id, mesh)) {
                    log::warn!("{id:?} created twice, replacing the previous object");
                    old.release(ctx, &mut self.resources);
                }
            }
            RenderCommand::UpdateDynamicData {
                id,
                snapshot,
                frame_to_prepare,
                revision,
            } => {
                let Some(object) = self.objects.get_mut(&id) else {
                    self.resources.free_snapshot(snapshot);
                    log::warn!("{}", SkinError::UnknownMeshObject(id.value()));
                    return Ok(());
                };
                object.stage(ctx.device(), snapshot, frame_to_prepare, revision, &mut self.resources);
                match self.resources.settings.commit_policy {
                    CommitPolicy::Immediate => {
                        object.commit(ctx, &mut self.resources)?;
                    }
                    CommitPolicy::DeferUntilPreFrame => {
                        if !self.deferred.contains(&id) {
                            self.deferred.push(id);
                        }
                    }
                }
            }
            RenderCommand::ReleaseMeshObject { id } => {
                self.deferred.retain(|d| *d != id);
                match self.objects.remove(&id) {
                    Some(mut object) => object.release(ctx, &mut self.resources),
                    None => log::warn!("{}", SkinError::UnknownMeshObject(id.value())),
                }
            }
        }
        Ok(())
    }

    /// Commits every staged snapshot deferred by [`CommitPolicy::DeferUntilPreFrame`].
    ///
    /// Like [`Self::process_commands`], every object is committed before the
    /// first failure is returned.
    pub fn pre_frame_commit(&mut self, ctx: &mut FrameContext<'_>) -> Result<usize> {
        let mut committed = 0;
        let mut first_error = None;
        for id in std::mem::take(&mut self.deferred) {
            let Some(object) = self.objects.get_mut(&id) else {
                continue;
            };
            match object.commit(ctx, &mut self.resources) {
                Ok(true) => committed += 1,
                Ok(false) => {}
                Err(err) => {
                    log::error!("Deferred commit of {id:?} failed: {err}");
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(committed), Err)
    }

    /// Feeds one view into an object's LOD selection for the current frame.
    pub fn update_lod(&mut self, id: InstanceId, view: &LodView, bounds: &BoundingSphere) -> Result<()> {
        let object = self
            .objects
            .get_mut(&id)
            .ok_or(SkinError::UnknownMeshObject(id.value()))?;
        object.update_lod(view, bounds, self.frame_number, &self.resources.settings.lod);
        Ok(())
    }

    pub fn transition_all_to_readable(&mut self, ctx: &mut FrameContext<'_>) {
        self.resources.skin_cache.transition_all_to_readable(ctx);
    }

    #[must_use]
    pub fn vertex_source(&self, id: InstanceId, section: usize) -> Option<VertexSource> {
        self.objects
            .get(&id)?
            .vertex_source(section, &self.resources)
    }

    /// Submits the frame and trims idle pooled memory.
    pub fn end_frame(&mut self, ctx: FrameContext<'_>) -> Result<FenceId> {
        let device = ctx.device();
        let submitted = ctx.submit()?;
        for buffer in submitted.destroy_after_fence {
            self.resources
                .pending_destroys
                .push(FenceGuarded::new(buffer, submitted.fence));
        }

        self.resources.skin_cache.end_frame(device);
        let max_idle = self.resources.settings.bone_pool_max_idle_frames;
        self.resources.bone_pool.trim(device, max_idle);
        self.resources.cloth_pool.trim(device, max_idle);
        Ok(submitted.fence)
    }

    /// Releases every object, waits for the GPU, and destroys all pooled memory.
    pub fn shutdown(&mut self, device: &dyn SkinDevice) -> Result<()> {
        let mut ctx = self.begin_frame(device);
        for (_, mut object) in self.objects.drain() {
            object.release(&mut ctx, &mut self.resources);
        }
        self.deferred.clear();
        let fence = self.end_frame(ctx)?;
        device.wait_fence(fence);

        self.resources.reclaim(device);
        self.resources.skin_cache.shutdown(device);
        self.resources.bone_pool.destroy_all(device);
        self.resources.cloth_pool.destroy_all(device);
        log::info!("Skinning renderer shut down after {} frames", self.frame_number);
        Ok(())
    }

    // ── Queries ────────────────────────────────────────────────────────────

    /// Skin cache memory that was needed this frame beyond the budget.
    #[must_use]
    pub fn extra_required_memory(&self) -> u64 {
        self.resources.skin_cache.extra_required_memory()
    }

    #[must_use]
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    #[must_use]
    pub fn resources(&self) -> &SkinningResources {
        &self.resources
    }

    #[must_use]
    pub fn skin_cache(&self) -> &SkinCache {
        &self.resources.skin_cache
    }

    #[must_use]
    pub fn object(&self, id: InstanceId) -> Option<&SkeletalMeshGPUObject> {
        self.objects.get(&id)
    }

    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn deferred_count(&self) -> usize {
        self.deferred.len()
    }
}
