//! Simulation-thread handle of a skinned instance.
//!
//! Owns nothing on the GPU. Each update builds a snapshot into pooled
//! storage and enqueues it; the render thread does the rest.

use std::sync::Arc;

use glam::Mat4;

use crate::errors::Result;
use crate::mesh::{ClothSimData, SkeletonPose, SkinnedMeshRenderData};
use crate::render_queue::{InstanceId, RenderCommand, RenderCommandSender};
use crate::settings::MorphSettings;
use crate::snapshot::{SnapshotBuilder, SnapshotInputs, SnapshotPool};

/// Per-frame simulation output of one instance.
#[derive(Debug, Clone, Copy)]
pub struct InstanceUpdate<'a> {
    pub pose: &'a SkeletonPose,
    /// Weight per mesh-wide morph index.
    pub morph_weights: &'a [f32],
    pub cloth: &'a [Option<ClothSimData>],
    pub cloth_blend_weight: f32,
    pub component_to_world: Mat4,
    /// Frame the render thread will prepare with this data.
    pub frame_number: u64,
    /// Discards last frame's pose so no motion is implied.
    pub teleported: bool,
}

pub struct SkinnedMeshInstance {
    id: InstanceId,
    mesh: Arc<SkinnedMeshRenderData>,
    sender: RenderCommandSender,
    pool: Arc<SnapshotPool>,
    morph_settings: MorphSettings,
    previous_pose: Option<SkeletonPose>,
    forced_lod: Option<usize>,
    revision: u32,
    released: bool,
}

impl SkinnedMeshInstance {
    /// Registers the instance with the render thread.
    pub fn spawn(
        mesh: Arc<SkinnedMeshRenderData>,
        sender: RenderCommandSender,
        pool: Arc<SnapshotPool>,
        morph_settings: MorphSettings,
    ) -> Result<Self> {
        let id = InstanceId::next();
        sender.send(RenderCommand::CreateMeshObject {
            id,
            mesh: Arc::clone(&mesh),
        })?;
        Ok(Self {
            id,
            mesh,
            sender,
            pool,
            morph_settings,
            previous_pose: None,
            forced_lod: None,
            revision: 0,
            released: false,
        })
    }

    /// Captures this frame's state and sends it to the render thread.
    pub fn update(&mut self, update: &InstanceUpdate<'_>) -> Result<()> {
        self.revision = self.revision.wrapping_add(1);

        let previous_pose = if update.teleported {
            Some(update.pose)
        } else {
            self.previous_pose.as_ref()
        };
        let snapshot = SnapshotBuilder::new(&self.pool, &self.morph_settings).build(&SnapshotInputs {
            pose: update.pose,
            previous_pose,
            inverse_bind: &self.mesh.inverse_bind_matrices,
            morph_weights: update.morph_weights,
            cloth: update.cloth,
            cloth_blend_weight: update.cloth_blend_weight,
            component_to_world: update.component_to_world,
            forced_lod: self.forced_lod,
            revision: self.revision,
        });

        match &mut self.previous_pose {
            Some(previous) => previous.clone_from(update.pose),
            None => self.previous_pose = Some(update.pose.clone()),
        }

        self.sender.send(RenderCommand::UpdateDynamicData {
            id: self.id,
            snapshot,
            frame_to_prepare: update.frame_number,
            revision: self.revision,
        })
    }

    /// Pins rendering to `lod`, or returns to screen-size selection with `None`.
    pub fn set_forced_lod(&mut self, lod: Option<usize>) {
        self.forced_lod = lod;
    }

    #[must_use]
    pub fn id(&self) -> InstanceId {
        self.id
    }

    #[must_use]
    pub fn revision(&self) -> u32 {
        self.revision
    }

    #[must_use]
    pub fn mesh(&self) -> &Arc<SkinnedMeshRenderData> {
        &self.mesh
    }

    /// Tells the render thread to release the instance's GPU object.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.sender.send(RenderCommand::ReleaseMeshObject { id: self.id })
    }
}

impl Drop for SkinnedMeshInstance {
    fn drop(&mut self) {
        if !self.released {
            // The render thread may already be gone at shutdown.
            let _ = self.sender.send(RenderCommand::ReleaseMeshObject { id: self.id });
        }
    }
}
