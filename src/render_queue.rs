//! Simulation → render command queue.
//!
//! The only channel between the two threads. Commands carry owned,
//! immutable data, so the render thread needs no locks to consume them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::errors::Result;
use crate::mesh::SkinnedMeshRenderData;
use crate::snapshot::DynamicSkinningSnapshot;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity shared by a simulation-side instance and its render-side object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

#[derive(Debug)]
pub enum RenderCommand {
    CreateMeshObject {
        id: InstanceId,
        mesh: Arc<SkinnedMeshRenderData>,
    },
    UpdateDynamicData {
        id: InstanceId,
        snapshot: DynamicSkinningSnapshot,
        frame_to_prepare: u64,
        revision: u32,
    },
    ReleaseMeshObject {
        id: InstanceId,
    },
}

#[derive(Debug, Clone)]
pub struct RenderCommandSender {
    tx: flume::Sender<RenderCommand>,
}

impl RenderCommandSender {
    pub fn send(&self, command: RenderCommand) -> Result<()> {
        self.tx.send(command)?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct RenderCommandReceiver {
    rx: flume::Receiver<RenderCommand>,
}

impl RenderCommandReceiver {
    /// Every command queued so far, without blocking.
    pub fn drain(&self) -> impl Iterator<Item = RenderCommand> + '_ {
        self.rx.try_iter()
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

/// Creates an unbounded command queue.
#[must_use]
pub fn render_command_channel() -> (RenderCommandSender, RenderCommandReceiver) {
    let (tx, rx) = flume::unbounded();
    (RenderCommandSender { tx }, RenderCommandReceiver { rx })
}
