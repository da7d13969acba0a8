#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_arguments)]

//! GPU skeletal-mesh skinning for the Myth engine.
//!
//! The simulation thread captures each instance's bones, morph weights and
//! cloth results into a [`DynamicSkinningSnapshot`] and queues it. The render
//! thread ([`SkinningRenderer`]) uploads that state through pooled GPU
//! buffers and skins every section once per frame into the [`SkinCache`],
//! which draw calls then read directly.

pub mod device;
pub mod errors;
pub mod fence;
pub mod frame;
pub mod instance;
pub mod lod;
pub mod mesh;
pub mod mesh_object;
pub mod morph;
pub mod pool;
pub mod render_queue;
pub mod renderer;
pub mod settings;
pub mod skin_cache;
pub mod snapshot;
pub mod tracker;
pub mod vertex_factory;

pub use device::{
    BufferDesc, BufferHandle, BufferUsage, DeviceCapabilities, FenceId, FenceMode,
    HeadlessDevice, SkinDevice, SkinPipelines, WgpuSkinDevice,
};
pub use errors::{Result, SkinError};
pub use fence::FenceGuarded;
pub use frame::FrameContext;
pub use instance::{InstanceUpdate, SkinnedMeshInstance};
pub use lod::{BoundingSphere, LodSelector, LodView};
pub use mesh::{
    ClothSimData, LodInfo, LodRenderData, RenderSection, SkeletonPose, SkinnedMeshRenderData,
    StaticVertexBuffers,
};
pub use mesh_object::{MeshObjectState, SkeletalMeshGPUObject};
pub use morph::{ActiveMorphTarget, MorphDelta, MorphTarget, MorphTargetSet};
pub use pool::{BucketedBufferPool, PooledBuffer};
pub use render_queue::{InstanceId, RenderCommand, RenderCommandSender};
pub use renderer::{SkinningRenderer, SkinningResources};
pub use settings::{CommitPolicy, SkinCacheMode, SkinningSettings};
pub use skin_cache::{SkinCache, SkinCacheEntryKey};
pub use snapshot::{DynamicSkinningSnapshot, SnapshotBuilder, SnapshotInputs, SnapshotPool};
pub use tracker::DoubleBufferedResourceTracker;
pub use vertex_factory::{FactoryKind, VertexSource};
