//! Vertex Factories
//!
//! A vertex factory describes how a section's vertices reach the vertex
//! shader. Every section owns one factory per kind it can need:
//!
//! | Kind | Vertex shader input |
//! |------|---------------------|
//! | [`FactoryKind::Base`] | static vertices, skinned in the vertex shader |
//! | [`FactoryKind::Morph`] | static vertices + morph vertex buffer |
//! | [`FactoryKind::Cloth`] | static vertices + cloth simulation buffer |
//! | [`FactoryKind::Passthrough`] | skin cache output, no skinning |
//!
//! Each frame the mesh object picks one of the first three by precedence
//! `Cloth > Morph > Base` and uploads its bone (and cloth) data. The skin
//! cache reads the same buffers for its compute pass.
//!
//! Bone data is double-buffered: the current and previous frame's matrices
//! live in two pooled buffers and a revision change swaps their roles.

use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use crate::device::BufferHandle;
use crate::errors::Result;
use crate::frame::FrameContext;
use crate::mesh::{CLOTH_VERTEX_STRIDE, ClothSimData, RenderSection, StaticVertexBuffers};
use crate::pool::{BoneBufferPool, ClothBufferPool, PooledBuffer};

/// Bytes of one bone matrix as uploaded (3x4 `f32`).
pub const BONE_MATRIX_STRIDE: u64 = 48;

static NEXT_FACTORY_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique vertex factory identity; the skin cache tags outputs with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexFactoryId(u64);

impl VertexFactoryId {
    fn next() -> Self {
        Self(NEXT_FACTORY_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FactoryKind {
    Base,
    Morph,
    Cloth,
    Passthrough,
}

bitflags! {
    /// Extra inputs a factory reads.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct FactoryCaps: u32 {
        const HAS_MORPH_DATA = 1 << 0;
        const HAS_CLOTH_DATA = 1 << 1;
    }
}

impl FactoryKind {
    #[must_use]
    pub fn caps(self) -> FactoryCaps {
        match self {
            Self::Base | Self::Passthrough => FactoryCaps::empty(),
            Self::Morph => FactoryCaps::HAS_MORPH_DATA,
            Self::Cloth => FactoryCaps::HAS_MORPH_DATA | FactoryCaps::HAS_CLOTH_DATA,
        }
    }

    /// Precedence used when several kinds apply.
    #[must_use]
    pub fn select(use_cloth: bool, use_morph: bool) -> Self {
        if use_cloth {
            Self::Cloth
        } else if use_morph {
            Self::Morph
        } else {
            Self::Base
        }
    }
}

// ─── Bone data ────────────────────────────────────────────────────────────────

/// One bone matrix in upload layout: the transposed upper 3x4 of the
/// reference-to-local matrix (three rows).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BoneMatrix3x4 {
    pub rows: [[f32; 4]; 3],
}

impl From<&Mat4> for BoneMatrix3x4 {
    fn from(m: &Mat4) -> Self {
        Self {
            rows: [m.row(0).to_array(), m.row(1).to_array(), m.row(2).to_array()],
        }
    }
}

/// Gathers the section's bones out of the full reference-to-local array.
#[must_use]
pub fn pack_bone_matrices(ref_to_local: &[Mat4], bone_map: &[u16]) -> Vec<BoneMatrix3x4> {
    bone_map
        .iter()
        .map(|&bone| {
            ref_to_local
                .get(bone as usize)
                .map_or_else(|| BoneMatrix3x4::from(&Mat4::IDENTITY), BoneMatrix3x4::from)
        })
        .collect()
}

/// Double-buffered bone matrix storage of one factory.
#[derive(Debug, Default)]
pub struct BoneShaderData {
    buffers: [Option<PooledBuffer>; 2],
    current: usize,
    revision: Option<u32>,
}

impl BoneShaderData {
    /// Swaps current/previous roles when `revision` differs from the last one.
    pub fn set_current_revision(&mut self, revision: u32) {
        match self.revision {
            Some(r) if r == revision => {}
            Some(_) => {
                self.current ^= 1;
                self.revision = Some(revision);
            }
            None => self.revision = Some(revision),
        }
    }

    #[must_use]
    pub fn revision(&self) -> Option<u32> {
        self.revision
    }

    /// Uploads bones into the current (or previous) buffer, resizing it
    /// through the pool if the section's bone count changed.
    pub fn update(
        &mut self,
        ctx: &mut FrameContext<'_>,
        pool: &mut BoneBufferPool,
        ref_to_local: &[Mat4],
        bone_map: &[u16],
        revision: u32,
        previous: bool,
    ) -> Result<()> {
        self.set_current_revision(revision);
        let slot = self.current ^ usize::from(previous);

        let packed = pack_bone_matrices(ref_to_local, bone_map);
        let bytes: &[u8] = bytemuck::cast_slice(&packed);
        let needed = BoneBufferPool::pooled_size(bytes.len() as u64);

        let reuse = matches!((&self.buffers[slot], needed), (Some(b), Some(n)) if b.size() == n);
        if !reuse {
            if let Some(old) = self.buffers[slot].take() {
                pool.release_after(old, ctx.frame_fence());
            }
            self.buffers[slot] = Some(pool.acquire(ctx.device(), bytes.len() as u64)?);
        }

        if let Some(buffer) = &self.buffers[slot]
            && !bytes.is_empty()
        {
            ctx.write_buffer(buffer.handle(), 0, bytes);
        }
        Ok(())
    }

    /// Buffer with the current (or previous) matrices. Falls back to the
    /// current buffer when no previous upload exists yet.
    #[must_use]
    pub fn buffer(&self, previous: bool) -> Option<BufferHandle> {
        let slot = self.current ^ usize::from(previous);
        self.buffers[slot]
            .as_ref()
            .or(self.buffers[self.current].as_ref())
            .map(PooledBuffer::handle)
    }

    pub fn release(&mut self, ctx: &FrameContext<'_>, pool: &mut BoneBufferPool) {
        for buffer in self.buffers.iter_mut().filter_map(Option::take) {
            pool.release_after(buffer, ctx.frame_fence());
        }
        self.revision = None;
        self.current = 0;
    }
}

// ─── Cloth data ───────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ClothShaderData {
    buffer: Option<PooledBuffer>,
    pub local_to_world: Mat4,
    pub blend_weight: f32,
}

impl Default for ClothShaderData {
    fn default() -> Self {
        Self {
            buffer: None,
            local_to_world: Mat4::IDENTITY,
            blend_weight: 0.0,
        }
    }
}

impl ClothShaderData {
    /// Uploads simulated positions and normals (24 bytes per vertex).
    pub fn update(
        &mut self,
        ctx: &mut FrameContext<'_>,
        pool: &mut ClothBufferPool,
        sim: &ClothSimData,
        blend_weight: f32,
    ) -> Result<()> {
        let packed = sim.packed();
        let size = packed.len() as u64 * CLOTH_VERTEX_STRIDE;
        let needed = ClothBufferPool::pooled_size(size);

        let reuse = matches!((&self.buffer, needed), (Some(b), Some(n)) if b.size() == n);
        if !reuse {
            if let Some(old) = self.buffer.take() {
                pool.release_after(old, ctx.frame_fence());
            }
            self.buffer = Some(pool.acquire(ctx.device(), size)?);
        }

        if let Some(buffer) = &self.buffer
            && !packed.is_empty()
        {
            ctx.write_pod(buffer.handle(), &packed);
        }
        self.local_to_world = sim.local_to_world;
        self.blend_weight = blend_weight;
        Ok(())
    }

    #[must_use]
    pub fn buffer(&self) -> Option<BufferHandle> {
        self.buffer.as_ref().map(PooledBuffer::handle)
    }

    pub fn release(&mut self, ctx: &FrameContext<'_>, pool: &mut ClothBufferPool) {
        if let Some(buffer) = self.buffer.take() {
            pool.release_after(buffer, ctx.frame_fence());
        }
    }
}

// ─── Factories ────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct GpuSkinVertexFactory {
    id: VertexFactoryId,
    kind: FactoryKind,
    pub bones: BoneShaderData,
    pub cloth: Option<ClothShaderData>,
}

impl GpuSkinVertexFactory {
    #[must_use]
    pub fn new(kind: FactoryKind) -> Self {
        Self {
            id: VertexFactoryId::next(),
            kind,
            bones: BoneShaderData::default(),
            cloth: kind
                .caps()
                .contains(FactoryCaps::HAS_CLOTH_DATA)
                .then(ClothShaderData::default),
        }
    }

    #[must_use]
    pub fn id(&self) -> VertexFactoryId {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> FactoryKind {
        self.kind
    }

    #[must_use]
    pub fn caps(&self) -> FactoryCaps {
        self.kind.caps()
    }

    pub fn release(
        &mut self,
        ctx: &FrameContext<'_>,
        bone_pool: &mut BoneBufferPool,
        cloth_pool: &mut ClothBufferPool,
    ) {
        self.bones.release(ctx, bone_pool);
        if let Some(cloth) = &mut self.cloth {
            cloth.release(ctx, cloth_pool);
        }
    }
}

/// The factories of one section.
#[derive(Debug)]
pub struct SectionFactories {
    base: GpuSkinVertexFactory,
    morph: Option<GpuSkinVertexFactory>,
    cloth: Option<GpuSkinVertexFactory>,
    passthrough: VertexFactoryId,
    active: FactoryKind,
}

impl SectionFactories {
    #[must_use]
    pub fn new(has_morph: bool, has_cloth: bool) -> Self {
        Self {
            base: GpuSkinVertexFactory::new(FactoryKind::Base),
            morph: has_morph.then(|| GpuSkinVertexFactory::new(FactoryKind::Morph)),
            cloth: has_cloth.then(|| GpuSkinVertexFactory::new(FactoryKind::Cloth)),
            passthrough: VertexFactoryId::next(),
            active: FactoryKind::Base,
        }
    }

    /// Picks the factory for this frame (`Cloth > Morph > Base`, limited to
    /// the kinds this section has).
    pub fn select(&mut self, use_cloth: bool, use_morph: bool) -> &mut GpuSkinVertexFactory {
        let kind = FactoryKind::select(use_cloth && self.cloth.is_some(), use_morph && self.morph.is_some());
        self.active = kind;
        self.active_mut()
    }

    #[must_use]
    pub fn active_kind(&self) -> FactoryKind {
        self.active
    }

    #[must_use]
    pub fn active(&self) -> &GpuSkinVertexFactory {
        match self.active {
            FactoryKind::Cloth => self.cloth.as_ref().unwrap_or(&self.base),
            FactoryKind::Morph => self.morph.as_ref().unwrap_or(&self.base),
            FactoryKind::Base | FactoryKind::Passthrough => &self.base,
        }
    }

    pub fn active_mut(&mut self) -> &mut GpuSkinVertexFactory {
        match self.active {
            FactoryKind::Cloth if self.cloth.is_some() => self.cloth.as_mut().unwrap_or(&mut self.base),
            FactoryKind::Morph if self.morph.is_some() => self.morph.as_mut().unwrap_or(&mut self.base),
            _ => &mut self.base,
        }
    }

    #[must_use]
    pub fn passthrough_id(&self) -> VertexFactoryId {
        self.passthrough
    }

    pub fn release(
        &mut self,
        ctx: &FrameContext<'_>,
        bone_pool: &mut BoneBufferPool,
        cloth_pool: &mut ClothBufferPool,
    ) {
        self.base.release(ctx, bone_pool, cloth_pool);
        if let Some(f) = &mut self.morph {
            f.release(ctx, bone_pool, cloth_pool);
        }
        if let Some(f) = &mut self.cloth {
            f.release(ctx, bone_pool, cloth_pool);
        }
    }
}

// ─── Vertex source ────────────────────────────────────────────────────────────

/// Skin cache outputs bound by the passthrough factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassthroughBuffers {
    pub positions: BufferHandle,
    pub previous_positions: BufferHandle,
    pub tangents: BufferHandle,
}

/// Where a section's draw call reads its vertices this frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexSource {
    /// Skin cache output; the vertex shader passes vertices through.
    Passthrough {
        factory: VertexFactoryId,
        buffers: PassthroughBuffers,
    },
    /// Static vertices skinned in the vertex shader.
    Original {
        kind: FactoryKind,
        factory: VertexFactoryId,
        positions: BufferHandle,
        bones: Option<BufferHandle>,
        previous_bones: Option<BufferHandle>,
        morph: Option<BufferHandle>,
        cloth: Option<BufferHandle>,
    },
}

impl VertexSource {
    #[must_use]
    pub fn is_passthrough(&self) -> bool {
        matches!(self, Self::Passthrough { .. })
    }

    /// Uncached source for a section drawn with `factories`' active factory.
    #[must_use]
    pub fn original(
        factories: &SectionFactories,
        buffers: &StaticVertexBuffers,
        morph: Option<BufferHandle>,
        section: &RenderSection,
    ) -> Self {
        let factory = factories.active();
        let caps = factory.caps();
        Self::Original {
            kind: factory.kind(),
            factory: factory.id(),
            positions: buffers.positions,
            bones: section
                .has_bone_influences()
                .then(|| factory.bones.buffer(false))
                .flatten(),
            previous_bones: section
                .has_bone_influences()
                .then(|| factory.bones.buffer(true))
                .flatten(),
            morph: morph.filter(|_| caps.contains(FactoryCaps::HAS_MORPH_DATA)),
            cloth: factory.cloth.as_ref().and_then(ClothShaderData::buffer),
        }
    }
}
