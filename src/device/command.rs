//! Recorded GPU commands.
//!
//! The skinning core never talks to a command encoder directly. It records
//! [`SkinCommand`]s into a [`SkinCommandList`] owned by the frame, and the
//! device translates the list at submit time.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use smallvec::SmallVec;

use super::BufferHandle;
use crate::settings::MORPH_BATCH_TABLE_CAPACITY;

bitflags! {
    /// Compile-time permutation of the skinning kernel.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct SkinPermutation: u32 {
        /// Adds the morph vertex buffer deltas before skinning.
        const MORPH = 1 << 0;
        /// Blends the skinned result towards cloth simulation positions.
        const CLOTH = 1 << 1;
    }
}

/// Compute kernels the skinning pipeline dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkinKernel {
    /// Linear blend skinning of one section into the skin cache output.
    SkinVertices(SkinPermutation),
    /// Accumulates quantized weighted morph deltas.
    MorphUpdate,
    /// Converts accumulated deltas back to floats and normalizes normals.
    MorphNormalize,
    /// Scatters per-triangle tangent frames into the fixed-point accumulator.
    RecomputeTangentsPerTriangle,
    /// Resolves the accumulator into the output tangent buffer.
    RecomputeTangentsPerVertex,
}

impl SkinKernel {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::SkinVertices(p) => match (p.contains(SkinPermutation::MORPH), p.contains(SkinPermutation::CLOTH)) {
                (false, false) => "Skin Vertices",
                (true, false) => "Skin Vertices (Morph)",
                (false, true) => "Skin Vertices (Cloth)",
                (true, true) => "Skin Vertices (Morph + Cloth)",
            },
            Self::MorphUpdate => "Morph Update",
            Self::MorphNormalize => "Morph Normalize",
            Self::RecomputeTangentsPerTriangle => "Recompute Tangents (Triangles)",
            Self::RecomputeTangentsPerVertex => "Recompute Tangents (Vertices)",
        }
    }
}

/// Access state a set of buffers is transitioned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceAccess {
    /// Compute shaders may write.
    Writable,
    /// Vertex and compute shaders may read.
    Readable,
}

/// A single compute dispatch.
///
/// `bindings` are bound in order starting at binding 0 of group 0. When
/// `params` is non-empty it is uploaded to a uniform buffer bound right
/// after the last storage binding.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeDispatch {
    pub kernel: SkinKernel,
    pub bindings: SmallVec<[BufferHandle; 8]>,
    pub params: Vec<u8>,
    pub workgroups: [u32; 3],
}

/// A recorded GPU command.
#[derive(Debug, Clone, PartialEq)]
pub enum SkinCommand {
    WriteBuffer {
        buffer: BufferHandle,
        offset: u64,
        data: Vec<u8>,
    },
    ClearBuffer {
        buffer: BufferHandle,
    },
    Dispatch(ComputeDispatch),
    Transition {
        buffers: SmallVec<[BufferHandle; 8]>,
        access: ResourceAccess,
    },
}

/// Ordered list of commands for one submission.
#[derive(Debug, Default, Clone)]
pub struct SkinCommandList {
    commands: Vec<SkinCommand>,
}

impl SkinCommandList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        self.commands.push(SkinCommand::WriteBuffer {
            buffer,
            offset,
            data: data.to_vec(),
        });
    }

    pub fn clear_buffer(&mut self, buffer: BufferHandle) {
        self.commands.push(SkinCommand::ClearBuffer { buffer });
    }

    pub fn dispatch<P: Pod>(
        &mut self,
        kernel: SkinKernel,
        bindings: &[BufferHandle],
        params: &P,
        workgroups: [u32; 3],
    ) {
        self.commands.push(SkinCommand::Dispatch(ComputeDispatch {
            kernel,
            bindings: SmallVec::from_slice(bindings),
            params: bytemuck::bytes_of(params).to_vec(),
            workgroups,
        }));
    }

    pub fn transition(&mut self, buffers: &[BufferHandle], access: ResourceAccess) {
        if buffers.is_empty() {
            return;
        }
        self.commands.push(SkinCommand::Transition {
            buffers: SmallVec::from_slice(buffers),
            access,
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SkinCommand> {
        self.commands.iter()
    }

    /// Every buffer referenced by any command, deduplicated.
    #[must_use]
    pub fn referenced_buffers(&self) -> Vec<BufferHandle> {
        let mut out: Vec<BufferHandle> = Vec::new();
        let mut push = |h: BufferHandle| {
            if !out.contains(&h) {
                out.push(h);
            }
        };
        for cmd in &self.commands {
            match cmd {
                SkinCommand::WriteBuffer { buffer, .. } | SkinCommand::ClearBuffer { buffer } => {
                    push(*buffer);
                }
                SkinCommand::Dispatch(d) => d.bindings.iter().copied().for_each(&mut push),
                SkinCommand::Transition { buffers, .. } => buffers.iter().copied().for_each(&mut push),
            }
        }
        out
    }

    /// Number of compute dispatches recorded for `kernel`.
    #[must_use]
    pub fn dispatch_count(&self, kernel: SkinKernel) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, SkinCommand::Dispatch(d) if d.kernel == kernel))
            .count()
    }

    pub(crate) fn into_commands(self) -> Vec<SkinCommand> {
        self.commands
    }
}

impl<'a> IntoIterator for &'a SkinCommandList {
    type Item = &'a SkinCommand;
    type IntoIter = std::slice::Iter<'a, SkinCommand>;

    fn into_iter(self) -> Self::IntoIter {
        self.commands.iter()
    }
}

// ============================================================================
// Dispatch parameter blocks
// ============================================================================

/// Parameters of [`SkinKernel::SkinVertices`].
///
/// Bindings: output positions, output tangents, bone matrices, static
/// positions, static tangents, skin weights, then optionally the morph vertex
/// buffer and the cloth simulation + cloth mapping buffers.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SkinDispatchParams {
    pub local_to_cloth: [[f32; 4]; 4],
    pub base_vertex_index: u32,
    pub num_vertices: u32,
    pub max_bone_influences: u32,
    pub cloth_blend_weight: f32,
}

/// Parameters of [`SkinKernel::MorphUpdate`].
///
/// `thread_offsets[i]` is the first global thread of item `i`; entry
/// `item_count` holds `total_threads` so the shader can binary search.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MorphUpdateParams {
    pub position_scale: [f32; 4],
    pub item_start: [u32; MORPH_BATCH_TABLE_CAPACITY],
    pub thread_offsets: [u32; MORPH_BATCH_TABLE_CAPACITY],
    pub weights: [f32; MORPH_BATCH_TABLE_CAPACITY],
    pub item_count: u32,
    pub total_threads: u32,
    pub _pad: [u32; 2],
}

/// Parameters of [`SkinKernel::MorphNormalize`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MorphNormalizeParams {
    pub position_inv_scale: [f32; 4],
    pub item_start: [u32; MORPH_BATCH_TABLE_CAPACITY],
    pub thread_offsets: [u32; MORPH_BATCH_TABLE_CAPACITY],
    pub inv_accumulated_weights: [f32; MORPH_BATCH_TABLE_CAPACITY],
    pub item_count: u32,
    pub total_threads: u32,
    pub _pad: [u32; 2],
}

/// Parameters of both tangent recompute kernels.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct RecomputeTangentsParams {
    pub base_index: u32,
    pub num_triangles: u32,
    pub base_vertex_index: u32,
    pub num_vertices: u32,
}
