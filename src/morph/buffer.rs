//! Morph vertex buffer.
//!
//! Holds the blended position/normal delta of every vertex of one LOD. The
//! skinning kernel adds it to the static vertex before skinning.
//!
//! Two update paths produce the same layout:
//!
//! - **GPU**: clear, batched `MorphUpdate` dispatches accumulating quantized
//!   deltas, a barrier, then batched `MorphNormalize` dispatches (one item per
//!   permutation) converting back to floats and dividing normals by the
//!   accumulated absolute weight.
//! - **CPU**: blend on the render thread and upload.

use bytemuck::{Pod, Zeroable};
use glam::{IVec3, Vec3};

use super::batch::plan_batches;
use super::quantize::MorphQuantization;
use super::target::MorphTargetSet;
use super::ActiveMorphTarget;
use crate::device::{
    BufferDesc, BufferHandle, BufferUsage, MorphNormalizeParams, MorphUpdateParams,
    ResourceAccess, SkinKernel,
};
use crate::errors::Result;
use crate::frame::FrameContext;

/// Bytes per vertex of the morph vertex buffer.
pub const MORPH_VERTEX_STRIDE: u64 = 24;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct MorphGpuVertex {
    pub position_delta: [f32; 3],
    pub normal_delta: [f32; 3],
}

#[derive(Debug, Clone, Copy)]
struct MorphGpuInputs {
    deltas: BufferHandle,
    permutation_vertices: BufferHandle,
}

#[derive(Debug)]
pub struct MorphVertexBuffer {
    buffer: Option<BufferHandle>,
    inputs: Option<MorphGpuInputs>,
    num_vertices: u32,
    has_been_updated: bool,
    needs_initial_clear: bool,
}

impl MorphVertexBuffer {
    #[must_use]
    pub fn new(num_vertices: u32) -> Self {
        Self {
            buffer: None,
            inputs: None,
            num_vertices,
            has_been_updated: false,
            needs_initial_clear: true,
        }
    }

    #[must_use]
    pub fn handle(&self) -> Option<BufferHandle> {
        self.buffer
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.buffer.is_some()
    }

    /// True once any update path has written the buffer.
    #[must_use]
    pub fn has_been_updated(&self) -> bool {
        self.has_been_updated
    }

    /// Creates the device buffers on first use. With `gpu_inputs`, the packed
    /// deltas and permutation vertex lists are uploaded too.
    pub fn ensure_initialized(
        &mut self,
        ctx: &mut FrameContext<'_>,
        set: &MorphTargetSet,
        gpu_inputs: bool,
    ) -> Result<()> {
        let device = ctx.device();

        if self.buffer.is_none() {
            let handle = device.create_buffer(&BufferDesc {
                label: "Morph Vertex Buffer",
                size: u64::from(self.num_vertices.max(1)) * MORPH_VERTEX_STRIDE,
                usage: BufferUsage::STORAGE | BufferUsage::VERTEX | BufferUsage::COPY_DST,
            })?;
            self.buffer = Some(handle);
            self.needs_initial_clear = true;
        }

        if gpu_inputs && self.inputs.is_none() {
            let deltas = set.packed_deltas();
            let delta_bytes: &[u8] = bytemuck::cast_slice(&deltas);
            let vertex_bytes: &[u8] = bytemuck::cast_slice(set.permutation_vertices());

            let deltas_handle = device.create_buffer(&BufferDesc {
                label: "Morph Deltas",
                size: (delta_bytes.len() as u64).max(4),
                usage: BufferUsage::STORAGE | BufferUsage::COPY_DST,
            })?;
            let vertices_handle = match device.create_buffer(&BufferDesc {
                label: "Morph Permutation Vertices",
                size: (vertex_bytes.len() as u64).max(4),
                usage: BufferUsage::STORAGE | BufferUsage::COPY_DST,
            }) {
                Ok(handle) => handle,
                Err(err) => {
                    device.destroy_buffer(deltas_handle);
                    return Err(err);
                }
            };

            if !delta_bytes.is_empty() {
                ctx.write_buffer(deltas_handle, 0, delta_bytes);
            }
            if !vertex_bytes.is_empty() {
                ctx.write_buffer(vertices_handle, 0, vertex_bytes);
            }
            self.inputs = Some(MorphGpuInputs {
                deltas: deltas_handle,
                permutation_vertices: vertices_handle,
            });
        }
        Ok(())
    }

    /// Zeroes the buffer once so sections using it never read garbage.
    pub fn clear_if_needed(&mut self, ctx: &mut FrameContext<'_>) {
        if let Some(buffer) = self.buffer
            && self.needs_initial_clear
        {
            ctx.clear_buffer(buffer);
            self.needs_initial_clear = false;
        }
    }

    /// Blends on the GPU with batched dispatches.
    ///
    /// Falls back to [`Self::update_cpu`] if the GPU inputs were never created.
    pub fn update_gpu(
        &mut self,
        ctx: &mut FrameContext<'_>,
        set: &MorphTargetSet,
        active: &[ActiveMorphTarget],
        batch_size: usize,
    ) {
        let (Some(buffer), Some(inputs)) = (self.buffer, self.inputs) else {
            self.update_cpu(ctx, set, active);
            return;
        };

        let weights = dense_weights(set, active);
        let quantization = MorphQuantization::from_weights(
            set.bounds(),
            active.iter().map(|m| (m.index as usize, m.weight)),
        );

        ctx.clear_buffer(buffer);
        ctx.transition(&[buffer], ResourceAccess::Writable);

        // Accumulate
        let update_items: Vec<(u32, u32)> = active
            .iter()
            .filter_map(|m| {
                set.target(m.index as usize)
                    .map(|t| (m.index, t.deltas.len() as u32))
            })
            .collect();
        for batch in plan_batches(&update_items, batch_size) {
            let mut params = MorphUpdateParams::zeroed();
            params.position_scale = quantization.scale.to_array();
            for (slot, &item) in batch.items.iter().enumerate() {
                params.item_start[slot] = set.delta_offset(item as usize);
                params.weights[slot] = weights[item as usize];
            }
            for (slot, &offset) in batch.thread_offsets.iter().enumerate() {
                params.thread_offsets[slot] = offset;
            }
            params.item_count = batch.items.len() as u32;
            params.total_threads = batch.total_threads();
            ctx.dispatch(
                SkinKernel::MorphUpdate,
                &[buffer, inputs.deltas],
                &params,
                [batch.workgroups(), 1, 1],
            );
        }

        ctx.transition(&[buffer], ResourceAccess::Writable);

        // Normalize
        let accumulated: Vec<f32> = set
            .permutations()
            .iter()
            .map(|p| p.morphs.iter().map(|&m| weights[m as usize].abs()).sum())
            .collect();
        let normalize_items: Vec<(u32, u32)> = set
            .permutations()
            .iter()
            .enumerate()
            .filter(|(i, _)| accumulated[*i] > 0.0)
            .map(|(i, p)| (i as u32, p.vertex_count))
            .collect();
        for batch in plan_batches(&normalize_items, batch_size) {
            let mut params = MorphNormalizeParams::zeroed();
            params.position_inv_scale = quantization.inv_scale.to_array();
            for (slot, &item) in batch.items.iter().enumerate() {
                let permutation = &set.permutations()[item as usize];
                params.item_start[slot] = permutation.vertex_start;
                params.inv_accumulated_weights[slot] = 1.0 / accumulated[item as usize].max(1.0);
            }
            for (slot, &offset) in batch.thread_offsets.iter().enumerate() {
                params.thread_offsets[slot] = offset;
            }
            params.item_count = batch.items.len() as u32;
            params.total_threads = batch.total_threads();
            ctx.dispatch(
                SkinKernel::MorphNormalize,
                &[buffer, inputs.permutation_vertices],
                &params,
                [batch.workgroups(), 1, 1],
            );
        }

        ctx.transition(&[buffer], ResourceAccess::Readable);
        self.has_been_updated = true;
        self.needs_initial_clear = false;
    }

    /// Blends on the CPU and uploads the result.
    pub fn update_cpu(
        &mut self,
        ctx: &mut FrameContext<'_>,
        set: &MorphTargetSet,
        active: &[ActiveMorphTarget],
    ) {
        let Some(buffer) = self.buffer else {
            return;
        };
        let vertices = blend_morphs_cpu(set, active, self.num_vertices);
        ctx.write_pod(buffer, &vertices);
        self.has_been_updated = true;
        self.needs_initial_clear = false;
    }

    /// Destroys the device buffers after the current frame.
    pub fn release(&mut self, ctx: &mut FrameContext<'_>) {
        if let Some(buffer) = self.buffer.take() {
            ctx.destroy_after_frame(buffer);
        }
        if let Some(inputs) = self.inputs.take() {
            ctx.destroy_after_frame(inputs.deltas);
            ctx.destroy_after_frame(inputs.permutation_vertices);
        }
        self.has_been_updated = false;
        self.needs_initial_clear = true;
    }
}

fn dense_weights(set: &MorphTargetSet, active: &[ActiveMorphTarget]) -> Vec<f32> {
    let mut weights = vec![0.0; set.len()];
    for m in active {
        if let Some(w) = weights.get_mut(m.index as usize) {
            *w = m.weight;
        }
    }
    weights
}

/// Float reference blend.
///
/// Normal deltas are divided by the accumulated absolute weight of the
/// vertex when it exceeds 1.
#[must_use]
pub fn blend_morphs_cpu(
    set: &MorphTargetSet,
    active: &[ActiveMorphTarget],
    num_vertices: u32,
) -> Vec<MorphGpuVertex> {
    let n = num_vertices as usize;
    let mut positions = vec![Vec3::ZERO; n];
    let mut normals = vec![Vec3::ZERO; n];
    let mut accumulated = vec![0.0f32; n];

    for m in active {
        let Some(target) = set.target(m.index as usize) else {
            continue;
        };
        for delta in &target.deltas {
            let v = delta.vertex_index as usize;
            if v >= n {
                continue;
            }
            positions[v] += delta.position_delta * m.weight;
            normals[v] += delta.normal_delta * m.weight;
            accumulated[v] += m.weight.abs();
        }
    }

    positions
        .into_iter()
        .zip(normals)
        .zip(accumulated)
        .map(|((p, mut nrm), acc)| {
            if acc > 1.0 {
                nrm /= acc;
            }
            MorphGpuVertex {
                position_delta: p.to_array(),
                normal_delta: nrm.to_array(),
            }
        })
        .collect()
}

/// Integer reference of the GPU path: quantize every contribution, sum in
/// `i32`, then dequantize and normalize per permutation.
#[must_use]
pub fn blend_morphs_quantized(
    set: &MorphTargetSet,
    active: &[ActiveMorphTarget],
    num_vertices: u32,
) -> Vec<MorphGpuVertex> {
    let n = num_vertices as usize;
    let weights = dense_weights(set, active);
    let quantization = MorphQuantization::from_weights(
        set.bounds(),
        active.iter().map(|m| (m.index as usize, m.weight)),
    );

    let mut positions = vec![IVec3::ZERO; n];
    let mut normals = vec![IVec3::ZERO; n];
    for m in active {
        let Some(target) = set.target(m.index as usize) else {
            continue;
        };
        for delta in &target.deltas {
            let v = delta.vertex_index as usize;
            if v >= n {
                continue;
            }
            positions[v] = positions[v].saturating_add(quantization.quantize_position(delta.position_delta * m.weight));
            normals[v] = normals[v].saturating_add(quantization.quantize_normal(delta.normal_delta * m.weight));
        }
    }

    let mut out = vec![MorphGpuVertex::default(); n];
    for permutation in set.permutations() {
        let accumulated: f32 = permutation
            .morphs
            .iter()
            .map(|&m| weights[m as usize].abs())
            .sum();
        if accumulated <= 0.0 {
            continue;
        }
        let inv = 1.0 / accumulated.max(1.0);
        let start = permutation.vertex_start as usize;
        let end = start + permutation.vertex_count as usize;
        for &v in &set.permutation_vertices()[start..end] {
            let v = v as usize;
            if v >= n {
                continue;
            }
            out[v] = MorphGpuVertex {
                position_delta: quantization.dequantize_position(positions[v]).to_array(),
                normal_delta: (quantization.dequantize_normal(normals[v]) * inv).to_array(),
            };
        }
    }
    out
}
