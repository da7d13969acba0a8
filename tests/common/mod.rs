//! Shared fixtures for the pipeline-level tests.
//!
//! The reference mesh has one LOD of 96 vertices split into three sections
//! of 32 vertices:
//!
//! | Section | Bones | Extra input |
//! |---------|-------|-------------|
//! | 0 | 0, 1 | none |
//! | 1 | 1, 2 | morph 0 (vertices 32..40), morph 1 (36..44) |
//! | 2 | 0, 2 | cloth region 0 |

#![allow(dead_code)]

use std::sync::Arc;

use glam::{Mat4, Vec3};

use myth_skinning::device::{BufferDesc, BufferHandle, BufferUsage, HeadlessDevice, SkinDevice};
use myth_skinning::mesh::{
    ClothSimData, LodInfo, LodRenderData, RenderSection, SkeletonPose, SkinnedMeshRenderData,
    StaticVertexBuffers,
};
use myth_skinning::morph::{MorphDelta, MorphTarget, MorphTargetSet};

pub const SECTION_VERTICES: u32 = 32;
pub const NUM_BONES: usize = 3;

/// Pooled bytes of one skin cache entry for a 32-vertex section.
pub const ENTRY_FOOTPRINT: u64 = 16_384;

/// Routes `log` output through the test harness; `RUST_LOG` filters it.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn static_buffer(device: &HeadlessDevice, label: &'static str, size: u64) -> BufferHandle {
    device
        .create_buffer(&BufferDesc {
            label,
            size,
            usage: BufferUsage::VERTEX | BufferUsage::STORAGE | BufferUsage::COPY_DST,
        })
        .unwrap()
}

pub fn static_buffers(device: &HeadlessDevice, num_vertices: u32, num_indices: u32, cloth: bool) -> StaticVertexBuffers {
    let n = u64::from(num_vertices);
    StaticVertexBuffers {
        positions: static_buffer(device, "Static Positions", n * 12),
        tangents: static_buffer(device, "Static Tangents", n * 8),
        skin_weights: static_buffer(device, "Static Skin Weights", n * 16),
        indices: static_buffer(device, "Static Indices", u64::from(num_indices) * 4),
        cloth_mapping: cloth.then(|| static_buffer(device, "Cloth Mapping", n * 16)),
    }
}

pub fn section(index: u32, bone_map: Vec<u16>, cloth_region: Option<usize>) -> RenderSection {
    RenderSection {
        base_vertex_index: index * SECTION_VERTICES,
        num_vertices: SECTION_VERTICES,
        base_index: index * 48,
        num_triangles: 16,
        bone_map,
        max_bone_influences: 4,
        recompute_tangents: false,
        cloth_region,
    }
}

fn morph(name: &str, vertices: std::ops::Range<u32>, position: Vec3) -> MorphTarget {
    MorphTarget {
        name: name.to_string(),
        deltas: vertices
            .map(|v| MorphDelta {
                vertex_index: v,
                position_delta: position,
                normal_delta: Vec3::Y * 0.5,
            })
            .collect(),
    }
}

fn lod0(device: &HeadlessDevice) -> LodRenderData {
    let sections = vec![
        section(0, vec![0, 1], None),
        section(1, vec![1, 2], None),
        section(2, vec![0, 2], Some(0)),
    ];
    let morph_targets = MorphTargetSet::new(
        vec![
            morph("smile", 32..40, Vec3::X),
            morph("blink", 36..44, Vec3::new(0.0, 0.25, 0.0)),
        ],
        &sections,
    );
    LodRenderData {
        num_vertices: 3 * SECTION_VERTICES,
        buffers: static_buffers(device, 3 * SECTION_VERTICES, 144, true),
        sections,
        morph_targets,
    }
}

/// A coarser LOD: one rigidly skinned section of 16 vertices.
fn coarse_lod(device: &HeadlessDevice) -> LodRenderData {
    let sections = vec![RenderSection {
        base_vertex_index: 0,
        num_vertices: 16,
        base_index: 0,
        num_triangles: 8,
        bone_map: vec![0],
        max_bone_influences: 1,
        recompute_tangents: false,
        cloth_region: None,
    }];
    let morph_targets = MorphTargetSet::new(vec![MorphTarget::default(), MorphTarget::default()], &sections);
    LodRenderData {
        num_vertices: 16,
        buffers: static_buffers(device, 16, 24, false),
        sections,
        morph_targets,
    }
}

/// The reference mesh with `num_lods` LODs (LOD 0 plus coarse LODs).
pub fn test_mesh_with_lods(device: &HeadlessDevice, num_lods: usize) -> Arc<SkinnedMeshRenderData> {
    let mut lods = vec![lod0(device)];
    let mut lod_info = vec![LodInfo {
        screen_size: 1.0,
        hysteresis: 0.0,
    }];
    for i in 1..num_lods {
        lods.push(coarse_lod(device));
        lod_info.push(LodInfo {
            screen_size: 0.5 / i as f32,
            hysteresis: 0.0,
        });
    }
    Arc::new(SkinnedMeshRenderData {
        name: "test_character".to_string(),
        lods,
        lod_info,
        inverse_bind_matrices: vec![Mat4::IDENTITY; NUM_BONES],
        num_morph_targets: 2,
    })
}

pub fn test_mesh(device: &HeadlessDevice) -> Arc<SkinnedMeshRenderData> {
    test_mesh_with_lods(device, 1)
}

/// Static buffers created by [`test_mesh_with_lods`].
pub fn static_buffer_count(num_lods: usize) -> usize {
    5 + 4 * (num_lods - 1)
}

/// Every bone translated by `offset` along X, bone `i` further by `i` along Y.
pub fn pose(offset: f32) -> SkeletonPose {
    SkeletonPose::from_component_space(
        (0..NUM_BONES)
            .map(|i| Mat4::from_translation(Vec3::new(offset, i as f32, 0.0)))
            .collect(),
    )
}

pub fn cloth_region() -> ClothSimData {
    ClothSimData {
        positions: (0..SECTION_VERTICES).map(|i| Vec3::new(i as f32, 0.0, 0.0)).collect(),
        normals: vec![Vec3::Y; SECTION_VERTICES as usize],
        local_to_world: Mat4::IDENTITY,
    }
}
