use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

/// Bytes per simulated vertex in the cloth buffer (position + normal).
pub const CLOTH_VERTEX_STRIDE: u64 = 24;

/// Simulation result of one cloth region for one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClothSimData {
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    /// Transform of the simulation space into world space.
    pub local_to_world: Mat4,
}

impl ClothSimData {
    #[must_use]
    pub fn num_vertices(&self) -> usize {
        self.positions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Interleaves positions and normals in upload order.
    #[must_use]
    pub fn packed(&self) -> Vec<ClothGpuVertex> {
        self.positions
            .iter()
            .zip(self.normals.iter().chain(std::iter::repeat(&Vec3::Z)))
            .map(|(p, n)| ClothGpuVertex {
                position: p.to_array(),
                normal: n.to_array(),
            })
            .collect()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ClothGpuVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
}
