//! Tangent recomputation.
//!
//! Two passes over a skinned section:
//!
//! 1. **Per triangle**: each triangle computes its face tangent frame and
//!    atomically adds it, angle-weighted, to the accumulators of its three
//!    vertices. Accumulators are fixed-point `i32` (6 per vertex: tangent X
//!    and tangent Z), so the result does not depend on execution order.
//! 2. **Per vertex**: the accumulated frame is converted back, normalized and
//!    orthogonalized, then written to the tangent output.
//!
//! [`TangentAccumulator`] is the CPU mirror of both passes.

use glam::{IVec3, Vec2, Vec3};

/// Fixed-point scale of the accumulator.
pub const TANGENT_FIXED_POINT_SCALE: f32 = 65536.0;
/// `i32` accumulators per vertex.
pub const TANGENT_ACCUMULATOR_INTS_PER_VERTEX: u64 = 6;
/// Threads per tangent workgroup.
pub const TANGENT_WORKGROUP_SIZE: u32 = 64;

/// Bytes of scratch accumulator for `num_vertices` vertices.
#[must_use]
pub fn accumulator_size(num_vertices: u32) -> u64 {
    u64::from(num_vertices) * TANGENT_ACCUMULATOR_INTS_PER_VERTEX * 4
}

fn to_fixed(v: Vec3) -> IVec3 {
    (v * TANGENT_FIXED_POINT_SCALE).round().as_ivec3()
}

/// Resolved tangent frame of one vertex.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TangentFrame {
    pub tangent_x: Vec3,
    pub tangent_z: Vec3,
}

#[derive(Debug, Clone)]
pub struct TangentAccumulator {
    tangent_x: Vec<IVec3>,
    tangent_z: Vec<IVec3>,
}

impl TangentAccumulator {
    #[must_use]
    pub fn new(num_vertices: usize) -> Self {
        Self {
            tangent_x: vec![IVec3::ZERO; num_vertices],
            tangent_z: vec![IVec3::ZERO; num_vertices],
        }
    }

    /// Raw accumulator contents, six ints per vertex.
    #[must_use]
    pub fn raw(&self) -> Vec<i32> {
        self.tangent_x
            .iter()
            .zip(&self.tangent_z)
            .flat_map(|(x, z)| [x.x, x.y, x.z, z.x, z.y, z.z])
            .collect()
    }

    /// Adds one triangle's contribution to its three vertices.
    ///
    /// Degenerate triangles contribute nothing.
    pub fn accumulate_triangle(&mut self, positions: &[Vec3], uvs: &[Vec2], tri: [u32; 3]) {
        let [i0, i1, i2] = tri.map(|i| i as usize);
        let (p0, p1, p2) = (positions[i0], positions[i1], positions[i2]);
        let (uv0, uv1, uv2) = (uvs[i0], uvs[i1], uvs[i2]);

        let e1 = p1 - p0;
        let e2 = p2 - p0;
        let normal = e1.cross(e2);
        if normal.length_squared() <= f32::EPSILON {
            return;
        }
        let normal = normal.normalize();

        let d1 = uv1 - uv0;
        let d2 = uv2 - uv0;
        let det = d1.x * d2.y - d2.x * d1.y;
        let tangent = if det.abs() > f32::EPSILON {
            ((e1 * d2.y - e2 * d1.y) / det).normalize_or_zero()
        } else {
            e1.normalize_or_zero()
        };

        let corners = [(i0, p0, p1, p2), (i1, p1, p2, p0), (i2, p2, p0, p1)];
        for (index, p, next, prev) in corners {
            let a = (next - p).normalize_or_zero();
            let b = (prev - p).normalize_or_zero();
            let angle = a.dot(b).clamp(-1.0, 1.0).acos();
            self.tangent_x[index] = self.tangent_x[index].wrapping_add(to_fixed(tangent * angle));
            self.tangent_z[index] = self.tangent_z[index].wrapping_add(to_fixed(normal * angle));
        }
    }

    /// Converts the accumulators into orthonormal frames.
    ///
    /// `fallback` supplies the original frame for vertices that received no
    /// contribution.
    #[must_use]
    pub fn resolve(&self, fallback: impl Fn(usize) -> TangentFrame) -> Vec<TangentFrame> {
        self.tangent_x
            .iter()
            .zip(&self.tangent_z)
            .enumerate()
            .map(|(i, (x, z))| {
                let z = z.as_vec3() / TANGENT_FIXED_POINT_SCALE;
                if z.length_squared() <= f32::EPSILON {
                    return fallback(i);
                }
                let tangent_z = z.normalize();
                let x = x.as_vec3() / TANGENT_FIXED_POINT_SCALE;
                let tangent_x = (x - tangent_z * tangent_z.dot(x)).normalize_or_zero();
                let tangent_x = if tangent_x == Vec3::ZERO {
                    tangent_z.any_orthonormal_vector()
                } else {
                    tangent_x
                };
                TangentFrame { tangent_x, tangent_z }
            })
            .collect()
    }
}

/// CPU recompute over an indexed triangle list.
#[must_use]
pub fn recompute_tangents(positions: &[Vec3], uvs: &[Vec2], indices: &[u32]) -> Vec<TangentFrame> {
    let mut acc = TangentAccumulator::new(positions.len());
    for tri in indices.chunks_exact(3) {
        acc.accumulate_triangle(positions, uvs, [tri[0], tri[1], tri[2]]);
    }
    acc.resolve(|_| TangentFrame {
        tangent_x: Vec3::X,
        tangent_z: Vec3::Z,
    })
}
