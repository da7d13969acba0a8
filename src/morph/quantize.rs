//! Fixed-point quantization of blended morph deltas.
//!
//! The GPU accumulates weighted deltas with integer atomics, so every
//! contribution is scaled into a signed 24-bit range before accumulation and
//! scaled back during normalization. The scale is chosen per frame from the
//! active weights and each morph's delta bounds, so the accumulated sum of
//! any vertex stays inside the range:
//!
//! ```text
//! max_scale[axis] = max(|bounds_i|, Σ |w_i| · |bounds_i|)    over active morphs
//! scale[axis]     = I24_MAX / floor(max_scale[axis] + 1)
//! inv_scale[axis] = 1 / scale[axis]
//! ```
//!
//! Axes `x`, `y`, `z` are positions; `w` is shared by the three normal
//! components.

use glam::{IVec3, Vec3, Vec4};

use super::target::MorphBounds;

/// Largest magnitude of a signed 24-bit integer.
pub const I24_MAX: i32 = 8_388_607;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MorphQuantization {
    pub scale: Vec4,
    pub inv_scale: Vec4,
}

impl Default for MorphQuantization {
    fn default() -> Self {
        Self::from_max_scale(Vec4::ZERO)
    }
}

impl MorphQuantization {
    /// Derives the scale from active `(morph index, weight)` pairs.
    ///
    /// Indices outside `bounds` and zero weights are ignored.
    #[must_use]
    pub fn from_weights(bounds: &[MorphBounds], active: impl IntoIterator<Item = (usize, f32)>) -> Self {
        let mut accumulated = Vec4::ZERO;
        let mut max_scale = Vec4::ZERO;
        for (index, weight) in active {
            if weight == 0.0 {
                continue;
            }
            let Some(b) = bounds.get(index) else {
                continue;
            };
            let abs_morph = b.abs_max();
            accumulated += abs_morph * weight.abs();
            max_scale = max_scale.max(abs_morph).max(accumulated);
        }
        Self::from_max_scale(max_scale)
    }

    fn from_max_scale(max_scale: Vec4) -> Self {
        let range = I24_MAX as f32;
        let scale = Vec4::splat(range) / (max_scale + Vec4::ONE).floor();
        Self {
            scale,
            inv_scale: scale.recip(),
        }
    }

    #[must_use]
    pub fn quantize_position(&self, delta: Vec3) -> IVec3 {
        quantize(delta * self.scale.truncate())
    }

    #[must_use]
    pub fn quantize_normal(&self, delta: Vec3) -> IVec3 {
        quantize(delta * self.scale.w)
    }

    #[must_use]
    pub fn dequantize_position(&self, accumulated: IVec3) -> Vec3 {
        accumulated.as_vec3() * self.inv_scale.truncate()
    }

    #[must_use]
    pub fn dequantize_normal(&self, accumulated: IVec3) -> Vec3 {
        accumulated.as_vec3() * self.inv_scale.w
    }

    /// Worst-case absolute error of one quantized contribution, per axis.
    #[must_use]
    pub fn step(&self) -> Vec4 {
        self.inv_scale * 0.5
    }
}

fn quantize(scaled: Vec3) -> IVec3 {
    let limit = Vec3::splat(I24_MAX as f32);
    scaled.round().clamp(-limit, limit).as_ivec3()
}
