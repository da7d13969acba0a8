//! LOD Selection
//!
//! The LOD of a skinned instance is picked from its projected screen size:
//!
//! ```text
//! screen_multiple = max(0.5 · P[0][0], 0.5 · P[1][1])
//! r²              = (screen_multiple · radius)² / max(1, distance²) · radius_scale²
//!
//! for lod in (1..num_lods).rev():          coarsest first
//!     size = lod_info[lod].screen_size
//!     if lod <= current: size += hysteresis
//!     if (0.5 · size)² > r²: return lod
//! return 0
//! ```
//!
//! An instance may be seen by several views in one frame. The selector keeps
//! the finest LOD and largest radius seen during the frame and publishes them
//! only when the frame number changes, so the LOD the render thread uses is
//! stable for a whole frame.

use glam::{Mat4, Vec3};

use crate::mesh::LodInfo;
use crate::settings::LodSettings;

/// A camera as seen by LOD selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LodView {
    pub origin: Vec3,
    pub projection: Mat4,
}

/// World-space bounding sphere.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingSphere {
    pub center: Vec3,
    pub radius: f32,
}

/// Squared projected radius of `bounds` as a fraction of the screen.
#[must_use]
pub fn screen_radius_squared(bounds: &BoundingSphere, view: &LodView) -> f32 {
    let screen_multiple = (0.5 * view.projection.x_axis.x).max(0.5 * view.projection.y_axis.y);
    let distance_squared = bounds.center.distance_squared(view.origin).max(1.0);
    let projected = screen_multiple * bounds.radius;
    projected * projected / distance_squared
}

/// Coarsest LOD whose threshold the screen radius still exceeds.
#[must_use]
pub fn select_lod(screen_radius_squared: f32, lod_info: &[LodInfo], current_lod: usize) -> usize {
    for lod in (1..lod_info.len()).rev() {
        let info = &lod_info[lod];
        let mut screen_size = info.screen_size;
        if lod <= current_lod {
            screen_size += info.hysteresis;
        }
        let half = screen_size * 0.5;
        if half * half > screen_radius_squared {
            return lod;
        }
    }
    0
}

#[derive(Debug, Clone, Default)]
pub struct LodSelector {
    current_lod: usize,
    min_desired_lod: usize,
    max_distance_factor: f32,
    working_min_lod: Option<usize>,
    working_max_factor: f32,
    working_frame: Option<u64>,
}

impl LodSelector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one view's result into the frame's working values.
    ///
    /// At the first call of a new frame number, the previous frame's working
    /// values become the committed ones.
    pub fn update_for_view(
        &mut self,
        view: &LodView,
        bounds: &BoundingSphere,
        lod_info: &[LodInfo],
        frame_number: u64,
        settings: &LodSettings,
    ) {
        let scale = settings.radius_scale.clamp(0.25, 1.0);
        let radius_squared = screen_radius_squared(bounds, view) * scale * scale;
        let lod = if settings.enabled {
            select_lod(radius_squared, lod_info, self.current_lod)
        } else {
            0
        };

        if self.working_frame != Some(frame_number) {
            if let Some(min_lod) = self.working_min_lod {
                self.min_desired_lod = min_lod;
                self.max_distance_factor = self.working_max_factor;
            }
            self.working_frame = Some(frame_number);
            self.working_min_lod = Some(lod);
            self.working_max_factor = radius_squared;
        } else {
            self.working_min_lod = Some(self.working_min_lod.map_or(lod, |w| w.min(lod)));
            self.working_max_factor = self.working_max_factor.max(radius_squared);
        }
    }

    /// LOD committed at the last frame transition.
    #[must_use]
    pub fn min_desired_lod(&self) -> usize {
        self.min_desired_lod
    }

    /// Largest squared screen radius committed at the last frame transition.
    #[must_use]
    pub fn max_distance_factor(&self) -> f32 {
        self.max_distance_factor
    }

    /// LOD actually rendered, which biases hysteresis.
    #[must_use]
    pub fn current_lod(&self) -> usize {
        self.current_lod
    }

    pub fn set_current_lod(&mut self, lod: usize) {
        self.current_lod = lod;
    }
}
