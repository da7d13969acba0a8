use glam::{Mat4, Vec4};

/// Simulation-side bone pose of one instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SkeletonPose {
    /// Component-space transform per bone of the pose source.
    pub component_space: Vec<Mat4>,
    /// Per-bone visibility; a missing entry means visible.
    pub visible: Vec<bool>,
    /// When following a master pose: mesh bone → index into `component_space`.
    /// Bones without a mapping keep their bind pose.
    pub master_remap: Option<Vec<Option<u32>>>,
}

impl SkeletonPose {
    #[must_use]
    pub fn from_component_space(component_space: Vec<Mat4>) -> Self {
        Self {
            visible: vec![true; component_space.len()],
            component_space,
            master_remap: None,
        }
    }

    #[must_use]
    pub fn is_visible(&self, bone: usize) -> bool {
        self.visible.get(bone).copied().unwrap_or(true)
    }

    fn source_index(&self, bone: usize) -> Option<usize> {
        match &self.master_remap {
            Some(remap) => remap.get(bone).copied().flatten().map(|i| i as usize),
            None => Some(bone),
        }
    }

    /// Writes one reference-to-local matrix per mesh bone into `out`.
    ///
    /// Hidden bones collapse to a zero-scale matrix placed at the bone, so
    /// vertices weighted to them shrink to a point. Unmapped bones use the
    /// identity (bind pose).
    pub fn write_ref_to_local(&self, inverse_bind: &[Mat4], out: &mut Vec<Mat4>) {
        out.clear();
        out.reserve(inverse_bind.len());

        for (bone, inv_bind) in inverse_bind.iter().enumerate() {
            let Some(component) = self
                .source_index(bone)
                .and_then(|i| self.component_space.get(i))
            else {
                out.push(Mat4::IDENTITY);
                continue;
            };

            if self.is_visible(bone) {
                out.push(*component * *inv_bind);
            } else {
                let position = component.w_axis;
                out.push(Mat4::from_cols(
                    Vec4::ZERO,
                    Vec4::ZERO,
                    Vec4::ZERO,
                    Vec4::new(position.x, position.y, position.z, 1.0),
                ));
            }
        }
    }
}
