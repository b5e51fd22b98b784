//! params — deformation parameter store
//!
//! Externally-settable scalars consumed every render tick. Setters clamp to
//! the documented ranges before storing (out-of-range input is never an
//! error). The sign of `intensity` is the sole smile/grimace discriminator.
//! The render tick reads a single immutable `DeformUniforms` snapshot, so the
//! detection step and external control writes can never be observed torn.

use nalgebra::Vector2;
use std::sync::{Arc, Mutex};

pub const RADIUS_MIN: f32 = 0.05;
pub const RADIUS_MAX: f32 = 0.3;
pub const ANCHOR_LIMIT: f32 = 0.2;

const DEFAULT_RADIUS: f32 = 0.15;

/// Immutable per-tick snapshot of the deformation state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeformUniforms {
    /// Signed strength: positive = smile (pull up), negative = grimace.
    pub intensity: f32,
    /// Falloff radius in UV units, clamped to [0.05, 0.3].
    pub radius: f32,
    /// Manual offset of the deformation center, each axis in [-0.2, 0.2].
    pub anchor_offset: Vector2<f32>,
    /// Live-tracked mouth center in UV space.
    pub lip_center: Vector2<f32>,
    pub show_bounding_box: bool,
}

struct ParamState {
    intensity: f32,
    radius: f32,
    anchor_offset: Vector2<f32>,
    lip_center: Vector2<f32>,
    show_bounding_box: bool,
}

impl Default for ParamState {
    fn default() -> Self {
        Self {
            intensity: 0.0,
            radius: DEFAULT_RADIUS,
            anchor_offset: Vector2::zeros(),
            lip_center: Vector2::new(0.5, 0.5),
            show_bounding_box: false,
        }
    }
}

/// Runtime control surface over the parameter store.
///
/// The pipeline returns one of these to its owner instead of publishing
/// globals; cloning shares the same underlying store (last write wins).
#[derive(Clone, Default)]
pub struct Controls(Arc<Mutex<ParamState>>);

impl Controls {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self, f: impl FnOnce(&mut ParamState)) {
        if let Ok(mut state) = self.0.lock() {
            f(&mut state);
        }
    }

    fn read<T>(&self, default: T, f: impl FnOnce(&ParamState) -> T) -> T {
        self.0.lock().map(|state| f(&state)).unwrap_or(default)
    }

    /// Store `+|v|`: a smile pulls the lip region upward.
    pub fn set_smile_intensity(&self, v: f32) {
        self.write(|s| s.intensity = v.abs());
    }

    /// Store `-|v|`: a grimace pulls the lip region downward.
    pub fn set_grimace_intensity(&self, v: f32) {
        self.write(|s| s.intensity = -v.abs());
    }

    pub fn set_radius(&self, v: f32) {
        self.write(|s| s.radius = v.clamp(RADIUS_MIN, RADIUS_MAX));
    }

    pub fn set_anchor_offset_x(&self, v: f32) {
        self.write(|s| s.anchor_offset.x = v.clamp(-ANCHOR_LIMIT, ANCHOR_LIMIT));
    }

    pub fn set_anchor_offset_y(&self, v: f32) {
        self.write(|s| s.anchor_offset.y = v.clamp(-ANCHOR_LIMIT, ANCHOR_LIMIT));
    }

    pub fn set_show_bounding_box(&self, on: bool) {
        self.write(|s| s.show_bounding_box = on);
    }

    /// Refreshed by the detection step from the mouth-center landmark.
    pub fn set_lip_center(&self, uv: Vector2<f32>) {
        self.write(|s| s.lip_center = uv);
    }

    pub fn intensity(&self) -> f32 {
        self.read(0.0, |s| s.intensity)
    }

    pub fn radius(&self) -> f32 {
        self.read(DEFAULT_RADIUS, |s| s.radius)
    }

    pub fn anchor_offset(&self) -> Vector2<f32> {
        self.read(Vector2::zeros(), |s| s.anchor_offset)
    }

    pub fn show_bounding_box(&self) -> bool {
        self.read(false, |s| s.show_bounding_box)
    }

    /// Snapshot read once per render tick.
    pub fn uniforms(&self) -> DeformUniforms {
        self.read(
            DeformUniforms {
                intensity: 0.0,
                radius: DEFAULT_RADIUS,
                anchor_offset: Vector2::zeros(),
                lip_center: Vector2::new(0.5, 0.5),
                show_bounding_box: false,
            },
            |s| DeformUniforms {
                intensity: s.intensity,
                radius: s.radius,
                anchor_offset: s.anchor_offset,
                lip_center: s.lip_center,
                show_bounding_box: s.show_bounding_box,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn radius_clamps_both_ends() {
        let controls = Controls::new();
        controls.set_radius(-5.0);
        assert_eq!(controls.radius(), 0.05);
        controls.set_radius(5.0);
        assert_eq!(controls.radius(), 0.3);
        controls.set_radius(0.12);
        assert_eq!(controls.radius(), 0.12);
    }

    #[test]
    fn anchor_offset_clamps_each_axis_independently() {
        let controls = Controls::new();
        controls.set_anchor_offset_x(10.0);
        controls.set_anchor_offset_y(-10.0);
        let offset = controls.anchor_offset();
        assert_eq!(offset.x, 0.2);
        assert_eq!(offset.y, -0.2);
    }

    #[test]
    fn intensity_sign_toggles_magnitude_preserved() {
        let controls = Controls::new();
        controls.set_smile_intensity(0.7);
        assert_eq!(controls.intensity(), 0.7);
        controls.set_grimace_intensity(0.7);
        assert_eq!(controls.intensity(), -0.7);
        // Negative input is folded into the sign convention, not rejected.
        controls.set_smile_intensity(-0.4);
        assert_eq!(controls.intensity(), 0.4);
        controls.set_grimace_intensity(-0.4);
        assert_eq!(controls.intensity(), -0.4);
    }

    #[test]
    fn uniforms_snapshot_reflects_last_write() {
        let controls = Controls::new();
        controls.set_smile_intensity(0.5);
        controls.set_radius(0.2);
        controls.set_lip_center(Vector2::new(0.4, 0.3));
        controls.set_show_bounding_box(true);

        let u = controls.uniforms();
        assert_eq!(u.intensity, 0.5);
        assert_eq!(u.radius, 0.2);
        assert_eq!(u.lip_center, Vector2::new(0.4, 0.3));
        assert!(u.show_bounding_box);
    }

    #[test]
    fn clones_share_the_same_store() {
        let a = Controls::new();
        let b = a.clone();
        b.set_radius(0.25);
        assert_eq!(a.radius(), 0.25);
    }
}
