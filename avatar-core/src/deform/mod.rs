//! deform — landmark-driven lip deformation
//!
//! Per-vertex displacement over the video plane: a localized, smoothly
//! falling-off vertical pull centered on the live-tracked mouth position,
//! plus a small horizontal spread. `GridWarp` evaluates the displacement on a
//! fixed-capacity vertex grid each tick and resamples the frame through it;
//! the grid and scratch buffers are allocated once and reused.

use nalgebra::Vector2;
use rayon::prelude::*;

use crate::params::DeformUniforms;
use crate::video::RgbFrame;

/// Vertical pull per unit intensity at the deformation center.
const PULL_GAIN: f32 = 0.1;
/// Horizontal spread per unit intensity.
const SPREAD_GAIN: f32 = 0.03;

/// Grid cells per axis for the warp mesh.
const GRID: usize = 64;

/// Cubic 0→1 transition between `edge0` and `edge1`.
pub fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Displacement of a vertex at `uv`, in UV units (+y up).
///
/// Vertices at `distance >= radius` from the adjusted center are untouched.
/// At the exact center the horizontal direction is undefined; only the
/// vertical pull applies there.
pub fn displacement(uv: Vector2<f32>, u: &DeformUniforms) -> Vector2<f32> {
    let adjusted_center = u.lip_center + u.anchor_offset;
    let delta = uv - adjusted_center;
    let d = delta.norm();
    if d >= u.radius {
        return Vector2::zeros();
    }

    let factor = smoothstep(0.0, 1.0, (u.radius - d) / u.radius);
    let dy = -factor * u.intensity * PULL_GAIN;
    let dx = if d > f32::EPSILON {
        (delta.x / d) * factor * u.intensity * SPREAD_GAIN
    } else {
        0.0
    };
    Vector2::new(dx, dy)
}

/// Fixed-capacity warp mesh over the video plane.
pub struct GridWarp {
    /// Per-vertex displacement, (GRID+1)² entries, row-major from v=0.
    disp: Vec<Vector2<f32>>,
    /// Source copy the warped frame samples from.
    back_buf: Vec<u8>,
}

impl GridWarp {
    pub fn new() -> Self {
        Self {
            disp: vec![Vector2::zeros(); (GRID + 1) * (GRID + 1)],
            back_buf: Vec::new(),
        }
    }

    /// Displace the grid by the current uniforms and resample `frame` through
    /// it (backward bilinear sampling). A zero intensity is a passthrough.
    pub fn apply(&mut self, frame: &mut RgbFrame, uniforms: &DeformUniforms) {
        if uniforms.intensity == 0.0 {
            return;
        }

        // Rewrite the displacement field in place.
        for j in 0..=GRID {
            let v = j as f32 / GRID as f32;
            for i in 0..=GRID {
                let u = i as f32 / GRID as f32;
                self.disp[j * (GRID + 1) + i] = displacement(Vector2::new(u, v), uniforms);
            }
        }

        let w = frame.width as usize;
        let h = frame.height as usize;
        let row_len = w * 3;

        if self.back_buf.len() != frame.data.len() {
            self.back_buf.resize(frame.data.len(), 0);
        }
        self.back_buf.copy_from_slice(&frame.data);

        let disp = &self.disp;
        let back = &self.back_buf;

        frame
            .data
            .par_chunks_mut(row_len)
            .enumerate()
            .for_each(|(y, row)| {
                let uv_y = 1.0 - (y as f32 + 0.5) / h as f32;
                for x in 0..w {
                    let uv_x = (x as f32 + 0.5) / w as f32;
                    let d = sample_grid(disp, uv_x, uv_y);
                    if d.x == 0.0 && d.y == 0.0 {
                        continue;
                    }
                    // A vertex at src lands at dst = src + d, so the pixel at
                    // dst pulls from src = dst - d.
                    let src_u = uv_x - d.x;
                    let src_v = uv_y - d.y;
                    let sx = src_u * w as f32 - 0.5;
                    let sy = (1.0 - src_v) * h as f32 - 0.5;
                    let rgb = bilinear(back, w, h, sx, sy);
                    let o = x * 3;
                    row[o..o + 3].copy_from_slice(&rgb);
                }
            });
    }
}

impl Default for GridWarp {
    fn default() -> Self {
        Self::new()
    }
}

/// Bilinear interpolation of the displacement field at (u, v).
fn sample_grid(disp: &[Vector2<f32>], u: f32, v: f32) -> Vector2<f32> {
    let fx = (u.clamp(0.0, 1.0)) * GRID as f32;
    let fy = (v.clamp(0.0, 1.0)) * GRID as f32;
    let ix = (fx as usize).min(GRID - 1);
    let iy = (fy as usize).min(GRID - 1);
    let tx = fx - ix as f32;
    let ty = fy - iy as f32;

    let stride = GRID + 1;
    let d00 = disp[iy * stride + ix];
    let d10 = disp[iy * stride + ix + 1];
    let d01 = disp[(iy + 1) * stride + ix];
    let d11 = disp[(iy + 1) * stride + ix + 1];

    let top = d00 * (1.0 - tx) + d10 * tx;
    let bottom = d01 * (1.0 - tx) + d11 * tx;
    top * (1.0 - ty) + bottom * ty
}

/// Clamped bilinear sample from a packed RGB24 buffer.
fn bilinear(data: &[u8], w: usize, h: usize, x: f32, y: f32) -> [u8; 3] {
    let x = x.clamp(0.0, (w - 1) as f32);
    let y = y.clamp(0.0, (h - 1) as f32);
    let x0 = x as usize;
    let y0 = y as usize;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let tx = x - x0 as f32;
    let ty = y - y0 as f32;

    let mut out = [0u8; 3];
    for (c, slot) in out.iter_mut().enumerate() {
        let p00 = data[(y0 * w + x0) * 3 + c] as f32;
        let p10 = data[(y0 * w + x1) * 3 + c] as f32;
        let p01 = data[(y1 * w + x0) * 3 + c] as f32;
        let p11 = data[(y1 * w + x1) * 3 + c] as f32;
        let top = p00 * (1.0 - tx) + p10 * tx;
        let bottom = p01 * (1.0 - tx) + p11 * tx;
        *slot = (top * (1.0 - ty) + bottom * ty).round() as u8;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniforms(intensity: f32, radius: f32) -> DeformUniforms {
        DeformUniforms {
            intensity,
            radius,
            anchor_offset: Vector2::new(0.05, -0.02),
            lip_center: Vector2::new(0.5, 0.4),
            show_bounding_box: false,
        }
    }

    #[test]
    fn center_vertex_moves_by_exactly_intensity_gain() {
        let u = uniforms(0.8, 0.2);
        let center = u.lip_center + u.anchor_offset;
        let d = displacement(center, &u);
        assert_eq!(d.x, 0.0);
        assert!((d.y - (-0.8 * 0.1)).abs() < 1e-7);
    }

    #[test]
    fn vertices_at_or_beyond_radius_are_untouched() {
        let u = uniforms(1.0, 0.1);
        let center = u.lip_center + u.anchor_offset;
        let on_ring = center + Vector2::new(0.1, 0.0);
        assert_eq!(displacement(on_ring, &u), Vector2::zeros());
        let outside = center + Vector2::new(0.3, 0.3);
        assert_eq!(displacement(outside, &u), Vector2::zeros());
    }

    #[test]
    fn grimace_pulls_the_other_way() {
        let smile = uniforms(0.5, 0.2);
        let grimace = uniforms(-0.5, 0.2);
        let center = smile.lip_center + smile.anchor_offset;
        assert!(displacement(center, &smile).y < 0.0);
        assert!(displacement(center, &grimace).y > 0.0);
    }

    #[test]
    fn horizontal_spread_points_away_from_center() {
        let u = uniforms(1.0, 0.2);
        let center = u.lip_center + u.anchor_offset;
        let right = displacement(center + Vector2::new(0.05, 0.0), &u);
        let left = displacement(center + Vector2::new(-0.05, 0.0), &u);
        assert!(right.x > 0.0);
        assert!(left.x < 0.0);
    }

    #[test]
    fn smoothstep_endpoints_and_midpoint() {
        assert_eq!(smoothstep(0.0, 1.0, 0.0), 0.0);
        assert_eq!(smoothstep(0.0, 1.0, 1.0), 1.0);
        assert_eq!(smoothstep(0.0, 1.0, 0.5), 0.5);
        assert_eq!(smoothstep(0.0, 1.0, -2.0), 0.0);
        assert_eq!(smoothstep(0.0, 1.0, 3.0), 1.0);
    }

    #[test]
    fn zero_intensity_is_a_passthrough() {
        let mut warp = GridWarp::new();
        let mut frame = RgbFrame {
            data: (0..48 * 48 * 3).map(|i| (i % 251) as u8).collect(),
            width: 48,
            height: 48,
            pts: 0,
        };
        let original = frame.data.clone();
        warp.apply(&mut frame, &uniforms(0.0, 0.2));
        assert_eq!(frame.data, original);
    }

    #[test]
    fn warp_only_touches_pixels_near_the_center() {
        let mut warp = GridWarp::new();
        // Gradient image so displaced samples actually differ.
        let w = 64usize;
        let mut frame = RgbFrame {
            data: (0..w * w * 3).map(|i| ((i / 3) % 256) as u8).collect(),
            width: w as u32,
            height: w as u32,
            pts: 0,
        };
        let original = frame.data.clone();
        let u = uniforms(1.0, 0.1);
        warp.apply(&mut frame, &u);

        // A corner pixel far outside the radius is byte-identical.
        let corner = 0usize;
        assert_eq!(frame.data[corner..corner + 3], original[corner..corner + 3]);
    }
}
