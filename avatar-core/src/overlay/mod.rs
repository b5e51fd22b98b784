//! overlay — wireframe face mesh + bounding box
//!
//! Both overlays are created lazily on the first successful detection and
//! then rewritten in place every cycle; the position buffer is sized for the
//! maximum landmark count up front and never reallocated. On a no-face cycle
//! both overlays are removed together and reappear on reacquisition — the
//! manual toggle only controls whether the bounding box is computed at all.

use image::{ImageBuffer, Rgb, RgbImage};
use imageproc::drawing::draw_line_segment_mut;
use nalgebra::Point3;
use tracing::debug;

use crate::landmarks::{to_world, LandmarkSet, FACE_EDGES, MAX_LANDMARKS, PLANE_HEIGHT, PLANE_WIDTH};
use crate::video::RgbFrame;

/// Mesh sits slightly in front of the video plane to avoid z-fighting.
const MESH_Z_OFFSET: f32 = 0.02;
/// Bounding box sits above both the video and the mesh.
const BOX_Z_OFFSET: f32 = 0.04;

const MESH_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_COLOR: Rgb<u8> = Rgb([255, 64, 64]);

/// Persistent wireframe geometry: a fixed-capacity position arena indexed by
/// landmark position, paired with the build-time `FACE_EDGES` index list.
pub struct WireframeMesh {
    /// 468×3 interleaved world coordinates; capacity is fixed at creation.
    positions: Vec<f32>,
    /// Number of valid landmarks this cycle.
    count: usize,
}

impl WireframeMesh {
    fn new() -> Self {
        Self {
            positions: vec![0.0; MAX_LANDMARKS * 3],
            count: 0,
        }
    }

    fn write(&mut self, set: &LandmarkSet) {
        for (i, lm) in set.iter().enumerate() {
            let p = to_world(lm);
            self.positions[i * 3] = p.x;
            self.positions[i * 3 + 1] = p.y;
            self.positions[i * 3 + 2] = p.z + MESH_Z_OFFSET;
        }
        self.count = set.len();
    }

    pub fn positions(&self) -> &[f32] {
        &self.positions
    }

    pub fn count(&self) -> usize {
        self.count
    }

    fn point(&self, index: usize) -> Point3<f32> {
        Point3::new(
            self.positions[index * 3],
            self.positions[index * 3 + 1],
            self.positions[index * 3 + 2],
        )
    }
}

/// Axis-aligned box outline around the mapped landmark extents.
#[derive(Debug, Clone, Copy)]
pub struct BoundingBox {
    pub center: Point3<f32>,
    /// (width, height) in world units.
    pub scale: (f32, f32),
}

/// Maintains the persistent overlay state across detection cycles.
#[derive(Default)]
pub struct OverlayBuilder {
    mesh: Option<WireframeMesh>,
    bbox: Option<BoundingBox>,
    mesh_creations: u64,
    box_creations: u64,
}

impl OverlayBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the mesh on first call, then rewrite the position buffer in
    /// place; marks nothing else dirty — geometry identity is stable.
    pub fn upsert_mesh(&mut self, set: &LandmarkSet) {
        if self.mesh.is_none() {
            self.mesh_creations += 1;
            debug!("wireframe mesh created");
            self.mesh = Some(WireframeMesh::new());
        }
        if let Some(mesh) = self.mesh.as_mut() {
            mesh.write(set);
        }
    }

    /// Detach the mesh; idempotent.
    pub fn remove_mesh(&mut self) {
        self.mesh = None;
    }

    /// Create the box outline on first call, then only rescale/reposition.
    pub fn upsert_bounding_box(&mut self, set: &LandmarkSet) {
        if set.is_empty() {
            return;
        }
        let mut min = [f32::MAX; 3];
        let mut max = [f32::MIN; 3];
        for lm in set.iter() {
            let p = to_world(lm);
            for (axis, value) in [p.x, p.y, p.z].into_iter().enumerate() {
                min[axis] = min[axis].min(value);
                max[axis] = max[axis].max(value);
            }
        }

        let center = Point3::new(
            (min[0] + max[0]) / 2.0,
            (min[1] + max[1]) / 2.0,
            BOX_Z_OFFSET,
        );
        let scale = (max[0] - min[0], max[1] - min[1]);

        match self.bbox.as_mut() {
            Some(bbox) => {
                bbox.center = center;
                bbox.scale = scale;
            }
            None => {
                self.box_creations += 1;
                debug!("bounding box created");
                self.bbox = Some(BoundingBox { center, scale });
            }
        }
    }

    /// Detach the bounding box; idempotent.
    pub fn remove_bounding_box(&mut self) {
        self.bbox = None;
    }

    pub fn mesh(&self) -> Option<&WireframeMesh> {
        self.mesh.as_ref()
    }

    pub fn bounding_box(&self) -> Option<&BoundingBox> {
        self.bbox.as_ref()
    }

    pub fn mesh_creations(&self) -> u64 {
        self.mesh_creations
    }

    pub fn box_creations(&self) -> u64 {
        self.box_creations
    }

    /// Rasterize the attached overlays onto the (already mirrored) frame.
    pub fn draw(&self, frame: &mut RgbFrame) {
        if self.mesh.is_none() && self.bbox.is_none() {
            return;
        }

        let (w, h) = (frame.width, frame.height);
        let mut img: RgbImage =
            ImageBuffer::from_raw(w, h, std::mem::take(&mut frame.data))
                .expect("valid frame dimensions");

        if let Some(mesh) = &self.mesh {
            for &(a, b) in FACE_EDGES {
                let (a, b) = (a as usize, b as usize);
                if a >= mesh.count || b >= mesh.count {
                    continue;
                }
                let pa = world_to_pixel(&mesh.point(a), w, h);
                let pb = world_to_pixel(&mesh.point(b), w, h);
                draw_line_segment_mut(&mut img, pa, pb, MESH_COLOR);
            }
        }

        if let Some(bbox) = &self.bbox {
            let half_w = bbox.scale.0 / 2.0;
            let half_h = bbox.scale.1 / 2.0;
            let corners = [
                Point3::new(bbox.center.x - half_w, bbox.center.y + half_h, 0.0),
                Point3::new(bbox.center.x + half_w, bbox.center.y + half_h, 0.0),
                Point3::new(bbox.center.x + half_w, bbox.center.y - half_h, 0.0),
                Point3::new(bbox.center.x - half_w, bbox.center.y - half_h, 0.0),
            ];
            for i in 0..4 {
                let pa = world_to_pixel(&corners[i], w, h);
                let pb = world_to_pixel(&corners[(i + 1) % 4], w, h);
                draw_line_segment_mut(&mut img, pa, pb, BOX_COLOR);
            }
        }

        frame.data = img.into_raw();
    }
}

/// Project a world-space point onto the mirrored video plane in pixels.
///
/// The frame is displayed selfie-mirrored, which the mirrored world mapping
/// already accounts for: world +x is the viewer's right.
fn world_to_pixel(p: &Point3<f32>, w: u32, h: u32) -> (f32, f32) {
    let x_disp = 0.5 + p.x / PLANE_WIDTH;
    let y_disp = 0.5 - p.y / PLANE_HEIGHT;
    (x_disp * (w - 1) as f32, y_disp * (h - 1) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landmarks::Landmark;

    fn face(offset: f32) -> LandmarkSet {
        let points = (0..MAX_LANDMARKS)
            .map(|i| Landmark {
                x: 0.3 + offset + (i % 7) as f32 * 0.01,
                y: 0.3 + (i % 5) as f32 * 0.01,
                z: 0.0,
            })
            .collect();
        LandmarkSet::from_points(points)
    }

    #[test]
    fn mesh_lifecycle_face_face_none_face() {
        let mut builder = OverlayBuilder::new();

        // Cycle 1: face — created.
        builder.upsert_mesh(&face(0.0));
        assert_eq!(builder.mesh_creations(), 1);
        let ptr_first = builder.mesh().unwrap().positions().as_ptr();

        // Cycle 2: face — updated in place, same buffer identity.
        builder.upsert_mesh(&face(0.1));
        assert_eq!(builder.mesh_creations(), 1);
        assert_eq!(builder.mesh().unwrap().positions().as_ptr(), ptr_first);

        // Cycle 3: none — removed.
        builder.remove_mesh();
        assert!(builder.mesh().is_none());
        builder.remove_mesh(); // idempotent

        // Cycle 4: face — recreated.
        builder.upsert_mesh(&face(0.0));
        assert_eq!(builder.mesh_creations(), 2);
        assert!(builder.mesh().is_some());
    }

    #[test]
    fn bounding_box_lifecycle_mirrors_mesh() {
        let mut builder = OverlayBuilder::new();
        builder.upsert_bounding_box(&face(0.0));
        assert_eq!(builder.box_creations(), 1);
        builder.upsert_bounding_box(&face(0.1));
        assert_eq!(builder.box_creations(), 1);
        builder.remove_bounding_box();
        builder.remove_bounding_box(); // idempotent
        assert!(builder.bounding_box().is_none());
        builder.upsert_bounding_box(&face(0.0));
        assert_eq!(builder.box_creations(), 2);
    }

    #[test]
    fn bounding_box_tracks_mapped_extents() {
        let mut builder = OverlayBuilder::new();
        let set = LandmarkSet::from_points(vec![
            Landmark { x: 0.2, y: 0.2, z: 0.0 },
            Landmark { x: 0.8, y: 0.6, z: 0.0 },
        ]);
        builder.upsert_bounding_box(&set);
        let bbox = builder.bounding_box().unwrap();

        // x: (0.5-0.2)*2 = 0.6 and (0.5-0.8)*2 = -0.6 → width 1.2, center 0.
        assert!((bbox.scale.0 - 1.2).abs() < 1e-6);
        assert!(bbox.center.x.abs() < 1e-6);
        // y: (0.5-0.2)*1.5 = 0.45 and (0.5-0.6)*1.5 = -0.15 → height 0.6.
        assert!((bbox.scale.1 - 0.6).abs() < 1e-6);
        assert!((bbox.center.y - 0.15).abs() < 1e-6);
    }

    #[test]
    fn mesh_positions_buffer_sized_for_max_landmarks() {
        let mut builder = OverlayBuilder::new();
        let small = LandmarkSet::from_points(vec![Landmark { x: 0.5, y: 0.5, z: 0.0 }; 14]);
        builder.upsert_mesh(&small);
        let mesh = builder.mesh().unwrap();
        assert_eq!(mesh.positions().len(), MAX_LANDMARKS * 3);
        assert_eq!(mesh.count(), 14);
    }

    #[test]
    fn world_to_pixel_maps_plane_corners() {
        // World (+1, +0.75) is the mirrored view of normalized (0,0): the
        // viewer's right edge, top row.
        let (px, py) = world_to_pixel(&Point3::new(1.0, 0.75, 0.0), 101, 101);
        assert!((px - 100.0).abs() < 1e-4);
        assert!(py.abs() < 1e-4);

        let (px, py) = world_to_pixel(&Point3::new(-1.0, -0.75, 0.0), 101, 101);
        assert!(px.abs() < 1e-4);
        assert!((py - 100.0).abs() < 1e-4);
    }

    #[test]
    fn draw_marks_pixels_on_the_frame() {
        let mut builder = OverlayBuilder::new();
        builder.upsert_mesh(&face(0.0));
        let mut frame = RgbFrame {
            data: vec![0u8; 64 * 64 * 3],
            width: 64,
            height: 64,
            pts: 0,
        };
        builder.draw(&mut frame);
        assert!(frame.data.iter().any(|&b| b != 0));
    }
}
