//! landmarks — landmark set, facial topology, coordinate mapping
//!
//! Detector output is a fresh ordered set of up to 468 normalized points per
//! cycle; index position is the only inter-frame identity. The mapper is pure
//! and stateless. One mirrored-world convention is used everywhere: the video
//! plane is displayed selfie-mirrored, so world X is mirrored for every
//! consumer (wireframe mesh and bounding box alike).

use nalgebra::{Point3, Vector2};

/// Maximum landmark count of the face-mesh topology.
pub const MAX_LANDMARKS: usize = 468;
/// Mouth-center landmark (upper inner lip midpoint) driving the deformation.
pub const LIP_CENTER_INDEX: usize = 13;

/// World extents of the video plane.
pub const PLANE_WIDTH: f32 = 2.0;
pub const PLANE_HEIGHT: f32 = 1.5;

/// One tracked facial keypoint, normalized image coordinates.
/// x, y in [0,1] with origin top-left; z is detector-relative depth.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// The full ordered landmark collection for one face in one detection cycle.
#[derive(Debug, Clone)]
pub struct LandmarkSet {
    points: Vec<Landmark>,
}

impl LandmarkSet {
    pub fn from_points(mut points: Vec<Landmark>) -> Self {
        points.truncate(MAX_LANDMARKS);
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Landmark> {
        self.points.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Landmark> {
        self.points.iter()
    }

    /// UV position of the mouth center, if the set carries that index.
    pub fn lip_center_uv(&self) -> Option<Vector2<f32>> {
        self.get(LIP_CENTER_INDEX).map(to_uv)
    }
}

// ── Coordinate mapper ────────────────────────────────────────────────────────

/// Normalized landmark → render-space point on the mirrored 2×1.5 plane.
///
/// (0,0) maps to (+1, +0.75); (1,1) maps to (-1, -0.75). Depth is compressed
/// by half; detectors that omit z report 0.
pub fn to_world(lm: &Landmark) -> Point3<f32> {
    Point3::new(
        (0.5 - lm.x) * PLANE_WIDTH,
        (0.5 - lm.y) * PLANE_HEIGHT,
        lm.z * 0.5,
    )
}

/// Normalized landmark → texture UV. Only the vertical axis flips: UV space
/// has its origin at the bottom, image coordinates at the top.
pub fn to_uv(lm: &Landmark) -> Vector2<f32> {
    Vector2::new(lm.x, 1.0 - lm.y)
}

// ── Facial feature edge list ─────────────────────────────────────────────────

/// Wireframe edges of the standard 468-point facial topology: lips, eyes,
/// eyebrows, and the face oval. Fixed for the process lifetime.
pub const FACE_EDGES: &[(u16, u16)] = &[
    // Lips (outer and inner contours)
    (61, 146), (146, 91), (91, 181), (181, 84), (84, 17),
    (17, 314), (314, 405), (405, 321), (321, 375), (375, 291),
    (61, 185), (185, 40), (40, 39), (39, 37), (37, 0),
    (0, 267), (267, 269), (269, 270), (270, 409), (409, 291),
    (78, 95), (95, 88), (88, 178), (178, 87), (87, 14),
    (14, 317), (317, 402), (402, 318), (318, 324), (324, 308),
    (78, 191), (191, 80), (80, 81), (81, 82), (82, 13),
    (13, 312), (312, 311), (311, 310), (310, 415), (415, 308),
    // Left eye
    (263, 249), (249, 390), (390, 373), (373, 374), (374, 380),
    (380, 381), (381, 382), (382, 362), (263, 466), (466, 388),
    (388, 387), (387, 386), (386, 385), (385, 384), (384, 398),
    (398, 362),
    // Left eyebrow
    (276, 283), (283, 282), (282, 295), (295, 285), (300, 293),
    (293, 334), (334, 296), (296, 336),
    // Right eye
    (33, 7), (7, 163), (163, 144), (144, 145), (145, 153),
    (153, 154), (154, 155), (155, 133), (33, 246), (246, 161),
    (161, 160), (160, 159), (159, 158), (158, 157), (157, 173),
    (173, 133),
    // Right eyebrow
    (46, 53), (53, 52), (52, 65), (65, 55), (70, 63),
    (63, 105), (105, 66), (66, 107),
    // Face oval
    (10, 338), (338, 297), (297, 332), (332, 284), (284, 251),
    (251, 389), (389, 356), (356, 454), (454, 323), (323, 361),
    (361, 288), (288, 397), (397, 365), (365, 379), (379, 378),
    (378, 400), (400, 377), (377, 152), (152, 148), (148, 176),
    (176, 149), (149, 150), (150, 136), (136, 172), (172, 58),
    (58, 132), (132, 93), (93, 234), (234, 127), (127, 162),
    (162, 21), (21, 54), (54, 103), (103, 67), (67, 109),
    (109, 10),
];
