//! render — scene composition + resize adaptation
//!
//! The composer owns the render surface: a video-backed plane, the warp mesh,
//! and the output canvas. One `compose` call per animation tick refreshes the
//! video texture from the latest decoded frame, applies the deformation,
//! draws the overlays, and letterboxes into the container-sized canvas. It
//! never blocks on detection; overlay state is whatever the detection step
//! last wrote.
//!
//! The camera is orthographic and head-on, frustum aspect locked to the
//! source video so the deformation stays pixel-accurate; resizes move the
//! letterbox, never stretch the video.

use anyhow::{Context, Result};
use fast_image_resize as fr;
use image::{ImageBuffer, RgbImage};
use tracing::{debug, info};

use crate::deform::GridWarp;
use crate::landmarks::PLANE_HEIGHT;
use crate::overlay::OverlayBuilder;
use crate::params::DeformUniforms;
use crate::video::RgbFrame;

/// Orthographic camera bounds, world units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frustum {
    pub left: f32,
    pub right: f32,
    pub top: f32,
    pub bottom: f32,
}

impl Frustum {
    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.top - self.bottom
    }
}

/// Placement of the aspect-preserved video inside the container canvas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    /// Fit a `source_aspect` rectangle inside the container: constrained by
    /// width on narrow (mobile) containers, by the limiting dimension
    /// otherwise. Bars fill the rest; the video is never stretched.
    pub fn fit(container: (u32, u32), source_aspect: f32) -> Viewport {
        let (cw, ch) = container;
        let container_aspect = cw as f32 / ch as f32;

        let (width, height) = if container_aspect > source_aspect {
            let h = ch;
            let w = ((ch as f32 * source_aspect) as u32).max(1);
            (w, h)
        } else {
            let w = cw;
            let h = ((cw as f32 / source_aspect) as u32).max(1);
            (w, h)
        };

        Viewport {
            x: (cw - width) / 2,
            y: (ch - height) / 2,
            width,
            height,
        }
    }
}

/// Render surface state machine: `Uninitialized → Ready`, ready for the
/// component's lifetime once both the frame source and the container have
/// non-zero dimensions.
pub struct SceneComposer {
    container: (u32, u32),
    source_size: (u32, u32),
    ready: bool,
    warp: GridWarp,
    resizer: fr::Resizer,
    work: Vec<u8>,
    scaled_buf: Vec<u8>,
    canvas: RgbFrame,
}

impl SceneComposer {
    pub fn new(container_w: u32, container_h: u32) -> Self {
        Self {
            container: (container_w, container_h),
            source_size: (0, 0),
            ready: false,
            warp: GridWarp::new(),
            resizer: fr::Resizer::new(),
            work: Vec::new(),
            scaled_buf: Vec::new(),
            canvas: RgbFrame {
                data: Vec::new(),
                width: 0,
                height: 0,
                pts: 0,
            },
        }
    }

    /// Become ready once both sides are sized; repeated calls are no-ops.
    pub fn try_initialize(&mut self, source_dims: (u32, u32)) -> bool {
        if self.ready {
            return true;
        }
        let (sw, sh) = source_dims;
        let (cw, ch) = self.container;
        if sw == 0 || sh == 0 || cw == 0 || ch == 0 {
            return false;
        }

        self.source_size = (sw, sh);
        self.work = vec![0u8; (sw * sh * 3) as usize];
        self.canvas = RgbFrame {
            data: vec![0u8; (cw * ch * 3) as usize],
            width: cw,
            height: ch,
            pts: 0,
        };
        self.ready = true;
        info!(
            source_w = sw,
            source_h = sh,
            container_w = cw,
            container_h = ch,
            "render surface ready"
        );
        true
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn source_aspect(&self) -> f32 {
        let (sw, sh) = self.source_size;
        if sh == 0 {
            return 1.0;
        }
        sw as f32 / sh as f32
    }

    /// Aspect-locked orthographic bounds; resizing the container never
    /// changes this ratio.
    pub fn frustum(&self) -> Frustum {
        let half_h = PLANE_HEIGHT / 2.0;
        let half_w = half_h * self.source_aspect();
        Frustum {
            left: -half_w,
            right: half_w,
            top: half_h,
            bottom: -half_h,
        }
    }

    pub fn viewport(&self) -> Viewport {
        Viewport::fit(self.container, self.source_aspect())
    }

    /// Recompute the canvas and letterbox placement for a new container size.
    pub fn resize(&mut self, container_w: u32, container_h: u32) {
        if container_w == 0 || container_h == 0 {
            return;
        }
        if (container_w, container_h) == self.container {
            return;
        }
        self.container = (container_w, container_h);
        if self.ready {
            self.canvas = RgbFrame {
                data: vec![0u8; (container_w * container_h * 3) as usize],
                width: container_w,
                height: container_h,
                pts: 0,
            };
            debug!(container_w, container_h, "render surface resized");
        }
    }

    /// One render tick: texture refresh → deformation → overlays → letterbox.
    ///
    /// Returns the composed canvas, or `None` while the surface is not ready
    /// (precondition-not-met is a silent skip, not an error).
    pub fn compose(
        &mut self,
        frame: &RgbFrame,
        uniforms: &DeformUniforms,
        overlay: &OverlayBuilder,
    ) -> Result<Option<&RgbFrame>> {
        if !self.ready {
            return Ok(None);
        }

        let (sw, sh) = self.source_size;
        anyhow::ensure!(
            frame.data.len() == self.work.len(),
            "frame size changed after initialisation: got {}x{}, expected {}x{}",
            frame.width,
            frame.height,
            sw,
            sh
        );

        // Refresh the video texture from the latest decoded frame.
        self.work.copy_from_slice(&frame.data);
        let mut plane = RgbFrame {
            data: std::mem::take(&mut self.work),
            width: sw,
            height: sh,
            pts: frame.pts,
        };

        // Deform in the source orientation (UV space matches the detector's
        // normalized coordinates there), then mirror for selfie display.
        self.warp.apply(&mut plane, uniforms);
        mirror_horizontal(&mut plane);
        overlay.draw(&mut plane);

        self.letterbox(&plane)?;
        self.work = plane.data;
        self.canvas.pts = frame.pts;
        Ok(Some(&self.canvas))
    }

    /// Scale the plane into the viewport and surround it with bars.
    fn letterbox(&mut self, plane: &RgbFrame) -> Result<()> {
        let viewport = self.viewport();

        let src = fr::images::ImageRef::new(
            plane.width,
            plane.height,
            &plane.data,
            fr::PixelType::U8x3,
        )
        .context("failed to create letterbox source")?;

        let scaled_len = (viewport.width * viewport.height * 3) as usize;
        if self.scaled_buf.len() != scaled_len {
            self.scaled_buf.resize(scaled_len, 0);
        }
        let mut dst = fr::images::Image::from_vec_u8(
            viewport.width,
            viewport.height,
            std::mem::take(&mut self.scaled_buf),
            fr::PixelType::U8x3,
        )
        .context("failed to create letterbox destination")?;

        let options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::CatmullRom));
        self.resizer
            .resize(&src, &mut dst, Some(&options))
            .context("letterbox scale failed")?;

        self.scaled_buf = dst.into_vec();

        let canvas_stride = (self.canvas.width * 3) as usize;
        let scaled_stride = (viewport.width * 3) as usize;
        self.canvas.data.fill(0);
        for row in 0..viewport.height as usize {
            let dst_start = (viewport.y as usize + row) * canvas_stride + viewport.x as usize * 3;
            let src_start = row * scaled_stride;
            self.canvas.data[dst_start..dst_start + scaled_stride]
                .copy_from_slice(&self.scaled_buf[src_start..src_start + scaled_stride]);
        }
        Ok(())
    }
}

/// Selfie mirror: flip the frame about its vertical axis in place.
fn mirror_horizontal(frame: &mut RgbFrame) {
    let mut img: RgbImage =
        ImageBuffer::from_raw(frame.width, frame.height, std::mem::take(&mut frame.data))
            .expect("valid frame dimensions");
    image::imageops::flip_horizontal_in_place(&mut img);
    frame.data = img.into_raw();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Controls;

    fn test_frame(w: u32, h: u32) -> RgbFrame {
        RgbFrame {
            data: (0..(w * h * 3) as usize).map(|i| (i % 255) as u8).collect(),
            width: w,
            height: h,
            pts: 7,
        }
    }

    #[test]
    fn stays_uninitialized_until_both_sides_are_sized() {
        let mut composer = SceneComposer::new(640, 480);
        assert!(!composer.try_initialize((0, 0)));
        assert!(!composer.is_ready());

        let mut unsized_container = SceneComposer::new(0, 0);
        assert!(!unsized_container.try_initialize((320, 240)));

        assert!(composer.try_initialize((320, 240)));
        assert!(composer.is_ready());
        // Idempotent: a second call with different dims is a no-op.
        assert!(composer.try_initialize((999, 999)));
        assert_eq!(composer.source_aspect(), 320.0 / 240.0);
    }

    #[test]
    fn compose_skips_silently_before_ready() {
        let mut composer = SceneComposer::new(640, 480);
        let controls = Controls::new();
        let overlay = OverlayBuilder::new();
        let frame = test_frame(320, 240);
        let out = composer
            .compose(&frame, &controls.uniforms(), &overlay)
            .unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn frustum_ratio_equals_source_aspect_across_resizes() {
        let mut composer = SceneComposer::new(800, 600);
        composer.try_initialize((1080, 1920));
        let aspect = 1080.0 / 1920.0;

        for (w, h) in [(800u32, 600u32), (300, 900), (1920, 1080), (375, 667)] {
            composer.resize(w, h);
            let f = composer.frustum();
            assert!((f.width() / f.height() - aspect).abs() < 1e-6);
        }
    }

    #[test]
    fn viewport_preserves_aspect_without_stretching() {
        let aspect = 1080.0 / 1920.0;

        // Narrow (mobile-width) container: fit to width.
        let vp = Viewport::fit((360, 2000), aspect);
        assert_eq!(vp.width, 360);
        assert!((vp.width as f32 / vp.height as f32 - aspect).abs() < 0.01);

        // Wide container: height is the constraint.
        let vp = Viewport::fit((2000, 600), aspect);
        assert_eq!(vp.height, 600);
        assert!((vp.width as f32 / vp.height as f32 - aspect).abs() < 0.01);
    }

    #[test]
    fn compose_letterboxes_into_the_container_canvas() {
        let mut composer = SceneComposer::new(200, 100);
        composer.try_initialize((80, 80)); // square source in a wide container
        let controls = Controls::new();
        let overlay = OverlayBuilder::new();
        let frame = test_frame(80, 80);

        let out = composer
            .compose(&frame, &controls.uniforms(), &overlay)
            .unwrap()
            .unwrap();
        assert_eq!((out.width, out.height), (200, 100));
        assert_eq!(out.pts, 7);

        // Bars on the left edge are black; the centre carries video.
        assert_eq!(&out.data[0..3], &[0, 0, 0]);
        let mid = ((50 * 200 + 100) * 3) as usize;
        assert!(out.data[mid..mid + 3].iter().any(|&b| b != 0));
    }

    #[test]
    fn resize_rebuilds_canvas_at_new_container_size() {
        let mut composer = SceneComposer::new(200, 100);
        composer.try_initialize((80, 80));
        composer.resize(100, 300);
        let controls = Controls::new();
        let overlay = OverlayBuilder::new();
        let frame = test_frame(80, 80);
        let out = composer
            .compose(&frame, &controls.uniforms(), &overlay)
            .unwrap()
            .unwrap();
        assert_eq!((out.width, out.height), (100, 300));
    }
}
