//! detection — face-mesh landmark inference via ONNX Runtime
//!
//! Owns the single detector session. Initialisation tries the
//! hardware-accelerated execution providers first and falls back to a
//! CPU-only session; a total failure is retried forever on a fixed backoff
//! and never surfaced as a crash. A fixed warm-up delay runs after the frame
//! source first reports non-zero dimensions, before the first detect call.
//!
//! `detect` is pull-based: at most one call per tick, and a per-call failure
//! is logged and treated as "no face this frame".

use anyhow::{Context, Result};
use fast_image_resize as fr;
use ort::execution_providers as ep;
use ort::session::Session;
use ort::value::Tensor;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::landmarks::{Landmark, LandmarkSet, MAX_LANDMARKS};
use crate::runtime::Clock;
use crate::video::RgbFrame;

// ── Constants ────────────────────────────────────────────────────────────────

/// Face-mesh model input size (square).
const MESH_INPUT_SIZE: u32 = 192;
/// Face presence score below this is treated as "no face".
const PRESENCE_THRESHOLD: f32 = 0.5;
/// Landmark coordinate count: 468 points × (x, y, z).
const LANDMARK_FLOATS: usize = MAX_LANDMARKS * 3;

/// Delay before re-attempting a failed detector load.
pub const RETRY_BACKOFF_MS: u64 = 2000;
/// Warm-up observed after the frame source becomes decodable, before the
/// first detection call.
pub const WARMUP_MS: u64 = 500;

// ── Detector ─────────────────────────────────────────────────────────────────

/// Wraps the face-mesh ONNX session. At most one instance is ever active.
pub struct LandmarkDetector {
    session: Session,
    resizer: fr::Resizer,
    resize_buf: Vec<u8>,
}

impl LandmarkDetector {
    /// Load the face-mesh model, preferring hardware acceleration.
    pub fn load<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let model_path = model_path.as_ref();
        let session = match build_session(model_path, true) {
            Ok(session) => {
                info!(path = %model_path.display(), "face-mesh session ready (accelerated)");
                session
            }
            Err(e) => {
                warn!("accelerated session failed, falling back to CPU: {e:#}");
                let session = build_session(model_path, false)
                    .context("failed to load face-mesh ONNX model")?;
                info!(path = %model_path.display(), "face-mesh session ready (CPU)");
                session
            }
        };

        Ok(Self {
            session,
            resizer: fr::Resizer::new(),
            resize_buf: vec![0u8; (MESH_INPUT_SIZE * MESH_INPUT_SIZE * 3) as usize],
        })
    }

    /// Run one detection cycle against the current frame.
    ///
    /// `None` means "no face currently visible" — including the case where
    /// the inference call itself failed, which must not stop the loop.
    pub fn detect(&mut self, frame: &RgbFrame, timestamp_ms: u64) -> Option<LandmarkSet> {
        match self.detect_inner(frame) {
            Ok(result) => result,
            Err(e) => {
                warn!(timestamp_ms, "detection cycle failed: {e:#}");
                None
            }
        }
    }

    fn detect_inner(&mut self, frame: &RgbFrame) -> Result<Option<LandmarkSet>> {
        let input_tensor = self.preprocess(frame)?;

        let outputs = self
            .session
            .run(ort::inputs!["input" => input_tensor])
            .context("face-mesh inference failed")?;

        let tensors: Vec<Vec<f32>> = outputs
            .iter()
            .filter_map(|(_name, value)| {
                value
                    .try_extract_tensor::<f32>()
                    .ok()
                    .map(|(_shape, data)| data.to_vec())
            })
            .collect();

        interpret_outputs(&tensors)
    }

    fn preprocess(&mut self, frame: &RgbFrame) -> Result<ort::value::DynValue> {
        let src =
            fr::images::ImageRef::new(frame.width, frame.height, &frame.data, fr::PixelType::U8x3)
                .context("failed to create face-mesh resize source")?;

        let mut dst = fr::images::Image::from_vec_u8(
            MESH_INPUT_SIZE,
            MESH_INPUT_SIZE,
            std::mem::take(&mut self.resize_buf),
            fr::PixelType::U8x3,
        )
        .context("failed to create face-mesh resize destination")?;

        let options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
        self.resizer
            .resize(&src, &mut dst, Some(&options))
            .context("face-mesh downscale failed")?;

        self.resize_buf = dst.into_vec();
        let raw = &self.resize_buf;

        // NCHW float tensor: [1, 3, 192, 192], normalised to [0, 1].
        let size = (MESH_INPUT_SIZE * MESH_INPUT_SIZE) as usize;
        let mut tensor_data = vec![0f32; 3 * size];

        let (r_plane, gb_plane) = tensor_data.split_at_mut(size);
        let (g_plane, b_plane) = gb_plane.split_at_mut(size);
        rayon::join(
            || {
                r_plane
                    .par_iter_mut()
                    .enumerate()
                    .for_each(|(idx, out)| *out = raw[idx * 3] as f32 / 255.0)
            },
            || {
                rayon::join(
                    || {
                        g_plane
                            .par_iter_mut()
                            .enumerate()
                            .for_each(|(idx, out)| *out = raw[idx * 3 + 1] as f32 / 255.0)
                    },
                    || {
                        b_plane
                            .par_iter_mut()
                            .enumerate()
                            .for_each(|(idx, out)| *out = raw[idx * 3 + 2] as f32 / 255.0)
                    },
                )
            },
        );

        let shape = [1usize, 3, MESH_INPUT_SIZE as usize, MESH_INPUT_SIZE as usize];
        Ok(Tensor::from_array((shape, tensor_data.into_boxed_slice()))
            .context("failed to create face-mesh input tensor")?
            .into_dyn())
    }
}

/// Interpret raw model output tensors.
///
/// The model emits a 1404-float landmark tensor (468 × xyz, in input pixel
/// units) and a single-float presence logit. Export tools name the outputs
/// inconsistently, so both are discovered by element count. A below-threshold
/// confidence is "no face", and only the first 1404 floats are consumed even
/// if an export packs more (exactly one primary face).
fn interpret_outputs(tensors: &[Vec<f32>]) -> Result<Option<LandmarkSet>> {
    let mut landmark_data: Option<&[f32]> = None;
    let mut score: Option<f32> = None;
    for data in tensors {
        if data.len() >= LANDMARK_FLOATS && landmark_data.is_none() {
            landmark_data = Some(data);
        } else if data.len() == 1 && score.is_none() {
            score = Some(data[0]);
        }
    }

    let landmark_data = landmark_data.context("face-mesh output has no landmark tensor")?;
    let score = score.context("face-mesh output has no presence score")?;

    // Raw score is a logit; squash to a confidence.
    let confidence = 1.0 / (1.0 + (-score).exp());
    if confidence < PRESENCE_THRESHOLD {
        debug!(confidence, "no face this cycle");
        return Ok(None);
    }

    let inv = 1.0 / MESH_INPUT_SIZE as f32;
    let points = landmark_data[..LANDMARK_FLOATS]
        .chunks_exact(3)
        .map(|xyz| Landmark {
            x: (xyz[0] * inv).clamp(0.0, 1.0),
            y: (xyz[1] * inv).clamp(0.0, 1.0),
            z: xyz[2] * inv,
        })
        .collect();

    Ok(Some(LandmarkSet::from_points(points)))
}

fn build_session(model_path: &Path, accelerated: bool) -> Result<Session> {
    let mut builder = Session::builder().context("failed to create ORT session builder")?;
    builder = builder
        .with_intra_threads(1)
        .context("failed to set ORT intra threads")?;
    builder = builder
        .with_inter_threads(1)
        .context("failed to set ORT inter threads")?;
    builder = builder
        .with_parallel_execution(false)
        .context("failed to set ORT parallel execution")?;
    if accelerated {
        builder = builder
            .with_execution_providers([
                ep::CUDAExecutionProvider::default().build().error_on_failure(),
            ])
            .context("failed to register accelerated execution provider")?;
    }
    builder
        .commit_from_file(model_path)
        .context("failed to load face-mesh ONNX model")
}

// ── Initialisation schedule ──────────────────────────────────────────────────

/// Pure retry/warm-up state machine, driven by an injected clock so tests
/// never sleep.
#[derive(Debug, Default)]
pub struct InitSchedule {
    next_attempt_ms: u64,
    warmup_deadline_ms: Option<u64>,
}

impl InitSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a (re)load attempt may run now.
    pub fn attempt_due(&self, now_ms: u64) -> bool {
        now_ms >= self.next_attempt_ms
    }

    /// Push the next attempt out by the fixed backoff.
    pub fn record_failure(&mut self, now_ms: u64) {
        self.next_attempt_ms = now_ms + RETRY_BACKOFF_MS;
    }

    /// Whether a detect call may run now. The warm-up window only starts
    /// once the frame source reports non-zero dimensions.
    pub fn detection_allowed(&mut self, now_ms: u64, source_sized: bool) -> bool {
        if !source_sized {
            return false;
        }
        match self.warmup_deadline_ms {
            None => {
                self.warmup_deadline_ms = Some(now_ms + WARMUP_MS);
                false
            }
            Some(deadline) => now_ms >= deadline,
        }
    }
}

// ── Handle ───────────────────────────────────────────────────────────────────

/// Owns the detector lifecycle: load-with-retry, warm-up gating, and the
/// single live session.
pub struct DetectorHandle {
    model_path: PathBuf,
    schedule: InitSchedule,
    detector: Option<LandmarkDetector>,
    attempts: u64,
}

impl DetectorHandle {
    pub fn new<P: Into<PathBuf>>(model_path: P) -> Self {
        Self {
            model_path: model_path.into(),
            schedule: InitSchedule::new(),
            detector: None,
            attempts: 0,
        }
    }

    /// Advance the init state machine and return the detector once a detect
    /// call is permitted this tick.
    pub fn poll(&mut self, clock: &dyn Clock, source_sized: bool) -> Option<&mut LandmarkDetector> {
        let now = clock.now_ms();

        if self.detector.is_none() {
            if !self.schedule.attempt_due(now) {
                return None;
            }
            self.attempts += 1;
            match LandmarkDetector::load(&self.model_path) {
                Ok(detector) => {
                    self.detector = Some(detector);
                }
                Err(e) => {
                    warn!(
                        attempt = self.attempts,
                        retry_in_ms = RETRY_BACKOFF_MS,
                        "detector load failed: {e:#}"
                    );
                    self.schedule.record_failure(now);
                    return None;
                }
            }
        }

        if self.schedule.detection_allowed(now, source_sized) {
            self.detector.as_mut()
        } else {
            None
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.detector.is_some()
    }

    pub fn attempts(&self) -> u64 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ManualClock;

    #[test]
    fn schedule_backs_off_after_failure() {
        let mut schedule = InitSchedule::new();
        assert!(schedule.attempt_due(0));
        schedule.record_failure(0);
        assert!(!schedule.attempt_due(1999));
        assert!(schedule.attempt_due(2000));
        schedule.record_failure(2000);
        assert!(!schedule.attempt_due(3999));
        assert!(schedule.attempt_due(4000));
    }

    #[test]
    fn warmup_starts_only_once_source_is_sized() {
        let mut schedule = InitSchedule::new();
        // Source not yet decodable: never allowed, warm-up not started.
        assert!(!schedule.detection_allowed(100, false));
        assert!(!schedule.detection_allowed(10_000, false));
        // First sized call starts the 500 ms window.
        assert!(!schedule.detection_allowed(10_000, true));
        assert!(!schedule.detection_allowed(10_499, true));
        assert!(schedule.detection_allowed(10_500, true));
        assert!(schedule.detection_allowed(20_000, true));
    }

    /// 1404 floats in input pixel units: landmark i sits at (i, 2i, -i).
    fn landmark_tensor() -> Vec<f32> {
        (0..MAX_LANDMARKS)
            .flat_map(|i| [i as f32, (2 * i) as f32, -(i as f32)])
            .collect()
    }

    #[test]
    fn below_threshold_score_means_no_face() {
        // Logit -1 squashes to ≈0.27, under the 0.5 presence threshold.
        let tensors = vec![landmark_tensor(), vec![-1.0]];
        assert!(interpret_outputs(&tensors).unwrap().is_none());

        // Logit 0 squashes to exactly 0.5, which is not below threshold.
        let tensors = vec![landmark_tensor(), vec![0.0]];
        assert!(interpret_outputs(&tensors).unwrap().is_some());
    }

    #[test]
    fn confident_output_normalises_by_input_size() {
        let tensors = vec![landmark_tensor(), vec![4.0]];
        let set = interpret_outputs(&tensors).unwrap().unwrap();
        assert_eq!(set.len(), MAX_LANDMARKS);

        // Pixel coords divided by 192; x/y clamped to [0,1], z signed.
        let lm = set.get(96).unwrap();
        assert!((lm.x - 0.5).abs() < 1e-6);
        assert!((lm.y - 1.0).abs() < 1e-6); // 192 px / 192
        assert!((lm.z - (-0.5)).abs() < 1e-6);

        let far = set.get(400).unwrap();
        assert_eq!((far.x, far.y), (1.0, 1.0)); // beyond the input square
    }

    #[test]
    fn oversized_landmark_tensor_uses_only_the_first_face() {
        let mut packed = landmark_tensor();
        packed.extend(std::iter::repeat(999.0).take(LANDMARK_FLOATS));
        let tensors = vec![packed, vec![4.0]];
        let set = interpret_outputs(&tensors).unwrap().unwrap();
        assert_eq!(set.len(), MAX_LANDMARKS);
        // The second face's 999-px coords never reach the set.
        assert!(set.iter().all(|lm| lm.x <= 1.0 && lm.y <= 1.0));
    }

    #[test]
    fn tensor_order_does_not_matter() {
        let tensors = vec![vec![4.0], landmark_tensor()];
        assert!(interpret_outputs(&tensors).unwrap().is_some());
    }

    #[test]
    fn missing_tensors_are_an_error_not_a_panic() {
        assert!(interpret_outputs(&[landmark_tensor()]).is_err());
        assert!(interpret_outputs(&[vec![4.0]]).is_err());
        assert!(interpret_outputs(&[]).is_err());
    }

    #[test]
    fn handle_retries_forever_without_crashing() {
        let clock = ManualClock::new();
        let mut handle = DetectorHandle::new("/nonexistent/face_mesh.onnx");

        assert!(handle.poll(&clock, true).is_none());
        assert_eq!(handle.attempts(), 1);

        // Within backoff: no new attempt.
        clock.advance(RETRY_BACKOFF_MS - 1);
        assert!(handle.poll(&clock, true).is_none());
        assert_eq!(handle.attempts(), 1);

        // Backoff elapsed: retried.
        clock.advance(1);
        assert!(handle.poll(&clock, true).is_none());
        assert_eq!(handle.attempts(), 2);

        clock.advance(RETRY_BACKOFF_MS);
        assert!(handle.poll(&clock, true).is_none());
        assert_eq!(handle.attempts(), 3);
        assert!(!handle.is_loaded());
    }
}
