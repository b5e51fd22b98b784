//! runtime — cooperative scheduling, cancellation, pipeline assembly
//!
//! Single-threaded cooperative model: one `tick` is one animation frame. Two
//! logical steps run per tick — the detection step (gated by its own init,
//! warm-up and cadence) and the render step (every tick). Shared state flows
//! one way: the detection step writes the overlay buffers and lip center, the
//! render step reads an immutable snapshot; last successful detection wins.
//!
//! Teardown is deterministic: the pipeline owns the detector session, the
//! output stream and every buffer, so dropping it (or raising the cancel
//! flag mid-run) releases everything tied to the component's lifetime.

use anyhow::Result;
use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::info;

use crate::detection::DetectorHandle;
use crate::overlay::OverlayBuilder;
use crate::params::Controls;
use crate::render::SceneComposer;
use crate::stream::{OutputStream, StreamBridge};
use crate::video::FrameSource;

// ── Clock ────────────────────────────────────────────────────────────────────

/// Injectable time source so retry/warm-up machinery is testable without
/// real delays.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

/// Monotonic wall clock anchored at construction.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Hand-advanced clock for tests.
#[derive(Default)]
pub struct ManualClock {
    ms: Cell<u64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, delta_ms: u64) {
        self.ms.set(self.ms.get() + delta_ms);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.ms.get()
    }
}

// ── Cancellation ─────────────────────────────────────────────────────────────

/// Stop flag shared with the owner; checked at the top of every tick.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<Mutex<bool>>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if let Ok(mut flag) = self.0.lock() {
            *flag = true;
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.lock().map(|flag| *flag).unwrap_or(false)
    }
}

// ── ORT dylib discovery ──────────────────────────────────────────────────────

/// Resolve and set ORT_DYLIB_PATH at runtime when it is missing or invalid.
///
/// Priority order:
/// 1) Existing ORT_DYLIB_PATH (if file exists)
/// 2) models/onnxruntime*/lib/libonnxruntime.{so,dylib} near current exe/cwd
pub fn configure_ort_dylib() {
    if let Some(existing) = std::env::var_os("ORT_DYLIB_PATH") {
        let existing_path = PathBuf::from(existing);
        if existing_path.is_file() {
            tracing::info!(path = %existing_path.display(), "using ORT_DYLIB_PATH from environment");
            return;
        }
        tracing::warn!(
            path = %existing_path.display(),
            "ORT_DYLIB_PATH is set but file does not exist; attempting auto-discovery"
        );
    }

    for candidate in ort_candidates() {
        if candidate.is_file() {
            std::env::set_var("ORT_DYLIB_PATH", &candidate);
            tracing::info!(path = %candidate.display(), "configured ORT_DYLIB_PATH");
            return;
        }
    }

    tracing::warn!(
        "could not locate the ONNX Runtime library; set ORT_DYLIB_PATH to an official build"
    );
}

fn ort_candidates() -> Vec<PathBuf> {
    let mut roots = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }

    if let Ok(exe) = std::env::current_exe() {
        let mut dir = exe.parent().map(Path::to_path_buf);
        for _ in 0..7 {
            let Some(d) = dir else {
                break;
            };
            roots.push(d.clone());
            dir = d.parent().map(Path::to_path_buf);
        }
    }

    let mut candidates = Vec::new();
    for root in roots {
        for lib in ["libonnxruntime.so", "libonnxruntime.dylib"] {
            candidates.push(root.join("models/onnxruntime/lib").join(lib));
            candidates.push(root.join("models").join(lib));
        }
    }
    candidates
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Face-mesh ONNX model path.
    pub model_path: PathBuf,
    /// Initial container (canvas) size.
    pub container: (u32, u32),
}

/// Outcome of one cooperative tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A frame was composed and published.
    Rendered,
    /// Preconditions not met this tick (no error).
    Skipped,
    /// The frame source is exhausted.
    Finished,
    /// The cancel flag was raised.
    Cancelled,
}

/// The assembled avatar pipeline: frame source → detector → overlay/params →
/// composer → stream bridge.
pub struct AvatarPipeline<S: FrameSource> {
    source: S,
    detector: DetectorHandle,
    controls: Controls,
    overlay: OverlayBuilder,
    composer: SceneComposer,
    bridge: StreamBridge,
    cancel: CancelFlag,
    clock: Box<dyn Clock>,
}

impl<S: FrameSource> AvatarPipeline<S> {
    pub fn new(source: S, config: PipelineConfig) -> Self {
        Self::with_clock(source, config, Box::new(SystemClock::new()))
    }

    pub fn with_clock(source: S, config: PipelineConfig, clock: Box<dyn Clock>) -> Self {
        Self {
            source,
            detector: DetectorHandle::new(config.model_path),
            controls: Controls::new(),
            overlay: OverlayBuilder::new(),
            composer: SceneComposer::new(config.container.0, config.container.1),
            bridge: StreamBridge::new(),
            cancel: CancelFlag::new(),
            clock,
        }
    }

    /// The control surface, for the owner to keep or expose.
    pub fn controls(&self) -> Controls {
        self.controls.clone()
    }

    /// Shared stop flag; raising it ends the run at the next tick boundary.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Propagate a container size change to the render surface.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.composer.resize(width, height);
    }

    /// One animation frame. `on_stream` fires exactly once over the
    /// pipeline's lifetime, when the output stream is first captured.
    pub fn tick(&mut self, on_stream: &mut dyn FnMut(OutputStream)) -> Result<TickOutcome> {
        if self.cancel.is_cancelled() {
            info!("pipeline cancelled");
            return Ok(TickOutcome::Cancelled);
        }

        if !self.source.advance()? {
            return Ok(TickOutcome::Finished);
        }

        let dims = self.source.dimensions();
        self.composer.try_initialize(dims);

        // Detection step — own cadence, at most one detect call per tick.
        let source_sized = dims.0 > 0 && dims.1 > 0;
        let now = self.clock.now_ms();
        if let Some(detector) = self.detector.poll(self.clock.as_ref(), source_sized) {
            if let Some(frame) = self.source.latest() {
                match detector.detect(frame, now) {
                    Some(set) => {
                        if let Some(uv) = set.lip_center_uv() {
                            self.controls.set_lip_center(uv);
                        }
                        self.overlay.upsert_mesh(&set);
                        if self.controls.show_bounding_box() {
                            self.overlay.upsert_bounding_box(&set);
                        } else {
                            self.overlay.remove_bounding_box();
                        }
                    }
                    None => {
                        // Face lost: both overlays disappear together and
                        // reappear on reacquisition.
                        self.overlay.remove_mesh();
                        self.overlay.remove_bounding_box();
                    }
                }
            }
        }

        // Render step — every tick, never blocked by detection.
        if let Some(frame) = self.source.latest() {
            let uniforms = self.controls.uniforms();
            if let Some(canvas) = self.composer.compose(frame, &uniforms, &self.overlay)? {
                self.bridge.capture_once(on_stream);
                self.bridge.publish(canvas);
                return Ok(TickOutcome::Rendered);
            }
        }

        Ok(TickOutcome::Skipped)
    }

    /// Drive ticks until the source ends or the flag is raised, draining the
    /// output stream through `drain` after every tick.
    pub fn run_to_end(
        &mut self,
        on_stream: &mut dyn FnMut(OutputStream),
        drain: &mut dyn FnMut(&OutputStream) -> Result<()>,
    ) -> Result<()> {
        loop {
            let outcome = self.tick(on_stream)?;
            if let Some(stream) = self.bridge.stream() {
                drain(stream)?;
            }
            match outcome {
                TickOutcome::Finished | TickOutcome::Cancelled => return Ok(()),
                TickOutcome::Rendered | TickOutcome::Skipped => {}
            }
        }
    }
}
