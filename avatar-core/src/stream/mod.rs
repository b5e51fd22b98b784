//! stream — canvas capture bridge
//!
//! Captures the composed canvas as a live output stream exactly once, the
//! first time the render surface exists, and hands the handle to exactly one
//! caller-supplied callback. The stream identity is stable for the bridge's
//! lifetime; repeated capture calls observe the identical stream. Frames are
//! stamped on a fixed 60 samples/second timebase, and a slow consumer loses
//! old frames rather than stalling the render loop.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::video::RgbFrame;

/// Fixed capture rate of the composed canvas.
pub const CAPTURE_FPS: u32 = 60;

/// Frames buffered before the oldest is dropped.
const QUEUE_CAPACITY: usize = 4;

/// A live media stream carrying the continuously rendered canvas.
#[derive(Clone)]
pub struct OutputStream {
    frames: Arc<Mutex<VecDeque<RgbFrame>>>,
}

impl OutputStream {
    fn new() -> Self {
        Self {
            frames: Arc::new(Mutex::new(VecDeque::with_capacity(QUEUE_CAPACITY))),
        }
    }

    pub fn fps(&self) -> u32 {
        CAPTURE_FPS
    }

    /// Two handles are the same stream when they share the underlying queue.
    pub fn same_stream(&self, other: &OutputStream) -> bool {
        Arc::ptr_eq(&self.frames, &other.frames)
    }

    fn push(&self, frame: RgbFrame) {
        if let Ok(mut queue) = self.frames.lock() {
            if queue.len() == QUEUE_CAPACITY {
                queue.pop_front();
            }
            queue.push_back(frame);
        }
    }

    /// Pop the next captured frame, oldest first.
    pub fn next_frame(&self) -> Option<RgbFrame> {
        self.frames.lock().ok().and_then(|mut q| q.pop_front())
    }
}

/// Creates the single output stream and feeds it composed frames.
#[derive(Default)]
pub struct StreamBridge {
    stream: Option<OutputStream>,
    captures: u32,
    frame_index: i64,
}

impl StreamBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// First call captures the canvas as a stream and fires `on_stream`
    /// exactly once; later calls are no-ops returning the identical stream.
    pub fn capture_once(&mut self, on_stream: &mut dyn FnMut(OutputStream)) -> OutputStream {
        if let Some(stream) = &self.stream {
            return stream.clone();
        }
        self.captures += 1;
        let stream = OutputStream::new();
        self.stream = Some(stream.clone());
        info!(fps = CAPTURE_FPS, "canvas captured as output stream");
        on_stream(stream.clone());
        stream
    }

    /// Publish one composed canvas frame, restamped on the capture timebase.
    pub fn publish(&mut self, canvas: &RgbFrame) {
        let Some(stream) = &self.stream else {
            return;
        };
        let mut frame = canvas.clone();
        frame.pts = self.frame_index;
        self.frame_index += 1;
        stream.push(frame);
    }

    /// How many times the underlying capture actually happened.
    pub fn captures(&self) -> u32 {
        self.captures
    }

    pub fn stream(&self) -> Option<&OutputStream> {
        self.stream.as_ref()
    }
}
