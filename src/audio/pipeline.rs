//! Capture path: device callback -> resampler -> framer -> transport

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::audio::capture::SampleCallback;
use crate::audio::framer::Framer;
use crate::audio::resampler::resample;
use crate::protocol::TransportConfig;
use crate::transport::Transport;

/// Microphone activity shared between sessions and the status API
#[derive(Default)]
pub struct MicActivity {
    last_frame_at: Mutex<Option<DateTime<Utc>>>,
    frames_sent: AtomicU64,
}

impl MicActivity {
    pub fn record_frame(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        *self.last_frame_at.lock() = Some(Utc::now());
    }

    pub fn last_frame_at(&self) -> Option<DateTime<Utc>> {
        *self.last_frame_at.lock()
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }
}

/// Gate between the capture device and the transport.
///
/// A node starts disconnected; blocks delivered before `connect` are dropped.
pub struct ProcessingNode {
    connected: AtomicBool,
    activity: Arc<MicActivity>,
}

impl ProcessingNode {
    pub fn new(activity: Arc<MicActivity>) -> Self {
        Self {
            connected: AtomicBool::new(false),
            activity,
        }
    }

    pub fn connect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Per-session capture pipeline state, owned by the device callback
pub struct CapturePipeline<T: Transport> {
    target_rate: u32,
    framer: Framer,
    transport: Arc<T>,
    node: Arc<ProcessingNode>,
}

impl<T: Transport> CapturePipeline<T> {
    pub fn new(config: TransportConfig, transport: Arc<T>, node: Arc<ProcessingNode>) -> Self {
        Self {
            target_rate: config.input_sample_rate,
            framer: Framer::new(config.frame_samples),
            transport,
            node,
        }
    }

    /// Handle one mono block captured at `source_rate`.
    /// Returns the number of frames handed to the transport.
    pub fn process(&mut self, block: &[f32], source_rate: u32) -> usize {
        if !self.node.is_connected() || block.is_empty() {
            return 0;
        }

        let pcm = resample(block, source_rate, self.target_rate);
        let frames = self.framer.push(&pcm);
        let count = frames.len();
        for frame in frames {
            self.transport.send(frame);
            self.node.activity.record_frame();
        }
        count
    }

    /// Samples held back waiting for a full frame
    pub fn buffered(&self) -> usize {
        self.framer.remainder().len()
    }

    pub fn into_callback(mut self) -> SampleCallback {
        Box::new(move |block: &[f32], source_rate: u32| {
            self.process(block, source_rate);
        })
    }
}
