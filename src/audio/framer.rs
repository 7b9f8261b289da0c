//! Fixed-size frame accumulator for outbound microphone audio

use bytes::Bytes;

use crate::protocol::encode_pcm16;

/// Accumulates PCM16 samples and cuts them into transport frames
pub struct Framer {
    /// Samples per emitted frame
    frame_samples: usize,
    /// Samples waiting for frame alignment
    pending: Vec<i16>,
    /// Frames emitted since creation
    frames_emitted: u64,
}

impl Framer {
    /// Create a framer. A frame size of zero is treated as one sample.
    pub fn new(frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            frame_samples,
            pending: Vec::with_capacity(frame_samples * 2),
            frames_emitted: 0,
        }
    }

    /// Append samples and return every complete frame, oldest first
    pub fn push(&mut self, samples: &[i16]) -> Vec<Bytes> {
        self.pending.extend_from_slice(samples);

        let complete = self.pending.len() / self.frame_samples;
        if complete == 0 {
            return Vec::new();
        }

        let consumed = complete * self.frame_samples;
        let frames: Vec<Bytes> = self.pending[..consumed]
            .chunks_exact(self.frame_samples)
            .map(encode_pcm16)
            .collect();
        self.pending.drain(..consumed);
        self.frames_emitted += frames.len() as u64;

        frames
    }

    /// Samples still waiting for the next push
    pub fn remainder(&self) -> &[i16] {
        &self.pending
    }

    /// Drop any buffered samples
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }
}
