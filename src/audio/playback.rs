//! Gap-free scheduling of inbound speaker audio
//!
//! Every inbound buffer is placed on the render context's timeline right after
//! the previous one, or slightly in the future if the timeline has already
//! moved past that point. Late arrivals therefore produce silence gaps but
//! never overlap.

use std::time::{Duration, Instant};

use crate::constants::{DEFAULT_OUTPUT_SAMPLE_RATE, PLAYBACK_LEAD_SECONDS, RESUME_RETRY_INTERVAL_MS};
use crate::error::AudioError;
use crate::protocol::decode_pcm16;

/// An audio output timeline that accepts buffers at absolute start times
pub trait RenderContext: Send {
    /// Current position of the output timeline in seconds
    fn current_time(&self) -> f64;

    /// Whether output is paused by the host (e.g. autoplay policy)
    fn is_suspended(&self) -> bool;

    /// Ask the host to resume output. Must not wait on the device;
    /// `PlaybackUnsupported` means output will never start.
    fn resume(&mut self) -> Result<(), AudioError>;

    /// Queue mono samples at `sample_rate` to start at `start_at` seconds
    fn schedule(&mut self, samples: Vec<f32>, sample_rate: u32, start_at: f64);
}

/// Creates the render context on first use
pub trait RenderContextFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn RenderContext>, AudioError>;
}

/// Placement of one inbound buffer on the output timeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledBuffer {
    /// Start time in seconds
    pub start: f64,
    /// Duration in seconds
    pub duration: f64,
}

impl ScheduledBuffer {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Schedules inbound PCM16 frames for back-to-back playback
pub struct PlaybackScheduler {
    factory: Box<dyn RenderContextFactory>,
    context: Option<Box<dyn RenderContext>>,
    /// Set once context creation failed; playback stays off afterwards
    unsupported: Option<String>,
    /// Next free start time on the output timeline
    clock: f64,
    output_sample_rate: u32,
    frames_scheduled: u64,
    last_resume_attempt: Option<Instant>,
}

impl PlaybackScheduler {
    pub fn new(factory: Box<dyn RenderContextFactory>) -> Self {
        Self {
            factory,
            context: None,
            unsupported: None,
            clock: 0.0,
            output_sample_rate: DEFAULT_OUTPUT_SAMPLE_RATE,
            frames_scheduled: 0,
            last_resume_attempt: None,
        }
    }

    /// Sample rate used to interpret inbound frames
    pub fn set_output_rate(&mut self, sample_rate: u32) {
        if sample_rate > 0 {
            self.output_sample_rate = sample_rate;
        }
    }

    pub fn output_rate(&self) -> u32 {
        self.output_sample_rate
    }

    /// Next free start time
    pub fn clock(&self) -> f64 {
        self.clock
    }

    pub fn frames_scheduled(&self) -> u64 {
        self.frames_scheduled
    }

    /// Resume a suspended context after a user gesture.
    /// Creates the context if it does not exist yet.
    pub fn unlock(&mut self) -> Result<(), AudioError> {
        self.resume_if_suspended(true)
    }

    /// Decode one inbound frame and queue it.
    /// Returns `None` for payloads that hold no complete sample.
    pub fn on_frame(&mut self, data: &[u8]) -> Result<Option<ScheduledBuffer>, AudioError> {
        let pcm = decode_pcm16(data);
        if pcm.is_empty() {
            return Ok(None);
        }

        match self.resume_if_suspended(false) {
            Err(e @ AudioError::PlaybackUnsupported(_)) => return Err(e),
            Err(e) => tracing::debug!("Render context still suspended: {}", e),
            Ok(()) => {}
        }

        let rate = self.output_sample_rate;
        let clock = self.clock;
        let context = self.ensure_context()?;

        let samples: Vec<f32> = pcm.iter().map(|&s| s as f32 / 32768.0).collect();
        let duration = samples.len() as f64 / rate as f64;
        let start = clock.max(context.current_time() + PLAYBACK_LEAD_SECONDS);

        context.schedule(samples, rate, start);

        self.clock = start + duration;
        self.frames_scheduled += 1;

        Ok(Some(ScheduledBuffer { start, duration }))
    }

    /// Opportunistic attempts are spaced out; `forced` ones are not
    fn resume_if_suspended(&mut self, forced: bool) -> Result<(), AudioError> {
        let due = forced
            || self.last_resume_attempt.map_or(true, |at| {
                at.elapsed() >= Duration::from_millis(RESUME_RETRY_INTERVAL_MS)
            });

        let context = self.ensure_context()?;
        if !due || !context.is_suspended() {
            return Ok(());
        }

        let result = context.resume();
        self.last_resume_attempt = Some(Instant::now());
        match result {
            Err(AudioError::PlaybackUnsupported(reason)) => Err(self.disable(reason)),
            other => other,
        }
    }

    /// Drop the context and refuse playback from now on
    fn disable(&mut self, reason: String) -> AudioError {
        tracing::warn!("Audio output unavailable, playback disabled: {}", reason);
        self.context = None;
        self.unsupported = Some(reason.clone());
        AudioError::PlaybackUnsupported(reason)
    }

    fn ensure_context(&mut self) -> Result<&mut Box<dyn RenderContext>, AudioError> {
        if let Some(reason) = &self.unsupported {
            return Err(AudioError::PlaybackUnsupported(reason.clone()));
        }

        if self.context.is_none() {
            match self.factory.create() {
                Ok(context) => {
                    tracing::info!("Audio output initialized");
                    self.context = Some(context);
                }
                Err(e) => return Err(self.disable(e.to_string())),
            }
        }

        self.context
            .as_mut()
            .ok_or_else(|| AudioError::PlaybackUnsupported("no render context".into()))
    }
}
