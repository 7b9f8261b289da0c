//! Speaker output through cpal
//!
//! Implements [`RenderContext`] on top of a cpal output stream. Scheduled
//! buffers are written into a sample timeline that the output callback
//! drains; positions on the timeline are measured in device frames, so the
//! context clock advances exactly as fast as the device consumes audio.
//!
//! The stream lives on its own thread. Nothing here waits on that thread:
//! it reports back through [`OutputStatus`], and resume requests are queued
//! to it.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

use crate::audio::device::{find_device, Direction};
use crate::audio::playback::{RenderContext, RenderContextFactory};
use crate::audio::resampler::{float_to_pcm16, resample_f32};
use crate::error::AudioError;

/// Pending output samples plus the device position of the first one
#[derive(Debug, Default)]
struct Timeline {
    /// Device frames rendered so far
    base_frame: u64,
    queue: VecDeque<f32>,
    /// Device frame right after the last placed buffer
    tail: Option<u64>,
}

impl Timeline {
    /// Place mono samples starting at absolute device frame `start_frame`.
    /// Overlapping samples replace what is queued.
    fn place(&mut self, samples: &[f32], start_frame: u64) {
        let mut start_frame = start_frame;
        if let Some(tail) = self.tail {
            // Rounding seconds to frames can land one frame off the previous buffer
            if start_frame.abs_diff(tail) <= 1 {
                start_frame = tail;
            }
        }
        let end = start_frame + samples.len() as u64;
        self.tail = Some(self.tail.map_or(end, |tail| tail.max(end)));

        let mut samples = samples;
        if start_frame < self.base_frame {
            // Already past part of this buffer; drop what is late
            let late = (self.base_frame - start_frame) as usize;
            if late >= samples.len() {
                return;
            }
            samples = &samples[late..];
        }

        let offset = start_frame.saturating_sub(self.base_frame) as usize;
        if offset > self.queue.len() {
            self.queue.resize(offset, 0.0);
        }

        for (i, &sample) in samples.iter().enumerate() {
            match self.queue.get_mut(offset + i) {
                Some(slot) => *slot = sample,
                None => self.queue.push_back(sample),
            }
        }
    }

    /// Fill an interleaved output buffer, silence where nothing is queued
    fn render(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        for frame in out.chunks_mut(channels) {
            let sample = self.queue.pop_front().unwrap_or(0.0);
            frame.iter_mut().for_each(|s| *s = sample);
        }
        self.base_frame += (out.len() / channels) as u64;
    }
}

/// Lifecycle of the output stream as reported by its thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputStatus {
    /// Thread spawned, stream not built yet
    Starting,
    Running,
    /// Built, but the host refused to start it
    Suspended,
    /// The stream could not be built; the thread has exited
    Failed(String),
}

/// State shared between the context and the output thread
struct Output {
    status: OutputStatus,
    timeline: Timeline,
}

enum Command {
    Resume,
}

/// Creates [`CpalRenderContext`]s on the configured output device
#[derive(Debug, Clone, Default)]
pub struct CpalOutputFactory {
    device_id: Option<String>,
}

impl CpalOutputFactory {
    /// `device_id` of `None` selects the host default output
    pub fn new(device_id: Option<String>) -> Self {
        Self { device_id }
    }
}

impl RenderContextFactory for CpalOutputFactory {
    /// Returns as soon as the output thread is spawned; the stream is built
    /// in the background and its outcome shows up in [`OutputStatus`]
    fn create(&self) -> Result<Box<dyn RenderContext>, AudioError> {
        let device = find_device(Direction::Output, self.device_id.as_deref())?;
        let default_config = device.default_config()?;

        let config: StreamConfig = default_config.config();
        let sample_format = default_config.sample_format();
        let device_rate = config.sample_rate.0;
        let channels = config.channels as usize;

        tracing::info!(
            "Opening output device {} ({} Hz, {} ch, {:?})",
            device.name,
            device_rate,
            channels,
            sample_format
        );

        let output = Arc::new(Mutex::new(Output {
            status: OutputStatus::Starting,
            timeline: Timeline::default(),
        }));
        let (command_tx, command_rx) = bounded::<Command>(1);
        let thread_output = output.clone();

        thread::Builder::new()
            .name("speaker-output".into())
            .spawn(move || {
                let cpal_device = device.into_inner();
                let on_error = |err: cpal::StreamError| {
                    tracing::warn!("Output stream error: {}", err);
                };
                let fail = |reason: String| {
                    tracing::warn!("Output stream unavailable: {}", reason);
                    thread_output.lock().status = OutputStatus::Failed(reason);
                };

                let stream = match sample_format {
                    SampleFormat::F32 => {
                        let output = thread_output.clone();
                        cpal_device.build_output_stream(
                            &config,
                            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                                output.lock().timeline.render(data, channels);
                            },
                            on_error,
                            None,
                        )
                    }
                    SampleFormat::I16 => {
                        let output = thread_output.clone();
                        let mut scratch = Vec::new();
                        cpal_device.build_output_stream(
                            &config,
                            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                                scratch.resize(data.len(), 0.0f32);
                                output.lock().timeline.render(&mut scratch, channels);
                                for (dst, src) in data.iter_mut().zip(&scratch) {
                                    *dst = float_to_pcm16(*src);
                                }
                            },
                            on_error,
                            None,
                        )
                    }
                    other => {
                        fail(format!("sample format {:?}", other));
                        return;
                    }
                };

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        fail(e.to_string());
                        return;
                    }
                };

                // A host that refuses to start output leaves the context suspended
                let start = |stream: &cpal::Stream| match stream.play() {
                    Ok(()) => {
                        thread_output.lock().status = OutputStatus::Running;
                        tracing::info!("Audio output running");
                    }
                    Err(e) => {
                        thread_output.lock().status = OutputStatus::Suspended;
                        tracing::warn!("Output stream not started: {}", e);
                    }
                };
                start(&stream);

                // Runs until the context is dropped
                for command in command_rx.iter() {
                    match command {
                        Command::Resume => start(&stream),
                    }
                }
                drop(stream);
                tracing::debug!("Output stream closed");
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        Ok(Box::new(CpalRenderContext {
            output,
            device_rate,
            commands: command_tx,
        }))
    }
}

/// Render context backed by a cpal output stream
pub struct CpalRenderContext {
    output: Arc<Mutex<Output>>,
    device_rate: u32,
    commands: Sender<Command>,
}

impl CpalRenderContext {
    pub fn status(&self) -> OutputStatus {
        self.output.lock().status.clone()
    }
}

impl RenderContext for CpalRenderContext {
    fn current_time(&self) -> f64 {
        self.output.lock().timeline.base_frame as f64 / self.device_rate as f64
    }

    /// True while output is not playing, including after a failed start
    fn is_suspended(&self) -> bool {
        matches!(
            self.output.lock().status,
            OutputStatus::Suspended | OutputStatus::Failed(_)
        )
    }

    /// Queues a resume request for the output thread without waiting for it
    fn resume(&mut self) -> Result<(), AudioError> {
        match self.status() {
            OutputStatus::Failed(reason) => Err(AudioError::PlaybackUnsupported(reason)),
            OutputStatus::Starting | OutputStatus::Running => Ok(()),
            OutputStatus::Suspended => match self.commands.try_send(Command::Resume) {
                // A request already queued will do
                Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
                Err(TrySendError::Disconnected(_)) => {
                    Err(AudioError::StreamError("output thread gone".into()))
                }
            },
        }
    }

    fn schedule(&mut self, samples: Vec<f32>, sample_rate: u32, start_at: f64) {
        let samples = if sample_rate == self.device_rate {
            samples
        } else {
            resample_f32(&samples, sample_rate, self.device_rate)
        };
        let start_frame = (start_at * self.device_rate as f64).round().max(0.0) as u64;
        self.output.lock().timeline.place(&samples, start_frame);
    }
}
