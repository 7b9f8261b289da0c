//! Microphone capture
//!
//! The capture device sits behind [`CaptureBackend`] so the client can be
//! driven by cpal in production and by a scripted backend in tests. The cpal
//! stream is owned by a dedicated thread, as cpal streams are not `Send` on
//! every host.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use crossbeam_channel::{bounded, Sender};
use std::thread;

use crate::audio::device::{find_device, Direction};
use crate::error::{AudioError, DeviceFailure};

/// Receives mono f32 blocks together with the device sample rate
pub type SampleCallback = Box<dyn FnMut(&[f32], u32) + Send + 'static>;

/// Stream shape requested from the capture device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConstraints {
    /// Requested channel count; `None` takes the device default
    pub channel_count: Option<u16>,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl CaptureConstraints {
    /// Mono with voice processing hints
    pub fn preferred() -> Self {
        Self {
            channel_count: Some(1),
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }

    /// Whatever the device offers by default
    pub fn relaxed() -> Self {
        Self {
            channel_count: None,
            echo_cancellation: false,
            noise_suppression: false,
            auto_gain_control: false,
        }
    }

    fn has_processing_hints(&self) -> bool {
        self.echo_cancellation || self.noise_suppression || self.auto_gain_control
    }
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self::preferred()
    }
}

/// A running capture device
pub trait CaptureHandle: Send {
    /// Sample rate of the blocks passed to the callback
    fn sample_rate(&self) -> u32;

    /// Stop the device. Idempotent.
    fn stop(&mut self);
}

/// Opens capture devices
pub trait CaptureBackend: Send + Sync {
    fn open(
        &self,
        constraints: &CaptureConstraints,
        on_samples: SampleCallback,
    ) -> Result<Box<dyn CaptureHandle>, AudioError>;
}

/// Open the capture device, retrying once with relaxed constraints when the
/// first attempt is rejected for its constraints
pub fn acquire<F>(
    backend: &dyn CaptureBackend,
    preferred: &CaptureConstraints,
    mut make_callback: F,
) -> Result<Box<dyn CaptureHandle>, AudioError>
where
    F: FnMut() -> SampleCallback,
{
    match backend.open(preferred, make_callback()) {
        Ok(handle) => Ok(handle),
        Err(e) if e.device_failure() == Some(DeviceFailure::UnsupportedConstraints) => {
            tracing::warn!("Capture constraints rejected ({}), retrying relaxed", e);
            backend.open(&CaptureConstraints::relaxed(), make_callback())
        }
        Err(e) => Err(e),
    }
}

/// Capture from a cpal input device
pub struct CpalCapture {
    device_id: Option<String>,
}

impl CpalCapture {
    /// `device_id` of `None` selects the host default input
    pub fn new(device_id: Option<String>) -> Self {
        Self { device_id }
    }
}

impl CaptureBackend for CpalCapture {
    fn open(
        &self,
        constraints: &CaptureConstraints,
        mut on_samples: SampleCallback,
    ) -> Result<Box<dyn CaptureHandle>, AudioError> {
        let device = find_device(Direction::Input, self.device_id.as_deref())?;
        let default_config = device.default_config()?;

        if constraints.has_processing_hints() {
            tracing::debug!("Host offers no voice processing; hints ignored");
        }

        let config = StreamConfig {
            channels: constraints
                .channel_count
                .unwrap_or_else(|| default_config.channels()),
            sample_rate: default_config.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };
        let sample_format = default_config.sample_format();
        let sample_rate = config.sample_rate.0;
        let channels = config.channels as usize;

        tracing::info!(
            "Opening capture device {} ({} Hz, {} ch, {:?})",
            device.name,
            sample_rate,
            channels,
            sample_format
        );

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let handle = thread::Builder::new()
            .name("mic-capture".into())
            .spawn(move || {
                let cpal_device = device.into_inner();
                let mut mono = Vec::new();
                let on_error = |err: cpal::StreamError| {
                    tracing::warn!("Capture stream error: {}", err);
                };

                let stream = match sample_format {
                    SampleFormat::F32 => cpal_device.build_input_stream(
                        &config,
                        move |data: &[f32], _: &cpal::InputCallbackInfo| {
                            downmix(data.iter().copied(), channels, &mut mono);
                            on_samples(&mono, sample_rate);
                        },
                        on_error,
                        None,
                    ),
                    SampleFormat::I16 => cpal_device.build_input_stream(
                        &config,
                        move |data: &[i16], _: &cpal::InputCallbackInfo| {
                            downmix(data.iter().map(|&s| s as f32 / 32768.0), channels, &mut mono);
                            on_samples(&mono, sample_rate);
                        },
                        on_error,
                        None,
                    ),
                    other => {
                        let _ = ready_tx.send(Err(AudioError::device(
                            DeviceFailure::UnsupportedConstraints,
                            format!("sample format {:?}", other),
                        )));
                        return;
                    }
                };

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(classify_build_error(e)));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::device(DeviceFailure::Busy, e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Parked until the handle signals stop or is dropped
                let _ = stop_rx.recv();
                drop(stream);
                tracing::debug!("Capture stream closed");
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalCaptureHandle {
                stop: Some(stop_tx),
                sample_rate,
            })),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(AudioError::StreamError("capture thread exited".into()))
            }
        }
    }
}

fn classify_build_error(err: cpal::BuildStreamError) -> AudioError {
    let reason = match err {
        cpal::BuildStreamError::DeviceNotAvailable => DeviceFailure::Busy,
        cpal::BuildStreamError::StreamConfigNotSupported
        | cpal::BuildStreamError::InvalidArgument => DeviceFailure::UnsupportedConstraints,
        _ => DeviceFailure::Unknown,
    };
    AudioError::device(reason, err.to_string())
}

/// Average interleaved frames down to one channel
fn downmix(samples: impl Iterator<Item = f32>, channels: usize, out: &mut Vec<f32>) {
    out.clear();
    if channels <= 1 {
        out.extend(samples);
        return;
    }

    let mut acc = 0.0f32;
    for (i, sample) in samples.enumerate() {
        acc += sample;
        if i % channels == channels - 1 {
            out.push(acc / channels as f32);
            acc = 0.0;
        }
    }
}

struct CpalCaptureHandle {
    stop: Option<Sender<()>>,
    sample_rate: u32,
}

impl CaptureHandle for CpalCaptureHandle {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Signals the capture thread and returns without waiting for it
    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.try_send(());
        }
    }
}

impl Drop for CpalCaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted capture backend

    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    #[derive(Default)]
    pub struct ScriptState {
        /// Results handed out per `open` call, front first; empty means success
        pub outcomes: VecDeque<Result<(), AudioError>>,
        pub attempts: Vec<CaptureConstraints>,
        pub callback: Option<SampleCallback>,
        /// Handle that installed `callback`
        owner: usize,
        pub stopped: usize,
    }

    #[derive(Clone, Default)]
    pub struct ScriptedCapture {
        pub state: Arc<Mutex<ScriptState>>,
        /// Each `open` waits for one token when set
        gate: Option<crossbeam_channel::Receiver<()>>,
    }

    impl ScriptedCapture {
        pub fn failing_with(failures: Vec<AudioError>) -> Self {
            let capture = Self::default();
            capture.state.lock().outcomes = failures.into_iter().map(Err).collect();
            capture
        }

        /// A backend whose `open` blocks until a token is sent
        pub fn gated() -> (Self, crossbeam_channel::Sender<()>) {
            let (tx, rx) = crossbeam_channel::unbounded();
            let capture = Self {
                gate: Some(rx),
                ..Self::default()
            };
            (capture, tx)
        }

        /// Feed a block through the installed callback
        pub fn deliver(&self, block: &[f32], rate: u32) {
            let mut state = self.state.lock();
            if let Some(callback) = state.callback.as_mut() {
                callback(block, rate);
            }
        }
    }

    struct ScriptedHandle {
        state: Arc<Mutex<ScriptState>>,
        id: usize,
        stopped: bool,
    }

    impl CaptureHandle for ScriptedHandle {
        fn sample_rate(&self) -> u32 {
            48000
        }

        fn stop(&mut self) {
            if !self.stopped {
                self.stopped = true;
                let mut state = self.state.lock();
                state.stopped += 1;
                if state.owner == self.id {
                    state.callback = None;
                }
            }
        }
    }

    impl Drop for ScriptedHandle {
        fn drop(&mut self) {
            self.stop();
        }
    }

    impl CaptureBackend for ScriptedCapture {
        fn open(
            &self,
            constraints: &CaptureConstraints,
            on_samples: SampleCallback,
        ) -> Result<Box<dyn CaptureHandle>, AudioError> {
            if let Some(gate) = &self.gate {
                let _ = gate.recv();
            }

            let mut state = self.state.lock();
            state.attempts.push(constraints.clone());
            if let Some(Err(e)) = state.outcomes.pop_front() {
                return Err(e);
            }
            state.owner += 1;
            state.callback = Some(on_samples);
            Ok(Box::new(ScriptedHandle {
                state: self.state.clone(),
                id: state.owner,
                stopped: false,
            }))
        }
    }
}
