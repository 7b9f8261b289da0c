//! Client facade
//!
//! [`VoiceClient`] ties the capture path, the transport channel and the
//! playback scheduler together and is what the UI layer talks to. It is
//! constructed explicitly with its collaborators injected, and is driven by
//! the channel's events through [`VoiceClient::run`] or
//! [`VoiceClient::handle_event`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::audio::capture::{acquire, CaptureBackend, CaptureConstraints, CaptureHandle};
use crate::audio::pipeline::{CapturePipeline, MicActivity, ProcessingNode};
use crate::audio::playback::PlaybackScheduler;
use crate::error::{AudioError, Result, TransportError};
use crate::protocol::{InboundControl, OutboundControl, TransportConfig};
use crate::transport::{ChannelEvent, Transport};

/// Connection state as shown to the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
    Streaming,
}

/// Bridge status reported by the backend's status endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteStatus {
    pub connected: bool,
    pub microphone_streaming: bool,
    pub microphone_active: bool,
    pub speaker_active: bool,
    pub status_text: Option<String>,
}

/// Snapshot for the UI layer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStatus {
    pub state: ConnectionStatus,
    pub last_error: Option<String>,
    pub last_microphone_at: Option<DateTime<Utc>>,
    pub frames_sent: u64,
    pub session_id: Option<Uuid>,
    pub transport: TransportConfig,
    pub remote: Option<RemoteStatus>,
}

/// An active microphone session
struct StreamingSession {
    id: Uuid,
    capture: Box<dyn CaptureHandle>,
    node: Arc<ProcessingNode>,
    started_at: DateTime<Utc>,
}

struct ClientState {
    session: Option<StreamingSession>,
    /// Device acquisition in flight
    starting: bool,
    /// `stop_streaming` arrived while a start was in flight
    start_cancelled: bool,
    transport_config: TransportConfig,
    last_error: Option<String>,
    remote: Option<RemoteStatus>,
}

/// Clears the in-flight marker when a pending start finishes or is dropped
struct StartGuard<'a> {
    state: &'a Mutex<ClientState>,
    armed: bool,
}

impl StartGuard<'_> {
    /// Clear the marker under the held lock; true if the start was cancelled
    fn finish(mut self, state: &mut ClientState) -> bool {
        self.armed = false;
        state.starting = false;
        std::mem::take(&mut state.start_cancelled)
    }
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!("Pending stream start abandoned");
            let mut state = self.state.lock();
            state.starting = false;
            state.start_cancelled = false;
        }
    }
}

/// Orchestrates capture, transport and playback
pub struct VoiceClient<T: Transport> {
    transport: Arc<T>,
    capture: Arc<dyn CaptureBackend>,
    constraints: CaptureConstraints,
    playback: Mutex<PlaybackScheduler>,
    defaults: TransportConfig,
    activity: Arc<MicActivity>,
    state: Mutex<ClientState>,
}

impl<T: Transport> VoiceClient<T> {
    pub fn new(
        transport: Arc<T>,
        capture: Arc<dyn CaptureBackend>,
        mut playback: PlaybackScheduler,
        defaults: TransportConfig,
    ) -> Self {
        playback.set_output_rate(defaults.output_sample_rate);

        Self {
            transport,
            capture,
            constraints: CaptureConstraints::preferred(),
            playback: Mutex::new(playback),
            defaults,
            activity: Arc::new(MicActivity::default()),
            state: Mutex::new(ClientState {
                session: None,
                starting: false,
                start_cancelled: false,
                transport_config: defaults,
                last_error: None,
                remote: None,
            }),
        }
    }

    /// Override the first-attempt capture constraints
    pub fn with_constraints(mut self, constraints: CaptureConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn connect(&self) -> Result<()> {
        if let Err(e) = self.transport.connect() {
            self.state.lock().last_error = Some(e.to_string());
            return Err(e.into());
        }
        Ok(())
    }

    pub fn disconnect(&self) {
        self.transport.disconnect();
    }

    pub async fn wait_until_connected(&self, timeout: Duration) -> bool {
        self.transport.wait_until_connected(timeout).await
    }

    pub fn is_streaming(&self) -> bool {
        self.state.lock().session.is_some()
    }

    pub fn transport_config(&self) -> TransportConfig {
        self.state.lock().transport_config
    }

    pub fn connection_state(&self) -> ConnectionStatus {
        if !self.transport.is_open() {
            ConnectionStatus::Disconnected
        } else if self.is_streaming() {
            ConnectionStatus::Streaming
        } else {
            ConnectionStatus::Connected
        }
    }

    pub fn status(&self) -> ClientStatus {
        let state = self.connection_state();
        let inner = self.state.lock();
        ClientStatus {
            state,
            last_error: inner.last_error.clone(),
            last_microphone_at: self.activity.last_frame_at(),
            frames_sent: self.activity.frames_sent(),
            session_id: inner.session.as_ref().map(|s| s.id),
            transport: inner.transport_config,
            remote: inner.remote.clone(),
        }
    }

    /// Start sending microphone audio. A no-op while a session is active.
    ///
    /// Dropping the returned future abandons the start; a later call starts
    /// afresh. A `stop_streaming` issued while the device is still opening
    /// wins, and the start resolves to `Ok` without streaming.
    pub async fn start_streaming(&self) -> Result<()> {
        let config = {
            let mut state = self.state.lock();
            if state.session.is_some() || state.starting {
                tracing::debug!("Streaming already active");
                return Ok(());
            }
            if !self.transport.is_open() {
                let err = TransportError::NotConnected;
                state.last_error = Some(err.to_string());
                return Err(err.into());
            }
            state.starting = true;
            state.start_cancelled = false;
            state.transport_config
        };
        let guard = StartGuard {
            state: &self.state,
            armed: true,
        };

        let node = Arc::new(ProcessingNode::new(self.activity.clone()));
        let backend = self.capture.clone();
        let constraints = self.constraints.clone();
        let transport = self.transport.clone();
        let pipeline_node = node.clone();

        let opened = tokio::task::spawn_blocking(move || {
            acquire(backend.as_ref(), &constraints, || {
                CapturePipeline::new(config, transport.clone(), pipeline_node.clone()).into_callback()
            })
        })
        .await
        .unwrap_or_else(|e| Err(AudioError::StreamError(e.to_string())));

        let mut state = self.state.lock();
        let cancelled = guard.finish(&mut state);

        let mut capture = match opened {
            Ok(capture) => capture,
            Err(e) => {
                tracing::warn!("Cannot start streaming: {}", e);
                state.last_error = Some(e.to_string());
                return Err(e.into());
            }
        };

        // The channel may have gone away while the device was opening
        if !self.transport.is_open() {
            capture.stop();
            let err = TransportError::NotConnected;
            state.last_error = Some(err.to_string());
            return Err(err.into());
        }

        if cancelled {
            capture.stop();
            tracing::info!("Streaming start cancelled before the device opened");
            return Ok(());
        }

        self.transport.send_control(&OutboundControl::mic(true));
        node.connect();

        let session = StreamingSession {
            id: Uuid::new_v4(),
            capture,
            node,
            started_at: Utc::now(),
        };
        tracing::info!(
            "Streaming started (session {}, {} Hz capture -> {} Hz, {} samples/frame)",
            session.id,
            session.capture.sample_rate(),
            config.input_sample_rate,
            config.frame_samples
        );
        state.session = Some(session);
        state.last_error = None;
        Ok(())
    }

    /// Stop sending microphone audio. Idempotent.
    ///
    /// `send_control` is false when the channel is already gone.
    pub fn stop_streaming(&self, send_control: bool) {
        let session = {
            let mut state = self.state.lock();
            if state.starting {
                state.start_cancelled = true;
            }
            state.session.take()
        };
        let Some(mut session) = session else {
            return;
        };

        session.node.disconnect();
        session.capture.stop();

        if send_control {
            self.transport.send_control(&OutboundControl::mic(false));
        }

        let elapsed = Utc::now() - session.started_at;
        tracing::info!(
            "Streaming stopped (session {}, {} s)",
            session.id,
            elapsed.num_seconds()
        );
    }

    /// React to one channel event
    pub fn handle_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened => {
                tracing::debug!("Channel open");
            }
            ChannelEvent::Closed => {
                self.stop_streaming(false);
                self.state.lock().transport_config = self.defaults;
                self.playback.lock().set_output_rate(self.defaults.output_sample_rate);
            }
            ChannelEvent::Binary(data) => {
                if let Err(e) = self.playback.lock().on_frame(&data) {
                    let message = e.to_string();
                    let mut state = self.state.lock();
                    if state.last_error.as_deref() != Some(message.as_str()) {
                        state.last_error = Some(message);
                    }
                }
            }
            ChannelEvent::Control(InboundControl::Config(update)) => {
                let config = {
                    let mut state = self.state.lock();
                    state.transport_config.merge(&update);
                    state.transport_config
                };
                self.playback.lock().set_output_rate(config.output_sample_rate);
                tracing::info!(
                    "Transport config: in {} Hz, out {} Hz, {} samples/frame",
                    config.input_sample_rate,
                    config.output_sample_rate,
                    config.frame_samples
                );
            }
            ChannelEvent::Control(other) => {
                tracing::trace!("Ignoring control message {:?}", other);
            }
        }
    }

    /// Fold the backend's bridge status into the client
    pub fn handle_status_from_server(&self, remote: RemoteStatus) {
        let resync = {
            let mut state = self.state.lock();
            let resync = state.session.is_some() && !remote.microphone_streaming;
            state.remote = Some(remote);
            resync
        };

        if resync && self.transport.is_open() {
            tracing::info!("Backend lost microphone state, re-announcing");
            self.transport.send_control(&OutboundControl::mic(true));
        }
    }

    /// Resume audio output after a user gesture
    pub fn unlock_playback(&self) -> Result<()> {
        self.playback.lock().unlock()?;
        Ok(())
    }

    /// Drain channel events until the channel is dropped
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        self.stop_streaming(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::capture::testing::ScriptedCapture;
    use crate::audio::playback::testing::FakeFactory;
    use crate::error::{DeviceFailure, Error};
    use crate::protocol::{encode_pcm16, ConfigUpdate};
    use crate::transport::testing::{MockConnector, RecordingTransport};
    use crate::transport::{ChannelSettings, TransportChannel, WireMessage};
    use futures_util::FutureExt;

    async fn wait_for(mut ready: impl FnMut() -> bool) {
        for _ in 0..400 {
            if ready() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn client_with(
        transport: Arc<RecordingTransport>,
        capture: ScriptedCapture,
    ) -> VoiceClient<RecordingTransport> {
        let (factory, _timeline) = FakeFactory::new();
        VoiceClient::new(
            transport,
            Arc::new(capture),
            PlaybackScheduler::new(Box::new(factory)),
            TransportConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_start_requires_open_channel() {
        let transport = Arc::new(RecordingTransport::closed());
        let capture = ScriptedCapture::default();
        let client = client_with(transport, capture.clone());

        let err = client.start_streaming().await.unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::NotConnected)));
        assert!(capture.state.lock().attempts.is_empty());
        assert_eq!(client.connection_state(), ConnectionStatus::Disconnected);
        assert!(client.status().last_error.is_some());
    }

    #[tokio::test]
    async fn test_start_sends_mic_on_then_frames() {
        let transport = Arc::new(RecordingTransport::open());
        let capture = ScriptedCapture::default();
        let client = client_with(transport.clone(), capture.clone());

        client.start_streaming().await.unwrap();
        assert_eq!(client.connection_state(), ConnectionStatus::Streaming);

        capture.deliver(&vec![0.1; 4096], 48000);

        let sent = transport.sent();
        assert_eq!(
            sent[0],
            WireMessage::Text(r#"{"type":"mic","active":true}"#.to_string())
        );
        assert_eq!(transport.frames().len(), 4);
        assert!(client.status().last_microphone_at.is_some());
    }

    #[tokio::test]
    async fn test_start_twice_is_noop() {
        let transport = Arc::new(RecordingTransport::open());
        let capture = ScriptedCapture::default();
        let client = client_with(transport.clone(), capture.clone());

        client.start_streaming().await.unwrap();
        client.start_streaming().await.unwrap();

        assert_eq!(capture.state.lock().attempts.len(), 1);
        assert_eq!(transport.controls().len(), 1);
    }

    #[tokio::test]
    async fn test_device_failure_is_categorized() {
        let transport = Arc::new(RecordingTransport::open());
        let capture = ScriptedCapture::failing_with(vec![AudioError::device(
            DeviceFailure::NotFound,
            "no input",
        )]);
        let client = client_with(transport.clone(), capture);

        let err = client.start_streaming().await.unwrap_err();
        match err {
            Error::Audio(e) => assert_eq!(e.device_failure(), Some(DeviceFailure::NotFound)),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!client.is_streaming());
        assert!(transport.sent().is_empty());
        assert!(client
            .status()
            .last_error
            .unwrap()
            .contains("no microphone found"));
    }

    #[tokio::test]
    async fn test_stop_sends_mic_off_and_releases_device() {
        let transport = Arc::new(RecordingTransport::open());
        let capture = ScriptedCapture::default();
        let client = client_with(transport.clone(), capture.clone());

        client.start_streaming().await.unwrap();
        client.stop_streaming(true);
        client.stop_streaming(true);

        assert_eq!(capture.state.lock().stopped, 1);
        assert_eq!(
            transport.controls(),
            vec![
                r#"{"type":"mic","active":true}"#.to_string(),
                r#"{"type":"mic","active":false}"#.to_string(),
            ]
        );
        assert_eq!(client.connection_state(), ConnectionStatus::Connected);

        // Blocks after teardown go nowhere
        capture.deliver(&vec![0.1; 4096], 48000);
        assert!(transport.frames().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_start_can_be_retried() {
        let transport = Arc::new(RecordingTransport::open());
        let (capture, gate) = ScriptedCapture::gated();
        let client = client_with(transport.clone(), capture.clone());

        // Dropped while the device is still opening
        assert!(client.start_streaming().now_or_never().is_none());
        assert!(!client.is_streaming());

        gate.send(()).unwrap();
        wait_for(|| capture.state.lock().stopped == 1).await;

        gate.send(()).unwrap();
        client.start_streaming().await.unwrap();
        assert!(client.is_streaming());
        assert_eq!(capture.state.lock().attempts.len(), 2);

        capture.deliver(&vec![0.1; 4096], 48000);
        assert_eq!(transport.frames().len(), 4);
        assert_eq!(
            transport.controls(),
            vec![r#"{"type":"mic","active":true}"#.to_string()]
        );
    }

    #[tokio::test]
    async fn test_stop_while_starting_wins() {
        let transport = Arc::new(RecordingTransport::open());
        let (capture, gate) = ScriptedCapture::gated();
        let client = Arc::new(client_with(transport.clone(), capture.clone()));

        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.start_streaming().await }
        });
        wait_for(|| client.state.lock().starting).await;

        client.stop_streaming(true);
        gate.send(()).unwrap();
        pending.await.unwrap().unwrap();

        assert!(!client.is_streaming());
        assert_eq!(capture.state.lock().stopped, 1);
        assert!(transport.sent().is_empty());

        // The cancellation does not leak into the next start
        gate.send(()).unwrap();
        client.start_streaming().await.unwrap();
        assert!(client.is_streaming());
    }

    #[tokio::test]
    async fn test_config_message_shapes_next_session() {
        let transport = Arc::new(RecordingTransport::open());
        let capture = ScriptedCapture::default();
        let client = client_with(transport.clone(), capture.clone());

        client.handle_event(ChannelEvent::Control(InboundControl::Config(ConfigUpdate {
            frame_samples: Some(160),
            output_sample_rate: Some(16000),
            ..Default::default()
        })));
        assert_eq!(client.transport_config().frame_samples, 160);
        assert_eq!(client.playback.lock().output_rate(), 16000);

        client.start_streaming().await.unwrap();
        capture.deliver(&vec![0.0; 960], 48000);
        let frames = transport.frames();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == 320));

        client.handle_event(ChannelEvent::Closed);
        assert_eq!(client.transport_config(), TransportConfig::default());
    }

    #[tokio::test]
    async fn test_remote_status_resync() {
        let transport = Arc::new(RecordingTransport::open());
        let client = client_with(transport.clone(), ScriptedCapture::default());

        client.handle_status_from_server(RemoteStatus::default());
        assert!(transport.controls().is_empty());

        client.start_streaming().await.unwrap();
        client.handle_status_from_server(RemoteStatus {
            connected: true,
            microphone_streaming: false,
            ..Default::default()
        });
        assert_eq!(transport.controls().len(), 2);
        assert_eq!(client.status().remote.map(|r| r.connected), Some(true));
    }

    #[tokio::test]
    async fn test_binary_frames_reach_playback() {
        let transport = Arc::new(RecordingTransport::open());
        let (factory, timeline) = FakeFactory::new();
        let client = VoiceClient::new(
            transport,
            Arc::new(ScriptedCapture::default()),
            PlaybackScheduler::new(Box::new(factory)),
            TransportConfig::default(),
        );

        client.handle_event(ChannelEvent::Binary(encode_pcm16(&vec![0i16; 480])));
        client.handle_event(ChannelEvent::Binary(encode_pcm16(&vec![0i16; 480])));

        let scheduled = timeline.lock().scheduled.clone();
        assert_eq!(scheduled.len(), 2);
        assert!((scheduled[1].0 - (scheduled[0].0 + 0.02)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_playback_unsupported_recorded() {
        let transport = Arc::new(RecordingTransport::open());
        let (mut factory, _timeline) = FakeFactory::new();
        factory.fail = true;
        let client = VoiceClient::new(
            transport,
            Arc::new(ScriptedCapture::default()),
            PlaybackScheduler::new(Box::new(factory)),
            TransportConfig::default(),
        );

        client.handle_event(ChannelEvent::Binary(encode_pcm16(&[1, 2, 3])));
        let error = client.status().last_error.unwrap();
        assert!(error.contains("Playback unsupported"));
        assert!(client.unlock_playback().is_err());
    }

    fn live_client(
        connector: &MockConnector,
        capture: ScriptedCapture,
    ) -> (
        Arc<VoiceClient<TransportChannel>>,
        mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        let settings = ChannelSettings {
            url: "ws://voice.test/ws/audio".to_string(),
            ..Default::default()
        };
        let (channel, events) = TransportChannel::new(settings, Arc::new(connector.clone()));
        let (factory, _timeline) = FakeFactory::new();
        let client = VoiceClient::new(
            Arc::new(channel),
            Arc::new(capture),
            PlaybackScheduler::new(Box::new(factory)),
            TransportConfig::default(),
        );
        (Arc::new(client), events)
    }

    #[tokio::test(start_paused = true)]
    async fn test_mic_on_precedes_first_frame_on_the_wire() {
        let connector = MockConnector::holding();
        let capture = ScriptedCapture::default();
        let (client, mut events) = live_client(&connector, capture.clone());

        client.connect().unwrap();
        assert_eq!(
            client.transport().state(),
            crate::transport::ConnectionState::Connecting
        );
        assert!(client.start_streaming().await.is_err());

        connector.release_handshakes();
        assert!(client.wait_until_connected(Duration::from_secs(1)).await);
        assert_eq!(events.recv().await, Some(ChannelEvent::Opened));

        client.start_streaming().await.unwrap();
        capture.deliver(&vec![0.2; 4096], 48000);

        let mut remote = connector.take_remote();
        let wire = remote.drain();
        assert_eq!(wire.len(), 5);
        assert_eq!(
            wire[0],
            WireMessage::Text(r#"{"type":"mic","active":true}"#.to_string())
        );
        assert!(wire[1..]
            .iter()
            .all(|m| matches!(m, WireMessage::Binary(b) if b.len() == 640)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_close_tears_down_without_mic_off() {
        let connector = MockConnector::default();
        let capture = ScriptedCapture::default();
        let (client, mut events) = live_client(&connector, capture.clone());

        client.connect().unwrap();
        let opened = events.recv().await;
        client.handle_event(opened.unwrap());
        client.start_streaming().await.unwrap();

        let mut remote = connector.take_remote();
        let before = remote.drain();
        assert_eq!(before.len(), 1);

        let closed_at = tokio::time::Instant::now();
        drop(remote.to_client);
        let closed = events.recv().await.unwrap();
        assert_eq!(closed, ChannelEvent::Closed);
        client.handle_event(closed);

        assert!(!client.is_streaming());
        assert_eq!(capture.state.lock().stopped, 1);
        assert_eq!(client.connection_state(), ConnectionStatus::Disconnected);

        // Nothing was written after the close, in particular no mic-off
        assert!(remote.from_client.recv().await.is_none());
        let channel = client.transport();
        assert_eq!(channel.stats().reconnects_scheduled, 1);
        let deadline = channel.reconnect_deadline().expect("reconnect pending");
        assert_eq!(deadline - closed_at, Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_while_closing_restarts_cleanly() {
        let connector = MockConnector::default();
        let capture = ScriptedCapture::default();
        let (client, mut events) = live_client(&connector, capture.clone());

        client.connect().unwrap();
        client.handle_event(events.recv().await.unwrap());
        client.start_streaming().await.unwrap();
        let old = connector.take_remote();

        client.disconnect();
        client.connect().unwrap();
        assert_eq!(connector.opened(), 1);

        drop(old);
        let closed = events.recv().await.unwrap();
        assert_eq!(closed, ChannelEvent::Closed);
        client.handle_event(closed);
        assert!(!client.is_streaming());
        assert_eq!(capture.state.lock().stopped, 1);

        let opened = events.recv().await.unwrap();
        assert_eq!(opened, ChannelEvent::Opened);
        client.handle_event(opened);
        assert_eq!(connector.opened(), 2);

        client.start_streaming().await.unwrap();
        capture.deliver(&vec![0.2; 4096], 48000);

        let mut remote = connector.take_remote();
        let wire = remote.drain();
        assert_eq!(wire.len(), 5);
        assert_eq!(
            wire[0],
            WireMessage::Text(r#"{"type":"mic","active":true}"#.to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_plays_inbound_audio() {
        let connector = MockConnector::default();
        let (client, events) = live_client(&connector, ScriptedCapture::default());
        let runner = tokio::spawn(client.clone().run(events));

        client.connect().unwrap();
        assert!(client.wait_until_connected(Duration::from_secs(1)).await);

        let remote = connector.take_remote();
        remote.send_text(r#"{"type":"config","outputSampleRate":24000}"#);
        remote.send_binary(encode_pcm16(&vec![100i16; 320]).to_vec());
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(client.playback.lock().frames_scheduled(), 1);
        runner.abort();
    }
}
