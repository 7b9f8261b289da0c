//! HTTP API handlers

use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use crate::audio::device::{list_devices, AudioDeviceInfo};
use crate::client::{ClientStatus, RemoteStatus};
use crate::error::{Error, TransportError};
use crate::transport::{ChannelStats, ConnectionState};
use crate::ui::server::AppState;

/// API response wrapper
#[derive(serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Full status snapshot
#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub client: ClientStatus,
    pub channel: ConnectionState,
    pub url: String,
    pub stats: ChannelStats,
    pub uptime_seconds: u64,
}

type Reply = (StatusCode, Json<ApiResponse<()>>);

fn reply(result: crate::Result<()>) -> Reply {
    match result {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::ok(()))),
        Err(e) => (error_status(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

fn error_status(err: &Error) -> StatusCode {
    match err {
        Error::Transport(TransportError::NotConnected) => StatusCode::CONFLICT,
        Error::Transport(_) | Error::Audio(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Config(_) | Error::Protocol(_) => StatusCode::BAD_REQUEST,
        Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Get client status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<StatusResponse>> {
    let channel = state.client.transport();
    let status = StatusResponse {
        client: state.client.status(),
        channel: channel.state(),
        url: channel.url().to_string(),
        stats: channel.stats(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    };

    Json(ApiResponse::ok(status))
}

/// Get available audio devices
pub async fn get_devices() -> Json<ApiResponse<Vec<AudioDeviceInfo>>> {
    let devices = tokio::task::spawn_blocking(list_devices)
        .await
        .unwrap_or_default();
    Json(ApiResponse::ok(devices))
}

/// Open the voice channel
pub async fn connect(State(state): State<Arc<AppState>>) -> Reply {
    reply(state.client.connect())
}

/// Close the voice channel without reconnecting
pub async fn disconnect(State(state): State<Arc<AppState>>) -> Reply {
    state.client.disconnect();
    reply(Ok(()))
}

/// Start sending microphone audio
pub async fn start_stream(State(state): State<Arc<AppState>>) -> Reply {
    reply(state.client.start_streaming().await)
}

/// Stop sending microphone audio
pub async fn stop_stream(State(state): State<Arc<AppState>>) -> Reply {
    state.client.stop_streaming(true);
    reply(Ok(()))
}

/// Resume speaker output after a user gesture
pub async fn unlock_playback(State(state): State<Arc<AppState>>) -> Reply {
    reply(state.client.unlock_playback())
}

/// Report the backend's bridge status
pub async fn remote_status(
    State(state): State<Arc<AppState>>,
    Json(remote): Json<RemoteStatus>,
) -> Reply {
    state.client.handle_status_from_server(remote);
    reply(Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::capture::testing::ScriptedCapture;
    use crate::audio::playback::testing::FakeFactory;
    use crate::audio::playback::PlaybackScheduler;
    use crate::client::{ConnectionStatus, VoiceClient};
    use crate::protocol::TransportConfig;
    use crate::transport::testing::MockConnector;
    use crate::transport::{ChannelSettings, TransportChannel};
    use std::time::{Duration, Instant};

    fn app_state(url: &str) -> (Arc<AppState>, MockConnector) {
        let connector = MockConnector::default();
        let settings = ChannelSettings {
            url: url.to_string(),
            ..Default::default()
        };
        let (channel, _events) = TransportChannel::new(settings, Arc::new(connector.clone()));
        let (factory, _timeline) = FakeFactory::new();
        let client = VoiceClient::new(
            Arc::new(channel),
            Arc::new(ScriptedCapture::default()),
            PlaybackScheduler::new(Box::new(factory)),
            TransportConfig::default(),
        );
        let state = Arc::new(AppState {
            client: Arc::new(client),
            started_at: Instant::now(),
        });
        (state, connector)
    }

    #[tokio::test]
    async fn test_stream_start_before_connect_is_conflict() {
        let (state, _connector) = app_state("ws://voice.test/ws/audio");
        let (code, Json(body)) = start_stream(State(state)).await;
        assert_eq!(code, StatusCode::CONFLICT);
        assert!(!body.success);
        assert_eq!(body.error.as_deref(), Some("Transport error: Not connected"));
    }

    #[tokio::test]
    async fn test_connect_then_stream() {
        let (state, connector) = app_state("ws://voice.test/ws/audio");
        let (code, _) = connect(State(state.clone())).await;
        assert_eq!(code, StatusCode::OK);
        assert!(state.client.wait_until_connected(Duration::from_secs(1)).await);

        let (code, Json(body)) = start_stream(State(state.clone())).await;
        assert_eq!(code, StatusCode::OK);
        assert!(body.success);

        let Json(status) = get_status(State(state.clone())).await;
        let status = status.data.unwrap();
        assert_eq!(status.client.state, ConnectionStatus::Streaming);
        assert_eq!(status.channel, ConnectionState::Open);
        assert_eq!(connector.opened(), 1);
    }

    #[tokio::test]
    async fn test_invalid_url_is_unavailable() {
        let (state, _connector) = app_state("http://voice.test");
        let (code, Json(body)) = connect(State(state)).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.error.unwrap().contains("Connection unavailable"));
    }

    #[test]
    fn test_response_omits_empty_fields() {
        let json = serde_json::to_string(&ApiResponse::ok(())).unwrap();
        assert_eq!(json, r#"{"success":true,"data":null}"#);
        let json = serde_json::to_string(&ApiResponse::<()>::error("nope")).unwrap();
        assert_eq!(json, r#"{"success":false,"error":"nope"}"#);
    }
}
