//! HTTP server for the local control API

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

use crate::client::VoiceClient;
use crate::config::UiConfig;
use crate::transport::TransportChannel;
use crate::ui::handlers;

/// Shared state handed to every handler
pub struct AppState {
    pub client: Arc<VoiceClient<TransportChannel>>,
    pub started_at: Instant,
}

/// Control API server
pub struct WebServer {
    config: UiConfig,
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(config: UiConfig, client: Arc<VoiceClient<TransportChannel>>) -> Self {
        Self {
            config,
            state: Arc::new(AppState {
                client,
                started_at: Instant::now(),
            }),
        }
    }

    /// Build the router
    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Serve until the listener fails
    pub async fn run(self) -> std::io::Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.http_port)
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Control API listening on http://{}", addr);

        axum::serve(listener, self.router()).await
    }

    /// Run on the current runtime in the background
    pub fn start_background(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                tracing::error!("Control API stopped: {}", e);
            }
        })
    }
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(handlers::get_status))
        .route("/api/devices", get(handlers::get_devices))
        .route("/api/connect", post(handlers::connect))
        .route("/api/disconnect", post(handlers::disconnect))
        .route("/api/stream/start", post(handlers::start_stream))
        .route("/api/stream/stop", post(handlers::stop_stream))
        .route("/api/playback/unlock", post(handlers::unlock_playback))
        .route("/api/remote-status", post(handlers::remote_status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
