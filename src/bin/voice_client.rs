//! Voice Link Client
//!
//! Streams the local microphone to a voice backend over WebSocket and plays
//! the backend's audio on the local speaker.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_link::{
    audio::{device::list_devices, CpalCapture, CpalOutputFactory, PlaybackScheduler},
    client::VoiceClient,
    config::AppConfig,
    protocol::TransportConfig,
    transport::{TransportChannel, WsConnector},
    ui::WebServer,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Voice Link client");

    // Load config, then environment and command line overrides
    let mut config = AppConfig::load()?;
    config.apply_env();
    if let Some(url) = std::env::args().nth(1) {
        config.override_url(url);
    }

    // List available devices
    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let device_type = if device.is_input { "Input" } else { "Output" };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}:", device.name, device_type, default_marker);
        println!("    ID: {}", device.id);
        if let (Some(rate), Some(channels)) = (device.default_sample_rate, device.default_channels) {
            println!("    Default: {} Hz, {} ch", rate, channels);
        }
    }
    println!();

    // Transport, audio and the client that ties them together
    let (channel, events) = TransportChannel::new(config.channel_settings(), Arc::new(WsConnector));
    let client = Arc::new(VoiceClient::new(
        Arc::new(channel),
        Arc::new(CpalCapture::new(config.audio.input_device.clone())),
        PlaybackScheduler::new(Box::new(CpalOutputFactory::new(
            config.audio.output_device.clone(),
        ))),
        TransportConfig::default(),
    ));
    let event_loop = tokio::spawn(client.clone().run(events));

    // Start control API
    let web_server = WebServer::new(config.ui.clone(), client.clone());
    let _web_handle = web_server.start_background();

    tracing::info!(
        "Control API available at http://{}:{}",
        config.ui.bind_address,
        config.ui.http_port
    );
    tracing::info!("Voice endpoint: {}", config.transport.url);

    client.connect()?;
    if client.wait_until_connected(Duration::from_secs(5)).await {
        if let Err(e) = client.start_streaming().await {
            tracing::warn!("Microphone not started: {}", e);
        }
    } else {
        tracing::warn!("Voice endpoint not reachable yet, retrying in the background");
    }

    tracing::info!("Running - press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    client.stop_streaming(true);
    client.disconnect();
    event_loop.abort();

    Ok(())
}
