//! # Voice Link
//!
//! Low-latency bidirectional voice transport between a local microphone and
//! speaker and a remote voice backend, over a single WebSocket.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                              CLIENT                                  │
//! │                                                                      │
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐                 │
//! │  │ Microphone  │──▶│  Resampler  │──▶│   Framer    │──┐              │
//! │  │ (cpal thr.) │   │ f32 -> i16  │   │ fixed size  │  │ PCM16 LE     │
//! │  └─────────────┘   └─────────────┘   └─────────────┘  │              │
//! │         ▲                                             ▼              │
//! │  ┌──────┴───────────────────────────┐   ┌──────────────────────────┐ │
//! │  │   VoiceClient (client)           │◀──│  TransportChannel        │ │
//! │  │   sessions, config, status       │   │  connect / reconnect     │ │
//! │  └──────┬───────────────────────────┘   │  binary + JSON control   │ │
//! │         ▼                               └────────────┬─────────────┘ │
//! │  ┌─────────────┐   ┌─────────────┐                   │               │
//! │  │  Playback   │──▶│  Speaker    │                   │               │
//! │  │  Scheduler  │   │ (cpal thr.) │                   │               │
//! │  └─────────────┘   └─────────────┘                   │               │
//! └──────────────────────────────────────────────────────┼───────────────┘
//!                                                        │ WebSocket
//!                                                        ▼
//!                                               ┌──────────────────┐
//!                                               │  Voice backend   │
//!                                               └──────────────────┘
//! ```

pub mod audio;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod ui;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Rate of outbound microphone frames until the backend says otherwise
    pub const DEFAULT_INPUT_SAMPLE_RATE: u32 = 16000;

    /// Rate of inbound speaker frames until the backend says otherwise
    pub const DEFAULT_OUTPUT_SAMPLE_RATE: u32 = 24000;

    /// Samples per outbound frame (20 ms at 16 kHz)
    pub const DEFAULT_FRAME_SAMPLES: usize = 320;

    /// Fixed delay before reconnecting after an unrequested close
    pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 2000;

    /// Handshake deadline for one connection attempt
    pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

    /// Minimum distance between "now" and a newly scheduled buffer
    pub const PLAYBACK_LEAD_SECONDS: f64 = 0.010;

    /// Minimum spacing of resume attempts on a suspended output
    pub const RESUME_RETRY_INTERVAL_MS: u64 = 500;

    /// Voice endpoint used when nothing is configured
    pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8000/ws/audio";

    /// Default port for the local control API
    pub const DEFAULT_HTTP_PORT: u16 = 8090;

    /// Default bind address for the local control API
    pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";
}
