//! Error types for the voice link client

use std::fmt;
use thiserror::Error;

/// Main error type for the client
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a capture device could not be obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFailure {
    /// The user or the platform refused microphone access
    PermissionDenied,
    /// No capture device is present
    NotFound,
    /// The device exists but is held by another application or vanished
    Busy,
    /// The requested stream shape cannot be satisfied
    UnsupportedConstraints,
    /// Anything the backend could not classify
    Unknown,
}

impl fmt::Display for DeviceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DeviceFailure::PermissionDenied => "microphone permission denied",
            DeviceFailure::NotFound => "no microphone found",
            DeviceFailure::Busy => "microphone is busy or was disconnected",
            DeviceFailure::UnsupportedConstraints => "microphone does not support the requested format",
            DeviceFailure::Unknown => "microphone could not be opened",
        };
        f.write_str(text)
    }
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device unavailable: {reason} ({detail})")]
    DeviceUnavailable { reason: DeviceFailure, detail: String },

    #[error("Playback unsupported: {0}")]
    PlaybackUnsupported(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),
}

impl AudioError {
    pub fn device(reason: DeviceFailure, detail: impl Into<String>) -> Self {
        AudioError::DeviceUnavailable {
            reason,
            detail: detail.into(),
        }
    }

    /// Category of a device failure, if this is one
    pub fn device_failure(&self) -> Option<DeviceFailure> {
        match self {
            AudioError::DeviceUnavailable { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

/// Transport channel errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection unavailable: {0}")]
    ConnectionUnavailable(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Timeout")]
    Timeout,
}

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Undecodable control message: {0}")]
    Decode(String),
}

/// Result type alias for the client
pub type Result<T> = std::result::Result<T, Error>;
