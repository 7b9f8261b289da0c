//! Wire protocol for the audio socket
//!
//! Binary messages carry raw little-endian PCM16. Text messages carry JSON
//! control objects discriminated by their `type` field.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_FRAME_SAMPLES, DEFAULT_INPUT_SAMPLE_RATE, DEFAULT_OUTPUT_SAMPLE_RATE};
use crate::error::ProtocolError;

/// Stream parameters negotiated with the remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    /// Sample rate of outbound microphone frames
    pub input_sample_rate: u32,
    /// Sample rate of inbound speaker audio
    pub output_sample_rate: u32,
    /// Samples per outbound frame
    pub frame_samples: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: DEFAULT_INPUT_SAMPLE_RATE,
            output_sample_rate: DEFAULT_OUTPUT_SAMPLE_RATE,
            frame_samples: DEFAULT_FRAME_SAMPLES,
        }
    }
}

impl TransportConfig {
    /// Apply the fields present in a `config` message.
    /// Zero values are rejected and leave the current value in place.
    pub fn merge(&mut self, update: &ConfigUpdate) {
        if let Some(rate) = update.input_sample_rate {
            if rate > 0 {
                self.input_sample_rate = rate;
            } else {
                tracing::warn!("Ignoring non-positive inputSampleRate");
            }
        }
        if let Some(rate) = update.output_sample_rate {
            if rate > 0 {
                self.output_sample_rate = rate;
            } else {
                tracing::warn!("Ignoring non-positive outputSampleRate");
            }
        }
        if let Some(samples) = update.frame_samples {
            if samples > 0 {
                self.frame_samples = samples;
            } else {
                tracing::warn!("Ignoring non-positive frameSamples");
            }
        }
    }

    /// Duration of one outbound frame in milliseconds
    pub fn frame_duration_ms(&self) -> f32 {
        self.frame_samples as f32 * 1000.0 / self.input_sample_rate as f32
    }
}

/// Partial stream parameters sent by the peer
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    pub input_sample_rate: Option<u32>,
    pub output_sample_rate: Option<u32>,
    pub frame_samples: Option<usize>,
}

/// Control messages received from the peer
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundControl {
    Config(ConfigUpdate),
    DeviceState {
        #[serde(default)]
        state: Option<String>,
    },
    Pong,
    #[serde(other)]
    Unknown,
}

impl InboundControl {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Control messages sent to the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundControl {
    Mic { active: bool },
    Ping,
}

impl OutboundControl {
    pub fn mic(active: bool) -> Self {
        OutboundControl::Mic { active }
    }

    pub fn to_json(&self) -> String {
        // Serializing a fieldless-or-bool enum cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Encode samples as little-endian PCM16
pub fn encode_pcm16(samples: &[i16]) -> Bytes {
    let mut buf = BytesMut::with_capacity(samples.len() * 2);
    for &sample in samples {
        buf.put_i16_le(sample);
    }
    buf.freeze()
}

/// Decode little-endian PCM16. A trailing odd byte is ignored.
pub fn decode_pcm16(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}
