//! Application configuration
//!
//! Stored as TOML in the platform configuration directory. Missing files and
//! missing keys fall back to defaults.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};
use crate::transport::ChannelSettings;

/// Environment variable overriding the voice endpoint
pub const URL_ENV_VAR: &str = "VOICE_LINK_URL";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub transport: TransportSettings,
    pub audio: AudioSettings,
    pub ui: UiConfig,
}

/// Connection to the voice endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub url: String,
    pub reconnect_delay_ms: u64,
    pub connect_timeout_ms: u64,
    /// Ping interval while open; 0 disables keepalive
    pub keepalive_secs: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_SERVER_URL.to_string(),
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            keepalive_secs: 0,
        }
    }
}

/// Device selection; `None` means the host default
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

/// Local control API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            http_port: DEFAULT_HTTP_PORT,
        }
    }
}

impl AppConfig {
    /// Default location of the config file
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("io", "voice-link", "voice-link")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from the default location, falling back to defaults
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Apply the `VOICE_LINK_URL` override
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(URL_ENV_VAR) {
            self.override_url(url);
        }
    }

    /// Replace the endpoint URL unless `url` is blank
    pub fn override_url(&mut self, url: impl Into<String>) {
        let url = url.into();
        if !url.trim().is_empty() {
            self.transport.url = url;
        }
    }

    /// Channel settings derived from this config
    pub fn channel_settings(&self) -> ChannelSettings {
        let t = &self.transport;
        ChannelSettings {
            url: t.url.clone(),
            reconnect_delay: Duration::from_millis(t.reconnect_delay_ms),
            connect_timeout: Duration::from_millis(t.connect_timeout_ms.max(1)),
            keepalive: (t.keepalive_secs > 0).then(|| Duration::from_secs(t.keepalive_secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [transport]
            url = "wss://voice.example/ws/audio"
            keepalive_secs = 15
            "#,
        )
        .unwrap();

        assert_eq!(config.transport.url, "wss://voice.example/ws/audio");
        assert_eq!(config.transport.reconnect_delay_ms, 2000);
        assert_eq!(config.ui, UiConfig::default());

        let settings = config.channel_settings();
        assert_eq!(settings.reconnect_delay, Duration::from_millis(2000));
        assert_eq!(settings.keepalive, Some(Duration::from_secs(15)));
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let err = AppConfig::from_toml("transport = 5").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = std::env::temp_dir().join(format!("voice-link-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.toml");

        let mut config = AppConfig::default();
        config.audio.input_device = Some("input:USB Mic".to_string());
        config.ui.http_port = 9999;
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_blank_override_ignored() {
        let mut config = AppConfig::default();
        config.override_url("   ");
        assert_eq!(config.transport.url, DEFAULT_SERVER_URL);
        config.override_url("ws://10.0.0.2:8000/ws/audio");
        assert_eq!(config.transport.url, "ws://10.0.0.2:8000/ws/audio");
        assert_eq!(config.channel_settings().keepalive, None);
    }
}
