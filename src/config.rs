//! Client configuration
//!
//! Loaded from a TOML file. Every section falls back to its defaults so a
//! partial file (or an empty one) is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{MAX_GAIN, OPUS_BITRATE};
use crate::error::ConfigError;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub relay: RelayConfig,
    pub session: SessionConfig,
    pub reconnect: ReconnectConfig,
    pub audio: AudioConfig,
    pub opus: OpusConfig,
    pub frequencies: Vec<FrequencyConfig>,
}

impl ClientConfig {
    /// Parse configuration from a TOML string
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Default location of the configuration file for this user
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "relay-voice")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay.port == 0 || self.relay.port > u16::MAX as u32 {
            return Err(ConfigError::InvalidPort(self.relay.port));
        }
        if self.reconnect.factor < 1.0 {
            return Err(invalid("reconnect.factor", "must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter_factor) {
            return Err(invalid("reconnect.jitter_factor", "must be within 0..=1"));
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            return Err(invalid(
                "reconnect.initial_delay_ms",
                "must not exceed reconnect.max_delay_ms",
            ));
        }
        if self.session.send_queue_capacity == 0 {
            return Err(invalid("session.send_queue_capacity", "must be at least 1"));
        }
        if self.session.heartbeat_interval_ms == 0 {
            return Err(invalid("session.heartbeat_interval_ms", "must be non-zero"));
        }
        for freq in &self.frequencies {
            if !(0.0..=MAX_GAIN).contains(&freq.volume) {
                return Err(invalid("frequencies.volume", "must be within 0..=1.25"));
            }
            if !(0.0..=1.0).contains(&freq.pan) {
                return Err(invalid("frequencies.pan", "must be within 0..=1"));
            }
        }
        Ok(())
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

/// Relay server and identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Host name, optionally prefixed with `http://` or `https://`
    pub host: String,
    pub port: u32,
    pub discord_user_id: String,
    pub guild_id: String,
    pub auth_token: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            discord_user_id: String::new(),
            guild_id: String::new(),
            auth_token: String::new(),
        }
    }
}

/// Transport session timing and queueing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub connect_timeout_ms: u64,
    pub auth_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    /// Bounded wait for the close handshake on disconnect
    pub close_timeout_ms: u64,
    /// Outbound audio packets held before the oldest is dropped
    pub send_queue_capacity: usize,
    /// Let the heartbeat path reconnect the session by itself once.
    /// Leave off when a reconnect supervisor owns retries.
    pub self_reconnect_on_heartbeat: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            auth_timeout_ms: 5_000,
            heartbeat_interval_ms: 10_000,
            heartbeat_timeout_ms: 30_000,
            close_timeout_ms: 2_000,
            send_queue_capacity: 200,
            self_reconnect_on_heartbeat: false,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

/// Reconnect back-off policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
    /// Fraction of the base delay added or removed at random
    pub jitter_factor: f64,
    pub min_delay_ms: u64,
    pub max_retries: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            factor: 2.0,
            max_delay_ms: 30_000,
            jitter_factor: 0.3,
            min_delay_ms: 500,
            max_retries: 10,
        }
    }
}

/// Local audio settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    /// Master gain applied to captured audio before encoding
    pub input_gain: f32,
    /// Master volume applied to everything played back
    pub output_volume: f32,
    /// Output device name; `None` uses the host default
    pub output_device: Option<String>,
    pub playback_buffer_ms: u32,
    /// Open a real output device. When false, playback stays headless.
    pub device_playback: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_gain: 1.0,
            output_volume: 1.0,
            output_device: None,
            playback_buffer_ms: 2_000,
            device_playback: true,
        }
    }
}

/// Opus encoder settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OpusConfig {
    pub bitrate: u32,
    pub vbr: bool,
}

impl Default for OpusConfig {
    fn default() -> Self {
        Self::voice()
    }
}

impl OpusConfig {
    /// Voice preset used for every transmission
    pub fn voice() -> Self {
        Self {
            bitrate: OPUS_BITRATE,
            vbr: true,
        }
    }
}

/// A frequency the client listens to, with its playback settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FrequencyConfig {
    pub id: i32,
    pub volume: f32,
    pub pan: f32,
    pub muted: bool,
    pub enabled: bool,
}

impl Default for FrequencyConfig {
    fn default() -> Self {
        Self {
            id: 0,
            volume: 1.0,
            pan: 0.5,
            muted: false,
            enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = ClientConfig::from_toml_str("").unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.session.auth_timeout(), Duration::from_secs(5));
        assert_eq!(config.reconnect.max_retries, 10);
    }

    #[test]
    fn test_partial_sections() {
        let config = ClientConfig::from_toml_str(
            r#"
            [relay]
            host = "https://radio.example.org"
            port = 443
            discord_user_id = "1234"

            [reconnect]
            max_retries = 3

            [[frequencies]]
            id = 101
            pan = 0.0

            [[frequencies]]
            id = 911
            volume = 1.25
            muted = true
            "#,
        )
        .unwrap();

        assert_eq!(config.relay.host, "https://radio.example.org");
        assert_eq!(config.relay.port, 443);
        assert_eq!(config.relay.guild_id, "");
        assert_eq!(config.reconnect.max_retries, 3);
        assert_eq!(config.reconnect.initial_delay_ms, 1_000);
        assert_eq!(config.frequencies.len(), 2);
        assert_eq!(config.frequencies[0].volume, 1.0);
        assert!(config.frequencies[1].muted);
    }

    #[test]
    fn test_rejects_bad_port() {
        let err = ClientConfig::from_toml_str("[relay]\nport = 70000").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort(70000)));
    }

    #[test]
    fn test_rejects_out_of_range_pan() {
        let err = ClientConfig::from_toml_str("[[frequencies]]\nid = 1\npan = 1.5").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_rejects_malformed_toml() {
        let err = ClientConfig::from_toml_str("[relay\nport = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
