//! Relay endpoint derivation
//!
//! Turns a user-supplied host string and port into the voice endpoint URL.
//! The host may carry an `http(s)://` or `ws(s)://` prefix; a secure prefix
//! selects `wss`. Default ports are left out of the URL.

use std::fmt;

use crate::constants::VOICE_PATH;
use crate::error::ConfigError;

const SCHEME_PREFIXES: [&str; 4] = ["https://", "http://", "wss://", "ws://"];

/// Validated relay endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    secure: bool,
    host: String,
    port: u16,
}

impl Endpoint {
    /// Validate `host` and `port`. Nothing here touches the network.
    pub fn parse(host: &str, port: u32) -> Result<Self, ConfigError> {
        let trimmed = host.trim();
        if trimmed.is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        let port = match u16::try_from(port) {
            Ok(p) if p != 0 => p,
            _ => return Err(ConfigError::InvalidPort(port)),
        };

        let lower = trimmed.to_ascii_lowercase();
        let secure = lower.starts_with("https://") || lower.starts_with("wss://");

        let mut bare = trimmed;
        for prefix in SCHEME_PREFIXES {
            if lower.starts_with(prefix) {
                bare = &trimmed[prefix.len()..];
                break;
            }
        }
        let bare = bare.trim_end_matches('/');
        if bare.is_empty() {
            return Err(ConfigError::EmptyHost);
        }

        Ok(Self {
            secure,
            host: bare.to_string(),
            port,
        })
    }

    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "wss"
        } else {
            "ws"
        }
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn is_default_port(&self) -> bool {
        (self.secure && self.port == 443) || (!self.secure && self.port == 80)
    }

    /// Full voice endpoint URL
    pub fn url(&self) -> String {
        if self.is_default_port() {
            format!("{}://{}{}", self.scheme(), self.host, VOICE_PATH)
        } else {
            format!("{}://{}:{}{}", self.scheme(), self.host, self.port, VOICE_PATH)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}
