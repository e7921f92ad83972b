//! Client configuration sections.
//!
//! Connection endpoint and timeouts, listing cadence and the optional
//! HTTP/JSON endpoint.

use std::time::Duration;

use serde::Deserialize;

/// Default tio server port.
pub const DEFAULT_PORT: u16 = 2605;
/// Default host.
pub const DEFAULT_HOST: &str = "localhost";

// ============================================================================
// Configuration
// ============================================================================

/// PR1 connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// TCP connect plus handshake timeout.
    pub connect_timeout_ms: u64,
    /// Maximum wait for each answer frame.
    pub request_timeout_ms: u64,
    /// Extra connect attempts after a transport failure. 0 = fail fast.
    pub connect_retries: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
            connect_retries: 0,
        }
    }
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// `host:port`.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Background listing configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListingConfig {
    /// How often the view publishes newly arrived rows.
    pub refresh_interval_ms: u64,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: 1_000,
        }
    }
}

impl ListingConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

/// HTTP/JSON binding configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// Base URL, e.g. `http://localhost:8080/tio`.
    pub url: String,
    /// Per-request timeout. None = reqwest default.
    pub timeout_ms: Option<u64>,
}
