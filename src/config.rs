//! Configuration for shelly-ws-transport

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::connection::{ReconnectPolicy, RetryLimit, BASE_DELAY};
use crate::error::TransportError;

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Sent as `src` on every request
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Device address, `ws://` or `wss://`. The `/rpc` path is appended.
    #[serde(default = "default_host")]
    pub host: String,

    /// Reconnects allowed after unexpected closes (-1 = unlimited)
    #[serde(default)]
    pub max_retries: RetryLimit,

    /// Base unit of the reconnect delay
    #[serde(default = "default_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Per-request timeout in the RPC runtime (0 = wait forever)
    #[serde(default)]
    pub request_timeout_ms: u64,
}

fn default_client_id() -> String {
    "shelly-ws-transport".to_string()
}

/// Address a device serves on while in access-point mode.
fn default_host() -> String {
    "ws://192.168.33.1".to_string()
}

fn default_base_delay_ms() -> u64 {
    BASE_DELAY.as_millis() as u64
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            host: default_host(),
            max_retries: RetryLimit::default(),
            reconnect_base_delay_ms: default_base_delay_ms(),
            request_timeout_ms: 0,
        }
    }
}

impl TransportConfig {
    /// Config for `host` with everything else defaulted.
    pub fn for_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, TransportError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| TransportError::Config(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| TransportError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), TransportError> {
        let path = path.as_ref();
        let content =
            toml::to_string_pretty(self).map_err(|e| TransportError::Config(e.to_string()))?;
        std::fs::write(path, content)
            .map_err(|e| TransportError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Check the host is a WebSocket URL.
    pub fn validate(&self) -> Result<(), TransportError> {
        let url = Url::parse(&self.host)
            .map_err(|e| TransportError::InvalidHost(format!("{}: {}", self.host, e)))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(TransportError::InvalidHost(format!(
                    "{}: expected ws:// or wss://, got {}://",
                    self.host, other
                )))
            }
        }
        if url.host_str().is_none() {
            return Err(TransportError::InvalidHost(format!("{}: missing host", self.host)));
        }
        Ok(())
    }

    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        match self.request_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}
