//! Connection options.
//!
//! Options can be built in code starting from [`ConnectionOptions::default`]
//! or loaded from a TOML document whose keys mirror the wire configuration
//! (`socketEndpoint`, `restEndpoint`, `persistConnection`, `requestTimeout`).

use std::path::Path;
use std::time::Duration;

use reqwest::Url;
use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;

use crate::error::ConnectionError;
use crate::retry::ReconnectPolicy;

/// Default websocket endpoint.
pub const DEFAULT_SOCKET_ENDPOINT: &str = "ws://localhost:8787/primus";
/// Default HTTP endpoint used when the socket is not open.
pub const DEFAULT_REST_ENDPOINT: &str = "http://localhost:8787/api";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectionDefaults;

impl ConnectionDefaults {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(5_000);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(2_000);
    pub const SWEEP_INTERVAL: Duration = Duration::from_millis(100);
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionOptions {
    #[serde(default = "default_socket_endpoint")]
    pub socket_endpoint: String,

    #[serde(default = "default_rest_endpoint")]
    pub rest_endpoint: String,

    #[serde(default = "default_persist_connection")]
    pub persist_connection: bool,

    /// Per-request timeout in milliseconds. `0` disables socket expiry.
    #[serde(rename = "requestTimeout", default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Connect timeout in milliseconds for the websocket handshake and HTTP
    /// connections; `0` disables it.
    #[serde(rename = "connectTimeout", default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Optional key sent as `x-api-key` on both transports.
    #[serde(default)]
    pub api_key: Option<SecretString>,

    #[serde(skip)]
    pub reconnect: ReconnectPolicy,
}

fn default_socket_endpoint() -> String {
    DEFAULT_SOCKET_ENDPOINT.to_string()
}

fn default_rest_endpoint() -> String {
    DEFAULT_REST_ENDPOINT.to_string()
}

fn default_persist_connection() -> bool {
    true
}

fn default_request_timeout_ms() -> u64 {
    ConnectionDefaults::REQUEST_TIMEOUT.as_millis() as u64
}

fn default_connect_timeout_ms() -> u64 {
    ConnectionDefaults::CONNECT_TIMEOUT.as_millis() as u64
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            socket_endpoint: default_socket_endpoint(),
            rest_endpoint: default_rest_endpoint(),
            persist_connection: default_persist_connection(),
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            api_key: None,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ConnectionOptions {
    /// Parses options from a TOML document. Missing keys take defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    /// Reads and parses a TOML options file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&source)
    }

    pub fn with_socket_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.socket_endpoint = endpoint.into().trim_end().to_string();
        self
    }

    pub fn with_rest_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.rest_endpoint = endpoint.into().trim_end().to_string();
        self
    }

    pub fn with_persist_connection(mut self, persist: bool) -> Self {
        self.persist_connection = persist;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Checks that both endpoints parse and use a scheme their transport
    /// understands.
    pub fn validate(&self) -> Result<(), ConnectionError> {
        validate_endpoint("socket_endpoint", &self.socket_endpoint, &["ws", "wss"])?;
        validate_endpoint("rest_endpoint", &self.rest_endpoint, &["http", "https"])?;
        Ok(())
    }
}

fn validate_endpoint(
    field: &'static str,
    endpoint: &str,
    schemes: &[&str],
) -> Result<(), ConnectionError> {
    let url = Url::parse(endpoint).map_err(|err| ConnectionError::InvalidEndpoint {
        field,
        reason: err.to_string(),
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConnectionError::InvalidEndpoint {
            field,
            reason: format!("unsupported scheme {}", url.scheme()),
        });
    }
    Ok(())
}

/// Errors produced while loading options from a file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
}
