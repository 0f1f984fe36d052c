//! Client configuration and relay endpoints.

use std::time::Duration;

use sotto_shared::constants::{DEFAULT_SERVER_HOST, DEFAULT_SERVER_PORT};
use sotto_shared::validate;

/// One relay address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

/// Tunables for the connection state machine. All public so embedders and
/// tests can tighten the timings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay endpoints, tried in order.
    pub endpoints: Vec<Endpoint>,
    /// Bound on a single transport open.
    pub connect_timeout: Duration,
    /// Pause before re-trying the same endpoint.
    pub retry_delay: Duration,
    /// Retries per endpoint after the initial attempt.
    pub max_attempts_per_endpoint: u32,
    /// PING cadence while connected.
    pub heartbeat_interval: Duration,
    /// Bound on waiting for a REGISTER_RESULT.
    pub register_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![Endpoint::new(DEFAULT_SERVER_HOST, DEFAULT_SERVER_PORT)],
            connect_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_secs(2),
            max_attempts_per_endpoint: 3,
            heartbeat_interval: Duration::from_secs(25),
            register_timeout: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    /// Build a single-endpoint config from optional host and port overrides,
    /// typically the user's saved settings. An invalid host or port is
    /// refused with a warning and replaced by the default.
    pub fn with_server(host: Option<&str>, port: Option<u16>) -> Self {
        let mut config = Self::default();

        let port = match port {
            Some(port) if validate::valid_port(port) => port,
            Some(port) => {
                tracing::warn!(value = port, "Invalid server port, using default");
                DEFAULT_SERVER_PORT
            }
            None => DEFAULT_SERVER_PORT,
        };
        let host = match host {
            Some(host) if validate::valid_host(host) => host,
            Some(host) => {
                tracing::warn!(value = %host, "Invalid server host, using default");
                DEFAULT_SERVER_HOST
            }
            None => DEFAULT_SERVER_HOST,
        };

        config.endpoints = vec![Endpoint::new(host, port)];
        config
    }
}
