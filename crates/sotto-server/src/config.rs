//! Server configuration from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;

use sotto_shared::constants::{DEFAULT_SERVER_PORT, MAX_FRAME_SIZE};

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address the WebSocket listener binds to.
    ///
    /// Env: `SOTTO_BIND_ADDR`
    /// Default: `0.0.0.0:7667`
    pub bind_addr: SocketAddr,

    /// SQLite database path. Unset means the platform data directory.
    ///
    /// Env: `SOTTO_DB_PATH`
    pub db_path: Option<PathBuf>,

    /// Largest WebSocket message accepted, in bytes.
    ///
    /// Env: `SOTTO_MAX_FRAME_BYTES`
    /// Default: `262144`
    pub max_frame_bytes: usize,

    /// Connections with no inbound frame for this long are dropped. The
    /// client heartbeat keeps live sessions well under it.
    ///
    /// Env: `SOTTO_IDLE_TIMEOUT_SECS`
    /// Default: `120`
    pub idle_timeout_secs: u64,

    /// Token bucket capacity for AUTH/REGISTER frames, per client IP.
    ///
    /// Env: `SOTTO_AUTH_BURST`
    /// Default: `10`
    pub auth_burst: f64,

    /// Seconds to earn back one AUTH/REGISTER token.
    ///
    /// Env: `SOTTO_AUTH_REFILL_SECS`
    /// Default: `2`
    pub auth_refill_secs: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_SERVER_PORT)),
            db_path: None,
            max_frame_bytes: MAX_FRAME_SIZE,
            idle_timeout_secs: 120,
            auth_burst: 10.0,
            auth_refill_secs: 2.0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("SOTTO_BIND_ADDR") {
            match addr.parse() {
                Ok(parsed) => config.bind_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid SOTTO_BIND_ADDR, using default"),
            }
        }

        if let Ok(path) = std::env::var("SOTTO_DB_PATH") {
            config.db_path = Some(PathBuf::from(path));
        }

        if let Ok(raw) = std::env::var("SOTTO_MAX_FRAME_BYTES") {
            match raw.parse::<usize>() {
                Ok(parsed) if parsed > 0 => config.max_frame_bytes = parsed,
                _ => tracing::warn!(value = %raw, "Invalid SOTTO_MAX_FRAME_BYTES, using default"),
            }
        }

        if let Ok(raw) = std::env::var("SOTTO_IDLE_TIMEOUT_SECS") {
            match raw.parse::<u64>() {
                Ok(parsed) if parsed > 0 => config.idle_timeout_secs = parsed,
                _ => tracing::warn!(value = %raw, "Invalid SOTTO_IDLE_TIMEOUT_SECS, using default"),
            }
        }

        if let Ok(raw) = std::env::var("SOTTO_AUTH_BURST") {
            match positive_f64(&raw) {
                Some(parsed) => config.auth_burst = parsed,
                None => tracing::warn!(value = %raw, "Invalid SOTTO_AUTH_BURST, using default"),
            }
        }

        if let Ok(raw) = std::env::var("SOTTO_AUTH_REFILL_SECS") {
            match positive_f64(&raw) {
                Some(parsed) => config.auth_refill_secs = parsed,
                None => tracing::warn!(value = %raw, "Invalid SOTTO_AUTH_REFILL_SECS, using default"),
            }
        }

        config
    }
}

/// Parse a strictly positive, finite float.
fn positive_f64(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|v| *v > 0.0 && v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 7667);
        assert_eq!(config.max_frame_bytes, 262_144);
        assert_eq!(config.idle_timeout_secs, 120);
        assert!(config.db_path.is_none());
    }

    #[test]
    fn test_positive_f64() {
        assert_eq!(positive_f64("2.5"), Some(2.5));
        assert_eq!(positive_f64("10"), Some(10.0));
        assert_eq!(positive_f64("0"), None);
        assert_eq!(positive_f64("-1"), None);
        assert_eq!(positive_f64("inf"), None);
        assert_eq!(positive_f64("ten"), None);
    }
}
