//! # sotto-server
//!
//! WebSocket relay for sotto clients. The relay authenticates connections,
//! tracks presence, forwards end-to-end encrypted envelopes between live
//! sessions without reading them, and queues chat and friend-graph envelopes
//! durably for offline recipients.
//!
//! The binary in `main.rs` is a thin wrapper; everything it runs is exposed
//! here so tests can stand up a real relay on an ephemeral port.

pub mod auth;
pub mod config;
pub mod connection;
mod error;
pub mod rate_limit;
pub mod registry;
pub mod relay;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::info;

use sotto_store::Database;

pub use config::ServerConfig;
pub use error::{Result, ServerError};

use rate_limit::RateLimiter;
use registry::SessionRegistry;

/// State shared by every connection task.
pub struct ServerState {
    pub config: ServerConfig,
    pub registry: SessionRegistry,
    pub db: Mutex<Database>,
    pub auth_limiter: RateLimiter,
    next_connection_id: AtomicU64,
}

impl ServerState {
    /// Open the configured database and build the shared state.
    pub fn open(config: ServerConfig) -> Result<Self> {
        let db = match &config.db_path {
            Some(path) => Database::open_at(path)?,
            None => Database::open_default()?,
        };
        Ok(Self::new(config, db))
    }

    pub fn new(config: ServerConfig, db: Database) -> Self {
        let auth_limiter = RateLimiter::new(config.auth_burst, config.auth_refill_secs);
        Self {
            config,
            registry: SessionRegistry::new(),
            db: Mutex::new(db),
            auth_limiter,
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Unique id for a newly accepted socket.
    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Accept connections until the listener fails.
pub async fn serve(listener: TcpListener, state: Arc<ServerState>) -> Result<()> {
    info!(addr = %listener.local_addr()?, "Relay listening");
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            connection::handle_connection(state, stream, peer_addr).await;
        });
    }
}
