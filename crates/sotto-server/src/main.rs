//! Relay server binary.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sotto_server::{serve, ServerConfig, ServerState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sotto_server=debug")),
        )
        .init();

    info!("Starting sotto relay v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Open the account and offline-queue store
    // -----------------------------------------------------------------------
    let state = Arc::new(ServerState::open(config)?);

    // -----------------------------------------------------------------------
    // 4. Background maintenance
    // -----------------------------------------------------------------------

    // Evict rate-limit buckets idle for more than 10 minutes.
    let limiter = state.auth_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            limiter.purge_stale(600.0).await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Bind and serve until Ctrl+C
    // -----------------------------------------------------------------------
    let listener = TcpListener::bind(state.config.bind_addr).await?;

    tokio::select! {
        result = serve(listener, Arc::clone(&state)) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Relay server failed");
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
