//! Waypoint - Signaling Service
//!
//! Brokers WebRTC offer/answer handshakes between two browsers, gated by a
//! one-time PIN.

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use waypoint::config::Args;
use waypoint::{server, MemoryStore, SessionStore};

#[cfg(feature = "redis")]
async fn connect_redis(url: &str) -> anyhow::Result<Arc<dyn SessionStore>> {
    let store = waypoint::store::RedisStore::connect(url).await?;
    info!("Using Redis session store");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(_url: &str) -> anyhow::Result<Arc<dyn SessionStore>> {
    anyhow::bail!("a Redis URL was given but this build lacks the `redis` feature")
}

/// Pick the session store: Redis when configured, in-memory otherwise.
async fn build_store(args: &Args) -> anyhow::Result<Arc<dyn SessionStore>> {
    if let Some(url) = args.redis_url.as_deref().filter(|url| !url.is_empty()) {
        return connect_redis(url).await;
    }

    let store = Arc::new(MemoryStore::new());
    Arc::clone(&store).spawn_sweeper(args.cleanup_interval());
    warn!("Using in-memory session store (not shared between instances)");
    Ok(store)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("waypoint=info".parse()?)
                .add_directive("tower_http=warn".parse()?),
        )
        .init();

    let args = Args::parse();

    let store = build_store(&args).await?;
    let handle = server::start(args.server_config(), store).await?;

    info!(addr = %handle.local_addr(), "Signaling server is running");
    info!("Press Ctrl+C to stop");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    handle.shutdown().await;
    info!("Server stopped");

    Ok(())
}
