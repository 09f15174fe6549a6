//! Command-line and environment configuration.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use crate::server::ServerConfig;

/// Upper bound in seconds for the TTL options (one day).
pub const MAX_TTL_SECS: u64 = 86_400;

/// Command-line arguments for the signaling server.
///
/// Every option can also be set from the environment (or a `.env` file).
#[derive(Debug, Clone, Parser)]
#[command(name = "waypoint")]
#[command(about = "Rendezvous service brokering peer-to-peer handshakes behind a one-time PIN")]
pub struct Args {
    /// Address to listen on.
    #[arg(long, env = "WAYPOINT_BIND", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    /// Only accept WebSocket upgrades from this origin. When unset, any
    /// non-empty Origin header is accepted.
    #[arg(long, env = "ALLOWED_ORIGIN")]
    pub allowed_origin: Option<String>,

    /// TTL in seconds of offer, answer and PIN records.
    #[arg(
        long,
        env = "SESSION_TTL",
        default_value = "300",
        value_parser = clap::value_parser!(u64).range(1..=MAX_TTL_SECS)
    )]
    pub session_ttl: u64,

    /// Lifetime in seconds of an issued PIN.
    #[arg(
        long,
        env = "PIN_TTL",
        default_value = "300",
        value_parser = clap::value_parser!(u64).range(1..=MAX_TTL_SECS)
    )]
    pub pin_ttl: u64,

    /// Interval in seconds for purging expired entries from the in-memory store.
    #[arg(long, default_value = "60", value_parser = clap::value_parser!(u64).range(1..))]
    pub cleanup_interval: u64,

    /// Redis connection URL (requires the `redis` feature). Uses the
    /// in-memory store when unset.
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,
}

impl Args {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind: self.bind,
            allowed_origin: self
                .allowed_origin
                .clone()
                .filter(|origin| !origin.is_empty()),
            session_ttl: Duration::from_secs(self.session_ttl),
            pin_ttl: Duration::from_secs(self.pin_ttl),
            ..ServerConfig::default()
        }
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval)
    }
}
