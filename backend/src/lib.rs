//! Waypoint - Signaling Service Library
//!
//! A rendezvous service that lets two browsers exchange the metadata they
//! need to open a direct WebRTC data channel: session descriptions, public
//! keys and a one-time PIN. Peer payload traffic never passes through it.
//!
//! ## Handshake
//!
//! 1. The initiator sends `offer` and claims a session id.
//! 2. The joining peer fetches it with `get_offer` and replies with `answer`.
//!    The server issues a 6-digit PIN to the joining peer and pushes
//!    `confirm_connection` to the initiator.
//! 3. The PIN is read out of band; the initiator sends `get_answer` with it.
//!
//! ## Design Principles
//!
//! * **Zero persistent state**: offers, answers and PINs expire after a TTL
//! * **No cross-connection writes**: pushes go through the hub's dispatcher
//! * **Pluggable store**: in-memory by default, Redis behind the `redis` feature
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use waypoint::{server, MemoryStore, ServerConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let handle = server::start(ServerConfig::default(), store).await?;
//! println!("listening on {}", handle.local_addr());
//!
//! tokio::signal::ctrl_c().await?;
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod handler;
pub mod hub;
pub mod pin;
pub mod protocol;
pub mod server;
pub mod session_id;
pub mod store;

// Re-export main types for convenience
pub use handler::SignalingHandler;
pub use hub::{ConnectionId, Hub, Link};
pub use pin::{PinError, PinManager};
pub use protocol::{ClientMessage, ServerMessage, SignalError};
pub use server::{ServerConfig, ServerHandle};
pub use store::{MemoryStore, SessionStore, StoreError};
