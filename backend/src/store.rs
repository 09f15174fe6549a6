//! Session store abstraction.
//!
//! The signaling core only needs a key/value store with per-key TTL. The
//! in-memory [`MemoryStore`] is the default; a Redis backend is available
//! behind the `redis` feature.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

#[cfg(feature = "redis")]
pub use self::redis_backend::RedisStore;

/// Errors returned by a session store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found")]
    NotFound,

    #[error("store backend failure: {0}")]
    Backend(String),
}

/// TTL-capable key/value store holding offer, answer and PIN records.
#[async_trait]
pub trait SessionStore: Debug + Send + Sync {
    /// Store `value` under `key`, replacing any previous value, for `ttl`.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;

    /// Fetch the value under `key`. Expired keys are reported as [`StoreError::NotFound`].
    async fn get(&self, key: &str) -> Result<String, StoreError>;

    /// Delete `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-process store. Entries expire lazily on read and in bulk via
/// [`MemoryStore::purge_expired`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Spawn a background task that purges expired entries every `interval`.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = self.purge_expired();
                if removed > 0 {
                    debug!(removed, "Purged expired store entries");
                }
            }
        })
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = Instant::now()
            .checked_add(ttl)
            .ok_or_else(|| StoreError::Backend(format!("TTL out of range: {ttl:?}")))?;
        let entry = Entry { value, expires_at };
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<String, StoreError> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Ok(entry.value.clone());
            }
        }

        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        Err(StoreError::NotFound)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(feature = "redis")]
mod redis_backend {
    use std::time::Duration;

    use async_trait::async_trait;
    use redis::aio::ConnectionManager;
    use redis::AsyncCommands;
    use tracing::info;

    use super::{SessionStore, StoreError};

    impl From<redis::RedisError> for StoreError {
        fn from(err: redis::RedisError) -> Self {
            StoreError::Backend(err.to_string())
        }
    }

    /// Store backed by a Redis server; TTLs map onto `SET ... EX`.
    #[derive(Clone)]
    pub struct RedisStore {
        conn: ConnectionManager,
    }

    impl std::fmt::Debug for RedisStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("RedisStore").finish_non_exhaustive()
        }
    }

    impl RedisStore {
        /// Connect and verify the server answers `PING`.
        pub async fn connect(url: &str) -> Result<Self, StoreError> {
            let client = redis::Client::open(url)?;
            let mut conn = ConnectionManager::new(client).await?;
            let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
            info!(%pong, "Connected to Redis");
            Ok(Self { conn })
        }
    }

    #[async_trait]
    impl SessionStore for RedisStore {
        async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
            let mut conn = self.conn.clone();
            // Redis rejects EX 0
            let seconds = ttl.as_secs().max(1);
            conn.set_ex::<_, _, ()>(key, value, seconds).await?;
            Ok(())
        }

        async fn get(&self, key: &str) -> Result<String, StoreError> {
            let mut conn = self.conn.clone();
            let value: Option<String> = conn.get(key).await?;
            value.ok_or(StoreError::NotFound)
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            let mut conn = self.conn.clone();
            conn.del::<_, ()>(key).await?;
            Ok(())
        }
    }
}
