//! Connection hub.
//!
//! Tracks which live connection has claimed which session id and routes
//! server-initiated pushes to a connection. A worker never writes to a socket
//! it does not own: pushes go through the hub's dispatch task into the target
//! connection's outbound queue, and the owning worker performs the write.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::protocol::ServerMessage;
use crate::session_id::pin_key;
use crate::store::SessionStore;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Non-owning handle to a live connection: its id and outbound queue.
#[derive(Debug, Clone)]
pub struct Link {
    id: ConnectionId,
    outbound: mpsc::Sender<ServerMessage>,
}

impl Link {
    /// Create a handle for a new connection whose worker drains `outbound`.
    pub fn new(outbound: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id: ConnectionId::next(),
            outbound,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether the owning worker has gone away.
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// A push waiting for the dispatch task.
#[derive(Debug)]
struct Dispatch {
    target: Link,
    message: ServerMessage,
}

/// Registry of claimed sessions.
#[derive(Debug)]
pub struct Hub {
    /// Session id -> owning connection.
    sessions: Mutex<HashMap<String, Link>>,
    dispatch_tx: mpsc::UnboundedSender<Dispatch>,
    store: Arc<dyn SessionStore>,
}

/// The single task that delivers pushes. Obtained from [`Hub::new`].
#[derive(Debug)]
pub struct Dispatcher {
    dispatch_rx: mpsc::UnboundedReceiver<Dispatch>,
}

impl Dispatcher {
    /// Deliver queued pushes until every [`Hub`] handle is dropped.
    pub async fn run(mut self) {
        while let Some(Dispatch { target, message }) = self.dispatch_rx.recv().await {
            match target.outbound.try_send(message) {
                Ok(()) => trace!(connection = %target.id, "Delivered push"),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(connection = %target.id, "Outbound queue full, dropping push");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(connection = %target.id, "Connection gone, dropping push");
                }
            }
        }
        debug!("Hub dispatcher stopped");
    }
}

impl Hub {
    /// Create a hub and its dispatcher. The dispatcher must be spawned for
    /// broadcasts to be delivered.
    pub fn new(store: Arc<dyn SessionStore>) -> (Self, Dispatcher) {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let hub = Self {
            sessions: Mutex::new(HashMap::new()),
            dispatch_tx,
            store,
        };
        (hub, Dispatcher { dispatch_rx })
    }

    /// Bind `session_id` to `link`, replacing any previous owner.
    ///
    /// A connection owns at most one session: an entry it already holds under
    /// another id is dropped.
    pub fn register(&self, link: Link, session_id: &str) {
        let connection = link.id;
        let mut sessions = self.sessions.lock();
        sessions.retain(|existing, owner| {
            let stale = owner.id == connection && existing != session_id;
            if stale {
                warn!(%connection, previous = %existing, "Connection moved to a new session id");
            }
            !stale
        });
        if let Some(previous) = sessions.insert(session_id.to_string(), link) {
            if previous.id != connection {
                warn!(%session_id, previous = %previous.id, "Session id re-registered");
            }
        }
    }

    /// Release the session owned by `connection`, if any, and return its id.
    ///
    /// The session's PIN record is deleted from the store on a detached task
    /// so teardown never waits on store I/O.
    pub fn unregister(&self, connection: ConnectionId) -> Option<String> {
        let session_id = {
            let mut sessions = self.sessions.lock();
            let session_id = sessions
                .iter()
                .find(|(_, link)| link.id == connection)
                .map(|(session_id, _)| session_id.clone())?;
            sessions.remove(&session_id);
            session_id
        };

        debug!(%connection, %session_id, "Session released");

        let store = Arc::clone(&self.store);
        let key = pin_key(&session_id);
        let released = session_id.clone();
        tokio::spawn(async move {
            if let Err(err) = store.delete(&key).await {
                warn!(session_id = %released, %err, "Cannot delete PIN record");
            }
        });

        Some(session_id)
    }

    /// Connection currently owning `session_id`.
    pub fn lookup(&self, session_id: &str) -> Option<Link> {
        self.sessions.lock().get(session_id).cloned()
    }

    /// Whether `connection` already owns a session.
    pub fn has_active_session(&self, connection: ConnectionId) -> bool {
        self.sessions
            .lock()
            .values()
            .any(|link| link.id == connection)
    }

    /// Queue `message` for delivery to `target`. Best effort: if the target
    /// has closed by the time the push is dispatched, it is dropped.
    pub fn broadcast(&self, target: Link, message: ServerMessage) {
        if self.dispatch_tx.send(Dispatch { target, message }).is_err() {
            warn!("Hub dispatcher is not running, dropping push");
        }
    }

    /// Number of claimed sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}
