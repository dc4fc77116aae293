//! Per-node registry of live client connections.
//!
//! Maps a username to the handle of the connection currently serving that
//! user on this node. The map is hash-sharded (`DashMap`), so lookups from
//! the router never contend with registrations for unrelated users, and no
//! operation ever awaits network I/O while holding a shard lock.
//!
//! ```text
//! register(alice, #7) ──► { alice → #7 }
//! register(alice, #9) ──► { alice → #9 }   #7 cancelled (socket torn down)
//! unregister(alice, #7) ─► no-op            stale disconnect, #9 survives
//! unregister(alice, #9) ─► { }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::protocol::Message;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// How long a push may wait for its frame to reach the socket.
pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// A message queued for a connection's writer task.
///
/// `written` fires once the frame has been flushed to the socket; it is
/// dropped unfired when the write fails.
#[derive(Debug)]
pub struct Outbound {
    pub message: Message,
    pub written: oneshot::Sender<()>,
}

/// Failure to push a message over a local connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Socket write failed")]
    WriteFailed,
    #[error("Client not reading; connection closed")]
    Timeout,
}

/// Cloneable handle to one live client connection.
///
/// Identity is the node-unique `conn_id`; two handles are the same
/// connection iff their ids match.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    conn_id: u64,
    user: String,
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    push_timeout: Duration,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end its writer task drains.
    pub fn new(
        user: impl Into<String>,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            conn_id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            user: user.into(),
            outbound,
            cancel,
            push_timeout: DEFAULT_PUSH_TIMEOUT,
        };
        (handle, rx)
    }

    pub fn with_push_timeout(mut self, push_timeout: Duration) -> Self {
        self.push_timeout = push_timeout;
        self
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Whether two handles refer to the same connection.
    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        self.conn_id == other.conn_id
    }

    /// Ask the owning task to tear the connection down.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.outbound.is_closed()
    }

    /// Token that fires when this connection is closed or superseded.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Push a message to the client and wait until it is on the wire.
    ///
    /// A client that does not drain its socket within the push timeout is
    /// disconnected, so a stalled reader never holds up the pusher.
    pub async fn push(&self, message: Message) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::ConnectionClosed);
        }
        let (written, ack) = oneshot::channel();
        let delivery = async {
            self.outbound
                .send(Outbound { message, written })
                .await
                .map_err(|_| DeliveryError::ConnectionClosed)?;
            ack.await.map_err(|_| DeliveryError::WriteFailed)
        };
        match tokio::time::timeout(self.push_timeout, delivery).await {
            Ok(result) => result,
            Err(_) => {
                log::warn!(
                    "Connection #{} for {} stopped reading, closing it",
                    self.conn_id,
                    self.user
                );
                self.close();
                Err(DeliveryError::Timeout)
            }
        }
    }
}

/// Username → live connection on this node.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handle` as the current connection for its user.
    ///
    /// A previously registered connection for the same user is closed and
    /// returned.
    pub fn register(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let user = handle.user().to_string();
        let previous = self.connections.insert(user, handle);
        if let Some(ref old) = previous {
            log::info!(
                "Connection #{} for {} superseded, closing it",
                old.conn_id(),
                old.user()
            );
            old.close();
        }
        previous
    }

    /// Current connection for `user`, if any.
    pub fn lookup(&self, user: &str) -> Option<ConnectionHandle> {
        self.connections.get(user).map(|entry| entry.value().clone())
    }

    /// Remove `user`'s entry only if it is still `handle`.
    ///
    /// Returns `true` when the entry was removed. A disconnect for a
    /// connection that has since been superseded is a no-op.
    pub fn unregister(&self, user: &str, handle: &ConnectionHandle) -> bool {
        self.connections
            .remove_if(user, |_, current| current.same_connection(handle))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Snapshot of connected usernames.
    pub fn users(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    /// Close every registered connection (node shutdown).
    pub fn close_all(&self) {
        for entry in self.connections.iter() {
            entry.value().close();
        }
    }
}
