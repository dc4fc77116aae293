//! Shared directory of which node holds each user's live connection.
//!
//! ```text
//!  node A (ws://a:8080)            directory            node B (ws://b:8080)
//!  handshake alice ── publish ──► user:alice → ws://a:8080
//!                                 user:bob   → ws://b:8080 ◄── publish ── handshake bob
//!  alice → bob ────── resolve ──► ws://b:8080 ── relay link ──► deliver_local
//! ```
//!
//! Records never expire. A crashed node leaves its pointers behind until
//! the user reconnects somewhere (publish overwrites) or they are retracted.

pub mod memory;
pub mod redis_store;

pub use self::memory::MemoryPresence;
pub use self::redis_store::RedisPresence;

use async_trait::async_trait;
use thiserror::Error;

/// Key prefix for presence records.
pub const PRESENCE_KEY_PREFIX: &str = "user:";

/// Directory key for a username: `user:<username>`.
pub fn presence_key(user: &str) -> String {
    format!("{PRESENCE_KEY_PREFIX}{user}")
}

/// Presence directory errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PresenceError {
    /// The backing store could not be reached.
    #[error("Presence directory unavailable: {0}")]
    Unavailable(String),
    /// The backing store rejected or failed a command.
    #[error("Presence backend error: {0}")]
    Backend(String),
}

/// Contract every presence backend implements.
///
/// Per-key read-your-writes is assumed; there are no cross-key transactions.
#[async_trait]
pub trait PresenceDirectory: Send + Sync {
    /// Record `node_addr` as the owner of `user`. Always overwrites.
    async fn publish(&self, user: &str, node_addr: &str) -> Result<(), PresenceError>;

    /// Address of the node that last published for `user`.
    async fn resolve(&self, user: &str) -> Result<Option<String>, PresenceError>;

    /// Unconditionally delete `user`'s record.
    async fn retract(&self, user: &str) -> Result<(), PresenceError>;

    /// Delete `user`'s record only while it still names `node_addr`.
    ///
    /// Returns whether a record was removed. The default is a plain
    /// resolve-then-retract; backends that can should do it atomically.
    async fn retract_if_owner(&self, user: &str, node_addr: &str) -> Result<bool, PresenceError> {
        match self.resolve(user).await? {
            Some(current) if current == node_addr => {
                self.retract(user).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Round-trip to the backing store. Used at node startup.
    async fn ping(&self) -> Result<(), PresenceError>;
}
