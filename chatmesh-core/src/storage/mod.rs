//! Durable message persistence.
//!
//! ```text
//! ┌──────────────┐  append / mark_read   ┌────────────────────────────────┐
//! │ Handler /    │ ────────────────────► │ MessageStore                   │
//! │ NodeRouter   │                       │  RocksMessageStore (RocksDB)   │
//! └──────┬───────┘  fetch_unread         │  MemoryStore (in-process)      │
//!        │ ◄──────────────────────────── └────────────────────────────────┘
//!        ▼
//!  backlog replay on handshake
//! ```
//!
//! Messages are partitioned by recipient and ordered by id. Ids are UUIDv7,
//! so id order within a partition is persistence-time order. Nothing in
//! this crate ever deletes a persisted message, and `read` only goes from
//! `false` to `true`.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksMessageStore, StoreConfig};

use thiserror::Error;
use uuid::Uuid;

use crate::protocol::Message;

/// Lazy, finite, ordered sequence of unread messages.
///
/// Call [`MessageStore::fetch_unread`] again to restart it.
pub type Backlog<'a> = Box<dyn Iterator<Item = Result<Message, StoreError>> + 'a>;

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Backend internal error
    #[error("Database error: {0}")]
    DatabaseError(String),
    /// Backend not reachable
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    /// Recipient cannot be used as a partition key
    #[error("Invalid recipient: {0:?}")]
    InvalidRecipient(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
}

/// Contract every message backend implements.
pub trait MessageStore: Send + Sync {
    /// Persist `message` with `read = false` and return its id.
    ///
    /// A message without an id gets a fresh UUIDv7. A message that already
    /// carries one is inserted only if that `(recipient, id)` is absent; an
    /// existing row is left untouched, including its read flag.
    fn append(&self, message: &Message) -> Result<Uuid, StoreError>;

    /// Flip `read` to true. Returns whether this call changed anything;
    /// repeated calls and unknown ids are no-ops.
    fn mark_read(&self, recipient: &str, id: Uuid) -> Result<bool, StoreError>;

    /// Unread messages for `recipient` in id order.
    ///
    /// `None` means the backend does not support backlog queries; callers
    /// treat that as an empty backlog.
    fn fetch_unread(&self, recipient: &str) -> Result<Option<Backlog<'_>>, StoreError> {
        let _ = recipient;
        Ok(None)
    }

    /// A single message.
    fn get(&self, recipient: &str, id: Uuid) -> Result<Option<Message>, StoreError>;

    /// Every message for `recipient` in id order.
    fn history(&self, recipient: &str) -> Result<Vec<Message>, StoreError>;

    /// Number of messages stored for `recipient`.
    fn count(&self, recipient: &str) -> Result<usize, StoreError> {
        Ok(self.history(recipient)?.len())
    }

    /// Verify the backend is usable. Called once at node startup.
    fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Reject recipients that cannot form a partition key.
pub(crate) fn validate_recipient(recipient: &str) -> Result<(), StoreError> {
    if recipient.is_empty() || recipient.contains('\0') {
        return Err(StoreError::InvalidRecipient(recipient.to_string()));
    }
    Ok(())
}

/// Drain a backlog into memory, skipping entries that fail to load.
pub fn collect_backlog(store: &dyn MessageStore, recipient: &str) -> Vec<Message> {
    match store.fetch_unread(recipient) {
        Ok(Some(backlog)) => backlog
            .filter_map(|item| match item {
                Ok(msg) if !msg.read => Some(msg),
                Ok(_) => None,
                Err(e) => {
                    log::warn!("Skipping unreadable backlog entry for {recipient}: {e}");
                    None
                }
            })
            .collect(),
        Ok(None) => Vec::new(),
        Err(e) => {
            log::warn!("Backlog query for {recipient} failed: {e}");
            Vec::new()
        }
    }
}
