//! Message routing: local push or relay to the owning node.
//!
//! ```text
//! deliver(msg)
//!   │ resolve(recipient)
//!   ├─ error ─────────────► RelayFailed
//!   ├─ none ──────────────► RecipientOffline
//!   ├─ == self_addr ──► deliver_local
//!   │                     ├─ push ok ─► mark_read ─► LocalDelivered
//!   │                     └─ no conn / push err ───► RecipientOffline
//!   └─ other addr ───► RelayPool::send
//!                         ├─ ok ──────────────────► Relayed
//!                         └─ err (link dropped) ──► RelayFailed
//! ```
//!
//! Outcomes are values, not errors: a failed delivery never tears down the
//! sender's connection. The message is already persisted by then, so an
//! undelivered message stays unread for a later backlog replay.

use std::fmt;
use std::sync::Arc;

use crate::presence::PresenceDirectory;
use crate::protocol::Message;
use crate::registry::ConnectionRegistry;
use crate::relay::RelayPool;
use crate::stats::AtomicNodeStats;
use crate::storage::MessageStore;

/// Result of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryOutcome {
    /// Pushed to a connection on this node and marked read
    LocalDelivered,
    /// Handed to the owning node over a relay link
    Relayed,
    /// No live connection for the recipient anywhere
    RecipientOffline,
    /// Owning node or presence directory unreachable
    RelayFailed,
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeliveryOutcome::LocalDelivered => "delivered locally",
            DeliveryOutcome::Relayed => "relayed",
            DeliveryOutcome::RecipientOffline => "recipient offline",
            DeliveryOutcome::RelayFailed => "relay failed",
        };
        f.write_str(label)
    }
}

/// Routes messages for one node.
pub struct NodeRouter {
    self_addr: String,
    registry: Arc<ConnectionRegistry>,
    presence: Arc<dyn PresenceDirectory>,
    store: Arc<dyn MessageStore>,
    relay: Arc<RelayPool>,
    stats: Arc<AtomicNodeStats>,
}

impl NodeRouter {
    pub fn new(
        self_addr: impl Into<String>,
        registry: Arc<ConnectionRegistry>,
        presence: Arc<dyn PresenceDirectory>,
        store: Arc<dyn MessageStore>,
        relay: Arc<RelayPool>,
        stats: Arc<AtomicNodeStats>,
    ) -> Self {
        Self {
            self_addr: self_addr.into(),
            registry,
            presence,
            store,
            relay,
            stats,
        }
    }

    /// Address this node publishes for its users.
    pub fn self_addr(&self) -> &str {
        &self.self_addr
    }

    /// Deliver `message` wherever its recipient is connected.
    pub async fn deliver(&self, message: &Message) -> DeliveryOutcome {
        let outcome = self.route(message).await;
        self.stats.record_outcome(outcome);
        log::debug!(
            "Message {:?} {} -> {}: {outcome}",
            message.id,
            message.sender,
            message.recipient
        );
        outcome
    }

    /// Deliver to a connection on this node only.
    ///
    /// Entry point for messages arriving over a relay link.
    pub async fn deliver_local(&self, message: &Message) -> DeliveryOutcome {
        let outcome = self.push_local(message).await;
        self.stats.record_outcome(outcome);
        outcome
    }

    async fn route(&self, message: &Message) -> DeliveryOutcome {
        let owner = match self.presence.resolve(&message.recipient).await {
            Ok(Some(addr)) => addr,
            Ok(None) => return DeliveryOutcome::RecipientOffline,
            Err(e) => {
                log::warn!("Presence lookup for {} failed: {e}", message.recipient);
                return DeliveryOutcome::RelayFailed;
            }
        };

        if self.is_self(&owner) {
            return self.push_local(message).await;
        }

        match self.relay.send(&owner, message).await {
            Ok(()) => DeliveryOutcome::Relayed,
            Err(_) => DeliveryOutcome::RelayFailed,
        }
    }

    async fn push_local(&self, message: &Message) -> DeliveryOutcome {
        let Some(handle) = self.registry.lookup(&message.recipient) else {
            return DeliveryOutcome::RecipientOffline;
        };

        if let Err(e) = handle.push(message.clone()).await {
            log::debug!(
                "Push to {} (connection #{}) failed: {e}",
                message.recipient,
                handle.conn_id()
            );
            return DeliveryOutcome::RecipientOffline;
        }

        match message.id {
            Some(id) => {
                if let Err(e) = self.store.mark_read(&message.recipient, id) {
                    log::warn!("Failed to mark message {id} read: {e}");
                }
            }
            None => log::debug!("Delivered unpersisted message to {}", message.recipient),
        }
        DeliveryOutcome::LocalDelivered
    }

    fn is_self(&self, addr: &str) -> bool {
        addr.trim_end_matches('/') == self.self_addr.trim_end_matches('/')
    }
}
