//! Node counters.
//!
//! Updated with relaxed atomics on the hot path (per frame, per delivery);
//! read through [`AtomicNodeStats::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

use crate::router::DeliveryOutcome;

/// Point-in-time copy of a node's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub messages_persisted: u64,
    pub persist_failures: u64,
    pub local_deliveries: u64,
    pub relayed: u64,
    pub offline: u64,
    pub relay_failures: u64,
    /// Inbound relay links accepted from other nodes
    pub relay_sessions: u64,
}

/// Lock-free counters shared by the node, its handlers and its router.
#[derive(Debug, Default)]
pub struct AtomicNodeStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_received: AtomicU64,
    messages_persisted: AtomicU64,
    persist_failures: AtomicU64,
    local_deliveries: AtomicU64,
    relayed: AtomicU64,
    offline: AtomicU64,
    relay_failures: AtomicU64,
    relay_sessions: AtomicU64,
}

impl AtomicNodeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Saturating: never wraps below zero.
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_persisted(&self) {
        self.messages_persisted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn persist_failed(&self) {
        self.persist_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn relay_session_opened(&self) {
        self.relay_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, outcome: DeliveryOutcome) {
        let counter = match outcome {
            DeliveryOutcome::LocalDelivered => &self.local_deliveries,
            DeliveryOutcome::Relayed => &self.relayed,
            DeliveryOutcome::RecipientOffline => &self.offline,
            DeliveryOutcome::RelayFailed => &self.relay_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> NodeStats {
        NodeStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            messages_persisted: self.messages_persisted.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            local_deliveries: self.local_deliveries.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            offline: self.offline.load(Ordering::Relaxed),
            relay_failures: self.relay_failures.load(Ordering::Relaxed),
            relay_sessions: self.relay_sessions.load(Ordering::Relaxed),
        }
    }
}
