//! # chatmesh-core: horizontally scaled real-time chat
//!
//! Every node accepts WebSocket connections from clients, records which node
//! holds each user in a shared presence directory, and routes a direct
//! message to its recipient wherever that recipient is connected.
//!
//! ## Architecture
//!
//! ```text
//!  alice                        node A                                   node B                   bob
//! ┌──────┐  {"kind":"message"} ┌──────────────────┐  relay link (/ws)   ┌──────────────────┐  push  ┌──────┐
//! │client│ ──────────────────► │ ProtocolHandler  │ ──────────────────► │ ProtocolHandler  │ ─────► │client│
//! └──────┘                     │  append ─► Store │                     │  deliver_local   │        └──────┘
//!                              │  NodeRouter ─────┼─ resolve(bob) ─┐    │  mark_read       │
//!                              └──────────────────┘                │    └──────────────────┘
//!                                                                  ▼
//!                                                      PresenceDirectory (Redis)
//!                                                      user:bob → ws://node-b:8080
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON frames (handshake, message)
//! - [`storage`]: message persistence (RocksDB, in-memory)
//! - [`presence`]: user → node directory (Redis, in-memory)
//! - [`registry`]: live connections on this node
//! - [`relay`]: pooled outbound links to other nodes
//! - [`router`]: local delivery or relay
//! - [`handler`]: per-connection state machine
//! - [`node`]: listener and accept loop
//! - [`client`]: WebSocket client with offline queue

pub mod client;
pub mod config;
pub mod handler;
pub mod node;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod router;
pub mod stats;
pub mod storage;

// Re-exports for convenience
pub use client::{ChatClient, ChatEvent, ConnectionState, OfflineQueue};
pub use config::NodeConfig;
pub use handler::{HandlerContext, HandlerState, ProtocolHandler};
pub use node::{ChatNode, NodeError};
pub use presence::{MemoryPresence, PresenceDirectory, PresenceError, RedisPresence};
pub use protocol::{Frame, Message, ProtocolError};
pub use registry::{ConnectionHandle, ConnectionRegistry, DeliveryError};
pub use relay::{RelayError, RelayPool};
pub use router::{DeliveryOutcome, NodeRouter};
pub use stats::{AtomicNodeStats, NodeStats};
pub use storage::{
    collect_backlog, MemoryStore, MessageStore, RocksMessageStore, StoreConfig, StoreError,
};
