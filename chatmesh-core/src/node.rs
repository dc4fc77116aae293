//! A chat node: listener, accept loop and the shared per-node state.
//!
//! ```text
//!            ┌──────────────────────── ChatNode ────────────────────────┐
//! client ──► │ accept ─► ProtocolHandler ─► MessageStore                │
//! node B ──► │            │                 NodeRouter ─► RelayPool ───┼──► node C
//!            │            └─ ConnectionRegistry   │                     │
//!            │                                    └─► PresenceDirectory ┼──► Redis
//!            └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Clients and relay links from other nodes share one listener; the first
//! frame on each socket tells them apart.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::handler::{HandlerContext, ProtocolHandler};
use crate::presence::{PresenceDirectory, PresenceError};
use crate::registry::ConnectionRegistry;
use crate::relay::RelayPool;
use crate::router::NodeRouter;
use crate::stats::{AtomicNodeStats, NodeStats};
use crate::storage::{MessageStore, StoreError};

/// Node startup and runtime errors.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Message store unusable: {0}")]
    Store(#[from] StoreError),
    #[error("Presence directory unreachable: {0}")]
    Presence(#[from] PresenceError),
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("No address to advertise for wildcard bind {bind}; set one explicitly")]
    NoAdvertiseAddr { bind: SocketAddr },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One node of a chat cluster.
pub struct ChatNode {
    listener: TcpListener,
    local_addr: SocketAddr,
    ctx: Arc<HandlerContext>,
    relay: Arc<RelayPool>,
}

impl ChatNode {
    /// Check both backends, bind the listener and wire up the node.
    ///
    /// An unusable store or unreachable presence directory fails startup.
    pub async fn start(
        config: NodeConfig,
        presence: Arc<dyn PresenceDirectory>,
        store: Arc<dyn MessageStore>,
    ) -> Result<Self, NodeError> {
        store.health_check()?;
        presence.ping().await?;

        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(|source| NodeError::Bind {
                addr: config.bind_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let advertise_addr = advertise_addr(
            config.advertise_addr.as_deref(),
            local_addr,
            local_hostname(),
        )?;

        let shutdown = CancellationToken::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let stats = Arc::new(AtomicNodeStats::new());
        let relay = Arc::new(RelayPool::new(config.relay_connect_timeout, shutdown.clone()));
        let router = Arc::new(NodeRouter::new(
            advertise_addr.clone(),
            registry.clone(),
            presence.clone(),
            store.clone(),
            relay.clone(),
            stats.clone(),
        ));

        log::info!("Chat node listening on {local_addr}, advertised as {advertise_addr}");

        let ctx = Arc::new(HandlerContext {
            config,
            registry,
            presence,
            store,
            router,
            stats,
            shutdown,
        });

        Ok(Self {
            listener,
            local_addr,
            ctx,
            relay,
        })
    }

    /// Accept connections until [`ChatNode::shutdown_token`] fires.
    pub async fn run(self) -> Result<(), NodeError> {
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::warn!("Accept failed: {e}");
                        continue;
                    }
                },
            };
            log::debug!("New TCP connection from {peer}");
            let _ = stream.set_nodelay(true);

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                let ws = match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(e) => {
                        log::debug!("WebSocket upgrade from {peer} failed: {e}");
                        return;
                    }
                };
                ctx.stats.connection_opened();
                let mut handler = ProtocolHandler::new(ctx.clone(), peer.to_string());
                if let Err(e) = handler.run(ws).await {
                    log::warn!("Connection error from {peer}: {e}");
                }
                ctx.stats.connection_closed();
            });
        }

        self.ctx.registry.close_all();
        self.relay.close_all().await;
        log::info!("Chat node {} stopped", self.local_addr);
        Ok(())
    }

    /// Bound socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address published for users connected here.
    pub fn advertise_addr(&self) -> &str {
        self.ctx.router.self_addr()
    }

    /// Cancelling this token stops the accept loop and closes every
    /// connection and relay link.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.ctx.shutdown.clone()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.ctx.registry
    }

    pub fn router(&self) -> &Arc<NodeRouter> {
        &self.ctx.router
    }

    /// Shared counters; the `Arc` stays valid after `run` consumes the node.
    pub fn stats_handle(&self) -> Arc<AtomicNodeStats> {
        self.ctx.stats.clone()
    }

    pub fn stats(&self) -> NodeStats {
        self.ctx.stats.snapshot()
    }
}

/// Address published to presence for users on this node.
///
/// A wildcard bind is not dialable from other nodes, so it falls back to
/// this machine's hostname.
fn advertise_addr(
    configured: Option<&str>,
    local_addr: SocketAddr,
    hostname: Option<String>,
) -> Result<String, NodeError> {
    if let Some(addr) = configured {
        return Ok(addr.to_string());
    }
    if !local_addr.ip().is_unspecified() {
        return Ok(format!("ws://{local_addr}"));
    }
    match hostname {
        Some(host) => Ok(format!("ws://{host}:{}", local_addr.port())),
        None => Err(NodeError::NoAdvertiseAddr { bind: local_addr }),
    }
}

fn local_hostname() -> Option<String> {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::MemoryPresence;
    use crate::storage::MemoryStore;

    #[tokio::test]
    async fn test_start_binds_ephemeral_port() {
        let node = ChatNode::start(
            NodeConfig::for_testing(),
            Arc::new(MemoryPresence::new()),
            Arc::new(MemoryStore::new()),
        )
        .await
        .unwrap();

        assert_ne!(node.local_addr().port(), 0);
        assert_eq!(node.advertise_addr(), format!("ws://{}", node.local_addr()));
        assert_eq!(node.stats(), NodeStats::default());
    }

    #[tokio::test]
    async fn test_explicit_advertise_addr() {
        let config = NodeConfig {
            advertise_addr: Some("ws://chat-1.internal:8080".into()),
            ..NodeConfig::for_testing()
        };
        let node = ChatNode::start(
            config,
            Arc::new(MemoryPresence::new()),
            Arc::new(MemoryStore::new()),
        )
        .await
        .unwrap();
        assert_eq!(node.advertise_addr(), "ws://chat-1.internal:8080");
    }

    #[test]
    fn test_advertise_addr_derivation() {
        let wildcard: SocketAddr = "0.0.0.0:8080".parse().unwrap();
        let loopback: SocketAddr = "127.0.0.1:9000".parse().unwrap();

        assert_eq!(
            advertise_addr(Some("ws://chat-1:8080"), wildcard, None).unwrap(),
            "ws://chat-1:8080"
        );
        assert_eq!(
            advertise_addr(None, loopback, Some("chat-2".into())).unwrap(),
            "ws://127.0.0.1:9000"
        );
        assert_eq!(
            advertise_addr(None, wildcard, Some("chat-2".into())).unwrap(),
            "ws://chat-2:8080"
        );
        assert!(matches!(
            advertise_addr(None, wildcard, None),
            Err(NodeError::NoAdvertiseAddr { .. })
        ));
    }

    #[tokio::test]
    async fn test_wildcard_bind_never_advertises_unspecified_ip() {
        let config = NodeConfig {
            bind_addr: "0.0.0.0:0".into(),
            ..NodeConfig::for_testing()
        };
        let result = ChatNode::start(
            config,
            Arc::new(MemoryPresence::new()),
            Arc::new(MemoryStore::new()),
        )
        .await;

        match (result, local_hostname()) {
            (Ok(node), Some(host)) => {
                let port = node.local_addr().port();
                assert_eq!(node.advertise_addr(), format!("ws://{host}:{port}"));
                assert!(!node.advertise_addr().contains("0.0.0.0"));
            }
            (Err(e), None) => assert!(matches!(e, NodeError::NoAdvertiseAddr { .. })),
            (Ok(node), None) => panic!("advertised {} without a hostname", node.advertise_addr()),
            (Err(e), Some(_)) => panic!("start failed: {e}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_presence_is_fatal() {
        let presence = Arc::new(MemoryPresence::new());
        presence.set_unavailable(true);
        let result =
            ChatNode::start(NodeConfig::for_testing(), presence, Arc::new(MemoryStore::new())).await;
        assert!(matches!(result, Err(NodeError::Presence(_))));
    }

    #[tokio::test]
    async fn test_unusable_store_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        store.set_failing(true);
        let result =
            ChatNode::start(NodeConfig::for_testing(), Arc::new(MemoryPresence::new()), store).await;
        assert!(matches!(result, Err(NodeError::Store(_))));
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let first = ChatNode::start(
            NodeConfig::for_testing(),
            Arc::new(MemoryPresence::new()),
            Arc::new(MemoryStore::new()),
        )
        .await
        .unwrap();
        let config = NodeConfig {
            bind_addr: first.local_addr().to_string(),
            ..NodeConfig::for_testing()
        };
        let result = ChatNode::start(
            config,
            Arc::new(MemoryPresence::new()),
            Arc::new(MemoryStore::new()),
        )
        .await;
        assert!(matches!(result, Err(NodeError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_shutdown_stops_run() {
        let node = ChatNode::start(
            NodeConfig::for_testing(),
            Arc::new(MemoryPresence::new()),
            Arc::new(MemoryStore::new()),
        )
        .await
        .unwrap();
        let shutdown = node.shutdown_token();
        let task = tokio::spawn(node.run());
        shutdown.cancel();
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
