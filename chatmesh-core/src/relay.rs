//! Outbound relay links to other nodes.
//!
//! ```text
//! NodeRouter ── send(addr, msg) ──► RelayPool ──► RelayLink(addr) ══ ws ══► remote /ws
//!                                      │               │
//!                                      │               └─ reader task: marks the link
//!                                      │                  closed on EOF / error
//!                                      └─ {addr → Arc<RelayLink>}
//! ```
//!
//! Links are created lazily on first use and reused for every later message
//! to the same node. A link that errors on send is dropped from the pool; a
//! link the remote closed is noticed by its reader task and replaced on the
//! next send. Nothing is retried here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::protocol::{Frame, Message, ProtocolError};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// Relay errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("Failed to connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },
    #[error("Timed out connecting to {0}")]
    ConnectTimeout(String),
    #[error("Relay send failed: {0}")]
    Send(String),
    #[error("Relay link closed")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Endpoint a node's relay listener is reached at.
pub fn relay_url(node_addr: &str) -> String {
    format!("{}/ws", node_addr.trim_end_matches('/'))
}

/// One outbound WebSocket to a remote node.
pub struct RelayLink {
    addr: String,
    sink: Mutex<WsSink>,
    closed: CancellationToken,
}

impl RelayLink {
    async fn connect(
        addr: &str,
        timeout: Duration,
        shutdown: &CancellationToken,
    ) -> Result<Arc<Self>, RelayError> {
        let url = relay_url(addr);
        let (ws_stream, _) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(&url))
            .await
            .map_err(|_| RelayError::ConnectTimeout(addr.to_string()))?
            .map_err(|e| RelayError::Connect {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        let (sink, mut stream) = ws_stream.split();

        let link = Arc::new(Self {
            addr: addr.to_string(),
            sink: Mutex::new(sink),
            closed: shutdown.child_token(),
        });

        // Relay links are one-way; the reader only watches for the end.
        let closed = link.closed.clone();
        let remote = link.addr.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    frame = stream.next() => match frame {
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::debug!("Relay link to {remote} errored: {e}");
                            break;
                        }
                        Some(Ok(_)) => {}
                    },
                }
            }
            closed.cancel();
            log::debug!("Relay link to {remote} closed");
        });

        log::info!("Opened relay link to {url}");
        Ok(link)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Write one message frame to the remote node.
    pub async fn send(&self, message: &Message) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }
        let encoded = Frame::message(message.clone()).encode()?;
        let mut sink = self.sink.lock().await;
        sink.send(WsMessage::Text(encoded.into()))
            .await
            .map_err(|e| RelayError::Send(e.to_string()))
    }

    /// Close the socket and stop the reader task.
    pub async fn close(&self) {
        self.closed.cancel();
        let _ = self.sink.lock().await.close().await;
    }
}

/// Cache of relay links keyed by remote node address.
pub struct RelayPool {
    links: RwLock<HashMap<String, Arc<RelayLink>>>,
    connect_timeout: Duration,
    shutdown: CancellationToken,
    opened: AtomicU64,
}

impl RelayPool {
    pub fn new(connect_timeout: Duration, shutdown: CancellationToken) -> Self {
        Self {
            links: RwLock::new(HashMap::new()),
            connect_timeout,
            shutdown,
            opened: AtomicU64::new(0),
        }
    }

    /// Open link to `addr`, connecting if there is none.
    pub async fn get_or_connect(&self, addr: &str) -> Result<Arc<RelayLink>, RelayError> {
        // Fast path: read lock
        {
            let links = self.links.read().await;
            if let Some(link) = links.get(addr).filter(|l| !l.is_closed()) {
                return Ok(link.clone());
            }
        }

        // Connect without holding the lock, relays to other nodes keep flowing.
        let fresh = RelayLink::connect(addr, self.connect_timeout, &self.shutdown).await?;

        let mut links = self.links.write().await;
        // Double-check: another task may have connected meanwhile.
        if let Some(existing) = links.get(addr).filter(|l| !l.is_closed()) {
            let existing = existing.clone();
            drop(links);
            fresh.close().await;
            return Ok(existing);
        }
        links.insert(addr.to_string(), fresh.clone());
        self.opened.fetch_add(1, Ordering::Relaxed);
        Ok(fresh)
    }

    /// Send one message to the node at `addr`.
    ///
    /// On a transport error the link is dropped from the pool, so the next
    /// call reconnects.
    pub async fn send(&self, addr: &str, message: &Message) -> Result<(), RelayError> {
        let link = self.get_or_connect(addr).await?;
        if let Err(e) = link.send(message).await {
            log::warn!("Relay to {addr} failed: {e}");
            self.invalidate(addr, &link).await;
            return Err(e);
        }
        Ok(())
    }

    /// Drop `link` from the pool if it is still the cached one.
    pub async fn invalidate(&self, addr: &str, link: &Arc<RelayLink>) {
        let removed = {
            let mut links = self.links.write().await;
            match links.get(addr) {
                Some(current) if Arc::ptr_eq(current, link) => links.remove(addr),
                _ => None,
            }
        };
        if let Some(link) = removed {
            link.close().await;
        }
    }

    /// Whether an open link to `addr` is cached.
    pub async fn has_open_link(&self, addr: &str) -> bool {
        self.links
            .read()
            .await
            .get(addr)
            .is_some_and(|l| !l.is_closed())
    }

    /// Number of cached links (open or not yet reaped).
    pub async fn len(&self) -> usize {
        self.links.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.links.read().await.is_empty()
    }

    /// Links opened since start.
    pub fn links_opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    /// Close every link (node shutdown).
    pub async fn close_all(&self) {
        let links: Vec<Arc<RelayLink>> = self.links.write().await.drain().map(|(_, l)| l).collect();
        for link in links {
            link.close().await;
        }
    }
}
