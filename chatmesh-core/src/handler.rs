//! Per-connection protocol state machine.
//!
//! ```text
//!                       handshake                     close / error / cancel
//!  AwaitingHandshake ─────────────► Identified ──────────────────────────────► Closed
//!          │                         (register, publish, replay backlog,
//!          │                          then append + deliver per frame)
//!          │ message
//!          └──────────────────────► Relaying ────────────────────────────────► Closed
//!                                    (append-if-absent + deliver_local per frame)
//! ```
//!
//! The first frame decides what the peer is: a client introduces itself
//! with a handshake, another node's relay link starts straight with a
//! message. Identified connections get a dedicated writer task fed through
//! the connection handle, so a push from any task never touches the
//! socket directly.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::presence::PresenceDirectory;
use crate::protocol::{Frame, Message, ProtocolError};
use crate::registry::{ConnectionHandle, ConnectionRegistry, Outbound};
use crate::router::NodeRouter;
use crate::stats::AtomicNodeStats;
use crate::storage::{collect_backlog, MessageStore};

const CLOSE_GRACE: Duration = Duration::from_secs(1);

type WsSink<S> = SplitSink<WebSocketStream<S>, WsMessage>;
type WsSource<S> = SplitStream<WebSocketStream<S>>;

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerState {
    AwaitingHandshake,
    Identified { user: String },
    Relaying,
    Closed,
}

/// Node-wide collaborators every handler works with.
pub struct HandlerContext {
    pub config: NodeConfig,
    pub registry: Arc<ConnectionRegistry>,
    pub presence: Arc<dyn PresenceDirectory>,
    pub store: Arc<dyn MessageStore>,
    pub router: Arc<NodeRouter>,
    pub stats: Arc<AtomicNodeStats>,
    /// Fires on node shutdown; every connection token is a child of it.
    pub shutdown: CancellationToken,
}

/// Drives one accepted WebSocket from first frame to teardown.
pub struct ProtocolHandler {
    ctx: Arc<HandlerContext>,
    peer: String,
    state: HandlerState,
}

impl ProtocolHandler {
    pub fn new(ctx: Arc<HandlerContext>, peer: impl Into<String>) -> Self {
        Self {
            ctx,
            peer: peer.into(),
            state: HandlerState::AwaitingHandshake,
        }
    }

    pub fn state(&self) -> &HandlerState {
        &self.state
    }

    /// Serve the connection until it ends. Always leaves the handler
    /// `Closed`, with its registry entry and socket released.
    pub async fn run<S>(&mut self, ws: WebSocketStream<S>) -> Result<(), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let result = self.dispatch(ws).await;
        self.state = HandlerState::Closed;
        result
    }

    async fn dispatch<S>(&mut self, ws: WebSocketStream<S>) -> Result<(), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut source) = ws.split();

        let first = tokio::select! {
            _ = self.ctx.shutdown.cancelled() => Ok(None),
            first = read_payload(&mut source) => first,
        };
        let bytes = match first {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                log::debug!("{} closed before its first frame", self.peer);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        self.ctx.stats.frame_received();

        match Frame::decode(&bytes) {
            Ok(Frame::Handshake { username }) => self.run_identified(username, sink, source).await,
            Ok(Frame::Message(message)) => self.run_relaying(message, sink, source).await,
            Err(e) => {
                log::warn!("Rejecting {}: undecodable first frame: {e}", self.peer);
                let _ = sink.close().await;
                Err(e)
            }
        }
    }

    // ─── Identified (client) ──────────────────────────────────────────

    async fn run_identified<S>(
        &mut self,
        user: String,
        sink: WsSink<S>,
        mut source: WsSource<S>,
    ) -> Result<(), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ctx = self.ctx.clone();
        let cancel = ctx.shutdown.child_token();
        let (handle, outbound) =
            ConnectionHandle::new(user.clone(), ctx.config.outbound_capacity, cancel.clone());
        let handle = handle.with_push_timeout(ctx.config.push_timeout);
        let writer = tokio::spawn(write_loop(sink, outbound, cancel.clone()));

        ctx.registry.register(handle.clone());
        if let Err(e) = ctx.presence.publish(&user, ctx.router.self_addr()).await {
            log::error!("Failed to publish presence for {user}: {e}");
        }
        self.state = HandlerState::Identified { user: user.clone() };
        log::info!(
            "{user} connected from {} (connection #{})",
            self.peer,
            handle.conn_id()
        );

        if ctx.config.replay_backlog {
            self.replay_backlog(&user, &handle).await;
        }

        let result = self.read_loop(&user, &mut source, &cancel).await;

        // Teardown runs on every exit path of the read loop.
        cancel.cancel();
        let _ = writer.await;
        if ctx.registry.unregister(&user, &handle) && ctx.config.retract_on_disconnect {
            match ctx.presence.retract_if_owner(&user, ctx.router.self_addr()).await {
                Ok(true) => log::debug!("Retracted presence for {user}"),
                Ok(false) => log::debug!("Presence for {user} already points elsewhere"),
                Err(e) => log::warn!("Failed to retract presence for {user}: {e}"),
            }
        }
        log::info!("{user} disconnected (connection #{})", handle.conn_id());
        result
    }

    async fn read_loop<S>(
        &self,
        user: &str,
        source: &mut WsSource<S>,
        cancel: &CancellationToken,
    ) -> Result<(), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let idle = self.ctx.config.idle_timeout;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = read_payload_within(source, idle) => next?,
            };
            let Some(bytes) = next else {
                return Ok(());
            };
            self.ctx.stats.frame_received();

            match Frame::decode(&bytes) {
                Ok(Frame::Message(message)) => self.accept_from_client(user, message).await,
                Ok(Frame::Handshake { username }) => {
                    log::warn!("Ignoring repeated handshake ({username}) from {user}");
                }
                Err(e) => {
                    log::warn!("Closing {user}: undecodable frame: {e}");
                    return Err(e);
                }
            }
        }
    }

    /// Persist a client's message, then route it.
    async fn accept_from_client(&self, user: &str, mut message: Message) {
        if message.sender != user {
            if !message.sender.is_empty() {
                log::warn!("{user} sent a message claiming sender {}", message.sender);
            }
            message.sender = user.to_string();
        }
        // Ids are assigned by the store, never by clients.
        message.id = None;
        message.read = false;

        match self.ctx.store.append(&message) {
            Ok(id) => {
                message.id = Some(id);
                self.ctx.stats.message_persisted();
            }
            Err(e) => {
                self.ctx.stats.persist_failed();
                log::error!("Failed to persist message from {user} to {}: {e}", message.recipient);
            }
        }

        self.ctx.router.deliver(&message).await;
    }

    async fn replay_backlog(&self, user: &str, handle: &ConnectionHandle) {
        let backlog = collect_backlog(self.ctx.store.as_ref(), user);
        if backlog.is_empty() {
            return;
        }
        log::info!("Replaying {} unread messages to {user}", backlog.len());

        for message in backlog {
            let id = message.id;
            // A live delivery may have landed since the snapshot was taken.
            if id.is_some_and(|id| self.already_read(user, id)) {
                continue;
            }
            if let Err(e) = handle.push(message).await {
                log::debug!("Backlog replay to {user} stopped: {e}");
                return;
            }
            if let Some(id) = id {
                if let Err(e) = self.ctx.store.mark_read(user, id) {
                    log::warn!("Failed to mark replayed message {id} read: {e}");
                }
            }
        }
    }

    fn already_read(&self, user: &str, id: Uuid) -> bool {
        matches!(self.ctx.store.get(user, id), Ok(Some(stored)) if stored.read)
    }

    // ─── Relaying (inbound link from another node) ────────────────────

    async fn run_relaying<S>(
        &mut self,
        first: Message,
        mut sink: WsSink<S>,
        mut source: WsSource<S>,
    ) -> Result<(), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.state = HandlerState::Relaying;
        self.ctx.stats.relay_session_opened();
        log::debug!("Relay session from {}", self.peer);

        self.relay_step(first).await;

        let result = loop {
            let next = tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break Ok(()),
                next = read_payload(&mut source) => next,
            };
            match next {
                Ok(Some(bytes)) => {
                    self.ctx.stats.frame_received();
                    match Frame::decode(&bytes).and_then(Frame::into_message) {
                        Ok(message) => self.relay_step(message).await,
                        Err(e) => {
                            log::warn!("Closing relay session from {}: {e}", self.peer);
                            break Err(e);
                        }
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        let _ = sink.close().await;
        log::debug!("Relay session from {} ended", self.peer);
        result
    }

    /// The sending node persisted already; with a shared store this append
    /// finds the row and changes nothing.
    async fn relay_step(&self, mut message: Message) {
        match self.ctx.store.append(&message) {
            Ok(id) => message.id = Some(id),
            Err(e) => {
                self.ctx.stats.persist_failed();
                log::error!("Failed to persist relayed message for {}: {e}", message.recipient);
            }
        }
        self.ctx.router.deliver_local(&message).await;
    }
}

/// Owns the socket's write half for an identified connection.
async fn write_loop<S>(
    mut sink: WsSink<S>,
    mut outbound: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let out = tokio::select! {
            _ = cancel.cancelled() => break,
            out = outbound.recv() => match out {
                Some(out) => out,
                None => break,
            },
        };

        let encoded = match Frame::message(out.message).encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                log::error!("Failed to encode outbound message: {e}");
                continue;
            }
        };
        let sent = tokio::select! {
            _ = cancel.cancelled() => break,
            sent = sink.send(WsMessage::Text(encoded.into())) => sent,
        };
        if let Err(e) = sent {
            log::debug!("Socket write failed: {e}");
            cancel.cancel();
            break;
        }
        let _ = out.written.send(());
    }
    // A client that stopped reading may never accept the close frame.
    let _ = tokio::time::timeout(CLOSE_GRACE, sink.close()).await;
}

/// Next text or binary payload; `None` once the peer closed.
async fn read_payload<S>(source: &mut WsSource<S>) -> Result<Option<Vec<u8>>, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = source.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => return Ok(Some(text.as_bytes().to_vec())),
            Ok(WsMessage::Binary(data)) => return Ok(Some(data.to_vec())),
            Ok(WsMessage::Close(_)) => return Ok(None),
            Ok(_) => {}
            Err(e) => return Err(ProtocolError::Transport(e.to_string())),
        }
    }
    Ok(None)
}

async fn read_payload_within<S>(
    source: &mut WsSource<S>,
    idle: Option<Duration>,
) -> Result<Option<Vec<u8>>, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match idle {
        Some(limit) => tokio::time::timeout(limit, read_payload(source))
            .await
            .map_err(|_| ProtocolError::Timeout)?,
        None => read_payload(source).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::MemoryPresence;
    use crate::relay::RelayPool;
    use crate::storage::{Backlog, MemoryStore, StoreError};
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::protocol::Role;

    const SELF_ADDR: &str = "ws://node-a:8080";

    type ClientWs = WebSocketStream<DuplexStream>;
    type HandlerTask = JoinHandle<(HandlerState, Result<(), ProtocolError>)>;

    struct Fixture {
        ctx: Arc<HandlerContext>,
        presence: Arc<MemoryPresence>,
        store: Arc<MemoryStore>,
    }

    fn fixture_with(config: NodeConfig) -> Fixture {
        let presence = Arc::new(MemoryPresence::new());
        let store = Arc::new(MemoryStore::new());
        let ctx = context(config, presence.clone(), store.clone());
        Fixture {
            ctx,
            presence,
            store,
        }
    }

    fn context(
        config: NodeConfig,
        presence: Arc<MemoryPresence>,
        store: Arc<dyn MessageStore>,
    ) -> Arc<HandlerContext> {
        let registry = Arc::new(ConnectionRegistry::new());
        let stats = Arc::new(AtomicNodeStats::new());
        let shutdown = CancellationToken::new();
        let relay = Arc::new(RelayPool::new(Duration::from_secs(1), shutdown.clone()));
        let router = Arc::new(NodeRouter::new(
            SELF_ADDR,
            registry.clone(),
            presence.clone(),
            store.clone(),
            relay,
            stats.clone(),
        ));
        Arc::new(HandlerContext {
            config,
            registry,
            presence,
            store,
            router,
            stats,
            shutdown,
        })
    }

    fn fixture() -> Fixture {
        fixture_with(NodeConfig::for_testing())
    }

    /// Connect an in-memory client and spawn its handler.
    async fn open(
        ctx: &Arc<HandlerContext>,
    ) -> (ClientWs, HandlerTask) {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let (server, client) = tokio::join!(
            WebSocketStream::from_raw_socket(server_io, Role::Server, None),
            WebSocketStream::from_raw_socket(client_io, Role::Client, None),
        );
        let ctx = ctx.clone();
        let task = tokio::spawn(async move {
            let mut handler = ProtocolHandler::new(ctx, "test-peer");
            let result = handler.run(server).await;
            (handler.state().clone(), result)
        });
        (client, task)
    }

    async fn send(ws: &mut ClientWs, frame: Frame) {
        ws.send(WsMessage::Text(frame.encode().unwrap().into()))
            .await
            .unwrap();
    }

    async fn recv(ws: &mut ClientWs) -> Message {
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a push")
            .expect("stream ended")
            .expect("websocket error");
        match frame {
            WsMessage::Text(text) => Frame::decode(text.as_bytes())
                .unwrap()
                .into_message()
                .unwrap(),
            other => panic!("Expected text frame, got {other:?}"),
        }
    }

    async fn eventually<F: FnMut() -> bool>(mut check: F) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    async fn handshake(ctx: &Arc<HandlerContext>, user: &str) -> (ClientWs, HandlerTask) {
        let (mut ws, task) = open(ctx).await;
        send(&mut ws, Frame::handshake(user)).await;
        let registry = ctx.registry.clone();
        let user = user.to_string();
        eventually(|| registry.lookup(&user).is_some()).await;
        (ws, task)
    }

    #[tokio::test]
    async fn test_handshake_registers_and_publishes() {
        let f = fixture();
        let (mut ws, task) = handshake(&f.ctx, "alice").await;

        assert_eq!(
            f.presence.resolve("alice").await.unwrap().as_deref(),
            Some(SELF_ADDR)
        );

        ws.close(None).await.unwrap();
        let (state, result) = task.await.unwrap();
        assert_eq!(state, HandlerState::Closed);
        assert!(result.is_ok());
        assert!(f.ctx.registry.lookup("alice").is_none());
        assert_eq!(f.presence.resolve("alice").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_untagged_handshake_accepted() {
        let f = fixture();
        let (mut ws, _task) = open(&f.ctx).await;
        ws.send(WsMessage::Text(r#"{"username":"bob"}"#.into()))
            .await
            .unwrap();
        let registry = f.ctx.registry.clone();
        eventually(|| registry.lookup("bob").is_some()).await;
    }

    #[tokio::test]
    async fn test_message_to_offline_user_persisted_unread() {
        let f = fixture();
        let (mut alice, _task) = handshake(&f.ctx, "alice").await;

        let mut spoofed = Message::new("mallory", "bob", "hello bob");
        spoofed.read = true;
        spoofed.id = Some(Uuid::now_v7());
        send(&mut alice, Frame::message(spoofed.clone())).await;

        let store = f.store.clone();
        eventually(|| store.count("bob").unwrap() == 1).await;
        let stored = &f.store.history("bob").unwrap()[0];
        assert_eq!(stored.sender, "alice");
        assert_eq!(stored.content, "hello bob");
        assert!(!stored.read);
        assert_ne!(stored.id, spoofed.id);
        let stats = f.ctx.stats.clone();
        eventually(|| stats.snapshot().offline == 1).await;
    }

    #[tokio::test]
    async fn test_local_delivery_between_clients() {
        let f = fixture();
        let (mut alice, _a) = handshake(&f.ctx, "alice").await;
        let (mut bob, _b) = handshake(&f.ctx, "bob").await;

        send(&mut alice, Frame::message(Message::new("alice", "bob", "hi bob"))).await;
        let got = recv(&mut bob).await;
        assert_eq!(got.sender, "alice");
        assert_eq!(got.content, "hi bob");
        let id = got.id.expect("pushed messages carry their id");

        let store = f.store.clone();
        eventually(|| store.get("bob", id).unwrap().is_some_and(|m| m.read)).await;
        let stats = f.ctx.stats.clone();
        eventually(|| stats.snapshot().local_deliveries == 1).await;
    }

    #[tokio::test]
    async fn test_backlog_replayed_on_handshake() {
        let f = fixture();
        let first = f.store.append(&Message::new("alice", "bob", "one")).unwrap();
        let second = f.store.append(&Message::new("alice", "bob", "two")).unwrap();

        let (mut bob, _task) = handshake(&f.ctx, "bob").await;
        assert_eq!(recv(&mut bob).await.id, Some(first));
        assert_eq!(recv(&mut bob).await.id, Some(second));

        let store = f.store.clone();
        eventually(|| crate::storage::collect_backlog(store.as_ref(), "bob").is_empty()).await;
    }

    #[tokio::test]
    async fn test_backlog_replay_disabled() {
        let f = fixture_with(NodeConfig {
            replay_backlog: false,
            ..NodeConfig::for_testing()
        });
        let id = f.store.append(&Message::new("alice", "bob", "later")).unwrap();
        let (_bob, _task) = handshake(&f.ctx, "bob").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!f.store.get("bob", id).unwrap().unwrap().read);
    }

    #[tokio::test]
    async fn test_relay_session_delivers_locally() {
        // No replay: bob must see each message exactly once, from the relay.
        let f = fixture_with(NodeConfig {
            replay_backlog: false,
            ..NodeConfig::for_testing()
        });
        let (mut bob, _b) = handshake(&f.ctx, "bob").await;

        // Sending node already persisted it in the shared store.
        let mut relayed = Message::new("alice", "bob", "via relay");
        relayed.id = Some(f.store.append(&relayed).unwrap());

        let (mut link, task) = open(&f.ctx).await;
        send(&mut link, Frame::message(relayed.clone())).await;
        let second = Message::new("alice", "bob", "second").with_id(Uuid::now_v7());
        send(&mut link, Frame::message(second)).await;

        assert_eq!(recv(&mut bob).await.id, relayed.id);
        assert_eq!(recv(&mut bob).await.content, "second");

        // Re-append kept one row for the first message.
        assert_eq!(f.store.count("bob").unwrap(), 2);
        let store = f.store.clone();
        let id = relayed.id.unwrap();
        eventually(|| store.get("bob", id).unwrap().is_some_and(|m| m.read)).await;

        // Relay peers never register or publish.
        assert!(f.presence.resolve("alice").await.unwrap().is_none());
        assert_eq!(f.ctx.stats.snapshot().relay_sessions, 1);

        link.close(None).await.unwrap();
        let (state, result) = task.await.unwrap();
        assert_eq!(state, HandlerState::Closed);
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_newer_connection_supersedes_older() {
        let f = fixture();
        let (mut old, old_task) = handshake(&f.ctx, "carol").await;
        let old_id = f.ctx.registry.lookup("carol").unwrap().conn_id();

        let (mut new, _new_task) = open(&f.ctx).await;
        send(&mut new, Frame::handshake("carol")).await;
        let registry = f.ctx.registry.clone();
        eventually(|| registry.lookup("carol").is_some_and(|h| h.conn_id() != old_id)).await;

        // The old task exits and its stale cleanup leaves carol registered.
        let (state, _) = tokio::time::timeout(Duration::from_secs(2), old_task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, HandlerState::Closed);
        assert!(f.ctx.registry.lookup("carol").is_some());
        assert_eq!(
            f.presence.resolve("carol").await.unwrap().as_deref(),
            Some(SELF_ADDR)
        );

        // The superseded socket is closed from the server side.
        let end = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match old.next().await {
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(end.is_ok());

        send(&mut new, Frame::message(Message::new("carol", "carol", "note to self"))).await;
        assert_eq!(recv(&mut new).await.content, "note to self");
    }

    #[tokio::test]
    async fn test_garbage_first_frame_rejected() {
        let f = fixture();
        let (mut ws, task) = open(&f.ctx).await;
        ws.send(WsMessage::Text("not json".into())).await.unwrap();

        let (state, result) = task.await.unwrap();
        assert_eq!(state, HandlerState::Closed);
        assert!(matches!(result, Err(ProtocolError::DeserializationError(_))));
        assert!(f.ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_decode_error_ends_identified_loop() {
        let f = fixture();
        let (mut alice, task) = handshake(&f.ctx, "alice").await;
        alice.send(WsMessage::Text("{}".into())).await.unwrap();

        let (_, result) = task.await.unwrap();
        assert!(result.is_err());
        assert!(f.ctx.registry.lookup("alice").is_none());
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_connection() {
        let f = fixture_with(NodeConfig {
            idle_timeout: Some(Duration::from_millis(50)),
            ..NodeConfig::for_testing()
        });
        let (_alice, task) = handshake(&f.ctx, "alice").await;

        let (_, result) = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(ProtocolError::Timeout));
        assert!(f.ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let f = fixture();
        let (_alice, a) = handshake(&f.ctx, "alice").await;
        let (_link, r) = open(&f.ctx).await;

        f.ctx.shutdown.cancel();
        let (state_a, _) = a.await.unwrap();
        let (state_r, _) = r.await.unwrap();
        assert_eq!(state_a, HandlerState::Closed);
        assert_eq!(state_r, HandlerState::Closed);
        assert!(f.ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_stalled_recipient_does_not_block_sender() {
        let f = fixture_with(NodeConfig {
            push_timeout: Duration::from_millis(200),
            ..NodeConfig::for_testing()
        });
        let (mut alice, _a) = handshake(&f.ctx, "alice").await;
        // bob never reads; his socket buffer fills after a couple of frames.
        let (_bob, _b) = handshake(&f.ctx, "bob").await;
        let (mut carol, _c) = handshake(&f.ctx, "carol").await;

        let bulky = "x".repeat(32 * 1024);
        for _ in 0..8 {
            send(&mut alice, Frame::message(Message::new("alice", "bob", bulky.clone()))).await;
        }
        send(&mut alice, Frame::message(Message::new("alice", "carol", "hello carol"))).await;

        assert_eq!(recv(&mut carol).await.content, "hello carol");
        let stats = f.ctx.stats.clone();
        eventually(|| stats.snapshot().messages_persisted == 9).await;
        assert!(stats.snapshot().offline >= 1);

        // The stalled client is dropped; the sender stays connected.
        let registry = f.ctx.registry.clone();
        eventually(|| registry.lookup("bob").is_none()).await;
        assert!(f.ctx.registry.lookup("alice").is_some());
    }

    #[tokio::test]
    async fn test_persist_failure_still_delivers() {
        let f = fixture();
        let (mut alice, _a) = handshake(&f.ctx, "alice").await;
        let (mut bob, _b) = handshake(&f.ctx, "bob").await;

        f.store.set_failing(true);
        send(&mut alice, Frame::message(Message::new("alice", "bob", "unsaved"))).await;
        let got = recv(&mut bob).await;
        assert_eq!(got.content, "unsaved");
        assert!(got.id.is_none());
        assert_eq!(f.ctx.stats.snapshot().persist_failures, 1);

        // The sender's connection survives the failed write.
        f.store.set_failing(false);
        send(&mut alice, Frame::message(Message::new("alice", "bob", "saved"))).await;
        assert_eq!(recv(&mut bob).await.content, "saved");
        assert!(f.ctx.registry.lookup("alice").is_some());
        assert_eq!(f.store.count("bob").unwrap(), 1);
    }

    /// Hands out an unread snapshot, then marks its first entry read as if
    /// a live delivery landed before the replay reached it.
    struct LiveDeliveryRace {
        inner: MemoryStore,
    }

    impl MessageStore for LiveDeliveryRace {
        fn append(&self, message: &Message) -> Result<Uuid, StoreError> {
            self.inner.append(message)
        }

        fn mark_read(&self, recipient: &str, id: Uuid) -> Result<bool, StoreError> {
            self.inner.mark_read(recipient, id)
        }

        fn fetch_unread(&self, recipient: &str) -> Result<Option<Backlog<'_>>, StoreError> {
            let snapshot = collect_backlog(&self.inner, recipient);
            if let Some(id) = snapshot.first().and_then(|m| m.id) {
                self.inner.mark_read(recipient, id)?;
            }
            Ok(Some(Box::new(snapshot.into_iter().map(Ok))))
        }

        fn get(&self, recipient: &str, id: Uuid) -> Result<Option<Message>, StoreError> {
            self.inner.get(recipient, id)
        }

        fn history(&self, recipient: &str) -> Result<Vec<Message>, StoreError> {
            self.inner.history(recipient)
        }
    }

    #[tokio::test]
    async fn test_backlog_skips_messages_delivered_live() {
        let store = Arc::new(LiveDeliveryRace {
            inner: MemoryStore::new(),
        });
        store.append(&Message::new("alice", "bob", "already seen")).unwrap();
        let pending = store.append(&Message::new("alice", "bob", "pending")).unwrap();
        let ctx = context(
            NodeConfig::for_testing(),
            Arc::new(MemoryPresence::new()),
            store.clone(),
        );

        let (mut bob, _task) = handshake(&ctx, "bob").await;
        let got = recv(&mut bob).await;
        assert_eq!(got.id, Some(pending));
        assert_eq!(got.content, "pending");

        // Nothing else follows the one pending message.
        let extra = tokio::time::timeout(Duration::from_millis(100), bob.next()).await;
        assert!(extra.is_err());
    }
}
