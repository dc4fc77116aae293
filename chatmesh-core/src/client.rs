//! WebSocket chat client.
//!
//! Provides:
//! - Connection lifecycle (connect + handshake, disconnect)
//! - Sending direct messages
//! - An event stream of pushed messages
//! - Offline queue for messages sent while disconnected

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::protocol::{Frame, Message, ProtocolError};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the chat client.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// Connection established and handshake sent
    Connected,
    /// A message pushed by the server (live or backlog replay)
    Message(Message),
    /// Connection lost
    Disconnected,
}

/// Messages composed while disconnected, replayed on connect.
pub struct OfflineQueue {
    queue: VecDeque<Message>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a message. Returns `false` when the queue is full.
    pub fn enqueue(&mut self, message: Message) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(message);
        true
    }

    pub fn drain(&mut self) -> Vec<Message> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// A chat user's connection to one node.
pub struct ChatClient {
    username: String,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    /// Feeds the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,
    event_rx: Option<mpsc::Receiver<ChatEvent>>,
    event_tx: mpsc::Sender<ChatEvent>,
}

impl ChatClient {
    pub fn new(username: impl Into<String>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            username: username.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ChatEvent>> {
        self.event_rx.take()
    }

    /// Connect, identify, then flush the offline queue.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // The handshake must be the first frame on the socket.
        out_tx
            .send(Frame::handshake(self.username.clone()).encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        let queued = self.offline_queue.lock().await.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued messages", queued.len());
            for message in queued {
                out_tx
                    .send(Frame::message(message).encode()?)
                    .await
                    .map_err(|_| ProtocolError::ConnectionClosed)?;
            }
        }
        self.outgoing_tx = Some(out_tx);

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ChatEvent::Connected).await;

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                let bytes = match frame {
                    Ok(WsMessage::Text(text)) => text.as_bytes().to_vec(),
                    Ok(WsMessage::Binary(data)) => data.to_vec(),
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match Frame::decode(&bytes).and_then(Frame::into_message) {
                    Ok(message) => {
                        let _ = event_tx.send(ChatEvent::Message(message)).await;
                    }
                    Err(e) => log::warn!("Ignoring undecodable frame from server: {e}"),
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ChatEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Send a direct message; queued for later while disconnected.
    pub async fn send_message(
        &self,
        recipient: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<(), ProtocolError> {
        let message = Message::new(self.username.clone(), recipient, content);

        let state = *self.state.read().await;
        let tx = match (&self.outgoing_tx, state) {
            (Some(tx), ConnectionState::Connected) => tx,
            _ => {
                let mut queue = self.offline_queue.lock().await;
                if !queue.enqueue(message) {
                    return Err(ProtocolError::ConnectionClosed);
                }
                return Ok(());
            }
        };

        tx.send(Frame::message(message).encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Close the connection. Queued-but-unsent frames are flushed first.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}
