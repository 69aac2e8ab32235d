//! Client-side relay connection.
//!
//! `RelayClient` manages one persistent WebSocket to the relay, reconnecting
//! with exponential backoff after an established connection drops. Inbound
//! events are dispatched to token-keyed handlers in the order the transport
//! delivered them.
//!
//! Known gap: group memberships are NOT replayed after a reconnect. The
//! server keeps membership only for the lifetime of a connection, and this
//! client mirrors that. Callers that want to stay in a group across
//! reconnects must issue `join_group` again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::protocol::{ClientRequest, ServerEvent};
use crate::types::{ChatMessage, MessageId, TypingEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

type MessageHandler = Arc<dyn Fn(ChatMessage) + Send + Sync>;
type TypingHandler = Arc<dyn Fn(TypingEvent) + Send + Sync>;
type DeletionHandler = Arc<dyn Fn(MessageId) + Send + Sync>;

/// Connection lifecycle of a [`RelayClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Error)]
pub enum ClientError {
    /// The initial handshake failed. Only `connect()` surfaces this;
    /// reconnection after an established connection drops is automatic.
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },
}

#[derive(Default)]
struct Handlers {
    message: RwLock<HashMap<String, MessageHandler>>,
    typing: RwLock<HashMap<String, TypingHandler>>,
    deletion: RwLock<HashMap<String, DeletionHandler>>,
}

/// Handle to one resilient relay connection. Cheap to clone; clones share
/// the connection, state, and handler registry.
#[derive(Clone)]
pub struct RelayClient {
    url: String,
    reconnect_base: Duration,
    reconnect_max: Duration,
    ping_interval: Duration,
    state: Arc<Mutex<ClientState>>,
    outbound: Arc<RwLock<Option<mpsc::UnboundedSender<ClientRequest>>>>,
    handlers: Arc<Handlers>,
    cancel: Arc<Mutex<CancellationToken>>,
    /// Bumped on every successful `connect()`; stale io tasks use it to
    /// avoid clobbering the state of a newer session.
    session: Arc<AtomicU64>,
}

impl RelayClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_config(url, &RelayConfig::default())
    }

    pub fn with_config(url: impl Into<String>, config: &RelayConfig) -> Self {
        Self {
            url: url.into(),
            reconnect_base: Duration::from_millis(config.reconnect_base_ms.max(1)),
            reconnect_max: Duration::from_millis(config.reconnect_max_ms.max(1)),
            ping_interval: Duration::from_millis(config.ping_interval_ms.max(1)),
            state: Arc::new(Mutex::new(ClientState::Disconnected)),
            outbound: Arc::new(RwLock::new(None)),
            handlers: Arc::new(Handlers::default()),
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
            session: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn state(&self) -> ClientState {
        *self.state.lock().await
    }

    /// Open the connection. Idempotent: calling while already connected (or
    /// mid-connect) is a no-op. A handshake failure is returned to the
    /// caller and is not retried; automatic reconnection only applies to
    /// connections that drop after having been established.
    pub async fn connect(&self) -> Result<(), ClientError> {
        {
            let mut state = self.state.lock().await;
            if *state != ClientState::Disconnected {
                tracing::debug!(state = ?*state, "connect() is a no-op in this state");
                return Ok(());
            }
            *state = ClientState::Connecting;
        }

        let stream = match connect_async(self.url.as_str()).await {
            Ok((stream, _response)) => stream,
            Err(e) => {
                *self.state.lock().await = ClientState::Disconnected;
                return Err(ClientError::Connect {
                    url: self.url.clone(),
                    source: e,
                });
            }
        };

        let cancel = CancellationToken::new();
        *self.cancel.lock().await = cancel.clone();
        let session = self.session.fetch_add(1, Ordering::SeqCst) + 1;
        *self.state.lock().await = ClientState::Connected;
        tracing::info!(url = %self.url, "relay connection established");

        let client = self.clone();
        tokio::spawn(async move { client.run(stream, cancel, session).await });
        Ok(())
    }

    /// Tear the connection down. Unconditional: always leaves the client
    /// Disconnected, never errors. Registered handlers stay registered.
    pub async fn disconnect(&self) {
        self.cancel.lock().await.cancel();
        self.outbound.write().await.take();
        *self.state.lock().await = ClientState::Disconnected;
        tracing::info!(url = %self.url, "relay client disconnected");
    }

    pub async fn join_group(&self, group_id: &str) {
        self.send(ClientRequest::JoinGroup {
            group_id: group_id.to_string(),
        })
        .await;
    }

    pub async fn leave_group(&self, group_id: &str) {
        self.send(ClientRequest::LeaveGroup {
            group_id: group_id.to_string(),
        })
        .await;
    }

    pub async fn send_message(&self, group_id: &str, message: ChatMessage) {
        self.send(ClientRequest::SendMessage {
            group_id: group_id.to_string(),
            message,
        })
        .await;
    }

    pub async fn typing_started(&self, group_id: &str, author_identity: &str) {
        self.send(ClientRequest::UserTyping {
            group_id: group_id.to_string(),
            author_identity: author_identity.to_string(),
        })
        .await;
    }

    pub async fn typing_stopped(&self, group_id: &str, author_identity: &str) {
        self.send(ClientRequest::UserStoppedTyping {
            group_id: group_id.to_string(),
            author_identity: author_identity.to_string(),
        })
        .await;
    }

    pub async fn delete_message(&self, group_id: &str, message_id: &str) {
        self.send(ClientRequest::DeleteMessage {
            group_id: group_id.to_string(),
            message_id: message_id.to_string(),
        })
        .await;
    }

    /// Register a chat-message handler under a stable subscription key.
    /// Registering the same key again replaces the previous handler, so a
    /// key delivers each event exactly once.
    pub async fn on_message(
        &self,
        key: impl Into<String>,
        handler: impl Fn(ChatMessage) + Send + Sync + 'static,
    ) {
        self.handlers
            .message
            .write()
            .await
            .insert(key.into(), Arc::new(handler));
    }

    pub async fn off_message(&self, key: &str) {
        self.handlers.message.write().await.remove(key);
    }

    /// Register a typing-presence handler; fires for both start and stop.
    pub async fn on_typing(
        &self,
        key: impl Into<String>,
        handler: impl Fn(TypingEvent) + Send + Sync + 'static,
    ) {
        self.handlers
            .typing
            .write()
            .await
            .insert(key.into(), Arc::new(handler));
    }

    pub async fn off_typing(&self, key: &str) {
        self.handlers.typing.write().await.remove(key);
    }

    pub async fn on_message_deleted(
        &self,
        key: impl Into<String>,
        handler: impl Fn(MessageId) + Send + Sync + 'static,
    ) {
        self.handlers
            .deletion
            .write()
            .await
            .insert(key.into(), Arc::new(handler));
    }

    pub async fn off_message_deleted(&self, key: &str) {
        self.handlers.deletion.write().await.remove(key);
    }

    /// Best-effort send. When no connection is installed the request is
    /// dropped with a log line; callers never see an error for transient
    /// unavailability.
    async fn send(&self, request: ClientRequest) {
        let outbound = self.outbound.read().await;
        match outbound.as_ref() {
            Some(tx) => {
                if tx.send(request).is_err() {
                    tracing::debug!("relay connection closing, request dropped");
                }
            }
            None => tracing::debug!("not connected, request dropped"),
        }
    }

    /// Session task: drive the current socket until it drops, then keep
    /// reconnecting until the session is cancelled.
    async fn run(self, first: WsStream, cancel: CancellationToken, session: u64) {
        let mut stream = Some(first);

        loop {
            let ws = match stream.take() {
                Some(ws) => ws,
                None => match self.reconnect(&cancel).await {
                    Some(ws) => ws,
                    None => break,
                },
            };

            if cancel.is_cancelled() {
                break;
            }
            *self.state.lock().await = ClientState::Connected;
            self.drive(ws, &cancel, session).await;

            if cancel.is_cancelled() {
                break;
            }
            *self.state.lock().await = ClientState::Reconnecting;
            tracing::warn!(url = %self.url, "relay connection lost, reconnecting");
        }

        if self.session.load(Ordering::SeqCst) == session {
            self.outbound.write().await.take();
            *self.state.lock().await = ClientState::Disconnected;
        }
    }

    /// Re-establish the transport with exponential backoff plus jitter.
    /// Returns None when the session was cancelled while waiting.
    async fn reconnect(&self, cancel: &CancellationToken) -> Option<WsStream> {
        let mut delay = self.reconnect_base;

        loop {
            let jitter_ceiling = (delay.as_millis() as u64 / 4).max(1);
            let jitter = Duration::from_millis(rand::rng().random_range(0..jitter_ceiling));

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = sleep(delay + jitter) => {}
            }

            let attempt = tokio::select! {
                _ = cancel.cancelled() => return None,
                attempt = connect_async(self.url.as_str()) => attempt,
            };

            match attempt {
                Ok((stream, _response)) => {
                    tracing::info!(url = %self.url, "relay connection re-established");
                    return Some(stream);
                }
                Err(e) => {
                    tracing::debug!(url = %self.url, "reconnect attempt failed: {}", e);
                    delay = (delay * 2).min(self.reconnect_max);
                }
            }
        }
    }

    /// Pump one established socket: writer queue out, inbound frames to the
    /// dispatcher, keepalive pings on an interval. Returns when the socket
    /// dies or the session is cancelled.
    async fn drive(&self, ws: WsStream, cancel: &CancellationToken, session: u64) {
        let (mut write, mut read) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientRequest>();

        {
            let mut outbound = self.outbound.write().await;
            if self.session.load(Ordering::SeqCst) != session {
                return;
            }
            outbound.replace(out_tx);
        }

        let mut ping = tokio::time::interval(self.ping_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(tungstenite::Message::Close(None)).await;
                    break;
                }

                request = out_rx.recv() => {
                    match request {
                        Some(request) => match serde_json::to_string(&request) {
                            Ok(json) => {
                                if write.send(tungstenite::Message::Text(json.into())).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => tracing::error!("failed to encode request: {}", e),
                        },
                        None => break,
                    }
                }

                _ = ping.tick() => {
                    if write.send(tungstenite::Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }

                frame = read.next() => {
                    match frame {
                        Some(Ok(tungstenite::Message::Text(text))) => self.dispatch(&text).await,
                        Some(Ok(tungstenite::Message::Close(_))) => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::debug!("relay read error: {}", e);
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
    }

    /// Decode one server frame and invoke the matching handlers, in the
    /// order the transport delivered the frames.
    async fn dispatch(&self, text: &str) {
        let event = match serde_json::from_str::<ServerEvent>(text) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!("ignoring unrecognized server frame: {}", e);
                return;
            }
        };

        match event {
            ServerEvent::ReceiveMessage { message } => {
                let handlers: Vec<MessageHandler> =
                    self.handlers.message.read().await.values().cloned().collect();
                for handler in handlers {
                    handler(message.clone());
                }
            }
            ServerEvent::UserTyping { author_identity } => {
                self.dispatch_typing(TypingEvent {
                    author: author_identity,
                    is_typing: true,
                })
                .await;
            }
            ServerEvent::UserStoppedTyping { author_identity } => {
                self.dispatch_typing(TypingEvent {
                    author: author_identity,
                    is_typing: false,
                })
                .await;
            }
            ServerEvent::MessageDeleted { message_id } => {
                let handlers: Vec<DeletionHandler> = self
                    .handlers
                    .deletion
                    .read()
                    .await
                    .values()
                    .cloned()
                    .collect();
                for handler in handlers {
                    handler(message_id.clone());
                }
            }
            ServerEvent::Error { code, msg } => {
                tracing::warn!(code, msg, "relay server reported an error");
            }
        }
    }

    async fn dispatch_typing(&self, event: TypingEvent) {
        let handlers: Vec<TypingHandler> =
            self.handlers.typing.read().await.values().cloned().collect();
        for handler in handlers {
            handler(event.clone());
        }
    }
}
