//! Realtime transport to the chat backend.
//!
//! [`TransportClient`] owns at most one live WebSocket connection and at most
//! one pending connection attempt. Attempts run on their own task and report
//! back through a notify callback; the owner decides whether a late
//! `Connected` is attached or discarded.

use crate::error::TransportError;
use crate::protocol::ClientFrame;
use crate::token::Token;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

/// Close code used for every client-initiated close.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Reported when the peer vanished without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

const CHAT_PATH: &str = "ws/chat/";

/// The chat endpoint derived from the backend base URL.
#[derive(Debug, Clone)]
pub struct Endpoint {
    base: Url,
    source: String,
}

impl Endpoint {
    /// Maps `http`/`https` to `ws`/`wss`; `ws`/`wss` are accepted as given.
    pub fn new(base_url: &str, source: impl Into<String>) -> Result<Self, TransportError> {
        let mut base =
            Url::parse(base_url).map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
        let scheme = match base.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(TransportError::InvalidEndpoint(format!(
                    "unsupported scheme `{other}`"
                )));
            }
        };
        base.set_scheme(scheme)
            .map_err(|_| TransportError::InvalidEndpoint(base_url.to_string()))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            base,
            source: source.into(),
        })
    }

    /// `<ws-base>/ws/chat/?token=<token>&source=<source>`
    pub fn url_for(&self, token: &Token) -> Result<Url, TransportError> {
        let mut url = self
            .base
            .join(CHAT_PATH)
            .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("token", token.expose())
            .append_pair("source", &self.source);
        Ok(url)
    }

    /// The chat URL without credentials, for logging.
    pub fn display_url(&self) -> String {
        self.base
            .join(CHAT_PATH)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| self.base.to_string())
    }
}

/// Bounded retry for opening the connection.
#[derive(Debug, Clone)]
pub struct ConnectPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// An attempt still opening after this long counts as failed.
    pub connect_timeout: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Frames queued towards the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// What the peer did.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Message(String),
    Closed { code: u16, reason: String },
    Failed(String),
}

/// An open connection, reduced to two channels.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Opens a connection to a fully-formed URL.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &Url) -> Result<Link, TransportError>;
}

/// [`Connector`] backed by `tokio-tungstenite`.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &Url) -> Result<Link, TransportError> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut sink, mut stream) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel::<LinkEvent>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outbound = out_rx.recv() => match outbound {
                        Some(Outbound::Text(text)) => {
                            if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                                let _ = ev_tx.send(LinkEvent::Failed(e.to_string()));
                                break;
                            }
                        }
                        Some(Outbound::Close { code, reason }) => {
                            let frame = CloseFrame {
                                code: CloseCode::from(code),
                                reason: reason.into(),
                            };
                            if let Err(e) = sink.send(WsMessage::Close(Some(frame))).await {
                                debug!("Close frame not delivered: {}", e);
                            }
                            break;
                        }
                        None => {
                            let _ = sink.close().await;
                            break;
                        }
                    },
                    incoming = stream.next() => match incoming {
                        Some(Ok(WsMessage::Text(text))) => {
                            let _ = ev_tx.send(LinkEvent::Message(text.to_string()));
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (u16::from(f.code), f.reason.to_string()))
                                .unwrap_or((NORMAL_CLOSURE, String::new()));
                            let _ = ev_tx.send(LinkEvent::Closed { code, reason });
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let _ = ev_tx.send(LinkEvent::Failed(e.to_string()));
                            break;
                        }
                        None => {
                            let _ = ev_tx.send(LinkEvent::Closed {
                                code: ABNORMAL_CLOSURE,
                                reason: "stream ended".to_string(),
                            });
                            break;
                        }
                    },
                }
            }
            debug!("WebSocket pump finished.");
        });

        Ok(Link {
            outbound: out_tx,
            events: ev_rx,
        })
    }
}

/// Identifies one connection attempt and the connection it produced.
pub type ConnectionId = u64;

/// Reported by the attempt task and the reader task.
#[derive(Debug)]
pub enum TransportEvent {
    Connected {
        connection: ConnectionId,
        link: Link,
        attempts: u32,
    },
    ConnectFailed {
        connection: ConnectionId,
        error: TransportError,
    },
    Closed {
        connection: ConnectionId,
        code: u16,
        reason: String,
    },
    Failed {
        connection: ConnectionId,
        error: TransportError,
    },
}

pub type TransportNotify = Arc<dyn Fn(TransportEvent) + Send + Sync>;

struct PendingAttempt {
    id: ConnectionId,
    cancel: CancellationToken,
}

struct Connection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Outbound>,
    reader: JoinHandle<()>,
}

/// Manages the connection lifecycle for one owner.
pub struct TransportClient {
    connector: Arc<dyn Connector>,
    endpoint: Endpoint,
    policy: ConnectPolicy,
    inbound: mpsc::UnboundedSender<String>,
    notify: TransportNotify,
    next_id: ConnectionId,
    pending: Option<PendingAttempt>,
    connection: Option<Connection>,
}

impl TransportClient {
    /// Inbound text frames are forwarded to `inbound` in arrival order.
    pub fn new(
        connector: Arc<dyn Connector>,
        endpoint: Endpoint,
        policy: ConnectPolicy,
        inbound: mpsc::UnboundedSender<String>,
        notify: TransportNotify,
    ) -> Self {
        Self {
            connector,
            endpoint,
            policy,
            inbound,
            notify,
            next_id: 0,
            pending: None,
            connection: None,
        }
    }

    /// Starts a bounded connection attempt in the background. Any earlier
    /// pending attempt is cancelled first.
    pub fn connect(&mut self, token: &Token) -> Result<ConnectionId, TransportError> {
        let url = self.endpoint.url_for(token)?;
        self.cancel_pending();

        self.next_id += 1;
        let id = self.next_id;
        let cancel = CancellationToken::new();
        self.pending = Some(PendingAttempt {
            id,
            cancel: cancel.clone(),
        });

        info!(
            "Opening chat connection to {} (attempt set #{})",
            self.endpoint.display_url(),
            id
        );
        let connector = self.connector.clone();
        let policy = self.policy.clone();
        let notify = self.notify.clone();
        tokio::spawn(async move {
            let max_attempts = policy.max_attempts.max(1);
            let mut last = String::new();
            for attempt in 1..=max_attempts {
                let open = tokio::time::timeout(policy.connect_timeout, connector.open(&url));
                let result = tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = open => result.unwrap_or_else(|_| {
                        Err(TransportError::Connect(format!(
                            "timed out after {:?}",
                            policy.connect_timeout
                        )))
                    }),
                };
                match result {
                    Ok(link) => {
                        if cancel.is_cancelled() {
                            return;
                        }
                        info!(attempt, "WebSocket connection established.");
                        notify(TransportEvent::Connected {
                            connection: id,
                            link,
                            attempts: attempt,
                        });
                        return;
                    }
                    Err(e) => {
                        warn!(attempt, max_attempts, "Connection attempt failed: {}", e);
                        last = e.to_string();
                    }
                }
                if attempt < max_attempts {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(policy.retry_delay) => {}
                    }
                }
            }
            error!(attempts = max_attempts, "All connection attempts failed.");
            notify(TransportEvent::ConnectFailed {
                connection: id,
                error: TransportError::ConnectExhausted {
                    attempts: max_attempts,
                    last,
                },
            });
        });
        Ok(id)
    }

    pub fn is_pending(&self, id: ConnectionId) -> bool {
        self.pending.as_ref().is_some_and(|p| p.id == id)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Cancels the in-flight attempt so it never reports `Connected`.
    pub fn cancel_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!(id = pending.id, "Cancelling pending connection attempt.");
            pending.cancel.cancel();
        }
    }

    /// Adopts the link produced by attempt `id` as the live connection.
    pub fn attach(&mut self, id: ConnectionId, link: Link) {
        if self.pending.as_ref().is_some_and(|p| p.id == id) {
            self.pending = None;
        }
        if let Some(old) = self.connection.take() {
            warn!(id = old.id, "Replacing a live connection.");
            Self::close_link(&old.outbound);
            old.reader.abort();
        }

        let Link {
            outbound,
            mut events,
        } = link;
        let inbound = self.inbound.clone();
        let notify = self.notify.clone();
        let reader = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    LinkEvent::Message(text) => {
                        if inbound.send(text).is_err() {
                            debug!("Dispatcher gone; dropping inbound frame.");
                        }
                    }
                    LinkEvent::Closed { code, reason } => {
                        notify(TransportEvent::Closed {
                            connection: id,
                            code,
                            reason,
                        });
                        return;
                    }
                    LinkEvent::Failed(e) => {
                        notify(TransportEvent::Failed {
                            connection: id,
                            error: TransportError::ConnectionLost(e),
                        });
                        return;
                    }
                }
            }
            notify(TransportEvent::Closed {
                connection: id,
                code: ABNORMAL_CLOSURE,
                reason: "connection dropped".to_string(),
            });
        });

        self.connection = Some(Connection {
            id,
            outbound,
            reader,
        });
    }

    /// Closes a link that arrived after it stopped being wanted.
    pub fn discard(&self, link: Link) {
        debug!("Discarding a connection nobody is waiting for.");
        Self::close_link(&link.outbound);
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Sends a recognized utterance. Nothing is queued when not connected.
    pub fn send(&self, text: &str) -> Result<(), TransportError> {
        let Some(connection) = &self.connection else {
            return Err(TransportError::Send("no open connection".to_string()));
        };
        let frame = ClientFrame::Transcription {
            data: text.to_string(),
        };
        connection
            .outbound
            .send(Outbound::Text(frame.to_json()))
            .map_err(|_| TransportError::Send("connection writer is gone".to_string()))
    }

    /// Announces the end of the chat and closes normally. Idempotent; without a
    /// live connection this only cancels a pending attempt.
    pub fn end_session(&mut self) {
        self.cancel_pending();
        let Some(connection) = self.connection.take() else {
            return;
        };
        info!("Ending chat session.");
        let end = ClientFrame::EndChat {
            data: Utc::now().timestamp_millis(),
        };
        if connection.outbound.send(Outbound::Text(end.to_json())).is_err() {
            debug!("end_chat not queued; writer already gone.");
        }
        let _ = connection.outbound.send(Outbound::Close {
            code: NORMAL_CLOSURE,
            reason: "user ended".to_string(),
        });
        connection.reader.abort();
    }

    /// Forgets connection `id` after the peer closed it. Returns `false` when
    /// `id` is not the live connection.
    pub fn on_closed(&mut self, id: ConnectionId) -> bool {
        if self.connection.as_ref().is_some_and(|c| c.id == id) {
            self.connection = None;
            true
        } else {
            false
        }
    }

    fn close_link(outbound: &mpsc::UnboundedSender<Outbound>) {
        let _ = outbound.send(Outbound::Close {
            code: NORMAL_CLOSURE,
            reason: "user ended".to_string(),
        });
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        self.cancel_pending();
        if let Some(connection) = self.connection.take() {
            connection.reader.abort();
        }
    }
}
