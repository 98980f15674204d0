//! Transport abstraction.
//!
//! Sessions consume transports through two narrow traits:
//!
//! - [`ClientTransport`] opens one outbound connection from a URL and yields
//!   a [`TransportLink`] - a [`MessageSender`] plus an ordered stream of
//!   [`LinkEvent`]s (open/message/error/closed).
//! - [`ServerTransport`] accepts inbound connections, each delivered as an
//!   [`IncomingConnection`] carrying the upgrade-request metadata
//!   ([`ConnectionInfo`]) and its link.
//!
//! Implementations:
//!
//! - [`memory`] - in-process hub, used by the test suites and embeddings
//! - [`ws`] - WebSocket via `tokio-tungstenite`

pub mod memory;
pub mod ws;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;

/// One transmitted unit: textual or binary payload.
///
/// The empty message (either flavor) is the keep-alive sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Textual payload (JSON frame path).
    Text(String),
    /// Binary payload (fixed-schema frame path).
    Binary(Bytes),
}

impl WireMessage {
    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        match self {
            WireMessage::Text(s) => s.len(),
            WireMessage::Binary(b) => b.len(),
        }
    }

    /// Whether this is the empty (keep-alive) payload.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Connection ready state, mirroring the usual socket lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    /// Connection attempt in flight.
    Connecting = 0,
    /// Open for traffic.
    Open = 1,
    /// Close initiated, not yet complete.
    Closing = 2,
    /// Closed.
    Closed = 3,
}

/// Shared, atomically updated ready state for one connection.
#[derive(Debug, Clone)]
pub struct ReadyStateCell(Arc<AtomicU8>);

impl ReadyStateCell {
    /// Create a cell in the given state.
    pub fn new(state: ReadyState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    /// Current state.
    pub fn get(&self) -> ReadyState {
        match self.0.load(Ordering::Acquire) {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }

    /// Update the state.
    pub fn set(&self, state: ReadyState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Item consumed by a transport's outbound pump.
#[derive(Debug)]
pub enum Outbound {
    /// Deliver a message to the peer.
    Message(WireMessage),
    /// Close the connection.
    Close,
}

/// Cheaply cloneable handle for writing to one connection.
#[derive(Debug, Clone)]
pub struct MessageSender {
    tx: mpsc::UnboundedSender<Outbound>,
    state: ReadyStateCell,
}

impl MessageSender {
    /// Create a sender over the transport's outbound queue.
    pub fn new(tx: mpsc::UnboundedSender<Outbound>, state: ReadyStateCell) -> Self {
        Self { tx, state }
    }

    /// Current ready state of the connection.
    pub fn ready_state(&self) -> ReadyState {
        self.state.get()
    }

    /// Queue a message. Silently dropped when the connection is not open.
    pub fn send(&self, message: WireMessage) {
        if self.state.get() == ReadyState::Open {
            let _ = self.tx.send(Outbound::Message(message));
        }
    }

    /// Initiate a close. Idempotent.
    pub fn close(&self) {
        if matches!(self.state.get(), ReadyState::Open | ReadyState::Connecting) {
            self.state.set(ReadyState::Closing);
            let _ = self.tx.send(Outbound::Close);
        }
    }
}

/// Event delivered by a transport for one connection, in receipt order.
#[derive(Debug)]
pub enum LinkEvent {
    /// The connection is open for traffic.
    Open,
    /// A message arrived.
    Message(WireMessage),
    /// Transport-level error. The connection may still close separately.
    Error(String),
    /// The connection closed.
    Closed,
}

/// One live connection: a write handle and the ordered event stream.
#[derive(Debug)]
pub struct TransportLink {
    /// Write handle.
    pub sender: MessageSender,
    /// Ordered events for this connection.
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Metadata of an inbound connection attempt.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    /// Request path.
    pub path: String,
    /// Query parameters in request order.
    pub query: Vec<(String, String)>,
    /// Remote address, when the transport knows it.
    pub remote: Option<String>,
}

impl ConnectionInfo {
    /// Parse path and query out of a request URL or URI.
    pub fn from_url(url: &str) -> Self {
        let rest = url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(url);
        let after_host = match rest.find('/') {
            Some(pos) => &rest[pos..],
            None => "/",
        };
        let (path, query_str) = match after_host.split_once('?') {
            Some((p, q)) => (p, q),
            None => (after_host, ""),
        };
        let query = query_str
            .split('&')
            .filter(|part| !part.is_empty())
            .map(|part| match part.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (part.to_string(), String::new()),
            })
            .collect();
        Self {
            path: path.to_string(),
            query,
            remote: None,
        }
    }

    /// First value of the named query parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Whether the peer advertised binary-mode capability.
    pub fn wants_binary(&self) -> bool {
        self.param("bin") == Some("true")
    }
}

/// An accepted inbound connection, pre-admission.
#[derive(Debug)]
pub struct IncomingConnection {
    /// Upgrade-request metadata.
    pub info: ConnectionInfo,
    /// The connection's link.
    pub link: TransportLink,
}

impl IncomingConnection {
    /// Drop the raw connection without admitting it.
    pub fn terminate(&self) {
        self.link.sender.close();
    }
}

/// Outcome of one accept poll.
#[derive(Debug)]
pub enum AcceptEvent {
    /// A peer connected.
    Connection(IncomingConnection),
    /// Listener-level failure (e.g. a bad handshake); the listener lives on.
    Error(crate::error::SockwireError),
}

/// Client-side transport: opens outbound connections.
#[async_trait]
pub trait ClientTransport: Send + Sync + 'static {
    /// Open a connection to the given URL.
    async fn open(&self, url: &str) -> Result<TransportLink>;
}

/// Server-side transport: a listener producing inbound connections.
#[async_trait]
pub trait ServerTransport: Send + Sync + 'static {
    /// Wait for the next accept event. `None` once the listener is closed.
    async fn accept(&self) -> Option<AcceptEvent>;

    /// Stop accepting and release the listener.
    fn close(&self);
}
