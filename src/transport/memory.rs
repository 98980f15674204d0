//! In-process transport.
//!
//! [`MemoryHub`] is a [`ServerTransport`] whose connections are channel
//! pairs inside the current process; [`MemoryConnector`] is the matching
//! [`ClientTransport`]. The test suites run full client/server sessions over
//! it, and [`MemoryClient`] / [`ManualPeer`] expose the raw peer side of a
//! connection so tests can drive transport events by hand.
//!
//! # Example
//!
//! ```
//! use sockwire::transport::memory::MemoryHub;
//!
//! let hub = MemoryHub::new();
//! let connector = hub.connector();
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::error::{Result, SockwireError};

use super::{
    AcceptEvent, ClientTransport, ConnectionInfo, IncomingConnection, LinkEvent, MessageSender,
    Outbound, ReadyState, ReadyStateCell, ServerTransport, TransportLink, WireMessage,
};

/// Build one bidirectional in-process connection.
///
/// Returns the initiator's link and the acceptor's [`IncomingConnection`].
/// Both ends share one ready state; closing either side delivers `Closed`
/// to both event streams.
pub fn pipe(url: &str) -> (TransportLink, IncomingConnection) {
    let (link, connection, _) = pipe_with_injector(url);
    (link, connection)
}

fn pipe_with_injector(
    url: &str,
) -> (
    TransportLink,
    IncomingConnection,
    mpsc::UnboundedSender<LinkEvent>,
) {
    let state = ReadyStateCell::new(ReadyState::Open);

    let (client_out_tx, client_out_rx) = mpsc::unbounded_channel();
    let (server_out_tx, server_out_rx) = mpsc::unbounded_channel();
    let (client_evt_tx, client_evt_rx) = mpsc::unbounded_channel();
    let (server_evt_tx, server_evt_rx) = mpsc::unbounded_channel();

    spawn_pump(
        client_out_rx,
        server_evt_tx.clone(),
        client_evt_tx.clone(),
        state.clone(),
    );
    spawn_pump(
        server_out_rx,
        client_evt_tx.clone(),
        server_evt_tx.clone(),
        state.clone(),
    );

    // The initiator observes the open transition as its first event.
    let _ = client_evt_tx.send(LinkEvent::Open);

    let client_link = TransportLink {
        sender: MessageSender::new(client_out_tx, state.clone()),
        events: client_evt_rx,
    };
    let server_link = TransportLink {
        sender: MessageSender::new(server_out_tx, state),
        events: server_evt_rx,
    };
    let connection = IncomingConnection {
        info: ConnectionInfo::from_url(url),
        link: server_link,
    };
    (client_link, connection, server_evt_tx)
}

fn spawn_pump(
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
    peer_events: mpsc::UnboundedSender<LinkEvent>,
    own_events: mpsc::UnboundedSender<LinkEvent>,
    state: ReadyStateCell,
) {
    tokio::spawn(async move {
        loop {
            match out_rx.recv().await {
                Some(Outbound::Message(message)) => {
                    if state.get() == ReadyState::Open {
                        let _ = peer_events.send(LinkEvent::Message(message));
                    }
                }
                Some(Outbound::Close) | None => {
                    if state.get() != ReadyState::Closed {
                        state.set(ReadyState::Closed);
                        let _ = peer_events.send(LinkEvent::Closed);
                        let _ = own_events.send(LinkEvent::Closed);
                    }
                    break;
                }
            }
        }
    });
}

/// In-process listener.
pub struct MemoryHub {
    accept_tx: mpsc::UnboundedSender<AcceptEvent>,
    accept_rx: Mutex<mpsc::UnboundedReceiver<AcceptEvent>>,
    closed: AtomicBool,
    notify: Notify,
}

impl MemoryHub {
    /// Create a hub.
    pub fn new() -> Arc<Self> {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            accept_tx,
            accept_rx: Mutex::new(accept_rx),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    /// A client transport that connects to this hub.
    pub fn connector(self: &Arc<Self>) -> MemoryConnector {
        MemoryConnector {
            hub: Arc::clone(self),
        }
    }

    /// Whether the hub has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Connect a raw test peer, advertising binary capability or not.
    ///
    /// The hub side sees a normal incoming connection; the returned
    /// [`MemoryClient`] is the remote end, driven by hand.
    pub fn connect_client(&self, binary: bool) -> MemoryClient {
        let url = if binary { "/ws?bin=true" } else { "/ws" };
        self.connect_client_with_url(url)
    }

    /// Connect a raw test peer using an explicit request URL.
    pub fn connect_client_with_url(&self, url: &str) -> MemoryClient {
        let (link, connection, server_events) = pipe_with_injector(url);
        let _ = self.accept_tx.send(AcceptEvent::Connection(connection));
        let TransportLink { sender, mut events } = link;
        // The raw peer has no use for its own open transition.
        let _ = events.try_recv();
        MemoryClient {
            sender,
            events,
            server_events,
        }
    }

    /// Deliver a listener-level error to whoever is accepting.
    pub fn inject_error(&self, error: SockwireError) {
        let _ = self.accept_tx.send(AcceptEvent::Error(error));
    }
}

#[async_trait]
impl ServerTransport for MemoryHub {
    async fn accept(&self) -> Option<AcceptEvent> {
        if self.is_closed() {
            return None;
        }
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            event = rx.recv() => event,
            _ = self.notify.notified() => None,
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

/// Client transport side of a [`MemoryHub`].
#[derive(Clone)]
pub struct MemoryConnector {
    hub: Arc<MemoryHub>,
}

#[async_trait]
impl ClientTransport for MemoryConnector {
    async fn open(&self, url: &str) -> Result<TransportLink> {
        if self.hub.is_closed() {
            return Err(SockwireError::ConnectionClosed);
        }
        let (link, connection) = pipe(url);
        self.hub
            .accept_tx
            .send(AcceptEvent::Connection(connection))
            .map_err(|_| SockwireError::ConnectionClosed)?;
        Ok(link)
    }
}

/// The raw remote end of a hub connection, driven by tests.
pub struct MemoryClient {
    /// Write handle of the peer side.
    pub sender: MessageSender,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    server_events: mpsc::UnboundedSender<LinkEvent>,
}

impl MemoryClient {
    /// Send a text frame to the hub side.
    pub fn send_text(&self, text: &str) {
        self.sender.send(WireMessage::Text(text.to_string()));
    }

    /// Send the keep-alive sentinel to the hub side.
    pub fn send_keep_alive(&self) {
        self.sender.send(WireMessage::Text(String::new()));
    }

    /// Close the connection.
    pub fn close(&self) {
        self.sender.close();
    }

    /// Inject a transport error event on the hub side of this connection.
    pub fn emit_server_error(&self, message: &str) {
        let _ = self
            .server_events
            .send(LinkEvent::Error(message.to_string()));
    }

    /// Await the next message delivered to this peer, skipping other events.
    ///
    /// Returns `None` once the connection closed.
    pub async fn next_message(&mut self) -> Option<WireMessage> {
        while let Some(event) = self.events.recv().await {
            match event {
                LinkEvent::Message(message) => return Some(message),
                LinkEvent::Closed => return None,
                LinkEvent::Open | LinkEvent::Error(_) => {}
            }
        }
        None
    }

    /// Drain all messages currently queued for this peer.
    pub fn drain_messages(&mut self) -> Vec<WireMessage> {
        let mut messages = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let LinkEvent::Message(message) = event {
                messages.push(message);
            }
        }
        messages
    }

    /// Whether the connection closed.
    pub fn is_closed(&self) -> bool {
        self.sender.ready_state() == ReadyState::Closed
    }
}

/// Client transport whose connections are driven entirely by the test.
///
/// Every `open()` yields a fresh link whose peer side pops out of the
/// receiver returned by [`manual_connector`], like a scripted socket: the
/// test decides when the open event fires, what arrives, and when it closes.
pub struct ManualConnector {
    peers: mpsc::UnboundedSender<ManualPeer>,
}

/// Create a manual connector and the stream of peers it produces.
pub fn manual_connector() -> (ManualConnector, mpsc::UnboundedReceiver<ManualPeer>) {
    let (peers, rx) = mpsc::unbounded_channel();
    (ManualConnector { peers }, rx)
}

#[async_trait]
impl ClientTransport for ManualConnector {
    async fn open(&self, url: &str) -> Result<TransportLink> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (evt_tx, evt_rx) = mpsc::unbounded_channel();
        let state = ReadyStateCell::new(ReadyState::Open);
        let link = TransportLink {
            sender: MessageSender::new(out_tx, state.clone()),
            events: evt_rx,
        };
        let peer = ManualPeer {
            url: url.to_string(),
            events: evt_tx,
            outbound: out_rx,
            state,
        };
        self.peers
            .send(peer)
            .map_err(|_| SockwireError::ConnectionClosed)?;
        Ok(link)
    }
}

/// The scripted peer side of a [`ManualConnector`] connection.
pub struct ManualPeer {
    /// URL the session connected to.
    pub url: String,
    events: mpsc::UnboundedSender<LinkEvent>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    state: ReadyStateCell,
}

impl ManualPeer {
    /// Fire the open event.
    pub fn open(&self) {
        let _ = self.events.send(LinkEvent::Open);
    }

    /// Deliver a text frame to the session.
    pub fn message_text(&self, text: &str) {
        let _ = self
            .events
            .send(LinkEvent::Message(WireMessage::Text(text.to_string())));
    }

    /// Deliver a message to the session.
    pub fn message(&self, message: WireMessage) {
        let _ = self.events.send(LinkEvent::Message(message));
    }

    /// Deliver a transport error event.
    pub fn error(&self, message: &str) {
        let _ = self.events.send(LinkEvent::Error(message.to_string()));
    }

    /// Fire the close event.
    pub fn close(&self) {
        self.state.set(ReadyState::Closed);
        let _ = self.events.send(LinkEvent::Closed);
    }

    /// Force the ready state without firing events.
    pub fn set_ready_state(&self, state: ReadyState) {
        self.state.set(state);
    }

    /// Drain all messages the session has sent so far.
    pub fn sent(&mut self) -> Vec<WireMessage> {
        let mut messages = Vec::new();
        while let Ok(item) = self.outbound.try_recv() {
            if let Outbound::Message(message) = item {
                messages.push(message);
            }
        }
        messages
    }

    /// Whether the session asked to close the connection.
    pub fn close_requested(&mut self) -> bool {
        while let Ok(item) = self.outbound.try_recv() {
            if matches!(item, Outbound::Close) {
                return true;
            }
        }
        false
    }
}
