//! WebSocket transport via `tokio-tungstenite`.
//!
//! [`WsConnector`] opens outbound connections; [`WsListener`] accepts
//! inbound upgrades on a TCP listener. Each connection gets an outbound
//! pump task feeding the sink and an inbound task translating socket
//! messages into [`LinkEvent`]s, so sessions never touch the socket type.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::{Result, SockwireError};

use super::{
    AcceptEvent, ClientTransport, ConnectionInfo, IncomingConnection, LinkEvent, MessageSender,
    Outbound, ReadyState, ReadyStateCell, ServerTransport, TransportLink, WireMessage,
};

/// Client-side WebSocket transport.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl WsConnector {
    /// Create a connector.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ClientTransport for WsConnector {
    async fn open(&self, url: &str) -> Result<TransportLink> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| SockwireError::Transport(e.to_string()))?;
        Ok(spawn_ws_link(stream))
    }
}

/// Wrap an established WebSocket stream into a [`TransportLink`].
fn spawn_ws_link<S>(stream: WebSocketStream<S>) -> TransportLink
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut source) = stream.split();
    let state = ReadyStateCell::new(ReadyState::Open);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let (evt_tx, evt_rx) = mpsc::unbounded_channel();

    let _ = evt_tx.send(LinkEvent::Open);

    tokio::spawn(async move {
        while let Some(item) = out_rx.recv().await {
            let result = match item {
                Outbound::Message(WireMessage::Text(text)) => sink.send(Message::Text(text)).await,
                Outbound::Message(WireMessage::Binary(bytes)) => {
                    sink.send(Message::Binary(bytes.to_vec())).await
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
    });

    let inbound_state = state.clone();
    tokio::spawn(async move {
        while let Some(item) = source.next().await {
            match item {
                Ok(Message::Text(text)) => {
                    let _ = evt_tx.send(LinkEvent::Message(WireMessage::Text(text)));
                }
                Ok(Message::Binary(bytes)) => {
                    let _ = evt_tx.send(LinkEvent::Message(WireMessage::Binary(Bytes::from(bytes))));
                }
                Ok(Message::Close(_)) => break,
                // ping/pong are answered by the protocol stack while polled
                Ok(_) => {}
                Err(e) => {
                    let _ = evt_tx.send(LinkEvent::Error(e.to_string()));
                    break;
                }
            }
        }
        inbound_state.set(ReadyState::Closed);
        let _ = evt_tx.send(LinkEvent::Closed);
    });

    TransportLink {
        sender: MessageSender::new(out_tx, state),
        events: evt_rx,
    }
}

/// Options for [`WsListener::bind`].
#[derive(Debug, Clone, Default)]
pub struct WsListenerOptions {
    /// Only accept upgrades on this request path when set.
    pub path: Option<String>,
    /// Compression passthrough flag; the current backend does not negotiate
    /// per-message deflate, the option is accepted for compatibility.
    pub per_message_deflate: bool,
}

/// Server-side WebSocket transport bound to a TCP listener.
pub struct WsListener {
    accept_rx: Mutex<mpsc::UnboundedReceiver<AcceptEvent>>,
    closed: AtomicBool,
    notify: Notify,
    accept_task: JoinHandle<()>,
}

impl WsListener {
    /// Bind a listener and start accepting upgrades.
    pub async fn bind(addr: &str, options: WsListenerOptions) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(addr).await?;
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let tx = accept_tx.clone();
                        let expected_path = options.path.clone();
                        tokio::spawn(async move {
                            upgrade(stream, peer.to_string(), expected_path, tx).await;
                        });
                    }
                    Err(e) => {
                        let _ = accept_tx.send(AcceptEvent::Error(SockwireError::Io(e)));
                    }
                }
            }
        });

        Ok(Arc::new(Self {
            accept_rx: Mutex::new(accept_rx),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
            accept_task,
        }))
    }
}

async fn upgrade(
    stream: tokio::net::TcpStream,
    peer: String,
    expected_path: Option<String>,
    tx: mpsc::UnboundedSender<AcceptEvent>,
) {
    let uri = Arc::new(parking_lot::Mutex::new(String::from("/")));
    let uri_slot = Arc::clone(&uri);
    let callback = move |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
        *uri_slot.lock() = req.uri().to_string();
        Ok(resp)
    };

    match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => {
            let mut info = ConnectionInfo::from_url(&uri.lock());
            if let Some(expected) = expected_path {
                if info.path != expected {
                    return;
                }
            }
            info.remote = Some(peer);
            let link = spawn_ws_link(ws);
            let _ = tx.send(AcceptEvent::Connection(IncomingConnection { info, link }));
        }
        Err(e) => {
            let _ = tx.send(AcceptEvent::Error(SockwireError::Transport(e.to_string())));
        }
    }
}

#[async_trait]
impl ServerTransport for WsListener {
    async fn accept(&self) -> Option<AcceptEvent> {
        if self.closed.load(Ordering::Acquire) {
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
        self.accept_task.abort();
    }
}

impl Drop for WsListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}
