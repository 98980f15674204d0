//! Shared session machinery.
//!
//! [`SessionCore`] is the receive path both endpoints run: it decodes each
//! inbound message, answers keep-alives (at most one pong per ping cycle,
//! and none before the version handshake completes), validates version
//! frames, routes settlements into the link's correlation table and
//! dispatches calls to the local [`SessionHandler`].
//!
//! Promise-returning handler outcomes are settled back to the peer; slow
//! ones run in their own task so a handler body never stalls the
//! connection's event processing.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::codec::Value;
use crate::error::{Result, SockwireError};
use crate::link::RemoteLink;
use crate::protocol::{Packet, PacketCodec};
use crate::transport::{ReadyState, WireMessage};

/// What a handler body produced: a value or a rejection message.
pub type MethodResult = std::result::Result<Value, String>;

/// Boxed future for asynchronously produced method results.
pub type MethodFuture = Pin<Box<dyn Future<Output = MethodResult> + Send + 'static>>;

/// Outcome of invoking one local method.
pub enum Outcome {
    /// Fire-and-forget method, nothing to settle.
    None,
    /// Promise method settled immediately.
    Resolved(Value),
    /// Promise method still running; settled when the future completes.
    Pending(MethodFuture),
}

/// The local side of a connection: lifecycle callbacks plus the dispatch
/// target for calls addressed to the local method table.
///
/// `connected`/`disconnected`/`invalid_version` default to no-ops; errors
/// returned from them are contained and reported, never fatal to the
/// connection.
#[async_trait]
pub trait SessionHandler: Send + 'static {
    /// The connection opened.
    async fn connected(&mut self) -> std::result::Result<(), String> {
        Ok(())
    }

    /// The connection closed.
    async fn disconnected(&mut self) -> std::result::Result<(), String> {
        Ok(())
    }

    /// The peer announced a version hash different from the local one.
    fn invalid_version(&mut self, _local: u64, _remote: u64) {}

    /// Invoke the method at `method` of the local table.
    ///
    /// Promise-declared methods should return [`Outcome::Resolved`] or
    /// [`Outcome::Pending`]; an `Err` becomes the rejection message.
    fn invoke(&mut self, method: usize, args: Vec<Value>) -> std::result::Result<Outcome, String>;
}

/// Handler for sessions whose local table declares no methods.
#[async_trait]
impl SessionHandler for () {
    fn invoke(&mut self, method: usize, _args: Vec<Value>) -> std::result::Result<Outcome, String> {
        Err(format!("no handler for method {method}"))
    }
}

/// Shared receive-path state of one connection.
pub(crate) struct SessionCore {
    link: Arc<RemoteLink>,
    hash: Option<u64>,
    /// One pong per ping cycle; unlimited when no interval is configured.
    ping_interval: Option<Duration>,
    handshaken: AtomicBool,
    last_pong: Mutex<Option<Instant>>,
}

impl SessionCore {
    pub(crate) fn new(
        link: Arc<RemoteLink>,
        hash: Option<u64>,
        ping_interval: Option<Duration>,
    ) -> Self {
        Self {
            link,
            hash,
            ping_interval,
            handshaken: AtomicBool::new(false),
            last_pong: Mutex::new(None),
        }
    }

    pub(crate) fn link(&self) -> &Arc<RemoteLink> {
        &self.link
    }

    /// The transport opened: announce the configured version hash.
    ///
    /// With no hash configured the handshake is complete right away;
    /// otherwise it completes when a matching version frame arrives.
    pub(crate) fn on_open(&self) {
        self.handshaken.store(self.hash.is_none(), Ordering::Release);
        *self.last_pong.lock() = None;
        if let Some(hash) = self.hash {
            self.link.send_raw(PacketCodec::encode_version(hash));
        }
    }

    /// The transport closed: reject all pending calls.
    pub(crate) fn on_close(&self) {
        self.handshaken.store(false, Ordering::Release);
        self.link.detach();
    }

    /// A ping cycle: probe the peer with a keep-alive.
    pub(crate) fn ping_tick(&self) {
        if self.link.is_connected() && self.handshaken.load(Ordering::Acquire) {
            self.link.send_raw(PacketCodec::keep_alive());
        }
    }

    /// Process one inbound message.
    ///
    /// Codec and protocol failures come back as errors for the caller to
    /// route; handler outcomes are contained here.
    pub(crate) async fn on_message(
        &self,
        message: &WireMessage,
        handler: &AsyncMutex<Box<dyn SessionHandler>>,
    ) -> Result<()> {
        let packet = self.link.codec().decode(message)?;
        match packet {
            Packet::KeepAlive => {
                self.on_keep_alive();
                Ok(())
            }
            Packet::Version(remote) => {
                match self.hash {
                    Some(local) if local == remote => {
                        self.handshaken.store(true, Ordering::Release);
                        *self.last_pong.lock() = None;
                    }
                    Some(local) => handler.lock().await.invalid_version(local, remote),
                    None => self.handshaken.store(true, Ordering::Release),
                }
                Ok(())
            }
            Packet::Resolved { id, value, .. } => {
                self.link.settle_resolved(id, value);
                Ok(())
            }
            Packet::Rejected { id, error, .. } => {
                self.link.settle_rejected(id, error);
                Ok(())
            }
            Packet::Call {
                method,
                correlation,
                args,
            } => self.dispatch_call(method, correlation, args, handler).await,
        }
    }

    /// Reply to one keep-alive, at most once per ping cycle and only after
    /// the handshake completed on an open connection.
    fn on_keep_alive(&self) {
        if !self.handshaken.load(Ordering::Acquire) {
            return;
        }
        let Some(sender) = self.link.sender() else {
            return;
        };
        if sender.ready_state() != ReadyState::Open {
            return;
        }
        let mut last_pong = self.last_pong.lock();
        let answerable = match (self.ping_interval, *last_pong) {
            (Some(interval), Some(last)) => last.elapsed() >= interval,
            _ => true,
        };
        if answerable {
            *last_pong = Some(Instant::now());
            sender.send(PacketCodec::keep_alive());
        }
    }

    async fn dispatch_call(
        &self,
        method: usize,
        correlation: Option<u32>,
        args: Vec<Value>,
        handler: &AsyncMutex<Box<dyn SessionHandler>>,
    ) -> Result<()> {
        let promise = self
            .link
            .codec()
            .local_table()
            .get(method)
            .map(|desc| desc.options.promise)
            .ok_or_else(|| SockwireError::Protocol(format!("invalid message: {method}")))?;

        let outcome = handler.lock().await.invoke(method, args);

        if promise {
            let id = correlation.ok_or_else(|| {
                SockwireError::Protocol(format!("missing correlation id for method {method}"))
            })?;
            match outcome {
                Ok(Outcome::Pending(future)) => {
                    let link = Arc::clone(&self.link);
                    tokio::spawn(async move {
                        let result = future.await;
                        settle_to_peer(&link, method, id, result);
                    });
                }
                Ok(Outcome::Resolved(value)) => {
                    settle_to_peer(&self.link, method, id, Ok(value));
                }
                Ok(Outcome::None) => settle_to_peer(&self.link, method, id, Ok(Value::Null)),
                Err(message) => settle_to_peer(&self.link, method, id, Err(message)),
            }
            Ok(())
        } else {
            match outcome {
                Ok(_) => Ok(()),
                Err(message) => Err(SockwireError::Handler(message)),
            }
        }
    }
}

/// Send the settlement frame for a finished promise call.
fn settle_to_peer(link: &RemoteLink, method: usize, id: u32, result: MethodResult) {
    let frame = match &result {
        Ok(value) => PacketCodec::encode_resolved(method, id, value),
        Err(message) => PacketCodec::encode_rejected(method, id, message),
    };
    match frame {
        Ok(frame) => link.send_raw(frame),
        Err(e) => tracing::error!("failed to encode settlement frame: {e}"),
    }
}
