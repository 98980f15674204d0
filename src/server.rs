//! Server session manager.
//!
//! [`create_server`] binds a [`ServerTransport`] listener and manages the
//! set of inbound connections: admission control (client limit, then the
//! configured verification callback), per-connection dispatch to a handler
//! built by the factory, guarded lifecycle callbacks and fan-out
//! [`broadcast`]. Handler and transport failures are contained per
//! connection and routed to the [`ServerErrorHandler`]; one connection's
//! problems never touch its siblings or the listener.
//!
//! # Example
//!
//! ```ignore
//! let manager = create_server(
//!     listener,
//!     ServerOptions { server: server_methods, client: client_methods, ..Default::default() },
//!     |client| Box::new(MyHandler::new(client)),
//!     None,
//! );
//! broadcast(&manager.clients(), |c| c.notify("hi", vec!["boop".into()]))?;
//! manager.close();
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::codec::Value;
use crate::error::{Result, SockwireError};
use crate::link::RemoteLink;
use crate::method::MethodTable;
use crate::protocol::PacketCodec;
use crate::session::{SessionCore, SessionHandler};
use crate::transport::{
    AcceptEvent, ConnectionInfo, IncomingConnection, LinkEvent, MessageSender, TransportLink,
    WireMessage,
};
pub use crate::transport::ServerTransport;

/// Boxed admission decision.
pub type VerifyFuture = Pin<Box<dyn Future<Output = Result<bool>> + Send>>;

/// Custom admission callback: admit on `Ok(true)`, refuse on `Ok(false)`,
/// refuse and report on `Err`.
pub type VerifyClient = Arc<dyn Fn(ConnectionInfo) -> VerifyFuture + Send + Sync>;

/// Error collaborator for the server side.
pub trait ServerErrorHandler: Send + Sync + 'static {
    /// A contained failure, attributed to a client when one exists.
    fn handle_error(&self, client: Option<&ClientHandle>, error: &SockwireError);

    /// A received message failed to decode or dispatch.
    fn handle_recv_error(&self, client: &ClientHandle, error: &SockwireError, raw: &WireMessage) {
        let _ = raw;
        self.handle_error(Some(client), error);
    }
}

/// Configuration of one session manager.
#[derive(Clone, Default)]
pub struct ServerOptions {
    /// Protocol version hash announced to connecting clients.
    pub hash: Option<u64>,
    /// Keep-alive cycle length per connection; no pings when unset.
    pub ping_interval: Option<Duration>,
    /// Maximum concurrent clients; further attempts are refused.
    pub client_limit: Option<usize>,
    /// Custom admission callback, run after the client-limit check.
    pub verify_client: Option<VerifyClient>,
    /// Compression passthrough for transports that support it.
    pub per_message_deflate: bool,
    /// Local method table (what clients call here).
    pub server: MethodTable,
    /// Remote method table (what this server calls on clients).
    pub client: MethodTable,
}

/// The remote proxy of one connected client.
#[derive(Clone)]
pub struct ClientHandle {
    id: u64,
    link: Arc<RemoteLink>,
}

impl PartialEq for ClientHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl ClientHandle {
    /// Stable identifier of this connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the connection is currently open.
    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Whether the connection negotiated the binary fast path.
    pub fn binary_mode(&self) -> bool {
        self.link.binary_mode()
    }

    /// Invoke a promise-returning client method and await its settlement.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.link.call(method, args).await
    }

    /// Invoke a fire-and-forget client method.
    pub fn notify(&self, method: &str, args: Vec<Value>) -> Result<bool> {
        self.link.notify(method, args)
    }
}

struct ServerInner {
    transport: Arc<dyn ServerTransport>,
    hash: Option<u64>,
    ping_interval: Option<Duration>,
    client_limit: Option<usize>,
    verify_client: Option<VerifyClient>,
    server_table: Arc<MethodTable>,
    client_table: Arc<MethodTable>,
    factory: Box<dyn Fn(ClientHandle) -> Box<dyn SessionHandler> + Send + Sync>,
    error_handler: Option<Arc<dyn ServerErrorHandler>>,
    clients: Mutex<Vec<ClientHandle>>,
    next_client_id: AtomicU64,
}

impl ServerInner {
    fn report(&self, client: Option<&ClientHandle>, error: &SockwireError) {
        match &self.error_handler {
            Some(handler) => handler.handle_error(client, error),
            None => tracing::error!("server error: {error}"),
        }
    }
}

/// Handle to a running listener and its connections.
pub struct SessionManager {
    inner: Arc<ServerInner>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    /// Snapshot of the currently connected clients.
    pub fn clients(&self) -> Vec<ClientHandle> {
        self.inner.clients.lock().clone()
    }

    /// Number of currently connected clients.
    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().len()
    }

    /// Stop accepting, close every connection and release the listener.
    pub fn close(&self) {
        self.inner.transport.close();
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        let clients = std::mem::take(&mut *self.inner.clients.lock());
        for client in clients {
            client.link.invalidate();
            client.link.close_transport();
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.close();
    }
}

/// Bind a manager to a listener transport.
///
/// `handler_factory` is invoked once per admitted connection with that
/// connection's [`ClientHandle`] and returns the server-side handler
/// instance dispatch targets.
pub fn create_server<F>(
    transport: Arc<dyn ServerTransport>,
    options: ServerOptions,
    handler_factory: F,
    error_handler: Option<Arc<dyn ServerErrorHandler>>,
) -> SessionManager
where
    F: Fn(ClientHandle) -> Box<dyn SessionHandler> + Send + Sync + 'static,
{
    let inner = Arc::new(ServerInner {
        transport,
        hash: options.hash,
        ping_interval: options.ping_interval,
        client_limit: options.client_limit,
        verify_client: options.verify_client,
        server_table: Arc::new(options.server),
        client_table: Arc::new(options.client),
        factory: Box::new(handler_factory),
        error_handler,
        clients: Mutex::new(Vec::new()),
        next_client_id: AtomicU64::new(1),
    });

    let accept_inner = Arc::clone(&inner);
    let accept_task = tokio::spawn(async move {
        accept_loop(accept_inner).await;
    });

    SessionManager {
        inner,
        accept_task: Mutex::new(Some(accept_task)),
    }
}

async fn accept_loop(inner: Arc<ServerInner>) {
    while let Some(event) = inner.transport.accept().await {
        match event {
            AcceptEvent::Error(error) => inner.report(None, &error),
            AcceptEvent::Connection(connection) => {
                let admit_inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    admit(admit_inner, connection).await;
                });
            }
        }
    }
}

/// Admission control, then connection wiring.
async fn admit(inner: Arc<ServerInner>, connection: IncomingConnection) {
    if let Some(limit) = inner.client_limit {
        if inner.clients.lock().len() >= limit {
            connection.terminate();
            return;
        }
    }
    if let Some(verify) = &inner.verify_client {
        match verify(connection.info.clone()).await {
            Ok(true) => {}
            Ok(false) => {
                connection.terminate();
                return;
            }
            Err(error) => {
                // refusal plus a report, never surfaced to the peer
                inner.report(None, &error);
                connection.terminate();
                return;
            }
        }
    }

    let binary = connection.info.wants_binary();
    let IncomingConnection {
        link: TransportLink { sender, events },
        ..
    } = connection;

    let codec = PacketCodec::new(
        Arc::clone(&inner.client_table),
        Arc::clone(&inner.server_table),
    );
    let link = RemoteLink::new(codec);
    link.attach(sender.clone(), binary);
    let handle = ClientHandle {
        id: inner.next_client_id.fetch_add(1, Ordering::Relaxed),
        link: Arc::clone(&link),
    };

    let handler: AsyncMutex<Box<dyn SessionHandler>> =
        AsyncMutex::new((inner.factory)(handle.clone()));
    let core = Arc::new(SessionCore::new(link, inner.hash, inner.ping_interval));
    core.on_open();
    {
        // admissions run concurrently; the limit is re-checked at
        // registration so simultaneous attempts cannot overshoot it
        let mut clients = inner.clients.lock();
        if let Some(limit) = inner.client_limit {
            if clients.len() >= limit {
                drop(clients);
                sender.close();
                return;
            }
        }
        clients.push(handle.clone());
    }

    if let Err(message) = handler.lock().await.connected().await {
        inner.report(Some(&handle), &SockwireError::Handler(message));
    }

    let ping_task = inner.ping_interval.map(|interval| {
        let ping_core = Arc::clone(&core);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.tick().await;
            loop {
                timer.tick().await;
                ping_core.ping_tick();
            }
        })
    });

    connection_loop(inner, core, handler, handle, sender, events, ping_task).await;
}

async fn connection_loop(
    inner: Arc<ServerInner>,
    core: Arc<SessionCore>,
    handler: AsyncMutex<Box<dyn SessionHandler>>,
    handle: ClientHandle,
    sender: MessageSender,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    ping_task: Option<JoinHandle<()>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Open => {}
            LinkEvent::Message(message) => {
                if let Err(error) = core.on_message(&message, &handler).await {
                    match (&error, &inner.error_handler) {
                        // handler failures are contained, never fatal
                        (SockwireError::Handler(_), _) => inner.report(Some(&handle), &error),
                        (_, Some(error_handler)) => {
                            error_handler.handle_recv_error(&handle, &error, &message);
                        }
                        (_, None) => {
                            tracing::error!("receive failed: {error}");
                            sender.close();
                            break;
                        }
                    }
                }
            }
            LinkEvent::Error(message) => {
                inner.report(Some(&handle), &SockwireError::Transport(message));
            }
            LinkEvent::Closed => break,
        }
    }

    if let Some(task) = ping_task {
        task.abort();
    }
    core.on_close();
    if let Err(message) = handler.lock().await.disconnected().await {
        inner.report(Some(&handle), &SockwireError::Handler(message));
    }
    inner.clients.lock().retain(|client| client.id != handle.id);
}

/// Fan-out proxy handed to a [`broadcast`] action.
pub struct BroadcastProxy<'a> {
    targets: &'a [ClientHandle],
}

impl BroadcastProxy<'_> {
    /// Send one fire-and-forget call to every target.
    ///
    /// Arguments are serialized once per distinct transport mode in use
    /// among the targets, then written to each target's connection. A
    /// recipient whose connection is gone is skipped without affecting the
    /// others.
    pub fn notify(&self, method: &str, args: Vec<Value>) -> Result<()> {
        let Some(first) = self.targets.first() else {
            return Ok(());
        };
        let codec = first.link.codec();
        let index = codec
            .remote_table()
            .index_of(method)
            .ok_or_else(|| SockwireError::Protocol(format!("unknown method: {method}")))?;

        let mut text_frame: Option<WireMessage> = None;
        let mut binary_frame: Option<WireMessage> = None;
        for target in self.targets {
            if target.link.binary_mode() {
                if binary_frame.is_none() {
                    binary_frame = Some(codec.encode_call(index, None, &args, true)?);
                }
            } else if text_frame.is_none() {
                text_frame = Some(codec.encode_call(index, None, &args, false)?);
            }
        }

        for target in self.targets {
            let frame = if target.link.binary_mode() {
                binary_frame.clone()
            } else {
                text_frame.clone()
            };
            if let Some(frame) = frame {
                target.link.send_raw(frame);
            }
        }
        Ok(())
    }
}

/// Invoke `action` exactly once against a fan-out proxy over `clients`.
///
/// An empty target list is a no-op; any entry that is not a
/// connection-bound proxy fails fast with `invalid client` before any
/// write occurs.
pub fn broadcast<F>(clients: &[ClientHandle], action: F) -> Result<()>
where
    F: FnOnce(&BroadcastProxy<'_>) -> Result<()>,
{
    if clients.is_empty() {
        return Ok(());
    }
    for client in clients {
        if !client.link.is_broadcast_target() {
            return Err(SockwireError::InvalidClient);
        }
    }
    let proxy = BroadcastProxy { targets: clients };
    action(&proxy)
}
