//! Client session.
//!
//! A [`ClientSession`] owns one outbound connection: it builds the
//! connection URL from its options, validates the version handshake,
//! answers keep-alives, correlates promise calls, enforces per-method rate
//! limits and schedules reconnects after unexpected closes.
//!
//! # Example
//!
//! ```ignore
//! use sockwire::client::{ClientOptions, ClientSession};
//! use sockwire::transport::ws::WsConnector;
//!
//! let options = ClientOptions {
//!     host: "example.com".to_string(),
//!     server: server_methods,
//!     client: client_methods,
//!     ..ClientOptions::default()
//! };
//! let session = ClientSession::new(options, MyHandler::new(), WsConnector::new(), None);
//! session.connect();
//! let answer = session.remote().call("login", vec!["user".into()]).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::codec::Value;
use crate::error::{Result, SockwireError};
use crate::link::RemoteLink;
use crate::method::MethodTable;
use crate::protocol::PacketCodec;
use crate::session::{SessionCore, SessionHandler};
use crate::transport::{ClientTransport, LinkEvent, TransportLink, WireMessage};

/// Receive-path error collaborator for the client side.
///
/// When none is configured the session is loud: the error is logged and the
/// connection torn down.
pub trait ClientErrorHandler: Send + Sync + 'static {
    /// A received message failed to decode or dispatch.
    fn handle_recv_error(&self, error: &SockwireError, raw: &WireMessage);
}

/// Configuration of one client session.
#[derive(Clone)]
pub struct ClientOptions {
    /// Host (and optional port) to connect to.
    pub host: String,
    /// Request path; `/ws` when unset.
    pub path: Option<String>,
    /// Use the encrypted scheme (`wss`).
    pub secure: bool,
    /// Protocol version hash announced after transport-open.
    pub hash: Option<u64>,
    /// Keep-alive cycle length; no pings are sent when unset.
    pub ping_interval: Option<Duration>,
    /// Delay before reconnecting after an unexpected close.
    pub reconnect_timeout: Option<Duration>,
    /// Extra query parameters for the connection URL.
    pub request_params: Vec<(String, String)>,
    /// Local method table (what the server may call here).
    pub client: MethodTable,
    /// Remote method table (what this session may call on the server).
    pub server: MethodTable,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            path: None,
            secure: false,
            hash: None,
            ping_interval: None,
            reconnect_timeout: None,
            request_params: Vec::new(),
            client: MethodTable::empty(),
            server: MethodTable::empty(),
        }
    }
}

/// Build the connection URL: scheme from the security setting, configured
/// request parameters, plus the binary-capability flag.
fn build_url(options: &ClientOptions) -> String {
    let scheme = if options.secure { "wss" } else { "ws" };
    let path = options.path.as_deref().unwrap_or("/ws");
    let mut query = String::new();
    for (key, value) in &options.request_params {
        query.push_str(key);
        query.push('=');
        query.push_str(value);
        query.push('&');
    }
    query.push_str("bin=true");
    format!("{scheme}://{}{path}?{query}", options.host)
}

struct Lifecycle {
    connecting: bool,
    manual_disconnect: bool,
    event_task: Option<JoinHandle<()>>,
    ping_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
}

struct ClientInner {
    url: String,
    ping_interval: Option<Duration>,
    reconnect_timeout: Option<Duration>,
    core: SessionCore,
    handler: AsyncMutex<Box<dyn SessionHandler>>,
    connector: Arc<dyn ClientTransport>,
    error_handler: Option<Arc<dyn ClientErrorHandler>>,
    lifecycle: Mutex<Lifecycle>,
}

/// Typed call surface for the remote side of a client session.
#[derive(Clone)]
pub struct RemoteProxy {
    link: Arc<RemoteLink>,
}

impl RemoteProxy {
    pub(crate) fn new(link: Arc<RemoteLink>) -> Self {
        Self { link }
    }

    /// Invoke a promise-returning method and await its settlement.
    ///
    /// Rejects with `rate limit exceeded`, `not connected`, `disconnected`
    /// or the remote rejection message.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.link.call(method, args).await
    }

    /// Invoke a fire-and-forget method.
    ///
    /// Returns `Ok(false)` only when the rate-limit window refused the
    /// call; while disconnected the call is dropped silently.
    pub fn notify(&self, method: &str, args: Vec<Value>) -> Result<bool> {
        self.link.notify(method, args)
    }
}

/// One outbound RPC connection.
pub struct ClientSession {
    inner: Arc<ClientInner>,
}

impl ClientSession {
    /// Create a session. No connection is made until [`connect`](Self::connect).
    pub fn new<H, T>(
        options: ClientOptions,
        handler: H,
        connector: T,
        error_handler: Option<Arc<dyn ClientErrorHandler>>,
    ) -> Self
    where
        H: SessionHandler,
        T: ClientTransport,
    {
        let url = build_url(&options);
        let codec = PacketCodec::new(Arc::new(options.server), Arc::new(options.client));
        let link = RemoteLink::new(codec);
        Self {
            inner: Arc::new(ClientInner {
                url,
                ping_interval: options.ping_interval,
                reconnect_timeout: options.reconnect_timeout,
                core: SessionCore::new(link, options.hash, options.ping_interval),
                handler: AsyncMutex::new(Box::new(handler)),
                connector: Arc::new(connector),
                error_handler,
                lifecycle: Mutex::new(Lifecycle {
                    connecting: false,
                    manual_disconnect: false,
                    event_task: None,
                    ping_task: None,
                    reconnect_task: None,
                }),
            }),
        }
    }

    /// Open the connection. A no-op while already connecting or connected.
    pub fn connect(&self) {
        connect_inner(&self.inner);
    }

    /// Close the connection. A no-op while not connected.
    pub fn disconnect(&self) {
        let mut lc = self.inner.lifecycle.lock();
        lc.manual_disconnect = true;
        if let Some(task) = lc.reconnect_task.take() {
            task.abort();
        }
        let link = self.inner.core.link();
        if link.sender().is_some() {
            link.close_transport();
        } else if lc.connecting {
            if let Some(task) = lc.event_task.take() {
                task.abort();
            }
            lc.connecting = false;
        }
    }

    /// Whether the transport is currently open.
    pub fn is_connected(&self) -> bool {
        self.inner.core.link().is_connected()
    }

    /// Progress flag of a promise method declaring one.
    pub fn in_progress(&self, method: &str) -> bool {
        self.inner.core.link().in_progress(method)
    }

    /// The typed call surface of the remote side.
    pub fn remote(&self) -> RemoteProxy {
        RemoteProxy::new(Arc::clone(self.inner.core.link()))
    }

    /// The URL this session connects to.
    pub fn url(&self) -> &str {
        &self.inner.url
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        let mut lc = self.inner.lifecycle.lock();
        lc.manual_disconnect = true;
        if let Some(task) = lc.reconnect_task.take() {
            task.abort();
        }
        if let Some(task) = lc.ping_task.take() {
            task.abort();
        }
        drop(lc);
        self.inner.core.link().close_transport();
    }
}

fn connect_inner(inner: &Arc<ClientInner>) {
    let mut lc = inner.lifecycle.lock();
    if lc.connecting || inner.core.link().is_connected() {
        return;
    }
    lc.connecting = true;
    lc.manual_disconnect = false;
    if let Some(task) = lc.reconnect_task.take() {
        task.abort();
    }
    let task_inner = Arc::clone(inner);
    lc.event_task = Some(tokio::spawn(async move {
        run_connection(task_inner).await;
    }));
}

fn schedule_reconnect(inner: &Arc<ClientInner>) {
    let Some(timeout) = inner.reconnect_timeout else {
        return;
    };
    let mut lc = inner.lifecycle.lock();
    if lc.manual_disconnect {
        return;
    }
    // repeated closes reschedule rather than stack timers
    if let Some(task) = lc.reconnect_task.take() {
        task.abort();
    }
    let task_inner = Arc::clone(inner);
    lc.reconnect_task = Some(tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        connect_inner(&task_inner);
    }));
}

async fn run_connection(inner: Arc<ClientInner>) {
    let link = match inner.connector.open(&inner.url).await {
        Ok(link) => link,
        Err(e) => {
            tracing::warn!("connect to {} failed: {e}", inner.url);
            inner.lifecycle.lock().connecting = false;
            schedule_reconnect(&inner);
            return;
        }
    };
    let TransportLink { sender, mut events } = link;

    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Open => {
                // the client always advertises binary capability
                inner.core.link().attach(sender.clone(), true);
                {
                    let mut lc = inner.lifecycle.lock();
                    lc.connecting = false;
                    if let Some(interval) = inner.ping_interval {
                        let ping_inner = Arc::clone(&inner);
                        lc.ping_task = Some(tokio::spawn(async move {
                            let mut timer = tokio::time::interval(interval);
                            timer.tick().await;
                            loop {
                                timer.tick().await;
                                ping_inner.core.ping_tick();
                            }
                        }));
                    }
                }
                inner.core.on_open();
                if let Err(message) = inner.handler.lock().await.connected().await {
                    tracing::error!("connected handler failed: {message}");
                }
            }
            LinkEvent::Message(message) => {
                if let Err(e) = inner.core.on_message(&message, &inner.handler).await {
                    match &inner.error_handler {
                        Some(handler) => handler.handle_recv_error(&e, &message),
                        None => {
                            // loud by default: drop the connection
                            tracing::error!("receive failed: {e}");
                            sender.close();
                            break;
                        }
                    }
                }
            }
            // transport errors carry no state change; the close event, if
            // any, drives cleanup
            LinkEvent::Error(_) => {}
            LinkEvent::Closed => break,
        }
    }

    let was_connected = inner.core.link().is_connected();
    inner.core.on_close();
    {
        let mut lc = inner.lifecycle.lock();
        lc.connecting = false;
        if let Some(task) = lc.ping_task.take() {
            task.abort();
        }
    }
    if was_connected {
        if let Err(message) = inner.handler.lock().await.disconnected().await {
            tracing::error!("disconnected handler failed: {message}");
        }
    }
    let manual = inner.lifecycle.lock().manual_disconnect;
    if !manual {
        schedule_reconnect(&inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::MethodOptions;
    use crate::session::Outcome;
    use crate::transport::memory::{manual_connector, ManualPeer};
    use crate::transport::ReadyState;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Record {
        connected: usize,
        disconnected: usize,
        invalid_versions: Vec<u64>,
        invoked: Vec<(usize, Vec<Value>)>,
    }

    struct TestHandler {
        record: Arc<StdMutex<Record>>,
    }

    #[async_trait]
    impl SessionHandler for TestHandler {
        async fn connected(&mut self) -> std::result::Result<(), String> {
            self.record.lock().unwrap().connected += 1;
            Ok(())
        }

        async fn disconnected(&mut self) -> std::result::Result<(), String> {
            self.record.lock().unwrap().disconnected += 1;
            Ok(())
        }

        fn invalid_version(&mut self, _local: u64, remote: u64) {
            self.record.lock().unwrap().invalid_versions.push(remote);
        }

        fn invoke(
            &mut self,
            method: usize,
            args: Vec<Value>,
        ) -> std::result::Result<Outcome, String> {
            self.record.lock().unwrap().invoked.push((method, args));
            Ok(Outcome::None)
        }
    }

    fn options() -> ClientOptions {
        ClientOptions {
            host: "example.com".to_string(),
            path: Some("/test".to_string()),
            hash: Some(123),
            ping_interval: Some(Duration::from_secs(1)),
            request_params: vec![
                ("foo".to_string(), "bar".to_string()),
                ("x".to_string(), "5".to_string()),
            ],
            reconnect_timeout: Some(Duration::from_secs(1)),
            client: MethodTable::builder()
                .method("test")
                .method("foo")
                .build()
                .unwrap(),
            server: MethodTable::builder()
                .method("test2")
                .method_with("foo", MethodOptions::promise().progress())
                .method_with(
                    "foo2",
                    MethodOptions::promise().rate_limit("1/s".parse().unwrap()),
                )
                .method_with(
                    "foo3",
                    MethodOptions::new().rate_limit("1/s".parse().unwrap()),
                )
                .build()
                .unwrap(),
            ..ClientOptions::default()
        }
    }

    struct Fixture {
        session: ClientSession,
        record: Arc<StdMutex<Record>>,
        peers: mpsc::UnboundedReceiver<ManualPeer>,
    }

    fn fixture_with(options: ClientOptions) -> Fixture {
        let record = Arc::new(StdMutex::new(Record::default()));
        let (connector, peers) = manual_connector();
        let session = ClientSession::new(
            options,
            TestHandler {
                record: Arc::clone(&record),
            },
            connector,
            None,
        );
        Fixture {
            session,
            record,
            peers,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(options())
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not met in time");
    }

    async fn connected_fixture() -> (Fixture, ManualPeer) {
        let mut f = fixture();
        f.session.connect();
        let peer = f.peers.recv().await.unwrap();
        peer.open();
        let session = &f.session;
        wait_until(|| session.is_connected()).await;
        (f, peer)
    }

    fn texts(messages: Vec<WireMessage>) -> Vec<String> {
        messages
            .into_iter()
            .filter_map(|m| match m {
                WireMessage::Text(t) => Some(t),
                WireMessage::Binary(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_connect_builds_proper_url() {
        let mut f = fixture();
        f.session.connect();
        let peer = f.peers.recv().await.unwrap();
        assert_eq!(peer.url, "ws://example.com/test?foo=bar&x=5&bin=true");
    }

    #[tokio::test]
    async fn test_default_path_is_ws() {
        let mut opts = options();
        opts.path = None;
        let mut f = fixture_with(opts);
        f.session.connect();
        let peer = f.peers.recv().await.unwrap();
        assert_eq!(peer.url, "ws://example.com/ws?foo=bar&x=5&bin=true");
    }

    #[tokio::test]
    async fn test_secure_scheme() {
        let mut opts = options();
        opts.secure = true;
        let mut f = fixture_with(opts);
        f.session.connect();
        let peer = f.peers.recv().await.unwrap();
        assert_eq!(peer.url, "wss://example.com/test?foo=bar&x=5&bin=true");
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let mut f = fixture();
        f.session.connect();
        f.session.connect();
        let _first = f.peers.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(f.peers.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_when_not_connected_is_noop() {
        let f = fixture();
        f.session.disconnect();
    }

    #[tokio::test]
    async fn test_disconnect_closes_socket() {
        let (f, mut peer) = connected_fixture().await;
        f.session.disconnect();
        wait_until(|| peer.close_requested()).await;
    }

    #[tokio::test]
    async fn test_open_sets_connected_and_calls_handler() {
        let (f, _peer) = connected_fixture().await;
        assert!(f.session.is_connected());
        assert_eq!(f.record.lock().unwrap().connected, 1);
    }

    #[tokio::test]
    async fn test_close_clears_connected_and_calls_handler() {
        let (f, peer) = connected_fixture().await;
        peer.close();
        let session = &f.session;
        wait_until(|| !session.is_connected()).await;
        wait_until(|| f.record.lock().unwrap().disconnected == 1).await;
    }

    #[tokio::test]
    async fn test_close_without_open_skips_disconnected_handler() {
        let mut f = fixture();
        f.session.connect();
        let peer = f.peers.recv().await.unwrap();
        peer.close();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.record.lock().unwrap().disconnected, 0);
    }

    #[tokio::test]
    async fn test_transport_error_is_swallowed() {
        let (f, peer) = connected_fixture().await;
        peer.error("boom");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(f.session.is_connected());
    }

    #[tokio::test]
    async fn test_version_match_no_callback() {
        let (f, peer) = connected_fixture().await;
        peer.message_text("[255,123]");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(f.record.lock().unwrap().invalid_versions.is_empty());
    }

    #[tokio::test]
    async fn test_version_mismatch_calls_callback_once() {
        let (f, peer) = connected_fixture().await;
        peer.message_text("[255,321]");
        wait_until(|| f.record.lock().unwrap().invalid_versions == vec![321]).await;
    }

    #[tokio::test]
    async fn test_ping_answered_once_after_handshake() {
        let (_f, mut peer) = connected_fixture().await;
        peer.message_text("[255,123]");
        tokio::time::sleep(Duration::from_millis(10)).await;
        peer.sent();

        peer.message_text("");
        peer.message_text("");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(texts(peer.sent()), vec![String::new()]);
    }

    #[tokio::test]
    async fn test_no_ping_reply_before_handshake() {
        let (_f, mut peer) = connected_fixture().await;
        peer.sent();
        peer.message_text("");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(texts(peer.sent()).is_empty());
    }

    #[tokio::test]
    async fn test_no_ping_reply_when_socket_not_open() {
        let (_f, mut peer) = connected_fixture().await;
        peer.message_text("[255,123]");
        tokio::time::sleep(Duration::from_millis(10)).await;
        peer.sent();

        peer.set_ready_state(ReadyState::Closed);
        peer.message_text("");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(texts(peer.sent()).is_empty());
    }

    #[tokio::test]
    async fn test_notify_sends_frame() {
        let (f, mut peer) = connected_fixture().await;
        peer.sent();
        assert!(f.session.remote().notify("test2", vec![]).unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(texts(peer.sent()), vec!["[0]".to_string()]);
    }

    #[tokio::test]
    async fn test_notify_dropped_when_socket_not_open() {
        let (f, mut peer) = connected_fixture().await;
        peer.sent();
        peer.set_ready_state(ReadyState::Closed);
        assert!(f.session.remote().notify("test2", vec![]).unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(texts(peer.sent()).is_empty());
    }

    #[tokio::test]
    async fn test_promise_call_not_connected() {
        let f = fixture();
        match f.session.remote().call("foo", vec![]).await {
            Err(SockwireError::NotConnected) => {}
            other => panic!("expected not connected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rate_limited_promise_rejects() {
        let (f, _peer) = connected_fixture().await;
        let remote = f.session.remote();
        let first = remote.call("foo2", vec![]);
        tokio::pin!(first);
        let _ = tokio::time::timeout(Duration::from_millis(5), &mut first).await;

        match remote.call("foo2", vec![]).await {
            Err(SockwireError::RateLimit) => {}
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rate_limited_notify_returns_false() {
        let (f, mut peer) = connected_fixture().await;
        peer.sent();
        let remote = f.session.remote();
        assert!(remote.notify("foo3", vec![]).unwrap());
        assert!(!remote.notify("foo3", vec![]).unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        // only the admitted call hit the wire
        assert_eq!(texts(peer.sent()).len(), 1);
    }

    #[tokio::test]
    async fn test_promise_resolution_and_progress_flag() {
        let (f, peer) = connected_fixture().await;
        let remote = f.session.remote();

        let call = remote.call("foo", vec![]);
        tokio::pin!(call);
        let _ = tokio::time::timeout(Duration::from_millis(5), &mut call).await;
        assert!(f.session.in_progress("foo"));

        peer.message_text("[254,1,1,\"ok\"]");
        assert_eq!(call.await.unwrap(), Value::from("ok"));
        assert!(!f.session.in_progress("foo"));
    }

    #[tokio::test]
    async fn test_promise_rejection() {
        let (f, peer) = connected_fixture().await;
        let remote = f.session.remote();
        let call = remote.call("foo", vec![]);
        tokio::pin!(call);
        let _ = tokio::time::timeout(Duration::from_millis(5), &mut call).await;

        peer.message_text("[253,1,1,\"fail\"]");
        match call.await {
            Err(SockwireError::Rejected(message)) => assert_eq!(message, "fail"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_out_of_order_settlement() {
        let (f, peer) = connected_fixture().await;
        let remote = f.session.remote();

        let first = remote.call("foo", vec![]);
        let second = remote.call("foo", vec![]);
        tokio::pin!(first);
        tokio::pin!(second);
        let _ = tokio::time::timeout(Duration::from_millis(5), &mut first).await;
        let _ = tokio::time::timeout(Duration::from_millis(5), &mut second).await;

        peer.message_text("[254,1,2,\"a\"]");
        peer.message_text("[254,1,1,\"b\"]");

        assert_eq!(first.await.unwrap(), Value::from("b"));
        assert_eq!(second.await.unwrap(), Value::from("a"));
    }

    #[tokio::test]
    async fn test_stale_settlements_ignored() {
        let (f, peer) = connected_fixture().await;
        let remote = f.session.remote();
        let call = remote.call("foo", vec![]);
        tokio::pin!(call);
        let _ = tokio::time::timeout(Duration::from_millis(5), &mut call).await;

        peer.message_text("[254,1,5,\"ok\"]");
        peer.message_text("[253,1,5,\"fail\"]");
        tokio::time::sleep(Duration::from_millis(10)).await;
        // the real settlement still lands
        peer.message_text("[254,1,1,\"ok\"]");
        assert_eq!(call.await.unwrap(), Value::from("ok"));
    }

    #[tokio::test]
    async fn test_pending_calls_rejected_on_close() {
        let (f, peer) = connected_fixture().await;
        let remote = f.session.remote();
        let call = remote.call("foo", vec![]);
        tokio::pin!(call);
        let _ = tokio::time::timeout(Duration::from_millis(5), &mut call).await;

        peer.close();
        match call.await {
            Err(SockwireError::Disconnected) => {}
            other => panic!("expected disconnected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_incoming_call_dispatches_to_handler() {
        let (f, peer) = connected_fixture().await;
        peer.message_text("[1,2]");
        wait_until(|| f.record.lock().unwrap().invoked == vec![(1, vec![Value::from(2)])]).await;
    }

    struct RecordingErrors {
        errors: StdMutex<Vec<(String, WireMessage)>>,
    }

    impl ClientErrorHandler for RecordingErrors {
        fn handle_recv_error(&self, error: &SockwireError, raw: &WireMessage) {
            self.errors
                .lock()
                .unwrap()
                .push((error.to_string(), raw.clone()));
        }
    }

    #[tokio::test]
    async fn test_recv_error_routed_to_error_handler() {
        let record = Arc::new(StdMutex::new(Record::default()));
        let (connector, mut peers) = manual_connector();
        let errors = Arc::new(RecordingErrors {
            errors: StdMutex::new(Vec::new()),
        });
        let session = ClientSession::new(
            options(),
            TestHandler {
                record: Arc::clone(&record),
            },
            connector,
            Some(errors.clone() as Arc<dyn ClientErrorHandler>),
        );
        session.connect();
        let peer = peers.recv().await.unwrap();
        peer.open();
        wait_until(|| session.is_connected()).await;

        peer.message_text("[9,1]");
        wait_until(|| !errors.errors.lock().unwrap().is_empty()).await;
        {
            let captured = errors.errors.lock().unwrap();
            assert!(captured[0].0.contains("invalid message"));
            assert_eq!(captured[0].1, WireMessage::Text("[9,1]".to_string()));
        }
        // the session stays up
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_recv_error_without_handler_closes_connection() {
        let (f, peer) = connected_fixture().await;
        peer.message_text("[9,1]");
        let session = &f.session;
        wait_until(|| !session.is_connected()).await;
    }

    #[tokio::test]
    async fn test_reconnects_after_unexpected_close() {
        let mut opts = options();
        opts.reconnect_timeout = Some(Duration::from_millis(20));
        let mut f = fixture_with(opts);
        f.session.connect();
        let peer = f.peers.recv().await.unwrap();
        peer.open();
        let session = &f.session;
        wait_until(|| session.is_connected()).await;

        peer.close();
        // a second connection attempt follows the reconnect timeout
        let reconnected = tokio::time::timeout(Duration::from_secs(2), f.peers.recv())
            .await
            .expect("no reconnect attempt")
            .unwrap();
        assert_eq!(reconnected.url, "ws://example.com/test?foo=bar&x=5&bin=true");
    }

    #[tokio::test]
    async fn test_no_reconnect_after_manual_disconnect() {
        let (mut f, _peer) = connected_fixture().await;
        f.session.disconnect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.peers.try_recv().is_err());
    }
}
