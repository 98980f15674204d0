//! Outbound call state for one connection.
//!
//! A [`RemoteLink`] owns everything a proxy needs to call the peer: the
//! packet codec, the negotiated encoding mode, the correlation table of
//! pending promise calls, lazily created rate-limit windows and the
//! progress flags of methods that declare one. Both the client session and
//! each server-side client handle wrap one link; the session event loop
//! feeds settlements back into it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::codec::Value;
use crate::error::{Result, SockwireError};
use crate::method::RateLimit;
use crate::protocol::PacketCodec;
use crate::transport::{MessageSender, ReadyState, WireMessage};

const BINDING_UNBOUND: u8 = 0;
const BINDING_BOUND: u8 = 1;
const BINDING_INVALID: u8 = 2;

/// An in-flight promise-returning call.
struct PendingCall {
    tx: oneshot::Sender<Result<Value>>,
    progress: Option<Arc<AtomicBool>>,
}

/// Per-method call-admission window.
#[derive(Debug, Default)]
struct RateWindow {
    timestamps: VecDeque<Instant>,
}

impl RateWindow {
    /// Admit a call at `now`, recording it, or refuse.
    fn admit(&mut self, limit: &RateLimit, now: Instant) -> bool {
        while let Some(front) = self.timestamps.front() {
            if now.duration_since(*front) >= limit.frame {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
        if self.timestamps.len() < limit.limit as usize {
            self.timestamps.push_back(now);
            true
        } else {
            false
        }
    }
}

struct LinkState {
    sender: Option<MessageSender>,
    binary: bool,
    connected: bool,
    next_id: u32,
    pending: HashMap<u32, PendingCall>,
    rate: HashMap<usize, RateWindow>,
}

/// Outbound side of one connection.
pub(crate) struct RemoteLink {
    codec: PacketCodec,
    progress: Vec<Option<Arc<AtomicBool>>>,
    binding: AtomicU8,
    state: Mutex<LinkState>,
}

impl RemoteLink {
    pub(crate) fn new(codec: PacketCodec) -> Arc<Self> {
        let progress = codec
            .remote_table()
            .iter()
            .map(|desc| {
                desc.options
                    .progress
                    .then(|| Arc::new(AtomicBool::new(false)))
            })
            .collect();
        Arc::new(Self {
            codec,
            progress,
            binding: AtomicU8::new(BINDING_UNBOUND),
            state: Mutex::new(LinkState {
                sender: None,
                binary: false,
                connected: false,
                next_id: 1,
                pending: HashMap::new(),
                rate: HashMap::new(),
            }),
        })
    }

    pub(crate) fn codec(&self) -> &PacketCodec {
        &self.codec
    }

    /// Bind a live transport connection to this link.
    pub(crate) fn attach(&self, sender: MessageSender, binary: bool) {
        let mut st = self.state.lock();
        st.sender = Some(sender);
        st.binary = binary;
        st.connected = true;
        let _ = self.binding.compare_exchange(
            BINDING_UNBOUND,
            BINDING_BOUND,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Tear the connection down, rejecting every pending call.
    pub(crate) fn detach(&self) {
        let pending = {
            let mut st = self.state.lock();
            st.connected = false;
            st.sender = None;
            std::mem::take(&mut st.pending)
        };
        for (_, call) in pending {
            if let Some(flag) = &call.progress {
                flag.store(false, Ordering::Release);
            }
            let _ = call.tx.send(Err(SockwireError::Disconnected));
        }
    }

    /// Mark this link permanently unusable as a broadcast target.
    pub(crate) fn invalidate(&self) {
        self.binding.store(BINDING_INVALID, Ordering::Release);
    }

    /// Whether this link was ever bound and not invalidated.
    pub(crate) fn is_broadcast_target(&self) -> bool {
        self.binding.load(Ordering::Acquire) == BINDING_BOUND
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub(crate) fn binary_mode(&self) -> bool {
        self.state.lock().binary
    }

    pub(crate) fn sender(&self) -> Option<MessageSender> {
        self.state.lock().sender.clone()
    }

    /// Close the bound transport connection, if any.
    pub(crate) fn close_transport(&self) {
        if let Some(sender) = self.sender() {
            sender.close();
        }
    }

    /// Progress flag of a method, false when none is declared.
    pub(crate) fn in_progress(&self, method: &str) -> bool {
        self.codec
            .remote_table()
            .index_of(method)
            .and_then(|index| self.progress.get(index).cloned().flatten())
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    /// Send a pre-encoded frame if the connection is open.
    pub(crate) fn send_raw(&self, message: WireMessage) {
        let st = self.state.lock();
        send_locked(&st, message);
    }

    /// Invoke a promise-returning method on the peer.
    pub(crate) async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let table = self.codec.remote_table();
        let index = table
            .index_of(method)
            .ok_or_else(|| SockwireError::Protocol(format!("unknown method: {method}")))?;
        let desc = table
            .get(index)
            .cloned()
            .ok_or_else(|| SockwireError::Protocol(format!("unknown method: {method}")))?;
        if !desc.options.promise {
            return Err(SockwireError::Protocol(format!(
                "method does not return a promise: {method}"
            )));
        }

        let rx = {
            let mut st = self.state.lock();
            if let Some(limit) = &desc.options.rate_limit {
                if !st
                    .rate
                    .entry(index)
                    .or_default()
                    .admit(limit, Instant::now())
                {
                    return Err(SockwireError::RateLimit);
                }
            }
            if !st.connected {
                return Err(SockwireError::NotConnected);
            }

            let id = next_correlation_id(&mut st);
            let message = self.codec.encode_call(index, Some(id), &args, st.binary)?;

            let progress = self.progress.get(index).cloned().flatten();
            if let Some(flag) = &progress {
                flag.store(true, Ordering::Release);
            }
            let (tx, rx) = oneshot::channel();
            st.pending.insert(id, PendingCall { tx, progress });
            send_locked(&st, message);
            rx
        };

        match rx.await {
            Ok(result) => result,
            // settlement side dropped without answering
            Err(_) => Err(SockwireError::Disconnected),
        }
    }

    /// Invoke a fire-and-forget method on the peer.
    ///
    /// Returns `false` only when a rate-limit window refused the call; a
    /// disconnected session drops the call silently and still returns
    /// `true`.
    pub(crate) fn notify(&self, method: &str, args: Vec<Value>) -> Result<bool> {
        let table = self.codec.remote_table();
        let index = table
            .index_of(method)
            .ok_or_else(|| SockwireError::Protocol(format!("unknown method: {method}")))?;
        let desc = table
            .get(index)
            .cloned()
            .ok_or_else(|| SockwireError::Protocol(format!("unknown method: {method}")))?;
        if desc.options.promise {
            return Err(SockwireError::Protocol(format!(
                "method returns a promise, use call: {method}"
            )));
        }

        let mut st = self.state.lock();
        if let Some(limit) = &desc.options.rate_limit {
            if !st
                .rate
                .entry(index)
                .or_default()
                .admit(limit, Instant::now())
            {
                return Ok(false);
            }
        }
        if !st.connected {
            return Ok(true);
        }
        let message = self.codec.encode_call(index, None, &args, st.binary)?;
        send_locked(&st, message);
        Ok(true)
    }

    /// Resolve the pending call with the given correlation id.
    ///
    /// Unknown or already-settled ids are ignored.
    pub(crate) fn settle_resolved(&self, id: u32, value: Value) {
        self.settle(id, Ok(value));
    }

    /// Reject the pending call with the given correlation id.
    pub(crate) fn settle_rejected(&self, id: u32, error: String) {
        self.settle(id, Err(SockwireError::Rejected(error)));
    }

    fn settle(&self, id: u32, result: Result<Value>) {
        let call = self.state.lock().pending.remove(&id);
        if let Some(call) = call {
            if let Some(flag) = &call.progress {
                flag.store(false, Ordering::Release);
            }
            let _ = call.tx.send(result);
        }
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }
}

fn send_locked(st: &LinkState, message: WireMessage) {
    if let Some(sender) = &st.sender {
        if sender.ready_state() == ReadyState::Open {
            sender.send(message);
        }
    }
}

/// Next correlation id, never reusing one that is still pending.
fn next_correlation_id(st: &mut LinkState) -> u32 {
    loop {
        let id = st.next_id;
        st.next_id = st.next_id.wrapping_add(1).max(1);
        if !st.pending.contains_key(&id) {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::{MethodOptions, MethodTable};
    use crate::transport::{Outbound, ReadyStateCell};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn test_link() -> (Arc<RemoteLink>, mpsc::UnboundedReceiver<Outbound>) {
        let remote = MethodTable::builder()
            .method("hello")
            .method_with("login", MethodOptions::promise().progress())
            .method_with(
                "limited",
                MethodOptions::promise().rate_limit("1/s".parse().unwrap()),
            )
            .method_with("ping", MethodOptions::new().rate_limit("1/s".parse().unwrap()))
            .build()
            .unwrap();
        let codec = PacketCodec::new(Arc::new(remote), Arc::new(MethodTable::empty()));
        let link = RemoteLink::new(codec);

        let (tx, rx) = mpsc::unbounded_channel();
        let sender = MessageSender::new(tx, ReadyStateCell::new(ReadyState::Open));
        link.attach(sender, false);
        (link, rx)
    }

    fn sent_text(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Message(WireMessage::Text(t)) = item {
                out.push(t);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_notify_writes_call_frame() {
        let (link, mut rx) = test_link();
        assert!(link.notify("hello", vec![Value::from("hi")]).unwrap());
        assert_eq!(sent_text(&mut rx), vec!["[0,\"hi\"]".to_string()]);
    }

    #[tokio::test]
    async fn test_call_settles_with_matching_id() {
        let (link, mut rx) = test_link();

        let call = link.call("login", vec![]);
        tokio::pin!(call);
        // give the send a chance, then settle
        assert!(tokio::time::timeout(Duration::from_millis(10), &mut call)
            .await
            .is_err());
        assert_eq!(sent_text(&mut rx), vec!["[1,1]".to_string()]);

        link.settle_resolved(1, Value::from("ok"));
        assert_eq!(call.await.unwrap(), Value::from("ok"));
        assert_eq!(link.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_settlement() {
        let (link, _rx) = test_link();

        let first = link.call("login", vec![]);
        let second = link.call("login", vec![]);
        tokio::pin!(first);
        tokio::pin!(second);
        let _ = tokio::time::timeout(Duration::from_millis(5), &mut first).await;
        let _ = tokio::time::timeout(Duration::from_millis(5), &mut second).await;

        link.settle_resolved(2, Value::from("a"));
        link.settle_resolved(1, Value::from("b"));

        assert_eq!(first.await.unwrap(), Value::from("b"));
        assert_eq!(second.await.unwrap(), Value::from("a"));
    }

    #[tokio::test]
    async fn test_stale_settlement_ignored() {
        let (link, _rx) = test_link();
        link.settle_resolved(5, Value::from("ok"));
        link.settle_rejected(6, "fail".to_string());
    }

    #[tokio::test]
    async fn test_rejection_carries_message() {
        let (link, _rx) = test_link();
        let call = link.call("login", vec![]);
        tokio::pin!(call);
        let _ = tokio::time::timeout(Duration::from_millis(5), &mut call).await;

        link.settle_rejected(1, "fail".to_string());
        match call.await {
            Err(SockwireError::Rejected(msg)) => assert_eq!(msg, "fail"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_call_not_connected() {
        let (link, _rx) = test_link();
        link.detach();
        match link.call("login", vec![]).await {
            Err(SockwireError::NotConnected) => {}
            other => panic!("expected not connected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_detach_rejects_pending() {
        let (link, _rx) = test_link();
        let call = link.call("login", vec![]);
        tokio::pin!(call);
        let _ = tokio::time::timeout(Duration::from_millis(5), &mut call).await;

        link.detach();
        match call.await {
            Err(SockwireError::Disconnected) => {}
            other => panic!("expected disconnected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rate_limit_promise_rejects_without_write() {
        let (link, mut rx) = test_link();

        let first = link.call("limited", vec![]);
        tokio::pin!(first);
        let _ = tokio::time::timeout(Duration::from_millis(5), &mut first).await;
        assert_eq!(sent_text(&mut rx).len(), 1);

        match link.call("limited", vec![]).await {
            Err(SockwireError::RateLimit) => {}
            other => panic!("expected rate limit, got {other:?}"),
        }
        assert!(sent_text(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_notify_returns_false_without_write() {
        let (link, mut rx) = test_link();
        assert!(link.notify("ping", vec![]).unwrap());
        assert_eq!(sent_text(&mut rx).len(), 1);

        assert!(!link.notify("ping", vec![]).unwrap());
        assert!(sent_text(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_progress_flag_lifecycle() {
        let (link, _rx) = test_link();
        assert!(!link.in_progress("login"));

        let call = link.call("login", vec![]);
        tokio::pin!(call);
        let _ = tokio::time::timeout(Duration::from_millis(5), &mut call).await;
        assert!(link.in_progress("login"));

        link.settle_resolved(1, Value::Null);
        let _ = call.await;
        assert!(!link.in_progress("login"));
    }

    #[tokio::test]
    async fn test_broadcast_target_binding() {
        let codec = PacketCodec::new(
            Arc::new(MethodTable::empty()),
            Arc::new(MethodTable::empty()),
        );
        let link = RemoteLink::new(codec);
        assert!(!link.is_broadcast_target());

        let (tx, _rx) = mpsc::unbounded_channel();
        link.attach(
            MessageSender::new(tx, ReadyStateCell::new(ReadyState::Open)),
            false,
        );
        assert!(link.is_broadcast_target());

        link.invalidate();
        assert!(!link.is_broadcast_target());
    }

    #[tokio::test]
    async fn test_correlation_ids_monotone() {
        let (link, mut rx) = test_link();
        for expected in 1..=3u32 {
            let call = link.call("login", vec![]);
            tokio::pin!(call);
            let _ = tokio::time::timeout(Duration::from_millis(2), &mut call).await;
            let frames = sent_text(&mut rx);
            assert_eq!(frames, vec![format!("[1,{expected}]")]);
            link.settle_resolved(expected, Value::Null);
            let _ = call.await;
        }
    }
}
