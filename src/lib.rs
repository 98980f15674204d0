//! # sockwire
//!
//! Bidirectional RPC over message-oriented sockets.
//!
//! Both endpoints expose ordered method tables to each other; calls are
//! framed into compact messages over a single connection, and responses to
//! promise-returning calls are correlated back to their caller.
//!
//! ## Architecture
//!
//! - **Value codec** ([`codec`]): primitive packet read/write operations and
//!   a compact, self-describing encoding for untyped values with bounded
//!   string deduplication.
//! - **Frame protocol** ([`protocol`]): one message stream multiplexing the
//!   version handshake, keep-alives and promise settlements with method
//!   calls; methods with a fixed binary schema take a tag-free fast path.
//! - **Sessions**: [`client::ClientSession`] owns one outbound connection
//!   (handshake, keep-alive, correlation, rate limiting, reconnection);
//!   [`server::create_server`] manages the inbound set (admission control,
//!   dispatch, broadcast, error containment).
//!
//! ## Example
//!
//! ```ignore
//! use sockwire::{ClientOptions, ClientSession, MethodOptions, MethodTable};
//! use sockwire::transport::ws::WsConnector;
//!
//! let server_methods = MethodTable::builder()
//!     .method("hello")
//!     .method_with("login", MethodOptions::promise())
//!     .build()?;
//!
//! let session = ClientSession::new(
//!     ClientOptions {
//!         host: "example.com".to_string(),
//!         server: server_methods,
//!         ..ClientOptions::default()
//!     },
//!     (),
//!     WsConnector::new(),
//!     None,
//! );
//! session.connect();
//! let result = session.remote().call("login", vec!["user".into()]).await?;
//! ```

pub mod client;
pub mod codec;
pub mod error;
pub mod method;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

mod link;

pub use client::{ClientErrorHandler, ClientOptions, ClientSession, RemoteProxy};
pub use codec::{decode_value, encode_value, Value};
pub use error::{CodecError, Result, SockwireError};
pub use method::{Bin, MethodOptions, MethodTable, RateLimit};
pub use server::{
    broadcast, create_server, ClientHandle, ServerErrorHandler, ServerOptions, SessionManager,
};
pub use session::{Outcome, SessionHandler};
