//! HTTP protocol layer
//!
//! This module hosts the two protocol engines that run on top of the
//! [`reactor`](crate::reactor) and everything they share.
//!
//! # Architecture
//!
//! Every connection starts with a protocol negotiator which, after an optional
//! TLS handshake, installs exactly one terminal engine:
//!
//! - `h1::ClientHttp1Duplexer` / `h1::ServerHttp1Duplexer` drive one
//!   request/response exchange at a time with full-duplex body streaming
//! - `h2::H2Multiplexer` drives many concurrent streams over one connection
//!
//! Application code plugs in through the exchange handler contract in
//! [`exchange`]; both engines invoke it identically, so handlers do not need
//! to know which protocol is on the wire.
//!
//! # Examples
//!
//! ```no_run
//! use hxcore::http::client::HttpClient;
//! use hxcore::http::negotiator::{ProtocolConfig, VersionPolicy};
//! use hxcore::http::support::BasicClientExchange;
//! use hxcore::http::{Method, RequestHead};
//! use std::time::Duration;
//!
//! let config = ProtocolConfig::builder().policy(VersionPolicy::ForceHttp1).build();
//! let client = HttpClient::start(config).unwrap();
//!
//! let endpoint = client
//!     .connect("127.0.0.1:8080".parse().unwrap(), Duration::from_secs(5))
//!     .wait(Duration::from_secs(5))
//!     .unwrap();
//!
//! let request = RequestHead::new(Method::Get, "/").header("Host", "localhost");
//! let (exchange, response) = BasicClientExchange::new(request, None);
//! endpoint.execute(Box::new(exchange));
//!
//! let response = response.wait(Duration::from_secs(5)).unwrap();
//! assert_eq!(response.head.status.code(), 200);
//! ```

pub mod chunked;
pub mod client;
pub mod exchange;
pub mod h1;
pub mod h2;
pub mod headers;
pub mod message;
pub mod negotiator;
pub mod parser;
pub mod server;
pub mod strategy;
pub mod support;
pub mod tls;

pub use exchange::{
    CapacityChannel, ClientExchangeHandler, DataExchangeHandler, DataStreamChannel, RequestChannel,
    ResponseChannel, ServerExchangeHandler, ServerExchangeHandlerFactory,
};
pub use headers::Headers;
pub use message::{Method, RequestHead, ResponseHead, Status, Version};

use std::sync::Arc;

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP operation errors
///
/// Errors are cheap to clone so that one connection failure can be reported
/// to every exchange pending on that connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid HTTP version: {0}")]
    InvalidVersion(String),

    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("Invalid HTTP status: {0}")]
    InvalidStatus(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(String),

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Protocol negotiation failed: {0}")]
    Negotiation(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("HTTP/2 error: {0}")]
    H2(#[from] h2::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] tls::TlsError),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl Error {
    /// Whether the error is a transport level failure rather than a protocol violation
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_) | Error::ConnectionClosed | Error::Timeout)
    }
}

/// Maximum number of headers per message
pub const MAX_HEADERS: usize = 64;

/// CRLF line ending
pub const CRLF: &str = "\r\n";
