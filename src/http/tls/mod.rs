//! TLS support for reactor sessions
//!
//! A session starts out as plain TCP and is upgraded in place with
//! `IoSession::start_tls`. The handshake is then driven from the session's
//! readiness events like any other I/O, so both peers stay non-blocking.
//!
//! # Components
//!
//! 1. `TlsConfig` holds the OpenSSL context plus ALPN and SNI settings
//! 2. `TlsChannel` wraps the session socket and implements `SessionOps`
//! 3. `TlsDetails` records what the handshake negotiated
//!
//! # Example
//!
//! ```no_run
//! use hxcore::http::tls::{TlsConfig, TlsVersion};
//!
//! let client = TlsConfig::client()
//!     .version_range(TlsVersion::Tls12, TlsVersion::Tls13)
//!     .servername("example.com")
//!     .alpn(&["h2", "http/1.1"])
//!     .verify_peer(true)
//!     .build()
//!     .unwrap();
//!
//! // Without a certificate the server presents a generated self-signed one
//! let server = TlsConfig::server().alpn(&["h2", "http/1.1"]).build().unwrap();
//! # let _ = (client, server);
//! ```

pub mod channel;
pub mod config;
pub mod details;

pub use channel::{HandshakeStatus, TlsChannel};
pub use config::{
    ClientConfigBuilder, ClientVerify, ServerConfigBuilder, TlsConfig, TlsError, TlsVersion,
};
pub use details::{CertInfo, TlsDetails};

use std::net::SocketAddr;

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;

/// Accepts or rejects a session once its handshake has completed
///
/// Returning an error closes the session before any HTTP traffic is exchanged.
pub trait TlsSessionVerifier: Send + Sync {
    fn verify(&self, remote: Option<SocketAddr>, details: &TlsDetails) -> Result<()>;
}

impl<F> TlsSessionVerifier for F
where
    F: Fn(Option<SocketAddr>, &TlsDetails) -> Result<()> + Send + Sync,
{
    fn verify(&self, remote: Option<SocketAddr>, details: &TlsDetails) -> Result<()> {
        self(remote, details)
    }
}
