//! Non-blocking TLS channel
//!
//! Wraps the session's mio socket in an OpenSSL stream. The handshake is
//! driven step by step from the session's event callbacks; reads and writes
//! surface OpenSSL's want-read / want-write as `WouldBlock`.

use super::config::TlsError;
use super::details::TlsDetails;
use crate::reactor::channel::SessionOps;
use mio::net::TcpStream;
use openssl::ssl::{ErrorCode, ShutdownResult, Ssl, SslStream};
use std::io::{self, Read, Write};
use std::net::Shutdown;
use tracing::{debug, trace};

/// Progress of a non-blocking handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    Complete,
    /// Waiting for bytes from the peer
    WantRead,
    /// Waiting for the socket to accept more bytes
    WantWrite,
}

/// TLS over a non-blocking TCP stream
pub struct TlsChannel {
    stream: SslStream<TcpStream>,
    details: Option<TlsDetails>,
    failed: bool,
}

impl TlsChannel {
    /// Wrap `stream`; the server side accepts, the client side connects
    pub fn new(mut ssl: Ssl, stream: TcpStream, server: bool) -> Result<Self, TlsError> {
        if server {
            ssl.set_accept_state();
        } else {
            ssl.set_connect_state();
        }
        Ok(TlsChannel {
            stream: SslStream::new(ssl, stream)?,
            details: None,
            failed: false,
        })
    }

    /// Advance the handshake as far as the socket allows
    pub fn handshake(&mut self) -> Result<HandshakeStatus, TlsError> {
        if self.details.is_some() {
            return Ok(HandshakeStatus::Complete);
        }
        match self.stream.do_handshake() {
            Ok(()) => {
                let details = TlsDetails::from_ssl(self.stream.ssl());
                debug!(
                    version = %details.version,
                    cipher = %details.cipher,
                    alpn = ?details.alpn,
                    "TLS handshake complete"
                );
                self.details = Some(details);
                Ok(HandshakeStatus::Complete)
            }
            Err(e) if e.code() == ErrorCode::WANT_READ => Ok(HandshakeStatus::WantRead),
            Err(e) if e.code() == ErrorCode::WANT_WRITE => Ok(HandshakeStatus::WantWrite),
            Err(e) => match e.into_io_error() {
                Ok(io) if io.kind() == io::ErrorKind::WouldBlock => Ok(HandshakeStatus::WantRead),
                Ok(io) => {
                    self.failed = true;
                    Err(io.into())
                }
                Err(e) => {
                    self.failed = true;
                    Err(TlsError::HandshakeFailed(e.to_string()))
                }
            },
        }
    }

    pub fn details(&self) -> Option<&TlsDetails> {
        self.details.as_ref()
    }
}

impl SessionOps for TlsChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.read(buf) {
            Err(e) if e.kind() != io::ErrorKind::WouldBlock && e.kind() != io::ErrorKind::Interrupted => {
                self.failed = true;
                Err(e)
            }
            other => other,
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stream.write(buf) {
            Err(e) if e.kind() != io::ErrorKind::WouldBlock && e.kind() != io::ErrorKind::Interrupted => {
                self.failed = true;
                Err(e)
            }
            other => other,
        }
    }

    /// Send close_notify when the session is healthy, then shut the socket's write side
    fn shutdown(&mut self) -> io::Result<()> {
        if !self.failed && self.details.is_some() {
            match self.stream.shutdown() {
                Ok(ShutdownResult::Sent) | Ok(ShutdownResult::Received) => {}
                Err(e) => trace!(error = %e, "TLS close_notify not sent"),
            }
        }
        match self.stream.get_mut().shutdown(Shutdown::Write) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn socket(&mut self) -> &mut TcpStream {
        self.stream.get_mut()
    }
}
