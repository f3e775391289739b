//! In-memory session used by protocol handler tests

use super::command::{CloseMode, Command};
use super::session::{EventMask, IoEventHandler, IoSession, SessionHandle, SessionShared, SessionStatus};
use crate::http::tls::{HandshakeStatus, TlsConfig, TlsDetails};
use crate::http::{Error, Result};
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(crate) struct MemorySession {
    shared: Arc<SessionShared>,
    /// Bytes the handler will read
    pub input: BytesMut,
    /// Bytes the handler wrote
    pub output: Vec<u8>,
    /// Peer closed its side once `input` is drained
    pub eof: bool,
    pub mask: EventMask,
    pub closed: Option<CloseMode>,
    pub upgraded: Option<Box<dyn IoEventHandler>>,
    pub tls_started: Option<Vec<String>>,
    pub tls: Option<TlsDetails>,
    timeout: Option<Duration>,
    created: Instant,
}

impl MemorySession {
    pub fn new() -> Self {
        MemorySession {
            shared: Arc::new(SessionShared::detached(1)),
            input: BytesMut::new(),
            output: Vec::new(),
            eof: false,
            mask: EventMask::READ,
            closed: None,
            upgraded: None,
            tls_started: None,
            tls: None,
            timeout: None,
            created: Instant::now(),
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.input.extend_from_slice(data);
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    pub fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }
}

impl IoSession for MemorySession {
    fn id(&self) -> u64 {
        1
    }

    fn handle(&self) -> SessionHandle {
        SessionHandle::new(self.shared.clone())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.input.is_empty() {
            return if self.eof {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let n = buf.len().min(self.input.len());
        buf[..n].copy_from_slice(&self.input.split_to(n));
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn event_mask(&self) -> EventMask {
        self.mask
    }

    fn set_event_mask(&mut self, mask: EventMask) {
        self.mask = mask;
    }

    fn poll_command(&mut self) -> Option<Command> {
        self.shared.poll_command()
    }

    fn has_commands(&self) -> bool {
        self.shared.has_commands()
    }

    fn close(&mut self, mode: CloseMode) {
        self.shared.mark_closing();
        if self.closed != Some(CloseMode::Immediate) {
            self.closed = Some(mode);
        }
    }

    fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    fn socket_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn set_socket_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    fn last_read_time(&self) -> Instant {
        self.created
    }

    fn last_write_time(&self) -> Instant {
        self.created
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        "127.0.0.1:4000".parse().ok()
    }

    fn start_tls(&mut self, _config: &TlsConfig, _sni: Option<&str>, alpn: &[&str]) -> Result<()> {
        if self.tls_started.is_some() {
            return Err(Error::IllegalState("TLS already started".to_string()));
        }
        self.tls_started = Some(alpn.iter().map(|p| p.to_string()).collect());
        Ok(())
    }

    fn handshake(&mut self) -> Result<HandshakeStatus> {
        if self.tls_started.is_some() && self.tls.is_none() {
            Ok(HandshakeStatus::WantRead)
        } else {
            Ok(HandshakeStatus::Complete)
        }
    }

    fn tls_details(&self) -> Option<&TlsDetails> {
        self.tls.as_ref()
    }

    fn upgrade(&mut self, handler: Box<dyn IoEventHandler>) {
        self.upgraded = Some(handler);
    }
}
