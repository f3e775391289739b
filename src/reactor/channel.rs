//! Byte channels underneath a session
//!
//! The session performs all I/O through the `SessionOps` trait so that plain
//! TCP and TLS connections look the same to the protocol handlers. A TLS
//! upgrade swaps the plain channel for a [`TlsChannel`] in place.

use crate::http::tls::TlsChannel;
use mio::net::TcpStream;
use std::io::{self, Read, Write};
use std::net::Shutdown;

/// Non-blocking byte channel operations
pub trait SessionOps: Send {
    /// Read into `buf`; `WouldBlock` when nothing is available
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write from `buf`; `WouldBlock` when the socket buffer is full
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Orderly shutdown of the write side
    fn shutdown(&mut self) -> io::Result<()>;

    /// The registered socket
    fn socket(&mut self) -> &mut TcpStream;
}

/// Plain TCP channel
pub struct PlainChannel {
    stream: TcpStream,
}

impl PlainChannel {
    pub fn new(stream: TcpStream) -> Self {
        PlainChannel { stream }
    }

    pub fn into_inner(self) -> TcpStream {
        self.stream
    }
}

impl SessionOps for PlainChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Write) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn socket(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

/// Channel currently installed on a session
pub(crate) enum Transport {
    Plain(PlainChannel),
    Tls(Box<TlsChannel>),
    Detached,
}

impl Transport {
    pub(crate) fn ops(&mut self) -> Option<&mut dyn SessionOps> {
        match self {
            Transport::Plain(channel) => Some(channel),
            Transport::Tls(channel) => Some(channel.as_mut()),
            Transport::Detached => None,
        }
    }

    pub(crate) fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }
}

pub(crate) fn detached() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "channel detached")
}
