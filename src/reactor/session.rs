//! Sessions: the reactor's view of one connection
//!
//! A session is split in two halves:
//!
//! - [`Session`] owns the channel, the event-interest mask and the timestamps.
//!   It lives on exactly one worker thread and is only ever touched there.
//! - [`SessionHandle`] is a cheap, cloneable reference to the shared part
//!   (status flag, command queue, wake-up signal) and is what every other
//!   thread uses to talk to the session.
//!
//! Protocol handlers are written against the [`IoSession`] trait rather than
//! the concrete type, which lets them be decorated (see [`LoggingSession`]) and
//! exercised against in-memory sessions.

use super::channel::{detached, PlainChannel, SessionOps, Transport};
use super::command::{CloseMode, Command, CommandQueue, Priority};
use crate::http::tls::{HandshakeStatus, TlsChannel, TlsConfig, TlsDetails};
use crate::http::{Error, Result};
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::Waker;
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Readiness events a session is interested in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventMask(u8);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const READ: EventMask = EventMask(0x1);
    pub const WRITE: EventMask = EventMask(0x2);
    pub const READ_WRITE: EventMask = EventMask(0x3);

    pub fn from_bits(bits: u8) -> Self {
        EventMask(bits & Self::READ_WRITE.0)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: EventMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn with(self, other: EventMask) -> Self {
        EventMask(self.0 | other.0)
    }

    pub fn without(self, other: EventMask) -> Self {
        EventMask(self.0 & !other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        self.with(rhs)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: EventMask) {
        *self = self.with(rhs);
    }
}

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionStatus {
    Active = 0,
    Closing = 1,
    Closed = 2,
}

impl SessionStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionStatus::Active,
            1 => SessionStatus::Closing,
            _ => SessionStatus::Closed,
        }
    }
}

/// Wake-up signal of one worker thread
///
/// Sessions push their slab token here when another thread wants the worker
/// to look at them again.
pub(crate) struct Notifier {
    waker: Waker,
    tokens: Mutex<Vec<usize>>,
}

impl Notifier {
    pub(crate) fn new(waker: Waker) -> Self {
        Notifier {
            waker,
            tokens: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn notify(&self, token: usize) {
        self.tokens.lock().push(token);
        self.wake();
    }

    pub(crate) fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            tracing::warn!(error = %e, "failed to wake worker");
        }
    }

    pub(crate) fn take_tokens(&self) -> Vec<usize> {
        std::mem::take(&mut *self.tokens.lock())
    }
}

/// State shared between the owning worker and other threads
pub(crate) struct SessionShared {
    id: u64,
    status: AtomicU8,
    commands: Mutex<CommandQueue<Command>>,
    pending_events: AtomicU8,
    close_requested: AtomicBool,
    signal: Option<(Arc<Notifier>, usize)>,
}

impl SessionShared {
    pub(crate) fn new(id: u64, notifier: Arc<Notifier>, token: usize) -> Self {
        SessionShared {
            id,
            status: AtomicU8::new(SessionStatus::Active as u8),
            commands: Mutex::new(CommandQueue::new()),
            pending_events: AtomicU8::new(0),
            close_requested: AtomicBool::new(false),
            signal: Some((notifier, token)),
        }
    }

    /// Shared state that is not attached to any worker
    #[cfg(test)]
    pub(crate) fn detached(id: u64) -> Self {
        SessionShared {
            id,
            status: AtomicU8::new(SessionStatus::Active as u8),
            commands: Mutex::new(CommandQueue::new()),
            pending_events: AtomicU8::new(0),
            close_requested: AtomicBool::new(false),
            signal: None,
        }
    }

    pub(crate) fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn mark_closing(&self) {
        let _ = self.status.compare_exchange(
            SessionStatus::Active as u8,
            SessionStatus::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Mark the session closed and cancel every queued command.
    ///
    /// Returns false when the session was already closed.
    pub(crate) fn mark_closed(&self) -> bool {
        let drained = {
            let mut queue = self.commands.lock();
            let previous = self.status.swap(SessionStatus::Closed as u8, Ordering::AcqRel);
            if previous == SessionStatus::Closed as u8 {
                return false;
            }
            queue.drain()
        };
        for command in drained {
            command.cancel();
        }
        true
    }

    pub(crate) fn enqueue(&self, command: Command, priority: Priority) -> bool {
        {
            let mut queue = self.commands.lock();
            if self.status() != SessionStatus::Closed {
                queue.push(command, priority);
                drop(queue);
                self.request_event(EventMask::WRITE);
                return true;
            }
        }
        command.cancel();
        false
    }

    pub(crate) fn poll_command(&self) -> Option<Command> {
        self.commands.lock().pop()
    }

    pub(crate) fn has_commands(&self) -> bool {
        !self.commands.lock().is_empty()
    }

    pub(crate) fn request_event(&self, mask: EventMask) {
        self.pending_events.fetch_or(mask.bits(), Ordering::AcqRel);
        self.notify();
    }

    pub(crate) fn take_pending_events(&self) -> EventMask {
        EventMask::from_bits(self.pending_events.swap(0, Ordering::AcqRel))
    }

    pub(crate) fn request_close(&self) {
        self.close_requested.store(true, Ordering::Release);
        self.notify();
    }

    pub(crate) fn take_close_request(&self) -> bool {
        self.close_requested.swap(false, Ordering::AcqRel)
    }

    fn notify(&self) {
        if let Some((notifier, token)) = &self.signal {
            notifier.notify(*token);
        }
    }
}

/// Cross-thread handle to a session
///
/// Handles never perform I/O; they queue commands, request readiness events
/// and flag the session for closing. The owning worker does the rest.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub(crate) fn new(shared: Arc<SessionShared>) -> Self {
        SessionHandle { shared }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    pub fn is_open(&self) -> bool {
        self.shared.status() == SessionStatus::Active
    }

    /// Queue a command for the owning worker.
    ///
    /// If the session is already closed the command is cancelled on the
    /// calling thread and `false` is returned.
    pub fn enqueue(&self, command: Command, priority: Priority) -> bool {
        self.shared.enqueue(command, priority)
    }

    /// Ask the worker to add `mask` to the session's event interest
    pub fn request_event(&self, mask: EventMask) {
        self.shared.request_event(mask);
    }

    /// Ask the worker to call the handler back for output
    pub fn request_output(&self) {
        self.shared.request_event(EventMask::WRITE);
    }

    /// Close the session.
    ///
    /// `Graceful` queues a shutdown command ahead of any pending work so the
    /// protocol handler can finish in-flight exchanges; `Immediate` tears the
    /// connection down on the next worker iteration.
    pub fn close(&self, mode: CloseMode) {
        match mode {
            CloseMode::Graceful => {
                self.shared
                    .enqueue(Command::Shutdown(CloseMode::Graceful), Priority::Immediate);
            }
            CloseMode::Immediate => self.shared.request_close(),
        }
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id())
            .field("status", &self.status())
            .finish()
    }
}

/// Capabilities a protocol handler may use on its session
pub trait IoSession {
    fn id(&self) -> u64;

    /// Cross-thread handle to this session
    fn handle(&self) -> SessionHandle;

    /// Read from the channel; `WouldBlock` when drained, `Ok(0)` at end of stream
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write to the channel; `WouldBlock` when the socket is full
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn event_mask(&self) -> EventMask;

    fn set_event_mask(&mut self, mask: EventMask);

    fn set_event(&mut self, mask: EventMask) {
        let current = self.event_mask();
        self.set_event_mask(current.with(mask));
    }

    fn clear_event(&mut self, mask: EventMask) {
        let current = self.event_mask();
        self.set_event_mask(current.without(mask));
    }

    /// Pop the next queued command in priority order
    fn poll_command(&mut self) -> Option<Command>;

    fn has_commands(&self) -> bool;

    /// Request closing; the reactor performs it once the current callback returns
    fn close(&mut self, mode: CloseMode);

    fn status(&self) -> SessionStatus;

    fn socket_timeout(&self) -> Option<Duration>;

    fn set_socket_timeout(&mut self, timeout: Option<Duration>);

    fn last_read_time(&self) -> Instant;

    fn last_write_time(&self) -> Instant;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Switch the channel to TLS; the handshake is then driven by [`IoSession::handshake`]
    fn start_tls(&mut self, config: &TlsConfig, sni: Option<&str>, alpn: &[&str]) -> Result<()>;

    /// Advance a pending TLS handshake
    fn handshake(&mut self) -> Result<HandshakeStatus>;

    fn tls_details(&self) -> Option<&TlsDetails>;

    /// Hand the session over to `handler` once the current callback returns
    fn upgrade(&mut self, handler: Box<dyn IoEventHandler>);
}

/// Reactor callbacks of a protocol handler
///
/// A session has exactly one active handler. All callbacks run on the
/// session's worker thread; an `Err` return closes the session immediately
/// after [`IoEventHandler::exception`] has been called.
pub trait IoEventHandler: Send {
    /// Protocol name used in logs
    fn protocol(&self) -> &'static str;

    fn connected(&mut self, session: &mut dyn IoSession) -> Result<()>;

    /// The channel is readable; `replay` carries bytes already read from the
    /// wire by a previous handler and must be consumed before reading more.
    fn input_ready(&mut self, session: &mut dyn IoSession, replay: Option<&[u8]>) -> Result<()>;

    fn output_ready(&mut self, session: &mut dyn IoSession) -> Result<()>;

    fn timeout(&mut self, session: &mut dyn IoSession, timeout: Duration) -> Result<()>;

    fn exception(&mut self, session: &mut dyn IoSession, cause: &Error);

    fn disconnected(&mut self, session: &mut dyn IoSession);
}

/// Builds the initial handler of every new session
pub trait IoEventHandlerFactory: Send + Sync + 'static {
    /// Per-connection data passed from `connect` to the new handler
    type Attachment: Send + 'static;

    fn create_handler(
        &self,
        session: &mut dyn IoSession,
        attachment: Option<Self::Attachment>,
    ) -> Box<dyn IoEventHandler>;

    /// An outbound connection failed before a session existed
    fn connect_failed(&self, _attachment: Option<Self::Attachment>, _cause: &Error) {}
}

/// Reactor-owned session
pub struct Session {
    shared: Arc<SessionShared>,
    transport: Transport,
    event_mask: EventMask,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    pub(crate) eof: bool,
    last_read: Instant,
    last_write: Instant,
    pub(crate) last_timeout_check: Instant,
    socket_timeout: Option<Duration>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    pub(crate) close_request: Option<CloseMode>,
    pub(crate) pending_upgrade: Option<Box<dyn IoEventHandler>>,
}

impl Session {
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        stream: TcpStream,
        socket_timeout: Option<Duration>,
    ) -> Self {
        let now = Instant::now();
        let local_addr = stream.local_addr().ok();
        let remote_addr = stream.peer_addr().ok();
        Session {
            shared,
            transport: Transport::Plain(PlainChannel::new(stream)),
            event_mask: EventMask::READ,
            readable: true,
            writable: true,
            eof: false,
            last_read: now,
            last_write: now,
            last_timeout_check: now,
            socket_timeout,
            local_addr,
            remote_addr,
            close_request: None,
            pending_upgrade: None,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    pub(crate) fn socket(&mut self) -> Option<&mut TcpStream> {
        self.transport.ops().map(|ops| ops.socket())
    }

    /// Last time anything moved on the channel
    pub(crate) fn last_activity(&self) -> Instant {
        self.last_read.max(self.last_write)
    }

    /// Whether the handler should be called back without a new readiness event
    pub(crate) fn has_pending_work(&self) -> bool {
        (self.event_mask.contains(EventMask::READ) && self.readable)
            || (self.event_mask.contains(EventMask::WRITE) && self.writable)
    }

    /// Shut the channel down and drop it
    pub(crate) fn shutdown_channel(&mut self, mode: CloseMode) {
        let transport = std::mem::replace(&mut self.transport, Transport::Detached);
        if mode != CloseMode::Graceful {
            return;
        }
        let result = match transport {
            Transport::Plain(mut channel) => channel.shutdown(),
            Transport::Tls(mut channel) => channel.shutdown(),
            Transport::Detached => Ok(()),
        };
        if let Err(e) = result {
            debug!(session = self.shared.id, error = %e, "channel shutdown failed");
        }
    }
}

impl IoSession for Session {
    fn id(&self) -> u64 {
        self.shared.id
    }

    fn handle(&self) -> SessionHandle {
        SessionHandle::new(self.shared.clone())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let ops = self.transport.ops().ok_or_else(detached)?;
        match ops.read(buf) {
            Ok(0) if !buf.is_empty() => {
                self.readable = false;
                self.eof = true;
                Ok(0)
            }
            Ok(n) => {
                self.last_read = Instant::now();
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Err(e),
            Err(e) => {
                self.readable = false;
                Err(e)
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let ops = self.transport.ops().ok_or_else(detached)?;
        match ops.write(buf) {
            Ok(n) => {
                self.last_write = Instant::now();
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Err(e),
            Err(e) => {
                self.writable = false;
                Err(e)
            }
        }
    }

    fn event_mask(&self) -> EventMask {
        self.event_mask
    }

    fn set_event_mask(&mut self, mask: EventMask) {
        self.event_mask = mask;
    }

    fn poll_command(&mut self) -> Option<Command> {
        self.shared.poll_command()
    }

    fn has_commands(&self) -> bool {
        self.shared.has_commands()
    }

    fn close(&mut self, mode: CloseMode) {
        self.shared.mark_closing();
        self.close_request = Some(match self.close_request {
            Some(CloseMode::Immediate) => CloseMode::Immediate,
            _ => mode,
        });
    }

    fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    fn socket_timeout(&self) -> Option<Duration> {
        self.socket_timeout
    }

    fn set_socket_timeout(&mut self, timeout: Option<Duration>) {
        self.socket_timeout = timeout;
    }

    fn last_read_time(&self) -> Instant {
        self.last_read
    }

    fn last_write_time(&self) -> Instant {
        self.last_write
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn start_tls(&mut self, config: &TlsConfig, sni: Option<&str>, alpn: &[&str]) -> Result<()> {
        if self.transport.is_tls() {
            return Err(Error::IllegalState("TLS already started".to_string()));
        }
        let ssl = config.new_ssl(sni, alpn)?;
        match std::mem::replace(&mut self.transport, Transport::Detached) {
            Transport::Plain(channel) => {
                let channel = TlsChannel::new(ssl, channel.into_inner(), config.is_server())?;
                self.transport = Transport::Tls(Box::new(channel));
                trace!(session = self.shared.id, "TLS started");
                Ok(())
            }
            _ => Err(Error::ConnectionClosed),
        }
    }

    fn handshake(&mut self) -> Result<HandshakeStatus> {
        match &mut self.transport {
            Transport::Tls(channel) => {
                let status = channel.handshake()?;
                match status {
                    HandshakeStatus::WantRead => self.readable = false,
                    HandshakeStatus::WantWrite => self.writable = false,
                    HandshakeStatus::Complete => {}
                }
                Ok(status)
            }
            Transport::Plain(_) => Ok(HandshakeStatus::Complete),
            Transport::Detached => Err(Error::ConnectionClosed),
        }
    }

    fn tls_details(&self) -> Option<&TlsDetails> {
        match &self.transport {
            Transport::Tls(channel) => channel.details(),
            _ => None,
        }
    }

    fn upgrade(&mut self, handler: Box<dyn IoEventHandler>) {
        self.pending_upgrade = Some(handler);
    }
}

/// Wire-logging decorator over any session
///
/// Forwards every capability to the wrapped session and traces the bytes
/// moving through `read` and `write`.
pub struct LoggingSession<'a, S: IoSession + ?Sized> {
    inner: &'a mut S,
}

impl<'a, S: IoSession + ?Sized> LoggingSession<'a, S> {
    pub fn new(inner: &'a mut S) -> Self {
        LoggingSession { inner }
    }
}

impl<'a, S: IoSession + ?Sized> IoSession for LoggingSession<'a, S> {
    fn id(&self) -> u64 {
        self.inner.id()
    }

    fn handle(&self) -> SessionHandle {
        self.inner.handle()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let result = self.inner.read(buf);
        match &result {
            Ok(n) => trace!(
                session = self.inner.id(),
                bytes = *n,
                data = %String::from_utf8_lossy(&buf[..*n]).escape_debug(),
                "<< read"
            ),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => trace!(session = self.inner.id(), error = %e, "<< read failed"),
        }
        result
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let result = self.inner.write(buf);
        match &result {
            Ok(n) => trace!(
                session = self.inner.id(),
                bytes = *n,
                data = %String::from_utf8_lossy(&buf[..*n]).escape_debug(),
                ">> write"
            ),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => trace!(session = self.inner.id(), error = %e, ">> write failed"),
        }
        result
    }

    fn event_mask(&self) -> EventMask {
        self.inner.event_mask()
    }

    fn set_event_mask(&mut self, mask: EventMask) {
        trace!(session = self.inner.id(), mask = mask.bits(), "event mask");
        self.inner.set_event_mask(mask);
    }

    fn poll_command(&mut self) -> Option<Command> {
        let command = self.inner.poll_command();
        if let Some(command) = &command {
            trace!(session = self.inner.id(), ?command, "command");
        }
        command
    }

    fn has_commands(&self) -> bool {
        self.inner.has_commands()
    }

    fn close(&mut self, mode: CloseMode) {
        trace!(session = self.inner.id(), ?mode, "close");
        self.inner.close(mode);
    }

    fn status(&self) -> SessionStatus {
        self.inner.status()
    }

    fn socket_timeout(&self) -> Option<Duration> {
        self.inner.socket_timeout()
    }

    fn set_socket_timeout(&mut self, timeout: Option<Duration>) {
        self.inner.set_socket_timeout(timeout);
    }

    fn last_read_time(&self) -> Instant {
        self.inner.last_read_time()
    }

    fn last_write_time(&self) -> Instant {
        self.inner.last_write_time()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr()
    }

    fn start_tls(&mut self, config: &TlsConfig, sni: Option<&str>, alpn: &[&str]) -> Result<()> {
        trace!(session = self.inner.id(), ?sni, ?alpn, "start TLS");
        self.inner.start_tls(config, sni, alpn)
    }

    fn handshake(&mut self) -> Result<HandshakeStatus> {
        let status = self.inner.handshake();
        trace!(session = self.inner.id(), ?status, "handshake");
        status
    }

    fn tls_details(&self) -> Option<&TlsDetails> {
        self.inner.tls_details()
    }

    fn upgrade(&mut self, handler: Box<dyn IoEventHandler>) {
        trace!(session = self.inner.id(), protocol = handler.protocol(), "upgrade");
        self.inner.upgrade(handler);
    }
}

/// Result of draining a session into a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fill {
    /// Bytes appended to the buffer
    pub read: usize,
    /// The peer closed its write side
    pub eof: bool,
}

/// Read from `session` into `dst` until the channel is drained, the peer
/// closes, or `dst` holds `limit` bytes.
pub fn fill_buffer(session: &mut dyn IoSession, dst: &mut BytesMut, limit: usize) -> io::Result<Fill> {
    let mut chunk = [0u8; 8192];
    let mut read = 0;
    while dst.len() < limit {
        let want = (limit - dst.len()).min(chunk.len());
        match session.read(&mut chunk[..want]) {
            Ok(0) => return Ok(Fill { read, eof: true }),
            Ok(n) => {
                dst.extend_from_slice(&chunk[..n]);
                read += n;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(Fill { read, eof: false })
}

/// Write `src` to `session` until it is empty or the channel would block.
///
/// Returns true when everything was written.
pub fn flush_buffer(session: &mut dyn IoSession, src: &mut BytesMut) -> io::Result<bool> {
    while !src.is_empty() {
        match session.write(src) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "channel accepted no data"));
            }
            Ok(n) => src.advance(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::exchange::ClientExchangeHandler;
    use crate::http::support::BasicClientExchange;
    use crate::http::{Method, RequestHead};

    fn exchange() -> (Box<dyn ClientExchangeHandler>, crate::reactor::Completion<crate::http::support::BasicResponse>) {
        let (exchange, response) = BasicClientExchange::new(RequestHead::new(Method::Get, "/"), None);
        (Box::new(exchange), response)
    }

    #[test]
    fn test_event_mask_ops() {
        let mask = EventMask::READ | EventMask::WRITE;
        assert_eq!(mask, EventMask::READ_WRITE);
        assert!(mask.contains(EventMask::READ));
        assert_eq!(mask.without(EventMask::READ), EventMask::WRITE);
        assert!(!EventMask::READ.intersects(EventMask::WRITE));
        assert!(EventMask::NONE.is_empty());
        assert_eq!(EventMask::from_bits(0xff), EventMask::READ_WRITE);
    }

    #[test]
    fn test_enqueue_on_closed_session_cancels() {
        let shared = Arc::new(SessionShared::detached(1));
        let handle = SessionHandle::new(shared.clone());
        assert!(shared.mark_closed());
        assert!(!shared.mark_closed());

        let (command, response) = exchange();
        assert!(!handle.enqueue(Command::Execute(command), Priority::Normal));
        assert!(matches!(response.try_take(), Some(Err(Error::Cancelled))));
    }

    #[test]
    fn test_close_cancels_queued_commands_once() {
        let shared = Arc::new(SessionShared::detached(2));
        let handle = SessionHandle::new(shared.clone());

        let mut responses = Vec::new();
        for _ in 0..5 {
            let (command, response) = exchange();
            assert!(handle.enqueue(Command::Execute(command), Priority::Normal));
            responses.push(response);
        }

        // One command is taken by the worker and runs; the rest get cancelled
        let running = shared.poll_command();
        assert!(running.is_some());
        assert!(shared.mark_closed());

        assert!(responses[0].try_take().is_none());
        for response in &responses[1..] {
            assert!(matches!(response.try_take(), Some(Err(Error::Cancelled))));
        }
        assert!(shared.poll_command().is_none());
        assert_eq!(handle.status(), SessionStatus::Closed);
    }

    #[test]
    fn test_enqueue_requests_write_event() {
        let shared = Arc::new(SessionShared::detached(3));
        let handle = SessionHandle::new(shared.clone());
        handle.close(CloseMode::Graceful);
        assert_eq!(shared.take_pending_events(), EventMask::WRITE);
        assert_eq!(shared.take_pending_events(), EventMask::NONE);
        assert!(matches!(
            shared.poll_command(),
            Some(Command::Shutdown(CloseMode::Graceful))
        ));
    }

    #[test]
    fn test_graceful_channel_shutdown_sends_eof() {
        use std::io::Read;

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();

        let shared = Arc::new(SessionShared::detached(5));
        let mut session = Session::new(shared, TcpStream::from_std(client), None);
        session.shutdown_channel(CloseMode::Graceful);
        assert!(session.socket().is_none());
        // Already detached: nothing left to shut down
        session.shutdown_channel(CloseMode::Graceful);

        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(peer.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_immediate_close_request() {
        let shared = Arc::new(SessionShared::detached(4));
        let handle = SessionHandle::new(shared.clone());
        handle.close(CloseMode::Immediate);
        assert!(shared.take_close_request());
        assert!(!shared.take_close_request());
    }
}
