//! Worker event loop
//!
//! Each worker owns a `mio::Poll` and a slab of sessions. A session is
//! registered with exactly one worker for its whole life, so every handler
//! callback for it runs on that worker's thread.
//!
//! mio reports readiness edge-triggered. The worker keeps per-session
//! `readable` / `writable` flags that are set by events and cleared when the
//! channel returns `WouldBlock`; a session is dispatched again for as long as
//! its event mask and these flags overlap.

use super::command::{CloseMode, Command, Priority};
use super::completion::Completer;
use super::session::{
    EventMask, IoEventHandler, IoEventHandlerFactory, IoSession, LoggingSession, Notifier, Session,
    SessionHandle, SessionShared,
};
use super::IoReactorConfig;
use crate::http::{Error, Result};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use slab::Slab;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

const WAKE_TOKEN: Token = Token(usize::MAX);

const SHUTDOWN_NONE: u8 = 0;
const SHUTDOWN_GRACEFUL: u8 = 1;
const SHUTDOWN_IMMEDIATE: u8 = 2;

/// Outbound connection waiting for the TCP handshake
pub(crate) struct ConnectRequest<A> {
    pub(crate) stream: TcpStream,
    pub(crate) remote: SocketAddr,
    pub(crate) deadline: Option<Instant>,
    pub(crate) attachment: Option<A>,
    pub(crate) completer: Completer<SessionHandle>,
}

pub(crate) enum WorkerMessage<A> {
    Connect(ConnectRequest<A>),
    Accepted(TcpStream),
}

/// Part of a worker visible to other threads
pub(crate) struct WorkerShared<A> {
    notifier: Arc<Notifier>,
    inbox: Mutex<Vec<WorkerMessage<A>>>,
    shutdown: AtomicU8,
}

impl<A> WorkerShared<A> {
    pub(crate) fn send(&self, message: WorkerMessage<A>) {
        self.inbox.lock().push(message);
        self.notifier.wake();
    }

    pub(crate) fn shutdown(&self, mode: CloseMode) {
        let value = match mode {
            CloseMode::Graceful => SHUTDOWN_GRACEFUL,
            CloseMode::Immediate => SHUTDOWN_IMMEDIATE,
        };
        self.shutdown.fetch_max(value, Ordering::AcqRel);
        self.notifier.wake();
    }
}

enum Slot<A> {
    Connecting(ConnectRequest<A>),
    Active(SessionEntry),
}

struct SessionEntry {
    session: Session,
    handler: Option<Box<dyn IoEventHandler>>,
    queued: bool,
}

#[derive(Debug, Clone, Copy)]
enum Callback {
    Connected,
    Input,
    Output,
    Timeout(Duration),
}

pub(crate) struct Worker<F: IoEventHandlerFactory> {
    index: usize,
    poll: Poll,
    events: Events,
    shared: Arc<WorkerShared<F::Attachment>>,
    slots: Slab<Slot<F::Attachment>>,
    factory: Arc<F>,
    config: Arc<IoReactorConfig>,
    session_ids: Arc<AtomicU64>,
    ready: VecDeque<usize>,
    shutting_down: bool,
    last_check: Instant,
}

impl<F: IoEventHandlerFactory> Worker<F> {
    pub(crate) fn new(
        index: usize,
        factory: Arc<F>,
        config: Arc<IoReactorConfig>,
        session_ids: Arc<AtomicU64>,
    ) -> io::Result<(Self, Arc<WorkerShared<F::Attachment>>)> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let shared = Arc::new(WorkerShared {
            notifier: Arc::new(Notifier::new(waker)),
            inbox: Mutex::new(Vec::new()),
            shutdown: AtomicU8::new(SHUTDOWN_NONE),
        });
        let worker = Worker {
            index,
            poll,
            events: Events::with_capacity(1024),
            shared: shared.clone(),
            slots: Slab::new(),
            factory,
            config,
            session_ids,
            ready: VecDeque::new(),
            shutting_down: false,
            last_check: Instant::now(),
        };
        Ok((worker, shared))
    }

    /// Run the event loop until shutdown completes
    pub(crate) fn run(mut self) {
        debug!(worker = self.index, "worker started");
        loop {
            let timeout = if self.ready.is_empty() {
                self.config.select_interval
            } else {
                Duration::ZERO
            };
            if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    error!(worker = self.index, error = %e, "poll failed");
                    break;
                }
            }

            let mut connect_ready = Vec::new();
            for event in self.events.iter() {
                let token = event.token();
                if token == WAKE_TOKEN {
                    continue;
                }
                match self.slots.get_mut(token.0) {
                    Some(Slot::Connecting(_)) => {
                        if event.is_writable() || event.is_error() || event.is_write_closed() {
                            connect_ready.push(token.0);
                        }
                    }
                    Some(Slot::Active(entry)) => {
                        if event.is_readable() || event.is_read_closed() || event.is_error() {
                            entry.session.readable = true;
                        }
                        if event.is_writable() || event.is_error() {
                            entry.session.writable = true;
                        }
                        if !entry.queued {
                            entry.queued = true;
                            self.ready.push_back(token.0);
                        }
                    }
                    None => {}
                }
            }

            for key in connect_ready {
                self.finish_connect(key);
            }
            self.process_inbox();
            self.process_notifications();

            let mut batch = std::mem::take(&mut self.ready);
            for key in batch.drain(..) {
                self.dispatch(key);
            }

            self.check_timeouts();

            match self.shared.shutdown.load(Ordering::Acquire) {
                SHUTDOWN_IMMEDIATE => break,
                SHUTDOWN_GRACEFUL => {
                    if !self.shutting_down {
                        self.begin_graceful_shutdown();
                    }
                    if self.slots.is_empty() {
                        break;
                    }
                }
                _ => {}
            }
        }

        self.close_all();
        debug!(worker = self.index, "worker stopped");
    }

    fn process_inbox(&mut self) {
        let messages = std::mem::take(&mut *self.shared.inbox.lock());
        for message in messages {
            match message {
                WorkerMessage::Connect(request) => {
                    if self.shutting_down {
                        self.fail_connect(request, Error::IllegalState("reactor is shutting down".to_string()));
                    } else {
                        self.register_connect(request);
                    }
                }
                WorkerMessage::Accepted(stream) => {
                    if self.shutting_down {
                        continue;
                    }
                    if let Err(e) = self.open_session(stream, false, None, None) {
                        warn!(worker = self.index, error = %e, "failed to register accepted connection");
                    }
                }
            }
        }
    }

    fn process_notifications(&mut self) {
        for key in self.shared.notifier.take_tokens() {
            if let Some(Slot::Active(entry)) = self.slots.get_mut(key) {
                if !entry.queued {
                    entry.queued = true;
                    self.ready.push_back(key);
                }
            }
        }
    }

    fn register_connect(&mut self, mut request: ConnectRequest<F::Attachment>) {
        let entry = self.slots.vacant_entry();
        let key = entry.key();
        match self.poll.registry().register(
            &mut request.stream,
            Token(key),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            Ok(()) => {
                trace!(worker = self.index, remote = %request.remote, "connecting");
                entry.insert(Slot::Connecting(request));
            }
            Err(e) => self.fail_connect(request, e.into()),
        }
    }

    fn finish_connect(&mut self, key: usize) {
        let outcome = match self.slots.get_mut(key) {
            Some(Slot::Connecting(request)) => match request.stream.take_error() {
                Ok(Some(e)) | Err(e) => Some(Err(e)),
                Ok(None) => match request.stream.peer_addr() {
                    Ok(_) => Some(Ok(())),
                    Err(e)
                        if e.kind() == io::ErrorKind::NotConnected
                            || e.raw_os_error() == Some(libc::EINPROGRESS) =>
                    {
                        None
                    }
                    Err(e) => Some(Err(e)),
                },
            },
            _ => None,
        };

        let Some(outcome) = outcome else { return };
        let Slot::Connecting(mut request) = self.slots.remove(key) else {
            return;
        };
        match outcome {
            Ok(()) => {
                let completer = request.completer;
                let attachment = request.attachment.take();
                if let Err(e) = self.open_session(request.stream, true, attachment, Some(completer)) {
                    warn!(worker = self.index, error = %e, "failed to open session");
                }
            }
            Err(e) => {
                let _ = self.poll.registry().deregister(&mut request.stream);
                debug!(worker = self.index, remote = %request.remote, error = %e, "connect failed");
                self.fail_connect(request, e.into());
            }
        }
    }

    fn fail_connect(&self, request: ConnectRequest<F::Attachment>, cause: Error) {
        self.factory.connect_failed(request.attachment, &cause);
        request.completer.fail(cause);
    }

    /// Create a session for a connected stream and install the factory's handler
    fn open_session(
        &mut self,
        mut stream: TcpStream,
        registered: bool,
        attachment: Option<F::Attachment>,
        completer: Option<Completer<SessionHandle>>,
    ) -> Result<()> {
        let entry = self.slots.vacant_entry();
        let key = entry.key();
        let interest = Interest::READABLE | Interest::WRITABLE;
        let registration = if registered {
            self.poll.registry().reregister(&mut stream, Token(key), interest)
        } else {
            self.poll.registry().register(&mut stream, Token(key), interest)
        };
        if let Err(e) = registration {
            let cause = Error::from(e);
            self.factory.connect_failed(attachment, &cause);
            if let Some(completer) = completer {
                completer.fail(cause.clone());
            }
            return Err(cause);
        }
        if let Err(e) = stream.set_nodelay(self.config.tcp_nodelay) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }

        let id = self.session_ids.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(SessionShared::new(id, self.shared.notifier.clone(), key));
        let mut session = Session::new(shared, stream, self.config.socket_timeout);
        let handler = self.factory.create_handler(&mut session, attachment);
        let handle = session.handle();
        self.config.listener.connected(id, session.remote_addr());

        entry.insert(Slot::Active(SessionEntry {
            session,
            handler: Some(handler),
            queued: false,
        }));
        if let Some(completer) = completer {
            completer.complete(Ok(handle));
        }

        if self.invoke(key, Callback::Connected) {
            self.requeue(key);
        }
        Ok(())
    }

    fn dispatch(&mut self, key: usize) {
        let Some(Slot::Active(entry)) = self.slots.get_mut(key) else {
            return;
        };
        entry.queued = false;

        if entry.session.shared().take_close_request() {
            self.close_session(key, CloseMode::Immediate);
            return;
        }
        let pending = entry.session.shared().take_pending_events();
        if !pending.is_empty() {
            entry.session.set_event(pending);
        }

        let mask = entry.session.event_mask();
        if mask.contains(EventMask::READ) && entry.session.readable && !self.invoke(key, Callback::Input) {
            return;
        }

        let Some(Slot::Active(entry)) = self.slots.get_mut(key) else {
            return;
        };
        let mask = entry.session.event_mask();
        if mask.contains(EventMask::WRITE) && entry.session.writable && !self.invoke(key, Callback::Output) {
            return;
        }

        self.requeue(key);
    }

    fn requeue(&mut self, key: usize) {
        if let Some(Slot::Active(entry)) = self.slots.get_mut(key) {
            if !entry.queued && entry.session.has_pending_work() {
                entry.queued = true;
                self.ready.push_back(key);
            }
        }
    }

    /// Run one handler callback. Returns false when the session was closed.
    fn invoke(&mut self, key: usize, callback: Callback) -> bool {
        let wire_logging = self.config.wire_logging;
        let listener = self.config.listener.clone();
        let Some(Slot::Active(entry)) = self.slots.get_mut(key) else {
            return false;
        };
        let Some(mut handler) = entry.handler.take() else {
            return false;
        };
        let session = &mut entry.session;
        let id = session.id();

        if let Callback::Timeout(_) = callback {
            listener.timeout(id);
        }
        let result = if wire_logging {
            call(handler.as_mut(), &mut LoggingSession::new(&mut *session), callback)
        } else {
            call(handler.as_mut(), &mut *session, callback)
        };

        if let Some(next) = session.pending_upgrade.take() {
            listener.upgraded(id, next.protocol());
            handler = next;
        }
        if let Err(cause) = &result {
            warn!(session = id, protocol = handler.protocol(), error = %cause, "session failed");
            listener.exception(id, cause);
            handler.exception(session, cause);
        }
        entry.handler = Some(handler);

        if result.is_err() {
            self.close_session(key, CloseMode::Immediate);
            return false;
        }
        if let Some(mode) = entry.session.close_request.take() {
            self.close_session(key, mode);
            return false;
        }
        true
    }

    fn close_session(&mut self, key: usize, mode: CloseMode) {
        if !matches!(self.slots.get(key), Some(Slot::Active(_))) {
            return;
        }
        let Slot::Active(mut entry) = self.slots.remove(key) else {
            return;
        };
        let id = entry.session.id();
        if let Some(socket) = entry.session.socket() {
            let _ = self.poll.registry().deregister(socket);
        }
        entry.session.shared().mark_closed();
        if let Some(mut handler) = entry.handler.take() {
            handler.disconnected(&mut entry.session);
        }
        entry.session.shutdown_channel(mode);
        self.config.listener.disconnected(id);
        trace!(worker = self.index, session = id, ?mode, "session closed");
    }

    fn check_timeouts(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_check) < self.config.select_interval.min(Duration::from_millis(100)) {
            return;
        }
        self.last_check = now;

        let mut expired_connects = Vec::new();
        let mut idle = Vec::new();
        for (key, slot) in self.slots.iter_mut() {
            match slot {
                Slot::Connecting(request) => {
                    if request.deadline.map_or(false, |deadline| now >= deadline) {
                        expired_connects.push(key);
                    }
                }
                Slot::Active(entry) => {
                    let session = &mut entry.session;
                    if let Some(timeout) = session.socket_timeout() {
                        let since = session.last_activity().max(session.last_timeout_check);
                        if now.duration_since(since) >= timeout {
                            session.last_timeout_check = now;
                            idle.push((key, timeout));
                        }
                    }
                }
            }
        }

        for key in expired_connects {
            if let Slot::Connecting(mut request) = self.slots.remove(key) {
                let _ = self.poll.registry().deregister(&mut request.stream);
                debug!(worker = self.index, remote = %request.remote, "connect timed out");
                self.fail_connect(request, Error::Timeout);
            }
        }
        for (key, timeout) in idle {
            if self.invoke(key, Callback::Timeout(timeout)) {
                self.requeue(key);
            }
        }
    }

    fn begin_graceful_shutdown(&mut self) {
        self.shutting_down = true;
        let mut connecting = Vec::new();
        for (key, slot) in self.slots.iter() {
            match slot {
                Slot::Connecting(_) => connecting.push(key),
                Slot::Active(entry) => {
                    entry
                        .session
                        .shared()
                        .enqueue(Command::Shutdown(CloseMode::Graceful), Priority::Immediate);
                }
            }
        }
        for key in connecting {
            if let Slot::Connecting(mut request) = self.slots.remove(key) {
                let _ = self.poll.registry().deregister(&mut request.stream);
                self.fail_connect(request, Error::IllegalState("reactor is shutting down".to_string()));
            }
        }
        debug!(worker = self.index, sessions = self.slots.len(), "graceful shutdown started");
    }

    fn close_all(&mut self) {
        let keys: Vec<usize> = self.slots.iter().map(|(key, _)| key).collect();
        for key in keys {
            match self.slots.get(key) {
                Some(Slot::Active(_)) => self.close_session(key, CloseMode::Immediate),
                Some(Slot::Connecting(_)) => {
                    if let Slot::Connecting(request) = self.slots.remove(key) {
                        self.fail_connect(request, Error::IllegalState("reactor is shut down".to_string()));
                    }
                }
                None => {}
            }
        }
        for message in std::mem::take(&mut *self.shared.inbox.lock()) {
            if let WorkerMessage::Connect(request) = message {
                self.fail_connect(request, Error::IllegalState("reactor is shut down".to_string()));
            }
        }
    }
}

fn call(handler: &mut dyn IoEventHandler, session: &mut dyn IoSession, callback: Callback) -> Result<()> {
    match callback {
        Callback::Connected => handler.connected(session),
        Callback::Input => handler.input_ready(session, None),
        Callback::Output => handler.output_ready(session),
        Callback::Timeout(timeout) => handler.timeout(session, timeout),
    }
}
