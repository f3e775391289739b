//! Non-blocking I/O reactor
//!
//! The reactor turns socket readiness into ordered callbacks on protocol
//! handlers. It is built from:
//!
//! - worker threads, each running a `mio` event loop over its own sessions
//! - an acceptor thread owning the listening sockets
//! - per-session command queues through which any thread can inject work
//!
//! # Lifecycle
//!
//! `Ready` (constructed) -> `Running` (after [`IoReactor::start`]) ->
//! `Terminated` (after shutdown was initiated). Transitions only go forward;
//! starting a terminated reactor fails with `Error::IllegalState`.
//!
//! # Examples
//!
//! ```no_run
//! use hxcore::http::negotiator::{ProtocolConfig, ServerProtocolFactory};
//! use hxcore::http::support::RequestHandlerFactory;
//! use hxcore::http::{ResponseHead, Status};
//! use hxcore::reactor::{IoReactor, IoReactorConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let handlers = RequestHandlerFactory::new(|_request, _body| {
//!     (ResponseHead::new(Status::OK), b"hello".to_vec())
//! });
//! let factory = ServerProtocolFactory::new(ProtocolConfig::default(), Arc::new(handlers));
//! let reactor = IoReactor::new(IoReactorConfig::default(), factory).unwrap();
//! reactor.start().unwrap();
//! let listener = reactor.listen("127.0.0.1:0".parse().unwrap()).unwrap();
//! println!("listening on {}", listener.address());
//! reactor.shutdown(Duration::from_secs(5));
//! ```

mod acceptor;
pub mod channel;
pub mod command;
pub mod completion;
pub mod listener;
pub mod session;
mod worker;

#[cfg(test)]
pub(crate) mod mock;

pub use acceptor::ListenerEndpoint;
pub use command::{CloseMode, Command, CommandQueue, Priority};
pub use completion::{completion, completion_with_callback, Callback, Completer, Completion};
pub use listener::{NoopListener, SessionListener, TracingListener};
pub use session::{
    fill_buffer, flush_buffer, EventMask, Fill, IoEventHandler, IoEventHandlerFactory, IoSession,
    LoggingSession, Session, SessionHandle, SessionStatus,
};

use crate::http::{Error, Result};
use acceptor::{AcceptorShared, Acceptor};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use worker::{ConnectRequest, Worker, WorkerMessage, WorkerShared};

/// Reactor lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ReactorStatus {
    Ready = 0,
    Running = 1,
    Terminated = 2,
}

impl ReactorStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReactorStatus::Ready,
            1 => ReactorStatus::Running,
            _ => ReactorStatus::Terminated,
        }
    }
}

/// Reactor configuration
#[derive(Clone)]
pub struct IoReactorConfig {
    /// Number of worker threads
    pub workers: usize,
    /// Upper bound on one event loop iteration; also the timeout check granularity
    pub select_interval: Duration,
    /// Idle time after which a session's handler gets a timeout callback
    pub socket_timeout: Option<Duration>,
    pub tcp_nodelay: bool,
    pub backlog: i32,
    /// Trace every byte read and written
    pub wire_logging: bool,
    /// Lifecycle observer shared by all sessions
    pub listener: Arc<dyn SessionListener>,
}

impl Default for IoReactorConfig {
    fn default() -> Self {
        IoReactorConfig {
            workers: 2,
            select_interval: Duration::from_secs(1),
            socket_timeout: Some(Duration::from_secs(180)),
            tcp_nodelay: true,
            backlog: 1024,
            wire_logging: false,
            listener: Arc::new(NoopListener),
        }
    }
}

impl IoReactorConfig {
    pub fn builder() -> IoReactorConfigBuilder {
        IoReactorConfigBuilder {
            config: IoReactorConfig::default(),
        }
    }
}

impl fmt::Debug for IoReactorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoReactorConfig")
            .field("workers", &self.workers)
            .field("select_interval", &self.select_interval)
            .field("socket_timeout", &self.socket_timeout)
            .field("tcp_nodelay", &self.tcp_nodelay)
            .field("backlog", &self.backlog)
            .field("wire_logging", &self.wire_logging)
            .finish()
    }
}

/// Builder for [`IoReactorConfig`]
pub struct IoReactorConfigBuilder {
    config: IoReactorConfig,
}

impl IoReactorConfigBuilder {
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers.max(1);
        self
    }

    pub fn select_interval(mut self, interval: Duration) -> Self {
        self.config.select_interval = interval;
        self
    }

    pub fn socket_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.socket_timeout = timeout;
        self
    }

    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.config.tcp_nodelay = enabled;
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.config.backlog = backlog;
        self
    }

    pub fn wire_logging(mut self, enabled: bool) -> Self {
        self.config.wire_logging = enabled;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn SessionListener>) -> Self {
        self.config.listener = listener;
        self
    }

    pub fn build(self) -> IoReactorConfig {
        self.config
    }
}

struct Pending<F: IoEventHandlerFactory> {
    workers: Vec<Worker<F>>,
    acceptor: Acceptor,
}

/// Multi-threaded I/O reactor
pub struct IoReactor<F: IoEventHandlerFactory> {
    config: Arc<IoReactorConfig>,
    factory: Arc<F>,
    status: AtomicU8,
    workers: Vec<Arc<WorkerShared<F::Attachment>>>,
    acceptor: Arc<AcceptorShared>,
    pending: Mutex<Option<Pending<F>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    live_workers: Arc<(Mutex<usize>, Condvar)>,
    next_worker: Arc<AtomicUsize>,
}

impl<F: IoEventHandlerFactory> IoReactor<F> {
    /// Create a reactor in the `Ready` state; no threads run yet
    pub fn new(config: IoReactorConfig, factory: F) -> Result<Self> {
        let config = Arc::new(config);
        let factory = Arc::new(factory);
        let session_ids = Arc::new(AtomicU64::new(1));

        let mut workers = Vec::with_capacity(config.workers);
        let mut shared = Vec::with_capacity(config.workers);
        for index in 0..config.workers.max(1) {
            let (worker, worker_shared) =
                Worker::new(index, factory.clone(), config.clone(), session_ids.clone())?;
            workers.push(worker);
            shared.push(worker_shared);
        }
        let acceptor = Acceptor::new()?;

        Ok(IoReactor {
            config,
            factory,
            status: AtomicU8::new(ReactorStatus::Ready as u8),
            workers: shared,
            acceptor: acceptor.shared(),
            pending: Mutex::new(Some(Pending { workers, acceptor })),
            threads: Mutex::new(Vec::new()),
            live_workers: Arc::new((Mutex::new(0), Condvar::new())),
            next_worker: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn status(&self) -> ReactorStatus {
        ReactorStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn config(&self) -> &IoReactorConfig {
        &self.config
    }

    /// Start the worker and acceptor threads
    pub fn start(&self) -> Result<()> {
        if self
            .status
            .compare_exchange(
                ReactorStatus::Ready as u8,
                ReactorStatus::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(Error::IllegalState(format!(
                "reactor cannot be started from {:?}",
                self.status()
            )));
        }

        let Some(pending) = self.pending.lock().take() else {
            return Err(Error::IllegalState("reactor threads already started".to_string()));
        };

        let mut threads = self.threads.lock();
        *self.live_workers.0.lock() = pending.workers.len();
        for worker in pending.workers {
            let live = self.live_workers.clone();
            let handle = thread::Builder::new()
                .name("hx-worker".to_string())
                .spawn(move || {
                    worker.run();
                    let (count, done) = &*live;
                    let mut count = count.lock();
                    *count -= 1;
                    done.notify_all();
                })?;
            threads.push(handle);
        }

        let workers = self.workers.clone();
        let next_worker = self.next_worker.clone();
        let acceptor = pending.acceptor;
        let handle = thread::Builder::new()
            .name("hx-acceptor".to_string())
            .spawn(move || {
                acceptor.run(|stream, peer| {
                    let index = next_worker.fetch_add(1, Ordering::Relaxed) % workers.len();
                    debug!(peer = %peer, worker = index, "accepted connection");
                    workers[index].send(WorkerMessage::Accepted(stream));
                });
            })?;
        threads.push(handle);

        info!(workers = self.workers.len(), "reactor started");
        Ok(())
    }

    /// Open a passive listener; every accepted connection becomes a session
    pub fn listen(&self, addr: SocketAddr) -> Result<ListenerEndpoint> {
        if self.status() == ReactorStatus::Terminated {
            return Err(Error::IllegalState("reactor is shut down".to_string()));
        }
        acceptor::listen(&self.acceptor, addr, self.config.backlog)
    }

    /// Open an outbound connection.
    ///
    /// The returned completion (and `callback`, if given) resolves with the
    /// new session once the TCP connection is established, with
    /// `Error::Timeout` when `timeout` elapses first, or with the I/O error.
    pub fn connect(
        &self,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        timeout: Option<Duration>,
        attachment: Option<F::Attachment>,
        callback: Option<Callback<SessionHandle>>,
    ) -> Completion<SessionHandle> {
        let (completer, completion) = completion_with_callback(callback);
        if self.status() == ReactorStatus::Terminated {
            self.reject(attachment, completer, Error::IllegalState("reactor is shut down".to_string()));
            return completion;
        }

        match open_stream(remote, local) {
            Ok(stream) => {
                let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
                self.workers[index].send(WorkerMessage::Connect(ConnectRequest {
                    stream,
                    remote,
                    deadline: timeout.map(|t| Instant::now() + t),
                    attachment,
                    completer,
                }));
            }
            Err(e) => self.reject(attachment, completer, e.into()),
        }
        completion
    }

    fn reject(&self, attachment: Option<F::Attachment>, completer: Completer<SessionHandle>, cause: Error) {
        debug!(error = %cause, "connect request rejected");
        self.factory.connect_failed(attachment, &cause);
        completer.fail(cause);
    }

    /// Stop accepting new work and ask every session to close gracefully
    pub fn initiate_shutdown(&self) {
        let previous = self.status.swap(ReactorStatus::Terminated as u8, Ordering::AcqRel);
        if previous == ReactorStatus::Terminated as u8 {
            return;
        }
        info!("reactor shutdown initiated");
        self.acceptor.shutdown();
        for worker in &self.workers {
            worker.shutdown(CloseMode::Graceful);
        }
        if previous == ReactorStatus::Ready as u8 {
            // Threads were never started
            self.pending.lock().take();
        }
    }

    /// Wait until every worker has finished; returns false on timeout
    pub fn await_shutdown(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (count, done) = &*self.live_workers;
        let mut count = count.lock();
        while *count > 0 {
            if done.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }

    /// Graceful shutdown bounded by `grace`; stragglers are closed immediately
    pub fn shutdown(&self, grace: Duration) {
        self.initiate_shutdown();
        if !self.await_shutdown(grace) {
            warn!("graceful shutdown timed out; closing remaining sessions");
            for worker in &self.workers {
                worker.shutdown(CloseMode::Immediate);
            }
        }
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.join().is_err() {
                warn!("reactor thread panicked");
            }
        }
        debug!("reactor terminated");
    }
}

impl<F: IoEventHandlerFactory> Drop for IoReactor<F> {
    fn drop(&mut self) {
        if self.status() != ReactorStatus::Terminated || !self.threads.lock().is_empty() {
            self.shutdown(Duration::ZERO);
        }
    }
}

impl<F: IoEventHandlerFactory> fmt::Debug for IoReactor<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoReactor")
            .field("status", &self.status())
            .field("workers", &self.workers.len())
            .finish()
    }
}

/// Non-blocking outbound socket with an in-progress connect
fn open_stream(remote: SocketAddr, local: Option<SocketAddr>) -> io::Result<mio::net::TcpStream> {
    let socket = socket2::Socket::new(
        match remote {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_nonblocking(true)?;
    if let Some(local) = local {
        socket.set_reuse_address(true)?;
        socket.bind(&local.into())?;
    }
    match socket.connect(&remote.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    let stream: std::net::TcpStream = socket.into();
    Ok(mio::net::TcpStream::from_std(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Error;

    struct NullHandler;

    impl IoEventHandler for NullHandler {
        fn protocol(&self) -> &'static str {
            "null"
        }

        fn connected(&mut self, session: &mut dyn IoSession) -> Result<()> {
            session.set_event_mask(EventMask::READ);
            Ok(())
        }

        fn input_ready(&mut self, session: &mut dyn IoSession, _replay: Option<&[u8]>) -> Result<()> {
            let mut buf = bytes::BytesMut::new();
            let fill = fill_buffer(session, &mut buf, 4096)?;
            if fill.eof {
                session.close(CloseMode::Graceful);
            }
            Ok(())
        }

        fn output_ready(&mut self, session: &mut dyn IoSession) -> Result<()> {
            while let Some(command) = session.poll_command() {
                if let Command::Shutdown(mode) = command {
                    session.close(mode);
                    return Ok(());
                }
                command.cancel();
            }
            session.clear_event(EventMask::WRITE);
            Ok(())
        }

        fn timeout(&mut self, session: &mut dyn IoSession, _timeout: Duration) -> Result<()> {
            session.close(CloseMode::Immediate);
            Ok(())
        }

        fn exception(&mut self, _session: &mut dyn IoSession, _cause: &Error) {}

        fn disconnected(&mut self, _session: &mut dyn IoSession) {}
    }

    struct NullFactory;

    impl IoEventHandlerFactory for NullFactory {
        type Attachment = ();

        fn create_handler(&self, _session: &mut dyn IoSession, _attachment: Option<()>) -> Box<dyn IoEventHandler> {
            Box::new(NullHandler)
        }
    }

    fn config() -> IoReactorConfig {
        IoReactorConfig::builder()
            .workers(1)
            .select_interval(Duration::from_millis(50))
            .build()
    }

    #[test]
    fn test_lifecycle_is_one_directional() {
        let reactor = IoReactor::new(config(), NullFactory).unwrap();
        assert_eq!(reactor.status(), ReactorStatus::Ready);
        reactor.start().unwrap();
        assert_eq!(reactor.status(), ReactorStatus::Running);
        assert!(matches!(reactor.start(), Err(Error::IllegalState(_))));

        reactor.shutdown(Duration::from_secs(5));
        assert_eq!(reactor.status(), ReactorStatus::Terminated);
        assert!(matches!(reactor.start(), Err(Error::IllegalState(_))));
        assert!(reactor.listen("127.0.0.1:0".parse().unwrap()).is_err());
    }

    #[test]
    fn test_connect_and_graceful_shutdown() {
        let reactor = IoReactor::new(config(), NullFactory).unwrap();
        reactor.start().unwrap();
        let listener = reactor.listen("127.0.0.1:0".parse().unwrap()).unwrap();

        let session = reactor
            .connect(listener.address(), None, Some(Duration::from_secs(5)), None, None)
            .wait(Duration::from_secs(5))
            .unwrap();
        assert!(session.is_open());

        reactor.initiate_shutdown();
        assert!(reactor.await_shutdown(Duration::from_secs(5)));
        assert!(!session.is_open());
        reactor.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_connect_refused_reports_error() {
        // Bind and drop to get a port that is very likely closed
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let reactor = IoReactor::new(config(), NullFactory).unwrap();
        reactor.start().unwrap();

        let result = reactor
            .connect(
                format!("127.0.0.1:{}", port).parse().unwrap(),
                None,
                Some(Duration::from_secs(5)),
                None,
                None,
            )
            .wait(Duration::from_secs(5));
        assert!(matches!(result, Err(Error::Io(_))));
        reactor.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_connect_after_shutdown_fails() {
        let reactor = IoReactor::new(config(), NullFactory).unwrap();
        reactor.start().unwrap();
        reactor.shutdown(Duration::from_secs(1));
        let result = reactor
            .connect("127.0.0.1:9".parse().unwrap(), None, None, None, None)
            .wait(Duration::from_secs(1));
        assert!(matches!(result, Err(Error::IllegalState(_))));
    }

    #[test]
    fn test_immediate_close_from_handle() {
        let reactor = IoReactor::new(config(), NullFactory).unwrap();
        reactor.start().unwrap();
        let listener = reactor.listen("127.0.0.1:0".parse().unwrap()).unwrap();

        let session = reactor
            .connect(listener.address(), None, Some(Duration::from_secs(5)), None, None)
            .wait(Duration::from_secs(5))
            .unwrap();
        session.close(CloseMode::Immediate);

        let deadline = Instant::now() + Duration::from_secs(5);
        while session.is_open() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(session.status(), SessionStatus::Closed);
        reactor.shutdown(Duration::from_secs(1));
    }
}
