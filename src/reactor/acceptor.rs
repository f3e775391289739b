//! Listener thread
//!
//! Passive sockets live on their own poll instance. Accepted connections are
//! handed to the worker threads through the dispatch function supplied by the
//! reactor.

use crate::http::{Error, Result};
use mio::net::{TcpListener as MioTcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use slab::Slab;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const WAKE_TOKEN: Token = Token(usize::MAX);

pub(crate) struct AcceptorShared {
    registry: Registry,
    waker: Waker,
    listeners: Mutex<Slab<MioTcpListener>>,
    closed: AtomicBool,
}

impl AcceptorShared {
    fn remove(&self, id: usize) -> bool {
        let mut listeners = self.listeners.lock();
        if !listeners.contains(id) {
            return false;
        }
        let mut listener = listeners.remove(id);
        if let Err(e) = self.registry.deregister(&mut listener) {
            debug!(error = %e, "failed to deregister listener");
        }
        true
    }

    pub(crate) fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let ids: Vec<usize> = self.listeners.lock().iter().map(|(id, _)| id).collect();
        for id in ids {
            self.remove(id);
        }
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "failed to wake acceptor");
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Open listening socket of a reactor
pub struct ListenerEndpoint {
    id: usize,
    address: SocketAddr,
    shared: Arc<AcceptorShared>,
}

impl ListenerEndpoint {
    /// Actual bound address (resolves port 0)
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed() || !self.shared.listeners.lock().contains(self.id)
    }

    /// Stop accepting connections on this address
    pub fn close(&self) {
        if self.shared.remove(self.id) {
            debug!(address = %self.address, "listener closed");
        }
    }
}

impl fmt::Debug for ListenerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerEndpoint")
            .field("address", &self.address)
            .finish()
    }
}

pub(crate) struct Acceptor {
    poll: Poll,
    events: Events,
    shared: Arc<AcceptorShared>,
}

impl Acceptor {
    pub(crate) fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let registry = poll.registry().try_clone()?;
        Ok(Acceptor {
            poll,
            events: Events::with_capacity(64),
            shared: Arc::new(AcceptorShared {
                registry,
                waker,
                listeners: Mutex::new(Slab::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub(crate) fn shared(&self) -> Arc<AcceptorShared> {
        self.shared.clone()
    }

    /// Accept until the acceptor is shut down, passing every new stream to `dispatch`
    pub(crate) fn run<D>(mut self, dispatch: D)
    where
        D: Fn(TcpStream, SocketAddr),
    {
        loop {
            if self.shared.is_closed() {
                break;
            }
            if let Err(e) = self.poll.poll(&mut self.events, Some(Duration::from_secs(1))) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(error = %e, "acceptor poll failed");
                break;
            }

            for event in self.events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                let id = event.token().0;
                loop {
                    let accepted = {
                        let listeners = self.shared.listeners.lock();
                        match listeners.get(id) {
                            Some(listener) => listener.accept(),
                            None => break,
                        }
                    };
                    match accepted {
                        Ok((stream, peer)) => dispatch(stream, peer),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            break;
                        }
                    }
                }
            }
        }
        debug!("acceptor stopped");
    }
}

/// Open a listening socket and register it with the acceptor
pub(crate) fn listen(shared: &Arc<AcceptorShared>, addr: SocketAddr, backlog: i32) -> Result<ListenerEndpoint> {
    if shared.is_closed() {
        return Err(Error::IllegalState("reactor is shut down".to_string()));
    }

    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    let std_listener: std::net::TcpListener = socket.into();
    let mut listener = MioTcpListener::from_std(std_listener);
    let address = listener.local_addr()?;

    let mut listeners = shared.listeners.lock();
    let entry = listeners.vacant_entry();
    let id = entry.key();
    shared
        .registry
        .register(&mut listener, Token(id), Interest::READABLE)?;
    entry.insert(listener);
    debug!(address = %address, "listening");

    Ok(ListenerEndpoint {
        id,
        address,
        shared: shared.clone(),
    })
}
