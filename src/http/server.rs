//! HTTP server endpoint
//!
//! [`HttpServer`] owns an I/O reactor whose accepted sessions start with a
//! [`ServerProtocolNegotiator`](super::negotiator::ServerProtocolNegotiator).
//! Requests on every listener are served by handlers from one
//! [`ServerExchangeHandlerFactory`].

use super::negotiator::{ProtocolConfig, ServerProtocolFactory};
use super::{Result, ServerExchangeHandlerFactory};
use crate::reactor::{IoReactor, IoReactorConfig, ListenerEndpoint, ReactorStatus};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Listening HTTP server running its own reactor
pub struct HttpServer {
    reactor: IoReactor<ServerProtocolFactory>,
}

impl HttpServer {
    /// Start a server with default reactor settings; it listens nowhere yet
    pub fn start(config: ProtocolConfig, handlers: Arc<dyn ServerExchangeHandlerFactory>) -> Result<Self> {
        Self::start_with(IoReactorConfig::default(), config, handlers)
    }

    pub fn start_with(
        reactor: IoReactorConfig,
        config: ProtocolConfig,
        handlers: Arc<dyn ServerExchangeHandlerFactory>,
    ) -> Result<Self> {
        let reactor = IoReactor::new(reactor, ServerProtocolFactory::new(config, handlers))?;
        reactor.start()?;
        Ok(HttpServer { reactor })
    }

    /// Accept connections on `addr`; port 0 picks a free port
    pub fn listen(&self, addr: SocketAddr) -> Result<ListenerEndpoint> {
        let endpoint = self.reactor.listen(addr)?;
        info!(address = %endpoint.address(), "listening");
        Ok(endpoint)
    }

    pub fn status(&self) -> ReactorStatus {
        self.reactor.status()
    }

    pub fn initiate_shutdown(&self) {
        self.reactor.initiate_shutdown();
    }

    pub fn await_shutdown(&self, timeout: Duration) -> bool {
        self.reactor.await_shutdown(timeout)
    }

    /// Stop listening and close every connection, gracefully within `grace`
    pub fn shutdown(&self, grace: Duration) {
        self.reactor.shutdown(grace);
    }
}

impl fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpServer")
            .field("status", &self.reactor.status())
            .finish()
    }
}
