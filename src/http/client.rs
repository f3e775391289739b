//! HTTP client endpoint
//!
//! [`HttpClient`] owns an I/O reactor whose sessions start with a
//! [`ClientProtocolNegotiator`](super::negotiator::ClientProtocolNegotiator).
//! [`HttpClient::connect`] resolves once the connection is established and
//! its protocol is negotiated; the resulting [`ClientEndpoint`] executes
//! exchanges over it.

use super::negotiator::{ClientProtocolFactory, ProtocolConfig};
use super::{ClientExchangeHandler, Result, Version};
use crate::reactor::{
    completion, CloseMode, Command, Completion, IoReactor, IoReactorConfig, Priority, ReactorStatus, SessionHandle,
};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::debug;

/// A negotiated client connection
#[derive(Clone)]
pub struct ClientEndpoint {
    handle: SessionHandle,
    version: Version,
}

impl ClientEndpoint {
    pub(crate) fn new(handle: SessionHandle, version: Version) -> Self {
        ClientEndpoint { handle, version }
    }

    /// Protocol spoken on this connection
    pub fn protocol(&self) -> Version {
        self.version
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_open()
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Queue an exchange on the connection.
    ///
    /// HTTP/1.1 runs queued exchanges one after another, HTTP/2 opens a
    /// stream for each. Returns `false` when the connection is already closed;
    /// the handler has been failed with `Error::Cancelled` in that case.
    pub fn execute(&self, handler: Box<dyn ClientExchangeHandler>) -> bool {
        self.execute_with_priority(handler, Priority::Normal)
    }

    pub fn execute_with_priority(&self, handler: Box<dyn ClientExchangeHandler>, priority: Priority) -> bool {
        self.handle.enqueue(Command::Execute(handler), priority)
    }

    /// Close the connection; `Graceful` lets running exchanges finish
    pub fn close(&self, mode: CloseMode) {
        self.handle.close(mode);
    }
}

impl fmt::Debug for ClientEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientEndpoint")
            .field("session", &self.handle.id())
            .field("protocol", &self.version)
            .finish()
    }
}

/// Connection initiator running its own reactor
pub struct HttpClient {
    reactor: IoReactor<ClientProtocolFactory>,
}

impl HttpClient {
    /// Start a client with default reactor settings
    pub fn start(config: ProtocolConfig) -> Result<Self> {
        Self::start_with(IoReactorConfig::default(), config)
    }

    pub fn start_with(reactor: IoReactorConfig, config: ProtocolConfig) -> Result<Self> {
        let reactor = IoReactor::new(reactor, ClientProtocolFactory::new(config))?;
        reactor.start()?;
        Ok(HttpClient { reactor })
    }

    /// Connect to `remote`.
    ///
    /// `timeout` bounds establishing the TCP connection. The completion fails
    /// with the connect error, or with the TLS or negotiation error when the
    /// session could not be set up.
    pub fn connect(&self, remote: SocketAddr, timeout: Duration) -> Completion<ClientEndpoint> {
        let (completer, endpoint) = completion();
        debug!(%remote, "connecting");
        // The negotiator reports through the attachment, not the session completion
        let _session = self.reactor.connect(remote, None, Some(timeout), Some(completer), None);
        endpoint
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

    /// Close every connection, gracefully within `grace`
    pub fn shutdown(&self, grace: Duration) {
        self.reactor.shutdown(grace);
    }
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("status", &self.reactor.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::support::BasicClientExchange;
    use crate::http::{Error, Method, RequestHead};
    use crate::reactor::session::SessionShared;
    use std::sync::Arc;

    #[test]
    fn test_execute_on_closed_endpoint_cancels() {
        let shared = Arc::new(SessionShared::detached(3));
        let endpoint = ClientEndpoint::new(SessionHandle::new(shared.clone()), Version::Http11);
        assert!(shared.mark_closed());

        let (exchange, response) = BasicClientExchange::new(RequestHead::new(Method::Get, "/"), None);
        assert!(!endpoint.execute(Box::new(exchange)));
        assert!(matches!(response.try_take(), Some(Err(Error::Cancelled))));
    }

    #[test]
    fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let reactor = IoReactorConfig::builder().workers(1).build();
        let client = HttpClient::start_with(reactor, ProtocolConfig::default()).unwrap();
        let result = client.connect(addr, Duration::from_secs(2)).wait(Duration::from_secs(5));
        assert!(result.is_err());
        client.shutdown(Duration::from_secs(1));
        assert_eq!(client.status(), ReactorStatus::Terminated);
    }
}
