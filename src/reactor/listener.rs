//! Session lifecycle observers

use crate::http::Error;
use std::net::SocketAddr;
use tracing::{debug, warn};

/// Observer notified of session lifecycle events
///
/// One instance is injected through [`IoReactorConfig`](super::IoReactorConfig)
/// and shared by every session of the reactor. All methods default to no-ops.
pub trait SessionListener: Send + Sync {
    fn connected(&self, _id: u64, _remote: Option<SocketAddr>) {}

    fn upgraded(&self, _id: u64, _protocol: &str) {}

    fn timeout(&self, _id: u64) {}

    fn exception(&self, _id: u64, _cause: &Error) {}

    fn disconnected(&self, _id: u64) {}
}

/// Listener that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl SessionListener for NoopListener {}

/// Listener that reports lifecycle events through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl SessionListener for TracingListener {
    fn connected(&self, id: u64, remote: Option<SocketAddr>) {
        debug!(session = id, remote = ?remote, "session connected");
    }

    fn upgraded(&self, id: u64, protocol: &str) {
        debug!(session = id, protocol, "protocol handler installed");
    }

    fn timeout(&self, id: u64) {
        debug!(session = id, "session timed out");
    }

    fn exception(&self, id: u64, cause: &Error) {
        warn!(session = id, error = %cause, "session failed");
    }

    fn disconnected(&self, id: u64) {
        debug!(session = id, "session closed");
    }
}
