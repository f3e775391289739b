//! Per-connection protocol selection
//!
//! Every session starts with a negotiator as its handler. The negotiator
//! runs the TLS handshake if one is configured, decides between HTTP/1.1 and
//! HTTP/2 and then installs exactly one protocol engine through
//! [`IoSession::upgrade`].
//!
//! The decision follows the [`VersionPolicy`]:
//!
//! - over TLS, ALPN decides; a protocol contradicting a forced policy is a
//!   negotiation failure
//! - on a plaintext server with `Negotiate`, the first bytes are compared
//!   with the HTTP/2 connection preface; any mismatch selects HTTP/1.1
//! - on a plaintext client, `Negotiate` means HTTP/1.1
//!
//! Bytes read while sniffing are replayed into the installed engine before
//! it reads from the socket itself.

use super::client::ClientEndpoint;
use super::h1::{ClientHttp1Duplexer, H1Config, ServerHttp1Duplexer};
use super::h2::{H2Config, H2Multiplexer, CONNECTION_PREFACE};
use super::strategy::{
    ConnectionReuseStrategy, ContentLengthStrategy, DefaultConnectionReuseStrategy, DefaultContentLengthStrategy,
};
use super::tls::{HandshakeStatus, TlsConfig, TlsSessionVerifier};
use super::{Error, Result, ServerExchangeHandlerFactory, Version};
use crate::reactor::{
    fill_buffer, CloseMode, Command, Completer, EventMask, IoEventHandler, IoEventHandlerFactory, IoSession, Priority,
};
use bytes::BytesMut;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// ALPN identifier of HTTP/2 over TLS
pub const ALPN_H2: &str = "h2";

/// ALPN identifier of HTTP/1.1
pub const ALPN_HTTP11: &str = "http/1.1";

/// Which protocol versions a connection may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionPolicy {
    ForceHttp1,
    ForceHttp2,
    /// ALPN over TLS, preface detection on plaintext servers
    #[default]
    Negotiate,
}

impl VersionPolicy {
    /// ALPN protocols offered under this policy, in preference order
    pub fn alpn_protocols(&self) -> &'static [&'static str] {
        match self {
            VersionPolicy::ForceHttp1 => &[ALPN_HTTP11],
            VersionPolicy::ForceHttp2 => &[ALPN_H2],
            VersionPolicy::Negotiate => &[ALPN_H2, ALPN_HTTP11],
        }
    }

    /// Protocol for a TLS session whose handshake selected `alpn`
    fn select(&self, alpn: Option<&str>) -> Result<Option<Version>> {
        match (self, alpn) {
            (_, Some(ALPN_H2)) if *self != VersionPolicy::ForceHttp1 => Ok(Some(Version::Http2)),
            (_, Some(ALPN_HTTP11)) if *self != VersionPolicy::ForceHttp2 => Ok(Some(Version::Http11)),
            (policy, Some(other)) => Err(Error::Negotiation(format!(
                "peer selected {} under {:?}",
                other, policy
            ))),
            (VersionPolicy::ForceHttp1, None) => Ok(Some(Version::Http11)),
            (VersionPolicy::ForceHttp2, None) => Ok(Some(Version::Http2)),
            (VersionPolicy::Negotiate, None) => Ok(None),
        }
    }
}

/// Transport security of a connection
#[derive(Clone, Default)]
pub enum TlsMode {
    #[default]
    Plain,
    Tls(TlsConfig),
}

impl TlsMode {
    pub fn is_tls(&self) -> bool {
        matches!(self, TlsMode::Tls(_))
    }
}

impl fmt::Debug for TlsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsMode::Plain => f.write_str("Plain"),
            TlsMode::Tls(config) => f
                .debug_struct("Tls")
                .field("server", &config.is_server())
                .field("alpn", &config.alpn_protocols())
                .finish(),
        }
    }
}

/// Everything a negotiator needs to set up a connection
#[derive(Clone)]
pub struct ProtocolConfig {
    pub policy: VersionPolicy,
    pub h1: H1Config,
    pub h2: H2Config,
    pub tls: TlsMode,
    pub content_length: Arc<dyn ContentLengthStrategy>,
    pub reuse: Arc<dyn ConnectionReuseStrategy>,
    /// Consulted once the TLS handshake completed
    pub verifier: Option<Arc<dyn TlsSessionVerifier>>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            policy: VersionPolicy::default(),
            h1: H1Config::default(),
            h2: H2Config::default(),
            tls: TlsMode::Plain,
            content_length: Arc::new(DefaultContentLengthStrategy),
            reuse: Arc::new(DefaultConnectionReuseStrategy),
            verifier: None,
        }
    }
}

impl fmt::Debug for ProtocolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolConfig")
            .field("policy", &self.policy)
            .field("h1", &self.h1)
            .field("h2", &self.h2)
            .field("tls", &self.tls)
            .field("verifier", &self.verifier.is_some())
            .finish()
    }
}

impl ProtocolConfig {
    pub fn builder() -> ProtocolConfigBuilder {
        ProtocolConfigBuilder {
            config: ProtocolConfig::default(),
        }
    }

    fn client_engine(&self, version: Version) -> Box<dyn IoEventHandler> {
        match version {
            Version::Http2 => {
                let scheme = if self.tls.is_tls() { "https" } else { "http" };
                Box::new(H2Multiplexer::client(self.h2.clone()).scheme(scheme))
            }
            _ => Box::new(
                ClientHttp1Duplexer::new(self.h1.clone())
                    .content_length_strategy(self.content_length.clone())
                    .reuse_strategy(self.reuse.clone()),
            ),
        }
    }

    fn server_engine(
        &self,
        version: Version,
        handlers: Arc<dyn ServerExchangeHandlerFactory>,
    ) -> Box<dyn IoEventHandler> {
        match version {
            Version::Http2 => Box::new(H2Multiplexer::server(self.h2.clone(), handlers)),
            _ => Box::new(
                ServerHttp1Duplexer::new(self.h1.clone(), handlers)
                    .content_length_strategy(self.content_length.clone())
                    .reuse_strategy(self.reuse.clone()),
            ),
        }
    }
}

/// Builder for [`ProtocolConfig`]
#[derive(Clone)]
pub struct ProtocolConfigBuilder {
    config: ProtocolConfig,
}

impl ProtocolConfigBuilder {
    pub fn policy(mut self, policy: VersionPolicy) -> Self {
        self.config.policy = policy;
        self
    }

    pub fn h1(mut self, config: H1Config) -> Self {
        self.config.h1 = config;
        self
    }

    pub fn h2(mut self, config: H2Config) -> Self {
        self.config.h2 = config;
        self
    }

    /// Run every connection over TLS with this context
    pub fn tls(mut self, config: TlsConfig) -> Self {
        self.config.tls = TlsMode::Tls(config);
        self
    }

    pub fn content_length_strategy(mut self, strategy: Arc<dyn ContentLengthStrategy>) -> Self {
        self.config.content_length = strategy;
        self
    }

    pub fn reuse_strategy(mut self, strategy: Arc<dyn ConnectionReuseStrategy>) -> Self {
        self.config.reuse = strategy;
        self
    }

    pub fn verifier(mut self, verifier: Arc<dyn TlsSessionVerifier>) -> Self {
        self.config.verifier = Some(verifier);
        self
    }

    pub fn build(self) -> ProtocolConfig {
        self.config
    }
}

/// Drive a started TLS handshake; `true` once it is complete and verified
fn advance_handshake(session: &mut dyn IoSession, verifier: Option<&Arc<dyn TlsSessionVerifier>>) -> Result<bool> {
    match session.handshake()? {
        HandshakeStatus::WantRead => {
            session.set_event_mask(EventMask::READ);
            Ok(false)
        }
        HandshakeStatus::WantWrite => {
            session.set_event_mask(EventMask::READ | EventMask::WRITE);
            Ok(false)
        }
        HandshakeStatus::Complete => {
            if let (Some(verifier), Some(details)) = (verifier, session.tls_details()) {
                verifier.verify(session.remote_addr(), details)?;
            }
            Ok(true)
        }
    }
}

fn negotiated_alpn(session: &dyn IoSession) -> Option<String> {
    session.tls_details().and_then(|details| details.alpn.clone())
}

/// Take commands that arrive before a protocol engine is installed
///
/// A shutdown closes the session and cancels held requests; requests are
/// held in `deferred` for the engine. Returns `false` once the session closes.
fn drain_commands(session: &mut dyn IoSession, deferred: &mut Vec<Command>) -> bool {
    while let Some(command) = session.poll_command() {
        match command {
            Command::Shutdown(mode) => {
                debug!(session = session.id(), ?mode, "shutdown during negotiation");
                session.close(mode);
                for command in deferred.drain(..) {
                    command.cancel();
                }
                return false;
            }
            execute => deferred.push(execute),
        }
    }
    true
}

/// Hand held requests back to the session queue for the installed engine
fn requeue(session: &dyn IoSession, deferred: &mut Vec<Command>) {
    if deferred.is_empty() {
        return;
    }
    let handle = session.handle();
    for command in deferred.drain(..) {
        handle.enqueue(command, Priority::Normal);
    }
}

/// Hand the session to `engine`, replaying bytes that were already read
fn install(session: &mut dyn IoSession, mut engine: Box<dyn IoEventHandler>, replay: &[u8]) -> Result<()> {
    debug!(session = session.id(), protocol = engine.protocol(), replay = replay.len(), "protocol selected");
    engine.connected(session)?;
    if !replay.is_empty() {
        engine.input_ready(session, Some(replay))?;
    }
    session.upgrade(engine);
    Ok(())
}

/// Initial handler of outbound sessions
pub struct ClientProtocolNegotiator {
    config: Arc<ProtocolConfig>,
    completer: Option<Completer<ClientEndpoint>>,
    handshaking: bool,
    deferred: Vec<Command>,
}

impl ClientProtocolNegotiator {
    pub fn new(config: Arc<ProtocolConfig>, completer: Option<Completer<ClientEndpoint>>) -> Self {
        ClientProtocolNegotiator {
            config,
            completer,
            handshaking: false,
            deferred: Vec::new(),
        }
    }

    fn proceed(&mut self, session: &mut dyn IoSession) -> Result<()> {
        if self.handshaking {
            if !advance_handshake(session, self.config.verifier.as_ref())? {
                return Ok(());
            }
            self.handshaking = false;
        }
        let alpn = negotiated_alpn(session);
        let version = if self.config.tls.is_tls() {
            self.config.policy.select(alpn.as_deref())?.unwrap_or(Version::Http11)
        } else if self.config.policy == VersionPolicy::ForceHttp2 {
            Version::Http2
        } else {
            Version::Http11
        };

        requeue(session, &mut self.deferred);
        install(session, self.config.client_engine(version), &[])?;
        if let Some(completer) = self.completer.take() {
            completer.complete(Ok(ClientEndpoint::new(session.handle(), version)));
        }
        Ok(())
    }

    fn fail(&mut self, cause: Error) {
        if let Some(completer) = self.completer.take() {
            completer.fail(cause);
        }
    }
}

impl IoEventHandler for ClientProtocolNegotiator {
    fn protocol(&self) -> &'static str {
        "negotiation"
    }

    fn connected(&mut self, session: &mut dyn IoSession) -> Result<()> {
        if let TlsMode::Tls(tls) = &self.config.tls {
            trace!(session = session.id(), policy = ?self.config.policy, "starting TLS");
            session.start_tls(tls, None, self.config.policy.alpn_protocols())?;
            self.handshaking = true;
        }
        self.proceed(session)
    }

    fn input_ready(&mut self, session: &mut dyn IoSession, _replay: Option<&[u8]>) -> Result<()> {
        if !drain_commands(session, &mut self.deferred) {
            return Ok(());
        }
        self.proceed(session)
    }

    fn output_ready(&mut self, session: &mut dyn IoSession) -> Result<()> {
        if !drain_commands(session, &mut self.deferred) {
            return Ok(());
        }
        self.proceed(session)
    }

    fn timeout(&mut self, _session: &mut dyn IoSession, _timeout: Duration) -> Result<()> {
        Err(Error::Timeout)
    }

    fn exception(&mut self, _session: &mut dyn IoSession, cause: &Error) {
        self.fail(cause.clone());
    }

    fn disconnected(&mut self, _session: &mut dyn IoSession) {
        self.fail(Error::ConnectionClosed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerPhase {
    Handshake,
    /// Reading the first bytes to tell HTTP/2 from HTTP/1.1
    Sniff,
    Done,
}

/// Initial handler of accepted sessions
pub struct ServerProtocolNegotiator {
    config: Arc<ProtocolConfig>,
    handlers: Arc<dyn ServerExchangeHandlerFactory>,
    phase: ServerPhase,
    buffer: BytesMut,
    deferred: Vec<Command>,
}

impl ServerProtocolNegotiator {
    pub fn new(config: Arc<ProtocolConfig>, handlers: Arc<dyn ServerExchangeHandlerFactory>) -> Self {
        ServerProtocolNegotiator {
            config,
            handlers,
            phase: ServerPhase::Sniff,
            buffer: BytesMut::with_capacity(CONNECTION_PREFACE.len()),
            deferred: Vec::new(),
        }
    }

    fn proceed(&mut self, session: &mut dyn IoSession) -> Result<()> {
        if self.phase == ServerPhase::Handshake {
            if !advance_handshake(session, self.config.verifier.as_ref())? {
                return Ok(());
            }
            let alpn = negotiated_alpn(session);
            match self.config.policy.select(alpn.as_deref())? {
                Some(version) => return self.select(session, version),
                None => {
                    session.set_event_mask(EventMask::READ);
                    self.phase = ServerPhase::Sniff;
                }
            }
        }
        if self.phase == ServerPhase::Sniff {
            self.sniff(session)?;
        }
        Ok(())
    }

    fn sniff(&mut self, session: &mut dyn IoSession) -> Result<()> {
        let fill = fill_buffer(session, &mut self.buffer, CONNECTION_PREFACE.len())?;
        let n = self.buffer.len();
        if self.buffer[..] != CONNECTION_PREFACE[..n] {
            return self.select(session, Version::Http11);
        }
        if n == CONNECTION_PREFACE.len() {
            return self.select(session, Version::Http2);
        }
        if fill.eof {
            trace!(session = session.id(), buffered = n, "closed before the protocol was known");
            session.close(CloseMode::Graceful);
        }
        Ok(())
    }

    fn select(&mut self, session: &mut dyn IoSession, version: Version) -> Result<()> {
        self.phase = ServerPhase::Done;
        let replay = self.buffer.split();
        requeue(session, &mut self.deferred);
        install(session, self.config.server_engine(version, self.handlers.clone()), &replay)
    }
}

impl IoEventHandler for ServerProtocolNegotiator {
    fn protocol(&self) -> &'static str {
        "negotiation"
    }

    fn connected(&mut self, session: &mut dyn IoSession) -> Result<()> {
        if let TlsMode::Tls(tls) = &self.config.tls {
            session.start_tls(tls, None, self.config.policy.alpn_protocols())?;
            self.phase = ServerPhase::Handshake;
            return self.proceed(session);
        }
        match self.config.policy {
            VersionPolicy::ForceHttp1 => self.select(session, Version::Http11),
            VersionPolicy::ForceHttp2 => self.select(session, Version::Http2),
            VersionPolicy::Negotiate => {
                session.set_event_mask(EventMask::READ);
                Ok(())
            }
        }
    }

    fn input_ready(&mut self, session: &mut dyn IoSession, _replay: Option<&[u8]>) -> Result<()> {
        if !drain_commands(session, &mut self.deferred) {
            return Ok(());
        }
        self.proceed(session)
    }

    fn output_ready(&mut self, session: &mut dyn IoSession) -> Result<()> {
        if !drain_commands(session, &mut self.deferred) {
            session.clear_event(EventMask::WRITE);
            return Ok(());
        }
        if self.phase == ServerPhase::Handshake {
            return self.proceed(session);
        }
        session.clear_event(EventMask::WRITE);
        Ok(())
    }

    fn timeout(&mut self, session: &mut dyn IoSession, timeout: Duration) -> Result<()> {
        debug!(session = session.id(), ?timeout, phase = ?self.phase, "negotiation timed out");
        session.close(CloseMode::Immediate);
        Ok(())
    }

    fn exception(&mut self, session: &mut dyn IoSession, cause: &Error) {
        debug!(session = session.id(), error = %cause, "negotiation failed");
    }

    fn disconnected(&mut self, _session: &mut dyn IoSession) {}
}

/// Session factory for [`HttpClient`](super::client::HttpClient) reactors
///
/// The attachment of a connect request receives the negotiated endpoint.
pub struct ClientProtocolFactory {
    config: Arc<ProtocolConfig>,
}

impl ClientProtocolFactory {
    pub fn new(config: ProtocolConfig) -> Self {
        ClientProtocolFactory {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }
}

impl IoEventHandlerFactory for ClientProtocolFactory {
    type Attachment = Completer<ClientEndpoint>;

    fn create_handler(
        &self,
        _session: &mut dyn IoSession,
        attachment: Option<Self::Attachment>,
    ) -> Box<dyn IoEventHandler> {
        Box::new(ClientProtocolNegotiator::new(self.config.clone(), attachment))
    }

    fn connect_failed(&self, attachment: Option<Self::Attachment>, cause: &Error) {
        if let Some(completer) = attachment {
            completer.fail(cause.clone());
        }
    }
}

/// Session factory for [`HttpServer`](super::server::HttpServer) reactors
pub struct ServerProtocolFactory {
    config: Arc<ProtocolConfig>,
    handlers: Arc<dyn ServerExchangeHandlerFactory>,
}

impl ServerProtocolFactory {
    pub fn new(config: ProtocolConfig, handlers: Arc<dyn ServerExchangeHandlerFactory>) -> Self {
        ServerProtocolFactory {
            config: Arc::new(config),
            handlers,
        }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }
}

impl IoEventHandlerFactory for ServerProtocolFactory {
    type Attachment = ();

    fn create_handler(&self, _session: &mut dyn IoSession, _attachment: Option<()>) -> Box<dyn IoEventHandler> {
        Box::new(ServerProtocolNegotiator::new(self.config.clone(), self.handlers.clone()))
    }
}
