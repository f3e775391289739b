//! Server side HTTP/1.1 duplexer
//!
//! Requests are handled strictly one at a time: once a request has been read
//! in full, no further input is parsed until its response has been written,
//! which keeps responses in request order even when the client pipelines.

use super::content::{ContentDecoder, ContentEncoder};
use super::H1Config;
use crate::http::chunked::Decoded;
use crate::http::exchange::{grant_capacity, DataSink, HeadSlot};
use crate::http::parser::HeadParser;
use crate::http::strategy::{
    ConnectionReuseStrategy, ContentLengthStrategy, DefaultConnectionReuseStrategy,
    DefaultContentLengthStrategy, MessageKind,
};
use crate::http::{
    Error, Method, RequestHead, ResponseHead, Result, ServerExchangeHandler,
    ServerExchangeHandlerFactory, Status, Version,
};
use crate::reactor::{fill_buffer, flush_buffer, CloseMode, Command, EventMask, IoEventHandler, IoSession};
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// State of the exchange in progress
struct ServerExchange {
    handler: Box<dyn ServerExchangeHandler>,
    request: RequestHead,
    decoder: Option<ContentDecoder>,
    capacity: usize,
    request_done: bool,
    /// Client sent `Expect: 100-continue` and is still owed an answer
    expect_continue: bool,
    response_sent: bool,
    encoder: Option<ContentEncoder>,
    response_done: bool,
    keep_alive: bool,
    output_requested: bool,
}

impl ServerExchange {
    fn update_capacity(&mut self) -> Result<()> {
        grant_capacity(self.handler.as_mut(), &mut self.capacity)
    }

    fn fail(mut self, cause: &Error) {
        self.handler.failed(cause);
        self.handler.release_resources();
    }
}

/// HTTP/1.1 server protocol handler
pub struct ServerHttp1Duplexer {
    config: H1Config,
    factory: Arc<dyn ServerExchangeHandlerFactory>,
    length_strategy: Arc<dyn ContentLengthStrategy>,
    reuse_strategy: Arc<dyn ConnectionReuseStrategy>,
    parser: HeadParser,
    inbuf: BytesMut,
    outbuf: BytesMut,
    exchange: Option<ServerExchange>,
    eof: bool,
    /// Graceful shutdown requested; no new requests are accepted
    shutdown: bool,
    /// Close once the output buffer is flushed
    closing: bool,
}

impl ServerHttp1Duplexer {
    pub fn new(config: H1Config, factory: Arc<dyn ServerExchangeHandlerFactory>) -> Self {
        ServerHttp1Duplexer {
            parser: config.head_parser(),
            inbuf: BytesMut::with_capacity(config.buffer_size),
            outbuf: BytesMut::with_capacity(config.buffer_size),
            config,
            factory,
            length_strategy: Arc::new(DefaultContentLengthStrategy),
            reuse_strategy: Arc::new(DefaultConnectionReuseStrategy),
            exchange: None,
            eof: false,
            shutdown: false,
            closing: false,
        }
    }

    pub fn content_length_strategy(mut self, strategy: Arc<dyn ContentLengthStrategy>) -> Self {
        self.length_strategy = strategy;
        self
    }

    pub fn reuse_strategy(mut self, strategy: Arc<dyn ConnectionReuseStrategy>) -> Self {
        self.reuse_strategy = strategy;
        self
    }

    fn wants_input(&self) -> bool {
        if self.closing || self.eof {
            return false;
        }
        match &self.exchange {
            None => !self.shutdown,
            Some(exchange) => !exchange.request_done && exchange.capacity > 0,
        }
    }

    fn read_input(&mut self, session: &mut dyn IoSession) -> Result<()> {
        let limit = self.inbuf.len() + self.config.buffer_size;
        let fill = fill_buffer(session, &mut self.inbuf, limit)?;
        if fill.eof {
            trace!(session = session.id(), "peer closed its side");
            self.eof = true;
        }
        Ok(())
    }

    /// Run the exchange state machine until it cannot make progress
    fn drive(&mut self, session: &mut dyn IoSession) -> Result<()> {
        loop {
            self.process_input(session)?;
            self.produce_output()?;
            if !self.complete_exchange(session) {
                break;
            }
        }
        if !flush_buffer(session, &mut self.outbuf)? {
            trace!(session = session.id(), pending = self.outbuf.len(), "output buffer not drained");
        }
        if self.closing && self.outbuf.is_empty() {
            session.close(CloseMode::Graceful);
            return Ok(());
        }
        self.update_interest(session);
        Ok(())
    }

    fn process_input(&mut self, session: &mut dyn IoSession) -> Result<()> {
        if self.closing {
            return Ok(());
        }
        if self.exchange.is_none() {
            if self.shutdown {
                return Ok(());
            }
            let head = match self.parser.parse_request(&mut self.inbuf) {
                Ok(Some(head)) => head,
                Ok(None) => {
                    if self.eof {
                        if self.parser.in_progress() || !self.inbuf.is_empty() {
                            debug!(session = session.id(), "connection closed mid request head");
                        }
                        self.closing = true;
                    }
                    return Ok(());
                }
                Err(cause) => {
                    self.reject(session, &cause);
                    return Ok(());
                }
            };
            self.start_exchange(session, head)?;
        }
        self.consume_body()
    }

    /// Answer an unparseable request with 400 and close
    fn reject(&mut self, session: &mut dyn IoSession, cause: &Error) {
        debug!(session = session.id(), error = %cause, "malformed request");
        ResponseHead::new(Status::BAD_REQUEST)
            .header("Content-Length", "0")
            .header("Connection", "close")
            .encode(&mut self.outbuf);
        self.inbuf.clear();
        self.closing = true;
    }

    fn start_exchange(&mut self, session: &mut dyn IoSession, head: RequestHead) -> Result<()> {
        let length = match self.length_strategy.determine(&head.headers, MessageKind::Request) {
            Ok(length) => length,
            Err(cause) => {
                self.reject(session, &cause);
                return Ok(());
            }
        };
        trace!(session = session.id(), method = %head.method, path = %head.path, "request");
        let decoder = ContentDecoder::new(length);
        let has_entity = decoder.is_some();
        let handler = self.factory.create(&head, &session.handle());

        let mut exchange = ServerExchange {
            handler,
            expect_continue: has_entity && head.expects_continue(),
            request: head.clone(),
            decoder,
            capacity: 0,
            request_done: !has_entity,
            response_sent: false,
            encoder: None,
            response_done: false,
            keep_alive: true,
            output_requested: false,
        };
        let started = exchange
            .handler
            .handle_request(head, has_entity)
            .and_then(|_| if has_entity { exchange.update_capacity() } else { Ok(()) });
        if let Err(cause) = started {
            exchange.fail(&cause);
            return Err(cause);
        }
        self.exchange = Some(exchange);
        Ok(())
    }

    fn consume_body(&mut self) -> Result<()> {
        let Some(exchange) = self.exchange.as_mut() else {
            return Ok(());
        };
        if exchange.request_done {
            return Ok(());
        }
        // Hold the body back until 100 Continue went out or the handler responded
        if exchange.expect_continue {
            return Ok(());
        }
        let Some(decoder) = exchange.decoder.as_mut() else {
            return Ok(());
        };
        loop {
            if exchange.capacity == 0 {
                grant_capacity(exchange.handler.as_mut(), &mut exchange.capacity)?;
            }
            match decoder.decode(&mut self.inbuf, exchange.capacity, self.eof)? {
                Decoded::Data(data) => {
                    exchange.capacity -= data.len();
                    exchange.handler.consume(&data)?;
                    grant_capacity(exchange.handler.as_mut(), &mut exchange.capacity)?;
                }
                Decoded::NeedMore => return Ok(()),
                Decoded::End(trailers) => {
                    exchange.request_done = true;
                    let trailers = if trailers.is_empty() { None } else { Some(trailers) };
                    return exchange.handler.stream_end(trailers);
                }
            }
        }
    }

    fn produce_output(&mut self) -> Result<()> {
        let Some(exchange) = self.exchange.as_mut() else {
            return Ok(());
        };
        let http11 = exchange.request.version >= Version::Http11;

        if !exchange.response_sent {
            let mut slot = HeadSlot::new();
            exchange.handler.produce_response(&mut slot)?;
            for mut info in slot.information {
                if info.status == Status::CONTINUE {
                    if !exchange.expect_continue {
                        continue;
                    }
                    exchange.expect_continue = false;
                }
                if http11 {
                    info.version = Version::Http11;
                    info.encode(&mut self.outbuf);
                }
            }
            match slot.head {
                Some((head, has_entity)) => self.commit_response(head, has_entity)?,
                None => {
                    let Some(exchange) = self.exchange.as_mut() else {
                        return Ok(());
                    };
                    if exchange.expect_continue {
                        exchange.expect_continue = false;
                        ResponseHead::new(Status::CONTINUE).encode(&mut self.outbuf);
                    }
                    return Ok(());
                }
            }
        }

        let Some(exchange) = self.exchange.as_mut() else {
            return Ok(());
        };
        let Some(encoder) = exchange.encoder.as_mut() else {
            return Ok(());
        };
        exchange.output_requested = false;
        while !exchange.response_done && self.outbuf.len() < self.config.buffer_size {
            if exchange.handler.available() == 0 {
                break;
            }
            let mut sink = DataSink::new(self.config.buffer_size - self.outbuf.len());
            exchange.handler.produce(&mut sink)?;
            encoder.encode(&sink.data, &mut self.outbuf)?;
            exchange.output_requested |= sink.output_requested;
            if let Some(trailers) = sink.end {
                encoder.complete(trailers.as_ref(), &mut self.outbuf)?;
                exchange.response_done = true;
            } else if sink.data.is_empty() {
                break;
            }
        }
        Ok(())
    }

    fn commit_response(&mut self, mut head: ResponseHead, has_entity: bool) -> Result<()> {
        let shutdown = self.shutdown;
        let Some(exchange) = self.exchange.as_mut() else {
            return Ok(());
        };
        let request = &exchange.request;
        head.version = Version::Http11;
        // A final response ends any wait for 100 Continue
        exchange.expect_continue = false;

        let framed = head.headers.contains("Content-Length") || head.headers.contains("Transfer-Encoding");
        let bodiless = request.method == Method::Head
            || head.status == Status::NO_CONTENT
            || head.status == Status::NOT_MODIFIED;
        if !framed && !bodiless {
            if !has_entity {
                head.headers.set("Content-Length", "0");
            } else if request.version >= Version::Http11 {
                head.headers.set("Transfer-Encoding", "chunked");
            } else {
                head.headers.set("Connection", "close");
            }
        }

        let length = self.length_strategy.determine(
            &head.headers,
            MessageKind::Response {
                method: request.method,
                status: head.status,
            },
        )?;
        let encoder = if has_entity { ContentEncoder::new(length) } else { None };

        let mut keep_alive = !shutdown
            && !self.eof
            && self.reuse_strategy.keep_alive(request, &head)
            && !encoder.as_ref().map_or(false, ContentEncoder::closes_connection);
        if !keep_alive {
            if !head.headers.contains_token("Connection", "close") {
                head.headers.set("Connection", "close");
            }
        } else if request.version == Version::Http10 {
            head.headers.set("Connection", "keep-alive");
        }
        if head.headers.contains_token("Connection", "close") {
            keep_alive = false;
        }

        trace!(status = %head.status, keep_alive, "response");
        head.encode(&mut self.outbuf);
        exchange.response_done = encoder.is_none();
        exchange.encoder = encoder;
        exchange.response_sent = true;
        exchange.keep_alive = keep_alive;
        Ok(())
    }

    /// Retire the exchange once its response is fully encoded.
    ///
    /// Returns true when an exchange completed and the next may start.
    fn complete_exchange(&mut self, session: &mut dyn IoSession) -> bool {
        let done = self
            .exchange
            .as_ref()
            .map_or(false, |exchange| exchange.response_done);
        if !done {
            return false;
        }
        let Some(mut exchange) = self.exchange.take() else {
            return false;
        };
        if !exchange.request_done {
            // Early response: the rest of the request body is never read
            debug!(session = session.id(), "response completed before request body");
            exchange.keep_alive = false;
        }
        exchange.handler.release_resources();
        if !exchange.keep_alive || self.shutdown {
            self.closing = true;
            return false;
        }
        true
    }

    fn update_interest(&mut self, session: &mut dyn IoSession) {
        let mut mask = EventMask::NONE;
        if self.wants_input() {
            mask |= EventMask::READ;
        }
        let producing = self.exchange.as_ref().map_or(false, |exchange| {
            exchange.output_requested
                || (exchange.response_sent && !exchange.response_done && exchange.handler.available() > 0)
        });
        if !self.outbuf.is_empty() || producing {
            mask |= EventMask::WRITE;
        }
        session.set_event_mask(mask);
    }

    fn drain_commands(&mut self, session: &mut dyn IoSession) -> bool {
        while let Some(command) = session.poll_command() {
            match command {
                Command::Shutdown(CloseMode::Immediate) => {
                    session.close(CloseMode::Immediate);
                    return false;
                }
                Command::Shutdown(CloseMode::Graceful) => {
                    debug!(session = session.id(), "graceful shutdown");
                    self.shutdown = true;
                    if self.exchange.is_none() {
                        self.closing = true;
                    }
                }
                command @ Command::Execute(_) => {
                    command.fail(&Error::IllegalState("server session cannot execute requests".to_string()))
                }
            }
        }
        true
    }

    fn fail_exchange(&mut self, cause: &Error) {
        if let Some(exchange) = self.exchange.take() {
            exchange.fail(cause);
        }
    }
}

impl IoEventHandler for ServerHttp1Duplexer {
    fn protocol(&self) -> &'static str {
        "http/1.1"
    }

    fn connected(&mut self, session: &mut dyn IoSession) -> Result<()> {
        session.set_event_mask(EventMask::READ);
        Ok(())
    }

    fn input_ready(&mut self, session: &mut dyn IoSession, replay: Option<&[u8]>) -> Result<()> {
        if let Some(data) = replay {
            self.inbuf.extend_from_slice(data);
        }
        if let Some(exchange) = self.exchange.as_mut() {
            // A handler that freed capacity resumes reading through a read event
            if !exchange.request_done && exchange.capacity == 0 {
                exchange.update_capacity()?;
            }
        }
        if self.wants_input() {
            self.read_input(session)?;
        }
        self.drive(session)
    }

    fn output_ready(&mut self, session: &mut dyn IoSession) -> Result<()> {
        if !self.drain_commands(session) {
            return Ok(());
        }
        self.drive(session)
    }

    fn timeout(&mut self, session: &mut dyn IoSession, timeout: Duration) -> Result<()> {
        if self.exchange.is_some() {
            return Err(Error::Timeout);
        }
        debug!(session = session.id(), ?timeout, "idle connection timed out");
        session.close(CloseMode::Graceful);
        Ok(())
    }

    fn exception(&mut self, _session: &mut dyn IoSession, cause: &Error) {
        self.fail_exchange(cause);
    }

    fn disconnected(&mut self, _session: &mut dyn IoSession) {
        self.fail_exchange(&Error::ConnectionClosed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::support::RequestHandlerFactory;
    use crate::reactor::mock::MemorySession;

    fn echo_server() -> ServerHttp1Duplexer {
        let factory = RequestHandlerFactory::new(|request, body| {
            let mut reply = format!("{} {}", request.method, request.path).into_bytes();
            reply.extend_from_slice(&body);
            (ResponseHead::new(Status::OK), reply)
        });
        ServerHttp1Duplexer::new(H1Config::default(), Arc::new(factory))
    }

    fn run(server: &mut ServerHttp1Duplexer, session: &mut MemorySession) {
        server.connected(session).unwrap();
        for _ in 0..8 {
            if session.closed.is_some() {
                break;
            }
            server.input_ready(session, None).unwrap();
            if session.closed.is_some() {
                break;
            }
            server.output_ready(session).unwrap();
        }
    }

    #[test]
    fn test_simple_get() {
        let mut server = echo_server();
        let mut session = MemorySession::new();
        session.feed(b"GET /index HTTP/1.1\r\nHost: localhost\r\n\r\n");
        run(&mut server, &mut session);

        let output = String::from_utf8(session.take_output()).unwrap();
        assert!(output.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(output.contains("Content-Length: 10\r\n"));
        assert!(output.ends_with("\r\n\r\nGET /index"));
        assert!(session.closed.is_none());
        assert!(session.mask.contains(EventMask::READ));
    }

    #[test]
    fn test_pipelined_responses_in_order() {
        let mut server = echo_server();
        let mut session = MemorySession::new();
        session.feed(
            b"GET /first HTTP/1.1\r\n\r\nPOST /second HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcGET /third HTTP/1.1\r\n\r\n",
        );
        run(&mut server, &mut session);

        let output = String::from_utf8(session.take_output()).unwrap();
        let first = output.find("GET /first").unwrap();
        let second = output.find("POST /secondabc").unwrap();
        let third = output.find("GET /third").unwrap();
        assert!(first < second && second < third);
        assert_eq!(output.matches("HTTP/1.1 200 OK").count(), 3);
    }

    #[test]
    fn test_chunked_request_body() {
        let mut server = echo_server();
        let mut session = MemorySession::new();
        session.feed(b"PUT /data HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n");
        run(&mut server, &mut session);

        let output = String::from_utf8(session.take_output()).unwrap();
        assert!(output.ends_with("PUT /dataabcde"));
    }

    #[test]
    fn test_expect_continue() {
        let mut server = echo_server();
        let mut session = MemorySession::new();
        server.connected(&mut session).unwrap();
        session.feed(b"POST /upload HTTP/1.1\r\nContent-Length: 4\r\nExpect: 100-continue\r\n\r\n");
        server.input_ready(&mut session, None).unwrap();

        let interim = String::from_utf8(session.take_output()).unwrap();
        assert_eq!(interim, "HTTP/1.1 100 Continue\r\n\r\n");

        session.feed(b"body");
        server.input_ready(&mut session, None).unwrap();
        let output = String::from_utf8(session.take_output()).unwrap();
        assert!(output.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(output.ends_with("POST /uploadbody"));
        assert!(!output.contains("100 Continue"));
    }

    #[test]
    fn test_http10_closes_after_response() {
        let mut server = echo_server();
        let mut session = MemorySession::new();
        session.feed(b"GET /old HTTP/1.0\r\n\r\n");
        run(&mut server, &mut session);

        let output = String::from_utf8(session.take_output()).unwrap();
        assert!(output.contains("Connection: close\r\n"));
        assert_eq!(session.closed, Some(CloseMode::Graceful));
    }

    #[test]
    fn test_malformed_request_gets_400() {
        let mut server = echo_server();
        let mut session = MemorySession::new();
        session.feed(b"NOT A REQUEST LINE\r\n\r\n");
        run(&mut server, &mut session);

        let output = String::from_utf8(session.take_output()).unwrap();
        assert!(output.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert_eq!(session.closed, Some(CloseMode::Graceful));
    }

    #[test]
    fn test_truncated_body_fails() {
        let mut server = echo_server();
        let mut session = MemorySession::new();
        server.connected(&mut session).unwrap();
        session.feed(b"POST /x HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc");
        session.eof = true;
        let result = server.input_ready(&mut session, None);
        assert!(matches!(result, Err(Error::ConnectionClosed)));
    }

    #[test]
    fn test_peer_close_when_idle() {
        let mut server = echo_server();
        let mut session = MemorySession::new();
        session.eof = true;
        run(&mut server, &mut session);
        assert_eq!(session.closed, Some(CloseMode::Graceful));
        assert!(session.output.is_empty());
    }

    #[test]
    fn test_graceful_shutdown_when_idle() {
        let mut server = echo_server();
        let mut session = MemorySession::new();
        server.connected(&mut session).unwrap();
        session.handle().close(CloseMode::Graceful);
        server.output_ready(&mut session).unwrap();
        assert_eq!(session.closed, Some(CloseMode::Graceful));
    }
}
