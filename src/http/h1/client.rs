//! Client side HTTP/1.1 duplexer
//!
//! Exchanges are taken from the session's command queue. Without pipelining
//! a new request starts only when the previous exchange is complete; with
//! pipelining it starts as soon as the previous request is fully written.
//! Responses are always matched to the oldest outstanding exchange.

use super::content::{ContentDecoder, ContentEncoder};
use super::H1Config;
use crate::http::chunked::Decoded;
use crate::http::exchange::{grant_capacity, DataSink, HeadSlot};
use crate::http::parser::HeadParser;
use crate::http::strategy::{
    ConnectionReuseStrategy, ContentLengthStrategy, DefaultConnectionReuseStrategy,
    DefaultContentLengthStrategy, MessageKind,
};
use crate::http::{ClientExchangeHandler, Error, RequestHead, ResponseHead, Result, Status, Version};
use crate::reactor::{fill_buffer, flush_buffer, CloseMode, Command, EventMask, IoEventHandler, IoSession};
use bytes::BytesMut;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

struct ClientExchange {
    handler: Box<dyn ClientExchangeHandler>,
    request: RequestHead,
    encoder: Option<ContentEncoder>,
    request_done: bool,
    /// Body held back until `100 Continue`, a final response or the wait expires
    awaiting_continue: bool,
    response: Option<ResponseHead>,
    decoder: Option<ContentDecoder>,
    capacity: usize,
    response_done: bool,
    keep_alive: bool,
    output_requested: bool,
}

impl ClientExchange {
    fn fail(mut self, cause: &Error) {
        self.handler.failed(cause);
        self.handler.release_resources();
    }
}

/// HTTP/1.1 client protocol handler
pub struct ClientHttp1Duplexer {
    config: H1Config,
    length_strategy: Arc<dyn ContentLengthStrategy>,
    reuse_strategy: Arc<dyn ConnectionReuseStrategy>,
    parser: HeadParser,
    inbuf: BytesMut,
    outbuf: BytesMut,
    /// Outstanding exchanges, oldest first
    exchanges: VecDeque<ClientExchange>,
    eof: bool,
    shutdown: bool,
    closing: bool,
    /// Socket timeout to restore once a 100-continue wait ends
    saved_timeout: Option<Option<Duration>>,
}

impl ClientHttp1Duplexer {
    pub fn new(config: H1Config) -> Self {
        ClientHttp1Duplexer {
            parser: config.head_parser(),
            inbuf: BytesMut::with_capacity(config.buffer_size),
            outbuf: BytesMut::with_capacity(config.buffer_size),
            config,
            length_strategy: Arc::new(DefaultContentLengthStrategy),
            reuse_strategy: Arc::new(DefaultConnectionReuseStrategy),
            exchanges: VecDeque::new(),
            eof: false,
            shutdown: false,
            closing: false,
            saved_timeout: None,
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

    /// Whether another exchange may be started now
    fn can_start(&self) -> bool {
        if self.closing || self.shutdown || self.eof {
            return false;
        }
        match self.exchanges.back() {
            None => true,
            Some(last) => self.config.pipelining && last.request_done && last.keep_alive,
        }
    }

    fn wants_input(&self) -> bool {
        if self.closing || self.eof {
            return false;
        }
        match self.exchanges.front() {
            Some(front) if front.response.is_some() && !front.response_done => front.capacity > 0,
            _ => true,
        }
    }

    fn drain_commands(&mut self, session: &mut dyn IoSession) -> Result<bool> {
        while self.can_start() || (self.exchanges.is_empty() && !self.closing) {
            let Some(command) = session.poll_command() else {
                break;
            };
            match command {
                Command::Execute(handler) => {
                    if !self.can_start() {
                        Command::Execute(handler).cancel();
                        continue;
                    }
                    self.start_exchange(session, handler)?;
                }
                Command::Shutdown(CloseMode::Graceful) => {
                    debug!(session = session.id(), "graceful shutdown");
                    self.shutdown = true;
                    if self.exchanges.is_empty() {
                        self.closing = true;
                    }
                }
                Command::Shutdown(CloseMode::Immediate) => {
                    session.close(CloseMode::Immediate);
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn start_exchange(&mut self, session: &mut dyn IoSession, mut handler: Box<dyn ClientExchangeHandler>) -> Result<()> {
        let mut slot = HeadSlot::new();
        if let Err(cause) = handler.produce_request(&mut slot) {
            handler.failed(&cause);
            handler.release_resources();
            return Ok(());
        }
        let Some((mut head, has_entity)) = slot.head else {
            handler.failed(&Error::IllegalState("exchange produced no request head".to_string()));
            handler.release_resources();
            return Ok(());
        };

        if head.version == Version::Http2 {
            head.version = Version::Http11;
        }
        if !head.headers.contains("Host") {
            if let Some(authority) = head.authority.clone() {
                head.headers.set("Host", authority);
            }
        }
        let framed = head.headers.contains("Content-Length") || head.headers.contains("Transfer-Encoding");
        if has_entity && !framed {
            head.headers.set("Transfer-Encoding", "chunked");
        }
        let length = match self.length_strategy.determine(&head.headers, MessageKind::Request) {
            Ok(length) => length,
            Err(cause) => {
                handler.failed(&cause);
                handler.release_resources();
                return Ok(());
            }
        };
        let encoder = if has_entity { ContentEncoder::new(length) } else { None };
        let awaiting_continue = encoder.is_some() && head.expects_continue();

        trace!(session = session.id(), method = %head.method, path = %head.path, "request");
        head.encode(&mut self.outbuf);
        if awaiting_continue {
            self.saved_timeout = Some(session.socket_timeout());
            session.set_socket_timeout(Some(self.config.wait_for_continue));
        }
        self.exchanges.push_back(ClientExchange {
            handler,
            request: head,
            request_done: encoder.is_none(),
            encoder,
            awaiting_continue,
            response: None,
            decoder: None,
            capacity: 0,
            response_done: false,
            keep_alive: true,
            output_requested: false,
        });
        Ok(())
    }

    fn end_continue_wait(&mut self, session: &mut dyn IoSession) {
        if let Some(timeout) = self.saved_timeout.take() {
            session.set_socket_timeout(timeout);
        }
        for exchange in self.exchanges.iter_mut() {
            exchange.awaiting_continue = false;
        }
    }

    /// Pull request body bytes of the exchange still being written
    fn produce_body(&mut self) -> Result<()> {
        let Some(exchange) = self.exchanges.back_mut() else {
            return Ok(());
        };
        if exchange.request_done || exchange.awaiting_continue {
            return Ok(());
        }
        let Some(encoder) = exchange.encoder.as_mut() else {
            return Ok(());
        };
        exchange.output_requested = false;
        while self.outbuf.len() < self.config.buffer_size && exchange.handler.available() > 0 {
            let mut sink = DataSink::new(self.config.buffer_size - self.outbuf.len());
            exchange.handler.produce(&mut sink)?;
            encoder.encode(&sink.data, &mut self.outbuf)?;
            exchange.output_requested |= sink.output_requested;
            if let Some(trailers) = sink.end {
                encoder.complete(trailers.as_ref(), &mut self.outbuf)?;
                exchange.request_done = true;
                break;
            }
            if sink.data.is_empty() {
                break;
            }
        }
        Ok(())
    }

    fn process_input(&mut self, session: &mut dyn IoSession) -> Result<()> {
        loop {
            let Some(front) = self.exchanges.front_mut() else {
                if !self.inbuf.is_empty() {
                    return Err(Error::Protocol(format!(
                        "{} bytes of unexpected data from server",
                        self.inbuf.len()
                    )));
                }
                if self.eof {
                    self.closing = true;
                }
                return Ok(());
            };

            if front.response.is_none() {
                let Some(head) = self.parser.parse_response(&mut self.inbuf)? else {
                    if self.eof {
                        return Err(Error::ConnectionClosed);
                    }
                    return Ok(());
                };
                if head.status.is_informational() {
                    if head.status == Status::CONTINUE && front.awaiting_continue {
                        trace!(session = session.id(), "100 continue");
                        self.end_continue_wait(session);
                    } else if head.status == Status::SWITCHING_PROTOCOLS {
                        return Err(Error::Protocol("protocol upgrade is not supported".to_string()));
                    }
                    let Some(front) = self.exchanges.front_mut() else {
                        return Ok(());
                    };
                    front.handler.consume_information(head)?;
                    continue;
                }
                if front.awaiting_continue {
                    // Final response before 100 Continue: the body is never sent
                    front.encoder = None;
                    front.request_done = true;
                    front.keep_alive = false;
                    self.end_continue_wait(session);
                }
                self.accept_response(session, head)?;
            }

            let Some(front) = self.exchanges.front_mut() else {
                return Ok(());
            };
            if !front.response_done {
                let Some(decoder) = front.decoder.as_mut() else {
                    return Ok(());
                };
                loop {
                    if front.capacity == 0 {
                        grant_capacity(front.handler.as_mut(), &mut front.capacity)?;
                    }
                    match decoder.decode(&mut self.inbuf, front.capacity, self.eof)? {
                        Decoded::Data(data) => {
                            front.capacity -= data.len();
                            front.handler.consume(&data)?;
                            grant_capacity(front.handler.as_mut(), &mut front.capacity)?;
                        }
                        Decoded::NeedMore => return Ok(()),
                        Decoded::End(trailers) => {
                            front.response_done = true;
                            let trailers = if trailers.is_empty() { None } else { Some(trailers) };
                            front.handler.stream_end(trailers)?;
                            break;
                        }
                    }
                }
            }
            self.complete_exchange(session);
        }
    }

    fn accept_response(&mut self, session: &mut dyn IoSession, head: ResponseHead) -> Result<()> {
        let Some(front) = self.exchanges.front_mut() else {
            return Ok(());
        };
        let length = self.length_strategy.determine(
            &head.headers,
            MessageKind::Response {
                method: front.request.method,
                status: head.status,
            },
        )?;
        let decoder = ContentDecoder::new(length);
        front.keep_alive = front.keep_alive
            && self.reuse_strategy.keep_alive(&front.request, &head)
            && !decoder.as_ref().map_or(false, ContentDecoder::until_close);
        let has_entity = decoder.is_some();
        trace!(session = session.id(), status = %head.status, keep_alive = front.keep_alive, "response");

        front.handler.consume_response(head.clone(), has_entity)?;
        front.response = Some(head);
        front.decoder = decoder;
        if has_entity {
            grant_capacity(front.handler.as_mut(), &mut front.capacity)?;
        } else {
            front.response_done = true;
        }
        Ok(())
    }

    /// Retire the oldest exchange once its response has been read
    fn complete_exchange(&mut self, session: &mut dyn IoSession) {
        let Some(mut exchange) = self.exchanges.pop_front() else {
            return;
        };
        if !exchange.request_done {
            // Early response: stop sending the request body
            debug!(session = session.id(), "response completed before request body");
            exchange.keep_alive = false;
        }
        exchange.handler.release_resources();
        if !exchange.keep_alive {
            self.closing = true;
            for pending in self.exchanges.drain(..) {
                pending.fail(&Error::ConnectionClosed);
            }
        } else if self.shutdown && self.exchanges.is_empty() {
            self.closing = true;
        }
    }

    fn drive(&mut self, session: &mut dyn IoSession) -> Result<()> {
        self.process_input(session)?;
        if !self.drain_commands(session)? {
            return Ok(());
        }
        self.produce_body()?;
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

    fn update_interest(&mut self, session: &mut dyn IoSession) {
        let mut mask = EventMask::NONE;
        if self.wants_input() {
            mask |= EventMask::READ;
        }
        let producing = self.exchanges.back().map_or(false, |exchange| {
            !exchange.request_done
                && !exchange.awaiting_continue
                && (exchange.output_requested || exchange.handler.available() > 0)
        });
        if !self.outbuf.is_empty() || producing || (self.can_start() && session.has_commands()) {
            mask |= EventMask::WRITE;
        }
        session.set_event_mask(mask);
    }

    fn fail_all(&mut self, cause: &Error) {
        for exchange in self.exchanges.drain(..) {
            exchange.fail(cause);
        }
    }
}

impl IoEventHandler for ClientHttp1Duplexer {
    fn protocol(&self) -> &'static str {
        "http/1.1"
    }

    fn connected(&mut self, session: &mut dyn IoSession) -> Result<()> {
        let mut mask = EventMask::READ;
        if session.has_commands() {
            mask |= EventMask::WRITE;
        }
        session.set_event_mask(mask);
        Ok(())
    }

    fn input_ready(&mut self, session: &mut dyn IoSession, replay: Option<&[u8]>) -> Result<()> {
        if let Some(data) = replay {
            self.inbuf.extend_from_slice(data);
        }
        if let Some(front) = self.exchanges.front_mut() {
            if front.response.is_some() && !front.response_done && front.capacity == 0 {
                grant_capacity(front.handler.as_mut(), &mut front.capacity)?;
            }
        }
        if self.wants_input() {
            let limit = self.inbuf.len() + self.config.buffer_size;
            let fill = fill_buffer(session, &mut self.inbuf, limit)?;
            if fill.eof {
                trace!(session = session.id(), "server closed its side");
                self.eof = true;
            }
        }
        self.drive(session)
    }

    fn output_ready(&mut self, session: &mut dyn IoSession) -> Result<()> {
        self.drive(session)
    }

    fn timeout(&mut self, session: &mut dyn IoSession, timeout: Duration) -> Result<()> {
        if self.exchanges.iter().any(|exchange| exchange.awaiting_continue) {
            debug!(session = session.id(), "no 100 continue; sending request body");
            self.end_continue_wait(session);
            session.set_event(EventMask::WRITE);
            return Ok(());
        }
        if !self.exchanges.is_empty() {
            return Err(Error::Timeout);
        }
        debug!(session = session.id(), ?timeout, "idle connection timed out");
        session.close(CloseMode::Graceful);
        Ok(())
    }

    fn exception(&mut self, _session: &mut dyn IoSession, cause: &Error) {
        self.fail_all(cause);
    }

    fn disconnected(&mut self, _session: &mut dyn IoSession) {
        self.fail_all(&Error::ConnectionClosed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::support::{BasicClientExchange, BasicResponse};
    use crate::http::Method;
    use crate::reactor::mock::MemorySession;
    use crate::reactor::{Completion, Priority};

    fn execute(session: &MemorySession, request: RequestHead, body: Option<Vec<u8>>) -> Completion<BasicResponse> {
        let (exchange, response) = BasicClientExchange::new(request, body);
        assert!(session.handle().enqueue(Command::Execute(Box::new(exchange)), Priority::Normal));
        response
    }

    fn get(path: &str) -> RequestHead {
        RequestHead::new(Method::Get, path).header("Host", "localhost")
    }

    #[test]
    fn test_get_with_keep_alive() {
        let mut client = ClientHttp1Duplexer::new(H1Config::default());
        let mut session = MemorySession::new();
        client.connected(&mut session).unwrap();
        let first = execute(&session, get("/"), None);
        let second = execute(&session, get("/next"), None);

        client.output_ready(&mut session).unwrap();
        let written = String::from_utf8(session.take_output()).unwrap();
        assert_eq!(written, "GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");

        session.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");
        client.input_ready(&mut session, None).unwrap();
        let response = first.try_take().unwrap().unwrap();
        assert_eq!(response.head.status, Status::OK);
        assert_eq!(response.body, b"hello");

        // The second request goes out only once the first exchange is complete
        let written = String::from_utf8(session.take_output()).unwrap();
        assert_eq!(written, "GET /next HTTP/1.1\r\nHost: localhost\r\n\r\n");

        session.feed(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nnext\r\n0\r\n\r\n");
        client.input_ready(&mut session, None).unwrap();
        let response = second.try_take().unwrap().unwrap();
        assert_eq!(response.body, b"next");
        assert!(session.closed.is_none());
    }

    #[test]
    fn test_pipelining_writes_requests_back_to_back() {
        let config = H1Config::builder().pipelining(true).build();
        let mut client = ClientHttp1Duplexer::new(config);
        let mut session = MemorySession::new();
        client.connected(&mut session).unwrap();
        let first = execute(&session, get("/a"), None);
        let second = execute(&session, get("/b"), None);

        client.output_ready(&mut session).unwrap();
        let written = String::from_utf8(session.take_output()).unwrap();
        assert!(written.find("GET /a").unwrap() < written.find("GET /b").unwrap());

        session.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\naHTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nb");
        client.input_ready(&mut session, None).unwrap();
        assert_eq!(first.try_take().unwrap().unwrap().body, b"a");
        assert_eq!(second.try_take().unwrap().unwrap().body, b"b");
    }

    #[test]
    fn test_post_body_and_close_delimited_response() {
        let mut client = ClientHttp1Duplexer::new(H1Config::default());
        let mut session = MemorySession::new();
        client.connected(&mut session).unwrap();
        let response = execute(
            &session,
            RequestHead::new(Method::Post, "/submit"),
            Some(b"payload".to_vec()),
        );

        client.output_ready(&mut session).unwrap();
        let written = String::from_utf8(session.take_output()).unwrap();
        assert!(written.contains("Content-Length: 7\r\n"));
        assert!(written.ends_with("\r\n\r\npayload"));

        session.feed(b"HTTP/1.1 200 OK\r\n\r\nuntil close");
        session.eof = true;
        client.input_ready(&mut session, None).unwrap();
        let response = response.try_take().unwrap().unwrap();
        assert_eq!(response.body, b"until close");
        assert_eq!(session.closed, Some(CloseMode::Graceful));
    }

    #[test]
    fn test_expect_continue_waits_for_interim() {
        let mut client = ClientHttp1Duplexer::new(H1Config::default());
        let mut session = MemorySession::new();
        client.connected(&mut session).unwrap();
        let request = RequestHead::new(Method::Put, "/big").header("Expect", "100-continue");
        let response = execute(&session, request, Some(b"data".to_vec()));

        client.output_ready(&mut session).unwrap();
        let written = String::from_utf8(session.take_output()).unwrap();
        assert!(written.ends_with("\r\n\r\n"));
        assert_eq!(session.socket_timeout(), Some(H1Config::default().wait_for_continue));

        session.feed(b"HTTP/1.1 100 Continue\r\n\r\n");
        client.input_ready(&mut session, None).unwrap();
        assert_eq!(session.take_output(), b"data");
        assert_eq!(session.socket_timeout(), None);

        session.feed(b"HTTP/1.1 204 No Content\r\n\r\n");
        client.input_ready(&mut session, None).unwrap();
        assert_eq!(response.try_take().unwrap().unwrap().head.status, Status::NO_CONTENT);
    }

    #[test]
    fn test_continue_wait_expires() {
        let mut client = ClientHttp1Duplexer::new(H1Config::default());
        let mut session = MemorySession::new();
        client.connected(&mut session).unwrap();
        let request = RequestHead::new(Method::Put, "/big").header("Expect", "100-continue");
        let _response = execute(&session, request, Some(b"data".to_vec()));
        client.output_ready(&mut session).unwrap();
        session.take_output();

        client.timeout(&mut session, Duration::from_secs(3)).unwrap();
        client.output_ready(&mut session).unwrap();
        assert_eq!(session.take_output(), b"data");
    }

    #[test]
    fn test_server_close_fails_exchange() {
        let mut client = ClientHttp1Duplexer::new(H1Config::default());
        let mut session = MemorySession::new();
        client.connected(&mut session).unwrap();
        let response = execute(&session, get("/"), None);
        client.output_ready(&mut session).unwrap();

        session.eof = true;
        let result = client.input_ready(&mut session, None);
        assert!(matches!(result, Err(Error::ConnectionClosed)));
        client.exception(&mut session, &Error::ConnectionClosed);
        assert!(matches!(response.try_take(), Some(Err(Error::ConnectionClosed))));
    }

    #[test]
    fn test_disconnect_fails_in_flight() {
        let mut client = ClientHttp1Duplexer::new(H1Config::default());
        let mut session = MemorySession::new();
        client.connected(&mut session).unwrap();
        let response = execute(&session, get("/"), None);
        client.output_ready(&mut session).unwrap();

        client.disconnected(&mut session);
        assert!(matches!(response.try_take(), Some(Err(Error::ConnectionClosed))));
    }

    #[test]
    fn test_malformed_status_line_is_fatal() {
        let mut client = ClientHttp1Duplexer::new(H1Config::default());
        let mut session = MemorySession::new();
        client.connected(&mut session).unwrap();
        let _response = execute(&session, get("/"), None);
        client.output_ready(&mut session).unwrap();

        session.feed(b"garbage\r\n\r\n");
        assert!(client.input_ready(&mut session, None).is_err());
    }
}
