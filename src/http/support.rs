//! Basic exchange handlers with fully buffered bodies
//!
//! [`BasicClientExchange`] sends a request with an in-memory body and hands
//! the complete response back through a [`Completion`]. [`RequestHandlerFactory`]
//! turns a plain closure into a server handler.

use super::exchange::{
    CapacityChannel, ClientExchangeHandler, DataExchangeHandler, DataStreamChannel, RequestChannel,
    ResponseChannel, ServerExchangeHandler, ServerExchangeHandlerFactory,
};
use super::{Error, Headers, Method, RequestHead, ResponseHead, Result};
use crate::reactor::{completion, Completer, Completion, SessionHandle};
use std::sync::Arc;

/// Capacity granted before the first body byte arrives
pub const INITIAL_CAPACITY: usize = 64 * 1024;

/// Complete response collected by [`BasicClientExchange`]
#[derive(Debug, Clone)]
pub struct BasicResponse {
    pub head: ResponseHead,
    pub body: Vec<u8>,
    pub trailers: Option<Headers>,
}

/// Body producer over an in-memory buffer
#[derive(Debug, Default)]
struct BufferedProducer {
    body: Vec<u8>,
    sent: usize,
    ended: bool,
}

impl BufferedProducer {
    fn new(body: Vec<u8>) -> Self {
        BufferedProducer {
            body,
            sent: 0,
            ended: false,
        }
    }

    fn available(&self) -> usize {
        if self.ended {
            0
        } else {
            // An empty remainder still needs one call to end the stream
            (self.body.len() - self.sent).max(1)
        }
    }

    fn produce(&mut self, channel: &mut dyn DataStreamChannel) -> Result<()> {
        while self.sent < self.body.len() {
            let n = channel.write(&self.body[self.sent..])?;
            if n == 0 {
                return Ok(());
            }
            self.sent += n;
        }
        if !self.ended {
            self.ended = true;
            channel.end_stream(None)?;
        }
        Ok(())
    }
}

/// Consumer side flow control: keep a constant window of free capacity
#[derive(Debug, Default)]
struct BufferedConsumer {
    body: Vec<u8>,
    started: bool,
    unacknowledged: usize,
}

impl BufferedConsumer {
    fn update_capacity(&mut self, channel: &mut dyn CapacityChannel) -> Result<()> {
        if !self.started {
            self.started = true;
            channel.update(INITIAL_CAPACITY)
        } else if self.unacknowledged > 0 {
            let increment = std::mem::take(&mut self.unacknowledged);
            channel.update(increment)
        } else {
            Ok(())
        }
    }

    fn consume(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
        self.unacknowledged += data.len();
    }
}

/// Client exchange sending a buffered request and collecting the response
pub struct BasicClientExchange {
    request: Option<RequestHead>,
    producer: Option<BufferedProducer>,
    response: Option<ResponseHead>,
    consumer: BufferedConsumer,
    completer: Option<Completer<BasicResponse>>,
}

impl BasicClientExchange {
    /// Exchange for `request` with an optional body
    pub fn new(mut request: RequestHead, body: Option<Vec<u8>>) -> (Self, Completion<BasicResponse>) {
        if let Some(body) = &body {
            if !request.headers.contains("Transfer-Encoding") && !request.headers.contains("Content-Length") {
                request.headers.set("Content-Length", body.len().to_string());
            }
        }
        let (completer, response) = completion();
        let exchange = BasicClientExchange {
            request: Some(request),
            producer: body.map(BufferedProducer::new),
            response: None,
            consumer: BufferedConsumer::default(),
            completer: Some(completer),
        };
        (exchange, response)
    }

    fn complete(&mut self, trailers: Option<Headers>) -> Result<()> {
        let head = self
            .response
            .take()
            .ok_or_else(|| Error::IllegalState("stream ended before the response head".to_string()))?;
        if let Some(completer) = self.completer.take() {
            completer.complete(Ok(BasicResponse {
                head,
                body: std::mem::take(&mut self.consumer.body),
                trailers,
            }));
        }
        Ok(())
    }
}

impl DataExchangeHandler for BasicClientExchange {
    fn available(&self) -> usize {
        self.producer.as_ref().map_or(0, BufferedProducer::available)
    }

    fn produce(&mut self, channel: &mut dyn DataStreamChannel) -> Result<()> {
        match self.producer.as_mut() {
            Some(producer) => producer.produce(channel),
            None => Ok(()),
        }
    }

    fn update_capacity(&mut self, channel: &mut dyn CapacityChannel) -> Result<()> {
        self.consumer.update_capacity(channel)
    }

    fn consume(&mut self, data: &[u8]) -> Result<()> {
        self.consumer.consume(data);
        Ok(())
    }

    fn stream_end(&mut self, trailers: Option<Headers>) -> Result<()> {
        self.complete(trailers)
    }

    fn failed(&mut self, cause: &Error) {
        if let Some(completer) = self.completer.take() {
            completer.fail(cause.clone());
        }
    }

    fn release_resources(&mut self) {
        self.completer = None;
    }
}

impl ClientExchangeHandler for BasicClientExchange {
    fn produce_request(&mut self, channel: &mut dyn RequestChannel) -> Result<()> {
        if let Some(request) = self.request.take() {
            channel.send_request(request, self.producer.is_some())?;
        }
        Ok(())
    }

    fn consume_response(&mut self, head: ResponseHead, has_entity: bool) -> Result<()> {
        self.response = Some(head);
        if !has_entity {
            self.complete(None)?;
        }
        Ok(())
    }
}

/// Closure mapping a request and its body to a response and its body
pub type RequestHandlerFn = dyn Fn(RequestHead, Vec<u8>) -> (ResponseHead, Vec<u8>) + Send + Sync;

/// Server handler factory running a closure once the request body is complete
pub struct RequestHandlerFactory {
    handler: Arc<RequestHandlerFn>,
}

impl RequestHandlerFactory {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(RequestHead, Vec<u8>) -> (ResponseHead, Vec<u8>) + Send + Sync + 'static,
    {
        RequestHandlerFactory {
            handler: Arc::new(handler),
        }
    }
}

impl ServerExchangeHandlerFactory for RequestHandlerFactory {
    fn create(&self, _head: &RequestHead, _session: &SessionHandle) -> Box<dyn ServerExchangeHandler> {
        Box::new(BasicServerExchange {
            handler: self.handler.clone(),
            request: None,
            consumer: BufferedConsumer::default(),
            response: None,
            producer: None,
        })
    }
}

struct BasicServerExchange {
    handler: Arc<RequestHandlerFn>,
    request: Option<RequestHead>,
    consumer: BufferedConsumer,
    response: Option<(ResponseHead, Vec<u8>)>,
    producer: Option<BufferedProducer>,
}

impl BasicServerExchange {
    fn respond(&mut self) {
        if let Some(request) = self.request.take() {
            let method = request.method;
            let (mut head, body) = (self.handler)(request, std::mem::take(&mut self.consumer.body));
            let framed = head.headers.contains("Content-Length") || head.headers.contains("Transfer-Encoding");
            if method == Method::Head {
                head.headers.set("Content-Length", body.len().to_string());
                self.response = Some((head, Vec::new()));
            } else {
                if !framed && !body.is_empty() {
                    head.headers.set("Content-Length", body.len().to_string());
                }
                self.response = Some((head, body));
            }
        }
    }
}

impl DataExchangeHandler for BasicServerExchange {
    fn available(&self) -> usize {
        self.producer.as_ref().map_or(0, BufferedProducer::available)
    }

    fn produce(&mut self, channel: &mut dyn DataStreamChannel) -> Result<()> {
        match self.producer.as_mut() {
            Some(producer) => producer.produce(channel),
            None => Ok(()),
        }
    }

    fn update_capacity(&mut self, channel: &mut dyn CapacityChannel) -> Result<()> {
        self.consumer.update_capacity(channel)
    }

    fn consume(&mut self, data: &[u8]) -> Result<()> {
        self.consumer.consume(data);
        Ok(())
    }

    fn stream_end(&mut self, _trailers: Option<Headers>) -> Result<()> {
        self.respond();
        Ok(())
    }

    fn failed(&mut self, _cause: &Error) {
        self.request = None;
        self.response = None;
    }

    fn release_resources(&mut self) {
        self.producer = None;
    }
}

impl ServerExchangeHandler for BasicServerExchange {
    fn handle_request(&mut self, head: RequestHead, has_entity: bool) -> Result<()> {
        self.request = Some(head);
        if !has_entity {
            self.respond();
        }
        Ok(())
    }

    fn produce_response(&mut self, channel: &mut dyn ResponseChannel) -> Result<()> {
        if let Some((head, body)) = self.response.take() {
            let has_entity = !body.is_empty();
            channel.send_response(head, has_entity)?;
            if has_entity {
                self.producer = Some(BufferedProducer::new(body));
            }
        }
        Ok(())
    }
}
