//! Exchange handler contract
//!
//! Application code talks to the protocol engines only through the traits in
//! this module. Both the HTTP/1.1 duplexer and the HTTP/2 multiplexer invoke
//! them the same way:
//!
//! 1. the head is produced (`produce_request` / `produce_response`) or
//!    delivered (`consume_response` / `handle_request`)
//! 2. outgoing body bytes are pulled with `produce` whenever `available()`
//!    reports data and the connection can take it
//! 3. incoming body bytes are pushed with `consume`, bounded by the capacity
//!    the handler granted through `update_capacity`
//! 4. `stream_end` marks the end of the incoming body, `failed` reports an
//!    error, and `release_resources` is always the last call
//!
//! Every callback runs on the worker thread that owns the connection. A
//! handler that produces data from another thread calls
//! [`SessionHandle::request_output`](crate::reactor::SessionHandle::request_output)
//! once data is ready; one that frees capacity later requests a read event.

use super::{Error, Headers, RequestHead, ResponseHead, Result};
use crate::reactor::SessionHandle;
use bytes::BytesMut;

/// Outgoing body of one message
pub trait DataStreamChannel {
    /// Queue body bytes; returns how many were accepted, possibly zero
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Ask to be polled again even though nothing was written
    fn request_output(&mut self);

    /// Finish the body, optionally with trailers
    fn end_stream(&mut self, trailers: Option<Headers>) -> Result<()>;
}

/// Flow control towards the peer for one incoming body
pub trait CapacityChannel {
    /// Allow `increment` more body bytes to be delivered to `consume`
    fn update(&mut self, increment: usize) -> Result<()>;
}

/// Channel a client exchange sends its request head through
pub trait RequestChannel {
    fn send_request(&mut self, head: RequestHead, has_entity: bool) -> Result<()>;
}

/// Channel a server exchange sends its response heads through
pub trait ResponseChannel {
    /// Send an interim 1xx response
    fn send_information(&mut self, head: ResponseHead) -> Result<()>;

    fn send_response(&mut self, head: ResponseHead, has_entity: bool) -> Result<()>;
}

/// Body production and consumption shared by client and server exchanges
pub trait DataExchangeHandler: Send {
    /// Body bytes ready to be produced without blocking
    fn available(&self) -> usize {
        0
    }

    fn produce(&mut self, channel: &mut dyn DataStreamChannel) -> Result<()>;

    fn update_capacity(&mut self, channel: &mut dyn CapacityChannel) -> Result<()>;

    fn consume(&mut self, data: &[u8]) -> Result<()>;

    fn stream_end(&mut self, trailers: Option<Headers>) -> Result<()>;

    fn failed(&mut self, cause: &Error);

    fn release_resources(&mut self);
}

/// One request/response exchange initiated by the client
pub trait ClientExchangeHandler: DataExchangeHandler {
    fn produce_request(&mut self, channel: &mut dyn RequestChannel) -> Result<()>;

    fn consume_response(&mut self, head: ResponseHead, has_entity: bool) -> Result<()>;

    fn consume_information(&mut self, _head: ResponseHead) -> Result<()> {
        Ok(())
    }
}

/// One request/response exchange handled by the server
pub trait ServerExchangeHandler: DataExchangeHandler {
    fn handle_request(&mut self, head: RequestHead, has_entity: bool) -> Result<()>;

    /// Called until a final response head was sent
    fn produce_response(&mut self, channel: &mut dyn ResponseChannel) -> Result<()>;
}

/// Builds the handler for each incoming request
pub trait ServerExchangeHandlerFactory: Send + Sync + 'static {
    fn create(&self, head: &RequestHead, session: &SessionHandle) -> Box<dyn ServerExchangeHandler>;
}

/// Collects the head a handler sent during one callback
#[derive(Debug)]
pub(crate) struct HeadSlot<T> {
    pub(crate) head: Option<(T, bool)>,
    pub(crate) information: Vec<ResponseHead>,
}

impl<T> HeadSlot<T> {
    pub(crate) fn new() -> Self {
        HeadSlot {
            head: None,
            information: Vec::new(),
        }
    }
}

impl RequestChannel for HeadSlot<RequestHead> {
    fn send_request(&mut self, head: RequestHead, has_entity: bool) -> Result<()> {
        if self.head.is_some() {
            return Err(Error::IllegalState("request head already sent".to_string()));
        }
        self.head = Some((head, has_entity));
        Ok(())
    }
}

impl ResponseChannel for HeadSlot<ResponseHead> {
    fn send_information(&mut self, head: ResponseHead) -> Result<()> {
        if !head.status.is_informational() {
            return Err(Error::IllegalState(format!(
                "{} is not an informational status",
                head.status
            )));
        }
        if self.head.is_some() {
            return Err(Error::IllegalState("response head already sent".to_string()));
        }
        self.information.push(head);
        Ok(())
    }

    fn send_response(&mut self, head: ResponseHead, has_entity: bool) -> Result<()> {
        if head.status.is_informational() {
            return Err(Error::IllegalState(format!(
                "{} is not a final status",
                head.status
            )));
        }
        if self.head.is_some() {
            return Err(Error::IllegalState("response head already sent".to_string()));
        }
        self.head = Some((head, has_entity));
        Ok(())
    }
}

/// Collects capacity increments granted during one callback
#[derive(Debug, Default)]
pub(crate) struct CapacityGrant {
    pub(crate) increment: usize,
}

impl CapacityChannel for CapacityGrant {
    fn update(&mut self, increment: usize) -> Result<()> {
        self.increment = self.increment.saturating_add(increment);
        Ok(())
    }
}

/// Ask `handler` for consumer capacity and add the grant to `capacity`
pub(crate) fn grant_capacity<H>(handler: &mut H, capacity: &mut usize) -> Result<()>
where
    H: DataExchangeHandler + ?Sized,
{
    let mut grant = CapacityGrant::default();
    handler.update_capacity(&mut grant)?;
    *capacity = capacity.saturating_add(grant.increment);
    Ok(())
}

/// Collects body bytes up to a limit during one `produce` call
#[derive(Debug)]
pub(crate) struct DataSink {
    pub(crate) data: BytesMut,
    limit: usize,
    pub(crate) end: Option<Option<Headers>>,
    pub(crate) output_requested: bool,
}

impl DataSink {
    pub(crate) fn new(limit: usize) -> Self {
        DataSink {
            data: BytesMut::new(),
            limit,
            end: None,
            output_requested: false,
        }
    }
}

impl DataStreamChannel for DataSink {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.end.is_some() {
            return Err(Error::IllegalState("stream already ended".to_string()));
        }
        let n = data.len().min(self.limit - self.data.len());
        self.data.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn request_output(&mut self) {
        self.output_requested = true;
    }

    fn end_stream(&mut self, trailers: Option<Headers>) -> Result<()> {
        if self.end.is_some() {
            return Err(Error::IllegalState("stream already ended".to_string()));
        }
        self.end = Some(trailers);
        Ok(())
    }
}
