//! HTTP/2 stream management
//!
//! This module implements the stream state machine of RFC 7540 Section 5.1
//! and the per-connection stream table. A stream owns its flow control
//! windows and the exchange handler serving it.

use super::error::{Error, Result};
use super::flow_control::FlowControl;
use crate::http::exchange::grant_capacity;
use crate::http::{ClientExchangeHandler, DataStreamChannel, Headers, ServerExchangeHandler};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};

/// Stream ID type
pub type StreamId = u32;

/// Stream state as defined in RFC 7540 Section 5.1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No frames have been sent or received
    Idle,
    /// PUSH_PROMISE sent
    ReservedLocal,
    /// PUSH_PROMISE received
    ReservedRemote,
    /// Both sides can send frames
    Open,
    /// We can't send, they can
    HalfClosedLocal,
    /// They can't send, we can
    HalfClosedRemote,
    Closed,
}

impl StreamState {
    pub fn can_send(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }

    pub fn can_receive(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed)
    }
}

/// Exchange handler attached to a stream
pub enum StreamHandler {
    Client(Box<dyn ClientExchangeHandler>),
    Server(Box<dyn ServerExchangeHandler>),
}

impl StreamHandler {
    pub fn available(&self) -> usize {
        match self {
            StreamHandler::Client(h) => h.available(),
            StreamHandler::Server(h) => h.available(),
        }
    }

    pub fn produce(&mut self, channel: &mut dyn DataStreamChannel) -> crate::http::Result<()> {
        match self {
            StreamHandler::Client(h) => h.produce(channel),
            StreamHandler::Server(h) => h.produce(channel),
        }
    }

    pub fn grant_capacity(&mut self, capacity: &mut usize) -> crate::http::Result<()> {
        match self {
            StreamHandler::Client(h) => grant_capacity(h.as_mut(), capacity),
            StreamHandler::Server(h) => grant_capacity(h.as_mut(), capacity),
        }
    }

    pub fn consume(&mut self, data: &[u8]) -> crate::http::Result<()> {
        match self {
            StreamHandler::Client(h) => h.consume(data),
            StreamHandler::Server(h) => h.consume(data),
        }
    }

    pub fn stream_end(&mut self, trailers: Option<Headers>) -> crate::http::Result<()> {
        match self {
            StreamHandler::Client(h) => h.stream_end(trailers),
            StreamHandler::Server(h) => h.stream_end(trailers),
        }
    }

    pub fn fail(&mut self, cause: &crate::http::Error) {
        match self {
            StreamHandler::Client(h) => {
                h.failed(cause);
                h.release_resources();
            }
            StreamHandler::Server(h) => {
                h.failed(cause);
                h.release_resources();
            }
        }
    }

    pub fn release(&mut self) {
        match self {
            StreamHandler::Client(h) => h.release_resources(),
            StreamHandler::Server(h) => h.release_resources(),
        }
    }
}

/// HTTP/2 stream
pub struct H2Stream {
    id: StreamId,
    state: StreamState,
    flow: FlowControl,
    /// `None` for a server stream until its request head arrives
    pub handler: Option<StreamHandler>,
    /// Local head (request or final response) sent
    pub head_sent: bool,
    /// Remote final head received
    pub head_received: bool,
    /// Consumer wants output even though it reports nothing available
    pub output_requested: bool,
    /// Received body data not yet taken by the consumer
    pub inbound: VecDeque<Bytes>,
    /// End of the remote stream, with trailers, waiting behind `inbound`
    pub inbound_end: Option<Option<Headers>>,
    /// The consumer has seen the end of the remote stream
    pub end_delivered: bool,
    /// Body bytes the consumer is willing to take
    pub capacity: usize,
    /// Bytes taken by the consumer and not yet returned to the peer's window
    pub unacked: usize,
}

impl H2Stream {
    pub fn new(id: StreamId, send_window: u32, recv_window: u32) -> Self {
        H2Stream {
            id,
            state: StreamState::Idle,
            flow: FlowControl::new(send_window, recv_window),
            handler: None,
            head_sent: false,
            head_received: false,
            output_requested: false,
            inbound: VecDeque::new(),
            inbound_end: None,
            end_delivered: false,
            capacity: 0,
            unacked: 0,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn flow(&self) -> &FlowControl {
        &self.flow
    }

    pub fn flow_mut(&mut self) -> &mut FlowControl {
        &mut self.flow
    }

    pub fn buffered(&self) -> usize {
        self.inbound.iter().map(Bytes::len).sum()
    }

    /// HEADERS received; a second HEADERS block carries trailers
    pub fn receive_headers(&mut self, end_stream: bool) -> Result<()> {
        match self.state {
            StreamState::Idle => {
                self.state = if end_stream {
                    StreamState::HalfClosedRemote
                } else {
                    StreamState::Open
                };
            }
            StreamState::ReservedRemote => {
                self.state = StreamState::HalfClosedLocal;
            }
            StreamState::Open | StreamState::HalfClosedLocal => {
                if end_stream {
                    self.close_remote();
                }
            }
            _ => return Err(Error::StreamClosed(self.id)),
        }
        Ok(())
    }

    /// DATA received
    pub fn receive_data(&mut self, end_stream: bool) -> Result<()> {
        if !self.state.can_receive() {
            return Err(Error::StreamClosed(self.id));
        }
        if end_stream {
            self.close_remote();
        }
        Ok(())
    }

    /// HEADERS about to be sent
    pub fn send_headers(&mut self, end_stream: bool) -> Result<()> {
        match self.state {
            StreamState::Idle => {
                self.state = if end_stream {
                    StreamState::HalfClosedLocal
                } else {
                    StreamState::Open
                };
            }
            StreamState::ReservedLocal => {
                self.state = StreamState::HalfClosedRemote;
            }
            StreamState::Open | StreamState::HalfClosedRemote => {
                if end_stream {
                    self.close_local();
                }
            }
            _ => return Err(Error::StreamClosed(self.id)),
        }
        Ok(())
    }

    /// DATA about to be sent
    pub fn send_data(&mut self, end_stream: bool) -> Result<()> {
        if !self.state.can_send() {
            return Err(Error::StreamClosed(self.id));
        }
        if end_stream {
            self.close_local();
        }
        Ok(())
    }

    fn close_local(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            _ => StreamState::Closed,
        };
    }

    fn close_remote(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            _ => StreamState::Closed,
        };
    }

    /// Reset the stream
    pub fn reset(&mut self) {
        self.state = StreamState::Closed;
        self.inbound.clear();
        self.inbound_end = None;
    }
}

/// Stream table of one connection
pub struct StreamTable {
    streams: HashMap<StreamId, H2Stream>,
    /// Next locally initiated stream ID (client: odd, server: even)
    next_stream_id: StreamId,
    /// Highest stream ID the peer has opened
    last_remote_id: StreamId,
    /// Peer's SETTINGS_MAX_CONCURRENT_STREAMS, bounding local streams
    max_local_streams: Option<u32>,
    /// Our SETTINGS_MAX_CONCURRENT_STREAMS, bounding remote streams
    max_remote_streams: Option<u32>,
}

impl StreamTable {
    /// Empty table; `is_client` picks the parity of local stream IDs
    pub fn new(is_client: bool, max_remote_streams: Option<u32>) -> Self {
        StreamTable {
            streams: HashMap::new(),
            next_stream_id: if is_client { 1 } else { 2 },
            last_remote_id: 0,
            max_local_streams: None,
            max_remote_streams,
        }
    }

    pub fn set_max_local_streams(&mut self, max: Option<u32>) {
        self.max_local_streams = max;
    }

    pub fn peek_next_stream_id(&self) -> StreamId {
        self.next_stream_id
    }

    pub fn last_remote_id(&self) -> StreamId {
        self.last_remote_id
    }

    pub fn is_local(&self, stream_id: StreamId) -> bool {
        stream_id % 2 == self.next_stream_id % 2
    }

    fn count(&self, local: bool) -> usize {
        self.streams
            .values()
            .filter(|s| !s.state().is_closed() && self.is_local(s.id()) == local)
            .count()
    }

    pub fn local_count(&self) -> usize {
        self.count(true)
    }

    pub fn remote_count(&self) -> usize {
        self.count(false)
    }

    /// Whether the peer's concurrency limit allows another local stream
    pub fn can_open_local(&self) -> bool {
        self.max_local_streams.map_or(true, |max| self.local_count() < max as usize)
    }

    /// Allocate the next local stream
    ///
    /// Fails with `RefusedStream` when the peer's concurrency limit is
    /// reached or the ID space is exhausted.
    pub fn create_local(&mut self, send_window: u32, recv_window: u32) -> Result<&mut H2Stream> {
        if !self.can_open_local() || self.next_stream_id > super::MAX_STREAM_ID {
            return Err(Error::RefusedStream(self.next_stream_id));
        }
        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;
        Ok(self
            .streams
            .entry(stream_id)
            .or_insert_with(|| H2Stream::new(stream_id, send_window, recv_window)))
    }

    /// Register a stream opened by the peer
    ///
    /// Stream IDs must increase; reusing or going back is a connection
    /// PROTOCOL_ERROR. Past our concurrency limit the stream is refused,
    /// which is a stream-level error.
    pub fn accept_remote(&mut self, stream_id: StreamId, send_window: u32, recv_window: u32) -> Result<&mut H2Stream> {
        if self.is_local(stream_id) || stream_id <= self.last_remote_id {
            return Err(Error::Protocol(format!("unexpected new stream {}", stream_id)));
        }
        self.last_remote_id = stream_id;
        if let Some(max) = self.max_remote_streams {
            if self.remote_count() >= max as usize {
                return Err(Error::RefusedStream(stream_id));
            }
        }
        Ok(self
            .streams
            .entry(stream_id)
            .or_insert_with(|| H2Stream::new(stream_id, send_window, recv_window)))
    }

    /// Whether `stream_id` was never opened by either side
    pub fn is_idle(&self, stream_id: StreamId) -> bool {
        if self.is_local(stream_id) {
            stream_id >= self.next_stream_id
        } else {
            stream_id > self.last_remote_id
        }
    }

    pub fn get(&self, stream_id: StreamId) -> Option<&H2Stream> {
        self.streams.get(&stream_id)
    }

    pub fn get_mut(&mut self, stream_id: StreamId) -> Option<&mut H2Stream> {
        self.streams.get_mut(&stream_id)
    }

    pub fn remove(&mut self, stream_id: StreamId) -> Option<H2Stream> {
        self.streams.remove(&stream_id)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// All stream IDs in ascending order
    pub fn stream_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self.streams.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut H2Stream> {
        self.streams.values_mut()
    }

    /// Remove and return every stream
    pub fn drain(&mut self) -> Vec<H2Stream> {
        self.streams.drain().map(|(_, stream)| stream).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_state_transitions() {
        let mut stream = H2Stream::new(1, 65535, 65535);
        assert_eq!(stream.state(), StreamState::Idle);

        stream.send_headers(false).unwrap();
        assert_eq!(stream.state(), StreamState::Open);

        stream.send_data(true).unwrap();
        assert_eq!(stream.state(), StreamState::HalfClosedLocal);
        assert!(stream.send_data(false).is_err());

        stream.receive_headers(false).unwrap();
        stream.receive_data(true).unwrap();
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(stream.receive_data(false).is_err());
    }

    #[test]
    fn test_request_without_body() {
        let mut stream = H2Stream::new(1, 65535, 65535);
        stream.receive_headers(true).unwrap();
        assert_eq!(stream.state(), StreamState::HalfClosedRemote);
        stream.send_headers(false).unwrap();
        assert_eq!(stream.state(), StreamState::HalfClosedRemote);
        stream.send_headers(true).unwrap();
        assert!(stream.state().is_closed());
    }

    #[test]
    fn test_stream_table_client_ids() {
        let mut table = StreamTable::new(true, None);
        assert_eq!(table.peek_next_stream_id(), 1);
        assert_eq!(table.create_local(65535, 65535).unwrap().id(), 1);
        assert_eq!(table.create_local(65535, 65535).unwrap().id(), 3);
        assert_eq!(table.create_local(65535, 65535).unwrap().id(), 5);
        assert_eq!(table.local_count(), 3);
        assert!(table.is_idle(7));
        assert!(!table.is_idle(3));
    }

    #[test]
    fn test_stream_table_server_ids() {
        let mut table = StreamTable::new(false, None);
        assert_eq!(table.create_local(65535, 65535).unwrap().id(), 2);
        assert_eq!(table.create_local(65535, 65535).unwrap().id(), 4);
        assert!(table.is_local(4));
        assert!(!table.is_local(3));
    }

    #[test]
    fn test_local_streams_bounded_by_peer() {
        let mut table = StreamTable::new(true, None);
        table.set_max_local_streams(Some(2));
        table.create_local(65535, 65535).unwrap();
        table.create_local(65535, 65535).unwrap();
        assert!(matches!(table.create_local(65535, 65535), Err(Error::RefusedStream(5))));

        table.get_mut(1).unwrap().reset();
        assert!(table.can_open_local());
        assert_eq!(table.create_local(65535, 65535).unwrap().id(), 5);
    }

    #[test]
    fn test_remote_streams_refused_past_limit() {
        let mut table = StreamTable::new(false, Some(1));
        table.accept_remote(1, 65535, 65535).unwrap();
        assert!(matches!(table.accept_remote(3, 65535, 65535), Err(Error::RefusedStream(3))));
        // The refused ID still counts as used
        assert_eq!(table.last_remote_id(), 3);
        assert!(matches!(table.accept_remote(3, 65535, 65535), Err(Error::Protocol(_))));
        assert!(matches!(table.accept_remote(2, 65535, 65535), Err(Error::Protocol(_))));
        assert_eq!(table.remote_count(), 1);
    }

    #[test]
    fn test_stream_table_remove() {
        let mut table = StreamTable::new(true, None);
        table.create_local(65535, 65535).unwrap();
        table.create_local(65535, 65535).unwrap();
        assert_eq!(table.stream_ids(), vec![1, 3]);
        assert!(table.remove(1).is_some());
        assert_eq!(table.len(), 1);
        assert_eq!(table.drain().len(), 1);
        assert!(table.is_empty());
    }
}
