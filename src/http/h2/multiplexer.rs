//! HTTP/2 connection multiplexer
//!
//! [`H2Multiplexer`] is the terminal [`IoEventHandler`] for an HTTP/2
//! connection. In the client role it opens one stream per
//! [`Command::Execute`]; in the server role it builds one exchange handler
//! per incoming request through a [`ServerExchangeHandlerFactory`].
//!
//! Outgoing DATA is produced round-robin: every stream with a body to send
//! gets one frame per turn, bounded by the smaller of its own send window,
//! the connection send window and the peer's maximum frame size.
//!
//! Errors come in two sizes (RFC 7540 Section 5.4). A stream error resets the
//! one stream with RST_STREAM and fails its handler. A connection error sends
//! GOAWAY with the matching code, fails every handler and closes the session
//! once the GOAWAY is flushed.

use super::codec::FrameCodec;
use super::error::{Error as H2Error, ErrorCode};
use super::flow_control::FlowControl;
use super::frames::{
    ContinuationFrame, DataFrame, Frame, GoawayFrame, HeadersFrame, PingFrame, RstStreamFrame, SettingsFrame,
    WindowUpdateFrame,
};
use super::header_encoder::HeaderEncoder;
use super::settings::Settings;
use super::stream::{StreamHandler, StreamId, StreamState, StreamTable};
use super::{H2Config, CONNECTION_PREFACE, CONNECTION_STREAM_ID, DEFAULT_INITIAL_WINDOW_SIZE};
use crate::http::exchange::{DataSink, HeadSlot};
use crate::http::{
    ClientExchangeHandler, Error, Headers, Method, RequestHead, ResponseHead, Result, ServerExchangeHandlerFactory,
    Status, Version,
};
use crate::reactor::{fill_buffer, flush_buffer, CloseMode, Command, EventMask, IoEventHandler, IoSession};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Header fields that have no meaning in HTTP/2 (RFC 7540 Section 8.1.2.2)
const CONNECTION_SPECIFIC: &[&str] = &["connection", "keep-alive", "proxy-connection", "transfer-encoding", "upgrade"];

/// Largest header block reassembled from HEADERS and CONTINUATION frames
const MAX_HEADER_BLOCK: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

/// Header block spread over HEADERS and CONTINUATION frames
struct PendingHeaders {
    stream_id: StreamId,
    block: BytesMut,
    end_stream: bool,
}

/// Outcome of one DATA production turn
enum Produced {
    /// A frame was written; the stream stays in the rotation
    Frame,
    /// Nothing to send right now
    Blocked,
    /// The stream finished sending or is gone
    Done,
}

/// HTTP/2 protocol handler for both connection roles
pub struct H2Multiplexer {
    role: Role,
    config: H2Config,
    factory: Option<Arc<dyn ServerExchangeHandlerFactory>>,
    /// `:scheme` of outgoing requests that do not carry their own
    scheme: &'static str,
    codec: FrameCodec,
    encoder: HeaderEncoder,
    decoder: hpack::Decoder<'static>,
    inbuf: BytesMut,
    outbuf: BytesMut,
    streams: StreamTable,
    /// Connection level windows
    conn_flow: FlowControl,
    /// Settings announced by the peer
    remote: Settings,
    preface_received: bool,
    settings_received: bool,
    continuation: Option<PendingHeaders>,
    /// Streams sending a body, served round-robin
    output_queue: VecDeque<StreamId>,
    goaway_sent: bool,
    goaway_received: bool,
    /// Graceful shutdown requested; no new streams are accepted
    shutdown: bool,
    /// Close once the output buffer is flushed
    closing: bool,
    eof: bool,
}

impl H2Multiplexer {
    /// Multiplexer executing requests taken from the session's command queue
    pub fn client(config: H2Config) -> Self {
        Self::new(Role::Client, config, None)
    }

    /// Multiplexer serving requests with handlers built by `factory`
    pub fn server(config: H2Config, factory: Arc<dyn ServerExchangeHandlerFactory>) -> Self {
        Self::new(Role::Server, config, Some(factory))
    }

    fn new(role: Role, config: H2Config, factory: Option<Arc<dyn ServerExchangeHandlerFactory>>) -> Self {
        H2Multiplexer {
            role,
            codec: FrameCodec::with_max_frame_size(config.max_frame_size()),
            encoder: HeaderEncoder::new(),
            decoder: hpack::Decoder::new(),
            inbuf: BytesMut::with_capacity(config.buffer_size),
            outbuf: BytesMut::with_capacity(config.buffer_size),
            streams: StreamTable::new(role == Role::Client, config.max_concurrent_streams()),
            conn_flow: FlowControl::new(DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_INITIAL_WINDOW_SIZE),
            remote: Settings::default(),
            config,
            factory,
            scheme: "http",
            preface_received: role == Role::Client,
            settings_received: false,
            continuation: None,
            output_queue: VecDeque::new(),
            goaway_sent: false,
            goaway_received: false,
            shutdown: false,
            closing: false,
            eof: false,
        }
    }

    /// Scheme sent as `:scheme` ("http" unless changed)
    pub fn scheme(mut self, scheme: &'static str) -> Self {
        self.scheme = scheme;
        self
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

    /// Run the connection until it cannot make progress
    fn drive(&mut self, session: &mut dyn IoSession) -> Result<()> {
        let progress = match self.process_input(session) {
            Ok(()) => self.produce_output(session),
            Err(cause) => Err(cause),
        };
        if let Err(cause) = progress {
            match cause {
                Error::H2(err) => self.connection_error(session, err),
                other => return Err(other),
            }
        }
        self.reap(session);

        if self.eof && !self.closing {
            if !self.streams.is_empty() || !self.inbuf.is_empty() {
                debug!(session = session.id(), streams = self.streams.len(), "connection closed by peer");
            }
            self.fail_all(&Error::ConnectionClosed);
            self.closing = true;
        }
        if !self.closing && (self.shutdown || self.goaway_received) && self.streams.is_empty() {
            self.closing = true;
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
        if !self.preface_received {
            let n = self.inbuf.len().min(CONNECTION_PREFACE.len());
            if self.inbuf[..n] != CONNECTION_PREFACE[..n] {
                return Err(H2Error::MissingPreface.into());
            }
            if n < CONNECTION_PREFACE.len() {
                return Ok(());
            }
            self.inbuf.advance(CONNECTION_PREFACE.len());
            self.preface_received = true;
        }
        while !self.closing {
            let Some(frame) = self.codec.decode(&mut self.inbuf)? else {
                break;
            };
            self.handle_frame(session, frame)?;
        }
        Ok(())
    }

    fn handle_frame(&mut self, session: &mut dyn IoSession, frame: Frame) -> Result<()> {
        trace!(session = session.id(), stream = frame.stream_id(), frame = frame.name(), "frame received");
        if let Some(pending) = &self.continuation {
            let continues = matches!(&frame, Frame::Continuation(f) if f.stream_id == pending.stream_id);
            if !continues {
                return Err(protocol_error(format!("{} frame inside a header block", frame.name())));
            }
        }
        if !self.settings_received {
            if !matches!(&frame, Frame::Settings(f) if !f.ack) {
                return Err(protocol_error(format!("{} frame before SETTINGS", frame.name())));
            }
            self.settings_received = true;
        }

        match frame {
            Frame::Data(frame) => self.on_data(session, frame),
            Frame::Headers(frame) => self.on_headers(session, frame),
            Frame::Continuation(frame) => self.on_continuation(session, frame),
            Frame::RstStream(frame) => self.on_rst_stream(session, frame),
            Frame::Settings(frame) => self.on_settings(session, frame),
            Frame::Ping(frame) => {
                if !frame.ack {
                    FrameCodec::encode_ping_frame(&PingFrame::ack(frame.data), &mut self.outbuf);
                }
                Ok(())
            }
            Frame::Goaway(frame) => {
                self.on_goaway(session, frame);
                Ok(())
            }
            Frame::WindowUpdate(frame) => self.on_window_update(session, frame),
            Frame::PushPromise(_) => Err(protocol_error("PUSH_PROMISE with push disabled".to_string())),
            Frame::Priority(_) | Frame::Unknown { .. } => Ok(()),
        }
    }

    fn on_data(&mut self, session: &mut dyn IoSession, frame: DataFrame) -> Result<()> {
        let stream_id = frame.stream_id;
        // The connection window is charged even for streams we no longer track
        self.conn_flow.consume_recv_window(frame.flow_len)?;
        if let Some(increment) = self.conn_flow.should_send_window_update() {
            self.conn_flow.send_window_update(increment)?;
            FrameCodec::encode_window_update_frame(
                &WindowUpdateFrame::new(CONNECTION_STREAM_ID, increment),
                &mut self.outbuf,
            );
        }

        let Some(stream) = self.streams.get_mut(stream_id) else {
            if self.streams.is_idle(stream_id) {
                return Err(protocol_error(format!("DATA on idle stream {}", stream_id)));
            }
            return Ok(());
        };
        let accepted = if !stream.head_received {
            Err(H2Error::Protocol(format!("DATA before headers on stream {}", stream_id)))
        } else {
            stream
                .flow_mut()
                .consume_recv_window(frame.flow_len)
                .and_then(|_| stream.receive_data(frame.end_stream))
        };
        if let Err(err) = accepted {
            self.reset_stream(session, stream_id, err.code(), &Error::H2(err));
            return Ok(());
        }
        // Padding goes back to the peer with the next window update
        stream.unacked += frame.flow_len - frame.data.len();
        if !frame.data.is_empty() {
            stream.inbound.push_back(frame.data);
        }
        if frame.end_stream {
            stream.inbound_end = Some(None);
        }
        self.deliver_input(session, stream_id)
    }

    fn on_headers(&mut self, session: &mut dyn IoSession, frame: HeadersFrame) -> Result<()> {
        if frame.end_headers {
            return self.on_header_block(session, frame.stream_id, &frame.header_block, frame.end_stream);
        }
        self.continuation = Some(PendingHeaders {
            stream_id: frame.stream_id,
            block: BytesMut::from(&frame.header_block[..]),
            end_stream: frame.end_stream,
        });
        Ok(())
    }

    fn on_continuation(&mut self, session: &mut dyn IoSession, frame: ContinuationFrame) -> Result<()> {
        let Some(mut pending) = self.continuation.take() else {
            return Err(protocol_error(format!("CONTINUATION without HEADERS on stream {}", frame.stream_id)));
        };
        pending.block.extend_from_slice(&frame.header_block);
        if pending.block.len() > MAX_HEADER_BLOCK {
            return Err(protocol_error(format!("header block exceeds {} bytes", MAX_HEADER_BLOCK)));
        }
        if !frame.end_headers {
            self.continuation = Some(pending);
            return Ok(());
        }
        self.on_header_block(session, pending.stream_id, &pending.block, pending.end_stream)
    }

    fn on_header_block(
        &mut self,
        session: &mut dyn IoSession,
        stream_id: StreamId,
        block: &[u8],
        end_stream: bool,
    ) -> Result<()> {
        // Decoded even for streams that are gone to keep the HPACK state in sync
        let fields = self
            .decoder
            .decode(block)
            .map_err(|e| H2Error::Compression(format!("HPACK decode error: {:?}", e)))?;

        let known = self.streams.get(stream_id).map(|stream| stream.head_received);
        match known {
            Some(true) => self.on_trailers(session, stream_id, fields, end_stream),
            Some(false) => self.on_response_headers(session, stream_id, fields, end_stream),
            None if self.streams.is_idle(stream_id) => match self.role {
                Role::Server => self.on_request_headers(session, stream_id, fields, end_stream),
                Role::Client => Err(protocol_error(format!("HEADERS on idle stream {}", stream_id))),
            },
            None => {
                trace!(session = session.id(), stream = stream_id, "HEADERS for a closed stream");
                Ok(())
            }
        }
    }

    fn on_request_headers(
        &mut self,
        session: &mut dyn IoSession,
        stream_id: StreamId,
        fields: Vec<(Vec<u8>, Vec<u8>)>,
        end_stream: bool,
    ) -> Result<()> {
        let send_window = self.remote.get_initial_window_size();
        let recv_window = self.config.initial_window_size();
        match self.streams.accept_remote(stream_id, send_window, recv_window) {
            Ok(_) => {}
            Err(H2Error::RefusedStream(_)) => {
                debug!(session = session.id(), stream = stream_id, "concurrent stream limit reached; refusing");
                self.write_rst_stream(stream_id, ErrorCode::RefusedStream);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }
        if self.goaway_sent {
            self.streams.remove(stream_id);
            self.write_rst_stream(stream_id, ErrorCode::RefusedStream);
            return Ok(());
        }
        let head = match request_head(fields) {
            Ok(head) => head,
            Err(err) => {
                debug!(session = session.id(), stream = stream_id, error = %err, "malformed request");
                self.reset_stream(session, stream_id, err.code(), &Error::H2(err));
                return Ok(());
            }
        };
        let Some(factory) = self.factory.clone() else {
            return Err(H2Error::Internal("server connection without a handler factory".to_string()).into());
        };
        trace!(session = session.id(), stream = stream_id, method = %head.method, path = %head.path, "request");

        let has_entity = !end_stream;
        let mut handler = factory.create(&head, &session.handle());
        let started = handler.handle_request(head, has_entity);
        let Some(stream) = self.streams.get_mut(stream_id) else {
            return Ok(());
        };
        stream.receive_headers(end_stream)?;
        stream.head_received = true;
        stream.end_delivered = !has_entity;
        stream.handler = Some(StreamHandler::Server(handler));
        match started {
            Ok(()) if has_entity => self.deliver_input(session, stream_id),
            Ok(()) => Ok(()),
            Err(cause) => {
                self.reset_stream(session, stream_id, ErrorCode::InternalError, &cause);
                Ok(())
            }
        }
    }

    fn on_response_headers(
        &mut self,
        session: &mut dyn IoSession,
        stream_id: StreamId,
        fields: Vec<(Vec<u8>, Vec<u8>)>,
        end_stream: bool,
    ) -> Result<()> {
        let head = match response_head(fields) {
            Ok(head) if head.status.is_informational() && (end_stream || head.status == Status::SWITCHING_PROTOCOLS) => {
                Err(H2Error::Protocol(format!("{} response on stream {}", head.status, stream_id)))
            }
            result => result,
        };
        let head = match head {
            Ok(head) => head,
            Err(err) => {
                self.reset_stream(session, stream_id, err.code(), &Error::H2(err));
                return Ok(());
            }
        };
        let Some(stream) = self.streams.get_mut(stream_id) else {
            return Ok(());
        };
        let Some(StreamHandler::Client(handler)) = stream.handler.as_mut() else {
            return Ok(());
        };
        trace!(session = session.id(), stream = stream_id, status = %head.status, "response");

        if head.status.is_informational() {
            if let Err(cause) = handler.consume_information(head) {
                self.reset_stream(session, stream_id, ErrorCode::InternalError, &cause);
            }
            return Ok(());
        }
        let has_entity = !end_stream;
        let delivered = handler.consume_response(head, has_entity);
        if let Err(err) = stream.receive_headers(end_stream) {
            self.reset_stream(session, stream_id, err.code(), &Error::H2(err));
            return Ok(());
        }
        stream.head_received = true;
        stream.end_delivered = !has_entity;
        match delivered {
            Ok(()) if has_entity => self.deliver_input(session, stream_id),
            Ok(()) => Ok(()),
            Err(cause) => {
                self.reset_stream(session, stream_id, ErrorCode::InternalError, &cause);
                Ok(())
            }
        }
    }

    fn on_trailers(
        &mut self,
        session: &mut dyn IoSession,
        stream_id: StreamId,
        fields: Vec<(Vec<u8>, Vec<u8>)>,
        end_stream: bool,
    ) -> Result<()> {
        let trailers = if end_stream {
            trailer_fields(fields)
        } else {
            Err(H2Error::Protocol(format!("trailers without END_STREAM on stream {}", stream_id)))
        };
        let accepted = trailers.and_then(|trailers| {
            let stream = self.streams.get_mut(stream_id).ok_or(H2Error::StreamClosed(stream_id))?;
            stream.receive_headers(true)?;
            stream.inbound_end = Some(Some(trailers));
            Ok(())
        });
        match accepted {
            Ok(()) => self.deliver_input(session, stream_id),
            Err(err) => {
                self.reset_stream(session, stream_id, err.code(), &Error::H2(err));
                Ok(())
            }
        }
    }

    fn on_rst_stream(&mut self, session: &mut dyn IoSession, frame: RstStreamFrame) -> Result<()> {
        let stream_id = frame.stream_id;
        let Some(mut stream) = self.streams.remove(stream_id) else {
            if self.streams.is_idle(stream_id) {
                return Err(protocol_error(format!("RST_STREAM on idle stream {}", stream_id)));
            }
            return Ok(());
        };
        debug!(session = session.id(), stream = stream_id, code = %frame.error_code, "stream reset by peer");
        stream.reset();
        if let Some(mut handler) = stream.handler.take() {
            // NO_ERROR after a complete response only stops the rest of our body
            if stream.end_delivered && frame.error_code == ErrorCode::NoError {
                handler.release();
            } else {
                handler.fail(&Error::H2(H2Error::Reset {
                    stream: stream_id,
                    code: frame.error_code,
                }));
            }
        }
        Ok(())
    }

    fn on_settings(&mut self, session: &mut dyn IoSession, frame: SettingsFrame) -> Result<()> {
        if frame.ack {
            trace!(session = session.id(), "SETTINGS acknowledged");
            return Ok(());
        }
        let old_window = self.remote.get_initial_window_size();
        self.remote.merge(&frame.settings);
        let new_window = self.remote.get_initial_window_size();
        if new_window != old_window {
            for stream in self.streams.iter_mut() {
                stream.flow_mut().send_window_mut().update_initial_size(new_window)?;
            }
        }
        self.streams.set_max_local_streams(self.remote.get_max_concurrent_streams());
        if frame.settings.header_table_size.is_some() {
            self.encoder.set_max_table_size(self.remote.get_header_table_size());
        }
        trace!(session = session.id(), settings = ?self.remote, "peer settings");
        FrameCodec::encode_settings_frame(&SettingsFrame::ack(), &mut self.outbuf);
        Ok(())
    }

    fn on_goaway(&mut self, session: &mut dyn IoSession, frame: GoawayFrame) {
        debug!(
            session = session.id(),
            last_stream = frame.last_stream_id,
            code = %frame.error_code,
            "GOAWAY received"
        );
        self.goaway_received = true;
        let cause = Error::H2(H2Error::GoAway {
            last_stream_id: frame.last_stream_id,
            code: frame.error_code,
        });
        for stream_id in self.streams.stream_ids() {
            if self.streams.is_local(stream_id) && stream_id > frame.last_stream_id {
                if let Some(mut stream) = self.streams.remove(stream_id) {
                    if let Some(mut handler) = stream.handler.take() {
                        handler.fail(&cause);
                    }
                }
            }
        }
    }

    fn on_window_update(&mut self, session: &mut dyn IoSession, frame: WindowUpdateFrame) -> Result<()> {
        let stream_id = frame.stream_id;
        if stream_id == CONNECTION_STREAM_ID {
            if frame.size_increment == 0 {
                return Err(protocol_error("connection WINDOW_UPDATE of 0".to_string()));
            }
            self.conn_flow.increase_send_window(frame.size_increment)?;
            return Ok(());
        }
        let Some(stream) = self.streams.get_mut(stream_id) else {
            if self.streams.is_idle(stream_id) {
                return Err(protocol_error(format!("WINDOW_UPDATE on idle stream {}", stream_id)));
            }
            return Ok(());
        };
        let increased = if frame.size_increment == 0 {
            Err(H2Error::Protocol(format!("WINDOW_UPDATE of 0 on stream {}", stream_id)))
        } else {
            stream.flow_mut().increase_send_window(frame.size_increment).map(|_| ())
        };
        if let Err(err) = increased {
            self.reset_stream(session, stream_id, err.code(), &Error::H2(err));
        }
        Ok(())
    }

    /// Feed buffered body data to the consumer and reopen the stream window
    fn deliver_input(&mut self, session: &mut dyn IoSession, stream_id: StreamId) -> Result<()> {
        let Some(stream) = self.streams.get_mut(stream_id) else {
            return Ok(());
        };
        if !stream.head_received || stream.end_delivered {
            return Ok(());
        }
        let Some(handler) = stream.handler.as_mut() else {
            return Ok(());
        };

        let mut fed = Ok(());
        if stream.capacity == 0 {
            fed = handler.grant_capacity(&mut stream.capacity);
        }
        while fed.is_ok() && stream.capacity > 0 {
            let Some(mut chunk) = stream.inbound.pop_front() else {
                break;
            };
            if chunk.len() > stream.capacity {
                stream.inbound.push_front(chunk.split_off(stream.capacity));
            }
            stream.capacity -= chunk.len();
            stream.unacked += chunk.len();
            fed = handler
                .consume(&chunk)
                .and_then(|_| handler.grant_capacity(&mut stream.capacity));
        }
        if fed.is_ok() && stream.inbound.is_empty() {
            if let Some(trailers) = stream.inbound_end.take() {
                stream.end_delivered = true;
                fed = handler.stream_end(trailers);
            }
        }
        if let Err(cause) = fed {
            debug!(session = session.id(), stream = stream_id, error = %cause, "consumer failed");
            self.reset_stream(session, stream_id, ErrorCode::InternalError, &cause);
            return Ok(());
        }

        if stream.state().can_receive()
            && stream.capacity > 0
            && stream.unacked > 0
            && stream.flow().should_send_window_update().is_some()
        {
            let increment = u32::try_from(stream.unacked).unwrap_or(u32::MAX);
            stream.flow_mut().send_window_update(increment)?;
            stream.unacked = 0;
            FrameCodec::encode_window_update_frame(&WindowUpdateFrame::new(stream_id, increment), &mut self.outbuf);
        }
        Ok(())
    }

    fn produce_output(&mut self, session: &mut dyn IoSession) -> Result<()> {
        if self.closing {
            return Ok(());
        }
        self.produce_heads(session)?;
        self.produce_data(session)
    }

    fn produce_heads(&mut self, session: &mut dyn IoSession) -> Result<()> {
        for stream_id in self.streams.stream_ids() {
            let pending = self
                .streams
                .get(stream_id)
                .map_or(false, |stream| !stream.head_sent && stream.handler.is_some());
            if !pending {
                continue;
            }
            let sent = match self.role {
                Role::Client => self.produce_request_head(session, stream_id)?,
                Role::Server => self.produce_response_head(session, stream_id)?,
            };
            // Local streams must open in ID order
            if !sent && self.role == Role::Client {
                break;
            }
        }
        Ok(())
    }

    fn produce_request_head(&mut self, session: &mut dyn IoSession, stream_id: StreamId) -> Result<bool> {
        let max_frame_size = self.remote.get_max_frame_size() as usize;
        let Some(stream) = self.streams.get_mut(stream_id) else {
            return Ok(false);
        };
        let Some(StreamHandler::Client(handler)) = stream.handler.as_mut() else {
            return Ok(false);
        };
        let mut slot: HeadSlot<RequestHead> = HeadSlot::new();
        if let Err(cause) = handler.produce_request(&mut slot) {
            // Nothing went out on this stream yet, so there is nothing to reset
            if let Some(mut stream) = self.streams.remove(stream_id) {
                if let Some(mut handler) = stream.handler.take() {
                    handler.fail(&cause);
                }
            }
            return Ok(true);
        }
        let Some((head, has_entity)) = slot.head else {
            return Ok(false);
        };
        trace!(session = session.id(), stream = stream_id, method = %head.method, path = %head.path, "request");
        let fields = request_fields(&head, self.scheme);
        stream.send_headers(!has_entity)?;
        stream.head_sent = true;
        encode_header_block(&mut self.encoder, &fields, stream_id, !has_entity, max_frame_size, &mut self.outbuf)?;
        if has_entity {
            self.output_queue.push_back(stream_id);
        }
        Ok(true)
    }

    fn produce_response_head(&mut self, session: &mut dyn IoSession, stream_id: StreamId) -> Result<bool> {
        let max_frame_size = self.remote.get_max_frame_size() as usize;
        let Some(stream) = self.streams.get_mut(stream_id) else {
            return Ok(false);
        };
        let Some(StreamHandler::Server(handler)) = stream.handler.as_mut() else {
            return Ok(false);
        };
        let mut slot: HeadSlot<ResponseHead> = HeadSlot::new();
        if let Err(cause) = handler.produce_response(&mut slot) {
            self.reset_stream(session, stream_id, ErrorCode::InternalError, &cause);
            return Ok(false);
        }
        for info in slot.information {
            let fields = response_fields(&info);
            encode_header_block(&mut self.encoder, &fields, stream_id, false, max_frame_size, &mut self.outbuf)?;
        }
        let Some((head, has_entity)) = slot.head else {
            return Ok(false);
        };
        trace!(session = session.id(), stream = stream_id, status = %head.status, "response");
        let fields = response_fields(&head);
        stream.send_headers(!has_entity)?;
        stream.head_sent = true;
        encode_header_block(&mut self.encoder, &fields, stream_id, !has_entity, max_frame_size, &mut self.outbuf)?;
        if has_entity {
            self.output_queue.push_back(stream_id);
        }
        Ok(true)
    }

    /// Produce DATA round-robin, one frame per stream per turn
    fn produce_data(&mut self, session: &mut dyn IoSession) -> Result<()> {
        loop {
            let mut progress = false;
            for _ in 0..self.output_queue.len() {
                if self.outbuf.len() >= self.config.buffer_size {
                    return Ok(());
                }
                let Some(stream_id) = self.output_queue.pop_front() else {
                    break;
                };
                match self.produce_frame(session, stream_id)? {
                    Produced::Frame => {
                        progress = true;
                        self.output_queue.push_back(stream_id);
                    }
                    Produced::Blocked => self.output_queue.push_back(stream_id),
                    Produced::Done => {}
                }
            }
            if !progress {
                return Ok(());
            }
        }
    }

    fn produce_frame(&mut self, session: &mut dyn IoSession, stream_id: StreamId) -> Result<Produced> {
        let max_frame_size = self.remote.get_max_frame_size() as usize;
        let conn_window = self.conn_flow.send_capacity();
        let Some(stream) = self.streams.get_mut(stream_id) else {
            return Ok(Produced::Done);
        };
        if !stream.state().can_send() {
            return Ok(Produced::Done);
        }
        let window = stream.flow().send_capacity().min(conn_window).min(max_frame_size);
        let output_requested = stream.output_requested;
        let Some(handler) = stream.handler.as_mut() else {
            return Ok(Produced::Done);
        };
        if window == 0 || (handler.available() == 0 && !output_requested) {
            return Ok(Produced::Blocked);
        }

        let mut sink = DataSink::new(window);
        let produced = handler.produce(&mut sink);
        stream.output_requested = sink.output_requested;
        if let Err(cause) = produced {
            self.reset_stream(session, stream_id, ErrorCode::InternalError, &cause);
            return Ok(Produced::Done);
        }
        let data = sink.data.freeze();
        let Some(end) = sink.end else {
            if data.is_empty() {
                return Ok(Produced::Blocked);
            }
            stream.flow_mut().consume_send_window(data.len())?;
            self.conn_flow.consume_send_window(data.len())?;
            stream.send_data(false)?;
            FrameCodec::encode_data_frame(&DataFrame::new(stream_id, data, false), &mut self.outbuf);
            return Ok(Produced::Frame);
        };

        let data_ends = end.is_none();
        if !data.is_empty() || data_ends {
            stream.flow_mut().consume_send_window(data.len())?;
            self.conn_flow.consume_send_window(data.len())?;
            stream.send_data(data_ends)?;
            FrameCodec::encode_data_frame(&DataFrame::new(stream_id, data, data_ends), &mut self.outbuf);
        }
        if let Some(trailers) = end {
            let fields = header_fields(&trailers);
            stream.send_headers(true)?;
            encode_header_block(&mut self.encoder, &fields, stream_id, true, max_frame_size, &mut self.outbuf)?;
        }
        trace!(session = session.id(), stream = stream_id, "body sent");
        Ok(Produced::Done)
    }

    /// Release streams that are finished in both directions
    fn reap(&mut self, session: &mut dyn IoSession) {
        for stream_id in self.streams.stream_ids() {
            let Some(stream) = self.streams.get(stream_id) else {
                continue;
            };
            let finished = stream.state().is_closed() && stream.end_delivered;
            // A complete response ends the exchange even if the request body is still arriving
            let early_response = self.role == Role::Server
                && stream.state() == StreamState::HalfClosedLocal
                && stream.head_sent;
            if !finished && !early_response {
                continue;
            }
            if early_response {
                debug!(session = session.id(), stream = stream_id, "response completed before request body");
                self.write_rst_stream(stream_id, ErrorCode::NoError);
            }
            if let Some(mut stream) = self.streams.remove(stream_id) {
                trace!(session = session.id(), stream = stream_id, "stream complete");
                if let Some(mut handler) = stream.handler.take() {
                    handler.release();
                }
            }
        }
    }

    /// Stream error: reset the stream and fail its handler
    fn reset_stream(&mut self, session: &mut dyn IoSession, stream_id: StreamId, code: ErrorCode, cause: &Error) {
        debug!(session = session.id(), stream = stream_id, %code, error = %cause, "resetting stream");
        let Some(mut stream) = self.streams.remove(stream_id) else {
            return;
        };
        if stream.state() != StreamState::Idle {
            self.write_rst_stream(stream_id, code);
        }
        stream.reset();
        if let Some(mut handler) = stream.handler.take() {
            handler.fail(cause);
        }
    }

    fn write_rst_stream(&mut self, stream_id: StreamId, code: ErrorCode) {
        FrameCodec::encode_rst_stream_frame(&RstStreamFrame::new(stream_id, code), &mut self.outbuf);
    }

    fn send_goaway(&mut self, code: ErrorCode, debug_data: &str) {
        if self.goaway_sent {
            return;
        }
        self.goaway_sent = true;
        let frame = GoawayFrame::new(
            self.streams.last_remote_id(),
            code,
            Bytes::copy_from_slice(debug_data.as_bytes()),
        );
        FrameCodec::encode_goaway_frame(&frame, &mut self.outbuf);
    }

    /// Connection error: GOAWAY with the error's code, then close
    fn connection_error(&mut self, session: &mut dyn IoSession, err: H2Error) {
        debug!(session = session.id(), code = %err.code(), error = %err, "connection error");
        self.send_goaway(err.code(), &err.to_string());
        self.fail_all(&Error::H2(err));
        self.continuation = None;
        self.inbuf.clear();
        self.closing = true;
    }

    fn fail_all(&mut self, cause: &Error) {
        for mut stream in self.streams.drain() {
            if let Some(mut handler) = stream.handler.take() {
                handler.fail(cause);
            }
        }
        self.output_queue.clear();
    }

    fn has_pending_output(&self) -> bool {
        let conn_open = self.conn_flow.send_capacity() > 0;
        self.output_queue.iter().any(|stream_id| {
            self.streams.get(*stream_id).map_or(false, |stream| {
                stream.output_requested
                    || (conn_open
                        && stream.flow().send_capacity() > 0
                        && stream.handler.as_ref().map_or(false, |handler| handler.available() > 0))
            })
        })
    }

    fn update_interest(&mut self, session: &mut dyn IoSession) {
        let mut mask = EventMask::NONE;
        if !self.closing && !self.eof {
            mask |= EventMask::READ;
        }
        if !self.outbuf.is_empty() || session.has_commands() || self.has_pending_output() {
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
                    self.send_goaway(ErrorCode::NoError, "");
                }
                Command::Execute(handler) => self.start_exchange(session, handler),
            }
        }
        true
    }

    fn start_exchange(&mut self, session: &mut dyn IoSession, mut handler: Box<dyn ClientExchangeHandler>) {
        if self.role == Role::Server {
            handler.failed(&Error::IllegalState("server session cannot execute requests".to_string()));
            handler.release_resources();
            return;
        }
        if self.shutdown || self.goaway_received || self.closing {
            handler.failed(&Error::ConnectionClosed);
            handler.release_resources();
            return;
        }
        let send_window = self.remote.get_initial_window_size();
        let recv_window = self.config.initial_window_size();
        match self.streams.create_local(send_window, recv_window) {
            Ok(stream) => {
                trace!(session = session.id(), stream = stream.id(), "exchange started");
                stream.handler = Some(StreamHandler::Client(handler));
            }
            Err(err) => {
                debug!(session = session.id(), error = %err, "cannot open stream");
                handler.failed(&Error::H2(err));
                handler.release_resources();
            }
        }
    }
}

impl IoEventHandler for H2Multiplexer {
    fn protocol(&self) -> &'static str {
        "h2"
    }

    fn connected(&mut self, session: &mut dyn IoSession) -> Result<()> {
        debug!(session = session.id(), role = ?self.role, "HTTP/2 connection");
        if self.role == Role::Client {
            self.outbuf.extend_from_slice(CONNECTION_PREFACE);
        }
        FrameCodec::encode_settings_frame(&SettingsFrame::new(self.config.settings.clone()), &mut self.outbuf);
        let window = self.config.initial_window_size();
        if window > DEFAULT_INITIAL_WINDOW_SIZE {
            // The connection window is only enlarged through WINDOW_UPDATE
            self.conn_flow.recv_window_mut().update_initial_size(window)?;
            FrameCodec::encode_window_update_frame(
                &WindowUpdateFrame::new(CONNECTION_STREAM_ID, window - DEFAULT_INITIAL_WINDOW_SIZE),
                &mut self.outbuf,
            );
        }
        self.drive(session)
    }

    fn input_ready(&mut self, session: &mut dyn IoSession, replay: Option<&[u8]>) -> Result<()> {
        if let Some(data) = replay {
            self.inbuf.extend_from_slice(data);
        }
        // Consumers that freed capacity resume through a read event
        for stream_id in self.streams.stream_ids() {
            self.deliver_input(session, stream_id)?;
        }
        if !self.eof && !self.closing {
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
        if !self.streams.is_empty() {
            return Err(Error::Timeout);
        }
        debug!(session = session.id(), ?timeout, "idle connection timed out");
        self.send_goaway(ErrorCode::NoError, "idle timeout");
        self.closing = true;
        self.drive(session)
    }

    fn exception(&mut self, _session: &mut dyn IoSession, cause: &Error) {
        self.fail_all(cause);
    }

    fn disconnected(&mut self, _session: &mut dyn IoSession) {
        self.fail_all(&Error::ConnectionClosed);
    }
}

fn protocol_error(message: String) -> Error {
    Error::H2(H2Error::Protocol(message))
}

/// HPACK-encode `fields` and write them as HEADERS plus any CONTINUATION frames
fn encode_header_block(
    encoder: &mut HeaderEncoder,
    fields: &[(String, String)],
    stream_id: StreamId,
    end_stream: bool,
    max_frame_size: usize,
    dst: &mut BytesMut,
) -> Result<()> {
    let mut block = Vec::new();
    encoder
        .encode(fields, &mut block)
        .map_err(|e| H2Error::Internal(format!("HPACK encode error: {}", e)))?;

    let mut block = Bytes::from(block);
    let first = block.split_to(block.len().min(max_frame_size));
    FrameCodec::encode_headers_frame(
        &HeadersFrame::new(stream_id, first, end_stream, block.is_empty()),
        dst,
    );
    while !block.is_empty() {
        let header_block = block.split_to(block.len().min(max_frame_size));
        let frame = ContinuationFrame {
            stream_id,
            header_block,
            end_headers: block.is_empty(),
        };
        FrameCodec::encode_continuation_frame(&frame, dst);
    }
    Ok(())
}

/// Regular header fields, lowercased, without connection-specific ones
fn header_fields(headers: &Headers) -> Vec<(String, String)> {
    let mut fields = Vec::with_capacity(headers.len());
    push_header_fields(headers, &mut fields);
    fields
}

fn push_header_fields(headers: &Headers, fields: &mut Vec<(String, String)>) {
    for (name, value) in headers.iter() {
        let name = name.to_ascii_lowercase();
        if name == "host" || CONNECTION_SPECIFIC.contains(&name.as_str()) {
            continue;
        }
        if name == "te" && !value.eq_ignore_ascii_case("trailers") {
            continue;
        }
        fields.push((name, value.to_string()));
    }
}

fn request_fields(head: &RequestHead, scheme: &str) -> Vec<(String, String)> {
    let mut fields = vec![(":method".to_string(), head.method.as_str().to_string())];
    if head.method == Method::Connect {
        let authority = head.host().unwrap_or(&head.path);
        fields.push((":authority".to_string(), authority.to_string()));
    } else {
        let scheme = head.scheme.as_deref().unwrap_or(scheme);
        fields.push((":scheme".to_string(), scheme.to_string()));
        if let Some(authority) = head.host() {
            fields.push((":authority".to_string(), authority.to_string()));
        }
        let path = if head.path.is_empty() { "/" } else { head.path.as_str() };
        fields.push((":path".to_string(), path.to_string()));
    }
    push_header_fields(&head.headers, &mut fields);
    fields
}

fn response_fields(head: &ResponseHead) -> Vec<(String, String)> {
    let mut fields = vec![(":status".to_string(), head.status.code().to_string())];
    push_header_fields(&head.headers, &mut fields);
    fields
}

fn field_strings(name: Vec<u8>, value: Vec<u8>) -> std::result::Result<(String, String), H2Error> {
    let name = String::from_utf8(name).map_err(|_| H2Error::InvalidHeader("header name is not UTF-8".to_string()))?;
    let value = String::from_utf8(value)
        .map_err(|_| H2Error::InvalidHeader(format!("value of {} is not UTF-8", name)))?;
    if name.bytes().any(|b| b.is_ascii_uppercase()) {
        return Err(H2Error::InvalidHeader(format!("uppercase header name {}", name)));
    }
    if CONNECTION_SPECIFIC.contains(&name.as_str()) {
        return Err(H2Error::InvalidHeader(format!("connection-specific header {}", name)));
    }
    if name == "te" && value != "trailers" {
        return Err(H2Error::InvalidHeader(format!("te: {}", value)));
    }
    Ok((name, value))
}

/// Split decoded fields into pseudo-headers (in front) and regular headers
fn split_fields(
    fields: Vec<(Vec<u8>, Vec<u8>)>,
) -> std::result::Result<(Vec<(String, String)>, Headers), H2Error> {
    let mut pseudo = Vec::new();
    let mut headers = Headers::new();
    for (name, value) in fields {
        let (name, value) = field_strings(name, value)?;
        if name.starts_with(':') {
            if !headers.is_empty() {
                return Err(H2Error::InvalidHeader(format!("{} after regular header fields", name)));
            }
            if pseudo.iter().any(|(seen, _): &(String, String)| *seen == name) {
                return Err(H2Error::InvalidHeader(format!("duplicate {}", name)));
            }
            pseudo.push((name, value));
        } else {
            headers.insert(name, value);
        }
    }
    Ok((pseudo, headers))
}

fn request_head(fields: Vec<(Vec<u8>, Vec<u8>)>) -> std::result::Result<RequestHead, H2Error> {
    let (pseudo, headers) = split_fields(fields)?;
    let mut method = None;
    let mut scheme = None;
    let mut authority = None;
    let mut path = None;
    for (name, value) in pseudo {
        match name.as_str() {
            ":method" => method = Some(value),
            ":scheme" => scheme = Some(value),
            ":authority" => authority = Some(value),
            ":path" => path = Some(value),
            _ => return Err(H2Error::InvalidHeader(format!("unknown request pseudo-header {}", name))),
        }
    }
    let method: Method = method
        .ok_or_else(|| H2Error::InvalidHeader("missing :method".to_string()))?
        .parse()
        .map_err(|e: Error| H2Error::InvalidHeader(e.to_string()))?;

    let target = if method == Method::Connect {
        if scheme.is_some() || path.is_some() {
            return Err(H2Error::InvalidHeader("CONNECT with :scheme or :path".to_string()));
        }
        authority
            .clone()
            .ok_or_else(|| H2Error::InvalidHeader("CONNECT without :authority".to_string()))?
    } else {
        if scheme.is_none() {
            return Err(H2Error::InvalidHeader("missing :scheme".to_string()));
        }
        path.filter(|path| !path.is_empty())
            .ok_or_else(|| H2Error::InvalidHeader("missing :path".to_string()))?
    };

    let mut head = RequestHead::new(method, target).version(Version::Http2);
    head.headers = headers;
    head.scheme = scheme;
    head.authority = authority;
    Ok(head)
}

fn response_head(fields: Vec<(Vec<u8>, Vec<u8>)>) -> std::result::Result<ResponseHead, H2Error> {
    let (pseudo, headers) = split_fields(fields)?;
    let mut status = None;
    for (name, value) in pseudo {
        if name != ":status" {
            return Err(H2Error::InvalidHeader(format!("unknown response pseudo-header {}", name)));
        }
        let code: u16 = value
            .parse()
            .map_err(|_| H2Error::InvalidHeader(format!(":status {}", value)))?;
        status = Some(Status::new(code).map_err(|e| H2Error::InvalidHeader(e.to_string()))?);
    }
    let status = status.ok_or_else(|| H2Error::InvalidHeader("missing :status".to_string()))?;
    let mut head = ResponseHead::new(status);
    head.version = Version::Http2;
    head.headers = headers;
    Ok(head)
}

fn trailer_fields(fields: Vec<(Vec<u8>, Vec<u8>)>) -> std::result::Result<Headers, H2Error> {
    let (pseudo, headers) = split_fields(fields)?;
    if let Some((name, _)) = pseudo.first() {
        return Err(H2Error::InvalidHeader(format!("{} in trailers", name)));
    }
    Ok(headers)
}
