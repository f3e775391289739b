//! HTTP/2 frame encoding and decoding
//!
//! Frames are encoded straight into the connection's output buffer and
//! decoded incrementally from its input buffer: [`FrameCodec::decode`]
//! returns `Ok(None)` until a complete frame is buffered.

use super::error::{Error, ErrorCode, Result};
use super::frames::*;
use super::settings::Settings;
use super::DEFAULT_MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// HTTP/2 frame header size (9 bytes)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Frame codec for one direction of a connection
#[derive(Debug, Clone)]
pub struct FrameCodec {
    /// Largest payload accepted on decode (local SETTINGS_MAX_FRAME_SIZE)
    max_frame_size: u32,
}

impl FrameCodec {
    pub fn new() -> Self {
        FrameCodec {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        FrameCodec { max_frame_size }
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Encode a frame header
    pub fn encode_header(frame_type: FrameType, flags: FrameFlags, stream_id: u32, length: usize) -> [u8; FRAME_HEADER_SIZE] {
        let mut header = [0u8; FRAME_HEADER_SIZE];

        // Length (24 bits, big-endian)
        header[0] = ((length >> 16) & 0xFF) as u8;
        header[1] = ((length >> 8) & 0xFF) as u8;
        header[2] = (length & 0xFF) as u8;

        header[3] = frame_type.as_u8();
        header[4] = flags.as_u8();

        // Stream ID (31 bits, reserved bit is 0)
        let stream_id = stream_id & 0x7FFF_FFFF;
        header[5..9].copy_from_slice(&stream_id.to_be_bytes());

        header
    }

    /// Decode a frame header
    pub fn decode_header(bytes: &[u8; FRAME_HEADER_SIZE]) -> FrameHeader {
        let length = ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | (bytes[2] as usize);
        let stream_id = u32::from_be_bytes([bytes[5] & 0x7F, bytes[6], bytes[7], bytes[8]]);
        FrameHeader {
            length,
            kind: bytes[3],
            flags: FrameFlags::from_u8(bytes[4]),
            stream_id,
        }
    }

    fn put_header(dst: &mut BytesMut, frame_type: FrameType, flags: FrameFlags, stream_id: u32, length: usize) {
        dst.reserve(FRAME_HEADER_SIZE + length);
        dst.put_slice(&Self::encode_header(frame_type, flags, stream_id, length));
    }

    /// Append `frame` to `dst`
    pub fn encode(frame: &Frame, dst: &mut BytesMut) {
        match frame {
            Frame::Data(f) => Self::encode_data_frame(f, dst),
            Frame::Headers(f) => Self::encode_headers_frame(f, dst),
            Frame::Priority(f) => Self::encode_priority_frame(f, dst),
            Frame::RstStream(f) => Self::encode_rst_stream_frame(f, dst),
            Frame::Settings(f) => Self::encode_settings_frame(f, dst),
            Frame::PushPromise(f) => Self::encode_push_promise_frame(f, dst),
            Frame::Ping(f) => Self::encode_ping_frame(f, dst),
            Frame::Goaway(f) => Self::encode_goaway_frame(f, dst),
            Frame::WindowUpdate(f) => Self::encode_window_update_frame(f, dst),
            Frame::Continuation(f) => Self::encode_continuation_frame(f, dst),
            Frame::Unknown { .. } => {}
        }
    }

    pub fn encode_data_frame(frame: &DataFrame, dst: &mut BytesMut) {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::END_STREAM, frame.end_stream);
        Self::put_header(dst, FrameType::Data, flags, frame.stream_id, frame.data.len());
        dst.put_slice(&frame.data);
    }

    pub fn encode_headers_frame(frame: &HeadersFrame, dst: &mut BytesMut) {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::END_STREAM, frame.end_stream);
        flags.set_if(FrameFlags::END_HEADERS, frame.end_headers);
        flags.set_if(FrameFlags::PRIORITY, frame.priority.is_some());

        let payload_len = frame.header_block.len() + if frame.priority.is_some() { 5 } else { 0 };
        Self::put_header(dst, FrameType::Headers, flags, frame.stream_id, payload_len);
        if let Some(priority) = &frame.priority {
            put_priority(priority, dst);
        }
        dst.put_slice(&frame.header_block);
    }

    pub fn encode_priority_frame(frame: &PriorityFrame, dst: &mut BytesMut) {
        Self::put_header(dst, FrameType::Priority, FrameFlags::empty(), frame.stream_id, 5);
        put_priority(&frame.priority, dst);
    }

    pub fn encode_rst_stream_frame(frame: &RstStreamFrame, dst: &mut BytesMut) {
        Self::put_header(dst, FrameType::RstStream, FrameFlags::empty(), frame.stream_id, 4);
        dst.put_u32(frame.error_code.as_u32());
    }

    pub fn encode_settings_frame(frame: &SettingsFrame, dst: &mut BytesMut) {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::ACK, frame.ack);
        let params = if frame.ack { Vec::new() } else { frame.settings.parameters() };

        // Each setting is 6 bytes (2 byte ID + 4 byte value)
        Self::put_header(dst, FrameType::Settings, flags, 0, params.len() * 6);
        for (param, value) in params {
            dst.put_u16(param.as_u16());
            dst.put_u32(value);
        }
    }

    pub fn encode_push_promise_frame(frame: &PushPromiseFrame, dst: &mut BytesMut) {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::END_HEADERS, frame.end_headers);
        Self::put_header(dst, FrameType::PushPromise, flags, frame.stream_id, 4 + frame.header_block.len());
        dst.put_u32(frame.promised_stream_id & 0x7FFF_FFFF);
        dst.put_slice(&frame.header_block);
    }

    pub fn encode_ping_frame(frame: &PingFrame, dst: &mut BytesMut) {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::ACK, frame.ack);
        Self::put_header(dst, FrameType::Ping, flags, 0, 8);
        dst.put_slice(&frame.data);
    }

    pub fn encode_goaway_frame(frame: &GoawayFrame, dst: &mut BytesMut) {
        Self::put_header(dst, FrameType::Goaway, FrameFlags::empty(), 0, 8 + frame.debug_data.len());
        dst.put_u32(frame.last_stream_id & 0x7FFF_FFFF);
        dst.put_u32(frame.error_code.as_u32());
        dst.put_slice(&frame.debug_data);
    }

    pub fn encode_window_update_frame(frame: &WindowUpdateFrame, dst: &mut BytesMut) {
        Self::put_header(dst, FrameType::WindowUpdate, FrameFlags::empty(), frame.stream_id, 4);
        dst.put_u32(frame.size_increment & 0x7FFF_FFFF);
    }

    pub fn encode_continuation_frame(frame: &ContinuationFrame, dst: &mut BytesMut) {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::END_HEADERS, frame.end_headers);
        Self::put_header(dst, FrameType::Continuation, flags, frame.stream_id, frame.header_block.len());
        dst.put_slice(&frame.header_block);
    }

    /// Decode the next frame from `src`
    ///
    /// Returns `Ok(None)` while the frame is incomplete; consumed bytes are
    /// removed from `src`. A payload larger than the local maximum frame size
    /// is a FRAME_SIZE_ERROR.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let mut raw = [0u8; FRAME_HEADER_SIZE];
        raw.copy_from_slice(&src[..FRAME_HEADER_SIZE]);
        let header = Self::decode_header(&raw);

        if header.length > self.max_frame_size as usize {
            return Err(Error::FrameSize(format!(
                "{} byte frame exceeds the maximum frame size of {}",
                header.length, self.max_frame_size
            )));
        }
        if src.len() < FRAME_HEADER_SIZE + header.length {
            return Ok(None);
        }
        src.advance(FRAME_HEADER_SIZE);
        let payload = src.split_to(header.length).freeze();
        Self::decode_payload(header, payload).map(Some)
    }

    /// Parse the payload of a frame whose header is already decoded
    pub fn decode_payload(header: FrameHeader, mut payload: Bytes) -> Result<Frame> {
        let frame_type = match header.frame_type() {
            Some(frame_type) => frame_type,
            None => {
                return Ok(Frame::Unknown {
                    kind: header.kind,
                    stream_id: header.stream_id,
                })
            }
        };
        let flags = header.flags;
        let stream_id = header.stream_id;

        let needs_stream = !matches!(frame_type, FrameType::Settings | FrameType::Ping | FrameType::Goaway | FrameType::WindowUpdate);
        if needs_stream && stream_id == 0 {
            return Err(Error::Protocol(format!("{} frame on stream 0", frame_type.name())));
        }
        if !needs_stream && frame_type != FrameType::WindowUpdate && stream_id != 0 {
            return Err(Error::Protocol(format!("{} frame on stream {}", frame_type.name(), stream_id)));
        }

        let frame = match frame_type {
            FrameType::Data => {
                let flow_len = payload.len();
                let data = strip_padding(flags, &mut payload)?;
                Frame::Data(DataFrame {
                    stream_id,
                    data,
                    end_stream: flags.is_end_stream(),
                    flow_len,
                })
            }
            FrameType::Headers => {
                let mut block = strip_padding(flags, &mut payload)?;
                let priority = if flags.is_priority() {
                    if block.len() < 5 {
                        return Err(Error::FrameSize("HEADERS priority field truncated".to_string()));
                    }
                    Some(get_priority(&mut block))
                } else {
                    None
                };
                Frame::Headers(HeadersFrame {
                    stream_id,
                    header_block: block,
                    end_stream: flags.is_end_stream(),
                    end_headers: flags.is_end_headers(),
                    priority,
                })
            }
            FrameType::Priority => {
                expect_length(frame_type, &payload, 5)?;
                Frame::Priority(PriorityFrame {
                    stream_id,
                    priority: get_priority(&mut payload),
                })
            }
            FrameType::RstStream => {
                expect_length(frame_type, &payload, 4)?;
                Frame::RstStream(RstStreamFrame::new(stream_id, ErrorCode::from_wire(payload.get_u32())))
            }
            FrameType::Settings => {
                if flags.is_ack() {
                    expect_length(frame_type, &payload, 0)?;
                    Frame::Settings(SettingsFrame::ack())
                } else {
                    if payload.len() % 6 != 0 {
                        return Err(Error::FrameSize(format!("SETTINGS payload of {} bytes", payload.len())));
                    }
                    let mut settings = Settings::new();
                    while payload.has_remaining() {
                        let id = payload.get_u16();
                        let value = payload.get_u32();
                        settings.set_parameter(id, value)?;
                    }
                    settings.validate()?;
                    Frame::Settings(SettingsFrame::new(settings))
                }
            }
            FrameType::PushPromise => {
                let mut block = strip_padding(flags, &mut payload)?;
                if block.len() < 4 {
                    return Err(Error::FrameSize("PUSH_PROMISE truncated".to_string()));
                }
                let promised_stream_id = block.get_u32() & 0x7FFF_FFFF;
                Frame::PushPromise(PushPromiseFrame {
                    stream_id,
                    promised_stream_id,
                    header_block: block,
                    end_headers: flags.is_end_headers(),
                })
            }
            FrameType::Ping => {
                expect_length(frame_type, &payload, 8)?;
                let mut data = [0u8; 8];
                payload.copy_to_slice(&mut data);
                Frame::Ping(PingFrame {
                    ack: flags.is_ack(),
                    data,
                })
            }
            FrameType::Goaway => {
                if payload.len() < 8 {
                    return Err(Error::FrameSize("GOAWAY truncated".to_string()));
                }
                let last_stream_id = payload.get_u32() & 0x7FFF_FFFF;
                let error_code = ErrorCode::from_wire(payload.get_u32());
                Frame::Goaway(GoawayFrame::new(last_stream_id, error_code, payload))
            }
            FrameType::WindowUpdate => {
                expect_length(frame_type, &payload, 4)?;
                Frame::WindowUpdate(WindowUpdateFrame::new(stream_id, payload.get_u32() & 0x7FFF_FFFF))
            }
            FrameType::Continuation => Frame::Continuation(ContinuationFrame {
                stream_id,
                header_block: payload,
                end_headers: flags.is_end_headers(),
            }),
        };
        Ok(frame)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn expect_length(frame_type: FrameType, payload: &Bytes, length: usize) -> Result<()> {
    if payload.len() != length {
        return Err(Error::FrameSize(format!(
            "{} payload of {} bytes, expected {}",
            frame_type.name(),
            payload.len(),
            length
        )));
    }
    Ok(())
}

/// Remove the pad length field and trailing padding of a PADDED frame
fn strip_padding(flags: FrameFlags, payload: &mut Bytes) -> Result<Bytes> {
    if !flags.is_padded() {
        return Ok(payload.split_off(0));
    }
    if payload.is_empty() {
        return Err(Error::FrameSize("padded frame without pad length".to_string()));
    }
    let pad_len = payload.get_u8() as usize;
    if pad_len > payload.len() {
        return Err(Error::Protocol(format!(
            "padding of {} bytes exceeds the {} byte payload",
            pad_len,
            payload.len()
        )));
    }
    let data_len = payload.len() - pad_len;
    Ok(payload.split_to(data_len))
}

fn put_priority(priority: &PrioritySpec, dst: &mut BytesMut) {
    let mut dep = priority.stream_dependency & 0x7FFF_FFFF;
    if priority.exclusive {
        dep |= 0x8000_0000;
    }
    dst.put_u32(dep);
    dst.put_u8(priority.weight);
}

fn get_priority(src: &mut Bytes) -> PrioritySpec {
    let dep = src.get_u32();
    PrioritySpec {
        stream_dependency: dep & 0x7FFF_FFFF,
        exclusive: dep & 0x8000_0000 != 0,
        weight: src.get_u8(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::h2::settings::SettingsBuilder;

    #[test]
    fn test_encode_decode_header() {
        let flags = FrameFlags::from_u8(FrameFlags::END_STREAM | FrameFlags::END_HEADERS);
        let header = FrameCodec::encode_header(FrameType::Headers, flags, 42, 1234);
        let decoded = FrameCodec::decode_header(&header);

        assert_eq!(decoded.frame_type(), Some(FrameType::Headers));
        assert_eq!(decoded.flags, flags);
        assert_eq!(decoded.stream_id, 42);
        assert_eq!(decoded.length, 1234);
    }

    #[test]
    fn test_encode_data_frame() {
        let mut dst = BytesMut::new();
        FrameCodec::encode_data_frame(&DataFrame::new(1, Bytes::from("Hello"), true), &mut dst);

        assert_eq!(dst[0..3], [0, 0, 5]);
        assert_eq!(dst[3], FrameType::Data.as_u8());
        assert_eq!(dst[4], FrameFlags::END_STREAM);
        assert_eq!(&dst[5..9], &[0, 0, 0, 1]);
        assert_eq!(&dst[9..], b"Hello");
    }

    #[test]
    fn test_decode_incrementally() {
        let mut wire = BytesMut::new();
        FrameCodec::encode_data_frame(&DataFrame::new(3, Bytes::from("payload"), false), &mut wire);
        FrameCodec::encode_ping_frame(&PingFrame::new([7; 8]), &mut wire);

        let codec = FrameCodec::new();
        let mut src = BytesMut::new();
        src.extend_from_slice(&wire[..4]);
        assert_eq!(codec.decode(&mut src).unwrap(), None);
        src.extend_from_slice(&wire[4..12]);
        assert_eq!(codec.decode(&mut src).unwrap(), None);
        src.extend_from_slice(&wire[12..]);

        match codec.decode(&mut src).unwrap() {
            Some(Frame::Data(frame)) => {
                assert_eq!(frame.stream_id, 3);
                assert_eq!(&frame.data[..], b"payload");
                assert!(!frame.end_stream);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(codec.decode(&mut src).unwrap(), Some(Frame::Ping(PingFrame::new([7; 8]))));
        assert!(src.is_empty());
    }

    #[test]
    fn test_decode_padded_data() {
        // pad length 3, "Hi", 3 bytes padding
        let mut src = BytesMut::new();
        src.extend_from_slice(&FrameCodec::encode_header(
            FrameType::Data,
            FrameFlags::from_u8(FrameFlags::PADDED),
            1,
            6,
        ));
        src.extend_from_slice(&[3, b'H', b'i', 0, 0, 0]);
        match FrameCodec::new().decode(&mut src).unwrap() {
            Some(Frame::Data(frame)) => {
                assert_eq!(&frame.data[..], b"Hi");
                assert_eq!(frame.flow_len, 6);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut src = BytesMut::new();
        src.extend_from_slice(&FrameCodec::encode_header(FrameType::Data, FrameFlags::empty(), 1, 16_385));
        let err = FrameCodec::new().decode(&mut src).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FrameSizeError);
    }

    #[test]
    fn test_unknown_frame_type_skipped() {
        let mut src = BytesMut::new();
        src.extend_from_slice(&[0, 0, 2, 0xbb, 0, 0, 0, 0, 5, 1, 2]);
        assert_eq!(
            FrameCodec::new().decode(&mut src).unwrap(),
            Some(Frame::Unknown { kind: 0xbb, stream_id: 5 })
        );
        assert!(src.is_empty());
    }

    #[test]
    fn test_settings_round_trip_and_ack() {
        let settings = SettingsBuilder::new()
            .header_table_size(8192)
            .enable_push(false)
            .initial_window_size(65535)
            .build()
            .unwrap();
        let mut src = BytesMut::new();
        FrameCodec::encode_settings_frame(&SettingsFrame::new(settings.clone()), &mut src);
        // 3 settings * 6 bytes
        assert_eq!(src[0..3], [0, 0, 18]);
        FrameCodec::encode_settings_frame(&SettingsFrame::ack(), &mut src);

        let codec = FrameCodec::new();
        assert_eq!(codec.decode(&mut src).unwrap(), Some(Frame::Settings(SettingsFrame::new(settings))));
        assert_eq!(codec.decode(&mut src).unwrap(), Some(Frame::Settings(SettingsFrame::ack())));
    }

    #[test]
    fn test_frame_validation() {
        let codec = FrameCodec::new();

        // PING on a stream
        let mut src = BytesMut::new();
        src.extend_from_slice(&FrameCodec::encode_header(FrameType::Ping, FrameFlags::empty(), 1, 8));
        src.extend_from_slice(&[0; 8]);
        assert_eq!(codec.decode(&mut src).unwrap_err().code(), ErrorCode::ProtocolError);

        // DATA on stream 0
        let mut src = BytesMut::new();
        src.extend_from_slice(&FrameCodec::encode_header(FrameType::Data, FrameFlags::empty(), 0, 0));
        assert_eq!(codec.decode(&mut src).unwrap_err().code(), ErrorCode::ProtocolError);

        // WINDOW_UPDATE with a short payload
        let mut src = BytesMut::new();
        src.extend_from_slice(&FrameCodec::encode_header(FrameType::WindowUpdate, FrameFlags::empty(), 0, 3));
        src.extend_from_slice(&[0; 3]);
        assert_eq!(codec.decode(&mut src).unwrap_err().code(), ErrorCode::FrameSizeError);

        // SETTINGS with an oversized window
        let mut src = BytesMut::new();
        src.extend_from_slice(&FrameCodec::encode_header(FrameType::Settings, FrameFlags::empty(), 0, 6));
        src.extend_from_slice(&[0, 4, 0x80, 0, 0, 0]);
        assert_eq!(codec.decode(&mut src).unwrap_err().code(), ErrorCode::FlowControlError);
    }

    #[test]
    fn test_goaway_and_rst_stream() {
        let mut src = BytesMut::new();
        FrameCodec::encode_goaway_frame(
            &GoawayFrame::new(7, ErrorCode::EnhanceYourCalm, Bytes::from_static(b"slow down")),
            &mut src,
        );
        FrameCodec::encode_rst_stream_frame(&RstStreamFrame::new(5, ErrorCode::Cancel), &mut src);
        let codec = FrameCodec::new();
        match codec.decode(&mut src).unwrap() {
            Some(Frame::Goaway(frame)) => {
                assert_eq!(frame.last_stream_id, 7);
                assert_eq!(frame.error_code, ErrorCode::EnhanceYourCalm);
                assert_eq!(&frame.debug_data[..], b"slow down");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(Frame::RstStream(RstStreamFrame::new(5, ErrorCode::Cancel)))
        );
    }
}
