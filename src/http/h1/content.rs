//! HTTP/1.1 message body codecs
//!
//! A body is framed one of three ways: a fixed `Content-Length`, chunked
//! transfer coding, or everything until the peer closes the connection. The
//! encoder and decoder for each are picked from the [`BodyLength`] the
//! content length strategy determined for the message.

use crate::http::chunked::{self, ChunkedDecoder, Decoded};
use crate::http::strategy::BodyLength;
use crate::http::{Error, Headers, Result};
use bytes::BytesMut;

/// Frames outgoing body bytes
#[derive(Debug)]
pub enum ContentEncoder {
    Length { remaining: u64 },
    Chunked,
    UntilClose,
}

impl ContentEncoder {
    /// Encoder for `length`; `None` when the message has no body
    pub fn new(length: BodyLength) -> Option<Self> {
        match length {
            BodyLength::None => None,
            BodyLength::Length(n) => Some(ContentEncoder::Length { remaining: n }),
            BodyLength::Chunked => Some(ContentEncoder::Chunked),
            BodyLength::UntilClose => Some(ContentEncoder::UntilClose),
        }
    }

    /// Frame `data` into `dst`
    ///
    /// Writing past a declared Content-Length is an error.
    pub fn encode(&mut self, data: &[u8], dst: &mut BytesMut) -> Result<()> {
        match self {
            ContentEncoder::Length { remaining } => {
                if data.len() as u64 > *remaining {
                    return Err(Error::Protocol(format!(
                        "body exceeds Content-Length by {} bytes",
                        data.len() as u64 - *remaining
                    )));
                }
                *remaining -= data.len() as u64;
                dst.extend_from_slice(data);
            }
            ContentEncoder::Chunked => chunked::encode_chunk(data, dst),
            ContentEncoder::UntilClose => dst.extend_from_slice(data),
        }
        Ok(())
    }

    /// Terminate the body
    ///
    /// Trailers are only representable with chunked coding and are dropped
    /// otherwise. A Content-Length body ended early is an error.
    pub fn complete(&mut self, trailers: Option<&Headers>, dst: &mut BytesMut) -> Result<()> {
        match self {
            ContentEncoder::Length { remaining: 0 } => Ok(()),
            ContentEncoder::Length { remaining } => Err(Error::Protocol(format!(
                "body ended {} bytes short of Content-Length",
                remaining
            ))),
            ContentEncoder::Chunked => {
                chunked::encode_last_chunk(trailers, dst);
                Ok(())
            }
            ContentEncoder::UntilClose => Ok(()),
        }
    }

    /// Whether the connection must close to delimit the body
    pub fn closes_connection(&self) -> bool {
        matches!(self, ContentEncoder::UntilClose)
    }
}

/// Extracts incoming body bytes from the connection buffer
#[derive(Debug)]
pub enum ContentDecoder {
    Length { remaining: u64 },
    Chunked(ChunkedDecoder),
    UntilClose,
}

impl ContentDecoder {
    /// Decoder for `length`; `None` when the message has no body
    pub fn new(length: BodyLength) -> Option<Self> {
        match length {
            BodyLength::None => None,
            BodyLength::Length(n) => Some(ContentDecoder::Length { remaining: n }),
            BodyLength::Chunked => Some(ContentDecoder::Chunked(ChunkedDecoder::new())),
            BodyLength::UntilClose => Some(ContentDecoder::UntilClose),
        }
    }

    /// Decode at most `max` body bytes from `src`
    ///
    /// `eof` tells whether the peer has closed its side; a body that is cut
    /// short by the close is reported as `Error::ConnectionClosed`.
    pub fn decode(&mut self, src: &mut BytesMut, max: usize, eof: bool) -> Result<Decoded> {
        match self {
            ContentDecoder::Length { remaining: 0 } => Ok(Decoded::End(Headers::new())),
            ContentDecoder::Length { remaining } => {
                if src.is_empty() {
                    return if eof {
                        Err(Error::ConnectionClosed)
                    } else {
                        Ok(Decoded::NeedMore)
                    };
                }
                if max == 0 {
                    return Ok(Decoded::NeedMore);
                }
                let n = (src.len() as u64).min(*remaining).min(max as u64) as usize;
                *remaining -= n as u64;
                Ok(Decoded::Data(src.split_to(n).freeze()))
            }
            ContentDecoder::Chunked(decoder) => match decoder.decode(src, max)? {
                Decoded::NeedMore if eof && (src.is_empty() || max > 0) => Err(Error::ConnectionClosed),
                other => Ok(other),
            },
            ContentDecoder::UntilClose => {
                if src.is_empty() {
                    return Ok(if eof {
                        Decoded::End(Headers::new())
                    } else {
                        Decoded::NeedMore
                    });
                }
                if max == 0 {
                    return Ok(Decoded::NeedMore);
                }
                let n = src.len().min(max);
                Ok(Decoded::Data(src.split_to(n).freeze()))
            }
        }
    }

    /// Whether the body ends only when the connection closes
    pub fn until_close(&self) -> bool {
        matches!(self, ContentDecoder::UntilClose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(decoder: &mut ContentDecoder, src: &mut BytesMut, eof: bool) -> Result<(Vec<u8>, bool)> {
        let mut body = Vec::new();
        loop {
            match decoder.decode(src, 4, eof)? {
                Decoded::Data(data) => body.extend_from_slice(&data),
                Decoded::NeedMore => return Ok((body, false)),
                Decoded::End(_) => return Ok((body, true)),
            }
        }
    }

    #[test]
    fn test_length_encoder_limits() {
        let mut encoder = ContentEncoder::new(BodyLength::Length(5)).unwrap();
        let mut dst = BytesMut::new();
        encoder.encode(b"abc", &mut dst).unwrap();
        assert!(encoder.complete(None, &mut dst).is_err());
        assert!(encoder.encode(b"def", &mut dst).is_err());
        encoder.encode(b"de", &mut dst).unwrap();
        encoder.complete(None, &mut dst).unwrap();
        assert_eq!(&dst[..], b"abcde");
        assert!(ContentEncoder::new(BodyLength::None).is_none());
    }

    #[test]
    fn test_chunked_encoder_with_trailers() {
        let mut encoder = ContentEncoder::new(BodyLength::Chunked).unwrap();
        let mut dst = BytesMut::new();
        encoder.encode(b"hello", &mut dst).unwrap();
        let trailers: Headers = [("Digest", "abc")].into_iter().collect();
        encoder.complete(Some(&trailers), &mut dst).unwrap();
        assert_eq!(&dst[..], b"5\r\nhello\r\n0\r\nDigest: abc\r\n\r\n");
        assert!(!encoder.closes_connection());
    }

    #[test]
    fn test_length_decoder() {
        let mut decoder = ContentDecoder::new(BodyLength::Length(6)).unwrap();
        let mut src = BytesMut::from(&b"hello!GET /next"[..]);
        let (body, done) = drain(&mut decoder, &mut src, false).unwrap();
        assert_eq!(body, b"hello!");
        assert!(done);
        // Bytes of the next message stay in the buffer
        assert_eq!(&src[..], b"GET /next");
    }

    #[test]
    fn test_length_decoder_truncated() {
        let mut decoder = ContentDecoder::new(BodyLength::Length(10)).unwrap();
        let mut src = BytesMut::from(&b"abc"[..]);
        assert!(matches!(
            drain(&mut decoder, &mut src, true),
            Err(Error::ConnectionClosed)
        ));
    }

    #[test]
    fn test_until_close_decoder() {
        let mut decoder = ContentDecoder::new(BodyLength::UntilClose).unwrap();
        let mut src = BytesMut::from(&b"some data"[..]);
        let (body, done) = drain(&mut decoder, &mut src, false).unwrap();
        assert_eq!(body, b"some data");
        assert!(!done);
        let (_, done) = drain(&mut decoder, &mut src, true).unwrap();
        assert!(done);
        assert!(decoder.until_close());
    }

    #[test]
    fn test_zero_capacity_reads_nothing() {
        let mut decoder = ContentDecoder::new(BodyLength::Length(3)).unwrap();
        let mut src = BytesMut::from(&b"abc"[..]);
        assert_eq!(decoder.decode(&mut src, 0, false).unwrap(), Decoded::NeedMore);
        assert_eq!(src.len(), 3);
    }

    #[test]
    fn test_chunked_decoder_truncated() {
        let mut decoder = ContentDecoder::new(BodyLength::Chunked).unwrap();
        let mut src = BytesMut::from(&b"5\r\nhel"[..]);
        assert!(matches!(
            drain(&mut decoder, &mut src, true),
            Err(Error::ConnectionClosed)
        ));
    }
}
