//! Chunked transfer coding
//!
//! Incremental encoder and decoder for `Transfer-Encoding: chunked` bodies,
//! including the trailer section that may follow the last chunk.

use super::parser::HeadParser;
use super::{Error, Headers, Result, CRLF};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Longest chunk-size line accepted, extensions included
const MAX_SIZE_LINE: usize = 1024;

/// Write one chunk; empty data writes nothing since a zero chunk ends the body
pub fn encode_chunk(data: &[u8], dst: &mut BytesMut) {
    if data.is_empty() {
        return;
    }
    dst.reserve(data.len() + 12);
    dst.put_slice(format!("{:x}", data.len()).as_bytes());
    dst.put_slice(CRLF.as_bytes());
    dst.put_slice(data);
    dst.put_slice(CRLF.as_bytes());
}

/// Write the last chunk and the trailer section
pub fn encode_last_chunk(trailers: Option<&Headers>, dst: &mut BytesMut) {
    dst.put_slice(b"0\r\n");
    if let Some(trailers) = trailers {
        for (name, value) in trailers.iter() {
            dst.put_slice(name.as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(value.as_bytes());
            dst.put_slice(CRLF.as_bytes());
        }
    }
    dst.put_slice(CRLF.as_bytes());
}

/// Output of one [`ChunkedDecoder::decode`] step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// Body bytes
    Data(Bytes),
    /// The input is exhausted mid-body
    NeedMore,
    /// Last chunk and trailers seen; the body is complete
    End(Headers),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
    Done,
}

/// Chunked body decoder
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: State,
    trailers: HeadParser,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        ChunkedDecoder {
            state: State::Size,
            trailers: HeadParser::default(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Done
    }

    /// Decode from `src`, returning at most `max` body bytes
    pub fn decode(&mut self, src: &mut BytesMut, max: usize) -> Result<Decoded> {
        loop {
            match self.state {
                State::Size => {
                    let Some(pos) = src.iter().position(|&b| b == b'\n') else {
                        if src.len() > MAX_SIZE_LINE {
                            return Err(Error::InvalidChunkSize("chunk size line too long".to_string()));
                        }
                        return Ok(Decoded::NeedMore);
                    };
                    let size = parse_size_line(&src[..pos])?;
                    src.advance(pos + 1);
                    self.state = if size == 0 {
                        State::Trailers
                    } else {
                        State::Data(size)
                    };
                }
                State::Data(remaining) => {
                    if src.is_empty() || max == 0 {
                        return Ok(Decoded::NeedMore);
                    }
                    let n = (remaining.min(src.len() as u64) as usize).min(max);
                    let data = src.split_to(n).freeze();
                    let left = remaining - n as u64;
                    self.state = if left == 0 { State::DataEnd } else { State::Data(left) };
                    return Ok(Decoded::Data(data));
                }
                State::DataEnd => {
                    if src.len() < 2 {
                        if src.first().map_or(false, |&b| b != b'\r' && b != b'\n') {
                            return Err(Error::Protocol("missing CRLF after chunk data".to_string()));
                        }
                        if src.first() == Some(&b'\n') {
                            src.advance(1);
                            self.state = State::Size;
                            continue;
                        }
                        return Ok(Decoded::NeedMore);
                    }
                    if &src[..2] == b"\r\n" {
                        src.advance(2);
                    } else if src[0] == b'\n' {
                        src.advance(1);
                    } else {
                        return Err(Error::Protocol("missing CRLF after chunk data".to_string()));
                    }
                    self.state = State::Size;
                }
                State::Trailers => match self.trailers.parse_trailers(src)? {
                    Some(trailers) => {
                        self.state = State::Done;
                        return Ok(Decoded::End(trailers));
                    }
                    None => return Ok(Decoded::NeedMore),
                },
                State::Done => return Ok(Decoded::End(Headers::new())),
            }
        }
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_size_line(line: &[u8]) -> Result<u64> {
    let line = std::str::from_utf8(line)
        .map_err(|_| Error::InvalidChunkSize("non UTF-8 chunk size".to_string()))?;
    let size = line.split(';').next().unwrap_or("").trim();
    if size.is_empty() || size.len() > 16 {
        return Err(Error::InvalidChunkSize(size.to_string()));
    }
    u64::from_str_radix(size, 16).map_err(|_| Error::InvalidChunkSize(size.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut ChunkedDecoder, src: &mut BytesMut, max: usize) -> (Vec<u8>, Option<Headers>) {
        let mut body = Vec::new();
        loop {
            match decoder.decode(src, max).unwrap() {
                Decoded::Data(data) => body.extend_from_slice(&data),
                Decoded::NeedMore => return (body, None),
                Decoded::End(trailers) => return (body, Some(trailers)),
            }
        }
    }

    #[test]
    fn test_encode() {
        let mut buf = BytesMut::new();
        encode_chunk(b"Hello", &mut buf);
        encode_chunk(b"", &mut buf);
        encode_chunk(&[b'x'; 26], &mut buf);
        encode_last_chunk(None, &mut buf);
        assert_eq!(
            &buf[..],
            &b"5\r\nHello\r\n1a\r\nxxxxxxxxxxxxxxxxxxxxxxxxxx\r\n0\r\n\r\n"[..]
        );

        let mut trailers = Headers::new();
        trailers.insert("Checksum", "42");
        let mut buf = BytesMut::new();
        encode_last_chunk(Some(&trailers), &mut buf);
        assert_eq!(&buf[..], b"0\r\nChecksum: 42\r\n\r\n");
    }

    #[test]
    fn test_decode_with_trailers() {
        let mut decoder = ChunkedDecoder::new();
        let mut src = BytesMut::from(&b"5;ext=1\r\nHello\r\n6\r\n World\r\n0\r\nExpires: never\r\n\r\nNEXT"[..]);
        let (body, trailers) = decode_all(&mut decoder, &mut src, usize::MAX);
        assert_eq!(body, b"Hello World");
        assert_eq!(trailers.unwrap().get("expires"), Some("never"));
        assert!(decoder.is_complete());
        assert_eq!(&src[..], b"NEXT");
    }

    #[test]
    fn test_decode_byte_by_byte() {
        let wire = b"3\r\nabc\r\n10\r\n0123456789abcdef\r\n0\r\n\r\n";
        let mut decoder = ChunkedDecoder::new();
        let mut src = BytesMut::new();
        let mut body = Vec::new();
        let mut done = false;
        for &b in wire.iter() {
            src.put_u8(b);
            let (data, end) = decode_all(&mut decoder, &mut src, 4);
            body.extend_from_slice(&data);
            done |= end.is_some();
        }
        assert!(done);
        assert_eq!(body, b"abc0123456789abcdef");
    }

    #[test]
    fn test_decode_respects_max() {
        let mut decoder = ChunkedDecoder::new();
        let mut src = BytesMut::from(&b"a\r\n0123456789\r\n0\r\n\r\n"[..]);
        assert_eq!(decoder.decode(&mut src, 4).unwrap(), Decoded::Data(Bytes::from_static(b"0123")));
        assert_eq!(decoder.decode(&mut src, 0).unwrap(), Decoded::NeedMore);
        assert_eq!(decoder.decode(&mut src, 100).unwrap(), Decoded::Data(Bytes::from_static(b"456789")));
        assert!(matches!(decoder.decode(&mut src, 100).unwrap(), Decoded::End(t) if t.is_empty()));
    }

    #[test]
    fn test_decode_errors() {
        let mut decoder = ChunkedDecoder::new();
        let mut src = BytesMut::from(&b"zz\r\n"[..]);
        assert!(matches!(decoder.decode(&mut src, 10), Err(Error::InvalidChunkSize(_))));

        let mut decoder = ChunkedDecoder::new();
        let mut src = BytesMut::from(&b"2\r\nabXY"[..]);
        assert!(matches!(decoder.decode(&mut src, 10), Ok(Decoded::Data(_))));
        assert!(decoder.decode(&mut src, 10).is_err());

        let mut decoder = ChunkedDecoder::new();
        let mut src = BytesMut::from(&b"fffffffffffffffff\r\n"[..]);
        assert!(decoder.decode(&mut src, 10).is_err());
    }
}
