//! Incremental HTTP/1.1 head parsing
//!
//! [`HeadParser`] consumes complete lines from a receive buffer and keeps the
//! partial head between calls, so it can be fed whatever the socket returned.
//! Bytes after the empty line that ends the head are left in the buffer for
//! the body decoder.

use super::{Error, Headers, Method, RequestHead, ResponseHead, Result, Status, Version};
use bytes::{Buf, BytesMut};

/// Default maximum length of one start or header line
pub const DEFAULT_MAX_LINE_LENGTH: usize = 8 * 1024;

/// Parse a `name: value` header line
pub fn parse_header_line(line: &str) -> Result<(String, String)> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| Error::InvalidHeader(line.to_string()))?;
    if name.is_empty() || !name.bytes().all(is_token_byte) {
        return Err(Error::InvalidHeader(line.to_string()));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Parse `METHOD SP target SP version`
pub fn parse_request_line(line: &str) -> Result<(Method, String, Version)> {
    let mut parts = line.split(' ');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version), None) if !target.is_empty() => {
            let version: Version = version.parse()?;
            if version == Version::Http2 {
                return Err(Error::InvalidVersion(line.to_string()));
            }
            Ok((method.parse()?, target.to_string(), version))
        }
        _ => Err(Error::Parse(format!("invalid request line: {:?}", line))),
    }
}

/// Parse `version SP code [SP reason]`
pub fn parse_status_line(line: &str) -> Result<(Version, Status, Option<String>)> {
    let mut parts = line.splitn(3, ' ');
    let version: Version = parts
        .next()
        .ok_or_else(|| Error::Parse(format!("invalid status line: {:?}", line)))?
        .parse()?;
    let code = parts
        .next()
        .filter(|code| code.len() == 3)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| Error::InvalidStatus(line.to_string()))?;
    let status = Status::new(code)?;
    let reason = parts
        .next()
        .map(str::trim)
        .filter(|reason| !reason.is_empty() && *reason != status.reason_phrase())
        .map(str::to_string);
    Ok((version, status, reason))
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// Stateful head parser
#[derive(Debug)]
pub struct HeadParser {
    max_line_length: usize,
    max_header_count: usize,
    start_line: Option<String>,
    fields: Headers,
}

impl HeadParser {
    pub fn new(max_line_length: usize, max_header_count: usize) -> Self {
        HeadParser {
            max_line_length,
            max_header_count,
            start_line: None,
            fields: Headers::new(),
        }
    }

    /// Whether part of a head has been consumed
    pub fn in_progress(&self) -> bool {
        self.start_line.is_some()
    }

    /// Drop any partial head
    pub fn reset(&mut self) {
        self.start_line = None;
        self.fields = Headers::new();
    }

    /// Parse a request head; `Ok(None)` means more bytes are needed
    pub fn parse_request(&mut self, buf: &mut BytesMut) -> Result<Option<RequestHead>> {
        let Some((line, headers)) = self.parse_head(buf)? else {
            return Ok(None);
        };
        let (method, path, version) = parse_request_line(&line)?;
        Ok(Some(RequestHead {
            method,
            path,
            version,
            headers,
            scheme: None,
            authority: None,
        }))
    }

    /// Parse a response head; `Ok(None)` means more bytes are needed
    pub fn parse_response(&mut self, buf: &mut BytesMut) -> Result<Option<ResponseHead>> {
        let Some((line, headers)) = self.parse_head(buf)? else {
            return Ok(None);
        };
        let (version, status, reason) = parse_status_line(&line)?;
        if version == Version::Http2 {
            return Err(Error::InvalidVersion(line));
        }
        Ok(Some(ResponseHead {
            version,
            status,
            reason,
            headers,
        }))
    }

    /// Parse a trailer section (header lines up to the empty line)
    pub fn parse_trailers(&mut self, buf: &mut BytesMut) -> Result<Option<Headers>> {
        if self.start_line.is_none() {
            self.start_line = Some(String::new());
        }
        if self.parse_fields(buf)? {
            let trailers = std::mem::take(&mut self.fields);
            self.reset();
            Ok(Some(trailers))
        } else {
            Ok(None)
        }
    }

    fn parse_head(&mut self, buf: &mut BytesMut) -> Result<Option<(String, Headers)>> {
        while self.start_line.is_none() {
            let Some(line) = self.next_line(buf)? else {
                return Ok(None);
            };
            // Empty lines ahead of a start line are tolerated
            if !line.is_empty() {
                self.start_line = Some(line);
            }
        }
        if !self.parse_fields(buf)? {
            return Ok(None);
        }
        let line = self.start_line.take().unwrap_or_default();
        let headers = std::mem::take(&mut self.fields);
        Ok(Some((line, headers)))
    }

    /// Consume header lines; true once the terminating empty line was seen
    fn parse_fields(&mut self, buf: &mut BytesMut) -> Result<bool> {
        loop {
            let Some(line) = self.next_line(buf)? else {
                return Ok(false);
            };
            if line.is_empty() {
                return Ok(true);
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                return Err(Error::InvalidHeader(format!("obsolete line folding: {:?}", line)));
            }
            if self.fields.len() >= self.max_header_count {
                return Err(Error::Parse(format!(
                    "more than {} header fields",
                    self.max_header_count
                )));
            }
            let (name, value) = parse_header_line(&line)?;
            self.fields.insert(name, value);
        }
    }

    fn next_line(&mut self, buf: &mut BytesMut) -> Result<Option<String>> {
        let Some(pos) = buf.iter().position(|&b| b == b'\n') else {
            if buf.len() > self.max_line_length {
                return Err(Error::Parse("line too long".to_string()));
            }
            return Ok(None);
        };
        if pos > self.max_line_length {
            return Err(Error::Parse("line too long".to_string()));
        }
        let end = if pos > 0 && buf[pos - 1] == b'\r' { pos - 1 } else { pos };
        let line = std::str::from_utf8(&buf[..end])
            .map_err(|_| Error::Parse("non UTF-8 bytes in message head".to_string()))?
            .to_string();
        buf.advance(pos + 1);
        Ok(Some(line))
    }
}

impl Default for HeadParser {
    fn default() -> Self {
        HeadParser::new(DEFAULT_MAX_LINE_LENGTH, super::MAX_HEADERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_in_pieces() {
        let mut parser = HeadParser::default();
        let mut buf = BytesMut::from(&b"GET /index.html HT"[..]);
        assert!(parser.parse_request(&mut buf).unwrap().is_none());
        assert!(!parser.in_progress());

        buf.extend_from_slice(b"TP/1.1\r\nHost: example.com\r\nAccept:  */* \r\n");
        assert!(parser.parse_request(&mut buf).unwrap().is_none());
        assert!(parser.in_progress());

        buf.extend_from_slice(b"\r\nbody");
        let head = parser.parse_request(&mut buf).unwrap().unwrap();
        assert_eq!(head.method, Method::Get);
        assert_eq!(head.path, "/index.html");
        assert_eq!(head.version, Version::Http11);
        assert_eq!(head.headers.get("host"), Some("example.com"));
        assert_eq!(head.headers.get("accept"), Some("*/*"));
        assert_eq!(&buf[..], b"body");
        assert!(!parser.in_progress());
    }

    #[test]
    fn test_parse_response() {
        let mut parser = HeadParser::default();
        let mut buf = BytesMut::from(&b"\r\nHTTP/1.0 404 Gone Away\r\nContent-Length: 0\r\n\r\n"[..]);
        let head = parser.parse_response(&mut buf).unwrap().unwrap();
        assert_eq!(head.version, Version::Http10);
        assert_eq!(head.status, Status::NOT_FOUND);
        assert_eq!(head.reason(), "Gone Away");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_bare_lf_lines() {
        let mut parser = HeadParser::default();
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\nX: y\n\n"[..]);
        let head = parser.parse_response(&mut buf).unwrap().unwrap();
        assert_eq!(head.status, Status::OK);
        assert_eq!(head.reason, None);
        assert_eq!(head.headers.get("x"), Some("y"));
    }

    #[test]
    fn test_malformed_heads() {
        let cases: &[&[u8]] = &[
            b"GET /\r\n\r\n",
            b"FETCH / HTTP/1.1\r\n\r\n",
            b"GET / HTTP/9.9\r\n\r\n",
            b"GET / HTTP/1.1\r\nNo colon here\r\n\r\n",
            b"GET / HTTP/1.1\r\nBad Name: x\r\n\r\n",
            b"GET / HTTP/1.1\r\nA: b\r\n folded\r\n\r\n",
        ];
        for case in cases {
            let mut parser = HeadParser::default();
            let mut buf = BytesMut::from(*case);
            assert!(parser.parse_request(&mut buf).is_err(), "{:?}", case);
        }

        let mut parser = HeadParser::default();
        let mut buf = BytesMut::from(&b"HTTP/1.1 2000 OK\r\n\r\n"[..]);
        assert!(parser.parse_response(&mut buf).is_err());
    }

    #[test]
    fn test_limits() {
        let mut parser = HeadParser::new(16, 2);
        let mut buf = BytesMut::from(&b"GET /a-very-long-path HTTP/1.1\r\n"[..]);
        assert!(parser.parse_request(&mut buf).is_err());

        let mut parser = HeadParser::new(16, 2);
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nA: 1\r\nB: 2\r\nC: 3\r\n\r\n"[..]);
        assert!(parser.parse_request(&mut buf).is_err());

        let mut parser = HeadParser::new(16, 2);
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1 and then some"[..]);
        assert!(parser.parse_request(&mut buf).is_err());
    }

    #[test]
    fn test_trailers() {
        let mut parser = HeadParser::default();
        let mut buf = BytesMut::from(&b"Checksum: abc\r\n"[..]);
        assert!(parser.parse_trailers(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\r\n");
        let trailers = parser.parse_trailers(&mut buf).unwrap().unwrap();
        assert_eq!(trailers.get("checksum"), Some("abc"));
        assert!(!parser.in_progress());
    }
}
