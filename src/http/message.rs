//! HTTP message heads
//!
//! Request and response heads are protocol independent: the HTTP/1.1 engine
//! writes them as start line plus header block, the HTTP/2 engine maps them
//! onto pseudo-headers. Bodies never live here; they stream through the
//! exchange handlers.

use super::{Error, Headers, Result, CRLF};
use bytes::{BufMut, BytesMut};
use std::fmt;
use std::str::FromStr;

/// HTTP methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
        }
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "CONNECT" => Ok(Method::Connect),
            "OPTIONS" => Ok(Method::Options),
            "TRACE" => Ok(Method::Trace),
            "PATCH" => Ok(Method::Patch),
            _ => Err(Error::InvalidMethod(s.to_string())),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol version a message was received with or will be sent as
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
    Http2,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
            Version::Http2 => "HTTP/2",
        }
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "HTTP/1.0" => Ok(Version::Http10),
            "HTTP/1.1" => Ok(Version::Http11),
            "HTTP/2" | "HTTP/2.0" => Ok(Version::Http2),
            _ => Err(Error::InvalidVersion(s.to_string())),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status {
    code: u16,
}

impl Status {
    pub const CONTINUE: Status = Status { code: 100 };
    pub const SWITCHING_PROTOCOLS: Status = Status { code: 101 };
    pub const OK: Status = Status { code: 200 };
    pub const NO_CONTENT: Status = Status { code: 204 };
    pub const NOT_MODIFIED: Status = Status { code: 304 };
    pub const BAD_REQUEST: Status = Status { code: 400 };
    pub const NOT_FOUND: Status = Status { code: 404 };
    pub const EXPECTATION_FAILED: Status = Status { code: 417 };
    pub const INTERNAL_SERVER_ERROR: Status = Status { code: 500 };
    pub const SERVICE_UNAVAILABLE: Status = Status { code: 503 };

    pub fn new(code: u16) -> Result<Self> {
        if (100..600).contains(&code) {
            Ok(Status { code })
        } else {
            Err(Error::InvalidStatus(code.to_string()))
        }
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    /// Canonical reason phrase for this code
    pub fn reason_phrase(&self) -> &'static str {
        match self.code {
            100 => "Continue",
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            204 => "No Content",
            206 => "Partial Content",
            301 => "Moved Permanently",
            302 => "Found",
            304 => "Not Modified",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            411 => "Length Required",
            413 => "Payload Too Large",
            417 => "Expectation Failed",
            431 => "Request Header Fields Too Large",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            505 => "HTTP Version Not Supported",
            _ => "Unknown",
        }
    }

    /// 1xx interim response
    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.code)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.code)
    }

    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.code)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason_phrase())
    }
}

/// Request line and header fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Method,
    /// Request target: origin form (`/path?query`) or authority form for CONNECT
    pub path: String,
    pub version: Version,
    pub headers: Headers,
    /// `:scheme` over HTTP/2; `None` on HTTP/1.1
    pub scheme: Option<String>,
    /// `:authority` over HTTP/2; HTTP/1.1 uses the `Host` header
    pub authority: Option<String>,
}

impl RequestHead {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        RequestHead {
            method,
            path: path.into(),
            version: Version::Http11,
            headers: Headers::new(),
            scheme: None,
            authority: None,
        }
    }

    /// Append a header field
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = Some(authority.into());
        self
    }

    /// Authority of the request: explicit authority or the `Host` header
    pub fn host(&self) -> Option<&str> {
        self.authority.as_deref().or_else(|| self.headers.get("Host"))
    }

    /// Whether the client asked for an interim `100 Continue`
    pub fn expects_continue(&self) -> bool {
        self.version >= Version::Http11 && self.headers.contains_token("Expect", "100-continue")
    }

    /// Write the HTTP/1.x request line and header block
    pub fn encode(&self, dst: &mut BytesMut) {
        let version = match self.version {
            Version::Http10 => Version::Http10,
            _ => Version::Http11,
        };
        dst.reserve(self.path.len() + 64);
        dst.put_slice(self.method.as_str().as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(self.path.as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(version.as_str().as_bytes());
        dst.put_slice(CRLF.as_bytes());
        encode_fields(&self.headers, dst);
    }
}

/// Status line and header fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: Version,
    pub status: Status,
    /// Reason phrase received on the wire, if it differed from the canonical one
    pub reason: Option<String>,
    pub headers: Headers,
}

impl ResponseHead {
    pub fn new(status: Status) -> Self {
        ResponseHead {
            version: Version::Http11,
            status,
            reason: None,
            headers: Headers::new(),
        }
    }

    /// Append a header field
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .unwrap_or_else(|| self.status.reason_phrase())
    }

    /// Write the HTTP/1.x status line and header block
    pub fn encode(&self, dst: &mut BytesMut) {
        let version = match self.version {
            Version::Http10 => Version::Http10,
            _ => Version::Http11,
        };
        dst.reserve(64);
        dst.put_slice(version.as_str().as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(self.status.code().to_string().as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(self.reason().as_bytes());
        dst.put_slice(CRLF.as_bytes());
        encode_fields(&self.headers, dst);
    }
}

/// Header block followed by the empty line
pub(crate) fn encode_fields(headers: &Headers, dst: &mut BytesMut) {
    for (name, value) in headers.iter() {
        dst.put_slice(name.as_bytes());
        dst.put_slice(b": ");
        dst.put_slice(value.as_bytes());
        dst.put_slice(CRLF.as_bytes());
    }
    dst.put_slice(CRLF.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parsing() {
        assert_eq!("GET".parse::<Method>().unwrap(), Method::Get);
        assert_eq!("PATCH".parse::<Method>().unwrap(), Method::Patch);
        assert!(matches!("get".parse::<Method>(), Err(Error::InvalidMethod(_))));
        assert_eq!(Method::Options.to_string(), "OPTIONS");
    }

    #[test]
    fn test_version_parsing() {
        assert_eq!("HTTP/1.0".parse::<Version>().unwrap(), Version::Http10);
        assert_eq!("HTTP/1.1".parse::<Version>().unwrap(), Version::Http11);
        assert!("HTTP/3".parse::<Version>().is_err());
        assert!(Version::Http10 < Version::Http11);
    }

    #[test]
    fn test_status() {
        assert!(Status::new(99).is_err());
        assert!(Status::new(600).is_err());
        let status = Status::new(404).unwrap();
        assert_eq!(status, Status::NOT_FOUND);
        assert!(status.is_client_error());
        assert!(Status::CONTINUE.is_informational());
        assert_eq!(Status::OK.to_string(), "200 OK");
    }

    #[test]
    fn test_request_encode() {
        let head = RequestHead::new(Method::Get, "/index.html")
            .header("Host", "example.com")
            .header("Accept", "*/*");
        let mut buf = BytesMut::new();
        head.encode(&mut buf);
        assert_eq!(
            &buf[..],
            b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n"
        );
        assert_eq!(head.host(), Some("example.com"));
    }

    #[test]
    fn test_response_encode() {
        let mut head = ResponseHead::new(Status::OK).header("Content-Length", "5");
        head.version = Version::Http2;
        let mut buf = BytesMut::new();
        head.encode(&mut buf);
        assert_eq!(&buf[..], b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n");

        head.reason = Some("Fine".to_string());
        assert_eq!(head.reason(), "Fine");
    }

    #[test]
    fn test_expects_continue() {
        let head = RequestHead::new(Method::Post, "/").header("Expect", "100-Continue");
        assert!(head.expects_continue());
        let head = head.version(Version::Http10);
        assert!(!head.expects_continue());
    }
}
