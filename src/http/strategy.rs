//! Message framing and connection reuse policies
//!
//! The HTTP/1.1 duplexer delegates two decisions: how long a message body is,
//! and whether the connection may carry another exchange once this one is
//! done. The defaults follow RFC 7230.

use super::{Error, Headers, Method, RequestHead, ResponseHead, Result, Status, Version};

/// How the body of a message is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    /// No body at all
    None,
    /// Exactly this many bytes
    Length(u64),
    /// Chunked transfer coding
    Chunked,
    /// Everything until the connection closes (responses only)
    UntilClose,
}

/// Which message a body length is determined for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    /// Response to a request with the given method
    Response { method: Method, status: Status },
}

pub trait ContentLengthStrategy: Send + Sync {
    fn determine(&self, headers: &Headers, kind: MessageKind) -> Result<BodyLength>;
}

pub trait ConnectionReuseStrategy: Send + Sync {
    /// Whether the connection may be reused once this exchange completes
    fn keep_alive(&self, request: &RequestHead, response: &ResponseHead) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultContentLengthStrategy;

impl ContentLengthStrategy for DefaultContentLengthStrategy {
    fn determine(&self, headers: &Headers, kind: MessageKind) -> Result<BodyLength> {
        if let MessageKind::Response { method, status } = kind {
            if method == Method::Head
                || status.is_informational()
                || status == Status::NO_CONTENT
                || status == Status::NOT_MODIFIED
                || (method == Method::Connect && status.is_success())
            {
                return Ok(BodyLength::None);
            }
        }

        if headers.contains("Transfer-Encoding") {
            let last = headers.tokens("Transfer-Encoding").last();
            return match (last, kind) {
                (Some(coding), _) if coding.eq_ignore_ascii_case("chunked") => Ok(BodyLength::Chunked),
                (_, MessageKind::Request) => Err(Error::Protocol(
                    "request transfer coding does not end with chunked".to_string(),
                )),
                (_, MessageKind::Response { .. }) => Ok(BodyLength::UntilClose),
            };
        }

        let lengths = headers.get_all("Content-Length");
        if let Some(first) = lengths.first() {
            if lengths.iter().any(|value| value != first) {
                return Err(Error::Protocol("conflicting Content-Length values".to_string()));
            }
            let length = first
                .parse::<u64>()
                .map_err(|_| Error::Protocol(format!("invalid Content-Length: {}", first)))?;
            return Ok(if length == 0 {
                BodyLength::None
            } else {
                BodyLength::Length(length)
            });
        }

        Ok(match kind {
            MessageKind::Request => BodyLength::None,
            MessageKind::Response { .. } => BodyLength::UntilClose,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConnectionReuseStrategy;

impl ConnectionReuseStrategy for DefaultConnectionReuseStrategy {
    fn keep_alive(&self, request: &RequestHead, response: &ResponseHead) -> bool {
        if request.headers.contains_token("Connection", "close")
            || response.headers.contains_token("Connection", "close")
        {
            return false;
        }

        let framing = DefaultContentLengthStrategy.determine(
            &response.headers,
            MessageKind::Response {
                method: request.method,
                status: response.status,
            },
        );
        if !matches!(
            framing,
            Ok(BodyLength::None | BodyLength::Length(_) | BodyLength::Chunked)
        ) {
            return false;
        }

        if request.version == Version::Http10
            && !request.headers.contains_token("Connection", "keep-alive")
        {
            return false;
        }
        if response.version == Version::Http10 {
            return response.headers.contains_token("Connection", "keep-alive");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(fields: &[(&str, &str)]) -> Headers {
        fields.iter().copied().collect()
    }

    fn response_to(method: Method, status: Status) -> MessageKind {
        MessageKind::Response { method, status }
    }

    #[test]
    fn test_content_length() {
        let strategy = DefaultContentLengthStrategy;
        let get = response_to(Method::Get, Status::OK);

        assert_eq!(
            strategy.determine(&headers(&[("Content-Length", "5")]), get).unwrap(),
            BodyLength::Length(5)
        );
        assert_eq!(
            strategy.determine(&headers(&[("Content-Length", "0")]), MessageKind::Request).unwrap(),
            BodyLength::None
        );
        assert_eq!(
            strategy
                .determine(&headers(&[("Content-Length", "7"), ("content-length", "7")]), get)
                .unwrap(),
            BodyLength::Length(7)
        );
        assert!(strategy
            .determine(&headers(&[("Content-Length", "7"), ("Content-Length", "8")]), get)
            .is_err());
        assert!(strategy.determine(&headers(&[("Content-Length", "-1")]), get).is_err());
    }

    #[test]
    fn test_transfer_encoding() {
        let strategy = DefaultContentLengthStrategy;
        let get = response_to(Method::Get, Status::OK);
        let chunked = headers(&[("Transfer-Encoding", "gzip, chunked"), ("Content-Length", "3")]);
        assert_eq!(strategy.determine(&chunked, get).unwrap(), BodyLength::Chunked);

        let gzip = headers(&[("Transfer-Encoding", "gzip")]);
        assert_eq!(strategy.determine(&gzip, get).unwrap(), BodyLength::UntilClose);
        assert!(strategy.determine(&gzip, MessageKind::Request).is_err());
    }

    #[test]
    fn test_bodiless_responses() {
        let strategy = DefaultContentLengthStrategy;
        let with_length = headers(&[("Content-Length", "10")]);
        for kind in [
            response_to(Method::Head, Status::OK),
            response_to(Method::Get, Status::NO_CONTENT),
            response_to(Method::Get, Status::NOT_MODIFIED),
            response_to(Method::Get, Status::CONTINUE),
        ] {
            assert_eq!(strategy.determine(&with_length, kind).unwrap(), BodyLength::None);
        }
        assert_eq!(
            strategy.determine(&Headers::new(), response_to(Method::Get, Status::OK)).unwrap(),
            BodyLength::UntilClose
        );
        assert_eq!(
            strategy.determine(&Headers::new(), MessageKind::Request).unwrap(),
            BodyLength::None
        );
    }

    #[test]
    fn test_reuse() {
        let strategy = DefaultConnectionReuseStrategy;
        let request = RequestHead::new(Method::Get, "/");
        let response = ResponseHead::new(Status::OK).header("Content-Length", "5");
        assert!(strategy.keep_alive(&request, &response));

        let close = request.clone().header("Connection", "close");
        assert!(!strategy.keep_alive(&close, &response));

        let delimited = ResponseHead::new(Status::OK);
        assert!(!strategy.keep_alive(&request, &delimited));

        let mut old = response.clone();
        old.version = Version::Http10;
        assert!(!strategy.keep_alive(&request, &old));
        assert!(strategy.keep_alive(&request, &old.header("Connection", "Keep-Alive")));

        let old_request = request.version(Version::Http10);
        assert!(!strategy.keep_alive(&old_request, &response));
    }
}
