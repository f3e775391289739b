//! HTTP/2 error types
//!
//! Every error maps to one of the error codes of RFC 7540 Section 7, which is
//! what goes on the wire in RST_STREAM and GOAWAY frames.

use std::fmt;

/// HTTP/2 errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Protocol error detected (PROTOCOL_ERROR)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Internal error (INTERNAL_ERROR)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Flow control error (FLOW_CONTROL_ERROR)
    #[error("Flow control error: {0}")]
    FlowControl(String),

    /// Frame received for a closed stream (STREAM_CLOSED)
    #[error("Stream closed: {0}")]
    StreamClosed(u32),

    /// Frame size error (FRAME_SIZE_ERROR)
    #[error("Frame size error: {0}")]
    FrameSize(String),

    /// Stream refused before any processing (REFUSED_STREAM)
    #[error("Refused stream: {0}")]
    RefusedStream(u32),

    /// Header block could not be decompressed (COMPRESSION_ERROR)
    #[error("Compression error: {0}")]
    Compression(String),

    /// Invalid SETTINGS value; PROTOCOL_ERROR, or FLOW_CONTROL_ERROR for the window size
    #[error("Invalid settings value: {0}")]
    InvalidSettings(String),

    /// Malformed header block
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// The client did not open with the connection preface
    #[error("Missing connection preface")]
    MissingPreface,

    /// The peer reset a stream
    #[error("Stream {stream} reset by peer: {code}")]
    Reset { stream: u32, code: ErrorCode },

    /// The peer shut the connection down
    #[error("Connection shut down by peer: {code} (last stream {last_stream_id})")]
    GoAway { last_stream_id: u32, code: ErrorCode },
}

impl Error {
    /// Error code sent to the peer for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Protocol(_) | Error::InvalidHeader(_) | Error::MissingPreface => ErrorCode::ProtocolError,
            Error::Internal(_) => ErrorCode::InternalError,
            Error::FlowControl(_) => ErrorCode::FlowControlError,
            Error::StreamClosed(_) => ErrorCode::StreamClosed,
            Error::FrameSize(_) => ErrorCode::FrameSizeError,
            Error::RefusedStream(_) => ErrorCode::RefusedStream,
            Error::Compression(_) => ErrorCode::CompressionError,
            Error::InvalidSettings(_) => ErrorCode::ProtocolError,
            Error::Reset { code, .. } | Error::GoAway { code, .. } => *code,
        }
    }
}

/// HTTP/2 error codes as defined in RFC 7540 Section 7
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    /// Graceful shutdown
    NoError = 0x0,
    /// Protocol error detected
    ProtocolError = 0x1,
    /// Implementation fault
    InternalError = 0x2,
    /// Flow-control limits exceeded
    FlowControlError = 0x3,
    /// Settings not acknowledged
    SettingsTimeout = 0x4,
    /// Frame received for closed stream
    StreamClosed = 0x5,
    /// Frame size incorrect
    FrameSizeError = 0x6,
    /// Stream not processed
    RefusedStream = 0x7,
    /// Stream cancelled
    Cancel = 0x8,
    /// Compression state not updated
    CompressionError = 0x9,
    /// TCP connection error for CONNECT method
    ConnectError = 0xa,
    /// Processing capacity exceeded
    EnhanceYourCalm = 0xb,
    /// Negotiated TLS parameters not acceptable
    InadequateSecurity = 0xc,
    /// Use HTTP/1.1 for the request
    Http11Required = 0xd,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            0x0 => Some(ErrorCode::NoError),
            0x1 => Some(ErrorCode::ProtocolError),
            0x2 => Some(ErrorCode::InternalError),
            0x3 => Some(ErrorCode::FlowControlError),
            0x4 => Some(ErrorCode::SettingsTimeout),
            0x5 => Some(ErrorCode::StreamClosed),
            0x6 => Some(ErrorCode::FrameSizeError),
            0x7 => Some(ErrorCode::RefusedStream),
            0x8 => Some(ErrorCode::Cancel),
            0x9 => Some(ErrorCode::CompressionError),
            0xa => Some(ErrorCode::ConnectError),
            0xb => Some(ErrorCode::EnhanceYourCalm),
            0xc => Some(ErrorCode::InadequateSecurity),
            0xd => Some(ErrorCode::Http11Required),
            _ => None,
        }
    }

    /// Map a code received from the peer; unknown codes count as INTERNAL_ERROR
    pub fn from_wire(code: u32) -> Self {
        Self::from_u32(code).unwrap_or(ErrorCode::InternalError)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u32())
    }
}

/// Result type for HTTP/2 operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_conversion() {
        assert_eq!(ErrorCode::NoError.as_u32(), 0x0);
        assert_eq!(ErrorCode::ProtocolError.as_u32(), 0x1);
        assert_eq!(ErrorCode::Http11Required.as_u32(), 0xd);

        assert_eq!(ErrorCode::from_u32(0x0), Some(ErrorCode::NoError));
        assert_eq!(ErrorCode::from_u32(0x1), Some(ErrorCode::ProtocolError));
        assert_eq!(ErrorCode::from_u32(0xff), None);
        assert_eq!(ErrorCode::from_wire(0xff), ErrorCode::InternalError);
    }

    #[test]
    fn test_error_codes_on_wire() {
        assert_eq!(Error::FrameSize("x".into()).code(), ErrorCode::FrameSizeError);
        assert_eq!(Error::RefusedStream(3).code(), ErrorCode::RefusedStream);
        assert_eq!(Error::MissingPreface.code(), ErrorCode::ProtocolError);
        let reset = Error::Reset {
            stream: 5,
            code: ErrorCode::Cancel,
        };
        assert_eq!(reset.code(), ErrorCode::Cancel);
    }

    #[test]
    fn test_error_display() {
        let err = Error::Protocol("test error".to_string());
        assert_eq!(err.to_string(), "Protocol error: test error");

        let err = Error::StreamClosed(42);
        assert_eq!(err.to_string(), "Stream closed: 42");

        let err = Error::GoAway {
            last_stream_id: 7,
            code: ErrorCode::NoError,
        };
        assert_eq!(err.to_string(), "Connection shut down by peer: NO_ERROR (0x0) (last stream 7)");
    }
}
