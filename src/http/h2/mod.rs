//! HTTP/2 protocol implementation
//!
//! The [`H2Multiplexer`] runs any number of concurrent exchanges over one
//! session, in either the client or the server role. It is built from the
//! pieces in the submodules:
//!
//! - **Frames**: all frame types of RFC 7540 Section 6, decoded incrementally
//!   by [`FrameCodec`](codec::FrameCodec)
//! - **HPACK**: header compression through the `hpack` crate
//! - **Flow control**: connection and stream windows in both directions
//! - **Streams**: the RFC 7540 state machine and a table bounded by
//!   SETTINGS_MAX_CONCURRENT_STREAMS
//! - **Settings**: exchanged and acknowledged on connection start
//!
//! Server push is not supported: SETTINGS_ENABLE_PUSH is always advertised
//! as 0 and a PUSH_PROMISE from the peer is a connection error.
//!
//! # Example
//!
//! ```no_run
//! use hxcore::http::h2::{H2Config, H2Multiplexer};
//! use hxcore::http::support::RequestHandlerFactory;
//! use hxcore::http::{ResponseHead, Status};
//! use std::sync::Arc;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = H2Config::builder()
//!     .max_concurrent_streams(50)
//!     .initial_window_size(1 << 20)
//!     .build()?;
//!
//! let handlers = RequestHandlerFactory::new(|_, _| (ResponseHead::new(Status::OK), b"hello".to_vec()));
//! let server = H2Multiplexer::server(config, Arc::new(handlers));
//! # let _ = server;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod header_encoder;
pub mod multiplexer;
pub mod settings;
pub mod stream;

pub use codec::FrameCodec;
pub use error::{Error, ErrorCode, Result};
pub use frames::{Frame, FrameFlags, FrameType};
pub use multiplexer::H2Multiplexer;
pub use settings::{Settings, SettingsBuilder};
pub use stream::{StreamId, StreamState};

/// HTTP/2 connection preface that must be sent by clients
///
/// From RFC 7540 Section 3.5:
/// "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default initial window size (65535 bytes)
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

/// Default maximum frame size (16384 bytes)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Default header table size (4096 bytes)
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// Maximum stream ID value (2^31 - 1)
pub const MAX_STREAM_ID: u32 = 0x7FFF_FFFF;

/// Largest flow control window (2^31 - 1)
pub const MAX_WINDOW_SIZE: u32 = 0x7FFF_FFFF;

/// Stream ID 0 (connection-level)
pub const CONNECTION_STREAM_ID: u32 = 0;

/// HTTP/2 engine settings
///
/// `settings` is what this endpoint advertises in its SETTINGS frame. The
/// HPACK table stays at its default size of 4096 bytes.
#[derive(Debug, Clone)]
pub struct H2Config {
    pub settings: Settings,
    /// Size of one socket read and the outbound buffer high-water mark
    pub buffer_size: usize,
}

impl Default for H2Config {
    fn default() -> Self {
        H2Config {
            settings: Settings {
                enable_push: Some(false),
                max_concurrent_streams: Some(100),
                initial_window_size: Some(DEFAULT_INITIAL_WINDOW_SIZE),
                max_frame_size: Some(DEFAULT_MAX_FRAME_SIZE),
                ..Settings::default()
            },
            buffer_size: 64 * 1024,
        }
    }
}

impl H2Config {
    pub fn builder() -> H2ConfigBuilder {
        H2ConfigBuilder {
            config: H2Config::default(),
        }
    }

    pub(crate) fn max_concurrent_streams(&self) -> Option<u32> {
        self.settings.get_max_concurrent_streams()
    }

    pub(crate) fn initial_window_size(&self) -> u32 {
        self.settings.get_initial_window_size()
    }

    pub(crate) fn max_frame_size(&self) -> u32 {
        self.settings.get_max_frame_size()
    }
}

/// Builder for [`H2Config`]
#[derive(Debug, Clone)]
pub struct H2ConfigBuilder {
    config: H2Config,
}

impl H2ConfigBuilder {
    /// Streams the peer may open concurrently
    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.config.settings.max_concurrent_streams = Some(max);
        self
    }

    /// Receive window of every stream
    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.config.settings.initial_window_size = Some(size);
        self
    }

    /// Largest frame payload accepted from the peer
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.config.settings.max_frame_size = Some(size);
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size.max(1024);
        self
    }

    /// Build the configuration, rejecting out-of-range settings
    pub fn build(mut self) -> Result<H2Config> {
        self.config.settings.enable_push = Some(false);
        self.config.settings.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = H2Config::default();
        assert_eq!(config.settings.enable_push, Some(false));
        assert_eq!(config.max_concurrent_streams(), Some(100));
        assert_eq!(config.initial_window_size(), 65535);
        assert_eq!(config.max_frame_size(), 16384);
    }

    #[test]
    fn test_builder_validates() {
        let config = H2Config::builder()
            .max_concurrent_streams(3)
            .initial_window_size(1 << 20)
            .max_frame_size(32 * 1024)
            .buffer_size(10)
            .build()
            .unwrap();
        assert_eq!(config.max_concurrent_streams(), Some(3));
        assert_eq!(config.initial_window_size(), 1 << 20);
        assert_eq!(config.buffer_size, 1024);

        assert!(H2Config::builder().max_frame_size(100).build().is_err());
        assert!(H2Config::builder().initial_window_size(u32::MAX).build().is_err());
    }
}
