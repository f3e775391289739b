//! HTTP/1.1 protocol engine
//!
//! The duplexers run one exchange at a time over a session, streaming the
//! request and response bodies in both directions at once:
//!
//! - [`ClientHttp1Duplexer`] takes exchanges from the session's command queue
//! - [`ServerHttp1Duplexer`] creates an exchange for every parsed request
//!
//! Both sides parse heads with [`HeadParser`](crate::http::parser::HeadParser),
//! frame bodies with the codecs in [`content`] and delegate framing and
//! keep-alive decisions to the configured strategies.

pub mod client;
pub mod content;
pub mod server;

pub use client::ClientHttp1Duplexer;
pub use content::{ContentDecoder, ContentEncoder};
pub use server::ServerHttp1Duplexer;

use crate::http::parser::{HeadParser, DEFAULT_MAX_LINE_LENGTH};
use crate::http::MAX_HEADERS;
use std::time::Duration;

/// HTTP/1.1 engine settings
#[derive(Debug, Clone)]
pub struct H1Config {
    /// Size of one socket read and the outbound buffer high-water mark
    pub buffer_size: usize,
    pub max_line_length: usize,
    pub max_header_count: usize,
    /// Start the next request as soon as the previous one is fully written
    pub pipelining: bool,
    /// How long a client waits for `100 Continue` before sending the body anyway
    pub wait_for_continue: Duration,
}

impl Default for H1Config {
    fn default() -> Self {
        H1Config {
            buffer_size: 8 * 1024,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            max_header_count: MAX_HEADERS,
            pipelining: false,
            wait_for_continue: Duration::from_secs(3),
        }
    }
}

impl H1Config {
    pub fn builder() -> H1ConfigBuilder {
        H1ConfigBuilder {
            config: H1Config::default(),
        }
    }

    pub(crate) fn head_parser(&self) -> HeadParser {
        HeadParser::new(self.max_line_length, self.max_header_count)
    }
}

/// Builder for [`H1Config`]
#[derive(Debug, Clone)]
pub struct H1ConfigBuilder {
    config: H1Config,
}

impl H1ConfigBuilder {
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size.max(256);
        self
    }

    pub fn max_line_length(mut self, length: usize) -> Self {
        self.config.max_line_length = length;
        self
    }

    pub fn max_header_count(mut self, count: usize) -> Self {
        self.config.max_header_count = count;
        self
    }

    pub fn pipelining(mut self, enabled: bool) -> Self {
        self.config.pipelining = enabled;
        self
    }

    pub fn wait_for_continue(mut self, wait: Duration) -> Self {
        self.config.wait_for_continue = wait;
        self
    }

    pub fn build(self) -> H1Config {
        self.config
    }
}
