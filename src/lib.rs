//! hxcore - embeddable non-blocking HTTP engine
//!
//! This crate provides a `mio` based I/O reactor and the HTTP/1.1 and HTTP/2
//! protocol engines that run on top of it, including TLS upgrade and
//! per-connection protocol negotiation.

pub mod http;
pub mod reactor;

pub use http::{Error, Result};
