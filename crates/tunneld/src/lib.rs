//! A multi-rule TCP tunneling reverse proxy.
//!
//! The program accepts client connections on configured local endpoints and
//! transparently forwards every byte, in both directions, to a configured
//! remote endpoint. One process runs any number of independent forwarding
//! rules concurrently: each rule gets its own [`listener::Listener`], and
//! each accepted connection becomes a [`session::Session`] spliced over two
//! fixed 8 KiB buffers, one per direction.
//!
//! The [`proxy::ProxyEngine`] validates the configured rules, owns the
//! listeners, and retires listeners and sessions as they terminate. Payload
//! bytes are never parsed, rewritten, or inspected.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod listener;
pub mod logging;
pub mod mode;
pub mod proxy;
pub mod resolver;
pub mod session;
pub mod utils;

pub use config::Config;
pub use proxy::ProxyEngine;
