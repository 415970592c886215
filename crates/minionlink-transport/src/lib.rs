//! Socket endpoints for the minionlink transport.
//!
//! Provides one interface over the two supported network primitives:
//! - TCP (`tcp://host:port`), the master/minion production transport
//! - Unix domain sockets (`ipc:///path`), for single-host deployments
//!
//! This is the lowest layer of minionlink. Everything else builds on top of
//! the [`WireStream`] and [`WireListener`] types provided here. The transport
//! kind is resolved once when an [`Endpoint`] is parsed, never per call.

pub mod endpoint;
pub mod error;
pub mod listener;
pub mod stream;

#[cfg(unix)]
pub mod uds;

pub use endpoint::{Endpoint, TransportKind};
pub use error::{Result, TransportError};
pub use listener::WireListener;
pub use stream::WireStream;

#[cfg(unix)]
pub use uds::UnixDomainSocket;
