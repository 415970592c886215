//! Request/reply and publish/subscribe channels between a master and its
//! minions.
//!
//! - [`ReqChannel`] sends one sealed request and waits, with a timeout, for
//!   exactly one reply.
//! - [`ReplyServer`] answers every request it accepts exactly once, turning
//!   decode, integrity and handler failures into fault replies.
//! - [`PubServer`] and [`SubChannel`] fan events out to connected minions.
//! - [`ProcessManager`] binds a listener before forking the workers that
//!   share it.
//!
//! Channels are built from an immutable [`ChannelConfig`]. The encrypted
//! mode is the default; clear mode has to be asked for.

#[cfg(unix)]
pub mod affinity;
pub mod config;
pub mod error;
pub mod publish;
pub mod rep;
pub mod req;
pub mod shutdown;
pub mod socket;

#[cfg(unix)]
pub use affinity::{bind_then_fork, ProcessManager, WorkerContext, PANIC_EXIT_CODE};
pub use config::{
    ChannelConfig, ChannelConfigBuilder, ServerOptions, DEFAULT_CONNECT_TIMEOUT, DEFAULT_TIMEOUT,
};
pub use error::{ChannelError, Result};
pub use publish::{Broadcaster, PubServer, SubChannel, TARGETS_META};
pub use rep::{DispatchError, Handler, ReplyServer, ServerState};
pub use req::ReqChannel;
pub use shutdown::Shutdown;
pub use socket::{Inbound, RepSocket, ReqSocket};
