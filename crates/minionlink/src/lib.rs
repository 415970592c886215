//! Encrypted request/reply and publish/subscribe transport between a master
//! and its minions.
//!
//! # Crate Structure
//!
//! - [`transport`]: TCP and Unix socket endpoints, listeners and streams
//! - [`frame`]: the outer wire frame and MessagePack message bodies
//! - [`crypt`]: clear and AES-256-GCM payload envelopes
//! - [`channel`]: request/reply and publish/subscribe channels, and the
//!   bind-before-fork process manager
//!
//! The types most callers need are re-exported at the crate root.
//!
//! ```no_run
//! use std::time::Duration;
//! use minionlink::{ChannelConfig, KeyMaterial, ReqChannel, Value};
//!
//! # fn main() -> minionlink::channel::Result<()> {
//! let key = KeyMaterial::from_hex(&std::env::var("MINIONLINK_KEY").unwrap_or_default())?;
//! let config = ChannelConfig::builder("tcp://salt.example.net:4506", "web-01")
//!     .key(key)
//!     .build()?;
//! let mut channel = ReqChannel::new(config)?;
//! let reply = channel.send(Value::map([("cmd", "ping")]), Duration::from_secs(5))?;
//! println!("{reply:?}");
//! # Ok(())
//! # }
//! ```

/// Re-export transport types.
pub mod transport {
    pub use minionlink_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use minionlink_frame::*;
}

/// Re-export envelope types.
pub mod crypt {
    pub use minionlink_crypt::*;
}

/// Re-export channel types.
pub mod channel {
    pub use minionlink_channel::*;
}

#[cfg(unix)]
pub use minionlink_channel::{bind_then_fork, ProcessManager, WorkerContext};
pub use minionlink_channel::{
    ChannelConfig, ChannelError, DispatchError, Handler, PubServer, ReplyServer, ReqChannel,
    ServerOptions, Shutdown, SubChannel,
};
pub use minionlink_crypt::{CryptMode, Envelope, KeyMaterial};
pub use minionlink_frame::{Fault, Value};
pub use minionlink_transport::{Endpoint, WireListener};
