//! Self-describing message frames for the minionlink channel.
//!
//! Two layers live here:
//! - An outer frame: 2-byte magic ("ML"), 4-byte little-endian body length
//!   and a 2-byte little-endian frame kind.
//! - A MessagePack body holding a [`Message`]: a [`Header`] that names the
//!   crypt mode and routing metadata, and a [`Value`] payload.
//!
//! A receiver can always pick its decode and decrypt strategy from the frame
//! itself, never from out-of-band state.

pub mod codec;
pub mod error;
pub mod kind;
pub mod message;
pub mod reader;
pub mod value;
pub mod writer;

#[cfg(feature = "async")]
pub mod async_codec;

#[cfg(feature = "async")]
pub use async_codec::WireCodec;
pub use codec::{
    decode_frame, encode_frame, Frame, FrameConfig, FrameHeader, DEFAULT_MAX_PAYLOAD, HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use kind::FrameKind;
pub use message::{decode_message, encode_message, CryptMode, Fault, Header, Message};
pub use reader::{FrameReader, PendingInput};
pub use value::Value;
pub use writer::FrameWriter;
