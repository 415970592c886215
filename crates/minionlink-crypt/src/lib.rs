//! Payload envelopes for minionlink messages.
//!
//! An [`Envelope`] seals a payload into a [`minionlink_frame::Message`] and
//! opens it again. The crypt mode is always written into the message header,
//! so the receiver never has to guess how a payload was protected.

pub mod envelope;
pub mod error;
pub mod key;

pub use envelope::Envelope;
pub use error::{CryptError, Result};
pub use key::{KeyMaterial, KEY_LEN};
pub use minionlink_frame::CryptMode;
