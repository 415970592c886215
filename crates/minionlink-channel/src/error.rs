use std::time::Duration;

use minionlink_crypt::CryptError;
use minionlink_frame::{Fault, FrameError};
use minionlink_transport::TransportError;

/// Errors surfaced by channels, servers and the process manager.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// A payload could not be encoded for the wire.
    #[error("encode error: {0}")]
    Encode(String),

    /// Wire data was truncated or malformed.
    #[error("decode error: {0}")]
    Decode(String),

    /// Envelope verification failed or the crypt mode did not match.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// The listen address is already taken.
    #[error("bind error on {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// The strict one-request/one-reply alternation was broken.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// No reply (or event) arrived in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Transport-level failure: refused, reset or closed.
    #[error("connection error: {0}")]
    Connection(String),

    /// Workers did not exit within the grace period and were force-killed.
    #[error("{remaining} worker(s) still running after {waited:?}, force-killed")]
    ShutdownTimeout { remaining: usize, waited: Duration },

    /// The server answered with an error reply.
    #[error("remote {fault} fault: {message}")]
    Remote { fault: Fault, message: String },

    /// Invalid channel or server configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// fork/kill/waitpid failed.
    #[error("process error: {0}")]
    Process(#[source] std::io::Error),
}

impl ChannelError {
    /// True if the request may be retried on a fresh connection.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChannelError::Timeout(_) | ChannelError::Connection(_))
    }
}

impl From<TransportError> for ChannelError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Bind { endpoint, source } => ChannelError::Bind { endpoint, source },
            TransportError::InvalidEndpoint { .. } => ChannelError::Config(err.to_string()),
            other => ChannelError::Connection(other.to_string()),
        }
    }
}

impl From<FrameError> for ChannelError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Encode(msg) => ChannelError::Encode(msg),
            FrameError::Decode(msg) => ChannelError::Decode(msg),
            FrameError::InvalidMagic | FrameError::PayloadTooLarge { .. } => {
                ChannelError::Decode(err.to_string())
            }
            FrameError::UnknownKind(_) | FrameError::UnexpectedKind { .. } => {
                ChannelError::ProtocolViolation(err.to_string())
            }
            FrameError::Io(_) | FrameError::ConnectionClosed => {
                ChannelError::Connection(err.to_string())
            }
        }
    }
}

impl From<CryptError> for ChannelError {
    fn from(err: CryptError) -> Self {
        match err {
            CryptError::Integrity(_) | CryptError::ModeMismatch { .. } => {
                ChannelError::Integrity(err.to_string())
            }
            CryptError::Encode(msg) => ChannelError::Encode(msg),
            CryptError::Decode(msg) => ChannelError::Decode(msg),
            CryptError::MissingKey | CryptError::InvalidKey(_) => {
                ChannelError::Config(err.to_string())
            }
        }
    }
}

/// Classify a frame error raised while sending: an oversized body is the
/// sender's encode failure, not malformed input.
pub(crate) fn send_error(err: FrameError) -> ChannelError {
    match err {
        FrameError::PayloadTooLarge { .. } => ChannelError::Encode(err.to_string()),
        other => other.into(),
    }
}

/// Classify a frame error raised while waiting `waited` for input.
pub(crate) fn recv_error(err: FrameError, waited: Duration) -> ChannelError {
    if err.is_timeout() {
        ChannelError::Timeout(waited)
    } else {
        err.into()
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;
