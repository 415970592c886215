use crate::kind::FrameKind;

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header contains an invalid magic number.
    #[error("invalid frame magic (expected 0x4d4c \"ML\")")]
    InvalidMagic,

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A value could not be represented on the wire.
    #[error("encode error: {0}")]
    Encode(String),

    /// The frame body is truncated or is not a valid message.
    #[error("decode error: {0}")]
    Decode(String),

    /// The frame carries a kind tag this version does not know. The frame
    /// itself was consumed.
    #[error("unknown frame kind tag {0}")]
    UnknownKind(u16),

    /// A well-formed frame of the wrong kind arrived.
    #[error("expected {expected} frame, got {got}")]
    UnexpectedKind { expected: FrameKind, got: FrameKind },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

impl FrameError {
    /// True if a whole frame was consumed but its content is unusable. The
    /// stream is still aligned on the next frame.
    pub fn is_content_error(&self) -> bool {
        matches!(
            self,
            FrameError::Decode(_) | FrameError::UnknownKind(_) | FrameError::UnexpectedKind { .. }
        )
    }

    /// True if this is a read/write timeout on a blocking socket.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            FrameError::Io(err) if matches!(
                err.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            )
        )
    }
}

impl From<rmp_serde::encode::Error> for FrameError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        FrameError::Encode(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for FrameError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        FrameError::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
