use minionlink_frame::CryptMode;

/// Errors from sealing or opening a payload.
#[derive(Debug, thiserror::Error)]
pub enum CryptError {
    /// Authentication failed: wrong key, tampered header or ciphertext.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// The message was sealed in a different crypt mode than this envelope uses.
    #[error("crypt mode mismatch (expected {expected}, got {found})")]
    ModeMismatch { expected: CryptMode, found: CryptMode },

    /// Encrypted mode was requested without key material.
    #[error("encrypted mode requires key material")]
    MissingKey,

    /// Key material has the wrong length or encoding.
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// The payload could not be serialized for sealing.
    #[error("payload encode error: {0}")]
    Encode(String),

    /// The decrypted plaintext is not a valid payload.
    #[error("payload decode error: {0}")]
    Decode(String),
}

impl CryptError {
    /// True for failures a receiver must treat as an integrity violation.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            CryptError::Integrity(_) | CryptError::ModeMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CryptError>;
