use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{CryptError, Result};

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

/// Symmetric key shared by master and minions.
///
/// Wiped from memory on drop and never printed by `Debug`.
#[derive(Clone)]
pub struct KeyMaterial {
    bytes: Zeroizing<[u8; KEY_LEN]>,
}

impl KeyMaterial {
    /// Use exactly [`KEY_LEN`] raw bytes as the key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_LEN {
            return Err(CryptError::InvalidKey(format!(
                "expected {KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(bytes);
        Ok(Self { bytes: key })
    }

    /// Parse a 64-character hex string. Surrounding whitespace is ignored.
    pub fn from_hex(input: &str) -> Result<Self> {
        let decoded = Zeroizing::new(
            hex::decode(input.trim()).map_err(|e| CryptError::InvalidKey(e.to_string()))?,
        );
        Self::from_bytes(&decoded)
    }

    /// Fresh random key from the OS generator.
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        rand::rngs::OsRng.fill_bytes(&mut key[..]);
        Self { bytes: key }
    }

    /// Lowercase hex form, for handing a generated key to operators.
    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(&self.bytes[..]))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("bytes", &"<redacted>")
            .finish()
    }
}
