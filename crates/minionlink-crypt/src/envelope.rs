use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use minionlink_frame::{CryptMode, Header, Message, Value};
use rand::RngCore;
use tracing::debug;

use crate::error::{CryptError, Result};
use crate::key::KeyMaterial;

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

const TAG_LEN: usize = 16;

/// Seals payloads into messages and opens them again in one fixed crypt mode.
///
/// In `Aes` mode the sealed payload is `Value::Binary(nonce || ciphertext)`,
/// with a fresh random nonce per message. The header's crypt tag, sender id
/// and fault marker are bound as associated data.
#[derive(Clone)]
pub struct Envelope {
    mode: CryptMode,
    cipher: Option<Aes256Gcm>,
}

impl Envelope {
    /// Build an envelope for `mode`. `Aes` requires key material.
    pub fn new(mode: CryptMode, key: Option<&KeyMaterial>) -> Result<Self> {
        match (mode, key) {
            (CryptMode::Clear, _) => Ok(Self::clear()),
            (CryptMode::Aes, Some(key)) => Ok(Self::aes(key)),
            (CryptMode::Aes, None) => Err(CryptError::MissingKey),
        }
    }

    /// Passthrough envelope. Trusted or test deployments only.
    pub fn clear() -> Self {
        Self {
            mode: CryptMode::Clear,
            cipher: None,
        }
    }

    /// AES-256-GCM envelope under `key`.
    pub fn aes(key: &KeyMaterial) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
        Self {
            mode: CryptMode::Aes,
            cipher: Some(cipher),
        }
    }

    pub fn mode(&self) -> CryptMode {
        self.mode
    }

    /// Wrap `payload` into a message. The header's crypt field is set to this
    /// envelope's mode regardless of what the caller put there.
    pub fn seal(&self, mut header: Header, payload: Value) -> Result<Message> {
        header.crypt = self.mode;
        let cipher = match &self.cipher {
            None => return Ok(Message::new(header, payload)),
            Some(cipher) => cipher,
        };

        let plaintext =
            rmp_serde::to_vec_named(&payload).map_err(|e| CryptError::Encode(e.to_string()))?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let aad = associated_data(&header);

        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptError::Encode("encryption failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(Message::new(header, Value::Binary(sealed)))
    }

    /// Verify and unwrap a message's payload.
    ///
    /// A message in another crypt mode is rejected with
    /// [`CryptError::ModeMismatch`]; it is never read as plaintext.
    pub fn open(&self, message: Message) -> Result<Value> {
        if message.header.crypt != self.mode {
            debug!(
                expected = %self.mode,
                found = %message.header.crypt,
                "rejecting message sealed in another crypt mode"
            );
            return Err(CryptError::ModeMismatch {
                expected: self.mode,
                found: message.header.crypt,
            });
        }
        let cipher = match &self.cipher {
            None => return Ok(message.payload),
            Some(cipher) => cipher,
        };

        let sealed = match &message.payload {
            Value::Binary(bytes) if bytes.len() >= NONCE_LEN + TAG_LEN => bytes,
            Value::Binary(_) => {
                return Err(CryptError::Integrity("sealed payload truncated".to_string()))
            }
            _ => {
                return Err(CryptError::Integrity(
                    "sealed payload is not binary".to_string(),
                ))
            }
        };

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let aad = associated_data(&message.header);
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptError::Integrity("authentication tag mismatch".to_string()))?;

        rmp_serde::from_slice(&plaintext).map_err(|e| CryptError::Decode(e.to_string()))
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope").field("mode", &self.mode).finish()
    }
}

fn associated_data(header: &Header) -> Vec<u8> {
    let id = header.id.as_deref().unwrap_or("");
    let fault = header.fault.map(|fault| fault.as_str()).unwrap_or("");
    let mut aad = Vec::with_capacity(24 + id.len());
    aad.extend_from_slice(b"minionlink/");
    aad.extend_from_slice(header.crypt.as_str().as_bytes());
    aad.push(0);
    aad.extend_from_slice(id.as_bytes());
    aad.push(0);
    aad.extend_from_slice(fault.as_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use minionlink_frame::Fault;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    fn key(byte: u8) -> KeyMaterial {
        KeyMaterial::from_bytes(&[byte; crate::key::KEY_LEN]).unwrap()
    }

    fn job() -> Value {
        Value::map([
            ("id", Value::from(42)),
            ("cmd", Value::from("ping")),
            ("blob", Value::Binary(vec![0, 1, 2, 3])),
        ])
    }

    fn random_value(rng: &mut StdRng, depth: u32) -> Value {
        match rng.gen_range(0..if depth == 0 { 6 } else { 8 }) {
            0 => Value::Nil,
            1 => Value::Bool(rng.gen()),
            2 => Value::Int(rng.gen()),
            3 => Value::Float(f64::from(rng.gen::<u16>()) / 8.0),
            4 => Value::String(format!("s{}", rng.gen::<u32>())),
            5 => Value::Binary((0..rng.gen_range(0..64)).map(|_| rng.gen()).collect()),
            6 => Value::Array(
                (0..rng.gen_range(0..4))
                    .map(|_| random_value(rng, depth - 1))
                    .collect(),
            ),
            _ => Value::Map(
                (0..rng.gen_range(0..4))
                    .map(|i| (format!("k{i}"), random_value(rng, depth - 1)))
                    .collect(),
            ),
        }
    }

    #[test]
    fn aes_roundtrip_for_random_payloads() {
        let envelope = Envelope::aes(&key(7));
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..200 {
            let payload = random_value(&mut rng, 3);
            let sealed = envelope
                .seal(Header::clear().with_id("minion-1"), payload.clone())
                .unwrap();
            assert_eq!(sealed.header.crypt, CryptMode::Aes);
            assert_eq!(envelope.open(sealed).unwrap(), payload);
        }
    }

    #[test]
    fn sealed_payload_is_opaque_and_fresh() {
        let envelope = Envelope::aes(&key(7));
        let a = envelope.seal(Header::clear(), job()).unwrap();
        let b = envelope.seal(Header::clear(), job()).unwrap();

        assert!(matches!(a.payload, Value::Binary(_)));
        assert_ne!(a.payload, b.payload, "nonce must differ per message");
    }

    #[test]
    fn wrong_key_is_integrity_error() {
        let sealed = Envelope::aes(&key(1)).seal(Header::clear(), job()).unwrap();
        let err = Envelope::aes(&key(2)).open(sealed).unwrap_err();
        assert!(matches!(err, CryptError::Integrity(_)));
    }

    #[test]
    fn tampered_sender_id_is_integrity_error() {
        let envelope = Envelope::aes(&key(3));
        let mut sealed = envelope
            .seal(Header::clear().with_id("minion-1"), job())
            .unwrap();
        sealed.header.id = Some("minion-2".to_string());

        let err = envelope.open(sealed).unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn fault_marker_is_authenticated() {
        let envelope = Envelope::aes(&key(3));
        let mut header = Header::clear().with_id("master");
        header.fault = Some(Fault::Handler);
        let sealed = envelope
            .seal(header, Value::map([("message", "no such module")]))
            .unwrap();
        let opened = envelope.open(sealed.clone()).unwrap();
        assert_eq!(opened.get("message").and_then(Value::as_str), Some("no such module"));

        let mut stripped = sealed.clone();
        stripped.header.fault = None;
        assert!(envelope.open(stripped).unwrap_err().is_integrity());

        let mut swapped = sealed;
        swapped.header.fault = Some(Fault::Integrity);
        assert!(envelope.open(swapped).unwrap_err().is_integrity());
    }

    #[test]
    fn flipped_ciphertext_bit_is_integrity_error() {
        let envelope = Envelope::aes(&key(3));
        let mut sealed = envelope.seal(Header::clear(), job()).unwrap();
        if let Value::Binary(bytes) = &mut sealed.payload {
            let last = bytes.len() - 1;
            bytes[last] ^= 0x01;
        }
        assert!(matches!(
            envelope.open(sealed),
            Err(CryptError::Integrity(_))
        ));
    }

    #[test]
    fn clear_message_rejected_by_aes_envelope() {
        let clear = Envelope::clear().seal(Header::clear(), job()).unwrap();
        let err = Envelope::aes(&key(4)).open(clear).unwrap_err();
        assert!(matches!(err, CryptError::ModeMismatch { .. }));
        assert!(err.is_integrity());
    }

    #[test]
    fn short_sealed_payload_is_integrity_error() {
        let message = Message::new(Header::new(CryptMode::Aes), Value::Binary(vec![0; 8]));
        let err = Envelope::aes(&key(5)).open(message).unwrap_err();
        assert!(matches!(err, CryptError::Integrity(_)));

        let message = Message::new(Header::new(CryptMode::Aes), Value::from("plain"));
        let err = Envelope::aes(&key(5)).open(message).unwrap_err();
        assert!(matches!(err, CryptError::Integrity(_)));
    }

    #[test]
    fn clear_is_identity() {
        let envelope = Envelope::clear();
        let sealed = envelope.seal(Header::new(CryptMode::Aes), job()).unwrap();
        assert_eq!(sealed.header.crypt, CryptMode::Clear);
        assert_eq!(sealed.payload, job());
        assert_eq!(envelope.open(sealed).unwrap(), job());
    }

    #[test]
    fn aes_without_key_is_refused() {
        assert!(matches!(
            Envelope::new(CryptMode::Aes, None),
            Err(CryptError::MissingKey)
        ));
        assert_eq!(
            Envelope::new(CryptMode::Clear, None).unwrap().mode(),
            CryptMode::Clear
        );
    }

    #[test]
    fn debug_hides_cipher_state() {
        let rendered = format!("{:?}", Envelope::aes(&key(9)));
        assert_eq!(rendered, "Envelope { mode: Aes }");
    }
}
