use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::value::Value;

/// How a message payload is protected on the wire.
///
/// Encrypted mode is the default; clear mode must be chosen explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum CryptMode {
    /// Payload travels unencrypted. Trusted or test deployments only.
    Clear,
    /// Payload is sealed with AES-256-GCM.
    #[default]
    Aes,
}

impl CryptMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CryptMode::Clear => "clear",
            CryptMode::Aes => "aes",
        }
    }
}

impl FromStr for CryptMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "clear" => Ok(CryptMode::Clear),
            "aes" => Ok(CryptMode::Aes),
            other => Err(format!("unknown crypt mode '{other}'")),
        }
    }
}

impl TryFrom<String> for CryptMode {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<CryptMode> for String {
    fn from(mode: CryptMode) -> Self {
        mode.as_str().to_string()
    }
}

impl fmt::Display for CryptMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Marker on an error reply telling the client why its request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Fault {
    /// The request could not be decoded.
    Malformed,
    /// The request failed envelope verification.
    Integrity,
    /// The dispatch handler failed.
    Handler,
    /// The handler's result could not be encoded.
    Encode,
}

impl Fault {
    pub fn as_str(self) -> &'static str {
        match self {
            Fault::Malformed => "malformed",
            Fault::Integrity => "integrity",
            Fault::Handler => "handler",
            Fault::Encode => "encode",
        }
    }
}

impl TryFrom<String> for Fault {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        match s.as_str() {
            "malformed" => Ok(Fault::Malformed),
            "integrity" => Ok(Fault::Integrity),
            "handler" => Ok(Fault::Handler),
            "encode" => Ok(Fault::Encode),
            other => Err(format!("unknown fault '{other}'")),
        }
    }
}

impl From<Fault> for String {
    fn from(fault: Fault) -> Self {
        fault.as_str().to_string()
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message header. Everything a receiver needs to pick its decode strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    /// Crypt mode used to produce the payload.
    pub crypt: CryptMode,
    /// Sender node id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Set only on error replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<Fault>,
    /// Free-form routing and load metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, Value>,
}

impl Header {
    pub fn new(crypt: CryptMode) -> Self {
        Self {
            crypt,
            id: None,
            fault: None,
            meta: BTreeMap::new(),
        }
    }

    pub fn clear() -> Self {
        Self::new(CryptMode::Clear)
    }

    /// Set the sender id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// One logical message: header plus payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "head")]
    pub header: Header,
    #[serde(rename = "body")]
    pub payload: Value,
}

impl Message {
    pub fn new(header: Header, payload: Value) -> Self {
        Self { header, payload }
    }

    /// Unencrypted message with no routing metadata.
    pub fn clear(payload: Value) -> Self {
        Self::new(Header::clear(), payload)
    }

    /// Clear-mode error reply carrying `fault` and a human-readable message.
    pub fn fault(fault: Fault, message: impl Into<String>) -> Self {
        let mut header = Header::clear();
        header.fault = Some(fault);
        Self::new(header, Value::map([("message", Value::String(message.into()))]))
    }

    /// The fault marker and text if this is an error reply.
    pub fn as_fault(&self) -> Option<(Fault, String)> {
        let fault = self.header.fault?;
        let text = self
            .payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("no detail")
            .to_string();
        Some((fault, text))
    }
}

/// Encode a message body. Deterministic for equal messages.
pub fn encode_message(message: &Message) -> Result<Bytes> {
    Ok(Bytes::from(rmp_serde::to_vec_named(message)?))
}

/// Decode a message body.
///
/// Fails with [`crate::FrameError::Decode`] on truncated or malformed input.
/// Unknown header fields are ignored.
pub fn decode_message(bytes: &[u8]) -> Result<Message> {
    Ok(rmp_serde::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::error::FrameError;

    fn random_string(rng: &mut StdRng) -> String {
        let len = rng.gen_range(0..12);
        (0..len).map(|_| rng.gen_range('a'..='z')).collect()
    }

    fn random_value(rng: &mut StdRng, depth: u32) -> Value {
        let leaf_only = depth == 0;
        match rng.gen_range(0..if leaf_only { 9 } else { 11 }) {
            0 => Value::Nil,
            1 => Value::Bool(rng.gen()),
            2 => Value::Int(rng.gen()),
            3 => Value::Int(rng.gen_range(-40..40)),
            4 => Value::UInt(rng.gen()),
            5 => Value::UInt(rng.gen_range(0..300)),
            6 => Value::Float(rng.gen_range(-1.0e9..1.0e9)),
            7 => Value::String(random_string(rng)),
            8 => Value::Binary((0..rng.gen_range(0..24)).map(|_| rng.gen()).collect()),
            9 => Value::Array(
                (0..rng.gen_range(0..5))
                    .map(|_| random_value(rng, depth - 1))
                    .collect(),
            ),
            _ => Value::Map(
                (0..rng.gen_range(0..5))
                    .map(|_| (random_string(rng), random_value(rng, depth - 1)))
                    .collect(),
            ),
        }
    }

    fn random_message(rng: &mut StdRng) -> Message {
        let crypt = if rng.gen() { CryptMode::Aes } else { CryptMode::Clear };
        let mut header = Header::new(crypt);
        if rng.gen() {
            header.id = Some(random_string(rng));
        }
        if rng.gen_bool(0.2) {
            header.fault = Some(Fault::Handler);
        }
        for _ in 0..rng.gen_range(0..3) {
            header.meta.insert(random_string(rng), random_value(rng, 1));
        }
        Message::new(header, random_value(rng, 3))
    }

    fn sample() -> Message {
        let mut header = Header::new(CryptMode::Aes).with_id("minion-7");
        header.meta.insert("load".to_string(), Value::from(0.5));
        Message::new(header, Value::Binary(vec![9; 32]))
    }

    #[test]
    fn message_roundtrip() {
        let message = sample();
        let decoded = decode_message(&encode_message(&message).unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn random_messages_roundtrip() {
        let mut rng = StdRng::seed_from_u64(0x6d6c_696e_6b);
        for _ in 0..500 {
            let message = random_message(&mut rng);
            let bytes = encode_message(&message).unwrap();
            let decoded = decode_message(&bytes).unwrap();
            assert_eq!(decoded, message);
            assert_eq!(encode_message(&decoded).unwrap(), bytes);
        }
    }

    #[test]
    fn unsigned_payload_roundtrips() {
        let message = Message::clear(Value::Array(vec![
            Value::UInt(5),
            Value::UInt(u64::MAX),
            Value::Int(-5),
        ]));
        let decoded = decode_message(&encode_message(&message).unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn default_crypt_mode_is_aes() {
        assert_eq!(CryptMode::default(), CryptMode::Aes);
    }

    #[test]
    fn header_is_self_describing() {
        let bytes = encode_message(&Message::clear(Value::from("x"))).unwrap();
        let raw: Value = rmp_serde::from_slice(&bytes).unwrap();
        let head = raw.get("head").unwrap();
        assert_eq!(head.get("crypt").and_then(Value::as_str), Some("clear"));
        assert!(head.get("fault").is_none());
    }

    #[test]
    fn fault_reply_exposes_marker_and_text() {
        let reply = Message::fault(Fault::Handler, "boom");
        assert_eq!(reply.header.crypt, CryptMode::Clear);
        assert_eq!(reply.as_fault(), Some((Fault::Handler, "boom".to_string())));
        assert!(Message::clear(Value::Nil).as_fault().is_none());
    }

    #[test]
    fn truncated_body_is_decode_error() {
        let bytes = encode_message(&sample()).unwrap();
        let err = decode_message(&bytes[..bytes.len() / 2]).unwrap_err();
        assert!(matches!(err, FrameError::Decode(_)));
    }

    #[test]
    fn garbage_is_decode_error() {
        let err = decode_message(b"\xc1\xc1\xc1").unwrap_err();
        assert!(matches!(err, FrameError::Decode(_)));
    }

    #[test]
    fn unknown_header_fields_are_tolerated() {
        let raw = Value::map([
            (
                "head",
                Value::map([("crypt", Value::from("clear")), ("future", Value::from(1))]),
            ),
            ("body", Value::from("ok")),
        ]);
        let bytes = rmp_serde::to_vec_named(&raw).unwrap();
        let message = decode_message(&bytes).unwrap();
        assert_eq!(message.payload, Value::from("ok"));
    }
}
