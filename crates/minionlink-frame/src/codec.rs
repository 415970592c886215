use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::kind::FrameKind;
use crate::message::{decode_message, encode_message, Message};

/// Frame header: magic (2) + body length (4) + kind tag (2) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Magic bytes: "ML" (0x4d 0x4c).
pub const MAGIC: [u8; 2] = *b"ML";

/// Default maximum body size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Fixed-size header in front of every frame.
///
/// ```text
/// ┌──────────────┬───────────┬──────────┬─────────────────────┐
/// │ Magic (2B)   │ Length    │ Kind     │ Body                │
/// │ "ML"         │ (4B LE)   │ (2B LE)  │ (Length bytes,      │
/// │              │           │          │  MessagePack)       │
/// └──────────────┴───────────┴──────────┴─────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw kind tag. Checked against [`FrameKind`] once the body is in, so an
    /// unknown kind never desynchronises the stream.
    pub tag: u16,
    pub body_len: usize,
}

impl FrameHeader {
    /// Parse the header at the front of `src` without consuming anything.
    ///
    /// `Ok(None)` while the header is incomplete. A bad magic or a body over
    /// `max_payload` fails before any body byte is buffered.
    pub fn peek(src: &[u8], max_payload: usize) -> Result<Option<Self>> {
        let Some(head) = src.get(..HEADER_SIZE) else {
            return Ok(None);
        };
        let (magic, mut rest) = head.split_at(MAGIC.len());
        if magic != MAGIC.as_slice() {
            return Err(FrameError::InvalidMagic);
        }
        let body_len = rest.get_u32_le() as usize;
        let tag = rest.get_u16_le();
        if body_len > max_payload {
            return Err(FrameError::PayloadTooLarge {
                size: body_len,
                max: max_payload,
            });
        }
        Ok(Some(Self { tag, body_len }))
    }

    /// Header plus body.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.body_len
    }

    fn put(&self, dst: &mut BytesMut) {
        dst.put_slice(&MAGIC);
        dst.put_u32_le(self.body_len as u32);
        dst.put_u16_le(self.tag);
    }
}

/// One wire frame: a kind and an encoded message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    /// The MessagePack-encoded [`Message`].
    pub body: Bytes,
}

impl Frame {
    /// Frame an already encoded body.
    pub fn new(kind: FrameKind, body: impl Into<Bytes>) -> Self {
        Self {
            kind,
            body: body.into(),
        }
    }

    /// Encode `message` into a frame of the given kind.
    pub fn from_message(kind: FrameKind, message: &Message) -> Result<Self> {
        Ok(Self::new(kind, encode_message(message)?))
    }

    /// Decode the body, whatever the kind.
    pub fn message(&self) -> Result<Message> {
        decode_message(&self.body)
    }

    /// Decode the body of a frame that must be of kind `expected`.
    pub fn into_message(self, expected: FrameKind) -> Result<Message> {
        if self.kind != expected {
            return Err(FrameError::UnexpectedKind {
                expected,
                got: self.kind,
            });
        }
        self.message()
    }

    /// Bytes this frame occupies on the wire.
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }
}

/// Append one frame to `dst`.
pub fn encode_frame(kind: FrameKind, body: &[u8], dst: &mut BytesMut) -> Result<()> {
    if u32::try_from(body.len()).is_err() {
        return Err(FrameError::PayloadTooLarge {
            size: body.len(),
            max: u32::MAX as usize,
        });
    }
    let header = FrameHeader {
        tag: kind.tag(),
        body_len: body.len(),
    };
    dst.reserve(header.frame_len());
    header.put(dst);
    dst.put_slice(body);
    Ok(())
}

/// Take one complete frame off the front of `src`.
///
/// `Ok(None)` until the whole frame is buffered; room for the rest of the
/// frame is reserved as soon as its header is known. A frame with an unknown
/// kind is consumed and reported as [`FrameError::UnknownKind`], leaving
/// `src` aligned on the next frame.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    let Some(header) = FrameHeader::peek(src, max_payload)? else {
        return Ok(None);
    };
    if src.len() < header.frame_len() {
        src.reserve(header.frame_len() - src.len());
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let body = src.split_to(header.body_len).freeze();
    match FrameKind::from_tag(header.tag) {
        Some(kind) => Ok(Some(Frame { kind, body })),
        None => Err(FrameError::UnknownKind(header.tag)),
    }
}

/// Size limit shared by frame readers and writers.
///
/// Timeouts are not part of it: they live on the socket, where the channel
/// layer sets them per operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameConfig {
    /// Largest accepted body in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
}

impl FrameConfig {
    pub const fn new(max_payload_size: usize) -> Self {
        Self { max_payload_size }
    }

    /// The same limit raised by `extra` bytes, for links that wrap whole
    /// frames inside another frame.
    pub fn with_slack(self, extra: usize) -> Self {
        Self::new(self.max_payload_size.saturating_add(extra))
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}
