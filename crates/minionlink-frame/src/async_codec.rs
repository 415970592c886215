//! Tokio codec over the same wire format as [`crate::FrameReader`] and
//! [`crate::FrameWriter`], for embedding channel framing in async services.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{decode_frame, encode_frame, Frame, FrameConfig};
use crate::error::{FrameError, Result};

/// `Decoder`/`Encoder` for minionlink frames.
#[derive(Debug, Clone)]
pub struct WireCodec {
    max_payload_size: usize,
}

impl WireCodec {
    pub fn new() -> Self {
        Self::with_config(&FrameConfig::default())
    }

    pub fn with_config(config: &FrameConfig) -> Self {
        Self {
            max_payload_size: config.max_payload_size,
        }
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for WireCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        decode_frame(src, self.max_payload_size)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::ConnectionClosed),
        }
    }
}

impl Encoder<Frame> for WireCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        if frame.body.len() > self.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: frame.body.len(),
                max: self.max_payload_size,
            });
        }
        encode_frame(frame.kind, &frame.body, dst)
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use tokio_util::codec::Framed;

    use super::*;
    use crate::kind::FrameKind;
    use crate::message::Message;
    use crate::value::Value;

    #[tokio::test]
    async fn frames_cross_an_async_pipe() {
        let (left, right) = tokio::io::duplex(1024);
        let mut tx = Framed::new(left, WireCodec::new());
        let mut rx = Framed::new(right, WireCodec::new());

        let message = Message::clear(Value::map([("id", 42)]));
        tx.send(Frame::from_message(FrameKind::Request, &message).unwrap())
            .await
            .unwrap();
        tx.send(Frame::new(FrameKind::Event, "tail")).await.unwrap();

        let first = rx.next().await.unwrap().unwrap();
        assert_eq!(first.kind, FrameKind::Request);
        assert_eq!(first.message().unwrap(), message);

        let second = rx.next().await.unwrap().unwrap();
        assert_eq!(second.body.as_ref(), b"tail");
    }

    #[test]
    fn partial_input_waits_then_decodes() {
        let mut codec = WireCodec::new();
        let mut full = BytesMut::new();
        codec.encode(Frame::new(FrameKind::Event, "slow"), &mut full).unwrap();

        let mut partial = full.split_to(5);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full);
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame.body.as_ref(), b"slow");
    }

    #[test]
    fn truncated_stream_at_eof_is_an_error() {
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Frame::new(FrameKind::Event, "cut"), &mut buf).unwrap();
        buf.truncate(buf.len() - 1);

        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn oversized_frame_is_not_encoded() {
        let mut codec = WireCodec::with_config(&FrameConfig::new(2));
        let mut buf = BytesMut::new();
        let err = codec.encode(Frame::new(FrameKind::Event, "toolong"), &mut buf).unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { .. }));
        assert!(buf.is_empty());
    }
}
