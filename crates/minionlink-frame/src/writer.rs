use std::io::{ErrorKind, Write};

use bytes::BytesMut;

use crate::codec::{encode_frame, Frame, FrameConfig};
use crate::error::{FrameError, Result};
use crate::kind::FrameKind;
use crate::message::{encode_message, Message};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes whole frames to a byte stream.
///
/// Each frame is assembled in an internal buffer and handed to the stream in
/// as few writes as it takes. A write timeout surfaces as `FrameError::Io`
/// with `WouldBlock`/`TimedOut`; the stream may then hold a partial frame
/// and must be discarded.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.send(frame.kind, &frame.body)
    }

    /// Encode `message` and send it as one frame of `kind`.
    pub fn write_message(&mut self, kind: FrameKind, message: &Message) -> Result<()> {
        let body = encode_message(message)?;
        self.send(kind, &body)
    }

    /// Frame an already encoded body and push it out. Bodies over the
    /// configured limit are refused before anything reaches the stream.
    pub fn send(&mut self, kind: FrameKind, body: &[u8]) -> Result<()> {
        let max = self.config.max_payload_size;
        if body.len() > max {
            return Err(FrameError::PayloadTooLarge {
                size: body.len(),
                max,
            });
        }

        self.buf.clear();
        encode_frame(kind, body, &mut self.buf)?;
        self.push_buffer()?;
        self.flush()
    }

    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    fn push_buffer(&mut self) -> Result<()> {
        let mut pending = &self.buf[..];
        while !pending.is_empty() {
            match self.inner.write(pending) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => pending = &pending[n..],
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
        Ok(())
    }
}
