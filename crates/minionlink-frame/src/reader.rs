use std::io::{Cursor, ErrorKind, Read};

use bytes::BytesMut;
use minionlink_transport::{TransportError, WireStream};

use crate::codec::{decode_frame, Frame, FrameConfig};
use crate::error::{FrameError, Result};
use crate::kind::FrameKind;
use crate::message::Message;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Streams that can tell, without blocking, whether the peer sent bytes
/// nobody has read yet.
pub trait PendingInput {
    fn has_pending_input(&self) -> Result<bool>;
}

impl PendingInput for WireStream {
    fn has_pending_input(&self) -> Result<bool> {
        self.has_unread_input().map_err(|err| match err {
            TransportError::Io(io) => FrameError::Io(io),
            other => FrameError::Io(std::io::Error::other(other.to_string())),
        })
    }
}

impl<T: AsRef<[u8]>> PendingInput for Cursor<T> {
    fn has_pending_input(&self) -> Result<bool> {
        Ok(self.position() < self.get_ref().as_ref().len() as u64)
    }
}

/// Reads whole frames, and the messages inside them, from a byte stream.
///
/// Partial reads are reassembled internally. A read timeout surfaces as
/// `FrameError::Io` with `WouldBlock`/`TimedOut` and leaves any partially
/// received frame buffered, so the call can simply be repeated.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
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

    /// Next complete frame, of any kind.
    ///
    /// `FrameError::ConnectionClosed` at end of stream, whether or not a
    /// partial frame was pending; [`FrameReader::has_buffered`] tells the two
    /// apart.
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = decode_frame(&mut self.buf, self.config.max_payload_size)? {
                return Ok(frame);
            }
            if self.fill()? == 0 {
                return Err(FrameError::ConnectionClosed);
            }
        }
    }

    /// Next frame, which must be of kind `expected`, decoded to a message.
    ///
    /// A wrong kind or an undecodable body consumes the frame and fails with
    /// an error for which [`FrameError::is_content_error`] holds.
    pub fn read_message(&mut self, expected: FrameKind) -> Result<Message> {
        self.read_frame()?.into_message(expected)
    }

    /// True if bytes beyond the last returned frame are already buffered.
    pub fn has_buffered(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    /// Append whatever the stream yields next. Zero means end of stream.
    fn fill(&mut self) -> Result<usize> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match self.inner.read(&mut chunk) {
                Ok(read) => {
                    self.buf.extend_from_slice(&chunk[..read]);
                    return Ok(read);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }
}

impl<T: Read + PendingInput> FrameReader<T> {
    /// True if the peer sent anything past the last returned frame, whether
    /// it is already buffered here or still waiting in the stream.
    pub fn peer_sent_more(&self) -> Result<bool> {
        if self.has_buffered() {
            return Ok(true);
        }
        self.inner.has_pending_input()
    }
}
