use std::io::{Read, Write};
use std::time::Duration;

use minionlink_frame::{
    FrameConfig, FrameError, FrameKind, FrameReader, FrameWriter, Message, PendingInput,
};
use minionlink_transport::{Endpoint, WireStream};
use tracing::debug;

use crate::error::{recv_error, send_error, ChannelError, Result};

/// Client half of a request/reply exchange.
///
/// Sends one request, then accepts exactly one reply before the next send.
pub struct ReqSocket {
    reader: FrameReader<WireStream>,
    writer: FrameWriter<WireStream>,
    endpoint: Endpoint,
    awaiting_reply: bool,
}

impl ReqSocket {
    /// Connect to `endpoint`, waiting at most `connect_timeout`.
    pub fn connect(endpoint: &Endpoint, connect_timeout: Duration, config: FrameConfig) -> Result<Self> {
        let stream = WireStream::connect(endpoint, connect_timeout)?;
        let reader_stream = stream.try_clone()?;
        debug!(%endpoint, "request socket connected");
        Ok(Self {
            reader: FrameReader::with_config(reader_stream, config),
            writer: FrameWriter::with_config(stream, config),
            endpoint: endpoint.clone(),
            awaiting_reply: false,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Send one request. Fails with `ProtocolViolation` if the previous
    /// request has not been answered yet.
    pub fn send(&mut self, message: &Message, timeout: Duration) -> Result<()> {
        if self.awaiting_reply {
            return Err(ChannelError::ProtocolViolation(
                "send called while a reply is still owed".to_string(),
            ));
        }
        self.writer.get_ref().set_write_timeout(Some(timeout))?;
        self.writer
            .write_message(FrameKind::Request, message)
            .map_err(|err| {
                if err.is_timeout() {
                    ChannelError::Timeout(timeout)
                } else {
                    send_error(err)
                }
            })?;
        self.awaiting_reply = true;
        Ok(())
    }

    /// Wait at most `timeout` for the reply to the outstanding request.
    pub fn recv(&mut self, timeout: Duration) -> Result<Message> {
        if !self.awaiting_reply {
            return Err(ChannelError::ProtocolViolation(
                "recv called with no request outstanding".to_string(),
            ));
        }
        self.reader.get_ref().set_read_timeout(Some(timeout))?;
        let result = self.reader.read_message(FrameKind::Reply);
        // A reply frame was consumed, readable or not: the exchange is over.
        if matches!(result, Ok(_) | Err(FrameError::Decode(_))) {
            self.awaiting_reply = false;
        }
        result.map_err(|err| recv_error(err, timeout))
    }

    /// Shut the connection down.
    pub fn close(self) {
        self.writer.get_ref().close();
    }
}

/// What [`RepSocket::recv`] found on the connection.
#[derive(Debug)]
pub enum Inbound {
    /// A decoded request. A reply is now owed.
    Request(Message),
    /// A whole frame arrived but is not a readable request: wrong kind or
    /// undecodable body. A reply is still owed, normally a `malformed` fault.
    Unreadable(FrameError),
    /// The read timeout passed without a complete frame. Any partial frame
    /// stays buffered for the next call.
    Idle,
    /// The peer closed the connection between requests.
    Closed,
}

/// Server half of a request/reply exchange over any byte stream.
///
/// Enforces strict alternation: after a request is received, exactly one
/// reply must be sent before the next request is read. Input that arrives
/// before that reply is sent, buffered here or still in the stream, is a
/// `ProtocolViolation` and the reply is withheld.
pub struct RepSocket<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    pending: bool,
}

impl<R: Read + PendingInput, W: Write> RepSocket<R, W> {
    pub fn new(reader: R, writer: W, config: FrameConfig) -> Self {
        Self {
            reader: FrameReader::with_config(reader, config),
            writer: FrameWriter::with_config(writer, config),
            pending: false,
        }
    }

    /// Read the next request, waiting as long as the stream's read timeout.
    pub fn recv(&mut self) -> Result<Inbound> {
        if self.pending {
            return Err(ChannelError::ProtocolViolation(
                "recv called before replying to the previous request".to_string(),
            ));
        }
        let inbound = match self.reader.read_message(FrameKind::Request) {
            Ok(message) => Inbound::Request(message),
            Err(err) if err.is_content_error() => Inbound::Unreadable(err),
            Err(err) if err.is_timeout() => return Ok(Inbound::Idle),
            Err(FrameError::ConnectionClosed) if !self.reader.has_buffered() => {
                return Ok(Inbound::Closed)
            }
            Err(err) => return Err(err.into()),
        };
        self.pending = true;
        self.check_alternation()?;
        Ok(inbound)
    }

    /// Send the one reply owed for the last request.
    ///
    /// Refused with `ProtocolViolation` if the peer has sent anything since
    /// that request. An `Encode` error leaves the reply still owed, so the
    /// caller can send a fault reply instead.
    pub fn send(&mut self, message: &Message) -> Result<()> {
        if !self.pending {
            return Err(ChannelError::ProtocolViolation(
                "reply sent with no request pending".to_string(),
            ));
        }
        self.check_alternation()?;
        self.writer
            .write_message(FrameKind::Reply, message)
            .map_err(send_error)?;
        self.pending = false;
        Ok(())
    }

    /// True while a reply is owed.
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Recover the underlying reader and writer.
    pub fn into_parts(self) -> (R, W) {
        (self.reader.into_inner(), self.writer.into_inner())
    }

    fn check_alternation(&self) -> Result<()> {
        if self.reader.peer_sent_more()? {
            return Err(ChannelError::ProtocolViolation(
                "second request received before the first was answered".to_string(),
            ));
        }
        Ok(())
    }
}
