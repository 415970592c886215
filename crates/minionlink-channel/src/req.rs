use std::time::{Duration, Instant};

use minionlink_crypt::Envelope;
use minionlink_frame::{CryptMode, Fault, Header, Message, Value};
use tracing::debug;

use crate::config::ChannelConfig;
use crate::error::{ChannelError, Result};
use crate::socket::ReqSocket;

/// Client side of request/reply: seal, send, wait for exactly one reply.
///
/// The connection is opened lazily on the first `send`. After a timeout or
/// any transport failure it is discarded, and the next `send` connects
/// afresh. Nothing is retried automatically. Not for concurrent use: one
/// request is in flight at a time, which `&mut self` enforces.
pub struct ReqChannel {
    config: ChannelConfig,
    envelope: Envelope,
    socket: Option<ReqSocket>,
}

impl ReqChannel {
    pub fn new(config: ChannelConfig) -> Result<Self> {
        let envelope = config.envelope()?;
        Ok(Self {
            config,
            envelope,
            socket: None,
        })
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// True if a connection is currently held open.
    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    /// Send `payload` and wait at most `timeout` for the reply payload.
    ///
    /// Errors: `Timeout` when no reply arrived in time, `Connection` on
    /// transport failure, `Remote` when the server sent a fault reply, and
    /// `Integrity` when the reply fails envelope verification.
    ///
    /// On an encrypted channel, `handler` and `encode` faults arrive sealed
    /// and are verified like any reply; an unsealed one is an `Integrity`
    /// error. `malformed` and `integrity` faults answer requests the server
    /// could not open, so they arrive in clear and are taken unauthenticated:
    /// a peer on the path can forge those two without the key.
    pub fn send(&mut self, payload: Value, timeout: Duration) -> Result<Value> {
        if timeout.is_zero() {
            return Err(ChannelError::Config("timeout must be positive".to_string()));
        }
        let header = Header::new(self.envelope.mode()).with_id(self.config.node_id());
        let request = self.envelope.seal(header, payload)?;

        let reply = match self.exchange(&request, timeout) {
            Ok(reply) => reply,
            Err(err) => {
                self.reset(&err);
                return Err(err);
            }
        };

        match reply.header.fault {
            None => Ok(self.envelope.open(reply)?),
            Some(fault) => Err(self.remote_fault(fault, reply)),
        }
    }

    /// [`ReqChannel::send`] with the configured default timeout.
    pub fn send_default(&mut self, payload: Value) -> Result<Value> {
        let timeout = self.config.timeout_default();
        self.send(payload, timeout)
    }

    /// Drop the current connection, if any.
    pub fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            socket.close();
        }
    }

    fn exchange(&mut self, request: &Message, timeout: Duration) -> Result<Message> {
        let deadline = Instant::now() + timeout;

        if self.socket.is_none() {
            let connect_timeout = self.config.connect_timeout().min(timeout);
            let socket = ReqSocket::connect(
                self.config.master_uri(),
                connect_timeout,
                self.config.frame_config(),
            )?;
            self.socket = Some(socket);
        }
        let socket = match self.socket.as_mut() {
            Some(socket) => socket,
            None => return Err(ChannelError::Connection("no connection".to_string())),
        };

        socket.send(request, timeout)?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ChannelError::Timeout(timeout));
        }
        socket.recv(remaining).map_err(|err| match err {
            ChannelError::Timeout(_) => ChannelError::Timeout(timeout),
            other => other,
        })
    }

    fn remote_fault(&self, fault: Fault, reply: Message) -> ChannelError {
        let sealed_channel = self.envelope.mode() != CryptMode::Clear;
        if sealed_channel && reply.header.crypt == CryptMode::Clear {
            return match (fault, reply.as_fault()) {
                (Fault::Malformed | Fault::Integrity, Some((fault, message))) => {
                    ChannelError::Remote { fault, message }
                }
                _ => ChannelError::Integrity(format!(
                    "unsealed {fault} fault reply on an encrypted channel"
                )),
            };
        }
        match self.envelope.open(reply) {
            Ok(detail) => ChannelError::Remote {
                fault,
                message: detail
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("no detail")
                    .to_string(),
            },
            Err(err) => err.into(),
        }
    }

    fn reset(&mut self, cause: &ChannelError) {
        if let Some(socket) = self.socket.take() {
            debug!(
                endpoint = %socket.endpoint(),
                error = %cause,
                "discarding request connection"
            );
            socket.close();
        }
    }
}

impl std::fmt::Debug for ReqChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqChannel")
            .field("config", &self.config)
            .field("connected", &self.socket.is_some())
            .finish()
    }
}
