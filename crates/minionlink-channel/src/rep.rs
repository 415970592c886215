use std::io::{Read, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use minionlink_crypt::Envelope;
use minionlink_frame::{Fault, FrameConfig, FrameError, Header, Message, PendingInput, Value};
use minionlink_transport::{WireListener, WireStream};
use tracing::{debug, error, info, warn};

use crate::config::ServerOptions;
use crate::error::{ChannelError, Result};
use crate::shutdown::Shutdown;
use crate::socket::{Inbound, RepSocket};

/// Why a dispatch call produced no result.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The handler failed. Reported to the client as a `handler` fault.
    #[error("{0}")]
    Failed(String),

    /// The handler's result cannot be put on the wire. Reported as `encode`.
    #[error("result not encodable: {0}")]
    Unencodable(String),
}

impl DispatchError {
    pub fn failed(message: impl Into<String>) -> Self {
        DispatchError::Failed(message.into())
    }
}

impl From<FrameError> for DispatchError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Encode(msg) => DispatchError::Unencodable(msg),
            other => DispatchError::Failed(other.to_string()),
        }
    }
}

/// Command dispatcher invoked once per decoded request.
///
/// Runs to completion; the server has no watchdog for a handler that never
/// returns.
pub trait Handler: Send + Sync {
    fn dispatch(&self, payload: Value) -> std::result::Result<Value, DispatchError>;
}

impl<F> Handler for F
where
    F: Fn(Value) -> std::result::Result<Value, DispatchError> + Send + Sync,
{
    fn dispatch(&self, payload: Value) -> std::result::Result<Value, DispatchError> {
        self(payload)
    }
}

/// Lifecycle of a [`ReplyServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Listening,
    Processing,
    Stopped,
}

const STATE_IDLE: u8 = 0;
const STATE_LISTENING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Accepts requests, dispatches them and sends exactly one reply per request.
///
/// Decode, integrity and handler failures become fault replies; they never
/// stop the server. Faults for requests that could not be opened go out in
/// clear; handler and encode faults are sealed like normal replies. A protocol violation closes only the offending
/// connection, but it is counted and reported by [`ReplyServer::serve`].
pub struct ReplyServer<H> {
    handler: H,
    envelope: Envelope,
    node_id: String,
    options: ServerOptions,
    max_payload_size: usize,
    lifecycle: AtomicU8,
    in_flight: AtomicUsize,
    violations: AtomicUsize,
    last_violation: Mutex<Option<String>>,
}

impl<H: Handler> ReplyServer<H> {
    pub fn new(envelope: Envelope, handler: H) -> Self {
        Self {
            handler,
            envelope,
            node_id: "master".to_string(),
            options: ServerOptions::default(),
            max_payload_size: minionlink_frame::DEFAULT_MAX_PAYLOAD,
            lifecycle: AtomicU8::new(STATE_IDLE),
            in_flight: AtomicUsize::new(0),
            violations: AtomicUsize::new(0),
            last_violation: Mutex::new(None),
        }
    }

    /// Id stamped on reply headers.
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    pub fn with_options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_max_payload_size(mut self, max: usize) -> Self {
        self.max_payload_size = max;
        self
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn state(&self) -> ServerState {
        match self.lifecycle.load(Ordering::SeqCst) {
            STATE_IDLE => ServerState::Idle,
            STATE_LISTENING if self.in_flight.load(Ordering::SeqCst) > 0 => ServerState::Processing,
            STATE_LISTENING => ServerState::Listening,
            _ => ServerState::Stopped,
        }
    }

    /// Connections closed after a protocol violation since this server was
    /// built.
    pub fn protocol_violations(&self) -> usize {
        self.violations.load(Ordering::SeqCst)
    }

    /// Accept and serve connections on `listener` until `shutdown` trips.
    ///
    /// Each connection is served on its own scoped thread; the call returns
    /// once every connection thread has finished. Other connections keep
    /// being served after one breaks the request/reply alternation, but the
    /// call then ends with `Err(ProtocolViolation)` so a supervisor sees it.
    pub fn serve(&self, listener: &WireListener, shutdown: &Shutdown) -> Result<()> {
        self.lifecycle.store(STATE_LISTENING, Ordering::SeqCst);
        let violations_before = self.protocol_violations();
        info!(endpoint = %listener.endpoint(), "reply server listening");
        let active = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            while !shutdown.is_triggered() {
                let stream = match listener.accept_timeout(self.options.poll_interval) {
                    Ok(Some(stream)) => stream,
                    Ok(None) => continue,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        std::thread::sleep(self.options.poll_interval);
                        continue;
                    }
                };

                if active.load(Ordering::SeqCst) >= self.options.max_connections {
                    warn!(
                        peer = %stream.peer_label(),
                        max = self.options.max_connections,
                        "connection limit reached, closing"
                    );
                    stream.close();
                    continue;
                }

                active.fetch_add(1, Ordering::SeqCst);
                let active = &active;
                scope.spawn(move || {
                    // serve_stream logs and counts its own failures.
                    let _ = self.serve_stream(stream, shutdown);
                    active.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        self.lifecycle.store(STATE_STOPPED, Ordering::SeqCst);
        info!("reply server stopped");
        let seen = self.protocol_violations().saturating_sub(violations_before);
        if seen == 0 {
            return Ok(());
        }
        let last = self
            .last_violation
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .unwrap_or_default();
        Err(ChannelError::ProtocolViolation(format!(
            "{seen} connection(s) closed after a protocol violation, last: {last}"
        )))
    }

    /// Serve one accepted connection until the peer leaves, the idle timeout
    /// passes, or `shutdown` trips.
    pub fn serve_stream(&self, stream: WireStream, shutdown: &Shutdown) -> Result<()> {
        let peer = stream.peer_label();
        stream.set_read_timeout(Some(self.options.poll_interval))?;
        stream.set_write_timeout(Some(self.options.send_timeout))?;
        let reader = stream.try_clone()?;
        let mut socket = RepSocket::new(reader, stream, FrameConfig::new(self.max_payload_size));
        debug!(%peer, "serving connection");

        let result = self.serve_socket(&mut socket, shutdown);
        match &result {
            Ok(()) => debug!(%peer, "connection finished"),
            Err(err @ ChannelError::ProtocolViolation(_)) => {
                error!(%peer, error = %err, "closing connection after protocol violation");
                self.record_violation(err);
            }
            Err(err) => debug!(%peer, error = %err, "connection ended with error"),
        }
        let (_, stream) = socket.into_parts();
        stream.close();
        result
    }

    fn record_violation(&self, err: &ChannelError) {
        self.violations.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut slot) = self.last_violation.lock() {
            *slot = Some(err.to_string());
        }
    }

    /// Request/reply loop over an already wrapped socket.
    pub fn serve_socket<R: Read + PendingInput, W: Write>(
        &self,
        socket: &mut RepSocket<R, W>,
        shutdown: &Shutdown,
    ) -> Result<()> {
        if self.lifecycle.load(Ordering::SeqCst) == STATE_IDLE {
            self.lifecycle.store(STATE_LISTENING, Ordering::SeqCst);
        }
        let mut last_activity = Instant::now();

        loop {
            if shutdown.is_triggered() {
                return Ok(());
            }
            let request = match socket.recv()? {
                Inbound::Request(request) => request,
                Inbound::Unreadable(err) => {
                    debug!(error = %err, "malformed request");
                    socket.send(&Message::fault(Fault::Malformed, err.to_string()))?;
                    last_activity = Instant::now();
                    continue;
                }
                Inbound::Closed => return Ok(()),
                Inbound::Idle => {
                    if let Some(idle) = self.options.idle_timeout {
                        if last_activity.elapsed() >= idle {
                            debug!(?idle, "closing idle connection");
                            return Ok(());
                        }
                    }
                    continue;
                }
            };

            self.in_flight.fetch_add(1, Ordering::SeqCst);
            let reply = self.process(request);
            let sent = self.send_reply(socket, &reply);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            sent?;
            last_activity = Instant::now();
        }
    }

    fn send_reply<R: Read + PendingInput, W: Write>(
        &self,
        socket: &mut RepSocket<R, W>,
        reply: &Message,
    ) -> Result<()> {
        match socket.send(reply) {
            Err(ChannelError::Encode(reason)) => {
                warn!(%reason, "reply not encodable, sending fault");
                socket.send(&self.sealed_fault(Fault::Encode, reason))
            }
            other => other,
        }
    }

    /// Fault reply for a request that opened, sealed like a normal reply so
    /// the client can tell it from one forged on the path. Falls back to a
    /// clear fault if sealing fails.
    fn sealed_fault(&self, fault: Fault, reason: String) -> Message {
        let mut header = Header::new(self.envelope.mode()).with_id(&self.node_id);
        header.fault = Some(fault);
        let detail = Value::map([("message", Value::String(reason.clone()))]);
        self.envelope
            .seal(header, detail)
            .unwrap_or_else(|_| Message::fault(fault, reason))
    }

    /// Turn one decoded request into its reply. Never fails: every failure
    /// becomes a fault reply.
    fn process(&self, request: Message) -> Message {
        let sender = request.header.id.clone().unwrap_or_default();
        let payload = match self.envelope.open(request) {
            Ok(payload) => payload,
            Err(err) if err.is_integrity() => {
                warn!(%sender, error = %err, "rejecting request");
                return Message::fault(Fault::Integrity, err.to_string());
            }
            Err(err) => return Message::fault(Fault::Malformed, err.to_string()),
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| self.handler.dispatch(payload)));
        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(DispatchError::Unencodable(reason))) => {
                return self.sealed_fault(Fault::Encode, reason);
            }
            Ok(Err(DispatchError::Failed(reason))) => {
                warn!(%sender, %reason, "handler failed");
                return self.sealed_fault(Fault::Handler, reason);
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!(%sender, %reason, "handler panicked");
                return self.sealed_fault(Fault::Handler, format!("handler panicked: {reason}"));
            }
        };

        match self
            .envelope
            .seal(Header::new(self.envelope.mode()).with_id(&self.node_id), result)
        {
            Ok(reply) => reply,
            Err(err) => self.sealed_fault(Fault::Encode, err.to_string()),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl<H> std::fmt::Debug for ReplyServer<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyServer")
            .field("node_id", &self.node_id)
            .field("envelope", &self.envelope)
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::time::Duration;

    use bytes::BytesMut;
    use minionlink_crypt::KeyMaterial;
    use minionlink_frame::{decode_frame, encode_frame, encode_message, FrameKind};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    const TEST_POLL: Duration = Duration::from_millis(20);

    type DispatchResult = std::result::Result<Value, DispatchError>;

    fn echo(payload: Value) -> std::result::Result<Value, DispatchError> {
        Ok(payload)
    }

    fn wire(messages: &[(FrameKind, Message)]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for (kind, message) in messages {
            encode_frame(*kind, &encode_message(message).unwrap(), &mut buf).unwrap();
        }
        buf.to_vec()
    }

    fn replies(out: &[u8]) -> Vec<Message> {
        let mut buf = BytesMut::from(out);
        let mut replies = Vec::new();
        while let Some(frame) = decode_frame(&mut buf, usize::MAX).unwrap() {
            assert_eq!(frame.kind, FrameKind::Reply);
            replies.push(frame.message().unwrap());
        }
        assert!(buf.is_empty());
        replies
    }

    /// Feed one request through `serve_socket` and return the replies written.
    fn run_one<H: Handler>(server: &ReplyServer<H>, request: (FrameKind, Message)) -> Vec<Message> {
        let mut out = Vec::new();
        let mut socket = RepSocket::new(
            Cursor::new(wire(&[request])),
            &mut out,
            FrameConfig::new(4096),
        );
        server.serve_socket(&mut socket, &Shutdown::new()).unwrap();
        drop(socket);
        replies(&out)
    }

    #[test]
    fn echoes_in_clear_mode() {
        let server = ReplyServer::new(Envelope::clear(), echo);
        let got = run_one(&server, (FrameKind::Request, Message::clear(Value::from("ping"))));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload, Value::from("ping"));
        assert_eq!(got[0].header.id.as_deref(), Some("master"));
    }

    #[test]
    fn handler_error_is_handler_fault() {
        let server = ReplyServer::new(Envelope::clear(), |_: Value| -> DispatchResult {
            Err(DispatchError::failed("no such function"))
        });
        let got = run_one(&server, (FrameKind::Request, Message::clear(Value::Nil)));
        assert_eq!(
            got[0].as_fault(),
            Some((Fault::Handler, "no such function".to_string()))
        );
    }

    #[test]
    fn panic_is_handler_fault() {
        let server = ReplyServer::new(Envelope::clear(), |_: Value| -> DispatchResult {
            panic!("boom")
        });
        let got = run_one(&server, (FrameKind::Request, Message::clear(Value::Nil)));
        let (fault, message) = got[0].as_fault().unwrap();
        assert_eq!(fault, Fault::Handler);
        assert!(message.contains("boom"));
    }

    #[test]
    fn garbage_body_is_malformed_fault() {
        let server = ReplyServer::new(Envelope::clear(), echo);
        let mut buf = BytesMut::new();
        encode_frame(FrameKind::Request, b"\xc1\xc1", &mut buf).unwrap();
        let mut out = Vec::new();
        let mut socket = RepSocket::new(Cursor::new(buf.to_vec()), &mut out, FrameConfig::default());
        server.serve_socket(&mut socket, &Shutdown::new()).unwrap();
        drop(socket);

        let got = replies(&out);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].as_fault().map(|f| f.0), Some(Fault::Malformed));
    }

    #[test]
    fn wrong_key_is_integrity_fault() {
        let server_key = KeyMaterial::from_bytes(&[1; 32]).unwrap();
        let client_key = KeyMaterial::from_bytes(&[2; 32]).unwrap();
        let server = ReplyServer::new(Envelope::aes(&server_key), echo);
        let request = Envelope::aes(&client_key)
            .seal(Header::clear().with_id("minion-1"), Value::from("x"))
            .unwrap();

        let got = run_one(&server, (FrameKind::Request, request));
        assert_eq!(got[0].as_fault().map(|f| f.0), Some(Fault::Integrity));
    }

    #[test]
    fn clear_request_to_aes_server_is_integrity_fault() {
        let key = KeyMaterial::from_bytes(&[1; 32]).unwrap();
        let server = ReplyServer::new(Envelope::aes(&key), echo);
        let got = run_one(&server, (FrameKind::Request, Message::clear(Value::from("x"))));
        assert_eq!(got[0].as_fault().map(|f| f.0), Some(Fault::Integrity));
    }

    #[test]
    fn aes_reply_opens_with_shared_key() {
        let key = KeyMaterial::from_bytes(&[3; 32]).unwrap();
        let envelope = Envelope::aes(&key);
        let server = ReplyServer::new(envelope.clone(), |_: Value| -> DispatchResult {
            Ok(Value::map([("result", "pong")]))
        });
        let request = envelope
            .seal(Header::clear().with_id("minion-1"), Value::map([("cmd", "ping")]))
            .unwrap();

        let got = run_one(&server, (FrameKind::Request, request));
        let payload = envelope.open(got[0].clone()).unwrap();
        assert_eq!(payload.get("result").and_then(Value::as_str), Some("pong"));
    }

    #[test]
    fn handler_fault_is_sealed_on_aes_channel() {
        let key = KeyMaterial::from_bytes(&[4; 32]).unwrap();
        let envelope = Envelope::aes(&key);
        let server = ReplyServer::new(envelope.clone(), |_: Value| -> DispatchResult {
            Err(DispatchError::failed("no such module"))
        });
        let request = envelope
            .seal(Header::clear().with_id("minion-1"), Value::Nil)
            .unwrap();

        let got = run_one(&server, (FrameKind::Request, request));
        assert_eq!(got[0].header.crypt, minionlink_frame::CryptMode::Aes);
        assert_eq!(got[0].header.fault, Some(Fault::Handler));
        let detail = envelope.open(got[0].clone()).unwrap();
        assert_eq!(detail.get("message").and_then(Value::as_str), Some("no such module"));
    }

    #[test]
    fn non_request_frame_is_malformed_fault() {
        let server = ReplyServer::new(Envelope::clear(), echo);
        let got = run_one(&server, (FrameKind::Event, Message::clear(Value::Nil)));
        assert_eq!(got[0].as_fault().map(|f| f.0), Some(Fault::Malformed));
    }

    #[test]
    fn pipelined_requests_are_a_protocol_violation() {
        let server = ReplyServer::new(Envelope::clear(), echo);
        let input = wire(&[
            (FrameKind::Request, Message::clear(Value::from("a"))),
            (FrameKind::Request, Message::clear(Value::from("b"))),
        ]);
        let mut out = Vec::new();
        let mut socket = RepSocket::new(Cursor::new(input), &mut out, FrameConfig::default());

        let err = server.serve_socket(&mut socket, &Shutdown::new()).unwrap_err();
        assert!(matches!(err, ChannelError::ProtocolViolation(_)));
    }

    #[test]
    fn serve_reports_pipelining_connection() {
        use std::io::{Read as _, Write as _};

        let server = ReplyServer::new(Envelope::clear(), echo).with_options(ServerOptions {
            poll_interval: TEST_POLL,
            ..ServerOptions::default()
        });
        let listener =
            WireListener::bind(&minionlink_transport::Endpoint::tcp("127.0.0.1", 0)).unwrap();
        let shutdown = Shutdown::new();

        let result = std::thread::scope(|scope| {
            let serving = scope.spawn(|| server.serve(&listener, &shutdown));

            let mut client =
                WireStream::connect(listener.endpoint(), Duration::from_secs(2)).unwrap();
            client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let input = wire(&[
                (FrameKind::Request, Message::clear(Value::from("a"))),
                (FrameKind::Request, Message::clear(Value::from("b"))),
            ]);
            client.write_all(&input).unwrap();
            let mut received = Vec::new();
            let _ = client.read_to_end(&mut received);
            assert!(received.is_empty(), "no reply once alternation is broken");

            shutdown.trigger();
            serving.join().unwrap()
        });

        assert!(matches!(result, Err(ChannelError::ProtocolViolation(_))));
        assert_eq!(server.protocol_violations(), 1);
        assert_eq!(server.state(), ServerState::Stopped);
    }

    /// Randomised dispatch outcomes: normal results, errors, panics and
    /// results too large for the wire. Every request gets exactly one reply.
    #[test]
    fn exactly_one_reply_for_random_dispatch_outcomes() {
        let mut rng = StdRng::seed_from_u64(0xC0FFEE);
        let mut seen = [0usize; 4];

        for case in 0..1000u32 {
            let outcome: u8 = rng.gen_range(0..4);
            seen[outcome as usize] += 1;
            let size = rng.gen_range(8192..16384);

            let server = ReplyServer::new(Envelope::clear(), move |payload: Value| match outcome {
                0 => Ok(payload),
                1 => Err(DispatchError::failed("refused")),
                2 => panic!("dispatch panic"),
                _ => Ok(Value::Binary(vec![0; size])),
            });

            let got = run_one(&server, (FrameKind::Request, Message::clear(Value::from(i64::from(case)))));
            assert_eq!(got.len(), 1, "case {case} outcome {outcome}");
            let expected_fault = match outcome {
                0 => None,
                1 | 2 => Some(Fault::Handler),
                _ => Some(Fault::Encode),
            };
            assert_eq!(got[0].as_fault().map(|f| f.0), expected_fault);
        }
        assert!(seen.iter().all(|n| *n > 100));
    }

    #[test]
    fn state_transitions() {
        let server = ReplyServer::new(Envelope::clear(), echo).with_options(ServerOptions {
            poll_interval: TEST_POLL,
            ..ServerOptions::default()
        });
        assert_eq!(server.state(), ServerState::Idle);

        let listener =
            WireListener::bind(&minionlink_transport::Endpoint::tcp("127.0.0.1", 0)).unwrap();
        let shutdown = Shutdown::new();
        std::thread::scope(|scope| {
            scope.spawn(|| server.serve(&listener, &shutdown).unwrap());
            let deadline = Instant::now() + Duration::from_secs(2);
            while server.state() != ServerState::Listening && Instant::now() < deadline {
                std::thread::sleep(TEST_POLL);
            }
            assert_eq!(server.state(), ServerState::Listening);
            shutdown.trigger();
        });
        assert_eq!(server.state(), ServerState::Stopped);
    }
}
