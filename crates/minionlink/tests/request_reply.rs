use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use minionlink::channel::ServerState;
use minionlink::frame::{FrameKind, FrameReader, FrameWriter, Message};
use minionlink::transport::WireStream;
use minionlink::{
    ChannelConfig, ChannelError, DispatchError, Endpoint, Envelope, Fault, KeyMaterial,
    ReplyServer, ReqChannel, ServerOptions, Shutdown, Value, WireListener,
};

type DispatchResult = Result<Value, DispatchError>;

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "minionlink-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn dispatch(payload: Value) -> DispatchResult {
    match payload.get("cmd").and_then(Value::as_str) {
        Some("ping") => Ok(Value::map([("result", "pong")])),
        Some("sleep") => {
            thread::sleep(Duration::from_millis(600));
            Ok(Value::map([("result", "slept")]))
        }
        Some("slow") => {
            thread::sleep(Duration::from_millis(300));
            Ok(Value::map([("result", "done")]))
        }
        Some("fail") => Err(DispatchError::failed("no such module")),
        _ => Ok(payload),
    }
}

struct Running {
    endpoint: Endpoint,
    shutdown: Shutdown,
    server: Arc<ReplyServer<fn(Value) -> DispatchResult>>,
    handle: Option<thread::JoinHandle<Result<(), ChannelError>>>,
}

impl Running {
    fn start(endpoint: &Endpoint, envelope: Envelope) -> Self {
        let listener = WireListener::bind(endpoint).expect("bind should succeed");
        let endpoint = listener.endpoint().clone();
        let options = ServerOptions {
            poll_interval: Duration::from_millis(20),
            ..ServerOptions::default()
        };
        let server = Arc::new(
            ReplyServer::new(envelope, dispatch as fn(Value) -> DispatchResult).with_options(options),
        );
        let shutdown = Shutdown::new();
        let handle = {
            let server = Arc::clone(&server);
            let shutdown = shutdown.clone();
            thread::spawn(move || server.serve(&listener, &shutdown))
        };
        Self {
            endpoint,
            shutdown,
            server,
            handle: Some(handle),
        }
    }
}

impl Running {
    /// Stop serving and hand back what `serve` returned.
    fn stop(mut self) -> Result<(), ChannelError> {
        self.shutdown.trigger();
        let handle = self.handle.take().expect("server thread should be running");
        handle.join().expect("server thread should not panic")
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.shutdown.trigger();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn clear_channel(endpoint: &Endpoint) -> ReqChannel {
    let config = ChannelConfig::builder(endpoint.to_string(), "minion-1")
        .insecure_clear()
        .build()
        .expect("config should build");
    ReqChannel::new(config).expect("channel should build")
}

fn aes_channel(endpoint: &Endpoint, key: &KeyMaterial) -> ReqChannel {
    let config = ChannelConfig::builder(endpoint.to_string(), "minion-1")
        .key(key.clone())
        .build()
        .expect("config should build");
    ReqChannel::new(config).expect("channel should build")
}

fn ping() -> Value {
    Value::map([("id", Value::from(42)), ("cmd", Value::from("ping"))])
}

#[test]
fn clear_ping_over_tcp() {
    let running = Running::start(&Endpoint::tcp("127.0.0.1", 0), Envelope::clear());
    let mut channel = clear_channel(&running.endpoint);

    let reply = channel.send(ping(), Duration::from_secs(5)).unwrap();
    assert_eq!(reply, Value::map([("result", "pong")]));
}

#[cfg(unix)]
#[test]
fn clear_ping_over_ipc() {
    let dir = unique_temp_dir("ipc");
    let running = Running::start(&Endpoint::ipc(dir.join("master.sock")), Envelope::clear());
    let mut channel = clear_channel(&running.endpoint);

    for _ in 0..3 {
        let reply = channel.send(ping(), Duration::from_secs(5)).unwrap();
        assert_eq!(reply.get("result").and_then(Value::as_str), Some("pong"));
    }
    drop(running);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn encrypted_roundtrip_and_state() {
    let key = KeyMaterial::generate();
    let running = Running::start(&Endpoint::tcp("127.0.0.1", 0), Envelope::aes(&key));
    let mut channel = aes_channel(&running.endpoint, &key);

    let payload = Value::map([
        ("cmd", Value::from("echo")),
        ("blob", Value::Binary(vec![0xAB; 4096])),
    ]);
    assert_eq!(channel.send(payload.clone(), Duration::from_secs(5)).unwrap(), payload);
    assert_eq!(running.server.state(), ServerState::Listening);
}

#[test]
fn handler_failure_is_a_remote_fault_and_connection_survives() {
    let running = Running::start(&Endpoint::tcp("127.0.0.1", 0), Envelope::clear());
    let mut channel = clear_channel(&running.endpoint);

    let err = channel
        .send(Value::map([("cmd", "fail")]), Duration::from_secs(5))
        .unwrap_err();
    match err {
        ChannelError::Remote { fault, message } => {
            assert_eq!(fault, Fault::Handler);
            assert!(message.contains("no such module"));
        }
        other => panic!("expected remote fault, got {other:?}"),
    }
    assert!(channel.is_connected());
    assert!(channel.send(ping(), Duration::from_secs(5)).is_ok());
}

#[test]
fn wrong_key_is_an_integrity_fault() {
    let running = Running::start(
        &Endpoint::tcp("127.0.0.1", 0),
        Envelope::aes(&KeyMaterial::generate()),
    );
    let mut channel = aes_channel(&running.endpoint, &KeyMaterial::generate());

    let err = channel.send(ping(), Duration::from_secs(5)).unwrap_err();
    assert!(
        matches!(err, ChannelError::Remote { fault: Fault::Integrity, .. }),
        "{err:?}"
    );
}

#[test]
fn clear_client_against_encrypted_server_is_refused() {
    let running = Running::start(
        &Endpoint::tcp("127.0.0.1", 0),
        Envelope::aes(&KeyMaterial::generate()),
    );
    let mut channel = clear_channel(&running.endpoint);

    let err = channel.send(ping(), Duration::from_secs(5)).unwrap_err();
    assert!(
        matches!(err, ChannelError::Remote { fault: Fault::Integrity, .. }),
        "{err:?}"
    );
}

#[test]
fn timeout_then_recover_on_a_fresh_connection() {
    let running = Running::start(&Endpoint::tcp("127.0.0.1", 0), Envelope::clear());
    let mut channel = clear_channel(&running.endpoint);

    let started = Instant::now();
    let err = channel
        .send(Value::map([("cmd", "sleep")]), Duration::from_millis(200))
        .unwrap_err();
    assert!(matches!(err, ChannelError::Timeout(_)), "{err:?}");
    assert!(started.elapsed() < Duration::from_millis(550));
    assert!(!channel.is_connected());

    let reply = channel.send(ping(), Duration::from_secs(5)).unwrap();
    assert_eq!(reply, Value::map([("result", "pong")]));
}

#[test]
fn concurrent_clients_are_served_independently() {
    let running = Running::start(&Endpoint::tcp("127.0.0.1", 0), Envelope::clear());
    let endpoint = running.endpoint.clone();

    let clients: Vec<_> = (0..8)
        .map(|n| {
            let endpoint = endpoint.clone();
            thread::spawn(move || {
                let mut channel = clear_channel(&endpoint);
                let payload = Value::map([("n", Value::from(n))]);
                channel.send(payload.clone(), Duration::from_secs(5)).unwrap() == payload
            })
        })
        .collect();
    for client in clients {
        assert!(client.join().unwrap());
    }
}

#[test]
fn second_bind_on_same_port_fails() {
    let running = Running::start(&Endpoint::tcp("127.0.0.1", 0), Envelope::clear());
    let err = WireListener::bind(&running.endpoint).unwrap_err();
    assert!(matches!(
        ChannelError::from(err),
        ChannelError::Bind { .. }
    ));
}

#[test]
fn request_sent_during_dispatch_is_a_protocol_violation() {
    let running = Running::start(&Endpoint::tcp("127.0.0.1", 0), Envelope::clear());
    let server = Arc::clone(&running.server);

    let stream = WireStream::connect(&running.endpoint, Duration::from_secs(2))
        .expect("connect should succeed");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout should apply");
    let mut reader = FrameReader::new(stream.try_clone().expect("stream should clone"));
    let mut writer = FrameWriter::new(stream);

    writer
        .write_message(FrameKind::Request, &Message::clear(Value::map([("cmd", "slow")])))
        .expect("first request should be written");
    thread::sleep(Duration::from_millis(100));
    writer
        .write_message(FrameKind::Request, &Message::clear(ping()))
        .expect("second request should be written");

    let mut replies = 0;
    while reader.read_frame().is_ok() {
        replies += 1;
    }
    assert_eq!(replies, 0, "the connection closes without answering either request");

    let result = running.stop();
    assert!(
        matches!(result, Err(ChannelError::ProtocolViolation(_))),
        "{result:?}"
    );
    assert_eq!(server.protocol_violations(), 1);
}
