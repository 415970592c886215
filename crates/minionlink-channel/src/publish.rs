//! Fire-and-forget fan-out from the master to connected subscribers.
//!
//! A subscriber connects, announces its node id with a sealed `SUBSCRIBE`
//! frame and waits for the publisher's `SUBSCRIBE` acknowledgement. From then
//! on it only reads `EVENT` frames. Nothing is queued: a subscriber that is
//! not registered when an event is published never sees it.
//!
//! In pre-fork mode the master owns no subscriber connections. It forwards
//! every encoded event to each publisher worker over a private socket pair,
//! and the workers write it to the subscribers they accepted.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use minionlink_crypt::Envelope;
use minionlink_frame::{
    encode_message, Fault, Frame, FrameConfig, FrameError, FrameKind, FrameReader, FrameWriter,
    Header, Message, Value,
};
use minionlink_transport::{Endpoint, WireListener, WireStream};
use tracing::{debug, info, warn};

use crate::config::{ChannelConfig, ServerOptions};
use crate::error::{recv_error, send_error, ChannelError, Result};
use crate::shutdown::Shutdown;

#[cfg(unix)]
use crate::affinity::{ProcessManager, WorkerContext};

/// Header meta key listing the node ids an event is meant for.
pub const TARGETS_META: &str = "tgt";

/// Room for the relay wrapper around an event on master-to-worker pipes.
#[cfg(unix)]
const RELAY_SLACK: usize = 64 * 1024;

struct Subscriber {
    id: String,
    writer: FrameWriter<WireStream>,
}

/// Registered subscriber connections of one process.
#[derive(Default)]
pub struct Broadcaster {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered subscribers.
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// Acknowledge `id` on `stream` and register it.
    ///
    /// Both happen under the registry lock, so any broadcast that starts
    /// after the subscriber saw its ack includes it.
    fn register(&self, id: String, stream: WireStream, ack: &Message, config: FrameConfig) -> Result<()> {
        let mut writer = FrameWriter::with_config(stream, config);
        let mut subscribers = self.lock();
        writer.write_message(FrameKind::Subscribe, ack).map_err(send_error)?;
        debug!(subscriber = %id, peer = %writer.get_ref().peer_label(), "subscriber registered");
        subscribers.push(Subscriber { id, writer });
        Ok(())
    }

    /// Write one encoded event to every matching subscriber.
    ///
    /// `targets` of `None` means everyone. Subscribers whose write fails are
    /// dropped. Returns the number of subscribers the event was written to.
    pub fn broadcast(&self, body: &Bytes, targets: Option<&[String]>) -> usize {
        let frame = Frame::new(FrameKind::Event, body.clone());
        let mut delivered = 0;
        self.lock().retain_mut(|subscriber| {
            if let Some(targets) = targets {
                if !targets.iter().any(|t| *t == subscriber.id) {
                    return true;
                }
            }
            match subscriber.writer.write_frame(&frame) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(err) => {
                    warn!(subscriber = %subscriber.id, error = %err, "dropping subscriber");
                    subscriber.writer.get_ref().close();
                    false
                }
            }
        });
        delivered
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<String> = self.lock().iter().map(|s| s.id.clone()).collect();
        f.debug_struct("Broadcaster").field("subscribers", &ids).finish()
    }
}

/// Shared state of one accept loop.
#[derive(Clone)]
struct Acceptor {
    envelope: Envelope,
    node_id: String,
    options: ServerOptions,
    frame_config: FrameConfig,
}

impl Acceptor {
    fn new(config: &ChannelConfig, options: ServerOptions) -> Result<Self> {
        Ok(Self {
            envelope: config.envelope()?,
            node_id: config.node_id().to_string(),
            options,
            frame_config: FrameConfig::new(config.max_payload_size()),
        })
    }

    #[cfg(unix)]
    fn relay_config(&self) -> FrameConfig {
        self.frame_config.with_slack(RELAY_SLACK)
    }

    /// Accept subscribers on `listener` until `shutdown` trips.
    ///
    /// Each hello is awaited on its own scoped thread, so a peer that
    /// connects and stays silent only holds up itself.
    fn run(&self, listener: &WireListener, broadcaster: &Broadcaster, shutdown: &Shutdown) {
        let admitting = AtomicUsize::new(0);
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
                let occupied = broadcaster.count() + admitting.load(Ordering::SeqCst);
                if occupied >= self.options.max_connections {
                    warn!(
                        peer = %stream.peer_label(),
                        max = self.options.max_connections,
                        "subscriber limit reached, closing"
                    );
                    stream.close();
                    continue;
                }

                admitting.fetch_add(1, Ordering::SeqCst);
                let admitting = &admitting;
                scope.spawn(move || {
                    let peer = stream.peer_label();
                    if let Err(err) = self.admit(stream, broadcaster) {
                        debug!(%peer, error = %err, "subscriber rejected");
                    }
                    admitting.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });
    }

    /// Read the subscriber's hello and register it.
    fn admit(&self, stream: WireStream, broadcaster: &Broadcaster) -> Result<()> {
        stream.set_read_timeout(Some(self.options.subscribe_timeout))?;
        stream.set_write_timeout(Some(self.options.send_timeout))?;
        let mut reader = FrameReader::with_config(stream.try_clone()?, self.frame_config);

        let hello = match read_hello(&mut reader, &self.envelope, self.options.subscribe_timeout) {
            Ok(id) => id,
            Err(err) => {
                let fault = match &err {
                    ChannelError::Integrity(_) => Some(Fault::Integrity),
                    ChannelError::Decode(_) | ChannelError::ProtocolViolation(_) => {
                        Some(Fault::Malformed)
                    }
                    _ => None,
                };
                if let Some(fault) = fault {
                    let mut writer = FrameWriter::with_config(stream, self.frame_config);
                    let refusal = Message::fault(fault, err.to_string());
                    let _ = writer.write_message(FrameKind::Subscribe, &refusal);
                    writer.get_ref().close();
                } else {
                    stream.close();
                }
                return Err(err);
            }
        };

        let ack = self
            .envelope
            .seal(Header::new(self.envelope.mode()).with_id(&self.node_id), Value::Nil)?;
        let result = broadcaster.register(hello, stream, &ack, self.frame_config);
        if result.is_err() {
            reader.get_ref().close();
        }
        result
    }
}

fn read_hello(
    reader: &mut FrameReader<WireStream>,
    envelope: &Envelope,
    timeout: Duration,
) -> Result<String> {
    let message = reader
        .read_message(FrameKind::Subscribe)
        .map_err(|err| recv_error(err, timeout))?;
    let id = message.header.id.clone().unwrap_or_default();
    envelope.open(message)?;
    if id.is_empty() {
        return Err(ChannelError::ProtocolViolation(
            "subscriber did not announce a node id".to_string(),
        ));
    }
    Ok(id)
}

enum Mode {
    InProcess {
        broadcaster: Arc<Broadcaster>,
        endpoint: Endpoint,
        acceptor: Option<JoinHandle<()>>,
    },
    #[cfg(unix)]
    PreFork {
        manager: ProcessManager,
        pipes: Mutex<Vec<FrameWriter<WireStream>>>,
    },
}

/// Master side of the publish channel.
pub struct PubServer {
    envelope: Envelope,
    node_id: String,
    acceptor: Acceptor,
    shutdown: Shutdown,
    mode: Mode,
}

impl PubServer {
    /// Bind the publish endpoint and accept subscribers on a background
    /// thread of this process.
    pub fn bind(config: &ChannelConfig, options: ServerOptions) -> Result<Self> {
        let listener = WireListener::bind(config.master_uri())?;
        let endpoint = listener.endpoint().clone();
        let acceptor = Acceptor::new(config, options)?;
        let broadcaster = Arc::new(Broadcaster::new());
        let shutdown = Shutdown::new();
        info!(%endpoint, "publish server listening");

        let handle = {
            let acceptor = acceptor.clone();
            let broadcaster = Arc::clone(&broadcaster);
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name("minionlink-pub-accept".to_string())
                .spawn(move || acceptor.run(&listener, &broadcaster, &shutdown))
                .map_err(ChannelError::Process)?
        };

        Ok(Self {
            envelope: acceptor.envelope.clone(),
            node_id: acceptor.node_id.clone(),
            acceptor,
            shutdown,
            mode: Mode::InProcess {
                broadcaster,
                endpoint,
                acceptor: Some(handle),
            },
        })
    }

    /// Bind the publish endpoint and hand the bound listener to a fresh
    /// [`ProcessManager`]. No worker exists yet; call
    /// [`PubServer::spawn_workers`] next.
    #[cfg(unix)]
    pub fn pre_fork(config: &ChannelConfig, options: ServerOptions, wait_for_kill: Duration) -> Result<Self> {
        let manager = ProcessManager::bind(config.master_uri(), wait_for_kill)?;
        let acceptor = Acceptor::new(config, options)?;
        info!(endpoint = %manager.endpoint(), "publish socket bound before fork");
        Ok(Self {
            envelope: acceptor.envelope.clone(),
            node_id: acceptor.node_id.clone(),
            acceptor,
            shutdown: Shutdown::new(),
            mode: Mode::PreFork {
                manager,
                pipes: Mutex::new(Vec::new()),
            },
        })
    }

    /// Fork `count` publisher workers sharing the bound listener.
    ///
    /// Fails with `Config` on a server created by [`PubServer::bind`].
    #[cfg(unix)]
    pub fn spawn_workers(&self, count: usize) -> Result<Vec<u32>> {
        let (manager, pipes) = match &self.mode {
            Mode::PreFork { manager, pipes } => (manager, pipes),
            Mode::InProcess { .. } => {
                return Err(ChannelError::Config(
                    "workers need a publish server created with pre_fork".to_string(),
                ))
            }
        };

        let mut pids = Vec::with_capacity(count);
        for _ in 0..count {
            let (master_end, worker_end) = WireStream::pair()?;
            master_end.set_write_timeout(Some(self.acceptor.options.send_timeout))?;

            let mut pipes = lock_pipes(pipes);
            let mut inherited: Vec<std::os::fd::RawFd> = pipes
                .iter()
                .map(|pipe| std::os::fd::AsRawFd::as_raw_fd(pipe.get_ref()))
                .collect();
            inherited.push(std::os::fd::AsRawFd::as_raw_fd(&master_end));

            let acceptor = &self.acceptor;
            let pid = manager.spawn_worker(move |ctx| {
                for fd in inherited {
                    // SAFETY: `fd` is a master-side pipe end copied into this
                    // child by fork. The child never touches the owning
                    // objects again before `_exit`, so nothing double-closes it.
                    unsafe { libc::close(fd) };
                }
                run_worker(ctx, worker_end, acceptor)
            })?;
            pipes.push(FrameWriter::with_config(master_end, self.acceptor.relay_config()));
            pids.push(pid);
        }
        Ok(pids)
    }

    /// Address subscribers connect to.
    pub fn endpoint(&self) -> &Endpoint {
        match &self.mode {
            Mode::InProcess { endpoint, .. } => endpoint,
            #[cfg(unix)]
            Mode::PreFork { manager, .. } => manager.endpoint(),
        }
    }

    /// Registered subscribers, or `None` in pre-fork mode where they live in
    /// the workers.
    pub fn subscriber_count(&self) -> Option<usize> {
        match &self.mode {
            Mode::InProcess { broadcaster, .. } => Some(broadcaster.count()),
            #[cfg(unix)]
            Mode::PreFork { .. } => None,
        }
    }

    /// The worker manager in pre-fork mode.
    #[cfg(unix)]
    pub fn process_manager(&self) -> Option<&ProcessManager> {
        match &self.mode {
            Mode::PreFork { manager, .. } => Some(manager),
            Mode::InProcess { .. } => None,
        }
    }

    /// Broadcast `payload` to every current subscriber.
    ///
    /// Returns how many receivers the event was handed to: subscribers in
    /// process, workers in pre-fork mode. Zero is not an error.
    pub fn publish(&self, payload: Value) -> Result<usize> {
        self.dispatch(payload, None)
    }

    /// Broadcast `payload` only to subscribers whose node id is in `targets`.
    pub fn publish_to(&self, payload: Value, targets: &[&str]) -> Result<usize> {
        let targets: Vec<String> = targets.iter().map(|t| (*t).to_string()).collect();
        self.dispatch(payload, Some(targets))
    }

    fn dispatch(&self, payload: Value, targets: Option<Vec<String>>) -> Result<usize> {
        let mut header = Header::new(self.envelope.mode()).with_id(&self.node_id);
        if let Some(targets) = &targets {
            header.meta.insert(
                TARGETS_META.to_string(),
                Value::Array(targets.iter().map(|t| Value::from(t.as_str())).collect()),
            );
        }
        let event = self.envelope.seal(header, payload)?;
        let body = encode_message(&event)?;
        let max = self.acceptor.frame_config.max_payload_size;
        if body.len() > max {
            return Err(ChannelError::Encode(
                FrameError::PayloadTooLarge { size: body.len(), max }.to_string(),
            ));
        }

        match &self.mode {
            Mode::InProcess { broadcaster, .. } => {
                Ok(broadcaster.broadcast(&body, targets.as_deref()))
            }
            #[cfg(unix)]
            Mode::PreFork { pipes, .. } => {
                let relay = relay_message(&body, targets.as_deref());
                let mut pipes = lock_pipes(pipes);
                pipes.retain_mut(|pipe| match pipe.write_message(FrameKind::Event, &relay) {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(error = %err, "publisher worker unreachable, dropping its pipe");
                        false
                    }
                });
                Ok(pipes.len())
            }
        }
    }

    /// Stop accepting subscribers and, in pre-fork mode, stop the workers.
    pub fn shutdown(&mut self) -> Result<()> {
        self.shutdown.trigger();
        match &mut self.mode {
            Mode::InProcess { acceptor, .. } => {
                if let Some(handle) = acceptor.take() {
                    let _ = handle.join();
                }
                Ok(())
            }
            #[cfg(unix)]
            Mode::PreFork { manager, pipes } => {
                lock_pipes(pipes).clear();
                manager.shutdown()
            }
        }
    }
}

impl Drop for PubServer {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "publish server shutdown");
        }
    }
}

impl std::fmt::Debug for PubServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubServer")
            .field("endpoint", &self.endpoint().to_string())
            .field("envelope", &self.envelope)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(unix)]
fn lock_pipes(
    pipes: &Mutex<Vec<FrameWriter<WireStream>>>,
) -> MutexGuard<'_, Vec<FrameWriter<WireStream>>> {
    pipes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Wrap an encoded event for the master-to-worker pipe.
#[cfg(unix)]
fn relay_message(body: &Bytes, targets: Option<&[String]>) -> Message {
    let targets = match targets {
        Some(targets) => Value::Array(targets.iter().map(|t| Value::from(t.as_str())).collect()),
        None => Value::Nil,
    };
    Message::clear(Value::map([
        ("event", Value::Binary(body.to_vec())),
        (TARGETS_META, targets),
    ]))
}

#[cfg(unix)]
fn parse_relay(message: &Message) -> Result<(Bytes, Option<Vec<String>>)> {
    let body = message
        .payload
        .get("event")
        .and_then(Value::as_bytes)
        .ok_or_else(|| ChannelError::Decode("relay frame without event".to_string()))?;
    let targets = match message.payload.get(TARGETS_META) {
        Some(Value::Array(items)) => Some(
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        ),
        _ => None,
    };
    Ok((Bytes::copy_from_slice(body), targets))
}

/// Body of a forked publisher worker: accept subscribers on the shared
/// listener and write out whatever the master relays.
#[cfg(unix)]
fn run_worker(ctx: WorkerContext<'_>, pipe: WireStream, acceptor: &Acceptor) -> i32 {
    let shutdown = ctx.shutdown().clone();
    let poll = acceptor.options.poll_interval;
    if let Err(err) = pipe.set_read_timeout(Some(poll)) {
        warn!(error = %err, "worker pipe unusable");
        return 1;
    }
    let mut reader = FrameReader::with_config(pipe, acceptor.relay_config());
    let broadcaster = Broadcaster::new();
    let listener = ctx.listener();
    debug!(index = ctx.index(), "publisher worker started");

    std::thread::scope(|scope| {
        scope.spawn(|| acceptor.run(listener, &broadcaster, &shutdown));

        while !shutdown.is_triggered() {
            let relay = match reader.read_message(FrameKind::Event) {
                Ok(relay) => relay,
                Err(err) if err.is_timeout() => continue,
                Err(err) if err.is_content_error() => {
                    warn!(error = %err, "bad relay frame");
                    continue;
                }
                Err(FrameError::ConnectionClosed) => {
                    debug!("master closed the relay pipe");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "relay pipe failed");
                    break;
                }
            };
            match parse_relay(&relay) {
                Ok((body, targets)) => {
                    broadcaster.broadcast(&body, targets.as_deref());
                }
                Err(err) => warn!(error = %err, "bad relay frame"),
            }
        }
        shutdown.trigger();
    });
    0
}

/// Minion side of the publish channel.
pub struct SubChannel {
    config: ChannelConfig,
    envelope: Envelope,
    reader: FrameReader<WireStream>,
}

impl SubChannel {
    /// Connect, announce this node and wait until the publisher registered
    /// it. Events published after this returns are delivered.
    pub fn connect(config: ChannelConfig) -> Result<Self> {
        let envelope = config.envelope()?;
        let endpoint = config.master_uri().clone();
        let stream = WireStream::connect(&endpoint, config.connect_timeout())?;
        #[cfg(unix)]
        stream.set_keepalive(true)?;
        stream.set_write_timeout(Some(config.connect_timeout()))?;
        stream.set_read_timeout(Some(config.connect_timeout()))?;

        let frame_config = config.frame_config();
        let mut writer = FrameWriter::with_config(stream.try_clone()?, frame_config);
        let mut reader = FrameReader::with_config(stream, frame_config);

        let hello = envelope.seal(
            Header::new(envelope.mode()).with_id(config.node_id()),
            Value::Nil,
        )?;
        writer
            .write_message(FrameKind::Subscribe, &hello)
            .map_err(send_error)?;

        let ack = reader
            .read_message(FrameKind::Subscribe)
            .map_err(|err| recv_error(err, config.connect_timeout()))?;
        if let Some((fault, message)) = ack.as_fault() {
            return Err(ChannelError::Remote { fault, message });
        }
        envelope.open(ack)?;
        debug!(%endpoint, node_id = config.node_id(), "subscribed");

        Ok(Self {
            config,
            envelope,
            reader,
        })
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Wait at most `timeout` for the next event addressed to this node.
    ///
    /// Events targeted at other nodes are skipped. After a `Connection` or
    /// `Decode` error the channel is unusable; reconnect.
    pub fn recv(&mut self, timeout: Duration) -> Result<Value> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ChannelError::Timeout(timeout));
            }
            self.reader.get_ref().set_read_timeout(Some(remaining))?;
            let event = self
                .reader
                .read_message(FrameKind::Event)
                .map_err(|err| recv_error(err, timeout))?;
            if !self.is_addressed(&event.header) {
                continue;
            }
            return Ok(self.envelope.open(event)?);
        }
    }

    /// [`SubChannel::recv`] with the configured default timeout.
    pub fn recv_default(&mut self) -> Result<Value> {
        let timeout = self.config.timeout_default();
        self.recv(timeout)
    }

    /// Disconnect from the publisher.
    pub fn close(self) {
        self.reader.get_ref().close();
    }

    fn is_addressed(&self, header: &Header) -> bool {
        match header.meta.get(TARGETS_META) {
            Some(Value::Array(targets)) => targets
                .iter()
                .any(|t| t.as_str() == Some(self.config.node_id())),
            _ => true,
        }
    }
}

impl std::fmt::Debug for SubChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubChannel")
            .field("config", &self.config)
            .finish()
    }
}
