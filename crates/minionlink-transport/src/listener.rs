use std::net::TcpListener;
use std::time::Duration;

use tracing::{debug, info};

use crate::endpoint::{Endpoint, TransportKind};
use crate::error::{Result, TransportError};
use crate::stream::WireStream;

/// A bound, listening socket for reply and publish servers.
///
/// The listener is non-blocking so several forked worker processes can share
/// one descriptor: every worker polls it and whichever wins `accept()` gets
/// the connection.
pub struct WireListener {
    inner: WireListenerInner,
    endpoint: Endpoint,
}

enum WireListenerInner {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(crate::uds::UnixDomainSocket),
}

impl WireListener {
    /// Bind to `endpoint`. Fails immediately with [`TransportError::Bind`] if
    /// the address is taken; binding is never retried.
    pub fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp { .. } => {
                let addrs = endpoint.socket_addrs()?;
                let listener =
                    TcpListener::bind(addrs.as_slice()).map_err(|e| TransportError::Bind {
                        endpoint: endpoint.to_string(),
                        source: e,
                    })?;
                listener.set_nonblocking(true)?;
                let local = listener.local_addr()?;
                let bound = Endpoint::tcp(local.ip().to_string(), local.port());
                info!(endpoint = %bound, "listening on tcp");
                Ok(Self {
                    inner: WireListenerInner::Tcp(listener),
                    endpoint: bound,
                })
            }
            #[cfg(unix)]
            Endpoint::Ipc(path) => {
                let socket = crate::uds::UnixDomainSocket::bind(path)?;
                socket.set_nonblocking(true)?;
                Ok(Self {
                    inner: WireListenerInner::Unix(socket),
                    endpoint: endpoint.clone(),
                })
            }
            #[cfg(not(unix))]
            Endpoint::Ipc(_) => Err(TransportError::Bind {
                endpoint: endpoint.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "ipc endpoints require Unix domain sockets",
                ),
            }),
        }
    }

    /// The bound endpoint. For `tcp://host:0` this carries the assigned port.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Transport kind of this listener.
    pub fn kind(&self) -> TransportKind {
        self.endpoint.kind()
    }

    /// Try to accept one pending connection without waiting.
    pub fn try_accept(&self) -> Result<Option<WireStream>> {
        match &self.inner {
            WireListenerInner::Tcp(listener) => match listener.accept() {
                Ok((stream, addr)) => {
                    stream.set_nonblocking(false)?;
                    stream.set_nodelay(true)?;
                    debug!(%addr, "accepted tcp connection");
                    Ok(Some(WireStream::from_tcp(stream)))
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => Ok(None),
                Err(err) => Err(TransportError::Accept(err)),
            },
            #[cfg(unix)]
            WireListenerInner::Unix(socket) => socket.accept(),
        }
    }

    /// Wait up to `timeout` for a connection.
    ///
    /// Returns `Ok(None)` on timeout, on signal interruption, or when another
    /// process sharing the descriptor won the race for the connection.
    #[cfg(unix)]
    pub fn accept_timeout(&self, timeout: Duration) -> Result<Option<WireStream>> {
        use std::os::fd::AsRawFd;

        let mut pfd = libc::pollfd {
            fd: self.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

        // SAFETY: `pfd` points to one valid pollfd for the duration of the call
        // and the descriptor stays open while `self` is borrowed.
        let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(TransportError::Accept(err));
        }
        if rc == 0 {
            return Ok(None);
        }
        self.try_accept()
    }

    /// Wait up to `timeout` for a connection, polling the non-blocking
    /// listener.
    #[cfg(not(unix))]
    pub fn accept_timeout(&self, timeout: Duration) -> Result<Option<WireStream>> {
        const STEP: Duration = Duration::from_millis(10);

        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(stream) = self.try_accept()? {
                return Ok(Some(stream));
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            std::thread::sleep(STEP.min(remaining));
        }
    }
}

#[cfg(unix)]
impl std::os::fd::AsRawFd for WireListener {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        match &self.inner {
            WireListenerInner::Tcp(listener) => listener.as_raw_fd(),
            WireListenerInner::Unix(socket) => socket.as_raw_fd(),
        }
    }
}

impl std::fmt::Debug for WireListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireListener")
            .field("endpoint", &self.endpoint.to_string())
            .finish()
    }
}
