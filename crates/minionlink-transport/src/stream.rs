use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};

/// A connected socket stream that implements Read + Write.
///
/// This is the fundamental I/O type returned by transport operations.
/// It wraps either a TCP stream or a Unix domain socket stream.
pub struct WireStream {
    inner: WireStreamInner,
}

enum WireStreamInner {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
}

impl Read for WireStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            WireStreamInner::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            WireStreamInner::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for WireStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            WireStreamInner::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            WireStreamInner::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            WireStreamInner::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            WireStreamInner::Unix(stream) => stream.flush(),
        }
    }
}

impl WireStream {
    /// Connect to an endpoint, waiting at most `timeout` for the connection
    /// to be established.
    pub fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<Self> {
        let connect_err = |source: std::io::Error| TransportError::Connect {
            endpoint: endpoint.to_string(),
            source,
        };

        match endpoint {
            Endpoint::Tcp { .. } => {
                let mut last_err = None;
                for addr in endpoint.socket_addrs()? {
                    match TcpStream::connect_timeout(&addr, timeout) {
                        Ok(stream) => {
                            stream.set_nodelay(true).map_err(connect_err)?;
                            debug!(%endpoint, "connected over tcp");
                            return Ok(Self::from_tcp(stream));
                        }
                        Err(err) => last_err = Some(err),
                    }
                }
                Err(connect_err(last_err.unwrap_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no address to connect")
                })))
            }
            #[cfg(unix)]
            Endpoint::Ipc(path) => {
                let stream = crate::uds::UnixDomainSocket::connect(path)?;
                Ok(stream)
            }
            #[cfg(not(unix))]
            Endpoint::Ipc(_) => Err(connect_err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "ipc endpoints require Unix domain sockets",
            ))),
        }
    }

    pub(crate) fn from_tcp(stream: TcpStream) -> Self {
        Self {
            inner: WireStreamInner::Tcp(stream),
        }
    }

    #[cfg(unix)]
    pub(crate) fn from_unix(stream: std::os::unix::net::UnixStream) -> Self {
        Self {
            inner: WireStreamInner::Unix(stream),
        }
    }

    /// A connected pair of Unix stream sockets, for parent/child pipes.
    #[cfg(unix)]
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = std::os::unix::net::UnixStream::pair()?;
        Ok((Self::from_unix(a), Self::from_unix(b)))
    }

    /// Set read timeout on the underlying stream.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            WireStreamInner::Tcp(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
            #[cfg(unix)]
            WireStreamInner::Unix(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
        }
    }

    /// Set write timeout on the underlying stream.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            WireStreamInner::Tcp(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
            #[cfg(unix)]
            WireStreamInner::Unix(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
        }
    }

    /// Switch the stream between blocking and non-blocking mode.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        match &self.inner {
            WireStreamInner::Tcp(stream) => stream.set_nonblocking(nonblocking).map_err(Into::into),
            #[cfg(unix)]
            WireStreamInner::Unix(stream) => {
                stream.set_nonblocking(nonblocking).map_err(Into::into)
            }
        }
    }

    /// Try to clone this stream (creates a new file descriptor).
    pub fn try_clone(&self) -> Result<Self> {
        match &self.inner {
            WireStreamInner::Tcp(stream) => Ok(Self::from_tcp(stream.try_clone()?)),
            #[cfg(unix)]
            WireStreamInner::Unix(stream) => Ok(Self::from_unix(stream.try_clone()?)),
        }
    }

    /// Shut down both halves of the connection.
    ///
    /// Errors are ignored: the peer may already be gone.
    pub fn close(&self) {
        let _ = match &self.inner {
            WireStreamInner::Tcp(stream) => stream.shutdown(Shutdown::Both),
            #[cfg(unix)]
            WireStreamInner::Unix(stream) => stream.shutdown(Shutdown::Both),
        };
    }

    /// Enable TCP keepalive so dead peers are eventually detected.
    ///
    /// No-op for Unix domain sockets.
    #[cfg(unix)]
    pub fn set_keepalive(&self, enabled: bool) -> Result<()> {
        use std::os::fd::AsRawFd;

        let fd = match &self.inner {
            WireStreamInner::Tcp(stream) => stream.as_raw_fd(),
            WireStreamInner::Unix(_) => return Ok(()),
        };
        let value: libc::c_int = i32::from(enabled);

        // SAFETY: `fd` is an open TCP socket owned by this stream and `value`
        // is a valid readable c_int for the length passed.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_KEEPALIVE,
                (&value as *const libc::c_int).cast::<libc::c_void>(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(TransportError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// True if the peer sent bytes that nobody has read yet. Never blocks.
    ///
    /// A peer that closed its side reports `false`: end of stream is not
    /// input.
    #[cfg(unix)]
    pub fn has_unread_input(&self) -> Result<bool> {
        use std::os::fd::AsRawFd;

        let mut byte = [0u8; 1];
        loop {
            // SAFETY: `byte` is valid writable memory for its full length and
            // the descriptor stays open while `self` is borrowed. MSG_PEEK
            // leaves the byte queued for the next read.
            let rc = unsafe {
                libc::recv(
                    self.as_raw_fd(),
                    byte.as_mut_ptr().cast::<libc::c_void>(),
                    byte.len(),
                    libc::MSG_PEEK | libc::MSG_DONTWAIT,
                )
            };
            if rc >= 0 {
                return Ok(rc > 0);
            }
            let err = std::io::Error::last_os_error();
            match err.kind() {
                std::io::ErrorKind::WouldBlock => return Ok(false),
                std::io::ErrorKind::Interrupted => continue,
                _ => return Err(TransportError::Io(err)),
            }
        }
    }

    /// True if the peer sent bytes that nobody has read yet. Never blocks.
    #[cfg(not(unix))]
    pub fn has_unread_input(&self) -> Result<bool> {
        let WireStreamInner::Tcp(stream) = &self.inner;
        let mut byte = [0u8; 1];
        stream.set_nonblocking(true)?;
        let peeked = stream.peek(&mut byte);
        stream.set_nonblocking(false)?;
        match peeked {
            Ok(n) => Ok(n > 0),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
            Err(err) => Err(TransportError::Io(err)),
        }
    }

    /// Human-readable peer address for logging.
    pub fn peer_label(&self) -> String {
        match &self.inner {
            WireStreamInner::Tcp(stream) => stream
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "tcp:unknown".to_string()),
            #[cfg(unix)]
            WireStreamInner::Unix(_) => "unix".to_string(),
        }
    }
}

#[cfg(unix)]
impl std::os::fd::AsRawFd for WireStream {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        match &self.inner {
            WireStreamInner::Tcp(stream) => std::os::fd::AsRawFd::as_raw_fd(stream),
            WireStreamInner::Unix(stream) => std::os::fd::AsRawFd::as_raw_fd(stream),
        }
    }
}

impl std::fmt::Debug for WireStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            WireStreamInner::Tcp(_) => f.debug_struct("WireStream").field("type", &"tcp").finish(),
            #[cfg(unix)]
            WireStreamInner::Unix(_) => {
                f.debug_struct("WireStream").field("type", &"unix").finish()
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn connect_refused_reports_connect_error() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = WireStream::connect(&Endpoint::tcp("127.0.0.1", port), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }

    #[test]
    fn keepalive_can_be_toggled() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let stream =
            WireStream::connect(&Endpoint::tcp("127.0.0.1", port), Duration::from_secs(1))
                .unwrap();
        stream.set_keepalive(true).unwrap();
        stream.set_keepalive(false).unwrap();
        assert!(stream.peer_label().starts_with("127.0.0.1:"));
    }

    #[test]
    fn unread_input_is_seen_without_consuming_it() {
        let (mut a, mut b) = WireStream::pair().unwrap();
        assert!(!b.has_unread_input().unwrap());

        a.write_all(b"x").unwrap();
        assert!(b.has_unread_input().unwrap());
        let mut buf = [0u8; 1];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"x");
        assert!(!b.has_unread_input().unwrap());

        drop(a);
        assert!(!b.has_unread_input().unwrap(), "end of stream is not input");
    }

    #[test]
    fn pair_carries_bytes_both_ways() {
        let (mut a, mut b) = WireStream::pair().unwrap();
        a.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        b.write_all(b"pong").unwrap();
        a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
        assert_eq!(a.peer_label(), "unix");
    }
}
