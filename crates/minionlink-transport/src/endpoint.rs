use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, TransportError};

/// The socket implementation selected by an endpoint's scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// `tcp://host:port`
    Tcp,
    /// `ipc:///path/to/socket`
    Ipc,
}

impl TransportKind {
    /// URI scheme for this transport.
    pub fn scheme(self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Ipc => "ipc",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// A transport-qualified address such as `tcp://127.0.0.1:4506`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Ipc(PathBuf),
}

impl Endpoint {
    /// Build a TCP endpoint.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Build a Unix domain socket endpoint.
    pub fn ipc(path: impl AsRef<Path>) -> Self {
        Endpoint::Ipc(path.as_ref().to_path_buf())
    }

    /// Transport kind resolved from the scheme.
    pub fn kind(&self) -> TransportKind {
        match self {
            Endpoint::Tcp { .. } => TransportKind::Tcp,
            Endpoint::Ipc(_) => TransportKind::Ipc,
        }
    }

    /// Resolve a TCP endpoint into socket addresses.
    pub(crate) fn socket_addrs(&self) -> Result<Vec<SocketAddr>> {
        match self {
            Endpoint::Tcp { host, port } => {
                let addrs: Vec<SocketAddr> = (host.as_str(), *port)
                    .to_socket_addrs()
                    .map_err(|e| TransportError::InvalidEndpoint {
                        input: self.to_string(),
                        reason: format!("cannot resolve host: {e}"),
                    })?
                    .collect();
                if addrs.is_empty() {
                    return Err(TransportError::InvalidEndpoint {
                        input: self.to_string(),
                        reason: "host resolved to no addresses".to_string(),
                    });
                }
                Ok(addrs)
            }
            Endpoint::Ipc(_) => Err(TransportError::InvalidEndpoint {
                input: self.to_string(),
                reason: "ipc endpoints have no socket address".to_string(),
            }),
        }
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(input: &str) -> Result<Self> {
        let invalid = |reason: &str| TransportError::InvalidEndpoint {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme (expected tcp:// or ipc://)"))?;

        match scheme {
            "tcp" => {
                let (host, port) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| invalid("missing port"))?;
                let host = host.trim_start_matches('[').trim_end_matches(']');
                if host.is_empty() {
                    return Err(invalid("missing host"));
                }
                let port: u16 = port.parse().map_err(|_| invalid("invalid port"))?;
                Ok(Endpoint::tcp(host, port))
            }
            "ipc" => {
                let path = Path::new(rest);
                if !path.is_absolute() {
                    return Err(invalid("ipc path must be absolute"));
                }
                Ok(Endpoint::ipc(path))
            }
            other => Err(invalid(&format!("unsupported scheme '{other}'"))),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } if host.contains(':') => {
                write!(f, "tcp://[{host}]:{port}")
            }
            Endpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Endpoint::Ipc(path) => write!(f, "ipc://{}", path.display()),
        }
    }
}
