use std::time::Duration;

use minionlink_crypt::{CryptMode, Envelope, KeyMaterial};
use minionlink_frame::{FrameConfig, DEFAULT_MAX_PAYLOAD};
use minionlink_transport::{Endpoint, TransportKind};

use crate::error::{ChannelError, Result};

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Immutable options for one channel or server, resolved once at construction.
///
/// For a client, `master_uri` is where the master listens; for a server it
/// is the address to bind. Reconfiguring means building a new value.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    master_uri: Endpoint,
    node_id: String,
    crypt_mode: CryptMode,
    timeout_default: Duration,
    connect_timeout: Duration,
    max_payload_size: usize,
    key_material: Option<KeyMaterial>,
}

impl ChannelConfig {
    /// Start building a configuration. The endpoint is parsed in
    /// [`ChannelConfigBuilder::build`].
    pub fn builder(master_uri: impl Into<String>, node_id: impl Into<String>) -> ChannelConfigBuilder {
        ChannelConfigBuilder {
            master_uri: master_uri.into(),
            node_id: node_id.into(),
            clear: false,
            timeout_default: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            key_material: None,
        }
    }

    pub fn master_uri(&self) -> &Endpoint {
        &self.master_uri
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.master_uri.kind()
    }

    pub fn crypt_mode(&self) -> CryptMode {
        self.crypt_mode
    }

    pub fn timeout_default(&self) -> Duration {
        self.timeout_default
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    pub fn key_material(&self) -> Option<&KeyMaterial> {
        self.key_material.as_ref()
    }

    /// Envelope for this configuration's crypt mode.
    pub fn envelope(&self) -> Result<Envelope> {
        Ok(Envelope::new(self.crypt_mode, self.key_material.as_ref())?)
    }

    /// Frame limits for sockets opened with this configuration.
    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig::new(self.max_payload_size)
    }
}

/// Builder for [`ChannelConfig`]. Encrypted mode is the default.
#[derive(Debug)]
pub struct ChannelConfigBuilder {
    master_uri: String,
    node_id: String,
    clear: bool,
    timeout_default: Duration,
    connect_timeout: Duration,
    max_payload_size: usize,
    key_material: Option<KeyMaterial>,
}

impl ChannelConfigBuilder {
    /// Key material for the AES envelope.
    pub fn key(mut self, key: KeyMaterial) -> Self {
        self.key_material = Some(key);
        self
    }

    /// Send payloads unencrypted. Only for trusted networks and tests.
    pub fn insecure_clear(mut self) -> Self {
        self.clear = true;
        self
    }

    /// Timeout used by `send_default`/`recv_default`. Must be positive.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_default = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn max_payload_size(mut self, max: usize) -> Self {
        self.max_payload_size = max;
        self
    }

    /// Validate and freeze the configuration.
    pub fn build(self) -> Result<ChannelConfig> {
        let master_uri: Endpoint = self.master_uri.parse()?;

        if self.node_id.trim().is_empty() {
            return Err(ChannelError::Config("node_id must not be empty".to_string()));
        }
        if self.timeout_default.is_zero() {
            return Err(ChannelError::Config("timeout must be positive".to_string()));
        }
        if self.connect_timeout.is_zero() {
            return Err(ChannelError::Config(
                "connect timeout must be positive".to_string(),
            ));
        }
        if self.max_payload_size == 0 {
            return Err(ChannelError::Config(
                "max payload size must be positive".to_string(),
            ));
        }

        let crypt_mode = if self.clear {
            CryptMode::Clear
        } else {
            CryptMode::Aes
        };
        if crypt_mode == CryptMode::Aes && self.key_material.is_none() {
            return Err(ChannelError::Config(
                "encrypted mode requires key material (or insecure_clear())".to_string(),
            ));
        }

        Ok(ChannelConfig {
            master_uri,
            node_id: self.node_id,
            crypt_mode,
            timeout_default: self.timeout_default,
            connect_timeout: self.connect_timeout,
            max_payload_size: self.max_payload_size,
            key_material: self.key_material,
        })
    }
}

/// Runtime knobs for reply and publish servers.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Concurrent connections served by one process. Default: 64.
    pub max_connections: usize,
    /// Granularity of accept and idle polling, and of shutdown checks.
    /// Default: 100 ms.
    pub poll_interval: Duration,
    /// Close connections idle for this long. Default: never.
    pub idle_timeout: Option<Duration>,
    /// How long a new subscriber has to announce itself. Default: 1 s.
    pub subscribe_timeout: Duration,
    /// Write timeout for replies and events; slower peers are dropped.
    /// Default: 5 s.
    pub send_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_connections: 64,
            poll_interval: Duration::from_millis(100),
            idle_timeout: None,
            subscribe_timeout: Duration::from_secs(1),
            send_timeout: Duration::from_secs(5),
        }
    }
}
