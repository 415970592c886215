use std::time::Duration;

use clap::{Args, Subcommand};
use minionlink_channel::{ChannelConfig, Shutdown};
use minionlink_crypt::KeyMaterial;
use minionlink_frame::DEFAULT_MAX_PAYLOAD;

use crate::exit::{channel_error, CliError, CliResult, INTERNAL, USAGE};
use crate::output::OutputFormat;

pub mod keygen;
pub mod publish;
pub mod send;
pub mod serve;
pub mod subscribe;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a reply server answering diagnostic requests.
    Serve(ServeArgs),
    /// Send one request and print the reply.
    Send(SendArgs),
    /// Run a publish server broadcasting stdin lines.
    Publish(PublishArgs),
    /// Subscribe to a publish server and print events.
    Subscribe(SubscribeArgs),
    /// Print a fresh random key.
    Keygen(KeygenArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Send(args) => send::run(args, format),
        Command::Publish(args) => publish::run(args, format),
        Command::Subscribe(args) => subscribe::run(args, format),
        Command::Keygen(args) => keygen::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

/// Identity and envelope settings shared by every networked command.
#[derive(Args, Debug)]
pub struct ConnArgs {
    /// Node id announced to the peer.
    #[arg(long, env = "MINIONLINK_NODE_ID")]
    pub node_id: Option<String>,
    /// Shared AES-256 key, 64 hex characters.
    #[arg(long, env = "MINIONLINK_KEY", hide_env_values = true)]
    pub key: Option<String>,
    /// Send payloads unencrypted. Trusted networks only.
    #[arg(long)]
    pub insecure_clear: bool,
    /// Largest message body accepted or sent, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_PAYLOAD)]
    pub max_payload: usize,
}

impl ConnArgs {
    pub fn channel_config(
        &self,
        uri: &str,
        default_node_id: &str,
        timeout: Option<Duration>,
    ) -> CliResult<ChannelConfig> {
        let node_id = self
            .node_id
            .clone()
            .unwrap_or_else(|| default_node_id.to_string());
        let mut builder = ChannelConfig::builder(uri, node_id).max_payload_size(self.max_payload);

        if self.insecure_clear {
            if self.key.is_some() {
                tracing::warn!("--insecure-clear given, ignoring key");
            }
            builder = builder.insecure_clear();
        } else {
            let hex = self.key.as_deref().ok_or_else(|| {
                CliError::new(
                    USAGE,
                    "no key: pass --key, set MINIONLINK_KEY or use --insecure-clear",
                )
            })?;
            let key = KeyMaterial::from_hex(hex)
                .map_err(|err| CliError::new(USAGE, format!("invalid key: {err}")))?;
            builder = builder.key(key);
        }
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        builder
            .build()
            .map_err(|err| channel_error("invalid configuration", err))
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to bind (tcp://host:port or ipc:///path).
    pub uri: String,
    #[command(flatten)]
    pub conn: ConnArgs,
    /// Worker processes forked after binding. 0 serves in this process.
    #[arg(long, default_value_t = 0)]
    pub workers: usize,
    /// Grace period for workers after SIGTERM (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub wait_for_kill: String,
    /// Concurrent connections per process.
    #[arg(long, default_value_t = 64)]
    pub max_connections: usize,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Master address (tcp://host:port or ipc:///path).
    pub uri: String,
    #[command(flatten)]
    pub conn: ConnArgs,
    /// JSON payload.
    #[arg(long, conflicts_with = "data")]
    pub json: Option<String>,
    /// Raw string payload.
    #[arg(long, conflicts_with = "json")]
    pub data: Option<String>,
    /// How long to wait for the reply (e.g. 5s, 500ms). Default: 60s.
    #[arg(long)]
    pub timeout: Option<String>,
}

#[derive(Args, Debug)]
pub struct PublishArgs {
    /// Address to bind (tcp://host:port or ipc:///path).
    pub uri: String,
    #[command(flatten)]
    pub conn: ConnArgs,
    /// Publisher worker processes forked after binding. 0 publishes from
    /// this process.
    #[arg(long, default_value_t = 0)]
    pub workers: usize,
    /// Grace period for workers after SIGTERM (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub wait_for_kill: String,
    /// Only deliver to these node ids (comma-separated).
    #[arg(long, value_delimiter = ',')]
    pub target: Option<Vec<String>>,
}

#[derive(Args, Debug)]
pub struct SubscribeArgs {
    /// Publisher address (tcp://host:port or ipc:///path).
    pub uri: String,
    #[command(flatten)]
    pub conn: ConnArgs,
    /// Exit after receiving N events.
    #[arg(long)]
    pub count: Option<usize>,
    /// Fail if no event arrives within this long (e.g. 5s, 500ms).
    #[arg(long)]
    pub timeout: Option<String>,
}

#[derive(Args, Debug, Default)]
pub struct KeygenArgs {}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

pub fn install_ctrlc_handler(shutdown: Shutdown) -> CliResult<()> {
    ctrlc::set_handler(move || shutdown.trigger())
        .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
