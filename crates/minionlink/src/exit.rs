use std::fmt;
use std::io;

use minionlink_channel::ChannelError;

// Exit codes shared by every subcommand.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const INTEGRITY_FAILED: i32 = 51;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const REMOTE_FAULT: i32 = 70;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::AddrInUse
        | io::ErrorKind::AddrNotAvailable
        | io::ErrorKind::ConnectionRefused => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn channel_error(context: &str, err: ChannelError) -> CliError {
    let code = match &err {
        ChannelError::Timeout(_) => TIMEOUT,
        ChannelError::Connection(_) => TRANSPORT_ERROR,
        ChannelError::Bind { source, .. } => match source.kind() {
            io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
            _ => TRANSPORT_ERROR,
        },
        ChannelError::Remote { .. } => REMOTE_FAULT,
        ChannelError::Integrity(_) => INTEGRITY_FAILED,
        ChannelError::Encode(_) | ChannelError::Decode(_) => DATA_INVALID,
        ChannelError::Config(_) => USAGE,
        ChannelError::ProtocolViolation(_) | ChannelError::ShutdownTimeout { .. } => FAILURE,
        ChannelError::Process(_) => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use minionlink_frame::Fault;

    use super::*;

    #[test]
    fn channel_errors_map_to_stable_codes() {
        let code = |err| channel_error("ctx", err).code;
        assert_eq!(code(ChannelError::Timeout(Duration::from_secs(1))), TIMEOUT);
        assert_eq!(code(ChannelError::Connection("refused".into())), TRANSPORT_ERROR);
        assert_eq!(
            code(ChannelError::Remote {
                fault: Fault::Handler,
                message: "boom".into()
            }),
            REMOTE_FAULT
        );
        assert_eq!(code(ChannelError::Integrity("tag".into())), INTEGRITY_FAILED);
        assert_eq!(code(ChannelError::Decode("short".into())), DATA_INVALID);
        assert_eq!(code(ChannelError::Config("no key".into())), USAGE);
    }

    #[test]
    fn bind_conflict_is_a_transport_error() {
        let err = ChannelError::Bind {
            endpoint: "tcp://127.0.0.1:4505".into(),
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        let cli = channel_error("bind failed", err);
        assert_eq!(cli.code, TRANSPORT_ERROR);
        assert!(cli.message.starts_with("bind failed: "));
    }
}
