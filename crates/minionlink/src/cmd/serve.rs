use std::time::Duration;

#[cfg(unix)]
use minionlink_channel::bind_then_fork;
use minionlink_channel::{DispatchError, Handler, ReplyServer, ServerOptions, Shutdown};
use minionlink_frame::Value;
use minionlink_transport::WireListener;

use crate::cmd::{install_ctrlc_handler, parse_duration, ServeArgs};
use crate::exit::{channel_error, CliError, CliResult, FAILURE, SUCCESS};
#[cfg(not(unix))]
use crate::exit::USAGE;
use crate::output::{print_record, OutputFormat, Record};

#[cfg(unix)]
const SUPERVISE_POLL: Duration = Duration::from_millis(200);

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let wait_for_kill = parse_duration(&args.wait_for_kill)?;
    let config = args.conn.channel_config(&args.uri, "master", None)?;
    let envelope = config
        .envelope()
        .map_err(|err| channel_error("invalid configuration", err))?;
    let options = ServerOptions {
        max_connections: args.max_connections,
        ..ServerOptions::default()
    };
    let server = ReplyServer::new(envelope, diagnostics)
        .with_node_id(config.node_id())
        .with_options(options)
        .with_max_payload_size(config.max_payload_size());
    let shutdown = Shutdown::new();

    if args.workers == 0 {
        let listener = WireListener::bind(config.master_uri())
            .map_err(|err| channel_error("bind failed", err.into()))?;
        let endpoint = listener.endpoint().to_string();
        print_record(&Record::new("listening").endpoint(&endpoint), format);
        install_ctrlc_handler(shutdown.clone())?;
        server
            .serve(&listener, &shutdown)
            .map_err(|err| channel_error("serve failed", err))?;
        return Ok(SUCCESS);
    }

    serve_forked(&server, &args, &config, wait_for_kill, &shutdown, format)
}

#[cfg(unix)]
fn serve_forked<H: Handler>(
    server: &ReplyServer<H>,
    args: &ServeArgs,
    config: &minionlink_channel::ChannelConfig,
    wait_for_kill: Duration,
    shutdown: &Shutdown,
    format: OutputFormat,
) -> CliResult<i32> {
    let manager = bind_then_fork(config.master_uri(), args.workers, wait_for_kill, |ctx| {
        match server.serve(ctx.listener(), ctx.shutdown()) {
            Ok(()) => SUCCESS,
            Err(err) => {
                tracing::error!(index = ctx.index(), error = %err, "worker failed");
                FAILURE
            }
        }
    })
    .map_err(|err| channel_error("serve failed", err))?;
    let endpoint = manager.endpoint().to_string();
    print_record(&Record::new("listening").endpoint(&endpoint), format);
    install_ctrlc_handler(shutdown.clone())?;

    while !shutdown.is_triggered() {
        std::thread::sleep(SUPERVISE_POLL);
        manager.reap();
        if manager.worker_pids().is_empty() {
            return Err(CliError::new(FAILURE, "all workers exited"));
        }
    }
    manager
        .shutdown()
        .map_err(|err| channel_error("worker shutdown", err))?;
    Ok(SUCCESS)
}

#[cfg(not(unix))]
fn serve_forked<H: Handler>(
    _server: &ReplyServer<H>,
    _args: &ServeArgs,
    _config: &minionlink_channel::ChannelConfig,
    _wait_for_kill: Duration,
    _shutdown: &Shutdown,
    _format: OutputFormat,
) -> CliResult<i32> {
    Err(CliError::new(USAGE, "--workers needs a Unix platform"))
}

/// Dispatcher for diagnostic requests.
///
/// `{"cmd":"ping"}` answers `{"result":"pong"}`, `{"cmd":"pid"}` answers
/// with the serving process id, and `{"cmd":"fail"}` raises a handler
/// fault. Anything else is echoed back unchanged.
fn diagnostics(payload: Value) -> Result<Value, DispatchError> {
    match payload.get("cmd").and_then(Value::as_str) {
        Some("ping") => Ok(Value::map([("result", "pong")])),
        Some("pid") => Ok(Value::map([("result", Value::from(std::process::id()))])),
        Some("fail") => Err(DispatchError::failed("failure requested by client")),
        _ => Ok(payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_answers_pong() {
        let reply = diagnostics(Value::map([
            ("id", Value::from(42)),
            ("cmd", Value::from("ping")),
        ]))
        .unwrap();
        assert_eq!(reply, Value::map([("result", "pong")]));
    }

    #[test]
    fn pid_reports_this_process() {
        let reply = diagnostics(Value::map([("cmd", "pid")])).unwrap();
        assert_eq!(
            reply.get("result").and_then(Value::as_i64),
            Some(i64::from(std::process::id()))
        );
    }

    #[test]
    fn fail_is_a_handler_error() {
        assert!(matches!(
            diagnostics(Value::map([("cmd", "fail")])),
            Err(DispatchError::Failed(_))
        ));
    }

    #[test]
    fn unknown_payload_is_echoed() {
        let payload = Value::Array(vec![Value::from(1), Value::Nil]);
        assert_eq!(diagnostics(payload.clone()).unwrap(), payload);
    }
}
