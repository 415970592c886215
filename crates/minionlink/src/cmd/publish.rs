use std::io::BufRead;

use minionlink_channel::{PubServer, ServerOptions};
use minionlink_frame::Value;

use crate::cmd::{parse_duration, PublishArgs};
use crate::exit::{channel_error, io_error, CliResult, SUCCESS};
use crate::output::{print_record, OutputFormat, Record};

pub fn run(args: PublishArgs, format: OutputFormat) -> CliResult<i32> {
    let wait_for_kill = parse_duration(&args.wait_for_kill)?;
    let config = args.conn.channel_config(&args.uri, "master", None)?;
    let server = open_server(&args, &config, wait_for_kill)?;
    let endpoint = server.endpoint().to_string();
    print_record(&Record::new("listening").endpoint(&endpoint), format);

    let targets: Option<Vec<&str>> = args
        .target
        .as_ref()
        .map(|targets| targets.iter().map(String::as_str).collect());

    for line in std::io::stdin().lock().lines() {
        let line = line.map_err(|err| io_error("reading stdin failed", err))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let payload = parse_line(line);
        let delivered = match &targets {
            Some(targets) => server.publish_to(payload.clone(), targets),
            None => server.publish(payload.clone()),
        }
        .map_err(|err| channel_error("publish failed", err))?;
        print_record(
            &Record::new("published")
                .payload(&payload)
                .delivered(delivered),
            format,
        );
    }

    drop(server);
    Ok(SUCCESS)
}

#[cfg(unix)]
fn open_server(
    args: &PublishArgs,
    config: &minionlink_channel::ChannelConfig,
    wait_for_kill: std::time::Duration,
) -> CliResult<PubServer> {
    if args.workers == 0 {
        return PubServer::bind(config, ServerOptions::default())
            .map_err(|err| channel_error("bind failed", err));
    }
    let server = PubServer::pre_fork(config, ServerOptions::default(), wait_for_kill)
        .map_err(|err| channel_error("bind failed", err))?;
    server
        .spawn_workers(args.workers)
        .map_err(|err| channel_error("spawning workers failed", err))?;
    Ok(server)
}

#[cfg(not(unix))]
fn open_server(
    args: &PublishArgs,
    config: &minionlink_channel::ChannelConfig,
    _wait_for_kill: std::time::Duration,
) -> CliResult<PubServer> {
    if args.workers > 0 {
        return Err(crate::exit::CliError::new(
            crate::exit::USAGE,
            "--workers needs a Unix platform",
        ));
    }
    PubServer::bind(config, ServerOptions::default())
        .map_err(|err| channel_error("bind failed", err))
}

/// A line of JSON is published as structured data, anything else as text.
fn parse_line(line: &str) -> Value {
    match serde_json::from_str::<serde_json::Value>(line) {
        Ok(json) => Value::from_json(json),
        Err(_) => Value::from(line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_lines_are_structured() {
        let value = parse_line(r#"{"fun":"state.apply"}"#);
        assert_eq!(value.get("fun").and_then(Value::as_str), Some("state.apply"));
    }

    #[test]
    fn other_lines_are_text() {
        assert_eq!(parse_line("restart nginx"), Value::from("restart nginx"));
    }
}
