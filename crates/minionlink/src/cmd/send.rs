use std::time::Instant;

use minionlink_channel::ReqChannel;
use minionlink_frame::Value;

use crate::cmd::{parse_duration, SendArgs};
use crate::exit::{channel_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_record, OutputFormat, Record};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = args.timeout.as_deref().map(parse_duration).transpose()?;
    let config = args.conn.channel_config(&args.uri, "minionlink-cli", timeout)?;
    let payload = resolve_payload(&args)?;

    let mut channel =
        ReqChannel::new(config).map_err(|err| channel_error("invalid configuration", err))?;
    let started = Instant::now();
    let reply = channel
        .send_default(payload)
        .map_err(|err| channel_error("request failed", err))?;
    channel.close();

    print_record(
        &Record::new("reply")
            .payload(&reply)
            .elapsed(started.elapsed()),
        format,
    );
    Ok(SUCCESS)
}

fn resolve_payload(args: &SendArgs) -> CliResult<Value> {
    if let Some(json) = &args.json {
        let parsed = serde_json::from_str::<serde_json::Value>(json)
            .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")))?;
        return Ok(Value::from_json(parsed));
    }
    if let Some(data) = &args.data {
        return Ok(Value::from(data.as_str()));
    }
    Ok(Value::Nil)
}
