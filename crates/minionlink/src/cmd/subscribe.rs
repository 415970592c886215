use std::time::Duration;

use minionlink_channel::{ChannelError, Shutdown, SubChannel};

use crate::cmd::{install_ctrlc_handler, parse_duration, SubscribeArgs};
use crate::exit::{channel_error, CliResult, SUCCESS};
use crate::output::{print_record, OutputFormat, Record};

const IDLE_POLL: Duration = Duration::from_secs(1);

pub fn run(args: SubscribeArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = args.timeout.as_deref().map(parse_duration).transpose()?;
    let config = args
        .conn
        .channel_config(&args.uri, "minionlink-cli", timeout)?;
    let endpoint = config.master_uri().to_string();

    let mut subscriber =
        SubChannel::connect(config).map_err(|err| channel_error("subscribe failed", err))?;
    print_record(&Record::new("subscribed").endpoint(&endpoint), format);

    let shutdown = Shutdown::new();
    install_ctrlc_handler(shutdown.clone())?;

    let mut received = 0usize;
    while !shutdown.is_triggered() {
        let event = match subscriber.recv(timeout.unwrap_or(IDLE_POLL)) {
            Ok(event) => event,
            Err(ChannelError::Timeout(_)) if timeout.is_none() => continue,
            Err(err) => return Err(channel_error("receive failed", err)),
        };
        print_record(&Record::new("event").payload(&event), format);
        received = received.saturating_add(1);

        if args.count.is_some_and(|count| received >= count) {
            break;
        }
    }

    subscriber.close();
    Ok(SUCCESS)
}
