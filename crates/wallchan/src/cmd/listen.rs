use futures_util::StreamExt;

use crate::cmd::{parse_arg, ListenArgs};
use crate::exit::{io_error, CliError, CliResult, SUCCESS, TRANSPORT_ERROR};
use crate::output::{print_event, OutputFormat};

pub async fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let arg = parse_arg(args.arg.as_deref())?;
    let client = args.connect.connect().await?;
    let disconnected = client.disconnected();
    let event = client
        .get_channel(args.channel.as_str())
        .listen(&args.event, arg);
    let mut events = event.stream();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut printed = 0usize;
    let outcome = loop {
        if args.count.is_some_and(|count| printed >= count) {
            break Ok(SUCCESS);
        }
        tokio::select! {
            signal = &mut ctrl_c => {
                break signal
                    .map(|()| SUCCESS)
                    .map_err(|err| io_error("signal handler setup failed", err));
            }
            _ = disconnected.cancelled() => {
                break Err(CliError::new(TRANSPORT_ERROR, "host disconnected"));
            }
            next = events.next() => match next {
                Some(value) => {
                    printed = printed.saturating_add(1);
                    print_event(&args.channel, &args.event, printed, value, format);
                }
                None => break Ok(SUCCESS),
            },
        }
    };

    drop(events);
    client.dispose();
    outcome
}
