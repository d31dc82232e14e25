use wallchan_codec::Value;

use crate::cmd::{parse_arg, parse_duration, CallArgs};
use crate::exit::{channel_error, CliError, CliResult, SUCCESS, TIMEOUT};
use crate::output::{print_result, OutputFormat};

pub async fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let arg = parse_arg(args.arg.as_deref())?;

    let value = tokio::time::timeout(timeout, call(&args, arg))
        .await
        .map_err(|_| {
            CliError::new(
                TIMEOUT,
                format!("call timed out after {}ms", timeout.as_millis()),
            )
        })??;

    print_result(&args.channel, &args.method, value, format);
    Ok(SUCCESS)
}

async fn call(args: &CallArgs, arg: Value) -> CliResult<Value> {
    let client = args.connect.connect().await?;
    let result = client
        .get_channel(args.channel.as_str())
        .call(&args.method, arg)
        .await
        .map_err(|err| channel_error("call failed", err));
    client.dispose();
    result
}
