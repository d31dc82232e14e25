use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use wallchan_channel::{ChannelConfig, IpcClient};
use wallchan_codec::Value;
use wallchan_transport::FrameConfig;

use crate::exit::{channel_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod call;
pub mod listen;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Host a connection registry with the demo channels.
    Serve(ServeArgs),
    /// Call one method on a host channel and print the result.
    Call(CallArgs),
    /// Subscribe to a host event and print what fires.
    Listen(ListenArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub async fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format).await,
        Command::Call(args) => call::run(args, format).await,
        Command::Listen(args) => listen::run(args, format).await,
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Socket path to bind.
    pub path: PathBuf,
    /// How long a call for an unregistered channel waits (e.g. 1s, 500ms).
    #[arg(long, default_value = "1s", env = "WALLCHAN_PENDING_TIMEOUT")]
    pub pending_timeout: String,
    /// Largest frame accepted from a front-end, in bytes.
    #[arg(long, env = "WALLCHAN_MAX_PAYLOAD")]
    pub max_payload: Option<usize>,
}

/// Options shared by commands that connect as a front-end.
#[derive(Args, Debug)]
pub struct ConnectArgs {
    /// Socket path to connect to.
    pub path: PathBuf,
    /// Context announced to the host.
    #[arg(long, default_value = "wallchan-cli", env = "WALLCHAN_CONTEXT")]
    pub context: String,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
    /// Channel name.
    pub channel: String,
    /// Method name.
    pub method: String,
    /// JSON argument.
    #[arg(long)]
    pub arg: Option<String>,
    /// Give up after this long (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
    /// Channel name.
    pub channel: String,
    /// Event name.
    pub event: String,
    /// JSON argument.
    #[arg(long)]
    pub arg: Option<String>,
    /// Exit after receiving N events.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

impl ConnectArgs {
    pub async fn connect(&self) -> CliResult<IpcClient<String>> {
        IpcClient::connect_with(
            &self.path,
            self.context.clone(),
            FrameConfig::default(),
            ChannelConfig::default(),
        )
        .await
        .map_err(|err| channel_error("connect failed", err))
    }
}

/// `--arg` as a channel value; absent means undefined.
pub fn parse_arg(arg: Option<&str>) -> CliResult<Value> {
    match arg {
        None => Ok(Value::Undefined),
        Some(text) => serde_json::from_str::<serde_json::Value>(text)
            .map(Value::from)
            .map_err(|err| CliError::new(USAGE, format!("--arg is not valid JSON: {err}"))),
    }
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
