use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::info;
use wallchan_channel::{
    CallFuture, ChannelConfig, ChannelError, ConnectionRegistry, EventStream, RegistryConfig,
    ServerChannel,
};
use wallchan_codec::Value;
use wallchan_transport::{FrameConfig, UnixDomainSocket};

use crate::cmd::{parse_duration, ServeArgs};
use crate::exit::{io_error, transport_error, CliResult, SUCCESS};
use crate::output::OutputFormat;

const DEFAULT_TICK: Duration = Duration::from_secs(1);

pub async fn run(args: ServeArgs, _format: OutputFormat) -> CliResult<i32> {
    let pending_timeout = parse_duration(&args.pending_timeout)?;
    let mut frame = FrameConfig::default();
    if let Some(max) = args.max_payload {
        frame.max_payload_size = max;
    }

    let socket =
        UnixDomainSocket::bind(&args.path).map_err(|err| transport_error("bind failed", err))?;
    info!(path = %socket.path().display(), transport = socket.transport_name(), "serving");

    let registry = ConnectionRegistry::<String>::new(RegistryConfig {
        channel: ChannelConfig { pending_timeout },
        ..RegistryConfig::default()
    });
    register_demo_channels(&registry);

    let _added = registry.on_did_add_connection(|ctx| info!(context = %ctx, "front-end connected"));
    let _removed =
        registry.on_did_remove_connection(|ctx| info!(context = %ctx, "front-end disconnected"));

    let accept = registry.serve(socket.serve(frame));
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|err| io_error("signal handler setup failed", err))?;
            info!("interrupted; shutting down");
        }
        _ = accept => info!("listener closed"),
    }
    registry.dispose();
    Ok(SUCCESS)
}

pub fn register_demo_channels(registry: &ConnectionRegistry<String>) {
    registry.register_channel("echo", Arc::new(Echo));
    registry.register_channel("math", Arc::new(Math));
    registry.register_channel("clock", Arc::new(Clock));
}

/// Returns the argument of any method; `context` returns the caller's context.
struct Echo;

impl ServerChannel<String> for Echo {
    fn call(&self, ctx: &String, command: &str, arg: Value, _: CancellationToken) -> CallFuture {
        let reply = match command {
            "context" => Value::from(ctx.as_str()),
            _ => arg,
        };
        async move { Ok(reply) }.boxed()
    }

    fn listen(&self, _: &String, event: &str, _: Value) -> Result<EventStream, ChannelError> {
        Err(unknown("event", "echo", event))
    }
}

/// `add` sums an array of numbers or the `a` and `b` fields of an object.
struct Math;

impl ServerChannel<String> for Math {
    fn call(&self, _: &String, command: &str, arg: Value, _: CancellationToken) -> CallFuture {
        let reply = match command {
            "add" => add(&arg),
            other => Err(unknown("method", "math", other)),
        };
        async move { reply }.boxed()
    }

    fn listen(&self, _: &String, event: &str, _: Value) -> Result<EventStream, ChannelError> {
        Err(unknown("event", "math", event))
    }
}

fn add(arg: &Value) -> Result<Value, ChannelError> {
    let operands: Vec<&Value> = match arg {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => ["a", "b"].iter().filter_map(|key| arg.get(key)).collect(),
        _ => Vec::new(),
    };
    if operands.is_empty() {
        return Err(ChannelError::remote(
            "TypeError",
            format!("add expects numbers, got {}", arg.type_name()),
        ));
    }
    if let Some(sum) = operands
        .iter()
        .try_fold(0i64, |sum, value| value.as_i64().and_then(|n| sum.checked_add(n)))
    {
        return Ok(Value::Int(sum));
    }
    operands
        .iter()
        .try_fold(0f64, |sum, value| value.as_f64().map(|n| sum + n))
        .map(Value::Float)
        .ok_or_else(|| ChannelError::remote("TypeError", "add expects numbers"))
}

/// `tick` fires an increasing counter every `interval_ms` (default 1000).
struct Clock;

impl ServerChannel<String> for Clock {
    fn call(&self, _: &String, command: &str, _: Value, _: CancellationToken) -> CallFuture {
        let err = unknown("method", "clock", command);
        async move { Err(err) }.boxed()
    }

    fn listen(&self, _: &String, event: &str, arg: Value) -> Result<EventStream, ChannelError> {
        if event != "tick" {
            return Err(unknown("event", "clock", event));
        }
        let period = arg
            .get("interval_ms")
            .and_then(Value::as_i64)
            .and_then(|ms| u64::try_from(ms).ok())
            .filter(|ms| *ms > 0)
            .map_or(DEFAULT_TICK, Duration::from_millis);

        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let ticks = futures_util::stream::unfold((interval, 0i64), |(mut interval, n)| async move {
            interval.tick().await;
            Some((Value::Int(n + 1), (interval, n + 1)))
        });
        Ok(Box::pin(ticks))
    }
}

fn unknown(kind: &str, channel: &str, name: &str) -> ChannelError {
    ChannelError::remote("Error", format!("unknown {kind} '{name}' on channel '{channel}'"))
}
