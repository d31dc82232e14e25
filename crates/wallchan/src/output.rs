use std::io::IsTerminal;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use wallchan_codec::Value;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct CallOutput<'a> {
    channel: &'a str,
    method: &'a str,
    result: serde_json::Value,
    timestamp: String,
}

#[derive(Serialize)]
struct EventOutput<'a> {
    channel: &'a str,
    event: &'a str,
    seq: usize,
    data: serde_json::Value,
    timestamp: String,
}

/// Print the settled value of one call.
pub fn print_result(channel: &str, method: &str, value: Value, format: OutputFormat) {
    let result = serde_json::Value::from(value);
    match format {
        OutputFormat::Json => {
            let out = CallOutput {
                channel,
                method,
                result,
                timestamp: now_unix_seconds(),
            };
            println!("{}", to_json_line(&out));
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["CHANNEL", "METHOD", "RESULT"])
                .add_row(vec![channel.to_string(), method.to_string(), result.to_string()]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("{channel}.{method} => {}", pretty(&result));
        }
    }
}

/// Print one fired event; `seq` counts from 1 per subscription.
pub fn print_event(channel: &str, event: &str, seq: usize, value: Value, format: OutputFormat) {
    let data = serde_json::Value::from(value);
    match format {
        OutputFormat::Json => {
            let out = EventOutput {
                channel,
                event,
                seq,
                data,
                timestamp: now_unix_seconds(),
            };
            println!("{}", to_json_line(&out));
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["SEQ", "CHANNEL", "EVENT", "DATA"])
                .add_row(vec![
                    seq.to_string(),
                    channel.to_string(),
                    event.to_string(),
                    data.to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("#{seq} {channel}.{event}: {}", pretty(&data));
        }
    }
}

fn to_json_line<T: Serialize>(out: &T) -> String {
    serde_json::to_string(out).unwrap_or_else(|_| "{}".to_string())
}

fn pretty(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
