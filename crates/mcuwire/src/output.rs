use std::io::{IsTerminal, Write};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use mcuwire_link::DiscoveredDevice;
use serde::Serialize;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
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
struct PayloadOutput<'a> {
    event: &'static str,
    endpoint: &'a str,
    size: usize,
    encoding: &'static str,
    payload: String,
    timestamp: String,
}

#[derive(Serialize)]
struct LineOutput<'a> {
    event: &'static str,
    endpoint: &'a str,
    line: &'a str,
    timestamp: String,
}

#[derive(Serialize)]
struct ListeningOutput {
    event: &'static str,
    address: String,
    transport: &'static str,
    framed: bool,
}

/// Payload rendered as text when it is valid UTF-8, otherwise as hex.
pub fn payload_preview(payload: &[u8]) -> (&'static str, String) {
    match std::str::from_utf8(payload) {
        Ok(text) => ("utf8", text.to_string()),
        Err(_) => ("hex", hex::encode(payload)),
    }
}

pub fn print_payload(payload: &[u8], endpoint: &str, format: OutputFormat) {
    let (encoding, preview) = payload_preview(payload);
    match format {
        OutputFormat::Json => {
            let out = PayloadOutput {
                event: "received",
                endpoint,
                size: payload.len(),
                encoding,
                payload: preview,
                timestamp: now_unix_seconds(),
            };
            print_json(&out);
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["ENDPOINT", "SIZE", "ENCODING", "PAYLOAD"])
                .add_row(vec![
                    endpoint.to_string(),
                    payload.len().to_string(),
                    encoding.to_string(),
                    preview,
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "endpoint={endpoint} size={} {encoding}={preview}",
                payload.len()
            );
        }
        OutputFormat::Raw => print_raw(payload),
    }
}

pub fn print_line(line: &str, endpoint: &str, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&LineOutput {
            event: "line",
            endpoint,
            line,
            timestamp: now_unix_seconds(),
        }),
        // One table per line would be unreadable on a streaming monitor.
        OutputFormat::Table | OutputFormat::Pretty => println!("{endpoint}: {line}"),
        OutputFormat::Raw => println!("{line}"),
    }
}

pub fn print_listening(
    address: SocketAddr,
    transport: &'static str,
    framed: bool,
    format: OutputFormat,
) {
    match format {
        OutputFormat::Json => print_json(&ListeningOutput {
            event: "listening",
            address: address.to_string(),
            transport,
            framed,
        }),
        _ => println!("listening on {transport}://{address}"),
    }
    let _ = std::io::stdout().flush();
}

pub fn print_devices(devices: &[DiscoveredDevice], format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&devices),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["NAME", "VID", "PID", "ENDPOINT"]);
            for device in devices {
                table.add_row(vec![
                    device.identity.name.clone(),
                    format!("{:04x}", device.identity.vendor_id),
                    format!("{:04x}", device.identity.product_id),
                    device.transport.to_string(),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            for device in devices {
                println!("{}  {}", device.identity, device.transport);
            }
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
