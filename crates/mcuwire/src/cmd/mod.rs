use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand};
use mcuwire_frame::{Connection, ConnectionConfig, DEFAULT_PREFIX_BITS};
use mcuwire_link::{AlwaysGrant, ConnectionLifecycle, DefaultConnector, DeviceIdentity};
use mcuwire_transport::TransportConfig;

use crate::exit::{link_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod devices;
pub mod echo;
pub mod lines;
pub mod send;
pub mod version;

/// Payload ceiling for `echo --framed` when `--max-payload` is not given.
pub const DEFAULT_ECHO_MAX_PAYLOAD: usize = 1024 * 1024;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send one payload, optionally waiting for the reply.
    Send(SendArgs),
    /// Run a TCP or UDP echo server.
    Echo(EchoArgs),
    /// Print delimiter-terminated lines from a device.
    Lines(LinesArgs),
    /// List attached USB serial devices.
    Devices(DevicesArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub async fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Send(args) => send::run(args, format).await,
        Command::Echo(args) => echo::run(args, format).await,
        Command::Lines(args) => lines::run(args, format).await,
        Command::Devices(args) => devices::run(args, format).await,
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Endpoint to connect to (tcp://host:port, udp://host:port, serial:///dev/ttyUSB0).
    pub endpoint: TransportConfig,
    /// Raw string payload.
    #[arg(long, conflicts_with_all = ["hex", "file"])]
    pub data: Option<String>,
    /// Hex-encoded payload.
    #[arg(long, conflicts_with_all = ["data", "file"])]
    pub hex: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with_all = ["data", "hex"])]
    pub file: Option<PathBuf>,
    /// Wrap the payload in a length prefix.
    #[arg(long)]
    pub framed: bool,
    /// Length prefix width in bits (8, 16, 32 or 64).
    #[arg(long, default_value_t = DEFAULT_PREFIX_BITS, env = "MCUWIRE_PREFIX_BITS")]
    pub prefix_bits: u32,
    /// Wait for one response and print it.
    #[arg(long)]
    pub wait: bool,
    /// Maximum time to wait for the response (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub wait_timeout: String,
    /// Largest raw response to collect when --wait is set.
    #[arg(long, default_value_t = 4096)]
    pub max_response: usize,
}

#[derive(Args, Debug)]
pub struct EchoArgs {
    /// Address to bind (tcp://host:port or udp://host:port; port 0 picks one).
    pub endpoint: TransportConfig,
    /// Echo length-prefixed frames instead of raw bytes.
    #[arg(long)]
    pub framed: bool,
    /// Length prefix width in bits when --framed is set.
    #[arg(long, default_value_t = DEFAULT_PREFIX_BITS, env = "MCUWIRE_PREFIX_BITS")]
    pub prefix_bits: u32,
    /// Largest frame payload to accept; bigger announced lengths drop the client.
    #[arg(long, default_value_t = DEFAULT_ECHO_MAX_PAYLOAD, env = "MCUWIRE_MAX_PAYLOAD")]
    pub max_payload: usize,
}

#[derive(Args, Debug)]
pub struct LinesArgs {
    /// Endpoint to read from.
    pub endpoint: TransportConfig,
    /// Exit after receiving N lines.
    #[arg(long)]
    pub count: Option<usize>,
    /// Per-line timeout (e.g. 1s, 250ms).
    #[arg(long, default_value = "1s", env = "MCUWIRE_LINE_TIMEOUT")]
    pub timeout: String,
    /// Longest line to accept before discarding the buffer.
    #[arg(long, default_value_t = mcuwire_frame::DEFAULT_MAX_LINE_LENGTH)]
    pub max_line: usize,
}

#[derive(Args, Debug, Default)]
pub struct DevicesArgs {
    /// Baud rate assigned to the listed serial endpoints.
    #[arg(long, env = "MCUWIRE_BAUD")]
    pub baud: Option<u32>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) fn parse_duration(value: &str) -> CliResult<Duration> {
    let invalid = || {
        CliError::new(
            USAGE,
            format!("invalid duration '{value}' (expected e.g. 5s or 500ms)"),
        )
    };
    let value = value.trim();
    if let Some(ms) = value.strip_suffix("ms") {
        return ms.parse::<u64>().map(Duration::from_millis).map_err(|_| invalid());
    }
    if let Some(secs) = value.strip_suffix('s') {
        return secs.parse::<u64>().map(Duration::from_secs).map_err(|_| invalid());
    }
    value
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| invalid())
}

/// Open `endpoint` through a lifecycle that grants every device.
pub(crate) async fn open(
    endpoint: &TransportConfig,
    config: ConnectionConfig,
) -> CliResult<(ConnectionLifecycle<AlwaysGrant>, Arc<Connection>)> {
    let lifecycle =
        ConnectionLifecycle::new(AlwaysGrant, DefaultConnector).with_connection_config(config);
    let conn = lifecycle
        .connect(DeviceIdentity::from_endpoint(endpoint.to_string()), endpoint.clone())
        .await
        .map_err(|err| link_error("connect failed", err))?;
    Ok((lifecycle, conn))
}
