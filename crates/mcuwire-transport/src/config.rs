use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};
use crate::traits::TransportKind;

/// Default serial baud rate.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Immutable description of how to reach a device.
///
/// Parses from endpoint strings:
/// `tcp://host:port`, `udp://host:port`,
/// `serial:///dev/ttyUSB0?baud=9600&data_bits=7&stop_bits=2&parity=even`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    /// TCP stream to `host:port`.
    Stream { host: String, port: u16 },
    /// UDP datagrams to `host:port`.
    Datagram { host: String, port: u16 },
    /// USB serial port.
    Serial(SerialConfig),
}

impl TransportConfig {
    /// Build a TCP config.
    pub fn stream(host: impl Into<String>, port: u16) -> Self {
        Self::Stream {
            host: host.into(),
            port,
        }
    }

    /// Build a UDP config.
    pub fn datagram(host: impl Into<String>, port: u16) -> Self {
        Self::Datagram {
            host: host.into(),
            port,
        }
    }

    /// Build a serial config with default line settings.
    pub fn serial(path: impl Into<String>) -> Self {
        Self::Serial(SerialConfig::new(path))
    }

    /// Transport family this config produces.
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Stream { .. } => TransportKind::Stream,
            TransportConfig::Datagram { .. } => TransportKind::Datagram,
            TransportConfig::Serial(_) => TransportKind::Serial,
        }
    }
}

impl fmt::Display for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportConfig::Stream { host, port } => {
                write!(f, "tcp://{}:{port}", bracket_host(host))
            }
            TransportConfig::Datagram { host, port } => {
                write!(f, "udp://{}:{port}", bracket_host(host))
            }
            TransportConfig::Serial(cfg) => write!(
                f,
                "serial://{}?baud={}&data_bits={}&stop_bits={}&parity={}",
                cfg.path,
                cfg.baud_rate,
                cfg.data_bits.bits(),
                cfg.stop_bits.bits(),
                cfg.parity
            ),
        }
    }
}

impl FromStr for TransportConfig {
    type Err = TransportError;

    fn from_str(input: &str) -> Result<Self> {
        let input = input.trim();
        if let Some(rest) = input.strip_prefix("tcp://") {
            let (host, port) = parse_host_port(rest)?;
            return Ok(Self::Stream { host, port });
        }
        if let Some(rest) = input.strip_prefix("udp://") {
            let (host, port) = parse_host_port(rest)?;
            return Ok(Self::Datagram { host, port });
        }
        if let Some(rest) = input.strip_prefix("serial://") {
            return parse_serial(rest).map(Self::Serial);
        }
        Err(TransportError::InvalidConfig(format!(
            "unrecognized endpoint '{input}' (expected tcp://, udp:// or serial://)"
        )))
    }
}

/// Serial line settings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device path (`/dev/ttyUSB0`, `COM3`).
    pub path: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default)]
    pub data_bits: DataBits,
    #[serde(default)]
    pub stop_bits: StopBits,
    #[serde(default)]
    pub parity: Parity,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

impl SerialConfig {
    /// Config for `path` with 115200 8N1.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.path.is_empty() {
            return Err(TransportError::InvalidConfig(
                "serial path must not be empty".to_string(),
            ));
        }
        if self.baud_rate == 0 {
            return Err(TransportError::InvalidConfig(
                "baud rate must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: DataBits::default(),
            stop_bits: StopBits::default(),
            parity: Parity::default(),
        }
    }
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DataBits {
    Five,
    Six,
    Seven,
    #[default]
    Eight,
}

impl DataBits {
    pub fn bits(self) -> u8 {
        match self {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }
}

impl TryFrom<u8> for DataBits {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            5 => Ok(DataBits::Five),
            6 => Ok(DataBits::Six),
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            other => Err(TransportError::InvalidConfig(format!(
                "data bits must be 5-8, got {other}"
            ))),
        }
    }
}

impl From<DataBits> for u8 {
    fn from(value: DataBits) -> Self {
        value.bits()
    }
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum StopBits {
    #[default]
    One,
    Two,
}

impl StopBits {
    pub fn bits(self) -> u8 {
        match self {
            StopBits::One => 1,
            StopBits::Two => 2,
        }
    }
}

impl TryFrom<u8> for StopBits {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(StopBits::One),
            2 => Ok(StopBits::Two),
            other => Err(TransportError::InvalidConfig(format!(
                "stop bits must be 1 or 2, got {other}"
            ))),
        }
    }
}

impl From<StopBits> for u8 {
    fn from(value: StopBits) -> Self {
        value.bits()
    }
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Parity::None => "none",
            Parity::Odd => "odd",
            Parity::Even => "even",
        })
    }
}

impl FromStr for Parity {
    type Err = TransportError;

    fn from_str(input: &str) -> Result<Self> {
        match input.to_ascii_lowercase().as_str() {
            "none" | "n" => Ok(Parity::None),
            "odd" | "o" => Ok(Parity::Odd),
            "even" | "e" => Ok(Parity::Even),
            other => Err(TransportError::InvalidConfig(format!(
                "unknown parity '{other}'"
            ))),
        }
    }
}

fn bracket_host(host: &str) -> String {
    if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

fn parse_host_port(input: &str) -> Result<(String, u16)> {
    let (host, port) = input.rsplit_once(':').ok_or_else(|| {
        TransportError::InvalidConfig(format!("missing port in '{input}' (expected host:port)"))
    })?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(TransportError::InvalidConfig(format!(
            "missing host in '{input}'"
        )));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| TransportError::InvalidConfig(format!("invalid port '{port}'")))?;
    Ok((host.to_string(), port))
}

fn parse_serial(input: &str) -> Result<SerialConfig> {
    let (path, query) = match input.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (input, None),
    };
    let mut config = SerialConfig::new(path);

    for pair in query.into_iter().flat_map(|q| q.split('&')) {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            TransportError::InvalidConfig(format!("serial option '{pair}' is missing '='"))
        })?;
        match key {
            "baud" | "baud_rate" => {
                config.baud_rate = value.parse().map_err(|_| {
                    TransportError::InvalidConfig(format!("invalid baud rate '{value}'"))
                })?;
            }
            "data_bits" => config.data_bits = DataBits::try_from(parse_small(key, value)?)?,
            "stop_bits" => config.stop_bits = StopBits::try_from(parse_small(key, value)?)?,
            "parity" => config.parity = value.parse()?,
            other => {
                return Err(TransportError::InvalidConfig(format!(
                    "unknown serial option '{other}'"
                )))
            }
        }
    }

    config.validate()?;
    Ok(config)
}

fn parse_small(key: &str, value: &str) -> Result<u8> {
    value
        .parse()
        .map_err(|_| TransportError::InvalidConfig(format!("invalid {key} '{value}'")))
}
