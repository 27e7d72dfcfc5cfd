//! Transport abstraction for microcontroller and network links.
//!
//! Provides one capability interface over three byte-delivery mechanisms:
//! - TCP streams ([`StreamTransport`])
//! - UDP datagrams ([`DatagramTransport`])
//! - USB serial ports ([`SerialTransport`])
//!
//! This is the lowest layer of mcuwire. Every transport splits into a read
//! half and a write half so the connection layer can drive them independently.

pub mod any;
pub mod config;
pub mod datagram;
pub mod error;
pub mod serial;
pub mod stream;
pub mod traits;

pub use any::{AnyReader, AnyTransport, AnyWriter};
pub use config::{DataBits, Parity, SerialConfig, StopBits, TransportConfig, DEFAULT_BAUD_RATE};
pub use datagram::{DatagramTransport, MAX_DATAGRAM_SIZE};
pub use error::{Result, TransportError};
pub use serial::{SerialDevice, SerialTransport};
pub use stream::{StreamTransport, DEFAULT_CONNECT_TIMEOUT};
pub use traits::{
    ReadOutcome, Transport, TransportKind, TransportRead, TransportWrite, MAX_STREAM_READ,
};
