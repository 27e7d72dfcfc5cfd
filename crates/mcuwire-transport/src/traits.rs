use std::fmt;
use std::future::Future;
use std::io::ErrorKind;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use crate::error::Result;

/// Largest scratch buffer a single stream read allocates.
///
/// `read_some(max, ..)` may return fewer than `max` bytes, so larger requests
/// are served in pieces of this size.
pub const MAX_STREAM_READ: usize = 64 * 1024;

/// Outcome of one bounded `read_some` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes arrived. Never empty.
    Data(Bytes),
    /// Nothing arrived within the timeout. Normal for idle devices.
    NoDataNow,
    /// The peer closed the channel, the device vanished, or the read failed.
    /// Always terminal.
    Closed,
}

/// The three transport families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// TCP-like byte stream.
    Stream,
    /// UDP-like datagrams.
    Datagram,
    /// USB serial port.
    Serial,
}

impl TransportKind {
    /// Short lowercase name for diagnostics.
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Stream => "stream",
            TransportKind::Datagram => "datagram",
            TransportKind::Serial => "serial",
        }
    }

    /// Whether each receive is a complete message that must not be merged
    /// with its neighbours.
    pub fn is_message_oriented(self) -> bool {
        matches!(self, TransportKind::Datagram)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read half of a transport.
pub trait TransportRead: Send + 'static {
    /// Wait at most `timeout` for bytes and return up to `max_bytes` of them.
    ///
    /// Message-oriented transports return exactly one whole message per call
    /// and never split it, even when it is longer than `max_bytes`.
    fn read_some(
        &mut self,
        max_bytes: usize,
        timeout: Duration,
    ) -> impl Future<Output = ReadOutcome> + Send;
}

/// Write half of a transport.
pub trait TransportWrite: Send + 'static {
    /// Write the whole buffer as one logical write and flush it.
    fn write_all(&mut self, bytes: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Release the write side. Calling it again is a no-op.
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// A connected byte-delivery mechanism that splits into independent halves.
pub trait Transport: Send + 'static {
    type Reader: TransportRead;
    type Writer: TransportWrite;

    /// Which family this transport belongs to.
    fn kind(&self) -> TransportKind;

    /// Split into a read half and a write half that can be driven concurrently.
    fn into_split(self) -> (Self::Reader, Self::Writer);
}

/// Bounded read shared by the byte-stream transports (TCP, serial).
///
/// Timeout means no data now; a zero-length read or any hard error means closed.
pub(crate) async fn read_stream_with_timeout<R>(
    reader: &mut R,
    max_bytes: usize,
    timeout: Duration,
    kind: TransportKind,
) -> ReadOutcome
where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = vec![0u8; max_bytes.clamp(1, MAX_STREAM_READ)];
    match tokio::time::timeout(timeout, reader.read(&mut buf)).await {
        Err(_elapsed) => ReadOutcome::NoDataNow,
        Ok(Ok(0)) => {
            debug!(transport = %kind, "peer closed transport");
            ReadOutcome::Closed
        }
        Ok(Ok(n)) => {
            buf.truncate(n);
            ReadOutcome::Data(Bytes::from(buf))
        }
        Ok(Err(err))
            if matches!(
                err.kind(),
                ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
            ) =>
        {
            ReadOutcome::NoDataNow
        }
        Ok(Err(err)) => {
            warn!(transport = %kind, error = %err, "transport read failed");
            ReadOutcome::Closed
        }
    }
}
