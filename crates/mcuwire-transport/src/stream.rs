use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::traits::{
    read_stream_with_timeout, ReadOutcome, Transport, TransportKind, TransportRead, TransportWrite,
};

/// Default time allowed for establishing a TCP connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP stream transport.
///
/// Nagle is disabled so every write leaves immediately.
#[derive(Debug)]
pub struct StreamTransport {
    stream: TcpStream,
    peer: SocketAddr,
}

impl StreamTransport {
    /// Connect to `host:port` with the default connect timeout.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        Self::connect_timeout(host, port, DEFAULT_CONNECT_TIMEOUT).await
    }

    /// Connect to `host:port`, giving up after `timeout`.
    pub async fn connect_timeout(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let addr = format!("{host}:{port}");
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(TransportError::Connect { addr, source }),
            Err(_elapsed) => {
                return Err(TransportError::Connect {
                    addr,
                    source: std::io::Error::new(ErrorKind::TimedOut, "connect timed out"),
                })
            }
        };
        Self::from_tcp(stream)
    }

    /// Wrap an already-connected TCP stream (e.g. one returned by `accept`).
    pub fn from_tcp(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        debug!(%peer, "stream transport connected");
        Ok(Self { stream, peer })
    }

    /// Remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Transport for StreamTransport {
    type Reader = StreamReader;
    type Writer = StreamWriter;

    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn into_split(self) -> (StreamReader, StreamWriter) {
        let (read, write) = self.stream.into_split();
        (
            StreamReader { half: read },
            StreamWriter {
                half: Some(write),
                peer: self.peer,
            },
        )
    }
}

/// Read half of a [`StreamTransport`].
#[derive(Debug)]
pub struct StreamReader {
    half: OwnedReadHalf,
}

impl TransportRead for StreamReader {
    async fn read_some(&mut self, max_bytes: usize, timeout: Duration) -> ReadOutcome {
        read_stream_with_timeout(&mut self.half, max_bytes, timeout, TransportKind::Stream).await
    }
}

/// Write half of a [`StreamTransport`].
#[derive(Debug)]
pub struct StreamWriter {
    half: Option<OwnedWriteHalf>,
    peer: SocketAddr,
}

impl TransportWrite for StreamWriter {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let half = self.half.as_mut().ok_or(TransportError::Closed)?;
        half.write_all(bytes).await?;
        half.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut half) = self.half.take() {
            if let Err(err) = half.shutdown().await {
                debug!(peer = %self.peer, error = %err, "stream shutdown failed");
            }
            debug!(peer = %self.peer, "stream transport closed");
        }
        Ok(())
    }
}
