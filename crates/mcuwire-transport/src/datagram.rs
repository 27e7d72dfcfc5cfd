use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::error::{Result, TransportError};
use crate::traits::{ReadOutcome, Transport, TransportKind, TransportRead, TransportWrite};

/// Largest datagram a receive can hold; nothing is ever truncated.
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// UDP transport bound to an ephemeral port and connected to one peer.
///
/// Each receive is one message. Datagrams are never coalesced or split.
#[derive(Debug)]
pub struct DatagramTransport {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl DatagramTransport {
    /// Resolve `host:port`, bind a local socket of the same family and connect it.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let addr = format!("{host}:{port}");
        let peer = tokio::net::lookup_host(&addr)
            .await
            .map_err(|source| TransportError::Connect {
                addr: addr.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| TransportError::Connect {
                addr: addr.clone(),
                source: std::io::Error::new(ErrorKind::NotFound, "host did not resolve"),
            })?;

        let local = if peer.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|source| TransportError::Bind {
                addr: local.to_string(),
                source,
            })?;
        socket
            .connect(peer)
            .await
            .map_err(|source| TransportError::Connect { addr, source })?;

        Self::from_socket(socket)
    }

    /// Wrap a UDP socket that is already connected to its peer.
    pub fn from_socket(socket: UdpSocket) -> Result<Self> {
        let peer = socket.peer_addr()?;
        debug!(%peer, "datagram transport connected");
        Ok(Self { socket, peer })
    }

    /// Remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Local address of the bound socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(Into::into)
    }
}

impl Transport for DatagramTransport {
    type Reader = DatagramReader;
    type Writer = DatagramWriter;

    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    fn into_split(self) -> (DatagramReader, DatagramWriter) {
        let socket = Arc::new(self.socket);
        (
            DatagramReader {
                socket: Arc::clone(&socket),
                buf: vec![0u8; MAX_DATAGRAM_SIZE],
            },
            DatagramWriter {
                socket: Some(socket),
                peer: self.peer,
            },
        )
    }
}

/// Read half of a [`DatagramTransport`].
#[derive(Debug)]
pub struct DatagramReader {
    socket: Arc<UdpSocket>,
    buf: Vec<u8>,
}

impl TransportRead for DatagramReader {
    /// Returns one whole datagram regardless of `max_bytes`.
    ///
    /// Empty datagrams carry nothing and are reported as no data.
    async fn read_some(&mut self, _max_bytes: usize, timeout: Duration) -> ReadOutcome {
        match tokio::time::timeout(timeout, self.socket.recv(&mut self.buf)).await {
            Err(_elapsed) => ReadOutcome::NoDataNow,
            Ok(Ok(0)) => ReadOutcome::NoDataNow,
            Ok(Ok(n)) => ReadOutcome::Data(Bytes::copy_from_slice(&self.buf[..n])),
            Ok(Err(err)) if matches!(err.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {
                ReadOutcome::NoDataNow
            }
            Ok(Err(err)) => {
                warn!(transport = "datagram", error = %err, "datagram receive failed");
                ReadOutcome::Closed
            }
        }
    }
}

/// Write half of a [`DatagramTransport`].
#[derive(Debug)]
pub struct DatagramWriter {
    socket: Option<Arc<UdpSocket>>,
    peer: SocketAddr,
}

impl TransportWrite for DatagramWriter {
    /// Sends the buffer as exactly one datagram.
    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let socket = self.socket.as_ref().ok_or(TransportError::Closed)?;
        let sent = socket.send(bytes).await?;
        if sent != bytes.len() {
            return Err(TransportError::Io(std::io::Error::new(
                ErrorKind::WriteZero,
                format!("datagram truncated: sent {sent} of {} bytes", bytes.len()),
            )));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.socket.take().is_some() {
            debug!(peer = %self.peer, "datagram transport closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pair() -> (DatagramTransport, UdpSocket) {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        let client = DatagramTransport::connect("127.0.0.1", port).await.unwrap();
        server.connect(client.local_addr().unwrap()).await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn datagrams_are_not_coalesced() {
        let (client, server) = pair().await;
        let (mut reader, _writer) = client.into_split();

        server.send(b"one").await.unwrap();
        server.send(b"two!").await.unwrap();

        let first = reader.read_some(1024, Duration::from_secs(1)).await;
        let second = reader.read_some(1024, Duration::from_secs(1)).await;
        assert_eq!(first, ReadOutcome::Data(Bytes::from_static(b"one")));
        assert_eq!(second, ReadOutcome::Data(Bytes::from_static(b"two!")));
    }

    #[tokio::test]
    async fn long_datagram_is_returned_whole() {
        let (client, server) = pair().await;
        let (mut reader, _writer) = client.into_split();

        server.send(&[7u8; 600]).await.unwrap();
        let outcome = reader.read_some(16, Duration::from_secs(1)).await;
        match outcome {
            ReadOutcome::Data(data) => assert_eq!(data.len(), 600),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn write_sends_one_datagram() {
        let (client, server) = pair().await;
        let (_reader, mut writer) = client.into_split();

        writer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 64];
        let n = server.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[tokio::test]
    async fn silence_is_no_data_and_close_is_idempotent() {
        let (client, _server) = pair().await;
        let (mut reader, mut writer) = client.into_split();

        let outcome = reader.read_some(64, Duration::from_millis(30)).await;
        assert_eq!(outcome, ReadOutcome::NoDataNow);

        writer.close().await.unwrap();
        writer.close().await.unwrap();
        assert!(matches!(
            writer.write_all(b"x").await,
            Err(TransportError::Closed)
        ));
    }
}
