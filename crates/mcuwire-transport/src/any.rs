use std::time::Duration;

use tracing::info;

use crate::config::TransportConfig;
use crate::datagram::{DatagramReader, DatagramTransport, DatagramWriter};
use crate::error::Result;
use crate::serial::{SerialReader, SerialTransport, SerialWriter};
use crate::stream::{StreamReader, StreamTransport, StreamWriter};
use crate::traits::{ReadOutcome, Transport, TransportKind, TransportRead, TransportWrite};

/// One of the three concrete transports, chosen at connection time.
#[derive(Debug)]
pub enum AnyTransport {
    Stream(StreamTransport),
    Datagram(DatagramTransport),
    Serial(SerialTransport),
}

impl AnyTransport {
    /// Construct the transport described by `config`.
    pub async fn open(config: &TransportConfig) -> Result<Self> {
        let transport = match config {
            TransportConfig::Stream { host, port } => {
                Self::Stream(StreamTransport::connect(host, *port).await?)
            }
            TransportConfig::Datagram { host, port } => {
                Self::Datagram(DatagramTransport::connect(host, *port).await?)
            }
            TransportConfig::Serial(serial) => Self::Serial(SerialTransport::open(serial)?),
        };
        info!(endpoint = %config, kind = %transport.kind(), "transport opened");
        Ok(transport)
    }
}

impl From<StreamTransport> for AnyTransport {
    fn from(value: StreamTransport) -> Self {
        Self::Stream(value)
    }
}

impl From<DatagramTransport> for AnyTransport {
    fn from(value: DatagramTransport) -> Self {
        Self::Datagram(value)
    }
}

impl From<SerialTransport> for AnyTransport {
    fn from(value: SerialTransport) -> Self {
        Self::Serial(value)
    }
}

impl Transport for AnyTransport {
    type Reader = AnyReader;
    type Writer = AnyWriter;

    fn kind(&self) -> TransportKind {
        match self {
            AnyTransport::Stream(t) => t.kind(),
            AnyTransport::Datagram(t) => t.kind(),
            AnyTransport::Serial(t) => t.kind(),
        }
    }

    fn into_split(self) -> (AnyReader, AnyWriter) {
        match self {
            AnyTransport::Stream(t) => {
                let (r, w) = t.into_split();
                (AnyReader::Stream(r), AnyWriter::Stream(w))
            }
            AnyTransport::Datagram(t) => {
                let (r, w) = t.into_split();
                (AnyReader::Datagram(r), AnyWriter::Datagram(w))
            }
            AnyTransport::Serial(t) => {
                let (r, w) = t.into_split();
                (AnyReader::Serial(r), AnyWriter::Serial(w))
            }
        }
    }
}

/// Read half of an [`AnyTransport`].
#[derive(Debug)]
pub enum AnyReader {
    Stream(StreamReader),
    Datagram(DatagramReader),
    Serial(SerialReader),
}

impl TransportRead for AnyReader {
    async fn read_some(&mut self, max_bytes: usize, timeout: Duration) -> ReadOutcome {
        match self {
            AnyReader::Stream(r) => r.read_some(max_bytes, timeout).await,
            AnyReader::Datagram(r) => r.read_some(max_bytes, timeout).await,
            AnyReader::Serial(r) => r.read_some(max_bytes, timeout).await,
        }
    }
}

/// Write half of an [`AnyTransport`].
#[derive(Debug)]
pub enum AnyWriter {
    Stream(StreamWriter),
    Datagram(DatagramWriter),
    Serial(SerialWriter),
}

impl TransportWrite for AnyWriter {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        match self {
            AnyWriter::Stream(w) => w.write_all(bytes).await,
            AnyWriter::Datagram(w) => w.write_all(bytes).await,
            AnyWriter::Serial(w) => w.write_all(bytes).await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self {
            AnyWriter::Stream(w) => w.close().await,
            AnyWriter::Datagram(w) => w.close().await,
            AnyWriter::Serial(w) => w.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::*;
    use crate::config::SerialConfig;
    use crate::error::TransportError;

    #[tokio::test]
    async fn opens_stream_from_config() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = TransportConfig::stream("127.0.0.1", port);

        let (transport, accepted) = tokio::join!(AnyTransport::open(&config), listener.accept());
        let transport = transport.unwrap();
        let (mut server, _) = accepted.unwrap();
        assert_eq!(transport.kind(), TransportKind::Stream);

        let (_reader, mut writer) = transport.into_split();
        writer.write_all(b"via-any").await.unwrap();
        let mut buf = [0u8; 7];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"via-any");
    }

    #[tokio::test]
    async fn opens_datagram_from_config() {
        let server = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        let transport = AnyTransport::open(&TransportConfig::datagram("127.0.0.1", port))
            .await
            .unwrap();
        assert_eq!(transport.kind(), TransportKind::Datagram);
        assert!(transport.kind().is_message_oriented());
    }

    #[tokio::test]
    async fn serial_from_device_dispatches() {
        let (host, _mcu) = tokio::io::duplex(16);
        let transport: AnyTransport =
            SerialTransport::from_device(host, SerialConfig::new("/dev/ttyTEST1")).into();
        assert_eq!(transport.kind(), TransportKind::Serial);

        let (mut reader, _writer) = transport.into_split();
        let outcome = reader.read_some(8, Duration::from_millis(10)).await;
        assert_eq!(outcome, ReadOutcome::NoDataNow);
    }

    #[tokio::test]
    async fn invalid_serial_config_is_rejected_before_open() {
        let err = AnyTransport::open(&TransportConfig::Serial(SerialConfig::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidConfig(_)));
    }
}
