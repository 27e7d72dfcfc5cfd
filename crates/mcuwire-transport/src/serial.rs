use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::debug;

use crate::config::SerialConfig;
use crate::error::{Result, TransportError};
use crate::traits::{
    read_stream_with_timeout, ReadOutcome, Transport, TransportKind, TransportRead, TransportWrite,
};

/// Any async byte device that can stand behind a serial transport.
pub trait SerialDevice: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> SerialDevice for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

type BoxedDevice = Box<dyn SerialDevice>;

/// USB serial transport.
///
/// Idle microcontrollers are the common case, so a read that times out is
/// "no data now", never "closed". A zero-length read or a port error means the
/// device is gone.
pub struct SerialTransport {
    device: BoxedDevice,
    config: SerialConfig,
}

impl SerialTransport {
    /// Wrap an already-open device.
    pub fn from_device(device: impl SerialDevice, config: SerialConfig) -> Self {
        Self {
            device: Box::new(device),
            config,
        }
    }

    /// Open the port described by `config`.
    #[cfg(feature = "serial")]
    pub fn open(config: &SerialConfig) -> Result<Self> {
        use tokio_serial::SerialPortBuilderExt;

        config.validate()?;
        let port = tokio_serial::new(&config.path, config.baud_rate)
            .data_bits(native::data_bits(config.data_bits))
            .stop_bits(native::stop_bits(config.stop_bits))
            .parity(native::parity(config.parity))
            .open_native_async()
            .map_err(|err| TransportError::Open {
                path: config.path.clone().into(),
                source: err.into(),
            })?;

        debug!(
            path = %config.path,
            baud = config.baud_rate,
            data_bits = config.data_bits.bits(),
            stop_bits = config.stop_bits.bits(),
            parity = %config.parity,
            "serial port opened"
        );
        Ok(Self::from_device(port, config.clone()))
    }

    /// Open the port described by `config`.
    #[cfg(not(feature = "serial"))]
    pub fn open(config: &SerialConfig) -> Result<Self> {
        config.validate()?;
        Err(TransportError::Unsupported(
            "serial ports require the `serial` feature",
        ))
    }

    /// Line settings this transport was built with.
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }
}

impl fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialTransport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Transport for SerialTransport {
    type Reader = SerialReader;
    type Writer = SerialWriter;

    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn into_split(self) -> (SerialReader, SerialWriter) {
        let (read, write) = tokio::io::split(self.device);
        (
            SerialReader { half: read },
            SerialWriter {
                half: Some(write),
                path: self.config.path,
            },
        )
    }
}

/// Read half of a [`SerialTransport`].
pub struct SerialReader {
    half: ReadHalf<BoxedDevice>,
}

impl TransportRead for SerialReader {
    async fn read_some(&mut self, max_bytes: usize, timeout: Duration) -> ReadOutcome {
        read_stream_with_timeout(&mut self.half, max_bytes, timeout, TransportKind::Serial).await
    }
}

impl fmt::Debug for SerialReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialReader").finish_non_exhaustive()
    }
}

/// Write half of a [`SerialTransport`].
pub struct SerialWriter {
    half: Option<WriteHalf<BoxedDevice>>,
    path: String,
}

impl TransportWrite for SerialWriter {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let half = self.half.as_mut().ok_or(TransportError::Closed)?;
        half.write_all(bytes).await?;
        half.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut half) = self.half.take() {
            if let Err(err) = half.shutdown().await {
                debug!(path = %self.path, error = %err, "serial shutdown failed");
            }
            debug!(path = %self.path, "serial transport closed");
        }
        Ok(())
    }
}

impl fmt::Debug for SerialWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialWriter")
            .field("path", &self.path)
            .field("open", &self.half.is_some())
            .finish()
    }
}

#[cfg(feature = "serial")]
mod native {
    use crate::config::{DataBits, Parity, StopBits};

    pub(super) fn data_bits(bits: DataBits) -> tokio_serial::DataBits {
        match bits {
            DataBits::Five => tokio_serial::DataBits::Five,
            DataBits::Six => tokio_serial::DataBits::Six,
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        }
    }

    pub(super) fn stop_bits(bits: StopBits) -> tokio_serial::StopBits {
        match bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }

    pub(super) fn parity(parity: Parity) -> tokio_serial::Parity {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}
