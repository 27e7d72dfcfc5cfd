use std::time::Duration;

use mcuwire_transport::TransportError;

/// Errors that can occur on a connection or while encoding/decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The prefix width is not one of 8, 16, 32 or 64 bits.
    #[error("invalid prefix width {0} bits (expected 8, 16, 32 or 64)")]
    InvalidPrefixWidth(u32),

    /// A read size below 1 was requested.
    #[error("invalid read size {0} (must be at least 1)")]
    InvalidReadSize(usize),

    /// The payload does not fit in the chosen prefix width.
    #[error("payload too large ({size} bytes, max {max} for this prefix width)")]
    PayloadTooLarge { size: usize, max: u64 },

    /// A decoded frame length exceeds the configured bound.
    #[error("frame length {length} exceeds limit {max}")]
    FrameTooLarge { length: u64, max: usize },

    /// A datagram did not have exactly the expected size.
    #[error("datagram size mismatch (expected {expected} bytes, received {actual})")]
    DatagramSize { expected: usize, actual: usize },

    /// The underlying transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The connection is closed; it must not be used again.
    #[error("connection closed")]
    ConnectionClosed,

    /// Nothing complete arrived before the deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// An I/O error occurred inside a codec.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Whether this error leaves the connection unusable.
    ///
    /// Configuration mistakes and timeouts are recoverable; everything that
    /// touched the wire and failed is not.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            FrameError::InvalidPrefixWidth(_)
                | FrameError::InvalidReadSize(_)
                | FrameError::PayloadTooLarge { .. }
                | FrameError::Timeout(_)
        )
    }

    pub(crate) fn from_transport(err: TransportError) -> Self {
        match err {
            TransportError::Closed => FrameError::ConnectionClosed,
            other => FrameError::Transport(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_not_fatal() {
        assert!(!FrameError::InvalidPrefixWidth(12).is_fatal());
        assert!(!FrameError::InvalidReadSize(0).is_fatal());
        assert!(!FrameError::Timeout(Duration::from_millis(5)).is_fatal());
        assert!(FrameError::ConnectionClosed.is_fatal());
        assert!(FrameError::DatagramSize {
            expected: 4,
            actual: 2
        }
        .is_fatal());
    }

    #[test]
    fn closed_transport_maps_to_connection_closed() {
        assert!(matches!(
            FrameError::from_transport(TransportError::Closed),
            FrameError::ConnectionClosed
        ));
    }
}
