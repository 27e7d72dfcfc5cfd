use std::fmt;
use std::io;

use mcuwire_frame::FrameError;
use mcuwire_link::LinkError;
use mcuwire_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::AddrInUse
        | io::ErrorKind::AddrNotAvailable => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Open { source, .. }
        | TransportError::Io(source) => io_error(context, source),
        TransportError::InvalidConfig(_) | TransportError::Unsupported(_) => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        TransportError::Closed => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::Transport(err) => transport_error(context, err),
        FrameError::InvalidPrefixWidth(_) | FrameError::InvalidReadSize(_) => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        FrameError::PayloadTooLarge { .. }
        | FrameError::FrameTooLarge { .. }
        | FrameError::DatagramSize { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        FrameError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        FrameError::ConnectionClosed => {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
        }
    }
}

pub fn link_error(context: &str, err: LinkError) -> CliError {
    match err {
        LinkError::Transport(err) => transport_error(context, err),
        LinkError::Frame(err) => frame_error(context, err),
        LinkError::PermissionDenied(_)
        | LinkError::Permission(_)
        | LinkError::PermissionMismatch { .. } => {
            CliError::new(PERMISSION_DENIED, format!("{context}: {err}"))
        }
        LinkError::AttemptInProgress { .. } | LinkError::Cancelled => {
            CliError::new(FAILURE, format!("{context}: {err}"))
        }
        LinkError::Enumeration(_) => CliError::new(INTERNAL, format!("{context}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn refused_connection_is_a_transport_error() {
        let err = link_error(
            "connect failed",
            LinkError::Transport(TransportError::Connect {
                addr: "127.0.0.1:1".to_string(),
                source: io::Error::from(io::ErrorKind::ConnectionRefused),
            }),
        );
        assert_eq!(err.code, TRANSPORT_ERROR);
        assert!(err.message.starts_with("connect failed: "));
    }

    #[test]
    fn frame_errors_map_by_taxonomy() {
        assert_eq!(frame_error("x", FrameError::InvalidPrefixWidth(12)).code, USAGE);
        assert_eq!(
            frame_error(
                "x",
                FrameError::PayloadTooLarge {
                    size: 300,
                    max: 255
                }
            )
            .code,
            DATA_INVALID
        );
        assert_eq!(
            frame_error("x", FrameError::Timeout(Duration::from_secs(1))).code,
            TIMEOUT
        );
        assert_eq!(
            frame_error("x", FrameError::ConnectionClosed).code,
            TRANSPORT_ERROR
        );
    }

    #[test]
    fn permission_errors_map_to_denied() {
        let err = link_error(
            "connect failed",
            LinkError::PermissionDenied("Arduino Uno (2341:0043)".to_string()),
        );
        assert_eq!(err.code, PERMISSION_DENIED);
    }

    #[test]
    fn unsupported_serial_is_usage() {
        let err = transport_error(
            "open failed",
            TransportError::Unsupported("serial ports require the `serial` feature"),
        );
        assert_eq!(err.code, USAGE);
    }
}
