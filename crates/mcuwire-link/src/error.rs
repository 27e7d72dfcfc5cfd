/// Errors that can occur while establishing or tearing down a link.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// `connect()` was called while another attempt or connection holds the slot.
    #[error("connection attempt rejected: lifecycle is {state}")]
    AttemptInProgress { state: &'static str },

    /// The permission gate denied access to the device.
    #[error("permission denied for {0}")]
    PermissionDenied(String),

    /// The permission gate failed to produce a decision.
    #[error("permission request failed: {0}")]
    Permission(String),

    /// The gate answered for a different device than the one requested.
    #[error("permission event for {actual} does not match request for {expected}")]
    PermissionMismatch { expected: String, actual: String },

    /// The attempt was superseded by `disconnect()`.
    #[error("connection attempt cancelled")]
    Cancelled,

    /// Device enumeration failed.
    #[error("device enumeration failed: {0}")]
    Enumeration(String),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] mcuwire_transport::TransportError),

    /// Connection-level error.
    #[error("frame error: {0}")]
    Frame(#[from] mcuwire_frame::FrameError),
}

pub type Result<T> = std::result::Result<T, LinkError>;
