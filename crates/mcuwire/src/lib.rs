//! Reliable byte and frame links to microcontrollers.
//!
//! mcuwire talks to devices over TCP, UDP and USB serial through one
//! buffered connection type, with big-endian length-prefixed framing and a
//! permission-gated connection lifecycle.
//!
//! # Crate Structure
//!
//! - [`transport`]: Transport capability and the TCP/UDP/serial variants
//! - [`frame`]: Connection, accumulator, frame codec, line reader
//! - [`link`]: Device identities, permission gates, connection lifecycle

/// Re-export transport types.
pub mod transport {
    pub use mcuwire_transport::*;
}

/// Re-export connection and framing types.
pub mod frame {
    pub use mcuwire_frame::*;
}

/// Re-export lifecycle types.
pub mod link {
    pub use mcuwire_link::*;
}
