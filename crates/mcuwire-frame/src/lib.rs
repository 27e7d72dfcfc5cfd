//! Buffered connections and length-prefixed framing over mcuwire transports.
//!
//! A [`Connection`] owns one transport and one [`Accumulator`]. It offers:
//! - exact-size reads that loop until satisfied or the transport closes
//! - best-effort reads of up to N bytes
//! - frames with a 1, 2, 4 or 8 byte big-endian unsigned length prefix
//!
//! [`LineReader`] layers text lines on top, and [`tasks`] runs cancellable
//! read loops in the background.

pub mod accumulator;
pub mod codec;
pub mod connection;
pub mod error;
pub mod line;
pub mod tasks;

#[cfg(test)]
mod testing;

pub use accumulator::{Accumulator, PullPolicy};
pub use codec::{
    decode_datagram, decode_frame, decode_from, encode, encode_frame, Frame, LengthPrefixCodec,
    PrefixWidth, DEFAULT_PREFIX_BITS,
};
pub use connection::{
    Connection, ConnectionConfig, DEFAULT_IDLE_GAP, DEFAULT_READ_CHUNK_SIZE, DEFAULT_READ_TIMEOUT,
};
pub use error::{FrameError, Result};
pub use line::{LineConfig, LineReader, DEFAULT_LINE_TIMEOUT, DEFAULT_MAX_LINE_LENGTH};
pub use tasks::{spawn_line_stream, spawn_raw_stream, StreamHandle, STREAM_CHANNEL_CAPACITY};
