use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use mcuwire_transport::TransportRead;
use tokio_util::codec::{Decoder, Encoder};

use crate::accumulator::{Accumulator, PullPolicy};
use crate::connection::DEFAULT_READ_CHUNK_SIZE;
use crate::error::{FrameError, Result};

/// Prefix width used when none is specified (CLI default).
pub const DEFAULT_PREFIX_BITS: u32 = 16;

/// Width of the big-endian, unsigned length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrefixWidth {
    U8,
    U16,
    U32,
    U64,
}

impl PrefixWidth {
    /// Validate a width given in bits. Only 8, 16, 32 and 64 are accepted.
    pub fn from_bits(bits: u32) -> Result<Self> {
        match bits {
            8 => Ok(PrefixWidth::U8),
            16 => Ok(PrefixWidth::U16),
            32 => Ok(PrefixWidth::U32),
            64 => Ok(PrefixWidth::U64),
            other => Err(FrameError::InvalidPrefixWidth(other)),
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            PrefixWidth::U8 => 8,
            PrefixWidth::U16 => 16,
            PrefixWidth::U32 => 32,
            PrefixWidth::U64 => 64,
        }
    }

    /// Size of the prefix on the wire.
    pub fn byte_len(self) -> usize {
        (self.bits() / 8) as usize
    }

    /// Largest payload length the prefix can express.
    pub fn max_length(self) -> u64 {
        match self {
            PrefixWidth::U8 => u64::from(u8::MAX),
            PrefixWidth::U16 => u64::from(u16::MAX),
            PrefixWidth::U32 => u64::from(u32::MAX),
            PrefixWidth::U64 => u64::MAX,
        }
    }

    fn put_length(self, length: u64, dst: &mut BytesMut) {
        match self {
            PrefixWidth::U8 => dst.put_u8(length as u8),
            PrefixWidth::U16 => dst.put_u16(length as u16),
            PrefixWidth::U32 => dst.put_u32(length as u32),
            PrefixWidth::U64 => dst.put_u64(length),
        }
    }

    /// Read the prefix from the first `byte_len()` bytes of `src`, always unsigned.
    pub(crate) fn read_length(self, src: &[u8]) -> u64 {
        let mut src = src;
        match self {
            PrefixWidth::U8 => u64::from(src.get_u8()),
            PrefixWidth::U16 => u64::from(src.get_u16()),
            PrefixWidth::U32 => u64::from(src.get_u32()),
            PrefixWidth::U64 => src.get_u64(),
        }
    }
}

impl TryFrom<u32> for PrefixWidth {
    type Error = FrameError;

    fn try_from(bits: u32) -> Result<Self> {
        Self::from_bits(bits)
    }
}

impl fmt::Display for PrefixWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

/// One length-prefixed unit of data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Bytes,
}

impl Frame {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Value carried in the length prefix.
    pub fn length(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Total wire size of this frame (prefix + payload).
    pub fn wire_size(&self, width: PrefixWidth) -> usize {
        width.byte_len() + self.payload.len()
    }
}

/// Encode a frame into the wire format.
///
/// ```text
/// ┌───────────────────────────┬────────────────────┐
/// │ Length (1/2/4/8 B, BE,    │ Payload            │
/// │ unsigned)                 │ (Length bytes)     │
/// └───────────────────────────┴────────────────────┘
/// ```
///
/// Fails instead of truncating when the payload does not fit the prefix.
pub fn encode_frame(payload: &[u8], width: PrefixWidth, dst: &mut BytesMut) -> Result<()> {
    let length = payload.len() as u64;
    if length > width.max_length() {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: width.max_length(),
        });
    }
    dst.reserve(width.byte_len() + payload.len());
    width.put_length(length, dst);
    dst.put_slice(payload);
    Ok(())
}

/// Encode `payload` with a prefix of `prefix_bits` bits into a fresh buffer.
pub fn encode(payload: &[u8], prefix_bits: u32) -> Result<Bytes> {
    let width = PrefixWidth::from_bits(prefix_bits)?;
    let mut dst = BytesMut::with_capacity(width.byte_len() + payload.len());
    encode_frame(payload, width, &mut dst)?;
    Ok(dst.freeze())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(
    src: &mut BytesMut,
    width: PrefixWidth,
    max_payload: Option<usize>,
) -> Result<Option<Frame>> {
    let header = width.byte_len();
    if src.len() < header {
        return Ok(None);
    }

    let length = width.read_length(&src[..header]);
    let payload_len = checked_payload_len(length, max_payload)?;

    let total = header
        .checked_add(payload_len)
        .ok_or(FrameError::FrameTooLarge {
            length,
            max: usize::MAX,
        })?;
    if src.len() < total {
        // Grow with the bytes that actually arrive, not with the announced length.
        src.reserve((total - src.len()).min(DEFAULT_READ_CHUNK_SIZE));
        return Ok(None);
    }

    src.advance(header);
    let payload = src.split_to(payload_len).freeze();
    Ok(Some(Frame { payload }))
}

/// Decode a datagram that must hold exactly one frame and nothing else.
pub fn decode_datagram(
    datagram: &[u8],
    width: PrefixWidth,
    max_payload: Option<usize>,
) -> Result<Frame> {
    let header = width.byte_len();
    if datagram.len() < header {
        return Err(FrameError::DatagramSize {
            expected: header,
            actual: datagram.len(),
        });
    }
    let length = width.read_length(&datagram[..header]);
    let payload_len = checked_payload_len(length, max_payload)?;
    let body = &datagram[header..];
    if body.len() != payload_len {
        return Err(FrameError::DatagramSize {
            expected: header.saturating_add(payload_len),
            actual: datagram.len(),
        });
    }
    Ok(Frame::new(Bytes::copy_from_slice(body)))
}

/// Decode one frame by pulling exact-size reads through an accumulator.
///
/// No bound is applied unless `max_payload` is set; an unbounded decoder
/// trusts the peer's length prefix.
pub async fn decode_from<R: TransportRead>(
    accumulator: &mut Accumulator,
    transport: &mut R,
    width: PrefixWidth,
    max_payload: Option<usize>,
    policy: &PullPolicy,
) -> Result<Frame> {
    let prefix = accumulator
        .take_exact(transport, width.byte_len(), policy)
        .await?;
    let length = width.read_length(&prefix);
    let payload_len = checked_payload_len(length, max_payload)?;
    if payload_len == 0 {
        return Ok(Frame::new(Bytes::new()));
    }
    let payload = accumulator
        .take_exact(transport, payload_len, policy)
        .await?;
    Ok(Frame { payload })
}

fn checked_payload_len(length: u64, max_payload: Option<usize>) -> Result<usize> {
    let payload_len = usize::try_from(length).map_err(|_| FrameError::FrameTooLarge {
        length,
        max: usize::MAX,
    })?;
    if let Some(max) = max_payload {
        if payload_len > max {
            return Err(FrameError::FrameTooLarge { length, max });
        }
    }
    Ok(payload_len)
}

/// `tokio_util` codec for the length-prefixed wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthPrefixCodec {
    width: PrefixWidth,
    max_payload: Option<usize>,
}

impl LengthPrefixCodec {
    pub fn new(width: PrefixWidth) -> Self {
        Self {
            width,
            max_payload: None,
        }
    }

    /// Reject decoded lengths above `max`.
    pub fn with_max_payload(mut self, max: usize) -> Self {
        self.max_payload = Some(max);
        self
    }

    pub fn width(&self) -> PrefixWidth {
        self.width
    }
}

impl Decoder for LengthPrefixCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        decode_frame(src, self.width, self.max_payload)
    }
}

impl<T: AsRef<[u8]>> Encoder<T> for LengthPrefixCodec {
    type Error = FrameError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<()> {
        encode_frame(item.as_ref(), self.width, dst)
    }
}
