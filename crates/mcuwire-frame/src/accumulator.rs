use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use mcuwire_transport::{ReadOutcome, TransportRead};
use tracing::trace;

use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// How an [`Accumulator`] pulls from its transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullPolicy {
    /// Bytes requested per transport read.
    pub chunk_size: usize,
    /// Timeout for each individual transport read.
    pub read_timeout: Duration,
    /// Each receive is a whole message that must not be merged with others.
    pub message_oriented: bool,
}

/// FIFO of bytes read from a transport but not yet handed to a caller.
///
/// Bytes are only ever appended at the tail and consumed from the head, so
/// nothing is reordered, duplicated or dropped between calls.
#[derive(Debug)]
pub struct Accumulator {
    buf: BytesMut,
}

impl Default for Accumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Accumulator {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
        }
    }

    /// Append bytes at the tail.
    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// View of the buffered bytes, head first.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Offset of the first CR or LF in the buffered bytes.
    pub fn find_delimiter(&self) -> Option<usize> {
        self.buf.iter().position(|&b| b == b'\r' || b == b'\n')
    }

    /// Remove up to `n` bytes from the head.
    pub fn consume(&mut self, n: usize) -> Bytes {
        let n = n.min(self.buf.len());
        self.buf.split_to(n).freeze()
    }

    /// Drop `n` bytes from the head without returning them.
    pub fn skip(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.advance(n);
    }

    /// Remove and return everything buffered.
    pub fn take_all(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Discard everything buffered.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Return exactly `n` bytes, pulling from `transport` until they are available.
    ///
    /// Idle reads are retried; only a closed transport ends the loop early, in
    /// which case the connection must be treated as dead. On message-oriented
    /// transports a single receive must be exactly `n` bytes, because joining
    /// two datagrams would corrupt message boundaries.
    pub async fn take_exact<R: TransportRead>(
        &mut self,
        transport: &mut R,
        n: usize,
        policy: &PullPolicy,
    ) -> Result<Bytes> {
        if n < 1 {
            return Err(FrameError::InvalidReadSize(n));
        }
        if self.buf.len() >= n {
            return Ok(self.consume(n));
        }

        if policy.message_oriented {
            return self.take_exact_datagram(transport, n, policy).await;
        }

        while self.buf.len() < n {
            match transport
                .read_some(policy.chunk_size.max(1), policy.read_timeout)
                .await
            {
                ReadOutcome::Data(chunk) => {
                    trace!(
                        received = chunk.len(),
                        buffered = self.buf.len(),
                        wanted = n,
                        "accumulating"
                    );
                    self.append(&chunk);
                }
                ReadOutcome::NoDataNow => continue,
                ReadOutcome::Closed => return Err(FrameError::ConnectionClosed),
            }
        }

        Ok(self.consume(n))
    }

    async fn take_exact_datagram<R: TransportRead>(
        &mut self,
        transport: &mut R,
        n: usize,
        policy: &PullPolicy,
    ) -> Result<Bytes> {
        // A short residue of an earlier datagram cannot be topped up from the next one.
        if !self.buf.is_empty() {
            return Err(FrameError::DatagramSize {
                expected: n,
                actual: self.buf.len(),
            });
        }

        loop {
            match transport.read_some(n, policy.read_timeout).await {
                ReadOutcome::Data(datagram) if datagram.len() == n => return Ok(datagram),
                ReadOutcome::Data(datagram) => {
                    return Err(FrameError::DatagramSize {
                        expected: n,
                        actual: datagram.len(),
                    })
                }
                ReadOutcome::NoDataNow => continue,
                ReadOutcome::Closed => return Err(FrameError::ConnectionClosed),
            }
        }
    }

    /// Return up to `max` bytes.
    ///
    /// Buffered bytes are served without touching the transport. Otherwise
    /// exactly one bounded read is issued. `Ok(None)` means no data arrived
    /// in time, which is distinct from a closed transport.
    pub async fn take_up_to<R: TransportRead>(
        &mut self,
        transport: &mut R,
        max: usize,
        timeout: Duration,
    ) -> Result<Option<Bytes>> {
        if max < 1 {
            return Err(FrameError::InvalidReadSize(max));
        }
        if !self.buf.is_empty() {
            return Ok(Some(self.consume(max)));
        }

        match transport.read_some(max, timeout).await {
            ReadOutcome::Data(mut chunk) => {
                if chunk.len() > max {
                    // Whole datagram larger than asked for: keep the tail for the next call.
                    let head = chunk.split_to(max);
                    self.append(&chunk);
                    Ok(Some(head))
                } else {
                    Ok(Some(chunk))
                }
            }
            ReadOutcome::NoDataNow => Ok(None),
            ReadOutcome::Closed => Err(FrameError::ConnectionClosed),
        }
    }

    /// Receive one whole message on a message-oriented transport.
    ///
    /// A residue left by an earlier [`take_up_to`](Self::take_up_to) counts as
    /// the remainder of its datagram and is returned first.
    pub async fn take_datagram<R: TransportRead>(
        &mut self,
        transport: &mut R,
        policy: &PullPolicy,
    ) -> Result<Bytes> {
        if !self.buf.is_empty() {
            return Ok(self.take_all());
        }
        loop {
            match transport
                .read_some(policy.chunk_size.max(1), policy.read_timeout)
                .await
            {
                ReadOutcome::Data(datagram) => return Ok(datagram),
                ReadOutcome::NoDataNow => continue,
                ReadOutcome::Closed => return Err(FrameError::ConnectionClosed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use mcuwire_transport::TransportKind;

    use super::*;
    use crate::testing::Script;

    fn stream_policy() -> PullPolicy {
        PullPolicy {
            chunk_size: 4096,
            read_timeout: Duration::from_millis(10),
            message_oriented: false,
        }
    }

    fn datagram_policy() -> PullPolicy {
        PullPolicy {
            message_oriented: true,
            ..stream_policy()
        }
    }

    #[tokio::test]
    async fn fragmentation_does_not_change_output() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let mut outputs = Vec::new();

        for fragment in [1usize, 3, 64, 999, 1000] {
            let script = Script::new(TransportKind::Stream)
                .fragment(fragment)
                .chunk(&payload)
                .then_close();
            let (mut reader, _writer) = script.split();
            let mut acc = Accumulator::new();

            let mut collected = Vec::new();
            for n in [1usize, 10, 100, 389, 500] {
                let bytes = acc
                    .take_exact(&mut reader, n, &stream_policy())
                    .await
                    .unwrap();
                assert_eq!(bytes.len(), n);
                collected.extend_from_slice(&bytes);
            }
            outputs.push(collected);
        }

        for output in &outputs {
            assert_eq!(output, &payload);
        }
    }

    #[tokio::test]
    async fn buffered_bytes_skip_the_transport() {
        let script = Script::new(TransportKind::Stream).then_close();
        let handle = script.handle();
        let (mut reader, _writer) = script.split();
        let mut acc = Accumulator::new();
        acc.append(b"abcdef");

        let head = acc
            .take_exact(&mut reader, 4, &stream_policy())
            .await
            .unwrap();
        assert_eq!(head.as_ref(), b"abcd");
        assert_eq!(handle.reads(), 0);
        assert_eq!(acc.as_slice(), b"ef");
    }

    #[tokio::test]
    async fn idle_reads_are_retried_until_satisfied() {
        let script = Script::new(TransportKind::Serial);
        let handle = script.handle();
        let (mut reader, _writer) = script.split();

        let feeder = tokio::spawn({
            let handle = handle.clone();
            async move {
                for part in [&b"he"[..], b"ll", b"o"] {
                    tokio::time::sleep(Duration::from_millis(25)).await;
                    handle.push(part);
                }
            }
        });

        let mut acc = Accumulator::new();
        let bytes = acc
            .take_exact(&mut reader, 5, &stream_policy())
            .await
            .unwrap();
        assert_eq!(bytes.as_ref(), b"hello");
        feeder.await.unwrap();
    }

    #[tokio::test]
    async fn closed_before_satisfied_fails_but_keeps_bytes() {
        let script = Script::new(TransportKind::Stream)
            .chunk(b"abc")
            .then_close();
        let (mut reader, _writer) = script.split();
        let mut acc = Accumulator::new();

        let err = acc
            .take_exact(&mut reader, 8, &stream_policy())
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
        assert_eq!(acc.as_slice(), b"abc");
    }

    #[tokio::test]
    async fn zero_size_is_a_configuration_error() {
        let script = Script::new(TransportKind::Stream);
        let (mut reader, _writer) = script.split();
        let mut acc = Accumulator::new();

        assert!(matches!(
            acc.take_exact(&mut reader, 0, &stream_policy()).await,
            Err(FrameError::InvalidReadSize(0))
        ));
        assert!(matches!(
            acc.take_up_to(&mut reader, 0, Duration::from_millis(1))
                .await,
            Err(FrameError::InvalidReadSize(0))
        ));
    }

    #[tokio::test]
    async fn datagram_exact_read_requires_matching_size() {
        let script = Script::new(TransportKind::Datagram)
            .chunk(b"four")
            .chunk(b"abc")
            .then_close();
        let (mut reader, _writer) = script.split();
        let mut acc = Accumulator::new();

        let first = acc
            .take_exact(&mut reader, 4, &datagram_policy())
            .await
            .unwrap();
        assert_eq!(first.as_ref(), b"four");

        let err = acc
            .take_exact(&mut reader, 4, &datagram_policy())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FrameError::DatagramSize {
                expected: 4,
                actual: 3
            }
        ));
    }

    #[tokio::test]
    async fn take_up_to_serves_buffer_then_one_read() {
        let script = Script::new(TransportKind::Stream).chunk(b"xyz");
        let handle = script.handle();
        let (mut reader, _writer) = script.split();
        let mut acc = Accumulator::new();
        acc.append(b"12345");

        let timeout = Duration::from_millis(10);
        let first = acc.take_up_to(&mut reader, 3, timeout).await.unwrap();
        assert_eq!(first.as_deref(), Some(&b"123"[..]));
        let second = acc.take_up_to(&mut reader, 10, timeout).await.unwrap();
        assert_eq!(second.as_deref(), Some(&b"45"[..]));
        assert_eq!(handle.reads(), 0);

        let third = acc.take_up_to(&mut reader, 10, timeout).await.unwrap();
        assert_eq!(third.as_deref(), Some(&b"xyz"[..]));
        let fourth = acc.take_up_to(&mut reader, 10, timeout).await.unwrap();
        assert_eq!(fourth, None);
        assert_eq!(handle.reads(), 2);
    }

    #[tokio::test]
    async fn oversized_datagram_tail_is_kept() {
        let script = Script::new(TransportKind::Datagram).chunk(b"0123456789");
        let (mut reader, _writer) = script.split();
        let mut acc = Accumulator::new();

        let head = acc
            .take_up_to(&mut reader, 4, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(head.as_deref(), Some(&b"0123"[..]));
        assert_eq!(acc.as_slice(), b"456789");
    }

    #[test]
    fn finds_first_cr_or_lf() {
        let mut acc = Accumulator::new();
        assert_eq!(acc.find_delimiter(), None);
        acc.append(b"ab\ncd\r");
        assert_eq!(acc.find_delimiter(), Some(2));
        acc.skip(3);
        assert_eq!(acc.find_delimiter(), Some(2));
    }
}
