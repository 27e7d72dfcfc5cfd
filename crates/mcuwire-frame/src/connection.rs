use std::fmt;
use std::future::Future;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use mcuwire_transport::{AnyTransport, Transport, TransportConfig, TransportKind, TransportWrite};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::accumulator::{Accumulator, PullPolicy};
use crate::codec::{decode_datagram, decode_from, encode, PrefixWidth};
use crate::error::{FrameError, Result};

/// Default timeout for a single transport read.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Default silence after which a response is considered complete.
pub const DEFAULT_IDLE_GAP: Duration = Duration::from_millis(200);

/// Default number of bytes requested per transport read.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 4 * 1024;

/// Tunables for a [`Connection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Timeout of each individual transport read.
    pub read_timeout: Duration,
    /// Silence that ends [`Connection::read_response`].
    pub idle_gap: Duration,
    /// Bytes requested per transport read.
    pub read_chunk_size: usize,
    /// Reject decoded frames with a longer payload. `None` trusts the peer.
    pub max_frame_payload: Option<usize>,
    /// Overall deadline applied to exact and framed reads.
    pub exact_read_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            idle_gap: DEFAULT_IDLE_GAP,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            max_frame_payload: None,
            exact_read_timeout: None,
        }
    }
}

struct ReadSide<R> {
    transport: Option<R>,
    accumulator: Accumulator,
}

/// A transport plus its accumulator.
///
/// Reads serialize against each other and writes serialize against each
/// other, but a writer never waits on a reader. Any failure on the read or
/// write path closes the transport; the connection is then dead and every
/// further call returns [`FrameError::ConnectionClosed`].
pub struct Connection<T: Transport = AnyTransport> {
    kind: TransportKind,
    config: ConnectionConfig,
    read_side: Mutex<ReadSide<T::Reader>>,
    write_side: Mutex<Option<T::Writer>>,
    closed: CancellationToken,
}

impl Connection<AnyTransport> {
    /// Open the transport described by `endpoint` and wrap it.
    pub async fn open(endpoint: &TransportConfig, config: ConnectionConfig) -> Result<Self> {
        let transport = AnyTransport::open(endpoint).await?;
        Ok(Self::with_config(transport, config))
    }
}

impl<T: Transport> Connection<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, ConnectionConfig::default())
    }

    pub fn with_config(transport: T, config: ConnectionConfig) -> Self {
        let kind = transport.kind();
        let (reader, writer) = transport.into_split();
        debug!(%kind, "connection established");
        Self {
            kind,
            config,
            read_side: Mutex::new(ReadSide {
                transport: Some(reader),
                accumulator: Accumulator::new(),
            }),
            write_side: Mutex::new(Some(writer)),
            closed: CancellationToken::new(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Whether the connection has been closed, explicitly or by a failure.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Read exactly `n` bytes, waiting as long as the transport stays open.
    ///
    /// Bounded by [`ConnectionConfig::exact_read_timeout`] when set.
    pub async fn read_exact(&self, n: usize) -> Result<Bytes> {
        self.exact(n, self.config.exact_read_timeout).await
    }

    /// Read exactly `n` bytes within `deadline`.
    ///
    /// On [`FrameError::Timeout`] the bytes pulled so far stay buffered for
    /// the next read.
    pub async fn read_exact_timeout(&self, n: usize, deadline: Duration) -> Result<Bytes> {
        self.exact(n, Some(deadline)).await
    }

    async fn exact(&self, n: usize, limit: Option<Duration>) -> Result<Bytes> {
        let policy = self.policy();
        let mut side = self.lock_read().await?;
        let result = {
            let ReadSide {
                transport,
                accumulator,
            } = &mut *side;
            let transport = transport.as_mut().ok_or(FrameError::ConnectionClosed)?;
            self.guarded(accumulator.take_exact(transport, n, &policy), limit)
                .await
        };
        self.settle(&mut side, result)
    }

    /// Best-effort read of at most `max` bytes using the default read timeout.
    ///
    /// `Ok(None)` means nothing arrived; the connection is still open.
    pub async fn read_up_to(&self, max: usize) -> Result<Option<Bytes>> {
        self.read_up_to_timeout(max, self.config.read_timeout).await
    }

    /// Best-effort read of at most `max` bytes, waiting at most `timeout`.
    pub async fn read_up_to_timeout(&self, max: usize, timeout: Duration) -> Result<Option<Bytes>> {
        let mut side = self.lock_read().await?;
        let result = {
            let ReadSide {
                transport,
                accumulator,
            } = &mut *side;
            let transport = transport.as_mut().ok_or(FrameError::ConnectionClosed)?;
            self.guarded(accumulator.take_up_to(transport, max, timeout), None)
                .await
        };
        self.settle(&mut side, result)
    }

    /// Collect a response whose end is signalled by silence.
    ///
    /// Repeats bounded reads until `max_len` bytes are held, until no new
    /// byte arrived for [`ConnectionConfig::idle_gap`] after the first one,
    /// or until `overall` elapses. The result may be empty.
    pub async fn read_response(&self, max_len: usize, overall: Duration) -> Result<Bytes> {
        if max_len < 1 {
            return Err(FrameError::InvalidReadSize(max_len));
        }
        let mut side = self.lock_read().await?;
        let deadline = Instant::now() + overall;
        let mut response = BytesMut::new();
        let mut last_byte: Option<Instant> = None;

        let result = loop {
            if response.len() >= max_len {
                break Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                break Ok(());
            }
            let mut wait = self.config.read_timeout.min(deadline - now);
            if let Some(last) = last_byte {
                let quiet_until = last + self.config.idle_gap;
                if now >= quiet_until {
                    break Ok(());
                }
                wait = wait.min(quiet_until - now);
            }

            let ReadSide {
                transport,
                accumulator,
            } = &mut *side;
            let Some(transport) = transport.as_mut() else {
                break Err(FrameError::ConnectionClosed);
            };
            let step = self
                .guarded(
                    accumulator.take_up_to(transport, max_len - response.len(), wait),
                    None,
                )
                .await;
            match step {
                Ok(Some(chunk)) => {
                    response.extend_from_slice(&chunk);
                    last_byte = Some(Instant::now());
                }
                Ok(None) => {}
                Err(err) => break Err(err),
            }
        };

        self.settle(&mut side, result)?;
        debug!(bytes = response.len(), "response complete");
        Ok(response.freeze())
    }

    /// Write all of `bytes` as one transport write.
    pub async fn write(&self, bytes: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(FrameError::ConnectionClosed);
        }
        let mut side = self.write_side.lock().await;
        let writer = side.as_mut().ok_or(FrameError::ConnectionClosed)?;
        let result = tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(FrameError::ConnectionClosed),
            res = writer.write_all(bytes) => res.map_err(FrameError::from_transport),
        };

        if let Err(err) = &result {
            warn!(kind = %self.kind, error = %err, "write failed, closing connection");
            self.closed.cancel();
            if let Some(mut writer) = side.take() {
                if let Err(err) = writer.close().await {
                    debug!(error = %err, "transport close failed");
                }
            }
            if let Ok(mut read) = self.read_side.try_lock() {
                read.transport = None;
                read.accumulator.clear();
            }
        }
        result
    }

    /// Encode `payload` with a `prefix_bits` length prefix and write it.
    pub async fn send_frame(&self, payload: &[u8], prefix_bits: u32) -> Result<()> {
        let wire = encode(payload, prefix_bits)?;
        self.write(&wire).await
    }

    /// Same as [`send_frame`](Self::send_frame) with an already validated width.
    pub async fn write_frame(&self, payload: &[u8], width: PrefixWidth) -> Result<()> {
        self.send_frame(payload, width.bits()).await
    }

    /// Read one frame with a `prefix_bits` length prefix and return its payload.
    pub async fn recv_frame(&self, prefix_bits: u32) -> Result<Bytes> {
        let width = PrefixWidth::from_bits(prefix_bits)?;
        self.read_frame(width).await
    }

    /// Read one frame and return its payload.
    ///
    /// The read lock is held across prefix and payload, so concurrent frame
    /// reads never interleave. On a message-oriented transport the frame must
    /// be exactly one datagram.
    pub async fn read_frame(&self, width: PrefixWidth) -> Result<Bytes> {
        let policy = self.policy();
        let max_payload = self.config.max_frame_payload;
        let limit = self.config.exact_read_timeout;
        let mut side = self.lock_read().await?;
        let result = {
            let ReadSide {
                transport,
                accumulator,
            } = &mut *side;
            let transport = transport.as_mut().ok_or(FrameError::ConnectionClosed)?;
            if self.kind.is_message_oriented() {
                let read = async {
                    let datagram = accumulator.take_datagram(transport, &policy).await?;
                    decode_datagram(&datagram, width, max_payload)
                };
                self.guarded(read, limit).await
            } else {
                let read = decode_from(accumulator, transport, width, max_payload, &policy);
                self.guarded(read, limit).await
            }
        };
        self.settle(&mut side, result).map(|frame| frame.payload)
    }

    /// Close the transport. Calling this again is a no-op.
    pub async fn close(&self) {
        let first = !self.closed.is_cancelled();
        self.closed.cancel();

        if let Some(mut writer) = self.write_side.lock().await.take() {
            if let Err(err) = writer.close().await {
                debug!(error = %err, "transport close failed");
            }
        }
        let mut side = self.read_side.lock().await;
        side.transport = None;
        side.accumulator.clear();

        if first {
            debug!(kind = %self.kind, "connection closed");
        }
    }

    fn policy(&self) -> PullPolicy {
        PullPolicy {
            chunk_size: self.config.read_chunk_size,
            read_timeout: self.config.read_timeout,
            message_oriented: self.kind.is_message_oriented(),
        }
    }

    async fn lock_read(&self) -> Result<MutexGuard<'_, ReadSide<T::Reader>>> {
        if self.is_closed() {
            return Err(FrameError::ConnectionClosed);
        }
        let side = self.read_side.lock().await;
        if self.is_closed() {
            return Err(FrameError::ConnectionClosed);
        }
        Ok(side)
    }

    /// Run a read step that ends early when the connection closes or `limit` elapses.
    async fn guarded<O>(
        &self,
        op: impl Future<Output = Result<O>>,
        limit: Option<Duration>,
    ) -> Result<O> {
        let op = async move {
            match limit {
                Some(limit) => tokio::time::timeout(limit, op)
                    .await
                    .unwrap_or(Err(FrameError::Timeout(limit))),
                None => op.await,
            }
        };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(FrameError::ConnectionClosed),
            result = op => result,
        }
    }

    fn settle<O>(&self, side: &mut ReadSide<T::Reader>, result: Result<O>) -> Result<O> {
        if let Err(err) = &result {
            if err.is_fatal() {
                if side.transport.take().is_some() {
                    warn!(kind = %self.kind, error = %err, "read failed, closing connection");
                }
                side.accumulator.clear();
                self.closed.cancel();
                // A writer in flight observes the cancellation and drops its half itself.
                if let Ok(mut writer) = self.write_side.try_lock() {
                    writer.take();
                }
            }
        }
        result
    }
}

impl<T: Transport> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("kind", &self.kind)
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
