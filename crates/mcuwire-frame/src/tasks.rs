//! Cancellable background read loops.
//!
//! Each loop checks its [`CancellationToken`] on every iteration and hands
//! items to the caller over a bounded channel. [`StreamHandle`] implements
//! [`futures_core::Stream`] so it can be consumed with `StreamExt`.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use mcuwire_transport::Transport;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::Connection;
use crate::error::Result;
use crate::line::{LineConfig, LineReader};

/// Items buffered between a read loop and its consumer.
pub const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Consumer side of a spawned read loop.
///
/// The loop ends after it yields an error, when the connection closes, or
/// when cancelled. `O` is what the task hands back when it finishes.
#[derive(Debug)]
pub struct StreamHandle<I, O = ()> {
    rx: mpsc::Receiver<I>,
    cancel: CancellationToken,
    task: JoinHandle<O>,
}

impl<I, O> StreamHandle<I, O> {
    /// Next item, or `None` once the loop has ended.
    pub async fn recv(&mut self) -> Option<I> {
        self.rx.recv().await
    }

    /// Ask the loop to stop without waiting for it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the loop and wait for it to clean up.
    pub async fn stop(self) -> std::result::Result<O, JoinError> {
        self.cancel.cancel();
        drop(self.rx);
        self.task.await
    }
}

impl<I, O> futures_core::Stream for StreamHandle<I, O> {
    type Item = I;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<I>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Stream lines from `conn` until cancelled or the connection fails.
///
/// Timeouts without data are not reported. The reader's buffer is cleared
/// before the task exits, and the reader is returned by
/// [`StreamHandle::stop`] for reuse.
pub fn spawn_line_stream<T: Transport>(
    conn: Arc<Connection<T>>,
    mut reader: LineReader,
    config: LineConfig,
    cancel: CancellationToken,
) -> StreamHandle<Result<String>, LineReader> {
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    let token = cancel.clone();

    let task = tokio::spawn(async move {
        loop {
            let step = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                line = reader.next_line(&conn, &config) => line,
            };
            match step {
                Ok(Some(line)) => {
                    if !deliver(&tx, &token, Ok(line)).await {
                        break;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    deliver(&tx, &token, Err(err)).await;
                    break;
                }
            }
        }
        reader.clear_buffer();
        debug!("line stream stopped");
        reader
    });

    StreamHandle { rx, cancel, task }
}

/// Stream raw chunks of at most `chunk_size` bytes from `conn`.
pub fn spawn_raw_stream<T: Transport>(
    conn: Arc<Connection<T>>,
    chunk_size: usize,
    cancel: CancellationToken,
) -> StreamHandle<Result<Bytes>> {
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    let token = cancel.clone();

    let task = tokio::spawn(async move {
        loop {
            let step = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                chunk = conn.read_up_to(chunk_size) => chunk,
            };
            match step {
                Ok(Some(chunk)) => {
                    if !deliver(&tx, &token, Ok(chunk)).await {
                        break;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    deliver(&tx, &token, Err(err)).await;
                    break;
                }
            }
        }
        debug!("raw stream stopped");
    });

    StreamHandle { rx, cancel, task }
}

async fn deliver<I>(tx: &mpsc::Sender<I>, token: &CancellationToken, item: I) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mcuwire_transport::TransportKind;

    use super::*;
    use crate::connection::ConnectionConfig;
    use crate::error::FrameError;
    use crate::testing::Script;

    fn shared(script: Script) -> Arc<Connection<Script>> {
        Arc::new(Connection::with_config(
            script,
            ConnectionConfig {
                read_timeout: Duration::from_millis(10),
                ..ConnectionConfig::default()
            },
        ))
    }

    fn short_lines() -> LineConfig {
        LineConfig {
            timeout: Duration::from_millis(50),
            ..LineConfig::default()
        }
    }

    #[tokio::test]
    async fn line_stream_yields_lines_in_order() {
        let script = Script::new(TransportKind::Serial).chunk(b"temp=21\r\nhum=40\r\n");
        let conn = shared(script);
        let mut lines = spawn_line_stream(
            conn,
            LineReader::new(),
            short_lines(),
            CancellationToken::new(),
        );

        assert_eq!(lines.recv().await.unwrap().unwrap(), "temp=21");
        assert_eq!(lines.recv().await.unwrap().unwrap(), "hum=40");
        lines.stop().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_clears_reader_before_exit() {
        let script = Script::new(TransportKind::Serial);
        let handle = script.handle();
        let conn = shared(script);
        let cancel = CancellationToken::new();
        let lines = spawn_line_stream(
            Arc::clone(&conn),
            LineReader::new(),
            LineConfig {
                timeout: Duration::from_secs(5),
                ..LineConfig::default()
            },
            cancel.clone(),
        );

        handle.push(b"no terminator yet");
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        assert!(lines.is_cancelled());

        let reader = tokio::time::timeout(Duration::from_secs(1), lines.stop())
            .await
            .expect("task should observe cancellation promptly")
            .unwrap();
        assert_eq!(reader.buffered(), 0);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn closed_connection_ends_the_stream_with_an_error() {
        let script = Script::new(TransportKind::Stream)
            .chunk(b"last\n")
            .then_close();
        let mut lines = spawn_line_stream(
            shared(script),
            LineReader::new(),
            short_lines(),
            CancellationToken::new(),
        );

        assert_eq!(lines.recv().await.unwrap().unwrap(), "last");
        assert!(matches!(
            lines.recv().await,
            Some(Err(FrameError::ConnectionClosed))
        ));
        assert!(lines.recv().await.is_none());
    }

    #[tokio::test]
    async fn raw_stream_forwards_chunks() {
        let script = Script::new(TransportKind::Stream).chunk(b"abcdef");
        let handle = script.handle();
        let mut raw = spawn_raw_stream(shared(script), 4, CancellationToken::new());

        assert_eq!(raw.recv().await.unwrap().unwrap().as_ref(), b"abcd");
        assert_eq!(raw.recv().await.unwrap().unwrap().as_ref(), b"ef");
        handle.push(b"gh");
        assert_eq!(raw.recv().await.unwrap().unwrap().as_ref(), b"gh");

        raw.cancel();
        raw.stop().await.unwrap();
    }
}
