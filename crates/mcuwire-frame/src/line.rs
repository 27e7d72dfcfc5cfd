use std::time::Duration;

use bytes::Bytes;
use mcuwire_transport::Transport;
use tokio::time::Instant;

use crate::accumulator::Accumulator;
use crate::connection::Connection;
use crate::error::{FrameError, Result};

/// Default deadline for one line.
pub const DEFAULT_LINE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default bound on a buffered line.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 1024;

/// Tunables for line reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineConfig {
    pub timeout: Duration,
    pub max_line_length: usize,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_LINE_TIMEOUT,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

/// Assembles CR, LF or CRLF terminated text lines on top of a [`Connection`].
///
/// Keeps its own buffer, so bytes that follow a line stay here rather than
/// in the connection. A CR at the very end of a chunk remembers to swallow
/// one LF at the start of the next.
#[derive(Debug, Default)]
pub struct LineReader {
    buf: Accumulator,
    skip_lf: bool,
}

impl LineReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read one line without its terminator.
    ///
    /// - A line longer than `max_length` is returned in `max_length` pieces.
    /// - On timeout, partial content is returned and the buffer cleared.
    /// - On timeout with nothing buffered, returns `Ok(None)`.
    ///
    /// Never waits past `timeout`. Invalid UTF-8 is replaced lossily.
    pub async fn read_line<T: Transport>(
        &mut self,
        conn: &Connection<T>,
        timeout: Duration,
        max_length: usize,
    ) -> Result<Option<String>> {
        if max_length < 1 {
            return Err(FrameError::InvalidReadSize(max_length));
        }
        let deadline = Instant::now() + timeout;

        loop {
            if self.skip_lf && !self.buf.is_empty() {
                if self.buf.as_slice()[0] == b'\n' {
                    self.buf.skip(1);
                }
                self.skip_lf = false;
            }

            if let Some(end) = self.buf.find_delimiter() {
                let line = self.buf.consume(end);
                let delimiter = self.buf.as_slice()[0];
                self.buf.skip(1);
                if delimiter == b'\r' {
                    match self.buf.as_slice().first() {
                        Some(b'\n') => self.buf.skip(1),
                        Some(_) => {}
                        None => self.skip_lf = true,
                    }
                }
                return Ok(Some(to_text(line)));
            }

            if self.buf.len() >= max_length {
                return Ok(Some(to_text(self.buf.consume(max_length))));
            }

            let now = Instant::now();
            if now >= deadline {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(to_text(self.buf.take_all())));
            }

            let want = max_length - self.buf.len();
            if let Some(chunk) = conn.read_up_to_timeout(want, deadline - now).await? {
                self.buf.append(&chunk);
            }
        }
    }

    /// [`read_line`](Self::read_line) with the limits from `config`.
    pub async fn next_line<T: Transport>(
        &mut self,
        conn: &Connection<T>,
        config: &LineConfig,
    ) -> Result<Option<String>> {
        self.read_line(conn, config.timeout, config.max_line_length)
            .await
    }

    /// Bytes held but not yet returned as a line.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop everything buffered.
    pub fn clear_buffer(&mut self) {
        self.buf.clear();
        self.skip_lf = false;
    }
}

fn to_text(line: Bytes) -> String {
    String::from_utf8_lossy(&line).into_owned()
}
