//! Scripted in-memory transport for unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use mcuwire_transport::{
    ReadOutcome, Transport, TransportError, TransportKind, TransportRead, TransportWrite,
};
use tokio::sync::Notify;

#[derive(Default)]
struct State {
    inbound: VecDeque<Bytes>,
    written: Vec<u8>,
    reads: usize,
    writes: usize,
    close_at_end: bool,
    loopback: bool,
    fail_writes: bool,
    writer_closed: bool,
}

/// Shared view of a script for pushing data and inspecting effects.
#[derive(Clone)]
pub(crate) struct ScriptHandle {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

impl ScriptHandle {
    pub(crate) fn push(&self, bytes: &[u8]) {
        if !bytes.is_empty() {
            self.state
                .lock()
                .unwrap()
                .inbound
                .push_back(Bytes::copy_from_slice(bytes));
        }
        self.notify.notify_one();
    }

    pub(crate) fn close(&self) {
        self.state.lock().unwrap().close_at_end = true;
        self.notify.notify_one();
    }

    pub(crate) fn reads(&self) -> usize {
        self.state.lock().unwrap().reads
    }

    pub(crate) fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        self.state.lock().unwrap().written.clone()
    }

    pub(crate) fn writer_closed(&self) -> bool {
        self.state.lock().unwrap().writer_closed
    }
}

/// Builder for a transport that replays queued chunks.
///
/// Stream and serial kinds hand chunks out at most `fragment` bytes at a time;
/// the datagram kind always returns whole chunks.
pub(crate) struct Script {
    kind: TransportKind,
    fragment: Option<usize>,
    handle: ScriptHandle,
}

impl Script {
    pub(crate) fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            fragment: None,
            handle: ScriptHandle {
                state: Arc::new(Mutex::new(State::default())),
                notify: Arc::new(Notify::new()),
            },
        }
    }

    pub(crate) fn fragment(mut self, size: usize) -> Self {
        self.fragment = Some(size.max(1));
        self
    }

    pub(crate) fn chunk(self, bytes: &[u8]) -> Self {
        self.handle.push(bytes);
        self
    }

    pub(crate) fn then_close(self) -> Self {
        self.handle.state.lock().unwrap().close_at_end = true;
        self
    }

    /// Everything written comes back on the read side.
    pub(crate) fn loopback(self) -> Self {
        self.handle.state.lock().unwrap().loopback = true;
        self
    }

    pub(crate) fn failing_writes(self) -> Self {
        self.handle.state.lock().unwrap().fail_writes = true;
        self
    }

    pub(crate) fn handle(&self) -> ScriptHandle {
        self.handle.clone()
    }

    pub(crate) fn split(self) -> (ScriptReader, ScriptWriter) {
        self.into_split()
    }
}

impl Transport for Script {
    type Reader = ScriptReader;
    type Writer = ScriptWriter;

    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn into_split(self) -> (ScriptReader, ScriptWriter) {
        (
            ScriptReader {
                kind: self.kind,
                fragment: self.fragment,
                handle: self.handle.clone(),
            },
            ScriptWriter {
                handle: self.handle,
            },
        )
    }
}

pub(crate) struct ScriptReader {
    kind: TransportKind,
    fragment: Option<usize>,
    handle: ScriptHandle,
}

impl ScriptReader {
    fn try_pop(&self, max_bytes: usize) -> Option<ReadOutcome> {
        let mut state = self.handle.state.lock().unwrap();
        if let Some(mut chunk) = state.inbound.pop_front() {
            if !self.kind.is_message_oriented() {
                let limit = max_bytes.max(1).min(self.fragment.unwrap_or(usize::MAX));
                if chunk.len() > limit {
                    let rest = chunk.split_off(limit);
                    state.inbound.push_front(rest);
                }
            }
            return Some(ReadOutcome::Data(chunk));
        }
        if state.close_at_end {
            return Some(ReadOutcome::Closed);
        }
        None
    }
}

impl TransportRead for ScriptReader {
    async fn read_some(&mut self, max_bytes: usize, timeout: Duration) -> ReadOutcome {
        self.handle.state.lock().unwrap().reads += 1;
        if let Some(outcome) = self.try_pop(max_bytes) {
            return outcome;
        }
        if tokio::time::timeout(timeout, self.handle.notify.notified())
            .await
            .is_err()
        {
            return ReadOutcome::NoDataNow;
        }
        self.try_pop(max_bytes).unwrap_or(ReadOutcome::NoDataNow)
    }
}

pub(crate) struct ScriptWriter {
    handle: ScriptHandle,
}

impl TransportWrite for ScriptWriter {
    async fn write_all(&mut self, bytes: &[u8]) -> mcuwire_transport::Result<()> {
        let loopback = {
            let mut state = self.handle.state.lock().unwrap();
            if state.fail_writes {
                return Err(TransportError::Io(std::io::Error::from(
                    std::io::ErrorKind::BrokenPipe,
                )));
            }
            if state.writer_closed {
                return Err(TransportError::Closed);
            }
            state.written.extend_from_slice(bytes);
            state.writes += 1;
            state.loopback
        };
        if loopback {
            self.handle.push(bytes);
        }
        Ok(())
    }

    async fn close(&mut self) -> mcuwire_transport::Result<()> {
        self.handle.state.lock().unwrap().writer_closed = true;
        Ok(())
    }
}
