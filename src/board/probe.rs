//! Read-only duplicate of one edge's chunk stream.

use crate::board::chunk::Chunk;
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError, select};
use std::cell::RefCell;
use std::fmt;
use std::thread;
use std::time::Duration;

/// Observes every chunk published on a tapped key, in publication order.
///
/// The feeding channel is unbounded: a slow probe never holds back the stage
/// it observes, and nothing is dropped.
pub struct Probe {
    label: String,
    rx: Receiver<Chunk>,
    /// Chunk taken off the channel by `is_closed`, handed out first.
    pending: RefCell<Option<Chunk>>,
}

/// Outcome of [`Probe::poll_until`].
#[derive(Debug)]
pub(crate) enum PollEvent {
    Chunk(Chunk),
    Timeout,
    Interrupted,
}

impl Probe {
    pub(crate) fn new(label: String, rx: Receiver<Chunk>) -> Self {
        Self {
            label,
            rx,
            pending: RefCell::new(None),
        }
    }

    /// `stage.key` of the tapped output.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Waits up to `timeout` for the next chunk.
    ///
    /// Returns `None` on timeout. Once the publisher is gone and the backlog is
    /// empty, still waits out the full timeout so callers keep their pacing.
    pub fn poll(&self, timeout: Duration) -> Option<Chunk> {
        if let Some(chunk) = self.pending.borrow_mut().take() {
            return Some(chunk);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(chunk) => Some(chunk),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                thread::sleep(timeout);
                None
            }
        }
    }

    /// Takes a chunk if one is already queued.
    pub fn try_poll(&self) -> Option<Chunk> {
        if let Some(chunk) = self.pending.borrow_mut().take() {
            return Some(chunk);
        }
        self.rx.try_recv().ok()
    }

    /// Publisher gone and backlog drained.
    pub fn is_closed(&self) -> bool {
        let mut pending = self.pending.borrow_mut();
        if pending.is_some() {
            return false;
        }
        match self.rx.try_recv() {
            Ok(chunk) => {
                *pending = Some(chunk);
                false
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => true,
        }
    }

    /// Chunks queued and not yet polled.
    pub fn backlog(&self) -> usize {
        self.rx.len() + usize::from(self.pending.borrow().is_some())
    }

    /// Like [`poll`](Self::poll), but a message on `interrupt` ends the wait early.
    pub(crate) fn poll_until(&self, timeout: Duration, interrupt: &Receiver<()>) -> PollEvent {
        if let Some(chunk) = self.pending.borrow_mut().take() {
            return PollEvent::Chunk(chunk);
        }

        select! {
            recv(self.rx) -> msg => match msg {
                Ok(chunk) => PollEvent::Chunk(chunk),
                Err(_) => match interrupt.recv_timeout(timeout) {
                    Ok(()) => PollEvent::Interrupted,
                    Err(RecvTimeoutError::Timeout) => PollEvent::Timeout,
                    Err(RecvTimeoutError::Disconnected) => {
                        thread::sleep(timeout);
                        PollEvent::Timeout
                    }
                },
            },
            recv(interrupt) -> msg => match msg {
                Ok(()) => PollEvent::Interrupted,
                Err(_) => self.poll(timeout).map_or(PollEvent::Timeout, PollEvent::Chunk),
            },
            default(timeout) => PollEvent::Timeout,
        }
    }
}

impl fmt::Debug for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Probe")
            .field("label", &self.label)
            .field("backlog", &self.backlog())
            .finish()
    }
}
