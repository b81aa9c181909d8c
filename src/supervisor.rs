//! Termination supervisor.
//!
//! Watches one probe for the run's terminal continuity marker, then lets the
//! board drain for a grace interval and stops it:
//!
//! ```text
//! Waiting ──terminal──▶ TerminalSeen ──▶ Draining ──grace──▶ Stopped
//!    └────────────────────── abort ─────────────────────────────▲
//! ```
//!
//! An abort from any state goes straight to `Stopped`, bounded by the abort delay.

use crate::board::probe::PollEvent;
use crate::board::{Board, Probe, StopReport};
use crate::continuity::{Continuity, TerminalSet};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Waiting,
    TerminalSeen,
    Draining,
    Stopped,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Waiting => "waiting",
            SupervisorState::TerminalSeen => "terminal_seen",
            SupervisorState::Draining => "draining",
            SupervisorState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Terminal marker seen and grace interval elapsed.
    Completed,
    /// Stopped by the operator.
    Aborted,
}

/// One state entered by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub state: SupervisorState,
    /// Milliseconds since the supervisor started.
    pub at_ms: u64,
}

/// Summary of a supervised run.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorReport {
    pub outcome: Outcome,
    pub history: Vec<Transition>,
    /// Chunks read from the probe while waiting.
    pub chunks_observed: u64,
    /// The terminal marker that ended the run, if any.
    pub terminal: Option<Continuity>,
    pub elapsed_ms: u64,
    pub stop: StopReport,
}

impl SupervisorReport {
    pub fn is_completed(&self) -> bool {
        self.outcome == Outcome::Completed
    }

    /// States visited, in order.
    pub fn states(&self) -> Vec<SupervisorState> {
        self.history.iter().map(|t| t.state).collect()
    }
}

/// Timing of a supervised run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Bounded wait of one probe poll.
    pub poll_interval: Duration,
    /// Wait between the terminal marker and stop-all.
    pub grace: Duration,
    /// Time stages get to exit after an abort.
    pub abort_delay: Duration,
}

/// Requests an abort. Cheap to clone; usable from any thread or a signal task.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Sender<()>,
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    /// Requests an abort. Calling it again has no further effect.
    pub fn abort(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            info!("abort requested");
            // Capacity 1: a full channel means a wake-up is already pending.
            self.tx.try_send(()).ok();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Receiving side of an abort, owned by the supervisor.
#[derive(Debug)]
pub struct AbortSignal {
    rx: Receiver<()>,
    // Keeps the channel connected when every handle is dropped.
    _keepalive: Sender<()>,
    flag: Arc<AtomicBool>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Waits up to `timeout`. Returns `true` as soon as an abort is requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.is_aborted() {
            return true;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) => self.is_aborted(),
            Err(RecvTimeoutError::Disconnected) => {
                thread::sleep(timeout);
                self.is_aborted()
            }
        }
    }

    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

/// Creates a connected abort handle and signal.
pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = bounded(1);
    let flag = Arc::new(AtomicBool::new(false));
    (
        AbortHandle {
            tx: tx.clone(),
            flag: Arc::clone(&flag),
        },
        AbortSignal {
            rx,
            _keepalive: tx,
            flag,
        },
    )
}

/// Drives one board from start of run to `Stopped`.
pub struct Supervisor {
    probe: Option<Probe>,
    terminals: TerminalSet,
    config: SupervisorConfig,
    abort: AbortSignal,
    state: SupervisorState,
    history: Vec<Transition>,
    started: Instant,
    chunks_observed: u64,
    terminal: Option<Continuity>,
}

impl Supervisor {
    pub fn new(
        probe: Probe,
        terminals: TerminalSet,
        config: SupervisorConfig,
        abort: AbortSignal,
    ) -> Self {
        Self {
            probe: Some(probe),
            terminals,
            config,
            abort,
            state: SupervisorState::Waiting,
            history: Vec::new(),
            started: Instant::now(),
            chunks_observed: 0,
            terminal: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    fn enter(&mut self, state: SupervisorState) {
        let at_ms = self.started.elapsed().as_millis() as u64;
        if !self.history.is_empty() {
            info!(from = %self.state, to = %state, at_ms, "supervisor transition");
        }
        self.state = state;
        self.history.push(Transition { state, at_ms });
    }

    /// Runs the state machine to completion. `board` should already be running.
    pub fn run(mut self, board: &mut Board) -> SupervisorReport {
        self.started = Instant::now();
        self.enter(SupervisorState::Waiting);
        let label = self.probe.as_ref().map(|p| p.label().to_string());
        info!(board = %board.name(), probe = ?label, "waiting for terminal marker");

        if !self.wait_for_terminal() {
            return self.abort_run(board);
        }

        self.enter(SupervisorState::TerminalSeen);
        // Nothing is read from the probe edge after this point.
        self.probe = None;

        self.enter(SupervisorState::Draining);
        board.enter_draining();
        debug!(grace_ms = self.config.grace.as_millis() as u64, "draining");
        if self.abort.wait(self.config.grace) {
            return self.abort_run(board);
        }

        let stop = board.stop_all();
        self.enter(SupervisorState::Stopped);
        self.finish(Outcome::Completed, stop)
    }

    /// Polls the probe until a terminal chunk arrives. `false` on abort.
    fn wait_for_terminal(&mut self) -> bool {
        let mut warned_closed = false;
        loop {
            if self.abort.is_aborted() {
                return false;
            }
            let Some(probe) = self.probe.as_ref() else {
                // Nothing left to observe; only an abort ends the run.
                while !self.abort.wait(self.config.poll_interval) {}
                return false;
            };

            match probe.poll_until(self.config.poll_interval, self.abort.receiver()) {
                PollEvent::Interrupted => return false,
                PollEvent::Timeout => {
                    if !warned_closed && probe.is_closed() {
                        warn!(
                            probe = probe.label(),
                            "probe edge closed before a terminal marker; waiting for abort"
                        );
                        warned_closed = true;
                    }
                }
                PollEvent::Chunk(chunk) => {
                    self.chunks_observed += 1;
                    let continuity = chunk.continuity();
                    if self.terminals.contains(continuity) {
                        info!(%continuity, sequence = chunk.sequence(), "terminal marker seen");
                        self.terminal = Some(continuity);
                        return true;
                    }
                    trace!(%continuity, sequence = chunk.sequence(), "probe chunk");
                }
            }
        }
    }

    fn abort_run(mut self, board: &mut Board) -> SupervisorReport {
        info!(from = %self.state, "aborting run");
        self.probe = None;
        let stop = board.stop_all_within(self.config.abort_delay);
        self.enter(SupervisorState::Stopped);
        self.finish(Outcome::Aborted, stop)
    }

    fn finish(self, outcome: Outcome, stop: StopReport) -> SupervisorReport {
        SupervisorReport {
            outcome,
            history: self.history,
            chunks_observed: self.chunks_observed,
            terminal: self.terminal,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            stop,
        }
    }
}
