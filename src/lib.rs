//! streamboard - threaded dataflow boards with continuity-aware shutdown
//!
//! Stages run on their own threads and exchange chunks over keyed edges. Every
//! chunk carries a continuity marker; a supervisor watches one edge for the
//! run's terminal marker, lets the board drain, and stops it.

// Enforce error handling discipline
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod app;
pub mod board;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod continuity;
pub mod defaults;
pub mod error;
pub mod options;
pub mod stages;
pub mod supervisor;

// Board (declare → start → probe → stop)
pub use board::{
    Board, BoardConfig, BoardState, Capability, Chunk, EdgeHandle, Endpoint, ErrorReporter,
    LogReporter, Outbox, Probe, SourceStatus, Stage, StageError, StageHandle, StageKeys,
    StopReport, Transport,
};

// Termination
pub use continuity::{Continuity, RunMode, TerminalSet};
pub use supervisor::{
    AbortHandle, AbortSignal, Outcome, Supervisor, SupervisorConfig, SupervisorReport,
    SupervisorState, abort_pair,
};

// Error handling
pub use error::{Result, StreamboardError};

// Config
pub use config::Config;
pub use options::Options;

/// Build version string with optional git commit hash.
///
/// Returns `"0.3.0+abc1234"` when git hash is available, `"0.3.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
