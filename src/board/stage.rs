//! Stage capability contract.
//!
//! A stage is an opaque unit of work: it declares which keys it consumes and
//! which keys it publishes, and the board runs it on its own thread. Stages
//! with no inbound keys are sources and are driven through [`Stage::generate`];
//! every other stage is driven through [`Stage::process`].

use crate::board::chunk::Chunk;
use crate::options::Options;
use std::fmt;
use std::time::Duration;
use tracing::{error, warn};

/// Errors that can occur while a stage handles a chunk.
#[derive(Debug, Clone)]
pub enum StageError {
    /// Recoverable error that allows the stage to continue processing.
    Recoverable(String),
    /// Fatal error that requires the stage to shut down.
    Fatal(String),
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageError::Recoverable(msg) => write!(f, "Recoverable error: {}", msg),
            StageError::Fatal(msg) => write!(f, "Fatal error: {}", msg),
        }
    }
}

impl std::error::Error for StageError {}

/// Trait for reporting stage errors.
pub trait ErrorReporter: Send + Sync {
    /// Reports an error from a stage.
    fn report(&self, stage: &str, error: &StageError);
}

/// Error reporter that logs through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, stage: &str, err: &StageError) {
        match err {
            StageError::Recoverable(_) => warn!(stage, "{}", err),
            StageError::Fatal(_) => error!(stage, "{}", err),
        }
    }
}

/// Keys a stage consumes and publishes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageKeys {
    pub inbound: Vec<String>,
    pub outbound: Vec<String>,
}

impl StageKeys {
    pub fn new<I, O>(inbound: I, outbound: O) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
    {
        Self {
            inbound: inbound.into_iter().map(Into::into).collect(),
            outbound: outbound.into_iter().map(Into::into).collect(),
        }
    }

    /// Keys of a source stage: publishes only.
    pub fn source<O>(outbound: O) -> Self
    where
        O: IntoIterator,
        O::Item: Into<String>,
    {
        Self::new(Vec::<String>::new(), outbound)
    }

    /// Keys of a sink stage: consumes only.
    pub fn sink<I>(inbound: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self::new(inbound, Vec::<String>::new())
    }

    pub fn accepts(&self, key: &str) -> bool {
        self.inbound.iter().any(|k| k == key)
    }

    pub fn publishes(&self, key: &str) -> bool {
        self.outbound.iter().any(|k| k == key)
    }

    pub fn is_source(&self) -> bool {
        self.inbound.is_empty()
    }
}

/// Chunks published by a stage during one call, in publication order.
#[derive(Debug, Default)]
pub struct Outbox {
    items: Vec<(String, Chunk)>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `chunk` for every edge leaving this stage on `key`.
    pub fn publish(&mut self, key: impl Into<String>, chunk: Chunk) {
        self.items.push((key.into(), chunk));
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn drain(&mut self) -> std::vec::Drain<'_, (String, Chunk)> {
        self.items.drain(..)
    }
}

/// What a source stage wants after a call to [`Stage::generate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    /// Call `generate` again right away.
    Continue,
    /// Call `generate` again after this pause (stop still interrupts it).
    WaitFor(Duration),
    /// The source has published everything it will ever publish.
    Exhausted,
}

/// A processing stage in a board.
///
/// Each stage runs on its own thread and talks to other stages only through
/// the chunks it publishes.
pub trait Stage: Send + 'static {
    /// Keys this stage consumes and publishes. Must not change after construction.
    fn keys(&self) -> StageKeys;

    /// Handles one chunk that arrived on inbound `key`.
    fn process(
        &mut self,
        _key: &str,
        _chunk: Chunk,
        _outbox: &mut Outbox,
    ) -> Result<(), StageError> {
        Ok(())
    }

    /// Produces the next chunks of a source stage.
    fn generate(&mut self, _outbox: &mut Outbox) -> Result<SourceStatus, StageError> {
        Ok(SourceStatus::Exhausted)
    }

    /// Called once when the stage stops, whatever the reason.
    fn shutdown(&mut self) {}
}

/// Builds a stage from its configuration mapping.
///
/// Implemented for any `Fn(&Options) -> Result<Box<dyn Stage>>`.
pub trait Capability {
    fn build(&self, options: &Options) -> crate::error::Result<Box<dyn Stage>>;
}

impl<F> Capability for F
where
    F: Fn(&Options) -> crate::error::Result<Box<dyn Stage>>,
{
    fn build(&self, options: &Options) -> crate::error::Result<Box<dyn Stage>> {
        self(options)
    }
}
