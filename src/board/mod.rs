//! Dataflow board.
//!
//! Stages run in their own threads, connected by bounded crossbeam channels
//! for backpressure. Edges are keyed: a stage publishes on named outbound keys
//! and consumes named inbound keys.

pub mod chunk;
pub mod edge;
pub mod network;
pub mod probe;
pub(crate) mod runner;
pub mod stage;
pub mod topology;

pub use chunk::{Chunk, Payload};
pub use edge::{EdgeHandle, EdgeSpec, Endpoint, Transport};
pub use network::{LoopbackNetwork, NetworkTransport, RisePolicy, TransportError};
pub use probe::Probe;
pub use stage::{
    Capability, ErrorReporter, LogReporter, Outbox, SourceStatus, Stage, StageError, StageKeys,
};
pub use topology::{Board, BoardConfig, BoardState, StageHandle, StopReport};
