//! Data chunks travelling along edges.

use crate::continuity::Continuity;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Opaque chunk payload. Shared, so fan-out and probes clone a pointer, not the data.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// One unit of work on an edge: an opaque payload tagged with a continuity marker.
#[derive(Clone)]
pub struct Chunk {
    payload: Payload,
    continuity: Continuity,
    sequence: u64,
    created: Instant,
    segment: Option<Arc<str>>,
}

impl Chunk {
    /// Creates a chunk around any payload value.
    pub fn new<T: Any + Send + Sync>(payload: T, continuity: Continuity, sequence: u64) -> Self {
        Self::from_payload(Arc::new(payload), continuity, sequence)
    }

    /// Creates a chunk around an already shared payload.
    pub fn from_payload(payload: Payload, continuity: Continuity, sequence: u64) -> Self {
        Self {
            payload,
            continuity,
            sequence,
            created: Instant::now(),
            segment: None,
        }
    }

    /// A chunk with no data, used for pure control signals.
    pub fn marker(continuity: Continuity, sequence: u64) -> Self {
        Self::new((), continuity, sequence)
    }

    /// Labels the segment (e.g. source file) this chunk belongs to.
    pub fn with_segment(mut self, segment: impl Into<Arc<str>>) -> Self {
        self.segment = Some(segment.into());
        self
    }

    /// Same payload and metadata, different continuity tag.
    pub fn with_continuity(mut self, continuity: Continuity) -> Self {
        self.continuity = continuity;
        self
    }

    pub fn continuity(&self) -> Continuity {
        self.continuity
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn segment(&self) -> Option<&str> {
        self.segment.as_deref()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Borrows the payload as `T`, or `None` if it holds something else.
    pub fn payload_as<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("continuity", &self.continuity)
            .field("sequence", &self.sequence)
            .field("segment", &self.segment)
            .finish_non_exhaustive()
    }
}
