//! Fan-in stage: aligns chunks from several keys into one combined chunk.

use crate::board::{Chunk, Outbox, Stage, StageError, StageKeys};
use crate::continuity::Continuity;
use crate::error::{Result, StreamboardError};
use crate::options::Options;
use std::collections::VecDeque;

/// Payload of a merged chunk: one part per input key, in declared key order.
#[derive(Debug, Clone)]
pub struct MergedParts {
    pub parts: Vec<(String, Chunk)>,
}

impl MergedParts {
    pub fn get(&self, key: &str) -> Option<&Chunk> {
        self.parts.iter().find(|(k, _)| k == key).map(|(_, c)| c)
    }
}

/// Waits until every input key has a chunk queued, then publishes one
/// [`MergedParts`] chunk on all outbound keys.
///
/// Inputs arrive in any interleaving; each key is queued separately so nothing
/// is dropped. The merged chunk carries the strongest continuity of its parts.
pub struct Merge {
    keys: StageKeys,
    queues: Vec<VecDeque<Chunk>>,
    sequence: u64,
}

impl Merge {
    /// Options: `inputs` (two or more keys) and `outputs`.
    pub fn build(options: &Options) -> Result<Box<dyn Stage>> {
        let inputs = options.require_string_list("inputs")?;
        let outputs = options.require_string_list("outputs")?;
        if inputs.len() < 2 {
            return Err(StreamboardError::ConfigInvalidValue {
                key: "inputs".to_string(),
                message: format!("a merge needs at least two input keys, got {}", inputs.len()),
            });
        }
        let queues = vec![VecDeque::new(); inputs.len()];
        Ok(Box::new(Self {
            keys: StageKeys::new(inputs, outputs),
            queues,
            sequence: 0,
        }))
    }
}

impl Stage for Merge {
    fn keys(&self) -> StageKeys {
        self.keys.clone()
    }

    fn process(
        &mut self,
        key: &str,
        chunk: Chunk,
        outbox: &mut Outbox,
    ) -> std::result::Result<(), StageError> {
        let Some(slot) = self.keys.inbound.iter().position(|k| k == key) else {
            return Err(StageError::Recoverable(format!(
                "chunk on unexpected key '{}'",
                key
            )));
        };
        self.queues[slot].push_back(chunk);

        while self.queues.iter().all(|q| !q.is_empty()) {
            let mut continuity = Continuity::WithPrevious;
            let mut parts = Vec::with_capacity(self.queues.len());
            for (key, queue) in self.keys.inbound.iter().zip(self.queues.iter_mut()) {
                if let Some(part) = queue.pop_front() {
                    continuity = continuity.combine(part.continuity());
                    parts.push((key.clone(), part));
                }
            }
            let segment = parts.iter().find_map(|(_, c)| c.segment().map(String::from));

            let mut merged = Chunk::new(MergedParts { parts }, continuity, self.sequence);
            if let Some(segment) = segment {
                merged = merged.with_segment(segment);
            }
            self.sequence += 1;

            for out in &self.keys.outbound {
                outbox.publish(out.clone(), merged.clone());
            }
        }
        Ok(())
    }
}
