//! Pass-through stage standing in for a single-input processor.

use crate::board::{Chunk, Outbox, Stage, StageError, StageKeys};
use crate::error::{Result, StreamboardError};
use crate::options::Options;
use tracing::trace;

/// Republishes every inbound chunk on all of its outbound keys.
pub struct Relay {
    keys: StageKeys,
}

impl Relay {
    /// Options: `inputs` and `outputs` (lists of keys).
    pub fn build(options: &Options) -> Result<Box<dyn Stage>> {
        let inputs = options.require_string_list("inputs")?;
        let outputs = options.require_string_list("outputs")?;
        if inputs.is_empty() {
            return Err(StreamboardError::ConfigInvalidValue {
                key: "inputs".to_string(),
                message: "a relay needs at least one input key".to_string(),
            });
        }
        Ok(Box::new(Self {
            keys: StageKeys::new(inputs, outputs),
        }))
    }
}

impl Stage for Relay {
    fn keys(&self) -> StageKeys {
        self.keys.clone()
    }

    fn process(
        &mut self,
        key: &str,
        chunk: Chunk,
        outbox: &mut Outbox,
    ) -> std::result::Result<(), StageError> {
        trace!(key, continuity = %chunk.continuity(), seq = chunk.sequence(), "relay");

        for out in &self.keys.outbound {
            outbox.publish(out.clone(), chunk.clone());
        }
        Ok(())
    }
}
