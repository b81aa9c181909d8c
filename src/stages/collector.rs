//! Sink stage recording what reached the end of the board.

use crate::board::{Capability, Chunk, Outbox, Stage, StageError, StageKeys};
use crate::continuity::Continuity;
use crate::error::{Result, StreamboardError};
use crate::options::Options;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

/// One chunk as seen by a collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    pub stage: String,
    pub key: String,
    pub continuity: Continuity,
    pub sequence: u64,
    pub segment: Option<String>,
}

/// Shared log of everything collected, across all collector stages of a run.
#[derive(Debug, Clone, Default)]
pub struct CollectorLog {
    records: Arc<Mutex<Vec<Record>>>,
}

impl CollectorLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, record: Record) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    /// Snapshot of all records in arrival order.
    pub fn records(&self) -> Vec<Record> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records that arrived on `stage.key`, in arrival order.
    pub fn for_key(&self, stage: &str, key: &str) -> Vec<Record> {
        self.records()
            .into_iter()
            .filter(|r| r.stage == stage && r.key == key)
            .collect()
    }

    /// Chunk count per `stage.key`.
    pub fn counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for record in self.records() {
            *counts
                .entry(format!("{}.{}", record.stage, record.key))
                .or_default() += 1;
        }
        counts
    }
}

/// Records every inbound chunk into a [`CollectorLog`].
pub struct Collector {
    stage: String,
    inputs: Vec<String>,
    log: CollectorLog,
}

impl Collector {
    /// Capability appending to `log`. Options: `inputs`, and `name` (label
    /// used in records, defaults to `collector`).
    pub fn capability(log: CollectorLog) -> impl Capability {
        move |options: &Options| -> Result<Box<dyn Stage>> {
            let inputs = options.require_string_list("inputs")?;
            if inputs.is_empty() {
                return Err(StreamboardError::ConfigInvalidValue {
                    key: "inputs".to_string(),
                    message: "a collector needs at least one input key".to_string(),
                });
            }
            let stage = options.str("name")?.unwrap_or("collector").to_string();
            Ok(Box::new(Collector {
                stage,
                inputs,
                log: log.clone(),
            }))
        }
    }
}

impl Stage for Collector {
    fn keys(&self) -> StageKeys {
        StageKeys::sink(self.inputs.clone())
    }

    fn process(
        &mut self,
        key: &str,
        chunk: Chunk,
        _outbox: &mut Outbox,
    ) -> std::result::Result<(), StageError> {
        self.log.push(Record {
            stage: self.stage.clone(),
            key: key.to_string(),
            continuity: chunk.continuity(),
            sequence: chunk.sequence(),
            segment: chunk.segment().map(String::from),
        });
        Ok(())
    }
}
