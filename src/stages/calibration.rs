//! Calibration cache: records what the calibration pass saw and announces it.

use crate::board::{Capability, Chunk, Outbox, Stage, StageError, StageKeys};
use crate::continuity::Continuity;
use crate::defaults;
use crate::error::Result;
use crate::options::Options;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

pub const TSREP_KEY: &str = "TSRep";
pub const CACHE_CREATED_KEY: &str = "cacheCreated";

/// What one calibration pass recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    /// Chunks consumed, the calibration chunk included.
    pub chunks: u64,
    /// Samples across those chunks (only `Vec<f32>` payloads count).
    pub samples: u64,
}

/// Shared, in-memory calibration caches keyed by cache name.
#[derive(Debug, Clone, Default)]
pub struct CacheStore {
    entries: Arc<Mutex<BTreeMap<String, CacheEntry>>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<CacheEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn insert(&self, name: &str, entry: CacheEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), entry);
    }
}

/// Consumes `TSRep` until the `calibrationChunk`, then stores a [`CacheEntry`]
/// and publishes one `cacheCreated` chunk carrying the same marker.
pub struct CalibrationCache {
    name: String,
    store: CacheStore,
    entry: CacheEntry,
    created: bool,
}

impl CalibrationCache {
    /// Capability writing into `store`. Options: `cachename`.
    pub fn capability(store: CacheStore) -> impl Capability {
        move |options: &Options| -> Result<Box<dyn Stage>> {
            let name = options
                .str("cachename")?
                .unwrap_or(defaults::CALIBRATION_CACHE_NAME)
                .to_string();
            Ok(Box::new(CalibrationCache {
                name,
                store: store.clone(),
                entry: CacheEntry::default(),
                created: false,
            }))
        }
    }
}

impl Stage for CalibrationCache {
    fn keys(&self) -> StageKeys {
        StageKeys::new([TSREP_KEY], [CACHE_CREATED_KEY])
    }

    fn process(
        &mut self,
        _key: &str,
        chunk: Chunk,
        outbox: &mut Outbox,
    ) -> std::result::Result<(), StageError> {
        if self.created {
            return Ok(());
        }

        self.entry.chunks += 1;
        if let Some(samples) = chunk.payload_as::<Vec<f32>>() {
            self.entry.samples += samples.len() as u64;
        }

        if chunk.continuity() == Continuity::CalibrationChunk {
            self.store.insert(&self.name, self.entry.clone());
            self.created = true;
            info!(
                cache = %self.name,
                chunks = self.entry.chunks,
                samples = self.entry.samples,
                "calibration cache created"
            );
            outbox.publish(
                CACHE_CREATED_KEY,
                Chunk::new(self.name.clone(), Continuity::CalibrationChunk, chunk.sequence()),
            );
        }
        Ok(())
    }
}
