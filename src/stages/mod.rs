//! Reference stage capabilities.
//!
//! Synthetic stand-ins for the processing library: they move chunks and keep
//! continuity markers intact, without doing any signal processing.

pub mod calibration;
pub mod collector;
pub mod merge;
pub mod relay;
pub mod source;

pub use calibration::{CACHE_CREATED_KEY, CacheEntry, CacheStore, CalibrationCache, TSREP_KEY};
pub use collector::{Collector, CollectorLog, Record};
pub use merge::{Merge, MergedParts};
pub use relay::Relay;
pub use source::{LiveSource, NoiseSource, SOUND_KEY, Segment, SegmentSource};
