//! Source stages: segmented batch input, calibration noise, and a paced live feed.
//!
//! Payloads are `Vec<f32>` sample blocks. Sources tag chunks so that every
//! logical stream ends with exactly one terminal marker.

use crate::board::{Chunk, Outbox, SourceStatus, Stage, StageError, StageKeys};
use crate::continuity::Continuity;
use crate::error::{Result, StreamboardError};
use crate::options::Options;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;

/// Outbound key of every source.
pub const SOUND_KEY: &str = "sound";

const DEFAULT_CHUNK_SIZE: u32 = 1024;

fn chunk_size(options: &Options) -> Result<usize> {
    let size = options.u32("chunk_size")?.unwrap_or(DEFAULT_CHUNK_SIZE);
    if size == 0 {
        return Err(StreamboardError::ConfigInvalidValue {
            key: "chunk_size".to_string(),
            message: "must be at least 1".to_string(),
        });
    }
    Ok(size as usize)
}

/// One named input segment (a source file in batch runs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub name: String,
    pub chunks: u64,
}

impl Segment {
    /// Parses `NAME=CHUNKS`.
    pub fn parse(spec: &str) -> std::result::Result<Self, String> {
        let (name, chunks) = spec
            .rsplit_once('=')
            .ok_or_else(|| format!("expected NAME=CHUNKS, got '{}'", spec))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(format!("empty segment name in '{}'", spec));
        }
        let chunks = chunks
            .trim()
            .parse::<u64>()
            .map_err(|e| format!("invalid chunk count in '{}': {}", spec, e))?;
        Ok(Self {
            name: name.to_string(),
            chunks,
        })
    }
}

/// Publishes a finite list of segments, chunk by chunk.
///
/// The first chunk of each segment carries the new-file continuity, interior
/// chunks `withprevious`, and the very last chunk `last`.
pub struct SegmentSource {
    segments: Vec<(Arc<str>, u64)>,
    chunk_size: usize,
    timestep: Duration,
    new_file: Continuity,
    segment: usize,
    offset: u64,
    sequence: u64,
}

impl SegmentSource {
    /// Options: `segments` (list of `NAME=CHUNKS`), `chunk_size`, `timestep_ms`,
    /// `new_file_continuity`.
    pub fn build(options: &Options) -> Result<Box<dyn Stage>> {
        let segments = options
            .require_string_list("segments")?
            .iter()
            .map(|spec| {
                Segment::parse(spec).map_err(|message| StreamboardError::ConfigInvalidValue {
                    key: "segments".to_string(),
                    message,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let segments: Vec<(Arc<str>, u64)> = segments
            .into_iter()
            .filter(|s| s.chunks > 0)
            .map(|s| (Arc::from(s.name), s.chunks))
            .collect();
        if segments.is_empty() {
            return Err(StreamboardError::ConfigInvalidValue {
                key: "segments".to_string(),
                message: "nothing to publish".to_string(),
            });
        }

        let new_file = match options.str("new_file_continuity")? {
            Some(name) => name
                .parse::<Continuity>()
                .map_err(|message| StreamboardError::ConfigInvalidValue {
                    key: "new_file_continuity".to_string(),
                    message,
                })?,
            None => Continuity::NewFile,
        };
        if !new_file.resets_history() {
            return Err(StreamboardError::ConfigInvalidValue {
                key: "new_file_continuity".to_string(),
                message: format!("'{}' does not start a segment", new_file),
            });
        }

        Ok(Box::new(Self {
            segments,
            chunk_size: chunk_size(options)?,
            timestep: Duration::from_millis(options.u64("timestep_ms")?.unwrap_or(0)),
            new_file,
            segment: 0,
            offset: 0,
            sequence: 0,
        }))
    }
}

impl Stage for SegmentSource {
    fn keys(&self) -> StageKeys {
        StageKeys::source([SOUND_KEY])
    }

    fn generate(&mut self, outbox: &mut Outbox) -> std::result::Result<SourceStatus, StageError> {
        let Some((name, count)) = self.segments.get(self.segment).cloned() else {
            return Ok(SourceStatus::Exhausted);
        };

        let final_segment = self.segment + 1 == self.segments.len();
        let continuity = if final_segment && self.offset + 1 == count {
            Continuity::Last
        } else if self.offset == 0 {
            self.new_file
        } else {
            Continuity::WithPrevious
        };

        let samples = vec![0.0_f32; self.chunk_size];
        outbox.publish(
            SOUND_KEY,
            Chunk::new(samples, continuity, self.sequence).with_segment(name),
        );
        self.sequence += 1;
        self.offset += 1;
        if self.offset == count {
            self.segment += 1;
            self.offset = 0;
        }

        if self.segment == self.segments.len() {
            Ok(SourceStatus::Exhausted)
        } else if self.timestep.is_zero() {
            Ok(SourceStatus::Continue)
        } else {
            Ok(SourceStatus::WaitFor(self.timestep))
        }
    }
}

/// White-noise generator.
///
/// With `calibration = true` it publishes a single chunk tagged
/// `calibrationChunk`, whatever `noofchunks` says.
pub struct NoiseSource {
    rng: StdRng,
    chunk_size: usize,
    remaining: u64,
    total: u64,
    calibration: bool,
}

impl NoiseSource {
    /// Options: `chunk_size`, `noofchunks` (default 1), `calibration`, `seed`.
    pub fn build(options: &Options) -> Result<Box<dyn Stage>> {
        let calibration = options.bool("calibration")?.unwrap_or(false);
        let chunks = if calibration {
            1
        } else {
            options.u64("noofchunks")?.unwrap_or(1)
        };
        let rng = match options.u64("seed")? {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Box::new(Self {
            rng,
            chunk_size: chunk_size(options)?,
            remaining: chunks,
            total: chunks,
            calibration,
        }))
    }
}

impl Stage for NoiseSource {
    fn keys(&self) -> StageKeys {
        StageKeys::source([SOUND_KEY])
    }

    fn generate(&mut self, outbox: &mut Outbox) -> std::result::Result<SourceStatus, StageError> {
        if self.remaining == 0 {
            return Ok(SourceStatus::Exhausted);
        }
        let sequence = self.total - self.remaining;
        self.remaining -= 1;

        let continuity = if self.calibration {
            Continuity::CalibrationChunk
        } else if self.remaining == 0 {
            Continuity::Last
        } else if sequence == 0 {
            Continuity::NewFile
        } else {
            Continuity::WithPrevious
        };

        let samples: Vec<f32> = (0..self.chunk_size)
            .map(|_| self.rng.gen_range(-1.0..1.0))
            .collect();
        outbox.publish(SOUND_KEY, Chunk::new(samples, continuity, sequence));

        if self.remaining == 0 {
            Ok(SourceStatus::Exhausted)
        } else {
            Ok(SourceStatus::Continue)
        }
    }
}

/// Paced source standing in for a microphone.
///
/// Publishes `frequency` chunks per second until stopped, or until
/// `max_chunks` have gone out (the last one tagged `last`).
pub struct LiveSource {
    rng: StdRng,
    chunk_size: usize,
    period: Duration,
    max_chunks: Option<u64>,
    sequence: u64,
}

impl LiveSource {
    /// Options: `frequency` (Hz), `chunk_size`, `max_chunks`.
    pub fn build(options: &Options) -> Result<Box<dyn Stage>> {
        let frequency = options.f64("frequency")?.unwrap_or(2.0);
        if !(frequency > 0.0 && frequency.is_finite()) {
            return Err(StreamboardError::ConfigInvalidValue {
                key: "frequency".to_string(),
                message: format!("must be a positive number, got {}", frequency),
            });
        }

        Ok(Box::new(Self {
            rng: StdRng::from_entropy(),
            chunk_size: chunk_size(options)?,
            period: Duration::from_secs_f64(1.0 / frequency),
            max_chunks: options.u64("max_chunks")?.filter(|&n| n > 0),
            sequence: 0,
        }))
    }
}

impl Stage for LiveSource {
    fn keys(&self) -> StageKeys {
        StageKeys::source([SOUND_KEY])
    }

    fn generate(&mut self, outbox: &mut Outbox) -> std::result::Result<SourceStatus, StageError> {
        let last = self.max_chunks.is_some_and(|max| self.sequence + 1 >= max);
        let continuity = if last {
            Continuity::Last
        } else if self.sequence == 0 {
            Continuity::NewFile
        } else {
            Continuity::WithPrevious
        };

        let samples: Vec<f32> = (0..self.chunk_size)
            .map(|_| self.rng.gen_range(-0.1..0.1))
            .collect();
        outbox.publish(SOUND_KEY, Chunk::new(samples, continuity, self.sequence));
        self.sequence += 1;

        if last {
            Ok(SourceStatus::Exhausted)
        } else {
            Ok(SourceStatus::WaitFor(self.period))
        }
    }
}
