use crate::board::{BoardConfig, Endpoint, RisePolicy};
use crate::continuity::RunMode;
use crate::defaults;
use crate::error::{Result, StreamboardError};
use crate::options::Options;
use crate::supervisor::SupervisorConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub board: BoardSettings,
    pub supervisor: SupervisorSettings,
    pub network: NetworkSettings,
    pub processing: ProcessingSettings,
}

/// Edge and stop settings shared by every board
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BoardSettings {
    pub edge_buffer: usize,
    pub stop_timeout_ms: u64,
}

/// Termination supervisor timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SupervisorSettings {
    pub poll_interval_ms: u64,
    pub calibration_grace_ms: u64,
    pub batch_grace_ms: u64,
    pub live_grace_ms: u64,
    pub abort_delay_ms: u64,
}

/// Network edge settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkSettings {
    pub interface: String,
    pub port: u16,
    pub rise_attempts: u32,
    pub rise_backoff_ms: u64,
}

/// Options handed to every stage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcessingSettings {
    /// Sampling rate of the input stage (Hz)
    pub input_rate: u32,
    /// Down sampling factor; 1 skips the resampler
    pub decimation: u32,
    pub samples_per_frame: u32,
    pub no_of_scales: u32,
    /// Chunks per second published by live input
    pub frequency: u32,
    /// Samples per chunk; derived from `input_rate / frequency` when absent
    pub chunk_size: Option<u32>,
    /// Publication interval of file input
    pub timestep_ms: u64,
    pub ptn_split: Vec<u32>,
    pub ptn_block_width: f64,
    /// Where run reports are written
    pub outdir: Option<PathBuf>,
}

impl Default for BoardSettings {
    fn default() -> Self {
        Self {
            edge_buffer: defaults::EDGE_BUFFER,
            stop_timeout_ms: defaults::STOP_TIMEOUT_MS,
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::POLL_INTERVAL_MS,
            calibration_grace_ms: defaults::CALIBRATION_GRACE_MS,
            batch_grace_ms: defaults::BATCH_GRACE_MS,
            live_grace_ms: defaults::LIVE_GRACE_MS,
            abort_delay_ms: defaults::ABORT_DELAY_MS,
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            interface: defaults::NETWORK_INTERFACE.to_string(),
            port: defaults::NETWORK_PORT,
            rise_attempts: defaults::RISE_ATTEMPTS,
            rise_backoff_ms: defaults::RISE_BACKOFF_MS,
        }
    }
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            input_rate: defaults::INPUT_RATE,
            decimation: defaults::DECIMATION,
            samples_per_frame: defaults::SAMPLES_PER_FRAME,
            no_of_scales: defaults::NO_OF_SCALES,
            frequency: defaults::FREQUENCY,
            chunk_size: None,
            timestep_ms: defaults::TIMESTEP_MS,
            ptn_split: defaults::PTN_SPLIT.to_vec(),
            ptn_block_width: defaults::PTN_BLOCK_WIDTH,
            outdir: None,
        }
    }
}

impl SupervisorSettings {
    /// Supervisor timing for a run mode.
    pub fn for_mode(&self, mode: RunMode) -> SupervisorConfig {
        let grace_ms = match mode {
            RunMode::Calibration => self.calibration_grace_ms,
            RunMode::Files => self.batch_grace_ms,
            RunMode::Live => self.live_grace_ms,
        };
        SupervisorConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            grace: Duration::from_millis(grace_ms),
            abort_delay: Duration::from_millis(self.abort_delay_ms),
        }
    }
}

impl NetworkSettings {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.interface.clone(), self.port)
    }

    pub fn rise_policy(&self) -> RisePolicy {
        RisePolicy {
            attempts: self.rise_attempts,
            backoff: Duration::from_millis(self.rise_backoff_ms),
        }
    }
}

impl ProcessingSettings {
    /// Rate after the resampler (`input_rate / decimation`).
    pub fn internal_rate(&self) -> f64 {
        f64::from(self.input_rate) / f64::from(self.decimation.max(1))
    }

    /// Rate of the time-frequency frames (`internal_rate / samples_per_frame`).
    pub fn frame_rate(&self) -> f64 {
        self.internal_rate() / f64::from(self.samples_per_frame.max(1))
    }

    /// Samples per chunk, explicit or `input_rate / frequency`.
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
            .unwrap_or_else(|| self.input_rate / self.frequency.max(1))
    }

    /// Samples in the single calibration chunk, explicit or `CALIBRATION_SECONDS`
    /// of input. `None` if that does not fit a `u32`.
    pub fn calibration_chunk_size(&self) -> Option<u32> {
        match self.chunk_size {
            Some(size) => Some(size),
            None => self.input_rate.checked_mul(defaults::CALIBRATION_SECONDS),
        }
    }
}

fn invalid(key: &str, message: &str) -> StreamboardError {
    StreamboardError::ConfigInvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only returns defaults if the file is missing.
    /// Returns errors for invalid TOML.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(StreamboardError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Self::default())
            }
            Err(e) => Err(StreamboardError::ConfigParse {
                message: format!("{}: {}", path.display(), e),
            }),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - STREAMBOARD_OUTDIR → processing.outdir
    /// - STREAMBOARD_INPUT_RATE → processing.input_rate
    /// - STREAMBOARD_DECIMATION → processing.decimation
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(outdir) = std::env::var("STREAMBOARD_OUTDIR")
            && !outdir.is_empty()
        {
            self.processing.outdir = Some(PathBuf::from(outdir));
        }

        if let Ok(rate) = std::env::var("STREAMBOARD_INPUT_RATE")
            && !rate.is_empty()
        {
            match rate.parse() {
                Ok(rate) => self.processing.input_rate = rate,
                Err(_) => warn!(value = %rate, "ignoring invalid STREAMBOARD_INPUT_RATE"),
            }
        }

        if let Ok(decimation) = std::env::var("STREAMBOARD_DECIMATION")
            && !decimation.is_empty()
        {
            match decimation.parse() {
                Ok(decimation) => self.processing.decimation = decimation,
                Err(_) => warn!(value = %decimation, "ignoring invalid STREAMBOARD_DECIMATION"),
            }
        }

        self
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/streamboard/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("streamboard")
            .join("config.toml")
    }

    /// Rejects values no run can work with.
    pub fn validate(&self) -> Result<()> {
        if self.board.edge_buffer == 0 {
            return Err(invalid("board.edge_buffer", "must be at least 1"));
        }
        if self.supervisor.poll_interval_ms == 0 {
            return Err(invalid("supervisor.poll_interval_ms", "must be at least 1"));
        }
        if self.network.rise_attempts == 0 {
            return Err(invalid("network.rise_attempts", "must be at least 1"));
        }

        let p = &self.processing;
        for (key, value) in [
            ("processing.input_rate", p.input_rate),
            ("processing.decimation", p.decimation),
            ("processing.samples_per_frame", p.samples_per_frame),
            ("processing.no_of_scales", p.no_of_scales),
            ("processing.frequency", p.frequency),
        ] {
            if value == 0 {
                return Err(invalid(key, "must be at least 1"));
            }
        }
        if p.chunk_size() == 0 {
            return Err(invalid("processing.chunk_size", "must be at least 1"));
        }
        if p.calibration_chunk_size().is_none() {
            return Err(invalid(
                "processing.input_rate",
                "too large for a calibration chunk",
            ));
        }
        if i64::try_from(p.timestep_ms).is_err() {
            return Err(invalid("processing.timestep_ms", "out of range"));
        }
        if p.ptn_block_width.is_nan() || p.ptn_block_width <= 0.0 {
            return Err(invalid("processing.ptn_block_width", "must be positive"));
        }
        if !p.ptn_split.windows(2).all(|w| w[0] < w[1]) {
            return Err(invalid("processing.ptn_split", "must be strictly increasing"));
        }
        if p.ptn_split.last().is_some_and(|&last| last >= p.no_of_scales) {
            return Err(invalid(
                "processing.ptn_split",
                "boundaries must lie below no_of_scales",
            ));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| StreamboardError::Other(e.to_string()))
    }

    /// Runtime settings for boards built from this config.
    pub fn board_config(&self) -> BoardConfig {
        BoardConfig {
            edge_buffer: self.board.edge_buffer,
            stop_timeout: Duration::from_millis(self.board.stop_timeout_ms),
            rise: self.network.rise_policy(),
        }
    }

    /// Flat options every stage receives, derived values included.
    pub fn base_options(&self) -> Options {
        let p = &self.processing;
        let split: Vec<i64> = p.ptn_split.iter().map(|&s| i64::from(s)).collect();
        Options::new()
            .with("input_rate", i64::from(p.input_rate))
            .with("decimation", i64::from(p.decimation))
            .with("samples_per_frame", i64::from(p.samples_per_frame))
            .with("no_of_scales", i64::from(p.no_of_scales))
            .with("internal_rate", p.internal_rate())
            .with("frame_rate", p.frame_rate())
            .with("frequency", i64::from(p.frequency))
            .with("chunk_size", i64::from(p.chunk_size()))
            .with("timestep_ms", i64::try_from(p.timestep_ms).unwrap_or(i64::MAX))
            .with("ptn_split", split)
            .with("ptn_block_width", p.ptn_block_width)
    }
}
