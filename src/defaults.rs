//! Default configuration constants for streamboard.
//!
//! Shared by the config types, the CLI and the run modes so the same numbers
//! are not repeated in several places.

/// Default timeout of one supervisor poll on the probe edge, in milliseconds.
pub const POLL_INTERVAL_MS: u64 = 250;

/// Grace interval after the terminal marker of a calibration run.
///
/// Nothing is expected downstream of the calibration cache, so this is short.
pub const CALIBRATION_GRACE_MS: u64 = 1_000;

/// Grace interval after the terminal marker of a file batch run.
///
/// Lets buffered chunks finish propagating through multi-stage fan-out.
pub const BATCH_GRACE_MS: u64 = 10_000;

/// Grace interval after the terminal marker of a live run.
pub const LIVE_GRACE_MS: u64 = 10_000;

/// Delay granted to stages to exit after an operator abort.
pub const ABORT_DELAY_MS: u64 = 1_000;

/// How long `stop_all` waits for stage threads before detaching them.
pub const STOP_TIMEOUT_MS: u64 = 1_000;

/// Capacity of a local edge channel, in chunks.
pub const EDGE_BUFFER: usize = 64;

/// Interface used for network edges when none is configured.
pub const NETWORK_INTERFACE: &str = "127.0.0.1";

/// Port used for network edges when none is configured.
pub const NETWORK_PORT: u16 = 5555;

/// Attempts made to rise a network edge before the stage gives up.
pub const RISE_ATTEMPTS: u32 = 5;

/// Pause between two rise attempts, in milliseconds.
pub const RISE_BACKOFF_MS: u64 = 200;

/// Sampling rate (Hz) delivered by the input stage.
pub const INPUT_RATE: u32 = 44_100;

/// Integer down sampling factor applied by the resampler.
pub const DECIMATION: u32 = 5;

/// Samples per frame left over after down sampling.
pub const SAMPLES_PER_FRAME: u32 = 50;

/// Number of scales in the time-frequency representation.
pub const NO_OF_SCALES: u32 = 133;

/// Publishing frequency of live input, in Hz.
pub const FREQUENCY: u32 = 2;

/// Publication interval of file input, in milliseconds.
pub const TIMESTEP_MS: u64 = 80;

/// Block width (seconds) used by the fan-in feature stage.
pub const PTN_BLOCK_WIDTH: f64 = 0.01;

/// Scale boundaries at which the fan-in feature stage splits its bands.
pub const PTN_SPLIT: [u32; 23] = [
    10, 15, 20, 25, 30, 35, 40, 45, 50, 55, 60, 65, 70, 75, 80, 85, 90, 95, 100, 105, 110, 115,
    120,
];

/// Calibration noise lasts this many seconds of input.
pub const CALIBRATION_SECONDS: u32 = 11;

/// Name of the cached calibration parameters.
pub const CALIBRATION_CACHE_NAME: &str = "structure_extractor_cache";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calibration_grace_is_shorter_than_batch_grace() {
        assert!(CALIBRATION_GRACE_MS < BATCH_GRACE_MS);
    }

    #[test]
    fn ptn_split_is_strictly_increasing() {
        assert!(PTN_SPLIT.windows(2).all(|w| w[0] < w[1]));
        assert!(*PTN_SPLIT.last().unwrap_or(&0) < NO_OF_SCALES);
    }
}
