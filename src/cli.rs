//! Command-line interface for streamboard
//!
//! Provides argument parsing using clap derive macros.

use crate::app::RunPlan;
use crate::config::Config;
use crate::stages::Segment;
use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use std::time::Duration;

/// Threaded dataflow boards with continuity-aware shutdown
#[derive(Parser, Debug)]
#[command(
    name = "streamboard",
    version,
    about = "Threaded dataflow boards with continuity-aware shutdown"
)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose output (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Print the run report as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Grace interval between the terminal marker and stop. Examples: 500ms, 2s
    #[arg(long, global = true, value_name = "DURATION", value_parser = parse_duration)]
    pub grace: Option<Duration>,

    /// Bounded wait of one probe poll. Examples: 250ms, 1s
    #[arg(long, global = true, value_name = "DURATION", value_parser = parse_duration)]
    pub poll_interval: Option<Duration>,

    /// Down sampling factor (1 disables the resampler)
    #[arg(long, global = true, value_name = "N")]
    pub decimation: Option<u32>,

    /// Input sampling rate in Hz
    #[arg(long, global = true, value_name = "HZ")]
    pub input_rate: Option<u32>,
}

/// Parse a duration string.
///
/// Supports any duration format accepted by `humantime`: bare numbers (seconds),
/// single-unit (`500ms`, `30s`, `5m`), and compound (`1m30s`).
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    // Bare number → seconds
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run calibration: one chunk of noise through the structure extractor
    Calibrate,

    /// Run a file batch over synthetic input segments
    Files(FilesArgs),

    /// Run a paced live source through the loopback network (Ctrl+C to stop)
    Live {
        /// End the run after this many chunks
        #[arg(long, value_name = "N")]
        max_chunks: Option<u64>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

/// Input segments of a file batch run
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct FilesArgs {
    /// Input segment as NAME=CHUNKS (repeatable)
    #[arg(long = "segment", value_name = "NAME=CHUNKS", value_parser = Segment::parse)]
    pub segments: Vec<Segment>,

    /// Number of generated segments when no --segment is given
    #[arg(long = "segments", value_name = "N", default_value = "2")]
    pub count: u32,

    /// Chunks per generated segment
    #[arg(long, value_name = "M", default_value = "10")]
    pub chunks: u64,
}

impl FilesArgs {
    /// Explicit segments, or `count` generated ones named `segment-NN.wav`.
    pub fn resolve(&self) -> Vec<Segment> {
        if !self.segments.is_empty() {
            return self.segments.clone();
        }
        (1..=self.count)
            .map(|i| Segment {
                name: format!("segment-{:02}.wav", i),
                chunks: self.chunks,
            })
            .collect()
    }
}

/// Configuration management actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the default configuration file path
    Path,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

impl Commands {
    /// The run this command asks for, if it is a run command.
    pub fn plan(&self) -> Option<RunPlan> {
        match self {
            Commands::Calibrate => Some(RunPlan::Calibration),
            Commands::Files(args) => Some(RunPlan::Files {
                segments: args.resolve(),
            }),
            Commands::Live { max_chunks } => Some(RunPlan::Live {
                max_chunks: *max_chunks,
            }),
            Commands::Config { .. } | Commands::Completions { .. } => None,
        }
    }
}

impl Cli {
    /// Applies the processing overrides given on the command line.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(decimation) = self.decimation {
            config.processing.decimation = decimation;
        }
        if let Some(rate) = self.input_rate {
            config.processing.input_rate = rate;
        }
    }

    /// Log filter directive derived from `-q` / `-v`.
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            return "warn";
        }
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_calibrate() {
        let cli = Cli::try_parse_from(["streamboard", "calibrate"]).unwrap();
        assert!(matches!(cli.command, Commands::Calibrate));
        assert_eq!(cli.command.plan(), Some(RunPlan::Calibration));
        assert!(!cli.json);
        assert!(cli.grace.is_none());
    }

    #[test]
    fn test_command_is_required() {
        assert!(Cli::try_parse_from(["streamboard"]).is_err());
    }

    #[test]
    fn test_parse_verbose_levels() {
        let cli = Cli::try_parse_from(["streamboard", "-v", "calibrate"]).unwrap();
        assert_eq!(cli.log_level(), "debug");
        let cli = Cli::try_parse_from(["streamboard", "-vv", "calibrate"]).unwrap();
        assert_eq!(cli.log_level(), "trace");
        let cli = Cli::try_parse_from(["streamboard", "calibrate", "--quiet"]).unwrap();
        assert_eq!(cli.log_level(), "warn");
    }

    #[test]
    fn test_parse_explicit_segments() {
        let cli = Cli::try_parse_from([
            "streamboard",
            "files",
            "--segment",
            "a.wav=3",
            "--segment",
            "b.wav=1",
        ])
        .unwrap();

        let Some(RunPlan::Files { segments }) = cli.command.plan() else {
            panic!("Expected Files plan");
        };
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].name, "a.wav");
        assert_eq!(segments[1].chunks, 1);
    }

    #[test]
    fn test_parse_generated_segments() {
        let cli =
            Cli::try_parse_from(["streamboard", "files", "--segments", "3", "--chunks", "4"])
                .unwrap();
        let Some(RunPlan::Files { segments }) = cli.command.plan() else {
            panic!("Expected Files plan");
        };
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[2].name, "segment-03.wav");
        assert!(segments.iter().all(|s| s.chunks == 4));
    }

    #[test]
    fn test_invalid_segment_rejected() {
        assert!(Cli::try_parse_from(["streamboard", "files", "--segment", "a.wav"]).is_err());
    }

    #[test]
    fn test_parse_live_with_limit() {
        let cli = Cli::try_parse_from(["streamboard", "live", "--max-chunks", "5"]).unwrap();
        assert_eq!(
            cli.command.plan(),
            Some(RunPlan::Live {
                max_chunks: Some(5)
            })
        );
    }

    #[test]
    fn test_parse_durations() {
        let cli = Cli::try_parse_from([
            "streamboard",
            "calibrate",
            "--grace",
            "500ms",
            "--poll-interval",
            "1",
        ])
        .unwrap();
        assert_eq!(cli.grace, Some(Duration::from_millis(500)));
        assert_eq!(cli.poll_interval, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_invalid_duration_rejected() {
        assert!(
            Cli::try_parse_from(["streamboard", "calibrate", "--grace", "soon"]).is_err()
        );
    }

    #[test]
    fn test_overrides_applied_to_config() {
        let cli = Cli::try_parse_from([
            "streamboard",
            "--decimation",
            "1",
            "--input-rate",
            "16000",
            "calibrate",
        ])
        .unwrap();
        let mut config = Config::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.processing.decimation, 1);
        assert_eq!(config.processing.input_rate, 16000);
    }

    #[test]
    fn test_parse_config_actions() {
        let cli = Cli::try_parse_from(["streamboard", "config", "init", "--force"]).unwrap();
        match cli.command {
            Commands::Config {
                action: ConfigAction::Init { force },
            } => assert!(force),
            _ => panic!("Expected Config Init command"),
        }
        assert!(cli.command.plan().is_none());
    }

    #[test]
    fn test_parse_completions() {
        let cli = Cli::try_parse_from(["streamboard", "completions", "bash"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Completions { shell: Shell::Bash }
        ));
    }

    #[test]
    fn test_parse_global_config() {
        let cli = Cli::try_parse_from([
            "streamboard",
            "--config",
            "/path/to/config.toml",
            "calibrate",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/path/to/config.toml")));
    }
}
