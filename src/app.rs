//! Run modes.
//!
//! Assembles the calibration, file batch and live boards from a [`Config`],
//! starts them and hands them to the [`Supervisor`]:
//!
//! ```text
//! source → [resampler] → tf_processor ─EdB─▶ structure_extractor(s) ─▶ ptne ─▶ filewriters
//!                              └─ technicalkey (probed)
//! ```

use crate::board::{Board, LoopbackNetwork, Probe, Transport};
use crate::config::Config;
use crate::continuity::RunMode;
use crate::defaults;
use crate::error::{Result, StreamboardError};
use crate::options::Options;
use crate::stages::{
    CACHE_CREATED_KEY, CacheEntry, CacheStore, CalibrationCache, Collector, CollectorLog,
    LiveSource, Merge, NoiseSource, Relay, SOUND_KEY, Segment, SegmentSource, TSREP_KEY,
};
use crate::supervisor::{AbortSignal, Supervisor, SupervisorConfig, SupervisorReport};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const TIMESERIES_KEY: &str = "timeseries";
const TECHNICAL_KEY: &str = "technicalkey";
const TF_OUTPUTS: [&str; 3] = ["E", "EdB", TECHNICAL_KEY];
const PTNE_OUTPUTS: [&str; 4] = ["energy", "pulse", "noise", "tone"];

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunPlan {
    /// One calibration chunk of noise through the structure extractor.
    Calibration,
    /// A finite list of input segments.
    Files { segments: Vec<Segment> },
    /// A paced source on its own board, published through the network.
    /// Runs until aborted unless `max_chunks` is set.
    Live { max_chunks: Option<u64> },
}

impl RunPlan {
    pub fn mode(&self) -> RunMode {
        match self {
            RunPlan::Calibration => RunMode::Calibration,
            RunPlan::Files { .. } => RunMode::Files,
            RunPlan::Live { .. } => RunMode::Live,
        }
    }
}

/// Result of one supervised run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutput {
    pub mode: RunMode,
    pub report: SupervisorReport,
    /// Stage names in the order they were started.
    pub start_order: Vec<String>,
    /// Chunks collected per `stage.key`.
    pub collected: BTreeMap<String, usize>,
    /// Calibration cache written by a calibration run.
    pub cache: Option<CacheEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_path: Option<PathBuf>,
}

/// Runs `plan` to completion or abort.
pub fn run(
    config: &Config,
    plan: &RunPlan,
    timing: SupervisorConfig,
    abort: AbortSignal,
) -> Result<RunOutput> {
    config.validate()?;
    let mode = plan.mode();
    let log = CollectorLog::new();
    let store = CacheStore::new();
    info!(%mode, "starting run");

    let (report, start_order) = match plan {
        RunPlan::Calibration => {
            let (mut board, probe) = calibration_board(config, store.clone())?;
            supervise(&mut board, probe, mode, timing, abort)?
        }
        RunPlan::Files { segments } => {
            let (mut board, probe) = files_board(config, segments, log.clone())?;
            supervise(&mut board, probe, mode, timing, abort)?
        }
        RunPlan::Live { max_chunks } => {
            let network = Arc::new(LoopbackNetwork::new(config.board.edge_buffer));
            let (mut microphone, mut board, probe) =
                live_boards(config, *max_chunks, network, log.clone())?;
            microphone.start()?;
            let outcome = supervise(&mut board, probe, mode, timing, abort);
            let stop = microphone.stop_all();
            if !stop.is_clean() {
                warn!(detached = ?stop.detached, panicked = ?stop.panicked, "microphone board did not stop cleanly");
            }
            outcome?
        }
    };

    let mut output = RunOutput {
        mode,
        report,
        start_order,
        collected: log.counts(),
        cache: store.get(defaults::CALIBRATION_CACHE_NAME),
        report_path: None,
    };

    if let Some(outdir) = &config.processing.outdir {
        output.report_path = Some(write_report(outdir, &output)?);
    }
    Ok(output)
}

fn supervise(
    board: &mut Board,
    probe: Probe,
    mode: RunMode,
    timing: SupervisorConfig,
    abort: AbortSignal,
) -> Result<(SupervisorReport, Vec<String>)> {
    board.start()?;
    let report = Supervisor::new(probe, mode.terminal_set(), timing, abort).run(board);
    info!(
        board = %board.name(),
        outcome = ?report.outcome,
        elapsed_ms = report.elapsed_ms,
        "run finished"
    );
    Ok((report, board.start_order().to_vec()))
}

/// Writes `output` as pretty JSON into `outdir`, returning the file path.
pub fn write_report(outdir: &Path, output: &RunOutput) -> Result<PathBuf> {
    fs::create_dir_all(outdir)?;
    let path = outdir.join(format!("streamboard-{}.json", output.mode));
    let json = serde_json::to_string_pretty(output)
        .map_err(|e| StreamboardError::Other(format!("failed to encode run report: {}", e)))?;
    fs::write(&path, json)?;
    info!(path = %path.display(), "run report written");
    Ok(path)
}

/// Declares the resampler (when decimating) and the time-frequency processor.
/// Returns the stage and key that take the raw sound.
fn declare_front(board: &mut Board, base: &Options, decimation: u32) -> Result<(String, String)> {
    let tf = base
        .clone()
        .with("inputs", TIMESERIES_KEY)
        .with("outputs", TF_OUTPUTS.to_vec());
    board.declare_stage("tf_processor", &Relay::build, &tf)?;

    if decimation <= 1 {
        return Ok(("tf_processor".to_string(), TIMESERIES_KEY.to_string()));
    }

    let resampler = base
        .clone()
        .with("inputs", TIMESERIES_KEY)
        .with("outputs", TIMESERIES_KEY);
    board.declare_stage("resampler", &Relay::build, &resampler)?;
    board.declare_edge(
        "resampler",
        TIMESERIES_KEY,
        "tf_processor",
        TIMESERIES_KEY,
        Transport::Local,
    )?;
    Ok(("resampler".to_string(), TIMESERIES_KEY.to_string()))
}

/// Declares the structure extractors, the PTNE merge and both file writers
/// downstream of `tf_processor`.
fn declare_analysis(board: &mut Board, base: &Options, log: &CollectorLog) -> Result<()> {
    for (name, tract) in [
        ("structure_extractor_f", "f_tract"),
        ("structure_extractor_s", "s_tract"),
    ] {
        let options = base.clone().with("inputs", TSREP_KEY).with("outputs", tract);
        board.declare_stage(name, &Relay::build, &options)?;
        board.declare_edge("tf_processor", "EdB", name, TSREP_KEY, Transport::Local)?;
    }

    let ptne = base
        .clone()
        .with("inputs", vec!["E", "f_tract", "s_tract"])
        .with("outputs", PTNE_OUTPUTS.to_vec());
    board.declare_stage("ptne", &Merge::build, &ptne)?;
    board.declare_edge("tf_processor", "E", "ptne", "E", Transport::Local)?;
    board.declare_edge("structure_extractor_f", "f_tract", "ptne", "f_tract", Transport::Local)?;
    board.declare_edge("structure_extractor_s", "s_tract", "ptne", "s_tract", Transport::Local)?;

    let ptne_writer = base
        .clone()
        .with("inputs", PTNE_OUTPUTS.to_vec())
        .with("name", "filewriter_ptne");
    board.declare_stage("filewriter_ptne", &Collector::capability(log.clone()), &ptne_writer)?;
    for key in PTNE_OUTPUTS {
        board.declare_edge("ptne", key, "filewriter_ptne", key, Transport::Local)?;
    }

    let tracts_writer = base
        .clone()
        .with("inputs", vec!["EdB", "f_tract", "s_tract"])
        .with("name", "filewriter_tracts");
    board.declare_stage(
        "filewriter_tracts",
        &Collector::capability(log.clone()),
        &tracts_writer,
    )?;
    board.declare_edge("tf_processor", "EdB", "filewriter_tracts", "EdB", Transport::Local)?;
    board.declare_edge(
        "structure_extractor_f",
        "f_tract",
        "filewriter_tracts",
        "f_tract",
        Transport::Local,
    )?;
    board.declare_edge(
        "structure_extractor_s",
        "s_tract",
        "filewriter_tracts",
        "s_tract",
        Transport::Local,
    )?;
    Ok(())
}

/// Calibration board, probed on `structure_extractor.cacheCreated`.
pub fn calibration_board(config: &Config, store: CacheStore) -> Result<(Board, Probe)> {
    let base = config.base_options();
    let mut board = Board::new("calibration").with_config(config.board_config());

    let chunk_size = config.processing.calibration_chunk_size().ok_or_else(|| {
        StreamboardError::ConfigInvalidValue {
            key: "processing.input_rate".to_string(),
            message: "calibration chunk size overflows".to_string(),
        }
    })?;
    let noise = base
        .clone()
        .with("calibration", true)
        .with("chunk_size", i64::from(chunk_size));
    board.declare_stage("source", &NoiseSource::build, &noise)?;

    let (entry, entry_key) = declare_front(&mut board, &base, config.processing.decimation)?;
    board.declare_edge("source", SOUND_KEY, &entry, &entry_key, Transport::Local)?;

    board.declare_stage(
        "structure_extractor",
        &CalibrationCache::capability(store),
        &base,
    )?;
    board.declare_edge(
        "tf_processor",
        "EdB",
        "structure_extractor",
        TSREP_KEY,
        Transport::Local,
    )?;

    let probe = board.tap_output("structure_extractor", CACHE_CREATED_KEY)?;
    Ok((board, probe))
}

/// File batch board over `segments`, probed on `tf_processor.technicalkey`.
pub fn files_board(
    config: &Config,
    segments: &[Segment],
    log: CollectorLog,
) -> Result<(Board, Probe)> {
    let base = config.base_options();
    let mut board = Board::new("files").with_config(config.board_config());

    let specs: Vec<String> = segments
        .iter()
        .map(|s| format!("{}={}", s.name, s.chunks))
        .collect();
    let source = base.clone().with("segments", specs);
    board.declare_stage("source", &SegmentSource::build, &source)?;

    let (entry, entry_key) = declare_front(&mut board, &base, config.processing.decimation)?;
    board.declare_edge("source", SOUND_KEY, &entry, &entry_key, Transport::Local)?;
    declare_analysis(&mut board, &base, &log)?;

    let probe = board.tap_output("tf_processor", TECHNICAL_KEY)?;
    Ok((board, probe))
}

/// Live boards: a microphone board publishing `sound` at the configured
/// endpoint, and a processing board subscribing to it. The probe watches the
/// processing board's `tf_processor.technicalkey`.
pub fn live_boards(
    config: &Config,
    max_chunks: Option<u64>,
    network: Arc<LoopbackNetwork>,
    log: CollectorLog,
) -> Result<(Board, Board, Probe)> {
    let base = config.base_options();
    let endpoint = config.network.endpoint();

    let mut microphone = Board::new("microphone")
        .with_config(config.board_config())
        .with_transport(network.clone());
    let mut mic_options = base.clone();
    if let Some(max) = max_chunks {
        mic_options.insert("max_chunks", i64::try_from(max).unwrap_or(i64::MAX));
    }
    microphone.declare_stage("microphone", &LiveSource::build, &mic_options)?;
    microphone.declare_network_output("microphone", SOUND_KEY, endpoint.clone())?;

    let mut board = Board::new("live")
        .with_config(config.board_config())
        .with_transport(network);
    let (entry, entry_key) = declare_front(&mut board, &base, config.processing.decimation)?;
    board.declare_network_input(endpoint, SOUND_KEY, &entry, &entry_key)?;
    declare_analysis(&mut board, &base, &log)?;

    let probe = board.tap_output("tf_processor", TECHNICAL_KEY)?;
    Ok((microphone, board, probe))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::{Outcome, SupervisorState, abort_pair};
    use std::time::Duration;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.processing.chunk_size = Some(64);
        config.processing.timestep_ms = 0;
        config.processing.frequency = 50;
        config.board.stop_timeout_ms = 2000;
        config
    }

    fn fast_timing() -> SupervisorConfig {
        SupervisorConfig {
            poll_interval: Duration::from_millis(20),
            grace: Duration::from_millis(300),
            abort_delay: Duration::from_millis(500),
        }
    }

    fn segments(specs: &[&str]) -> Vec<Segment> {
        specs.iter().map(|s| Segment::parse(s).unwrap()).collect()
    }

    #[test]
    fn test_calibration_run_creates_cache() {
        let (_handle, signal) = abort_pair();
        let output = run(&test_config(), &RunPlan::Calibration, fast_timing(), signal).unwrap();

        assert!(output.report.is_completed());
        assert_eq!(output.mode, RunMode::Calibration);
        assert_eq!(
            output.start_order,
            vec!["source", "resampler", "tf_processor", "structure_extractor"]
        );
        let cache = output.cache.unwrap();
        assert_eq!(cache.chunks, 1);
        assert_eq!(cache.samples, 64);
        assert!(output.report.stop.is_clean());
    }

    #[test]
    fn test_files_run_reaches_both_writers() {
        let (_handle, signal) = abort_pair();
        let plan = RunPlan::Files {
            segments: segments(&["a.wav=3", "b.wav=2"]),
        };
        let output = run(&test_config(), &plan, fast_timing(), signal).unwrap();

        assert_eq!(
            output.report.states(),
            vec![
                SupervisorState::Waiting,
                SupervisorState::TerminalSeen,
                SupervisorState::Draining,
                SupervisorState::Stopped
            ]
        );
        assert_eq!(output.report.chunks_observed, 5);
        for key in ["energy", "pulse", "noise", "tone"] {
            assert_eq!(output.collected[&format!("filewriter_ptne.{}", key)], 5);
        }
        for key in ["EdB", "f_tract", "s_tract"] {
            assert_eq!(output.collected[&format!("filewriter_tracts.{}", key)], 5);
        }
        assert!(output.cache.is_none());
    }

    #[test]
    fn test_no_resampler_without_decimation() {
        let mut config = test_config();
        config.processing.decimation = 1;
        let (board, _probe) =
            files_board(&config, &segments(&["a.wav=1"]), CollectorLog::new()).unwrap();
        assert!(!board.stage_names().contains(&"resampler"));
        assert!(
            board
                .edges()
                .iter()
                .any(|e| e.source == "source" && e.destination == "tf_processor")
        );
    }

    #[test]
    fn test_live_run_ends_on_last_chunk() {
        let (_handle, signal) = abort_pair();
        let plan = RunPlan::Live {
            max_chunks: Some(3),
        };
        let output = run(&test_config(), &plan, fast_timing(), signal).unwrap();

        assert!(output.report.is_completed());
        assert_eq!(output.report.chunks_observed, 3);
        assert_eq!(output.collected["filewriter_ptne.energy"], 3);
    }

    #[test]
    fn test_live_run_without_limit_stops_on_abort() {
        let (handle, signal) = abort_pair();
        let aborter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            handle.abort();
        });
        let plan = RunPlan::Live { max_chunks: None };
        let output = run(&test_config(), &plan, fast_timing(), signal).unwrap();
        aborter.join().unwrap();

        assert_eq!(output.report.outcome, Outcome::Aborted);
        assert_eq!(
            output.report.states(),
            vec![SupervisorState::Waiting, SupervisorState::Stopped]
        );
    }

    #[test]
    fn test_report_written_to_outdir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.processing.outdir = Some(dir.path().join("results"));

        let (_handle, signal) = abort_pair();
        let output = run(&config, &RunPlan::Calibration, fast_timing(), signal).unwrap();

        let path = output.report_path.unwrap();
        assert_eq!(path.file_name().unwrap(), "streamboard-calibration.json");
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["report"]["outcome"], "completed");
        assert_eq!(json["mode"], "calibration");
    }

    #[test]
    fn test_invalid_config_is_rejected_before_start() {
        let mut config = test_config();
        config.processing.samples_per_frame = 0;
        let (_handle, signal) = abort_pair();
        assert!(run(&config, &RunPlan::Calibration, fast_timing(), signal).is_err());
    }

    #[test]
    fn test_huge_input_rate_is_rejected_not_wrapped() {
        let mut config = test_config();
        config.processing.chunk_size = None;
        config.processing.input_rate = u32::MAX;
        let (_handle, signal) = abort_pair();
        let err = run(&config, &RunPlan::Calibration, fast_timing(), signal).unwrap_err();
        assert!(matches!(
            err,
            StreamboardError::ConfigInvalidValue { ref key, .. } if key == "processing.input_rate"
        ));
    }
}
