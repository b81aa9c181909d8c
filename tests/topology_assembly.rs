//! Board assembly: declaration errors, start order, and probe ordering.

use std::sync::Arc;
use std::time::{Duration, Instant};
use streamboard::board::{Board, BoardState, Endpoint, LoopbackNetwork, Transport};
use streamboard::continuity::Continuity;
use streamboard::options::Options;
use streamboard::stages::{Collector, CollectorLog, Relay, SOUND_KEY, SegmentSource};
use streamboard::StreamboardError;

fn relay(inputs: &str, outputs: &str) -> Options {
    Options::new().with("inputs", inputs).with("outputs", outputs)
}

fn source(chunks: u64) -> Options {
    Options::new()
        .with("segments", vec![format!("input.wav={}", chunks)])
        .with("chunk_size", 16_i64)
}

#[test]
fn duplicate_stage_name_is_rejected() {
    let mut board = Board::new("test");
    board
        .declare_stage("tf_processor", &Relay::build, &relay("timeseries", "EdB"))
        .unwrap();
    let err = board
        .declare_stage("tf_processor", &Relay::build, &relay("timeseries", "EdB"))
        .unwrap_err();
    assert!(matches!(err, StreamboardError::DuplicateStageName { ref name } if name == "tf_processor"));
    assert_eq!(board.len(), 1);
}

#[test]
fn stage_build_failure_names_the_stage() {
    let mut board = Board::new("test");
    let err = board
        .declare_stage("broken", &Relay::build, &Options::new())
        .unwrap_err();
    assert!(matches!(err, StreamboardError::StageBuild { ref stage, .. } if stage == "broken"));
    assert!(board.is_empty());
}

#[test]
fn edge_to_undeclared_stage_is_unknown_stage() {
    let mut board = Board::new("test");
    board
        .declare_stage("source", &SegmentSource::build, &source(1))
        .unwrap();

    let err = board
        .declare_edge("source", SOUND_KEY, "resampler", "timeseries", Transport::Local)
        .unwrap_err();
    assert!(matches!(err, StreamboardError::UnknownStage { ref name } if name == "resampler"));

    let err = board
        .declare_edge("ghost", "x", "source", SOUND_KEY, Transport::Local)
        .unwrap_err();
    assert!(matches!(err, StreamboardError::UnknownStage { ref name } if name == "ghost"));

    // Network edges need both ends on this board too
    let err = board
        .declare_edge(
            "source",
            SOUND_KEY,
            "elsewhere",
            "timeseries",
            Transport::Network(Endpoint::new("127.0.0.1", 5555)),
        )
        .unwrap_err();
    assert!(matches!(err, StreamboardError::UnknownStage { .. }));
    assert!(board.edges().is_empty());
}

#[test]
fn edge_with_undeclared_key_is_invalid_key() {
    let mut board = Board::new("test");
    board
        .declare_stage("source", &SegmentSource::build, &source(1))
        .unwrap();
    board
        .declare_stage("resampler", &Relay::build, &relay("timeseries", "timeseries"))
        .unwrap();

    let err = board
        .declare_edge("source", "timeseries", "resampler", "timeseries", Transport::Local)
        .unwrap_err();
    assert!(matches!(
        err,
        StreamboardError::InvalidKey { ref stage, ref key, .. } if stage == "source" && key == "timeseries"
    ));

    let err = board
        .declare_edge("source", SOUND_KEY, "resampler", "sound", Transport::Local)
        .unwrap_err();
    assert!(matches!(
        err,
        StreamboardError::InvalidKey { ref stage, ref key, .. } if stage == "resampler" && key == "sound"
    ));

    // Source and destination keys may differ
    board
        .declare_edge("source", SOUND_KEY, "resampler", "timeseries", Transport::Local)
        .unwrap();
}

#[test]
fn network_declarations_are_validated() {
    let endpoint = Endpoint::new("127.0.0.1", 5555);
    let mut board = Board::new("test");
    board
        .declare_stage("resampler", &Relay::build, &relay("timeseries", "timeseries"))
        .unwrap();

    board
        .declare_network_input(endpoint.clone(), SOUND_KEY, "resampler", "timeseries")
        .unwrap();
    assert!(matches!(
        board
            .declare_network_input(endpoint.clone(), SOUND_KEY, "resampler", "EdB")
            .unwrap_err(),
        StreamboardError::InvalidKey { .. }
    ));
    assert!(matches!(
        board
            .declare_network_output("microphone", SOUND_KEY, endpoint)
            .unwrap_err(),
        StreamboardError::UnknownStage { .. }
    ));
}

#[test]
fn declarations_fail_once_started() {
    let mut board = Board::new("test");
    board
        .declare_stage("source", &SegmentSource::build, &source(1))
        .unwrap();
    board.start().unwrap();
    assert_eq!(board.state(), BoardState::Running);

    let err = board
        .declare_stage("late", &Relay::build, &relay("a", "b"))
        .unwrap_err();
    assert!(matches!(err, StreamboardError::InvalidState { .. }));
    assert!(matches!(
        board.tap_output("source", SOUND_KEY).unwrap_err(),
        StreamboardError::InvalidState { .. }
    ));
    assert!(matches!(
        board.start().unwrap_err(),
        StreamboardError::InvalidState { .. }
    ));
    board.stop_all();
}

#[test]
fn cycle_is_rejected_and_board_stays_assembling() {
    let mut board = Board::new("test");
    board
        .declare_stage("a", &Relay::build, &relay("x", "x"))
        .unwrap();
    board
        .declare_stage("b", &Relay::build, &relay("x", "x"))
        .unwrap();
    board.declare_edge("a", "x", "b", "x", Transport::Local).unwrap();
    board.declare_edge("b", "x", "a", "x", Transport::Local).unwrap();

    let err = board.start().unwrap_err();
    match err {
        StreamboardError::CyclicTopology { stages } => {
            assert_eq!(stages, vec!["a".to_string(), "b".to_string()]);
        }
        other => panic!("expected CyclicTopology, got {:?}", other),
    }
    assert_eq!(board.state(), BoardState::Assembling);
}

#[test]
fn stages_start_producers_first() {
    let log = CollectorLog::new();
    let mut board = Board::new("test");
    // Declared consumers first on purpose
    board
        .declare_stage(
            "filewriter",
            &Collector::capability(log.clone()),
            &Options::new().with("inputs", "EdB"),
        )
        .unwrap();
    board
        .declare_stage("tf_processor", &Relay::build, &relay("timeseries", "EdB"))
        .unwrap();
    board
        .declare_stage("source", &SegmentSource::build, &source(2))
        .unwrap();
    board
        .declare_edge("tf_processor", "EdB", "filewriter", "EdB", Transport::Local)
        .unwrap();
    board
        .declare_edge("source", SOUND_KEY, "tf_processor", "timeseries", Transport::Local)
        .unwrap();

    board.start().unwrap();
    assert_eq!(board.start_order(), ["source", "tf_processor", "filewriter"]);
    let report = board.stop_all();
    assert_eq!(report.stopped, 3);
}

#[test]
fn probe_and_destinations_see_production_order() {
    const CHUNKS: u64 = 200;
    let log = CollectorLog::new();
    let mut board = Board::new("test");
    board
        .declare_stage("source", &SegmentSource::build, &source(CHUNKS))
        .unwrap();
    for name in ["left", "right"] {
        board
            .declare_stage(
                name,
                &Collector::capability(log.clone()),
                &Options::new().with("inputs", "timeseries").with("name", name),
            )
            .unwrap();
    }
    let edge = board
        .declare_edge("source", SOUND_KEY, "left", "timeseries", Transport::Local)
        .unwrap();
    board
        .declare_edge("source", SOUND_KEY, "right", "timeseries", Transport::Local)
        .unwrap();
    let probe = board.tap(&edge).unwrap();
    assert_eq!(probe.label(), "source.sound");

    board.start().unwrap();

    let mut sequences = Vec::new();
    while let Some(chunk) = probe.poll(Duration::from_secs(5)) {
        sequences.push(chunk.sequence());
        if chunk.continuity() == Continuity::Last {
            break;
        }
    }
    assert_eq!(sequences, (0..CHUNKS).collect::<Vec<_>>());

    // Collectors finish once the source closes their edges
    let deadline = Instant::now() + Duration::from_secs(5);
    while log.len() < 2 * CHUNKS as usize && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    board.stop_all();

    for name in ["left", "right"] {
        let seen: Vec<u64> = log
            .for_key(name, "timeseries")
            .iter()
            .map(|r| r.sequence)
            .collect();
        assert_eq!(seen, (0..CHUNKS).collect::<Vec<_>>(), "{} out of order", name);
    }
}

#[test]
fn tap_of_foreign_edge_is_rejected() {
    let mut other = Board::new("other");
    other
        .declare_stage("source", &SegmentSource::build, &source(1))
        .unwrap();
    other
        .declare_stage("sink", &Relay::build, &relay("timeseries", "timeseries"))
        .unwrap();
    let foreign = other
        .declare_edge("source", SOUND_KEY, "sink", "timeseries", Transport::Local)
        .unwrap();

    let mut board = Board::new("test");
    assert!(matches!(
        board.tap(&foreign).unwrap_err(),
        StreamboardError::UnknownEdge { .. }
    ));
}

fn collector(log: &CollectorLog, board: &mut Board, name: &str) {
    board
        .declare_stage(
            name,
            &Collector::capability(log.clone()),
            &Options::new().with("inputs", "timeseries").with("name", name),
        )
        .unwrap();
}

/// Loopback edges never close, so wait for the expected count instead.
fn wait_for_records(log: &CollectorLog, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while log.len() < expected && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn sequences(log: &CollectorLog, name: &str) -> Vec<u64> {
    log.for_key(name, "timeseries")
        .iter()
        .map(|r| r.sequence)
        .collect()
}

#[test]
fn network_fan_out_delivers_everything_to_each_destination() {
    const CHUNKS: u64 = 20;
    let endpoint = Endpoint::new("127.0.0.1", 7100);
    let log = CollectorLog::new();
    let mut board = Board::new("test");
    board
        .declare_stage("source", &SegmentSource::build, &source(CHUNKS))
        .unwrap();
    for name in ["left", "right"] {
        collector(&log, &mut board, name);
        board
            .declare_edge(
                "source",
                SOUND_KEY,
                name,
                "timeseries",
                Transport::Network(endpoint.clone()),
            )
            .unwrap();
    }

    board.start().unwrap();
    wait_for_records(&log, 2 * CHUNKS as usize);
    board.stop_all();

    assert_eq!(log.len(), 2 * CHUNKS as usize);
    for name in ["left", "right"] {
        assert_eq!(sequences(&log, name), (0..CHUNKS).collect::<Vec<_>>(), "{}", name);
    }
}

#[test]
fn network_output_and_edge_on_one_key_publish_once() {
    const CHUNKS: u64 = 20;
    let endpoint = Endpoint::new("127.0.0.1", 7101);
    let network = Arc::new(LoopbackNetwork::new(4));
    let log = CollectorLog::new();

    let mut remote = Board::new("remote").with_transport(network.clone());
    collector(&log, &mut remote, "right");
    remote
        .declare_network_input(endpoint.clone(), SOUND_KEY, "right", "timeseries")
        .unwrap();
    remote.start().unwrap();

    // The remote collector rises on its own thread
    let deadline = Instant::now() + Duration::from_secs(5);
    while network.subscriber_count(&endpoint, SOUND_KEY) == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(network.subscriber_count(&endpoint, SOUND_KEY), 1);

    let mut board = Board::new("local").with_transport(network.clone());
    board
        .declare_stage("source", &SegmentSource::build, &source(CHUNKS))
        .unwrap();
    collector(&log, &mut board, "left");
    board
        .declare_edge(
            "source",
            SOUND_KEY,
            "left",
            "timeseries",
            Transport::Network(endpoint.clone()),
        )
        .unwrap();
    board
        .declare_network_output("source", SOUND_KEY, endpoint.clone())
        .unwrap();
    board.start().unwrap();
    assert_eq!(network.subscriber_count(&endpoint, SOUND_KEY), 2);

    wait_for_records(&log, 2 * CHUNKS as usize);
    board.stop_all();
    remote.stop_all();

    assert_eq!(log.len(), 2 * CHUNKS as usize);
    for name in ["left", "right"] {
        assert_eq!(sequences(&log, name), (0..CHUNKS).collect::<Vec<_>>(), "{}", name);
    }
    assert_eq!(network.route_count(), 1);
}
