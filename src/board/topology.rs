//! The board: stage registry, edge wiring and lifecycle.

use crate::board::chunk::Chunk;
use crate::board::edge::{EdgeHandle, EdgeSpec, Endpoint, NetworkInput, NetworkOutput, Transport};
use crate::board::network::{LoopbackNetwork, NetworkTransport, RisePolicy};
use crate::board::probe::Probe;
use crate::board::runner::{StageRunner, StageWiring};
use crate::board::stage::{Capability, ErrorReporter, LogReporter, Stage, StageKeys};
use crate::defaults;
use crate::error::{Result, StreamboardError};
use crate::options::Options;
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Lifecycle of a board. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BoardState {
    Assembling,
    Running,
    Draining,
    Stopped,
}

impl BoardState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BoardState::Assembling => "assembling",
            BoardState::Running => "running",
            BoardState::Draining => "draining",
            BoardState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for BoardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime settings of a board.
#[derive(Debug, Clone)]
pub struct BoardConfig {
    /// Capacity of each local edge.
    pub edge_buffer: usize,
    /// How long `stop_all` waits for stage threads before detaching them.
    pub stop_timeout: Duration,
    /// Retry policy for network inputs.
    pub rise: RisePolicy,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            edge_buffer: defaults::EDGE_BUFFER,
            stop_timeout: Duration::from_millis(defaults::STOP_TIMEOUT_MS),
            rise: RisePolicy::default(),
        }
    }
}

/// Handle to a stage declared on a board.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StageHandle {
    index: usize,
    name: String,
}

impl StageHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// What `stop_all` managed to do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    /// Stage threads joined.
    pub stopped: usize,
    /// Stages still running at the deadline, left to die with the process.
    pub detached: Vec<String>,
    /// Stages whose thread panicked.
    pub panicked: Vec<String>,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.detached.is_empty() && self.panicked.is_empty()
    }
}

struct StageSlot {
    name: String,
    keys: StageKeys,
    /// Present until the board starts.
    stage: Option<Box<dyn Stage>>,
    runner: Option<StageRunner>,
}

struct Tap {
    stage: usize,
    key: String,
    tx: Sender<Chunk>,
}

/// A set of stages connected by keyed edges.
///
/// Stages and edges are declared while the board is assembling. `start` spawns
/// one thread per stage in dependency order; from then on the topology is
/// read-only.
pub struct Board {
    name: String,
    state: BoardState,
    stages: Vec<StageSlot>,
    by_name: HashMap<String, usize>,
    edges: Vec<EdgeSpec>,
    taps: Vec<Tap>,
    network_inputs: Vec<NetworkInput>,
    network_outputs: Vec<NetworkOutput>,
    transport: Arc<dyn NetworkTransport>,
    config: BoardConfig,
    reporter: Arc<dyn ErrorReporter>,
    start_order: Vec<String>,
    stop_report: Option<StopReport>,
}

impl Board {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: BoardState::Assembling,
            stages: Vec::new(),
            by_name: HashMap::new(),
            edges: Vec::new(),
            taps: Vec::new(),
            network_inputs: Vec::new(),
            network_outputs: Vec::new(),
            transport: Arc::new(LoopbackNetwork::default()),
            config: BoardConfig::default(),
            reporter: Arc::new(LogReporter),
            start_order: Vec::new(),
            stop_report: None,
        }
    }

    pub fn with_config(mut self, config: BoardConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the transport used by network edges, inputs and outputs.
    pub fn with_transport(mut self, transport: Arc<dyn NetworkTransport>) -> Self {
        self.transport = transport;
        self
    }

    /// Sets a custom error reporter.
    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BoardState {
        self.state
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stage names in declaration order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn edges(&self) -> &[EdgeSpec] {
        &self.edges
    }

    /// Order in which stages were spawned. Empty before `start`.
    pub fn start_order(&self) -> &[String] {
        &self.start_order
    }

    fn require_assembling(&self) -> Result<()> {
        if self.state == BoardState::Assembling {
            Ok(())
        } else {
            Err(StreamboardError::InvalidState {
                expected: BoardState::Assembling.as_str(),
                actual: self.state.as_str(),
            })
        }
    }

    fn lookup(&self, name: &str) -> Result<usize> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| StreamboardError::UnknownStage {
                name: name.to_string(),
            })
    }

    fn check_outbound(&self, index: usize, key: &str) -> Result<()> {
        let slot = &self.stages[index];
        if slot.keys.publishes(key) {
            Ok(())
        } else {
            Err(StreamboardError::InvalidKey {
                stage: slot.name.clone(),
                key: key.to_string(),
                direction: "outbound",
            })
        }
    }

    fn check_inbound(&self, index: usize, key: &str) -> Result<()> {
        let slot = &self.stages[index];
        if slot.keys.accepts(key) {
            Ok(())
        } else {
            Err(StreamboardError::InvalidKey {
                stage: slot.name.clone(),
                key: key.to_string(),
                direction: "inbound",
            })
        }
    }

    /// Builds a stage from `options` and registers it under `name`.
    pub fn declare_stage<C>(
        &mut self,
        name: &str,
        capability: &C,
        options: &Options,
    ) -> Result<StageHandle>
    where
        C: Capability + ?Sized,
    {
        self.require_assembling()?;
        if self.by_name.contains_key(name) {
            return Err(StreamboardError::DuplicateStageName {
                name: name.to_string(),
            });
        }

        let stage = capability
            .build(options)
            .map_err(|e| StreamboardError::StageBuild {
                stage: name.to_string(),
                message: e.to_string(),
            })?;
        let keys = stage.keys();

        let index = self.stages.len();
        debug!(
            board = %self.name,
            stage = name,
            inbound = ?keys.inbound,
            outbound = ?keys.outbound,
            "stage declared"
        );
        self.stages.push(StageSlot {
            name: name.to_string(),
            keys,
            stage: Some(stage),
            runner: None,
        });
        self.by_name.insert(name.to_string(), index);

        Ok(StageHandle {
            index,
            name: name.to_string(),
        })
    }

    /// Connects `source.source_key` to `destination.destination_key`.
    pub fn declare_edge(
        &mut self,
        source: &str,
        source_key: &str,
        destination: &str,
        destination_key: &str,
        transport: Transport,
    ) -> Result<EdgeHandle> {
        self.require_assembling()?;
        let src = self.lookup(source)?;
        let dst = self.lookup(destination)?;
        self.check_outbound(src, source_key)?;
        self.check_inbound(dst, destination_key)?;

        let spec = EdgeSpec {
            source: source.to_string(),
            source_key: source_key.to_string(),
            destination: destination.to_string(),
            destination_key: destination_key.to_string(),
            transport,
        };
        debug!(board = %self.name, edge = %spec, "edge declared");

        let index = self.edges.len();
        self.edges.push(spec.clone());
        Ok(EdgeHandle::new(index, spec))
    }

    /// Feeds `destination.destination_key` from `sender_key` published at `endpoint`
    /// by another board.
    pub fn declare_network_input(
        &mut self,
        endpoint: Endpoint,
        sender_key: &str,
        destination: &str,
        destination_key: &str,
    ) -> Result<()> {
        self.require_assembling()?;
        let dst = self.lookup(destination)?;
        self.check_inbound(dst, destination_key)?;

        debug!(board = %self.name, %endpoint, sender_key, destination, destination_key, "network input declared");
        self.network_inputs.push(NetworkInput {
            endpoint,
            sender_key: sender_key.to_string(),
            destination: destination.to_string(),
            destination_key: destination_key.to_string(),
        });
        Ok(())
    }

    /// Publishes `source.source_key` at `endpoint` for other boards.
    pub fn declare_network_output(
        &mut self,
        source: &str,
        source_key: &str,
        endpoint: Endpoint,
    ) -> Result<()> {
        self.require_assembling()?;
        let src = self.lookup(source)?;
        self.check_outbound(src, source_key)?;

        debug!(board = %self.name, source, source_key, %endpoint, "network output declared");
        self.network_outputs.push(NetworkOutput {
            source: source.to_string(),
            source_key: source_key.to_string(),
            endpoint,
        });
        Ok(())
    }

    /// Duplicates the chunk stream of a declared edge.
    pub fn tap(&mut self, edge: &EdgeHandle) -> Result<Probe> {
        let known = self
            .edges
            .get(edge.index)
            .is_some_and(|spec| spec == edge.spec());
        if !known {
            return Err(StreamboardError::UnknownEdge {
                edge: edge.spec().to_string(),
            });
        }
        let spec = edge.spec().clone();
        self.tap_output(&spec.source, &spec.source_key)
    }

    /// Duplicates everything `stage` publishes on `key`.
    pub fn tap_output(&mut self, stage: &str, key: &str) -> Result<Probe> {
        self.require_assembling()?;
        let index = self.lookup(stage)?;
        self.check_outbound(index, key)?;

        let (tx, rx) = unbounded();
        self.taps.push(Tap {
            stage: index,
            key: key.to_string(),
            tx,
        });
        Ok(Probe::new(format!("{}.{}", stage, key), rx))
    }

    /// Stage indices in dependency order over local edges.
    ///
    /// Ties keep declaration order. Network edges impose no order.
    fn topological_order(&self) -> Result<Vec<usize>> {
        let n = self.stages.len();
        let mut indegree = vec![0usize; n];
        let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); n];

        for spec in self.edges.iter().filter(|e| e.transport.is_local()) {
            let src = self.lookup(&spec.source)?;
            let dst = self.lookup(&spec.destination)?;
            downstream[src].push(dst);
            indegree[dst] += 1;
        }

        let mut ready: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(i) = ready.pop_front() {
            order.push(i);
            for &next in &downstream[i] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }

        if order.len() < n {
            let stages = (0..n)
                .filter(|&i| indegree[i] > 0)
                .map(|i| self.stages[i].name.clone())
                .collect();
            return Err(StreamboardError::CyclicTopology { stages });
        }
        Ok(order)
    }

    /// Builds every stage's channels. Leaves the board untouched on error.
    fn wire(&self) -> Result<Vec<StageWiring>> {
        let mut wiring: Vec<StageWiring> = self
            .stages
            .iter()
            .map(|slot| StageWiring {
                inputs: Vec::new(),
                network_inputs: Vec::new(),
                outputs: slot
                    .keys
                    .outbound
                    .iter()
                    .map(|k| (k.clone(), Vec::new()))
                    .collect(),
                transport: Arc::clone(&self.transport),
                rise: self.config.rise,
            })
            .collect();

        // One publisher per stage key and endpoint, however many edges use it
        let mut published: HashSet<(usize, &str, &Endpoint)> = HashSet::new();

        for spec in &self.edges {
            let src = self.lookup(&spec.source)?;
            let dst = self.lookup(&spec.destination)?;
            match &spec.transport {
                Transport::Local => {
                    let (tx, rx): (Sender<Chunk>, Receiver<Chunk>) =
                        bounded(self.config.edge_buffer);
                    push_output(&mut wiring, src, &spec.source_key, tx);
                    wiring[dst].inputs.push((spec.destination_key.clone(), rx));
                }
                Transport::Network(endpoint) => {
                    if published.insert((src, spec.source_key.as_str(), endpoint)) {
                        let tx = self.transport.publish(endpoint, &spec.source_key)?;
                        push_output(&mut wiring, src, &spec.source_key, tx);
                    }
                    // Both ends live here, so subscribe before any stage runs
                    let rx = self.transport.subscribe(endpoint, &spec.source_key)?;
                    wiring[dst].inputs.push((spec.destination_key.clone(), rx));
                }
            }
        }

        for output in &self.network_outputs {
            let src = self.lookup(&output.source)?;
            if published.insert((src, output.source_key.as_str(), &output.endpoint)) {
                let tx = self.transport.publish(&output.endpoint, &output.source_key)?;
                push_output(&mut wiring, src, &output.source_key, tx);
            }
        }

        for input in &self.network_inputs {
            let dst = self.lookup(&input.destination)?;
            wiring[dst].network_inputs.push(input.clone());
        }

        for tap in &self.taps {
            push_output(&mut wiring, tap.stage, &tap.key, tap.tx.clone());
        }

        Ok(wiring)
    }

    /// Spawns every stage, producers before consumers.
    pub fn start(&mut self) -> Result<()> {
        self.require_assembling()?;
        let order = self.topological_order()?;
        let mut wiring: Vec<Option<StageWiring>> = self.wire()?.into_iter().map(Some).collect();

        // Board no longer holds tap senders: probes close with their stage.
        self.taps.clear();
        self.state = BoardState::Running;

        for index in order {
            let slot = &mut self.stages[index];
            let (Some(stage), Some(stage_wiring)) = (slot.stage.take(), wiring[index].take())
            else {
                continue;
            };
            match StageRunner::spawn(&slot.name, stage, stage_wiring, Arc::clone(&self.reporter))
            {
                Ok(runner) => {
                    slot.runner = Some(runner);
                    self.start_order.push(slot.name.clone());
                }
                Err(e) => {
                    error!(board = %self.name, stage = %slot.name, "failed to spawn stage: {}", e);
                    self.stop_all();
                    return Err(e);
                }
            }
        }

        info!(
            board = %self.name,
            stages = self.stages.len(),
            edges = self.edges.len(),
            "board running"
        );
        Ok(())
    }

    /// Marks the board as draining. Returns `false` if it was not running.
    pub fn enter_draining(&mut self) -> bool {
        if self.state != BoardState::Running {
            return false;
        }
        self.state = BoardState::Draining;
        info!(board = %self.name, "board draining");
        true
    }

    /// Signals one stage to stop. Returns `false` if it was already signalled
    /// or never started.
    pub fn stop_stage(&mut self, stage: &StageHandle) -> Result<bool> {
        let slot = self
            .stages
            .get_mut(stage.index)
            .filter(|slot| slot.name == stage.name)
            .ok_or_else(|| StreamboardError::UnknownStage {
                name: stage.name.clone(),
            })?;
        Ok(slot.runner.as_mut().is_some_and(StageRunner::stop))
    }

    /// True once the stage's thread has exited. Always true before `start`.
    pub fn is_stage_finished(&self, stage: &StageHandle) -> bool {
        self.stages
            .get(stage.index)
            .and_then(|slot| slot.runner.as_ref())
            .is_none_or(StageRunner::is_finished)
    }

    /// Stops every stage, waiting up to the configured stop timeout.
    pub fn stop_all(&mut self) -> StopReport {
        self.stop_all_within(self.config.stop_timeout)
    }

    /// Stops every stage, waiting up to `timeout` for their threads.
    ///
    /// Idempotent: a stopped board returns the report of the first call.
    /// Threads still running at the deadline are detached.
    pub fn stop_all_within(&mut self, timeout: Duration) -> StopReport {
        if self.state == BoardState::Stopped {
            return self.stop_report.clone().unwrap_or_default();
        }

        let mut threads = Vec::new();
        for slot in &mut self.stages {
            if let Some(runner) = slot.runner.as_mut() {
                runner.stop();
                if let Some(thread) = runner.take_thread() {
                    threads.push((runner.name().to_string(), thread));
                }
            }
            // Never started: drop the built stage.
            slot.stage = None;
        }
        self.taps.clear();

        let mut report = StopReport::default();
        let deadline = Instant::now() + timeout;
        let poll_interval = Duration::from_millis(10);

        loop {
            let mut remaining = Vec::new();
            for (name, thread) in threads.drain(..) {
                if thread.is_finished() {
                    report.stopped += 1;
                    if let Err(panic_info) = thread.join() {
                        let msg = panic_info
                            .downcast_ref::<&str>()
                            .copied()
                            .or_else(|| panic_info.downcast_ref::<String>().map(|s| s.as_str()))
                            .unwrap_or("unknown panic");
                        error!(board = %self.name, stage = %name, "stage thread panicked: {}", msg);
                        report.panicked.push(name);
                    }
                } else {
                    remaining.push((name, thread));
                }
            }
            threads = remaining;

            if threads.is_empty() {
                break;
            }

            if Instant::now() >= deadline {
                for (name, _) in &threads {
                    warn!(board = %self.name, stage = %name, "stage did not stop in time, detaching");
                }
                // Dropping the JoinHandles detaches the threads.
                report.detached = threads.into_iter().map(|(name, _)| name).collect();
                break;
            }

            thread::sleep(poll_interval);
        }

        self.state = BoardState::Stopped;
        info!(
            board = %self.name,
            stopped = report.stopped,
            detached = report.detached.len(),
            "board stopped"
        );
        self.stop_report = Some(report.clone());
        report
    }
}

fn push_output(wiring: &mut [StageWiring], stage: usize, key: &str, tx: Sender<Chunk>) {
    if let Some(senders) = wiring[stage].outputs.get_mut(key) {
        senders.push(tx);
    }
}

impl Drop for Board {
    fn drop(&mut self) {
        for slot in &mut self.stages {
            if let Some(runner) = slot.runner.as_mut()
                && !runner.is_stop_signalled()
            {
                debug!(board = %self.name, stage = runner.name(), "board dropped, stopping stage");
                runner.stop();
            }
        }
    }
}

impl fmt::Debug for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Board")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("stages", &self.stage_names())
            .field("edges", &self.edges.len())
            .finish_non_exhaustive()
    }
}
