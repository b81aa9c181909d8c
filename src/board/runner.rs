//! Runs one stage on a dedicated thread.
//!
//! Every blocking point of the loop also waits on the stage's stop receiver.
//! The board holds the matching sender; dropping it is the stop signal.

use crate::board::chunk::Chunk;
use crate::board::edge::NetworkInput;
use crate::board::network::{NetworkTransport, RisePolicy, TransportError, rise};
use crate::board::stage::{ErrorReporter, Outbox, SourceStatus, Stage, StageError, StageKeys};
use crate::error::Result;
use crossbeam_channel::{Receiver, RecvTimeoutError, Select, Sender, TryRecvError, bounded};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::debug;

/// Channels wired to one stage by the board.
pub(crate) struct StageWiring {
    /// Local inbound edges as `(destination_key, receiver)`.
    pub inputs: Vec<(String, Receiver<Chunk>)>,
    /// Inbound network edges, risen on the stage thread.
    pub network_inputs: Vec<NetworkInput>,
    /// Every declared outbound key, with the senders fed from it (edges, taps, network).
    pub outputs: HashMap<String, Vec<Sender<Chunk>>>,
    pub transport: Arc<dyn NetworkTransport>,
    pub rise: RisePolicy,
}

/// Why a stage thread ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageExit {
    Stopped,
    InputsClosed,
    Exhausted,
    Fatal,
}

enum Delivery {
    Done,
    Stopped,
}

/// Owner side of a running stage thread.
pub(crate) struct StageRunner {
    name: String,
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl StageRunner {
    /// Spawns `stage` on a thread named after it.
    pub(crate) fn spawn(
        name: &str,
        stage: Box<dyn Stage>,
        wiring: StageWiring,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let keys = stage.keys();
        let mut worker = Worker {
            name: name.to_string(),
            keys,
            outputs: wiring.outputs,
            stop_rx,
            reporter,
        };
        let inputs = wiring.inputs;
        let network_inputs = wiring.network_inputs;
        let transport = wiring.transport;
        let policy = wiring.rise;

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut stage = stage;
                let exit = if worker.keys.is_source() {
                    worker.run_source(stage.as_mut())
                } else {
                    match worker.rise_inputs(inputs, &network_inputs, transport.as_ref(), policy) {
                        Some(inputs) => worker.run_processor(stage.as_mut(), inputs),
                        None => StageExit::Fatal,
                    }
                };
                stage.shutdown();
                debug!(stage = %worker.name, ?exit, "stage thread finished");
            })?;

        debug!(stage = name, "stage thread started");
        Ok(Self {
            name: name.to_string(),
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Signals the stage to stop. Returns `false` if it was already signalled.
    pub(crate) fn stop(&mut self) -> bool {
        self.stop_tx.take().is_some()
    }

    pub(crate) fn is_stop_signalled(&self) -> bool {
        self.stop_tx.is_none()
    }

    /// True once the thread has exited (or was already joined/detached).
    pub(crate) fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    pub(crate) fn take_thread(&mut self) -> Option<JoinHandle<()>> {
        self.thread.take()
    }
}

/// State moved onto the stage thread.
struct Worker {
    name: String,
    keys: StageKeys,
    outputs: HashMap<String, Vec<Sender<Chunk>>>,
    stop_rx: Receiver<()>,
    reporter: Arc<dyn ErrorReporter>,
}

impl Worker {
    fn stop_requested(&self) -> bool {
        matches!(self.stop_rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    fn report(&self, error: StageError) {
        self.reporter.report(&self.name, &error);
    }

    /// Subscribes network inputs. `None` means the stage must not run.
    fn rise_inputs(
        &self,
        mut inputs: Vec<(String, Receiver<Chunk>)>,
        network_inputs: &[NetworkInput],
        transport: &dyn NetworkTransport,
        policy: RisePolicy,
    ) -> Option<Vec<(String, Receiver<Chunk>)>> {
        for input in network_inputs {
            match rise(
                transport,
                &input.endpoint,
                &input.sender_key,
                policy,
                &self.stop_rx,
            ) {
                Ok(rx) => inputs.push((input.destination_key.clone(), rx)),
                Err(TransportError::Interrupted { .. }) => return None,
                Err(e) => {
                    self.report(StageError::Fatal(e.to_string()));
                    return None;
                }
            }
        }
        Some(inputs)
    }

    fn run_source(&mut self, stage: &mut dyn Stage) -> StageExit {
        let mut outbox = Outbox::new();
        loop {
            if self.stop_requested() {
                return StageExit::Stopped;
            }

            let status = stage.generate(&mut outbox);
            if let Delivery::Stopped = self.deliver(&mut outbox) {
                return StageExit::Stopped;
            }

            match status {
                Ok(SourceStatus::Continue) => {}
                Ok(SourceStatus::WaitFor(pause)) => match self.stop_rx.recv_timeout(pause) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => return StageExit::Stopped,
                },
                Ok(SourceStatus::Exhausted) => return StageExit::Exhausted,
                Err(e @ StageError::Recoverable(_)) => self.report(e),
                Err(e @ StageError::Fatal(_)) => {
                    self.report(e);
                    return StageExit::Fatal;
                }
            }
        }
    }

    fn run_processor(
        &mut self,
        stage: &mut dyn Stage,
        mut inputs: Vec<(String, Receiver<Chunk>)>,
    ) -> StageExit {
        if inputs.is_empty() {
            // Nothing connected; idle until stopped.
            self.stop_rx.recv().ok();
            return StageExit::Stopped;
        }

        enum Event {
            Stop,
            Chunk(usize, Chunk),
            Closed(usize),
        }

        let mut outbox = Outbox::new();
        loop {
            let event = {
                let mut sel = Select::new();
                sel.recv(&self.stop_rx);
                for (_, rx) in &inputs {
                    sel.recv(rx);
                }
                let op = sel.select();
                match op.index() {
                    0 => {
                        op.recv(&self.stop_rx).ok();
                        Event::Stop
                    }
                    i => match op.recv(&inputs[i - 1].1) {
                        Ok(chunk) => Event::Chunk(i - 1, chunk),
                        Err(_) => Event::Closed(i - 1),
                    },
                }
            };

            match event {
                Event::Stop => return StageExit::Stopped,
                Event::Closed(i) => {
                    let (key, _) = inputs.remove(i);
                    debug!(stage = %self.name, key, "inbound edge closed");
                    if inputs.is_empty() {
                        return StageExit::InputsClosed;
                    }
                }
                Event::Chunk(i, chunk) => {
                    let result = stage.process(&inputs[i].0, chunk, &mut outbox);
                    if let Delivery::Stopped = self.deliver(&mut outbox) {
                        return StageExit::Stopped;
                    }
                    match result {
                        Ok(()) => {}
                        Err(e @ StageError::Recoverable(_)) => self.report(e),
                        Err(e @ StageError::Fatal(_)) => {
                            self.report(e);
                            return StageExit::Fatal;
                        }
                    }
                }
            }
        }
    }

    /// Sends everything in `outbox` to the senders of its key, in order.
    ///
    /// Blocks on full edges (backpressure) unless stopped. Senders whose
    /// receiving side is gone are dropped from the fan-out.
    fn deliver(&mut self, outbox: &mut Outbox) -> Delivery {
        let items: Vec<(String, Chunk)> = outbox.drain().collect();
        for (key, chunk) in items {
            if !self.outputs.contains_key(&key) {
                let msg = format!("published on undeclared key '{}'", key);
                self.report(StageError::Recoverable(msg));
                continue;
            }

            let mut index = 0;
            loop {
                let Some(senders) = self.outputs.get(&key) else {
                    break;
                };
                let Some(tx) = senders.get(index) else {
                    break;
                };

                let sent = {
                    let mut sel = Select::new();
                    let send_index = sel.send(tx);
                    sel.recv(&self.stop_rx);
                    let op = sel.select();
                    if op.index() == send_index {
                        Some(op.send(tx, chunk.clone()).is_ok())
                    } else {
                        op.recv(&self.stop_rx).ok();
                        None
                    }
                };

                match sent {
                    None => return Delivery::Stopped,
                    Some(true) => index += 1,
                    Some(false) => {
                        if let Some(senders) = self.outputs.get_mut(&key) {
                            senders.remove(index);
                        }
                        debug!(stage = %self.name, key, "receiver gone, pruning edge");
                    }
                }
            }
        }
        Delivery::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::edge::Endpoint;
    use crate::board::network::LoopbackNetwork;
    use crate::board::stage::LogReporter;
    use crate::continuity::Continuity;
    use crossbeam_channel::unbounded;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    struct Doubler {
        shutdown_called: Arc<AtomicBool>,
    }

    impl Stage for Doubler {
        fn keys(&self) -> StageKeys {
            StageKeys::new(["in"], ["out"])
        }

        fn process(&mut self, _key: &str, chunk: Chunk, outbox: &mut Outbox) -> std::result::Result<(), StageError> {
            let value = chunk.payload_as::<i32>().copied().unwrap_or_default();
            outbox.publish("out", Chunk::new(value * 2, chunk.continuity(), chunk.sequence()));
            Ok(())
        }

        fn shutdown(&mut self) {
            self.shutdown_called.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct CollectingReporter {
        errors: Mutex<Vec<(String, String)>>,
    }

    impl ErrorReporter for CollectingReporter {
        fn report(&self, stage: &str, error: &StageError) {
            self.errors
                .lock()
                .unwrap()
                .push((stage.to_string(), error.to_string()));
        }
    }

    fn wiring(
        inputs: Vec<(String, Receiver<Chunk>)>,
        outputs: Vec<(&str, Vec<Sender<Chunk>>)>,
    ) -> StageWiring {
        StageWiring {
            inputs,
            network_inputs: Vec::new(),
            outputs: outputs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            transport: Arc::new(LoopbackNetwork::default()),
            rise: RisePolicy::default(),
        }
    }

    fn wait_finished(runner: &StageRunner) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !runner.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(runner.is_finished(), "stage '{}' did not finish", runner.name());
    }

    #[test]
    fn test_processor_runs_until_inputs_close() {
        let (in_tx, in_rx) = bounded(4);
        let (out_tx, out_rx) = unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));

        let runner = StageRunner::spawn(
            "doubler",
            Box::new(Doubler {
                shutdown_called: shutdown.clone(),
            }),
            wiring(vec![("in".to_string(), in_rx)], vec![("out", vec![out_tx])]),
            Arc::new(LogReporter),
        )
        .unwrap();

        in_tx.send(Chunk::new(1_i32, Continuity::NewFile, 0)).unwrap();
        in_tx.send(Chunk::new(5_i32, Continuity::Last, 1)).unwrap();
        drop(in_tx);

        let results: Vec<_> = out_rx
            .iter()
            .map(|c| (*c.payload_as::<i32>().unwrap(), c.continuity()))
            .collect();
        assert_eq!(results, vec![(2, Continuity::NewFile), (10, Continuity::Last)]);

        wait_finished(&runner);
        assert!(shutdown.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (_in_tx, in_rx) = bounded::<Chunk>(1);
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut runner = StageRunner::spawn(
            "doubler",
            Box::new(Doubler {
                shutdown_called: shutdown.clone(),
            }),
            wiring(vec![("in".to_string(), in_rx)], vec![("out", vec![])]),
            Arc::new(LogReporter),
        )
        .unwrap();

        assert!(!runner.is_stop_signalled());
        assert!(runner.stop());
        assert!(!runner.stop());
        assert!(runner.is_stop_signalled());

        wait_finished(&runner);
        assert!(shutdown.load(Ordering::SeqCst));
        runner.take_thread().unwrap().join().unwrap();
        assert!(runner.is_finished());
    }

    #[test]
    fn test_stop_interrupts_blocked_send() {
        let (in_tx, in_rx) = bounded(4);
        // Rendezvous channel nobody reads: delivery blocks.
        let (out_tx, _out_rx) = bounded(0);
        let mut runner = StageRunner::spawn(
            "doubler",
            Box::new(Doubler {
                shutdown_called: Arc::new(AtomicBool::new(false)),
            }),
            wiring(vec![("in".to_string(), in_rx)], vec![("out", vec![out_tx])]),
            Arc::new(LogReporter),
        )
        .unwrap();

        in_tx.send(Chunk::new(1_i32, Continuity::NewFile, 0)).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(!runner.is_finished());

        runner.stop();
        wait_finished(&runner);
    }

    #[test]
    fn test_dropped_receiver_is_pruned_from_fan_out() {
        let (in_tx, in_rx) = bounded(4);
        let (gone_tx, gone_rx) = bounded(1);
        let (kept_tx, kept_rx) = unbounded();
        drop(gone_rx);

        let runner = StageRunner::spawn(
            "doubler",
            Box::new(Doubler {
                shutdown_called: Arc::new(AtomicBool::new(false)),
            }),
            wiring(
                vec![("in".to_string(), in_rx)],
                vec![("out", vec![gone_tx, kept_tx])],
            ),
            Arc::new(LogReporter),
        )
        .unwrap();

        for i in 0..3 {
            in_tx.send(Chunk::new(i, Continuity::WithPrevious, i as u64)).unwrap();
        }
        drop(in_tx);

        assert_eq!(kept_rx.iter().count(), 3);
        wait_finished(&runner);
    }

    struct Counter {
        remaining: u64,
        next: u64,
    }

    impl Stage for Counter {
        fn keys(&self) -> StageKeys {
            StageKeys::source(["n"])
        }

        fn generate(&mut self, outbox: &mut Outbox) -> std::result::Result<SourceStatus, StageError> {
            if self.remaining == 0 {
                return Ok(SourceStatus::Exhausted);
            }
            self.remaining -= 1;
            let continuity = if self.remaining == 0 {
                Continuity::Last
            } else {
                Continuity::WithPrevious
            };
            outbox.publish("n", Chunk::marker(continuity, self.next));
            self.next += 1;
            Ok(SourceStatus::Continue)
        }
    }

    #[test]
    fn test_source_runs_until_exhausted_and_closes_outputs() {
        let (tx, rx) = unbounded();
        let runner = StageRunner::spawn(
            "counter",
            Box::new(Counter {
                remaining: 4,
                next: 0,
            }),
            wiring(Vec::new(), vec![("n", vec![tx])]),
            Arc::new(LogReporter),
        )
        .unwrap();

        let seqs: Vec<u64> = rx.iter().map(|c| c.sequence()).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
        wait_finished(&runner);
    }

    struct Paced;

    impl Stage for Paced {
        fn keys(&self) -> StageKeys {
            StageKeys::source(["tick"])
        }

        fn generate(&mut self, outbox: &mut Outbox) -> std::result::Result<SourceStatus, StageError> {
            outbox.publish("tick", Chunk::marker(Continuity::WithPrevious, 0));
            Ok(SourceStatus::WaitFor(Duration::from_secs(60)))
        }
    }

    #[test]
    fn test_stop_interrupts_source_pacing() {
        let (tx, rx) = unbounded();
        let mut runner = StageRunner::spawn(
            "paced",
            Box::new(Paced),
            wiring(Vec::new(), vec![("tick", vec![tx])]),
            Arc::new(LogReporter),
        )
        .unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
        runner.stop();
        wait_finished(&runner);
    }

    struct Misbehaving;

    impl Stage for Misbehaving {
        fn keys(&self) -> StageKeys {
            StageKeys::new(["in"], ["out"])
        }

        fn process(&mut self, _key: &str, chunk: Chunk, outbox: &mut Outbox) -> std::result::Result<(), StageError> {
            match chunk.sequence() {
                0 => {
                    outbox.publish("bogus", chunk);
                    Ok(())
                }
                1 => Err(StageError::Recoverable("skipped".to_string())),
                _ => Err(StageError::Fatal("broken".to_string())),
            }
        }
    }

    #[test]
    fn test_errors_reported_and_fatal_stops_stage() {
        let (in_tx, in_rx) = bounded(4);
        let (out_tx, out_rx) = unbounded::<Chunk>();
        let reporter = Arc::new(CollectingReporter::default());

        let runner = StageRunner::spawn(
            "misbehaving",
            Box::new(Misbehaving),
            wiring(vec![("in".to_string(), in_rx)], vec![("out", vec![out_tx])]),
            reporter.clone(),
        )
        .unwrap();

        for seq in 0..3 {
            in_tx.send(Chunk::marker(Continuity::WithPrevious, seq)).unwrap();
        }

        wait_finished(&runner);
        // Output closed without anything delivered
        assert!(out_rx.iter().next().is_none());

        let errors = reporter.errors.lock().unwrap();
        assert_eq!(errors.len(), 3);
        assert!(errors[0].1.contains("undeclared key 'bogus'"));
        assert_eq!(errors[1].1, "Recoverable error: skipped");
        assert_eq!(errors[2].1, "Fatal error: broken");
        assert!(errors.iter().all(|(stage, _)| stage == "misbehaving"));
    }

    #[test]
    fn test_network_input_is_risen_on_stage_thread() {
        let network = Arc::new(LoopbackNetwork::new(4));
        let endpoint = Endpoint::new("127.0.0.1", 6001);
        let publisher = network.publish(&endpoint, "sound").unwrap();
        let (out_tx, out_rx) = unbounded();

        let mut runner = StageRunner::spawn(
            "doubler",
            Box::new(Doubler {
                shutdown_called: Arc::new(AtomicBool::new(false)),
            }),
            StageWiring {
                inputs: Vec::new(),
                network_inputs: vec![NetworkInput {
                    endpoint: endpoint.clone(),
                    sender_key: "sound".to_string(),
                    destination: "doubler".to_string(),
                    destination_key: "in".to_string(),
                }],
                outputs: [("out".to_string(), vec![out_tx])].into_iter().collect(),
                transport: network,
                rise: RisePolicy::default(),
            },
            Arc::new(LogReporter),
        )
        .unwrap();

        publisher.send(Chunk::new(21_i32, Continuity::Last, 0)).unwrap();
        let chunk = out_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(chunk.payload_as::<i32>(), Some(&42));

        runner.stop();
        wait_finished(&runner);
    }
}
