//! Scheduler and runs.
//!
//! [`Scheduler::prepare`] validates a graph and builds everything a run
//! needs (queues, routers, node instances, socket pairs) without starting a
//! single thread. [`Run::start`] then spawns:
//!
//! ```text
//! one thread per node copy ──► CopyRuntime::run
//! two threads per socket queue ──► send_queue / receive_queue
//! one supervisor ──► collects CopyEvents, fail-fast, joins every worker
//! ```
//!
//! Every `Run` method takes `&self`, so a run can be shared (e.g. in an
//! `Arc`) between the thread that waits for it and the one that controls it.

use super::compiled_plan::{CompiledPlan, EdgeLayout, PlannedNode};
use super::compiler::GraphCompiler;
use super::graph::{EdgeTransport, Graph};
use super::id::{CopyId, EdgeId};
use super::node::{Input, RowIo};
use super::partition::{OutputGroup, OutputRouter};
use super::queue::{ReadySignal, RowQueue};
use super::registry::NodeRegistry;
use super::runtime::{CopyEvent, CopyRuntime, CopyShared, RunControl, StopSignal};
use super::status::{CopyState, RunError, RunState, RunStatus};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::transport::pump::{loopback_pair, receive_queue, send_queue};
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

// ==================== Scheduler ====================

/// Turns graph definitions into runs.
///
/// Holds the node registry and an engine config; each prepared run takes its
/// own snapshot of the config.
#[derive(Debug, Clone)]
pub struct Scheduler {
    registry: NodeRegistry,
    config: EngineConfig,
}

/// The queues of one edge. For local edges both sides are the same queue.
struct EdgeQueues {
    /// Written by source copies
    producer: Vec<Arc<RowQueue>>,
    /// Read by target copies
    consumer: Vec<Arc<RowQueue>>,
}

/// Both ends of one socket queue, waiting for `Run::start`
struct PumpPlan {
    label: String,
    producer: Arc<RowQueue>,
    consumer: Arc<RowQueue>,
    send: TcpStream,
    receive: TcpStream,
}

impl Scheduler {
    pub fn new(registry: NodeRegistry, config: EngineConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate `graph` and build a run for it.
    ///
    /// On error nothing has been started and everything allocated so far is
    /// dropped.
    pub fn prepare(&self, graph: &Graph) -> Result<Run> {
        self.config.validate()?;
        let plan = GraphCompiler::compile(graph, &self.registry, self.config.queue_capacity)?;
        let engine = Arc::new(self.config.clone());

        let mut pumps = Vec::new();
        let edges = plan
            .edges
            .iter()
            .map(|edge| {
                let from = plan.node(edge.from);
                let to = plan.node(edge.to);
                let mut queues = EdgeQueues {
                    producer: Vec::new(),
                    consumer: Vec::new(),
                };
                for (i, j) in queue_pairs(edge.layout, from.copies, to.copies) {
                    let name = format!("{}.{} - {}.{}", from.name, i, to.name, j);
                    let consumer = Arc::new(RowQueue::new(name.clone(), edge.capacity));
                    let producer = match edge.transport {
                        EdgeTransport::Local => consumer.clone(),
                        EdgeTransport::Socket => {
                            let producer = Arc::new(RowQueue::new(
                                format!("{} (send)", name),
                                edge.capacity,
                            ));
                            let (send, receive) = loopback_pair()?;
                            pumps.push(PumpPlan {
                                label: name,
                                producer: producer.clone(),
                                consumer: consumer.clone(),
                                send,
                                receive,
                            });
                            producer
                        }
                    };
                    queues.producer.push(producer);
                    queues.consumer.push(consumer);
                }
                Ok(queues)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut all_queues: Vec<Arc<RowQueue>> = Vec::new();
        for queues in &edges {
            all_queues.extend(queues.consumer.iter().cloned());
            for producer in &queues.producer {
                if !queues.consumer.iter().any(|c| Arc::ptr_eq(c, producer)) {
                    all_queues.push(producer.clone());
                }
            }
        }

        let control = Arc::new(RunControl::new(plan.stats.copies, all_queues));
        let (events_tx, events_rx) = crossbeam_channel::unbounded();

        let mut runtimes = Vec::with_capacity(plan.stats.copies);
        let mut shared = Vec::with_capacity(plan.stats.copies);
        for &node_id in &plan.order {
            let node = plan.node(node_id);
            for copy in 0..node.copies {
                let (inputs, input_names) = Self::inputs_of(&plan, &edges, node, copy);
                let ready = (inputs.len() > 1).then(|| {
                    let signal = Arc::new(ReadySignal::new());
                    for input in &inputs {
                        input.queue.watch(signal.clone());
                    }
                    signal
                });
                let router = Self::router_of(&plan, &edges, node, copy);
                let rejects = node
                    .outputs
                    .iter()
                    .find(|&&e| plan.edge(e).error)
                    .map(|&e| Self::group_of(&plan, &edges, e, copy));
                let output_names = node
                    .outputs
                    .iter()
                    .filter(|&&e| !plan.edge(e).error)
                    .map(|&e| plan.node(plan.edge(e).to).name.clone())
                    .collect();

                let copy_shared = Arc::new(CopyShared::new(
                    node.name.clone(),
                    copy,
                    node.partition_id(copy).map(str::to_string),
                    inputs.iter().map(|i| i.queue.clone()).collect(),
                    router
                        .all_queues()
                        .chain(rejects.iter().flat_map(|g| g.queues().iter()))
                        .cloned()
                        .collect(),
                ));
                let io = RowIo::new(
                    inputs,
                    router,
                    rejects,
                    ready,
                    copy_shared.clone(),
                    control.clone(),
                    engine.read_poll_interval(),
                );
                let implementation = self.registry.create(&node.name, &node.node_type)?;

                runtimes.push(CopyRuntime::new(
                    CopyId::new(node.id, copy as u16),
                    implementation,
                    io,
                    copy_shared.clone(),
                    control.clone(),
                    events_tx.clone(),
                    node.config.clone(),
                    engine.clone(),
                    node.copies,
                    input_names,
                    output_names,
                ));
                shared.push((CopyId::new(node.id, copy as u16), copy_shared));
            }
        }

        tracing::info!(
            "Prepared run '{}': {} copies, {} queues, {} socket links",
            plan.name,
            plan.stats.copies,
            plan.stats.queues,
            pumps.len()
        );

        Ok(Run {
            log: Arc::new(RunLog::new(engine.logging.history)),
            plan,
            control,
            shared,
            supervision: Arc::new(Mutex::new(Supervision::default())),
            pending: Mutex::new(Some(Pending {
                runtimes,
                pumps,
                events_tx,
                events_rx,
            })),
            supervisor: Mutex::new(None),
            started_at: Mutex::new(None),
        })
    }

    /// Input queues of one copy, each paired with its upstream node name.
    fn inputs_of(
        plan: &CompiledPlan,
        edges: &[EdgeQueues],
        node: &PlannedNode,
        copy: usize,
    ) -> (Vec<Input>, Vec<String>) {
        let mut inputs = Vec::new();
        let mut names = Vec::new();
        for &edge_id in &node.inputs {
            let edge = plan.edge(edge_id);
            let from = plan.node(edge.from);
            let queues = &edges[edge_id.index()].consumer;
            let indexes: Vec<usize> = match edge.layout {
                EdgeLayout::Aligned => vec![copy],
                EdgeLayout::Full => (0..from.copies).map(|i| i * node.copies + copy).collect(),
            };
            for index in indexes {
                if let Some(queue) = queues.get(index) {
                    inputs.push(Input {
                        from: from.name.clone(),
                        queue: queue.clone(),
                        open: true,
                    });
                    names.push(from.name.clone());
                }
            }
        }
        (inputs, names)
    }

    /// Output router of one copy: one group per regular outgoing edge.
    fn router_of(
        plan: &CompiledPlan,
        edges: &[EdgeQueues],
        node: &PlannedNode,
        copy: usize,
    ) -> OutputRouter {
        let groups = node
            .outputs
            .iter()
            .filter(|&&edge_id| !plan.edge(edge_id).error)
            .map(|&edge_id| Self::group_of(plan, edges, edge_id, copy))
            .collect();
        OutputRouter::new(groups, node.distribution)
    }

    /// Queues of one outgoing edge owned by source copy `copy`.
    fn group_of(
        plan: &CompiledPlan,
        edges: &[EdgeQueues],
        edge_id: EdgeId,
        copy: usize,
    ) -> OutputGroup {
        let edge = plan.edge(edge_id);
        let to = plan.node(edge.to);
        let queues = &edges[edge_id.index()].producer;
        let selected: Vec<Arc<RowQueue>> = match edge.layout {
            EdgeLayout::Aligned => queues.get(copy).cloned().into_iter().collect(),
            EdgeLayout::Full => queues
                .iter()
                .skip(copy * to.copies)
                .take(to.copies)
                .cloned()
                .collect(),
        };
        let group = OutputGroup::new(to.id, to.name.clone(), selected);
        match &to.scheme {
            Some(scheme) => group.partitioned(scheme.clone()),
            None => group,
        }
    }
}

/// `(source copy, target copy)` of every queue of an edge, in queue order.
fn queue_pairs(layout: EdgeLayout, from: usize, to: usize) -> Vec<(usize, usize)> {
    match layout {
        EdgeLayout::Aligned => (0..from).map(|i| (i, i)).collect(),
        EdgeLayout::Full => (0..from)
            .flat_map(|i| (0..to).map(move |j| (i, j)))
            .collect(),
    }
}

// ==================== Run ====================

/// Everything `start` consumes
struct Pending {
    runtimes: Vec<CopyRuntime>,
    pumps: Vec<PumpPlan>,
    events_tx: Sender<CopyEvent>,
    events_rx: Receiver<CopyEvent>,
}

#[derive(Default)]
struct Supervision {
    first_error: Option<RunError>,
    errors: usize,
    finished: bool,
}

/// Bounded history of lifecycle lines for one run
pub struct RunLog {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl RunLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    pub fn push(&self, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(format!("{} {}", Utc::now().format("%H:%M:%S%.3f"), line.into()));
    }

    /// Oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }
}

/// One execution of a graph. Not reusable.
pub struct Run {
    plan: CompiledPlan,
    control: Arc<RunControl>,
    shared: Vec<(CopyId, Arc<CopyShared>)>,
    supervision: Arc<Mutex<Supervision>>,
    log: Arc<RunLog>,
    pending: Mutex<Option<Pending>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl Run {
    pub fn name(&self) -> &str {
        &self.plan.name
    }

    pub fn plan(&self) -> &CompiledPlan {
        &self.plan
    }

    /// Spawn every copy, pump and the supervisor.
    ///
    /// Fails if the run was already started or stopped, or if the OS refuses
    /// a thread; in the latter case the threads already spawned are stopped.
    pub fn start(&self) -> Result<()> {
        let pending = self
            .pending
            .lock()
            .take()
            .ok_or_else(|| {
                EngineError::RunState(format!("run '{}' was already started", self.name()))
            })?;
        if self.control.is_stopped() {
            return Err(EngineError::RunState(format!(
                "run '{}' was stopped before it started",
                self.name()
            )));
        }
        *self.started_at.lock() = Some(Utc::now());
        self.log.push("Run started");
        tracing::info!("Starting run '{}'", self.name());

        let Pending {
            runtimes,
            pumps,
            events_tx,
            events_rx,
        } = pending;

        let mut workers = Vec::with_capacity(runtimes.len() + pumps.len() * 2);
        let spawned = self.spawn_all(runtimes, pumps, &events_tx, &mut workers);
        drop(events_tx);

        let supervisor = {
            let control = self.control.clone();
            let supervision = self.supervision.clone();
            let log = self.log.clone();
            let shared = self.shared.clone();
            let name = self.name().to_string();
            thread::Builder::new()
                .name(format!("{} supervisor", name))
                .spawn(move || {
                    supervise(name, events_rx, workers, control, supervision, log, shared)
                })
        };

        match supervisor {
            Ok(handle) => {
                *self.supervisor.lock() = Some(handle);
                spawned
            }
            Err(e) => {
                self.control.stop();
                self.supervision.lock().finished = true;
                Err(EngineError::Io(e))
            }
        }
    }

    fn spawn_all(
        &self,
        runtimes: Vec<CopyRuntime>,
        pumps: Vec<PumpPlan>,
        events: &Sender<CopyEvent>,
        workers: &mut Vec<(String, JoinHandle<()>)>,
    ) -> Result<()> {
        for pump in pumps {
            let PumpPlan {
                label,
                producer,
                consumer,
                send,
                receive,
            } = pump;

            let sender = {
                let label = label.clone();
                let events = events.clone();
                let control = self.control.clone();
                move || {
                    let stop = StopSignal::new(control.clone());
                    if let Err(e) = send_queue(producer.clone(), send, stop) {
                        report_pump(&label, &e, &control, &events);
                        producer.abort();
                    }
                }
            };
            self.spawn_worker(format!("{} send", label), sender, workers)?;

            let receiver = {
                let label = label.clone();
                let events = events.clone();
                let control = self.control.clone();
                move || {
                    let stop = StopSignal::new(control.clone());
                    if let Err(e) = receive_queue(receive, consumer.clone(), stop) {
                        report_pump(&label, &e, &control, &events);
                        consumer.abort();
                    }
                }
            };
            self.spawn_worker(format!("{} recv", label), receiver, workers)?;
        }

        for runtime in runtimes {
            self.spawn_worker(runtime.name(), move || runtime.run(), workers)?;
        }
        Ok(())
    }

    fn spawn_worker<F>(
        &self,
        name: String,
        job: F,
        workers: &mut Vec<(String, JoinHandle<()>)>,
    ) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        match thread::Builder::new().name(name.clone()).spawn(job) {
            Ok(handle) => {
                workers.push((name, handle));
                Ok(())
            }
            Err(e) => {
                self.control.stop();
                Err(EngineError::Io(e).with_context(format!("spawning {}", name)))
            }
        }
    }

    /// Block until every copy, pump and the supervisor has exited.
    ///
    /// Returns immediately for a run that was never started. Never fails;
    /// inspect [`Run::status`] for the outcome.
    pub fn wait_until_finished(&self) {
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("Supervisor of run '{}' panicked", self.name());
            }
        }
    }

    /// Ask every copy to stop. Returns at once; use
    /// [`Run::wait_until_finished`] to wait for the teardown.
    pub fn stop(&self) {
        if self.control.stop() {
            tracing::warn!("Stopping run '{}'", self.name());
            self.log.push("Stop requested");
        }
    }

    pub fn pause(&self) {
        self.control.pause();
        self.log.push("Paused");
        tracing::info!("Paused run '{}'", self.name());
    }

    pub fn resume(&self) {
        self.control.resume();
        self.log.push("Resumed");
        tracing::info!("Resumed run '{}'", self.name());
    }

    pub fn is_started(&self) -> bool {
        self.started_at.lock().is_some()
    }

    /// Every worker has exited and been joined.
    pub fn is_finished(&self) -> bool {
        self.supervision.lock().finished
    }

    /// Recent lifecycle lines, oldest first.
    pub fn log_lines(&self) -> Vec<String> {
        self.log.lines()
    }

    pub fn status(&self) -> RunStatus {
        let copies: Vec<_> = self.shared.iter().map(|(_, s)| s.snapshot()).collect();
        let started_at = *self.started_at.lock();
        let (error, joined) = {
            let s = self.supervision.lock();
            (s.first_error.clone(), s.finished)
        };

        // Finished and Stopped wait for the supervisor: a pump or a worker
        // can still fail after the last copy exited.
        let all_terminal = joined && copies.iter().all(|c| c.state.is_terminal());
        let state = if started_at.is_none() {
            if self.control.is_stopped() {
                RunState::Stopped
            } else {
                RunState::Waiting
            }
        } else if error.is_some() || copies.iter().any(|c| c.state == CopyState::Errored) {
            RunState::Errored
        } else if all_terminal && self.control.is_stopped() {
            RunState::Stopped
        } else if all_terminal && copies.iter().all(|c| c.state == CopyState::Finished) {
            RunState::Finished
        } else if all_terminal {
            RunState::Stopped
        } else if self.control.is_paused() {
            RunState::Paused
        } else {
            RunState::Running
        };

        RunStatus {
            name: self.plan.name.clone(),
            state,
            copies,
            error,
            started_at,
        }
    }
}

impl Drop for Run {
    /// A run dropped while still executing is stopped and joined.
    fn drop(&mut self) {
        if self.supervisor.lock().is_some() {
            self.control.stop();
            self.wait_until_finished();
        }
    }
}

fn report_pump(label: &str, err: &EngineError, control: &RunControl, events: &Sender<CopyEvent>) {
    if control.is_stopped() {
        tracing::debug!("Link {} closed during stop: {}", label, err);
        return;
    }
    let _ = events.send(CopyEvent::Failed(RunError::from_engine(label, 0, err)));
}

/// Supervisor loop: record errors, fail fast, then join every worker.
fn supervise(
    name: String,
    events: Receiver<CopyEvent>,
    workers: Vec<(String, JoinHandle<()>)>,
    control: Arc<RunControl>,
    supervision: Arc<Mutex<Supervision>>,
    log: Arc<RunLog>,
    shared: Vec<(CopyId, Arc<CopyShared>)>,
) {
    let span = tracing::info_span!("supervisor", run = %name);
    let _enter = span.enter();

    // Ends once every copy and pump has dropped its sender
    for event in events.iter() {
        match event {
            CopyEvent::Failed(error) => {
                log.push(format!("Error in {}", error));
                let first = {
                    let mut s = supervision.lock();
                    s.errors += 1;
                    if s.first_error.is_none() {
                        s.first_error = Some(error.clone());
                        true
                    } else {
                        false
                    }
                };
                if first {
                    tracing::error!("Run failed at {}; stopping all copies", error);
                }
                control.stop();
            }
            CopyEvent::Exited { copy, state } => {
                let line = shared
                    .iter()
                    .find(|(id, _)| *id == copy)
                    .map(|(_, s)| {
                        let c = s.snapshot();
                        format!(
                            "{}.{} {:?} (read={}, written={}, rejected={})",
                            c.node, c.copy, state, c.rows_read, c.rows_written, c.rows_rejected
                        )
                    })
                    .unwrap_or_else(|| format!("{:?} {:?}", copy, state));
                log.push(line);
            }
        }
    }

    for (worker, handle) in workers {
        if handle.join().is_err() {
            tracing::error!("Worker {} panicked outside its node", worker);
            let error = RunError::panic(worker.clone(), 0, "worker thread panicked");
            let mut s = supervision.lock();
            s.errors += 1;
            s.first_error.get_or_insert(error);
            control.stop();
        }
    }

    let errors = {
        let mut s = supervision.lock();
        s.finished = true;
        s.errors
    };
    log.push(format!("Run ended with {} error(s)", errors));
    tracing::info!("Run '{}' ended with {} error(s)", name, errors);
}
