//! Per-copy runtime.
//!
//! Each node copy runs on its own thread inside a [`CopyRuntime`]:
//!
//! 1. wait until every input queue has a schema (upstream init done)
//! 2. `init` the node and fix its output schema on every output queue
//! 3. wait at the run's init barrier; if any copy failed to init, nobody runs
//! 4. call `process_one` until `Done`, a stop, or an error
//! 5. close (or abort) the outputs, `dispose`, publish the terminal state
//!    and report to the supervisor
//!
//! Run-wide coordination lives in [`RunControl`]: the stop flag, the pause
//! gate and the init barrier.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::pipeline::graph::NodeConfig;
use crate::pipeline::id::CopyId;
use crate::pipeline::node::{Flow, InitContext, InputInfo, NodeImpl, RowIo, MAX_REJECTED};
use crate::pipeline::queue::RowQueue;
use crate::pipeline::status::{CopyState, CopyStatus, RunError};
use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

// ==================== Run control ====================

struct InitBarrier {
    pending: usize,
    failed: bool,
}

/// Stop flag, pause gate and init barrier shared by every copy of a run
pub struct RunControl {
    stopped: AtomicBool,
    paused: Mutex<bool>,
    resumed: Condvar,
    init: Mutex<InitBarrier>,
    init_done: Condvar,
    queues: Vec<Arc<RowQueue>>,
}

impl RunControl {
    pub fn new(copies: usize, queues: Vec<Arc<RowQueue>>) -> Self {
        Self {
            stopped: AtomicBool::new(false),
            paused: Mutex::new(false),
            resumed: Condvar::new(),
            init: Mutex::new(InitBarrier {
                pending: copies,
                failed: false,
            }),
            init_done: Condvar::new(),
            queues,
        }
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop every copy: set the flag, open the pause gate, release the init
    /// barrier and abort every queue so blocked `put`/`get` calls return.
    ///
    /// Returns `false` if the run was already stopping.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.resume();
        self.fail_init();
        for queue in &self.queues {
            queue.abort();
        }
        true
    }

    pub fn pause(&self) {
        *self.paused.lock() = true;
    }

    pub fn resume(&self) {
        *self.paused.lock() = false;
        self.resumed.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.lock()
    }

    /// Block while the run is paused and not stopping.
    pub fn wait_if_paused(&self) {
        let mut paused = self.paused.lock();
        while *paused && !self.is_stopped() {
            self.resumed.wait(&mut paused);
        }
    }

    /// Report a successful init and wait for every other copy.
    ///
    /// Returns `false` if some copy failed to initialise or the run was
    /// stopped meanwhile.
    pub fn init_succeeded(&self) -> bool {
        let mut barrier = self.init.lock();
        barrier.pending = barrier.pending.saturating_sub(1);
        if barrier.pending == 0 {
            self.init_done.notify_all();
        }
        while barrier.pending > 0 && !barrier.failed {
            self.init_done.wait(&mut barrier);
        }
        !barrier.failed && !self.is_stopped()
    }

    /// Release the init barrier with a failure.
    pub fn fail_init(&self) {
        let mut barrier = self.init.lock();
        barrier.failed = true;
        drop(barrier);
        self.init_done.notify_all();
    }
}

/// Cloneable handle for checking the run's stop flag outside a node call,
/// e.g. from a socket read loop.
#[derive(Clone)]
pub struct StopSignal(Arc<RunControl>);

impl StopSignal {
    pub fn new(control: Arc<RunControl>) -> Self {
        Self(control)
    }

    pub fn is_stopped(&self) -> bool {
        self.0.is_stopped()
    }
}

impl std::fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StopSignal").field(&self.is_stopped()).finish()
    }
}

// ==================== Shared copy state ====================

/// Counters and state of one copy, readable from any thread
pub struct CopyShared {
    pub node: String,
    pub copy: usize,
    pub partition_id: Option<String>,
    state: AtomicU8,
    disposed: AtomicBool,
    pub rows_read: AtomicU64,
    pub rows_written: AtomicU64,
    pub rows_rejected: AtomicU64,
    pub rows_skipped: AtomicU64,
    pub errors: AtomicU64,
    last_checkpoint: Mutex<Option<DateTime<Utc>>>,
    inputs: Vec<Arc<RowQueue>>,
    outputs: Vec<Arc<RowQueue>>,
}

impl CopyShared {
    pub fn new(
        node: impl Into<String>,
        copy: usize,
        partition_id: Option<String>,
        inputs: Vec<Arc<RowQueue>>,
        outputs: Vec<Arc<RowQueue>>,
    ) -> Self {
        Self {
            node: node.into(),
            copy,
            partition_id,
            state: AtomicU8::new(CopyState::Created as u8),
            disposed: AtomicBool::new(false),
            rows_read: AtomicU64::new(0),
            rows_written: AtomicU64::new(0),
            rows_rejected: AtomicU64::new(0),
            rows_skipped: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_checkpoint: Mutex::new(None),
            inputs,
            outputs,
        }
    }

    pub fn state(&self) -> CopyState {
        CopyState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: CopyState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> CopyStatus {
        CopyStatus {
            node: self.node.clone(),
            copy: self.copy,
            partition_id: self.partition_id.clone(),
            state: self.state(),
            disposed: self.is_disposed(),
            rows_read: self.rows_read.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            rows_rejected: self.rows_rejected.load(Ordering::Relaxed),
            rows_skipped: self.rows_skipped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            input_buffered: self.inputs.iter().map(|q| q.size()).sum(),
            output_buffered: self.outputs.iter().map(|q| q.size()).sum(),
            last_checkpoint: *self.last_checkpoint.lock(),
        }
    }
}

// ==================== Supervisor events ====================

/// What a copy (or a transport pump) tells the supervisor
#[derive(Debug)]
pub enum CopyEvent {
    /// Something failed; the run must stop
    Failed(RunError),
    /// A copy left its thread in the given state
    Exited { copy: CopyId, state: CopyState },
}

// ==================== Copy runtime ====================

enum Outcome {
    Done,
    Stopped,
    Failed(RunError),
}

/// Drives one copy of a node through its lifecycle
pub struct CopyRuntime {
    pub id: CopyId,
    node: Box<dyn NodeImpl>,
    io: RowIo,
    shared: Arc<CopyShared>,
    control: Arc<RunControl>,
    events: Sender<CopyEvent>,
    config: Arc<NodeConfig>,
    engine: Arc<EngineConfig>,
    copies: usize,
    input_names: Vec<String>,
    output_names: Vec<String>,
    /// `init` was called, so `dispose` is owed
    initialized: bool,
}

impl CopyRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: CopyId,
        node: Box<dyn NodeImpl>,
        io: RowIo,
        shared: Arc<CopyShared>,
        control: Arc<RunControl>,
        events: Sender<CopyEvent>,
        config: Arc<NodeConfig>,
        engine: Arc<EngineConfig>,
        copies: usize,
        input_names: Vec<String>,
        output_names: Vec<String>,
    ) -> Self {
        Self {
            id,
            node,
            io,
            shared,
            control,
            events,
            config,
            engine,
            copies,
            input_names,
            output_names,
            initialized: false,
        }
    }

    pub fn name(&self) -> String {
        format!("{}.{}", self.shared.node, self.shared.copy)
    }

    /// Run the whole lifecycle on the current thread.
    pub fn run(mut self) {
        let span = tracing::info_span!("copy", node = %self.shared.node, copy = self.shared.copy);
        let _enter = span.enter();

        let state = match self.initialize() {
            Ok(true) => {
                self.shared.set_state(CopyState::Running);
                tracing::debug!("Running");
                let outcome = self.run_loop();
                self.finish(outcome)
            }
            Ok(false) => {
                self.abort_outputs();
                CopyState::Stopped
            }
            Err(error) => {
                self.control.fail_init();
                self.fail(error);
                CopyState::Errored
            }
        };

        // Terminal only once dispose has had its say
        let state = self.dispose(state);
        self.shared.set_state(state);
        let _ = self.events.send(CopyEvent::Exited {
            copy: self.id,
            state,
        });
    }

    /// Steps 1 to 3. `Ok(false)` means the run went away before we could start.
    fn initialize(&mut self) -> std::result::Result<bool, RunError> {
        let mut inputs = Vec::with_capacity(self.input_names.len());
        let queues: Vec<_> = self.io.input_queues().cloned().collect();
        for (queue, from) in queues.iter().zip(&self.input_names) {
            match queue.wait_schema() {
                Some(schema) => inputs.push(InputInfo {
                    from: from.clone(),
                    schema,
                }),
                None => {
                    tracing::debug!("Input {} ended before init", queue.name());
                    return Ok(false);
                }
            }
        }

        let ctx = InitContext {
            node: &self.shared.node,
            copy: self.shared.copy,
            copies: self.copies,
            partition_id: self.shared.partition_id.as_deref(),
            config: &self.config,
            engine: &self.engine,
            inputs: &inputs,
            outputs: &self.output_names,
            stop: StopSignal::new(self.control.clone()),
        };
        self.initialized = true;
        let node = &mut self.node;
        let schema = match catch_unwind(AssertUnwindSafe(|| node.init(&ctx))) {
            Ok(Ok(schema)) => schema,
            Ok(Err(e)) if self.control.is_stopped() => {
                tracing::debug!("Init interrupted by stop: {}", e);
                return Ok(false);
            }
            Ok(Err(e)) => return Err(self.error(&e)),
            Err(payload) => return Err(self.panic(payload)),
        };

        if self.io.has_outputs() {
            let schema = schema.as_ref().ok_or_else(|| {
                self.error(&EngineError::node(
                    &self.shared.node,
                    self.shared.copy,
                    "node has outputs but declared no output schema",
                ))
            })?;
            // A row without fields has no frame on a socket edge
            if schema.is_empty() {
                return Err(self.error(&EngineError::node(
                    &self.shared.node,
                    self.shared.copy,
                    "node declared an output schema without fields",
                )));
            }
            for queue in self.io.data_queues() {
                queue.set_schema(schema.clone()).map_err(|e| self.error(&e))?;
            }
        }

        // Rejected rows keep the layout they arrived with
        let max_rejected = self
            .config
            .count_or(MAX_REJECTED, 0)
            .map_err(|e| self.error(&e))?;
        let base = inputs.first().map(|i| &i.schema).or(schema.as_ref());
        if let Err(e) = self.io.prepare_rejects(base, max_rejected) {
            return Err(self.error(&e));
        }

        self.shared.set_state(CopyState::Initialized);
        tracing::debug!("Initialized");
        Ok(self.control.init_succeeded())
    }

    fn run_loop(&mut self) -> Outcome {
        let interval = self.engine.checkpoint_interval.max(1);
        let mut next_checkpoint = interval;

        loop {
            if self.control.is_stopped() {
                return Outcome::Stopped;
            }
            self.control.wait_if_paused();
            if self.control.is_stopped() {
                return Outcome::Stopped;
            }

            let node = &mut self.node;
            let io = &mut self.io;
            match catch_unwind(AssertUnwindSafe(|| node.process_one(io))) {
                Ok(Ok(Flow::Continue)) => {}
                Ok(Ok(Flow::Done)) => return Outcome::Done,
                // Errors caused by the teardown itself are not failures
                Ok(Err(e))
                    if self.control.is_stopped()
                        || (e.is_queue_closed() && self.downstream_gone()) =>
                {
                    tracing::debug!("Interrupted: {}", e);
                    return Outcome::Stopped;
                }
                Ok(Err(e)) => return Outcome::Failed(self.error(&e)),
                Err(payload) => return Outcome::Failed(self.panic(payload)),
            }

            let processed = self
                .shared
                .rows_read
                .load(Ordering::Relaxed)
                .max(self.shared.rows_written.load(Ordering::Relaxed));
            if processed >= next_checkpoint {
                self.checkpoint();
                next_checkpoint = (processed / interval + 1) * interval;
            }
        }
    }

    fn checkpoint(&self) {
        *self.shared.last_checkpoint.lock() = Some(Utc::now());
        tracing::info!(
            "Checkpoint: read={}, written={}, rejected={}",
            self.shared.rows_read.load(Ordering::Relaxed),
            self.shared.rows_written.load(Ordering::Relaxed),
            self.shared.rows_rejected.load(Ordering::Relaxed),
        );
    }

    fn finish(&mut self, outcome: Outcome) -> CopyState {
        match outcome {
            Outcome::Done if !self.control.is_stopped() && !self.upstream_aborted() => {
                for queue in self.io.output_queues() {
                    queue.close();
                }
                tracing::info!(
                    "Finished: read={}, written={}",
                    self.shared.rows_read.load(Ordering::Relaxed),
                    self.shared.rows_written.load(Ordering::Relaxed),
                );
                CopyState::Finished
            }
            Outcome::Done | Outcome::Stopped => {
                self.node.stop_running();
                self.abort_outputs();
                tracing::warn!("Stopped");
                CopyState::Stopped
            }
            Outcome::Failed(error) => {
                self.fail(error);
                CopyState::Errored
            }
        }
    }

    fn dispose(&mut self, state: CopyState) -> CopyState {
        if !self.initialized {
            return state;
        }
        let node = &mut self.node;
        let result = match catch_unwind(AssertUnwindSafe(|| node.dispose())) {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(self.error(&e)),
            Err(payload) => Some(self.panic(payload)),
        };
        self.shared.disposed.store(true, Ordering::Release);
        match result {
            None => state,
            Some(error) => {
                self.fail(error);
                CopyState::Errored
            }
        }
    }

    /// Record the failure, stop reading and abort everything downstream.
    fn fail(&mut self, error: RunError) {
        self.shared.errors.fetch_add(1, Ordering::Relaxed);
        tracing::error!("{}", error.message);
        let _ = self.events.send(CopyEvent::Failed(error));
        self.abort_outputs();
    }

    fn abort_outputs(&self) {
        for queue in self.io.output_queues() {
            queue.abort();
        }
    }

    /// A put failed because the run is stopping or a consumer went away.
    fn downstream_gone(&self) -> bool {
        self.control.is_stopped() || self.io.output_queues().any(|q| q.is_aborted())
    }

    fn upstream_aborted(&self) -> bool {
        self.io.input_queues().any(|q| q.is_aborted())
    }

    fn error(&self, err: &EngineError) -> RunError {
        RunError::from_engine(&self.shared.node, self.shared.copy, err)
    }

    fn panic(&self, payload: Box<dyn std::any::Any + Send>) -> RunError {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        RunError::panic(
            &self.shared.node,
            self.shared.copy,
            format!("panic in node: {msg}"),
        )
    }
}
