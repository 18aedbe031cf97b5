//! Node contract.
//!
//! A node implementation is a [`NodeImpl`]: it is initialised once per copy
//! with an immutable configuration snapshot and the schemas of its inputs,
//! then driven by the copy runtime one `process_one` call at a time. All row
//! movement goes through [`RowIo`], which hides whether an edge is a local
//! queue, a partitioned fan-out or a socket.
//!
//! Node calls must return in bounded time or poll [`RowIo::is_stopped`]; the
//! runtime only observes stop requests between calls.
//!
//! A node may have one error edge. Rows handed to [`RowIo::reject_row`] go
//! there, extended with the [`ERROR_NODE_FIELD`] and
//! [`ERROR_DESCRIPTION_FIELD`] columns. Every node copy fails once it has
//! rejected more than its [`MAX_REJECTED`] setting.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::pipeline::graph::NodeConfig;
use crate::pipeline::partition::{OutputGroup, OutputRouter, Target};
use crate::pipeline::queue::{Poll, ReadySignal, RowQueue};
use crate::pipeline::runtime::{CopyShared, RunControl, StopSignal};
use crate::row::{FieldMeta, Row, Schema, Value, ValueType};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Node setting: rejected rows a copy tolerates before it fails (0 = any)
pub const MAX_REJECTED: &str = "max_rejected";

/// Name of the rejecting node, appended to rows on an error edge
pub const ERROR_NODE_FIELD: &str = "error_node";

/// Why the row was rejected, appended after [`ERROR_NODE_FIELD`]
pub const ERROR_DESCRIPTION_FIELD: &str = "error_description";

/// Outcome of one `process_one` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Call again
    Continue,
    /// Normal end: the runtime closes every output
    Done,
}

/// Capability every node type provides.
pub trait NodeImpl: Send {
    /// Prepare the copy and declare its output schema.
    ///
    /// Nodes with outgoing edges must return a schema; it is fixed on every
    /// output queue before the run loop starts.
    fn init(&mut self, ctx: &InitContext<'_>) -> Result<Option<Arc<Schema>>>;

    /// Move some rows. An `Err` fails this copy and the whole run.
    fn process_one(&mut self, io: &mut RowIo) -> Result<Flow>;

    /// Release resources. Called once, whatever the outcome.
    fn dispose(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called once when the copy observes a stop request.
    fn stop_running(&mut self) {}
}

/// Upstream side of one input, as seen at init time
#[derive(Debug, Clone)]
pub struct InputInfo {
    /// Name of the upstream node
    pub from: String,
    pub schema: Arc<Schema>,
}

/// Everything a node may look at during `init`
pub struct InitContext<'a> {
    pub node: &'a str,
    pub copy: usize,
    pub copies: usize,
    pub partition_id: Option<&'a str>,
    pub config: &'a NodeConfig,
    pub engine: &'a EngineConfig,
    pub inputs: &'a [InputInfo],
    /// Names of downstream nodes
    pub outputs: &'a [String],
    pub stop: StopSignal,
}

impl<'a> InitContext<'a> {
    /// Schema of the first input.
    pub fn input_schema(&self) -> Option<&Arc<Schema>> {
        self.inputs.first().map(|i| &i.schema)
    }

    /// Schema of the first input, or an error for source nodes.
    pub fn require_input_schema(&self) -> Result<Arc<Schema>> {
        self.input_schema().cloned().ok_or_else(|| {
            EngineError::node(self.node, self.copy, "node needs at least one input")
        })
    }

    /// Schema shared by every input; inputs that disagree are an error.
    pub fn common_input_schema(&self) -> Result<Arc<Schema>> {
        let first = self.require_input_schema()?;
        for input in &self.inputs[1..] {
            if let Some(diff) = first.diff(&input.schema) {
                return Err(EngineError::node(
                    self.node,
                    self.copy,
                    format!("input from '{}' has a different layout: {}", input.from, diff),
                ));
            }
        }
        Ok(first)
    }

    pub fn error(&self, message: impl Into<String>) -> EngineError {
        EngineError::node(self.node, self.copy, message)
    }
}

/// One input queue of a copy
pub(crate) struct Input {
    pub from: String,
    pub queue: Arc<RowQueue>,
    pub open: bool,
}

/// Error edge of a copy
struct Rejects {
    group: OutputGroup,
    /// Fixed at init: the rejected layout plus the error fields
    schema: Option<Arc<Schema>>,
}

/// Read and write functions handed to `process_one`
pub struct RowIo {
    inputs: Vec<Input>,
    cursor: usize,
    router: OutputRouter,
    rejects: Option<Rejects>,
    max_rejected: u64,
    /// Shared by every input queue when there are several
    ready: Option<Arc<ReadySignal>>,
    shared: Arc<CopyShared>,
    control: Arc<RunControl>,
    poll: Duration,
}

impl RowIo {
    pub(crate) fn new(
        inputs: Vec<Input>,
        router: OutputRouter,
        rejects: Option<OutputGroup>,
        ready: Option<Arc<ReadySignal>>,
        shared: Arc<CopyShared>,
        control: Arc<RunControl>,
        poll: Duration,
    ) -> Self {
        Self {
            inputs,
            cursor: 0,
            router,
            rejects: rejects.map(|group| Rejects {
                group,
                schema: None,
            }),
            max_rejected: 0,
            ready,
            shared,
            control,
            poll,
        }
    }

    /// Fix the layout of rejected rows (`base` plus the error fields) on the
    /// error edge, and the rejection limit.
    pub(crate) fn prepare_rejects(
        &mut self,
        base: Option<&Arc<Schema>>,
        max_rejected: u64,
    ) -> Result<()> {
        self.max_rejected = max_rejected;
        let Some(rejects) = self.rejects.as_mut() else {
            return Ok(());
        };
        let base = base.ok_or_else(|| {
            EngineError::node(
                &self.shared.node,
                self.shared.copy,
                "node has an error edge but no row layout to reject",
            )
        })?;
        let schema = Arc::new(
            base.with_field(FieldMeta::new(ERROR_NODE_FIELD, ValueType::String))
                .with_field(FieldMeta::new(ERROR_DESCRIPTION_FIELD, ValueType::String)),
        );
        for queue in rejects.group.queues() {
            queue.set_schema(schema.clone())?;
        }
        rejects.schema = Some(schema);
        Ok(())
    }

    /// Next row from any input, rotating between inputs.
    ///
    /// Returns `None` once every input reached end of stream, or when the
    /// run is stopping.
    pub fn read(&mut self) -> Option<Row> {
        self.read_matching(None)
    }

    /// Next row from the copies of upstream node `from`.
    pub fn read_from(&mut self, from: &str) -> Option<Row> {
        self.read_matching(Some(from))
    }

    fn read_matching(&mut self, from: Option<&str>) -> Option<Row> {
        let wanted = |input: &Input| input.open && from.map_or(true, |f| input.from == f);
        let count = self.inputs.len();

        loop {
            if self.control.is_stopped() {
                return None;
            }
            let open: Vec<usize> = (0..count)
                .map(|k| (self.cursor + k) % count.max(1))
                .filter(|&i| wanted(&self.inputs[i]))
                .collect();

            match open.as_slice() {
                [] => return None,
                [only] => {
                    let only = *only;
                    match self.inputs[only].queue.get() {
                        Some(row) => return Some(self.accepted(row)),
                        None => self.inputs[only].open = false,
                    }
                }
                _ => {
                    // Read before looking so a row arriving meanwhile is not missed
                    let seen = self.ready.as_ref().map(|r| r.generation());
                    for &i in &open {
                        match self.inputs[i].queue.get_timeout(Duration::ZERO) {
                            Poll::Row(row) => {
                                self.cursor = (i + 1) % count;
                                return Some(self.accepted(row));
                            }
                            Poll::Done => self.inputs[i].open = false,
                            Poll::Empty => {}
                        }
                    }
                    // Nothing buffered anywhere: sleep until any input changes
                    match (&self.ready, seen) {
                        (Some(ready), Some(seen)) => {
                            ready.wait_past(seen, self.poll);
                        }
                        _ => {
                            let i = open[0];
                            self.cursor = (i + 1) % count;
                            if !self.inputs[i].open {
                                continue;
                            }
                            match self.inputs[i].queue.get_timeout(self.poll) {
                                Poll::Row(row) => return Some(self.accepted(row)),
                                Poll::Done => self.inputs[i].open = false,
                                Poll::Empty => {}
                            }
                        }
                    }
                }
            }
        }
    }

    fn accepted(&self, row: Row) -> Row {
        self.shared.rows_read.fetch_add(1, Ordering::Relaxed);
        row
    }

    /// Send `row` downstream through the output router.
    pub fn write(&mut self, row: Row) -> Result<()> {
        let deliveries = self.router.route(&row)?;
        self.deliver(deliveries, row)
    }

    /// Send `row` only towards downstream node `to`.
    pub fn write_to(&mut self, to: &str, row: Row) -> Result<()> {
        let group = self
            .router
            .groups()
            .iter()
            .position(|g| g.target_name() == to)
            .ok_or_else(|| EngineError::Row(format!("no output towards '{}'", to)))?;
        let deliveries = self.router.route_to(group, &row)?;
        self.deliver(deliveries, row)
    }

    fn deliver(&mut self, deliveries: Vec<(usize, usize)>, row: Row) -> Result<()> {
        if let Some((&last, rest)) = deliveries.split_last() {
            for &(group, index) in rest {
                self.output(group, index)?.put(row.clone())?;
            }
            self.output(last.0, last.1)?.put(row)?;
        }
        self.shared.rows_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn output(&self, group: usize, index: usize) -> Result<&Arc<RowQueue>> {
        self.router
            .queue(group, index)
            .ok_or_else(|| EngineError::Row(format!("no output queue {}/{}", group, index)))
    }

    /// Count a row the node refused and drop it.
    ///
    /// Fails once the copy has rejected more than its `max_rejected`.
    pub fn reject(&mut self) -> Result<()> {
        self.count_rejected()
    }

    /// Send a refused row down the error edge, tagged with this node's name
    /// and `description`.
    ///
    /// `row` must have the layout of the node's first input (its output, for
    /// sources). Without an error edge the row is only counted. Fails once
    /// the copy has rejected more than its `max_rejected`.
    pub fn reject_row(&mut self, row: Row, description: impl Into<String>) -> Result<()> {
        if let Some(Rejects {
            group,
            schema: Some(schema),
        }) = self.rejects.as_mut()
        {
            let mut values = row.into_values();
            values.push(Value::from(self.shared.node.as_str()));
            values.push(Value::from(description.into()));
            let error_row = Row::new(schema.clone(), values)?;
            match group.route(&error_row)? {
                Target::One(i) => {
                    let queue = group.queues().get(i).ok_or_else(|| {
                        EngineError::Row(format!(
                            "no error queue {} towards '{}'",
                            i,
                            group.target_name()
                        ))
                    })?;
                    queue.put(error_row)?;
                }
                Target::All => {
                    for queue in group.queues() {
                        queue.put(error_row.clone())?;
                    }
                }
            }
        }
        self.count_rejected()
    }

    fn count_rejected(&self) -> Result<()> {
        let rejected = self.shared.rows_rejected.fetch_add(1, Ordering::Relaxed) + 1;
        if self.max_rejected > 0 && rejected > self.max_rejected {
            return Err(EngineError::node(
                &self.shared.node,
                self.shared.copy,
                format!(
                    "too many rejected rows: {} (max {})",
                    rejected, self.max_rejected
                ),
            ));
        }
        Ok(())
    }

    /// Count a row the node deliberately ignored.
    pub fn skip(&mut self) {
        self.shared.rows_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// For long node calls: whether the run wants this copy to stop.
    pub fn is_stopped(&self) -> bool {
        self.control.is_stopped()
    }

    /// Handle for observing stops from helper code that outlives one call.
    pub fn stop_signal(&self) -> StopSignal {
        StopSignal::new(self.control.clone())
    }

    /// Schema of the first input queue.
    pub fn schema_in(&self) -> Option<Arc<Schema>> {
        self.inputs.first().and_then(|i| i.queue.schema())
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Whether the node has regular outputs (the error edge does not count).
    pub fn has_outputs(&self) -> bool {
        !self.router.is_empty()
    }

    pub fn has_error_edge(&self) -> bool {
        self.rejects.is_some()
    }

    /// Every owned queue, the error edge included.
    pub(crate) fn output_queues(&self) -> impl Iterator<Item = &Arc<RowQueue>> {
        self.router.all_queues().chain(
            self.rejects
                .iter()
                .flat_map(|r| r.group.queues().iter()),
        )
    }

    /// Queues carrying the node's declared output schema.
    pub(crate) fn data_queues(&self) -> impl Iterator<Item = &Arc<RowQueue>> {
        self.router.all_queues()
    }

    pub(crate) fn input_queues(&self) -> impl Iterator<Item = &Arc<RowQueue>> {
        self.inputs.iter().map(|i| &i.queue)
    }
}
