//! Node types used only by tests

use parking_lot::Mutex;
use rowflow::error::Result;
use rowflow::pipeline::{Flow, InitContext, NodeImpl, NodeRegistry, RowIo};
use rowflow::row::{Row, Schema, Value};
use std::sync::Arc;
use std::time::Duration;

/// Rows received by `collect` copies, tagged with the copy index
#[derive(Clone, Default)]
pub struct Collected(Arc<Mutex<Vec<(usize, Row)>>>);

impl Collected {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn rows(&self) -> Vec<Row> {
        self.0.lock().iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn by_copy(&self) -> Vec<(usize, Row)> {
        self.0.lock().clone()
    }
}

/// `collect`, `fail`, `slow`, `reject`, `fail-init`, `panic`, `fail-dispose`
/// and `fieldless`.
pub fn register(registry: &mut NodeRegistry, sink: &Collected) {
    let sink = sink.clone();
    registry.register("collect", move || {
        Box::new(CollectNode {
            sink: sink.clone(),
            copy: 0,
        })
    });
    registry.register("fail", || Box::new(FailNode::default()));
    registry.register("slow", || Box::new(SlowNode::default()));
    registry.register("reject", || Box::new(RejectNode::default()));
    registry.register("fail-init", || Box::new(FailInitNode));
    registry.register("panic", || Box::new(PanicNode::default()));
    registry.register("fail-dispose", || Box::new(FailDisposeNode::default()));
    registry.register("fieldless", || Box::new(FieldlessNode));
}

/// Sink that keeps every row it reads
pub struct CollectNode {
    sink: Collected,
    copy: usize,
}

impl NodeImpl for CollectNode {
    fn init(&mut self, ctx: &InitContext<'_>) -> Result<Option<Arc<Schema>>> {
        self.copy = ctx.copy;
        ctx.require_input_schema().map(Some)
    }

    fn process_one(&mut self, io: &mut RowIo) -> Result<Flow> {
        match io.read() {
            Some(row) => {
                self.sink.0.lock().push((self.copy, row));
                Ok(Flow::Continue)
            }
            None => Ok(Flow::Done),
        }
    }
}

/// Pass-through that fails after `after` rows (config key `after`, default 0)
#[derive(Default)]
pub struct FailNode {
    after: u64,
    seen: u64,
}

impl NodeImpl for FailNode {
    fn init(&mut self, ctx: &InitContext<'_>) -> Result<Option<Arc<Schema>>> {
        self.after = ctx.config.count_or("after", 0)?;
        ctx.require_input_schema().map(Some)
    }

    fn process_one(&mut self, io: &mut RowIo) -> Result<Flow> {
        let Some(row) = io.read() else {
            return Ok(Flow::Done);
        };
        if self.seen >= self.after {
            return Err(rowflow::EngineError::node("fail", 0, "forced failure"));
        }
        self.seen += 1;
        io.write(row)?;
        Ok(Flow::Continue)
    }
}

/// Pass-through sleeping `delay_ms` per row
#[derive(Default)]
pub struct SlowNode {
    delay: Duration,
}

impl NodeImpl for SlowNode {
    fn init(&mut self, ctx: &InitContext<'_>) -> Result<Option<Arc<Schema>>> {
        self.delay = Duration::from_millis(ctx.config.count_or("delay_ms", 5)?);
        ctx.require_input_schema().map(Some)
    }

    fn process_one(&mut self, io: &mut RowIo) -> Result<Flow> {
        match io.read() {
            Some(row) => {
                std::thread::sleep(self.delay);
                if io.has_outputs() {
                    io.write(row)?;
                }
                Ok(Flow::Continue)
            }
            None => Ok(Flow::Done),
        }
    }
}

/// Pass-through rejecting every row whose first field is a multiple of
/// `every` (default 10)
#[derive(Default)]
pub struct RejectNode {
    every: i64,
}

impl NodeImpl for RejectNode {
    fn init(&mut self, ctx: &InitContext<'_>) -> Result<Option<Arc<Schema>>> {
        self.every = ctx.config.count_or("every", 10)?.max(1) as i64;
        ctx.require_input_schema().map(Some)
    }

    fn process_one(&mut self, io: &mut RowIo) -> Result<Flow> {
        let Some(row) = io.read() else {
            return Ok(Flow::Done);
        };
        match row.get(0).and_then(Value::as_i64) {
            Some(id) if id % self.every == 0 => {
                io.reject_row(row, format!("id {} is a multiple of {}", id, self.every))?;
            }
            _ => io.write(row)?,
        }
        Ok(Flow::Continue)
    }
}

/// Node whose `init` always fails
pub struct FailInitNode;

impl NodeImpl for FailInitNode {
    fn init(&mut self, ctx: &InitContext<'_>) -> Result<Option<Arc<Schema>>> {
        Err(ctx.error("cannot open resource"))
    }

    fn process_one(&mut self, _io: &mut RowIo) -> Result<Flow> {
        Ok(Flow::Done)
    }
}

/// Sink that panics on row number `after` (default 0)
#[derive(Default)]
pub struct PanicNode {
    after: u64,
    seen: u64,
}

impl NodeImpl for PanicNode {
    fn init(&mut self, ctx: &InitContext<'_>) -> Result<Option<Arc<Schema>>> {
        self.after = ctx.config.count_or("after", 0)?;
        ctx.require_input_schema().map(Some)
    }

    fn process_one(&mut self, io: &mut RowIo) -> Result<Flow> {
        if io.read().is_none() {
            return Ok(Flow::Done);
        }
        if self.seen >= self.after {
            panic!("row {} was one too many", self.seen);
        }
        self.seen += 1;
        Ok(Flow::Continue)
    }
}

/// Sink whose `dispose` sleeps `delay_ms` (default 0) and then fails
#[derive(Default)]
pub struct FailDisposeNode {
    delay: Duration,
}

impl NodeImpl for FailDisposeNode {
    fn init(&mut self, ctx: &InitContext<'_>) -> Result<Option<Arc<Schema>>> {
        self.delay = Duration::from_millis(ctx.config.count_or("delay_ms", 0)?);
        ctx.require_input_schema().map(Some)
    }

    fn process_one(&mut self, io: &mut RowIo) -> Result<Flow> {
        Ok(match io.read() {
            Some(_) => Flow::Continue,
            None => Flow::Done,
        })
    }

    fn dispose(&mut self) -> Result<()> {
        std::thread::sleep(self.delay);
        Err(rowflow::EngineError::node("fail-dispose", 0, "flush failed"))
    }
}

/// Source declaring a schema with no fields
pub struct FieldlessNode;

impl NodeImpl for FieldlessNode {
    fn init(&mut self, _ctx: &InitContext<'_>) -> Result<Option<Arc<Schema>>> {
        Ok(Some(Schema::shared(Vec::new())))
    }

    fn process_one(&mut self, _io: &mut RowIo) -> Result<Flow> {
        Ok(Flow::Done)
    }
}
