//! LogNode: logs rows as they pass.
//!
//! `every` (default 1) logs only every n-th row. Rows are forwarded to all
//! outputs, so the node can sit in the middle of a graph.

use crate::error::Result;
use crate::pipeline::node::{Flow, InitContext, NodeImpl, RowIo};
use crate::row::Schema;
use std::sync::Arc;

pub struct LogNode {
    every: u64,
    seen: u64,
}

impl Default for LogNode {
    fn default() -> Self {
        Self { every: 1, seen: 0 }
    }
}

impl NodeImpl for LogNode {
    fn init(&mut self, ctx: &InitContext<'_>) -> Result<Option<Arc<Schema>>> {
        self.every = ctx.config.count_or("every", 1)?.max(1);
        let schema = ctx.common_input_schema()?;
        tracing::info!("Layout: {}", schema);
        Ok(Some(schema))
    }

    fn process_one(&mut self, io: &mut RowIo) -> Result<Flow> {
        let Some(row) = io.read() else {
            tracing::info!("{} rows seen", self.seen);
            return Ok(Flow::Done);
        };
        self.seen += 1;
        if self.seen % self.every == 0 {
            tracing::info!("#{} {}", self.seen, row);
        }
        if io.has_outputs() {
            io.write(row)?;
        }
        Ok(Flow::Continue)
    }
}
