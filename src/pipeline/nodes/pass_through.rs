//! PassThroughNode: forwards every input row unchanged.

use crate::error::Result;
use crate::pipeline::node::{Flow, InitContext, NodeImpl, RowIo};
use crate::row::Schema;
use std::sync::Arc;

/// Reads from all inputs (which must agree on layout) and writes to all
/// outputs through the router.
pub struct PassThroughNode;

impl NodeImpl for PassThroughNode {
    fn init(&mut self, ctx: &InitContext<'_>) -> Result<Option<Arc<Schema>>> {
        ctx.common_input_schema().map(Some)
    }

    fn process_one(&mut self, io: &mut RowIo) -> Result<Flow> {
        match io.read() {
            Some(row) => {
                io.write(row)?;
                Ok(Flow::Continue)
            }
            None => Ok(Flow::Done),
        }
    }
}
