//! DiscardNode: sink that drops everything it reads.

use crate::error::Result;
use crate::pipeline::node::{Flow, InitContext, NodeImpl, RowIo};
use crate::row::Schema;
use std::sync::Arc;

#[derive(Default)]
pub struct DiscardNode {
    dropped: u64,
}

impl NodeImpl for DiscardNode {
    fn init(&mut self, ctx: &InitContext<'_>) -> Result<Option<Arc<Schema>>> {
        Ok(ctx.input_schema().cloned())
    }

    fn process_one(&mut self, io: &mut RowIo) -> Result<Flow> {
        match io.read() {
            Some(_) => {
                self.dropped += 1;
                Ok(Flow::Continue)
            }
            None => {
                tracing::debug!("Discarded {} rows", self.dropped);
                Ok(Flow::Done)
            }
        }
    }
}
