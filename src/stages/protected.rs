//! Materializes protected-region metadata as block-graph structure.
//!
//! The decoder already forces block boundaries at every region edge and maps
//! try/handler entries to blocks. This stage registers handler entries as
//! extra roots and raises the flag that disables the optimizations which do
//! not model exceptional control flow.

use crate::core::error::{CompileError, CompileResult};
use crate::stages::{MethodContext, Stage};

pub struct ProtectedRegionStage;

impl Stage for ProtectedRegionStage {
    fn name(&self) -> &'static str {
        "protected-regions"
    }

    fn run(&mut self, ctx: &mut MethodContext) -> CompileResult<()> {
        if ctx.regions.is_empty() {
            return Ok(());
        }
        ctx.has_protected_regions = true;
        for region in &ctx.regions {
            // Handler entries are only reachable through the dispatcher, so
            // no ordinary edge may lead into them.
            if !ctx.graph.preds(region.handler_entry).is_empty() {
                return Err(CompileError::invariant(
                    "protected-regions",
                    "handler entry has ordinary predecessors",
                ));
            }
            ctx.handler_blocks.push(region.handler_entry);
        }
        ctx.counters
            .update("protected.regions", ctx.regions.len() as i64);
        Ok(())
    }
}
