// Stack layout. Parameters sit above the frame pointer (return address and saved RBP in
// between), locals and spill slots below it, after the save area for the pool registers the
// method writes. The frame size covers the locals and spills only; the emission prologue
// pushes the save area separately, so a slot's frame-pointer offset already accounts for it.

use crate::core::error::CompileResult;
use crate::core::operand::{PhysReg, StackSlotKind};
use crate::stages::{MethodContext, Stage};
use crate::x64::regs;

pub struct StackLayoutStage;

impl Stage for StackLayoutStage {
    fn name(&self) -> &'static str {
        "stack-layout"
    }

    fn run(&mut self, ctx: &mut MethodContext) -> CompileResult<()> {
        // Which pool registers does the body write? Those get saved.
        let mut saved: Vec<PhysReg> = Vec::new();
        for block in ctx.graph.block_ids() {
            for node_id in ctx.graph.block_nodes(block) {
                for result in &ctx.graph.node(node_id).results {
                    if let crate::core::operand::Operand::Reg(reg) = result {
                        if regs::GP_POOL.contains(reg) && !saved.contains(reg) {
                            saved.push(*reg);
                        }
                    }
                }
            }
        }
        saved.sort_by_key(|r| r.id);
        let save_bytes = saved.len() as u32 * 8;
        ctx.saved_regs = saved;

        // Parameters: [rbp + 16 + 8 * index].
        // Locals and spills: below the save area, 8 bytes each.
        let mut local_bytes = 0u32;
        let assignments: Vec<(crate::core::operand::StackSlotId, i32)> = ctx
            .slots
            .iter()
            .map(|(id, slot)| {
                let offset = match slot.kind {
                    StackSlotKind::Param => 16 + 8 * slot.index as i32,
                    StackSlotKind::Local | StackSlotKind::Spill => {
                        local_bytes += 8;
                        -((save_bytes + local_bytes) as i32)
                    }
                };
                (id, offset)
            })
            .collect();
        for (id, offset) in assignments {
            ctx.slots.set_offset(id, offset);
        }

        ctx.frame_size = local_bytes.div_ceil(16) * 16;
        ctx.counters
            .update("stack.frame-bytes", ctx.frame_size as i64);
        Ok(())
    }
}
