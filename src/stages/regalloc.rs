// Linear-scan register allocation. Block-level liveness (backward dataflow over the control
// flow graph) stretches each register's interval across the blocks it is live through, then
// a single scan over interval start order hands out registers from the per-bank pools.
// When a pool runs dry the active interval that ends last is evicted to a spill slot.
// Floating-point intervals that span a call site spill unconditionally: the pool is
// caller-clobbered, while the general-purpose pool is preserved by callee prologues.
// A rewrite pass then replaces every virtual register with its physical register, routing
// spilled values through the reserved scratch registers with explicit loads and stores.

use std::collections::HashMap;

use crate::core::error::{CompileError, CompileResult};
use crate::core::graph::{Node, NodeId};
use crate::core::instruction::Opcode;
use crate::core::operand::{Operand, PhysReg, StackSlotId, StackSlotKind, VRegId};
use crate::stages::{MethodContext, Stage};
use crate::x64::{regs, X64Op};

pub struct RegisterAllocationStage;

impl Stage for RegisterAllocationStage {
    fn name(&self) -> &'static str {
        "register-allocation"
    }

    fn run(&mut self, ctx: &mut MethodContext) -> CompileResult<()> {
        let order = ctx.linear_block_order();

        // Assign a position to every node, and find block ranges.
        let mut positions: HashMap<NodeId, usize> = HashMap::new();
        let mut block_ranges: Vec<(crate::core::graph::BlockId, usize, usize)> = Vec::new();
        let mut call_positions: Vec<usize> = Vec::new();
        let mut pos = 0usize;
        for &block in &order {
            let start = pos;
            for node_id in ctx.graph.block_nodes(block) {
                positions.insert(node_id, pos);
                if ctx.graph.node(node_id).opcode == Opcode::X64(X64Op::Call) {
                    call_positions.push(pos);
                }
                pos += 1;
            }
            block_ranges.push((block, start, pos.saturating_sub(1)));
        }

        let intervals = build_intervals(ctx, &order, &positions, &block_ranges);

        // Scan in interval start order.
        let mut sorted: Vec<(VRegId, Interval)> = intervals.into_iter().collect();
        sorted.sort_by_key(|(v, i)| (i.start, v.0));

        let mut gp_free: Vec<PhysReg> = regs::GP_POOL.to_vec();
        let mut fp_free: Vec<PhysReg> = regs::xmm_pool();
        let mut active: Vec<(VRegId, Interval, PhysReg)> = Vec::new();
        let mut assignment: HashMap<VRegId, Location> = HashMap::new();
        let mut spills = 0i64;

        for (vreg, interval) in sorted {
            // Expire intervals that ended before this one starts.
            active.retain(|(_, it, reg)| {
                if it.end < interval.start {
                    let pool = if reg.is_float() { &mut fp_free } else { &mut gp_free };
                    pool.push(*reg);
                    false
                } else {
                    true
                }
            });

            let float = ctx.vregs.ty(vreg).is_float();
            let crosses_call = call_positions
                .iter()
                .any(|&c| interval.start <= c && c < interval.end);
            if float && crosses_call {
                // XMM registers do not survive a call.
                spill(ctx, &mut assignment, vreg, &mut spills);
                continue;
            }

            let pool = if float { &mut fp_free } else { &mut gp_free };
            if let Some(reg) = pool.pop() {
                assignment.insert(vreg, Location::Reg(reg));
                active.push((vreg, interval, reg));
                continue;
            }

            // Evict the active interval in this bank that ends last.
            let candidate = active
                .iter()
                .enumerate()
                .filter(|(_, (_, _, reg))| reg.is_float() == float)
                .max_by_key(|(_, (_, it, _))| it.end)
                .map(|(idx, &(v, it, reg))| (idx, v, it, reg));
            match candidate {
                Some((idx, evicted, evicted_it, reg)) if evicted_it.end > interval.end => {
                    active.remove(idx);
                    spill(ctx, &mut assignment, evicted, &mut spills);
                    assignment.insert(vreg, Location::Reg(reg));
                    active.push((vreg, interval, reg));
                }
                _ => {
                    spill(ctx, &mut assignment, vreg, &mut spills);
                }
            }
        }

        rewrite(ctx, &order, &assignment)?;

        ctx.counters.update("regalloc.spills", spills);
        ctx.counters
            .update("regalloc.vregs", ctx.vregs.count() as i64);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Location {
    Reg(PhysReg),
    Spill(StackSlotId),
}

fn spill(
    ctx: &mut MethodContext,
    assignment: &mut HashMap<VRegId, Location>,
    vreg: VRegId,
    spills: &mut i64,
) {
    let index = *spills as u32;
    let slot = ctx
        .slots
        .add(StackSlotKind::Spill, ctx.vregs.ty(vreg), index);
    assignment.insert(vreg, Location::Spill(slot));
    *spills += 1;
    log::trace!("spilled {vreg}");
}

#[derive(Debug, Clone, Copy)]
struct Interval {
    start: usize,
    end: usize,
}

/// Occurrence positions widened by block-level liveness.
fn build_intervals(
    ctx: &MethodContext,
    order: &[crate::core::graph::BlockId],
    positions: &HashMap<NodeId, usize>,
    block_ranges: &[(crate::core::graph::BlockId, usize, usize)],
) -> HashMap<VRegId, Interval> {
    // Per-block use/def sets.
    let block_count = ctx.graph.block_count();
    let mut uses: Vec<Vec<VRegId>> = vec![Vec::new(); block_count];
    let mut defs: Vec<Vec<VRegId>> = vec![Vec::new(); block_count];
    for &block in order {
        let b = block.0 as usize;
        for node_id in ctx.graph.block_nodes(block) {
            let node = ctx.graph.node(node_id);
            for op in &node.operands {
                if let Some(v) = op.vreg() {
                    if !defs[b].contains(&v) && !uses[b].contains(&v) {
                        uses[b].push(v);
                    }
                }
            }
            for r in &node.results {
                if let Some(v) = r.vreg() {
                    if !defs[b].contains(&v) {
                        defs[b].push(v);
                    }
                }
            }
        }
    }

    // Backward liveness to a fixed point.
    let mut live_in: Vec<Vec<VRegId>> = vec![Vec::new(); block_count];
    let mut live_out: Vec<Vec<VRegId>> = vec![Vec::new(); block_count];
    let mut changed = true;
    while changed {
        changed = false;
        for &block in order.iter().rev() {
            let b = block.0 as usize;
            let mut out: Vec<VRegId> = Vec::new();
            for &succ in ctx.graph.succs(block) {
                for &v in &live_in[succ.0 as usize] {
                    if !out.contains(&v) {
                        out.push(v);
                    }
                }
            }
            let mut inn: Vec<VRegId> = uses[b].clone();
            for &v in &out {
                if !defs[b].contains(&v) && !inn.contains(&v) {
                    inn.push(v);
                }
            }
            if out != live_out[b] {
                live_out[b] = out;
                changed = true;
            }
            if inn != live_in[b] {
                live_in[b] = inn;
                changed = true;
            }
        }
    }

    let mut intervals: HashMap<VRegId, Interval> = HashMap::new();
    let mut touch = |v: VRegId, at: usize| {
        let entry = intervals.entry(v).or_insert(Interval { start: at, end: at });
        entry.start = entry.start.min(at);
        entry.end = entry.end.max(at);
    };
    for &block in order {
        for node_id in ctx.graph.block_nodes(block) {
            let at = positions[&node_id];
            let node = ctx.graph.node(node_id);
            for op in node.operands.iter().chain(node.results.iter()) {
                if let Some(v) = op.vreg() {
                    touch(v, at);
                }
            }
        }
    }
    for &(block, start, end) in block_ranges {
        let b = block.0 as usize;
        for &v in &live_in[b] {
            touch(v, start);
        }
        for &v in &live_out[b] {
            touch(v, end);
        }
    }
    intervals
}

/// Replace every virtual register with its location; spilled values go
/// through the reserved scratch registers with explicit loads and stores.
fn rewrite(
    ctx: &mut MethodContext,
    order: &[crate::core::graph::BlockId],
    assignment: &HashMap<VRegId, Location>,
) -> CompileResult<()> {
    const GP_SCRATCH: [PhysReg; 2] = [regs::R10, regs::R11];
    const FP_SCRATCH: [PhysReg; 2] = [regs::XMM14, regs::XMM15];

    for &block in order {
        let node_ids: Vec<NodeId> = ctx.graph.block_nodes(block).collect();
        for node_id in node_ids {
            let mut node_scratch: HashMap<VRegId, PhysReg> = HashMap::new();
            let mut gp_used = 0usize;
            let mut fp_used = 0usize;

            let operand_count = ctx.graph.node(node_id).operands.len();
            for k in 0..operand_count {
                let Some(vreg) = ctx.graph.node(node_id).operands[k].vreg() else {
                    continue;
                };
                match assignment.get(&vreg) {
                    Some(Location::Reg(reg)) => {
                        ctx.graph.node_mut(node_id).operands[k] = Operand::Reg(*reg);
                    }
                    Some(Location::Spill(slot)) => {
                        let scratch = *match node_scratch.entry(vreg) {
                            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                            std::collections::hash_map::Entry::Vacant(e) => {
                                let float = ctx.vregs.ty(vreg).is_float();
                                let (pool, used) = if float {
                                    (&FP_SCRATCH, &mut fp_used)
                                } else {
                                    (&GP_SCRATCH, &mut gp_used)
                                };
                                if *used >= pool.len() {
                                    return Err(CompileError::invariant(
                                        "register-allocation",
                                        "ran out of spill scratch registers",
                                    ));
                                }
                                let reg = pool[*used];
                                *used += 1;
                                e.insert(reg)
                            }
                        };
                        let load = fill_node(ctx, vreg, *slot, scratch, true);
                        ctx.graph.insert_before(node_id, load);
                        ctx.graph.node_mut(node_id).operands[k] = Operand::Reg(scratch);
                    }
                    None => {
                        // Never allocated: the value is dead here; any
                        // scratch register will do.
                        let float = ctx.vregs.ty(vreg).is_float();
                        let reg = if float { FP_SCRATCH[0] } else { GP_SCRATCH[0] };
                        ctx.graph.node_mut(node_id).operands[k] = Operand::Reg(reg);
                    }
                }
            }

            let result_count = ctx.graph.node(node_id).results.len();
            for k in 0..result_count {
                let Some(vreg) = ctx.graph.node(node_id).results[k].vreg() else {
                    continue;
                };
                match assignment.get(&vreg) {
                    Some(Location::Reg(reg)) => {
                        ctx.graph.node_mut(node_id).results[k] = Operand::Reg(*reg);
                    }
                    Some(Location::Spill(slot)) => {
                        let float = ctx.vregs.ty(vreg).is_float();
                        let scratch = *node_scratch.entry(vreg).or_insert(if float {
                            FP_SCRATCH[1]
                        } else {
                            GP_SCRATCH[1]
                        });
                        let store = fill_node(ctx, vreg, *slot, scratch, false);
                        ctx.graph.insert_after(node_id, store);
                        ctx.graph.node_mut(node_id).results[k] = Operand::Reg(scratch);
                    }
                    None => {
                        let float = ctx.vregs.ty(vreg).is_float();
                        let reg = if float { FP_SCRATCH[1] } else { GP_SCRATCH[1] };
                        ctx.graph.node_mut(node_id).results[k] = Operand::Reg(reg);
                    }
                }
            }
        }
    }
    Ok(())
}

/// A spill fill or store as a platform move between slot and scratch.
fn fill_node(
    ctx: &MethodContext,
    vreg: VRegId,
    slot: StackSlotId,
    scratch: PhysReg,
    load: bool,
) -> Node {
    let mov = match ctx.vregs.ty(vreg) {
        crate::core::instruction::IrType::R4 => X64Op::Movss,
        crate::core::instruction::IrType::R8 => X64Op::Movsd,
        crate::core::instruction::IrType::I32 => X64Op::Mov32,
        _ => X64Op::Mov64,
    };
    if load {
        Node::new(Opcode::X64(mov))
            .result(Operand::Reg(scratch))
            .operand(Operand::Stack(slot))
    } else {
        Node::new(Opcode::X64(mov))
            .result(Operand::Stack(slot))
            .operand(Operand::Reg(scratch))
    }
}
