// Sparse conditional constant propagation. Registers carry a three-point lattice (unknown,
// a known constant, overdefined) and blocks carry an executability bit seeded at the entry.
// The sweep evaluates phis over executable predecessors only and walks each block's
// terminator group to decide which successors can run, so constants and reachability refine
// each other. The transform then rewrites constant uses, deletes constant definitions,
// collapses decided branches to jumps, empties dead blocks, and prunes phi inputs down to
// the surviving predecessors.

use std::collections::{HashMap, HashSet};

use crate::core::error::CompileResult;
use crate::core::graph::{BlockId, NodeId};
use crate::core::instruction::{FlowControl, IrOp, Opcode};
use crate::core::operand::{ConstValue, Operand, VRegId};
use crate::stages::fold::{eval_int_condition, fold_binary, fold_unary};
use crate::stages::{MethodContext, Stage};

#[derive(Debug, Clone, PartialEq)]
enum Lattice {
    Top,
    Const(ConstValue),
    Bottom,
}

impl Lattice {
    fn meet(&self, other: &Lattice) -> Lattice {
        match (self, other) {
            (Lattice::Top, x) | (x, Lattice::Top) => x.clone(),
            (Lattice::Bottom, _) | (_, Lattice::Bottom) => Lattice::Bottom,
            (Lattice::Const(a), Lattice::Const(b)) => {
                if a == b {
                    Lattice::Const(a.clone())
                } else {
                    Lattice::Bottom
                }
            }
        }
    }
}

pub struct SparseConditionalConstantStage;

impl Stage for SparseConditionalConstantStage {
    fn name(&self) -> &'static str {
        "sparse-conditional-constants"
    }

    fn run(&mut self, ctx: &mut MethodContext) -> CompileResult<()> {
        if !ctx.options.optimize
            || !ctx.options.sparse_conditional_propagation
            || !ctx.is_in_ssa_form
            || ctx.has_protected_regions
        {
            return Ok(());
        }

        let rpo = ctx.reverse_post_order();
        if rpo.is_empty() {
            return Ok(());
        }

        let mut values: HashMap<VRegId, Lattice> = HashMap::new();
        let mut executable: HashSet<BlockId> = HashSet::new();
        executable.insert(rpo[0]);

        // Fixpoint sweep. Both lattices only descend, so this terminates.
        loop {
            let mut changed = false;
            for &block in &rpo {
                if !executable.contains(&block) {
                    continue;
                }
                for node_id in ctx.graph.block_nodes(block).collect::<Vec<_>>() {
                    changed |= evaluate_node(ctx, node_id, &executable, &mut values);
                }
                for succ in successor_set(ctx, block, &values) {
                    if executable.insert(succ) {
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }

        transform(ctx, &rpo, &executable, &values);
        Ok(())
    }
}

fn operand_lattice(values: &HashMap<VRegId, Lattice>, operand: &Operand) -> Lattice {
    match operand {
        Operand::Constant(c) => Lattice::Const(c.clone()),
        Operand::VReg(v) => values.get(v).cloned().unwrap_or(Lattice::Top),
        _ => Lattice::Bottom,
    }
}

/// Re-evaluate one node; true when a result lattice descended.
fn evaluate_node(
    ctx: &MethodContext,
    node_id: NodeId,
    executable: &HashSet<BlockId>,
    values: &mut HashMap<VRegId, Lattice>,
) -> bool {
    let node = ctx.graph.node(node_id);
    if node.results.len() != 1 {
        return false;
    }
    let Some(result) = node.results[0].vreg() else {
        return false;
    };

    let new_value = if node.is_phi() {
        let sources = node.phi_blocks.as_deref().unwrap_or(&[]);
        let mut acc = Lattice::Top;
        for (operand, source) in node.operands.iter().zip(sources.iter()) {
            if !executable.contains(source) {
                continue;
            }
            acc = acc.meet(&operand_lattice(values, operand));
        }
        acc
    } else {
        let Opcode::Ir(op) = node.opcode else {
            return false;
        };
        if node.opcode.desc().has_side_effect() {
            Lattice::Bottom
        } else {
            let lattices: Vec<Lattice> = node
                .operands
                .iter()
                .map(|o| operand_lattice(values, o))
                .collect();
            if lattices.iter().any(|l| *l == Lattice::Bottom) {
                Lattice::Bottom
            } else if lattices.iter().any(|l| *l == Lattice::Top) {
                Lattice::Top
            } else {
                let consts: Vec<&ConstValue> = lattices
                    .iter()
                    .map(|l| match l {
                        Lattice::Const(c) => c,
                        _ => unreachable!(),
                    })
                    .collect();
                let folded = match consts.len() {
                    1 => fold_unary(op, consts[0]),
                    2 => fold_binary(op, node.cond, consts[0], consts[1]),
                    _ => None,
                };
                match (op, folded) {
                    // Pass moves through.
                    (
                        IrOp::Move32 | IrOp::Move64 | IrOp::MoveR4 | IrOp::MoveR8,
                        None,
                    ) => Lattice::Const(consts[0].clone()),
                    (_, Some(c)) => Lattice::Const(c),
                    (_, None) => Lattice::Bottom,
                }
            }
        }
    };

    let old = values.get(&result).cloned().unwrap_or(Lattice::Top);
    let merged = old.meet(&new_value);
    if merged != old {
        values.insert(result, merged);
        true
    } else {
        false
    }
}

/// Successors that can execute, honoring decided conditional branches. The
/// terminator group runs in order: a branch decided taken stops the walk, a
/// decided not-taken branch is skipped.
fn successor_set(
    ctx: &MethodContext,
    block: BlockId,
    values: &HashMap<VRegId, Lattice>,
) -> Vec<BlockId> {
    let mut succs = Vec::new();
    for node_id in ctx.graph.block_nodes(block) {
        let node = ctx.graph.node(node_id);
        match node.opcode.desc().flow {
            FlowControl::ConditionalBranch => {
                match branch_decision(ctx, node_id, values) {
                    Some(true) => {
                        succs.extend(node.targets.iter().copied());
                        return succs;
                    }
                    Some(false) => {}
                    None => succs.extend(node.targets.iter().copied()),
                }
            }
            FlowControl::Branch => {
                succs.extend(node.targets.iter().copied());
                return succs;
            }
            FlowControl::Switch => {
                let selector = operand_lattice(values, &node.operands[0]);
                match selector {
                    Lattice::Const(c) => {
                        let index = c.as_i64().unwrap_or(-1);
                        if index >= 0 && (index as usize) < node.targets.len() {
                            succs.push(node.targets[index as usize]);
                            return succs;
                        }
                        // Out of range: control falls to the default jump.
                    }
                    _ => succs.extend(node.targets.iter().copied()),
                }
            }
            FlowControl::Return => return succs,
            _ => {}
        }
    }
    succs
}

/// Decided direction of a conditional branch, when its operands are known.
fn branch_decision(
    ctx: &MethodContext,
    node_id: NodeId,
    values: &HashMap<VRegId, Lattice>,
) -> Option<bool> {
    let node = ctx.graph.node(node_id);
    let width = match node.opcode {
        Opcode::Ir(IrOp::CmpBranch32) => 32,
        Opcode::Ir(IrOp::CmpBranch64) => 64,
        _ => return None,
    };
    let a = match operand_lattice(values, &node.operands[0]) {
        Lattice::Const(c) => c.as_i64()?,
        _ => return None,
    };
    let b = match operand_lattice(values, &node.operands[1]) {
        Lattice::Const(c) => c.as_i64()?,
        _ => return None,
    };
    eval_int_condition(node.cond?, a, b, width)
}

fn transform(
    ctx: &mut MethodContext,
    rpo: &[BlockId],
    executable: &HashSet<BlockId>,
    values: &HashMap<VRegId, Lattice>,
) {
    let mut constants_folded = 0i64;
    let mut branches_decided = 0i64;
    let mut blocks_removed = 0i64;

    // Dead blocks first.
    for &block in rpo {
        if executable.contains(&block) {
            continue;
        }
        for node_id in ctx.graph.block_nodes(block).collect::<Vec<_>>() {
            ctx.graph.empty_node(node_id);
        }
        blocks_removed += 1;
    }

    for &block in rpo {
        if !executable.contains(&block) {
            continue;
        }
        let node_ids: Vec<NodeId> = ctx.graph.block_nodes(block).collect();
        for node_id in node_ids {
            // Rewrite constant uses.
            let operand_count = ctx.graph.node(node_id).operands.len();
            for k in 0..operand_count {
                let Some(v) = ctx.graph.node(node_id).operands[k].vreg() else {
                    continue;
                };
                if let Some(Lattice::Const(c)) = values.get(&v) {
                    ctx.graph.node_mut(node_id).operands[k] = Operand::Constant(c.clone());
                }
            }

            // Drop definitions whose value is now known.
            let node = ctx.graph.node(node_id);
            if node.results.len() == 1 && !node.opcode.desc().has_side_effect() {
                if let Some(v) = node.results[0].vreg() {
                    if matches!(values.get(&v), Some(Lattice::Const(_))) {
                        ctx.graph.empty_node(node_id);
                        constants_folded += 1;
                        continue;
                    }
                }
            }

            // Collapse decided branches.
            let flow = ctx.graph.node(node_id).opcode.desc().flow;
            if flow == FlowControl::ConditionalBranch {
                match branch_decision(ctx, node_id, values) {
                    Some(true) => {
                        let target = ctx.graph.node(node_id).targets[0];
                        let node = ctx.graph.node_mut(node_id);
                        node.opcode = Opcode::Ir(IrOp::Jmp);
                        node.operands.clear();
                        node.cond = None;
                        node.ty = None;
                        node.targets.clear();
                        node.targets.push(target);
                        branches_decided += 1;
                        // Everything after an unconditional jump is dead.
                        let trailing: Vec<NodeId> = ctx
                            .graph
                            .block_nodes(block)
                            .skip_while(|&n| n != node_id)
                            .skip(1)
                            .collect();
                        for n in trailing {
                            ctx.graph.empty_node(n);
                        }
                    }
                    Some(false) => {
                        ctx.graph.empty_node(node_id);
                        branches_decided += 1;
                    }
                    None => {}
                }
            }
        }
    }

    ctx.graph.recompute_edges();

    // Prune phi inputs to the surviving predecessor sets.
    for &block in rpo {
        if !executable.contains(&block) {
            continue;
        }
        for phi_id in ctx.graph.block_phis(block) {
            let preds: Vec<BlockId> = ctx.graph.preds(block).to_vec();
            let (operands, sources) = {
                let node = ctx.graph.node(phi_id);
                (
                    node.operands.to_vec(),
                    node.phi_blocks.clone().unwrap_or_default(),
                )
            };
            let kept: Vec<(Operand, BlockId)> = operands
                .into_iter()
                .zip(sources)
                .filter(|(_, b)| preds.contains(b))
                .collect();
            if kept.len() == 1 {
                let ptr_size = ctx.layout.ptr_size();
                let (operand, _) = kept.into_iter().next().unwrap();
                let node = ctx.graph.node_mut(phi_id);
                let ty = node.ty.unwrap_or(crate::core::instruction::IrType::I32);
                node.opcode = Opcode::Ir(crate::stages::decode::move_op(ty, ptr_size));
                node.operands.clear();
                node.operands.push(operand);
                node.phi_blocks = None;
            } else {
                let node = ctx.graph.node_mut(phi_id);
                node.operands.clear();
                let mut blocks = Vec::with_capacity(kept.len());
                for (operand, b) in kept {
                    node.operands.push(operand);
                    blocks.push(b);
                }
                node.phi_blocks = Some(blocks);
            }
        }
    }

    ctx.counters.update("sccp.constants", constants_folded);
    ctx.counters.update("sccp.branches", branches_decided);
    ctx.counters.update("sccp.dead-blocks", blocks_removed);
}
