// SSA construction. Dominators come from the iterative RPO algorithm, phis are placed at
// the iterated dominance frontier of each register's definition blocks, and a dominator-tree
// walk renames every definition to a fresh versioned register. Version numbers start at 1;
// a use reached by no definition on some path binds to the version-0 register, which
// Leave-SSA later resolves back to the SSA parent. Methods with protected regions skip the
// transform: their handler blocks sit outside the dominator tree and the optimizations that
// want SSA are disabled for them anyway.

use std::collections::{HashMap, HashSet};

use crate::core::error::CompileResult;
use crate::core::graph::{BlockId, Node, NodeId};
use crate::core::instruction::IrOp;
use crate::core::operand::{Operand, VRegId};
use crate::stages::{MethodContext, Stage};

pub struct SsaConstructionStage;

impl Stage for SsaConstructionStage {
    fn name(&self) -> &'static str {
        "ssa-construction"
    }

    fn run(&mut self, ctx: &mut MethodContext) -> CompileResult<()> {
        if ctx.has_protected_regions {
            log::debug!("{}: protected regions, staying out of SSA", ctx.trace.method);
            return Ok(());
        }
        ctx.graph.recompute_edges();
        let rpo = ctx.reverse_post_order();
        if rpo.is_empty() {
            return Ok(());
        }

        let mut index: HashMap<BlockId, usize> = HashMap::new();
        for (i, &b) in rpo.iter().enumerate() {
            index.insert(b, i);
        }

        let idom = dominators(ctx, &rpo, &index);
        let frontiers = dominance_frontiers(ctx, &rpo, &index, &idom);

        // Definition sites per original register, over reachable blocks.
        let mut def_blocks: HashMap<VRegId, Vec<usize>> = HashMap::new();
        for (i, &block) in rpo.iter().enumerate() {
            for node_id in ctx.graph.block_nodes(block) {
                for result in &ctx.graph.node(node_id).results {
                    if let Some(vreg) = result.vreg() {
                        let blocks = def_blocks.entry(vreg).or_default();
                        if blocks.last() != Some(&i) {
                            blocks.push(i);
                        }
                    }
                }
            }
        }

        // Phi placement at the iterated dominance frontier.
        let mut phis_placed = 0i64;
        for (&vreg, blocks) in &def_blocks {
            if blocks.len() < 2 {
                continue;
            }
            let ty = ctx.vregs.ty(vreg);
            let mut has_phi: HashSet<usize> = HashSet::new();
            let mut work: Vec<usize> = blocks.clone();
            while let Some(b) = work.pop() {
                for &f in &frontiers[b] {
                    if !has_phi.insert(f) {
                        continue;
                    }
                    let block = rpo[f];
                    let preds: Vec<BlockId> = ctx
                        .graph
                        .preds(block)
                        .iter()
                        .copied()
                        .filter(|p| index.contains_key(p))
                        .collect();
                    let mut node = Node::ir(IrOp::Phi)
                        .result(Operand::VReg(vreg))
                        .with_ty(ty);
                    for _ in 0..preds.len() {
                        node = node.operand(Operand::VReg(vreg));
                    }
                    node.phi_blocks = Some(preds);
                    ctx.graph.prepend(block, node);
                    phis_placed += 1;
                    if !blocks.contains(&f) {
                        work.push(f);
                    }
                }
            }
        }

        rename(ctx, &rpo, &index, &idom);

        ctx.is_in_ssa_form = true;
        ctx.counters.update("ssa.phis-placed", phis_placed);
        Ok(())
    }
}

/// Immediate dominators over RPO indices; entry dominates itself.
pub(crate) fn dominators(
    ctx: &MethodContext,
    rpo: &[BlockId],
    index: &HashMap<BlockId, usize>,
) -> Vec<usize> {
    let mut idom: Vec<Option<usize>> = vec![None; rpo.len()];
    idom[0] = Some(0);
    let mut changed = true;
    while changed {
        changed = false;
        for i in 1..rpo.len() {
            let preds: Vec<usize> = ctx
                .graph
                .preds(rpo[i])
                .iter()
                .filter_map(|p| index.get(p).copied())
                .collect();
            let mut new_idom: Option<usize> = None;
            for &p in &preds {
                if idom[p].is_none() {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => p,
                    Some(current) => intersect(&idom, p, current),
                });
            }
            if let Some(n) = new_idom {
                if idom[i] != Some(n) {
                    idom[i] = Some(n);
                    changed = true;
                }
            }
        }
    }
    idom.into_iter().map(|d| d.unwrap_or(0)).collect()
}

fn intersect(idom: &[Option<usize>], mut a: usize, mut b: usize) -> usize {
    while a != b {
        while a > b {
            a = idom[a].unwrap_or(0);
        }
        while b > a {
            b = idom[b].unwrap_or(0);
        }
    }
    a
}

fn dominance_frontiers(
    ctx: &MethodContext,
    rpo: &[BlockId],
    index: &HashMap<BlockId, usize>,
    idom: &[usize],
) -> Vec<Vec<usize>> {
    let mut frontiers: Vec<HashSet<usize>> = vec![HashSet::new(); rpo.len()];
    for (i, &block) in rpo.iter().enumerate() {
        let preds: Vec<usize> = ctx
            .graph
            .preds(block)
            .iter()
            .filter_map(|p| index.get(p).copied())
            .collect();
        if preds.len() < 2 {
            continue;
        }
        for &p in &preds {
            let mut runner = p;
            while runner != idom[i] {
                frontiers[runner].insert(i);
                runner = idom[runner];
            }
        }
    }
    frontiers.into_iter().map(|s| s.into_iter().collect()).collect()
}

struct Renamer {
    stacks: HashMap<VRegId, Vec<VRegId>>,
    versions: HashMap<VRegId, u32>,
    zero: HashMap<VRegId, VRegId>,
}

impl Renamer {
    /// Current reaching version for a register, materializing version 0 for
    /// paths with no dominating definition.
    fn top(&mut self, ctx: &mut MethodContext, parent: VRegId) -> VRegId {
        if let Some(stack) = self.stacks.get(&parent) {
            if let Some(&top) = stack.last() {
                return top;
            }
        }
        if let Some(&zero) = self.zero.get(&parent) {
            return zero;
        }
        let zero = ctx.vregs.alloc_ssa(parent, 0);
        self.zero.insert(parent, zero);
        zero
    }

    fn define(&mut self, ctx: &mut MethodContext, parent: VRegId) -> VRegId {
        let version = self.versions.entry(parent).or_insert(0);
        *version += 1;
        let fresh = ctx.vregs.alloc_ssa(parent, *version);
        self.stacks.entry(parent).or_default().push(fresh);
        fresh
    }
}

/// Dominator-tree walk renaming every definition and use.
fn rename(
    ctx: &mut MethodContext,
    rpo: &[BlockId],
    index: &HashMap<BlockId, usize>,
    idom: &[usize],
) {
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); rpo.len()];
    for i in 1..rpo.len() {
        children[idom[i]].push(i);
    }

    let mut renamer = Renamer {
        stacks: HashMap::new(),
        versions: HashMap::new(),
        zero: HashMap::new(),
    };

    enum Step {
        Enter(usize),
        Exit(usize, Vec<(VRegId, usize)>),
    }

    let mut stack = vec![Step::Enter(0)];
    while let Some(step) = stack.pop() {
        match step {
            Step::Enter(i) => {
                let block = rpo[i];
                let mut pushed: Vec<(VRegId, usize)> = Vec::new();

                let node_ids: Vec<NodeId> = ctx.graph.block_nodes(block).collect();
                for node_id in node_ids {
                    let is_phi = ctx.graph.node(node_id).is_phi();
                    if !is_phi {
                        // Uses first, then the definitions.
                        let operand_count = ctx.graph.node(node_id).operands.len();
                        for k in 0..operand_count {
                            let parent = match ctx.graph.node(node_id).operands[k].vreg() {
                                Some(v) if ctx.vregs.ssa(v).is_none() => v,
                                _ => continue,
                            };
                            let renamed = renamer.top(ctx, parent);
                            ctx.graph.node_mut(node_id).operands[k] = Operand::VReg(renamed);
                        }
                    }
                    let result_count = ctx.graph.node(node_id).results.len();
                    for k in 0..result_count {
                        let parent = match ctx.graph.node(node_id).results[k].vreg() {
                            Some(v) if ctx.vregs.ssa(v).is_none() => v,
                            _ => continue,
                        };
                        let fresh = renamer.define(ctx, parent);
                        ctx.graph.node_mut(node_id).results[k] = Operand::VReg(fresh);
                        pushed.push((parent, 1));
                    }
                }

                // Fill this block's slot in every successor phi.
                let succs: Vec<BlockId> = ctx.graph.succs(block).to_vec();
                for succ in succs {
                    if !index.contains_key(&succ) {
                        continue;
                    }
                    for phi_id in ctx.graph.block_phis(succ) {
                        let slot = {
                            let node = ctx.graph.node(phi_id);
                            node.phi_blocks
                                .as_ref()
                                .and_then(|blocks| blocks.iter().position(|&b| b == block))
                        };
                        let Some(slot) = slot else { continue };
                        let parent = match ctx.graph.node(phi_id).operands[slot].vreg() {
                            Some(v) => match ctx.vregs.ssa(v) {
                                None => v,
                                Some(info) => info.parent,
                            },
                            None => continue,
                        };
                        let renamed = renamer.top(ctx, parent);
                        ctx.graph.node_mut(phi_id).operands[slot] = Operand::VReg(renamed);
                    }
                }

                stack.push(Step::Exit(i, pushed));
                for &child in children[i].iter().rev() {
                    stack.push(Step::Enter(child));
                }
            }
            Step::Exit(_, pushed) => {
                for (parent, count) in pushed {
                    for _ in 0..count {
                        if let Some(s) = renamer.stacks.get_mut(&parent) {
                            s.pop();
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::options::Options;
    use crate::core::instruction::{Condition, IrType};
    use crate::ty::{CilBody, CilOp, MethodSig, Primitive, TypeLayout, TypeSystemBuilder};
    use std::sync::Arc;

    fn ssa_of(
        ops: Vec<CilOp>,
        locals: usize,
        check: impl FnOnce(&MethodContext),
    ) {
        let mut b = TypeSystemBuilder::new();
        let i4 = b.primitive(Primitive::I4);
        let cls = b.class("Test");
        let body = CilBody {
            locals: vec![i4; locals],
            ops,
            protected: Vec::new(),
        };
        let m = b.static_method(cls, "M", MethodSig::new(vec![i4], Some(i4)), body);
        let layout = TypeLayout::new(Arc::new(b.build()), 8, 8).unwrap();
        let options = Options::default();
        let mut ctx = MethodContext::new(m, layout.type_system(), &layout, &options);
        crate::stages::decode::CilDecoderStage.run(&mut ctx).unwrap();
        SsaConstructionStage.run(&mut ctx).unwrap();
        check(&ctx);
    }

    fn count_defs(ctx: &MethodContext) -> HashMap<VRegId, usize> {
        let mut defs: HashMap<VRegId, usize> = HashMap::new();
        for b in ctx.graph.block_ids() {
            for n in ctx.graph.block_nodes(b) {
                for r in &ctx.graph.node(n).results {
                    if let Some(v) = r.vreg() {
                        *defs.entry(v).or_insert(0) += 1;
                    }
                }
            }
        }
        defs
    }

    #[test]
    fn diamond_gets_a_phi() {
        // local = arg; if (arg < 10) local = 1; else local = 2; return local
        let ops = vec![
            CilOp::LdArg(0),
            CilOp::LdcI4(10),
            CilOp::Bge(6),
            CilOp::LdcI4(1),
            CilOp::StLoc(0),
            CilOp::Br(8),
            CilOp::LdcI4(2),
            CilOp::StLoc(0),
            CilOp::LdLoc(0),
            CilOp::Ret,
        ];
        ssa_of(ops, 1, |ctx| {
            assert!(ctx.is_in_ssa_form);
            let phi_count: usize = ctx
                .graph
                .block_ids()
                .map(|b| ctx.graph.block_phis(b).len())
                .sum();
            assert!(phi_count >= 1, "expected at least one phi");
        });
    }

    #[test]
    fn every_versioned_register_has_one_definition() {
        let ops = vec![
            CilOp::LdcI4(0),
            CilOp::StLoc(0),
            // loop: local = local + arg; if (local < 100) loop
            CilOp::LdLoc(0),
            CilOp::LdArg(0),
            CilOp::Add,
            CilOp::StLoc(0),
            CilOp::LdLoc(0),
            CilOp::LdcI4(100),
            CilOp::Blt(2),
            CilOp::LdLoc(0),
            CilOp::Ret,
        ];
        ssa_of(ops, 1, |ctx| {
            for (vreg, count) in count_defs(ctx) {
                if let Some(info) = ctx.vregs.ssa(vreg) {
                    if info.version > 0 {
                        assert_eq!(count, 1, "{vreg} defined {count} times");
                    }
                }
            }
        });
    }

    #[test]
    fn phi_operand_count_matches_predecessors() {
        let ops = vec![
            CilOp::LdcI4(0),
            CilOp::StLoc(0),
            CilOp::LdLoc(0),
            CilOp::LdArg(0),
            CilOp::Add,
            CilOp::StLoc(0),
            CilOp::LdLoc(0),
            CilOp::LdcI4(100),
            CilOp::Blt(2),
            CilOp::LdLoc(0),
            CilOp::Ret,
        ];
        ssa_of(ops, 1, |ctx| {
            for b in ctx.graph.block_ids() {
                for phi in ctx.graph.block_phis(b) {
                    let node = ctx.graph.node(phi);
                    let blocks = node.phi_blocks.as_ref().expect("phi blocks");
                    assert_eq!(node.operands.len(), blocks.len());
                    assert_eq!(node.operands.len(), ctx.graph.preds(b).len());
                }
            }
        });
    }

    #[test]
    fn straightline_code_gets_no_phi() {
        let ops = vec![CilOp::LdArg(0), CilOp::LdcI4(3), CilOp::Add, CilOp::Ret];
        ssa_of(ops, 0, |ctx| {
            let phi_count: usize = ctx
                .graph
                .block_ids()
                .map(|b| ctx.graph.block_phis(b).len())
                .sum();
            assert_eq!(phi_count, 0);
            assert!(ctx.is_in_ssa_form);
        });
    }

    #[test]
    fn compare_branch_conditions_survive_renaming() {
        let ops = vec![
            CilOp::LdArg(0),
            CilOp::LdcI4(5),
            CilOp::Blt(4),
            CilOp::Nop,
            CilOp::LdArg(0),
            CilOp::Ret,
        ];
        ssa_of(ops, 0, |ctx| {
            let mut seen = false;
            for b in ctx.graph.block_ids() {
                for n in ctx.graph.block_nodes(b) {
                    let node = ctx.graph.node(n);
                    if node.opcode == crate::core::instruction::Opcode::Ir(IrOp::CmpBranch32) {
                        assert_eq!(node.cond, Some(Condition::Less));
                        assert_eq!(node.ty, Some(IrType::I32));
                        seen = true;
                    }
                }
            }
            assert!(seen);
        });
    }
}
