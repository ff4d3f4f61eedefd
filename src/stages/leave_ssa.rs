// Leave-SSA eliminates phi nodes and SSA versions. Every versioned register maps to a
// replacement: version 0 resolves to its pre-SSA parent, any other version to a fresh plain
// register of the same type. For each phi, a copy into the phi's replacement is inserted at
// the end of every predecessor, immediately before that block's terminator group, using a
// compound move for stack-resident value types and the width-appropriate scalar move
// otherwise. Copies whose source and destination are the same slot are skipped, the phi is
// emptied, and a final sweep rewrites every remaining operand and result.

use std::collections::HashMap;

use crate::core::error::CompileResult;
use crate::core::graph::{Node, NodeId};
use crate::core::instruction::IrType;
use crate::core::operand::{Operand, VRegId};
use crate::stages::decode::move_op;
use crate::stages::{MethodContext, Stage};

pub struct LeaveSsaStage;

impl Stage for LeaveSsaStage {
    fn name(&self) -> &'static str {
        "leave-ssa"
    }

    fn run(&mut self, ctx: &mut MethodContext) -> CompileResult<()> {
        if !ctx.is_in_ssa_form {
            return Ok(());
        }
        let ptr_size = ctx.layout.ptr_size();
        let mut map: HashMap<VRegId, VRegId> = HashMap::new();
        let mut copies = 0i64;

        // Resolve phis block by block.
        let blocks: Vec<_> = ctx.graph.block_ids().collect();
        for block in blocks {
            for phi_id in ctx.graph.block_phis(block) {
                let (result, operands, sources, ty) = {
                    let node = ctx.graph.node(phi_id);
                    (
                        node.results[0].clone(),
                        node.operands.to_vec(),
                        node.phi_blocks.clone().unwrap_or_default(),
                        node.ty.unwrap_or(IrType::I32),
                    )
                };
                let dest = replacement_operand(ctx, &mut map, &result);

                for (operand, source_block) in operands.iter().zip(sources.iter()) {
                    let src = replacement_operand(ctx, &mut map, operand);
                    if src == dest {
                        continue;
                    }
                    let copy = Node::ir(move_op(ty, ptr_size))
                        .result(dest.clone())
                        .operand(src)
                        .with_ty(ty);
                    match ctx.graph.terminator_group_start(*source_block) {
                        Some(at) => {
                            ctx.graph.insert_before(at, copy);
                        }
                        None => {
                            ctx.graph.append(*source_block, copy);
                        }
                    }
                    copies += 1;
                }
                ctx.graph.empty_node(phi_id);
            }
        }

        // Rewrite every remaining SSA operand and result.
        let node_count = ctx.graph.node_count() as u32;
        for raw in 0..node_count {
            let node_id = NodeId(raw);
            if ctx.graph.node(node_id).is_empty() {
                continue;
            }
            let operand_count = ctx.graph.node(node_id).operands.len();
            for k in 0..operand_count {
                let operand = ctx.graph.node(node_id).operands[k].clone();
                let rewritten = replacement_operand(ctx, &mut map, &operand);
                if rewritten != operand {
                    ctx.graph.node_mut(node_id).operands[k] = rewritten;
                }
            }
            let result_count = ctx.graph.node(node_id).results.len();
            for k in 0..result_count {
                let result = ctx.graph.node(node_id).results[k].clone();
                let rewritten = replacement_operand(ctx, &mut map, &result);
                if rewritten != result {
                    ctx.graph.node_mut(node_id).results[k] = rewritten;
                }
            }
        }

        ctx.is_in_ssa_form = false;
        ctx.counters.update("leave-ssa.copies", copies);
        Ok(())
    }
}

/// Non-SSA replacement of an operand: version 0 becomes the SSA parent, any
/// other version a fresh register of the same type. Non-register operands
/// pass through.
fn replacement_operand(
    ctx: &mut MethodContext,
    map: &mut HashMap<VRegId, VRegId>,
    operand: &Operand,
) -> Operand {
    let Some(vreg) = operand.vreg() else {
        return operand.clone();
    };
    let Some(info) = ctx.vregs.ssa(vreg) else {
        return operand.clone();
    };
    if let Some(&mapped) = map.get(&vreg) {
        return Operand::VReg(mapped);
    }
    let mapped = if info.version == 0 {
        info.parent
    } else {
        ctx.vregs.alloc(ctx.vregs.ty(vreg))
    };
    map.insert(vreg, mapped);
    Operand::VReg(mapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::options::Options;
    use crate::core::graph::BlockId;
    use crate::core::instruction::{Condition, IrOp, Opcode};
    use crate::ty::{CilBody, MethodFlags, MethodSig, Primitive, TypeLayout, TypeSystemBuilder};
    use std::sync::Arc;

    fn empty_method_ctx(check: impl FnOnce(&TypeLayout, &Options)) {
        let mut b = TypeSystemBuilder::new();
        let i4 = b.primitive(Primitive::I4);
        let cls = b.class("Test");
        b.method(
            cls,
            "M",
            MethodFlags {
                is_static: true,
                ..MethodFlags::default()
            },
            MethodSig::new(vec![i4], Some(i4)),
            Some(CilBody::default()),
        );
        let layout = TypeLayout::new(Arc::new(b.build()), 8, 8).unwrap();
        let options = Options::default();
        check(&layout, &options);
    }

    /// Build the scenario by hand: block C holds `x = phi(x1 from A, x2
    /// from B)`; A and B jump to C; C returns x.
    fn build_phi_graph(ctx: &mut MethodContext, ty: IrType) -> (BlockId, BlockId, BlockId) {
        let x_parent = ctx.vregs.alloc(ty);
        let x = ctx.vregs.alloc_ssa(x_parent, 1);
        let x1 = ctx.vregs.alloc_ssa(x_parent, 2);
        let x2 = ctx.vregs.alloc_ssa(x_parent, 3);

        let a = ctx.graph.create_block();
        let b = ctx.graph.create_block();
        let c = ctx.graph.create_block();
        ctx.prologue = Some(a);

        let ptr_size = ctx.layout.ptr_size();
        ctx.graph.append(
            a,
            Node::ir(move_op(ty, ptr_size))
                .result(Operand::VReg(x1))
                .operand(Operand::i32(1))
                .with_ty(ty),
        );
        ctx.graph.append(
            a,
            Node::ir(IrOp::CmpBranch32)
                .operand(Operand::i32(0))
                .operand(Operand::i32(1))
                .with_cond(Condition::Equal)
                .target(b),
        );
        ctx.graph.append(a, Node::ir(IrOp::Jmp).target(c));

        ctx.graph.append(
            b,
            Node::ir(move_op(ty, ptr_size))
                .result(Operand::VReg(x2))
                .operand(Operand::i32(2))
                .with_ty(ty),
        );
        ctx.graph.append(b, Node::ir(IrOp::Jmp).target(c));

        let mut phi = Node::ir(IrOp::Phi)
            .result(Operand::VReg(x))
            .operand(Operand::VReg(x1))
            .operand(Operand::VReg(x2))
            .with_ty(ty);
        phi.phi_blocks = Some(vec![a, b]);
        ctx.graph.prepend(c, phi);
        ctx.graph.append(
            c,
            Node::ir(IrOp::Return)
                .operand(Operand::VReg(x))
                .with_ty(ty),
        );

        ctx.graph.recompute_edges();
        ctx.is_in_ssa_form = true;
        (a, b, c)
    }

    #[test]
    fn phi_copies_land_before_the_terminator_group() {
        empty_method_ctx(|layout, options| {
            let mut ctx = MethodContext::new(
                crate::ty::MethodId(0),
                layout.type_system(),
                layout,
                options,
            );
            let (a, b, c) = build_phi_graph(&mut ctx, IrType::I32);
            LeaveSsaStage.run(&mut ctx).unwrap();

            assert!(!ctx.is_in_ssa_form);
            // No phi remains anywhere.
            for block in ctx.graph.block_ids() {
                assert!(ctx.graph.block_phis(block).is_empty());
            }
            // No operand reports itself as SSA.
            for block in ctx.graph.block_ids() {
                for n in ctx.graph.block_nodes(block) {
                    let node = ctx.graph.node(n);
                    for op in node.operands.iter().chain(node.results.iter()) {
                        if let Some(v) = op.vreg() {
                            assert!(ctx.vregs.ssa(v).is_none(), "SSA operand survived");
                        }
                    }
                }
            }

            // A's copy sits immediately before its terminator group.
            let a_nodes: Vec<_> = ctx.graph.block_nodes(a).collect();
            let group_start = ctx.graph.terminator_group_start(a).unwrap();
            let group_pos = a_nodes.iter().position(|&n| n == group_start).unwrap();
            assert!(group_pos > 0);
            let copy = ctx.graph.node(a_nodes[group_pos - 1]);
            assert_eq!(copy.opcode, Opcode::Ir(IrOp::Move32));

            // B ends with copy then jmp.
            let b_nodes: Vec<_> = ctx.graph.block_nodes(b).collect();
            let last = ctx.graph.node(*b_nodes.last().unwrap());
            assert_eq!(last.opcode, Opcode::Ir(IrOp::Jmp));
            let second_last = ctx.graph.node(b_nodes[b_nodes.len() - 2]);
            assert_eq!(second_last.opcode, Opcode::Ir(IrOp::Move32));

            // C starts with the rewritten return.
            let c_first = ctx.graph.block_nodes(c).next().unwrap();
            assert_eq!(ctx.graph.node(c_first).opcode, Opcode::Ir(IrOp::Return));
        });
    }

    #[test]
    fn compound_phis_use_compound_moves() {
        empty_method_ctx(|layout, options| {
            let mut ctx = MethodContext::new(
                crate::ty::MethodId(0),
                layout.type_system(),
                layout,
                options,
            );
            let (a, _b, _c) = build_phi_graph(&mut ctx, IrType::Compound(24));
            LeaveSsaStage.run(&mut ctx).unwrap();
            let mut compound_moves = 0;
            for block in ctx.graph.block_ids() {
                for n in ctx.graph.block_nodes(block) {
                    if ctx.graph.node(n).opcode == Opcode::Ir(IrOp::MoveCompound) {
                        compound_moves += 1;
                    }
                }
            }
            // One copy per predecessor edge, plus the two original defs.
            assert!(compound_moves >= 2);
            let _ = a;
        });
    }

    #[test]
    fn version_zero_resolves_to_the_parent() {
        empty_method_ctx(|layout, options| {
            let mut ctx = MethodContext::new(
                crate::ty::MethodId(0),
                layout.type_system(),
                layout,
                options,
            );
            let parent = ctx.vregs.alloc(IrType::I32);
            let v0 = ctx.vregs.alloc_ssa(parent, 0);
            let block = ctx.graph.create_block();
            ctx.prologue = Some(block);
            ctx.graph.append(
                block,
                Node::ir(IrOp::Return)
                    .operand(Operand::VReg(v0))
                    .with_ty(IrType::I32),
            );
            ctx.is_in_ssa_form = true;
            LeaveSsaStage.run(&mut ctx).unwrap();
            let ret = ctx.graph.block_nodes(block).next().unwrap();
            assert_eq!(
                ctx.graph.node(ret).operands[0],
                Operand::VReg(parent),
            );
        });
    }
}
