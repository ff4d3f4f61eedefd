// Dead-code elimination over use counts. A node dies when every result register has no
// remaining use and the descriptor reports no side effect (no memory write, ordinary flow).
// Removing a node decrements the counts of its operands, so chains of dead computation
// unravel in one worklist pass.

use std::collections::HashMap;

use crate::core::error::CompileResult;
use crate::core::graph::NodeId;
use crate::core::operand::VRegId;
use crate::stages::{MethodContext, Stage};

pub struct DeadCodeEliminationStage;

impl Stage for DeadCodeEliminationStage {
    fn name(&self) -> &'static str {
        "dead-code-elimination"
    }

    fn run(&mut self, ctx: &mut MethodContext) -> CompileResult<()> {
        if !ctx.options.optimize || !ctx.options.dead_code_elimination {
            return Ok(());
        }

        let mut uses: HashMap<VRegId, usize> = HashMap::new();
        let mut defs: HashMap<VRegId, Vec<NodeId>> = HashMap::new();
        let node_count = ctx.graph.node_count() as u32;
        for raw in 0..node_count {
            let node_id = NodeId(raw);
            let node = ctx.graph.node(node_id);
            if node.is_empty() {
                continue;
            }
            for op in &node.operands {
                if let Some(v) = op.vreg() {
                    *uses.entry(v).or_insert(0) += 1;
                }
            }
            for r in &node.results {
                if let Some(v) = r.vreg() {
                    defs.entry(v).or_default().push(node_id);
                }
            }
        }

        let mut removed = 0i64;
        let mut worklist: Vec<NodeId> = (0..node_count).map(NodeId).collect();
        while let Some(node_id) = worklist.pop() {
            let node = ctx.graph.node(node_id);
            if node.is_empty() || node.results.is_empty() {
                continue;
            }
            if node.opcode.desc().has_side_effect() {
                continue;
            }
            let dead = node.results.iter().all(|r| match r.vreg() {
                Some(v) => uses.get(&v).copied().unwrap_or(0) == 0,
                // A non-register result (fixed CPU register) is observable.
                None => false,
            });
            if !dead {
                continue;
            }
            // Dropping this node may kill its operands' definitions.
            let mut revisit: Vec<VRegId> = Vec::new();
            for op in &node.operands {
                if let Some(v) = op.vreg() {
                    revisit.push(v);
                }
            }
            ctx.graph.empty_node(node_id);
            removed += 1;
            for v in revisit {
                if let Some(count) = uses.get_mut(&v) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        if let Some(def_nodes) = defs.get(&v) {
                            worklist.extend(def_nodes.iter().copied());
                        }
                    }
                }
            }
        }

        ctx.counters.update("dce.removed", removed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::options::Options;
    use crate::core::graph::Node;
    use crate::core::instruction::{IrOp, IrType, Opcode};
    use crate::core::operand::Operand;
    use crate::ty::{CilBody, MethodFlags, MethodSig, Primitive, TypeLayout, TypeSystemBuilder};
    use std::sync::Arc;

    fn with_ctx(check: impl FnOnce(&mut MethodContext)) {
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
        let mut ctx = MethodContext::new(
            crate::ty::MethodId(0),
            layout.type_system(),
            &layout,
            &options,
        );
        check(&mut ctx);
    }

    #[test]
    fn removes_dead_chains() {
        with_ctx(|ctx| {
            let block = ctx.graph.create_block();
            let a = ctx.vregs.alloc(IrType::I32);
            let b = ctx.vregs.alloc(IrType::I32);
            // a = 1; b = a + 2; nothing uses b.
            let def_a = ctx.graph.append(
                block,
                Node::ir(IrOp::Move32)
                    .result(Operand::VReg(a))
                    .operand(Operand::i32(1))
                    .with_ty(IrType::I32),
            );
            let def_b = ctx.graph.append(
                block,
                Node::ir(IrOp::Add32)
                    .result(Operand::VReg(b))
                    .operand(Operand::VReg(a))
                    .operand(Operand::i32(2))
                    .with_ty(IrType::I32),
            );
            DeadCodeEliminationStage.run(ctx).unwrap();
            assert!(ctx.graph.node(def_a).is_empty());
            assert!(ctx.graph.node(def_b).is_empty());
        });
    }

    #[test]
    fn keeps_live_and_side_effecting_nodes() {
        with_ctx(|ctx| {
            let block = ctx.graph.create_block();
            let a = ctx.vregs.alloc(IrType::I32);
            let def_a = ctx.graph.append(
                block,
                Node::ir(IrOp::Move32)
                    .result(Operand::VReg(a))
                    .operand(Operand::i32(1))
                    .with_ty(IrType::I32),
            );
            let store = ctx.graph.append(
                block,
                Node::ir(IrOp::Store32)
                    .operand(Operand::Constant(crate::core::operand::ConstValue::Symbol(
                        "Data::field".to_string(),
                    )))
                    .operand(Operand::i32(0))
                    .operand(Operand::VReg(a))
                    .with_ty(IrType::I32),
            );
            DeadCodeEliminationStage.run(ctx).unwrap();
            assert!(!ctx.graph.node(def_a).is_empty());
            assert_eq!(ctx.graph.node(store).opcode, Opcode::Ir(IrOp::Store32));
        });
    }
}
