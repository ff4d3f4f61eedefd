// Dominator-scoped value numbering. Pure single-result nodes are keyed by opcode, condition,
// type and canonicalized operands (commutative operands sorted); a node whose key is already
// bound in an enclosing dominator scope is deleted and its register substituted by the
// earlier value. Substitutions resolve transitively and a final sweep rewrites every
// surviving operand, phi inputs included.

use std::collections::HashMap;

use crate::core::error::CompileResult;
use crate::core::graph::{BlockId, NodeId};
use crate::core::instruction::{Condition, IrOp, IrType, Opcode};
use crate::core::operand::{ConstValue, Operand, VRegId};
use crate::stages::{MethodContext, Stage};

pub struct ValueNumberingStage;

impl Stage for ValueNumberingStage {
    fn name(&self) -> &'static str {
        "value-numbering"
    }

    fn run(&mut self, ctx: &mut MethodContext) -> CompileResult<()> {
        if !ctx.options.optimize
            || !ctx.options.value_numbering
            || !ctx.is_in_ssa_form
            || ctx.has_protected_regions
        {
            return Ok(());
        }
        ctx.graph.recompute_edges();
        let rpo = ctx.reverse_post_order();
        if rpo.is_empty() {
            return Ok(());
        }
        let mut index = HashMap::new();
        for (i, &b) in rpo.iter().enumerate() {
            index.insert(b, i);
        }
        let idom = crate::stages::ssa::dominators(ctx, &rpo, &index);
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); rpo.len()];
        for i in 1..rpo.len() {
            children[idom[i]].push(i);
        }

        let mut subst: HashMap<VRegId, Operand> = HashMap::new();
        let mut scopes: Vec<HashMap<ExprKey, Operand>> = Vec::new();
        let mut hits = 0i64;

        enum Step {
            Enter(usize),
            Exit,
        }
        let mut stack = vec![Step::Enter(0)];
        while let Some(step) = stack.pop() {
            match step {
                Step::Enter(i) => {
                    scopes.push(HashMap::new());
                    let block = rpo[i];
                    let node_ids: Vec<NodeId> = ctx.graph.block_nodes(block).collect();
                    for node_id in node_ids {
                        number_node(ctx, node_id, &mut subst, &mut scopes, &mut hits);
                    }
                    stack.push(Step::Exit);
                    for &child in children[i].iter().rev() {
                        stack.push(Step::Enter(child));
                    }
                }
                Step::Exit => {
                    scopes.pop();
                }
            }
        }

        // Final rewrite, phi operands included.
        let node_count = ctx.graph.node_count() as u32;
        for raw in 0..node_count {
            let node_id = NodeId(raw);
            if ctx.graph.node(node_id).is_empty() {
                continue;
            }
            let operand_count = ctx.graph.node(node_id).operands.len();
            for k in 0..operand_count {
                let operand = ctx.graph.node(node_id).operands[k].clone();
                let resolved = resolve(&subst, &operand);
                if resolved != operand {
                    ctx.graph.node_mut(node_id).operands[k] = resolved;
                }
            }
        }

        ctx.counters.update("gvn.hits", hits);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum OpKey {
    V(u32),
    I32(i32),
    I64(i64),
    R4(u32),
    R8(u64),
    Null,
    Sym(String),
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ExprKey {
    opcode: Opcode,
    cond: Option<Condition>,
    ty: Option<IrType>,
    operands: Vec<OpKey>,
}

fn operand_key(operand: &Operand) -> OpKey {
    match operand {
        Operand::VReg(v) => OpKey::V(v.0),
        Operand::Constant(ConstValue::I8(v)) => OpKey::I32(*v as i32),
        Operand::Constant(ConstValue::I32(v)) => OpKey::I32(*v),
        Operand::Constant(ConstValue::I64(v)) => OpKey::I64(*v),
        Operand::Constant(ConstValue::R4(v)) => OpKey::R4(v.to_bits()),
        Operand::Constant(ConstValue::R8(v)) => OpKey::R8(v.to_bits()),
        Operand::Constant(ConstValue::Null) => OpKey::Null,
        Operand::Constant(ConstValue::Symbol(s)) => OpKey::Sym(s.clone()),
        _ => OpKey::Other,
    }
}

fn resolve(subst: &HashMap<VRegId, Operand>, operand: &Operand) -> Operand {
    let mut current = operand.clone();
    let mut guard = 0;
    while let Some(v) = current.vreg() {
        match subst.get(&v) {
            Some(next) => {
                current = next.clone();
                guard += 1;
                if guard > 64 {
                    break;
                }
            }
            None => break,
        }
    }
    current
}

fn commutative(op: IrOp) -> bool {
    matches!(
        op,
        IrOp::Add32
            | IrOp::Add64
            | IrOp::Mul32
            | IrOp::Mul64
            | IrOp::And32
            | IrOp::And64
            | IrOp::Or32
            | IrOp::Or64
            | IrOp::Xor32
            | IrOp::Xor64
            | IrOp::AddR4
            | IrOp::AddR8
            | IrOp::MulR4
            | IrOp::MulR8
    )
}

fn number_node(
    ctx: &mut MethodContext,
    node_id: NodeId,
    subst: &mut HashMap<VRegId, Operand>,
    scopes: &mut [HashMap<ExprKey, Operand>],
    hits: &mut i64,
) {
    // Apply pending substitutions to this node's operands first.
    let operand_count = ctx.graph.node(node_id).operands.len();
    for k in 0..operand_count {
        let operand = ctx.graph.node(node_id).operands[k].clone();
        let resolved = resolve(subst, &operand);
        if resolved != operand {
            ctx.graph.node_mut(node_id).operands[k] = resolved;
        }
    }

    let node = ctx.graph.node(node_id);
    if node.is_phi() || node.results.len() != 1 || node.opcode.desc().has_side_effect() {
        return;
    }
    let Opcode::Ir(op) = node.opcode else { return };
    // Plain moves are copy propagation, not value numbering.
    if matches!(
        op,
        IrOp::Move32 | IrOp::Move64 | IrOp::MoveR4 | IrOp::MoveR8 | IrOp::MoveCompound
    ) {
        return;
    }
    let Some(result) = node.results[0].vreg() else {
        return;
    };

    let mut operands: Vec<OpKey> = node.operands.iter().map(operand_key).collect();
    // Physical registers and stack slots have no stable value identity.
    if operands.iter().any(|k| *k == OpKey::Other) {
        return;
    }
    if commutative(op) {
        operands.sort();
    }
    let key = ExprKey {
        opcode: node.opcode,
        cond: node.cond,
        ty: node.ty,
        operands,
    };

    for scope in scopes.iter().rev() {
        if let Some(existing) = scope.get(&key) {
            log::trace!("gvn: {} replaced by {}", result, existing);
            subst.insert(result, existing.clone());
            ctx.graph.empty_node(node_id);
            *hits += 1;
            return;
        }
    }
    let top = scopes.len() - 1;
    scopes[top].insert(key, Operand::VReg(result));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::options::Options;
    use crate::core::graph::Node;
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

    fn binary(op: IrOp, dst: VRegId, a: Operand, b: Operand) -> Node {
        Node::ir(op)
            .result(Operand::VReg(dst))
            .operand(a)
            .operand(b)
            .with_ty(IrType::I32)
    }

    #[test]
    fn merges_redundant_expressions() {
        with_ctx(|ctx| {
            let block = ctx.graph.create_block();
            ctx.prologue = Some(block);
            let x = ctx.vregs.alloc(IrType::I32);
            let a = ctx.vregs.alloc(IrType::I32);
            let b = ctx.vregs.alloc(IrType::I32);
            ctx.graph.append(
                block,
                Node::ir(IrOp::Move32)
                    .result(Operand::VReg(x))
                    .operand(Operand::i32(7))
                    .with_ty(IrType::I32),
            );
            ctx.graph
                .append(block, binary(IrOp::Add32, a, Operand::VReg(x), Operand::i32(1)));
            let second =
                ctx.graph
                    .append(block, binary(IrOp::Add32, b, Operand::VReg(x), Operand::i32(1)));
            let ret = ctx.graph.append(
                block,
                Node::ir(IrOp::Return)
                    .operand(Operand::VReg(b))
                    .with_ty(IrType::I32),
            );
            ctx.is_in_ssa_form = true;
            ValueNumberingStage.run(ctx).unwrap();
            assert!(ctx.graph.node(second).is_empty());
            assert_eq!(ctx.graph.node(ret).operands[0], Operand::VReg(a));
        });
    }

    #[test]
    fn commutative_operands_share_a_number() {
        with_ctx(|ctx| {
            let block = ctx.graph.create_block();
            ctx.prologue = Some(block);
            let x = ctx.vregs.alloc(IrType::I32);
            let y = ctx.vregs.alloc(IrType::I32);
            let a = ctx.vregs.alloc(IrType::I32);
            let b = ctx.vregs.alloc(IrType::I32);
            ctx.graph.append(
                block,
                Node::ir(IrOp::Move32)
                    .result(Operand::VReg(x))
                    .operand(Operand::i32(3))
                    .with_ty(IrType::I32),
            );
            ctx.graph.append(
                block,
                Node::ir(IrOp::Move32)
                    .result(Operand::VReg(y))
                    .operand(Operand::i32(4))
                    .with_ty(IrType::I32),
            );
            ctx.graph
                .append(block, binary(IrOp::Add32, a, Operand::VReg(x), Operand::VReg(y)));
            let second =
                ctx.graph
                    .append(block, binary(IrOp::Add32, b, Operand::VReg(y), Operand::VReg(x)));
            ctx.graph.append(
                block,
                Node::ir(IrOp::Return)
                    .operand(Operand::VReg(b))
                    .with_ty(IrType::I32),
            );
            ctx.is_in_ssa_form = true;
            ValueNumberingStage.run(ctx).unwrap();
            assert!(ctx.graph.node(second).is_empty());
        });
    }

    #[test]
    fn subtraction_is_not_commuted() {
        with_ctx(|ctx| {
            let block = ctx.graph.create_block();
            ctx.prologue = Some(block);
            let x = ctx.vregs.alloc(IrType::I32);
            let a = ctx.vregs.alloc(IrType::I32);
            let b = ctx.vregs.alloc(IrType::I32);
            ctx.graph.append(
                block,
                Node::ir(IrOp::Move32)
                    .result(Operand::VReg(x))
                    .operand(Operand::i32(3))
                    .with_ty(IrType::I32),
            );
            ctx.graph
                .append(block, binary(IrOp::Sub32, a, Operand::VReg(x), Operand::i32(1)));
            let second =
                ctx.graph
                    .append(block, binary(IrOp::Sub32, b, Operand::i32(1), Operand::VReg(x)));
            ctx.graph.append(
                block,
                Node::ir(IrOp::Return)
                    .operand(Operand::VReg(b))
                    .with_ty(IrType::I32),
            );
            ctx.is_in_ssa_form = true;
            ValueNumberingStage.run(ctx).unwrap();
            assert!(!ctx.graph.node(second).is_empty());
        });
    }
}
