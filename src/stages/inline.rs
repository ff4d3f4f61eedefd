// Inlining of small leaf callees. A candidate is a static method with a straight-line body:
// no branches, no calls, no protected regions, and at most the configured op count. The
// callee is decoded into a scratch context, its registers and blocks are remapped into the
// caller, parameter loads become argument moves, and the return becomes a move into the call
// result followed by a jump to the split-off continuation block. Phis naming the split block
// as a source are repointed at the continuation.

use std::collections::HashMap;

use crate::core::error::CompileResult;
use crate::core::graph::{BlockId, Node, NodeId};
use crate::core::instruction::{IrOp, Opcode};
use crate::core::operand::{Operand, VRegId};
use crate::stages::decode::{move_op, CilDecoderStage};
use crate::stages::{MethodContext, Stage};
use crate::ty::{CilOp, MethodId};

pub struct InlineStage;

impl Stage for InlineStage {
    fn name(&self) -> &'static str {
        "inlining"
    }

    fn run(&mut self, ctx: &mut MethodContext) -> CompileResult<()> {
        if !ctx.options.optimize || !ctx.options.inlining || ctx.has_protected_regions {
            return Ok(());
        }

        // Collect candidate call sites first; splicing invalidates iteration.
        let mut sites: Vec<(NodeId, MethodId)> = Vec::new();
        for block in ctx.graph.block_ids() {
            for node_id in ctx.graph.block_nodes(block) {
                let node = ctx.graph.node(node_id);
                if node.opcode != Opcode::Ir(IrOp::Call) {
                    continue;
                }
                let Some(Operand::Symbol(symbol)) = node.operands.first() else {
                    continue;
                };
                if let Some(callee) = find_method_by_symbol(ctx, symbol) {
                    if is_candidate(ctx, callee) {
                        sites.push((node_id, callee));
                    }
                }
            }
        }

        let mut hits = 0i64;
        for (call, callee) in sites {
            if splice(ctx, call, callee)? {
                hits += 1;
            }
        }
        if hits > 0 {
            ctx.graph.recompute_edges();
        }
        ctx.counters.update("inline.hits", hits);
        Ok(())
    }
}

fn find_method_by_symbol(ctx: &MethodContext, symbol: &str) -> Option<MethodId> {
    ctx.ts
        .methods_with_bodies()
        .find(|&m| ctx.ts.method_symbol(m) == symbol)
}

fn is_candidate(ctx: &MethodContext, callee: MethodId) -> bool {
    if callee == ctx.method {
        return false;
    }
    let method = ctx.ts.method(callee);
    if !method.flags.is_static {
        return false;
    }
    let Some(body) = &method.body else {
        return false;
    };
    if !body.protected.is_empty() || body.ops.len() > ctx.options.inline_max_ops {
        return false;
    }
    body.ops.iter().all(|op| {
        !matches!(
            op,
            CilOp::Br(_)
                | CilOp::BrTrue(_)
                | CilOp::BrFalse(_)
                | CilOp::Beq(_)
                | CilOp::Bne(_)
                | CilOp::Blt(_)
                | CilOp::Ble(_)
                | CilOp::Bgt(_)
                | CilOp::Bge(_)
                | CilOp::BltUn(_)
                | CilOp::BgeUn(_)
                | CilOp::Switch(_)
                | CilOp::Call(_)
                | CilOp::CallVirt(_)
                | CilOp::NewObj(_)
        )
    })
}

/// Splice the callee body in place of the call node. Returns false when the
/// callee turns out not to decode cleanly; the call is left as-is then.
fn splice(ctx: &mut MethodContext, call: NodeId, callee: MethodId) -> CompileResult<bool> {
    let mut scratch = MethodContext::new(callee, ctx.ts, ctx.layout, ctx.options);
    if CilDecoderStage.run(&mut scratch).is_err() {
        return Ok(false);
    }

    let args: Vec<Operand> = ctx.graph.node(call).operands.iter().skip(1).cloned().collect();
    let result = ctx.graph.node(call).results.first().cloned();
    let call_block = ctx.graph.node(call).block;

    // The continuation takes everything after the call.
    let next = ctx
        .graph
        .block_nodes(call_block)
        .skip_while(|&n| n != call)
        .nth(1);
    let Some(next) = next else {
        return Err(crate::core::error::CompileError::invariant(
            "inlining",
            "call node terminates a block",
        ));
    };
    let cont = ctx.graph.split_block_before(next);

    // Remap callee registers and blocks into the caller.
    let mut vreg_map: HashMap<VRegId, VRegId> = HashMap::new();
    for raw in 0..scratch.vregs.count() {
        let old = VRegId(raw);
        vreg_map.insert(old, ctx.vregs.alloc(scratch.vregs.ty(old)));
    }
    let mut block_map: HashMap<BlockId, BlockId> = HashMap::new();
    let scratch_blocks: Vec<BlockId> = scratch.graph.block_ids().collect();
    for &b in &scratch_blocks {
        block_map.insert(b, ctx.graph.create_block());
    }

    let ptr_size = ctx.layout.ptr_size();
    for &scratch_block in &scratch_blocks {
        let target_block = block_map[&scratch_block];
        for node_id in scratch.graph.block_nodes(scratch_block).collect::<Vec<_>>() {
            let node = scratch.graph.node(node_id);
            match node.opcode {
                Opcode::Ir(IrOp::Return) => {
                    if let (Some(result), Some(value)) = (result.clone(), node.operands.first()) {
                        let ty = node.ty.unwrap_or(crate::core::instruction::IrType::I32);
                        let copy = Node::ir(move_op(ty, ptr_size))
                            .result(result)
                            .operand(remap_operand(&scratch, &vreg_map, &args, value)?)
                            .with_ty(ty);
                        ctx.graph.append(target_block, copy);
                    }
                    ctx.graph
                        .append(target_block, Node::ir(IrOp::Jmp).target(cont));
                }
                Opcode::Ir(IrOp::ReturnVoid) => {
                    ctx.graph
                        .append(target_block, Node::ir(IrOp::Jmp).target(cont));
                }
                _ => {
                    let mut copy = node.clone();
                    for operand in copy.operands.iter_mut() {
                        *operand = remap_operand(&scratch, &vreg_map, &args, operand)?;
                    }
                    for res in copy.results.iter_mut() {
                        if let Some(v) = res.vreg() {
                            *res = Operand::VReg(vreg_map[&v]);
                        }
                    }
                    let targets: Vec<BlockId> =
                        copy.targets.iter().map(|t| block_map[t]).collect();
                    copy.targets.clear();
                    for t in targets {
                        copy.targets.push(t);
                    }
                    ctx.graph.append(target_block, copy);
                }
            }
        }
    }

    // The call becomes a jump into the spliced prologue.
    let entry = block_map[&scratch.prologue.expect("scratch prologue")];
    ctx.graph.empty_node(call);
    ctx.graph.append(call_block, Node::ir(IrOp::Jmp).target(entry));

    // Successor phis that named the original block now see the continuation.
    let node_count = ctx.graph.node_count() as u32;
    for raw in 0..node_count {
        let node_id = NodeId(raw);
        let node = ctx.graph.node(node_id);
        if node.is_empty() || !node.is_phi() {
            continue;
        }
        if let Some(blocks) = &node.phi_blocks {
            if blocks.contains(&call_block) {
                let updated: Vec<BlockId> = blocks
                    .iter()
                    .map(|&b| if b == call_block { cont } else { b })
                    .collect();
                ctx.graph.node_mut(node_id).phi_blocks = Some(updated);
            }
        }
    }

    log::debug!(
        "inlined {} into {}",
        ctx.ts.method_symbol(callee),
        ctx.trace.method
    );
    Ok(true)
}

/// Map a callee operand into the caller: registers go through the remap
/// table, parameter-slot reads become the call arguments.
fn remap_operand(
    scratch: &MethodContext,
    vreg_map: &HashMap<VRegId, VRegId>,
    args: &[Operand],
    operand: &Operand,
) -> CompileResult<Operand> {
    match operand {
        Operand::VReg(v) => Ok(Operand::VReg(vreg_map[v])),
        Operand::Stack(slot) => {
            let param_index = scratch
                .params
                .iter()
                .position(|s| s == slot)
                .ok_or_else(|| {
                    crate::core::error::CompileError::invariant(
                        "inlining",
                        "unexpected stack slot in a leaf callee",
                    )
                })?;
            args.get(param_index).cloned().ok_or_else(|| {
                crate::core::error::CompileError::invariant(
                    "inlining",
                    "argument count mismatch at an inlined call",
                )
            })
        }
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::options::Options;
    use crate::stages::ssa::SsaConstructionStage;
    use crate::ty::{CilBody, MethodSig, Primitive, TypeLayout, TypeSystemBuilder};
    use std::sync::Arc;

    #[test]
    fn inlines_a_leaf_add_helper() {
        let mut b = TypeSystemBuilder::new();
        let i4 = b.primitive(Primitive::I4);
        let cls = b.class("Test");
        let helper_body = CilBody {
            locals: vec![],
            ops: vec![CilOp::LdArg(0), CilOp::LdArg(1), CilOp::Add, CilOp::Ret],
            protected: Vec::new(),
        };
        let helper = b.static_method(
            cls,
            "AddPair",
            MethodSig::new(vec![i4, i4], Some(i4)),
            helper_body,
        );
        let caller_body = CilBody {
            locals: vec![],
            ops: vec![
                CilOp::LdArg(0),
                CilOp::LdcI4(5),
                CilOp::Call(helper),
                CilOp::Ret,
            ],
            protected: Vec::new(),
        };
        let caller = b.static_method(cls, "M", MethodSig::new(vec![i4], Some(i4)), caller_body);
        let layout = TypeLayout::new(Arc::new(b.build()), 8, 8).unwrap();
        let options = Options::default();
        let mut ctx = MethodContext::new(caller, layout.type_system(), &layout, &options);
        CilDecoderStage.run(&mut ctx).unwrap();
        SsaConstructionStage.run(&mut ctx).unwrap();
        InlineStage.run(&mut ctx).unwrap();

        assert_eq!(ctx.counters.get("inline.hits"), 1);
        for block in ctx.graph.block_ids() {
            for n in ctx.graph.block_nodes(block) {
                assert_ne!(
                    ctx.graph.node(n).opcode,
                    Opcode::Ir(IrOp::Call),
                    "call survived inlining"
                );
            }
        }
    }

    #[test]
    fn rejects_callees_with_branches() {
        let mut b = TypeSystemBuilder::new();
        let i4 = b.primitive(Primitive::I4);
        let cls = b.class("Test");
        let helper_body = CilBody {
            locals: vec![],
            ops: vec![
                CilOp::LdArg(0),
                CilOp::BrTrue(3),
                CilOp::LdcI4(0),
                CilOp::LdcI4(1),
                CilOp::Ret,
            ],
            protected: Vec::new(),
        };
        let helper = b.static_method(cls, "Branchy", MethodSig::new(vec![i4], Some(i4)), helper_body);
        let caller_body = CilBody {
            locals: vec![],
            ops: vec![CilOp::LdArg(0), CilOp::Call(helper), CilOp::Ret],
            protected: Vec::new(),
        };
        let caller = b.static_method(cls, "M", MethodSig::new(vec![i4], Some(i4)), caller_body);
        let layout = TypeLayout::new(Arc::new(b.build()), 8, 8).unwrap();
        let options = Options::default();
        let mut ctx = MethodContext::new(caller, layout.type_system(), &layout, &options);
        CilDecoderStage.run(&mut ctx).unwrap();
        SsaConstructionStage.run(&mut ctx).unwrap();
        InlineStage.run(&mut ctx).unwrap();
        assert_eq!(ctx.counters.get("inline.hits"), 0);
    }
}
