// Long-integer expansion for 32-bit targets: every 64-bit register becomes a lo/hi pair of
// 32-bit registers. Moves, bitwise logic and loads/stores split pairwise; add and subtract
// split into the flag-carrying pair (add, then add-with-carry) that must stay adjacent;
// 64-bit compare-branches split into a high-word decision followed by an unsigned low-word
// compare; equality compares go through xor/or against zero. Phis over 64-bit values become
// two phis. What the expansion cannot express on this target (64-bit multiply, divide,
// shifts, calls and returns carrying 64-bit values) surfaces as not-supported.

use std::collections::HashMap;

use crate::core::error::{CompileError, CompileResult};
use crate::core::graph::{Node, NodeId};
use crate::core::instruction::{Condition, IrOp, IrType, Opcode};
use crate::core::operand::{ConstValue, Operand, VRegId};
use crate::stages::{MethodContext, Stage};

pub struct LongExpansionStage;

impl Stage for LongExpansionStage {
    fn name(&self) -> &'static str {
        "long-expansion"
    }

    fn run(&mut self, ctx: &mut MethodContext) -> CompileResult<()> {
        if ctx.layout.ptr_size() != 4 {
            return Ok(());
        }
        let mut expander = Expander {
            pairs: HashMap::new(),
            expanded: 0,
        };
        let node_count = ctx.graph.node_count() as u32;
        for raw in 0..node_count {
            let node_id = NodeId(raw);
            if ctx.graph.node(node_id).is_empty() {
                continue;
            }
            expander.expand_node(ctx, node_id)?;
        }
        ctx.counters.update("long-expand.nodes", expander.expanded);
        Ok(())
    }
}

struct Expander {
    pairs: HashMap<VRegId, (VRegId, VRegId)>,
    expanded: i64,
}

impl Expander {
    fn pair(&mut self, ctx: &mut MethodContext, vreg: VRegId) -> (VRegId, VRegId) {
        if let Some(&pair) = self.pairs.get(&vreg) {
            return pair;
        }
        let lo = ctx.vregs.alloc(IrType::I32);
        let hi = ctx.vregs.alloc(IrType::I32);
        self.pairs.insert(vreg, (lo, hi));
        (lo, hi)
    }

    /// Split a 64-bit operand into (lo, hi) 32-bit operands.
    fn split(
        &mut self,
        ctx: &mut MethodContext,
        operand: &Operand,
    ) -> CompileResult<(Operand, Operand)> {
        match operand {
            Operand::Constant(ConstValue::I64(v)) => Ok((
                Operand::i32(*v as u32 as i32),
                Operand::i32((*v >> 32) as i32),
            )),
            Operand::VReg(v) => {
                let (lo, hi) = self.pair(ctx, *v);
                Ok((Operand::VReg(lo), Operand::VReg(hi)))
            }
            _ => Err(CompileError::invariant(
                "long-expansion",
                format!("cannot split operand {operand}"),
            )),
        }
    }

    fn expand_node(&mut self, ctx: &mut MethodContext, node_id: NodeId) -> CompileResult<()> {
        let Opcode::Ir(op) = ctx.graph.node(node_id).opcode else {
            return Ok(());
        };
        match op {
            IrOp::Move64 => {
                let src = ctx.graph.node(node_id).operands[0].clone();
                let dst = self.result_pair(ctx, node_id)?;
                let (src_lo, src_hi) = self.split(ctx, &src)?;
                self.emit_before(ctx, node_id, IrOp::Move32, dst.0, &[src_lo]);
                self.emit_before(ctx, node_id, IrOp::Move32, dst.1, &[src_hi]);
                self.finish(ctx, node_id);
            }
            IrOp::And64 | IrOp::Or64 | IrOp::Xor64 => {
                let op32 = match op {
                    IrOp::And64 => IrOp::And32,
                    IrOp::Or64 => IrOp::Or32,
                    _ => IrOp::Xor32,
                };
                self.expand_pairwise(ctx, node_id, op32, op32)?;
            }
            IrOp::Add64 => {
                self.expand_pairwise(ctx, node_id, IrOp::Add32, IrOp::AddWithCarry32)?
            }
            IrOp::Sub64 => {
                self.expand_pairwise(ctx, node_id, IrOp::Sub32, IrOp::SubWithBorrow32)?
            }
            IrOp::Not64 => {
                let src = ctx.graph.node(node_id).operands[0].clone();
                let dst = self.result_pair(ctx, node_id)?;
                let (src_lo, src_hi) = self.split(ctx, &src)?;
                self.emit_before(ctx, node_id, IrOp::Not32, dst.0, &[src_lo]);
                self.emit_before(ctx, node_id, IrOp::Not32, dst.1, &[src_hi]);
                self.finish(ctx, node_id);
            }
            IrOp::SignExtend32x64 => {
                let src = ctx.graph.node(node_id).operands[0].clone();
                let dst = self.result_pair(ctx, node_id)?;
                self.emit_before(ctx, node_id, IrOp::Move32, dst.0, &[src.clone()]);
                self.emit_before(
                    ctx,
                    node_id,
                    IrOp::ArithShiftRight32,
                    dst.1,
                    &[src, Operand::i32(31)],
                );
                self.finish(ctx, node_id);
            }
            IrOp::ZeroExtend32x64 => {
                let src = ctx.graph.node(node_id).operands[0].clone();
                let dst = self.result_pair(ctx, node_id)?;
                self.emit_before(ctx, node_id, IrOp::Move32, dst.0, &[src]);
                self.emit_before(ctx, node_id, IrOp::Move32, dst.1, &[Operand::i32(0)]);
                self.finish(ctx, node_id);
            }
            IrOp::Truncate64x32 => {
                let src = ctx.graph.node(node_id).operands[0].clone();
                let result = ctx.graph.node(node_id).results[0].clone();
                let (src_lo, _) = self.split(ctx, &src)?;
                let node = ctx.graph.node_mut(node_id);
                node.opcode = Opcode::Ir(IrOp::Move32);
                node.ty = Some(IrType::I32);
                node.operands.clear();
                node.operands.push(src_lo);
                node.results.clear();
                node.results.push(result);
                self.expanded += 1;
            }
            IrOp::Load64 => {
                let (base, offset) = self.base_and_offset(ctx, node_id)?;
                let dst = self.result_pair(ctx, node_id)?;
                self.emit_before(
                    ctx,
                    node_id,
                    IrOp::Load32,
                    dst.0,
                    &[base.clone(), Operand::i32(offset)],
                );
                self.emit_before(
                    ctx,
                    node_id,
                    IrOp::Load32,
                    dst.1,
                    &[base, Operand::i32(offset + 4)],
                );
                self.finish(ctx, node_id);
            }
            IrOp::Store64 => {
                let (base, offset) = self.base_and_offset(ctx, node_id)?;
                let value = ctx.graph.node(node_id).operands[2].clone();
                let (val_lo, val_hi) = self.split(ctx, &value)?;
                let lo = Node::ir(IrOp::Store32)
                    .operand(base.clone())
                    .operand(Operand::i32(offset))
                    .operand(val_lo)
                    .with_ty(IrType::I32);
                let hi = Node::ir(IrOp::Store32)
                    .operand(base)
                    .operand(Operand::i32(offset + 4))
                    .operand(val_hi)
                    .with_ty(IrType::I32);
                ctx.graph.insert_before(node_id, lo);
                ctx.graph.insert_before(node_id, hi);
                self.finish(ctx, node_id);
            }
            IrOp::CmpBranch64 => self.expand_cmp_branch(ctx, node_id)?,
            IrOp::Compare64 => self.expand_compare(ctx, node_id)?,
            IrOp::Phi => {
                if ctx.graph.node(node_id).ty == Some(IrType::I64) {
                    self.expand_phi(ctx, node_id)?;
                }
            }
            IrOp::Mul64
            | IrOp::DivSigned64
            | IrOp::DivUnsigned64
            | IrOp::RemSigned64
            | IrOp::RemUnsigned64
            | IrOp::ShiftLeft64
            | IrOp::ShiftRight64
            | IrOp::ArithShiftRight64
            | IrOp::ConvertI64ToR8 => {
                return Err(CompileError::not_supported(format!(
                    "{} on a 32-bit target",
                    op.desc().name
                )));
            }
            IrOp::Return => {
                if ctx.graph.node(node_id).ty == Some(IrType::I64) {
                    return Err(CompileError::not_supported(
                        "returning a 64-bit value on a 32-bit target",
                    ));
                }
            }
            IrOp::Call => {
                let node = ctx.graph.node(node_id);
                let has_long = node.ty == Some(IrType::I64)
                    || node.operands.iter().any(|o| match o {
                        Operand::VReg(v) => ctx.vregs.ty(*v) == IrType::I64,
                        Operand::Constant(ConstValue::I64(_)) => true,
                        _ => false,
                    });
                if has_long {
                    return Err(CompileError::not_supported(
                        "64-bit call operands on a 32-bit target",
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn result_pair(
        &mut self,
        ctx: &mut MethodContext,
        node_id: NodeId,
    ) -> CompileResult<(VRegId, VRegId)> {
        let result = ctx.graph.node(node_id).results[0]
            .vreg()
            .ok_or_else(|| CompileError::invariant("long-expansion", "non-register result"))?;
        Ok(self.pair(ctx, result))
    }

    fn base_and_offset(
        &mut self,
        ctx: &MethodContext,
        node_id: NodeId,
    ) -> CompileResult<(Operand, i32)> {
        let node = ctx.graph.node(node_id);
        let base = node.operands[0].clone();
        let offset = node.operands[1]
            .constant()
            .and_then(|c| c.as_i64())
            .ok_or_else(|| {
                CompileError::invariant("long-expansion", "memory offset is not a constant")
            })?;
        Ok((base, offset as i32))
    }

    fn emit_before(
        &mut self,
        ctx: &mut MethodContext,
        node_id: NodeId,
        op: IrOp,
        dst: VRegId,
        operands: &[Operand],
    ) {
        let mut node = Node::ir(op)
            .result(Operand::VReg(dst))
            .with_ty(IrType::I32);
        for operand in operands {
            node = node.operand(operand.clone());
        }
        ctx.graph.insert_before(node_id, node);
    }

    fn finish(&mut self, ctx: &mut MethodContext, node_id: NodeId) {
        ctx.graph.empty_node(node_id);
        self.expanded += 1;
    }

    fn expand_pairwise(
        &mut self,
        ctx: &mut MethodContext,
        node_id: NodeId,
        lo_op: IrOp,
        hi_op: IrOp,
    ) -> CompileResult<()> {
        let (a, b) = {
            let node = ctx.graph.node(node_id);
            (node.operands[0].clone(), node.operands[1].clone())
        };
        let dst = self.result_pair(ctx, node_id)?;
        let (a_lo, a_hi) = self.split(ctx, &a)?;
        let (b_lo, b_hi) = self.split(ctx, &b)?;
        self.emit_before(ctx, node_id, lo_op, dst.0, &[a_lo, b_lo]);
        self.emit_before(ctx, node_id, hi_op, dst.1, &[a_hi, b_hi]);
        self.finish(ctx, node_id);
        Ok(())
    }

    /// Split a 64-bit compare-branch into a high-word decision and an
    /// unsigned low-word compare. The not-taken target comes from the jump
    /// that closes the terminator group.
    fn expand_cmp_branch(&mut self, ctx: &mut MethodContext, node_id: NodeId) -> CompileResult<()> {
        let (a, b, cond, taken, block) = {
            let node = ctx.graph.node(node_id);
            (
                node.operands[0].clone(),
                node.operands[1].clone(),
                node.cond.ok_or_else(|| {
                    CompileError::invariant("long-expansion", "compare-branch without condition")
                })?,
                node.targets[0],
                node.block,
            )
        };
        let not_taken = ctx
            .graph
            .block_nodes(block)
            .skip_while(|&n| n != node_id)
            .skip(1)
            .find_map(|n| {
                let node = ctx.graph.node(n);
                if node.opcode == Opcode::Ir(IrOp::Jmp) {
                    Some(node.targets[0])
                } else {
                    None
                }
            })
            .ok_or_else(|| {
                CompileError::invariant("long-expansion", "compare-branch without closing jump")
            })?;

        let (a_lo, a_hi) = self.split(ctx, &a)?;
        let (b_lo, b_hi) = self.split(ctx, &b)?;

        let branch = |cond: Condition, lhs: Operand, rhs: Operand, target| {
            Node::ir(IrOp::CmpBranch32)
                .operand(lhs)
                .operand(rhs)
                .with_cond(cond)
                .with_ty(IrType::I32)
                .target(target)
        };

        match cond {
            Condition::Equal => {
                ctx.graph.insert_before(
                    node_id,
                    branch(Condition::NotEqual, a_hi, b_hi, not_taken),
                );
                ctx.graph
                    .insert_before(node_id, branch(Condition::Equal, a_lo, b_lo, taken));
            }
            Condition::NotEqual => {
                ctx.graph
                    .insert_before(node_id, branch(Condition::NotEqual, a_hi, b_hi, taken));
                ctx.graph
                    .insert_before(node_id, branch(Condition::NotEqual, a_lo, b_lo, taken));
            }
            _ => {
                let (hi_taken, lo_cond) = match cond {
                    Condition::Less => (Condition::Less, Condition::UnsignedLess),
                    Condition::LessOrEqual => (Condition::Less, Condition::UnsignedLessOrEqual),
                    Condition::Greater => (Condition::Greater, Condition::UnsignedGreater),
                    Condition::GreaterOrEqual => {
                        (Condition::Greater, Condition::UnsignedGreaterOrEqual)
                    }
                    Condition::UnsignedLess => {
                        (Condition::UnsignedLess, Condition::UnsignedLess)
                    }
                    Condition::UnsignedLessOrEqual => {
                        (Condition::UnsignedLess, Condition::UnsignedLessOrEqual)
                    }
                    Condition::UnsignedGreater => {
                        (Condition::UnsignedGreater, Condition::UnsignedGreater)
                    }
                    Condition::UnsignedGreaterOrEqual => {
                        (Condition::UnsignedGreater, Condition::UnsignedGreaterOrEqual)
                    }
                    _ => {
                        return Err(CompileError::not_supported(
                            "carry conditions on 64-bit compares",
                        ))
                    }
                };
                ctx.graph.insert_before(
                    node_id,
                    branch(hi_taken, a_hi.clone(), b_hi.clone(), taken),
                );
                ctx.graph
                    .insert_before(node_id, branch(hi_flip(hi_taken), a_hi, b_hi, not_taken));
                ctx.graph
                    .insert_before(node_id, branch(lo_cond, a_lo, b_lo, taken));
            }
        }
        self.finish(ctx, node_id);
        Ok(())
    }

    /// 64-bit equality as a value: or together the xors of both halves and
    /// compare against zero.
    fn expand_compare(&mut self, ctx: &mut MethodContext, node_id: NodeId) -> CompileResult<()> {
        let (a, b, cond, result) = {
            let node = ctx.graph.node(node_id);
            (
                node.operands[0].clone(),
                node.operands[1].clone(),
                node.cond.ok_or_else(|| {
                    CompileError::invariant("long-expansion", "compare without condition")
                })?,
                node.results[0].clone(),
            )
        };
        if !matches!(cond, Condition::Equal | Condition::NotEqual) {
            return Err(CompileError::not_supported(
                "ordered 64-bit compare values on a 32-bit target",
            ));
        }
        let (a_lo, a_hi) = self.split(ctx, &a)?;
        let (b_lo, b_hi) = self.split(ctx, &b)?;
        let t_lo = ctx.vregs.alloc(IrType::I32);
        let t_hi = ctx.vregs.alloc(IrType::I32);
        let t_or = ctx.vregs.alloc(IrType::I32);
        self.emit_before(ctx, node_id, IrOp::Xor32, t_lo, &[a_lo, b_lo]);
        self.emit_before(ctx, node_id, IrOp::Xor32, t_hi, &[a_hi, b_hi]);
        self.emit_before(
            ctx,
            node_id,
            IrOp::Or32,
            t_or,
            &[Operand::VReg(t_lo), Operand::VReg(t_hi)],
        );
        let node = ctx.graph.node_mut(node_id);
        node.opcode = Opcode::Ir(IrOp::Compare32);
        node.ty = Some(IrType::I32);
        node.cond = Some(cond);
        node.operands.clear();
        node.operands.push(Operand::VReg(t_or));
        node.operands.push(Operand::i32(0));
        node.results.clear();
        node.results.push(result);
        self.expanded += 1;
        Ok(())
    }

    fn expand_phi(&mut self, ctx: &mut MethodContext, node_id: NodeId) -> CompileResult<()> {
        let (operands, blocks) = {
            let node = ctx.graph.node(node_id);
            (
                node.operands.to_vec(),
                node.phi_blocks.clone().unwrap_or_default(),
            )
        };
        let dst = self.result_pair(ctx, node_id)?;
        let mut lo_phi = Node::ir(IrOp::Phi)
            .result(Operand::VReg(dst.0))
            .with_ty(IrType::I32);
        let mut hi_phi = Node::ir(IrOp::Phi)
            .result(Operand::VReg(dst.1))
            .with_ty(IrType::I32);
        for operand in &operands {
            let (lo, hi) = self.split(ctx, operand)?;
            lo_phi = lo_phi.operand(lo);
            hi_phi = hi_phi.operand(hi);
        }
        lo_phi.phi_blocks = Some(blocks.clone());
        hi_phi.phi_blocks = Some(blocks);
        ctx.graph.insert_before(node_id, lo_phi);
        ctx.graph.insert_before(node_id, hi_phi);
        self.finish(ctx, node_id);
        Ok(())
    }
}

/// Strict opposite-direction condition for the high-word not-taken branch.
fn hi_flip(cond: Condition) -> Condition {
    match cond {
        Condition::Less => Condition::Greater,
        Condition::Greater => Condition::Less,
        Condition::UnsignedLess => Condition::UnsignedGreater,
        Condition::UnsignedGreater => Condition::UnsignedLess,
        other => other.opposite(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::options::{Options, Target};
    use crate::stages::decode::CilDecoderStage;
    use crate::ty::{CilBody, CilOp, MethodSig, Primitive, TypeLayout, TypeSystemBuilder};
    use std::sync::Arc;

    fn run_expand(
        ops: Vec<CilOp>,
        long_locals: usize,
        check: impl FnOnce(&MethodContext, CompileResult<()>),
    ) {
        let mut b = TypeSystemBuilder::new();
        let i4 = b.primitive(Primitive::I4);
        let i8 = b.primitive(Primitive::I8);
        let cls = b.class("Test");
        let body = CilBody {
            locals: vec![i8; long_locals],
            ops,
            protected: Vec::new(),
        };
        let m = b.static_method(cls, "M", MethodSig::new(vec![], Some(i4)), body);
        let layout = TypeLayout::new(Arc::new(b.build()), 4, 4).unwrap();
        let options = Options {
            target: Target::X86,
            ..Options::default()
        };
        let mut ctx = MethodContext::new(m, layout.type_system(), &layout, &options);
        CilDecoderStage.run(&mut ctx).unwrap();
        let result = LongExpansionStage.run(&mut ctx);
        check(&ctx, result);
    }

    fn surviving_ops(ctx: &MethodContext) -> Vec<Opcode> {
        ctx.graph
            .block_ids()
            .flat_map(|b| ctx.graph.block_nodes(b).collect::<Vec<_>>())
            .map(|n| ctx.graph.node(n).opcode)
            .collect()
    }

    #[test]
    fn add64_becomes_carry_chain() {
        let ops = vec![
            CilOp::LdcI8(1),
            CilOp::LdcI8(2),
            CilOp::Add,
            CilOp::StLoc(0),
            CilOp::LdcI4(0),
            CilOp::Ret,
        ];
        run_expand(ops, 1, |ctx, result| {
            result.unwrap();
            let ops = surviving_ops(ctx);
            assert!(ops.contains(&Opcode::Ir(IrOp::Add32)));
            assert!(ops.contains(&Opcode::Ir(IrOp::AddWithCarry32)));
            assert!(!ops.contains(&Opcode::Ir(IrOp::Add64)));
            assert!(!ops.contains(&Opcode::Ir(IrOp::Move64)));
        });
    }

    #[test]
    fn mul64_is_rejected_on_32_bit() {
        let ops = vec![
            CilOp::LdcI8(3),
            CilOp::LdcI8(4),
            CilOp::Mul,
            CilOp::StLoc(0),
            CilOp::LdcI4(0),
            CilOp::Ret,
        ];
        run_expand(ops, 1, |_ctx, result| {
            assert!(matches!(
                result.unwrap_err(),
                CompileError::NotSupported { .. }
            ));
        });
    }

    #[test]
    fn constants_split_into_halves() {
        let value = 0x1234_5678_9ABC_DEF0u64 as i64;
        let ops = vec![
            CilOp::LdcI8(value),
            CilOp::StLoc(0),
            CilOp::LdcI4(0),
            CilOp::Ret,
        ];
        run_expand(ops, 1, |ctx, result| {
            result.unwrap();
            let mut lo_seen = false;
            let mut hi_seen = false;
            for b in ctx.graph.block_ids() {
                for n in ctx.graph.block_nodes(b) {
                    for op in &ctx.graph.node(n).operands {
                        if op == &Operand::i32(0x9ABC_DEF0u32 as i32) {
                            lo_seen = true;
                        }
                        if op == &Operand::i32(0x1234_5678) {
                            hi_seen = true;
                        }
                    }
                }
            }
            assert!(lo_seen && hi_seen);
        });
    }
}
