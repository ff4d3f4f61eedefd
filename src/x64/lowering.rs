// Platform lowering replaces every generic IR node with x86-64 descriptor nodes, one-to-one
// where the ISA has a direct form and one-to-many where it does not: value compares become
// cmp/setcc/movzx, compare-branches become cmp/jcc, division wraps the idiv register
// convention, and switch dispatch expands to a compare chain ahead of the default jump.
// Float compare conditions translate to their unsigned forms, matching what ucomiss leaves
// in the flags.

use crate::compile::options::Target;
use crate::core::error::{CompileError, CompileResult};
use crate::core::graph::{Node, NodeId};
use crate::core::instruction::{Condition, IrOp, Opcode};
use crate::core::operand::Operand;
use crate::stages::{MethodContext, Stage};
use crate::x64::{regs, X64Op};

pub struct PlatformLoweringStage;

impl Stage for PlatformLoweringStage {
    fn name(&self) -> &'static str {
        "platform-lowering"
    }

    fn run(&mut self, ctx: &mut MethodContext) -> CompileResult<()> {
        if ctx.options.target != Target::X64 {
            return Err(CompileError::not_supported(format!(
                "native lowering for target {}",
                ctx.options.target.name()
            )));
        }
        let node_count = ctx.graph.node_count() as u32;
        for raw in 0..node_count {
            let node_id = NodeId(raw);
            if ctx.graph.node(node_id).is_empty() {
                continue;
            }
            lower_node(ctx, node_id)?;
        }
        ctx.counters
            .update("lowering.nodes", ctx.graph.node_count() as i64);
        Ok(())
    }
}

fn set_op(ctx: &mut MethodContext, node_id: NodeId, op: X64Op) {
    ctx.graph.node_mut(node_id).opcode = Opcode::X64(op);
}

/// Unsigned flavor of a condition, as ucomiss/ucomisd leave the flags.
fn float_cond(cond: Condition) -> Condition {
    match cond {
        Condition::Less => Condition::UnsignedLess,
        Condition::LessOrEqual => Condition::UnsignedLessOrEqual,
        Condition::Greater => Condition::UnsignedGreater,
        Condition::GreaterOrEqual => Condition::UnsignedGreaterOrEqual,
        other => other,
    }
}

fn lower_node(ctx: &mut MethodContext, node_id: NodeId) -> CompileResult<()> {
    let Opcode::Ir(op) = ctx.graph.node(node_id).opcode else {
        return Ok(());
    };
    use IrOp::*;
    let direct = match op {
        Move32 => Some(X64Op::Mov32),
        Move64 => Some(X64Op::Mov64),
        MoveR4 => Some(X64Op::Movss),
        MoveR8 => Some(X64Op::Movsd),
        LoadSignExtend8x32 => Some(X64Op::Load8SX32),
        LoadSignExtend16x32 => Some(X64Op::Load16SX32),
        LoadZeroExtend8x32 => Some(X64Op::Load8ZX32),
        LoadZeroExtend16x32 => Some(X64Op::Load16ZX32),
        Load32 => Some(X64Op::Load32),
        Load64 => Some(X64Op::Load64),
        LoadR4 => Some(X64Op::LoadSs),
        LoadR8 => Some(X64Op::LoadSd),
        Store8 => Some(X64Op::Store8),
        Store16 => Some(X64Op::Store16),
        Store32 => Some(X64Op::Store32),
        Store64 => Some(X64Op::Store64),
        StoreR4 => Some(X64Op::StoreSs),
        StoreR8 => Some(X64Op::StoreSd),
        Add32 => Some(X64Op::Add32),
        Add64 => Some(X64Op::Add64),
        AddWithCarry32 => Some(X64Op::Adc32),
        Sub32 => Some(X64Op::Sub32),
        Sub64 => Some(X64Op::Sub64),
        SubWithBorrow32 => Some(X64Op::Sbb32),
        Mul32 => Some(X64Op::IMul32),
        Mul64 => Some(X64Op::IMul64),
        And32 => Some(X64Op::And32),
        And64 => Some(X64Op::And64),
        Or32 => Some(X64Op::Or32),
        Or64 => Some(X64Op::Or64),
        Xor32 => Some(X64Op::Xor32),
        Xor64 => Some(X64Op::Xor64),
        Not32 => Some(X64Op::Not32),
        Not64 => Some(X64Op::Not64),
        ShiftLeft32 => Some(X64Op::Shl32),
        ShiftLeft64 => Some(X64Op::Shl64),
        ShiftRight32 => Some(X64Op::Shr32),
        ShiftRight64 => Some(X64Op::Shr64),
        ArithShiftRight32 => Some(X64Op::Sar32),
        ArithShiftRight64 => Some(X64Op::Sar64),
        SignExtend8x32 => Some(X64Op::Movsx8x32),
        SignExtend16x32 => Some(X64Op::Movsx16x32),
        SignExtend32x64 => Some(X64Op::Movsx32x64),
        ZeroExtend8x32 => Some(X64Op::Movzx8x32),
        ZeroExtend16x32 => Some(X64Op::Movzx16x32),
        // A 32-bit register write clears the upper half.
        ZeroExtend32x64 => Some(X64Op::Mov32),
        Truncate64x32 => Some(X64Op::Mov32),
        ConvertI32ToR4 => Some(X64Op::Cvtsi2ss32),
        ConvertI32ToR8 => Some(X64Op::Cvtsi2sd32),
        ConvertI64ToR8 => Some(X64Op::Cvtsi2sd64),
        ConvertR4ToR8 => Some(X64Op::Cvtss2sd),
        ConvertR8ToR4 => Some(X64Op::Cvtsd2ss),
        ConvertR4ToI32 => Some(X64Op::Cvttss2si32),
        ConvertR8ToI32 => Some(X64Op::Cvttsd2si32),
        AddR4 => Some(X64Op::Addss),
        AddR8 => Some(X64Op::Addsd),
        SubR4 => Some(X64Op::Subss),
        SubR8 => Some(X64Op::Subsd),
        MulR4 => Some(X64Op::Mulss),
        MulR8 => Some(X64Op::Mulsd),
        DivR4 => Some(X64Op::Divss),
        DivR8 => Some(X64Op::Divsd),
        Jmp => Some(X64Op::Jmp),
        Call => Some(X64Op::Call),
        Return | ReturnVoid => Some(X64Op::Ret),
        _ => None,
    };
    if let Some(x64_op) = direct {
        set_op(ctx, node_id, x64_op);
        return Ok(());
    }

    match op {
        Nop => {
            ctx.graph.empty_node(node_id);
        }
        DivSigned32 => lower_division(ctx, node_id, X64Op::Idiv32, true, false)?,
        DivSigned64 => lower_division(ctx, node_id, X64Op::Idiv64, true, true)?,
        DivUnsigned32 => lower_division(ctx, node_id, X64Op::Div32, false, false)?,
        DivUnsigned64 => lower_division(ctx, node_id, X64Op::Div64, false, true)?,
        RemSigned32 => lower_remainder(ctx, node_id, X64Op::Idiv32, true, false)?,
        RemSigned64 => lower_remainder(ctx, node_id, X64Op::Idiv64, true, true)?,
        RemUnsigned32 => lower_remainder(ctx, node_id, X64Op::Div32, false, false)?,
        RemUnsigned64 => lower_remainder(ctx, node_id, X64Op::Div64, false, true)?,
        Compare32 => lower_compare(ctx, node_id, X64Op::Cmp32, false)?,
        Compare64 => lower_compare(ctx, node_id, X64Op::Cmp64, false)?,
        CompareR4 => lower_compare(ctx, node_id, X64Op::Ucomiss, true)?,
        CompareR8 => lower_compare(ctx, node_id, X64Op::Ucomisd, true)?,
        CmpBranch32 => lower_cmp_branch(ctx, node_id, X64Op::Cmp32)?,
        CmpBranch64 => lower_cmp_branch(ctx, node_id, X64Op::Cmp64)?,
        Switch => lower_switch(ctx, node_id)?,
        MoveCompound => {
            return Err(CompileError::not_supported(
                "compound moves in the x86-64 backend",
            ));
        }
        Phi => {
            return Err(CompileError::invariant(
                "platform-lowering",
                "phi node survived into lowering",
            ));
        }
        _ => {
            return Err(CompileError::invariant(
                "platform-lowering",
                format!("no lowering for {}", op.desc().name),
            ));
        }
    }
    Ok(())
}

/// idiv/div leave the quotient in RAX and the remainder in RDX; the dividend
/// is sign- or zero-extended into RDX:RAX first.
fn lower_division(
    ctx: &mut MethodContext,
    node_id: NodeId,
    div_op: X64Op,
    signed: bool,
    wide: bool,
) -> CompileResult<()> {
    lower_div_rem(ctx, node_id, div_op, signed, wide, regs::RAX)
}

fn lower_remainder(
    ctx: &mut MethodContext,
    node_id: NodeId,
    div_op: X64Op,
    signed: bool,
    wide: bool,
) -> CompileResult<()> {
    lower_div_rem(ctx, node_id, div_op, signed, wide, regs::RDX)
}

fn lower_div_rem(
    ctx: &mut MethodContext,
    node_id: NodeId,
    div_op: X64Op,
    signed: bool,
    wide: bool,
    out: crate::core::operand::PhysReg,
) -> CompileResult<()> {
    let (a, b, result) = {
        let node = ctx.graph.node(node_id);
        (
            node.operands[0].clone(),
            node.operands[1].clone(),
            node.results[0].clone(),
        )
    };
    let mov = if wide { X64Op::Mov64 } else { X64Op::Mov32 };
    ctx.graph.insert_before(
        node_id,
        Node::new(Opcode::X64(mov))
            .result(Operand::Reg(regs::RAX))
            .operand(a),
    );
    if signed {
        let extend = if wide { X64Op::Cqo } else { X64Op::Cdq };
        ctx.graph.insert_before(node_id, Node::new(Opcode::X64(extend)));
    } else {
        ctx.graph.insert_before(
            node_id,
            Node::new(Opcode::X64(mov))
                .result(Operand::Reg(regs::RDX))
                .operand(Operand::i32(0)),
        );
    }
    ctx.graph.insert_after(
        node_id,
        Node::new(Opcode::X64(mov)).result(result).operand(Operand::Reg(out)),
    );
    let node = ctx.graph.node_mut(node_id);
    node.opcode = Opcode::X64(div_op);
    node.results.clear();
    node.operands.clear();
    node.operands.push(b);
    Ok(())
}

/// Value compares become cmp/setcc/movzx.
fn lower_compare(
    ctx: &mut MethodContext,
    node_id: NodeId,
    cmp_op: X64Op,
    float: bool,
) -> CompileResult<()> {
    let (a, b, result, cond) = {
        let node = ctx.graph.node(node_id);
        (
            node.operands[0].clone(),
            node.operands[1].clone(),
            node.results[0].clone(),
            node.cond.ok_or_else(|| {
                CompileError::invariant("platform-lowering", "compare without condition")
            })?,
        )
    };
    let cond = if float { float_cond(cond) } else { cond };
    ctx.graph.insert_before(
        node_id,
        Node::new(Opcode::X64(cmp_op)).operand(a).operand(b),
    );
    ctx.graph.insert_before(
        node_id,
        Node::new(Opcode::X64(X64Op::Setcc))
            .result(result.clone())
            .with_cond(cond),
    );
    let node = ctx.graph.node_mut(node_id);
    node.opcode = Opcode::X64(X64Op::Movzx8x32);
    node.cond = None;
    node.ty = None;
    node.operands.clear();
    node.operands.push(result.clone());
    node.results.clear();
    node.results.push(result);
    Ok(())
}

fn lower_cmp_branch(
    ctx: &mut MethodContext,
    node_id: NodeId,
    cmp_op: X64Op,
) -> CompileResult<()> {
    let (a, b) = {
        let node = ctx.graph.node(node_id);
        (node.operands[0].clone(), node.operands[1].clone())
    };
    let float = matches!(cmp_op, X64Op::Ucomiss | X64Op::Ucomisd);
    ctx.graph.insert_before(
        node_id,
        Node::new(Opcode::X64(cmp_op)).operand(a).operand(b),
    );
    let node = ctx.graph.node_mut(node_id);
    if float {
        node.cond = node.cond.map(float_cond);
    }
    node.opcode = Opcode::X64(X64Op::Jcc);
    node.operands.clear();
    node.ty = None;
    Ok(())
}

/// Switch dispatch as a compare chain; the decoder's trailing jump already
/// covers the default case.
fn lower_switch(ctx: &mut MethodContext, node_id: NodeId) -> CompileResult<()> {
    let (selector, targets) = {
        let node = ctx.graph.node(node_id);
        (node.operands[0].clone(), node.targets.to_vec())
    };
    for (index, target) in targets.into_iter().enumerate() {
        ctx.graph.insert_before(
            node_id,
            Node::new(Opcode::X64(X64Op::Cmp32))
                .operand(selector.clone())
                .operand(Operand::i32(index as i32)),
        );
        ctx.graph.insert_before(
            node_id,
            Node::new(Opcode::X64(X64Op::Jcc))
                .with_cond(Condition::Equal)
                .target(target),
        );
    }
    ctx.graph.empty_node(node_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::options::Options;
    use crate::core::instruction::IrType;
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
    fn lowers_compare_to_cmp_setcc_movzx() {
        with_ctx(|ctx| {
            let block = ctx.graph.create_block();
            let r = ctx.vregs.alloc(IrType::I32);
            ctx.graph.append(
                block,
                Node::ir(IrOp::Compare32)
                    .result(Operand::VReg(r))
                    .operand(Operand::i32(1))
                    .operand(Operand::i32(2))
                    .with_cond(Condition::Less)
                    .with_ty(IrType::I32),
            );
            PlatformLoweringStage.run(ctx).unwrap();
            let ops: Vec<_> = ctx
                .graph
                .block_nodes(block)
                .map(|n| ctx.graph.node(n).opcode)
                .collect();
            assert_eq!(
                ops,
                vec![
                    Opcode::X64(X64Op::Cmp32),
                    Opcode::X64(X64Op::Setcc),
                    Opcode::X64(X64Op::Movzx8x32),
                ]
            );
        });
    }

    #[test]
    fn lowers_division_through_rax() {
        with_ctx(|ctx| {
            let block = ctx.graph.create_block();
            let r = ctx.vregs.alloc(IrType::I32);
            let a = ctx.vregs.alloc(IrType::I32);
            let b = ctx.vregs.alloc(IrType::I32);
            ctx.graph.append(
                block,
                Node::ir(IrOp::DivSigned32)
                    .result(Operand::VReg(r))
                    .operand(Operand::VReg(a))
                    .operand(Operand::VReg(b))
                    .with_ty(IrType::I32),
            );
            PlatformLoweringStage.run(ctx).unwrap();
            let ops: Vec<_> = ctx
                .graph
                .block_nodes(block)
                .map(|n| ctx.graph.node(n).opcode)
                .collect();
            assert_eq!(
                ops,
                vec![
                    Opcode::X64(X64Op::Mov32),
                    Opcode::X64(X64Op::Cdq),
                    Opcode::X64(X64Op::Idiv32),
                    Opcode::X64(X64Op::Mov32),
                ]
            );
            // Dividend into RAX, quotient out of RAX.
            let first = ctx.graph.block_nodes(block).next().unwrap();
            assert_eq!(
                ctx.graph.node(first).results[0],
                Operand::Reg(regs::RAX)
            );
        });
    }

    #[test]
    fn integer_branch_conditions_stay_signed() {
        with_ctx(|ctx| {
            let block = ctx.graph.create_block();
            let other = ctx.graph.create_block();
            ctx.graph.append(
                block,
                Node::ir(IrOp::CmpBranch32)
                    .operand(Operand::i32(0))
                    .operand(Operand::i32(1))
                    .with_cond(Condition::Less)
                    .with_ty(IrType::I32)
                    .target(other),
            );
            PlatformLoweringStage.run(ctx).unwrap();
            let jcc = ctx.graph.block_nodes(block).last().unwrap();
            // Integer compare keeps the signed condition.
            assert_eq!(ctx.graph.node(jcc).cond, Some(Condition::Less));
        });
    }
}
