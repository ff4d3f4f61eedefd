// Encoding-constraint tweaks and fixed-register binding, run between lowering and register
// allocation. The tweak stage rewrites shapes the encoders cannot express: three-address
// arithmetic gains its destination move, compares lose constant left operands, shift counts
// narrow to 8-bit immediates, division operands and float constants materialize into
// registers, and computed call targets go through a register. The fixed-register stage then
// binds the operands the ISA pins: shift counts in CL, call and return values in RAX/XMM0,
// outgoing arguments as pushes with the stack repaired after the call.

use crate::core::error::{CompileError, CompileResult};
use crate::core::graph::{Node, NodeId};
use crate::core::instruction::{IrType, Opcode};
use crate::core::operand::{ConstValue, Operand};
use crate::stages::{MethodContext, Stage};
use crate::x64::{regs, X64Op};

pub struct PlatformTweakStage;

impl Stage for PlatformTweakStage {
    fn name(&self) -> &'static str {
        "platform-tweaks"
    }

    fn run(&mut self, ctx: &mut MethodContext) -> CompileResult<()> {
        let node_count = ctx.graph.node_count() as u32;
        for raw in 0..node_count {
            let node_id = NodeId(raw);
            if ctx.graph.node(node_id).is_empty() {
                continue;
            }
            tweak_node(ctx, node_id)?;
        }
        Ok(())
    }
}

/// The move opcode matching an x64 op's register bank and width.
fn mov_for(op: X64Op) -> X64Op {
    use X64Op::*;
    match op {
        Addss | Subss | Mulss | Divss | Movss | Ucomiss => Movss,
        Addsd | Subsd | Mulsd | Divsd | Movsd | Ucomisd => Movsd,
        Add64 | Sub64 | IMul64 | And64 | Or64 | Xor64 | Not64 | Shl64 | Shr64 | Sar64
        | Mov64 | Cmp64 => Mov64,
        _ => Mov32,
    }
}

fn is_shift(op: X64Op) -> bool {
    matches!(
        op,
        X64Op::Shl32 | X64Op::Shl64 | X64Op::Shr32 | X64Op::Shr64 | X64Op::Sar32 | X64Op::Sar64
    )
}

fn is_commutative(op: X64Op) -> bool {
    matches!(
        op,
        X64Op::Add32
            | X64Op::Add64
            | X64Op::IMul32
            | X64Op::IMul64
            | X64Op::And32
            | X64Op::And64
            | X64Op::Or32
            | X64Op::Or64
            | X64Op::Xor32
            | X64Op::Xor64
            | X64Op::Addss
            | X64Op::Addsd
            | X64Op::Mulss
            | X64Op::Mulsd
    )
}

fn materialize(ctx: &mut MethodContext, node_id: NodeId, k: usize, mov: X64Op, ty: IrType) {
    let value = ctx.graph.node(node_id).operands[k].clone();
    let vreg = ctx.vregs.alloc(ty);
    ctx.graph.insert_before(
        node_id,
        Node::new(Opcode::X64(mov))
            .result(Operand::VReg(vreg))
            .operand(value),
    );
    ctx.graph.node_mut(node_id).operands[k] = Operand::VReg(vreg);
}

fn tweak_node(ctx: &mut MethodContext, node_id: NodeId) -> CompileResult<()> {
    let Opcode::X64(op) = ctx.graph.node(node_id).opcode else {
        return Err(CompileError::invariant(
            "platform-tweaks",
            "generic IR node survived lowering",
        ));
    };

    // Shift counts become 8-bit immediates; the wide constant is discarded.
    if is_shift(op) {
        let count = ctx.graph.node(node_id).operands[1].clone();
        if let Some(c) = count.constant().and_then(|c| c.as_i64()) {
            ctx.graph.node_mut(node_id).operands[1] =
                Operand::Constant(ConstValue::I8(c as u8));
        }
    }

    // cmp cannot take an immediate on the left.
    if matches!(op, X64Op::Cmp32 | X64Op::Cmp64) {
        let left_const = ctx.graph.node(node_id).operands[0].is_constant();
        if left_const {
            let width_ty = if op == X64Op::Cmp64 { IrType::I64 } else { IrType::I32 };
            materialize(ctx, node_id, 0, mov_for(op), width_ty);
        }
    }

    // ucomiss/ucomisd and float arithmetic need their constants in registers.
    if matches!(op, X64Op::Ucomiss | X64Op::Ucomisd) {
        for k in 0..2 {
            if ctx.graph.node(node_id).operands[k].is_constant() {
                let ty = if op == X64Op::Ucomiss { IrType::R4 } else { IrType::R8 };
                materialize(ctx, node_id, k, mov_for(op), ty);
            }
        }
    }

    // Division has no immediate form.
    if matches!(op, X64Op::Idiv32 | X64Op::Div32 | X64Op::Idiv64 | X64Op::Div64) {
        if ctx.graph.node(node_id).operands[0].is_constant() {
            let wide = matches!(op, X64Op::Idiv64 | X64Op::Div64);
            let (mov, ty) = if wide {
                (X64Op::Mov64, IrType::I64)
            } else {
                (X64Op::Mov32, IrType::I32)
            };
            materialize(ctx, node_id, 0, mov, ty);
        }
    }

    // A call target that is neither symbol nor register goes through one.
    if op == X64Op::Call {
        let needs_split = matches!(
            ctx.graph.node(node_id).operands.first(),
            Some(Operand::Constant(_)) | Some(Operand::Stack(_))
        );
        if needs_split {
            materialize(ctx, node_id, 0, X64Op::Mov64, IrType::Ptr);
        }
    }

    // Three-address to two-address: the destination absorbs the left operand.
    let desc = op.desc();
    if desc.two_address && ctx.graph.node(node_id).results.len() == 1 {
        let result = ctx.graph.node(node_id).results[0].clone();
        let operand_count = ctx.graph.node(node_id).operands.len();
        if operand_count == 2 && ctx.graph.node(node_id).operands[1] == result {
            if is_commutative(op) {
                let node = ctx.graph.node_mut(node_id);
                node.operands.swap(0, 1);
            } else {
                // The right operand would be clobbered by the destination
                // move; give it a register of its own first.
                let ty = match mov_for(op) {
                    X64Op::Mov64 => IrType::I64,
                    X64Op::Movss => IrType::R4,
                    X64Op::Movsd => IrType::R8,
                    _ => IrType::I32,
                };
                materialize(ctx, node_id, 1, mov_for(op), ty);
            }
        }
        let left = ctx.graph.node(node_id).operands[0].clone();
        if left != result {
            ctx.graph.insert_before(
                node_id,
                Node::new(Opcode::X64(mov_for(op)))
                    .result(result.clone())
                    .operand(left),
            );
            ctx.graph.node_mut(node_id).operands[0] = result;
        }
    }

    Ok(())
}

pub struct FixedRegisterStage;

impl Stage for FixedRegisterStage {
    fn name(&self) -> &'static str {
        "fixed-registers"
    }

    fn run(&mut self, ctx: &mut MethodContext) -> CompileResult<()> {
        let node_count = ctx.graph.node_count() as u32;
        for raw in 0..node_count {
            let node_id = NodeId(raw);
            if ctx.graph.node(node_id).is_empty() {
                continue;
            }
            bind_node(ctx, node_id)?;
        }
        Ok(())
    }
}

fn bind_node(ctx: &mut MethodContext, node_id: NodeId) -> CompileResult<()> {
    let Opcode::X64(op) = ctx.graph.node(node_id).opcode else {
        return Ok(());
    };

    // Variable shift counts live in CL.
    if is_shift(op) {
        let count = ctx.graph.node(node_id).operands[1].clone();
        if !count.is_constant() {
            ctx.graph.insert_before(
                node_id,
                Node::new(Opcode::X64(X64Op::Mov32))
                    .result(Operand::Reg(regs::RCX))
                    .operand(count),
            );
            ctx.graph.node_mut(node_id).operands[1] = Operand::Reg(regs::RCX);
        }
    }

    // Return values travel in RAX or XMM0.
    if op == X64Op::Ret {
        let value = ctx.graph.node(node_id).operands.first().cloned();
        if let Some(value) = value {
            let ty = ctx.graph.node(node_id).ty.unwrap_or(IrType::I64);
            let (mov, reg) = match ty {
                IrType::R4 => (X64Op::Movss, regs::XMM0),
                IrType::R8 => (X64Op::Movsd, regs::XMM0),
                IrType::I32 => (X64Op::Mov32, regs::RAX),
                _ => (X64Op::Mov64, regs::RAX),
            };
            ctx.graph.insert_before(
                node_id,
                Node::new(Opcode::X64(mov))
                    .result(Operand::Reg(reg))
                    .operand(value),
            );
            ctx.graph.node_mut(node_id).operands.clear();
        }
    }

    // Calls: push arguments right to left, repair the stack, fetch the
    // result out of RAX/XMM0.
    if op == X64Op::Call {
        let (args, result, ty) = {
            let node = ctx.graph.node(node_id);
            (
                node.operands.iter().skip(1).cloned().collect::<Vec<_>>(),
                node.results.first().cloned(),
                node.ty,
            )
        };
        for arg in args.iter().rev() {
            if matches!(arg, Operand::VReg(v) if ctx.vregs.ty(*v).is_float()) {
                return Err(CompileError::not_supported(
                    "floating-point call arguments",
                ));
            }
            ctx.graph.insert_before(
                node_id,
                Node::new(Opcode::X64(X64Op::Push)).operand(arg.clone()),
            );
        }
        {
            let node = ctx.graph.node_mut(node_id);
            let target = node.operands[0].clone();
            node.operands.clear();
            node.operands.push(target);
            node.results.clear();
        }
        let mut cursor = node_id;
        if let Some(result) = result {
            let (mov, reg) = match ty {
                Some(IrType::R4) => (X64Op::Movss, regs::XMM0),
                Some(IrType::R8) => (X64Op::Movsd, regs::XMM0),
                Some(IrType::I32) => (X64Op::Mov32, regs::RAX),
                _ => (X64Op::Mov64, regs::RAX),
            };
            cursor = ctx.graph.insert_after(
                node_id,
                Node::new(Opcode::X64(mov))
                    .result(result)
                    .operand(Operand::Reg(reg)),
            );
        }
        if !args.is_empty() {
            // Lands after the result move; add does not disturb RAX.
            let fixup = Node::new(Opcode::X64(X64Op::Add64))
                .result(Operand::Reg(regs::RSP))
                .operand(Operand::Reg(regs::RSP))
                .operand(Operand::i32(args.len() as i32 * 8));
            ctx.graph.insert_after(cursor, fixup);
        }
    }

    Ok(())
}
