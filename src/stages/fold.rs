// Constant folding. A value node whose operands are all constants collapses into a move of
// the computed constant; integer arithmetic wraps at the target width and shift counts are
// masked the way the hardware masks them. Division by a zero constant is left alone so the
// runtime fault survives.

use crate::core::error::CompileResult;
use crate::core::instruction::{Condition, IrOp, IrType, Opcode};
use crate::core::operand::{ConstValue, Operand};
use crate::stages::decode::move_op;
use crate::stages::{MethodContext, Stage};

pub struct ConstantFoldingStage;

impl Stage for ConstantFoldingStage {
    fn name(&self) -> &'static str {
        "constant-folding"
    }

    fn run(&mut self, ctx: &mut MethodContext) -> CompileResult<()> {
        if !ctx.options.optimize || !ctx.options.constant_folding {
            return Ok(());
        }
        let ptr_size = ctx.layout.ptr_size();
        let mut hits = 0i64;
        let node_count = ctx.graph.node_count() as u32;
        for raw in 0..node_count {
            let node_id = crate::core::graph::NodeId(raw);
            let node = ctx.graph.node(node_id);
            if node.is_empty() || node.results.len() != 1 {
                continue;
            }
            let Opcode::Ir(op) = node.opcode else { continue };
            let folded = match node.operands.len() {
                1 => node.operands[0]
                    .constant()
                    .and_then(|a| fold_unary(op, a)),
                2 => match (node.operands[0].constant(), node.operands[1].constant()) {
                    (Some(a), Some(b)) => fold_binary(op, node.cond, a, b),
                    _ => None,
                },
                _ => None,
            };
            let Some(value) = folded else { continue };
            let ty = value.ty(if ptr_size == 8 { IrType::I64 } else { IrType::I32 });
            let result = node.results[0].clone();
            log::trace!("fold {} -> {:?}", op.desc().name, value);
            let node = ctx.graph.node_mut(node_id);
            node.opcode = Opcode::Ir(move_op(ty, ptr_size));
            node.operands.clear();
            node.operands.push(Operand::Constant(value));
            node.results.clear();
            node.results.push(result);
            node.cond = None;
            node.ty = Some(ty);
            hits += 1;
        }
        ctx.counters.update("fold.hits", hits);
        Ok(())
    }
}

pub(crate) fn fold_unary(op: IrOp, a: &ConstValue) -> Option<ConstValue> {
    use ConstValue::*;
    Some(match (op, a) {
        (IrOp::Not32, I32(v)) => I32(!v),
        (IrOp::Not64, I64(v)) => I64(!v),
        (IrOp::SignExtend8x32, I32(v)) => I32(*v as i8 as i32),
        (IrOp::SignExtend16x32, I32(v)) => I32(*v as i16 as i32),
        (IrOp::SignExtend32x64, I32(v)) => I64(*v as i64),
        (IrOp::ZeroExtend8x32, I32(v)) => I32(*v & 0xFF),
        (IrOp::ZeroExtend16x32, I32(v)) => I32(*v & 0xFFFF),
        (IrOp::ZeroExtend32x64, I32(v)) => I64(*v as u32 as i64),
        (IrOp::Truncate64x32, I64(v)) => I32(*v as i32),
        (IrOp::ConvertI32ToR4, I32(v)) => R4(*v as f32),
        (IrOp::ConvertI32ToR8, I32(v)) => R8(*v as f64),
        (IrOp::ConvertI64ToR8, I64(v)) => R8(*v as f64),
        (IrOp::ConvertR4ToR8, R4(v)) => R8(*v as f64),
        (IrOp::ConvertR8ToR4, R8(v)) => R4(*v as f32),
        _ => return None,
    })
}

pub(crate) fn fold_binary(
    op: IrOp,
    cond: Option<Condition>,
    a: &ConstValue,
    b: &ConstValue,
) -> Option<ConstValue> {
    use ConstValue::*;
    Some(match (op, a, b) {
        (IrOp::Add32, I32(a), I32(b)) => I32(a.wrapping_add(*b)),
        (IrOp::Sub32, I32(a), I32(b)) => I32(a.wrapping_sub(*b)),
        (IrOp::Mul32, I32(a), I32(b)) => I32(a.wrapping_mul(*b)),
        (IrOp::DivSigned32, I32(a), I32(b)) if *b != 0 && !(*a == i32::MIN && *b == -1) => {
            I32(a.wrapping_div(*b))
        }
        (IrOp::DivUnsigned32, I32(a), I32(b)) if *b != 0 => {
            I32(((*a as u32) / (*b as u32)) as i32)
        }
        (IrOp::RemSigned32, I32(a), I32(b)) if *b != 0 && !(*a == i32::MIN && *b == -1) => {
            I32(a.wrapping_rem(*b))
        }
        (IrOp::RemUnsigned32, I32(a), I32(b)) if *b != 0 => {
            I32(((*a as u32) % (*b as u32)) as i32)
        }
        (IrOp::And32, I32(a), I32(b)) => I32(a & b),
        (IrOp::Or32, I32(a), I32(b)) => I32(a | b),
        (IrOp::Xor32, I32(a), I32(b)) => I32(a ^ b),
        (IrOp::ShiftLeft32, I32(a), I32(b)) => I32(a.wrapping_shl(*b as u32 & 31)),
        (IrOp::ShiftRight32, I32(a), I32(b)) => {
            I32(((*a as u32) >> (*b as u32 & 31)) as i32)
        }
        (IrOp::ArithShiftRight32, I32(a), I32(b)) => I32(a >> (*b as u32 & 31)),

        (IrOp::Add64, I64(a), I64(b)) => I64(a.wrapping_add(*b)),
        (IrOp::Sub64, I64(a), I64(b)) => I64(a.wrapping_sub(*b)),
        (IrOp::Mul64, I64(a), I64(b)) => I64(a.wrapping_mul(*b)),
        (IrOp::DivSigned64, I64(a), I64(b)) if *b != 0 && !(*a == i64::MIN && *b == -1) => {
            I64(a.wrapping_div(*b))
        }
        (IrOp::DivUnsigned64, I64(a), I64(b)) if *b != 0 => {
            I64(((*a as u64) / (*b as u64)) as i64)
        }
        (IrOp::RemSigned64, I64(a), I64(b)) if *b != 0 && !(*a == i64::MIN && *b == -1) => {
            I64(a.wrapping_rem(*b))
        }
        (IrOp::RemUnsigned64, I64(a), I64(b)) if *b != 0 => {
            I64(((*a as u64) % (*b as u64)) as i64)
        }
        (IrOp::And64, I64(a), I64(b)) => I64(a & b),
        (IrOp::Or64, I64(a), I64(b)) => I64(a | b),
        (IrOp::Xor64, I64(a), I64(b)) => I64(a ^ b),
        (IrOp::ShiftLeft64, I64(a), I64(b)) => I64(a.wrapping_shl(*b as u32 & 63)),
        (IrOp::ShiftRight64, I64(a), I64(b)) => {
            I64(((*a as u64) >> (*b as u32 & 63)) as i64)
        }
        (IrOp::ArithShiftRight64, I64(a), I64(b)) => I64(a >> (*b as u32 & 63)),

        (IrOp::AddR4, R4(a), R4(b)) => R4(a + b),
        (IrOp::SubR4, R4(a), R4(b)) => R4(a - b),
        (IrOp::MulR4, R4(a), R4(b)) => R4(a * b),
        (IrOp::DivR4, R4(a), R4(b)) => R4(a / b),
        (IrOp::AddR8, R8(a), R8(b)) => R8(a + b),
        (IrOp::SubR8, R8(a), R8(b)) => R8(a - b),
        (IrOp::MulR8, R8(a), R8(b)) => R8(a * b),
        (IrOp::DivR8, R8(a), R8(b)) => R8(a / b),

        (IrOp::Compare32, I32(a), I32(b)) => {
            I32(eval_int_condition(cond?, *a as i64, *b as i64, 32)? as i32)
        }
        (IrOp::Compare64, I64(a), I64(b)) => {
            I32(eval_int_condition(cond?, *a, *b, 64)? as i32)
        }

        _ => return None,
    })
}

/// Evaluate an integer condition over sign-extended values.
pub fn eval_int_condition(cond: Condition, a: i64, b: i64, width: u32) -> Option<bool> {
    let (ua, ub) = if width == 32 {
        (a as u32 as u64, b as u32 as u64)
    } else {
        (a as u64, b as u64)
    };
    Some(match cond {
        Condition::Equal => a == b,
        Condition::NotEqual => a != b,
        Condition::Less => a < b,
        Condition::LessOrEqual => a <= b,
        Condition::Greater => a > b,
        Condition::GreaterOrEqual => a >= b,
        Condition::UnsignedLess => ua < ub,
        Condition::UnsignedLessOrEqual => ua <= ub,
        Condition::UnsignedGreater => ua > ub,
        Condition::UnsignedGreaterOrEqual => ua >= ub,
        Condition::Carry | Condition::NoCarry => return None,
    })
}
