// Code emission. Blocks stream out in layout order behind the frame prologue; every node is
// shape-checked against its descriptor, dispatched to the encoder form matching its operand
// residences, and stamped with its section offset. Branches to blocks leave rel32 holes that
// are patched once all block offsets are known; symbol operands leave holes recorded as
// relocation requests against the method start for the linker to resolve.

use std::collections::HashMap;

use crate::core::error::{CompileError, CompileResult};
use crate::core::graph::{BlockId, NodeId};
use crate::core::instruction::Opcode;
use crate::core::operand::{ConstValue, Operand, PhysReg, StackSlotId};
use crate::stages::{MethodContext, Reloc, RelocKind, Stage};
use crate::x64::encoder::Encoder;
use crate::x64::{regs, X64Op};

pub struct CodeEmissionStage;

impl Stage for CodeEmissionStage {
    fn name(&self) -> &'static str {
        "code-emission"
    }

    fn run(&mut self, ctx: &mut MethodContext) -> CompileResult<()> {
        let order = ctx.linear_block_order();
        let mut enc = Encoder::new();
        let mut fixups: Vec<(usize, BlockId)> = Vec::new();

        // Frame prologue: saved base pointer, save area, frame allocation.
        enc.push_r(regs::RBP);
        enc.mov_rr(true, regs::RBP, regs::RSP);
        for &reg in &ctx.saved_regs {
            enc.push_r(reg);
        }
        if ctx.frame_size > 0 {
            enc.arith_ri(5, true, regs::RSP, ctx.frame_size as i32);
        }

        for &block in &order {
            ctx.block_offsets.insert(block, enc.len() as u32);
            let node_ids: Vec<NodeId> = ctx.graph.block_nodes(block).collect();
            for node_id in node_ids {
                ctx.graph.node(node_id).check_shape("code-emission")?;
                let at = enc.len() as u32;
                emit_node(ctx, &mut enc, node_id, &mut fixups)?;
                ctx.graph.node_mut(node_id).offset = Some(at);
            }
        }

        for (hole, target) in fixups {
            let target_offset = *ctx.block_offsets.get(&target).ok_or_else(|| {
                CompileError::invariant("code-emission", "branch to a block with no offset")
            })?;
            enc.patch32(hole, target_offset as i32 - (hole as i32 + 4));
        }

        ctx.counters.update("emit.bytes", enc.len() as i64);
        ctx.code = enc.into_bytes();
        Ok(())
    }
}

fn reg_of(operand: &Operand) -> CompileResult<PhysReg> {
    match operand {
        Operand::Reg(reg) => Ok(*reg),
        other => Err(CompileError::invariant(
            "code-emission",
            format!("expected a register, found {other}"),
        )),
    }
}

fn slot_offset(ctx: &MethodContext, slot: StackSlotId) -> CompileResult<i32> {
    ctx.slots.get(slot).offset.ok_or_else(|| {
        CompileError::invariant("code-emission", "stack slot without an assigned offset")
    })
}

fn int_imm(operand: &Operand) -> Option<i64> {
    operand.constant().and_then(|c| c.as_i64())
}

fn relocate(ctx: &mut MethodContext, kind: RelocKind, hole: usize, target: &str, addend: i64) {
    ctx.relocations.push(Reloc {
        kind,
        offset: hole as u32,
        target: target.to_string(),
        addend,
    });
}

/// Arithmetic form selectors: the reg<-r/m opcode byte and the 81-group
/// index.
fn arith_codes(op: X64Op) -> Option<(u8, u8, bool)> {
    use X64Op::*;
    Some(match op {
        Add32 => (0x03, 0, false),
        Add64 => (0x03, 0, true),
        Adc32 => (0x13, 2, false),
        Sub32 => (0x2B, 5, false),
        Sub64 => (0x2B, 5, true),
        Sbb32 => (0x1B, 3, false),
        And32 => (0x23, 4, false),
        And64 => (0x23, 4, true),
        Or32 => (0x0B, 1, false),
        Or64 => (0x0B, 1, true),
        Xor32 => (0x33, 6, false),
        Xor64 => (0x33, 6, true),
        Cmp32 => (0x3B, 7, false),
        Cmp64 => (0x3B, 7, true),
        _ => return None,
    })
}

fn shift_group(op: X64Op) -> Option<(u8, bool)> {
    use X64Op::*;
    Some(match op {
        Shl32 => (4, false),
        Shl64 => (4, true),
        Shr32 => (5, false),
        Shr64 => (5, true),
        Sar32 => (7, false),
        Sar64 => (7, true),
        _ => return None,
    })
}

fn sse_arith_byte(op: X64Op) -> Option<(u8, bool)> {
    use X64Op::*;
    Some(match op {
        Addss => (0x58, false),
        Addsd => (0x58, true),
        Subss => (0x5C, false),
        Subsd => (0x5C, true),
        Mulss => (0x59, false),
        Mulsd => (0x59, true),
        Divss => (0x5E, false),
        Divsd => (0x5E, true),
        _ => return None,
    })
}

/// Load a float constant into an XMM register through the integer scratch.
fn materialize_float(enc: &mut Encoder, value: &ConstValue, dst: PhysReg) -> CompileResult<()> {
    match value {
        ConstValue::R4(v) => {
            enc.mov32_ri(regs::R11, v.to_bits() as i32);
            enc.movd_xr(false, dst, regs::R11);
        }
        ConstValue::R8(v) => {
            enc.mov64_ri(regs::R11, v.to_bits() as i64);
            enc.movd_xr(true, dst, regs::R11);
        }
        other => {
            return Err(CompileError::invariant(
                "code-emission",
                format!("{other:?} is not a float constant"),
            ))
        }
    }
    Ok(())
}

fn emit_node(
    ctx: &mut MethodContext,
    enc: &mut Encoder,
    node_id: NodeId,
    fixups: &mut Vec<(usize, BlockId)>,
) -> CompileResult<()> {
    let node = ctx.graph.node(node_id).clone();
    let Opcode::X64(op) = node.opcode else {
        return Err(CompileError::invariant(
            "code-emission",
            format!("unlowered node {}", node.opcode.name()),
        ));
    };
    use X64Op::*;

    match op {
        Mov32 | Mov64 => {
            let wide = op == Mov64;
            match (&node.results[0], &node.operands[0]) {
                (Operand::Reg(dst), Operand::Reg(src)) => enc.mov_rr(wide, *dst, *src),
                (Operand::Reg(dst), Operand::Stack(slot)) => {
                    enc.mov_load(wide, *dst, regs::RBP, slot_offset(ctx, *slot)?)
                }
                (Operand::Stack(slot), Operand::Reg(src)) => {
                    enc.mov_store(wide, regs::RBP, slot_offset(ctx, *slot)?, *src)
                }
                (Operand::Reg(dst), Operand::Constant(ConstValue::Symbol(sym))) => {
                    let hole = enc.mov64_ri(*dst, 0);
                    let sym = sym.clone();
                    relocate(ctx, RelocKind::Absolute, hole, &sym, 0);
                }
                (Operand::Reg(dst), src) => {
                    let imm = int_imm(src).ok_or_else(|| {
                        CompileError::invariant(
                            "code-emission",
                            format!("bad move source {src}"),
                        )
                    })?;
                    if wide {
                        enc.mov64_ri(*dst, imm);
                    } else {
                        enc.mov32_ri(*dst, imm as i32);
                    }
                }
                (dst, src) => {
                    return Err(CompileError::invariant(
                        "code-emission",
                        format!("bad move shape {dst} <- {src}"),
                    ))
                }
            }
        }
        Movss | Movsd => {
            let double = op == Movsd;
            match (&node.results[0], &node.operands[0]) {
                (Operand::Reg(dst), Operand::Reg(src)) => enc.sse_mov_rr(double, *dst, *src),
                (Operand::Reg(dst), Operand::Stack(slot)) => {
                    enc.sse_load(double, *dst, regs::RBP, slot_offset(ctx, *slot)?)
                }
                (Operand::Stack(slot), Operand::Reg(src)) => {
                    enc.sse_store(double, regs::RBP, slot_offset(ctx, *slot)?, *src)
                }
                (Operand::Reg(dst), Operand::Constant(c)) => materialize_float(enc, c, *dst)?,
                (dst, src) => {
                    return Err(CompileError::invariant(
                        "code-emission",
                        format!("bad float move shape {dst} <- {src}"),
                    ))
                }
            }
        }

        Load8SX32 | Load8ZX32 | Load16SX32 | Load16ZX32 | Load32 | Load64 | LoadSs | LoadSd => {
            let dst = reg_of(&node.results[0])?;
            let field_off = int_imm(&node.operands[1]).unwrap_or(0) as i32;
            match &node.operands[0] {
                Operand::Reg(base) => match op {
                    Load8SX32 => enc.movsx8_load(dst, *base, field_off),
                    Load8ZX32 => enc.movzx8_load(dst, *base, field_off),
                    Load16SX32 => enc.movsx16_load(dst, *base, field_off),
                    Load16ZX32 => enc.movzx16_load(dst, *base, field_off),
                    Load32 => enc.mov_load(false, dst, *base, field_off),
                    Load64 => enc.mov_load(true, dst, *base, field_off),
                    LoadSs => enc.sse_load(false, dst, *base, field_off),
                    LoadSd => enc.sse_load(true, dst, *base, field_off),
                    _ => unreachable!(),
                },
                Operand::Constant(ConstValue::Symbol(sym)) => {
                    let sym = sym.clone();
                    let hole = match op {
                        Load8SX32 => enc.movsx8_load_rip(dst),
                        Load8ZX32 => enc.movzx8_load_rip(dst),
                        Load16SX32 => enc.movsx16_load_rip(dst),
                        Load16ZX32 => enc.movzx16_load_rip(dst),
                        Load32 => enc.mov_load_rip(false, dst),
                        Load64 => enc.mov_load_rip(true, dst),
                        LoadSs => enc.sse_load_rip(false, dst),
                        LoadSd => enc.sse_load_rip(true, dst),
                        _ => unreachable!(),
                    };
                    relocate(ctx, RelocKind::Relative32, hole, &sym, field_off as i64 - 4);
                }
                other => {
                    return Err(CompileError::invariant(
                        "code-emission",
                        format!("bad load base {other}"),
                    ))
                }
            }
        }

        Store8 | Store16 | Store32 | Store64 | StoreSs | StoreSd => {
            let field_off = int_imm(&node.operands[1]).unwrap_or(0) as i32;
            // A constant value goes through the integer scratch first.
            let value = match &node.operands[2] {
                Operand::Reg(reg) => *reg,
                Operand::Constant(c) => {
                    let imm = c.as_i64().ok_or_else(|| {
                        CompileError::invariant("code-emission", "bad store constant")
                    })?;
                    if matches!(op, Store64) {
                        enc.mov64_ri(regs::R11, imm);
                    } else {
                        enc.mov32_ri(regs::R11, imm as i32);
                    }
                    regs::R11
                }
                other => {
                    return Err(CompileError::invariant(
                        "code-emission",
                        format!("bad store value {other}"),
                    ))
                }
            };
            match &node.operands[0] {
                Operand::Reg(base) => match op {
                    Store8 => enc.mov_store8(*base, field_off, value),
                    Store16 => enc.mov_store16(*base, field_off, value),
                    Store32 => enc.mov_store(false, *base, field_off, value),
                    Store64 => enc.mov_store(true, *base, field_off, value),
                    StoreSs => enc.sse_store(false, *base, field_off, value),
                    StoreSd => enc.sse_store(true, *base, field_off, value),
                    _ => unreachable!(),
                },
                Operand::Constant(ConstValue::Symbol(sym)) => {
                    let sym = sym.clone();
                    let hole = match op {
                        Store8 => enc.mov_store8_rip(value),
                        Store16 => enc.mov_store16_rip(value),
                        Store32 => enc.mov_store_rip(false, value),
                        Store64 => enc.mov_store_rip(true, value),
                        StoreSs => enc.sse_store_rip(false, value),
                        StoreSd => enc.sse_store_rip(true, value),
                        _ => unreachable!(),
                    };
                    relocate(ctx, RelocKind::Relative32, hole, &sym, field_off as i64 - 4);
                }
                other => {
                    return Err(CompileError::invariant(
                        "code-emission",
                        format!("bad store base {other}"),
                    ))
                }
            }
        }

        Add32 | Add64 | Adc32 | Sub32 | Sub64 | Sbb32 | And32 | And64 | Or32 | Or64 | Xor32
        | Xor64 | Cmp32 | Cmp64 => {
            let (rr, group, wide) = arith_codes(op).unwrap();
            let dst = reg_of(&node.operands[0])?;
            match &node.operands[1] {
                Operand::Reg(src) => enc.arith_rr(rr, wide, dst, *src),
                src => {
                    let imm = int_imm(src).ok_or_else(|| {
                        CompileError::invariant(
                            "code-emission",
                            format!("bad arithmetic operand {src}"),
                        )
                    })?;
                    enc.arith_ri(group, wide, dst, imm as i32);
                }
            }
        }

        IMul32 | IMul64 => {
            let wide = op == IMul64;
            let dst = reg_of(&node.operands[0])?;
            match &node.operands[1] {
                Operand::Reg(src) => enc.imul_rr(wide, dst, *src),
                src => {
                    let imm = int_imm(src).ok_or_else(|| {
                        CompileError::invariant("code-emission", "bad multiply operand")
                    })?;
                    enc.imul_ri(wide, dst, dst, imm as i32);
                }
            }
        }

        Not32 | Not64 => {
            let reg = reg_of(&node.operands[0])?;
            enc.not_r(op == Not64, reg);
        }

        Shl32 | Shl64 | Shr32 | Shr64 | Sar32 | Sar64 => {
            let (group, wide) = shift_group(op).unwrap();
            let dst = reg_of(&node.operands[0])?;
            match &node.operands[1] {
                Operand::Reg(reg) if *reg == regs::RCX => enc.shift_cl(group, wide, dst),
                Operand::Constant(ConstValue::I8(count)) => {
                    enc.shift_ri(group, wide, dst, *count)
                }
                other => {
                    return Err(CompileError::invariant(
                        "code-emission",
                        format!("bad shift count {other}"),
                    ))
                }
            }
        }

        Cdq => enc.cdq(),
        Cqo => enc.cqo(),
        Idiv32 => enc.div_r(7, false, reg_of(&node.operands[0])?),
        Idiv64 => enc.div_r(7, true, reg_of(&node.operands[0])?),
        Div32 => enc.div_r(6, false, reg_of(&node.operands[0])?),
        Div64 => enc.div_r(6, true, reg_of(&node.operands[0])?),

        Movsx8x32 => enc.movsx8_rr(reg_of(&node.results[0])?, reg_of(&node.operands[0])?),
        Movsx16x32 => enc.movsx16_rr(reg_of(&node.results[0])?, reg_of(&node.operands[0])?),
        Movsx32x64 => enc.movsxd_rr(reg_of(&node.results[0])?, reg_of(&node.operands[0])?),
        Movzx8x32 => enc.movzx8_rr(reg_of(&node.results[0])?, reg_of(&node.operands[0])?),
        Movzx16x32 => enc.movzx16_rr(reg_of(&node.results[0])?, reg_of(&node.operands[0])?),

        Addss | Addsd | Subss | Subsd | Mulss | Mulsd | Divss | Divsd => {
            let (byte, double) = sse_arith_byte(op).unwrap();
            let dst = reg_of(&node.operands[0])?;
            let src = match &node.operands[1] {
                Operand::Reg(reg) => *reg,
                Operand::Constant(c) => {
                    materialize_float(enc, c, regs::XMM15)?;
                    regs::XMM15
                }
                other => {
                    return Err(CompileError::invariant(
                        "code-emission",
                        format!("bad float operand {other}"),
                    ))
                }
            };
            enc.sse_arith_rr(byte, double, dst, src);
        }

        Ucomiss | Ucomisd => {
            let a = reg_of(&node.operands[0])?;
            let b = reg_of(&node.operands[1])?;
            enc.ucomi_rr(op == Ucomisd, a, b);
        }

        Cvtsi2ss32 => emit_cvtsi(enc, &node, false, false)?,
        Cvtsi2sd32 => emit_cvtsi(enc, &node, true, false)?,
        Cvtsi2sd64 => emit_cvtsi(enc, &node, true, true)?,
        Cvtss2sd => enc.cvtss2sd_rr(reg_of(&node.results[0])?, reg_of(&node.operands[0])?),
        Cvtsd2ss => enc.cvtsd2ss_rr(reg_of(&node.results[0])?, reg_of(&node.operands[0])?),
        Cvttss2si32 => enc.cvtt2si_rr(false, reg_of(&node.results[0])?, reg_of(&node.operands[0])?),
        Cvttsd2si32 => enc.cvtt2si_rr(true, reg_of(&node.results[0])?, reg_of(&node.operands[0])?),

        Setcc => {
            let cond = node.cond.ok_or_else(|| {
                CompileError::invariant("code-emission", "setcc without condition")
            })?;
            enc.setcc(cond, reg_of(&node.results[0])?);
        }

        Jcc => {
            let cond = node.cond.ok_or_else(|| {
                CompileError::invariant("code-emission", "jcc without condition")
            })?;
            let hole = enc.jcc(cond);
            fixups.push((hole, node.targets[0]));
        }
        Jmp => {
            let hole = enc.jmp();
            fixups.push((hole, node.targets[0]));
        }
        Call => match &node.operands[0] {
            Operand::Symbol(sym) => {
                let sym = sym.clone();
                let hole = enc.call();
                relocate(ctx, RelocKind::Relative32, hole, &sym, -4);
            }
            Operand::Reg(reg) => enc.call_r(*reg),
            other => {
                return Err(CompileError::invariant(
                    "code-emission",
                    format!("bad call target {other}"),
                ))
            }
        },
        Push => match &node.operands[0] {
            Operand::Reg(reg) => enc.push_r(*reg),
            src => {
                let imm = int_imm(src).ok_or_else(|| {
                    CompileError::invariant("code-emission", format!("bad push operand {src}"))
                })?;
                if i32::try_from(imm).is_ok() {
                    enc.push_imm32(imm as i32);
                } else {
                    enc.mov64_ri(regs::R11, imm);
                    enc.push_r(regs::R11);
                }
            }
        },
        Pop => enc.pop_r(reg_of(&node.results[0])?),
        Ret => {
            if ctx.frame_size > 0 {
                enc.arith_ri(0, true, regs::RSP, ctx.frame_size as i32);
            }
            for &reg in ctx.saved_regs.iter().rev() {
                enc.pop_r(reg);
            }
            enc.pop_r(regs::RBP);
            enc.ret();
        }
    }
    Ok(())
}

fn emit_cvtsi(
    enc: &mut Encoder,
    node: &crate::core::graph::Node,
    double: bool,
    wide: bool,
) -> CompileResult<()> {
    let dst = reg_of(&node.results[0])?;
    let src = match &node.operands[0] {
        Operand::Reg(reg) => *reg,
        src => {
            let imm = int_imm(src).ok_or_else(|| {
                CompileError::invariant("code-emission", "bad convert operand")
            })?;
            if wide {
                enc.mov64_ri(regs::R11, imm);
            } else {
                enc.mov32_ri(regs::R11, imm as i32);
            }
            regs::R11
        }
    };
    enc.cvtsi2_rr(double, wide, dst, src);
    Ok(())
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

    #[test]
    fn emits_prologue_body_and_epilogue() {
        with_ctx(|ctx| {
            let block = ctx.graph.create_block();
            ctx.prologue = Some(block);
            ctx.graph.append(
                block,
                Node::new(Opcode::X64(X64Op::Mov32))
                    .result(Operand::Reg(regs::RAX))
                    .operand(Operand::i32(42)),
            );
            ctx.graph.append(block, Node::new(Opcode::X64(X64Op::Ret)));
            ctx.graph.recompute_edges();
            CodeEmissionStage.run(ctx).unwrap();
            // push rbp; mov rbp, rsp; mov eax, 42; pop rbp; ret.
            assert_eq!(
                ctx.code,
                vec![0x55, 0x48, 0x8B, 0xEC, 0xB8, 42, 0, 0, 0, 0x5D, 0xC3]
            );
        });
    }

    #[test]
    fn branch_fixups_resolve_block_offsets() {
        with_ctx(|ctx| {
            let a = ctx.graph.create_block();
            let b = ctx.graph.create_block();
            ctx.prologue = Some(a);
            ctx.graph.append(
                a,
                Node::new(Opcode::X64(X64Op::Jmp)).target(b),
            );
            ctx.graph.append(b, Node::new(Opcode::X64(X64Op::Ret)));
            ctx.graph.recompute_edges();
            CodeEmissionStage.run(ctx).unwrap();
            // jmp rel32 with rel = 0: the next instruction is the target.
            let jmp_at = ctx.block_offsets[&a] as usize;
            assert_eq!(ctx.code[jmp_at], 0xE9);
            assert_eq!(&ctx.code[jmp_at + 1..jmp_at + 5], &[0, 0, 0, 0]);
        });
    }

    #[test]
    fn calls_record_relocations() {
        with_ctx(|ctx| {
            let block = ctx.graph.create_block();
            ctx.prologue = Some(block);
            ctx.graph.append(
                block,
                Node::new(Opcode::X64(X64Op::Call)).operand(Operand::symbol("Test::Other")),
            );
            ctx.graph.append(block, Node::new(Opcode::X64(X64Op::Ret)));
            ctx.graph.recompute_edges();
            CodeEmissionStage.run(ctx).unwrap();
            assert_eq!(ctx.relocations.len(), 1);
            let reloc = &ctx.relocations[0];
            assert_eq!(reloc.kind, RelocKind::Relative32);
            assert_eq!(reloc.target, "Test::Other");
            assert_eq!(reloc.addend, -4);
            assert_eq!(ctx.code[reloc.offset as usize - 1], 0xE8);
        });
    }

    #[test]
    fn node_offsets_are_recorded() {
        with_ctx(|ctx| {
            let block = ctx.graph.create_block();
            ctx.prologue = Some(block);
            let mov = ctx.graph.append(
                block,
                Node::new(Opcode::X64(X64Op::Mov32))
                    .result(Operand::Reg(regs::RAX))
                    .operand(Operand::i32(7)),
            );
            ctx.graph.append(block, Node::new(Opcode::X64(X64Op::Ret)));
            ctx.graph.recompute_edges();
            CodeEmissionStage.run(ctx).unwrap();
            // After push rbp + mov rbp,rsp.
            assert_eq!(ctx.graph.node(mov).offset, Some(4));
        });
    }
}
