// The CIL decoder turns a stack-machine method body into register IR. It discovers block
// leaders (entry, branch targets, fall-through points, protected-region boundaries), then
// simulates the evaluation stack per block, allocating a virtual register for every computed
// value. A stack that is non-empty at a block boundary is flushed into canonical per-depth
// join registers so that every predecessor hands the successor the same operands. The graph
// gains a unique prologue block (parameter moves, local zeroing) and a unique epilogue block
// holding the only return node.

use std::collections::{BTreeSet, HashMap};

use crate::core::error::{CompileError, CompileResult};
use crate::core::graph::{BlockId, Node};
use crate::core::instruction::{Condition, IrOp, IrType};
use crate::core::operand::{ConstValue, Operand, StackSlotKind, VRegId};
use crate::stages::{MethodContext, Stage};
use crate::ty::{CilOp, MethodId};

pub struct CilDecoderStage;

impl Stage for CilDecoderStage {
    fn name(&self) -> &'static str {
        "decode"
    }

    fn run(&mut self, ctx: &mut MethodContext) -> CompileResult<()> {
        Decoder::new(ctx).decode()
    }
}

/// Pick the scalar move opcode for a type.
pub fn move_op(ty: IrType, ptr_size: u32) -> IrOp {
    match ty {
        IrType::I32 => IrOp::Move32,
        IrType::I64 => IrOp::Move64,
        IrType::R4 => IrOp::MoveR4,
        IrType::R8 => IrOp::MoveR8,
        IrType::Ptr => {
            if ptr_size == 8 {
                IrOp::Move64
            } else {
                IrOp::Move32
            }
        }
        IrType::Compound(_) => IrOp::MoveCompound,
    }
}

struct Decoder<'a, 'b> {
    ctx: &'b mut MethodContext<'a>,
    stack: Vec<(Operand, IrType)>,
    /// Canonical registers handed across block boundaries, by stack depth.
    join_vregs: Vec<VRegId>,
    /// Expected evaluation stack at each block's entry.
    entry_stacks: HashMap<BlockId, Vec<(VRegId, IrType)>>,
    block_map: HashMap<usize, BlockId>,
}

impl<'a, 'b> Decoder<'a, 'b> {
    fn new(ctx: &'b mut MethodContext<'a>) -> Self {
        Decoder {
            ctx,
            stack: Vec::new(),
            join_vregs: Vec::new(),
            entry_stacks: HashMap::new(),
            block_map: HashMap::new(),
        }
    }

    fn decode(mut self) -> CompileResult<()> {
        let method = self.ctx.ts.method(self.ctx.method);
        let body = method.body.clone().ok_or_else(|| CompileError::TypeSystem {
            item: self.ctx.ts.method_symbol(self.ctx.method),
            reason: "method has no body".to_string(),
        })?;

        let prologue = self.ctx.graph.create_block();
        self.ctx.prologue = Some(prologue);

        // Block leaders: entry, branch targets, fall-through successors of
        // terminators, protected-region boundaries.
        let mut leaders: BTreeSet<usize> = BTreeSet::new();
        leaders.insert(0);
        for (idx, op) in body.ops.iter().enumerate() {
            match op {
                CilOp::Br(t) => {
                    leaders.insert(*t);
                    leaders.insert(idx + 1);
                }
                CilOp::BrTrue(t)
                | CilOp::BrFalse(t)
                | CilOp::Beq(t)
                | CilOp::Bne(t)
                | CilOp::Blt(t)
                | CilOp::Ble(t)
                | CilOp::Bgt(t)
                | CilOp::Bge(t)
                | CilOp::BltUn(t)
                | CilOp::BgeUn(t) => {
                    leaders.insert(*t);
                    leaders.insert(idx + 1);
                }
                CilOp::Switch(targets) => {
                    for t in targets {
                        leaders.insert(*t);
                    }
                    leaders.insert(idx + 1);
                }
                CilOp::Ret => {
                    leaders.insert(idx + 1);
                }
                _ => {}
            }
        }
        for region in &body.protected {
            leaders.insert(region.try_start);
            leaders.insert(region.try_end);
            leaders.insert(region.handler_start);
            leaders.insert(region.handler_end);
        }
        leaders.retain(|l| *l < body.ops.len());

        for &leader in &leaders {
            let block = self.ctx.graph.create_block();
            self.block_map.insert(leader, block);
        }

        let epilogue = self.ctx.graph.create_block();
        self.ctx.epilogue = Some(epilogue);

        self.emit_prologue(prologue, method.flags.is_static, &body.locals)?;
        match self.block_map.get(&0) {
            Some(&entry) => {
                self.ctx
                    .graph
                    .append(prologue, Node::ir(IrOp::Jmp).target(entry));
            }
            None => {
                self.ctx
                    .graph
                    .append(prologue, Node::ir(IrOp::Jmp).target(epilogue));
            }
        }

        // Decode each block span.
        let leader_list: Vec<usize> = leaders.iter().copied().collect();
        for (i, &start) in leader_list.iter().enumerate() {
            let end = leader_list.get(i + 1).copied().unwrap_or(body.ops.len());
            let block = self.block_map[&start];
            self.stack = self
                .entry_stacks
                .get(&block)
                .map(|s| {
                    s.iter()
                        .map(|(v, ty)| (Operand::VReg(*v), *ty))
                        .collect()
                })
                .unwrap_or_default();
            self.decode_span(block, &body.ops, start, end)?;
        }

        for region in &body.protected {
            let (Some(&try_entry), Some(&handler_entry)) = (
                self.block_map.get(&region.try_start),
                self.block_map.get(&region.handler_start),
            ) else {
                return Err(CompileError::TypeSystem {
                    item: self.ctx.ts.method_symbol(self.ctx.method),
                    reason: "protected region outside the method body".to_string(),
                });
            };
            self.ctx.regions.push(crate::stages::RegionInfo {
                kind: region.kind,
                try_entry,
                handler_entry,
            });
        }

        // The unique return lives in the epilogue.
        match self.ctx.return_vreg {
            Some(ret) => {
                let node = Node::ir(IrOp::Return)
                    .operand(Operand::VReg(ret))
                    .with_ty(self.ctx.vregs.ty(ret));
                self.ctx.graph.append(epilogue, node);
            }
            None => {
                self.ctx.graph.append(epilogue, Node::ir(IrOp::ReturnVoid));
            }
        }

        self.ctx.graph.recompute_edges();
        self.ctx
            .counters
            .update("decode.blocks", self.ctx.graph.block_count() as i64);
        self.ctx
            .counters
            .update("decode.nodes", self.ctx.graph.node_count() as i64);
        Ok(())
    }

    fn emit_prologue(
        &mut self,
        prologue: BlockId,
        is_static: bool,
        locals: &[crate::ty::TypeId],
    ) -> CompileResult<()> {
        let method = self.ctx.ts.method(self.ctx.method);
        let ptr_size = self.ctx.layout.ptr_size();

        let mut param_types: Vec<IrType> = Vec::new();
        if !is_static {
            param_types.push(IrType::Ptr);
        }
        for &p in &method.sig.params {
            param_types.push(self.ctx.layout.ir_type(p));
        }
        if let Some(ret) = method.sig.ret {
            let ret_ty = self.ctx.layout.ir_type(ret);
            if matches!(ret_ty, IrType::Compound(_)) {
                return Err(CompileError::not_supported(
                    "compound return values".to_string(),
                ));
            }
            self.ctx.return_vreg = Some(self.ctx.vregs.alloc(ret_ty));
        }

        for (index, &ty) in param_types.iter().enumerate() {
            if matches!(ty, IrType::Compound(_)) {
                return Err(CompileError::not_supported(
                    "compound parameters".to_string(),
                ));
            }
            let slot = self.ctx.slots.add(StackSlotKind::Param, ty, index as u32);
            let vreg = self.ctx.vregs.alloc(ty);
            self.ctx.params.push(slot);
            self.ctx.param_vregs.push(vreg);
            let node = Node::ir(move_op(ty, ptr_size))
                .result(Operand::VReg(vreg))
                .operand(Operand::Stack(slot))
                .with_ty(ty);
            self.ctx.graph.append(prologue, node);
        }

        for &local_ty in locals.iter() {
            let ty = self.ctx.layout.ir_type(local_ty);
            if matches!(ty, IrType::Compound(_)) {
                return Err(CompileError::not_supported("compound locals".to_string()));
            }
            let vreg = self.ctx.vregs.alloc(ty);
            self.ctx.local_vregs.push(vreg);
            let zero = match ty {
                IrType::I32 => Operand::i32(0),
                IrType::I64 => Operand::i64(0),
                IrType::R4 => Operand::Constant(ConstValue::R4(0.0)),
                IrType::R8 => Operand::Constant(ConstValue::R8(0.0)),
                IrType::Ptr => Operand::Constant(ConstValue::Null),
                IrType::Compound(_) => unreachable!(),
            };
            let node = Node::ir(move_op(ty, ptr_size))
                .result(Operand::VReg(vreg))
                .operand(zero)
                .with_ty(ty);
            self.ctx.graph.append(prologue, node);
        }
        Ok(())
    }

    fn decode_span(
        &mut self,
        block: BlockId,
        ops: &[CilOp],
        start: usize,
        end: usize,
    ) -> CompileResult<()> {
        let ptr_size = self.ctx.layout.ptr_size();
        let mut terminated = false;

        for idx in start..end {
            let op = &ops[idx];
            match op {
                CilOp::Nop => {}
                CilOp::LdArg(n) => {
                    let vreg = *self.ctx.param_vregs.get(*n as usize).ok_or_else(|| {
                        CompileError::invariant("decode", format!("ldarg {n} out of range"))
                    })?;
                    self.stack.push((Operand::VReg(vreg), self.ctx.vregs.ty(vreg)));
                }
                CilOp::LdLoc(n) => {
                    let local = *self.ctx.local_vregs.get(*n as usize).ok_or_else(|| {
                        CompileError::invariant("decode", format!("ldloc {n} out of range"))
                    })?;
                    // Copy on push so a later store does not alias the
                    // value already on the stack.
                    let ty = self.ctx.vregs.ty(local);
                    let tmp = self.ctx.vregs.alloc(ty);
                    let node = Node::ir(move_op(ty, ptr_size))
                        .result(Operand::VReg(tmp))
                        .operand(Operand::VReg(local))
                        .with_ty(ty);
                    self.ctx.graph.append(block, node);
                    self.stack.push((Operand::VReg(tmp), ty));
                }
                CilOp::StLoc(n) => {
                    let local = *self.ctx.local_vregs.get(*n as usize).ok_or_else(|| {
                        CompileError::invariant("decode", format!("stloc {n} out of range"))
                    })?;
                    let (value, _) = self.pop()?;
                    let ty = self.ctx.vregs.ty(local);
                    let node = Node::ir(move_op(ty, ptr_size))
                        .result(Operand::VReg(local))
                        .operand(value)
                        .with_ty(ty);
                    self.ctx.graph.append(block, node);
                }
                CilOp::LdcI4(v) => self.stack.push((Operand::i32(*v), IrType::I32)),
                CilOp::LdcI8(v) => self.stack.push((Operand::i64(*v), IrType::I64)),
                CilOp::LdcR4(v) => self
                    .stack
                    .push((Operand::Constant(ConstValue::R4(*v)), IrType::R4)),
                CilOp::LdcR8(v) => self
                    .stack
                    .push((Operand::Constant(ConstValue::R8(*v)), IrType::R8)),
                CilOp::LdNull => self
                    .stack
                    .push((Operand::Constant(ConstValue::Null), IrType::Ptr)),
                CilOp::Dup => {
                    let top = self.stack.last().cloned().ok_or_else(Self::underflow)?;
                    self.stack.push(top);
                }
                CilOp::Pop => {
                    self.pop()?;
                }

                CilOp::Add => self.binary_arith(block, IrOp::Add32, IrOp::Add64, Some((IrOp::AddR4, IrOp::AddR8)))?,
                CilOp::Sub => self.binary_arith(block, IrOp::Sub32, IrOp::Sub64, Some((IrOp::SubR4, IrOp::SubR8)))?,
                CilOp::Mul => self.binary_arith(block, IrOp::Mul32, IrOp::Mul64, Some((IrOp::MulR4, IrOp::MulR8)))?,
                CilOp::Div => self.binary_arith(
                    block,
                    IrOp::DivSigned32,
                    IrOp::DivSigned64,
                    Some((IrOp::DivR4, IrOp::DivR8)),
                )?,
                CilOp::DivUn => {
                    self.binary_arith(block, IrOp::DivUnsigned32, IrOp::DivUnsigned64, None)?
                }
                CilOp::Rem => {
                    self.binary_arith(block, IrOp::RemSigned32, IrOp::RemSigned64, None)?
                }
                CilOp::RemUn => {
                    self.binary_arith(block, IrOp::RemUnsigned32, IrOp::RemUnsigned64, None)?
                }
                CilOp::And => self.binary_arith(block, IrOp::And32, IrOp::And64, None)?,
                CilOp::Or => self.binary_arith(block, IrOp::Or32, IrOp::Or64, None)?,
                CilOp::Xor => self.binary_arith(block, IrOp::Xor32, IrOp::Xor64, None)?,
                CilOp::Shl => self.shift(block, IrOp::ShiftLeft32, IrOp::ShiftLeft64)?,
                CilOp::Shr => self.shift(block, IrOp::ArithShiftRight32, IrOp::ArithShiftRight64)?,
                CilOp::ShrUn => self.shift(block, IrOp::ShiftRight32, IrOp::ShiftRight64)?,
                CilOp::Neg => {
                    let (value, ty) = self.pop()?;
                    let zero = match ty {
                        IrType::I32 => Operand::i32(0),
                        IrType::I64 => Operand::i64(0),
                        IrType::R4 => Operand::Constant(ConstValue::R4(0.0)),
                        IrType::R8 => Operand::Constant(ConstValue::R8(0.0)),
                        _ => return Err(CompileError::not_supported("neg on pointers")),
                    };
                    let op = match ty {
                        IrType::I32 => IrOp::Sub32,
                        IrType::I64 => IrOp::Sub64,
                        IrType::R4 => IrOp::SubR4,
                        IrType::R8 => IrOp::SubR8,
                        _ => unreachable!(),
                    };
                    let result = self.ctx.vregs.alloc(ty);
                    let node = Node::ir(op)
                        .result(Operand::VReg(result))
                        .operand(zero)
                        .operand(value)
                        .with_ty(ty);
                    self.ctx.graph.append(block, node);
                    self.stack.push((Operand::VReg(result), ty));
                }
                CilOp::Not => {
                    let (value, ty) = self.pop()?;
                    let op = match self.int_width(ty) {
                        32 => IrOp::Not32,
                        _ => IrOp::Not64,
                    };
                    let result = self.ctx.vregs.alloc(ty);
                    let node = Node::ir(op)
                        .result(Operand::VReg(result))
                        .operand(value)
                        .with_ty(ty);
                    self.ctx.graph.append(block, node);
                    self.stack.push((Operand::VReg(result), ty));
                }

                CilOp::ConvI4 => self.convert_to_i4(block)?,
                CilOp::ConvI8 => self.convert_to_i8(block)?,
                CilOp::ConvR4 => self.convert_to_r4(block)?,
                CilOp::ConvR8 => self.convert_to_r8(block)?,

                CilOp::Ceq => self.compare(block, Condition::Equal)?,
                CilOp::Cgt => self.compare(block, Condition::Greater)?,
                CilOp::CgtUn => self.compare(block, Condition::UnsignedGreater)?,
                CilOp::Clt => self.compare(block, Condition::Less)?,
                CilOp::CltUn => self.compare(block, Condition::UnsignedLess)?,

                CilOp::Br(t) => {
                    self.flush_and_record(block, &[*t])?;
                    let target = self.block_map[t];
                    self.ctx.graph.append(block, Node::ir(IrOp::Jmp).target(target));
                    terminated = true;
                }
                CilOp::BrTrue(t) => self.branch_on_truth(block, *t, idx + 1, Condition::NotEqual, &mut terminated)?,
                CilOp::BrFalse(t) => self.branch_on_truth(block, *t, idx + 1, Condition::Equal, &mut terminated)?,
                CilOp::Beq(t) => self.branch_compare(block, *t, idx + 1, Condition::Equal, &mut terminated)?,
                CilOp::Bne(t) => self.branch_compare(block, *t, idx + 1, Condition::NotEqual, &mut terminated)?,
                CilOp::Blt(t) => self.branch_compare(block, *t, idx + 1, Condition::Less, &mut terminated)?,
                CilOp::Ble(t) => self.branch_compare(block, *t, idx + 1, Condition::LessOrEqual, &mut terminated)?,
                CilOp::Bgt(t) => self.branch_compare(block, *t, idx + 1, Condition::Greater, &mut terminated)?,
                CilOp::Bge(t) => self.branch_compare(block, *t, idx + 1, Condition::GreaterOrEqual, &mut terminated)?,
                CilOp::BltUn(t) => self.branch_compare(block, *t, idx + 1, Condition::UnsignedLess, &mut terminated)?,
                CilOp::BgeUn(t) => {
                    self.branch_compare(block, *t, idx + 1, Condition::UnsignedGreaterOrEqual, &mut terminated)?
                }
                CilOp::Switch(targets) => {
                    let (selector, _) = self.pop()?;
                    let mut all: Vec<usize> = targets.clone();
                    all.push(idx + 1);
                    self.flush_and_record(block, &all)?;
                    let mut node = Node::ir(IrOp::Switch).operand(selector).with_ty(IrType::I32);
                    for t in targets {
                        node = node.target(self.block_map[t]);
                    }
                    self.ctx.graph.append(block, node);
                    let fall = self.block_map[&(idx + 1)];
                    self.ctx.graph.append(block, Node::ir(IrOp::Jmp).target(fall));
                    terminated = true;
                }
                CilOp::Ret => {
                    if let Some(ret) = self.ctx.return_vreg {
                        let (value, _) = self.pop()?;
                        let ty = self.ctx.vregs.ty(ret);
                        let node = Node::ir(move_op(ty, ptr_size))
                            .result(Operand::VReg(ret))
                            .operand(value)
                            .with_ty(ty);
                        self.ctx.graph.append(block, node);
                    }
                    let epilogue = self.ctx.epilogue.expect("epilogue");
                    self.ctx.graph.append(block, Node::ir(IrOp::Jmp).target(epilogue));
                    terminated = true;
                }

                CilOp::Call(callee) | CilOp::CallVirt(callee) => self.call(block, *callee)?,
                CilOp::NewObj(_) => {
                    return Err(CompileError::not_supported("newobj allocation"));
                }

                CilOp::LdFld(field) => {
                    let (obj, obj_ty) = self.pop()?;
                    if obj_ty != IrType::Ptr {
                        return Err(CompileError::not_supported(
                            "field access on a non-reference value",
                        ));
                    }
                    let fdef = self.ctx.ts.field(*field);
                    let offset = self.ctx.layout.field_offset(*field);
                    self.load_field(block, obj, offset, fdef.ty)?;
                }
                CilOp::StFld(field) => {
                    let (value, _) = self.pop()?;
                    let (obj, obj_ty) = self.pop()?;
                    if obj_ty != IrType::Ptr {
                        return Err(CompileError::not_supported(
                            "field access on a non-reference value",
                        ));
                    }
                    let fdef = self.ctx.ts.field(*field);
                    let offset = self.ctx.layout.field_offset(*field);
                    self.store_field(block, obj, offset, fdef.ty, value)?;
                }
                CilOp::LdSFld(field) => {
                    let fdef = self.ctx.ts.field(*field);
                    let symbol = static_field_symbol(self.ctx.ts, *field);
                    let base = Operand::Constant(ConstValue::Symbol(symbol));
                    self.load_field(block, base, 0, fdef.ty)?;
                }
                CilOp::StSFld(field) => {
                    let (value, _) = self.pop()?;
                    let fdef = self.ctx.ts.field(*field);
                    let symbol = static_field_symbol(self.ctx.ts, *field);
                    let base = Operand::Constant(ConstValue::Symbol(symbol));
                    self.store_field(block, base, 0, fdef.ty, value)?;
                }
            }
            if terminated {
                break;
            }
        }

        if !terminated {
            // Fall through into the next leader.
            if self.block_map.contains_key(&end) {
                self.flush_and_record(block, &[end])?;
                let target = self.block_map[&end];
                self.ctx.graph.append(block, Node::ir(IrOp::Jmp).target(target));
            } else {
                // Body ran off the end without a return.
                let epilogue = self.ctx.epilogue.expect("epilogue");
                self.ctx.graph.append(block, Node::ir(IrOp::Jmp).target(epilogue));
            }
        }
        Ok(())
    }

    fn underflow() -> CompileError {
        CompileError::invariant("decode", "evaluation stack underflow")
    }

    fn pop(&mut self) -> CompileResult<(Operand, IrType)> {
        self.stack.pop().ok_or_else(Self::underflow)
    }

    fn int_width(&self, ty: IrType) -> u32 {
        match ty {
            IrType::I64 => 64,
            IrType::Ptr if self.ctx.layout.ptr_size() == 8 => 64,
            _ => 32,
        }
    }

    fn binary_arith(
        &mut self,
        block: BlockId,
        op32: IrOp,
        op64: IrOp,
        float_ops: Option<(IrOp, IrOp)>,
    ) -> CompileResult<()> {
        let (rhs, _) = self.pop()?;
        let (lhs, ty) = self.pop()?;
        let op = match ty {
            IrType::R4 => {
                float_ops
                    .ok_or_else(|| CompileError::not_supported("float operands here"))?
                    .0
            }
            IrType::R8 => {
                float_ops
                    .ok_or_else(|| CompileError::not_supported("float operands here"))?
                    .1
            }
            _ => {
                if self.int_width(ty) == 64 {
                    op64
                } else {
                    op32
                }
            }
        };
        let result = self.ctx.vregs.alloc(ty);
        let node = Node::ir(op)
            .result(Operand::VReg(result))
            .operand(lhs)
            .operand(rhs)
            .with_ty(ty);
        self.ctx.graph.append(block, node);
        self.stack.push((Operand::VReg(result), ty));
        Ok(())
    }

    fn shift(&mut self, block: BlockId, op32: IrOp, op64: IrOp) -> CompileResult<()> {
        let (count, _) = self.pop()?;
        let (value, ty) = self.pop()?;
        let op = if self.int_width(ty) == 64 { op64 } else { op32 };
        let result = self.ctx.vregs.alloc(ty);
        let node = Node::ir(op)
            .result(Operand::VReg(result))
            .operand(value)
            .operand(count)
            .with_ty(ty);
        self.ctx.graph.append(block, node);
        self.stack.push((Operand::VReg(result), ty));
        Ok(())
    }

    fn convert_to_i4(&mut self, block: BlockId) -> CompileResult<()> {
        let (value, ty) = self.pop()?;
        let op = match ty {
            IrType::I32 => {
                self.stack.push((value, IrType::I32));
                return Ok(());
            }
            IrType::I64 => IrOp::Truncate64x32,
            IrType::R4 => IrOp::ConvertR4ToI32,
            IrType::R8 => IrOp::ConvertR8ToI32,
            _ => return Err(CompileError::not_supported("conv.i4 from this type")),
        };
        self.emit_convert(block, op, value, IrType::I32)
    }

    fn convert_to_i8(&mut self, block: BlockId) -> CompileResult<()> {
        let (value, ty) = self.pop()?;
        let op = match ty {
            IrType::I64 => {
                self.stack.push((value, IrType::I64));
                return Ok(());
            }
            IrType::I32 => IrOp::SignExtend32x64,
            _ => return Err(CompileError::not_supported("conv.i8 from this type")),
        };
        self.emit_convert(block, op, value, IrType::I64)
    }

    fn convert_to_r4(&mut self, block: BlockId) -> CompileResult<()> {
        let (value, ty) = self.pop()?;
        let op = match ty {
            IrType::R4 => {
                self.stack.push((value, IrType::R4));
                return Ok(());
            }
            IrType::I32 => IrOp::ConvertI32ToR4,
            IrType::R8 => IrOp::ConvertR8ToR4,
            _ => return Err(CompileError::not_supported("conv.r4 from this type")),
        };
        self.emit_convert(block, op, value, IrType::R4)
    }

    fn convert_to_r8(&mut self, block: BlockId) -> CompileResult<()> {
        let (value, ty) = self.pop()?;
        let op = match ty {
            IrType::R8 => {
                self.stack.push((value, IrType::R8));
                return Ok(());
            }
            IrType::I32 => IrOp::ConvertI32ToR8,
            IrType::I64 => IrOp::ConvertI64ToR8,
            IrType::R4 => IrOp::ConvertR4ToR8,
            _ => return Err(CompileError::not_supported("conv.r8 from this type")),
        };
        self.emit_convert(block, op, value, IrType::R8)
    }

    fn emit_convert(
        &mut self,
        block: BlockId,
        op: IrOp,
        value: Operand,
        to: IrType,
    ) -> CompileResult<()> {
        let result = self.ctx.vregs.alloc(to);
        let node = Node::ir(op)
            .result(Operand::VReg(result))
            .operand(value)
            .with_ty(to);
        self.ctx.graph.append(block, node);
        self.stack.push((Operand::VReg(result), to));
        Ok(())
    }

    fn compare_op(&self, ty: IrType) -> IrOp {
        match ty {
            IrType::R4 => IrOp::CompareR4,
            IrType::R8 => IrOp::CompareR8,
            _ if self.int_width(ty) == 64 => IrOp::Compare64,
            _ => IrOp::Compare32,
        }
    }

    fn compare(&mut self, block: BlockId, cond: Condition) -> CompileResult<()> {
        let (rhs, _) = self.pop()?;
        let (lhs, ty) = self.pop()?;
        let result = self.ctx.vregs.alloc(IrType::I32);
        let node = Node::ir(self.compare_op(ty))
            .result(Operand::VReg(result))
            .operand(lhs)
            .operand(rhs)
            .with_cond(cond)
            .with_ty(ty);
        self.ctx.graph.append(block, node);
        self.stack.push((Operand::VReg(result), IrType::I32));
        Ok(())
    }

    fn cmp_branch_op(&self, ty: IrType) -> CompileResult<IrOp> {
        match ty {
            IrType::R4 | IrType::R8 => {
                Err(CompileError::not_supported("float compare-and-branch"))
            }
            _ if self.int_width(ty) == 64 => Ok(IrOp::CmpBranch64),
            _ => Ok(IrOp::CmpBranch32),
        }
    }

    fn branch_on_truth(
        &mut self,
        block: BlockId,
        taken: usize,
        fall: usize,
        cond: Condition,
        terminated: &mut bool,
    ) -> CompileResult<()> {
        let (value, ty) = self.pop()?;
        self.flush_and_record(block, &[taken, fall])?;
        let zero = if self.int_width(ty) == 64 {
            Operand::i64(0)
        } else {
            Operand::i32(0)
        };
        let op = self.cmp_branch_op(ty)?;
        let taken_block = self.block_map[&taken];
        let fall_block = self.block_map[&fall];
        let node = Node::ir(op)
            .operand(value)
            .operand(zero)
            .with_cond(cond)
            .with_ty(ty)
            .target(taken_block);
        self.ctx.graph.append(block, node);
        self.ctx
            .graph
            .append(block, Node::ir(IrOp::Jmp).target(fall_block));
        *terminated = true;
        Ok(())
    }

    fn branch_compare(
        &mut self,
        block: BlockId,
        taken: usize,
        fall: usize,
        cond: Condition,
        terminated: &mut bool,
    ) -> CompileResult<()> {
        let (rhs, _) = self.pop()?;
        let (lhs, ty) = self.pop()?;
        self.flush_and_record(block, &[taken, fall])?;
        let op = self.cmp_branch_op(ty)?;
        let taken_block = self.block_map[&taken];
        let fall_block = self.block_map[&fall];
        let node = Node::ir(op)
            .operand(lhs)
            .operand(rhs)
            .with_cond(cond)
            .with_ty(ty)
            .target(taken_block);
        self.ctx.graph.append(block, node);
        self.ctx
            .graph
            .append(block, Node::ir(IrOp::Jmp).target(fall_block));
        *terminated = true;
        Ok(())
    }

    fn call(&mut self, block: BlockId, callee: MethodId) -> CompileResult<()> {
        let callee_def = self.ctx.ts.method(callee);
        if callee_def.name == "MemberwiseClone" {
            return Err(CompileError::not_supported("Object.MemberwiseClone"));
        }
        let mut arg_count = callee_def.sig.params.len();
        if !callee_def.flags.is_static {
            arg_count += 1;
        }
        let mut args = Vec::with_capacity(arg_count);
        for _ in 0..arg_count {
            args.push(self.pop()?.0);
        }
        args.reverse();

        let symbol = self.ctx.ts.method_symbol(callee);
        let mut node = Node::ir(IrOp::Call).operand(Operand::symbol(symbol));
        for arg in args {
            node = node.operand(arg);
        }
        let result = match callee_def.sig.ret {
            Some(ret) => {
                let ty = self.ctx.layout.ir_type(ret);
                let vreg = self.ctx.vregs.alloc(ty);
                node = node.result(Operand::VReg(vreg));
                node.ty = Some(ty);
                Some((vreg, ty))
            }
            None => None,
        };
        self.ctx.graph.append(block, node);
        self.ctx.counters.update("decode.calls", 1);
        if let Some((vreg, ty)) = result {
            self.stack.push((Operand::VReg(vreg), ty));
        }
        Ok(())
    }

    fn load_field(
        &mut self,
        block: BlockId,
        base: Operand,
        offset: u32,
        field_ty: crate::ty::TypeId,
    ) -> CompileResult<()> {
        let (op, result_ty) = self.memory_ops(field_ty)?.0;
        let result = self.ctx.vregs.alloc(result_ty);
        let node = Node::ir(op)
            .result(Operand::VReg(result))
            .operand(base)
            .operand(Operand::i32(offset as i32))
            .with_ty(result_ty);
        self.ctx.graph.append(block, node);
        self.stack.push((Operand::VReg(result), result_ty));
        Ok(())
    }

    fn store_field(
        &mut self,
        block: BlockId,
        base: Operand,
        offset: u32,
        field_ty: crate::ty::TypeId,
        value: Operand,
    ) -> CompileResult<()> {
        let (_, (op, value_ty)) = self.memory_ops(field_ty)?;
        let node = Node::ir(op)
            .operand(base)
            .operand(Operand::i32(offset as i32))
            .operand(value)
            .with_ty(value_ty);
        self.ctx.graph.append(block, node);
        Ok(())
    }

    /// Load and store opcodes for a field of the given managed type.
    #[allow(clippy::type_complexity)]
    fn memory_ops(
        &self,
        field_ty: crate::ty::TypeId,
    ) -> CompileResult<((IrOp, IrType), (IrOp, IrType))> {
        use crate::ty::Primitive as P;
        let def = self.ctx.ts.type_def(field_ty);
        let ptr64 = self.ctx.layout.ptr_size() == 8;
        let pair = if let Some(p) = def.primitive() {
            match p {
                P::I1 => ((IrOp::LoadSignExtend8x32, IrType::I32), (IrOp::Store8, IrType::I32)),
                P::U1 | P::Bool => {
                    ((IrOp::LoadZeroExtend8x32, IrType::I32), (IrOp::Store8, IrType::I32))
                }
                P::I2 => ((IrOp::LoadSignExtend16x32, IrType::I32), (IrOp::Store16, IrType::I32)),
                P::U2 | P::Char => {
                    ((IrOp::LoadZeroExtend16x32, IrType::I32), (IrOp::Store16, IrType::I32))
                }
                P::I4 | P::U4 => ((IrOp::Load32, IrType::I32), (IrOp::Store32, IrType::I32)),
                P::I8 | P::U8 => ((IrOp::Load64, IrType::I64), (IrOp::Store64, IrType::I64)),
                P::R4 => ((IrOp::LoadR4, IrType::R4), (IrOp::StoreR4, IrType::R4)),
                P::R8 => ((IrOp::LoadR8, IrType::R8), (IrOp::StoreR8, IrType::R8)),
                P::IPtr | P::UPtr => {
                    if ptr64 {
                        ((IrOp::Load64, IrType::Ptr), (IrOp::Store64, IrType::Ptr))
                    } else {
                        ((IrOp::Load32, IrType::Ptr), (IrOp::Store32, IrType::Ptr))
                    }
                }
            }
        } else if def.is_reference() {
            if ptr64 {
                ((IrOp::Load64, IrType::Ptr), (IrOp::Store64, IrType::Ptr))
            } else {
                ((IrOp::Load32, IrType::Ptr), (IrOp::Store32, IrType::Ptr))
            }
        } else {
            return Err(CompileError::not_supported("value-type field access"));
        };
        Ok(pair)
    }

    /// Flush the evaluation stack into the canonical join registers and
    /// record the resulting entry stack for every target block.
    fn flush_and_record(&mut self, block: BlockId, targets: &[usize]) -> CompileResult<()> {
        let ptr_size = self.ctx.layout.ptr_size();
        let mut canonical: Vec<(VRegId, IrType)> = Vec::with_capacity(self.stack.len());
        for depth in 0..self.stack.len() {
            let (operand, ty) = self.stack[depth].clone();
            let join = match self.join_vregs.get(depth) {
                Some(&v) => {
                    if self.ctx.vregs.ty(v) != ty {
                        return Err(CompileError::not_supported(
                            "inconsistent evaluation stack at a join",
                        ));
                    }
                    v
                }
                None => {
                    let v = self.ctx.vregs.alloc(ty);
                    self.join_vregs.push(v);
                    v
                }
            };
            if operand != Operand::VReg(join) {
                let node = Node::ir(move_op(ty, ptr_size))
                    .result(Operand::VReg(join))
                    .operand(operand)
                    .with_ty(ty);
                self.ctx.graph.append(block, node);
            }
            canonical.push((join, ty));
        }

        for t in targets {
            let target_block = self.block_map[t];
            match self.entry_stacks.get(&target_block) {
                Some(existing) => {
                    if existing != &canonical {
                        return Err(CompileError::not_supported(
                            "inconsistent evaluation stack depth at a join",
                        ));
                    }
                }
                None => {
                    self.entry_stacks.insert(target_block, canonical.clone());
                }
            }
        }
        Ok(())
    }
}

/// Linker symbol of a static field.
pub fn static_field_symbol(ts: &crate::ty::TypeSystem, field: crate::ty::FieldId) -> String {
    let fdef = ts.field(field);
    let owner = ts.type_def(fdef.owner);
    format!("{}::{}", owner.name, fdef.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::options::Options;
    use crate::core::instruction::Opcode;
    use crate::ty::{CilBody, MethodSig, Primitive, TypeLayout, TypeSystemBuilder};
    use std::sync::Arc;

    fn with_decoded(
        params: usize,
        ret: bool,
        ops: Vec<CilOp>,
        locals: usize,
        check: impl FnOnce(&MethodContext, CompileResult<()>),
    ) {
        let mut b = TypeSystemBuilder::new();
        let i4 = b.primitive(Primitive::I4);
        let cls = b.class("Test");
        let body = CilBody {
            locals: vec![i4; locals],
            ops,
            protected: Vec::new(),
        };
        let sig = MethodSig::new(vec![i4; params], ret.then_some(i4));
        let m = b.static_method(cls, "M", sig, body);
        let layout = TypeLayout::new(Arc::new(b.build()), 8, 8).unwrap();
        let options = Options::default();
        let mut ctx = MethodContext::new(m, layout.type_system(), &layout, &options);
        let result = CilDecoderStage.run(&mut ctx);
        check(&ctx, result);
    }

    #[test]
    fn decodes_add_and_return() {
        with_decoded(
            2,
            true,
            vec![CilOp::LdArg(0), CilOp::LdArg(1), CilOp::Add, CilOp::Ret],
            0,
            |ctx, result| {
                result.unwrap();
                let entry = ctx.prologue.unwrap();
                // Prologue: two parameter moves plus the jump.
                let nodes: Vec<_> = ctx.graph.block_nodes(entry).collect();
                assert_eq!(nodes.len(), 3);
                let ops: Vec<_> = ctx
                    .graph
                    .block_ids()
                    .flat_map(|b| ctx.graph.block_nodes(b).collect::<Vec<_>>())
                    .map(|n| ctx.graph.node(n).opcode)
                    .collect();
                assert!(ops.contains(&Opcode::Ir(IrOp::Add32)));
                assert!(ops.contains(&Opcode::Ir(IrOp::Return)));
            },
        );
    }

    #[test]
    fn branch_targets_map_to_blocks() {
        // if (arg0 < arg1) fall through to return arg0.
        with_decoded(
            2,
            true,
            vec![
                CilOp::LdArg(0),
                CilOp::LdArg(1),
                CilOp::Bge(4),
                CilOp::Nop,
                CilOp::LdArg(0),
                CilOp::Ret,
            ],
            0,
            |ctx, result| {
                result.unwrap();
                let mut found = false;
                for b in ctx.graph.block_ids() {
                    for n in ctx.graph.block_nodes(b) {
                        if ctx.graph.node(n).opcode == Opcode::Ir(IrOp::CmpBranch32) {
                            assert_eq!(
                                ctx.graph.node(n).cond,
                                Some(Condition::GreaterOrEqual)
                            );
                            found = true;
                        }
                    }
                }
                assert!(found);
            },
        );
    }

    #[test]
    fn newobj_is_not_supported() {
        let mut b = TypeSystemBuilder::new();
        let cls = b.class("Test");
        let ctor = b.method(
            cls,
            ".ctor",
            crate::ty::MethodFlags::default(),
            MethodSig::new(vec![], None),
            None,
        );
        let body = CilBody {
            locals: vec![],
            ops: vec![CilOp::NewObj(ctor), CilOp::Pop, CilOp::Ret],
            protected: Vec::new(),
        };
        let m = b.static_method(cls, "M", MethodSig::new(vec![], None), body);
        let ts = Arc::new(b.build());
        let layout = TypeLayout::new(ts.clone(), 8, 8).unwrap();
        let options = Options::default();
        let mut ctx = MethodContext::new(m, layout.type_system(), &layout, &options);
        let err = CilDecoderStage.run(&mut ctx).unwrap_err();
        assert!(matches!(err, CompileError::NotSupported { .. }));
    }
}
