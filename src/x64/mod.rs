//! x86-64 backend: platform opcode table, lowering and tweak stages, the
//! byte encoder, and the emission stage.

pub mod emit;
pub mod encoder;
pub mod lowering;
pub mod tweak;

use crate::core::instruction::{flags, Arity, FlowControl, InstrDesc, MemoryAccess};

/// General-purpose and floating-point registers, hardware encoding order.
pub mod regs {
    use crate::core::operand::PhysReg;

    pub const RAX: PhysReg = PhysReg::new(0, 0);
    pub const RCX: PhysReg = PhysReg::new(0, 1);
    pub const RDX: PhysReg = PhysReg::new(0, 2);
    pub const RBX: PhysReg = PhysReg::new(0, 3);
    pub const RSP: PhysReg = PhysReg::new(0, 4);
    pub const RBP: PhysReg = PhysReg::new(0, 5);
    pub const RSI: PhysReg = PhysReg::new(0, 6);
    pub const RDI: PhysReg = PhysReg::new(0, 7);
    pub const R8: PhysReg = PhysReg::new(0, 8);
    pub const R9: PhysReg = PhysReg::new(0, 9);
    pub const R10: PhysReg = PhysReg::new(0, 10);
    pub const R11: PhysReg = PhysReg::new(0, 11);
    pub const R12: PhysReg = PhysReg::new(0, 12);
    pub const R13: PhysReg = PhysReg::new(0, 13);
    pub const R14: PhysReg = PhysReg::new(0, 14);
    pub const R15: PhysReg = PhysReg::new(0, 15);

    pub const XMM0: PhysReg = PhysReg::new(1, 0);
    pub const XMM14: PhysReg = PhysReg::new(1, 14);
    pub const XMM15: PhysReg = PhysReg::new(1, 15);

    /// Registers the allocator may hand out. RAX/RCX/RDX serve the fixed
    /// conventions, R10/R11 are the integer spill scratches.
    pub const GP_POOL: &[PhysReg] = &[RBX, RSI, RDI, R8, R9, R12, R13, R14, R15];

    pub fn xmm(id: u8) -> PhysReg {
        PhysReg::new(1, id)
    }

    /// Allocatable floating-point registers; XMM0 carries return values,
    /// XMM14/XMM15 are the spill scratches.
    pub fn xmm_pool() -> Vec<PhysReg> {
        (1..14).map(xmm).collect()
    }
}

/// Platform opcodes for x86-64.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum X64Op {
    Mov32,
    Mov64,
    Movss,
    Movsd,

    Load8SX32,
    Load8ZX32,
    Load16SX32,
    Load16ZX32,
    Load32,
    Load64,
    LoadSs,
    LoadSd,
    Store8,
    Store16,
    Store32,
    Store64,
    StoreSs,
    StoreSd,

    Add32,
    Add64,
    Adc32,
    Sub32,
    Sub64,
    Sbb32,
    IMul32,
    IMul64,
    Cdq,
    Cqo,
    Idiv32,
    Idiv64,
    Div32,
    Div64,
    And32,
    And64,
    Or32,
    Or64,
    Xor32,
    Xor64,
    Not32,
    Not64,
    Shl32,
    Shl64,
    Shr32,
    Shr64,
    Sar32,
    Sar64,

    Movsx8x32,
    Movsx16x32,
    Movsx32x64,
    Movzx8x32,
    Movzx16x32,

    Addss,
    Addsd,
    Subss,
    Subsd,
    Mulss,
    Mulsd,
    Divss,
    Divsd,
    Ucomiss,
    Ucomisd,
    Cvtsi2ss32,
    Cvtsi2sd32,
    Cvtsi2sd64,
    Cvtss2sd,
    Cvtsd2ss,
    Cvttss2si32,
    Cvttsd2si32,

    Cmp32,
    Cmp64,
    Setcc,
    Jcc,
    Jmp,
    Call,
    Push,
    Pop,
    Ret,
}

const fn d(name: &'static str, results: u8, operands: u8) -> InstrDesc {
    InstrDesc {
        name,
        results,
        operands: Arity::Fixed(operands),
        flow: FlowControl::Normal,
        flags_read: 0,
        flags_written: 0,
        memory: MemoryAccess::None,
        two_address: false,
    }
}

const fn two_addr(name: &'static str) -> InstrDesc {
    InstrDesc {
        flags_written: flags::ARITH,
        two_address: true,
        ..d(name, 1, 2)
    }
}

impl X64Op {
    pub const fn desc(self) -> InstrDesc {
        use X64Op::*;
        match self {
            Mov32 => d("x64.mov32", 1, 1),
            Mov64 => d("x64.mov64", 1, 1),
            Movss => d("x64.movss", 1, 1),
            Movsd => d("x64.movsd", 1, 1),

            Load8SX32 => InstrDesc { memory: MemoryAccess::Read, ..d("x64.load8.sx", 1, 2) },
            Load8ZX32 => InstrDesc { memory: MemoryAccess::Read, ..d("x64.load8.zx", 1, 2) },
            Load16SX32 => InstrDesc { memory: MemoryAccess::Read, ..d("x64.load16.sx", 1, 2) },
            Load16ZX32 => InstrDesc { memory: MemoryAccess::Read, ..d("x64.load16.zx", 1, 2) },
            Load32 => InstrDesc { memory: MemoryAccess::Read, ..d("x64.load32", 1, 2) },
            Load64 => InstrDesc { memory: MemoryAccess::Read, ..d("x64.load64", 1, 2) },
            LoadSs => InstrDesc { memory: MemoryAccess::Read, ..d("x64.loadss", 1, 2) },
            LoadSd => InstrDesc { memory: MemoryAccess::Read, ..d("x64.loadsd", 1, 2) },
            Store8 => InstrDesc { memory: MemoryAccess::Write, ..d("x64.store8", 0, 3) },
            Store16 => InstrDesc { memory: MemoryAccess::Write, ..d("x64.store16", 0, 3) },
            Store32 => InstrDesc { memory: MemoryAccess::Write, ..d("x64.store32", 0, 3) },
            Store64 => InstrDesc { memory: MemoryAccess::Write, ..d("x64.store64", 0, 3) },
            StoreSs => InstrDesc { memory: MemoryAccess::Write, ..d("x64.storess", 0, 3) },
            StoreSd => InstrDesc { memory: MemoryAccess::Write, ..d("x64.storesd", 0, 3) },

            Add32 => two_addr("x64.add32"),
            Add64 => two_addr("x64.add64"),
            Adc32 => InstrDesc { flags_read: flags::CARRY, ..two_addr("x64.adc32") },
            Sub32 => two_addr("x64.sub32"),
            Sub64 => two_addr("x64.sub64"),
            Sbb32 => InstrDesc { flags_read: flags::CARRY, ..two_addr("x64.sbb32") },
            IMul32 => two_addr("x64.imul32"),
            IMul64 => two_addr("x64.imul64"),
            Cdq => d("x64.cdq", 0, 0),
            Cqo => d("x64.cqo", 0, 0),
            Idiv32 => InstrDesc { flags_written: flags::ARITH, ..d("x64.idiv32", 0, 1) },
            Idiv64 => InstrDesc { flags_written: flags::ARITH, ..d("x64.idiv64", 0, 1) },
            Div32 => InstrDesc { flags_written: flags::ARITH, ..d("x64.div32", 0, 1) },
            Div64 => InstrDesc { flags_written: flags::ARITH, ..d("x64.div64", 0, 1) },
            And32 => two_addr("x64.and32"),
            And64 => two_addr("x64.and64"),
            Or32 => two_addr("x64.or32"),
            Or64 => two_addr("x64.or64"),
            Xor32 => two_addr("x64.xor32"),
            Xor64 => two_addr("x64.xor64"),
            Not32 => InstrDesc { two_address: true, ..d("x64.not32", 1, 1) },
            Not64 => InstrDesc { two_address: true, ..d("x64.not64", 1, 1) },
            Shl32 => two_addr("x64.shl32"),
            Shl64 => two_addr("x64.shl64"),
            Shr32 => two_addr("x64.shr32"),
            Shr64 => two_addr("x64.shr64"),
            Sar32 => two_addr("x64.sar32"),
            Sar64 => two_addr("x64.sar64"),

            Movsx8x32 => d("x64.movsx8", 1, 1),
            Movsx16x32 => d("x64.movsx16", 1, 1),
            Movsx32x64 => d("x64.movsxd", 1, 1),
            Movzx8x32 => d("x64.movzx8", 1, 1),
            Movzx16x32 => d("x64.movzx16", 1, 1),

            Addss => InstrDesc { two_address: true, ..d("x64.addss", 1, 2) },
            Addsd => InstrDesc { two_address: true, ..d("x64.addsd", 1, 2) },
            Subss => InstrDesc { two_address: true, ..d("x64.subss", 1, 2) },
            Subsd => InstrDesc { two_address: true, ..d("x64.subsd", 1, 2) },
            Mulss => InstrDesc { two_address: true, ..d("x64.mulss", 1, 2) },
            Mulsd => InstrDesc { two_address: true, ..d("x64.mulsd", 1, 2) },
            Divss => InstrDesc { two_address: true, ..d("x64.divss", 1, 2) },
            Divsd => InstrDesc { two_address: true, ..d("x64.divsd", 1, 2) },
            Ucomiss => InstrDesc { flags_written: flags::ARITH, ..d("x64.ucomiss", 0, 2) },
            Ucomisd => InstrDesc { flags_written: flags::ARITH, ..d("x64.ucomisd", 0, 2) },
            Cvtsi2ss32 => d("x64.cvtsi2ss", 1, 1),
            Cvtsi2sd32 => d("x64.cvtsi2sd", 1, 1),
            Cvtsi2sd64 => d("x64.cvtsi2sd64", 1, 1),
            Cvtss2sd => d("x64.cvtss2sd", 1, 1),
            Cvtsd2ss => d("x64.cvtsd2ss", 1, 1),
            Cvttss2si32 => d("x64.cvttss2si", 1, 1),
            Cvttsd2si32 => d("x64.cvttsd2si", 1, 1),

            Cmp32 => InstrDesc { flags_written: flags::ARITH, ..d("x64.cmp32", 0, 2) },
            Cmp64 => InstrDesc { flags_written: flags::ARITH, ..d("x64.cmp64", 0, 2) },
            Setcc => InstrDesc { flags_read: flags::ARITH, ..d("x64.setcc", 1, 0) },
            Jcc => InstrDesc {
                flow: FlowControl::ConditionalBranch,
                flags_read: flags::ARITH,
                ..d("x64.jcc", 0, 0)
            },
            Jmp => InstrDesc { flow: FlowControl::Branch, ..d("x64.jmp", 0, 0) },
            Call => InstrDesc {
                flow: FlowControl::Call,
                operands: Arity::Variadic,
                memory: MemoryAccess::Write,
                ..d("x64.call", 0, 0)
            },
            Push => InstrDesc { memory: MemoryAccess::Write, ..d("x64.push", 0, 1) },
            Pop => InstrDesc { memory: MemoryAccess::Read, ..d("x64.pop", 1, 0) },
            Ret => InstrDesc {
                flow: FlowControl::Return,
                operands: Arity::Variadic,
                ..d("x64.ret", 0, 0)
            },
        }
    }

    /// Whether this opcode's register operands live in the floating-point
    /// bank.
    pub fn is_float(self) -> bool {
        use X64Op::*;
        matches!(
            self,
            Movss
                | Movsd
                | LoadSs
                | LoadSd
                | StoreSs
                | StoreSd
                | Addss
                | Addsd
                | Subss
                | Subsd
                | Mulss
                | Mulsd
                | Divss
                | Divsd
                | Ucomiss
                | Ucomisd
        )
    }
}
