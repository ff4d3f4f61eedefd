// This module is the instruction catalog for the platform-independent IR. Every opcode is
// described by a static InstrDesc record: result/operand arity, flow-control kind, flag
// effects, and memory-access class. Stages never match on descriptor internals directly;
// they ask the descriptor questions (is this a terminator, does it write memory, how many
// operands must the node carry). Platform opcodes carry their own descriptor table in the
// platform module and share the same record shape, so the node graph stores a single
// Opcode value for both tiers. Conditions are node-level data rather than separate opcodes;
// Condition::opposite is the involution used for branch inversion.

use crate::x64::X64Op;

/// Managed type of an operand or instruction result.
///
/// Small integers are widened to `I32` by the decoder, matching evaluation
/// stack semantics. `Compound` carries the byte size of a stack-allocated
/// value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrType {
    I32,
    I64,
    R4,
    R8,
    Ptr,
    Compound(u32),
}

impl IrType {
    /// Size in bytes for a given native pointer width.
    pub fn size(&self, ptr_size: u32) -> u32 {
        match self {
            IrType::I32 => 4,
            IrType::I64 => 8,
            IrType::R4 => 4,
            IrType::R8 => 8,
            IrType::Ptr => ptr_size,
            IrType::Compound(size) => *size,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, IrType::R4 | IrType::R8)
    }
}

/// Comparison condition attached to compare and branch nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    UnsignedLess,
    UnsignedLessOrEqual,
    UnsignedGreater,
    UnsignedGreaterOrEqual,
    Carry,
    NoCarry,
}

impl Condition {
    pub const ALL: [Condition; 12] = [
        Condition::Equal,
        Condition::NotEqual,
        Condition::Less,
        Condition::LessOrEqual,
        Condition::Greater,
        Condition::GreaterOrEqual,
        Condition::UnsignedLess,
        Condition::UnsignedLessOrEqual,
        Condition::UnsignedGreater,
        Condition::UnsignedGreaterOrEqual,
        Condition::Carry,
        Condition::NoCarry,
    ];

    /// The inverted condition. `opposite(opposite(c)) == c` for every `c`.
    pub const fn opposite(self) -> Condition {
        match self {
            Condition::Equal => Condition::NotEqual,
            Condition::NotEqual => Condition::Equal,
            Condition::Less => Condition::GreaterOrEqual,
            Condition::GreaterOrEqual => Condition::Less,
            Condition::LessOrEqual => Condition::Greater,
            Condition::Greater => Condition::LessOrEqual,
            Condition::UnsignedLess => Condition::UnsignedGreaterOrEqual,
            Condition::UnsignedGreaterOrEqual => Condition::UnsignedLess,
            Condition::UnsignedLessOrEqual => Condition::UnsignedGreater,
            Condition::UnsignedGreater => Condition::UnsignedLessOrEqual,
            Condition::Carry => Condition::NoCarry,
            Condition::NoCarry => Condition::Carry,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Condition::Equal => "==",
            Condition::NotEqual => "!=",
            Condition::Less => "<",
            Condition::LessOrEqual => "<=",
            Condition::Greater => ">",
            Condition::GreaterOrEqual => ">=",
            Condition::UnsignedLess => "u<",
            Condition::UnsignedLessOrEqual => "u<=",
            Condition::UnsignedGreater => "u>",
            Condition::UnsignedGreaterOrEqual => "u>=",
            Condition::Carry => "carry",
            Condition::NoCarry => "no-carry",
        }
    }
}

/// Flow-control class of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    /// Execution continues at the next node.
    Normal,
    /// Unconditional transfer to the node's target.
    Branch,
    /// Transfer to the target when the condition holds, else fall through.
    ConditionalBranch,
    /// Leaves the method.
    Return,
    /// Multi-way transfer indexed by the selector operand.
    Switch,
    /// Transfers to another method and returns here.
    Call,
}

impl FlowControl {
    /// Whether a node with this flow control may legally end a block.
    pub fn ends_block(self) -> bool {
        matches!(
            self,
            FlowControl::Branch
                | FlowControl::ConditionalBranch
                | FlowControl::Return
                | FlowControl::Switch
        )
    }
}

/// Memory-access class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryAccess {
    None,
    Read,
    Write,
}

/// CPU flag bits an instruction reads or modifies.
pub mod flags {
    pub const ZERO: u8 = 1 << 0;
    pub const CARRY: u8 = 1 << 1;
    pub const SIGN: u8 = 1 << 2;
    pub const OVERFLOW: u8 = 1 << 3;
    pub const PARITY: u8 = 1 << 4;
    pub const ARITH: u8 = ZERO | CARRY | SIGN | OVERFLOW | PARITY;
}

/// Declared operand count of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Fixed(u8),
    /// Phi, call and switch nodes size their operand arrays per use site.
    Variadic,
}

/// Static descriptor shared by all nodes carrying the same opcode.
#[derive(Debug, Clone, Copy)]
pub struct InstrDesc {
    pub name: &'static str,
    pub results: u8,
    pub operands: Arity,
    pub flow: FlowControl,
    pub flags_read: u8,
    pub flags_written: u8,
    pub memory: MemoryAccess,
    /// Whether the platform form folds result and first operand into one
    /// register (three-address IR to two-address machine form).
    pub two_address: bool,
}

const fn desc(name: &'static str, results: u8, operands: u8) -> InstrDesc {
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

const fn arith(name: &'static str) -> InstrDesc {
    InstrDesc {
        flags_written: flags::ARITH,
        two_address: true,
        ..desc(name, 1, 2)
    }
}

const fn load(name: &'static str) -> InstrDesc {
    InstrDesc {
        memory: MemoryAccess::Read,
        ..desc(name, 1, 2)
    }
}

const fn store(name: &'static str) -> InstrDesc {
    InstrDesc {
        memory: MemoryAccess::Write,
        ..desc(name, 0, 3)
    }
}

/// Platform-independent IR opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrOp {
    Nop,

    // Moves. Compound moves copy `Compound(size)` values through memory.
    Move32,
    Move64,
    MoveR4,
    MoveR8,
    MoveCompound,

    // Memory. Loads take [base, offset], stores [base, offset, value].
    LoadSignExtend8x32,
    LoadSignExtend16x32,
    LoadZeroExtend8x32,
    LoadZeroExtend16x32,
    Load32,
    Load64,
    LoadR4,
    LoadR8,
    Store8,
    Store16,
    Store32,
    Store64,
    StoreR4,
    StoreR8,

    // Integer arithmetic, target-width two's complement.
    Add32,
    Add64,
    Sub32,
    Sub64,
    Mul32,
    Mul64,
    DivSigned32,
    DivSigned64,
    DivUnsigned32,
    DivUnsigned64,
    RemSigned32,
    RemSigned64,
    RemUnsigned32,
    RemUnsigned64,

    // Carry-chained forms produced by long-integer expansion. Each must stay
    // adjacent to the flag-producing half; moves in between are fine, flag
    // writers are not.
    AddWithCarry32,
    SubWithBorrow32,

    // Bitwise.
    And32,
    And64,
    Or32,
    Or64,
    Xor32,
    Xor64,
    Not32,
    Not64,
    ShiftLeft32,
    ShiftLeft64,
    ShiftRight32,
    ShiftRight64,
    ArithShiftRight32,
    ArithShiftRight64,

    // Conversions.
    SignExtend8x32,
    SignExtend16x32,
    SignExtend32x64,
    ZeroExtend8x32,
    ZeroExtend16x32,
    ZeroExtend32x64,
    Truncate64x32,
    ConvertI32ToR4,
    ConvertI32ToR8,
    ConvertI64ToR8,
    ConvertR4ToR8,
    ConvertR8ToR4,
    ConvertR4ToI32,
    ConvertR8ToI32,

    // Floating point, IEEE-754 per operand width.
    AddR4,
    AddR8,
    SubR4,
    SubR8,
    MulR4,
    MulR8,
    DivR4,
    DivR8,

    // Compares produce a 0/1 result in I32; branches transfer control.
    Compare32,
    Compare64,
    CompareR4,
    CompareR8,
    CmpBranch32,
    CmpBranch64,
    Jmp,
    Switch,
    Return,
    ReturnVoid,
    Call,

    // SSA join. Operand array parallels the phi-block array.
    Phi,
}

impl IrOp {
    /// Static descriptor for this opcode.
    pub const fn desc(self) -> InstrDesc {
        use IrOp::*;
        match self {
            Nop => desc("nop", 0, 0),

            Move32 => desc("move32", 1, 1),
            Move64 => desc("move64", 1, 1),
            MoveR4 => desc("move.r4", 1, 1),
            MoveR8 => desc("move.r8", 1, 1),
            MoveCompound => InstrDesc {
                memory: MemoryAccess::Write,
                ..desc("move.compound", 1, 1)
            },

            LoadSignExtend8x32 => load("load.s8"),
            LoadSignExtend16x32 => load("load.s16"),
            LoadZeroExtend8x32 => load("load.u8"),
            LoadZeroExtend16x32 => load("load.u16"),
            Load32 => load("load32"),
            Load64 => load("load64"),
            LoadR4 => load("load.r4"),
            LoadR8 => load("load.r8"),
            Store8 => store("store8"),
            Store16 => store("store16"),
            Store32 => store("store32"),
            Store64 => store("store64"),
            StoreR4 => store("store.r4"),
            StoreR8 => store("store.r8"),

            Add32 => arith("add32"),
            Add64 => arith("add64"),
            Sub32 => arith("sub32"),
            Sub64 => arith("sub64"),
            Mul32 => arith("mul32"),
            Mul64 => arith("mul64"),
            DivSigned32 => arith("div32"),
            DivSigned64 => arith("div64"),
            DivUnsigned32 => arith("div32.un"),
            DivUnsigned64 => arith("div64.un"),
            RemSigned32 => arith("rem32"),
            RemSigned64 => arith("rem64"),
            RemUnsigned32 => arith("rem32.un"),
            RemUnsigned64 => arith("rem64.un"),

            AddWithCarry32 => InstrDesc {
                flags_read: flags::CARRY,
                ..arith("add32.with-carry")
            },
            SubWithBorrow32 => InstrDesc {
                flags_read: flags::CARRY,
                ..arith("sub32.with-borrow")
            },

            And32 => arith("and32"),
            And64 => arith("and64"),
            Or32 => arith("or32"),
            Or64 => arith("or64"),
            Xor32 => arith("xor32"),
            Xor64 => arith("xor64"),
            Not32 => InstrDesc { two_address: true, ..desc("not32", 1, 1) },
            Not64 => InstrDesc { two_address: true, ..desc("not64", 1, 1) },
            ShiftLeft32 => arith("shl32"),
            ShiftLeft64 => arith("shl64"),
            ShiftRight32 => arith("shr32"),
            ShiftRight64 => arith("shr64"),
            ArithShiftRight32 => arith("sar32"),
            ArithShiftRight64 => arith("sar64"),

            SignExtend8x32 => desc("sext8x32", 1, 1),
            SignExtend16x32 => desc("sext16x32", 1, 1),
            SignExtend32x64 => desc("sext32x64", 1, 1),
            ZeroExtend8x32 => desc("zext8x32", 1, 1),
            ZeroExtend16x32 => desc("zext16x32", 1, 1),
            ZeroExtend32x64 => desc("zext32x64", 1, 1),
            Truncate64x32 => desc("trunc64x32", 1, 1),
            ConvertI32ToR4 => desc("cvt.i32.r4", 1, 1),
            ConvertI32ToR8 => desc("cvt.i32.r8", 1, 1),
            ConvertI64ToR8 => desc("cvt.i64.r8", 1, 1),
            ConvertR4ToR8 => desc("cvt.r4.r8", 1, 1),
            ConvertR8ToR4 => desc("cvt.r8.r4", 1, 1),
            ConvertR4ToI32 => desc("cvt.r4.i32", 1, 1),
            ConvertR8ToI32 => desc("cvt.r8.i32", 1, 1),

            AddR4 => InstrDesc { two_address: true, ..desc("add.r4", 1, 2) },
            AddR8 => InstrDesc { two_address: true, ..desc("add.r8", 1, 2) },
            SubR4 => InstrDesc { two_address: true, ..desc("sub.r4", 1, 2) },
            SubR8 => InstrDesc { two_address: true, ..desc("sub.r8", 1, 2) },
            MulR4 => InstrDesc { two_address: true, ..desc("mul.r4", 1, 2) },
            MulR8 => InstrDesc { two_address: true, ..desc("mul.r8", 1, 2) },
            DivR4 => InstrDesc { two_address: true, ..desc("div.r4", 1, 2) },
            DivR8 => InstrDesc { two_address: true, ..desc("div.r8", 1, 2) },

            Compare32 => InstrDesc {
                flags_written: flags::ARITH,
                ..desc("cmp32", 1, 2)
            },
            Compare64 => InstrDesc {
                flags_written: flags::ARITH,
                ..desc("cmp64", 1, 2)
            },
            CompareR4 => InstrDesc {
                flags_written: flags::ARITH,
                ..desc("cmp.r4", 1, 2)
            },
            CompareR8 => InstrDesc {
                flags_written: flags::ARITH,
                ..desc("cmp.r8", 1, 2)
            },
            CmpBranch32 => InstrDesc {
                flow: FlowControl::ConditionalBranch,
                flags_written: flags::ARITH,
                ..desc("cmp-branch32", 0, 2)
            },
            CmpBranch64 => InstrDesc {
                flow: FlowControl::ConditionalBranch,
                flags_written: flags::ARITH,
                ..desc("cmp-branch64", 0, 2)
            },
            Jmp => InstrDesc {
                flow: FlowControl::Branch,
                ..desc("jmp", 0, 0)
            },
            Switch => InstrDesc {
                flow: FlowControl::Switch,
                operands: Arity::Fixed(1),
                ..desc("switch", 0, 1)
            },
            Return => InstrDesc {
                flow: FlowControl::Return,
                ..desc("return", 0, 1)
            },
            ReturnVoid => InstrDesc {
                flow: FlowControl::Return,
                ..desc("return.void", 0, 0)
            },
            Call => InstrDesc {
                flow: FlowControl::Call,
                operands: Arity::Variadic,
                memory: MemoryAccess::Write,
                ..desc("call", 0, 0)
            },

            Phi => InstrDesc {
                operands: Arity::Variadic,
                ..desc("phi", 1, 0)
            },
        }
    }
}

impl InstrDesc {
    /// Whether nodes with this descriptor can be removed when unused.
    pub fn has_side_effect(&self) -> bool {
        !matches!(self.memory, MemoryAccess::None) || self.flow != FlowControl::Normal
    }
}

/// Opcode identity stored on every instruction node.
///
/// IR opcodes exist from decode until platform lowering; platform opcodes
/// from lowering until emission. Stages assert which tier they expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Ir(IrOp),
    X64(X64Op),
}

impl Opcode {
    pub fn desc(self) -> InstrDesc {
        match self {
            Opcode::Ir(op) => op.desc(),
            Opcode::X64(op) => op.desc(),
        }
    }

    pub fn as_ir(self) -> Option<IrOp> {
        match self {
            Opcode::Ir(op) => Some(op),
            Opcode::X64(_) => None,
        }
    }

    pub fn name(self) -> &'static str {
        self.desc().name
    }
}
