// Operands are tagged values attached to instruction nodes. A virtual register is a handle
// into the per-method VirtualRegisters table, which holds the register's managed type and,
// while the method is in SSA form, its version and pre-SSA parent. Identity equality between
// operands means "same underlying slot": two VReg operands are equal iff they hold the same
// id, never by type. Constants compare by value. The table is append-only; a register never
// changes type after allocation.

use std::fmt;

use crate::core::instruction::IrType;

/// Physical CPU register: a bank (0 = general purpose, 1 = floating point)
/// and an id within the bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysReg {
    pub bank: u8,
    pub id: u8,
}

impl PhysReg {
    pub const fn new(bank: u8, id: u8) -> Self {
        Self { bank, id }
    }

    pub const fn is_float(self) -> bool {
        self.bank == 1
    }
}

/// Handle for a virtual register in [`VirtualRegisters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VRegId(pub u32);

impl fmt::Display for VRegId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Handle for a stack slot in [`StackSlots`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackSlotId(pub u32);

/// What a stack slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackSlotKind {
    /// Incoming parameter, laid out above the frame pointer.
    Param,
    /// Method local that lives in memory.
    Local,
    /// Spill slot introduced by register allocation.
    Spill,
}

#[derive(Debug, Clone)]
pub struct StackSlot {
    pub kind: StackSlotKind,
    pub ty: IrType,
    /// Ordinal within its kind (parameter index, local index, spill index).
    pub index: u32,
    /// Frame-pointer-relative offset, assigned by the stack-layout stage.
    pub offset: Option<i32>,
}

/// Per-method stack slot table.
#[derive(Debug, Default)]
pub struct StackSlots {
    slots: Vec<StackSlot>,
}

impl StackSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: StackSlotKind, ty: IrType, index: u32) -> StackSlotId {
        let id = StackSlotId(self.slots.len() as u32);
        self.slots.push(StackSlot {
            kind,
            ty,
            index,
            offset: None,
        });
        id
    }

    pub fn get(&self, id: StackSlotId) -> &StackSlot {
        &self.slots[id.0 as usize]
    }

    pub fn set_offset(&mut self, id: StackSlotId, offset: i32) {
        self.slots[id.0 as usize].offset = Some(offset);
    }

    pub fn iter(&self) -> impl Iterator<Item = (StackSlotId, &StackSlot)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, s)| (StackSlotId(i as u32), s))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Constant payload of a [`Operand::Constant`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    /// 8-bit immediate, as platform tweaks narrow shift counts.
    I8(u8),
    I32(i32),
    I64(i64),
    R4(f32),
    R8(f64),
    Null,
    /// Address-of constant resolved by the linker.
    Symbol(String),
}

impl ConstValue {
    pub fn ty(&self, ptr_ty: IrType) -> IrType {
        match self {
            ConstValue::I8(_) => IrType::I32,
            ConstValue::I32(_) => IrType::I32,
            ConstValue::I64(_) => IrType::I64,
            ConstValue::R4(_) => IrType::R4,
            ConstValue::R8(_) => IrType::R8,
            ConstValue::Null | ConstValue::Symbol(_) => ptr_ty,
        }
    }

    /// Integer payload widened to i64, if this is an integer constant.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ConstValue::I8(v) => Some(*v as i64),
            ConstValue::I32(v) => Some(*v as i64),
            ConstValue::I64(v) => Some(*v),
            ConstValue::Null => Some(0),
            _ => None,
        }
    }
}

/// A tagged operand slot on an instruction node.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Constant(ConstValue),
    VReg(VRegId),
    Reg(PhysReg),
    Stack(StackSlotId),
    /// Linker-resolved label, e.g. a call target or block of static data.
    Symbol(String),
}

impl Operand {
    pub const fn i32(v: i32) -> Operand {
        Operand::Constant(ConstValue::I32(v))
    }

    pub const fn i64(v: i64) -> Operand {
        Operand::Constant(ConstValue::I64(v))
    }

    pub fn symbol(name: impl Into<String>) -> Operand {
        Operand::Symbol(name.into())
    }

    pub fn vreg(&self) -> Option<VRegId> {
        match self {
            Operand::VReg(id) => Some(*id),
            _ => None,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Operand::Constant(_))
    }

    pub fn constant(&self) -> Option<&ConstValue> {
        match self {
            Operand::Constant(c) => Some(c),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Constant(ConstValue::I8(v)) => write!(f, "const {v}b"),
            Operand::Constant(ConstValue::I32(v)) => write!(f, "const {v}"),
            Operand::Constant(ConstValue::I64(v)) => write!(f, "const {v}L"),
            Operand::Constant(ConstValue::R4(v)) => write!(f, "const {v}f"),
            Operand::Constant(ConstValue::R8(v)) => write!(f, "const {v}"),
            Operand::Constant(ConstValue::Null) => write!(f, "null"),
            Operand::Constant(ConstValue::Symbol(s)) => write!(f, "&{s}"),
            Operand::VReg(id) => write!(f, "{id}"),
            Operand::Reg(r) => write!(f, "{}{}", if r.is_float() { "f" } else { "r" }, r.id),
            Operand::Stack(s) => write!(f, "stack#{}", s.0),
            Operand::Symbol(s) => write!(f, "@{s}"),
        }
    }
}

/// SSA bookkeeping for a versioned virtual register.
#[derive(Debug, Clone, Copy)]
pub struct SsaInfo {
    pub version: u32,
    /// The pre-SSA register this version renames.
    pub parent: VRegId,
}

#[derive(Debug, Clone)]
struct VRegData {
    ty: IrType,
    ssa: Option<SsaInfo>,
}

/// Per-method virtual register table.
///
/// Registers are allocated monotonically and never freed; SSA construction
/// allocates versioned registers pointing back at their parent, and Leave-SSA
/// maps them to plain registers again.
#[derive(Debug, Default)]
pub struct VirtualRegisters {
    regs: Vec<VRegData>,
}

impl VirtualRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, ty: IrType) -> VRegId {
        let id = VRegId(self.regs.len() as u32);
        self.regs.push(VRegData { ty, ssa: None });
        id
    }

    pub fn alloc_ssa(&mut self, parent: VRegId, version: u32) -> VRegId {
        let ty = self.ty(parent);
        let id = VRegId(self.regs.len() as u32);
        self.regs.push(VRegData {
            ty,
            ssa: Some(SsaInfo { version, parent }),
        });
        id
    }

    pub fn ty(&self, id: VRegId) -> IrType {
        self.regs[id.0 as usize].ty
    }

    pub fn ssa(&self, id: VRegId) -> Option<SsaInfo> {
        self.regs[id.0 as usize].ssa
    }

    pub fn is_ssa(&self, id: VRegId) -> bool {
        self.regs[id.0 as usize].ssa.is_some()
    }

    pub fn count(&self) -> u32 {
        self.regs.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vreg_type_is_fixed_at_allocation() {
        let mut regs = VirtualRegisters::new();
        let a = regs.alloc(IrType::I32);
        let b = regs.alloc(IrType::R8);
        assert_eq!(regs.ty(a), IrType::I32);
        assert_eq!(regs.ty(b), IrType::R8);
        assert!(!regs.is_ssa(a));
    }

    #[test]
    fn ssa_registers_track_parent_and_version() {
        let mut regs = VirtualRegisters::new();
        let base = regs.alloc(IrType::I64);
        let v1 = regs.alloc_ssa(base, 1);
        let info = regs.ssa(v1).unwrap();
        assert_eq!(info.parent, base);
        assert_eq!(info.version, 1);
        assert_eq!(regs.ty(v1), IrType::I64);
    }

    #[test]
    fn operand_identity_is_slot_identity() {
        let a = Operand::VReg(VRegId(3));
        let b = Operand::VReg(VRegId(3));
        let c = Operand::VReg(VRegId(4));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(Operand::i32(1), Operand::i32(2));
    }
}
