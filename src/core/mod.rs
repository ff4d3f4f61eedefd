//! IR infrastructure shared by every stage: errors, the instruction
//! descriptor catalog, operands and virtual registers, the block/node graph,
//! and stage tracing with counters.

pub mod error;
pub mod graph;
pub mod instruction;
pub mod operand;
pub mod trace;

pub use error::{CompileError, CompileResult};
pub use graph::{BlockId, InstrGraph, Node, NodeId};
pub use instruction::{Condition, FlowControl, IrOp, IrType, Opcode};
pub use operand::{
    ConstValue, Operand, PhysReg, StackSlotId, StackSlotKind, StackSlots, VRegId,
    VirtualRegisters,
};
pub use trace::{Counters, MethodTrace, TraceFilter};
