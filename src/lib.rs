//! mosac - ahead-of-time compilation of CIL-style managed bytecode.
//!
//! The crate consumes an already-parsed type-and-method graph and lowers
//! each method body through an SSA-form intermediate representation to
//! native machine code, feeding a symbol/section/relocation sink that
//! writes relocatable ELF objects.
//!
//! # Usage
//!
//! ```ignore
//! use mosac::compile::{AssemblyCompiler, Options};
//! use mosac::linker::ObjectFileLinker;
//! use mosac::ty::TypeLayout;
//! use std::sync::Arc;
//!
//! let layout = Arc::new(TypeLayout::new(type_system, 8, 8)?);
//! let compiler = AssemblyCompiler::new(layout, Options::default());
//! let mut linker = ObjectFileLinker::new(true, 0);
//! let result = compiler.compile_all(&mut linker, 4)?;
//! let object_bytes = linker.build_object()?;
//! ```
//!
//! # Architecture
//!
//! - [`core`] - IR infrastructure: instruction catalog, operands, the
//!   block/node graph, tracing and counters
//! - [`ty`] - the consumed type system and the type-layout engine
//! - [`stages`] - the platform-independent pipeline stages
//! - [`x64`] - the x86-64 backend: lowering, tweaks, encoder, emission
//! - [`linker`] - the linker interface, ELF writer and boot header
//! - [`compile`] - per-method and per-assembly drivers

pub mod compile;
pub mod core;
pub mod linker;
pub mod stages;
pub mod ty;
pub mod x64;

pub use crate::compile::{
    AssemblyCompiler, AssemblyResult, CompiledMethod, MethodCompiler, Options, Target,
};
pub use crate::core::error::{CompileError, CompileResult};
pub use crate::linker::{Linker, ObjectFileLinker};
pub use crate::ty::{TypeLayout, TypeSystem, TypeSystemBuilder};
