//! Compilation options and target selection.

use crate::core::trace::TraceFilter;

/// Target platform of the assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// x86-64, the reference backend.
    X64,
    /// 32-bit x86. Drives 32-bit IR decisions (pointer width, long-integer
    /// expansion); no native lowering is wired for it.
    X86,
}

impl Target {
    pub fn ptr_size(self) -> u32 {
        match self {
            Target::X64 => 8,
            Target::X86 => 4,
        }
    }

    pub fn ptr_align(self) -> u32 {
        self.ptr_size()
    }

    pub fn name(self) -> &'static str {
        match self {
            Target::X64 => "x64",
            Target::X86 => "x86",
        }
    }
}

/// Structured options the launcher passes in.
#[derive(Debug, Clone)]
pub struct Options {
    pub target: Target,
    /// Master switch for the optimization stages.
    pub optimize: bool,
    pub constant_folding: bool,
    pub sparse_conditional_propagation: bool,
    pub value_numbering: bool,
    pub dead_code_elimination: bool,
    pub inlining: bool,
    /// Largest callee body, in CIL ops, the inliner will splice.
    pub inline_max_ops: usize,
    /// Re-run folding and dead-code elimination after the first pass.
    pub two_pass_optimizations: bool,
    /// Abort the whole build on the first failing method.
    pub stop_on_first_error: bool,
    pub trace_filter: TraceFilter,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            target: Target::X64,
            optimize: true,
            constant_folding: true,
            sparse_conditional_propagation: true,
            value_numbering: true,
            dead_code_elimination: true,
            inlining: true,
            inline_max_ops: 20,
            two_pass_optimizations: false,
            stop_on_first_error: false,
            trace_filter: TraceFilter::none(),
        }
    }
}
