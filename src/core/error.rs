//! Error types for the compiler core.
//!
//! Stage boundaries return [`CompileResult`]; the pipeline driver
//! short-circuits on the first error for the current method.

use thiserror::Error;

/// Main error type for method compilation and assembly linking.
#[derive(Error, Debug, Clone)]
pub enum CompileError {
    /// An internal invariant was violated. Always a compiler bug.
    #[error("invariant violated in {stage}: {detail}")]
    InvariantViolation { stage: &'static str, detail: String },

    /// The input uses a construct the compiler does not implement.
    #[error("not supported: {construct}")]
    NotSupported { construct: String },

    /// Section or symbol layout conflict in the linker.
    #[error("linker error: {reason}")]
    Linker { reason: String },

    /// Unresolved or malformed type-system input.
    #[error("type system error for {item}: {reason}")]
    TypeSystem { item: String, reason: String },
}

impl CompileError {
    pub fn invariant(stage: &'static str, detail: impl Into<String>) -> Self {
        CompileError::InvariantViolation {
            stage,
            detail: detail.into(),
        }
    }

    pub fn not_supported(construct: impl Into<String>) -> Self {
        CompileError::NotSupported {
            construct: construct.into(),
        }
    }
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;
