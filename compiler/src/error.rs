//! Codegen error types
//!
//! Every error is fatal to the current kernel compilation; the core never
//! recovers or partially emits. Variants carry the operator or statement
//! name and the offending types so failures are actionable.

use thiserror::Error;

use crate::types::DataType;

/// Errors that can occur while lowering a kernel.
#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("unsupported operation: {op} on {dtype}")]
    UnsupportedOp { op: String, dtype: String },

    #[error("unsupported cast: {from} -> {to}")]
    UnsupportedCast { from: DataType, to: DataType },

    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    #[error("invariant violation in {stmt}: {detail}")]
    InvariantViolation { stmt: &'static str, detail: String },

    #[error("runtime symbol missing: {0}")]
    RuntimeSymbolMissing(String),

    #[error("runtime type missing: {0}")]
    RuntimeTypeMissing(String),

    #[error("call signature mismatch for {callee}: {detail}")]
    SignatureMismatch { callee: String, detail: String },

    #[error("verification failed for function {function}")]
    VerificationFailure { function: String },

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[cfg(feature = "llvm")]
    #[error("LLVM builder error: {0}")]
    Builder(#[from] inkwell::builder::BuilderError),

    #[error("LLVM error: {0}")]
    Llvm(String),
}

impl CodegenError {
    pub fn unsupported(op: impl Into<String>, dtype: DataType) -> Self {
        CodegenError::UnsupportedOp {
            op: op.into(),
            dtype: dtype.name().to_string(),
        }
    }

    pub fn invariant(stmt: &'static str, detail: impl Into<String>) -> Self {
        CodegenError::InvariantViolation {
            stmt,
            detail: detail.into(),
        }
    }
}

/// Result type for codegen operations.
pub type CodegenResult<T> = Result<T, CodegenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_carry_context() {
        let e = CodegenError::unsupported("atomic_sub", DataType::F32);
        assert!(e.to_string().contains("atomic_sub"));
        assert!(e.to_string().contains("f32"));

        let e = CodegenError::UnsupportedCast {
            from: DataType::I1,
            to: DataType::F64,
        };
        assert!(e.to_string().contains("i1"));
        assert!(e.to_string().contains("f64"));
    }
}
