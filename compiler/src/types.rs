//! Scalar data types of the lowered IR
//!
//! The codegen core recognizes a fixed set of scalar types. Widths and
//! signedness live here; the mapping to LLVM types lives in
//! `codegen::llvm::types`.

use serde::{Deserialize, Serialize};

/// Scalar data type of an IR statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    I1,
    I32,
    I64,
    F32,
    F64,
}

impl DataType {
    /// Size in bytes.
    pub fn size(self) -> usize {
        match self {
            DataType::I1 => 1,
            DataType::I32 | DataType::F32 => 4,
            DataType::I64 | DataType::F64 => 8,
        }
    }

    /// Size in bits.
    pub fn bits(self) -> u32 {
        match self {
            DataType::I1 => 1,
            DataType::I32 | DataType::F32 => 32,
            DataType::I64 | DataType::F64 => 64,
        }
    }

    /// True for floating-point types.
    pub fn is_real(self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }

    /// True for integer types. The complement of `is_real`.
    pub fn is_integral(self) -> bool {
        !self.is_real()
    }

    /// True for signed integer types. `i1` is treated as unsigned.
    pub fn is_signed(self) -> bool {
        matches!(self, DataType::I32 | DataType::I64)
    }

    pub fn name(self) -> &'static str {
        match self {
            DataType::I1 => "i1",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::F32 => "f32",
            DataType::F64 => "f64",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A literal constant, tagged with its type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstValue {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl ConstValue {
    pub fn dtype(self) -> DataType {
        match self {
            ConstValue::I32(_) => DataType::I32,
            ConstValue::I64(_) => DataType::I64,
            ConstValue::F32(_) => DataType::F32,
            ConstValue::F64(_) => DataType::F64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_and_predicates() {
        assert_eq!(DataType::I32.size(), 4);
        assert_eq!(DataType::F64.size(), 8);
        assert!(DataType::F32.is_real());
        assert!(!DataType::F32.is_integral());
        assert!(DataType::I32.is_signed());
        assert!(!DataType::I1.is_signed());
        assert!(DataType::I1.is_integral());
    }

    #[test]
    fn const_value_tags() {
        assert_eq!(ConstValue::F32(1.0).dtype(), DataType::F32);
        assert_eq!(ConstValue::I32(0).dtype(), DataType::I32);
    }
}
