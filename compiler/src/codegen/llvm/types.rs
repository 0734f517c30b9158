//! Type and constant mapping from IR data types to LLVM
//!
//! The scalar bridge between the lowered IR's closed type set and inkwell's
//! type system. Size and signedness queries stay on [`DataType`] itself.

use inkwell::context::Context;
use inkwell::types::{BasicTypeEnum, FloatType, IntType};
use inkwell::values::{BasicValueEnum, IntValue};

use crate::types::{ConstValue, DataType};

/// Scalar type/constant lowering.
pub struct TypeLowering<'ctx> {
    context: &'ctx Context,
}

impl<'ctx> TypeLowering<'ctx> {
    pub fn new(context: &'ctx Context) -> Self {
        Self { context }
    }

    /// Map a scalar data type to its LLVM type.
    pub fn scalar(&self, dt: DataType) -> BasicTypeEnum<'ctx> {
        match dt {
            DataType::I1 => self.context.bool_type().into(),
            DataType::I32 => self.context.i32_type().into(),
            DataType::I64 => self.context.i64_type().into(),
            DataType::F32 => self.context.f32_type().into(),
            DataType::F64 => self.context.f64_type().into(),
        }
    }

    pub fn int(&self, dt: DataType) -> IntType<'ctx> {
        match dt {
            DataType::I1 => self.context.bool_type(),
            DataType::I32 => self.context.i32_type(),
            DataType::I64 => self.context.i64_type(),
            DataType::F32 | DataType::F64 => self.context.i32_type(),
        }
    }

    pub fn float(&self, dt: DataType) -> FloatType<'ctx> {
        match dt {
            DataType::F64 => self.context.f64_type(),
            _ => self.context.f32_type(),
        }
    }

    /// Zero of the mapped type, used to initialize fresh allocas.
    pub fn zero(&self, dt: DataType) -> BasicValueEnum<'ctx> {
        match dt {
            DataType::I1 => self.context.bool_type().const_zero().into(),
            DataType::I32 => self.context.i32_type().const_zero().into(),
            DataType::I64 => self.context.i64_type().const_zero().into(),
            DataType::F32 => self.context.f32_type().const_zero().into(),
            DataType::F64 => self.context.f64_type().const_zero().into(),
        }
    }

    /// Materialize a literal as a constant of the mapped type.
    pub fn constant(&self, val: ConstValue) -> BasicValueEnum<'ctx> {
        match val {
            ConstValue::I32(v) => self
                .context
                .i32_type()
                .const_int(v as u32 as u64, true)
                .into(),
            ConstValue::I64(v) => self.context.i64_type().const_int(v as u64, true).into(),
            ConstValue::F32(v) => self.context.f32_type().const_float(v as f64).into(),
            ConstValue::F64(v) => self.context.f64_type().const_float(v).into(),
        }
    }

    pub fn const_i32(&self, v: i32) -> IntValue<'ctx> {
        self.context.i32_type().const_int(v as u32 as u64, true)
    }

    pub fn const_i64(&self, v: i64) -> IntValue<'ctx> {
        self.context.i64_type().const_int(v as u64, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_mapping() {
        let context = Context::create();
        let types = TypeLowering::new(&context);
        assert!(types.scalar(DataType::F32).is_float_type());
        assert!(types.scalar(DataType::I32).is_int_type());
        assert_eq!(types.int(DataType::I1).get_bit_width(), 1);
        assert_eq!(types.int(DataType::I64).get_bit_width(), 64);
    }

    #[test]
    fn constants_match_their_types() {
        let context = Context::create();
        let types = TypeLowering::new(&context);
        let c = types.constant(ConstValue::I32(-3));
        assert!(c.is_int_value());
        assert_eq!(
            c.into_int_value().get_sign_extended_constant(),
            Some(-3i64)
        );
        let f = types.constant(ConstValue::F32(1.5));
        assert!(f.is_float_value());
    }
}
