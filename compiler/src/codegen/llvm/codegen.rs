//! Kernel code generator
//!
//! Walks the offloaded kernel IR and emits one LLVM function per task:
//! the statement visitor lowers every statement kind to SSA, the offload
//! driver shapes each task (serial, range-for, struct-for, listgen), and the
//! host assembler hands the finished module to the JIT and resolves the
//! tasks' entry addresses.
//!
//! The visitor owns all codegen state: the IR is never mutated; generated
//! SSA values live in a map keyed by statement identity.

use std::collections::HashMap;

use inkwell::basic_block::BasicBlock;
use inkwell::builder::Builder;
use inkwell::execution_engine::ExecutionEngine;
use inkwell::intrinsics::Intrinsic;
use inkwell::module::{Linkage, Module};
use inkwell::types::{BasicTypeEnum, StructType};
use inkwell::values::{
    BasicMetadataValueEnum, BasicValueEnum, FunctionValue, IntValue, PointerValue,
};
use inkwell::{
    AddressSpace, AtomicOrdering, AtomicRMWBinOp, FloatPredicate, IntPredicate, OptimizationLevel,
};
use tracing::{debug, info};

use crate::config::Arch;
use crate::error::{CodegenError, CodegenResult};
use crate::ir::{
    AtomicOp, BinaryOp, Block as IrBlock, Kernel, OffloadedStmt, Stmt, StmtId, StmtKind, TaskType,
    UnaryOp,
};
use crate::snode::{SNode, SNodeType};
use crate::types::DataType;

use super::gpu::DeviceProps;
use super::program::Program;
use super::runtime;
use super::types::TypeLowering;

/// One emitted task: its entry-point name and, for the GPU backend, its
/// launch shape.
#[derive(Debug, Clone)]
pub struct OffloadedTask {
    pub name: String,
    pub grid_dim: u32,
    pub block_dim: u32,
}

/// A pointer into a runtime struct, with typed field access and
/// `"{type}_{method}"` call dispatch.
pub(crate) struct RuntimeObject<'ctx> {
    pub type_name: &'static str,
    pub ptr: PointerValue<'ctx>,
}

impl<'ctx> RuntimeObject<'ctx> {
    pub fn adopt(type_name: &'static str, ptr: PointerValue<'ctx>) -> Self {
        Self { type_name, ptr }
    }

    pub fn get_ptr(
        &self,
        cg: &CodeGenLlvm<'_, 'ctx>,
        field: &str,
    ) -> CodegenResult<PointerValue<'ctx>> {
        let ty = cg.runtime_type(self.type_name)?;
        let index = runtime::field_index(self.type_name, field).ok_or_else(|| {
            CodegenError::RuntimeTypeMissing(format!("{}.{}", self.type_name, field))
        })?;
        Ok(cg.builder.build_struct_gep(ty, self.ptr, index, field)?)
    }

    pub fn set(
        &self,
        cg: &CodeGenLlvm<'_, 'ctx>,
        field: &str,
        value: BasicValueEnum<'ctx>,
    ) -> CodegenResult<()> {
        let slot = self.get_ptr(cg, field)?;
        cg.builder.build_store(slot, value)?;
        Ok(())
    }

    pub fn call(
        &self,
        cg: &CodeGenLlvm<'_, 'ctx>,
        method: &str,
        args: &[BasicMetadataValueEnum<'ctx>],
    ) -> CodegenResult<Option<BasicValueEnum<'ctx>>> {
        let mut full: Vec<BasicMetadataValueEnum<'ctx>> = vec![self.ptr.into()];
        full.extend_from_slice(args);
        cg.create_call(&format!("{}_{}", self.type_name, method), &full)
    }
}

/// LLVM code generator for one kernel.
pub struct CodeGenLlvm<'p, 'ctx> {
    pub(crate) program: &'p Program<'ctx>,
    pub(crate) kernel: &'p Kernel,
    pub(crate) module: Module<'ctx>,
    pub(crate) builder: Builder<'ctx>,
    pub(crate) types: TypeLowering<'ctx>,
    pub(crate) kernel_name: String,

    /// Function under construction.
    pub(crate) func: Option<FunctionValue<'ctx>>,
    /// Alloca sink of the function under construction.
    pub(crate) entry_block: Option<BasicBlock<'ctx>>,
    pub(crate) body_block: Option<BasicBlock<'ctx>>,

    /// Statement identity -> emitted SSA value.
    pub(crate) values: HashMap<StmtId, BasicValueEnum<'ctx>>,
    /// Interned global strings, by content.
    pub(crate) strings: HashMap<String, PointerValue<'ctx>>,

    pub(crate) while_after_loop: Option<BasicBlock<'ctx>>,
    pub(crate) current_coordinates: Option<PointerValue<'ctx>>,
    pub(crate) current_mask: Option<StmtId>,
    pub(crate) offload_loop_vars: Vec<PointerValue<'ctx>>,

    pub(crate) task_counter: usize,
    pub(crate) tasks: Vec<OffloadedTask>,
    pub(crate) grid_dim: u32,
    pub(crate) block_dim: u32,
    pub(crate) device_props: DeviceProps,
}

impl<'p, 'ctx> CodeGenLlvm<'p, 'ctx> {
    /// Clone the runtime prototype and prepare per-kernel state.
    pub fn new(program: &'p Program<'ctx>, kernel: &'p Kernel) -> CodegenResult<Self> {
        let module = program.clone_runtime_module()?;
        module.set_data_layout(&program.target_data().get_data_layout());

        // Relink runtime definitions as private so repeated JIT additions do
        // not clash on symbol names.
        for func in module.get_functions() {
            if func.count_basic_blocks() > 0 {
                func.set_linkage(Linkage::Private);
            }
        }

        Ok(Self {
            program,
            kernel,
            module,
            builder: program.context.create_builder(),
            types: TypeLowering::new(program.context),
            kernel_name: kernel.task_base_name(),
            func: None,
            entry_block: None,
            body_block: None,
            values: HashMap::new(),
            strings: HashMap::new(),
            while_after_loop: None,
            current_coordinates: None,
            current_mask: None,
            offload_loop_vars: Vec::new(),
            task_counter: 0,
            tasks: Vec::new(),
            grid_dim: 1,
            block_dim: 1,
            device_props: DeviceProps::default(),
        })
    }

    pub fn with_device_props(mut self, props: DeviceProps) -> Self {
        self.device_props = props;
        self
    }

    pub(crate) fn gpu(&self) -> bool {
        self.program.config.arch == Arch::Gpu
    }

    pub fn module(&self) -> &Module<'ctx> {
        &self.module
    }

    pub fn tasks(&self) -> &[OffloadedTask] {
        &self.tasks
    }

    /// Print the module IR to a string.
    pub fn print_ir(&self) -> String {
        self.module.print_to_string().to_string()
    }

    // ======================================================================
    // Module-builder helpers
    // ======================================================================

    pub(crate) fn runtime_type(&self, name: &str) -> CodegenResult<StructType<'ctx>> {
        runtime::runtime_type(self.program.context, name)
    }

    pub(crate) fn get_runtime_function(&self, name: &str) -> CodegenResult<FunctionValue<'ctx>> {
        self.module
            .get_function(name)
            .ok_or_else(|| CodegenError::RuntimeSymbolMissing(name.to_string()))
    }

    fn runtime_function_ptr(&self, name: &str) -> CodegenResult<BasicValueEnum<'ctx>> {
        Ok(self
            .get_runtime_function(name)?
            .as_global_value()
            .as_pointer_value()
            .into())
    }

    /// Emit an alloca into the entry block of the current function so
    /// dominance holds regardless of where the builder currently inserts.
    pub(crate) fn create_entry_block_alloca(
        &self,
        ty: BasicTypeEnum<'ctx>,
    ) -> CodegenResult<PointerValue<'ctx>> {
        let entry = self
            .entry_block
            .ok_or_else(|| CodegenError::invariant("Alloca", "no task function under construction"))?;
        let saved = self.builder.get_insert_block();
        self.builder.position_at_end(entry);
        let ptr = self.builder.build_alloca(ty, "alloca")?;
        if let Some(bb) = saved {
            self.builder.position_at_end(bb);
        }
        Ok(ptr)
    }

    fn check_call_signature(
        &self,
        func: FunctionValue<'ctx>,
        args: &[BasicMetadataValueEnum<'ctx>],
    ) -> CodegenResult<()> {
        let callee = func.get_name().to_string_lossy().into_owned();
        let fn_ty = func.get_type();
        let params = fn_ty.get_param_types();
        let count_ok = if fn_ty.is_var_arg() {
            args.len() >= params.len()
        } else {
            args.len() == params.len()
        };
        if !count_ok {
            return Err(CodegenError::SignatureMismatch {
                callee,
                detail: format!("expected {} arguments, got {}", params.len(), args.len()),
            });
        }
        for (i, (arg, param)) in args.iter().zip(params.iter()).enumerate() {
            let arg_ty: BasicTypeEnum = match arg {
                BasicMetadataValueEnum::IntValue(v) => v.get_type().into(),
                BasicMetadataValueEnum::FloatValue(v) => v.get_type().into(),
                BasicMetadataValueEnum::PointerValue(v) => v.get_type().into(),
                BasicMetadataValueEnum::ArrayValue(v) => v.get_type().into(),
                BasicMetadataValueEnum::StructValue(v) => v.get_type().into(),
                BasicMetadataValueEnum::VectorValue(v) => v.get_type().into(),
                _ => continue,
            };
            let param_ty = BasicTypeEnum::try_from(*param).map_err(|_| {
                CodegenError::SignatureMismatch {
                    callee: callee.clone(),
                    detail: format!("parameter {i} is not a basic type"),
                }
            })?;
            if arg_ty != param_ty {
                return Err(CodegenError::SignatureMismatch {
                    callee,
                    detail: format!("argument {i}: {arg_ty:?} does not match {param_ty:?}"),
                });
            }
        }
        Ok(())
    }

    /// Signature-checked call to a runtime function by name.
    pub(crate) fn create_call(
        &self,
        name: &str,
        args: &[BasicMetadataValueEnum<'ctx>],
    ) -> CodegenResult<Option<BasicValueEnum<'ctx>>> {
        let func = self.get_runtime_function(name)?;
        self.create_call_fn(func, args)
    }

    pub(crate) fn create_call_fn(
        &self,
        func: FunctionValue<'ctx>,
        args: &[BasicMetadataValueEnum<'ctx>],
    ) -> CodegenResult<Option<BasicValueEnum<'ctx>>> {
        self.check_call_signature(func, args)?;
        let call = self.builder.build_call(func, args, "")?;
        Ok(call.try_as_basic_value().left())
    }

    /// Intern a global string by content.
    pub(crate) fn global_string(&mut self, s: &str) -> CodegenResult<PointerValue<'ctx>> {
        if let Some(ptr) = self.strings.get(s) {
            return Ok(*ptr);
        }
        let global = self.builder.build_global_string_ptr(s, "format_string")?;
        let ptr = global.as_pointer_value();
        self.strings.insert(s.to_string(), ptr);
        Ok(ptr)
    }

    pub(crate) fn get_context_arg(&self) -> CodegenResult<PointerValue<'ctx>> {
        let func = self
            .func
            .ok_or_else(|| CodegenError::invariant("ArgLoad", "no task function under construction"))?;
        Ok(func.get_nth_param(0).unwrap().into_pointer_value())
    }

    /// The root buffer, through `Context_get_buffer`.
    fn get_root(&self) -> CodegenResult<PointerValue<'ctx>> {
        let ctx = self.get_context_arg()?;
        Ok(self
            .create_call("Context_get_buffer", &[ctx.into()])?
            .expect("Context_get_buffer returns a pointer")
            .into_pointer_value())
    }

    /// The runtime pointer, through `Context_get_runtime`.
    fn get_runtime(&self) -> CodegenResult<PointerValue<'ctx>> {
        let ctx = self.get_context_arg()?;
        Ok(self
            .create_call("Context_get_runtime", &[ctx.into()])?
            .expect("Context_get_runtime returns a pointer")
            .into_pointer_value())
    }

    // ======================================================================
    // Value map
    // ======================================================================

    pub(crate) fn set_value(&mut self, id: StmtId, value: BasicValueEnum<'ctx>) {
        self.values.insert(id, value);
    }

    pub(crate) fn value(&self, id: StmtId) -> CodegenResult<BasicValueEnum<'ctx>> {
        self.values.get(&id).copied().ok_or_else(|| {
            CodegenError::invariant("operand", format!("statement {} has no emitted value", id.0))
        })
    }

    pub(crate) fn int_value(&self, id: StmtId) -> CodegenResult<IntValue<'ctx>> {
        Ok(self.value(id)?.into_int_value())
    }

    pub(crate) fn ptr_value(&self, id: StmtId) -> CodegenResult<PointerValue<'ctx>> {
        Ok(self.value(id)?.into_pointer_value())
    }

    fn expect_scalar(&self, stmt: &Stmt, what: &'static str) -> CodegenResult<()> {
        if stmt.width != 1 {
            return Err(CodegenError::invariant(
                what,
                format!("vector width {} is not supported", stmt.width),
            ));
        }
        Ok(())
    }

    // ======================================================================
    // SNode meta descriptors
    // ======================================================================

    fn runtime_object_alloca(&self, type_name: &'static str) -> CodegenResult<RuntimeObject<'ctx>> {
        let ty = self.runtime_type(type_name)?;
        let ptr = self.create_entry_block_alloca(ty.into())?;
        Ok(RuntimeObject::adopt(type_name, ptr))
    }

    fn emit_struct_meta_base(
        &self,
        type_name: &str,
        meta_ptr: PointerValue<'ctx>,
        snode: &SNode,
    ) -> CodegenResult<()> {
        let common = RuntimeObject::adopt("StructMeta", meta_ptr);
        let llvm_info = self.program.snode_llvm(snode.id)?;

        // Allocation levels size their array element; root and place size
        // their own storage.
        let element_size = if snode.ty != SNodeType::Root && !snode.is_place() {
            self.program.type_size(llvm_info.cell_type)
        } else {
            self.program.type_size(llvm_info.node_type)
        };

        common.set(self, "snode_id", self.types.const_i32(snode.id.0 as i32).into())?;
        common.set(
            self,
            "element_size",
            self.types.const_i64(element_size as i64).into(),
        )?;
        common.set(
            self,
            "max_num_elements",
            self.types.const_i32(snode.max_num_elements()).into(),
        )?;

        for f in ["lookup_element", "is_active", "get_num_elements"] {
            common.set(self, f, self.runtime_function_ptr(&format!("{type_name}_{f}"))?)?;
        }

        // from_parent_element and refine_coordinates are per-snode, not
        // per-type.
        if snode.parent.is_some() {
            common.set(
                self,
                "from_parent_element",
                self.runtime_function_ptr(&snode.get_ch_from_parent_func_name())?,
            )?;
        }
        if !snode.is_place() {
            common.set(
                self,
                "refine_coordinates",
                self.runtime_function_ptr(&snode.refine_coordinates_func_name())?,
            )?;
        }
        Ok(())
    }

    /// Materialize a descriptor for `snode` at the current call site and
    /// return its address (usable wherever a `StructMeta*` is expected).
    pub(crate) fn emit_struct_meta(&self, snode: &SNode) -> CodegenResult<PointerValue<'ctx>> {
        match snode.ty {
            SNodeType::Dense => {
                let meta = self.runtime_object_alloca("DenseMeta")?;
                self.emit_struct_meta_base("Dense", meta.ptr, snode)?;
                meta.call(
                    self,
                    "set_bitmasked",
                    &[self.types.const_i32(snode.bitmasked as i32).into()],
                )?;
                meta.call(
                    self,
                    "set_morton_dim",
                    &[self.types.const_i32(snode.morton as i32).into()],
                )?;
                Ok(meta.ptr)
            }
            SNodeType::Root => {
                let meta = self.runtime_object_alloca("RootMeta")?;
                self.emit_struct_meta_base("Root", meta.ptr, snode)?;
                Ok(meta.ptr)
            }
            other => Err(CodegenError::UnsupportedType(format!(
                "struct meta for snode type {}",
                other.name()
            ))),
        }
    }

    // ======================================================================
    // Statement visitor
    // ======================================================================

    pub(crate) fn visit_block(&mut self, block: &IrBlock) -> CodegenResult<()> {
        let saved_mask = self.current_mask;
        self.current_mask = block.mask;
        for &id in &block.statements {
            self.visit_stmt(id)?;
        }
        self.current_mask = saved_mask;
        Ok(())
    }

    fn visit_stmt(&mut self, id: StmtId) -> CodegenResult<()> {
        let kernel = self.kernel;
        let stmt = kernel.arena.stmt(id);
        match &stmt.kind {
            StmtKind::Alloca => {
                self.expect_scalar(stmt, "Alloca")?;
                let ty = self.types.scalar(stmt.ret_type);
                let ptr = self.create_entry_block_alloca(ty)?;
                self.builder.build_store(ptr, self.types.zero(stmt.ret_type))?;
                self.set_value(id, ptr.into());
            }

            StmtKind::Const(val) => {
                self.expect_scalar(stmt, "Const")?;
                let v = self.types.constant(*val);
                self.set_value(id, v);
            }

            StmtKind::Rand => {
                return Err(CodegenError::unsupported("rand", stmt.ret_type));
            }

            StmtKind::Unary { op, operand } => {
                self.emit_unary(id, *op, *operand)?;
            }

            StmtKind::Cast {
                operand,
                from,
                to,
                by_value,
            } => {
                self.emit_cast(id, *operand, *from, *to, *by_value)?;
            }

            StmtKind::Binary { op, lhs, rhs } => {
                self.emit_binary(id, stmt.ret_type, *op, *lhs, *rhs)?;
            }

            StmtKind::Select {
                cond,
                then_val,
                else_val,
            } => {
                let cond = self.as_i1(self.int_value(*cond)?)?;
                let then_val = self.value(*then_val)?;
                let else_val = self.value(*else_val)?;
                let v = self.builder.build_select(cond, then_val, else_val, "select")?;
                self.set_value(id, v);
            }

            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                let func = self.current_func()?;
                let cond = self.int_value(*cond)?;
                let zero = cond.get_type().const_zero();
                let cmp = self
                    .builder
                    .build_int_compare(IntPredicate::NE, cond, zero, "ifcond")?;

                let context = self.program.context;
                let true_block = context.append_basic_block(func, "true_block");
                let false_block = context.append_basic_block(func, "false_block");
                let after_if = context.append_basic_block(func, "after_if");
                self.builder
                    .build_conditional_branch(cmp, true_block, false_block)?;

                self.builder.position_at_end(true_block);
                if let Some(body) = then_body {
                    self.visit_block(body)?;
                }
                self.builder.build_unconditional_branch(after_if)?;

                self.builder.position_at_end(false_block);
                if let Some(body) = else_body {
                    self.visit_block(body)?;
                }
                self.builder.build_unconditional_branch(after_if)?;

                self.builder.position_at_end(after_if);
            }

            StmtKind::While { body } => {
                let func = self.current_func()?;
                let context = self.program.context;
                let body_bb = context.append_basic_block(func, "while_loop_body");
                self.builder.build_unconditional_branch(body_bb)?;
                self.builder.position_at_end(body_bb);

                let after_loop = context.append_basic_block(func, "after_while");
                let saved = self.while_after_loop.replace(after_loop);

                self.visit_block(body)?;

                self.builder.build_unconditional_branch(body_bb)?;
                self.builder.position_at_end(after_loop);
                self.while_after_loop = saved;
            }

            StmtKind::WhileControl { cond } => {
                let after_loop = self.while_after_loop.ok_or_else(|| {
                    CodegenError::invariant("WhileControl", "break outside of a while loop")
                })?;
                let func = self.current_func()?;
                let after_break = self
                    .program
                    .context
                    .append_basic_block(func, "after_break");
                let cond = self.int_value(*cond)?;
                let zero = cond.get_type().const_zero();
                let cmp = self
                    .builder
                    .build_int_compare(IntPredicate::EQ, cond, zero, "breakcond")?;
                self.builder
                    .build_conditional_branch(cmp, after_loop, after_break)?;
                self.builder.position_at_end(after_break);
            }

            StmtKind::RangeFor {
                loop_var,
                begin,
                end,
                reversed,
                body,
            } => {
                let loop_var = self.ptr_value(*loop_var)?;
                let begin = self.int_value(*begin)?;
                let end = self.int_value(*end)?;
                self.create_naive_range_for(loop_var, begin, end, *reversed, body)?;
            }

            StmtKind::LocalLoad { ptr } => {
                self.expect_scalar(stmt, "LocalLoad")?;
                let ptr = self.ptr_value(*ptr)?;
                let ty = self.types.scalar(stmt.ret_type);
                let v = self.builder.build_load(ty, ptr, "local_load")?;
                self.set_value(id, v);
            }

            StmtKind::LocalStore { ptr, data } => {
                if self.current_mask.is_some() && stmt.width != 1 {
                    return Err(CodegenError::invariant(
                        "LocalStore",
                        "masked store with width > 1 is not supported",
                    ));
                }
                let ptr = self.ptr_value(*ptr)?;
                let data = self.value(*data)?;
                self.builder.build_store(ptr, data)?;
            }

            StmtKind::GlobalLoad { ptr } => {
                self.expect_scalar(stmt, "GlobalLoad")?;
                let ptr = self.ptr_value(*ptr)?;
                let ty = self.types.scalar(stmt.ret_type);
                let v = self.builder.build_load(ty, ptr, "global_load")?;
                self.set_value(id, v);
            }

            StmtKind::GlobalStore { ptr, data } => {
                if self.current_mask.is_some() && stmt.width != 1 {
                    return Err(CodegenError::invariant(
                        "GlobalStore",
                        "masked store with width > 1 is not supported",
                    ));
                }
                let ptr = self.ptr_value(*ptr)?;
                let data = self.value(*data)?;
                self.builder.build_store(ptr, data)?;
            }

            StmtKind::ArgLoad { arg_id, is_ptr } => {
                self.emit_arg_load(id, stmt.ret_type, *arg_id, *is_ptr)?;
            }

            StmtKind::AtomicOp { op, dest, val } => {
                self.emit_atomic(stmt, *op, *dest, *val)?;
            }

            StmtKind::SNodeLookup {
                snode,
                input_snode,
                input_index,
                activate,
            } => {
                self.emit_snode_lookup(id, *snode, *input_snode, *input_index, *activate)?;
            }

            StmtKind::GetCh {
                input_ptr,
                input_snode,
                output_snode: _,
                chid,
            } => {
                let cell_ty = self
                    .program
                    .snode_llvm(*input_snode)?
                    .cell_type
                    .into_struct_type();
                let ptr = self.ptr_value(*input_ptr)?;
                let v = self.builder.build_struct_gep(cell_ty, ptr, *chid, "getch")?;
                self.set_value(id, v.into());
            }

            StmtKind::ExternalPtr { base, indices } => {
                self.expect_scalar(stmt, "ExternalPtr")?;
                if indices.len() != 1 {
                    return Err(CodegenError::invariant(
                        "ExternalPtr",
                        format!("expected 1 index, got {}", indices.len()),
                    ));
                }
                let base = self.ptr_value(*base)?;
                let index = self.int_value(indices[0])?;
                let elem_ty = self.types.scalar(stmt.ret_type);
                let v = unsafe {
                    self.builder.build_gep(elem_ty, base, &[index], "external_ptr")?
                };
                self.set_value(id, v.into());
            }

            StmtKind::LoopIndex {
                index,
                is_struct_for,
            } => {
                self.emit_loop_index(id, *index, *is_struct_for)?;
            }

            StmtKind::Linearize { inputs, strides } => {
                if inputs.len() != strides.len() {
                    return Err(CodegenError::invariant(
                        "Linearize",
                        format!("{} inputs vs {} strides", inputs.len(), strides.len()),
                    ));
                }
                let mut val = self.types.const_i32(0);
                for (input, stride) in inputs.iter().zip(strides.iter()) {
                    let scaled =
                        self.builder
                            .build_int_mul(val, self.types.const_i32(*stride), "lin_mul")?;
                    val = self
                        .builder
                        .build_int_add(scaled, self.int_value(*input)?, "lin_add")?;
                }
                self.set_value(id, val.into());
            }

            StmtKind::OffsetAndExtractBits {
                input,
                offset,
                bit_begin,
                bit_end,
            } => {
                let input = self.int_value(*input)?;
                let shifted = self.builder.build_int_add(
                    input,
                    self.types.const_i32(*offset),
                    "offset",
                )?;
                let mask = ((1u64 << (bit_end - bit_begin)) - 1) as i64;
                let v = self.builder.build_and(
                    self.builder.build_right_shift(
                        shifted,
                        self.types.const_i32(*bit_begin as i32),
                        false,
                        "extract",
                    )?,
                    self.types
                        .const_i32(mask as u32 as i32),
                    "bits",
                )?;
                self.set_value(id, v.into());
            }

            StmtKind::ElementShuffle => {
                return Err(CodegenError::unsupported("element_shuffle", stmt.ret_type));
            }

            StmtKind::Print { value, label } => {
                self.expect_scalar(stmt, "Print")?;
                let label = label.clone();
                if self.gpu() {
                    self.emit_print_gpu(id, *value, &label)?;
                } else {
                    self.emit_print_host(id, *value, &label)?;
                }
            }

            StmtKind::Assert { .. } => {
                return Err(CodegenError::unsupported("assert", stmt.ret_type));
            }

            StmtKind::Offloaded(_) => {
                return Err(CodegenError::invariant(
                    "Offloaded",
                    "offloaded statements may only appear at the kernel root",
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn current_func(&self) -> CodegenResult<FunctionValue<'ctx>> {
        self.func
            .ok_or_else(|| CodegenError::invariant("codegen", "no task function under construction"))
    }

    /// Truncate an IR boolean (i32 by convention) to i1.
    fn as_i1(&self, v: IntValue<'ctx>) -> CodegenResult<IntValue<'ctx>> {
        if v.get_type().get_bit_width() == 1 {
            return Ok(v);
        }
        Ok(self
            .builder
            .build_int_truncate(v, self.program.context.bool_type(), "cond")?)
    }

    fn emit_unary(&mut self, id: StmtId, op: UnaryOp, operand: StmtId) -> CodegenResult<()> {
        let input = self.value(operand)?;
        let input_dt = self.kernel.arena.stmt(operand).ret_type;
        match op {
            UnaryOp::Neg => {
                if !input_dt.is_real() {
                    return Err(CodegenError::unsupported("neg", input_dt));
                }
                let v = self.builder.build_float_neg(input.into_float_value(), "neg")?;
                self.set_value(id, v.into());
            }
            UnaryOp::Sqrt | UnaryOp::Sin | UnaryOp::Cos | UnaryOp::Floor | UnaryOp::Ceil => {
                let v = self.call_scalar_intrinsic(op.name(), input)?;
                self.set_value(id, v);
            }
            _ => {
                let v = if self.gpu() {
                    self.emit_extra_unary_gpu(op, input, input_dt)?
                } else {
                    self.emit_extra_unary_host(op, input, input_dt)?
                };
                self.set_value(id, v);
            }
        }
        Ok(())
    }

    /// `llvm.{name}` parameterized over the input's scalar type.
    fn call_scalar_intrinsic(
        &self,
        name: &str,
        input: BasicValueEnum<'ctx>,
    ) -> CodegenResult<BasicValueEnum<'ctx>> {
        let full = format!("llvm.{name}");
        let intrinsic = Intrinsic::find(&full)
            .ok_or_else(|| CodegenError::RuntimeSymbolMissing(full.clone()))?;
        let decl = intrinsic
            .get_declaration(&self.module, &[input.get_type()])
            .ok_or_else(|| CodegenError::RuntimeSymbolMissing(full))?;
        Ok(self
            .create_call_fn(decl, &[input.into()])?
            .expect("scalar intrinsics return a value"))
    }

    /// Scalar unaries dispatched to `"{op}_{dtype}"` runtime helpers.
    fn emit_extra_unary_host(
        &self,
        op: UnaryOp,
        input: BasicValueEnum<'ctx>,
        dt: DataType,
    ) -> CodegenResult<BasicValueEnum<'ctx>> {
        let suffix = match dt {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::I32 => "i32",
            other => return Err(CodegenError::unsupported(op.name(), other)),
        };
        let name = format!("{}_{}", op.name(), suffix);
        Ok(self
            .create_call(&name, &[input.into()])?
            .expect("unary helpers return a value"))
    }

    fn emit_cast(
        &mut self,
        id: StmtId,
        operand: StmtId,
        from: DataType,
        to: DataType,
        by_value: bool,
    ) -> CodegenResult<()> {
        let input = self.value(operand)?;
        let dest_ty = self.types.scalar(to);

        if !by_value {
            if from.size() != to.size() {
                return Err(CodegenError::invariant(
                    "Cast",
                    format!("bit cast between {from} and {to} of different sizes"),
                ));
            }
            let v = self.builder.build_bit_cast(input, dest_ty, "bitcast")?;
            self.set_value(id, v);
            return Ok(());
        }

        if from == to {
            return Err(CodegenError::invariant("Cast", format!("cast from {from} to itself")));
        }

        let v: BasicValueEnum = if from.is_real() != to.is_real() {
            match (from, to) {
                (DataType::F32 | DataType::F64, DataType::I32) => self
                    .builder
                    .build_float_to_signed_int(
                        input.into_float_value(),
                        self.types.int(to),
                        "fptosi",
                    )?
                    .into(),
                (DataType::I32, DataType::F32 | DataType::F64) => self
                    .builder
                    .build_signed_int_to_float(
                        input.into_int_value(),
                        self.types.float(to),
                        "sitofp",
                    )?
                    .into(),
                _ => return Err(CodegenError::UnsupportedCast { from, to }),
            }
        } else if from.is_real() {
            if from.size() < to.size() {
                self.builder
                    .build_float_ext(input.into_float_value(), self.types.float(to), "fpext")?
                    .into()
            } else {
                self.builder
                    .build_float_trunc(input.into_float_value(), self.types.float(to), "fptrunc")?
                    .into()
            }
        } else if from.size() < to.size() {
            self.builder
                .build_int_s_extend(input.into_int_value(), self.types.int(to), "sext")?
                .into()
        } else {
            self.builder
                .build_int_truncate(input.into_int_value(), self.types.int(to), "trunc")?
                .into()
        };
        self.set_value(id, v);
        Ok(())
    }

    fn emit_binary(
        &mut self,
        id: StmtId,
        ret_type: DataType,
        op: BinaryOp,
        lhs: StmtId,
        rhs: StmtId,
    ) -> CodegenResult<()> {
        let l = self.value(lhs)?;
        let r = self.value(rhs)?;
        let b = &self.builder;

        let v: BasicValueEnum = match op {
            BinaryOp::Add => {
                if ret_type.is_real() {
                    b.build_float_add(l.into_float_value(), r.into_float_value(), "add")?.into()
                } else {
                    b.build_int_add(l.into_int_value(), r.into_int_value(), "add")?.into()
                }
            }
            BinaryOp::Sub => {
                if ret_type.is_real() {
                    b.build_float_sub(l.into_float_value(), r.into_float_value(), "sub")?.into()
                } else {
                    b.build_int_sub(l.into_int_value(), r.into_int_value(), "sub")?.into()
                }
            }
            BinaryOp::Mul => {
                if ret_type.is_real() {
                    b.build_float_mul(l.into_float_value(), r.into_float_value(), "mul")?.into()
                } else {
                    b.build_int_mul(l.into_int_value(), r.into_int_value(), "mul")?.into()
                }
            }
            BinaryOp::Div => {
                if ret_type.is_real() {
                    b.build_float_div(l.into_float_value(), r.into_float_value(), "div")?.into()
                } else {
                    b.build_int_signed_div(l.into_int_value(), r.into_int_value(), "div")?.into()
                }
            }
            BinaryOp::Mod => b
                .build_int_signed_rem(l.into_int_value(), r.into_int_value(), "mod")?
                .into(),
            BinaryOp::BitAnd => {
                if ret_type.is_real() {
                    return Err(CodegenError::unsupported("bit_and", ret_type));
                }
                b.build_and(l.into_int_value(), r.into_int_value(), "bit_and")?.into()
            }
            BinaryOp::BitOr => {
                if ret_type.is_real() {
                    return Err(CodegenError::unsupported("bit_or", ret_type));
                }
                b.build_or(l.into_int_value(), r.into_int_value(), "bit_or")?.into()
            }
            BinaryOp::BitXor => {
                if ret_type.is_real() {
                    return Err(CodegenError::unsupported("bit_xor", ret_type));
                }
                b.build_xor(l.into_int_value(), r.into_int_value(), "bit_xor")?.into()
            }
            BinaryOp::Max | BinaryOp::Min => {
                if ret_type.is_real() {
                    let name = if op == BinaryOp::Max {
                        "llvm.maxnum"
                    } else {
                        "llvm.minnum"
                    };
                    let intrinsic = Intrinsic::find(name)
                        .ok_or_else(|| CodegenError::RuntimeSymbolMissing(name.to_string()))?;
                    let decl = intrinsic
                        .get_declaration(&self.module, &[l.get_type()])
                        .ok_or_else(|| CodegenError::RuntimeSymbolMissing(name.to_string()))?;
                    self.create_call_fn(decl, &[l.into(), r.into()])?
                        .expect("minnum/maxnum return a value")
                } else if ret_type == DataType::I32 {
                    let helper = if op == BinaryOp::Max { "max_i32" } else { "min_i32" };
                    self.create_call(helper, &[l.into(), r.into()])?
                        .expect("max/min helpers return a value")
                } else {
                    return Err(CodegenError::unsupported(op.name(), ret_type));
                }
            }
            _ => {
                debug_assert!(op.is_comparison());
                let input_dt = self.kernel.arena.stmt(lhs).ret_type;
                let cmp = self.emit_comparison(op, input_dt, l, r)?;
                // The IR models booleans as i32 in {0, -1}.
                self.builder
                    .build_int_s_extend(cmp, self.program.context.i32_type(), "cmp_i32")?
                    .into()
            }
        };
        self.set_value(id, v);
        Ok(())
    }

    fn emit_comparison(
        &self,
        op: BinaryOp,
        input_dt: DataType,
        l: BasicValueEnum<'ctx>,
        r: BasicValueEnum<'ctx>,
    ) -> CodegenResult<IntValue<'ctx>> {
        if input_dt.is_real() {
            let pred = match op {
                BinaryOp::CmpEq => FloatPredicate::OEQ,
                BinaryOp::CmpNe => FloatPredicate::ONE,
                BinaryOp::CmpLt => FloatPredicate::OLT,
                BinaryOp::CmpLe => FloatPredicate::OLE,
                BinaryOp::CmpGt => FloatPredicate::OGT,
                BinaryOp::CmpGe => FloatPredicate::OGE,
                _ => unreachable!(),
            };
            Ok(self.builder.build_float_compare(
                pred,
                l.into_float_value(),
                r.into_float_value(),
                "fcmp",
            )?)
        } else {
            let signed = input_dt.is_signed();
            let pred = match op {
                BinaryOp::CmpEq => IntPredicate::EQ,
                BinaryOp::CmpNe => IntPredicate::NE,
                BinaryOp::CmpLt => {
                    if signed {
                        IntPredicate::SLT
                    } else {
                        IntPredicate::ULT
                    }
                }
                BinaryOp::CmpLe => {
                    if signed {
                        IntPredicate::SLE
                    } else {
                        IntPredicate::ULE
                    }
                }
                BinaryOp::CmpGt => {
                    if signed {
                        IntPredicate::SGT
                    } else {
                        IntPredicate::UGT
                    }
                }
                BinaryOp::CmpGe => {
                    if signed {
                        IntPredicate::SGE
                    } else {
                        IntPredicate::UGE
                    }
                }
                _ => unreachable!(),
            };
            Ok(self.builder.build_int_compare(
                pred,
                l.into_int_value(),
                r.into_int_value(),
                "icmp",
            )?)
        }
    }

    fn emit_arg_load(
        &mut self,
        id: StmtId,
        ret_type: DataType,
        arg_id: usize,
        is_ptr: bool,
    ) -> CodegenResult<()> {
        let ctx = self.get_context_arg()?;
        let raw = self
            .create_call(
                "Context_get_args",
                &[ctx.into(), self.types.const_i32(arg_id as i32).into()],
            )?
            .expect("Context_get_args returns a value")
            .into_int_value();

        if is_ptr {
            let ptr_ty = self.program.context.ptr_type(AddressSpace::default());
            let v = self.builder.build_int_to_ptr(raw, ptr_ty, "arg_ptr")?;
            self.set_value(id, v.into());
            return Ok(());
        }

        let dest_ty = self.types.scalar(ret_type);
        let bits = ret_type.bits();
        let truncated = if bits < 64 {
            self.builder.build_int_truncate(
                raw,
                self.program.context.custom_width_int_type(bits),
                "arg_trunc",
            )?
        } else {
            raw
        };
        let v = self.builder.build_bit_cast(truncated, dest_ty, "arg")?;
        self.set_value(id, v);
        Ok(())
    }

    fn emit_atomic(
        &mut self,
        stmt: &Stmt,
        op: AtomicOp,
        dest: StmtId,
        val: StmtId,
    ) -> CodegenResult<()> {
        if self.current_mask.is_some() {
            return Err(CodegenError::invariant(
                "AtomicOp",
                "masked atomics are not lowered",
            ));
        }
        self.expect_scalar(stmt, "AtomicOp")?;
        let val_dt = self.kernel.arena.stmt(val).ret_type;
        if op != AtomicOp::Add {
            return Err(CodegenError::unsupported(op.name(), val_dt));
        }
        let dest = self.ptr_value(dest)?;
        let value = self.value(val)?;

        if self.gpu() {
            self.emit_atomic_add_gpu(dest, value, val_dt)?;
            return Ok(());
        }

        if val_dt.is_integral() {
            self.builder.build_atomicrmw(
                AtomicRMWBinOp::Add,
                dest,
                value.into_int_value(),
                AtomicOrdering::SequentiallyConsistent,
            )?;
        } else {
            let helper = match val_dt {
                DataType::F32 => "atomic_add_cpu_f32",
                DataType::F64 => "atomic_add_cpu_f64",
                _ => unreachable!(),
            };
            self.create_call(helper, &[dest.into(), value.into()])?;
        }
        Ok(())
    }

    fn emit_snode_lookup(
        &mut self,
        id: StmtId,
        snode: crate::snode::SNodeId,
        input_snode: Option<StmtId>,
        input_index: StmtId,
        activate: bool,
    ) -> CodegenResult<()> {
        let node = self.program.snodes.node(snode);
        if !activate && node.has_ambient() {
            return Err(CodegenError::invariant(
                "SNodeLookup",
                format!(
                    "ambient fallback of {} without activation is not lowered",
                    node.node_type_name()
                ),
            ));
        }

        let parent = match input_snode {
            Some(s) => self.ptr_value(s)?,
            None => self.get_root()?,
        };
        let index = self.int_value(input_index)?;

        match node.ty {
            SNodeType::Root => {
                // The root is modeled as an array of its cell struct.
                let root_ty = self.program.snode_llvm(snode)?.node_type;
                let v = unsafe { self.builder.build_gep(root_ty, parent, &[index], "root_cell")? };
                self.set_value(id, v.into());
            }
            SNodeType::Dense => {
                let meta = self.emit_struct_meta(node)?;
                let elem = self
                    .create_call(
                        "Dense_lookup_element",
                        &[meta.into(), parent.into(), index.into()],
                    )?
                    .expect("lookup_element returns a pointer");
                self.set_value(id, elem);
            }
            other => {
                return Err(CodegenError::UnsupportedType(format!(
                    "snode lookup into {}",
                    other.name()
                )))
            }
        }
        Ok(())
    }

    fn emit_loop_index(&mut self, id: StmtId, index: usize, is_struct_for: bool) -> CodegenResult<()> {
        let i32t = self.program.context.i32_type();
        let v = if is_struct_for {
            let coords = self.current_coordinates.ok_or_else(|| {
                CodegenError::invariant("LoopIndex", "no coordinates outside a struct-for body")
            })?;
            let pcoord_ty = self.runtime_type("PhysicalCoordinates")?;
            let zero = i32t.const_zero();
            let slot = unsafe {
                self.builder.build_gep(
                    pcoord_ty,
                    coords,
                    &[zero, zero, i32t.const_int(index as u64, false)],
                    "coord",
                )?
            };
            self.builder.build_load(i32t, slot, "loop_index")?
        } else {
            let ptr = *self.offload_loop_vars.get(index).ok_or_else(|| {
                CodegenError::invariant(
                    "LoopIndex",
                    format!("offloaded task has no loop variable {index}"),
                )
            })?;
            self.builder.build_load(i32t, ptr, "loop_index")?
        };
        self.set_value(id, v);
        Ok(())
    }

    fn emit_print_host(&mut self, id: StmtId, value: StmtId, label: &str) -> CodegenResult<()> {
        let dt = self.kernel.arena.stmt(value).ret_type;
        let mut v = self.value(value)?;
        let format = match dt {
            DataType::I32 => "%d",
            DataType::F32 => {
                v = self
                    .builder
                    .build_float_ext(
                        v.into_float_value(),
                        self.program.context.f64_type(),
                        "print_f64",
                    )?
                    .into();
                "%f"
            }
            other => return Err(CodegenError::unsupported("print", other)),
        };
        let fmt = self.global_string(&format!("[debug] {label} = {format}\n"))?;
        let result = self.create_call("printf", &[fmt.into(), v.into()])?;
        if let Some(result) = result {
            self.set_value(id, result);
        }
        Ok(())
    }

    // ======================================================================
    // Loop shapes
    // ======================================================================

    /// `*ptr += delta` for an i32 loop variable.
    pub(crate) fn create_increment(
        &self,
        ptr: PointerValue<'ctx>,
        delta: IntValue<'ctx>,
    ) -> CodegenResult<()> {
        let i32t = self.program.context.i32_type();
        let cur = self.builder.build_load(i32t, ptr, "i")?.into_int_value();
        let next = self.builder.build_int_add(cur, delta, "inc")?;
        self.builder.build_store(ptr, next)?;
        Ok(())
    }

    /// Serial loop over `[begin, end)`, or `(begin, end]` downwards when
    /// reversed. Guards before the first iteration so empty ranges execute
    /// zero times.
    fn create_naive_range_for(
        &mut self,
        loop_var: PointerValue<'ctx>,
        begin: IntValue<'ctx>,
        end: IntValue<'ctx>,
        reversed: bool,
        body: &IrBlock,
    ) -> CodegenResult<()> {
        let func = self.current_func()?;
        let context = self.program.context;
        let i32t = context.i32_type();
        let body_bb = context.append_basic_block(func, "loop_body");
        let after_bb = context.append_basic_block(func, "after_loop");

        if !reversed {
            self.builder.build_store(loop_var, begin)?;
        } else {
            let last = self
                .builder
                .build_int_sub(end, i32t.const_int(1, false), "last")?;
            self.builder.build_store(loop_var, last)?;
        }

        let enter = {
            let cur = self.builder.build_load(i32t, loop_var, "i")?.into_int_value();
            if !reversed {
                self.builder
                    .build_int_compare(IntPredicate::SLT, cur, end, "enter")?
            } else {
                self.builder
                    .build_int_compare(IntPredicate::SGE, cur, begin, "enter")?
            }
        };
        self.builder.build_conditional_branch(enter, body_bb, after_bb)?;

        self.builder.position_at_end(body_bb);
        self.visit_block(body)?;

        let delta = if !reversed {
            i32t.const_int(1, false)
        } else {
            i32t.const_int(-1i64 as u64, true)
        };
        self.create_increment(loop_var, delta)?;
        let cur = self.builder.build_load(i32t, loop_var, "i")?.into_int_value();
        let cond = if !reversed {
            self.builder
                .build_int_compare(IntPredicate::SLT, cur, end, "cond")?
        } else {
            self.builder
                .build_int_compare(IntPredicate::SGE, cur, begin, "cond")?
        };
        self.builder.build_conditional_branch(cond, body_bb, after_bb)?;

        self.builder.position_at_end(after_bb);
        Ok(())
    }

    /// Host lowering of an offloaded range-for: a serial loop over the
    /// task's constant bounds, with the loop variable exposed to
    /// `LoopIndex`.
    fn create_offload_range_for(&mut self, stmt: &OffloadedStmt) -> CodegenResult<()> {
        let i32t = self.program.context.i32_type();
        let loop_var = self.create_entry_block_alloca(i32t.into())?;
        self.offload_loop_vars.push(loop_var);

        let body = stmt
            .body
            .as_ref()
            .ok_or_else(|| CodegenError::invariant("Offloaded", "range-for task without a body"))?;
        let begin = self.types.const_i32(stmt.begin);
        let end = self.types.const_i32(stmt.end);
        let body = body.clone();
        self.create_naive_range_for(loop_var, begin, end, stmt.reversed, &body)
    }

    /// Shared struct-for body generation: emits the internal `loop_body`
    /// function, then calls `for_each_block` with it. `spmd` threads stride
    /// the inner loop by `blockDim.x`.
    pub(crate) fn create_offload_struct_for(
        &mut self,
        stmt: &OffloadedStmt,
        block_size: i32,
        spmd: bool,
    ) -> CodegenResult<()> {
        let context = self.program.context;
        let i32t = context.i32_type();
        let ptr = context.ptr_type(AddressSpace::default());

        let place_id = stmt.snode.ok_or_else(|| {
            CodegenError::invariant("Offloaded", "struct-for task without a target snode")
        })?;
        let place = self.program.snodes.node(place_id);
        let leaf_id = place.parent.ok_or_else(|| {
            CodegenError::invariant("Offloaded", "struct-for over a parentless snode")
        })?;
        let leaf = self.program.snodes.node(leaf_id).clone();
        let body_block = stmt
            .body
            .as_ref()
            .ok_or_else(|| CodegenError::invariant("Offloaded", "struct-for task without a body"))?
            .clone();

        let body_fn_ty = context.void_type().fn_type(
            &[ptr.into(), ptr.into(), i32t.into(), i32t.into()],
            false,
        );
        let body_fn = self
            .module
            .add_function("loop_body", body_fn_ty, Some(Linkage::Internal));

        let old_func = self.func.replace(body_fn);
        let saved_ip = self.builder.get_insert_block();

        let allocas = context.append_basic_block(body_fn, "allocs");
        let old_entry = self.entry_block.replace(allocas);
        let entry = context.append_basic_block(body_fn, "entry");
        let body_bb = context.append_basic_block(body_fn, "loop_body");

        self.builder.position_at_end(entry);
        let loop_index = self.create_entry_block_alloca(i32t.into())?;
        let lower_bound = body_fn.get_nth_param(2).unwrap().into_int_value();
        let upper_bound = body_fn.get_nth_param(3).unwrap().into_int_value();

        let block_dim_x = if spmd {
            let thread_idx = self.read_sreg("tid.x")?;
            let block_dim = self.read_sreg("ntid.x")?;
            let start = self
                .builder
                .build_int_add(thread_idx, lower_bound, "start")?;
            self.builder.build_store(loop_index, start)?;
            Some(block_dim)
        } else {
            self.builder.build_store(loop_index, lower_bound)?;
            None
        };
        self.builder.build_unconditional_branch(body_bb)?;

        self.builder.position_at_end(body_bb);

        // Refine the leaf block's base coordinates into this iteration's
        // cell coordinates.
        let refine = self.get_runtime_function(&leaf.refine_coordinates_func_name())?;
        let pcoord_ty = self.runtime_type("PhysicalCoordinates")?;
        let new_coordinates = self.create_entry_block_alloca(pcoord_ty.into())?;
        let element =
            RuntimeObject::adopt("Element", body_fn.get_nth_param(1).unwrap().into_pointer_value());
        let pcoord_ptr = element.get_ptr(self, "pcoord")?;
        let cur_index = self
            .builder
            .build_load(i32t, loop_index, "loop_index")?;
        self.create_call_fn(
            refine,
            &[pcoord_ptr.into(), new_coordinates.into(), cur_index.into()],
        )?;

        let saved_coords = self.current_coordinates.replace(new_coordinates);
        self.visit_block(&body_block)?;
        self.current_coordinates = saved_coords;

        let after_bb = context.append_basic_block(body_fn, "block");
        let delta = match block_dim_x {
            Some(dim) => dim,
            None => i32t.const_int(1, false),
        };
        self.create_increment(loop_index, delta)?;
        let cur = self
            .builder
            .build_load(i32t, loop_index, "i")?
            .into_int_value();
        let cond = self
            .builder
            .build_int_compare(IntPredicate::SLT, cur, upper_bound, "cond")?;
        self.builder.build_conditional_branch(cond, body_bb, after_bb)?;

        self.builder.position_at_end(after_bb);
        self.builder.build_return(None)?;

        // Stitch the alloca sink onto the body.
        self.builder.position_at_end(allocas);
        self.builder.build_unconditional_branch(entry)?;

        self.func = old_func;
        self.entry_block = old_entry;
        if let Some(bb) = saved_ip {
            self.builder.position_at_end(bb);
        }

        // The runtime enumerates the recorded leaf blocks and calls
        // `loop_body` per sub-range.
        let num_splits = leaf.max_num_elements() / block_size;
        let leaf_parent = leaf.parent.ok_or_else(|| {
            CodegenError::invariant("Offloaded", "struct-for leaf has no parent level")
        })?;
        let ctx = self.get_context_arg()?;
        self.create_call(
            "for_each_block",
            &[
                ctx.into(),
                self.types.const_i32(leaf_parent.0 as i32).into(),
                self.types.const_i32(leaf.max_num_elements()).into(),
                self.types.const_i32(num_splits).into(),
                body_fn.as_global_value().as_pointer_value().into(),
            ],
        )?;
        Ok(())
    }

    /// Emit an `element_listgen` call for the task's snode and its parent.
    fn emit_list_gen(&mut self, stmt: &OffloadedStmt) -> CodegenResult<()> {
        let child_id = stmt.snode.ok_or_else(|| {
            CodegenError::invariant("Offloaded", "listgen task without a target snode")
        })?;
        let child = self.program.snodes.node(child_id).clone();
        let parent_id = child.parent.ok_or_else(|| {
            CodegenError::invariant("Offloaded", "listgen over a parentless snode")
        })?;
        let parent = self.program.snodes.node(parent_id).clone();

        let meta_child = self.emit_struct_meta(&child)?;
        let meta_parent = self.emit_struct_meta(&parent)?;
        let runtime = self.get_runtime()?;
        self.create_call(
            "element_listgen",
            &[runtime.into(), meta_parent.into(), meta_child.into()],
        )?;
        Ok(())
    }

    // ======================================================================
    // Offload driver
    // ======================================================================

    fn init_task_function(&mut self) -> CodegenResult<FunctionValue<'ctx>> {
        self.while_after_loop = None;
        self.current_coordinates = None;
        self.current_mask = None;
        self.offload_loop_vars.clear();
        self.grid_dim = 1;
        self.block_dim = 1;

        let context = self.program.context;
        let ptr = context.ptr_type(AddressSpace::default());
        let fn_ty = context.void_type().fn_type(&[ptr.into()], false);
        let name = format!("{}_{}", self.kernel_name, self.task_counter);
        self.task_counter += 1;

        let func = self
            .module
            .add_function(&name, fn_ty, Some(Linkage::External));
        func.get_nth_param(0).unwrap().set_name("context");

        let entry = context.append_basic_block(func, "entry");
        let body = context.append_basic_block(func, "body");
        self.builder.position_at_end(body);

        self.func = Some(func);
        self.entry_block = Some(entry);
        self.body_block = Some(body);
        Ok(func)
    }

    fn finalize_task_function(&mut self, func: FunctionValue<'ctx>) -> CodegenResult<()> {
        let name = func.get_name().to_string_lossy().into_owned();
        self.builder.build_return(None)?;

        // The alloca sink jumps to the body once all allocas are in place.
        let entry = self.entry_block.take().unwrap();
        let body = self.body_block.take().unwrap();
        self.builder.position_at_end(entry);
        self.builder.build_unconditional_branch(body)?;

        if self.gpu() {
            self.mark_function_as_gpu_kernel(func);
        }

        if self.program.config.print_kernel_llvm_ir {
            info!(task = %name, "kernel module IR\n{}", self.print_ir());
        }

        if !func.verify(true) {
            return Err(CodegenError::VerificationFailure { function: name });
        }

        debug!(task = %name, grid_dim = self.grid_dim, block_dim = self.block_dim, "emitted task");
        self.tasks.push(OffloadedTask {
            name,
            grid_dim: self.grid_dim,
            block_dim: self.block_dim,
        });
        self.func = None;
        Ok(())
    }

    fn visit_offloaded(&mut self, stmt: &OffloadedStmt) -> CodegenResult<()> {
        let func = self.init_task_function()?;

        match stmt.task_type {
            TaskType::Serial => {
                let body = stmt.body.as_ref().ok_or_else(|| {
                    CodegenError::invariant("Offloaded", "serial task without a body")
                })?;
                let body = body.clone();
                self.visit_block(&body)?;
            }
            TaskType::RangeFor => {
                if self.gpu() {
                    self.create_gpu_offload_range_for(stmt)?;
                } else {
                    self.create_offload_range_for(stmt)?;
                }
            }
            TaskType::StructFor => {
                if self.gpu() {
                    self.create_gpu_offload_struct_for(stmt)?;
                } else {
                    let place_id = stmt.snode.ok_or_else(|| {
                        CodegenError::invariant("Offloaded", "struct-for task without a target snode")
                    })?;
                    let leaf_id = self.program.snodes.node(place_id).parent.ok_or_else(|| {
                        CodegenError::invariant("Offloaded", "struct-for over a parentless snode")
                    })?;
                    let leaf_cap = self.program.snodes.node(leaf_id).max_num_elements();
                    let block_size = if stmt.block_size == 0 {
                        leaf_cap
                    } else {
                        stmt.block_size.min(leaf_cap)
                    };
                    self.create_offload_struct_for(stmt, block_size, false)?;
                }
            }
            TaskType::ListGen => self.emit_list_gen(stmt)?,
        }

        self.finalize_task_function(func)
    }

    /// Lower every offloaded task of the kernel into the module.
    pub fn emit_to_module(&mut self) -> CodegenResult<()> {
        let kernel = self.kernel;
        for &id in &kernel.root.statements {
            match &kernel.arena.stmt(id).kind {
                StmtKind::Offloaded(off) => self.visit_offloaded(off)?,
                other => {
                    return Err(CodegenError::invariant(
                        "Kernel",
                        format!("kernel root contains a non-offloaded statement: {other:?}"),
                    ))
                }
            }
        }
        Ok(())
    }

    // ======================================================================
    // Host assembly
    // ======================================================================

    /// Move the module into the JIT and resolve each task's entry address.
    /// Consumes the generator; the module cannot be edited afterwards.
    pub fn compile_module_to_executable(self) -> CodegenResult<HostKernel<'ctx>> {
        if self.gpu() {
            return Err(CodegenError::BackendUnavailable(
                "host assembler invoked for a GPU program".to_string(),
            ));
        }
        super::target::initialize_native_target()?;
        self.module
            .verify()
            .map_err(|e| CodegenError::Llvm(format!("module verification failed: {e}")))?;

        let execution_engine = self
            .module
            .create_jit_execution_engine(OptimizationLevel::None)
            .map_err(|e| CodegenError::Llvm(format!("failed to create JIT: {e}")))?;

        // Bind the declarations the host runtime implements natively.
        for (name, addr) in trellis_runtime::native_symbols() {
            if let Some(func) = self.module.get_function(name) {
                if func.count_basic_blocks() == 0 {
                    execution_engine.add_global_mapping(&func, addr);
                }
            }
        }

        let mut tasks = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            let addr = execution_engine
                .get_function_address(&task.name)
                .map_err(|e| CodegenError::Llvm(format!("task {} not found: {e}", task.name)))?;
            let func: TaskFn = unsafe { std::mem::transmute::<usize, TaskFn>(addr) };
            tasks.push(HostTask {
                name: task.name.clone(),
                func,
            });
        }

        Ok(HostKernel {
            _module: self.module,
            _execution_engine: execution_engine,
            tasks,
        })
    }
}

/// Signature of an emitted host task.
pub type TaskFn = unsafe extern "C" fn(*mut trellis_runtime::Context);

struct HostTask {
    name: String,
    func: TaskFn,
}

/// A JIT-compiled kernel: invokes its tasks in emission order.
pub struct HostKernel<'ctx> {
    _module: Module<'ctx>,
    _execution_engine: ExecutionEngine<'ctx>,
    tasks: Vec<HostTask>,
}

impl HostKernel<'_> {
    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.name.as_str()).collect()
    }

    /// Run every task in order against `ctx`.
    ///
    /// # Safety
    /// The context must carry valid buffer/runtime pointers for the kernel's
    /// loads, stores, and list traversals.
    pub unsafe fn launch(&self, ctx: &mut trellis_runtime::Context) {
        for task in &self.tasks {
            (task.func)(ctx as *mut _);
        }
    }
}

/// Emit and JIT-compile `kernel` for the host.
pub fn compile_kernel<'p, 'ctx>(
    program: &'p Program<'ctx>,
    kernel: &'p Kernel,
) -> CodegenResult<HostKernel<'ctx>> {
    let mut gen = CodeGenLlvm::new(program, kernel)?;
    gen.emit_to_module()?;
    gen.compile_module_to_executable()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompileConfig;
    use crate::ir::{Block, IrArena};
    use crate::snode::SNodeTree;
    use crate::types::ConstValue;
    use inkwell::context::Context;
    use trellis_runtime as rt;

    fn host_program(context: &Context, tree: SNodeTree) -> Program<'_> {
        Program::new(context, CompileConfig::default(), tree).unwrap()
    }

    /// `ExternalPtr(arg0, slot)` as a statement sequence.
    fn external_slot(a: &mut IrArena, dt: DataType, slot: i32) -> (Vec<StmtId>, StmtId) {
        let base = a.push(StmtKind::ArgLoad { arg_id: 0, is_ptr: true }, DataType::I32);
        let idx = a.push(StmtKind::Const(ConstValue::I32(slot)), DataType::I32);
        let ptr = a.push(
            StmtKind::ExternalPtr {
                base,
                indices: vec![idx],
            },
            dt,
        );
        (vec![base, idx, ptr], ptr)
    }

    unsafe fn run_with_i32_out(kernel: &Kernel, tree: SNodeTree, out: &mut [i32]) {
        let context = Context::create();
        let program = host_program(&context, tree);
        let compiled = compile_kernel(&program, kernel).unwrap();
        let mut ctx = rt::Context::new();
        ctx.set_arg_ptr(0, out.as_mut_ptr() as *mut u8);
        compiled.launch(&mut ctx);
    }

    #[test]
    fn serial_store_writes_buffer() {
        let mut a = IrArena::new();
        let (mut stmts, ptr) = external_slot(&mut a, DataType::I32, 0);
        let val = a.push(StmtKind::Const(ConstValue::I32(7)), DataType::I32);
        let st = a.push(StmtKind::GlobalStore { ptr, data: val }, DataType::I32);
        stmts.extend([val, st]);
        let off = a.push(
            StmtKind::Offloaded(OffloadedStmt::serial(Block::new(stmts))),
            DataType::I32,
        );
        let kernel = Kernel::new("store7", a, Block::new(vec![off]));

        let mut out = [0i32];
        unsafe { run_with_i32_out(&kernel, SNodeTree::new(), &mut out) };
        assert_eq!(out, [7]);
    }

    #[test]
    fn tasks_run_in_emission_order() {
        let mut a = IrArena::new();
        let mut offs = Vec::new();
        for v in [1, 2] {
            let (mut stmts, ptr) = external_slot(&mut a, DataType::I32, 0);
            let val = a.push(StmtKind::Const(ConstValue::I32(v)), DataType::I32);
            let st = a.push(StmtKind::GlobalStore { ptr, data: val }, DataType::I32);
            stmts.extend([val, st]);
            offs.push(a.push(
                StmtKind::Offloaded(OffloadedStmt::serial(Block::new(stmts))),
                DataType::I32,
            ));
        }
        let kernel = Kernel::new("order", a, Block::new(offs));

        let context = Context::create();
        let program = host_program(&context, SNodeTree::new());
        let compiled = compile_kernel(&program, &kernel).unwrap();
        assert_eq!(compiled.task_names(), ["order_kernel_0", "order_kernel_1"]);

        let mut out = [0i32];
        let mut ctx = rt::Context::new();
        ctx.set_arg_ptr(0, out.as_mut_ptr() as *mut u8);
        unsafe { compiled.launch(&mut ctx) };
        assert_eq!(out, [2]);
    }

    #[test]
    fn grad_kernels_carry_the_suffix() {
        let mut a = IrArena::new();
        let off = a.push(
            StmtKind::Offloaded(OffloadedStmt::serial(Block::default())),
            DataType::I32,
        );
        let mut kernel = Kernel::new("advect", a, Block::new(vec![off]));
        kernel.grad = true;

        let context = Context::create();
        let program = host_program(&context, SNodeTree::new());
        let mut gen = CodeGenLlvm::new(&program, &kernel).unwrap();
        gen.emit_to_module().unwrap();
        assert_eq!(gen.tasks()[0].name, "advect_grad_kernel_0");
    }

    #[test]
    fn offloaded_range_for_accumulates() {
        let mut a = IrArena::new();
        let (mut stmts, ptr) = external_slot(&mut a, DataType::I32, 0);
        let cur = a.push(StmtKind::GlobalLoad { ptr }, DataType::I32);
        let i = a.push(
            StmtKind::LoopIndex {
                index: 0,
                is_struct_for: false,
            },
            DataType::I32,
        );
        let sum = a.push(
            StmtKind::Binary {
                op: BinaryOp::Add,
                lhs: cur,
                rhs: i,
            },
            DataType::I32,
        );
        let st = a.push(StmtKind::GlobalStore { ptr, data: sum }, DataType::I32);
        stmts.extend([cur, i, sum, st]);
        let off = a.push(
            StmtKind::Offloaded(OffloadedStmt::range_for(0, 100, Block::new(stmts))),
            DataType::I32,
        );
        let kernel = Kernel::new("sum", a, Block::new(vec![off]));

        let mut out = [0i32];
        unsafe { run_with_i32_out(&kernel, SNodeTree::new(), &mut out) };
        assert_eq!(out, [4950]);
    }

    #[test]
    fn empty_ranges_execute_zero_iterations() {
        for reversed in [false, true] {
            let mut a = IrArena::new();
            let (mut stmts, ptr) = external_slot(&mut a, DataType::I32, 0);
            let val = a.push(StmtKind::Const(ConstValue::I32(99)), DataType::I32);
            let st = a.push(StmtKind::GlobalStore { ptr, data: val }, DataType::I32);
            stmts.extend([val, st]);
            let mut off = OffloadedStmt::range_for(0, 0, Block::new(stmts));
            off.reversed = reversed;
            let off = a.push(StmtKind::Offloaded(off), DataType::I32);
            let kernel = Kernel::new("empty", a, Block::new(vec![off]));

            let mut out = [0i32];
            unsafe { run_with_i32_out(&kernel, SNodeTree::new(), &mut out) };
            assert_eq!(out, [0], "reversed = {reversed}");
        }
    }

    fn if_kernel(cond_value: i32) -> Kernel {
        let mut a = IrArena::new();
        let (mut stmts, ptr) = external_slot(&mut a, DataType::I32, 0);
        let cond = a.push(StmtKind::Const(ConstValue::I32(cond_value)), DataType::I32);

        let c1 = a.push(StmtKind::Const(ConstValue::I32(1)), DataType::I32);
        let st1 = a.push(StmtKind::GlobalStore { ptr, data: c1 }, DataType::I32);
        let c2 = a.push(StmtKind::Const(ConstValue::I32(2)), DataType::I32);
        let st2 = a.push(StmtKind::GlobalStore { ptr, data: c2 }, DataType::I32);

        let iff = a.push(
            StmtKind::If {
                cond,
                then_body: Some(Block::new(vec![c1, st1])),
                else_body: Some(Block::new(vec![c2, st2])),
            },
            DataType::I32,
        );
        stmts.extend([cond, iff]);
        let off = a.push(
            StmtKind::Offloaded(OffloadedStmt::serial(Block::new(stmts))),
            DataType::I32,
        );
        Kernel::new("branch", a, Block::new(vec![off]))
    }

    #[test]
    fn if_lowers_to_a_proper_diamond() {
        let mut out = [0i32];
        unsafe { run_with_i32_out(&if_kernel(1), SNodeTree::new(), &mut out) };
        assert_eq!(out, [1]);

        let mut out = [0i32];
        unsafe { run_with_i32_out(&if_kernel(0), SNodeTree::new(), &mut out) };
        assert_eq!(out, [2]);
    }

    #[test]
    fn while_break_counts_to_ten() {
        let mut a = IrArena::new();
        let (mut stmts, ptr) = external_slot(&mut a, DataType::I32, 0);
        let i = a.push(StmtKind::Alloca, DataType::I32);

        let load = a.push(StmtKind::LocalLoad { ptr: i }, DataType::I32);
        let ten = a.push(StmtKind::Const(ConstValue::I32(10)), DataType::I32);
        let cmp = a.push(
            StmtKind::Binary {
                op: BinaryOp::CmpLt,
                lhs: load,
                rhs: ten,
            },
            DataType::I32,
        );
        let brk = a.push(StmtKind::WhileControl { cond: cmp }, DataType::I32);
        let load2 = a.push(StmtKind::LocalLoad { ptr: i }, DataType::I32);
        let one = a.push(StmtKind::Const(ConstValue::I32(1)), DataType::I32);
        let inc = a.push(
            StmtKind::Binary {
                op: BinaryOp::Add,
                lhs: load2,
                rhs: one,
            },
            DataType::I32,
        );
        let st_i = a.push(StmtKind::LocalStore { ptr: i, data: inc }, DataType::I32);
        let body = Block::new(vec![load, ten, cmp, brk, load2, one, inc, st_i]);

        let wh = a.push(StmtKind::While { body }, DataType::I32);
        let out_load = a.push(StmtKind::LocalLoad { ptr: i }, DataType::I32);
        let st = a.push(
            StmtKind::GlobalStore {
                ptr,
                data: out_load,
            },
            DataType::I32,
        );
        stmts.extend([i, wh, out_load, st]);
        let off = a.push(
            StmtKind::Offloaded(OffloadedStmt::serial(Block::new(stmts))),
            DataType::I32,
        );
        let kernel = Kernel::new("count", a, Block::new(vec![off]));

        let mut out = [0i32];
        unsafe { run_with_i32_out(&kernel, SNodeTree::new(), &mut out) };
        assert_eq!(out, [10]);
    }

    #[test]
    fn nested_range_for_uses_its_loop_variable() {
        let mut a = IrArena::new();
        let (mut stmts, ptr) = external_slot(&mut a, DataType::I32, 0);
        let loop_var = a.push(StmtKind::Alloca, DataType::I32);
        let begin = a.push(StmtKind::Const(ConstValue::I32(0)), DataType::I32);
        let end = a.push(StmtKind::Const(ConstValue::I32(10)), DataType::I32);

        let cur = a.push(StmtKind::GlobalLoad { ptr }, DataType::I32);
        let iv = a.push(StmtKind::LocalLoad { ptr: loop_var }, DataType::I32);
        let sum = a.push(
            StmtKind::Binary {
                op: BinaryOp::Add,
                lhs: cur,
                rhs: iv,
            },
            DataType::I32,
        );
        let st = a.push(StmtKind::GlobalStore { ptr, data: sum }, DataType::I32);
        let body = Block::new(vec![cur, iv, sum, st]);

        let range = a.push(
            StmtKind::RangeFor {
                loop_var,
                begin,
                end,
                reversed: false,
                body,
            },
            DataType::I32,
        );
        stmts.extend([loop_var, begin, end, range]);
        let off = a.push(
            StmtKind::Offloaded(OffloadedStmt::serial(Block::new(stmts))),
            DataType::I32,
        );
        let kernel = Kernel::new("nested", a, Block::new(vec![off]));

        let mut out = [0i32];
        unsafe { run_with_i32_out(&kernel, SNodeTree::new(), &mut out) };
        assert_eq!(out, [45]);
    }

    #[test]
    fn value_cast_truncates_toward_zero() {
        let mut a = IrArena::new();
        let (mut stmts, ptr) = external_slot(&mut a, DataType::I32, 0);
        let f = a.push(StmtKind::Const(ConstValue::F32(3.7)), DataType::F32);
        let c = a.push(
            StmtKind::Cast {
                operand: f,
                from: DataType::F32,
                to: DataType::I32,
                by_value: true,
            },
            DataType::I32,
        );
        let st = a.push(StmtKind::GlobalStore { ptr, data: c }, DataType::I32);
        stmts.extend([f, c, st]);
        let off = a.push(
            StmtKind::Offloaded(OffloadedStmt::serial(Block::new(stmts))),
            DataType::I32,
        );
        let kernel = Kernel::new("cast", a, Block::new(vec![off]));

        let mut out = [0i32];
        unsafe { run_with_i32_out(&kernel, SNodeTree::new(), &mut out) };
        assert_eq!(out, [3]);
    }

    #[test]
    fn bit_casts_round_trip() {
        let mut a = IrArena::new();
        let (mut stmts, ptr) = external_slot(&mut a, DataType::F32, 0);
        let f = a.push(StmtKind::Const(ConstValue::F32(1234.5)), DataType::F32);
        let as_int = a.push(
            StmtKind::Cast {
                operand: f,
                from: DataType::F32,
                to: DataType::I32,
                by_value: false,
            },
            DataType::I32,
        );
        let back = a.push(
            StmtKind::Cast {
                operand: as_int,
                from: DataType::I32,
                to: DataType::F32,
                by_value: false,
            },
            DataType::F32,
        );
        let st = a.push(StmtKind::GlobalStore { ptr, data: back }, DataType::F32);
        stmts.extend([f, as_int, back, st]);
        let off = a.push(
            StmtKind::Offloaded(OffloadedStmt::serial(Block::new(stmts))),
            DataType::I32,
        );
        let kernel = Kernel::new("bits", a, Block::new(vec![off]));

        let context = Context::create();
        let program = host_program(&context, SNodeTree::new());
        let compiled = compile_kernel(&program, &kernel).unwrap();
        let mut out = [0f32];
        let mut ctx = rt::Context::new();
        ctx.set_arg_ptr(0, out.as_mut_ptr() as *mut u8);
        unsafe { compiled.launch(&mut ctx) };
        assert_eq!(out, [1234.5]);
    }

    #[test]
    fn comparisons_sign_extend_to_i32() {
        let mut a = IrArena::new();
        let (mut stmts, ptr0) = external_slot(&mut a, DataType::I32, 0);
        let (more, ptr1) = external_slot(&mut a, DataType::I32, 1);
        stmts.extend(more);
        let one = a.push(StmtKind::Const(ConstValue::I32(1)), DataType::I32);
        let two = a.push(StmtKind::Const(ConstValue::I32(2)), DataType::I32);
        let lt = a.push(
            StmtKind::Binary {
                op: BinaryOp::CmpLt,
                lhs: one,
                rhs: two,
            },
            DataType::I32,
        );
        let gt = a.push(
            StmtKind::Binary {
                op: BinaryOp::CmpGt,
                lhs: one,
                rhs: two,
            },
            DataType::I32,
        );
        let st0 = a.push(StmtKind::GlobalStore { ptr: ptr0, data: lt }, DataType::I32);
        let st1 = a.push(StmtKind::GlobalStore { ptr: ptr1, data: gt }, DataType::I32);
        stmts.extend([one, two, lt, gt, st0, st1]);
        let off = a.push(
            StmtKind::Offloaded(OffloadedStmt::serial(Block::new(stmts))),
            DataType::I32,
        );
        let kernel = Kernel::new("cmp", a, Block::new(vec![off]));

        let mut out = [5i32, 5];
        unsafe { run_with_i32_out(&kernel, SNodeTree::new(), &mut out) };
        assert_eq!(out, [-1, 0]);
    }

    #[test]
    fn linearize_and_bit_extraction_identities() {
        let mut a = IrArena::new();
        let (mut stmts, ptr0) = external_slot(&mut a, DataType::I32, 0);
        let (more, ptr1) = external_slot(&mut a, DataType::I32, 1);
        stmts.extend(more);

        let c = a.push(StmtKind::Const(ConstValue::I32(42)), DataType::I32);
        let lin = a.push(
            StmtKind::Linearize {
                inputs: vec![c],
                strides: vec![1],
            },
            DataType::I32,
        );
        let st0 = a.push(StmtKind::GlobalStore { ptr: ptr0, data: lin }, DataType::I32);

        let x = a.push(StmtKind::Const(ConstValue::I32(0x1234_5678)), DataType::I32);
        let bits = a.push(
            StmtKind::OffsetAndExtractBits {
                input: x,
                offset: 0,
                bit_begin: 0,
                bit_end: 32,
            },
            DataType::I32,
        );
        let st1 = a.push(StmtKind::GlobalStore { ptr: ptr1, data: bits }, DataType::I32);
        stmts.extend([c, lin, st0, x, bits, st1]);
        let off = a.push(
            StmtKind::Offloaded(OffloadedStmt::serial(Block::new(stmts))),
            DataType::I32,
        );
        let kernel = Kernel::new("ident", a, Block::new(vec![off]));

        let mut out = [0i32, 0];
        unsafe { run_with_i32_out(&kernel, SNodeTree::new(), &mut out) };
        assert_eq!(out, [42, 0x1234_5678]);
    }

    #[test]
    fn float_atomic_add_accumulates() {
        let mut a = IrArena::new();
        let (mut stmts, ptr) = external_slot(&mut a, DataType::F32, 0);
        let v = a.push(StmtKind::Const(ConstValue::F32(1.5)), DataType::F32);
        let atomic = a.push(
            StmtKind::AtomicOp {
                op: AtomicOp::Add,
                dest: ptr,
                val: v,
            },
            DataType::F32,
        );
        stmts.extend([v, atomic]);
        let off = a.push(
            StmtKind::Offloaded(OffloadedStmt::range_for(0, 4, Block::new(stmts))),
            DataType::I32,
        );
        let kernel = Kernel::new("acc", a, Block::new(vec![off]));

        let context = Context::create();
        let program = host_program(&context, SNodeTree::new());
        let compiled = compile_kernel(&program, &kernel).unwrap();
        let mut out = [0f32];
        let mut ctx = rt::Context::new();
        ctx.set_arg_ptr(0, out.as_mut_ptr() as *mut u8);
        unsafe { compiled.launch(&mut ctx) };
        assert_eq!(out, [6.0]);
    }

    #[test]
    fn scalar_arg_loads_decode_the_slot() {
        let mut a = IrArena::new();
        let (mut stmts, ptr) = external_slot(&mut a, DataType::I32, 0);
        let arg = a.push(
            StmtKind::ArgLoad {
                arg_id: 1,
                is_ptr: false,
            },
            DataType::I32,
        );
        let st = a.push(StmtKind::GlobalStore { ptr, data: arg }, DataType::I32);
        stmts.extend([arg, st]);
        let off = a.push(
            StmtKind::Offloaded(OffloadedStmt::serial(Block::new(stmts))),
            DataType::I32,
        );
        let kernel = Kernel::new("args", a, Block::new(vec![off]));

        let context = Context::create();
        let program = host_program(&context, SNodeTree::new());
        let compiled = compile_kernel(&program, &kernel).unwrap();
        let mut out = [0i32];
        let mut ctx = rt::Context::new();
        ctx.set_arg_ptr(0, out.as_mut_ptr() as *mut u8);
        ctx.set_arg_i32(1, -31415);
        unsafe { compiled.launch(&mut ctx) };
        assert_eq!(out, [-31415]);
    }

    #[test]
    fn select_picks_by_condition() {
        let mut a = IrArena::new();
        let (mut stmts, ptr) = external_slot(&mut a, DataType::I32, 0);
        let cond = a.push(StmtKind::Const(ConstValue::I32(1)), DataType::I32);
        let x = a.push(StmtKind::Const(ConstValue::I32(11)), DataType::I32);
        let y = a.push(StmtKind::Const(ConstValue::I32(22)), DataType::I32);
        let sel = a.push(
            StmtKind::Select {
                cond,
                then_val: x,
                else_val: y,
            },
            DataType::I32,
        );
        let st = a.push(StmtKind::GlobalStore { ptr, data: sel }, DataType::I32);
        stmts.extend([cond, x, y, sel, st]);
        let off = a.push(
            StmtKind::Offloaded(OffloadedStmt::serial(Block::new(stmts))),
            DataType::I32,
        );
        let kernel = Kernel::new("select", a, Block::new(vec![off]));

        let mut out = [0i32];
        unsafe { run_with_i32_out(&kernel, SNodeTree::new(), &mut out) };
        assert_eq!(out, [11]);
    }

    fn dense_tree() -> SNodeTree {
        let mut tree = SNodeTree::new();
        let root = tree.root_id();
        let dense = tree.dense(root, &[4]);
        tree.place(dense, DataType::F32);
        tree
    }

    /// Listgen over root->dense, then a struct-for writing 1.0 at every
    /// visited cell.
    fn listgen_struct_for_kernel() -> Kernel {
        use crate::snode::SNodeId;
        let root = SNodeId(0);
        let dense = SNodeId(1);
        let place = SNodeId(2);

        let mut a = IrArena::new();
        let listgen = a.push(
            StmtKind::Offloaded(OffloadedStmt::listgen(dense)),
            DataType::I32,
        );

        let c = a.push(
            StmtKind::LoopIndex {
                index: 0,
                is_struct_for: true,
            },
            DataType::I32,
        );
        let root_idx = a.push(
            StmtKind::OffsetAndExtractBits {
                input: c,
                offset: 0,
                bit_begin: 4,
                bit_end: 32,
            },
            DataType::I32,
        );
        let root_ptr = a.push(
            StmtKind::SNodeLookup {
                snode: root,
                input_snode: None,
                input_index: root_idx,
                activate: false,
            },
            DataType::I32,
        );
        let dense_node = a.push(
            StmtKind::GetCh {
                input_ptr: root_ptr,
                input_snode: root,
                output_snode: dense,
                chid: 0,
            },
            DataType::I32,
        );
        let dense_idx = a.push(
            StmtKind::OffsetAndExtractBits {
                input: c,
                offset: 0,
                bit_begin: 0,
                bit_end: 4,
            },
            DataType::I32,
        );
        let cell = a.push(
            StmtKind::SNodeLookup {
                snode: dense,
                input_snode: Some(dense_node),
                input_index: dense_idx,
                activate: false,
            },
            DataType::I32,
        );
        let value_ptr = a.push(
            StmtKind::GetCh {
                input_ptr: cell,
                input_snode: dense,
                output_snode: place,
                chid: 0,
            },
            DataType::F32,
        );
        let one = a.push(StmtKind::Const(ConstValue::F32(1.0)), DataType::F32);
        let st = a.push(
            StmtKind::GlobalStore {
                ptr: value_ptr,
                data: one,
            },
            DataType::F32,
        );
        let body = Block::new(vec![
            c, root_idx, root_ptr, dense_node, dense_idx, cell, value_ptr, one, st,
        ]);
        let struct_for = a.push(
            StmtKind::Offloaded(OffloadedStmt::struct_for(place, 4, body)),
            DataType::I32,
        );

        Kernel::new("fill", a, Block::new(vec![listgen, struct_for]))
    }

    #[test]
    fn struct_for_visits_every_dense_cell() {
        let tree = dense_tree();
        let kernel = listgen_struct_for_kernel();

        let context = Context::create();
        let program = host_program(&context, tree);
        let compiled = compile_kernel(&program, &kernel).unwrap();

        let size = program.root_buffer_size().unwrap() as usize;
        assert_eq!(size, 64);
        let mut buffer = vec![0u8; size];
        let mut runtime = rt::Runtime::new(program.snodes.len());
        runtime.seed_root_list(0, buffer.as_mut_ptr());

        let mut ctx = rt::Context::new();
        ctx.set_buffer(buffer.as_mut_ptr());
        ctx.set_runtime(&mut runtime);
        unsafe { compiled.launch(&mut ctx) };

        let cells: Vec<f32> = buffer
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(cells, vec![1.0f32; 16]);

        // Listgen recorded one entry per dense cell, with its coordinate.
        assert_eq!(runtime.list(1).len(), 16);
        assert_eq!(runtime.list(1)[5].pcoord.val[0], 5);
    }

    #[test]
    fn struct_for_on_fresh_structure_visits_nothing() {
        let tree = dense_tree();
        let kernel = listgen_struct_for_kernel();

        let context = Context::create();
        let program = host_program(&context, tree);
        let compiled = compile_kernel(&program, &kernel).unwrap();

        let size = program.root_buffer_size().unwrap() as usize;
        let mut buffer = vec![0u8; size];
        // No root seeding: every list stays empty.
        let mut runtime = rt::Runtime::new(program.snodes.len());

        let mut ctx = rt::Context::new();
        ctx.set_buffer(buffer.as_mut_ptr());
        ctx.set_runtime(&mut runtime);
        unsafe { compiled.launch(&mut ctx) };

        assert!(buffer.iter().all(|&b| b == 0));
        assert!(runtime.list(1).is_empty());
    }

    #[test]
    fn print_lowers_to_printf() {
        let mut a = IrArena::new();
        let v = a.push(StmtKind::Const(ConstValue::I32(5)), DataType::I32);
        let p = a.push(
            StmtKind::Print {
                value: v,
                label: "x".to_string(),
            },
            DataType::I32,
        );
        let off = a.push(
            StmtKind::Offloaded(OffloadedStmt::serial(Block::new(vec![v, p]))),
            DataType::I32,
        );
        let kernel = Kernel::new("dbg", a, Block::new(vec![off]));

        let context = Context::create();
        let program = host_program(&context, SNodeTree::new());
        let mut gen = CodeGenLlvm::new(&program, &kernel).unwrap();
        gen.emit_to_module().unwrap();
        let ir = gen.print_ir();
        assert!(ir.contains("printf"));
        assert!(ir.contains("[debug] x = %d"));
    }

    #[test]
    fn unsupported_statements_are_rejected() {
        for (kind, needle) in [
            (StmtKind::Rand, "rand"),
            (StmtKind::ElementShuffle, "element_shuffle"),
        ] {
            let mut a = IrArena::new();
            let s = a.push(kind, DataType::F32);
            let off = a.push(
                StmtKind::Offloaded(OffloadedStmt::serial(Block::new(vec![s]))),
                DataType::I32,
            );
            let kernel = Kernel::new("bad", a, Block::new(vec![off]));

            let context = Context::create();
            let program = host_program(&context, SNodeTree::new());
            let mut gen = CodeGenLlvm::new(&program, &kernel).unwrap();
            let err = gen.emit_to_module().unwrap_err();
            assert!(err.to_string().contains(needle), "{err}");
        }
    }

    #[test]
    fn masked_atomics_are_an_explicit_error() {
        let mut a = IrArena::new();
        let (mut stmts, ptr) = external_slot(&mut a, DataType::I32, 0);
        let mask = a.push(StmtKind::Const(ConstValue::I32(1)), DataType::I32);
        let v = a.push(StmtKind::Const(ConstValue::I32(1)), DataType::I32);
        let atomic = a.push(
            StmtKind::AtomicOp {
                op: AtomicOp::Add,
                dest: ptr,
                val: v,
            },
            DataType::I32,
        );
        stmts.extend([mask, v, atomic]);
        let mut body = Block::new(stmts);
        body.mask = Some(mask);
        let off = a.push(
            StmtKind::Offloaded(OffloadedStmt::serial(body)),
            DataType::I32,
        );
        let kernel = Kernel::new("masked", a, Block::new(vec![off]));

        let context = Context::create();
        let program = host_program(&context, SNodeTree::new());
        let mut gen = CodeGenLlvm::new(&program, &kernel).unwrap();
        let err = gen.emit_to_module().unwrap_err();
        assert!(err.to_string().contains("masked atomics"));
    }

    #[test]
    fn atomic_sub_is_unsupported() {
        let mut a = IrArena::new();
        let (mut stmts, ptr) = external_slot(&mut a, DataType::I32, 0);
        let v = a.push(StmtKind::Const(ConstValue::I32(1)), DataType::I32);
        let atomic = a.push(
            StmtKind::AtomicOp {
                op: AtomicOp::Sub,
                dest: ptr,
                val: v,
            },
            DataType::I32,
        );
        stmts.extend([v, atomic]);
        let off = a.push(
            StmtKind::Offloaded(OffloadedStmt::serial(Block::new(stmts))),
            DataType::I32,
        );
        let kernel = Kernel::new("sub", a, Block::new(vec![off]));

        let context = Context::create();
        let program = host_program(&context, SNodeTree::new());
        let mut gen = CodeGenLlvm::new(&program, &kernel).unwrap();
        let err = gen.emit_to_module().unwrap_err();
        assert!(matches!(err, CodegenError::UnsupportedOp { .. }), "{err}");
    }

    #[test]
    fn unsupported_cast_pairs_fail() {
        let mut a = IrArena::new();
        let f = a.push(StmtKind::Const(ConstValue::F32(1.0)), DataType::F32);
        let c = a.push(
            StmtKind::Cast {
                operand: f,
                from: DataType::F64,
                to: DataType::I64,
                by_value: true,
            },
            DataType::I64,
        );
        let off = a.push(
            StmtKind::Offloaded(OffloadedStmt::serial(Block::new(vec![f, c]))),
            DataType::I32,
        );
        let kernel = Kernel::new("badcast", a, Block::new(vec![off]));

        let context = Context::create();
        let program = host_program(&context, SNodeTree::new());
        let mut gen = CodeGenLlvm::new(&program, &kernel).unwrap();
        let err = gen.emit_to_module().unwrap_err();
        assert!(matches!(err, CodegenError::UnsupportedCast { .. }), "{err}");
    }

    #[test]
    fn extra_unaries_call_runtime_helpers() {
        let mut a = IrArena::new();
        let (mut stmts, ptr) = external_slot(&mut a, DataType::F32, 0);
        let x = a.push(StmtKind::Const(ConstValue::F32(-2.5)), DataType::F32);
        let abs = a.push(
            StmtKind::Unary {
                op: UnaryOp::Abs,
                operand: x,
            },
            DataType::F32,
        );
        let st = a.push(StmtKind::GlobalStore { ptr, data: abs }, DataType::F32);
        stmts.extend([x, abs, st]);
        let off = a.push(
            StmtKind::Offloaded(OffloadedStmt::serial(Block::new(stmts))),
            DataType::I32,
        );
        let kernel = Kernel::new("abs", a, Block::new(vec![off]));

        let context = Context::create();
        let program = host_program(&context, SNodeTree::new());
        let compiled = compile_kernel(&program, &kernel).unwrap();
        let mut out = [0f32];
        let mut ctx = rt::Context::new();
        ctx.set_arg_ptr(0, out.as_mut_ptr() as *mut u8);
        unsafe { compiled.launch(&mut ctx) };
        assert_eq!(out, [2.5]);
    }

    #[test]
    fn int_max_min_use_runtime_helpers() {
        let mut a = IrArena::new();
        let (mut stmts, ptr0) = external_slot(&mut a, DataType::I32, 0);
        let (more, ptr1) = external_slot(&mut a, DataType::I32, 1);
        stmts.extend(more);
        let x = a.push(StmtKind::Const(ConstValue::I32(-3)), DataType::I32);
        let y = a.push(StmtKind::Const(ConstValue::I32(9)), DataType::I32);
        let mx = a.push(
            StmtKind::Binary {
                op: BinaryOp::Max,
                lhs: x,
                rhs: y,
            },
            DataType::I32,
        );
        let mn = a.push(
            StmtKind::Binary {
                op: BinaryOp::Min,
                lhs: x,
                rhs: y,
            },
            DataType::I32,
        );
        let st0 = a.push(StmtKind::GlobalStore { ptr: ptr0, data: mx }, DataType::I32);
        let st1 = a.push(StmtKind::GlobalStore { ptr: ptr1, data: mn }, DataType::I32);
        stmts.extend([x, y, mx, mn, st0, st1]);
        let off = a.push(
            StmtKind::Offloaded(OffloadedStmt::serial(Block::new(stmts))),
            DataType::I32,
        );
        let kernel = Kernel::new("minmax", a, Block::new(vec![off]));

        let mut out = [0i32, 0];
        unsafe { run_with_i32_out(&kernel, SNodeTree::new(), &mut out) };
        assert_eq!(out, [9, -3]);
    }
}
