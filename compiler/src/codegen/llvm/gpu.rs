//! GPU lowering overrides and device assembly
//!
//! The statement visitor in `codegen` routes here wherever GPU semantics
//! differ from the host: libdevice unaries, NVVM atomics, `vprintf`
//! packing, and the SPMD shapes of offloaded loops. Assembly compiles the
//! module to PTX and resolves each task's device function through the
//! device runtime.
//!
//! # NVVM IR
//!
//! Kernel entry points carry the `nvvm.annotations` `{fn, "kernel", 1}`
//! metadata so the PTX compiler treats them as `__global__` functions.
//!
//! - NVVM IR Spec: <https://docs.nvidia.com/cuda/nvvm-ir-spec/>

use inkwell::targets::{FileType, TargetTriple};
use inkwell::types::FunctionType;
use inkwell::values::{BasicValueEnum, FunctionValue, IntValue, PointerValue};
use inkwell::{AtomicOrdering, AtomicRMWBinOp};

use crate::error::{CodegenError, CodegenResult};
use crate::ir::{OffloadedStmt, StmtId, UnaryOp};
use crate::types::DataType;

use super::codegen::CodeGenLlvm;
use super::target::{self, GpuTargetConfig};

/// Device properties that shape struct-for launches.
#[derive(Debug, Clone, Copy)]
pub struct DeviceProps {
    pub num_multiprocessors: u32,
    pub max_block_dim_x: u32,
}

impl Default for DeviceProps {
    fn default() -> Self {
        Self {
            num_multiprocessors: 16,
            max_block_dim_x: 1024,
        }
    }
}

impl<'p, 'ctx> CodeGenLlvm<'p, 'ctx> {
    fn get_or_declare_function(
        &self,
        name: &str,
        fn_ty: FunctionType<'ctx>,
    ) -> FunctionValue<'ctx> {
        self.module
            .get_function(name)
            .unwrap_or_else(|| self.module.add_function(name, fn_ty, None))
    }

    /// Read a PTX special register via `llvm.nvvm.read.ptx.sreg.{reg}`.
    pub(crate) fn read_sreg(&self, reg: &str) -> CodegenResult<IntValue<'ctx>> {
        let i32t = self.program.context.i32_type();
        let func = self.get_or_declare_function(
            &format!("llvm.nvvm.read.ptx.sreg.{reg}"),
            i32t.fn_type(&[], false),
        );
        Ok(self
            .create_call_fn(func, &[])?
            .expect("sreg intrinsics return i32")
            .into_int_value())
    }

    /// Annotate `func` as a CUDA kernel entry point.
    pub(crate) fn mark_function_as_gpu_kernel(&self, func: FunctionValue<'ctx>) {
        let context = self.program.context;
        let md = context.metadata_node(&[
            func.as_global_value().as_pointer_value().into(),
            context.metadata_string("kernel").into(),
            context.i32_type().const_int(1, false).into(),
        ]);
        let _ = self.module.add_global_metadata("nvvm.annotations", &md);
    }

    /// Scalar unaries routed to libdevice.
    pub(crate) fn emit_extra_unary_gpu(
        &self,
        op: UnaryOp,
        input: BasicValueEnum<'ctx>,
        dt: DataType,
    ) -> CodegenResult<BasicValueEnum<'ctx>> {
        let name = match op {
            UnaryOp::Abs => match dt {
                DataType::F32 => "__nv_fabsf".to_string(),
                DataType::F64 => "__nv_fabs".to_string(),
                DataType::I32 => "__nv_abs".to_string(),
                other => return Err(CodegenError::unsupported(op.name(), other)),
            },
            UnaryOp::LogicNot => match dt {
                DataType::I32 => "logic_not_i32".to_string(),
                other => return Err(CodegenError::unsupported(op.name(), other)),
            },
            UnaryOp::Exp | UnaryOp::Log | UnaryOp::Tan | UnaryOp::Tanh | UnaryOp::Sgn => match dt {
                DataType::F32 => format!("__nv_{}f", op.name()),
                DataType::F64 => format!("__nv_{}", op.name()),
                DataType::I32 => op.name().to_string(),
                other => return Err(CodegenError::unsupported(op.name(), other)),
            },
            other => return Err(CodegenError::unsupported(other.name(), dt)),
        };
        Ok(self
            .create_call(&name, &[input.into()])?
            .expect("libdevice unaries return a value"))
    }

    /// Float atomic adds use the NVVM load-add intrinsics; integers share
    /// the host's RMW lowering.
    pub(crate) fn emit_atomic_add_gpu(
        &self,
        dest: PointerValue<'ctx>,
        value: BasicValueEnum<'ctx>,
        dt: DataType,
    ) -> CodegenResult<()> {
        if dt.is_integral() {
            self.builder.build_atomicrmw(
                AtomicRMWBinOp::Add,
                dest,
                value.into_int_value(),
                AtomicOrdering::SequentiallyConsistent,
            )?;
            return Ok(());
        }
        let ptr = self.program.context.ptr_type(Default::default());
        let (name, float_ty) = match dt {
            DataType::F32 => (
                "llvm.nvvm.atomic.load.add.f32.p0",
                self.program.context.f32_type(),
            ),
            DataType::F64 => (
                "llvm.nvvm.atomic.load.add.f64.p0",
                self.program.context.f64_type(),
            ),
            other => return Err(CodegenError::unsupported("atomic_add", other)),
        };
        let func = self.get_or_declare_function(
            name,
            float_ty.fn_type(&[ptr.into(), float_ty.into()], false),
        );
        self.create_call_fn(func, &[dest.into(), value.into()])?;
        Ok(())
    }

    /// `vprintf(fmt, packed_args)`: the value travels in a one-field struct.
    pub(crate) fn emit_print_gpu(
        &mut self,
        id: StmtId,
        value: StmtId,
        label: &str,
    ) -> CodegenResult<()> {
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
            DataType::F64 => "%f",
            other => return Err(CodegenError::unsupported("print", other)),
        };

        let packed_ty = self.program.context.struct_type(&[v.get_type()], false);
        let packed = self.create_entry_block_alloca(packed_ty.into())?;
        let slot = self.builder.build_struct_gep(packed_ty, packed, 0, "arg")?;
        self.builder.build_store(slot, v)?;

        let fmt = self.global_string(&format!("[debug] {label} = {format}\n"))?;
        let result = self.create_call("vprintf", &[fmt.into(), packed.into()])?;
        if let Some(result) = result {
            self.set_value(id, result);
        }
        Ok(())
    }

    /// Flat SPMD range-for: one guarded index per thread.
    pub(crate) fn create_gpu_offload_range_for(
        &mut self,
        stmt: &OffloadedStmt,
    ) -> CodegenResult<()> {
        let context = self.program.context;
        let i32t = context.i32_type();
        let func = self.current_func()?;

        let loop_var = self.create_entry_block_alloca(i32t.into())?;
        self.offload_loop_vars.push(loop_var);

        let block_dim = if stmt.block_size == 0 {
            self.program.config.default_gpu_block_size
        } else {
            stmt.block_size
        };
        let extent = (stmt.end - stmt.begin).max(0);
        self.grid_dim = (((extent + block_dim - 1) / block_dim).max(1)) as u32;
        self.block_dim = block_dim as u32;

        let body_bb = context.append_basic_block(func, "loop_body");
        let after_bb = context.append_basic_block(func, "block");

        let thread_idx = self.read_sreg("tid.x")?;
        let block_idx = self.read_sreg("ctaid.x")?;
        let block_dim_x = self.read_sreg("ntid.x")?;

        let within_block = self
            .builder
            .build_int_mul(block_idx, block_dim_x, "block_base")?;
        let flat = self.builder.build_int_add(thread_idx, within_block, "flat")?;
        let loop_id = self
            .builder
            .build_int_add(self.types.const_i32(stmt.begin), flat, "loop_id")?;
        self.builder.build_store(loop_var, loop_id)?;

        // Out-of-range threads exit immediately.
        let cur = self
            .builder
            .build_load(i32t, loop_var, "i")?
            .into_int_value();
        let cond = self.builder.build_int_compare(
            inkwell::IntPredicate::SLT,
            cur,
            self.types.const_i32(stmt.end),
            "in_range",
        )?;
        self.builder
            .build_conditional_branch(cond, body_bb, after_bb)?;

        self.builder.position_at_end(body_bb);
        let body = stmt
            .body
            .as_ref()
            .ok_or_else(|| CodegenError::invariant("Offloaded", "range-for task without a body"))?
            .clone();
        self.visit_block(&body)?;
        self.builder.build_unconditional_branch(after_bb)?;

        self.builder.position_at_end(after_bb);
        Ok(())
    }

    /// Two-level struct-for: CUDA blocks iterate leaf blocks via
    /// `for_each_block`; threads stride a leaf block's cells by
    /// `blockDim.x`.
    pub(crate) fn create_gpu_offload_struct_for(
        &mut self,
        stmt: &OffloadedStmt,
    ) -> CodegenResult<()> {
        let place_id = stmt.snode.ok_or_else(|| {
            CodegenError::invariant("Offloaded", "struct-for task without a target snode")
        })?;
        let leaf_id = self
            .program
            .snodes
            .node(place_id)
            .parent
            .ok_or_else(|| CodegenError::invariant("Offloaded", "struct-for over a parentless snode"))?;
        let leaf_cap = self.program.snodes.node(leaf_id).max_num_elements();

        self.grid_dim = 32 * self.device_props.num_multiprocessors;
        let mut block_dim = if stmt.block_size == 0 {
            self.device_props.max_block_dim_x as i32
        } else {
            stmt.block_size
        };
        block_dim = block_dim.min(leaf_cap);
        self.block_dim = block_dim as u32;

        self.create_offload_struct_for(stmt, block_dim, true)
    }

    /// Compile the finished module to PTX assembly.
    pub fn compile_to_ptx(&self, config: &GpuTargetConfig) -> CodegenResult<String> {
        self.module
            .set_triple(&TargetTriple::create(target::NVPTX64));
        let target_machine = config.create_target_machine()?;
        self.module
            .set_data_layout(&target_machine.get_target_data().get_data_layout());

        let buffer = target_machine
            .write_to_memory_buffer(&self.module, FileType::Assembly)
            .map_err(|e| CodegenError::Llvm(format!("failed to compile to PTX: {e}")))?;

        String::from_utf8(buffer.as_slice().to_vec())
            .map_err(|e| CodegenError::Llvm(format!("invalid UTF-8 in PTX: {e}")))
    }
}

// ============================================================================
// Device assembly (cudarc)
// ============================================================================

#[cfg(feature = "cuda")]
pub use cuda::GpuKernel;

#[cfg(feature = "cuda")]
mod cuda {
    use std::sync::Arc;

    use cudarc::driver::sys::CUdevice_attribute;
    use cudarc::driver::{CudaDevice, CudaFunction, LaunchAsync, LaunchConfig};
    use cudarc::nvrtc::Ptx;

    use super::super::codegen::CodeGenLlvm;
    use super::super::target::GpuTargetConfig;
    use super::DeviceProps;
    use crate::error::{CodegenError, CodegenResult};

    impl DeviceProps {
        /// Query launch-shaping attributes from a device.
        pub fn query(device: &Arc<CudaDevice>) -> CodegenResult<Self> {
            let sms = device
                .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)
                .map_err(|e| CodegenError::BackendUnavailable(e.to_string()))?;
            let max_x = device
                .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_X)
                .map_err(|e| CodegenError::BackendUnavailable(e.to_string()))?;
            Ok(Self {
                num_multiprocessors: sms as u32,
                max_block_dim_x: max_x as u32,
            })
        }
    }

    struct GpuTask {
        name: String,
        func: CudaFunction,
        grid_dim: u32,
        block_dim: u32,
    }

    /// A device-compiled kernel: launches its tasks in emission order.
    pub struct GpuKernel {
        device: Arc<CudaDevice>,
        tasks: Vec<GpuTask>,
    }

    impl GpuKernel {
        pub fn task_names(&self) -> Vec<&str> {
            self.tasks.iter().map(|t| t.name.as_str()).collect()
        }

        /// Copy the context to the device and launch every task in order.
        ///
        /// Pointers inside the context (buffer, runtime) must already be
        /// device-visible.
        pub fn launch(&self, ctx: &trellis_runtime::Context) -> CodegenResult<()> {
            let bytes = unsafe {
                std::slice::from_raw_parts(
                    (ctx as *const trellis_runtime::Context).cast::<u8>(),
                    std::mem::size_of::<trellis_runtime::Context>(),
                )
            }
            .to_vec();
            let dev_ctx = self
                .device
                .htod_copy(bytes)
                .map_err(|e| CodegenError::BackendUnavailable(e.to_string()))?;

            for task in &self.tasks {
                let config = LaunchConfig {
                    grid_dim: (task.grid_dim, 1, 1),
                    block_dim: (task.block_dim, 1, 1),
                    shared_mem_bytes: 0,
                };
                unsafe { task.func.clone().launch(config, (&dev_ctx,)) }
                    .map_err(|e| CodegenError::BackendUnavailable(e.to_string()))?;
            }
            self.device
                .synchronize()
                .map_err(|e| CodegenError::BackendUnavailable(e.to_string()))?;
            Ok(())
        }
    }

    impl<'p, 'ctx> CodeGenLlvm<'p, 'ctx> {
        /// Compile the module to PTX, load it through the device runtime,
        /// and resolve each task's device function. Consumes the generator.
        pub fn compile_module_to_gpu_executable(
            self,
            device: &Arc<CudaDevice>,
            config: &GpuTargetConfig,
        ) -> CodegenResult<GpuKernel> {
            let ptx = self.compile_to_ptx(config)?;
            let module_name = self.kernel_name.clone();

            let names: Vec<&'static str> = self
                .tasks
                .iter()
                .map(|t| Box::leak(t.name.clone().into_boxed_str()) as &'static str)
                .collect();
            device
                .load_ptx(Ptx::from_src(ptx), &module_name, &names)
                .map_err(|e| CodegenError::BackendUnavailable(format!("PTX load failed: {e}")))?;

            let mut tasks = Vec::with_capacity(self.tasks.len());
            for task in &self.tasks {
                let func = device.get_func(&module_name, &task.name).ok_or_else(|| {
                    CodegenError::BackendUnavailable(format!(
                        "device function {} not found",
                        task.name
                    ))
                })?;
                tasks.push(GpuTask {
                    name: task.name.clone(),
                    func,
                    grid_dim: task.grid_dim,
                    block_dim: task.block_dim,
                });
            }

            Ok(GpuKernel {
                device: device.clone(),
                tasks,
            })
        }
    }
}
