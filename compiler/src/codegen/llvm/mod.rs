//! LLVM Backend for Trellis
//!
//! Translates offloaded kernel IR to LLVM IR, one function per task.
//!
//! # Architecture
//!
//! ```text
//! Kernel IR → CodeGenLlvm → LLVM IR ─┬→ JIT → host task pointers
//!                  │                 └→ PTX → device module → launches
//!                  ├── runtime prototype module (cloned per kernel)
//!                  ├── SNode struct types + per-node accessors
//!                  └── SNode meta descriptors at lookup sites
//! ```
//!
//! # References
//!
//! - LLVM Language Reference: <https://llvm.org/docs/LangRef.html>
//! - NVVM IR Spec: <https://docs.nvidia.com/cuda/nvvm-ir-spec/>

#[cfg(feature = "llvm")]
pub mod codegen;
#[cfg(feature = "llvm")]
pub mod gpu;
#[cfg(feature = "llvm")]
pub mod program;
#[cfg(feature = "llvm")]
pub mod runtime;
#[cfg(feature = "llvm")]
pub mod structs;
#[cfg(feature = "llvm")]
pub mod target;
#[cfg(feature = "llvm")]
pub mod types;

#[cfg(feature = "llvm")]
pub use codegen::{compile_kernel, CodeGenLlvm, HostKernel, OffloadedTask};
#[cfg(feature = "llvm")]
pub use gpu::DeviceProps;
#[cfg(feature = "cuda")]
pub use gpu::GpuKernel;
#[cfg(feature = "llvm")]
pub use program::Program;
#[cfg(feature = "llvm")]
pub use target::GpuTargetConfig;

// Stub implementation when LLVM is not available
#[cfg(not(feature = "llvm"))]
pub mod stub {
    use crate::error::{CodegenError, CodegenResult};
    use crate::ir::Kernel;

    /// LLVM codegen stub when the feature is disabled
    pub struct CodeGenLlvm;

    impl CodeGenLlvm {
        pub fn compile(_kernel: &Kernel) -> CodegenResult<()> {
            Err(CodegenError::BackendUnavailable(
                "LLVM backend not enabled. Rebuild with: cargo build --features llvm".to_string(),
            ))
        }
    }
}

#[cfg(not(feature = "llvm"))]
pub use stub::*;
