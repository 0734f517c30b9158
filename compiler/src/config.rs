//! Compilation configuration
//!
//! Recognized on the owning [`Program`](crate::codegen::llvm::Program); each
//! codegen instance reads it but never mutates it.

use serde::{Deserialize, Serialize};

/// Target architecture for a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Arch {
    /// Direct JIT to the host CPU.
    #[default]
    Host,
    /// PTX/SPMD lowering launched through the device runtime.
    Gpu,
}

/// Program-wide compilation options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileConfig {
    /// Selects the runtime module and backend.
    pub arch: Arch,
    /// Dump each task's module IR after emission.
    pub print_kernel_llvm_ir: bool,
    /// Reserved; current behavior is scalar loads.
    pub attempt_vectorized_load_cpu: bool,
    /// Block dimension used when an offload's `block_size` is zero.
    pub default_gpu_block_size: i32,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            arch: Arch::Host,
            print_kernel_llvm_ir: false,
            attempt_vectorized_load_cpu: false,
            default_gpu_block_size: 256,
        }
    }
}

impl CompileConfig {
    pub fn with_arch(arch: Arch) -> Self {
        Self {
            arch,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = CompileConfig::default();
        assert_eq!(config.arch, Arch::Host);
        assert_eq!(config.default_gpu_block_size, 256);
        assert!(!config.print_kernel_llvm_ir);
    }
}
