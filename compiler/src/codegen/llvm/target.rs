//! Target machine configuration
//!
//! Two targets matter to this core: the native host (JIT) and NVPTX (PTX
//! emission for the device runtime).

use inkwell::targets::{
    CodeModel, InitializationConfig, RelocMode, Target, TargetMachine, TargetTriple,
};
use inkwell::OptimizationLevel;

use crate::error::{CodegenError, CodegenResult};

/// NVIDIA PTX 64-bit target triple.
pub const NVPTX64: &str = "nvptx64-nvidia-cuda";

/// Initialize the native target. Idempotent.
pub fn initialize_native_target() -> CodegenResult<()> {
    Target::initialize_native(&InitializationConfig::default())
        .map_err(|e| CodegenError::Llvm(format!("failed to initialize native target: {e}")))
}

/// Initialize the NVPTX target. Idempotent.
pub fn initialize_nvptx_target() {
    Target::initialize_nvptx(&InitializationConfig::default());
}

/// Create a target machine for the host, used for its data layout and by the
/// JIT.
pub fn host_target_machine() -> CodegenResult<TargetMachine> {
    initialize_native_target()?;
    let triple = TargetMachine::get_default_triple();
    let target = Target::from_triple(&triple)
        .map_err(|e| CodegenError::Llvm(format!("invalid host triple: {e}")))?;
    target
        .create_target_machine(
            &triple,
            "generic",
            "",
            OptimizationLevel::Default,
            RelocMode::Default,
            CodeModel::JITDefault,
        )
        .ok_or_else(|| CodegenError::Llvm("failed to create host target machine".to_string()))
}

/// GPU target configuration.
#[derive(Debug, Clone)]
pub struct GpuTargetConfig {
    /// Target triple
    pub triple: String,
    /// GPU architecture, e.g. "sm_75"
    pub arch: String,
    /// Additional features, e.g. "+ptx75"
    pub features: String,
}

impl GpuTargetConfig {
    /// Create an NVIDIA CUDA target config.
    pub fn cuda(compute_capability: (u32, u32)) -> Self {
        Self {
            triple: NVPTX64.to_string(),
            arch: format!("sm_{}{}", compute_capability.0, compute_capability.1),
            features: "+ptx75".to_string(),
        }
    }

    /// Turing-class default.
    pub fn sm_75() -> Self {
        Self::cuda((7, 5))
    }

    /// Create a target machine for this GPU config.
    pub fn create_target_machine(&self) -> CodegenResult<TargetMachine> {
        initialize_nvptx_target();

        let triple = TargetTriple::create(&self.triple);
        let target = Target::from_triple(&triple)
            .map_err(|e| CodegenError::Llvm(format!("invalid GPU target: {e}")))?;

        target
            .create_target_machine(
                &triple,
                &self.arch,
                &self.features,
                OptimizationLevel::Default,
                RelocMode::Default,
                CodeModel::Default,
            )
            .ok_or_else(|| {
                CodegenError::Llvm(format!(
                    "failed to create GPU target machine for {}",
                    self.arch
                ))
            })
    }
}

impl Default for GpuTargetConfig {
    fn default() -> Self {
        Self::sm_75()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_config_arch_strings() {
        let sm75 = GpuTargetConfig::sm_75();
        assert_eq!(sm75.arch, "sm_75");
        assert!(sm75.triple.contains("nvptx64"));

        let sm80 = GpuTargetConfig::cuda((8, 0));
        assert_eq!(sm80.arch, "sm_80");
    }

    #[test]
    fn host_target_machine_creation() {
        let tm = host_target_machine().unwrap();
        assert!(!tm.get_triple().as_str().to_bytes().is_empty());
    }
}
