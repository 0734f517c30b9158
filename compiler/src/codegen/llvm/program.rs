//! Program: the explicit compilation context
//!
//! Owns what the codegen needs across kernels: the configuration, the SNode
//! tree and its lowered types, the runtime prototype module (stored as
//! bitcode and cloned per kernel), and the host data layout. Each codegen
//! instance borrows a `Program`; nothing here is process-global.

use std::collections::HashMap;

use inkwell::context::Context;
use inkwell::memory_buffer::MemoryBuffer;
use inkwell::module::Module;
use inkwell::targets::TargetData;
use inkwell::types::BasicTypeEnum;

use crate::config::CompileConfig;
use crate::error::{CodegenError, CodegenResult};
use crate::snode::{SNodeId, SNodeTree};

use super::runtime::build_runtime_module;
use super::structs::{compile_snode_tree, SNodeLlvm};
use super::target::host_target_machine;

/// Per-program compilation state shared by all kernel compilations.
pub struct Program<'ctx> {
    pub context: &'ctx Context,
    pub config: CompileConfig,
    pub snodes: SNodeTree,
    snode_llvm: HashMap<SNodeId, SNodeLlvm<'ctx>>,
    runtime_bitcode: MemoryBuffer,
    target_data: TargetData,
}

impl<'ctx> Program<'ctx> {
    /// Build the runtime prototype (runtime ABI + compiled SNode tree) and
    /// freeze it as bitcode.
    pub fn new(
        context: &'ctx Context,
        config: CompileConfig,
        snodes: SNodeTree,
    ) -> CodegenResult<Self> {
        let module = build_runtime_module(context)?;
        let snode_llvm = compile_snode_tree(context, &module, &snodes)?;
        module
            .verify()
            .map_err(|e| CodegenError::Llvm(format!("runtime module invalid: {e}")))?;
        let runtime_bitcode = module.write_bitcode_to_memory();
        let target_data = host_target_machine()?.get_target_data();

        Ok(Self {
            context,
            config,
            snodes,
            snode_llvm,
            runtime_bitcode,
            target_data,
        })
    }

    /// Clone the runtime prototype for one kernel compilation.
    pub fn clone_runtime_module(&self) -> CodegenResult<Module<'ctx>> {
        Module::parse_bitcode_from_buffer(&self.runtime_bitcode, self.context)
            .map_err(|e| CodegenError::Llvm(format!("failed to clone runtime module: {e}")))
    }

    pub fn snode_llvm(&self, id: SNodeId) -> CodegenResult<&SNodeLlvm<'ctx>> {
        self.snode_llvm.get(&id).ok_or_else(|| {
            CodegenError::invariant("SNodeLookup", format!("snode {} was not compiled", id.0))
        })
    }

    /// ABI allocation size of a lowered type, in bytes.
    pub fn type_size(&self, ty: BasicTypeEnum<'ctx>) -> u64 {
        self.target_data.get_abi_size(&ty)
    }

    pub fn target_data(&self) -> &TargetData {
        &self.target_data
    }

    /// Bytes an embedder must allocate for the root buffer.
    pub fn root_buffer_size(&self) -> CodegenResult<u64> {
        let root = self.snode_llvm(self.snodes.root_id())?;
        Ok(self.type_size(root.node_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    #[test]
    fn program_builds_and_clones() {
        let context = Context::create();
        let mut tree = SNodeTree::new();
        let root = tree.root_id();
        let dense = tree.dense(root, &[4]);
        tree.place(dense, DataType::F32);

        let program = Program::new(&context, CompileConfig::default(), tree).unwrap();

        // 16 f32 cells behind the root struct.
        assert_eq!(program.root_buffer_size().unwrap(), 64);

        let clone_a = program.clone_runtime_module().unwrap();
        let clone_b = program.clone_runtime_module().unwrap();
        assert!(clone_a.get_function("Dense_lookup_element").is_some());
        assert!(clone_b.get_function("S1dense_refine_coordinates").is_some());
    }
}
