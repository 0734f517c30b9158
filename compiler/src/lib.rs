//! Trellis Compiler — code generation core
//!
//! Lowers a typed, offloaded kernel IR operating over a hierarchical sparse
//! data structure (the SNode tree) into executable machine code through an
//! LLVM backend: direct JIT on the host, PTX + device launch on the GPU.
//!
//! # Architecture
//!
//! ```text
//! Kernel IR ──> Offload Driver ──> Statement Visitor ──> LLVM IR
//!                    │                   │
//!                    │                   ├── SNode meta descriptors
//!                    │                   └── runtime-module calls
//!                    └── one function per offloaded task
//!
//! Host: module ──> JIT ──> task function pointers, invoked in order
//! GPU:  module ──> PTX ──> device module ──> per-task kernel launches
//! ```
//!
//! Codegen is deterministic: given an IR tree and a target configuration it
//! produces one specific module.

pub mod codegen;
pub mod config;
pub mod error;
pub mod ir;
pub mod snode;
pub mod types;

pub use config::{Arch, CompileConfig};
pub use error::{CodegenError, CodegenResult};
pub use ir::{Block, IrArena, Kernel, OffloadedStmt, StmtId, TaskType};
pub use snode::{SNode, SNodeId, SNodeTree, SNodeType};
pub use types::{ConstValue, DataType};
