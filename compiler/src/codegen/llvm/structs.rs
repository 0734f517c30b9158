//! SNode struct compiler
//!
//! Materializes the storage layout of a sparse tree into the runtime
//! prototype module: one LLVM type per node (`[capacity x cell]` for
//! allocation levels, a struct of children per cell) plus the two per-node
//! runtime functions every descriptor points at,
//! `{node}_get_ch_from_parent` and `{node}_refine_coordinates`.

use std::collections::HashMap;

use inkwell::context::Context;
use inkwell::module::Module;
use inkwell::types::BasicTypeEnum;
use inkwell::AddressSpace;

use trellis_runtime::MAX_NUM_INDICES;

use crate::error::{CodegenError, CodegenResult};
use crate::snode::{SNodeId, SNodeTree, SNodeType};

/// Lowered storage types of one SNode.
#[derive(Debug, Clone, Copy)]
pub struct SNodeLlvm<'ctx> {
    /// Storage of the whole node: `[capacity x cell]` for `dense`, the cell
    /// struct itself for `root`, the scalar for `place`.
    pub node_type: BasicTypeEnum<'ctx>,
    /// One cell: a struct of the children's node types.
    pub cell_type: BasicTypeEnum<'ctx>,
}

/// Compile the tree's types and per-node functions into `module`.
pub fn compile_snode_tree<'ctx>(
    context: &'ctx Context,
    module: &Module<'ctx>,
    tree: &SNodeTree,
) -> CodegenResult<HashMap<SNodeId, SNodeLlvm<'ctx>>> {
    let mut info = HashMap::new();
    build_node_type(context, tree, tree.root_id(), &mut info)?;

    for snode in tree.nodes() {
        if snode.parent.is_some() {
            emit_get_ch_from_parent(context, module, tree, snode.id, &info)?;
        }
        if !snode.is_place() {
            emit_refine_coordinates(context, module, tree, snode.id)?;
        }
    }

    Ok(info)
}

fn build_node_type<'ctx>(
    context: &'ctx Context,
    tree: &SNodeTree,
    id: SNodeId,
    info: &mut HashMap<SNodeId, SNodeLlvm<'ctx>>,
) -> CodegenResult<BasicTypeEnum<'ctx>> {
    let snode = tree.node(id);

    let entry = match snode.ty {
        SNodeType::Place => {
            let dtype = snode.dtype.ok_or_else(|| {
                CodegenError::invariant("SNodeTree", format!("place {} has no dtype", id.0))
            })?;
            let scalar = scalar_type(context, dtype);
            SNodeLlvm {
                node_type: scalar,
                cell_type: scalar,
            }
        }
        SNodeType::Root | SNodeType::Dense => {
            let mut children = Vec::with_capacity(snode.children.len());
            for &ch in &snode.children {
                children.push(build_node_type(context, tree, ch, info)?);
            }
            let cell = context.opaque_struct_type(&format!("{}_ch", snode.node_type_name()));
            cell.set_body(&children, false);

            let node_type: BasicTypeEnum = if snode.ty == SNodeType::Root {
                cell.into()
            } else {
                cell.array_type(snode.max_num_elements() as u32).into()
            };
            SNodeLlvm {
                node_type,
                cell_type: cell.into(),
            }
        }
        SNodeType::Dynamic => {
            return Err(CodegenError::UnsupportedType(format!(
                "snode type {}",
                snode.ty.name()
            )))
        }
    };

    info.insert(id, entry);
    Ok(entry.node_type)
}

fn scalar_type(context: &Context, dtype: crate::types::DataType) -> BasicTypeEnum<'_> {
    use crate::types::DataType;
    match dtype {
        DataType::I1 => context.bool_type().into(),
        DataType::I32 => context.i32_type().into(),
        DataType::I64 => context.i64_type().into(),
        DataType::F32 => context.f32_type().into(),
        DataType::F64 => context.f64_type().into(),
    }
}

/// `{node}_get_ch_from_parent(parent_cell) -> ptr`: address of this node's
/// field within the parent's cell struct.
fn emit_get_ch_from_parent<'ctx>(
    context: &'ctx Context,
    module: &Module<'ctx>,
    tree: &SNodeTree,
    id: SNodeId,
    info: &HashMap<SNodeId, SNodeLlvm<'ctx>>,
) -> CodegenResult<()> {
    let snode = tree.node(id);
    let parent = snode.parent.expect("checked by caller");
    let chid = tree.child_position(parent, id).ok_or_else(|| {
        CodegenError::invariant(
            "SNodeTree",
            format!("snode {} is not a child of {}", id.0, parent.0),
        )
    })?;
    let parent_cell = info[&parent].cell_type.into_struct_type();

    let ptr = context.ptr_type(AddressSpace::default());
    let f = module.add_function(
        &snode.get_ch_from_parent_func_name(),
        ptr.fn_type(&[ptr.into()], false),
        None,
    );
    let builder = context.create_builder();
    builder.position_at_end(context.append_basic_block(f, "entry"));
    let parent_ptr = f.get_nth_param(0).unwrap().into_pointer_value();
    let child = builder.build_struct_gep(parent_cell, parent_ptr, chid, "ch")?;
    builder.build_return(Some(&child))?;
    Ok(())
}

/// `{node}_refine_coordinates(inp, out, l)`: append this level's cell-index
/// bits to the incoming coordinates. Axis components are packed high-to-low
/// in the linearized index `l`.
fn emit_refine_coordinates<'ctx>(
    context: &'ctx Context,
    module: &Module<'ctx>,
    tree: &SNodeTree,
    id: SNodeId,
) -> CodegenResult<()> {
    let snode = tree.node(id);
    let pcoord = context
        .get_struct_type("PhysicalCoordinates")
        .ok_or_else(|| CodegenError::RuntimeTypeMissing("PhysicalCoordinates".to_string()))?;

    let ptr = context.ptr_type(AddressSpace::default());
    let i32t = context.i32_type();
    let f = module.add_function(
        &snode.refine_coordinates_func_name(),
        context
            .void_type()
            .fn_type(&[ptr.into(), ptr.into(), i32t.into()], false),
        None,
    );
    let builder = context.create_builder();
    builder.position_at_end(context.append_basic_block(f, "entry"));
    let inp = f.get_nth_param(0).unwrap().into_pointer_value();
    let out = f.get_nth_param(1).unwrap().into_pointer_value();
    let l = f.get_nth_param(2).unwrap().into_int_value();

    let zero = i32t.const_zero();
    let mut remaining = snode.total_num_bits();
    for axis in 0..MAX_NUM_INDICES {
        let bits = snode.index_bits.get(axis).copied().unwrap_or(0);
        remaining -= bits;

        let axis_c = i32t.const_int(axis as u64, false);
        let inp_slot = unsafe { builder.build_gep(pcoord, inp, &[zero, zero, axis_c], "inp")? };
        let inp_v = builder.build_load(i32t, inp_slot, "inp")?.into_int_value();

        let shifted = builder.build_left_shift(
            inp_v,
            i32t.const_int(bits as u64, false),
            "shifted",
        )?;
        let component = builder.build_and(
            builder.build_right_shift(l, i32t.const_int(remaining as u64, false), false, "hi")?,
            i32t.const_int(((1u64 << bits) - 1) as u64, false),
            "component",
        )?;
        let refined = builder.build_or(shifted, component, "refined")?;

        let out_slot = unsafe { builder.build_gep(pcoord, out, &[zero, zero, axis_c], "out")? };
        builder.build_store(out_slot, refined)?;
    }
    builder.build_return(None)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::llvm::runtime::build_runtime_module;
    use crate::types::DataType;

    fn dense_tree() -> SNodeTree {
        let mut tree = SNodeTree::new();
        let root = tree.root_id();
        let dense = tree.dense(root, &[4]);
        tree.place(dense, DataType::F32);
        tree
    }

    #[test]
    fn types_follow_the_tree() {
        let context = Context::create();
        let module = build_runtime_module(&context).unwrap();
        let tree = dense_tree();
        let info = compile_snode_tree(&context, &module, &tree).unwrap();

        let root = &info[&SNodeId(0)];
        assert!(root.node_type.is_struct_type());

        let dense = &info[&SNodeId(1)];
        assert!(dense.node_type.is_array_type());
        assert_eq!(dense.node_type.into_array_type().len(), 16);
        assert!(dense.cell_type.is_struct_type());

        let place = &info[&SNodeId(2)];
        assert!(place.node_type.is_float_type());
    }

    #[test]
    fn per_node_functions_are_emitted() {
        let context = Context::create();
        let module = build_runtime_module(&context).unwrap();
        let tree = dense_tree();
        compile_snode_tree(&context, &module, &tree).unwrap();

        assert!(module.get_function("S1dense_get_ch_from_parent").is_some());
        assert!(module.get_function("S1dense_refine_coordinates").is_some());
        assert!(module.get_function("S0root_refine_coordinates").is_some());
        // Roots have no parent; places refine nothing.
        assert!(module.get_function("S0root_get_ch_from_parent").is_none());
        assert!(module.get_function("S2place_refine_coordinates").is_none());
        assert!(module.verify().is_ok());
    }

    #[test]
    fn dynamic_nodes_are_rejected() {
        let context = Context::create();
        let module = build_runtime_module(&context).unwrap();
        let mut tree = SNodeTree::new();
        let root = tree.root_id();
        tree.dynamic(root, &[6]);

        let err = compile_snode_tree(&context, &module, &tree).unwrap_err();
        assert!(err.to_string().contains("dynamic"));
    }
}
