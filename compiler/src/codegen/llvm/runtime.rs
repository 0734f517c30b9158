//! Runtime prototype module
//!
//! Builds the "precompiled runtime" module that every kernel compilation
//! clones: the named struct types shared with `trellis-runtime`, IR
//! definitions for the accessors both backends may inline-call
//! (`Context_*`, `{Type}_lookup_element`, descriptor setters), and
//! declarations for everything resolved at link time (host-native helpers,
//! `printf`/`vprintf`, libdevice stubs).
//!
//! Layouts must stay in sync with the `#[repr(C)]` structs in
//! `trellis-runtime`; see the layout tests there.

use inkwell::context::Context;
use inkwell::module::Module;
use inkwell::types::{BasicMetadataTypeEnum, StructType};
use inkwell::AddressSpace;

use trellis_runtime::{MAX_ARGS, MAX_NUM_INDICES};

use crate::error::{CodegenError, CodegenResult};

/// Field index of `field` within the named runtime struct `type_name`.
pub fn field_index(type_name: &str, field: &str) -> Option<u32> {
    let fields: &[&str] = match type_name {
        "StructMeta" => &[
            "snode_id",
            "element_size",
            "max_num_elements",
            "lookup_element",
            "from_parent_element",
            "is_active",
            "get_num_elements",
            "refine_coordinates",
        ],
        "DenseMeta" => &["base", "bitmasked", "morton_dim"],
        "RootMeta" => &["base"],
        "Element" => &["element", "pcoord"],
        "PhysicalCoordinates" => &["val"],
        "Context" => &["buffer", "args", "runtime"],
        _ => return None,
    };
    fields.iter().position(|&f| f == field).map(|i| i as u32)
}

/// Look up a named runtime struct type registered on the context.
pub fn runtime_type<'ctx>(context: &'ctx Context, name: &str) -> CodegenResult<StructType<'ctx>> {
    context
        .get_struct_type(name)
        .ok_or_else(|| CodegenError::RuntimeTypeMissing(name.to_string()))
}

/// Build the runtime prototype module in `context`.
pub fn build_runtime_module(context: &Context) -> CodegenResult<Module<'_>> {
    let module = context.create_module("runtime");
    let builder = context.create_builder();

    let ptr = context.ptr_type(AddressSpace::default());
    let i1 = context.bool_type();
    let i32t = context.i32_type();
    let i64t = context.i64_type();
    let f32t = context.f32_type();
    let f64t = context.f64_type();
    let void = context.void_type();

    // ---- Named struct types ------------------------------------------------

    let pcoord = context.opaque_struct_type("PhysicalCoordinates");
    pcoord.set_body(&[i32t.array_type(MAX_NUM_INDICES as u32).into()], false);

    let element = context.opaque_struct_type("Element");
    element.set_body(&[ptr.into(), pcoord.into()], false);

    let ctx_ty = context.opaque_struct_type("Context");
    ctx_ty.set_body(
        &[ptr.into(), i64t.array_type(MAX_ARGS as u32).into(), ptr.into()],
        false,
    );

    let struct_meta = context.opaque_struct_type("StructMeta");
    struct_meta.set_body(
        &[
            i32t.into(),
            i64t.into(),
            i32t.into(),
            ptr.into(),
            ptr.into(),
            ptr.into(),
            ptr.into(),
            ptr.into(),
        ],
        false,
    );

    let dense_meta = context.opaque_struct_type("DenseMeta");
    dense_meta.set_body(&[struct_meta.into(), i32t.into(), i32t.into()], false);

    let root_meta = context.opaque_struct_type("RootMeta");
    root_meta.set_body(&[struct_meta.into()], false);

    // Opaque; only ever addressed through pointers.
    context.opaque_struct_type("Runtime");

    // ---- Context accessors -------------------------------------------------

    {
        let f = module.add_function("Context_get_buffer", ptr.fn_type(&[ptr.into()], false), None);
        builder.position_at_end(context.append_basic_block(f, "entry"));
        let ctx = f.get_nth_param(0).unwrap().into_pointer_value();
        let field = builder.build_struct_gep(ctx_ty, ctx, 0, "buffer")?;
        let val = builder.build_load(ptr, field, "buffer")?;
        builder.build_return(Some(&val))?;
    }

    {
        let f = module.add_function(
            "Context_get_args",
            i64t.fn_type(&[ptr.into(), i32t.into()], false),
            None,
        );
        builder.position_at_end(context.append_basic_block(f, "entry"));
        let ctx = f.get_nth_param(0).unwrap().into_pointer_value();
        let i = f.get_nth_param(1).unwrap().into_int_value();
        let zero = i32t.const_zero();
        let one = i32t.const_int(1, false);
        let slot = unsafe { builder.build_gep(ctx_ty, ctx, &[zero, one, i], "arg")? };
        let val = builder.build_load(i64t, slot, "arg")?;
        builder.build_return(Some(&val))?;
    }

    {
        let f = module.add_function(
            "Context_get_runtime",
            ptr.fn_type(&[ptr.into()], false),
            None,
        );
        builder.position_at_end(context.append_basic_block(f, "entry"));
        let ctx = f.get_nth_param(0).unwrap().into_pointer_value();
        let field = builder.build_struct_gep(ctx_ty, ctx, 2, "runtime")?;
        let val = builder.build_load(ptr, field, "runtime")?;
        builder.build_return(Some(&val))?;
    }

    // ---- Descriptor setters ------------------------------------------------

    for (name, field) in [
        ("DenseMeta_set_bitmasked", 1u32),
        ("DenseMeta_set_morton_dim", 2u32),
    ] {
        let f = module.add_function(name, void.fn_type(&[ptr.into(), i32t.into()], false), None);
        builder.position_at_end(context.append_basic_block(f, "entry"));
        let meta = f.get_nth_param(0).unwrap().into_pointer_value();
        let v = f.get_nth_param(1).unwrap();
        let slot = builder.build_struct_gep(dense_meta, meta, field, "field")?;
        builder.build_store(slot, v)?;
        builder.build_return(None)?;
    }

    // ---- Generic per-type SNode accessors ----------------------------------

    for type_name in ["Dense", "Root"] {
        // {T}_lookup_element(meta, node, i): node + i * element_size
        {
            let f = module.add_function(
                &format!("{type_name}_lookup_element"),
                ptr.fn_type(&[ptr.into(), ptr.into(), i32t.into()], false),
                None,
            );
            builder.position_at_end(context.append_basic_block(f, "entry"));
            let meta = f.get_nth_param(0).unwrap().into_pointer_value();
            let node = f.get_nth_param(1).unwrap().into_pointer_value();
            let i = f.get_nth_param(2).unwrap().into_int_value();
            let size_ptr = builder.build_struct_gep(struct_meta, meta, 1, "element_size")?;
            let size = builder.build_load(i64t, size_ptr, "element_size")?.into_int_value();
            let idx = builder.build_int_s_extend(i, i64t, "idx")?;
            let offset = builder.build_int_mul(idx, size, "offset")?;
            let elem =
                unsafe { builder.build_gep(context.i8_type(), node, &[offset], "element")? };
            builder.build_return(Some(&elem))?;
        }

        // {T}_is_active(meta, node, i): dense levels carry no activity bits
        {
            let f = module.add_function(
                &format!("{type_name}_is_active"),
                i1.fn_type(&[ptr.into(), ptr.into(), i32t.into()], false),
                None,
            );
            builder.position_at_end(context.append_basic_block(f, "entry"));
            let active = i1.const_int(1, false);
            builder.build_return(Some(&active))?;
        }

        // {T}_get_num_elements(meta, node)
        {
            let f = module.add_function(
                &format!("{type_name}_get_num_elements"),
                i32t.fn_type(&[ptr.into(), ptr.into()], false),
                None,
            );
            builder.position_at_end(context.append_basic_block(f, "entry"));
            let meta = f.get_nth_param(0).unwrap().into_pointer_value();
            let n_ptr = builder.build_struct_gep(struct_meta, meta, 2, "max_num_elements")?;
            let n = builder.build_load(i32t, n_ptr, "max_num_elements")?;
            builder.build_return(Some(&n))?;
        }
    }

    // ---- Declarations resolved at link time --------------------------------

    let declare = |name: &str, ret: BasicMetadataTypeEnum<'_>, params: &[BasicMetadataTypeEnum<'_>]| {
        let params: Vec<BasicMetadataTypeEnum> = params.to_vec();
        let fn_type = match ret {
            BasicMetadataTypeEnum::IntType(t) => t.fn_type(&params, false),
            BasicMetadataTypeEnum::FloatType(t) => t.fn_type(&params, false),
            BasicMetadataTypeEnum::PointerType(t) => t.fn_type(&params, false),
            _ => unreachable!("scalar or pointer return"),
        };
        module.add_function(name, fn_type, None);
    };

    declare("max_i32", i32t.into(), &[i32t.into(), i32t.into()]);
    declare("min_i32", i32t.into(), &[i32t.into(), i32t.into()]);
    declare("logic_not_i32", i32t.into(), &[i32t.into()]);
    declare("abs_i32", i32t.into(), &[i32t.into()]);
    declare("sgn_i32", i32t.into(), &[i32t.into()]);

    for op in ["abs", "exp", "log", "tan", "tanh", "sgn"] {
        declare(&format!("{op}_f32"), f32t.into(), &[f32t.into()]);
        declare(&format!("{op}_f64"), f64t.into(), &[f64t.into()]);
        // libdevice stubs for the GPU lowering
        declare(&format!("__nv_{op}f"), f32t.into(), &[f32t.into()]);
        declare(&format!("__nv_{op}"), f64t.into(), &[f64t.into()]);
    }
    declare("__nv_fabsf", f32t.into(), &[f32t.into()]);
    declare("__nv_fabs", f64t.into(), &[f64t.into()]);
    declare("__nv_abs", i32t.into(), &[i32t.into()]);

    declare(
        "atomic_add_cpu_f32",
        f32t.into(),
        &[ptr.into(), f32t.into()],
    );
    declare(
        "atomic_add_cpu_f64",
        f64t.into(),
        &[ptr.into(), f64t.into()],
    );

    module.add_function(
        "element_listgen",
        void.fn_type(&[ptr.into(), ptr.into(), ptr.into()], false),
        None,
    );
    module.add_function(
        "for_each_block",
        void.fn_type(
            &[ptr.into(), i32t.into(), i32t.into(), i32t.into(), ptr.into()],
            false,
        ),
        None,
    );

    module.add_function("printf", i32t.fn_type(&[ptr.into()], true), None);
    module.add_function("vprintf", i32t.fn_type(&[ptr.into(), ptr.into()], false), None);

    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_types_are_registered() {
        let context = Context::create();
        let module = build_runtime_module(&context).unwrap();
        assert!(module.verify().is_ok());

        for name in [
            "Context",
            "Runtime",
            "StructMeta",
            "DenseMeta",
            "RootMeta",
            "Element",
            "PhysicalCoordinates",
        ] {
            assert!(runtime_type(&context, name).is_ok(), "missing type {name}");
        }
        assert!(runtime_type(&context, "NoSuchType").is_err());
    }

    #[test]
    fn accessor_families_exist() {
        let context = Context::create();
        let module = build_runtime_module(&context).unwrap();
        for name in [
            "Context_get_buffer",
            "Context_get_args",
            "Context_get_runtime",
            "Dense_lookup_element",
            "Dense_is_active",
            "Dense_get_num_elements",
            "Root_lookup_element",
            "element_listgen",
            "for_each_block",
            "printf",
            "vprintf",
            "atomic_add_cpu_f32",
            "max_i32",
        ] {
            assert!(module.get_function(name).is_some(), "missing {name}");
        }
    }

    #[test]
    fn field_indices() {
        assert_eq!(field_index("StructMeta", "snode_id"), Some(0));
        assert_eq!(field_index("StructMeta", "refine_coordinates"), Some(7));
        assert_eq!(field_index("DenseMeta", "bitmasked"), Some(1));
        assert_eq!(field_index("Element", "pcoord"), Some(1));
        assert_eq!(field_index("StructMeta", "no_such_field"), None);
        assert_eq!(field_index("NoSuchType", "x"), None);
    }

    #[test]
    fn defined_accessors_have_bodies() {
        let context = Context::create();
        let module = build_runtime_module(&context).unwrap();
        assert!(
            module
                .get_function("Dense_lookup_element")
                .unwrap()
                .count_basic_blocks()
                > 0
        );
        // Host helpers stay declarations; the JIT maps them to native code.
        assert_eq!(
            module
                .get_function("atomic_add_cpu_f32")
                .unwrap()
                .count_basic_blocks(),
            0
        );
    }
}
