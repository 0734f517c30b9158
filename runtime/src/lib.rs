//! Trellis Runtime Library
//!
//! This crate provides the host-side runtime support for compiled Trellis
//! kernels: the C-compatible ABI structs shared with generated code
//! (`Context`, `Element`, `PhysicalCoordinates`, the SNode descriptors) and
//! the intrinsics that kernels call back into via FFI.
//!
//! Layouts here must stay bit-for-bit compatible with the named struct types
//! declared in the compiler's runtime prototype module.

pub mod intrinsics;

pub use intrinsics::native_symbols;

/// Width of a physical coordinate tuple.
pub const MAX_NUM_INDICES: usize = 4;

/// Number of scalar argument slots in a kernel context.
pub const MAX_ARGS: usize = 8;

/// A fixed-width integer tuple naming a cell in the sparse tree.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhysicalCoordinates {
    pub val: [i32; MAX_NUM_INDICES],
}

/// One entry of an element list: a pointer to a cell plus the coordinates
/// of that cell.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Element {
    pub element: *mut u8,
    pub pcoord: PhysicalCoordinates,
}

pub type LookupElementFn = unsafe extern "C" fn(*mut StructMeta, *mut u8, i32) -> *mut u8;
pub type FromParentElementFn = unsafe extern "C" fn(*mut u8) -> *mut u8;
pub type IsActiveFn = unsafe extern "C" fn(*mut StructMeta, *mut u8, i32) -> bool;
pub type GetNumElementsFn = unsafe extern "C" fn(*mut StructMeta, *mut u8) -> i32;
pub type RefineCoordinatesFn =
    unsafe extern "C" fn(*const PhysicalCoordinates, *mut PhysicalCoordinates, i32);

/// Common head of every SNode descriptor. Generated code materializes one of
/// these per lookup site and fills in the function pointers from the runtime
/// module.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct StructMeta {
    pub snode_id: i32,
    pub element_size: i64,
    pub max_num_elements: i32,
    pub lookup_element: Option<LookupElementFn>,
    pub from_parent_element: Option<FromParentElementFn>,
    pub is_active: Option<IsActiveFn>,
    pub get_num_elements: Option<GetNumElementsFn>,
    pub refine_coordinates: Option<RefineCoordinatesFn>,
}

impl StructMeta {
    pub fn empty(snode_id: i32, element_size: i64, max_num_elements: i32) -> Self {
        Self {
            snode_id,
            element_size,
            max_num_elements,
            lookup_element: None,
            from_parent_element: None,
            is_active: None,
            get_num_elements: None,
            refine_coordinates: None,
        }
    }
}

/// Descriptor for a `dense` node.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DenseMeta {
    pub base: StructMeta,
    pub bitmasked: i32,
    pub morton_dim: i32,
}

/// Descriptor for the `root` node.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RootMeta {
    pub base: StructMeta,
}

/// Per-invocation kernel context: the data-structure buffer, the scalar
/// argument slots, and a pointer back to the runtime state.
#[repr(C)]
#[derive(Debug)]
pub struct Context {
    pub buffer: *mut u8,
    pub args: [u64; MAX_ARGS],
    pub runtime: *mut Runtime,
}

impl Context {
    pub fn new() -> Self {
        Self {
            buffer: std::ptr::null_mut(),
            args: [0; MAX_ARGS],
            runtime: std::ptr::null_mut(),
        }
    }

    pub fn set_buffer(&mut self, buffer: *mut u8) {
        self.buffer = buffer;
    }

    pub fn set_runtime(&mut self, runtime: *mut Runtime) {
        self.runtime = runtime;
    }

    /// Store an i32 argument. Generated code reads the low 32 bits.
    pub fn set_arg_i32(&mut self, i: usize, v: i32) {
        self.args[i] = v as u32 as u64;
    }

    pub fn set_arg_i64(&mut self, i: usize, v: i64) {
        self.args[i] = v as u64;
    }

    /// Store an f32 argument as its raw bits; generated code truncates the
    /// slot to 32 bits and bit-casts.
    pub fn set_arg_f32(&mut self, i: usize, v: f32) {
        self.args[i] = v.to_bits() as u64;
    }

    pub fn set_arg_f64(&mut self, i: usize, v: f64) {
        self.args[i] = v.to_bits();
    }

    pub fn set_arg_ptr(&mut self, i: usize, p: *mut u8) {
        self.args[i] = p as u64;
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Runtime state shared by all kernels of a program: one element list per
/// SNode id. Lists start empty; `element_listgen` populates a child list
/// from its parent's, and the embedder seeds the root list.
#[derive(Debug, Default)]
pub struct Runtime {
    element_lists: Vec<Vec<Element>>,
}

impl Runtime {
    pub fn new(num_snodes: usize) -> Self {
        Self {
            element_lists: vec![Vec::new(); num_snodes],
        }
    }

    pub fn list(&self, snode_id: usize) -> &[Element] {
        &self.element_lists[snode_id]
    }

    pub fn clear_list(&mut self, snode_id: usize) {
        self.element_lists[snode_id].clear();
    }

    pub fn push_element(&mut self, snode_id: usize, element: Element) {
        self.element_lists[snode_id].push(element);
    }

    /// Seed the root list with the root instance at the origin. Called once
    /// by the embedder after allocating the data-structure buffer.
    pub fn seed_root_list(&mut self, root_id: usize, root_buffer: *mut u8) {
        self.element_lists[root_id].push(Element {
            element: root_buffer,
            pcoord: PhysicalCoordinates::default(),
        });
    }
}
