//! Runtime intrinsics for Trellis
//!
//! These functions are called by compiled kernels via FFI. The JIT assembler
//! installs them through explicit global mappings, so nothing here relies on
//! dynamic-symbol export; `native_symbols` is the single source of truth for
//! what the host runtime provides.

use std::ffi::{c_char, c_int};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::{Context, Element, PhysicalCoordinates, Runtime, StructMeta};

// ============================================================================
// Scalar math helpers
// ============================================================================

pub extern "C" fn max_i32(a: i32, b: i32) -> i32 {
    a.max(b)
}

pub extern "C" fn min_i32(a: i32, b: i32) -> i32 {
    a.min(b)
}

pub extern "C" fn logic_not_i32(a: i32) -> i32 {
    (a == 0) as i32
}

pub extern "C" fn abs_i32(a: i32) -> i32 {
    a.wrapping_abs()
}

pub extern "C" fn sgn_i32(a: i32) -> i32 {
    a.signum()
}

pub extern "C" fn abs_f32(x: f32) -> f32 {
    x.abs()
}

pub extern "C" fn abs_f64(x: f64) -> f64 {
    x.abs()
}

pub extern "C" fn exp_f32(x: f32) -> f32 {
    x.exp()
}

pub extern "C" fn exp_f64(x: f64) -> f64 {
    x.exp()
}

pub extern "C" fn log_f32(x: f32) -> f32 {
    x.ln()
}

pub extern "C" fn log_f64(x: f64) -> f64 {
    x.ln()
}

pub extern "C" fn tan_f32(x: f32) -> f32 {
    x.tan()
}

pub extern "C" fn tan_f64(x: f64) -> f64 {
    x.tan()
}

pub extern "C" fn tanh_f32(x: f32) -> f32 {
    x.tanh()
}

pub extern "C" fn tanh_f64(x: f64) -> f64 {
    x.tanh()
}

// `signum` maps +0.0 to 1.0; sgn must map zero to zero.
pub extern "C" fn sgn_f32(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

pub extern "C" fn sgn_f64(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

// ============================================================================
// CPU float atomics
// ============================================================================

/// Atomically add `v` to `*p`, returning the old value. CAS loop over the
/// raw bits; sequentially consistent like the integer path.
///
/// # Safety
/// `p` must point to a live, 4-byte-aligned f32.
pub unsafe extern "C" fn atomic_add_cpu_f32(p: *mut f32, v: f32) -> f32 {
    let cell = AtomicU32::from_ptr(p.cast());
    let mut old = cell.load(Ordering::SeqCst);
    loop {
        let new = (f32::from_bits(old) + v).to_bits();
        match cell.compare_exchange_weak(old, new, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return f32::from_bits(old),
            Err(actual) => old = actual,
        }
    }
}

/// # Safety
/// `p` must point to a live, 8-byte-aligned f64.
pub unsafe extern "C" fn atomic_add_cpu_f64(p: *mut f64, v: f64) -> f64 {
    let cell = AtomicU64::from_ptr(p.cast());
    let mut old = cell.load(Ordering::SeqCst);
    loop {
        let new = (f64::from_bits(old) + v).to_bits();
        match cell.compare_exchange_weak(old, new, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return f64::from_bits(old),
            Err(actual) => old = actual,
        }
    }
}

// ============================================================================
// Sparse list generation and traversal
// ============================================================================

/// Rebuild `child`'s element list from `parent`'s.
///
/// For every recorded parent cell, steps into the child node instance via
/// `from_parent_element`, then records each active child cell together with
/// its refined coordinates.
///
/// # Safety
/// All pointers must be valid; the metas' function pointers must be
/// installed.
pub unsafe extern "C" fn element_listgen(
    runtime: *mut Runtime,
    parent: *mut StructMeta,
    child: *mut StructMeta,
) {
    let rt = &mut *runtime;
    let parent_meta = *parent;
    let child_meta = *child;

    let from_parent = child_meta.from_parent_element.expect("from_parent_element");
    let lookup = child_meta.lookup_element.expect("lookup_element");
    let is_active = child_meta.is_active.expect("is_active");
    let refine = child_meta.refine_coordinates.expect("refine_coordinates");

    let parent_elements: Vec<Element> = rt.list(parent_meta.snode_id as usize).to_vec();
    rt.clear_list(child_meta.snode_id as usize);

    for e in parent_elements {
        let child_node = from_parent(e.element);
        for i in 0..child_meta.max_num_elements {
            if !is_active(child, child_node, i) {
                continue;
            }
            let cell = lookup(child, child_node, i);
            let mut pcoord = PhysicalCoordinates::default();
            refine(&e.pcoord, &mut pcoord, i);
            rt.push_element(child_meta.snode_id as usize, Element { element: cell, pcoord });
        }
    }
}

pub type BlockBodyFn = unsafe extern "C" fn(*mut Context, *mut Element, i32, i32);

/// Invoke `body` over every recorded element of `snode_id`'s list, splitting
/// each element's `max_num_elements` cells into `num_splits` contiguous
/// sub-ranges.
///
/// # Safety
/// `ctx` must carry a valid runtime pointer; `body` must be a live function.
pub unsafe extern "C" fn for_each_block(
    ctx: *mut Context,
    snode_id: i32,
    max_num_elements: i32,
    num_splits: i32,
    body: BlockBodyFn,
) {
    let rt = &mut *(*ctx).runtime;
    let elements: Vec<Element> = rt.list(snode_id as usize).to_vec();
    let num_splits = num_splits.max(1);
    let split = (max_num_elements / num_splits).max(1);

    for mut e in elements {
        let mut lower = 0;
        while lower < max_num_elements {
            let upper = (lower + split).min(max_num_elements);
            body(ctx, &mut e, lower, upper);
            lower = upper;
        }
    }
}

// ============================================================================
// Symbol table
// ============================================================================

extern "C" {
    fn printf(fmt: *const c_char, ...) -> c_int;
}

/// Every host-native symbol a kernel module may reference, by the name its
/// declaration carries in the runtime prototype module.
pub fn native_symbols() -> Vec<(&'static str, usize)> {
    vec![
        ("max_i32", max_i32 as usize),
        ("min_i32", min_i32 as usize),
        ("logic_not_i32", logic_not_i32 as usize),
        ("abs_i32", abs_i32 as usize),
        ("sgn_i32", sgn_i32 as usize),
        ("abs_f32", abs_f32 as usize),
        ("abs_f64", abs_f64 as usize),
        ("exp_f32", exp_f32 as usize),
        ("exp_f64", exp_f64 as usize),
        ("log_f32", log_f32 as usize),
        ("log_f64", log_f64 as usize),
        ("tan_f32", tan_f32 as usize),
        ("tan_f64", tan_f64 as usize),
        ("tanh_f32", tanh_f32 as usize),
        ("tanh_f64", tanh_f64 as usize),
        ("sgn_f32", sgn_f32 as usize),
        ("sgn_f64", sgn_f64 as usize),
        ("atomic_add_cpu_f32", atomic_add_cpu_f32 as usize),
        ("atomic_add_cpu_f64", atomic_add_cpu_f64 as usize),
        ("element_listgen", element_listgen as usize),
        ("for_each_block", for_each_block as usize),
        ("printf", printf as usize),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DenseMeta, MAX_NUM_INDICES};

    #[test]
    fn scalar_helpers() {
        assert_eq!(max_i32(3, -5), 3);
        assert_eq!(min_i32(3, -5), -5);
        assert_eq!(logic_not_i32(0), 1);
        assert_eq!(logic_not_i32(42), 0);
        assert_eq!(sgn_f32(0.0), 0.0);
        assert_eq!(sgn_f32(-3.5), -1.0);
        assert_eq!(sgn_i32(-9), -1);
    }

    #[test]
    fn float_atomic_add_returns_old_value() {
        let mut x = 1.5f32;
        let old = unsafe { atomic_add_cpu_f32(&mut x, 2.0) };
        assert_eq!(old, 1.5);
        assert_eq!(x, 3.5);

        let mut y = 1.0f64;
        unsafe { atomic_add_cpu_f64(&mut y, 0.25) };
        assert_eq!(y, 1.25);
    }

    // Native stand-ins for the generated accessors, so listgen can be
    // exercised without a JIT.
    unsafe extern "C" fn ident_from_parent(p: *mut u8) -> *mut u8 {
        p
    }
    unsafe extern "C" fn byte_lookup(meta: *mut StructMeta, node: *mut u8, i: i32) -> *mut u8 {
        node.offset(((*meta).element_size * i as i64) as isize)
    }
    unsafe extern "C" fn always_active(_: *mut StructMeta, _: *mut u8, _: i32) -> bool {
        true
    }
    unsafe extern "C" fn shift_refine(
        inp: *const PhysicalCoordinates,
        out: *mut PhysicalCoordinates,
        i: i32,
    ) {
        (*out).val = (*inp).val;
        (*out).val[0] = ((*inp).val[0] << 2) | (i & 3);
    }

    fn test_meta(id: i32, element_size: i64, n: i32) -> StructMeta {
        let mut m = StructMeta::empty(id, element_size, n);
        m.from_parent_element = Some(ident_from_parent);
        m.lookup_element = Some(byte_lookup);
        m.is_active = Some(always_active);
        m.refine_coordinates = Some(shift_refine);
        m
    }

    #[test]
    fn listgen_on_empty_parent_yields_empty_child() {
        let mut rt = Runtime::new(2);
        let mut parent = test_meta(0, 16, 1);
        let mut child = test_meta(1, 4, 4);
        unsafe { element_listgen(&mut rt, &mut parent, &mut child) };
        assert!(rt.list(1).is_empty());
    }

    #[test]
    fn listgen_expands_each_parent_cell() {
        let mut rt = Runtime::new(2);
        let mut storage = [0u8; 16];
        rt.seed_root_list(0, storage.as_mut_ptr());

        let mut parent = test_meta(0, 16, 1);
        let mut child = test_meta(1, 4, 4);
        unsafe { element_listgen(&mut rt, &mut parent, &mut child) };

        let list = rt.list(1);
        assert_eq!(list.len(), 4);
        for (i, e) in list.iter().enumerate() {
            assert_eq!(e.pcoord.val[0], i as i32);
            assert_eq!(e.pcoord.val[1..], [0; MAX_NUM_INDICES - 1]);
        }
    }

    static VISITS: std::sync::Mutex<Vec<(i32, i32)>> = std::sync::Mutex::new(Vec::new());
    unsafe extern "C" fn record_body(_: *mut Context, _: *mut Element, lower: i32, upper: i32) {
        VISITS.lock().unwrap().push((lower, upper));
    }

    #[test]
    fn for_each_block_splits_ranges() {
        let mut rt = Runtime::new(1);
        rt.seed_root_list(0, std::ptr::null_mut());
        let mut ctx = Context::new();
        ctx.set_runtime(&mut rt);

        VISITS.lock().unwrap().clear();
        unsafe {
            for_each_block(&mut ctx, 0, 16, 4, record_body);
        }
        assert_eq!(
            *VISITS.lock().unwrap(),
            vec![(0, 4), (4, 8), (8, 12), (12, 16)]
        );
    }

    #[test]
    fn dense_meta_round_trip() {
        let meta = DenseMeta {
            base: StructMeta::empty(3, 8, 16),
            bitmasked: 0,
            morton_dim: 0,
        };
        assert_eq!(meta.base.snode_id, 3);
        assert_eq!(meta.base.max_num_elements, 16);
    }
}
