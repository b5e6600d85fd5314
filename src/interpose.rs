//! Aliases the heap entry points onto the standard C allocation names. Only
//! compiled with the `stdlib-override` feature: build the `cdylib` with it
//! and preload the result to route an unmodified binary's allocation traffic
//! through the buddy engine:
//!
//! ```text
//! cargo build --release --features stdlib-override
//! LD_PRELOAD=target/release/libbuddyloc.so ls
//! ```
//!
//! The shim is intentionally paper thin: null handling as required by the C
//! contracts happens here, everything else is the engine's problem.

use std::{ffi::c_void, ptr::NonNull};

use crate::heap;

#[no_mangle]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    match heap::allocate(size) {
        Some(address) => address.as_ptr().cast(),
        None => std::ptr::null_mut(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    // free(NULL) is a no-op.
    if let Some(address) = NonNull::new(ptr.cast::<u8>()) {
        heap::free(address);
    }
}

#[no_mangle]
pub unsafe extern "C" fn calloc(count: usize, size: usize) -> *mut c_void {
    match heap::zero_allocate(count, size) {
        Some(address) => address.as_ptr().cast(),
        None => std::ptr::null_mut(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    match heap::reallocate(NonNull::new(ptr.cast::<u8>()), size) {
        Some(address) => address.as_ptr().cast(),
        None => std::ptr::null_mut(),
    }
}
