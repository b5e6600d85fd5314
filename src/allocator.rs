use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use crate::{alignment::MAX_ALIGN, heap};

/// The standard-traits front door to the heap-replacement engine. All
/// instances are handles to the same process-wide heap, so this is a zero
/// sized type you can slap on a static:
///
/// ```no_run
/// use buddyloc::Buddyloc;
///
/// #[global_allocator]
/// static ALLOCATOR: Buddyloc = Buddyloc;
///
/// fn main() {
///     let num = Box::new(5);
///     assert_eq!(*num, 5);
/// }
/// ```
///
/// One caveat inherited from the engine: payloads are aligned to the maximum
/// fundamental scalar alignment and nothing more, so allocation requests with
/// a stricter alignment fail with a null pointer, which is a valid (if
/// unhelpful) answer under the [`GlobalAlloc`] contract. `repr(align(64))`
/// types and the like won't work with this allocator.
pub struct Buddyloc;

unsafe impl GlobalAlloc for Buddyloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MAX_ALIGN {
            return ptr::null_mut();
        }

        match heap::allocate(layout.size()) {
            Some(address) => address.as_ptr(),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(address) = NonNull::new(ptr) {
            heap::free(address);
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MAX_ALIGN {
            return ptr::null_mut();
        }

        match heap::zero_allocate(layout.size(), 1) {
            Some(address) => address.as_ptr(),
            None => ptr::null_mut(),
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > MAX_ALIGN {
            return ptr::null_mut();
        }

        match heap::reallocate(NonNull::new(ptr), new_size) {
            Some(address) => address.as_ptr(),
            None => ptr::null_mut(),
        }
    }
}
