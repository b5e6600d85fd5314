//! Abstraction for the one thing the heap needs from the operating system:
//! pushing the program break forward. The engine doesn't care whether the
//! break is a real `sbrk` break, a synthesized one over a virtual memory
//! reservation, or a test slab, it only relies on growth being monotonic and
//! contiguous: every successful extension hands back memory that starts
//! exactly where the previous extension ended.

#[cfg(any(test, miri))]
use std::ptr::NonNull;

use crate::Pointer;

/// The program-break capability. One operation, modeled after `sbrk`:
/// extend the break by `increment` bytes and return the *previous* break,
/// which is the base of the newly usable range. An increment of zero queries
/// the current break without moving it.
pub(crate) trait ProgramBreak {
    /// Returns the previous break on success, `None` when the underlying
    /// source refuses to grow. A failed extension must leave the break where
    /// it was.
    unsafe fn extend_break(&mut self, increment: usize) -> Pointer<u8>;
}

/// Program break of the host process. On Unix this is the real thing; on
/// Windows, which has no break to move, it is synthesized over a one-shot
/// address space reservation that gets committed monotonically, preserving
/// the same contiguous-growth contract.
#[cfg(not(any(test, miri)))]
pub(crate) struct OsBreak {
    /// Base of the reservation the synthesized break lives in.
    #[cfg(windows)]
    base: *mut u8,
    /// Synthesized break, as an offset from `base`.
    #[cfg(windows)]
    brk: usize,
}

/// The break is process-global state; the raw pointer inside the Windows
/// variant is only touched under the heap lock.
#[cfg(not(any(test, miri)))]
unsafe impl Send for OsBreak {}

#[cfg(not(any(test, miri)))]
impl OsBreak {
    pub const fn new() -> Self {
        Self {
            #[cfg(windows)]
            base: std::ptr::null_mut(),
            #[cfg(windows)]
            brk: 0,
        }
    }
}

/// Break source the process-wide heap is built on. Tests and Miri never touch
/// the real break: the test binary's own libc allocator may be using it, and
/// two owners extending the same break would tear each other's regions apart.
#[cfg(not(any(test, miri)))]
pub(crate) type DefaultBreak = OsBreak;

#[cfg(any(test, miri))]
pub(crate) type DefaultBreak = EmulatedBreak;

#[cfg(all(unix, not(any(test, miri))))]
mod unix {
    use std::ptr::NonNull;

    use super::{OsBreak, ProgramBreak};
    use crate::Pointer;

    impl ProgramBreak for OsBreak {
        unsafe fn extend_break(&mut self, increment: usize) -> Pointer<u8> {
            // `sbrk` takes a signed increment. Anything beyond `isize::MAX`
            // would wrap into a negative value and *shrink* the break, so
            // refuse it here.
            if increment > isize::MAX as usize {
                return None;
            }

            // Returns the previous break on success and `(void *) -1` on
            // failure. See https://man7.org/linux/man-pages/man2/sbrk.2.html
            match libc::sbrk(increment as libc::intptr_t) {
                address if address == usize::MAX as *mut libc::c_void => None,
                address => Some(NonNull::new_unchecked(address).cast()),
            }
        }
    }
}

#[cfg(all(windows, not(any(test, miri))))]
mod windows {
    use std::ptr::NonNull;

    use windows::Win32::System::Memory;

    use super::{OsBreak, ProgramBreak};
    use crate::Pointer;

    /// Address space reserved up front for the synthesized break. Reserving
    /// is free until pages are committed, so this only bounds how far the
    /// heap can ever grow. 8 GiB.
    const RESERVATION_SIZE: usize = 1 << 33;

    impl ProgramBreak for OsBreak {
        unsafe fn extend_break(&mut self, increment: usize) -> Pointer<u8> {
            if self.base.is_null() {
                // Reserve first, commit as the break moves. Same two-step
                // dance as any Windows allocator, see
                // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualalloc
                let address = Memory::VirtualAlloc(
                    None,
                    RESERVATION_SIZE,
                    Memory::MEM_RESERVE,
                    Memory::PAGE_READWRITE,
                );

                if address.is_null() {
                    return None;
                }

                self.base = address.cast();
            }

            let Some(new_brk) = self.brk.checked_add(increment) else {
                return None;
            };

            if new_brk > RESERVATION_SIZE {
                return None;
            }

            if increment > 0 {
                // Committing an already committed page is fine, so we don't
                // bother tracking page granularity ourselves.
                let address = Memory::VirtualAlloc(
                    Some(self.base.add(self.brk) as *const _),
                    increment,
                    Memory::MEM_COMMIT,
                    Memory::PAGE_READWRITE,
                );

                if address.is_null() {
                    return None;
                }
            }

            let previous = self.base.add(self.brk);
            self.brk = new_brk;

            Some(NonNull::new_unchecked(previous))
        }
    }
}

/// Break source backed by an owned slab instead of the process break. Every
/// instance is an isolated little universe with a fixed capacity, which makes
/// heap tests deterministic and lets them drive the out-of-memory paths on
/// purpose.
#[cfg(any(test, miri))]
pub(crate) struct EmulatedBreak {
    slab: *mut u8,
    capacity: usize,
    brk: usize,
}

#[cfg(any(test, miri))]
unsafe impl Send for EmulatedBreak {}

#[cfg(any(test, miri))]
impl EmulatedBreak {
    /// Roomy enough that the process-wide heap never runs dry under the
    /// test suite.
    const DEFAULT_CAPACITY: usize = 32 * 1024 * 1024;

    pub const fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// A break that refuses to grow past `capacity` bytes in total.
    pub const fn with_capacity(capacity: usize) -> Self {
        Self {
            slab: std::ptr::null_mut(),
            capacity,
            brk: 0,
        }
    }

    fn layout(&self) -> std::alloc::Layout {
        std::alloc::Layout::from_size_align(self.capacity, page_size()).unwrap()
    }
}

#[cfg(any(test, miri))]
impl ProgramBreak for EmulatedBreak {
    unsafe fn extend_break(&mut self, increment: usize) -> Pointer<u8> {
        if self.capacity == 0 {
            return None;
        }

        if self.slab.is_null() {
            let slab = std::alloc::alloc(self.layout());
            if slab.is_null() {
                return None;
            }
            self.slab = slab;
        }

        if increment > self.capacity - self.brk {
            return None;
        }

        let previous = self.slab.add(self.brk);
        self.brk += increment;

        Some(NonNull::new_unchecked(previous))
    }
}

#[cfg(any(test, miri))]
impl Drop for EmulatedBreak {
    fn drop(&mut self) {
        if !self.slab.is_null() {
            unsafe { std::alloc::dealloc(self.slab, self.layout()) };
        }
    }
}

/// Virtual memory page size, which is also the size of the first heap region.
/// 4096 bytes on most computers. We only know the value at runtime by asking
/// the OS, so it's cached after the first call.
#[cfg(all(unix, not(any(test, miri))))]
pub(crate) fn page_size() -> usize {
    use std::sync::atomic::{AtomicUsize, Ordering};

    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize };
            PAGE_SIZE.store(size, Ordering::Relaxed);
            size
        }
        size => size,
    }
}

#[cfg(all(windows, not(any(test, miri))))]
pub(crate) fn page_size() -> usize {
    use std::mem::MaybeUninit;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use windows::Win32::System::SystemInformation;

    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let size = unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());
                system_info.assume_init().dwPageSize as usize
            };
            PAGE_SIZE.store(size, Ordering::Relaxed);
            size
        }
        size => size,
    }
}

#[cfg(any(test, miri))]
pub(crate) fn page_size() -> usize {
    4096
}
