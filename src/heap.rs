//! The heap-replacement flavour of the engine: one process-wide region
//! bootstrapped lazily from the program break and grown on demand, never
//! returned. This is where the global state lives:
//!
//! ```text
//!            +--------- HEAP: Mutex<Heap> ----------+
//!            |                                      |
//!            |  brk: ProgramBreak   state: region + |
//!            |                             cursor   |
//!            +------------------|-------------------+
//!                               |
//!                               v
//! break ->  +---------+---------+--------+----------+  <- break after two
//! at birth  | Block   | Block   | Block  |  Block   |     growths
//!           +---------+---------+--------+----------+
//!           ^                                       ^
//!           start                                   end
//! ```
//!
//! Differences from the arena flavour: the search starts at a rotating
//! cursor (`next`) instead of always at `start`, and running out of blocks
//! triggers growth instead of failure. Everything else, splitting, buddy
//! math, coalescing, is the shared [`Region`] engine.
//!
//! All four entry points lock the [`Mutex`] exactly once and call the
//! internal `&mut self` methods, so there is no reentrant locking anywhere:
//! reallocation reuses the unlocked internals directly.

use std::{
    ptr::{self, NonNull},
    sync::Mutex,
};

use crate::{
    alignment::MAX_ALIGN,
    block::{BlockHeader, HEADER_SIZE},
    platform::{page_size, DefaultBreak, ProgramBreak},
    region::Region,
    Pointer,
};

/// The one heap of the process. Lazy initialization note: the engine state
/// behind the lock is an `Option`, so "initialized" and "state is coherent"
/// are the same thing and no separate flag can be observed out of order.
static HEAP: Mutex<Heap> = Mutex::new(Heap::new(DefaultBreak::new()));

/// Size of the first region slab. One OS page, which is conveniently both a
/// power of two and way above the minimum block size.
fn initial_region_size() -> usize {
    page_size()
}

/// Heap engine state once bootstrapped.
struct HeapState {
    region: Region,
    /// Rotating search cursor. Always points at a live block header. Written
    /// in exactly two situations: after a successful allocation (one past
    /// the chosen block, wrapping) and after a free (the freed, possibly
    /// coalesced block).
    next: NonNull<BlockHeader>,
}

/// The engine behind the four entry points. Generic over the break source so
/// tests can run dozens of isolated heaps with tiny capacities; the process
/// wide instance uses [`DefaultBreak`].
pub(crate) struct Heap<B = DefaultBreak> {
    brk: B,
    state: Option<HeapState>,
}

/// The raw pointers inside are only ever dereferenced with the enclosing
/// lock held.
unsafe impl<B: Send> Send for Heap<B> {}

impl<B> Heap<B> {
    pub const fn new(brk: B) -> Self {
        Self { brk, state: None }
    }
}

impl<B: ProgramBreak> Heap<B> {
    /// One-time setup, performed under the lock by the first call that needs
    /// the region: align the break up to [`MAX_ALIGN`] by consuming the gap,
    /// then claim one initial slab and install it as a single free block.
    /// Returns `None` when the break refuses to move at all, in which case
    /// nothing was committed and a later call will simply retry.
    unsafe fn bootstrap(brk: &mut B) -> Option<HeapState> {
        let current = brk.extend_break(0)?;

        let padding = current.as_ptr().align_offset(MAX_ALIGN);
        if padding > 0 {
            brk.extend_break(padding)?;
        }

        let size = initial_region_size();
        let base = brk.extend_break(size)?;
        debug_assert_eq!(base.as_ptr() as usize % MAX_ALIGN, 0);

        let region = Region::init(base, size);

        Some(HeapState {
            region,
            next: region.start,
        })
    }

    /// Rotating-cursor search: start at `next`, advance block by block
    /// wrapping from `end` back to `start`, and give up after coming full
    /// circle. Compared to always scanning from `start` this spreads
    /// allocations around the region and tends to find recently freed blocks
    /// first, since a free parks the cursor on them.
    unsafe fn search(state: &HeapState, size: usize) -> Pointer<BlockHeader> {
        let origin = state.next;
        let mut current = origin;

        loop {
            if current.as_ref().is_free && current.as_ref().fits(size) {
                return Some(current);
            }

            current = state.region.next_block_wrapping(current);

            if current == origin {
                return None;
            }
        }
    }

    /// Growth protocol, invoked when the search came back empty. Two
    /// regimes:
    ///
    /// 1. The region is one single free block (nothing was ever carved out
    /// of it, or everything coalesced back). Stretch that block in place:
    /// double its size until the request fits, extend the break by the
    /// difference, done. No new headers needed.
    ///
    /// 2. Otherwise, repeatedly double the region: extend the break by the
    /// current region size and install the new space as one free block at
    /// the old `end`. Each installed block equals the whole region before
    /// it, so sizes stay powers of two and the junction offsets keep the
    /// buddy arithmetic valid. Stop as soon as an installed block can hold
    /// the request.
    ///
    /// Region metadata is only touched after the break extension succeeds,
    /// so a refusal from the OS leaves every invariant intact and simply
    /// surfaces as allocation failure.
    unsafe fn grow(
        brk: &mut B,
        state: &mut HeapState,
        size: usize,
    ) -> Pointer<BlockHeader> {
        let required = size.checked_add(HEADER_SIZE)?;
        let region = &mut state.region;
        let start = region.start;

        if region.next_block(start).is_none() && start.as_ref().is_free {
            let mut new_size = start.as_ref().size;
            while new_size < required {
                new_size = new_size.checked_mul(2)?;
            }

            brk.extend_break(new_size - start.as_ref().size)?;

            (*start.as_ptr()).size = new_size;
            region.end = NonNull::new_unchecked(start.as_ptr().cast::<u8>().add(new_size));

            return Some(start);
        }

        loop {
            let region_size = region.end.as_ptr() as usize - start.as_ptr() as usize;

            let base = brk.extend_break(region_size)?;
            debug_assert_eq!(base.as_ptr(), region.end.as_ptr());

            let block = region.end.cast::<BlockHeader>();
            block.as_ptr().write(BlockHeader {
                size: region_size,
                is_free: true,
            });
            region.end = NonNull::new_unchecked(base.as_ptr().add(region_size));

            if BlockHeader::payload_size_of(region_size) >= size {
                return Some(block);
            }
        }
    }

    /// Allocation: search, grow on exhaustion, then best-fit by repeated
    /// splitting, mark used, park the cursor one block past the winner.
    pub unsafe fn allocate(&mut self, size: usize) -> Pointer<u8> {
        if size == 0 {
            return None;
        }

        if self.state.is_none() {
            self.state = Self::bootstrap(&mut self.brk);
        }

        let Heap { brk, state } = self;
        let state = state.as_mut()?;

        let block = match Self::search(state, size) {
            Some(block) => block,
            None => Self::grow(brk, state, size)?,
        };

        state.region.split_to_fit(block, size);
        (*block.as_ptr()).is_free = false;
        state.next = state.region.next_block_wrapping(block);

        Some(BlockHeader::payload_address_of(block))
    }

    /// Free: coalesce upward, then park the cursor on the merged block so
    /// the next search finds the freshly freed space first.
    pub unsafe fn free(&mut self, address: NonNull<u8>) {
        let Some(state) = self.state.as_mut() else {
            return;
        };

        let block = BlockHeader::from_payload_address(address);
        state.next = state.region.coalesce(block);
    }

    /// Tries to absorb free right-side buddies into `block` until `size`
    /// payload bytes fit, without moving anything. Walks *virtual* sizes: at
    /// each step the block, pretended to be `virtual_size` bytes big, must be
    /// the left member of its pair and its buddy must be a free block of
    /// exactly that size. The header is only committed once the request is
    /// actually satisfied; bailing out halfway leaves the region untouched.
    unsafe fn absorb_rightward(
        state: &mut HeapState,
        block: NonNull<BlockHeader>,
        size: usize,
    ) -> bool {
        let region = &state.region;
        let mut virtual_size = block.as_ref().size;

        while BlockHeader::payload_size_of(virtual_size) < size {
            if !region.is_left(block, virtual_size) {
                return false;
            }

            let buddy = block.as_ptr().cast::<u8>().add(virtual_size);
            if buddy as usize >= region.end.as_ptr() as usize {
                return false;
            }

            let buddy = buddy.cast::<BlockHeader>();
            if !(*buddy).is_free || (*buddy).size != virtual_size {
                return false;
            }

            virtual_size *= 2;
        }

        (*block.as_ptr()).size = virtual_size;

        // The absorbed headers are payload now. The cursor might have been
        // parked on one of them, so repoint it like after any allocation.
        state.next = state.region.next_block_wrapping(block);

        true
    }

    /// Reallocation. In order of preference: shrink in place by splitting,
    /// grow in place by absorbing free right-side buddies, and finally
    /// relocate. Relocation allocates the new block *before* touching the
    /// old one: if allocation fails the original is still intact, and the
    /// copy always runs between two disjoint live blocks.
    pub unsafe fn reallocate(&mut self, address: Pointer<u8>, size: usize) -> Pointer<u8> {
        let Some(address) = address else {
            return self.allocate(size);
        };

        if size == 0 {
            self.free(address);
            return None;
        }

        let block = BlockHeader::from_payload_address(address);

        if let Some(state) = self.state.as_mut() {
            if block.as_ref().fits(size) {
                if state.region.split_to_fit(block, size) {
                    // Same rule as free: the cursor goes to the freed space,
                    // which starts right past the trimmed block.
                    state.next = state.region.next_block_wrapping(block);
                }
                return Some(address);
            }

            if Self::absorb_rightward(state, block, size) {
                return Some(address);
            }
        }

        let old_size = block.as_ref().payload_size();
        let new_address = self.allocate(size)?;
        ptr::copy_nonoverlapping(address.as_ptr(), new_address.as_ptr(), old_size.min(size));
        self.free(address);

        Some(new_address)
    }

    /// `count * size` bytes, zeroed. Overflow of the product is reported as
    /// plain allocation failure.
    pub unsafe fn zero_allocate(&mut self, count: usize, size: usize) -> Pointer<u8> {
        let total = count.checked_mul(size)?;
        let address = self.allocate(total)?;
        address.as_ptr().write_bytes(0, total);

        Some(address)
    }
}

/// Returns an address where `size` bytes can be safely written, or `None`
/// when `size` is zero or the OS refuses to hand out more memory. The
/// address is aligned to the maximum fundamental scalar alignment and stays
/// valid until passed to [`free`] or [`reallocate`].
pub fn allocate(size: usize) -> Option<NonNull<u8>> {
    match HEAP.lock() {
        Ok(mut heap) => unsafe { heap.allocate(size) },
        Err(_) => None,
    }
}

/// Deallocates an address previously returned by [`allocate`],
/// [`reallocate`] or [`zero_allocate`].
///
/// # Safety
///
/// `address` must come from this allocator and must not have been freed
/// already. Double frees and foreign pointers are undefined behaviour.
pub unsafe fn free(address: NonNull<u8>) {
    if let Ok(mut heap) = HEAP.lock() {
        heap.free(address);
    }
}

/// Changes the size of the allocation at `address` to `size` bytes,
/// preserving the first `min(old size, size)` bytes of content. `None` as
/// the address allocates; a `size` of zero frees and returns `None`. On
/// failure the original allocation is untouched and still valid.
///
/// # Safety
///
/// Same contract as [`free`] when `address` is `Some`.
pub unsafe fn reallocate(address: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
    match HEAP.lock() {
        Ok(mut heap) => heap.reallocate(address, size),
        Err(_) => None,
    }
}

/// Allocates `count * size` bytes of zeroed memory. Fails like [`allocate`],
/// and also when the product overflows.
pub fn zero_allocate(count: usize, size: usize) -> Option<NonNull<u8>> {
    match HEAP.lock() {
        Ok(mut heap) => unsafe { heap.zero_allocate(count, size) },
        Err(_) => None,
    }
}

/// Runs `f` with the process-wide heap locked. Lets tests inspect the global
/// region without racing other tests.
#[cfg(test)]
pub(crate) fn with_heap<R>(f: impl FnOnce(&mut Heap) -> R) -> R {
    f(&mut HEAP.lock().unwrap())
}
