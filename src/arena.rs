use std::{fmt, ptr::NonNull};

use crate::{
    alignment::{prev_power_of_two, MAX_ALIGN},
    block::{BlockHeader, MIN_BLOCK_SIZE},
    region::Region,
};

/// Buddy allocator over a caller-owned chunk of memory. The arena never grows
/// and never calls into the OS, it only tiles whatever the caller handed in.
/// There is no hidden global state either, which also means no internal
/// locking: sharing one arena across threads requires external
/// synchronization, distinct arenas are completely independent.
///
/// # Examples
///
/// ```rust
/// use std::ptr::NonNull;
///
/// use buddyloc::BuddyArena;
///
/// #[repr(align(16))]
/// struct Backing([u8; 1024]);
///
/// let mut backing = Backing([0; 1024]);
/// let base = NonNull::new(backing.0.as_mut_ptr()).unwrap();
///
/// unsafe {
///     let mut arena = BuddyArena::new(base, 1024).unwrap();
///
///     let address = arena.allocate(100).unwrap();
///     address.as_ptr().write_bytes(42, 100);
///
///     arena.deallocate(address);
/// }
/// ```
pub struct BuddyArena {
    region: Region,
}

impl BuddyArena {
    /// Initializes a buddy arena over `size` bytes at `base`. The base is
    /// aligned up to the maximum fundamental alignment if needed and the
    /// remaining size is rounded *down* to the greatest power of two that
    /// fits, so up to half of an awkwardly sized chunk can go unused. Returns
    /// `None` when not even one minimum block survives the rounding.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `size` bytes for as long
    /// as the arena (and every pointer allocated from it) is alive, and the
    /// memory must not be accessed through anything else meanwhile.
    pub unsafe fn new(base: NonNull<u8>, size: usize) -> Option<Self> {
        let padding = base.as_ptr().align_offset(MAX_ALIGN);

        if size < padding || size - padding < MIN_BLOCK_SIZE {
            return None;
        }

        let base = NonNull::new_unchecked(base.as_ptr().add(padding));
        let rounded = prev_power_of_two(size - padding);

        Some(Self {
            region: Region::init(base, rounded),
        })
    }

    /// Returns an address where `size` bytes can be safely written, or `None`
    /// when the request is zero sized or nothing in the arena can hold it.
    /// The address is aligned to the maximum fundamental scalar alignment.
    pub unsafe fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }

        let mut block = self.region.find_first_fit(size)?;
        self.region.split_to_fit(block, size);
        block.as_mut().is_free = false;

        Some(BlockHeader::payload_address_of(block))
    }

    /// Deallocates the given pointer and merges the freed block with as many
    /// free buddies as possible.
    ///
    /// # Safety
    ///
    /// `address` must have been returned by [`Self::allocate`] on this same
    /// arena and not freed since. Double frees and foreign pointers are
    /// undefined behaviour, we don't attempt to detect them.
    pub unsafe fn deallocate(&mut self, address: NonNull<u8>) {
        let block = BlockHeader::from_payload_address(address);
        self.region.coalesce(block);
    }

    /// Engine handle for the test suite.
    #[cfg(test)]
    pub(crate) fn region(&self) -> &Region {
        &self.region
    }
}

/// Renders the current tiling, one entry per block. Handy when a test goes
/// sideways and you want to see what the region actually looks like.
impl fmt::Debug for BuddyArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut blocks = f.debug_list();

        unsafe {
            let mut current = Some(self.region.start);
            while let Some(block) = current {
                blocks.entry(&format_args!(
                    "{} {}",
                    block.as_ref().size,
                    if block.as_ref().is_free { "free" } else { "used" }
                ));
                current = self.region.next_block(block);
            }
        }

        blocks.finish()
    }
}
