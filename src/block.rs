use std::{mem, ptr::NonNull};

use crate::alignment::{align_up, MAX_ALIGN};

/// Header written at the base of every block. The payload starts
/// [`HEADER_SIZE`] bytes after the header address, not
/// `mem::size_of::<BlockHeader>()` bytes, see [`HEADER_SIZE`]. Graphically:
///
/// ```text
/// +--------------------------+ <- Block address (returned by buddy math).
/// | size                     |
/// +--------------------------+
/// | is free flag             |
/// +--------------------------+
/// | padding (max alignment)  |
/// +--------------------------+ <- Block address + HEADER_SIZE. This is the
/// |         Payload          |    pointer the caller gets.
/// |           ...            |
/// +--------------------------+ <- Block address + size. Next block starts
///                                 here, there are no gaps.
/// ```
///
/// Unlike the usual free-list allocators there are no next/prev pointers in
/// the header. Blocks tile the region with no gaps, so "next block" is just
/// `address + size`, and the buddy of a block is found with pure address
/// arithmetic (see [`crate::region`]). The header stays two words.
pub(crate) struct BlockHeader {
    /// Total block length in bytes, header included. Always a power of two
    /// and at least [`MIN_BLOCK_SIZE`].
    pub size: usize,
    /// Whether the payload is currently handed out to a caller.
    pub is_free: bool,
}

/// Offset from a block's base address to its payload. The raw struct is 9
/// bytes on 64 bit targets, but the payload has to start at a
/// [`MAX_ALIGN`]-aligned boundary, so we round up (16 bytes on 64 bit).
pub(crate) const HEADER_SIZE: usize = align_up(mem::size_of::<BlockHeader>(), MAX_ALIGN);

/// Smallest total block size we'll ever create by splitting. The payload of a
/// minimum block must hold at least one machine word, and the size must be a
/// power of two so that splitting and merging stay closed over powers of two.
/// 32 bytes on 64 bit targets.
pub(crate) const MIN_BLOCK_SIZE: usize =
    (HEADER_SIZE + mem::size_of::<usize>()).next_power_of_two();

impl BlockHeader {
    /// Payload bytes available in a block of `size` total bytes.
    #[inline]
    pub const fn payload_size_of(size: usize) -> usize {
        size - HEADER_SIZE
    }

    /// Returns the payload address of `block`.
    ///
    /// # Safety
    ///
    /// `block` must point to a live block header inside a region. The result
    /// is valid for `payload_size_of(size)` bytes. We take the pointer by
    /// value instead of going through `&self` to avoid creating intermediary
    /// references to memory the caller may be aliasing right now. See
    /// [Stacked Borrows](https://github.com/rust-lang/unsafe-code-guidelines/blob/master/wip/stacked-borrows.md).
    #[inline]
    pub unsafe fn payload_address_of(block: NonNull<BlockHeader>) -> NonNull<u8> {
        NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(HEADER_SIZE))
    }

    /// Returns the block header that owns the payload at `address`.
    ///
    /// # Safety
    ///
    /// `address` must be a payload address previously produced by
    /// [`Self::payload_address_of`], i.e. a pointer we handed to the caller
    /// and that has not been freed yet. Anything else is undefined behaviour,
    /// we don't attempt to detect foreign pointers.
    #[inline]
    pub unsafe fn from_payload_address(address: NonNull<u8>) -> NonNull<BlockHeader> {
        NonNull::new_unchecked(address.as_ptr().sub(HEADER_SIZE)).cast()
    }

    /// Payload bytes available in this block.
    #[inline]
    pub fn payload_size(&self) -> usize {
        Self::payload_size_of(self.size)
    }

    /// Whether a request of `size` payload bytes fits in this block.
    #[inline]
    pub fn fits(&self, size: usize) -> bool {
        self.payload_size() >= size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_constants() {
        // The payload must start on a max-aligned boundary right after the
        // header.
        assert_eq!(HEADER_SIZE % MAX_ALIGN, 0);
        assert!(HEADER_SIZE >= mem::size_of::<BlockHeader>());

        assert!(MIN_BLOCK_SIZE.is_power_of_two());
        assert!(BlockHeader::payload_size_of(MIN_BLOCK_SIZE) >= mem::size_of::<usize>());
    }

    #[test]
    fn payload_address_round_trip() {
        let mut backing = [0u8; MIN_BLOCK_SIZE * 2];
        // Find a max-aligned spot inside the buffer to fake a block at.
        let base = backing.as_mut_ptr();
        let aligned = unsafe { base.add(base.align_offset(MAX_ALIGN)) };

        let block = NonNull::new(aligned).unwrap().cast::<BlockHeader>();
        unsafe {
            block.as_ptr().write(BlockHeader {
                size: MIN_BLOCK_SIZE,
                is_free: true,
            });

            let payload = BlockHeader::payload_address_of(block);
            assert_eq!(payload.as_ptr() as usize % MAX_ALIGN, 0);
            assert_eq!(BlockHeader::from_payload_address(payload), block);
        }
    }
}
