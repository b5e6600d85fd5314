//! Buddy memory allocator. The engine manages a single contiguous region of
//! memory tiled by power-of-two sized blocks: blocks are split in half on
//! demand to satisfy allocations and freed neighbors are merged back into
//! bigger blocks. Two flavours are built on top of the same engine:
//!
//! - [`BuddyArena`]: the caller hands us a chunk of raw memory and we manage
//! only that chunk. Nothing global, nothing OS specific.
//!
//! - The heap replacement ([`allocate`], [`free`], [`reallocate`],
//! [`zero_allocate`] and the [`Buddyloc`] type implementing
//! [`std::alloc::GlobalAlloc`]): a process wide heap bootstrapped from the
//! program break and grown on demand. With the `stdlib-override` feature the
//! four entry points are also exported under the C names, so a `cdylib` build
//! can be preloaded under unmodified binaries.
//!
//! Reading order if you want to understand the whole thing: [`block`],
//! [`region`], [`arena`], [`platform`], [`heap`], [`allocator`].

use std::ptr::NonNull;

mod alignment;
mod allocator;
mod arena;
mod block;
mod heap;
#[cfg(feature = "stdlib-override")]
mod interpose;
mod platform;
mod region;

/// Non-null pointer to `T`. We use this in most cases instead of `*mut T`
/// because the compiler will yell at us if we don't write code for the `None`
/// case.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

pub use allocator::Buddyloc;
pub use arena::BuddyArena;
pub use heap::{allocate, free, reallocate, zero_allocate};
