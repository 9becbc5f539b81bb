//! An explicit free-list allocator with boundary-tag coalescing.
//!
//! A [`Heap`] carves allocations out of an [`Arena`], a contiguous region of
//! bytes that grows at its end on demand. Each block carries a header and a
//! footer word recording its size and whether it is allocated; free blocks are
//! additionally linked into an unordered free list through their payloads.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case          |
//! |--------------------------|-----------|---------------------|
//! | Allocate                 | O(1)      | O(free blocks)      |
//! | Release                  | O(1)      | O(1)                |
//! | Resize                   | O(1)      | O(free blocks + n)  |
//!
//! #### Fragmentation
//!
//! Placement is first-fit over the free list in most-recently-freed order.
//! Blocks are split when the remainder can hold a free block of its own, and
//! released blocks are immediately merged with free neighbors, so no two free
//! blocks are ever adjacent. Internal fragmentation is bounded by
//! [`MIN_BLOCK_SIZE`] plus alignment padding per allocation.
//!
//! ## Example
//!
//! ```
//! use core::ptr::NonNull;
//! use tagalloc::{Heap, Region};
//!
//! #[repr(C, align(16))]
//! struct Memory([u8; 16 * 1024]);
//!
//! let mut memory = Memory([0; 16 * 1024]);
//! let base = NonNull::new(memory.0.as_mut_ptr()).unwrap();
//!
//! // SAFETY: `memory` outlives the heap and is not touched while it exists.
//! let region = unsafe { Region::new_raw(base, memory.0.len()) }.unwrap();
//! let mut heap = Heap::init(region).unwrap();
//!
//! let a = heap.allocate(100).unwrap();
//! let b = heap.allocate(200).unwrap();
//! unsafe {
//!     heap.release(a.cast());
//!     let b = heap.resize(b.cast(), 400).unwrap();
//!     heap.release(b.cast());
//! }
//!
//! assert!(heap.check(false).is_consistent());
//! ```
//!
//! ## Thread safety
//!
//! A `Heap` is a plain owned value; every operation takes `&mut self`. It is
//! neither `Send` nor `Sync`, and callers sharing one across threads must
//! provide their own locking.

#![doc(html_root_url = "https://docs.rs/tagalloc/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(docs_rs, feature(doc_cfg))]
// This is necessary to allow `sptr` to shadow methods provided by newer
// versions of `core`.
#![allow(unstable_name_collisions)]

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

mod base;
mod check;
mod coalesce;
mod core;
mod free_list;
mod heap;
mod resize;

pub mod arena;
pub mod codec;


use crate::core::{alloc::Layout, ptr::NonNull};

pub use crate::{
    arena::{Arena, Region},
    check::{CheckReport, Violation},
    codec::{ALIGNMENT, MIN_BLOCK_SIZE, OVERHEAD},
    heap::{BlockInfo, Blocks, FreeBlocks, Heap, HeapConfig, DEFAULT_CHUNK_SIZE},
};

/// Indicates an allocation failure.
#[derive(Copy, Clone, PartialEq, Eq, Debug, thiserror::Error)]
pub enum AllocError {
    /// The arena could not grow far enough to satisfy the request.
    ///
    /// Requests whose size overflows once block overhead is added are also
    /// reported this way.
    #[error("arena exhausted")]
    ArenaExhausted,

    /// The request was invalid, e.g. for zero bytes.
    ///
    /// The heap is not modified.
    #[error("invalid allocation request")]
    InvalidRequest,
}

/// Indicates that an [`Arena`] refused to grow.
#[derive(Copy, Clone, PartialEq, Eq, Debug, thiserror::Error)]
#[error("arena capacity exceeded")]
pub struct ArenaExhausted;

impl From<ArenaExhausted> for AllocError {
    fn from(_: ArenaExhausted) -> AllocError {
        AllocError::ArenaExhausted
    }
}

/// The error type for allocator constructors.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AllocInitError {
    /// A necessary allocation failed.
    ///
    /// This variant is returned when a constructor attempts to allocate
    /// memory for the managed region, but the underlying allocator fails.
    ///
    /// The variant contains the [`Layout`] that could not be allocated.
    #[error("failed to allocate {0:?}")]
    AllocFailed(Layout),

    /// The configuration of the allocator is invalid.
    ///
    /// This variant is returned when an allocator's configuration
    /// parameters are impossible to satisfy.
    #[error("invalid allocator configuration")]
    InvalidConfig,

    /// The location of the allocator is invalid.
    ///
    /// This variant is returned when the full size of the managed region
    /// would not fit at the provided address, i.e., pointer calculations
    /// would overflow.
    #[error("managed region would overflow the address space")]
    InvalidLocation,

    /// The arena cannot hold even the heap's sentinel blocks.
    #[error("arena too small for heap sentinels")]
    ArenaExhausted,
}

/// Types which provide memory which backs an allocator.
///
/// This trait is implemented by the following types:
/// - The `Raw` marker type indicates that an allocator is not backed by another
///   allocator. This is the case when constructing the allocator from raw
///   pointers. Memory used by this allocator can be reclaimed using
///   `.into_raw_parts()`.
/// - The `Global` marker type indicates that an allocator is backed by the
///   global allocator. The allocator will free its memory on drop.
pub trait BackingAllocator: Sealed {
    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Safety
    ///
    /// * `ptr` must denote a block of memory [*currently allocated*] via this allocator, and
    /// * `layout` must [*fit*] that block of memory.
    ///
    /// [*currently allocated*]: https://doc.rust-lang.org/nightly/alloc/alloc/trait.Allocator.html#currently-allocated-memory
    /// [*fit*]: https://doc.rust-lang.org/nightly/alloc/alloc/trait.Allocator.html#memory-fitting
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A marker type indicating that an allocator is backed by raw pointers.
#[derive(Clone, Debug)]
pub struct Raw;
impl Sealed for Raw {}
impl BackingAllocator for Raw {
    unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {}
}

#[cfg(any(feature = "alloc", test))]
/// The global memory allocator.
#[derive(Clone, Debug)]
pub struct Global;

#[cfg(any(feature = "alloc", test))]
impl Sealed for Global {}

#[cfg(any(feature = "alloc", test))]
impl BackingAllocator for Global {
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

#[doc(hidden)]
mod private {
    pub trait Sealed {}
}
use private::Sealed;
