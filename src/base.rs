use crate::core::{
    num::NonZeroUsize,
    ptr::{self, NonNull},
};

#[cfg(feature = "sptr")]
use crate::core::ptr::NonNullStrict;

use crate::codec::{BlockOfs, Tag, WORD};

/// A pointer to the base of the arena managed by a heap.
///
/// Every location in the heap is named by its offset from this pointer.
/// Pointers handed out to callers are derived from it, so they carry the
/// provenance of the whole arena.
#[derive(Copy, Clone, Debug)]
pub struct BasePtr {
    ptr: NonNull<u8>,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr`.
    ///
    /// The returned value assumes the provenance of `ptr`.
    #[inline]
    pub fn new(ptr: NonNull<u8>) -> BasePtr {
        BasePtr { ptr }
    }

    /// Returns the address of the base pointer.
    #[inline]
    pub fn addr(self) -> NonZeroUsize {
        self.ptr.addr()
    }

    /// Calculates the offset from `self` to `addr`.
    ///
    /// Returns `None` if `addr` lies below the base.
    #[inline]
    pub fn offset_to(self, addr: NonZeroUsize) -> Option<usize> {
        addr.get().checked_sub(self.addr().get())
    }

    /// Creates a pointer to the first `len` bytes of `block`'s payload.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn payload(self, block: BlockOfs, len: usize) -> NonNull<[u8]> {
        let start = self.ptr.as_ptr().wrapping_add(block.get());
        let raw_slice = ptr::slice_from_raw_parts_mut(start, len);

        // SAFETY: `block` lies within the arena, which does not wrap the
        // address space, so `start` is non-null.
        unsafe { NonNull::new_unchecked(raw_slice) }
    }

    /// Reads the word at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `offset` must be a multiple of `WORD`.
    /// - The memory at `offset` must be within the provenance of `self` and
    ///   valid for reads of `WORD` bytes.
    #[inline]
    pub unsafe fn read_word(self, offset: usize) -> usize {
        debug_assert_eq!(offset % WORD, 0, "misaligned word offset");

        unsafe { self.word_ptr(offset).read() }
    }

    /// Writes `value` to the word at `offset`.
    ///
    /// # Safety
    ///
    /// Same as [`BasePtr::read_word`], and the memory must additionally be
    /// valid for writes and not owned by a caller of the heap.
    #[inline]
    pub unsafe fn write_word(self, offset: usize, value: usize) {
        debug_assert_eq!(offset % WORD, 0, "misaligned word offset");

        unsafe { self.word_ptr(offset).write(value) }
    }

    /// Reads the boundary tag stored at `offset`.
    ///
    /// # Safety
    ///
    /// See [`BasePtr::read_word`].
    #[inline]
    pub unsafe fn read_tag(self, offset: usize) -> Tag {
        Tag::unpack(unsafe { self.read_word(offset) })
    }

    /// Initializes a `FreeLink` in the payload of `block`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - The payload of `block` must be within the provenance of `self` and
    ///   valid for reads and writes for `size_of::<FreeLink>()` bytes.
    /// - `block` must be free.
    #[inline]
    pub unsafe fn init_link_at(self, block: BlockOfs, link: FreeLink) {
        unsafe { self.link_ptr(block).write(link) };
    }

    /// Returns a mutable reference to the `FreeLink` in the payload of `block`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - The payload of `block` must contain a properly initialized `FreeLink`.
    /// - The payload of `block` must be within the provenance of `self` and
    ///   free, so that no caller holds a reference into it.
    #[inline]
    pub unsafe fn link_mut<'a>(self, block: BlockOfs) -> &'a mut FreeLink {
        unsafe { &mut *self.link_ptr(block) }
    }

    /// Returns a shared reference to the `FreeLink` in the payload of `block`.
    ///
    /// # Safety
    ///
    /// See [`BasePtr::link_mut`].
    #[inline]
    pub unsafe fn link<'a>(self, block: BlockOfs) -> &'a FreeLink {
        unsafe { &*self.link_ptr(block) }
    }

    #[inline]
    fn word_ptr(self, offset: usize) -> *mut usize {
        self.ptr.as_ptr().wrapping_add(offset).cast::<usize>()
    }

    #[inline]
    fn link_ptr(self, block: BlockOfs) -> *mut FreeLink {
        self.ptr.as_ptr().wrapping_add(block.get()).cast::<FreeLink>()
    }
}

// Rather than using pointers, store only the offsets of the previous and
// next blocks.  This avoids accidentally violating stacked borrows; the
// links "point to" other blocks, but by forgoing actual pointers, no borrow
// is implied.
//
// NOTE: Using this method, any actual pointer to a block must be acquired
// via the heap's base pointer, and NOT by interpreting these offsets
// directly!

/// A double link in the free list.
///
/// This type overlays the first two words of a free block's payload, forming
/// an intrusive doubly linked list. It is meaningless once the block is
/// allocated.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FreeLink {
    pub prev: Option<BlockOfs>,
    pub next: Option<BlockOfs>,
}
