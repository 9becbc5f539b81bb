//! The explicit free list.
//!
//! Free blocks are threaded into an unordered, doubly linked list through
//! the [`FreeLink`] stored in their payloads. New blocks are pushed at the
//! head; removal is O(1) because callers always hold the block's offset.

use crate::{
    base::{BasePtr, FreeLink},
    codec::BlockOfs,
    core::fmt,
};

/// The head of the free list, plus its length.
pub(crate) struct FreeList {
    head: Option<BlockOfs>,
    len: usize,
}

impl FreeList {
    /// Creates an empty free list.
    pub const fn new() -> FreeList {
        FreeList { head: None, len: 0 }
    }

    /// Returns the first block in the list.
    #[inline]
    pub fn head(&self) -> Option<BlockOfs> {
        self.head
    }

    /// Returns the number of blocks in the list.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Pushes a block onto the head of the free list.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `new_head` must be a free block of at least `MIN_BLOCK_SIZE` bytes
    ///   within the provenance of `base`.
    /// - `new_head` must not already be an element of the list.
    pub unsafe fn push(&mut self, base: BasePtr, new_head: BlockOfs) {
        // An empty list has no old head whose back link needs fixing.
        if let Some(old_head) = self.head {
            let old_head_mut = unsafe { base.link_mut(old_head) };
            old_head_mut.prev = Some(new_head);
        }

        // `new_head` points forward to `old_head`.
        unsafe {
            base.init_link_at(
                new_head,
                FreeLink {
                    prev: None,
                    next: self.head,
                },
            )
        };

        self.head = Some(new_head);
        self.len += 1;
    }

    /// Removes the specified block from the free list.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - The payload of `block` must be within the provenance of `base` and
    ///   valid for reads and writes for `size_of::<FreeLink>()` bytes.
    /// - `block` must be an element of `self`.
    pub unsafe fn remove(&mut self, base: BasePtr, block: BlockOfs) {
        unsafe {
            let removed = *base.link(block);

            match removed.prev {
                // Link `prev` forward to `next`.
                Some(p) => base.link_mut(p).next = removed.next,

                // If there's no previous block, then `removed` is the head of
                // the free list.
                None => {
                    debug_assert_eq!(self.head, Some(block), "unlinked block is not the head");
                    self.head = removed.next;
                }
            }

            if let Some(n) = removed.next {
                // Link `next` back to `prev`.
                base.link_mut(n).prev = removed.prev;
            }
        }

        self.len -= 1;
    }

    /// Returns an iterator over the blocks in the list, head first.
    ///
    /// # Safety
    ///
    /// Every link reachable from the head must be properly initialized and
    /// within the provenance of `base`.
    pub unsafe fn iter(&self, base: BasePtr) -> Iter {
        Iter {
            base,
            cursor: self.head,
            remaining: self.len,
        }
    }
}

impl fmt::Debug for FreeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeList")
            .field("head", &self.head)
            .field("len", &self.len)
            .finish()
    }
}

/// Iterator over the free list.
///
/// Stops after `len` steps even if the links form a cycle, so that a
/// corrupted list cannot hang the consistency checker.
#[derive(Clone, Debug)]
pub(crate) struct Iter {
    base: BasePtr,
    cursor: Option<BlockOfs>,
    remaining: usize,
}

impl Iterator for Iter {
    type Item = (BlockOfs, FreeLink);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        let block = self.cursor?;
        // SAFETY: upheld by the caller of `FreeList::iter`.
        let link = unsafe { *self.base.link(block) };

        self.cursor = link.next;
        self.remaining -= 1;

        Some((block, link))
    }
}
