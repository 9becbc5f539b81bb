//! Boundary-tag coalescing.
//!
//! Every block that becomes free, whether released, split off, or freshly
//! claimed from the arena, passes through [`Heap::coalesce`]. It is the only
//! place that pushes onto the free list, which keeps the list's membership
//! equal to the set of free blocks.

use crate::{
    codec::{BlockOfs, Tag},
    heap::Heap,
    Arena,
};

impl<R: Arena> Heap<R> {
    /// Merges the free block `block` with its free neighbors and pushes the
    /// result onto the free list.
    ///
    /// Returns the merged block, which starts at the predecessor if the
    /// predecessor was free.
    ///
    /// # Safety
    ///
    /// `block` must be a block of this heap whose tags are already marked
    /// free, and it must not be an element of the free list.
    pub(crate) unsafe fn coalesce(&mut self, block: BlockOfs) -> BlockOfs {
        let base = self.base;

        let (merged, size) = unsafe {
            let size = base.header(block).size();

            // The predecessor's footer sits right below `block`'s header. The
            // prologue guarantees there always is one.
            let prev = match base.prev_block(block, self.prologue) {
                Some(p) if !base.read_tag(block.prev_footer()).is_allocated() => Some(p),
                _ => None,
            };

            // The epilogue guarantees there always is a successor header.
            let next = base.next_block(block);
            let next = (!base.header(next).is_allocated()).then_some(next);

            match (prev, next) {
                (None, None) => (block, size),

                (None, Some(n)) => {
                    self.free_list.remove(base, n);
                    (block, size + base.header(n).size())
                }

                (Some(p), None) => {
                    self.free_list.remove(base, p);
                    (p, base.header(p).size() + size)
                }

                (Some(p), Some(n)) => {
                    self.free_list.remove(base, p);
                    self.free_list.remove(base, n);
                    (p, base.header(p).size() + size + base.header(n).size())
                }
            }
        };

        unsafe {
            base.write_tags(merged, Tag::free(size));
            self.free_list.push(base, merged);
        }

        merged
    }
}
