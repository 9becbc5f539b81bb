use crate::{
    codec::{self, Tag, MIN_BLOCK_SIZE, OVERHEAD},
    core::{
        cmp,
        ptr::{self, NonNull},
    },
    heap::Heap,
    AllocError, Arena,
};

impl<R: Arena> Heap<R> {
    /// Resizes the block at `ptr` to hold at least `new_size` bytes.
    ///
    /// The block is shrunk or grown in place when possible. Otherwise a new
    /// block is allocated, the old contents are copied over, and the old
    /// block is released. In every case the first `min(new_size, old usable
    /// size)` bytes of the payload are preserved.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidRequest`] if `new_size` is zero, and
    /// [`AllocError::ArenaExhausted`] if the block can neither be grown in
    /// place nor moved. On error the block at `ptr` is left untouched and
    /// remains valid.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block currently allocated by this heap. On success
    /// `ptr` is invalidated, even if the returned pointer has the same
    /// address.
    pub unsafe fn resize(
        &mut self,
        ptr: NonNull<u8>,
        new_size: usize,
    ) -> Result<NonNull<[u8]>, AllocError> {
        if new_size == 0 {
            return Err(AllocError::InvalidRequest);
        }

        let base = self.base;
        let block = self.block_of(ptr);
        let asize = codec::adjusted_size(new_size).ok_or(AllocError::ArenaExhausted)?;
        let csize = unsafe { base.header(block) }.size();

        if asize <= csize {
            if csize - asize >= MIN_BLOCK_SIZE {
                log::trace!(
                    "shrinking block at {:#x}: {} -> {} bytes",
                    block.get(),
                    csize,
                    asize
                );

                let rest = block.forward(asize);

                unsafe {
                    base.write_tags(block, Tag::allocated(asize));
                    base.write_tags(rest, Tag::allocated(csize - asize));
                    self.release_block(rest);
                }
            }

            return Ok(base.payload(block, new_size));
        }

        let next = unsafe { base.next_block(block) };
        let next_tag = unsafe { base.header(next) };

        if !next_tag.is_allocated() && csize + next_tag.size() >= asize {
            let size = csize + next_tag.size();
            log::trace!(
                "growing block at {:#x} in place: {} -> {} bytes",
                block.get(),
                csize,
                size
            );

            unsafe {
                self.free_list.remove(base, next);
                base.write_tags(block, Tag::allocated(size));
            }

            return Ok(base.payload(block, new_size));
        }

        let new = self.allocate(new_size)?;
        let count = cmp::min(new_size, csize - OVERHEAD);

        unsafe {
            // SAFETY: the old block is still allocated, so the new block
            // cannot overlap it.
            ptr::copy_nonoverlapping(ptr.as_ptr(), new.cast::<u8>().as_ptr(), count);
            self.release_block(block);
        }

        Ok(new)
    }
}
