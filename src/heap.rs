//! The heap: block layout, first-fit placement and heap extension.
//!
//! ```text
//!  arena start                                                     arena end
//!  |                                                                       |
//!  +-----+------+------+--------+-----------+--------+-----------+--------+
//!  | pad | P hdr| P ftr| blk hdr|  payload  | blk ftr|    ...    | E hdr  |
//!  +-----+------+------+--------+-----------+--------+-----------+--------+
//!               ^ prologue      ^ first block                             ^ epilogue
//! ```
//!
//! The prologue is an allocated block with no payload and the epilogue is an
//! allocated header of size zero. Together they guarantee that every real
//! block has an allocated-or-free neighbor on both sides, so neither block
//! traversal nor coalescing needs to special-case the ends of the heap.

use core::marker::PhantomData;

use crate::{
    base::BasePtr,
    codec::{self, BlockOfs, Tag, ALIGNMENT, MIN_BLOCK_SIZE, OVERHEAD, WORD},
    core::{cmp, fmt, ptr::NonNull},
    free_list::{self, FreeList},
    AllocError, AllocInitError, Arena,
};

#[cfg(feature = "sptr")]
use crate::core::ptr::NonNullStrict;

/// The default minimum number of bytes by which the heap is extended.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Bytes claimed from the arena by `init`: a padding word, the prologue's
/// header and footer, and the epilogue header.
const SENTINEL_SIZE: usize = 4 * WORD;

/// Tuning parameters for a [`Heap`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HeapConfig {
    chunk_size: usize,
}

impl HeapConfig {
    /// Returns the default configuration.
    pub const fn new() -> HeapConfig {
        HeapConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Sets the minimum number of bytes by which the heap grows when no free
    /// block can satisfy a request.
    ///
    /// The chunk size must be a multiple of [`ALIGNMENT`] and at least
    /// [`MIN_BLOCK_SIZE`]; this is checked by [`Heap::init_with_config`].
    pub const fn with_chunk_size(self, chunk_size: usize) -> HeapConfig {
        HeapConfig { chunk_size }
    }

    /// Returns the configured chunk size.
    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn validate(&self) -> Result<(), AllocInitError> {
        if self.chunk_size < MIN_BLOCK_SIZE || self.chunk_size % ALIGNMENT != 0 {
            return Err(AllocInitError::InvalidConfig);
        }

        Ok(())
    }
}

impl Default for HeapConfig {
    fn default() -> HeapConfig {
        HeapConfig::new()
    }
}

/// An explicit free-list allocator over an [`Arena`].
///
/// The heap owns its arena exclusively: every byte from the heap's start to
/// the arena's end is a block, a sentinel, or the leading padding word.
pub struct Heap<R: Arena> {
    pub(crate) arena: R,
    pub(crate) base: BasePtr,
    /// Offset at which the heap begins within the arena.
    pub(crate) start: usize,
    pub(crate) prologue: BlockOfs,
    /// The zero-sized block whose header is the last word of the arena.
    pub(crate) epilogue: BlockOfs,
    pub(crate) free_list: FreeList,
    pub(crate) config: HeapConfig,
}

impl<R: Arena> Heap<R> {
    /// Creates a heap in `arena` with the default configuration.
    ///
    /// # Errors
    ///
    /// See [`Heap::init_with_config`].
    pub fn init(arena: R) -> Result<Heap<R>, AllocInitError> {
        Heap::init_with_config(arena, HeapConfig::default())
    }

    /// Creates a heap in `arena`.
    ///
    /// The heap starts at the arena's current end. Only the prologue and
    /// epilogue are written; the first allocation extends the heap.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the following are true:
    /// - `config` is invalid.
    /// - The arena's base or current length is not a multiple of [`ALIGNMENT`].
    /// - The arena cannot grow to hold the prologue and epilogue.
    pub fn init_with_config(mut arena: R, config: HeapConfig) -> Result<Heap<R>, AllocInitError> {
        config.validate()?;

        let base = BasePtr::new(arena.base());
        if base.addr().get() % ALIGNMENT != 0 || arena.len() % ALIGNMENT != 0 {
            return Err(AllocInitError::InvalidConfig);
        }

        let start = arena
            .grow(SENTINEL_SIZE)
            .map_err(|_| AllocInitError::ArenaExhausted)?;

        // Safe unwraps: both offsets are at least one word past `start`.
        let prologue = BlockOfs::new(start + 2 * WORD).unwrap();
        let epilogue = BlockOfs::new(start + SENTINEL_SIZE).unwrap();

        unsafe {
            // SAFETY: the arena just grew by `SENTINEL_SIZE` bytes at `start`.
            base.write_word(start, 0);
            base.write_tags(prologue, Tag::allocated(OVERHEAD));
            base.write_word(epilogue.header(), Tag::allocated(0).pack());
        }

        Ok(Heap {
            arena,
            base,
            start,
            prologue,
            epilogue,
            free_list: FreeList::new(),
            config,
        })
    }

    /// Returns the heap's configuration.
    pub fn config(&self) -> HeapConfig {
        self.config
    }

    /// Returns the number of arena bytes occupied by the heap, sentinels
    /// included.
    pub fn heap_size(&self) -> usize {
        self.arena.len() - self.start
    }

    /// Returns the number of blocks in the free list.
    pub fn free_list_len(&self) -> usize {
        self.free_list.len()
    }

    /// Consumes the heap, returning its arena.
    ///
    /// All outstanding allocations are invalidated.
    pub fn into_arena(self) -> R {
        self.arena
    }

    /// Attempts to allocate a block of at least `size` bytes.
    ///
    /// On success, returns a pointer to the payload, aligned to [`ALIGNMENT`]
    /// bytes. The contents of the block are uninitialized.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidRequest`] if `size` is zero, and
    /// [`AllocError::ArenaExhausted`] if no free block fits and the arena
    /// cannot grow. In either case the heap is left unmodified.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        if size == 0 {
            return Err(AllocError::InvalidRequest);
        }

        let asize = codec::adjusted_size(size).ok_or(AllocError::ArenaExhausted)?;

        let block = match self.find_fit(asize) {
            Some(b) => b,
            None => self.extend(cmp::max(asize, self.config.chunk_size))?,
        };

        unsafe { self.place(block, asize) };

        Ok(self.base.payload(block, size))
    }

    /// Releases the block at `ptr` back to the heap.
    ///
    /// The block is merged with any free neighbors.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block currently allocated by this heap via
    /// [`Heap::allocate`] or [`Heap::resize`].
    pub unsafe fn release(&mut self, ptr: NonNull<u8>) {
        let block = self.block_of(ptr);

        unsafe { self.release_block(block) };
    }

    /// Returns the number of payload bytes available in the block at `ptr`.
    ///
    /// This may exceed the size originally requested.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block currently allocated by this heap.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        let block = self.block_of(ptr);

        unsafe { self.base.header(block) }.size() - OVERHEAD
    }

    /// Returns an iterator over every block between the sentinels, in
    /// address order.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            base: self.base,
            // SAFETY: the prologue is always a valid block.
            cursor: unsafe { self.base.next_block(self.prologue) },
            end: self.epilogue,
            _heap: PhantomData,
        }
    }

    /// Returns an iterator over the free list, head first.
    pub fn free_blocks(&self) -> FreeBlocks<'_> {
        FreeBlocks {
            base: self.base,
            // SAFETY: every listed block is a free block of the heap.
            inner: unsafe { self.free_list.iter(self.base) },
            _heap: PhantomData,
        }
    }

    /// Frees `block` and merges it into its neighbors.
    ///
    /// # Safety
    ///
    /// `block` must be an allocated block of this heap.
    pub(crate) unsafe fn release_block(&mut self, block: BlockOfs) {
        let tag = unsafe { self.base.header(block) };
        debug_assert!(tag.is_allocated(), "block at {:#x} released twice", block.get());

        unsafe {
            self.base.write_tags(block, Tag::free(tag.size()));
            self.coalesce(block);
        }
    }

    /// Maps a payload pointer back to its block.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` does not lie strictly between the sentinels.
    pub(crate) fn block_of(&self, ptr: NonNull<u8>) -> BlockOfs {
        let block = self
            .base
            .offset_to(ptr.addr())
            .filter(|&ofs| ofs > self.prologue.get() && ofs < self.epilogue.get())
            .and_then(BlockOfs::new);

        match block {
            Some(b) => b,
            None => panic!("pointer {:p} does not belong to this heap", ptr),
        }
    }

    /// Finds the first block in the free list of at least `asize` bytes.
    fn find_fit(&self, asize: usize) -> Option<BlockOfs> {
        // SAFETY: every listed block is a free block of the heap.
        unsafe { self.free_list.iter(self.base) }
            .map(|(block, _)| block)
            .find(|&block| unsafe { self.base.header(block) }.size() >= asize)
    }

    /// Grows the heap by `size` bytes, returning the resulting free block.
    ///
    /// The new block replaces the old epilogue and is coalesced with the
    /// block preceding it, so the returned block may start below the old end
    /// of the heap.
    fn extend(&mut self, size: usize) -> Result<BlockOfs, AllocError> {
        let size = codec::align_up(size).ok_or(AllocError::ArenaExhausted)?;
        let old_end = self.arena.grow(size)?;
        debug_assert_eq!(old_end, self.epilogue.get(), "arena grew discontiguously");

        log::trace!("extending heap by {} bytes at {:#x}", size, old_end);

        let block = self.epilogue;

        unsafe {
            // SAFETY: the arena just grew by `size` bytes starting at the old
            // epilogue, whose header becomes the new block's header.
            self.base.write_tags(block, Tag::free(size));
            self.epilogue = block.forward(size);
            self.base
                .write_word(self.epilogue.header(), Tag::allocated(0).pack());

            Ok(self.coalesce(block))
        }
    }

    /// Marks `asize` bytes of the free block `block` as allocated.
    ///
    /// If the remainder could hold a block of its own, it is split off and
    /// returned to the free list.
    ///
    /// # Safety
    ///
    /// `block` must be an element of the free list of at least `asize` bytes.
    unsafe fn place(&mut self, block: BlockOfs, asize: usize) {
        let base = self.base;
        let csize = unsafe { base.header(block) }.size();
        debug_assert!(csize >= asize);

        unsafe { self.free_list.remove(base, block) };

        if csize - asize >= MIN_BLOCK_SIZE {
            log::trace!(
                "splitting block at {:#x}: {} + {} bytes",
                block.get(),
                asize,
                csize - asize
            );

            let rest = block.forward(asize);

            unsafe {
                base.write_tags(block, Tag::allocated(asize));
                base.write_tags(rest, Tag::free(csize - asize));
                self.coalesce(rest);
            }
        } else {
            unsafe { base.write_tags(block, Tag::allocated(csize)) };
        }
    }
}

impl<R: Arena> fmt::Debug for Heap<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("base", &self.base)
            .field("start", &self.start)
            .field("prologue", &self.prologue)
            .field("epilogue", &self.epilogue)
            .field("free_list", &self.free_list)
            .field("config", &self.config)
            .finish()
    }
}

/// A summary of one block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Offset of the block's payload from the base of the arena.
    pub offset: usize,
    /// Total size of the block, header and footer included.
    pub size: usize,
    /// Whether the block is allocated.
    pub allocated: bool,
}

impl BlockInfo {
    fn read(base: BasePtr, block: BlockOfs) -> BlockInfo {
        // SAFETY: callers only pass blocks of a live heap.
        let tag = unsafe { base.header(block) };

        BlockInfo {
            offset: block.get(),
            size: tag.size(),
            allocated: tag.is_allocated(),
        }
    }

    /// Returns the number of payload bytes in the block.
    pub fn usable_size(&self) -> usize {
        self.size - OVERHEAD
    }
}

/// Iterator over the blocks of a heap, returned by [`Heap::blocks`].
#[derive(Clone, Debug)]
pub struct Blocks<'a> {
    base: BasePtr,
    cursor: BlockOfs,
    end: BlockOfs,
    _heap: PhantomData<&'a ()>,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        if self.cursor >= self.end {
            return None;
        }

        let info = BlockInfo::read(self.base, self.cursor);
        if info.size == 0 {
            // Only the epilogue has size zero; anything else is corruption.
            self.cursor = self.end;
            return None;
        }

        self.cursor = self.cursor.forward(info.size);

        Some(info)
    }
}

/// Iterator over the free list of a heap, returned by [`Heap::free_blocks`].
#[derive(Clone, Debug)]
pub struct FreeBlocks<'a> {
    base: BasePtr,
    inner: free_list::Iter,
    _heap: PhantomData<&'a ()>,
}

impl Iterator for FreeBlocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let (block, _) = self.inner.next()?;

        Some(BlockInfo::read(self.base, block))
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec::Vec;

    use super::*;
    use crate::{Global, Region};

    fn heap(capacity: usize) -> Heap<Region<Global>> {
        Heap::init(Region::try_new(capacity).unwrap()).unwrap()
    }

    fn offset_of(heap: &Heap<Region<Global>>, ptr: NonNull<[u8]>) -> usize {
        heap.base.offset_to(ptr.cast::<u8>().addr()).unwrap()
    }

    #[test]
    fn init_writes_only_sentinels() {
        let heap = heap(4096);

        assert_eq!(heap.heap_size(), SENTINEL_SIZE);
        assert_eq!(heap.free_list_len(), 0);
        assert_eq!(heap.blocks().count(), 0);
        assert!(heap.check(false).is_consistent());
    }

    #[test]
    fn init_rejects_bad_config() {
        for chunk_size in [0, MIN_BLOCK_SIZE - ALIGNMENT, DEFAULT_CHUNK_SIZE + 1] {
            let region = Region::try_new(4096).unwrap();
            let config = HeapConfig::new().with_chunk_size(chunk_size);
            let err = Heap::init_with_config(region, config).unwrap_err();
            assert_eq!(err, AllocInitError::InvalidConfig);
        }
    }

    #[test]
    fn init_rejects_unaligned_arena_length() {
        let mut region = Region::try_new(4096).unwrap();
        region.grow(WORD + 1).unwrap();

        let err = Heap::init(region).unwrap_err();
        assert_eq!(err, AllocInitError::InvalidConfig);
    }

    #[test]
    fn init_fails_on_tiny_arena() {
        let region = Region::try_new(SENTINEL_SIZE - WORD).unwrap();

        let err = Heap::init(region).unwrap_err();
        assert_eq!(err, AllocInitError::ArenaExhausted);
    }

    #[test]
    fn heap_starts_at_current_arena_end() {
        let mut region = Region::try_new(64 * 1024).unwrap();
        region.grow(ALIGNMENT).unwrap();

        let mut heap = Heap::init(region).unwrap();
        assert_eq!(heap.start, ALIGNMENT);
        assert_eq!(heap.heap_size(), SENTINEL_SIZE);
        assert!(heap.check(false).is_consistent());

        let a = heap.allocate(100).unwrap();
        assert_eq!(offset_of(&heap, a), ALIGNMENT + SENTINEL_SIZE);
        assert_eq!(offset_of(&heap, a) % ALIGNMENT, 0);
        assert_eq!(heap.heap_size(), SENTINEL_SIZE + DEFAULT_CHUNK_SIZE);
        assert!(heap.check(false).is_consistent());

        unsafe { heap.release(a.cast()) };
        let blocks: Vec<_> = heap.blocks().collect();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].size, DEFAULT_CHUNK_SIZE);
        assert!(heap.check(false).is_consistent());
    }

    #[test]
    fn zero_size_allocation_is_rejected_without_side_effects() {
        let mut heap = heap(64 * 1024);
        let a = heap.allocate(64).unwrap();

        let size_before = heap.heap_size();
        let free_before = heap.free_list_len();

        for _ in 0..3 {
            assert_eq!(heap.allocate(0), Err(AllocError::InvalidRequest));
        }

        assert_eq!(heap.heap_size(), size_before);
        assert_eq!(heap.free_list_len(), free_before);

        unsafe { heap.release(a.cast()) };
    }

    #[test]
    fn oversized_request_fails() {
        let mut heap = heap(4096);

        assert_eq!(heap.allocate(usize::MAX), Err(AllocError::ArenaExhausted));
        assert_eq!(heap.allocate(usize::MAX - OVERHEAD), Err(AllocError::ArenaExhausted));
        assert_eq!(heap.heap_size(), SENTINEL_SIZE);
    }

    #[test]
    fn allocations_are_aligned_and_sufficient() {
        let mut heap = heap(256 * 1024);
        let mut live = Vec::new();

        for size in 1..300 {
            let ptr = heap.allocate(size).unwrap();
            assert_eq!(ptr.len(), size);
            assert_eq!(ptr.cast::<u8>().addr().get() % ALIGNMENT, 0);
            assert!(unsafe { heap.usable_size(ptr.cast()) } >= size);

            // Fill the whole payload; adjacent tags must survive.
            unsafe { ptr.cast::<u8>().as_ptr().write_bytes(0xA5, size) };
            live.push(ptr);
        }

        assert!(heap.check(false).is_consistent());

        for ptr in live {
            unsafe { heap.release(ptr.cast()) };
        }

        assert!(heap.check(false).is_consistent());
        assert_eq!(heap.free_list_len(), 1);
    }

    #[test]
    fn first_fit_reuses_released_block() {
        let mut heap = heap(64 * 1024);

        let a = heap.allocate(100).unwrap();
        let b = heap.allocate(200).unwrap();
        unsafe { heap.release(a.cast()) };

        let c = heap.allocate(90).unwrap();
        assert_eq!(c.cast::<u8>(), a.cast::<u8>());

        unsafe { heap.release(b.cast()) };

        let report = heap.check(true);
        assert!(report.is_consistent());
        assert_eq!(report.violations, 0);

        unsafe { heap.release(c.cast()) };
    }

    #[test]
    fn first_fit_prefers_most_recently_released() {
        let mut heap = heap(64 * 1024);

        let a = heap.allocate(64).unwrap();
        let _x = heap.allocate(64).unwrap();
        let b = heap.allocate(64).unwrap();
        let _y = heap.allocate(64).unwrap();

        unsafe {
            heap.release(a.cast());
            heap.release(b.cast());
        }

        // Both fit; `b` was pushed last, so it sits at the head.
        let c = heap.allocate(64).unwrap();
        assert_eq!(c.cast::<u8>(), b.cast::<u8>());
    }

    #[test]
    fn placement_splits_large_blocks() {
        let mut heap = heap(64 * 1024);

        let a = heap.allocate(100).unwrap();
        let asize = codec::adjusted_size(100).unwrap();

        let blocks: Vec<_> = heap.blocks().collect();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].size, asize);
        assert!(blocks[0].allocated);
        assert_eq!(blocks[1].size, DEFAULT_CHUNK_SIZE - asize);
        assert!(!blocks[1].allocated);
        assert_eq!(blocks[0].offset, offset_of(&heap, a));
    }

    #[test]
    fn placement_keeps_small_remainders() {
        let config = HeapConfig::new().with_chunk_size(MIN_BLOCK_SIZE);
        let mut heap = Heap::init_with_config(Region::try_new(4096).unwrap(), config).unwrap();

        // A one-block chunk: nothing left to split off.
        let a = heap.allocate(1).unwrap();
        assert_eq!(heap.free_list_len(), 0);
        assert_eq!(unsafe { heap.usable_size(a.cast()) }, MIN_BLOCK_SIZE - OVERHEAD);
    }

    #[test]
    fn adjacent_releases_coalesce_in_either_order() {
        let config = HeapConfig::new().with_chunk_size(MIN_BLOCK_SIZE);

        for reverse in [false, true] {
            let region = Region::try_new(4096).unwrap();
            let mut heap = Heap::init_with_config(region, config).unwrap();

            let a = heap.allocate(16).unwrap();
            let b = heap.allocate(16).unwrap();
            assert_eq!(offset_of(&heap, b), offset_of(&heap, a) + MIN_BLOCK_SIZE);

            unsafe {
                if reverse {
                    heap.release(b.cast());
                    heap.release(a.cast());
                } else {
                    heap.release(a.cast());
                    heap.release(b.cast());
                }
            }

            let free: Vec<_> = heap.free_blocks().collect();
            assert_eq!(free.len(), 1);
            assert_eq!(free[0].offset, offset_of(&heap, a));
            assert_eq!(free[0].size, 2 * MIN_BLOCK_SIZE);
            assert!(heap.check(false).is_consistent());
        }
    }

    #[test]
    fn extension_merges_with_trailing_free_block() {
        let mut heap = heap(64 * 1024);

        let asize = codec::adjusted_size(4000).unwrap();
        let a = heap.allocate(4000).unwrap();
        assert_eq!(heap.free_list_len(), 1);

        // The trailing sliver is too small; the heap grows and the new chunk
        // is merged with the sliver, so `b` starts right after `a`.
        let b = heap.allocate(200).unwrap();
        assert_eq!(offset_of(&heap, b), offset_of(&heap, a) + asize);
        assert_eq!(heap.heap_size(), SENTINEL_SIZE + 2 * DEFAULT_CHUNK_SIZE);
        assert_eq!(heap.free_list_len(), 1);
        assert!(heap.check(false).is_consistent());
    }

    #[test]
    fn large_requests_extend_by_request_size() {
        let mut heap = heap(64 * 1024);

        heap.allocate(3 * DEFAULT_CHUNK_SIZE).unwrap();
        let asize = codec::adjusted_size(3 * DEFAULT_CHUNK_SIZE).unwrap();
        assert_eq!(heap.heap_size(), SENTINEL_SIZE + asize);
        assert_eq!(heap.free_list_len(), 0);
    }

    #[test]
    fn exhaustion_leaves_heap_untouched() {
        let mut heap = heap(SENTINEL_SIZE + DEFAULT_CHUNK_SIZE);

        let a = heap.allocate(4000).unwrap();
        let size_before = heap.heap_size();
        let free_before: Vec<_> = heap.free_blocks().collect();

        assert_eq!(heap.allocate(200), Err(AllocError::ArenaExhausted));

        assert_eq!(heap.heap_size(), size_before);
        assert_eq!(heap.free_blocks().collect::<Vec<_>>(), free_before);
        assert!(heap.check(false).is_consistent());

        // Space freed afterwards is usable again.
        unsafe { heap.release(a.cast()) };
        heap.allocate(200).unwrap();
    }

    #[test]
    fn release_everything_leaves_one_free_block() {
        let mut heap = heap(64 * 1024);

        let ptrs: Vec<_> = (1..=20).map(|i| heap.allocate(i * 24).unwrap()).collect();

        // Release every other block first, then the rest.
        for ptr in ptrs.iter().step_by(2) {
            unsafe { heap.release(ptr.cast()) };
        }
        assert!(heap.check(false).is_consistent());

        for ptr in ptrs.iter().skip(1).step_by(2) {
            unsafe { heap.release(ptr.cast()) };
        }

        let blocks: Vec<_> = heap.blocks().collect();
        assert_eq!(blocks.len(), 1);
        assert!(!blocks[0].allocated);
        assert_eq!(blocks[0].size, heap.heap_size() - SENTINEL_SIZE);
    }

    #[test]
    #[should_panic]
    fn foreign_pointer_panics() {
        let mut heap = heap(4096);
        let mut other = 0u64;

        unsafe { heap.release(NonNull::from(&mut other).cast()) };
    }
}
