//! Boundary-tag encoding.
//!
//! Every block in the heap is bracketed by two identical tag words:
//!
//! ```text
//!            header                 payload                footer
//!         +---------+----------------------------------+---------+
//!   ...   | size|a  |  prev | next |       ...         | size|a  |   ...
//!         +---------+----------------------------------+---------+
//!                   ^ block offset (BlockOfs)
//! ```
//!
//! `size` counts the whole block, tags included, and is always a multiple of
//! [`ALIGNMENT`], which leaves the low bits of the tag word free to carry the
//! allocated flag `a`. The `prev`/`next` links exist only while the block is
//! free.

use crate::{
    base::{BasePtr, FreeLink},
    core::{mem, num::NonZeroUsize},
};

/// Size of a tag word.
pub const WORD: usize = mem::size_of::<usize>();

/// Alignment of every payload handed out by the heap.
pub const ALIGNMENT: usize = 2 * WORD;

/// Per-block bookkeeping: one header word and one footer word.
pub const OVERHEAD: usize = 2 * WORD;

/// The smallest block that can later hold the free-list links.
///
/// Every block, allocated or not, is at least this large, because any
/// allocated block may be released back into the free list.
pub const MIN_BLOCK_SIZE: usize = align_up_const(OVERHEAD + mem::size_of::<FreeLink>());

const FLAG_MASK: usize = 0x7;
const ALLOCATED: usize = 0x1;

const fn align_up_const(size: usize) -> usize {
    (size + (ALIGNMENT - 1)) & !(ALIGNMENT - 1)
}

/// Rounds `size` up to the next multiple of [`ALIGNMENT`].
///
/// Returns `None` on overflow.
#[inline]
pub fn align_up(size: usize) -> Option<usize> {
    Some(size.checked_add(ALIGNMENT - 1)? & !(ALIGNMENT - 1))
}

/// Computes the block size needed to serve a request for `size` payload bytes.
///
/// Returns `None` if the adjusted size does not fit in a `usize`.
#[inline]
pub fn adjusted_size(size: usize) -> Option<usize> {
    let padded = align_up(size.checked_add(OVERHEAD)?)?;
    Some(padded.max(MIN_BLOCK_SIZE))
}

/// The decoded contents of a header or footer word.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    size: usize,
    allocated: bool,
}

impl Tag {
    /// Creates a tag for a block of `size` bytes.
    #[inline]
    pub fn new(size: usize, allocated: bool) -> Tag {
        debug_assert_eq!(size & FLAG_MASK, 0, "block size must be 8-byte aligned");

        Tag { size, allocated }
    }

    /// Creates a tag for a free block of `size` bytes.
    #[inline]
    pub fn free(size: usize) -> Tag {
        Tag::new(size, false)
    }

    /// Creates a tag for an allocated block of `size` bytes.
    #[inline]
    pub fn allocated(size: usize) -> Tag {
        Tag::new(size, true)
    }

    /// Decodes a tag word.
    #[inline]
    pub fn unpack(word: usize) -> Tag {
        Tag {
            size: word & !FLAG_MASK,
            allocated: word & ALLOCATED != 0,
        }
    }

    /// Encodes this tag as a word.
    #[inline]
    pub fn pack(self) -> usize {
        self.size | if self.allocated { ALLOCATED } else { 0 }
    }

    /// Returns the total size of the block, tags included.
    #[inline]
    pub fn size(self) -> usize {
        self.size
    }

    /// Returns `true` if the block is allocated.
    #[inline]
    pub fn is_allocated(self) -> bool {
        self.allocated
    }
}

/// The offset of a block's payload from the base of the arena.
///
/// Payload offsets are never zero: at least a padding word and the prologue
/// header precede the first payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockOfs(NonZeroUsize);

impl BlockOfs {
    /// Creates a block offset, returning `None` if `ofs` is zero.
    #[inline]
    pub fn new(ofs: usize) -> Option<BlockOfs> {
        NonZeroUsize::new(ofs).map(BlockOfs)
    }

    /// Returns the offset as a `usize`.
    #[inline]
    pub fn get(self) -> usize {
        self.0.get()
    }

    /// Offset of this block's header word.
    #[inline]
    pub fn header(self) -> usize {
        self.get() - WORD
    }

    /// Offset of this block's footer word, given the block's size.
    #[inline]
    pub fn footer(self, size: usize) -> usize {
        self.get() + size - OVERHEAD
    }

    /// Offset of the footer of the block physically preceding this one.
    #[inline]
    pub fn prev_footer(self) -> usize {
        self.get() - OVERHEAD
    }

    /// Returns `true` if the payload satisfies [`ALIGNMENT`].
    #[inline]
    pub fn is_aligned(self) -> bool {
        self.get() % ALIGNMENT == 0
    }

    /// Returns the block `size` bytes further into the heap.
    #[inline]
    pub(crate) fn forward(self, size: usize) -> BlockOfs {
        // Safe unwrap: adding to a nonzero offset stays nonzero.
        BlockOfs::new(self.get() + size).unwrap()
    }
}

impl BasePtr {
    /// Reads the header of `block`.
    ///
    /// # Safety
    ///
    /// `block` must name a block within the heap managed through `self`.
    #[inline]
    pub unsafe fn header(self, block: BlockOfs) -> Tag {
        unsafe { self.read_tag(block.header()) }
    }

    /// Reads the footer of `block`, locating it through the header's size.
    ///
    /// # Safety
    ///
    /// `block` must name a block within the heap managed through `self`, and
    /// its header must describe a block that fits in the heap.
    #[inline]
    pub unsafe fn footer(self, block: BlockOfs) -> Tag {
        let size = unsafe { self.header(block) }.size();
        unsafe { self.read_tag(block.footer(size)) }
    }

    /// Writes identical header and footer tags for `block`.
    ///
    /// # Safety
    ///
    /// The `tag.size()` bytes starting at `block.header()` must lie within the
    /// heap and must not be owned by a caller.
    #[inline]
    pub unsafe fn write_tags(self, block: BlockOfs, tag: Tag) {
        let word = tag.pack();

        unsafe {
            self.write_word(block.header(), word);
            self.write_word(block.footer(tag.size()), word);
        }
    }

    /// Returns the block physically following `block`.
    ///
    /// # Safety
    ///
    /// `block` must name a block within the heap managed through `self`.
    #[inline]
    pub unsafe fn next_block(self, block: BlockOfs) -> BlockOfs {
        let size = unsafe { self.header(block) }.size();
        block.forward(size)
    }

    /// Returns the block physically preceding `block`.
    ///
    /// The predecessor is located by reading its footer, which sits directly
    /// below `block`'s header. Returns `None` if `block` is `floor` (the
    /// prologue) or if the footer describes a block reaching below `floor`.
    ///
    /// # Safety
    ///
    /// `block` must name a block within the heap managed through `self`, and
    /// `floor` must be the heap's prologue.
    #[inline]
    pub unsafe fn prev_block(self, block: BlockOfs, floor: BlockOfs) -> Option<BlockOfs> {
        if block <= floor {
            return None;
        }

        let size = unsafe { self.read_tag(block.prev_footer()) }.size();
        let prev = BlockOfs::new(block.get().checked_sub(size)?)?;

        (prev >= floor).then_some(prev)
    }
}
