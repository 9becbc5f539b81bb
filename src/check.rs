//! Read-only heap consistency checking.
//!
//! [`Heap::check`] walks the heap from the prologue to the epilogue and then
//! walks the free list, reporting every broken invariant it finds. It never
//! writes to the heap. Corrupt sizes or links stop the affected walk rather
//! than send it outside the heap.

use crate::{
    codec::{BlockOfs, Tag, ALIGNMENT, MIN_BLOCK_SIZE, OVERHEAD, WORD},
    heap::Heap,
    Arena,
};

/// A broken heap invariant found by [`Heap::check`].
///
/// Offsets are payload offsets from the base of the arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    /// The prologue's tags are not those of an allocated, payload-less block.
    #[error("bad prologue: header {header:#x}, footer {footer:#x}")]
    BadPrologue {
        /// The raw header word.
        header: usize,
        /// The raw footer word.
        footer: usize,
    },

    /// The epilogue header is not an allocated tag of size zero.
    #[error("bad epilogue: header {header:#x}")]
    BadEpilogue {
        /// The raw header word.
        header: usize,
    },

    /// A block's header and footer disagree.
    #[error("block at {offset:#x}: header {header:#x} does not match footer {footer:#x}")]
    TagMismatch {
        /// The block's offset.
        offset: usize,
        /// The raw header word.
        header: usize,
        /// The raw footer word.
        footer: usize,
    },

    /// A block's payload is not aligned to [`ALIGNMENT`].
    #[error("block at {offset:#x} is misaligned")]
    Misaligned {
        /// The block's offset.
        offset: usize,
    },

    /// A block's size is too small or reaches past the epilogue.
    ///
    /// Also reported for free-list entries that do not point into the heap.
    /// Either walk stops at this point.
    #[error("block at {offset:#x} with size {size} lies outside the heap")]
    OutOfBounds {
        /// The block's offset.
        offset: usize,
        /// The size read from the block's header.
        size: usize,
    },

    /// A free block directly follows another free block.
    #[error("free block at {offset:#x} was not coalesced with its predecessor")]
    UncoalescedNeighbors {
        /// The offset of the second block.
        offset: usize,
    },

    /// A block in the free list is marked allocated.
    #[error("listed block at {offset:#x} is marked allocated")]
    ListedBlockAllocated {
        /// The block's offset.
        offset: usize,
    },

    /// A free-list entry's backward link does not name its predecessor.
    #[error("listed block at {offset:#x} has a broken backward link")]
    BrokenBackLink {
        /// The block's offset.
        offset: usize,
    },

    /// The free list and the heap disagree on the number of free blocks.
    #[error("free list holds {listed} blocks, heap holds {found} free blocks")]
    FreeCountMismatch {
        /// Entries reachable by walking the free list.
        listed: usize,
        /// Free blocks found by walking the heap.
        found: usize,
    },
}

/// The outcome of a consistency check.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CheckReport {
    /// Blocks visited between the sentinels.
    pub blocks: usize,
    /// Free blocks visited between the sentinels.
    pub free_blocks: usize,
    /// Entries visited in the free list.
    pub free_list_len: usize,
    /// The total number of violations found.
    pub violations: usize,
    /// The first violation found, if any.
    pub first_violation: Option<Violation>,
}

impl CheckReport {
    /// Returns `true` if no violations were found.
    pub fn is_consistent(&self) -> bool {
        self.violations == 0
    }

    fn record(&mut self, v: Violation, sink: &mut impl FnMut(Violation)) {
        log::warn!("heap check: {}", v);

        self.violations += 1;
        self.first_violation.get_or_insert(v);
        sink(v);
    }
}

impl<R: Arena> Heap<R> {
    /// Checks the heap for consistency.
    ///
    /// Every violation is logged at `warn` level. If `verbose` is `true`,
    /// every block and free-list entry is additionally logged at `debug`
    /// level.
    pub fn check(&self, verbose: bool) -> CheckReport {
        self.check_with(verbose, |_| {})
    }

    /// Checks the heap for consistency, passing each violation to `sink`.
    pub fn check_with(&self, verbose: bool, mut sink: impl FnMut(Violation)) -> CheckReport {
        let mut report = CheckReport::default();

        self.check_sentinels(&mut report, &mut sink);
        self.check_blocks(verbose, &mut report, &mut sink);
        self.check_free_list(verbose, &mut report, &mut sink);

        if report.free_list_len != report.free_blocks
            || report.free_list_len != self.free_list.len()
        {
            report.record(
                Violation::FreeCountMismatch {
                    listed: report.free_list_len,
                    found: report.free_blocks,
                },
                &mut sink,
            );
        }

        report
    }

    fn check_sentinels(&self, report: &mut CheckReport, sink: &mut impl FnMut(Violation)) {
        let base = self.base;
        let expected = Tag::allocated(OVERHEAD).pack();

        // SAFETY: the sentinel locations were fixed when the heap was built.
        let (header, footer, epilogue) = unsafe {
            (
                base.read_word(self.prologue.header()),
                base.read_word(self.prologue.footer(OVERHEAD)),
                base.read_word(self.epilogue.header()),
            )
        };

        if header != expected || footer != expected {
            report.record(Violation::BadPrologue { header, footer }, sink);
        }

        if epilogue != Tag::allocated(0).pack() || self.epilogue.header() + WORD != self.arena.len()
        {
            report.record(Violation::BadEpilogue { header: epilogue }, sink);
        }
    }

    fn check_blocks(
        &self,
        verbose: bool,
        report: &mut CheckReport,
        sink: &mut impl FnMut(Violation),
    ) {
        let base = self.base;
        let end = self.epilogue.header();

        let mut cursor = self.prologue.forward(OVERHEAD);
        let mut prev_free = false;

        while cursor < self.epilogue {
            let offset = cursor.get();
            let header = unsafe { base.read_word(cursor.header()) };
            let size = Tag::unpack(header).size();

            if size < MIN_BLOCK_SIZE || size > end - cursor.header() {
                report.record(Violation::OutOfBounds { offset, size }, sink);
                return;
            }

            // SAFETY: the footer lies within the bounds checked above.
            let footer = unsafe { base.read_word(cursor.footer(size)) };
            let tag = Tag::unpack(header);

            if verbose {
                log::debug!(
                    "block {:#x}: size {}, {}",
                    offset,
                    size,
                    if tag.is_allocated() { "allocated" } else { "free" }
                );
            }

            if !cursor.is_aligned() {
                report.record(Violation::Misaligned { offset }, sink);
            }

            if header != footer {
                report.record(
                    Violation::TagMismatch {
                        offset,
                        header,
                        footer,
                    },
                    sink,
                );
            }

            if !tag.is_allocated() {
                if prev_free {
                    report.record(Violation::UncoalescedNeighbors { offset }, sink);
                }

                report.free_blocks += 1;
            }

            prev_free = !tag.is_allocated();
            report.blocks += 1;
            cursor = cursor.forward(size);
        }
    }

    fn check_free_list(
        &self,
        verbose: bool,
        report: &mut CheckReport,
        sink: &mut impl FnMut(Violation),
    ) {
        let base = self.base;

        let mut prev: Option<BlockOfs> = None;
        let mut cursor = self.free_list.head();

        // One step past the recorded length is enough to notice a list that
        // is longer than recorded, including a cyclic one.
        while let Some(block) = cursor {
            if report.free_list_len > self.free_list.len() {
                break;
            }

            let offset = block.get();
            if !self.is_plausible_block(block) {
                report.record(Violation::OutOfBounds { offset, size: 0 }, sink);
                return;
            }

            // SAFETY: `block` lies inside the heap with room for its links.
            let (tag, link) = unsafe { (base.header(block), *base.link(block)) };

            if verbose {
                log::debug!(
                    "free list entry {:#x}: size {}, prev {:?}, next {:?}",
                    offset,
                    tag.size(),
                    link.prev.map(BlockOfs::get),
                    link.next.map(BlockOfs::get)
                );
            }

            if tag.is_allocated() {
                report.record(Violation::ListedBlockAllocated { offset }, sink);
            }

            if link.prev != prev {
                report.record(Violation::BrokenBackLink { offset }, sink);
            }

            report.free_list_len += 1;
            prev = Some(block);
            cursor = link.next;
        }
    }

    /// Returns `true` if a minimum-size block at `block` would lie strictly
    /// between the sentinels.
    fn is_plausible_block(&self, block: BlockOfs) -> bool {
        block > self.prologue
            && block < self.epilogue
            && block.get() % ALIGNMENT == 0
            && block.header() + MIN_BLOCK_SIZE <= self.epilogue.header()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec::Vec;

    use super::*;
    use crate::{codec::adjusted_size, Global, HeapConfig, Region};

    fn heap(capacity: usize) -> Heap<Region<Global>> {
        Heap::init(Region::try_new(capacity).unwrap()).unwrap()
    }

    fn tight_heap() -> Heap<Region<Global>> {
        let config = HeapConfig::new().with_chunk_size(MIN_BLOCK_SIZE);
        Heap::init_with_config(Region::try_new(4096).unwrap(), config).unwrap()
    }

    fn violations(heap: &Heap<Region<Global>>) -> Vec<Violation> {
        let mut found = Vec::new();
        heap.check_with(true, |v| found.push(v));
        found
    }

    #[test]
    fn fresh_heap_is_consistent() {
        let heap = heap(4096);
        let report = heap.check(true);

        assert_eq!(report, CheckReport::default());
        assert!(report.is_consistent());
    }

    #[test]
    fn report_counts_blocks() {
        let mut heap = heap(64 * 1024);
        let a = heap.allocate(100).unwrap();
        let _b = heap.allocate(100).unwrap();
        unsafe { heap.release(a.cast()) };

        let report = heap.check(false);
        assert!(report.is_consistent());
        assert_eq!(report.blocks, 3);
        assert_eq!(report.free_blocks, 2);
        assert_eq!(report.free_list_len, 2);

        // Checking twice changes nothing.
        assert_eq!(heap.check(true), report);
    }

    #[test]
    fn overrun_into_footer_is_reported() {
        let mut heap = heap(64 * 1024);
        let a = heap.allocate(24).unwrap();
        let offset = heap.blocks().next().unwrap().offset;

        // Write one word past the usable payload, onto the footer.
        let usable = unsafe { heap.usable_size(a.cast()) };
        let footer = unsafe { a.cast::<u8>().as_ptr().add(usable).cast::<usize>() };
        let saved = unsafe { footer.read() };
        unsafe { footer.write(0xdead_0001) };

        assert_eq!(
            violations(&heap),
            [Violation::TagMismatch {
                offset,
                header: Tag::allocated(adjusted_size(24).unwrap()).pack(),
                footer: 0xdead_0001,
            }]
        );
        assert!(!heap.check(false).is_consistent());

        unsafe { footer.write(saved) };
        assert!(heap.check(false).is_consistent());
    }

    // Shifting a block by one word only breaks alignment when a word is
    // half the alignment unit and still a multiple of the tag granularity.
    #[cfg(target_pointer_width = "64")]
    #[test]
    fn misaligned_block_is_reported() {
        let mut heap = tight_heap();
        let a = heap.allocate(8).unwrap();
        let _b = heap.allocate(8).unwrap();
        let _c = heap.allocate(8).unwrap();
        let _d = heap.allocate(8).unwrap();

        // Re-tile `a`, `b` and `c` as two blocks, the second one word off.
        let first = heap.block_of(a.cast());
        let second = first.forward(MIN_BLOCK_SIZE + WORD);
        unsafe {
            heap.base.write_tags(first, Tag::allocated(MIN_BLOCK_SIZE + WORD));
            heap.base.write_tags(second, Tag::allocated(2 * MIN_BLOCK_SIZE - WORD));
        }

        assert_eq!(
            violations(&heap),
            [Violation::Misaligned {
                offset: second.get()
            }]
        );
    }

    #[test]
    fn cyclic_free_list_is_cut_off() {
        let mut heap = tight_heap();
        let a = heap.allocate(8).unwrap();
        let _b = heap.allocate(8).unwrap();
        unsafe { heap.release(a.cast()) };

        let block = heap.block_of(a.cast());
        unsafe { heap.base.link_mut(block).next = Some(block) };

        let len = heap.free_list_len();
        assert_eq!(
            violations(&heap),
            [
                Violation::BrokenBackLink {
                    offset: block.get()
                },
                Violation::FreeCountMismatch {
                    listed: len + 1,
                    found: 1
                },
            ]
        );
    }

    #[test]
    fn free_list_entry_outside_heap_stops_the_walk() {
        let mut heap = tight_heap();
        let a = heap.allocate(8).unwrap();
        let _b = heap.allocate(8).unwrap();
        unsafe { heap.release(a.cast()) };

        let block = heap.block_of(a.cast());
        let stray = heap.epilogue.forward(ALIGNMENT);
        unsafe { heap.base.link_mut(block).next = Some(stray) };

        let report = heap.check(false);
        assert_eq!(
            report.first_violation,
            Some(Violation::OutOfBounds {
                offset: stray.get(),
                size: 0
            })
        );
        assert_eq!(report.violations, 1);
        assert_eq!(report.free_list_len, 1);
    }

    #[test]
    fn stray_free_block_is_reported() {
        let mut heap = tight_heap();
        let a = heap.allocate(8).unwrap();
        let _b = heap.allocate(8).unwrap();
        let _c = heap.allocate(8).unwrap();
        unsafe { heap.release(a.cast()) };

        // Mark `b` free without linking it.
        let b = heap.blocks().nth(1).unwrap();
        let b_ofs = BlockOfs::new(b.offset).unwrap();
        unsafe { heap.base.write_tags(b_ofs, Tag::free(b.size)) };

        assert_eq!(
            violations(&heap),
            [
                Violation::UncoalescedNeighbors { offset: b.offset },
                Violation::FreeCountMismatch {
                    listed: 1,
                    found: 2
                },
            ]
        );
    }

    #[test]
    fn listed_allocated_block_is_reported() {
        let mut heap = tight_heap();
        let a = heap.allocate(8).unwrap();
        let _b = heap.allocate(8).unwrap();
        unsafe { heap.release(a.cast()) };

        let info = heap.blocks().next().unwrap();
        let block = BlockOfs::new(info.offset).unwrap();
        unsafe { heap.base.write_tags(block, Tag::allocated(info.size)) };

        assert_eq!(
            violations(&heap),
            [
                Violation::ListedBlockAllocated {
                    offset: info.offset
                },
                Violation::FreeCountMismatch {
                    listed: 1,
                    found: 0
                },
            ]
        );
    }

    #[test]
    fn broken_back_link_is_reported() {
        let mut heap = tight_heap();
        let a = heap.allocate(8).unwrap();
        let _x = heap.allocate(8).unwrap();
        let b = heap.allocate(8).unwrap();
        let _y = heap.allocate(8).unwrap();
        unsafe {
            heap.release(a.cast());
            heap.release(b.cast());
        }

        // `a` follows `b` in the list; point its back link elsewhere.
        let a_ofs = heap.block_of(a.cast());
        unsafe { heap.base.link_mut(a_ofs).prev = None };

        assert_eq!(
            violations(&heap),
            [Violation::BrokenBackLink {
                offset: a_ofs.get()
            }]
        );
    }

    #[test]
    fn corrupt_sentinels_are_reported() {
        let heap = heap(4096);

        unsafe { heap.base.write_word(heap.prologue.header(), 0) };
        unsafe { heap.base.write_word(heap.epilogue.header(), Tag::free(0).pack()) };

        assert_eq!(
            violations(&heap),
            [
                Violation::BadPrologue {
                    header: 0,
                    footer: Tag::allocated(OVERHEAD).pack(),
                },
                Violation::BadEpilogue { header: 0 },
            ]
        );
    }

    #[test]
    fn oversized_header_stops_the_walk() {
        let mut heap = tight_heap();
        let a = heap.allocate(8).unwrap();
        let _b = heap.allocate(8).unwrap();

        let block = heap.block_of(a.cast());
        let huge = Tag::allocated(1 << 20).pack();
        unsafe { heap.base.write_word(block.header(), huge) };

        let report = heap.check(true);
        assert_eq!(
            report.first_violation,
            Some(Violation::OutOfBounds {
                offset: block.get(),
                size: 1 << 20
            })
        );
        assert_eq!(report.blocks, 0);
    }
}
