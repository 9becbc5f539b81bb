//! A small library for ~~hating on~~ evaluating the correctness of allocators.
#![deny(unsafe_op_in_unsafe_fn)]

use core::{alloc::Layout, cmp, mem::MaybeUninit, ptr::NonNull, slice};

/// The largest allocation size generated, exclusive.
pub const MAX_SIZE: usize = 1 << 20;

/// The largest alignment generated, as a power of two exponent, exclusive.
pub const MAX_ALIGN_SHIFT: u8 = 8;

/// A wrapper around `Layout` which implements `Arbitrary`.
#[derive(Clone, Debug)]
pub struct ArbLayout(pub Layout);

impl arbitrary::Arbitrary<'_> for ArbLayout {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        // Select a random bit index and shift to obtain a power of two.
        let align_shift = u8::arbitrary(u)? % MAX_ALIGN_SHIFT;

        let align: usize = 1 << align_shift;
        assert!(align.is_power_of_two());

        let size = usize::arbitrary(u)? % MAX_SIZE;

        let layout = match Layout::from_size_align(size, align) {
            Ok(l) => l,
            Err(_) => {
                panic!("invalid layout params: size=0x{size:X} align=0x{align:X}");
            }
        };

        Ok(ArbLayout(layout))
    }
}

#[derive(arbitrary::Arbitrary)]
enum AllocatorOpTag {
    Alloc,
    Dealloc,
    Realloc,
}

#[derive(Clone, Debug)]
pub enum AllocatorOp {
    /// Allocates a block with the given layout.
    Alloc(Layout),
    /// Deallocates the block at the given index, modulo the number of
    /// outstanding blocks.
    Dealloc(usize),
    /// Resizes the block at the given index, modulo the number of outstanding
    /// blocks, to the given size.
    Realloc(usize, usize),
}

impl arbitrary::Arbitrary<'_> for AllocatorOp {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        let tag = AllocatorOpTag::arbitrary(u)?;

        let op = match tag {
            AllocatorOpTag::Alloc => AllocatorOp::Alloc(ArbLayout::arbitrary(u)?.0),
            AllocatorOpTag::Dealloc => AllocatorOp::Dealloc(usize::arbitrary(u)?),
            AllocatorOpTag::Realloc => {
                AllocatorOp::Realloc(usize::arbitrary(u)?, usize::arbitrary(u)? % MAX_SIZE)
            }
        };

        Ok(op)
    }
}

pub trait Subject {
    type AllocError;

    /// Allocates a block of memory according to `layout`.
    fn allocate(&mut self, layout: Layout) -> Result<NonNull<[u8]>, Self::AllocError>;

    /// Deallocates the block of memory with layout `layout` pointed to by `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated by this
    /// allocator, and it must have been allocated with `layout`.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout);

    /// Resizes the block of memory with layout `layout` pointed to by `ptr`
    /// to `new_size` bytes, preserving its contents up to the smaller size.
    ///
    /// On failure, the original block must remain allocated and unchanged.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated by this
    /// allocator, and it must have been allocated with `layout`.
    unsafe fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        layout: Layout,
        new_size: usize,
    ) -> Result<NonNull<[u8]>, Self::AllocError>;
}

/// A list of allocated blocks.
#[derive(Default)]
pub struct Blocks {
    blocks: Vec<Block>,
}

impl Blocks {
    pub fn new() -> Blocks {
        Blocks { blocks: Vec::new() }
    }

    pub fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn remove_modulo(&mut self, idx: usize) -> Option<Block> {
        let len = self.blocks.len();
        (len != 0).then(|| self.blocks.swap_remove(idx % len))
    }
}

impl IntoIterator for Blocks {
    type Item = Block;

    type IntoIter = std::vec::IntoIter<Block>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.into_iter()
    }
}

/// An allocated block of memory.
pub struct Block {
    // A pointer to the allocated region.
    ptr: NonNull<[u8]>,
    // The original allocation layout.
    layout: Layout,
    // The unique ID of the last operation that wrote to this allocation.
    id: u64,
}

unsafe fn slice_ptr_to_uninit_slice_mut<'a>(ptr: NonNull<[u8]>) -> &'a mut [MaybeUninit<u8>] {
    unsafe { slice::from_raw_parts_mut(ptr.cast().as_ptr(), ptr.len()) }
}

unsafe fn paint(slice: &mut [MaybeUninit<u8>], id: u64) {
    let id_bytes = id.to_le_bytes().into_iter().cycle();

    for (byte, value) in slice.iter_mut().zip(id_bytes) {
        byte.write(value);
    }
}

impl Block {
    /// Creates a block from `ptr` and paints it according to `id`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ptr` must be valid for reads and writes for `ptr.len()` bytes.
    /// - `ptr` must have been allocated according to `layout`.
    /// - No references to the memory at `ptr` may exist when this function is called.
    /// - No accesses to the memory at `ptr` may be made except by way of the returned `Block` until
    ///   said `Block` is dropped.
    pub unsafe fn init(ptr: NonNull<[u8]>, layout: Layout, id: u64) -> Block {
        let mut b = Block { ptr, layout, id };
        b.paint(id);
        b
    }

    /// Returns the `Block`'s memory as a slice of uninitialized bytes.
    pub fn as_uninit_slice(&self) -> &[MaybeUninit<u8>] {
        // SAFETY: self is immutably borrowed, so only immutable references to
        // the slice can exist
        unsafe { &*slice_ptr_to_uninit_slice_mut(self.ptr) }
    }

    /// Returns the `Block`'s memory as a mutable slice of uninitialized bytes.
    pub fn as_uninit_slice_mut(&mut self) -> &mut [MaybeUninit<u8>] {
        // SAFETY: self is mutably borrowed, so no other references to the
        // slice can exist
        unsafe { slice_ptr_to_uninit_slice_mut(self.ptr) }
    }

    pub fn into_raw_parts(self) -> (NonNull<[u8]>, Layout) {
        (self.ptr, self.layout)
    }

    /// "Paints" the memory contained by `self` with the value of `id`.
    pub fn paint(&mut self, id: u64) {
        self.id = id;
        unsafe { paint(self.as_uninit_slice_mut(), id) };
    }

    /// Verifies that the memory contained by `self` has not been overwritten.
    pub fn verify(&self) -> bool {
        self.verify_prefix(self.ptr.len())
    }

    /// Verifies that the first `len` bytes of `self` have not been
    /// overwritten.
    pub fn verify_prefix(&self, len: usize) -> bool {
        let len = cmp::min(len, self.ptr.len());
        let slice: &[u8] = unsafe { slice::from_raw_parts(self.ptr.cast().as_ptr(), len) };
        let id_bytes = self.id.to_le_bytes().into_iter().cycle();

        slice.iter().zip(id_bytes).all(|(byte, value)| *byte == value)
    }
}

pub struct Evaluator<S: Subject> {
    subject: S,
}

#[derive(Clone, Debug)]
pub struct Failed {
    pub completed: Vec<AllocatorOp>,
    pub failed_op: AllocatorOp,
}

impl<S: Subject> Evaluator<S> {
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator { subject }
    }

    /// Returns a shared reference to the allocator under evaluation.
    pub fn subject(&self) -> &S {
        &self.subject
    }

    pub fn evaluate<I>(&mut self, ops: I) -> Result<(), Failed>
    where
        I: IntoIterator<Item = AllocatorOp>,
    {
        let mut completed = Vec::new();
        let mut blocks = Blocks::new();

        for (op_id, op) in ops.into_iter().enumerate() {
            let op_id = op_id as u64;
            match op {
                AllocatorOp::Alloc(layout) => {
                    let ptr = match self.subject.allocate(layout) {
                        Ok(p) => p,
                        Err(_) => continue,
                    };

                    let block = unsafe { Block::init(ptr, layout, op_id) };
                    blocks.push(block);
                }

                AllocatorOp::Dealloc(raw_idx) => {
                    let mut block = match blocks.remove_modulo(raw_idx) {
                        Some(b) => b,
                        None => continue,
                    };

                    if !block.verify() {
                        return Err(Failed {
                            completed,
                            failed_op: op,
                        });
                    }

                    unsafe {
                        block.paint(op_id);
                        self.subject.deallocate(block.ptr.cast(), block.layout);
                    }
                }

                AllocatorOp::Realloc(raw_idx, new_size) => {
                    let block = match blocks.remove_modulo(raw_idx) {
                        Some(b) => b,
                        None => continue,
                    };

                    if !block.verify() {
                        return Err(Failed {
                            completed,
                            failed_op: op,
                        });
                    }

                    let res = unsafe {
                        self.subject
                            .reallocate(block.ptr.cast(), block.layout, new_size)
                    };

                    match res {
                        Ok(ptr) => {
                            let kept = cmp::min(block.ptr.len(), new_size);

                            // The old id carries over so the preserved bytes
                            // can be checked in their new location.
                            let moved = Block {
                                ptr,
                                layout: resized(block.layout, new_size),
                                id: block.id,
                            };

                            if !moved.verify_prefix(kept) {
                                return Err(Failed {
                                    completed,
                                    failed_op: op,
                                });
                            }

                            blocks.push(unsafe { Block::init(ptr, moved.layout, op_id) });
                        }

                        Err(_) => {
                            if !block.verify() {
                                return Err(Failed {
                                    completed,
                                    failed_op: op,
                                });
                            }

                            blocks.push(block);
                        }
                    }
                }
            }

            completed.push(op);
        }

        for (idx, block) in blocks.into_iter().enumerate() {
            if !block.verify() {
                return Err(Failed {
                    completed,
                    failed_op: AllocatorOp::Dealloc(idx),
                });
            }

            unsafe { self.subject.deallocate(block.ptr.cast(), block.layout) };
        }

        Ok(())
    }
}

fn resized(layout: Layout, new_size: usize) -> Layout {
    // Safe unwrap: the alignment is taken from a valid layout, and sizes are
    // bounded by `MAX_SIZE`.
    Layout::from_size_align(new_size, layout.align()).unwrap()
}
