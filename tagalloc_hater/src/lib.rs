#![deny(unsafe_op_in_unsafe_fn)]

use std::{alloc::Layout, ptr::NonNull};

use alloc_hater::Subject;
use tagalloc::{AllocError, AllocInitError, Global, Heap, HeapConfig, Region, ALIGNMENT};

pub struct HeapSubject(Heap<Region<Global>>);

impl HeapSubject {
    pub fn new(capacity: usize) -> Result<Self, AllocInitError> {
        HeapSubject::with_config(capacity, HeapConfig::default())
    }

    pub fn with_config(capacity: usize, config: HeapConfig) -> Result<Self, AllocInitError> {
        let region = Region::try_new(capacity)?;
        let h = Heap::init_with_config(region, config)?;
        Ok(HeapSubject(h))
    }

    pub fn heap(&self) -> &Heap<Region<Global>> {
        &self.0
    }
}

impl Subject for HeapSubject {
    type AllocError = AllocError;

    fn allocate(&mut self, layout: Layout) -> Result<NonNull<[u8]>, Self::AllocError> {
        // The heap only guarantees its own payload alignment.
        if layout.align() > ALIGNMENT {
            return Err(AllocError::InvalidRequest);
        }

        self.0.allocate(layout.size())
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, _layout: Layout) {
        unsafe { self.0.release(ptr) };
    }

    unsafe fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        _layout: Layout,
        new_size: usize,
    ) -> Result<NonNull<[u8]>, Self::AllocError> {
        unsafe { self.0.resize(ptr, new_size) }
    }
}
