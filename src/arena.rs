//! Growable backing memory for a heap.
//!
//! An [`Arena`] is a contiguous byte region that only ever grows at its end.
//! It never moves and never shrinks, so offsets into it stay valid for its
//! whole lifetime.
//!
//! [`Region`] is the arena shipped with this crate: a fixed-capacity block of
//! memory with a monotonically increasing break, in the manner of `sbrk`.

use crate::{
    codec::ALIGNMENT,
    core::{alloc::Layout, fmt, ptr::NonNull},
    AllocInitError, ArenaExhausted, BackingAllocator, Raw,
};

#[cfg(feature = "sptr")]
use crate::core::ptr::NonNullStrict;

#[cfg(any(feature = "alloc", test))]
use crate::Global;

/// A monotonically growable, contiguous region of raw bytes.
///
/// # Safety
///
/// Implementors must guarantee the following:
/// - `base()` returns the same pointer for the lifetime of the arena, aligned
///   to at least [`ALIGNMENT`] bytes.
/// - The first `len()` bytes starting at `base()` are valid for reads and
///   writes and are not accessed by anything other than the owner of the
///   arena.
/// - A successful `grow(n)` returns the previous `len()` and increases
///   `len()` by exactly `n`; a failed `grow` leaves `len()` unchanged.
pub unsafe trait Arena {
    /// Returns a pointer to the start of the region.
    fn base(&self) -> NonNull<u8>;

    /// Returns the number of bytes currently in the region.
    fn len(&self) -> usize;

    /// Returns `true` if the region is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `n` bytes to the end of the region.
    ///
    /// On success, returns the offset of the first new byte.
    ///
    /// # Errors
    ///
    /// Returns `Err(ArenaExhausted)` if the region cannot grow by `n` bytes.
    fn grow(&mut self, n: usize) -> Result<usize, ArenaExhausted>;
}

/// A fixed-capacity arena.
pub struct Region<A: BackingAllocator> {
    ptr: NonNull<u8>,
    capacity: usize,
    brk: usize,
    backing_allocator: A,
}

impl Region<Raw> {
    /// Constructs a new `Region` from a raw pointer.
    ///
    /// # Errors
    ///
    /// Returns an error if either of the following are true:
    /// - `region` is not aligned to [`ALIGNMENT`] bytes.
    /// - `capacity` bytes would not fit between `region` and the end of the
    ///   address space.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for `capacity` bytes, and
    /// no other code may access that memory while the `Region` exists.
    pub unsafe fn new_raw(
        region: NonNull<u8>,
        capacity: usize,
    ) -> Result<Region<Raw>, AllocInitError> {
        unsafe { RawRegion::try_new(region, capacity).map(|r| r.with_backing_allocator(Raw)) }
    }

    /// Decomposes the region into its base pointer and capacity.
    pub fn into_raw_parts(self) -> (NonNull<u8>, usize) {
        (self.ptr, self.capacity)
    }
}

#[cfg(any(feature = "alloc", test))]
impl Region<Global> {
    /// Attempts to construct a new `Region` backed by the global allocator.
    ///
    /// # Errors
    ///
    /// Returns an error if `capacity` is zero or cannot be described by a
    /// [`Layout`], or if the global allocator could not provide the memory.
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new(capacity: usize) -> Result<Region<Global>, AllocInitError> {
        if capacity == 0 {
            return Err(AllocInitError::InvalidConfig);
        }

        let layout =
            Layout::from_size_align(capacity, ALIGNMENT).map_err(|_| AllocInitError::InvalidConfig)?;

        unsafe {
            let region_raw = alloc::alloc::alloc(layout);
            let region_ptr = NonNull::new(region_raw).ok_or(AllocInitError::AllocFailed(layout))?;

            match RawRegion::try_new(region_ptr, capacity) {
                Ok(r) => Ok(r.with_backing_allocator(Global)),
                Err(e) => {
                    alloc::alloc::dealloc(region_ptr.as_ptr(), layout);
                    Err(e)
                }
            }
        }
    }
}

impl<A: BackingAllocator> Region<A> {
    /// Returns the maximum number of bytes the region can grow to.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of bytes the region can still grow by.
    pub fn remaining(&self) -> usize {
        self.capacity - self.brk
    }
}

unsafe impl<A: BackingAllocator> Arena for Region<A> {
    #[inline]
    fn base(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    fn len(&self) -> usize {
        self.brk
    }

    fn grow(&mut self, n: usize) -> Result<usize, ArenaExhausted> {
        let old_brk = self.brk;
        let new_brk = match old_brk.checked_add(n) {
            Some(b) if b <= self.capacity => b,
            _ => {
                log::debug!(
                    "region exhausted: requested {} bytes with {} of {} remaining",
                    n,
                    self.remaining(),
                    self.capacity
                );
                return Err(ArenaExhausted);
            }
        };

        self.brk = new_brk;

        Ok(old_brk)
    }
}

impl<A: BackingAllocator> Drop for Region<A> {
    fn drop(&mut self) {
        // Safe unwrap: this layout was checked when the region was constructed.
        let layout = Layout::from_size_align(self.capacity, ALIGNMENT).unwrap();

        unsafe { self.backing_allocator.deallocate(self.ptr, layout) };
    }
}

impl<A: BackingAllocator> fmt::Debug for Region<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("ptr", &self.ptr)
            .field("capacity", &self.capacity)
            .field("brk", &self.brk)
            .finish()
    }
}

struct RawRegion {
    ptr: NonNull<u8>,
    capacity: usize,
}

impl RawRegion {
    unsafe fn try_new(region: NonNull<u8>, capacity: usize) -> Result<RawRegion, AllocInitError> {
        // Verify that the base pointer satisfies the payload alignment.
        if region.addr().get() % ALIGNMENT != 0 {
            return Err(AllocInitError::InvalidConfig);
        }

        // Ensure offset calculations will not overflow.
        region
            .addr()
            .get()
            .checked_add(capacity)
            .ok_or(AllocInitError::InvalidLocation)?;

        // The region's size must also be describable as a layout, so that it
        // can be released on drop.
        Layout::from_size_align(capacity, ALIGNMENT).map_err(|_| AllocInitError::InvalidConfig)?;

        Ok(RawRegion {
            ptr: region,
            capacity,
        })
    }

    fn with_backing_allocator<A: BackingAllocator>(self, backing_allocator: A) -> Region<A> {
        Region {
            ptr: self.ptr,
            capacity: self.capacity,
            brk: 0,
            backing_allocator,
        }
    }
}
