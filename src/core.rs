//! Re-exports of `core`, plus stable polyfills.
//!
//! With the `sptr` feature, `NonNull::addr` is provided through the
//! strict-provenance polyfill instead of the standard library.

pub use core::{cmp, fmt, mem, slice};

pub(crate) mod alloc {
    pub use core::alloc::*;
}

pub mod num {
    pub use core::num::*;
}

#[cfg(not(feature = "sptr"))]
pub(crate) use core::ptr;

#[cfg(feature = "sptr")]
pub(crate) mod ptr {
    pub use core::ptr::*;

    // #![feature(strict_provenance)]

    use core::num::NonZeroUsize;

    pub use sptr::Strict;

    pub trait NonNullStrict<T> {
        fn addr(self) -> NonZeroUsize
        where
            T: Sized;
    }

    impl<T> NonNullStrict<T> for NonNull<T> {
        fn addr(self) -> NonZeroUsize
        where
            T: Sized,
        {
            // SAFETY: The pointer is guaranteed by the type to be non-null,
            // meaning that the address will be non-zero.
            unsafe { NonZeroUsize::new_unchecked(Strict::addr(self.as_ptr())) }
        }
    }
}
