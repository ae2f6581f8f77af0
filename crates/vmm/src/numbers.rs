//! Page and frame number types.
//!
//! Ranges of these iterate page by page, which is how the mapping writer, the image
//! relocation at bootstrap and the emulated frame ledger walk memory.

use crate::{
    address::{PhysicalAddress, VirtualAddress},
    arch,
};
use core::{
    fmt,
    iter::Step,
    ops::{Add, Sub},
};

/// Macro to define common page/frame number functionality.
macro_rules! impl_page_number_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new page/frame number.
            #[inline]
            pub const fn new(number: usize) -> Self {
                Self(number)
            }

            /// Returns the raw page/frame number.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Number of pages needed to hold `bytes`.
            #[inline]
            pub const fn count_for(bytes: usize) -> usize {
                bytes.div_ceil(arch::PAGE_SIZE)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }

        impl Step for $name {
            fn steps_between(start: &Self, end: &Self) -> (usize, Option<usize>) {
                if start <= end {
                    let diff = end.0 - start.0;
                    (diff, Some(diff))
                } else {
                    (0, None)
                }
            }

            fn forward_checked(start: Self, count: usize) -> Option<Self> {
                start.0.checked_add(count).map(Self)
            }

            fn backward_checked(start: Self, count: usize) -> Option<Self> {
                start.0.checked_sub(count).map(Self)
            }
        }
    };
}

impl_page_number_common!(
    FrameNumber,
    "A physical frame number (physical address / 4 KiB)."
);

impl FrameNumber {
    /// Returns the physical address at the start of this frame.
    #[inline]
    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * arch::PAGE_SIZE)
    }
}

impl From<PhysicalAddress> for FrameNumber {
    #[inline]
    fn from(addr: PhysicalAddress) -> Self {
        Self::new(addr.as_usize() / arch::PAGE_SIZE)
    }
}

impl_page_number_common!(
    PageNumber,
    "A linear page number (linear address / 4 KiB)."
);

impl PageNumber {
    /// Returns the linear address at the start of this page.
    #[inline]
    pub const fn start(self) -> VirtualAddress {
        VirtualAddress::new(self.0 * arch::PAGE_SIZE)
    }

    /// Pages covering `bytes` starting at `start`, which must be page aligned.
    ///
    /// The range is computed on page numbers so it can end exactly at the 4 GiB boundary.
    #[inline]
    pub fn range(start: VirtualAddress, bytes: usize) -> core::ops::Range<Self> {
        let first = Self::from(start);
        first..first + Self::count_for(bytes)
    }
}

impl From<VirtualAddress> for PageNumber {
    #[inline]
    fn from(addr: VirtualAddress) -> Self {
        Self::new(addr.as_usize() / arch::PAGE_SIZE)
    }
}
