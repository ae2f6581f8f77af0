//! Address types for physical and linear memory.
//!
//! This module provides wrappers around 32-bit physical and linear addresses, with the
//! helpers the page table code needs, and the translator that turns page table frames
//! into pointers the manager can dereference.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{FrameNumber, PageNumber, arch, frame::Page};

#[cfg(any(test, feature = "software-emulation"))]
use crate::emulation::EmulatedMemory;

/// How the manager reaches the memory it manages.
///
/// - Hardware: pages the manager allocated for itself are mapped in its own address space,
///   so their virtual address is directly usable.
/// - Emulated: physical memory is a host buffer and every frame is addressed through it.
///
/// The translator is owned by the manager; there is no global instance.
pub enum AddressTranslator {
    /// Running as the memory server on real hardware.
    Hardware,
    /// Running on the host against an emulated physical memory.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

impl AddressTranslator {
    /// Creates a new emulated translator with the given memory size.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(size))
    }

    /// Returns a pointer to the start of a page the manager owns.
    pub fn page_ptr<T>(&self, page: Page) -> *mut T {
        match self {
            Self::Hardware => page.virt().as_mut_ptr(),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.translate(page.phys()).cast(),
        }
    }

    /// Returns a pointer for a virtual address of the manager's own address space.
    ///
    /// On hardware the address is used as-is. Under emulation `walk` is asked for the
    /// frame currently mapped there; `None` means nothing is mapped.
    pub fn resolve<T>(
        &self,
        virt: VirtualAddress,
        walk: impl FnOnce() -> Option<PhysicalAddress>,
    ) -> Option<*mut T> {
        match self {
            Self::Hardware => {
                let _ = walk;
                Some(virt.as_mut_ptr())
            }
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => {
                let frame = walk()?;
                // SAFETY: the offset stays within the frame `translate` bounds-checked.
                Some(unsafe { mem.translate(frame).add(virt.page_offset()).cast() })
            }
        }
    }

    /// Returns the emulated memory, if any.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated_memory(&self) -> Option<&EmulatedMemory> {
        match self {
            Self::Hardware => None,
            Self::Emulated(mem) => Some(mem),
        }
    }
}

/// Macro to define common address type functionality.
///
/// This macro generates the basic structure and methods common to both physical
/// and linear address types, reducing code duplication.
macro_rules! impl_address_common {
    ($name:ident, $validate:path, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new address.
            ///
            /// # Panics
            ///
            /// Panics if the address does not fit in 32 bits.
            #[inline]
            pub const fn new(addr: usize) -> Self {
                assert!($validate(addr), "address exceeds maximum width");
                Self(addr)
            }

            /// Creates a new address, or `None` if it does not fit in 32 bits.
            #[inline]
            pub const fn try_new(addr: usize) -> Option<Self> {
                if $validate(addr) { Some(Self(addr)) } else { None }
            }

            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Adds `rhs`, returning `None` past the top of the 32-bit space.
            #[inline]
            pub const fn checked_add(self, rhs: usize) -> Option<Self> {
                match self.0.checked_add(rhs) {
                    Some(addr) => Self::try_new(addr),
                    None => None,
                }
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Aligns the address up to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two or the result leaves the 32-bit space.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self::new((self.0 + align - 1) & !(align - 1))
            }

            /// Returns the offset within the 4 KiB page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 & (arch::PAGE_SIZE - 1)
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

        impl From<u32> for $name {
            #[inline]
            fn from(addr: u32) -> Self {
                Self(addr as usize)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(addr: usize) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    arch::validate_physical,
    "A physical memory address.\n\n\
     Frames handed out by the frame allocator and stored in page table entries are\n\
     identified by their physical address."
);

impl PhysicalAddress {
    /// Returns the frame containing this address.
    #[inline]
    pub fn frame_number(self) -> FrameNumber {
        FrameNumber::from(self)
    }
}

impl_address_common!(
    VirtualAddress,
    arch::validate_virtual,
    "A virtual or linear address.\n\n\
     Process-relative (segment) addresses and linear addresses share this type; the\n\
     [`Process`](crate::Process) translation helpers convert between the two."
);

impl VirtualAddress {
    /// Converts the address to a pointer.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Converts the address to a mutable pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns the table index at the specified level (0 = page table, 1 = directory).
    #[inline]
    pub const fn page_index(self, level: usize) -> usize {
        arch::page_index(self.0, level)
    }

    /// Returns the directory entry index covering this address.
    #[inline]
    pub const fn pde(self) -> usize {
        self.page_index(arch::DIRECTORY_LEVEL)
    }

    /// Returns the page table entry index for this address.
    #[inline]
    pub const fn pte(self) -> usize {
        self.page_index(arch::TABLE_LEVEL)
    }

    /// Gets the corresponding page number for this address.
    #[inline]
    pub fn page_number(self) -> PageNumber {
        PageNumber::from(self)
    }
}
