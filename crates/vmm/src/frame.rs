//! Physical frames as seen by the manager.

use crate::{PhysicalAddress, VirtualAddress};

/// The external free-frame allocator.
///
/// Frames are identified by physical address and always come in 4 KiB units. The
/// allocator never touches page tables itself.
pub trait FrameAllocator {
    /// Allocates `pages` physically contiguous frames and returns the first one's address.
    fn allocate(&mut self, pages: usize) -> Option<PhysicalAddress>;

    /// Returns `pages` frames starting at `base`.
    fn free(&mut self, base: PhysicalAddress, pages: usize);
}

impl<A: FrameAllocator + ?Sized> FrameAllocator for &mut A {
    fn allocate(&mut self, pages: usize) -> Option<PhysicalAddress> {
        (**self).allocate(pages)
    }

    fn free(&mut self, base: PhysicalAddress, pages: usize) {
        (**self).free(base, pages)
    }
}

/// A run of frames mapped into the manager's own address space.
///
/// `virt` is relative to the manager's data segment; `phys` is the first frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    virt: VirtualAddress,
    phys: PhysicalAddress,
}

impl Page {
    /// Creates a page from its manager-virtual and physical address.
    #[inline]
    pub const fn new(virt: VirtualAddress, phys: PhysicalAddress) -> Self {
        Self { virt, phys }
    }

    /// Address of the page in the manager, relative to its data segment.
    #[inline]
    pub const fn virt(self) -> VirtualAddress {
        self.virt
    }

    /// Physical address of the first frame.
    #[inline]
    pub const fn phys(self) -> PhysicalAddress {
        self.phys
    }
}
