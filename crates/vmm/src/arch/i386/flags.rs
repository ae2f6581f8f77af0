//! Flag bits of i386 directory and table entries.

use bitflags::bitflags;

bitflags! {
    /// Flag bits of an i386 directory or page table entry.
    ///
    /// Bit positions are the hardware ones; entries are handed to the kernel verbatim.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PageFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        /// 4 MiB page, directory entries only.
        const BIG_PAGE = 1 << 7;
        /// Not flushed on address-space switches. Only honoured when the CPU supports it.
        const GLOBAL = 1 << 8;
    }
}

impl PageFlags {
    /// Flags a caller may ask the mapping writer to store in a leaf entry.
    pub const LEAF: Self = Self::PRESENT
        .union(Self::WRITE)
        .union(Self::USER)
        .union(Self::GLOBAL);

    /// Present, user-accessible and writable.
    pub const USER_RW: Self = Self::PRESENT.union(Self::USER).union(Self::WRITE);

    /// Returns whether the present bit is set.
    pub const fn is_present(self) -> bool {
        self.contains(Self::PRESENT)
    }
}
