//! i386 directory and page table entries.

use core::fmt;

use crate::PhysicalAddress;

use super::flags::PageFlags;

/// A single 32-bit directory or page table entry.
///
/// The upper 20 bits hold a frame address (10 bits for a big page) and the low 12 bits
/// hold [`PageFlags`].
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(u32);

impl PageEntry {
    /// Frame address bits of a normal entry.
    pub const ADDRESS_MASK: u32 = 0xFFFF_F000;

    /// Frame address bits of a big page entry.
    pub const BIG_ADDRESS_MASK: u32 = 0xFFC0_0000;

    const FLAGS_MASK: u32 = 0x0000_0FFF;

    /// An entry that maps nothing.
    pub const EMPTY: Self = Self(0);

    /// Creates an entry pointing at `address` with the given flags.
    ///
    /// The low bits of `address` are discarded.
    #[inline]
    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        Self((address.as_usize() as u32 & Self::ADDRESS_MASK) | flags.bits())
    }

    /// Creates a big page directory entry for the 4 MiB frame containing `address`.
    #[inline]
    pub fn big(address: PhysicalAddress, flags: PageFlags) -> Self {
        Self(
            (address.as_usize() as u32 & Self::BIG_ADDRESS_MASK)
                | (flags | PageFlags::BIG_PAGE).bits(),
        )
    }

    /// Reconstructs an entry from its raw value.
    #[inline]
    pub const fn from_u32(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw entry value.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the frame address stored in the entry, whether or not it is present.
    #[inline]
    pub fn frame(self) -> PhysicalAddress {
        let mask = if self.is_big_page() {
            Self::BIG_ADDRESS_MASK
        } else {
            Self::ADDRESS_MASK
        };
        PhysicalAddress::new((self.0 & mask) as usize)
    }

    /// Returns the frame address if the entry is present.
    #[inline]
    pub fn address(self) -> Option<PhysicalAddress> {
        self.is_present().then(|| self.frame())
    }

    /// Returns the entry's flags.
    #[inline]
    pub const fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & Self::FLAGS_MASK)
    }

    /// Returns whether the entry maps something.
    #[inline]
    pub const fn is_present(self) -> bool {
        self.flags().is_present()
    }

    /// Returns whether a directory entry maps a 4 MiB page directly.
    #[inline]
    pub const fn is_big_page(self) -> bool {
        self.flags().contains(PageFlags::BIG_PAGE)
    }

    /// Clears the entry.
    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageEntry({:#010x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_entry_keeps_address_and_flags() {
        let entry = PageEntry::new(PhysicalAddress::new(0x0050_0000), PageFlags::USER_RW);
        assert_eq!(entry.as_u32(), 0x0050_0007);
        assert_eq!(entry.address(), Some(PhysicalAddress::new(0x0050_0000)));
        assert_eq!(entry.flags(), PageFlags::USER_RW);
    }

    #[test]
    fn offset_bits_are_dropped() {
        let entry = PageEntry::new(PhysicalAddress::new(0x1234_5678), PageFlags::PRESENT);
        assert_eq!(entry.frame(), PhysicalAddress::new(0x1234_5000));
    }

    #[test]
    fn not_present_has_no_address() {
        let entry = PageEntry::new(PhysicalAddress::new(0x3000), PageFlags::WRITE);
        assert_eq!(entry.address(), None);
        assert_eq!(entry.frame(), PhysicalAddress::new(0x3000));
    }

    #[test]
    fn big_page_entry() {
        let entry = PageEntry::big(
            PhysicalAddress::new(0x0012_3000),
            PageFlags::PRESENT | PageFlags::WRITE,
        );
        assert!(entry.is_big_page());
        assert_eq!(entry.frame(), PhysicalAddress::new(0));
        assert_eq!(entry.as_u32(), 0x83);
    }

    #[test]
    fn clear_entry() {
        let mut entry = PageEntry::from_u32(0xdead_b007);
        entry.clear();
        assert_eq!(entry, PageEntry::EMPTY);
        assert!(!entry.is_present());
    }
}
