//! i386 two-level paging.
//!
//! This is the format both the MMU and the kernel read, so it is used unchanged when the
//! manager runs on the host against emulated memory:
//! - 32-bit linear and physical addresses
//! - a 1024-entry page directory, each entry covering 4 MiB of linear space
//! - 1024-entry page tables of 4 KiB pages
//! - optional 4 MiB "big" pages mapped straight from the directory

mod entry;
mod flags;
mod table;

pub use entry::PageEntry;
pub use flags::PageFlags;
pub use table::PageTable;

/// Maximum number of bits in a physical address.
pub const MAX_PHYSICAL_BITS: usize = 32;

/// Maximum number of bits in a linear address.
pub const MAX_VIRTUAL_BITS: usize = 32;

/// Page size in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Number of entries in a page directory or a page table.
pub const ENTRIES: usize = 1024;

/// Bytes of linear space controlled by one directory entry (also the big page size).
pub const BIG_PAGE_SIZE: usize = ENTRIES * PAGE_SIZE;

/// Highest page-aligned linear address the manager will hand out.
pub const LINEAR_LIMIT: usize = 0xFFFF_F000;

/// Directory level for [`page_index`].
pub const DIRECTORY_LEVEL: usize = 1;

/// Page table level for [`page_index`].
pub const TABLE_LEVEL: usize = 0;

/// Returns the table index for a linear address at the given level.
///
/// - Level 0: bits 12-21 (page table entry)
/// - Level 1: bits 22-31 (directory entry)
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    let shift = match level {
        TABLE_LEVEL => 12,
        DIRECTORY_LEVEL => 22,
        _ => panic!("level out of range for i386 (0-1)"),
    };
    (address >> shift) & (ENTRIES - 1)
}

/// Validates a physical address.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    (addr as u64) >> MAX_PHYSICAL_BITS == 0
}

/// Validates a linear address.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    (addr as u64) >> MAX_VIRTUAL_BITS == 0
}
