//! i386 page directory / page table layout.

use super::{ENTRIES, PAGE_SIZE, entry::PageEntry};

/// A 1024-entry table, used for both levels.
///
/// The layout is exactly one page so a table can be placed in any frame the manager
/// allocates and addressed in place.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; ENTRIES],
}

const _: () = assert!(core::mem::size_of::<PageTable>() == PAGE_SIZE);

impl PageTable {
    /// Creates a new, empty table.
    pub const fn new() -> Self {
        Self {
            entries: [PageEntry::EMPTY; ENTRIES],
        }
    }

    /// Returns the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 1024.
    pub fn entry(&self, index: usize) -> PageEntry {
        assert!(index < ENTRIES, "page table index out of bounds");
        self.entries[index]
    }

    /// Returns a mutable reference to the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 1024.
    pub fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        assert!(index < ENTRIES, "page table index out of bounds");
        &mut self.entries[index]
    }

    /// Returns the number of entries in this table.
    pub const fn len(&self) -> usize {
        ENTRIES
    }

    /// Clears every entry.
    pub fn clear(&mut self) {
        self.entries.fill(PageEntry::EMPTY);
    }

    /// Iterates over the present entries with their indices.
    pub fn present(&self) -> impl Iterator<Item = (usize, PageEntry)> + '_ {
        self.entries
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, entry)| entry.is_present())
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}
