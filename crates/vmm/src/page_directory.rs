//! One two-level page table and the manager's bookkeeping for it.
//!
//! The directory and its leaf tables live in frames the manager allocated for itself. The
//! manager remembers, per directory entry, which of its pages holds the leaf table, so it
//! can edit leaves without translating physical addresses back to virtual ones.

use alloc::{boxed::Box, vec};

use crate::{
    PhysicalAddress, VirtualAddress,
    address::AddressTranslator,
    arch::{BIG_PAGE_SIZE, ENTRIES, PAGE_SIZE, PageEntry, PageFlags, PageTable},
    frame::Page,
};

/// What a linear address currently translates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub frame: PhysicalAddress,
    pub flags: PageFlags,
}

/// Borrows a table stored in one of the manager's pages.
fn table(memory: &AddressTranslator, page: Page) -> &PageTable {
    // SAFETY: `page` is a frame owned by a directory and stays mapped while referenced.
    unsafe { &*memory.page_ptr::<PageTable>(page) }
}

fn with_table_mut<R>(memory: &AddressTranslator, page: Page, f: impl FnOnce(&mut PageTable) -> R) -> R {
    // SAFETY: as for `table`; the manager is single threaded and the reference does not
    // escape the closure.
    unsafe { f(&mut *memory.page_ptr::<PageTable>(page)) }
}

/// A page table: its directory page, its leaf pages and the hole finder's cursor.
pub struct PageDirectory {
    dir: Page,
    leaves: Box<[Option<Page>]>,
    pub(crate) cursor: usize,
}

impl PageDirectory {
    /// Takes ownership of `dir` as a directory page. The page is cleared.
    pub(crate) fn new(dir: Page, memory: &AddressTranslator) -> Self {
        let mut this = Self {
            dir,
            leaves: vec![None; ENTRIES].into_boxed_slice(),
            cursor: 0,
        };
        this.reset(memory);
        this
    }

    /// Physical address of the directory, the value the kernel loads as the root.
    pub fn root(&self) -> PhysicalAddress {
        self.dir.phys()
    }

    /// Clears every directory entry and forgets all leaves. The leaves must already
    /// have been released.
    pub(crate) fn reset(&mut self, memory: &AddressTranslator) {
        with_table_mut(memory, self.dir, PageTable::clear);
        self.leaves.fill(None);
        self.cursor = 0;
    }

    /// Reads directory entry `pde`.
    pub fn dir_entry(&self, memory: &AddressTranslator, pde: usize) -> PageEntry {
        table(memory, self.dir).entry(pde)
    }

    /// Writes a directory entry that has no leaf behind it (kernel or registry entries).
    pub(crate) fn set_dir_entry(&mut self, memory: &AddressTranslator, pde: usize, entry: PageEntry) {
        with_table_mut(memory, self.dir, |dir| *dir.entry_mut(pde) = entry);
    }

    /// The page holding the leaf table for `pde`, if there is one.
    pub fn leaf(&self, pde: usize) -> Option<Page> {
        self.leaves[pde]
    }

    /// Number of leaf tables the directory owns.
    pub fn leaf_count(&self) -> usize {
        self.leaves.iter().flatten().count()
    }

    /// Clears `page` and makes it the leaf table for `pde`.
    pub(crate) fn install_leaf(
        &mut self,
        memory: &AddressTranslator,
        pde: usize,
        page: Page,
        flags: PageFlags,
    ) {
        with_table_mut(memory, page, PageTable::clear);
        self.leaves[pde] = Some(page);
        self.set_dir_entry(memory, pde, PageEntry::new(page.phys(), flags));
    }

    /// Detaches the leaf table for `pde`, clearing the directory entry.
    pub(crate) fn take_leaf(&mut self, memory: &AddressTranslator, pde: usize) -> Option<Page> {
        let leaf = self.leaves[pde].take()?;
        self.set_dir_entry(memory, pde, PageEntry::EMPTY);
        Some(leaf)
    }

    pub(crate) fn leaf_entry(&self, memory: &AddressTranslator, pde: usize, pte: usize) -> Option<PageEntry> {
        self.leaves[pde].map(|leaf| table(memory, leaf).entry(pte))
    }

    /// Writes a leaf entry. Returns `false` if `pde` has no leaf table.
    pub(crate) fn set_leaf_entry(
        &mut self,
        memory: &AddressTranslator,
        pde: usize,
        pte: usize,
        entry: PageEntry,
    ) -> bool {
        match self.leaves[pde] {
            Some(leaf) => {
                with_table_mut(memory, leaf, |table| *table.entry_mut(pte) = entry);
                true
            }
            None => false,
        }
    }

    /// Walks the table for one linear address.
    pub fn lookup(&self, memory: &AddressTranslator, linear: VirtualAddress) -> Option<Mapping> {
        let pde = linear.pde();
        let entry = self.dir_entry(memory, pde);
        if !entry.is_present() {
            return None;
        }
        if entry.is_big_page() {
            let offset = linear.as_usize() & (BIG_PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
            return Some(Mapping {
                frame: entry.frame() + offset,
                flags: entry.flags(),
            });
        }
        let leaf = self.leaf_entry(memory, pde, linear.pte())?;
        leaf.address().map(|frame| Mapping {
            frame,
            flags: leaf.flags(),
        })
    }

    /// Checks that every directory entry agrees with the leaf bookkeeping.
    ///
    /// An entry with a recorded leaf must be a present, normal entry pointing at that leaf.
    /// An entry without one must be empty, unless `reserved` says the manager put it
    /// there on purpose. Returns the first offending index.
    pub(crate) fn check(&self, memory: &AddressTranslator, reserved: impl Fn(usize) -> bool) -> Result<(), usize> {
        let dir = table(memory, self.dir);
        (0..ENTRIES)
            .find(|&pde| {
                let entry = dir.entry(pde);
                match self.leaves[pde] {
                    Some(leaf) => {
                        !entry.is_present() || entry.is_big_page() || entry.frame() != leaf.phys()
                    }
                    None => entry.is_present() && !reserved(pde),
                }
            })
            .map_or(Ok(()), Err)
    }
}
