//! The page the kernel reads every process's page directory through.
//!
//! The registry is installed as the leaf table of one reserved directory entry in every
//! address space. Its entry `slot` points at that slot's directory, so the directory of
//! any process shows up at `registry base + slot * 4 KiB` in linear space.

use crate::{
    PhysicalAddress, Slot,
    address::AddressTranslator,
    arch::{ENTRIES, PageEntry, PageFlags, PageTable},
    error::Fatal,
    frame::Page,
};

/// The registry page shared with the kernel.
pub struct DirectoryRegistry {
    page: Page,
}

impl DirectoryRegistry {
    /// Takes `page` as the registry and clears it.
    pub(crate) fn new(page: Page, memory: &AddressTranslator) -> Self {
        let this = Self { page };
        this.with_table(memory, PageTable::clear);
        this
    }

    /// Physical address of the registry page.
    pub fn phys(&self) -> PhysicalAddress {
        self.page.phys()
    }

    fn with_table<R>(&self, memory: &AddressTranslator, f: impl FnOnce(&mut PageTable) -> R) -> R {
        // SAFETY: the registry page is owned by the manager and mapped for its lifetime.
        unsafe { f(&mut *memory.page_ptr::<PageTable>(self.page)) }
    }

    /// Publishes the directory at `root` for `slot`.
    pub(crate) fn record(&self, memory: &AddressTranslator, slot: Slot, root: PhysicalAddress) -> Result<(), Fatal> {
        if slot.index() >= ENTRIES {
            return Err(Fatal::InvalidSlot(slot).logged());
        }
        let entry = PageEntry::new(root, PageFlags::PRESENT | PageFlags::WRITE);
        self.with_table(memory, |table| *table.entry_mut(slot.index()) = entry);
        Ok(())
    }

    /// The entry published for `slot`, or `None` past the end of the registry.
    pub fn entry(&self, memory: &AddressTranslator, slot: Slot) -> Option<PageEntry> {
        (slot.index() < ENTRIES).then(|| self.with_table(memory, |table| table.entry(slot.index())))
    }
}
