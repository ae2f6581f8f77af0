//! The manager context.
//!
//! Everything the page table core keeps between requests lives in one [`VmManager`]:
//! the per-slot tables, the reserve, the registry, the scratch window and the handles to
//! the frame allocator and the kernel. Operations are split across modules by concern and
//! all take `&mut self`; the manager is single threaded.

use alloc::vec::Vec;

use crate::{
    Slot, VirtualAddress,
    address::AddressTranslator,
    address_space::KernelMapping,
    arch::PageEntry,
    config::Config,
    error::Fatal,
    frame::FrameAllocator,
    heap::HeapStats,
    kernel::KernelControl,
    page_directory::{Mapping, PageDirectory},
    process::Process,
    registry::DirectoryRegistry,
    reserve::FrameReserve,
    scratch::ScratchWindow,
};

/// The page table core: every process's table plus the state needed to edit them.
///
/// Only [`bootstrap`](Self::bootstrap) creates one.
pub struct VmManager<F: FrameAllocator, K: KernelControl> {
    pub(crate) config: Config,
    pub(crate) memory: AddressTranslator,
    pub(crate) frames: F,
    pub(crate) kernel: K,
    /// The manager's own process-table entry.
    pub(crate) own: Process,
    pub(crate) tables: Vec<Option<PageDirectory>>,
    /// Set once the manager's own table maps its heap window.
    pub(crate) has_page_table: bool,
    pub(crate) reserve: FrameReserve,
    pub(crate) registry: Option<DirectoryRegistry>,
    pub(crate) kernel_mapping: KernelMapping,
    pub(crate) window: Option<ScratchWindow>,
    pub(crate) stats: HeapStats,
}

/// Looks up a slot's table through the field rather than `self`, so callers can keep
/// borrowing the translator.
pub(crate) fn slot_table(tables: &mut [Option<PageDirectory>], slot: Slot) -> Result<&mut PageDirectory, Fatal> {
    match tables.get_mut(slot.index()) {
        Some(Some(table)) => Ok(table),
        Some(None) => Err(Fatal::NoTable(slot).logged()),
        None => Err(Fatal::InvalidSlot(slot).logged()),
    }
}

impl<F: FrameAllocator, K: KernelControl> VmManager<F, K> {
    /// The configuration the manager was booted with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The manager's own process, with its segments as relocated at bootstrap.
    pub fn own(&self) -> &Process {
        &self.own
    }

    /// Slot of the manager's own page table.
    pub fn own_slot(&self) -> Slot {
        self.own.slot
    }

    /// How the manager reaches page table memory.
    pub fn memory(&self) -> &AddressTranslator {
        &self.memory
    }

    /// The external frame allocator.
    pub fn frames(&self) -> &F {
        &self.frames
    }

    /// The external frame allocator, mutably.
    pub fn frames_mut(&mut self) -> &mut F {
        &mut self.frames
    }

    /// The kernel control channel.
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// The reserve of pages for nested allocations.
    pub fn reserve(&self) -> &FrameReserve {
        &self.reserve
    }

    /// Pages held by the manager, by reason.
    pub fn stats(&self) -> &HeapStats {
        &self.stats
    }

    /// How the kernel and the registry are mapped into every table.
    pub fn kernel_mapping(&self) -> &KernelMapping {
        &self.kernel_mapping
    }

    /// Linear address of the scratch window, once bootstrap reserved it.
    pub fn window_location(&self) -> Option<VirtualAddress> {
        self.window.as_ref().map(|window| window.location())
    }

    /// Returns `slot`'s page table.
    pub fn table(&self, slot: Slot) -> Result<&PageDirectory, Fatal> {
        match self.tables.get(slot.index()) {
            Some(Some(table)) => Ok(table),
            Some(None) => Err(Fatal::NoTable(slot).logged()),
            None => Err(Fatal::InvalidSlot(slot).logged()),
        }
    }

    #[cfg(test)]
    pub(crate) fn table_mut(&mut self, slot: Slot) -> Result<&mut PageDirectory, Fatal> {
        slot_table(&mut self.tables, slot)
    }

    /// Returns whether `slot` has a page table.
    pub fn has_table(&self, slot: Slot) -> bool {
        matches!(self.tables.get(slot.index()), Some(Some(_)))
    }

    /// What `linear` translates to in `slot`'s table.
    pub fn lookup(&self, slot: Slot, linear: VirtualAddress) -> Result<Option<Mapping>, Fatal> {
        Ok(self.table(slot)?.lookup(&self.memory, linear))
    }

    /// The registry entry for `slot`, once the registry exists. `None` for slots the
    /// registry has no entry for.
    pub fn registry_entry(&self, slot: Slot) -> Option<PageEntry> {
        self.registry
            .as_ref()
            .and_then(|registry| registry.entry(&self.memory, slot))
    }

    /// Verifies that `slot`'s directory agrees with the leaf bookkeeping.
    pub fn check_table(&self, slot: Slot) -> Result<(), Fatal> {
        let mapping = &self.kernel_mapping;
        self.table(slot)?
            .check(&self.memory, |pde| mapping.is_reserved(pde))
            .map_err(|pde| Fatal::Inconsistent { slot, pde }.logged())
    }
}
