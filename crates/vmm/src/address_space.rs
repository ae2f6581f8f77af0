//! Page table lifecycle: create, bind, destroy, and the kernel's share of every table.

use log::debug;

use crate::{
    PhysicalAddress, Slot, VirtualAddress,
    arch::{BIG_PAGE_SIZE, PAGE_SIZE, PageEntry, PageFlags},
    config::KernelLayout,
    error::{Fatal, VmError},
    frame::FrameAllocator,
    heap::AllocReason,
    kernel::{CpuFeatures, KernelControl},
    manager::{VmManager, slot_table},
    page_directory::PageDirectory,
    process::Process,
    writer::WriteMode,
};

/// How the kernel and the registry appear in every page table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelMapping {
    /// Directory entry covering the kernel image.
    pub pde: usize,
    /// Big page entry for `pde`, used when the CPU has big pages.
    pub entry: PageEntry,
    pub big_pages: bool,
    /// `GLOBAL` when the CPU supports it, empty otherwise.
    pub global: PageFlags,
    pub layout: KernelLayout,
    /// Directory entry and value that expose the registry, once bootstrap chose them.
    pub registry: Option<(usize, PageEntry)>,
    /// First directory entry of process space.
    pub proc_pde: usize,
}

impl KernelMapping {
    /// Finds the kernel's directory entry. Text through the last byte of data must fall
    /// within one 4 MiB entry.
    pub(crate) fn locate(layout: KernelLayout, features: CpuFeatures) -> Result<Self, Fatal> {
        let first = VirtualAddress::new(layout.text.as_usize()).pde();
        let last = VirtualAddress::new(layout.data_last().as_usize()).pde();
        if first != last {
            return Err(Fatal::KernelTooBig { first, last }.logged());
        }

        let global = if features.global_pages {
            PageFlags::GLOBAL
        } else {
            PageFlags::empty()
        };
        let entry = PageEntry::big(
            PhysicalAddress::new(first * BIG_PAGE_SIZE),
            PageFlags::USER_RW | global,
        );
        Ok(Self {
            pde: first,
            entry,
            big_pages: features.big_pages,
            global,
            layout,
            registry: None,
            proc_pde: 0,
        })
    }

    /// Whether `pde` is filled by the manager without a leaf table behind it.
    pub fn is_reserved(&self, pde: usize) -> bool {
        (self.big_pages && pde == self.pde) || self.registry.is_some_and(|(registry, _)| registry == pde)
    }

    /// Page-aligned identity ranges for text and data.
    fn ranges(&self) -> [(PhysicalAddress, usize, PageFlags); 2] {
        let range = |base: PhysicalAddress, len: usize, flags| {
            let start = base.align_down(PAGE_SIZE);
            let end = (base.as_usize() + len).next_multiple_of(PAGE_SIZE);
            (start, end - start.as_usize(), flags)
        };
        [
            range(self.layout.text, self.layout.text_len, PageFlags::PRESENT | self.global),
            range(self.layout.data, self.layout.data_len, PageFlags::PRESENT | PageFlags::WRITE),
        ]
    }
}

impl<F: FrameAllocator, K: KernelControl> VmManager<F, K> {
    /// Gives `slot` an empty page table holding only the kernel's share.
    ///
    /// A slot keeps its directory frame across create/destroy cycles, so the root the
    /// kernel knows for it stays valid. Returns the root.
    pub fn create(&mut self, slot: Slot) -> Result<PhysicalAddress, VmError> {
        if slot.index() >= self.tables.len() {
            return Err(Fatal::InvalidSlot(slot).logged().into());
        }
        if slot == self.own.slot && self.has_page_table {
            return Err(Fatal::OwnTable.logged().into());
        }

        if self.tables[slot.index()].is_none() {
            let dir = self.alloc_pages(1, AllocReason::PageDirectory)?;
            self.tables[slot.index()] = Some(PageDirectory::new(dir, &self.memory));
            debug!("vmm: slot {slot}: directory at {}", dir.phys());
        } else {
            self.release_leaves(slot)?;
        }

        let memory = &self.memory;
        let table = slot_table(&mut self.tables, slot)?;
        table.reset(memory);
        let root = table.root();
        self.map_kernel(slot)?;

        if self.config.is_strict() {
            self.check_table(slot)?;
        }
        Ok(root)
    }

    /// Makes `table`'s page table the one `process` runs on.
    pub fn bind(&mut self, table: Slot, process: &Process) -> Result<(), VmError> {
        if !process.live {
            return Err(Fatal::DeadProcess(process.slot).logged().into());
        }
        let root = self.table(table)?.root();
        let registry = self
            .registry
            .as_ref()
            .ok_or_else(|| Fatal::NoRegistry.logged())?;
        registry.record(&self.memory, process.slot, root)?;
        self.kernel
            .set_page_table_root(process.endpoint, root)
            .map_err(|code| {
                Fatal::Kernel {
                    op: "set_page_table_root",
                    code,
                }
                .logged()
            })?;
        debug!("vmm: slot {} bound to table {table} ({root})", process.slot);
        Ok(())
    }

    /// Releases every leaf table of `slot`. The directory frame is kept for reuse.
    ///
    /// Returns how many leaf tables were released.
    pub fn destroy(&mut self, slot: Slot) -> Result<usize, VmError> {
        if slot == self.own.slot {
            return Err(Fatal::OwnTable.logged().into());
        }
        let released = self.release_leaves(slot)?;
        debug!("vmm: slot {slot}: released {released} page table(s)");
        Ok(released)
    }

    fn release_leaves(&mut self, slot: Slot) -> Result<usize, VmError> {
        let mut released = 0;
        for pde in 0..crate::arch::ENTRIES {
            let memory = &self.memory;
            let Some(leaf) = slot_table(&mut self.tables, slot)?.take_leaf(memory, pde) else {
                continue;
            };
            self.free_pages(leaf, 1, AllocReason::PageTable)?;
            released += 1;
        }
        Ok(released)
    }

    /// Installs the kernel image and, once it exists, the registry in `slot`'s table.
    pub(crate) fn map_kernel(&mut self, slot: Slot) -> Result<(), VmError> {
        let mapping = self.kernel_mapping;
        if mapping.big_pages {
            let memory = &self.memory;
            let table = slot_table(&mut self.tables, slot)?;
            if table.leaf(mapping.pde).is_some() {
                return Err(Fatal::Inconsistent {
                    slot,
                    pde: mapping.pde,
                }
                .logged()
                .into());
            }
            table.set_dir_entry(memory, mapping.pde, mapping.entry);
        } else {
            for (base, len, flags) in mapping.ranges() {
                let linear = VirtualAddress::new(base.as_usize());
                self.write_map(slot, linear, Some(base), len, flags, WriteMode::Overwrite)?;
            }
        }

        if let Some((pde, entry)) = mapping.registry {
            let memory = &self.memory;
            let table = slot_table(&mut self.tables, slot)?;
            if table.leaf(pde).is_some() {
                return Err(Fatal::Inconsistent { slot, pde }.logged().into());
            }
            table.set_dir_entry(memory, pde, entry);
        }
        Ok(())
    }
}
