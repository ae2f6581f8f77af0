//! Writing ranges of leaf entries.

use log::{debug, trace};

use crate::{
    PageNumber, PhysicalAddress, Slot, VirtualAddress,
    arch::{PAGE_SIZE, PageEntry, PageFlags},
    error::{Fatal, VmError},
    frame::FrameAllocator,
    heap::{AllocReason, Depth},
    kernel::KernelControl,
    manager::{VmManager, slot_table},
};

/// Whether a write may replace entries that are already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Every entry in the range must be empty beforehand.
    Fresh,
    /// Existing entries are replaced.
    Overwrite,
}

const OP: &str = "write_map";

/// One past the highest 32-bit address.
const ADDRESS_SPACE_END: u64 = 1 << 32;

fn validate(
    virt: VirtualAddress,
    target: Option<PhysicalAddress>,
    bytes: usize,
    flags: PageFlags,
) -> Result<(), Fatal> {
    let invalid = || {
        Fatal::InvalidRequest {
            op: OP,
            addr: virt.as_usize(),
            len: bytes,
        }
        .logged()
    };
    let fits = |base: usize| base as u64 + bytes as u64 <= ADDRESS_SPACE_END;

    if bytes == 0 || bytes % PAGE_SIZE != 0 || !virt.is_aligned(PAGE_SIZE) || !fits(virt.as_usize()) {
        return Err(invalid());
    }
    let flags_fit = PageFlags::LEAF.contains(flags)
        && match target {
            Some(_) => flags.is_present(),
            None => flags.is_empty(),
        };
    if !flags_fit {
        return Err(Fatal::InvalidFlags {
            op: OP,
            flags: flags.bits(),
        }
        .logged());
    }
    match target {
        Some(base) if !base.is_aligned(PAGE_SIZE) || !fits(base.as_usize()) => Err(invalid()),
        _ => Ok(()),
    }
}

impl<F: FrameAllocator, K: KernelControl> VmManager<F, K> {
    /// Points every page of `[virt, virt + bytes)` in `slot`'s table at consecutive
    /// frames from `target`, or clears them when `target` is `None`.
    ///
    /// Leaf tables the range needs are allocated before any entry is written, so a
    /// failed write leaves every existing translation as it was.
    pub fn write_map(
        &mut self,
        slot: Slot,
        virt: VirtualAddress,
        target: Option<PhysicalAddress>,
        bytes: usize,
        flags: PageFlags,
        mode: WriteMode,
    ) -> Result<(), VmError> {
        self.write_map_at(Depth::OUTSIDE, slot, virt, target, bytes, flags, mode)
    }

    /// Maps a range that must currently be unmapped.
    pub fn map(
        &mut self,
        slot: Slot,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        bytes: usize,
        flags: PageFlags,
    ) -> Result<(), VmError> {
        self.write_map(slot, virt, Some(phys), bytes, flags, WriteMode::Fresh)
    }

    /// Maps a range, replacing whatever was there.
    pub fn remap(
        &mut self,
        slot: Slot,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        bytes: usize,
        flags: PageFlags,
    ) -> Result<(), VmError> {
        self.write_map(slot, virt, Some(phys), bytes, flags, WriteMode::Overwrite)
    }

    /// Clears a range. Pages that were not mapped stay unmapped.
    pub fn unmap(&mut self, slot: Slot, virt: VirtualAddress, bytes: usize) -> Result<(), VmError> {
        self.write_map(slot, virt, None, bytes, PageFlags::empty(), WriteMode::Overwrite)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn write_map_at(
        &mut self,
        depth: Depth,
        slot: Slot,
        virt: VirtualAddress,
        target: Option<PhysicalAddress>,
        bytes: usize,
        flags: PageFlags,
        mode: WriteMode,
    ) -> Result<(), VmError> {
        validate(virt, target, bytes, flags)?;
        let pages = PageNumber::range(virt, bytes);
        let first = virt.pde();
        let last = VirtualAddress::new(virt.as_usize() + (bytes - 1)).pde();

        for pde in first..=last {
            let table = self.table(slot)?;
            let entry = table.dir_entry(&self.memory, pde);
            match (entry.is_present(), table.leaf(pde).is_some()) {
                (true, _) if entry.is_big_page() => {
                    return Err(Fatal::BigPage { slot, pde }.logged().into());
                }
                (true, true) => {}
                (false, false) => self.ensure_leaf_table(depth, slot, pde, flags)?,
                _ => return Err(Fatal::Inconsistent { slot, pde }.logged().into()),
            }
        }

        if mode == WriteMode::Fresh {
            let table = self.table(slot)?;
            for page in pages.clone() {
                let linear = page.start();
                let entry = table.leaf_entry(&self.memory, linear.pde(), linear.pte());
                if let Some(entry) = entry.filter(|entry| entry.is_present()) {
                    return Err(Fatal::AlreadyMapped {
                        slot,
                        virt: linear,
                        entry,
                    }
                    .logged()
                    .into());
                }
            }
        }

        // Every leaf exists now; nothing below can fail short of corrupted bookkeeping.
        let memory = &self.memory;
        let table = slot_table(&mut self.tables, slot)?;
        for (offset, page) in pages.enumerate() {
            let linear = page.start();
            let entry = match target {
                Some(base) => PageEntry::new(base + offset * PAGE_SIZE, flags),
                None => PageEntry::EMPTY,
            };
            if !table.set_leaf_entry(memory, linear.pde(), linear.pte(), entry) {
                return Err(Fatal::Inconsistent {
                    slot,
                    pde: linear.pde(),
                }
                .logged()
                .into());
            }
        }
        trace!("vmm: slot {slot}: {virt}+{bytes:#x} -> {target:?} {flags:?}");

        if self.config.is_strict() {
            self.check_table(slot)?;
        }
        Ok(())
    }

    /// Gives `slot` a leaf table for `pde`.
    fn ensure_leaf_table(
        &mut self,
        depth: Depth,
        slot: Slot,
        pde: usize,
        flags: PageFlags,
    ) -> Result<(), VmError> {
        let page = self.alloc_pages_at(depth, 1, AllocReason::PageTable)?;
        let memory = &self.memory;
        let table = slot_table(&mut self.tables, slot)?;

        if table.dir_entry(memory, pde).is_present() {
            // The allocation above mapped its page through this very entry.
            debug!("vmm: slot {slot}: pde {pde} filled while allocating, dropping {}", page.phys());
            return self.free_pages_at(depth, page, 1, AllocReason::PageTable);
        }

        table.install_leaf(memory, pde, page, flags | PageFlags::USER_RW);
        debug!("vmm: slot {slot}: page table for pde {pde} at {}", page.phys());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arch::BIG_PAGE_SIZE,
        config::Checking,
        emulation::TestBed,
        error::Exhausted,
    };

    const USER: Slot = Slot::new(3);

    fn va(addr: usize) -> VirtualAddress {
        VirtualAddress::new(addr)
    }

    fn pa(addr: usize) -> PhysicalAddress {
        PhysicalAddress::new(addr)
    }

    fn base() -> usize {
        TestBed::PROC_START
    }

    #[test]
    fn map_lookup_unmap() {
        let mut vm = TestBed::new().boot().expect("boot");
        vm.create(USER).expect("create");

        let linear = va(base() + 0x10000);
        vm.map(USER, linear, pa(0x50_0000), 2 * PAGE_SIZE, PageFlags::USER_RW)
            .expect("map");

        let second = vm.lookup(USER, linear + PAGE_SIZE).expect("table").expect("mapped");
        assert_eq!(second.frame, pa(0x50_1000));
        assert_eq!(second.flags, PageFlags::USER_RW);

        vm.unmap(USER, linear, 2 * PAGE_SIZE).expect("unmap");
        assert_eq!(vm.lookup(USER, linear).expect("table"), None);
        vm.check_table(USER).expect("consistent");
    }

    #[test]
    fn fresh_write_refuses_present_entries() {
        let mut vm = TestBed::new().boot().expect("boot");
        vm.create(USER).expect("create");
        let linear = va(base());
        vm.map(USER, linear + PAGE_SIZE, pa(0x50_0000), PAGE_SIZE, PageFlags::USER_RW)
            .expect("map");

        let err = vm
            .map(USER, linear, pa(0x51_0000), 2 * PAGE_SIZE, PageFlags::USER_RW)
            .expect_err("overlap");
        assert!(matches!(
            err,
            VmError::Fatal(Fatal::AlreadyMapped { virt, .. }) if virt == linear + PAGE_SIZE
        ));
        // Nothing from the refused write landed.
        assert_eq!(vm.lookup(USER, linear).expect("table"), None);
        let kept = vm.lookup(USER, linear + PAGE_SIZE).expect("table").expect("mapped");
        assert_eq!(kept.frame, pa(0x50_0000));
    }

    #[test]
    fn overwrite_replaces_entries() {
        let mut vm = TestBed::new().boot().expect("boot");
        vm.create(USER).expect("create");
        let linear = va(base());
        vm.map(USER, linear, pa(0x50_0000), PAGE_SIZE, PageFlags::USER_RW)
            .expect("map");
        vm.remap(USER, linear, pa(0x52_0000), PAGE_SIZE, PageFlags::PRESENT | PageFlags::USER)
            .expect("remap");

        let mapping = vm.lookup(USER, linear).expect("table").expect("mapped");
        assert_eq!(mapping.frame, pa(0x52_0000));
        assert!(!mapping.flags.contains(PageFlags::WRITE));
    }

    #[test]
    fn range_across_directory_entries_gets_every_table() {
        let mut vm = TestBed::new().boot().expect("boot");
        vm.create(USER).expect("create");
        let before = vm.table(USER).expect("table").leaf_count();

        let linear = va(base() + BIG_PAGE_SIZE - PAGE_SIZE);
        vm.map(USER, linear, pa(0x50_0000), 3 * PAGE_SIZE, PageFlags::USER_RW)
            .expect("map");

        assert_eq!(vm.table(USER).expect("table").leaf_count(), before + 2);
        let last = vm
            .lookup(USER, linear + 2 * PAGE_SIZE)
            .expect("table")
            .expect("mapped");
        assert_eq!(last.frame, pa(0x50_2000));
    }

    #[test]
    fn failed_table_allocation_leaves_range_untouched() {
        let mut vm = TestBed::new().boot().expect("boot");
        vm.create(USER).expect("create");
        vm.frames_mut().fail_after(1);

        let linear = va(base() + BIG_PAGE_SIZE - PAGE_SIZE);
        let err = vm
            .map(USER, linear, pa(0x50_0000), 3 * BIG_PAGE_SIZE, PageFlags::USER_RW)
            .expect_err("out of frames");
        assert_eq!(err, VmError::Exhausted(Exhausted::PhysicalMemory));

        for page in PageNumber::range(linear, 3 * BIG_PAGE_SIZE).step_by(97) {
            assert_eq!(vm.lookup(USER, page.start()).expect("table"), None);
        }
        vm.check_table(USER).expect("consistent");
    }

    #[test]
    fn big_page_entries_cannot_be_written_through() {
        let mut vm = TestBed::new().boot().expect("boot");
        vm.create(USER).expect("create");
        let err = vm
            .map(USER, va(0x8000), pa(0x8000), PAGE_SIZE, PageFlags::USER_RW)
            .expect_err("kernel big page");
        assert_eq!(
            err,
            VmError::Fatal(Fatal::BigPage {
                slot: USER,
                pde: 0
            })
        );
    }

    #[test]
    fn invalid_requests_are_fatal() {
        let mut vm = TestBed::new().boot().expect("boot");
        vm.create(USER).expect("create");
        let linear = va(base());

        let cases = [
            vm.map(USER, linear + 1, pa(0x50_0000), PAGE_SIZE, PageFlags::USER_RW),
            vm.map(USER, linear, pa(0x50_0010), PAGE_SIZE, PageFlags::USER_RW),
            vm.map(USER, linear, pa(0x50_0000), 0, PageFlags::USER_RW),
            vm.map(USER, linear, pa(0x50_0000), PAGE_SIZE, PageFlags::USER),
            vm.map(USER, linear, pa(0x50_0000), PAGE_SIZE, PageFlags::USER_RW | PageFlags::BIG_PAGE),
            vm.write_map(USER, linear, None, PAGE_SIZE, PageFlags::PRESENT, WriteMode::Overwrite),
        ];
        for result in cases {
            assert!(result.expect_err("invalid").is_fatal());
        }
    }

    #[test]
    fn writes_to_missing_tables_are_fatal() {
        let mut vm = TestBed::new().boot().expect("boot");
        let err = vm
            .map(USER, va(base()), pa(0x50_0000), PAGE_SIZE, PageFlags::USER_RW)
            .expect_err("no table");
        assert_eq!(err, VmError::Fatal(Fatal::NoTable(USER)));
    }

    #[test]
    fn top_of_linear_space_is_writable() {
        let mut vm = TestBed::new().boot().expect("boot");
        vm.create(USER).expect("create");
        let top = va(crate::arch::LINEAR_LIMIT);
        vm.map(USER, top, pa(0x50_0000), PAGE_SIZE, PageFlags::USER_RW)
            .expect("map");
        assert!(vm.lookup(USER, top).expect("table").is_some());
        assert!(vm.map(USER, top, pa(0x50_0000), 2 * PAGE_SIZE, PageFlags::USER_RW).is_err());
    }

    #[test]
    fn strict_mode_checks_after_each_write() {
        let mut vm = TestBed::new()
            .with_checking(Checking::Strict)
            .boot()
            .expect("boot");
        vm.create(USER).expect("create");
        vm.map(USER, va(base()), pa(0x50_0000), PAGE_SIZE, PageFlags::USER_RW)
            .expect("map");
        vm.unmap(USER, va(base()), PAGE_SIZE).expect("unmap");
    }
}
