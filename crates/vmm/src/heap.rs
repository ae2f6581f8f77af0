//! The manager's own page allocator.
//!
//! Pages for directories, leaf tables and the registry come from here. A page is a frame
//! from the frame allocator mapped at a hole in the manager's own heap window, so the
//! manager can address it at its returned virtual address. Mapping it may need a leaf
//! table, whose page is then taken from the reserve instead; that is as deep as the
//! recursion is allowed to go.

use log::{debug, trace, warn};

use crate::{
    VirtualAddress,
    arch::{LINEAR_LIMIT, PAGE_SIZE, PageFlags},
    error::{Exhausted, Fatal, VmError},
    frame::{FrameAllocator, Page},
    kernel::KernelControl,
    manager::{VmManager, slot_table},
    reserve::RESERVE_CAPACITY,
    writer::WriteMode,
};

/// How many allocations are in progress on the current call path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Depth(u8);

impl Depth {
    /// No allocation in progress.
    pub(crate) const OUTSIDE: Self = Self(0);

    const LIMIT: u8 = 2;

    pub(crate) fn enter(self) -> Result<Self, Fatal> {
        let depth = self.0 + 1;
        if depth > Self::LIMIT {
            return Err(Fatal::DepthExceeded(depth).logged());
        }
        Ok(Self(depth))
    }

    /// Allocations below the outermost one are served from the reserve.
    fn is_nested(self) -> bool {
        self.0 > 1
    }
}

/// What a page was allocated for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocReason {
    PageDirectory,
    PageTable,
    /// Held by the reserve.
    Spare,
    Other,
}

impl AllocReason {
    const COUNT: usize = 4;
}

/// Pages currently held, by reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    held: [usize; AllocReason::COUNT],
}

impl HeapStats {
    /// Pages currently held for `reason`.
    pub fn held(&self, reason: AllocReason) -> usize {
        self.held[reason as usize]
    }

    /// Pages currently held for any reason.
    pub fn total(&self) -> usize {
        self.held.iter().sum()
    }

    pub(crate) fn allocated(&mut self, reason: AllocReason, pages: usize) {
        self.held[reason as usize] += pages;
    }

    pub(crate) fn released(&mut self, reason: AllocReason, pages: usize) {
        let held = &mut self.held[reason as usize];
        *held = held.saturating_sub(pages);
    }
}

impl<F: FrameAllocator, K: KernelControl> VmManager<F, K> {
    /// Allocates `pages` contiguous frames and maps them into the manager's heap.
    pub fn alloc_pages(&mut self, pages: usize, reason: AllocReason) -> Result<Page, VmError> {
        self.alloc_pages_at(Depth::OUTSIDE, pages, reason)
    }

    pub(crate) fn alloc_pages_at(
        &mut self,
        outer: Depth,
        pages: usize,
        reason: AllocReason,
    ) -> Result<Page, VmError> {
        let depth = outer.enter()?;
        let invalid = || {
            Fatal::InvalidRequest {
                op: "alloc_pages",
                addr: 0,
                len: pages.saturating_mul(PAGE_SIZE),
            }
            .logged()
        };

        if depth.is_nested() || !self.has_page_table {
            if pages != 1 {
                return Err(invalid().into());
            }
            let page = self.reserve.take()?;
            self.stats.released(AllocReason::Spare, 1);
            self.stats.allocated(reason, 1);
            trace!("vmm: {reason:?} page {} from the reserve", page.phys());
            return Ok(page);
        }

        let bytes = match pages.checked_mul(PAGE_SIZE) {
            Some(bytes) if pages > 0 => bytes,
            _ => return Err(invalid().into()),
        };
        let own = self.own.slot;
        let (min, max) = self.heap_window()?;
        let memory = &self.memory;
        let loc = slot_table(&mut self.tables, own)?.find_hole(memory, bytes, min, max)?;
        let virt = self
            .own
            .map2vir(loc)
            .ok_or_else(|| Fatal::Unaddressable(loc.as_usize()).logged())?;

        let Some(phys) = self.frames.allocate(pages) else {
            warn!("vmm: out of frames for {pages} {reason:?} page(s)");
            return Err(Exhausted::PhysicalMemory.into());
        };
        if let Err(err) = self.write_map_at(depth, own, loc, Some(phys), bytes, PageFlags::USER_RW, WriteMode::Fresh) {
            self.frames.free(phys, pages);
            return Err(err);
        }

        self.stats.allocated(reason, pages);
        trace!("vmm: {pages} {reason:?} page(s) at {virt} ({phys})");
        Ok(Page::new(virt, phys))
    }

    /// Unmaps and returns pages obtained from [`alloc_pages`](Self::alloc_pages).
    ///
    /// Pages below the heap (the static pages that seeded the reserve) are never given
    /// back; that is logged and otherwise ignored.
    pub fn free_pages(&mut self, page: Page, pages: usize, reason: AllocReason) -> Result<(), VmError> {
        self.free_pages_at(Depth::OUTSIDE, page, pages, reason)
    }

    pub(crate) fn free_pages_at(
        &mut self,
        depth: Depth,
        page: Page,
        pages: usize,
        reason: AllocReason,
    ) -> Result<(), VmError> {
        if page.virt() < self.own.stack_top {
            warn!("vmm: not freeing {pages} page(s) at {} below the heap", page.virt());
            return Ok(());
        }
        let linear = self
            .own
            .vir2map(page.virt())
            .ok_or_else(|| Fatal::Unaddressable(page.virt().as_usize()).logged())?;
        let bytes = pages.checked_mul(PAGE_SIZE).ok_or_else(|| {
            Fatal::InvalidRequest {
                op: "free_pages",
                addr: linear.as_usize(),
                len: pages,
            }
            .logged()
        })?;

        let own = self.own.slot;
        self.write_map_at(depth, own, linear, None, bytes, PageFlags::empty(), WriteMode::Overwrite)?;
        self.frames.free(page.phys(), pages);
        self.stats.released(reason, pages);
        trace!("vmm: freed {pages} {reason:?} page(s) at {}", page.virt());
        Ok(())
    }

    /// Refills the reserve, returning how many pages were added.
    pub fn replenish(&mut self) -> Result<usize, VmError> {
        let mut refilled = 0;
        let mut outcome = Ok(());

        // Each refill may itself consume reserve pages, so bound the attempts.
        for _ in 0..2 * RESERVE_CAPACITY {
            if self.reserve.missing() == 0 {
                break;
            }
            let page = match self.alloc_pages(1, AllocReason::Spare) {
                Ok(page) => page,
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            };
            if let Err(page) = self.reserve.put(page) {
                outcome = self.free_pages(page, 1, AllocReason::Spare);
                break;
            }
            refilled += 1;
        }

        if refilled > 0 {
            self.reserve.record_refill(refilled);
            debug!("vmm: reserve refilled with {refilled} page(s)");
        }
        outcome.map(|()| refilled)
    }

    /// Periodic upkeep, called between requests.
    ///
    /// Running out of memory while refilling is not an error here; the next cycle tries
    /// again.
    pub fn cycle(&mut self) -> Result<(), Fatal> {
        match self.replenish() {
            Ok(_) => Ok(()),
            Err(VmError::Exhausted(cause)) => {
                warn!("vmm: reserve refill deferred: {cause}");
                Ok(())
            }
            Err(VmError::Fatal(fatal)) => Err(fatal),
        }
    }

    /// Linear range the heap lives in: from the top of the stack to the data top.
    ///
    /// The scratch window is reserved as the lowest page of that range and stays out of it.
    pub(crate) fn heap_window(&self) -> Result<(VirtualAddress, VirtualAddress), Fatal> {
        let stack_top = self.own.stack_top;
        let mut min = self
            .own
            .vir2map(stack_top)
            .and_then(|min| min.as_usize().checked_next_multiple_of(PAGE_SIZE))
            .and_then(VirtualAddress::try_new)
            .ok_or_else(|| Fatal::Unaddressable(stack_top.as_usize()).logged())?;
        if let Some(window) = &self.window {
            min = min.max(window.location() + PAGE_SIZE);
        }
        let limit = VirtualAddress::new(LINEAR_LIMIT);
        let max = self
            .own
            .vir2map(self.own.data_top)
            .map_or(limit, |top| top.min(limit))
            .align_down(PAGE_SIZE);
        Ok((min, max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{arch::BIG_PAGE_SIZE, emulation::TestBed};

    #[test]
    fn depth_is_bounded() {
        let once = Depth::OUTSIDE.enter().expect("outermost");
        let twice = once.enter().expect("nested");
        assert!(!once.is_nested());
        assert!(twice.is_nested());
        assert_eq!(twice.enter(), Err(Fatal::DepthExceeded(3)));
    }

    #[test]
    fn heap_pages_are_mapped_in_the_manager() {
        let mut vm = TestBed::new().boot().expect("boot");
        let page = vm.alloc_pages(2, AllocReason::Other).expect("pages");

        let own = *vm.own();
        assert!(page.virt() >= own.stack_top);
        let linear = own.vir2map(page.virt()).expect("linear");
        let mapping = vm
            .lookup(own.slot, linear + PAGE_SIZE)
            .expect("table")
            .expect("mapped");
        assert_eq!(mapping.frame, page.phys() + PAGE_SIZE);
        assert!(vm.frames().is_outstanding(page.phys()));
        assert_eq!(vm.stats().held(AllocReason::Other), 2);
    }

    #[test]
    fn free_returns_frame_and_mapping() {
        let mut vm = TestBed::new().boot().expect("boot");
        let page = vm.alloc_pages(1, AllocReason::Other).expect("page");
        let linear = vm.own().vir2map(page.virt()).expect("linear");

        vm.free_pages(page, 1, AllocReason::Other).expect("free");
        assert!(!vm.frames().is_outstanding(page.phys()));
        assert_eq!(vm.lookup(vm.own_slot(), linear).expect("table"), None);
        assert_eq!(vm.stats().held(AllocReason::Other), 0);
    }

    #[test]
    fn pages_below_the_heap_are_kept() {
        let mut vm = TestBed::new().boot().expect("boot");
        let outstanding = vm.frames().outstanding();
        let seeded = vm.reserve.take().expect("seeded page");
        assert!(seeded.virt() < vm.own().stack_top);

        vm.free_pages(seeded, 1, AllocReason::Spare).expect("ignored");
        assert_eq!(vm.frames().outstanding(), outstanding);
    }

    #[test]
    fn out_of_frames_is_recoverable() {
        let mut vm = TestBed::new().boot().expect("boot");
        vm.frames_mut().fail_after(0);
        let err = vm.alloc_pages(1, AllocReason::Other).expect_err("exhausted");
        assert_eq!(err, VmError::Exhausted(Exhausted::PhysicalMemory));
        vm.check_table(vm.own_slot()).expect("consistent");
    }

    #[test]
    fn replenish_fills_the_reserve() {
        let mut vm = TestBed::new().boot().expect("boot");
        let missing = vm.reserve().missing();
        assert!(missing > 0);

        assert_eq!(vm.replenish(), Ok(missing));
        assert_eq!(vm.reserve().available(), RESERVE_CAPACITY);
        assert_eq!(vm.reserve().worst_refill(), missing);
        assert_eq!(vm.stats().held(AllocReason::Spare), RESERVE_CAPACITY);
        assert_eq!(vm.replenish(), Ok(0));
    }

    #[test]
    fn nested_allocation_uses_the_reserve() {
        let mut vm = TestBed::new().boot().expect("boot");
        vm.replenish().expect("refill");
        let own = vm.own_slot();

        // Send the next hole into a directory entry the manager has no table for yet.
        let fresh = TestBed::PROC_START + BIG_PAGE_SIZE;
        vm.table_mut(own).expect("own table").cursor = fresh;
        let leaves = vm.table(own).expect("own table").leaf_count();
        let tables_held = vm.stats().held(AllocReason::PageTable);

        let page = vm.alloc_pages(1, AllocReason::Other).expect("page");
        assert_eq!(vm.own().vir2map(page.virt()), Some(VirtualAddress::new(fresh)));
        assert_eq!(vm.table(own).expect("own table").leaf_count(), leaves + 1);
        assert_eq!(vm.reserve().available(), RESERVE_CAPACITY - 1);
        assert_eq!(vm.stats().held(AllocReason::PageTable), tables_held + 1);
        vm.check_table(own).expect("consistent");
    }

    #[test]
    fn empty_reserve_on_nested_allocation_is_fatal() {
        let mut vm = TestBed::new().boot().expect("boot");
        while vm.reserve().available() > 0 {
            vm.reserve.take().expect("page");
        }
        let own = vm.own_slot();
        vm.table_mut(own).expect("own table").cursor = TestBed::PROC_START + BIG_PAGE_SIZE;

        let err = vm.alloc_pages(1, AllocReason::Other).expect_err("no reserve");
        assert_eq!(err, VmError::Fatal(Fatal::ReserveExhausted));
    }

    #[test]
    fn reserve_covers_a_full_refill_cycle() {
        let mut vm = TestBed::new().boot().expect("boot");
        vm.replenish().expect("refill");
        // Every reserve page can be handed out back to back.
        for _ in 0..RESERVE_CAPACITY {
            vm.reserve.take().expect("reserve page");
        }
        assert_eq!(vm.reserve.take(), Err(Fatal::ReserveExhausted));
        assert_eq!(vm.replenish(), Ok(RESERVE_CAPACITY));
    }

    #[test]
    fn cycle_tolerates_exhaustion() {
        let mut vm = TestBed::new().boot().expect("boot");
        vm.frames_mut().fail_after(0);
        assert_eq!(vm.cycle(), Ok(()));
        assert!(vm.reserve().missing() > 0);
    }

    #[test]
    fn zero_pages_is_invalid() {
        let mut vm = TestBed::new().boot().expect("boot");
        assert!(vm.alloc_pages(0, AllocReason::Other).expect_err("invalid").is_fatal());
    }
}
