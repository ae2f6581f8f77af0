//! Bringing the manager up: its own page table, the registry, and paging itself.

use alloc::vec::Vec;

use log::{debug, info};

use crate::{
    PhysicalAddress, VirtualAddress,
    address::AddressTranslator,
    address_space::KernelMapping,
    arch::{BIG_PAGE_SIZE, PAGE_SIZE, PageEntry, PageFlags},
    config::{BootParams, Config},
    error::{Fatal, VmError},
    frame::{FrameAllocator, Page},
    heap::{AllocReason, HeapStats},
    kernel::{KernelControl, KernelError},
    manager::{VmManager, slot_table},
    process::SegmentKind,
    registry::DirectoryRegistry,
    reserve::{FrameReserve, RESERVE_CAPACITY},
    scratch::ScratchWindow,
    writer::WriteMode,
};

/// Turns any failure during `step` into a fatal one.
fn during(step: &'static str) -> impl FnOnce(VmError) -> Fatal {
    move |err| match err {
        VmError::Fatal(fatal) => fatal,
        VmError::Exhausted(cause) => Fatal::Bootstrap { step, cause }.logged(),
    }
}

fn kernel_call(op: &'static str) -> impl FnOnce(KernelError) -> Fatal {
    move |code| Fatal::Kernel { op, code }.logged()
}

/// Seeds the reserve with the static pages at `area`, before any page table exists.
fn pin_reserve(params: &BootParams) -> Result<FrameReserve, Fatal> {
    let (lo, hi) = params.own.image();
    let mut reserve = FrameReserve::new();
    for index in 0..RESERVE_CAPACITY {
        let virt = params.reserve_area + index * PAGE_SIZE;
        let phys = params
            .own
            .vir2phys(virt)
            .filter(|phys| phys.is_aligned(PAGE_SIZE) && *phys >= lo && phys.as_usize() + PAGE_SIZE <= hi)
            .ok_or_else(|| Fatal::BadReserveArea(virt).logged())?;
        reserve
            .put(Page::new(virt, phys))
            .map_err(|page| Fatal::BadReserveArea(page.virt()).logged())?;
    }
    Ok(reserve)
}

/// How far the image has to move so it starts no lower than process space.
fn relocation(lo: PhysicalAddress, hi: usize, proc_start: VirtualAddress) -> Result<usize, Fatal> {
    let moveup = proc_start.as_usize().saturating_sub(lo.as_usize());
    let bad = || {
        Fatal::BadImage {
            lo: lo.as_usize(),
            hi,
            moveup,
        }
        .logged()
    };
    if !lo.is_aligned(PAGE_SIZE) || hi % PAGE_SIZE != 0 || lo.as_usize() >= hi {
        return Err(bad());
    }
    if moveup != 0 && lo.as_usize() + moveup < hi {
        return Err(bad());
    }
    match hi.checked_add(moveup) {
        Some(end) if VirtualAddress::try_new(end - 1).is_some() => Ok(moveup),
        _ => Err(bad()),
    }
}

impl<F: FrameAllocator, K: KernelControl> VmManager<F, K> {
    /// Builds the manager's own address space and turns paging on.
    ///
    /// Runs once, with paging still off. The manager's image is mapped both where it is
    /// and where it moves to (at the start of process space, if it sits lower), the
    /// kernel learns which directory entries it may use and where the registry is, and
    /// after paging is enabled the old location is unmapped. Every failure is fatal.
    pub fn bootstrap(
        config: Config,
        memory: AddressTranslator,
        frames: F,
        kernel: K,
        params: BootParams,
    ) -> Result<Self, Fatal> {
        config.validate().map_err(|why| Fatal::Config(why).logged())?;
        let own = params.own;
        if own.slot.index() >= config.slots {
            return Err(Fatal::InvalidSlot(own.slot).logged());
        }
        if !own.live {
            return Err(Fatal::DeadProcess(own.slot).logged());
        }

        let reserve = pin_reserve(&params)?;
        let kernel_mapping = KernelMapping::locate(config.kernel, params.features)?;
        let (lo, hi) = own.image();
        let moveup = relocation(lo, hi, config.proc_start)?;
        let len = hi - lo.as_usize();
        debug!("vmm: image {lo}..{hi:#x}, moving up {moveup:#x}");

        let mut stats = HeapStats::default();
        stats.allocated(AllocReason::Spare, RESERVE_CAPACITY);
        let mut vm = Self {
            config,
            memory,
            frames,
            kernel,
            own,
            tables: (0..config.slots).map(|_| None).collect(),
            has_page_table: false,
            reserve,
            registry: None,
            kernel_mapping,
            window: None,
            stats,
        };
        let slot = own.slot;

        vm.create(slot).map_err(during("own page table"))?;

        // Both copies stay mapped until paging is on and the segments point upward.
        let original = VirtualAddress::new(lo.as_usize());
        if moveup != 0 {
            vm.write_map(slot, original + moveup, Some(lo), len, PageFlags::USER_RW, WriteMode::Fresh)
                .map_err(during("relocated image"))?;
        }
        vm.write_map(slot, original, Some(lo), len, PageFlags::USER_RW, WriteMode::Fresh)
            .map_err(during("image"))?;
        for segment in vm.own.segments.iter_mut() {
            segment.phys = segment.phys + moveup;
        }

        let page = vm
            .alloc_pages(1, AllocReason::PageTable)
            .map_err(during("directory registry"))?;
        vm.registry = Some(DirectoryRegistry::new(page, &vm.memory));

        // Pretend the stack reaches the data top so the kernel lets the heap grow there.
        let stack = &mut vm.own.segments[SegmentKind::Stack];
        let stack_end = stack.vir.as_usize() + stack.len;
        let extra = config.data_top.as_usize().checked_sub(stack_end).ok_or_else(|| {
            Fatal::BadImage {
                lo: lo.as_usize(),
                hi,
                moveup,
            }
            .logged()
        })?;
        stack.len += extra;
        vm.own.data_top = config.data_top;

        slot_table(&mut vm.tables, slot)?.cursor = 0;
        vm.has_page_table = true;

        let (min, max) = vm.heap_window()?;
        let memory = &vm.memory;
        let loc = slot_table(&mut vm.tables, slot)?
            .find_hole(memory, PAGE_SIZE, min, max)
            .map_err(during("scratch window"))?;
        let virt = vm
            .own
            .map2vir(loc)
            .ok_or_else(|| Fatal::Unaddressable(loc.as_usize()).logged())?;
        vm.window = Some(ScratchWindow::new(loc, virt));

        let proc_pde = config.proc_start.pde();
        let registry_pde = vm.choose_registry_pde(proc_pde)?;
        vm.kernel_mapping.registry = Some((
            registry_pde,
            PageEntry::new(page.phys(), PageFlags::USER_RW),
        ));
        vm.kernel_mapping.proc_pde = proc_pde;

        let free = vm.free_directory_slots(registry_pde, proc_pde)?;
        for &pde in &free {
            vm.kernel
                .release_directory_slot(pde)
                .map_err(kernel_call("release_directory_slot"))?;
        }
        vm.kernel
            .set_kernel_limit(proc_pde * BIG_PAGE_SIZE)
            .map_err(kernel_call("set_kernel_limit"))?;
        let directories = params
            .system
            .map2vir(VirtualAddress::new(registry_pde * BIG_PAGE_SIZE))
            .ok_or_else(|| Fatal::Unaddressable(registry_pde * BIG_PAGE_SIZE).logged())?;
        vm.kernel
            .set_page_directories(directories)
            .map_err(kernel_call("set_page_directories"))?;

        vm.map_kernel(slot).map_err(during("kernel mapping"))?;
        let bound = vm.own;
        vm.bind(slot, &bound).map_err(during("bind"))?;

        vm.kernel
            .enable_paging(&vm.own.segments)
            .map_err(kernel_call("enable_paging"))?;

        vm.own.segments[SegmentKind::Stack].len -= extra;
        if moveup != 0 {
            vm.write_map(slot, original, None, len, PageFlags::empty(), WriteMode::Overwrite)
                .map_err(during("unmap original image"))?;
        }

        info!(
            "vmm: paging enabled; kernel pde {}, registry pde {registry_pde}, process space from pde {proc_pde}",
            vm.kernel_mapping.pde
        );
        info!(
            "vmm: {} directory entries released, scratch window at {loc}, {} reserve page(s) left",
            free.len(),
            vm.reserve.available()
        );
        Ok(vm)
    }

    /// The first directory entry between the kernel and process space that the
    /// manager's own table leaves empty.
    fn choose_registry_pde(&self, proc_pde: usize) -> Result<usize, Fatal> {
        let table = self.table(self.own.slot)?;
        (self.kernel_mapping.pde + 1..proc_pde)
            .find(|&pde| !table.dir_entry(&self.memory, pde).is_present())
            .ok_or_else(|| Fatal::NoRegistrySlot(proc_pde * BIG_PAGE_SIZE).logged())
    }

    /// Directory entries below process space the kernel may use for itself.
    fn free_directory_slots(&self, registry_pde: usize, proc_pde: usize) -> Result<Vec<usize>, Fatal> {
        let table = self.table(self.own.slot)?;
        Ok((self.kernel_mapping.pde + 1..proc_pde)
            .filter(|&pde| pde != registry_pde && !table.dir_entry(&self.memory, pde).is_present())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Slot,
        arch::LINEAR_LIMIT,
        config::Checking,
        emulation::{KernelCall, RecordingKernel, TestBed},
        kernel::CpuFeatures,
    };

    const MOVEUP: usize = TestBed::PROC_START - TestBed::IMAGE_BASE;

    fn va(addr: usize) -> VirtualAddress {
        VirtualAddress::new(addr)
    }

    fn pa(addr: usize) -> PhysicalAddress {
        PhysicalAddress::new(addr)
    }

    #[test]
    fn kernel_hears_about_the_layout_in_order() {
        let vm = TestBed::new().boot().expect("boot");
        let root = vm.table(vm.own_slot()).expect("own table").root();
        let calls = &vm.kernel().calls;

        let mut expected: Vec<KernelCall> = (3..8).map(KernelCall::ReleaseSlot).collect();
        expected.push(KernelCall::KernelLimit(TestBed::PROC_START));
        expected.push(KernelCall::PageDirectories(va(2 * BIG_PAGE_SIZE)));
        expected.push(KernelCall::SetRoot {
            endpoint: vm.own().endpoint,
            root,
        });
        assert_eq!(calls[..expected.len()], expected[..]);

        let Some(KernelCall::EnablePaging(segments)) = calls.get(expected.len()) else {
            panic!("paging not enabled: {calls:?}");
        };
        // Paging starts with the stack stretched to the data top.
        let stack = segments[SegmentKind::Stack];
        assert_eq!(stack.vir.as_usize() + stack.len, LINEAR_LIMIT);
        assert_eq!(segments[SegmentKind::Text].phys, pa(TestBed::PROC_START));
    }

    #[test]
    fn image_moves_to_process_space() {
        let vm = TestBed::new().boot().expect("boot");
        let own = *vm.own();

        assert_eq!(own.segments[SegmentKind::Data].phys, pa(0x42_0000 + MOVEUP));
        assert_eq!(own.segments[SegmentKind::Stack].len, 0x2_0000);
        assert_eq!(own.data_top, va(LINEAR_LIMIT));

        let text = vm
            .lookup(own.slot, va(TestBed::PROC_START))
            .expect("own table")
            .expect("mapped");
        assert_eq!(text.frame, pa(TestBed::IMAGE_BASE));
        assert_eq!(text.flags, PageFlags::USER_RW);
        let last = vm
            .lookup(own.slot, va(TestBed::IMAGE_END + MOVEUP - PAGE_SIZE))
            .expect("own table")
            .expect("mapped");
        assert_eq!(last.frame, pa(TestBed::IMAGE_END - PAGE_SIZE));

        assert_eq!(vm.lookup(own.slot, va(TestBed::IMAGE_BASE)).expect("own table"), None);
    }

    #[test]
    fn own_table_is_registered_and_consistent() {
        let vm = TestBed::new().boot().expect("boot");
        let slot = vm.own_slot();
        let root = vm.table(slot).expect("own table").root();

        assert_eq!(
            vm.registry_entry(slot),
            Some(PageEntry::new(root, PageFlags::PRESENT | PageFlags::WRITE))
        );
        let (pde, entry) = vm.kernel_mapping().registry.expect("registry pde");
        assert_eq!(pde, 2);
        assert_eq!(vm.table(slot).expect("own table").dir_entry(vm.memory(), pde), entry);
        assert_eq!(vm.kernel_mapping().proc_pde, 8);
        vm.check_table(slot).expect("consistent");
    }

    #[test]
    fn bootstrap_lives_off_the_reserve() {
        let vm = TestBed::new().boot().expect("boot");
        assert_eq!(vm.frames().outstanding(), 0);
        // Directory, two image tables and the registry.
        assert_eq!(vm.reserve().available(), RESERVE_CAPACITY - 4);
        assert_eq!(vm.stats().held(AllocReason::Spare), vm.reserve().available());
        assert_eq!(vm.stats().total(), RESERVE_CAPACITY);
    }

    #[test]
    fn scratch_window_sits_at_the_bottom_of_the_heap() {
        let vm = TestBed::new().boot().expect("boot");
        let own = vm.own();
        let heap = own.vir2map(own.stack_top).expect("heap start");
        assert_eq!(vm.window_location(), Some(heap));
    }

    #[test]
    fn small_pages_need_a_kernel_table() {
        let vm = TestBed::new()
            .with_features(CpuFeatures {
                global_pages: false,
                big_pages: false,
            })
            .boot()
            .expect("boot");
        assert_eq!(vm.reserve().available(), 0);
        let kernel = vm.lookup(vm.own_slot(), va(0x1000)).expect("own table").expect("mapped");
        assert_eq!(kernel.flags, PageFlags::PRESENT);
        vm.check_table(vm.own_slot()).expect("consistent");
    }

    #[test]
    fn strict_bootstrap() {
        let vm = TestBed::new()
            .with_checking(Checking::Strict)
            .boot()
            .expect("boot");
        vm.check_table(vm.own_slot()).expect("consistent");
    }

    #[test]
    fn kernel_spanning_two_entries_is_fatal() {
        let mut bed = TestBed::new();
        bed.config.kernel.data_len = BIG_PAGE_SIZE;
        assert!(matches!(bed.boot(), Err(Fatal::KernelTooBig { first: 0, last: 1 })));
    }

    #[test]
    fn failing_to_enable_paging_is_fatal() {
        let err = TestBed::new()
            .boot_with(RecordingKernel::failing_paging(KernelError(-22)))
            .err()
            .expect("paging refused");
        assert_eq!(
            err,
            Fatal::Kernel {
                op: "enable_paging",
                code: KernelError(-22)
            }
        );
    }

    #[test]
    fn reserve_must_come_from_the_image() {
        let mut bed = TestBed::new();
        bed.params.reserve_area = va(0x7_0000);
        assert!(matches!(bed.boot(), Err(Fatal::BadReserveArea(_))));

        let mut bed = TestBed::new();
        bed.params.reserve_area = va(0x3_0800);
        assert!(matches!(bed.boot(), Err(Fatal::BadReserveArea(_))));
    }

    #[test]
    fn registry_needs_a_free_entry_below_process_space() {
        let mut bed = TestBed::new();
        bed.config.proc_start = va(TestBed::IMAGE_BASE);
        assert_eq!(bed.boot().err(), Some(Fatal::NoRegistrySlot(TestBed::IMAGE_BASE)));
    }

    #[test]
    fn own_slot_must_fit_the_table() {
        let mut bed = TestBed::new();
        bed.params.own.slot = Slot::new(bed.config.slots);
        assert!(matches!(bed.boot(), Err(Fatal::InvalidSlot(_))));
    }

    #[test]
    fn relocation_rules() {
        let proc_start = va(TestBed::PROC_START);
        assert_eq!(relocation(pa(0x40_0000), 0x48_0000, proc_start), Ok(MOVEUP));
        assert_eq!(relocation(pa(0x300_0000), 0x308_0000, proc_start), Ok(0));
        assert!(relocation(pa(0x40_0800), 0x48_0000, proc_start).is_err());
        assert!(relocation(pa(0x1ff_0000), 0x201_0000, proc_start).is_err());
    }
}
