//! Host-side stand-ins for physical memory, the frame allocator and the kernel.
//!
//! Used by the crate's own tests and, with the `software-emulation` feature, by anyone
//! who wants to drive a manager without hardware. Physical memory is a page-aligned host
//! buffer; every frame the manager touches is addressed through it.

use alloc::{
    alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error},
    collections::BTreeSet,
    vec::Vec,
};
use core::ptr::NonNull;

use crate::{
    FrameNumber, PhysicalAddress, Slot, VirtualAddress,
    address::AddressTranslator,
    arch::{BIG_PAGE_SIZE, PAGE_SIZE},
    config::{BootParams, Checking, Config, KernelLayout},
    error::Fatal,
    frame::FrameAllocator,
    kernel::{CpuFeatures, KernelControl, KernelError},
    manager::VmManager,
    process::{Endpoint, Process, Segment, Segments},
};

/// Emulated physical memory.
pub struct EmulatedMemory {
    base: NonNull<u8>,
    layout: Layout,
}

impl EmulatedMemory {
    /// Creates a zeroed memory of at least `size` bytes, rounded up to whole pages.
    pub fn new(size: usize) -> Self {
        let size = size.max(1).next_multiple_of(PAGE_SIZE);
        let Ok(layout) = Layout::from_size_align(size, PAGE_SIZE) else {
            panic!("emulated memory of {size:#x} bytes is too large");
        };
        // SAFETY: the layout has a non-zero size.
        let base = NonNull::new(unsafe { alloc_zeroed(layout) })
            .unwrap_or_else(|| handle_alloc_error(layout));
        Self { base, layout }
    }

    /// Size of the emulated memory in bytes.
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// Translates a physical address to a pointer into the buffer.
    pub fn translate(&self, phys: PhysicalAddress) -> *mut u8 {
        assert!(phys.as_usize() < self.size(), "physical address out of bounds");
        // SAFETY: bounds checked above.
        unsafe { self.base.as_ptr().add(phys.as_usize()) }
    }

    /// Reads a 32-bit word, such as a page table entry.
    pub fn read_u32(&self, phys: PhysicalAddress) -> u32 {
        // SAFETY: `translate` checked the address; unaligned reads are allowed.
        unsafe { self.translate(phys).cast::<u32>().read_unaligned() }
    }

    /// Reads an address-sized word.
    pub fn read_word(&self, phys: PhysicalAddress) -> usize {
        // SAFETY: as for `read_u32`.
        unsafe { self.translate(phys).cast::<usize>().read_unaligned() }
    }

    /// Writes an address-sized word.
    pub fn write_word(&self, phys: PhysicalAddress, value: usize) {
        // SAFETY: as for `read_u32`.
        unsafe { self.translate(phys).cast::<usize>().write_unaligned(value) }
    }
}

impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) }
    }
}

/// A frame allocator that keeps a ledger of every frame it has handed out.
///
/// Fresh frames come from a bump pointer over `[base, base + size)`; single frames are
/// recycled. Freeing a frame that is not outstanding panics.
pub struct LedgerFrameAllocator {
    next: FrameNumber,
    end: FrameNumber,
    recycled: Vec<FrameNumber>,
    outstanding: BTreeSet<FrameNumber>,
    budget: Option<usize>,
}

impl LedgerFrameAllocator {
    /// Hands out the frames of `[base, base + size)`.
    pub fn new(base: PhysicalAddress, size: usize) -> Self {
        let next = FrameNumber::from(base);
        Self {
            next,
            end: next + size / PAGE_SIZE,
            recycled: Vec::new(),
            outstanding: BTreeSet::new(),
            budget: None,
        }
    }

    /// Lets `successes` more allocations through, then fails every one after.
    pub fn fail_after(&mut self, successes: usize) {
        self.budget = Some(successes);
    }

    /// Number of frames currently allocated.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Returns whether the frame holding `phys` is currently allocated.
    pub fn is_outstanding(&self, phys: PhysicalAddress) -> bool {
        self.outstanding.contains(&FrameNumber::from(phys))
    }
}

impl FrameAllocator for LedgerFrameAllocator {
    fn allocate(&mut self, pages: usize) -> Option<PhysicalAddress> {
        if pages == 0 {
            return None;
        }
        if let Some(budget) = &mut self.budget {
            if *budget == 0 {
                return None;
            }
            *budget -= 1;
        }

        let first = match (pages == 1).then(|| self.recycled.pop()).flatten() {
            Some(frame) => frame,
            None => {
                if self.end - self.next < pages {
                    return None;
                }
                let frame = self.next;
                self.next = self.next + pages;
                frame
            }
        };
        self.outstanding.extend(first..first + pages);
        Some(first.start())
    }

    fn free(&mut self, base: PhysicalAddress, pages: usize) {
        let first = FrameNumber::from(base);
        for frame in first..first + pages {
            assert!(self.outstanding.remove(&frame), "frame {frame} freed but not allocated");
            self.recycled.push(frame);
        }
    }
}

/// A kernel call as seen by [`RecordingKernel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelCall {
    SetRoot {
        endpoint: Endpoint,
        root: PhysicalAddress,
    },
    ReleaseSlot(usize),
    KernelLimit(usize),
    PageDirectories(VirtualAddress),
    Invalidate(VirtualAddress),
    EnablePaging(Segments),
}

/// A kernel that records every call and succeeds, unless told to fail paging.
#[derive(Debug, Default)]
pub struct RecordingKernel {
    pub calls: Vec<KernelCall>,
    paging_error: Option<KernelError>,
}

impl RecordingKernel {
    /// A kernel that refuses to enable paging with `code`.
    pub fn failing_paging(code: KernelError) -> Self {
        Self {
            calls: Vec::new(),
            paging_error: Some(code),
        }
    }

    /// Number of translation invalidations requested so far.
    pub fn invalidations(&self) -> usize {
        self.calls
            .iter()
            .filter(|call| matches!(call, KernelCall::Invalidate(_)))
            .count()
    }

    /// Directory entries released to the kernel, in order.
    pub fn released_slots(&self) -> Vec<usize> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                KernelCall::ReleaseSlot(pde) => Some(*pde),
                _ => None,
            })
            .collect()
    }
}

impl KernelControl for RecordingKernel {
    fn set_page_table_root(&mut self, endpoint: Endpoint, root: PhysicalAddress) -> Result<(), KernelError> {
        self.calls.push(KernelCall::SetRoot { endpoint, root });
        Ok(())
    }

    fn release_directory_slot(&mut self, pde: usize) -> Result<(), KernelError> {
        self.calls.push(KernelCall::ReleaseSlot(pde));
        Ok(())
    }

    fn set_kernel_limit(&mut self, limit: usize) -> Result<(), KernelError> {
        self.calls.push(KernelCall::KernelLimit(limit));
        Ok(())
    }

    fn set_page_directories(&mut self, at: VirtualAddress) -> Result<(), KernelError> {
        self.calls.push(KernelCall::PageDirectories(at));
        Ok(())
    }

    fn invalidate_page(&mut self, linear: VirtualAddress) -> Result<(), KernelError> {
        self.calls.push(KernelCall::Invalidate(linear));
        Ok(())
    }

    fn enable_paging(&mut self, segments: &Segments) -> Result<(), KernelError> {
        self.calls.push(KernelCall::EnablePaging(*segments));
        self.paging_error.map_or(Ok(()), Err)
    }
}

/// A ready-made machine: kernel in the first 4 MiB, the manager's image at 4 MiB, process
/// space from 32 MiB and free frames from 6 MiB to the end of an 8 MiB memory.
pub struct TestBed {
    pub config: Config,
    pub params: BootParams,
    pub memory_size: usize,
}

impl TestBed {
    pub const SYSTEM_SLOT: usize = 0;
    /// The manager's own slot.
    pub const OWN_SLOT: usize = 1;
    pub const MEMORY_SIZE: usize = 8 << 20;
    pub const FRAMES_BASE: usize = 0x60_0000;
    pub const IMAGE_BASE: usize = 0x40_0000;
    pub const IMAGE_END: usize = 0x48_0000;
    /// Start of process space, directory entry 8.
    pub const PROC_START: usize = 8 * BIG_PAGE_SIZE;

    /// The default machine, with big and global pages and fast checking.
    pub fn new() -> Self {
        let kernel = KernelLayout {
            text: PhysicalAddress::new(0x1000),
            text_len: 0x2_0000,
            data: PhysicalAddress::new(0x2_1000),
            data_len: 0x1_0000,
        };
        let config = Config::new(kernel)
            .with_checking(Checking::Fast)
            .with_slots(16)
            .with_proc_start(VirtualAddress::new(Self::PROC_START));

        let own = Process {
            slot: Slot::new(Self::OWN_SLOT),
            endpoint: Endpoint(Self::OWN_SLOT as i32),
            live: true,
            segments: Segments::new(
                Segment::new(PhysicalAddress::new(Self::IMAGE_BASE), VirtualAddress::new(0), 0x2_0000),
                Segment::new(PhysicalAddress::new(0x42_0000), VirtualAddress::new(0), 0x4_0000),
                Segment::new(PhysicalAddress::new(0x46_0000), VirtualAddress::new(0x4_0000), 0x2_0000),
            ),
            stack_top: VirtualAddress::new(0x6_0000),
            data_top: VirtualAddress::new(0x6_0000),
        };
        let system = Process {
            slot: Slot::new(Self::SYSTEM_SLOT),
            endpoint: Endpoint(-2),
            ..Self::process(Self::SYSTEM_SLOT)
        };

        Self {
            config,
            params: BootParams {
                own,
                system,
                features: CpuFeatures {
                    global_pages: true,
                    big_pages: true,
                },
                reserve_area: VirtualAddress::new(0x3_0000),
            },
            memory_size: Self::MEMORY_SIZE,
        }
    }

    /// Boots with `checking` instead of fast checking.
    pub fn with_checking(mut self, checking: Checking) -> Self {
        self.config.checking = checking;
        self
    }

    /// Boots on a CPU with `features`.
    pub fn with_features(mut self, features: CpuFeatures) -> Self {
        self.params.features = features;
        self
    }

    /// A live, ordinary process for `slot` with a flat data segment.
    pub fn process(slot: usize) -> Process {
        Process {
            slot: Slot::new(slot),
            endpoint: Endpoint(slot as i32 + 100),
            live: true,
            segments: Segments::new(
                Segment::default(),
                Segment::new(PhysicalAddress::new(0), VirtualAddress::new(0), 0x10_0000),
                Segment::default(),
            ),
            stack_top: VirtualAddress::new(0x10_0000),
            data_top: VirtualAddress::new(0x10_0000),
        }
    }

    /// A fresh frame allocator over the free part of memory.
    pub fn frames(&self) -> LedgerFrameAllocator {
        LedgerFrameAllocator::new(
            PhysicalAddress::new(Self::FRAMES_BASE),
            self.memory_size - Self::FRAMES_BASE,
        )
    }

    /// Bootstraps a manager on a recording kernel.
    pub fn boot(self) -> Result<VmManager<LedgerFrameAllocator, RecordingKernel>, Fatal> {
        self.boot_with(RecordingKernel::default())
    }

    /// Bootstraps a manager on the given kernel.
    pub fn boot_with(
        self,
        kernel: RecordingKernel,
    ) -> Result<VmManager<LedgerFrameAllocator, RecordingKernel>, Fatal> {
        let frames = self.frames();
        VmManager::bootstrap(
            self.config,
            AddressTranslator::emulated(self.memory_size),
            frames,
            kernel,
            self.params,
        )
    }
}

impl Default for TestBed {
    fn default() -> Self {
        Self::new()
    }
}
