//! Reading and writing arbitrary physical memory through one reserved page.

use core::mem::size_of;

use log::trace;

use crate::{
    PhysicalAddress, VirtualAddress,
    arch::{PAGE_SIZE, PageFlags},
    error::{Fatal, VmError},
    frame::FrameAllocator,
    kernel::KernelControl,
    manager::VmManager,
    writer::WriteMode,
};

const WORD: usize = size_of::<usize>();

/// Written behind the payload in strict mode and checked on the way back.
const GUARD: usize = 0x7b9a_0590;

/// The page the manager maps physical frames at on demand.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ScratchWindow {
    /// Linear address, as written into the manager's table.
    loc: VirtualAddress,
    /// The same page as the manager addresses it.
    virt: VirtualAddress,
    /// Frame the window currently shows.
    mapped: Option<PhysicalAddress>,
}

impl ScratchWindow {
    pub(crate) fn new(loc: VirtualAddress, virt: VirtualAddress) -> Self {
        Self {
            loc,
            virt,
            mapped: None,
        }
    }

    pub(crate) fn location(&self) -> VirtualAddress {
        self.loc
    }
}

impl<F: FrameAllocator, K: KernelControl> VmManager<F, K> {
    /// Writes the word pair `(first, second)` at physical address `addr`.
    pub fn phys_write(&mut self, addr: PhysicalAddress, first: usize, second: usize) -> Result<(), VmError> {
        let words = self.window_words(addr)?;
        // SAFETY: `window_words` returned a pointer into the mapped window page with room
        // for the pair.
        unsafe {
            words.write(first);
            words.add(1).write(second);
        }
        if self.config.is_strict() {
            if let Some(guard) = guard_slot(words, addr) {
                // SAFETY: `guard_slot` only returns slots inside the page.
                unsafe { guard.write(GUARD) };
            }
            self.window_unmap()?;
        }
        trace!("vmm: wrote ({first:#x}, {second:#x}) at {addr}");
        Ok(())
    }

    /// Reads the word pair at physical address `addr`.
    pub fn phys_read(&mut self, addr: PhysicalAddress) -> Result<(usize, usize), VmError> {
        let words = self.window_words(addr)?;
        // SAFETY: as in `phys_write`.
        let pair = unsafe { (words.read(), words.add(1).read()) };
        if self.config.is_strict() {
            if let Some(guard) = guard_slot(words, addr) {
                // SAFETY: `guard_slot` only returns slots inside the page.
                if unsafe { guard.read() } != GUARD {
                    return Err(Fatal::WindowGuard(addr).logged().into());
                }
            }
            self.window_unmap()?;
        }
        Ok(pair)
    }

    /// Shows the frame holding `addr` in the window, returning a pointer to `addr`.
    fn window_words(&mut self, addr: PhysicalAddress) -> Result<*mut usize, VmError> {
        let offset = addr.page_offset();
        if offset % (2 * WORD) != 0 {
            return Err(Fatal::InvalidRequest {
                op: "phys_access",
                addr: addr.as_usize(),
                len: 2 * WORD,
            }
            .logged()
            .into());
        }
        let frame = addr.align_down(PAGE_SIZE);
        let window = self.window.ok_or_else(|| Fatal::NoWindow.logged())?;
        let own = self.own.slot;

        if window.mapped != Some(frame) {
            let mode = if self.config.is_strict() {
                WriteMode::Fresh
            } else {
                WriteMode::Overwrite
            };
            self.write_map(own, window.loc, Some(frame), PAGE_SIZE, PageFlags::USER_RW, mode)?;
            if let Some(window) = &mut self.window {
                window.mapped = Some(frame);
            }
            self.kernel
                .invalidate_page(window.loc)
                .map_err(|code| Fatal::Kernel {
                    op: "invalidate_page",
                    code,
                }
                .logged())?;
        }

        let table = self.table(own)?;
        let memory = &self.memory;
        let base: *mut u8 = memory
            .resolve(window.virt, || table.lookup(memory, window.loc).map(|m| m.frame))
            .ok_or_else(|| Fatal::Unaddressable(window.loc.as_usize()).logged())?;
        // SAFETY: `offset` is below the page size.
        Ok(unsafe { base.add(offset) }.cast())
    }

    fn window_unmap(&mut self) -> Result<(), VmError> {
        let Some(window) = self.window else {
            return Err(Fatal::NoWindow.logged().into());
        };
        let own = self.own.slot;
        self.write_map(own, window.loc, None, PAGE_SIZE, PageFlags::empty(), WriteMode::Overwrite)?;
        if let Some(window) = &mut self.window {
            window.mapped = None;
        }
        Ok(())
    }
}

/// The word after the pair, when it still lies in the same page.
fn guard_slot(words: *mut usize, addr: PhysicalAddress) -> Option<*mut usize> {
    // SAFETY: only computed when the result stays within the window page.
    (addr.page_offset() + 3 * WORD <= PAGE_SIZE).then(|| unsafe { words.add(2) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Checking, emulation::TestBed};

    fn pa(addr: usize) -> PhysicalAddress {
        PhysicalAddress::new(addr)
    }

    fn emulated_word(vm: &VmManager<impl FrameAllocator, impl KernelControl>, addr: usize) -> usize {
        vm.memory()
            .emulated_memory()
            .expect("emulated")
            .read_word(pa(addr))
    }

    #[test]
    fn write_then_read_same_page() {
        let mut vm = TestBed::new().boot().expect("boot");
        vm.phys_write(pa(0x70_0010), 0x1111, 0x2222).expect("write");
        let invalidations = vm.kernel().invalidations();

        assert_eq!(vm.phys_read(pa(0x70_0010)), Ok((0x1111, 0x2222)));
        // The window already showed that frame.
        assert_eq!(vm.kernel().invalidations(), invalidations);
        assert_eq!(emulated_word(&vm, 0x70_0010), 0x1111);
    }

    #[test]
    fn moving_to_another_frame_remaps() {
        let mut vm = TestBed::new().boot().expect("boot");
        vm.phys_write(pa(0x70_0000), 1, 2).expect("write");
        vm.phys_write(pa(0x71_0ff0), 3, 4).expect("write");
        let invalidations = vm.kernel().invalidations();

        assert_eq!(vm.phys_read(pa(0x70_0000)), Ok((1, 2)));
        assert_eq!(vm.kernel().invalidations(), invalidations + 1);
        assert_eq!(vm.phys_read(pa(0x71_0ff0)), Ok((3, 4)));

        let window = vm.window_location().expect("window");
        let shown = vm.lookup(vm.own_slot(), window).expect("table").expect("mapped");
        assert_eq!(shown.frame, pa(0x71_0000));
    }

    #[test]
    fn misaligned_access_is_refused() {
        let mut vm = TestBed::new().boot().expect("boot");
        let err = vm.phys_read(pa(0x70_0000 + WORD)).expect_err("misaligned");
        assert!(err.is_fatal());
    }

    #[test]
    fn strict_mode_guards_and_unmaps() {
        let mut vm = TestBed::new()
            .with_checking(Checking::Strict)
            .boot()
            .expect("boot");
        vm.phys_write(pa(0x70_0020), 5, 6).expect("write");
        assert_eq!(emulated_word(&vm, 0x70_0020 + 2 * WORD), GUARD);

        let window = vm.window_location().expect("window");
        assert_eq!(vm.lookup(vm.own_slot(), window).expect("table"), None);

        assert_eq!(vm.phys_read(pa(0x70_0020)), Ok((5, 6)));
        assert_eq!(vm.lookup(vm.own_slot(), window).expect("table"), None);
    }

    #[test]
    fn strict_mode_catches_a_clobbered_guard() {
        let mut vm = TestBed::new()
            .with_checking(Checking::Strict)
            .boot()
            .expect("boot");
        vm.phys_write(pa(0x70_0040), 7, 8).expect("write");
        vm.memory()
            .emulated_memory()
            .expect("emulated")
            .write_word(pa(0x70_0040 + 2 * WORD), 0);

        assert_eq!(
            vm.phys_read(pa(0x70_0040)),
            Err(VmError::Fatal(Fatal::WindowGuard(pa(0x70_0040))))
        );
    }

    #[test]
    fn last_pair_of_a_page_has_no_guard() {
        let mut vm = TestBed::new()
            .with_checking(Checking::Strict)
            .boot()
            .expect("boot");
        let last = 0x70_0000 + PAGE_SIZE - 2 * WORD;
        vm.phys_write(pa(last), 9, 10).expect("write");
        assert_eq!(emulated_word(&vm, 0x70_1000), 0);
        assert_eq!(vm.phys_read(pa(last)), Ok((9, 10)));
    }

    #[test]
    fn heap_allocations_avoid_the_window() {
        let mut vm = TestBed::new().boot().expect("boot");
        let window = vm.window_location().expect("window");
        for _ in 0..4 {
            let page = vm
                .alloc_pages(1, crate::heap::AllocReason::Other)
                .expect("page");
            assert_ne!(vm.own().vir2map(page.virt()), Some(window));
        }
    }
}
