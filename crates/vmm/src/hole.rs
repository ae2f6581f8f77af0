//! Finding unmapped runs of linear space in a page table.

use log::warn;

use crate::{
    VirtualAddress,
    address::AddressTranslator,
    arch::{ENTRIES, PAGE_SIZE},
    error::{Exhausted, Fatal, VmError},
    page_directory::PageDirectory,
};

impl PageDirectory {
    /// Finds `bytes` of contiguous unmapped linear space in `[min, max)`.
    ///
    /// The search starts at the table's cursor when a hole could still fit above it, and
    /// wraps to `min` once. An absent directory entry counts as 1024 free pages (fewer at
    /// the edge of the window). A directory entry without a leaf table is occupied. On
    /// success the cursor moves just past the hole.
    pub fn find_hole(
        &mut self,
        memory: &AddressTranslator,
        bytes: usize,
        min: VirtualAddress,
        max: VirtualAddress,
    ) -> Result<VirtualAddress, VmError> {
        let fits = min
            .as_usize()
            .checked_add(bytes)
            .is_some_and(|end| end <= max.as_usize());
        if bytes == 0 || bytes % PAGE_SIZE != 0 || !min.is_aligned(PAGE_SIZE) || !max.is_aligned(PAGE_SIZE) || !fits {
            return Err(Fatal::InvalidRequest {
                op: "find_hole",
                addr: min.as_usize(),
                len: bytes,
            }
            .logged()
            .into());
        }

        let (min, max) = (min.as_usize(), max.as_usize());
        let needed = bytes / PAGE_SIZE;
        let from_cursor = self.cursor >= min
            && self.cursor.checked_add(bytes).is_some_and(|end| end <= max);

        let mut curv = if from_cursor { self.cursor } else { min };
        let mut may_wrap = from_cursor && curv != min;
        let mut run_start = curv;
        let mut run = 0;

        while curv < max {
            let linear = VirtualAddress::new(curv);
            let (pde, pte) = (linear.pde(), linear.pte());
            let remaining = (max - curv) / PAGE_SIZE;

            if !self.dir_entry(memory, pde).is_present() {
                let span = (ENTRIES - pte).min(remaining);
                run += span;
                curv += span * PAGE_SIZE;
            } else if let Some(entry) = self.leaf_entry(memory, pde, pte) {
                if entry.is_present() {
                    run = 0;
                    run_start = curv + PAGE_SIZE;
                } else {
                    run += 1;
                }
                curv += PAGE_SIZE;
            } else {
                curv += (ENTRIES - pte).min(remaining) * PAGE_SIZE;
                run = 0;
                run_start = curv;
            }

            if run >= needed {
                self.cursor = run_start + bytes;
                return Ok(VirtualAddress::new(run_start));
            }

            if curv >= max && may_wrap {
                curv = min;
                run_start = min;
                run = 0;
                may_wrap = false;
            }
        }

        warn!("vmm: no {bytes:#x}-byte hole in {min:#x}..{max:#x}");
        Err(Exhausted::VirtualSpace.into())
    }
}
