//! The parts of a process the page table core needs.
//!
//! Processes are segmented: text, data and stack each have a physical base, a virtual
//! base and a length. Linear addresses are formed by adding the data segment's physical
//! base, which is what makes the manager's own heap reachable before paging and keeps it
//! reachable at the same virtual addresses afterwards.

use core::fmt;
use core::ops::{Index, IndexMut};

use crate::{PhysicalAddress, VirtualAddress};

/// Index of a process-table slot. Each slot may own one page table.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slot(usize);

impl Slot {
    /// Creates a slot index.
    #[inline]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Returns the slot index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slot({})", self.0)
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kernel endpoint of a process, used when installing its page table root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(pub i32);

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which of the three segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Text,
    Data,
    Stack,
}

/// One memory segment of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Segment {
    pub phys: PhysicalAddress,
    pub vir: VirtualAddress,
    pub len: usize,
}

impl Segment {
    /// Creates a segment.
    pub const fn new(phys: PhysicalAddress, vir: VirtualAddress, len: usize) -> Self {
        Self { phys, vir, len }
    }

    /// First physical byte past the segment.
    pub const fn phys_end(&self) -> usize {
        self.phys.as_usize() + self.len
    }
}

/// Text, data and stack segments, indexed by [`SegmentKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Segments([Segment; 3]);

impl Segments {
    /// Groups the three segments.
    pub const fn new(text: Segment, data: Segment, stack: Segment) -> Self {
        Self([text, data, stack])
    }

    /// Iterates text, data and stack.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Segment> {
        self.0.iter_mut()
    }
}

impl Index<SegmentKind> for Segments {
    type Output = Segment;

    fn index(&self, kind: SegmentKind) -> &Segment {
        &self.0[kind as usize]
    }
}

impl IndexMut<SegmentKind> for Segments {
    fn index_mut(&mut self, kind: SegmentKind) -> &mut Segment {
        &mut self.0[kind as usize]
    }
}

/// A process-table entry as the page table core sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Process {
    pub slot: Slot,
    pub endpoint: Endpoint,
    /// Whether the slot is in use. Only live processes can be bound to a table.
    pub live: bool,
    pub segments: Segments,
    /// Top of the stack, relative to the data segment. The heap starts here.
    pub stack_top: VirtualAddress,
    /// Highest address the heap may grow to, relative to the data segment.
    pub data_top: VirtualAddress,
}

impl Process {
    fn data_base(&self) -> usize {
        self.segments[SegmentKind::Data].phys.as_usize()
    }

    /// Converts a data-relative address to a linear one, or `None` past 4 GiB.
    pub fn vir2map(&self, vir: VirtualAddress) -> Option<VirtualAddress> {
        vir.checked_add(self.data_base())
    }

    /// Converts a linear address to a data-relative one, or `None` below the data base.
    pub fn map2vir(&self, linear: VirtualAddress) -> Option<VirtualAddress> {
        linear
            .as_usize()
            .checked_sub(self.data_base())
            .map(VirtualAddress::new)
    }

    /// Physical address of a data-relative address while paging is still off.
    pub fn vir2phys(&self, vir: VirtualAddress) -> Option<PhysicalAddress> {
        self.vir2map(vir).map(|linear| PhysicalAddress::new(linear.as_usize()))
    }

    /// Physical extent of the process image, from text start to stack end.
    pub fn image(&self) -> (PhysicalAddress, usize) {
        let lo = self.segments[SegmentKind::Text].phys;
        (lo, self.segments[SegmentKind::Stack].phys_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process() -> Process {
        Process {
            slot: Slot::new(2),
            endpoint: Endpoint(2),
            live: true,
            segments: Segments::new(
                Segment::new(PhysicalAddress::new(0x40_0000), VirtualAddress::new(0), 0x2_0000),
                Segment::new(PhysicalAddress::new(0x42_0000), VirtualAddress::new(0), 0x4_0000),
                Segment::new(
                    PhysicalAddress::new(0x46_0000),
                    VirtualAddress::new(0x4_0000),
                    0x2_0000,
                ),
            ),
            stack_top: VirtualAddress::new(0x6_0000),
            data_top: VirtualAddress::new(0x100_0000),
        }
    }

    #[test]
    fn linear_translation_uses_the_data_base() {
        let p = process();
        let linear = p.vir2map(VirtualAddress::new(0x1000)).expect("fits");
        assert_eq!(linear, VirtualAddress::new(0x42_1000));
        assert_eq!(p.map2vir(linear), Some(VirtualAddress::new(0x1000)));
        assert_eq!(p.map2vir(VirtualAddress::new(0x1000)), None);
    }

    #[test]
    fn image_spans_text_to_stack_end() {
        let (lo, hi) = process().image();
        assert_eq!(lo, PhysicalAddress::new(0x40_0000));
        assert_eq!(hi, 0x48_0000);
    }

    #[test]
    fn segments_index_by_kind() {
        let mut p = process();
        p.segments[SegmentKind::Stack].len += 0x1000;
        assert_eq!(p.segments[SegmentKind::Stack].phys_end(), 0x48_1000);
        assert_eq!(p.segments[SegmentKind::Text].len, 0x2_0000);
    }
}
