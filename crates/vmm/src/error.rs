//! Errors reported by the manager.
//!
//! There are two kinds. Running out of linear space or physical memory is an ordinary
//! condition that callers handle ([`Exhausted`]). Everything else means the caller broke
//! a precondition or the page tables no longer agree with the manager's bookkeeping
//! ([`Fatal`]); the host is expected to stop the server when it sees one.

use thiserror::Error;

use crate::{PhysicalAddress, Slot, VirtualAddress, arch::PageEntry, kernel::KernelError};

/// Any error a manager operation can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmError {
    #[error(transparent)]
    Exhausted(#[from] Exhausted),
    #[error(transparent)]
    Fatal(#[from] Fatal),
}

impl VmError {
    /// Returns whether the error must halt the server.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// A recoverable resource shortage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Exhausted {
    #[error("out of linear address space")]
    VirtualSpace,
    #[error("out of physical memory")]
    PhysicalMemory,
}

/// A condition the manager cannot continue from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Fatal {
    #[error("{op}: invalid request at {addr:#x} ({len:#x} bytes)")]
    InvalidRequest {
        op: &'static str,
        addr: usize,
        len: usize,
    },
    #[error("{op}: flags {flags:#x} do not fit the mapping target")]
    InvalidFlags { op: &'static str, flags: u32 },
    #[error("slot {slot}: {virt} is already mapped ({entry:?})")]
    AlreadyMapped {
        slot: Slot,
        virt: VirtualAddress,
        entry: PageEntry,
    },
    #[error("slot {slot}: directory entry {pde} maps a big page")]
    BigPage { slot: Slot, pde: usize },
    #[error("slot {slot}: directory entry {pde} disagrees with the page table bookkeeping")]
    Inconsistent { slot: Slot, pde: usize },
    #[error("page allocation nested {0} levels deep")]
    DepthExceeded(u8),
    #[error("out of reserve pages")]
    ReserveExhausted,
    #[error("slot {0} is out of range")]
    InvalidSlot(Slot),
    #[error("slot {0} has no page table")]
    NoTable(Slot),
    #[error("process in slot {0} is not in use")]
    DeadProcess(Slot),
    #[error("the manager's own page table cannot be destroyed or recreated")]
    OwnTable,
    #[error("directory registry is not set up yet")]
    NoRegistry,
    #[error("scratch window is not set up yet")]
    NoWindow,
    #[error("linear address {0:#x} is not addressable by the manager")]
    Unaddressable(usize),
    #[error("scratch window guard overwritten at {0}")]
    WindowGuard(PhysicalAddress),
    #[error("kernel call {op} failed: {code}")]
    Kernel { op: &'static str, code: KernelError },
    #[error("kernel spans directory entries {first} to {last}")]
    KernelTooBig { first: usize, last: usize },
    #[error("image {lo:#x}..{hi:#x} cannot be moved up by {moveup:#x}")]
    BadImage { lo: usize, hi: usize, moveup: usize },
    #[error("reserve page {0} lies outside the manager's image")]
    BadReserveArea(VirtualAddress),
    #[error("no directory entry left for the registry below {0:#x}")]
    NoRegistrySlot(usize),
    #[error("bootstrap step `{step}` failed: {cause}")]
    Bootstrap {
        step: &'static str,
        cause: Exhausted,
    },
    #[error("invalid configuration: {0}")]
    Config(&'static str),
}

impl Fatal {
    /// Logs the condition where it is detected.
    #[inline]
    pub(crate) fn logged(self) -> Self {
        log::error!("vmm: {self}");
        self
    }
}
