//! Build- and boot-time configuration.

use crate::{
    PhysicalAddress, VirtualAddress,
    arch::{BIG_PAGE_SIZE, LINEAR_LIMIT, PAGE_SIZE},
    kernel::CpuFeatures,
    process::Process,
};

/// How much self-checking the manager does.
///
/// `Strict` verifies every table after each write, maps the scratch window afresh on
/// every use with a guard word behind the payload, and unmaps it afterwards. `Fast`
/// skips all of that and leaves the window mapped between uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checking {
    Fast,
    Strict,
}

impl Default for Checking {
    fn default() -> Self {
        if cfg!(feature = "strict-checks") {
            Self::Strict
        } else {
            Self::Fast
        }
    }
}

/// Where the kernel image lives. The kernel is identity mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelLayout {
    pub text: PhysicalAddress,
    pub text_len: usize,
    pub data: PhysicalAddress,
    pub data_len: usize,
}

impl KernelLayout {
    /// Last byte of kernel data.
    pub fn data_last(&self) -> PhysicalAddress {
        self.data + self.data_len.saturating_sub(1)
    }
}

/// Settings the manager is built with, fixed at bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub checking: Checking,
    /// Number of process-table slots, at most one page table each.
    pub slots: usize,
    /// Linear address where process space starts. Must be a multiple of 4 MiB.
    pub proc_start: VirtualAddress,
    /// Data-relative address the manager's heap may grow to.
    pub data_top: VirtualAddress,
    pub kernel: KernelLayout,
}

impl Config {
    /// Process slots when not configured otherwise.
    pub const DEFAULT_SLOTS: usize = 256;

    /// Process space starts at 400 MiB unless configured otherwise.
    pub const DEFAULT_PROC_START: VirtualAddress = VirtualAddress::new(100 * BIG_PAGE_SIZE);

    /// Creates a configuration with default settings for the given kernel layout.
    pub fn new(kernel: KernelLayout) -> Self {
        Self {
            checking: Checking::default(),
            slots: Self::DEFAULT_SLOTS,
            proc_start: Self::DEFAULT_PROC_START,
            data_top: VirtualAddress::new(LINEAR_LIMIT),
            kernel,
        }
    }

    /// Sets the checking mode.
    pub fn with_checking(mut self, checking: Checking) -> Self {
        self.checking = checking;
        self
    }

    /// Sets the number of process slots.
    pub fn with_slots(mut self, slots: usize) -> Self {
        self.slots = slots;
        self
    }

    /// Sets where process space starts.
    pub fn with_proc_start(mut self, proc_start: VirtualAddress) -> Self {
        self.proc_start = proc_start;
        self
    }

    /// Sets how far the manager's heap may grow.
    pub fn with_data_top(mut self, data_top: VirtualAddress) -> Self {
        self.data_top = data_top;
        self
    }

    /// Returns whether strict checking is enabled.
    pub fn is_strict(&self) -> bool {
        self.checking == Checking::Strict
    }

    pub(crate) fn validate(&self) -> Result<(), &'static str> {
        if self.slots == 0 || self.slots > crate::arch::ENTRIES {
            return Err("slot count must be between 1 and 1024");
        }
        if self.proc_start.as_usize() == 0 || !self.proc_start.is_aligned(BIG_PAGE_SIZE) {
            return Err("process space must start on a non-zero 4 MiB boundary");
        }
        if !self.data_top.is_aligned(PAGE_SIZE) {
            return Err("data top must be page aligned");
        }
        if self.kernel.text_len == 0 || self.kernel.data_len == 0 {
            return Err("kernel text and data must not be empty");
        }
        Ok(())
    }
}

/// What the boot environment tells the manager about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootParams {
    /// The manager's own process-table entry.
    pub own: Process,
    /// The system task, whose data segment the registry address is reported relative to.
    pub system: Process,
    pub features: CpuFeatures,
    /// Data-relative address of the static pages that seed the reserve. They must lie
    /// inside the manager's image.
    pub reserve_area: VirtualAddress,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> KernelLayout {
        KernelLayout {
            text: PhysicalAddress::new(0x1000),
            text_len: 0x2_0000,
            data: PhysicalAddress::new(0x2_1000),
            data_len: 0x1_0000,
        }
    }

    #[test]
    fn defaults() {
        let config = Config::new(layout());
        assert_eq!(config.proc_start.as_usize(), 0x1900_0000);
        assert_eq!(config.slots, Config::DEFAULT_SLOTS);
        assert!(config.validate().is_ok());
        assert_eq!(config.kernel.data_last(), PhysicalAddress::new(0x3_0fff));
    }

    #[test]
    fn process_space_must_be_directory_aligned() {
        let config = Config::new(layout()).with_proc_start(VirtualAddress::new(0x1000));
        assert!(config.validate().is_err());
    }

    #[test]
    fn slot_count_bounded_by_registry() {
        assert!(Config::new(layout()).with_slots(0).validate().is_err());
        assert!(Config::new(layout()).with_slots(1025).validate().is_err());
        assert!(Config::new(layout()).with_slots(1024).validate().is_ok());
    }

    #[test]
    fn builder_sets_checking() {
        let config = Config::new(layout()).with_checking(Checking::Strict);
        assert!(config.is_strict());
    }
}
