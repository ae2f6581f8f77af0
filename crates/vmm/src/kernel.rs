//! The kernel control channel and CPU feature detection.

use thiserror::Error;

use crate::{PhysicalAddress, VirtualAddress, process::{Endpoint, Segments}};

/// Failure code returned by a kernel call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("error {0}")]
pub struct KernelError(pub i32);

/// Requests the manager makes of the kernel.
///
/// Every call is synchronous. The manager treats any failure as fatal.
pub trait KernelControl {
    /// Installs `root` as the page directory of the process behind `endpoint`.
    fn set_page_table_root(&mut self, endpoint: Endpoint, root: PhysicalAddress)
    -> Result<(), KernelError>;

    /// Hands a directory entry index to the kernel for its own temporary mappings.
    fn release_directory_slot(&mut self, pde: usize) -> Result<(), KernelError>;

    /// Tells the kernel where its reserved linear region ends.
    fn set_kernel_limit(&mut self, limit: usize) -> Result<(), KernelError>;

    /// Tells the kernel where every process's page directory can be read from.
    fn set_page_directories(&mut self, at: VirtualAddress) -> Result<(), KernelError>;

    /// Drops any cached translation for one linear address.
    fn invalidate_page(&mut self, linear: VirtualAddress) -> Result<(), KernelError>;

    /// Turns paging on, with the manager's (possibly moved) segments.
    fn enable_paging(&mut self, segments: &Segments) -> Result<(), KernelError>;
}

/// Paging features of the CPU the manager runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuFeatures {
    /// Global pages (PGE).
    pub global_pages: bool,
    /// 4 MiB pages (PSE).
    pub big_pages: bool,
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
static DETECTED: spin::Once<CpuFeatures> = spin::Once::new();

impl CpuFeatures {
    /// Queries the CPU once and caches the answer.
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    pub fn detect() -> Self {
        *DETECTED.call_once(|| {
            let cpuid = raw_cpuid::CpuId::new();
            let features = cpuid
                .get_feature_info()
                .map(|info| Self {
                    global_pages: info.has_pge(),
                    big_pages: info.has_pse(),
                })
                .unwrap_or_default();
            log::debug!("vmm: cpu features {features:?}");
            features
        })
    }

    /// Neither feature is assumed off x86.
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    pub fn detect() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_is_cached() {
        assert_eq!(CpuFeatures::detect(), CpuFeatures::detect());
    }

    #[test]
    fn kernel_error_display() {
        assert_eq!(alloc::format!("{}", KernelError(-22)), "error -22");
    }
}
