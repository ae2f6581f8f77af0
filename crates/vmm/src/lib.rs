#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]
#![feature(step_trait)]

//! # Page table core of the memory server
//!
//! This crate owns the i386 page tables of every process. It provides:
//!
//! - Two-level page tables per process slot, with the kernel mapped into each.
//! - Writing, querying and removing ranges of mappings.
//! - The manager's own page allocator, with a small reserve for re-entrant allocations.
//! - The one-shot bootstrap that builds the manager's own address space and enables paging.
//! - Access to arbitrary physical memory through a scratch window.
//! - Software emulation for testing in non-kernel environments.

extern crate alloc;

mod address;
mod address_space;
mod arch;
mod bootstrap;
mod config;
mod error;
mod frame;
mod heap;
mod hole;
mod kernel;
mod manager;
mod numbers;
mod page_directory;
mod process;
mod registry;
mod reserve;
mod scratch;
mod writer;

/// Host-side test doubles, for running a manager without hardware.
#[cfg(any(test, feature = "software-emulation"))]
pub mod emulation;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use address_space::KernelMapping;
pub use config::{BootParams, Checking, Config, KernelLayout};
pub use error::{Exhausted, Fatal, VmError};
pub use frame::{FrameAllocator, Page};
pub use heap::{AllocReason, HeapStats};
pub use kernel::{CpuFeatures, KernelControl, KernelError};
pub use manager::VmManager;
pub use numbers::{FrameNumber, PageNumber};
pub use page_directory::{Mapping, PageDirectory};
pub use process::{Endpoint, Process, Segment, SegmentKind, Segments, Slot};
pub use registry::DirectoryRegistry;
pub use reserve::{FrameReserve, RESERVE_CAPACITY};
pub use writer::WriteMode;

pub use arch::{BIG_PAGE_SIZE, ENTRIES, LINEAR_LIMIT, PAGE_SIZE, PageEntry, PageFlags, PageTable};
