//! Architecture-specific page table formats.
//!
//! The manager only drives the i386 two-level format. Tests and the `software-emulation`
//! feature use the same format against emulated physical memory rather than a scale model,
//! since the entries are consumed by the kernel as-is.

mod i386;

pub use i386::*;
