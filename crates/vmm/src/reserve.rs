//! A handful of pre-mapped pages for allocations that cannot use the normal path.
//!
//! Allocating a page normally means mapping it into the manager's own table, which may
//! need a new leaf table, which means allocating another page. That inner allocation is
//! served from here. The pool is refilled outside of any allocation.

use log::trace;

use crate::{error::Fatal, frame::Page};

/// Number of pages the reserve holds when full.
pub const RESERVE_CAPACITY: usize = 5;

/// Pages set aside for allocations the normal path cannot serve.
pub struct FrameReserve {
    slots: [Option<Page>; RESERVE_CAPACITY],
    refilled: usize,
    worst_refill: usize,
}

impl FrameReserve {
    /// Creates an empty reserve.
    pub const fn new() -> Self {
        Self {
            slots: [None; RESERVE_CAPACITY],
            refilled: 0,
            worst_refill: 0,
        }
    }

    /// Removes a page from the lowest occupied slot.
    pub fn take(&mut self) -> Result<Page, Fatal> {
        let page = self
            .slots
            .iter_mut()
            .find_map(Option::take)
            .ok_or_else(|| Fatal::ReserveExhausted.logged())?;
        trace!("vmm: reserve page {} taken, {} left", page.phys(), self.available());
        Ok(page)
    }

    /// Puts a page into the lowest empty slot, handing it back if the reserve is full.
    pub(crate) fn put(&mut self, page: Page) -> Result<(), Page> {
        match self.slots.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(page);
                Ok(())
            }
            None => Err(page),
        }
    }

    /// Pages ready to hand out.
    pub fn available(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Empty slots a refill would fill.
    pub fn missing(&self) -> usize {
        RESERVE_CAPACITY - self.available()
    }

    pub(crate) fn record_refill(&mut self, pages: usize) {
        self.refilled += pages;
        self.worst_refill = self.worst_refill.max(pages);
    }

    /// Pages put back by refills since bootstrap.
    pub fn refilled_total(&self) -> usize {
        self.refilled
    }

    /// Largest number of pages a single refill had to replace.
    pub fn worst_refill(&self) -> usize {
        self.worst_refill
    }
}

impl Default for FrameReserve {
    fn default() -> Self {
        Self::new()
    }
}
