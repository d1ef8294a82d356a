// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Producer/consumer TRB rings over circular lists of DMA segments.
//!
//! Both ring kinds share the same shape: an ordered arena of page-backed
//! segments (traversal order = insertion order, "next" wraps to the first),
//! a cursor of segment index plus slot index, and a single cycle-state bit
//! flipped exactly once per full revolution. The Transfer Ring is produced
//! by software and consumed by the controller; the Event Ring is the
//! reverse.

pub mod event;
pub mod transfer;

use std::ptr::{addr_of_mut, read_volatile, write_volatile};

use crate::bits::ring_data::Trb;
use crate::common::PhysAddr;
use crate::dma::{DmaAllocator, DmaPage, OutOfMemory};

pub(crate) const TRB_SIZE: usize = std::mem::size_of::<Trb>();

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Retryable: the caller re-submits once the controller reports
    /// progress through the completion-feedback path.
    #[error("TRB ring too full to fit the whole transfer descriptor")]
    RingFull,
    #[error(transparent)]
    OutOfMemory(#[from] OutOfMemory),
}
pub type Result<T> = core::result::Result<T, Error>;

/// One page-backed array of TRB slots. Slot count is derived from the page
/// length; the page carries no in-band header, the arena index is the only
/// bookkeeping.
pub(crate) struct Segment {
    page: DmaPage,
    trb_count: usize,
}

impl Segment {
    pub(crate) fn new(page: DmaPage) -> Self {
        let trb_count = page.len() / TRB_SIZE;
        assert!(trb_count >= 2, "segment must hold at least two TRB slots");
        Self { page, trb_count }
    }

    pub(crate) fn base(&self) -> PhysAddr {
        self.page.phys()
    }

    pub(crate) fn trb_count(&self) -> usize {
        self.trb_count
    }

    pub(crate) fn slot_phys(&self, idx: usize) -> PhysAddr {
        debug_assert!(idx < self.trb_count);
        self.base().offset::<Trb>(idx)
    }

    fn slot_ptr(&self, idx: usize) -> *mut Trb {
        assert!(idx < self.trb_count);
        self.page.as_ptr().wrapping_add(idx * TRB_SIZE) as *mut Trb
    }

    pub(crate) fn read_slot(&self, idx: usize) -> Trb {
        unsafe { read_volatile(self.slot_ptr(idx)) }
    }

    /// Publish a slot so the controller never observes it half-written:
    /// parameter and status land first, the control word carrying the
    /// cycle bit goes last.
    pub(crate) fn publish_slot(&self, idx: usize, trb: &Trb) {
        let slot = self.slot_ptr(idx);
        unsafe {
            write_volatile(addr_of_mut!((*slot).parameter), trb.parameter);
            write_volatile(addr_of_mut!((*slot).status), trb.status);
            write_volatile(addr_of_mut!((*slot).control), trb.control);
        }
    }

    /// Rewrite only the cycle bit of a slot, leaving the rest untouched.
    pub(crate) fn set_slot_cycle(&self, idx: usize, cycle: bool) {
        let slot = self.slot_ptr(idx);
        unsafe {
            let mut control = read_volatile(addr_of_mut!((*slot).control));
            control.set_cycle(cycle);
            write_volatile(addr_of_mut!((*slot).control), control);
        }
    }

    pub(crate) fn into_page(self) -> DmaPage {
        self.page
    }
}

/// Cursor into a segment arena: which segment, which slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct Cursor {
    pub seg: usize,
    pub idx: usize,
}

/// Allocate `count` segments, handing every page already obtained back to
/// the allocator if a later allocation fails. Out-of-memory failures are
/// retryable, so a half-built arena must not hold pages hostage.
pub(crate) fn allocate_segments(
    alloc: &dyn DmaAllocator,
    count: usize,
) -> Result<Vec<Segment>> {
    let mut segments = Vec::with_capacity(count);
    for _ in 0..count {
        match alloc.allocate_page() {
            Ok(page) => segments.push(Segment::new(page)),
            Err(e) => {
                release_segments(alloc, segments);
                return Err(e.into());
            }
        }
    }
    Ok(segments)
}

pub(crate) fn release_segments(
    alloc: &dyn DmaAllocator,
    segments: Vec<Segment>,
) {
    for segment in segments {
        alloc.release_page(segment.into_page());
    }
}
