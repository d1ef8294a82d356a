// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event Ring: the hardware-produced, software-consumed ring. There are
//! no Link TRBs here; the controller learns the segment topology from the
//! Event Ring Segment Table, published in its own DMA page. Slot validity
//! is signalled purely by the cycle bit matching the Consumer Cycle State.

use std::sync::Arc;

use slog::{debug, o, Logger};
use zerocopy::IntoBytes;

use crate::bits::ring_data::{ErstEntry, Trb};
use crate::common::PhysAddr;
use crate::dma::{DmaAllocator, DmaPage};

use super::{Cursor, Result, Segment};

/// Software consumer endpoint of an Event Ring.
///
/// Single-consumer by construction: `dequeue` takes `&mut self` and no
/// lock is held on this path. A second draining context must serialize
/// itself onto the first externally.
pub struct EventRing {
    segments: Vec<Segment>,
    /// The published segment table, read directly by the controller; held
    /// until teardown moves it back to the allocator.
    erst: Option<DmaPage>,
    erst_base: PhysAddr,
    dequeue: Cursor,
    /// Consumer Cycle State: flipped when the cursor wraps from the last
    /// segment back to the first.
    ccs: bool,
    /// The dequeue pointer as reported to the controller's ERDP register.
    /// It runs a half-cycle ahead of the internal cursor: it is refreshed
    /// from the cursor at the top of every `dequeue` call, before the
    /// cycle-bit check, so an `EMPTY` poll still advances it past the
    /// last consumed slot.
    reported_dequeue: PhysAddr,
    alloc: Arc<dyn DmaAllocator>,
    log: Logger,
}

impl std::fmt::Debug for EventRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRing")
            .field("erst_base", &self.erst_base)
            .field("dequeue", &self.dequeue)
            .field("ccs", &self.ccs)
            .field("reported_dequeue", &self.reported_dequeue)
            .finish_non_exhaustive()
    }
}

impl EventRing {
    /// Allocate `segment_count` event segments plus one page for the
    /// segment table, and publish one table entry per segment in
    /// traversal order. CCS starts at 1 with the cursor at the first
    /// slot; the segments start zeroed, i.e. uniformly stale.
    pub fn new(
        alloc: Arc<dyn DmaAllocator>,
        segment_count: usize,
        log: &Logger,
    ) -> Result<Self> {
        assert!(segment_count >= 1, "a ring always has at least one segment");

        let segments = super::allocate_segments(alloc.as_ref(), segment_count)?;

        let erst = match alloc.allocate_page() {
            Ok(page) => page,
            Err(e) => {
                super::release_segments(alloc.as_ref(), segments);
                return Err(e.into());
            }
        };
        assert!(
            segment_count * std::mem::size_of::<ErstEntry>() <= erst.len(),
            "segment table must fit in one page"
        );
        for (i, segment) in segments.iter().enumerate() {
            let entry = ErstEntry::new(segment.base(), segment.trb_count());
            // the table page is software-written, hardware-read; plain
            // stores through the entry's wire representation
            unsafe {
                std::ptr::copy_nonoverlapping(
                    entry.as_bytes().as_ptr(),
                    erst.as_ptr().add(i * std::mem::size_of::<ErstEntry>()),
                    std::mem::size_of::<ErstEntry>(),
                );
            }
        }

        let log = log.new(o!("ring" => "event"));
        let reported_dequeue = segments[0].base();
        let erst_base = erst.phys();
        debug!(log, "initialized event ring";
            "segments" => segment_count,
            "erst" => ?erst_base,
        );

        Ok(Self {
            segments,
            erst: Some(erst),
            erst_base,
            dequeue: Cursor { seg: 0, idx: 0 },
            ccs: true,
            reported_dequeue,
            alloc,
            log,
        })
    }

    fn dequeue_phys(&self) -> PhysAddr {
        self.segments[self.dequeue.seg].slot_phys(self.dequeue.idx)
    }

    /// Pop the next controller-produced event, or `None` if the
    /// controller has not yet produced past the cursor.
    ///
    /// Every call, including one that comes up empty, refreshes the
    /// reported dequeue pointer from the current cursor first; the ERDP
    /// register expects a monotonically advancing value one half-cycle
    /// ahead of the internal cursor.
    pub fn dequeue(&mut self) -> Option<Trb> {
        self.reported_dequeue = self.dequeue_phys();

        let event = self.segments[self.dequeue.seg].read_slot(self.dequeue.idx);
        if event.control.cycle() != self.ccs {
            // the ring is empty
            return None;
        }

        self.dequeue.idx += 1;
        if self.dequeue.idx >= self.segments[self.dequeue.seg].trb_count() {
            // wrapping around segment boundary
            self.dequeue.idx = 0;
            self.dequeue.seg += 1;
            if self.dequeue.seg >= self.segments.len() {
                // wrapping around table boundary
                self.dequeue.seg = 0;
                self.ccs = !self.ccs;
            }
        }

        Some(event)
    }

    /// Poll until empty, handing each event to `handler` in production
    /// order. Returns the number of events consumed.
    pub fn drain(&mut self, mut handler: impl FnMut(Trb)) -> usize {
        let mut consumed = 0;
        while let Some(event) = self.dequeue() {
            handler(event);
            consumed += 1;
        }
        consumed
    }

    /// Physical base of the published segment table, for the ERSTBA
    /// register.
    pub fn erst_base(&self) -> PhysAddr {
        self.erst_base
    }

    /// Number of table entries, for the ERSTSZ register.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Value to write to the controller's ERDP register.
    pub fn reported_dequeue_pointer(&self) -> PhysAddr {
        self.reported_dequeue
    }
}

impl Drop for EventRing {
    fn drop(&mut self) {
        super::release_segments(
            self.alloc.as_ref(),
            std::mem::take(&mut self.segments),
        );
        if let Some(erst) = self.erst.take() {
            self.alloc.release_page(erst);
        }
        debug!(self.log, "released event ring");
    }
}
