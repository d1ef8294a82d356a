// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transfer Ring: the software-produced, hardware-consumed ring. One TD
//! (a run of chained TRBs) is enqueued atomically; the controller must
//! never fetch a truncated TD, so capacity for the whole run is probed
//! before a single slot is written.

use std::sync::{Arc, Mutex};

use slog::{debug, o, trace, Logger};

use crate::bits::ring_data::{Trb, TrbType};
use crate::common::PhysAddr;
use crate::dma::DmaAllocator;

use super::{Cursor, Error, Result, Segment};

/// Software producer endpoint of a TRB Transfer Ring (also serves as the
/// Command Ring, which follows the same protocol).
///
/// All producer state sits behind one mutex: the probe and commit phases
/// of [`TransferRing::enqueue`] must not interleave with another enqueue
/// or with a dequeue-pointer update, since capacity is computed by walking
/// the same path the commit takes.
pub struct TransferRing {
    state: Mutex<RingState>,
    alloc: Arc<dyn DmaAllocator>,
    log: Logger,
}

impl std::fmt::Debug for TransferRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferRing").finish_non_exhaustive()
    }
}

struct RingState {
    segments: Vec<Segment>,
    enqueue: Cursor,
    /// Producer Cycle State: flipped once per revolution, when the commit
    /// path crosses the Toggle-Cycle link.
    pcs: bool,
    /// Physical address of the controller's last reported consume
    /// position, advanced by the completion-feedback path.
    dequeue: PhysAddr,
}

impl RingState {
    /// Physical address of the slot under the enqueue cursor.
    fn enqueue_phys(&self) -> PhysAddr {
        self.segments[self.enqueue.seg].slot_phys(self.enqueue.idx)
    }

    /// Whether the cursor sits on the segment's Link slot. Every segment's
    /// last slot holds a Link TRB, placed at initialization and never
    /// moved, so this is a topology check rather than a slot read.
    fn at_link(&self) -> bool {
        self.enqueue.idx == self.segments[self.enqueue.seg].trb_count() - 1
    }

    /// Jump the cursor to the first slot of the next segment. Segments
    /// are traversed in arena order; the last wraps to the first.
    fn resolve_link(&mut self) {
        self.enqueue.seg = (self.enqueue.seg + 1) % self.segments.len();
        self.enqueue.idx = 0;
    }

    /// Whether the cursor's segment carries the Toggle-Cycle link, i.e.
    /// whether crossing its link completes a revolution.
    fn at_toggle_cycle(&self) -> bool {
        self.enqueue.seg == self.segments.len() - 1
    }
}

impl TransferRing {
    /// Allocate a ring of `segment_count` chained segments. Each segment's
    /// last slot is filled with a Link TRB to the next segment's base; the
    /// final segment's link carries Toggle-Cycle and closes the circle.
    /// PCS starts at 1 with the cursor at the first slot.
    pub fn new(
        alloc: Arc<dyn DmaAllocator>,
        segment_count: usize,
        log: &Logger,
    ) -> Result<Self> {
        assert!(segment_count >= 1, "a ring always has at least one segment");

        let segments = super::allocate_segments(alloc.as_ref(), segment_count)?;

        for i in 0..segment_count {
            let next = segments[(i + 1) % segment_count].base();
            let toggle_cycle = i == segment_count - 1;
            let mut link = Trb::link(next, toggle_cycle);
            // matches the initial cycle state; the commit path maintains
            // it from here on
            link.control.set_cycle(true);
            let seg = &segments[i];
            seg.publish_slot(seg.trb_count() - 1, &link);
        }

        let log = log.new(o!("ring" => "transfer"));
        let dequeue = segments[0].base();
        debug!(log, "initialized transfer ring";
            "segments" => segment_count,
            "base" => ?dequeue,
        );

        Ok(Self {
            state: Mutex::new(RingState {
                segments,
                enqueue: Cursor { seg: 0, idx: 0 },
                pcs: true,
                dequeue,
            }),
            alloc,
            log,
        })
    }

    /// Physical address of the ring's first slot, for programming the
    /// endpoint or command-ring context (with DCS matching the initial
    /// cycle state of 1).
    pub fn base_address(&self) -> PhysAddr {
        self.state.lock().unwrap().segments[0].base()
    }

    /// Enqueue one TD and return the physical address of its first TRB,
    /// for correlation against later Transfer Events.
    ///
    /// The TRBs are copied into ring slots in order, with their cycle bits
    /// rewritten to the ring's PCS; each slot's control word is published
    /// last so the controller never observes a half-written slot.
    ///
    /// Fails with [`Error::RingFull`] if the whole TD does not fit,
    /// leaving ring memory and cursor untouched; the caller retries after
    /// the controller reports progress. Capacity runs out when the cursor
    /// would catch up with the recorded dequeue address, which reserves
    /// the landing slot one past the TD as the hardware requires.
    ///
    /// `td` must be non-empty, contain no Link TRBs, and carry the chain
    /// bit on every TRB but the last.
    pub fn enqueue(&self, td: &[Trb]) -> Result<PhysAddr> {
        assert!(!td.is_empty(), "a TD holds at least one TRB");
        debug_assert!(
            td.iter().all(|t| t.control.trb_type() != TrbType::Link),
            "Link TRBs cannot appear inside a TD"
        );
        debug_assert!(
            td.iter().enumerate().all(|(i, t)| {
                t.is_chained() == (i != td.len() - 1)
            }),
            "chain bits must delimit exactly this TD"
        );

        let mut state = self.state.lock().unwrap();
        let saved = state.enqueue;

        // Dry run: advance the cursor once per TRB to see whether the
        // ring would fill anywhere during the transaction. Link slots are
        // resolved without consuming an input TRB and without touching
        // slot contents.
        for _ in td {
            state.enqueue.idx += 1;
            if state.at_link() {
                state.resolve_link();
            }
            if state.enqueue_phys() == state.dequeue {
                state.enqueue = saved;
                return Err(Error::RingFull);
            }
        }

        state.enqueue = saved;
        let first = state.enqueue_phys();

        // Commit: copy the TRBs without further checking.
        for trb in td {
            let mut slot = *trb;
            slot.control.set_cycle(state.pcs);
            state.segments[state.enqueue.seg]
                .publish_slot(state.enqueue.idx, &slot);
            trace!(self.log, "enqueued TRB";
                "type" => ?slot.control.trb_type(),
                "addr" => ?state.enqueue_phys(),
            );

            state.enqueue.idx += 1;
            if state.at_link() {
                // the link joins the current cycle; a Toggle-Cycle link
                // then flips PCS for everything that follows
                let pcs = state.pcs;
                state.segments[state.enqueue.seg]
                    .set_slot_cycle(state.enqueue.idx, pcs);
                if state.at_toggle_cycle() {
                    state.pcs = !state.pcs;
                    trace!(self.log, "producer cycle state toggled";
                        "pcs" => state.pcs);
                }
                state.resolve_link();
            }
        }

        Ok(first)
    }

    /// Completion-feedback path: record how far the controller has
    /// consumed, unblocking future enqueues. Taken under the same lock as
    /// `enqueue` so the probe phase never reads a torn value.
    pub fn update_dequeue_pointer(&self, dequeue: PhysAddr) {
        self.state.lock().unwrap().dequeue = dequeue;
    }
}

impl Drop for TransferRing {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        super::release_segments(
            self.alloc.as_ref(),
            std::mem::take(&mut state.segments),
        );
        debug!(self.log, "released transfer ring");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bits::ring_data::*;
    use crate::dma::testing::TestDmaSpace;
    use proptest::prelude::*;

    fn discard_log() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn four_slot_ring() -> (Arc<TestDmaSpace>, TransferRing) {
        let space = Arc::new(TestDmaSpace::new(64));
        let ring = TransferRing::new(
            Arc::clone(&space) as Arc<dyn DmaAllocator>,
            1,
            &discard_log(),
        )
        .unwrap();
        (space, ring)
    }

    fn normal_trb(tag: u64, chained: bool) -> Trb {
        Trb {
            parameter: tag,
            status: TrbStatusField::default(),
            control: TrbControlField {
                normal: TrbControlFieldNormal::default()
                    .with_trb_type(TrbType::Normal)
                    .with_chain_bit(chained),
            },
        }
    }

    fn td(len: usize) -> Vec<Trb> {
        (0..len).map(|i| normal_trb(i as u64, i != len - 1)).collect()
    }

    #[test]
    fn fresh_ring_has_self_link_with_toggle_cycle() {
        let (space, ring) = four_slot_ring();
        let base = ring.base_address();

        let link = space.read_trb(base.offset::<Trb>(3));
        assert_eq!(link.control.trb_type(), TrbType::Link);
        assert_eq!(link.parameter, base.0);
        assert!(unsafe { link.control.link.toggle_cycle() });
        assert!(link.control.cycle());

        // data slots start zeroed, i.e. stale for CCS=1
        for idx in 0..3 {
            assert!(!space.read_trb(base.offset::<Trb>(idx)).control.cycle());
        }
    }

    #[test]
    fn enqueue_returns_first_slot_address_and_sets_cycle() {
        let (space, ring) = four_slot_ring();
        let base = ring.base_address();

        let a = ring.enqueue(&td(1)).unwrap();
        assert_eq!(a, base);
        assert!(space.read_trb(base).control.cycle());

        let b = ring.enqueue(&td(1)).unwrap();
        assert_eq!(b, base.offset::<Trb>(1));
        let slot = space.read_trb(b);
        assert!(slot.control.cycle());
        assert_eq!(slot.control.trb_type(), TrbType::Normal);
    }

    /// The concrete scenario of the ring protocol: with the dequeue
    /// address parked at slot 0, a TD whose landing slot would wrap onto
    /// it is refused whole.
    #[test]
    fn full_td_refused_when_landing_on_dequeue() {
        let (_space, ring) = four_slot_ring();
        let base = ring.base_address();

        assert_eq!(ring.enqueue(&td(1)).unwrap(), base);
        // two chained TRBs would land the cursor on the link, which
        // resolves straight onto the dequeue address
        assert!(matches!(ring.enqueue(&td(2)).unwrap_err(), Error::RingFull));

        // controller progress past slot 0 makes room
        ring.update_dequeue_pointer(base.offset::<Trb>(1));
        let b = ring.enqueue(&td(2)).unwrap();
        assert_eq!(b, base.offset::<Trb>(1));

        // cursor wrapped to slot 0, dequeue at slot 1: full again
        assert!(matches!(ring.enqueue(&td(1)).unwrap_err(), Error::RingFull));
        ring.update_dequeue_pointer(base.offset::<Trb>(2));
        assert_eq!(ring.enqueue(&td(1)).unwrap(), base);
    }

    /// A failed enqueue leaves every byte of the ring exactly as it was.
    #[test]
    fn no_partial_writes_on_ring_full() {
        let (space, ring) = four_slot_ring();
        let base = ring.base_address();

        ring.enqueue(&td(1)).unwrap();
        let before = space.snapshot(base, 64);

        assert!(matches!(ring.enqueue(&td(3)).unwrap_err(), Error::RingFull));
        assert_eq!(space.snapshot(base, 64), before);

        // and the cursor was restored: the next fitting TD lands where
        // the failed one would have started
        assert_eq!(ring.enqueue(&td(1)).unwrap(), base.offset::<Trb>(1));
    }

    /// One full revolution (`total_slots - 1` TRBs, one slot reserved)
    /// flips PCS exactly once, at the Toggle-Cycle link, and leaves the
    /// link's payload untouched.
    #[test]
    fn cycle_discipline_over_one_revolution() {
        let (space, ring) = four_slot_ring();
        let base = ring.base_address();
        let link_before = space.read_trb(base.offset::<Trb>(3));

        for i in 0..3u64 {
            // controller keeps pace, consuming each TD as it completes
            ring.update_dequeue_pointer(base.offset::<Trb>(i as usize));
            let addr = ring.enqueue(&td(1)).unwrap();
            assert_eq!(addr, base.offset::<Trb>(i as usize));
        }

        // first revolution wrote with PCS=1 throughout
        for idx in 0..3 {
            assert!(space.read_trb(base.offset::<Trb>(idx)).control.cycle());
        }

        // the link slot's payload is not part of any TD
        let link = space.read_trb(base.offset::<Trb>(3));
        assert_eq!(link.parameter, link_before.parameter);
        assert_eq!(link.control.trb_type(), TrbType::Link);

        // second revolution writes with PCS=0: the flip happened exactly
        // once, when the third TD's commit crossed the Toggle-Cycle link
        ring.update_dequeue_pointer(base.offset::<Trb>(3));
        let wrapped = ring.enqueue(&td(1)).unwrap();
        assert_eq!(wrapped, base);
        assert!(!space.read_trb(base).control.cycle());
    }

    #[test]
    fn multi_segment_td_crosses_link_within_commit() {
        let space = Arc::new(TestDmaSpace::new(64));
        let ring = TransferRing::new(
            Arc::clone(&space) as Arc<dyn DmaAllocator>,
            2,
            &discard_log(),
        )
        .unwrap();
        let base = ring.base_address();

        // 4 chained TRBs span both segments: 3 in the first, then across
        // the (non-toggling) link into the second
        let addr = ring.enqueue(&td(4)).unwrap();
        assert_eq!(addr, base);

        let link = space.read_trb(base.offset::<Trb>(3));
        assert_eq!(link.control.trb_type(), TrbType::Link);
        assert!(link.control.cycle());

        let second_base = PhysAddr(link.parameter);
        assert_ne!(second_base, base);
        let fourth = space.read_trb(second_base);
        assert_eq!(fourth.control.trb_type(), TrbType::Normal);
        assert!(fourth.control.cycle());
        // PCS has not toggled: only the last segment's link carries TC
        assert!(!unsafe { link.control.link.toggle_cycle() });
    }

    proptest! {
        /// For arbitrary TD-length sequences, a refused TD never mutates
        /// ring memory, and every accepted TD is fully published with the
        /// current cycle state.
        #[test]
        fn enqueue_is_all_or_nothing(lens in prop::collection::vec(1..5usize, 1..12)) {
            let space = Arc::new(TestDmaSpace::new(128));
            let ring = TransferRing::new(
                Arc::clone(&space) as Arc<dyn DmaAllocator>,
                1,
                &discard_log(),
            ).unwrap();
            let base = ring.base_address();

            for len in lens {
                let before = space.snapshot(base, 128);
                match ring.enqueue(&td(len)) {
                    Ok(first) => {
                        // first TRB of the TD is published at the
                        // returned address with a fresh cycle bit
                        let slot = space.read_trb(first);
                        prop_assert_eq!(
                            slot.control.trb_type(), TrbType::Normal);
                    }
                    Err(Error::RingFull) => {
                        prop_assert_eq!(space.snapshot(base, 128), before);
                    }
                    Err(e) => return Err(TestCaseError::fail(e.to_string())),
                }
            }
        }
    }
}
