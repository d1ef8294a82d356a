// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Circular TRB transport between host software and an xHCI-class host
//! controller, over shared DMA memory.
//!
//! Software and controller exchange 16-byte Transfer Request Blocks
//! through two ring kinds with no head/tail handshake registers: the
//! [`TransferRing`] is produced by software and consumed by the
//! controller, the [`EventRing`] is the reverse. Wraparound and slot
//! validity are encoded entirely in a single cycle bit per slot, flipped
//! once per revolution through the ring's page-sized segments.
//!
//! Everything above the TRB layer (endpoint and device lifecycle, bus
//! enumeration, command submission, doorbells, transfer scheduling) is a
//! collaborator of this crate, not part of it. The surrounding driver
//! supplies DMA pages through [`dma::DmaAllocator`], feeds controller
//! progress back via [`TransferRing::update_dequeue_pointer`], and
//! correlates [`EventRing`] events against the physical addresses
//! returned by [`TransferRing::enqueue`].

pub mod bits;
pub mod common;
pub mod dma;
pub mod rings;

pub use common::PhysAddr;
pub use dma::{DmaAllocator, DmaPage, OutOfMemory};
pub use rings::event::EventRing;
pub use rings::transfer::TransferRing;
pub use rings::{Error, Result};
