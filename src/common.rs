// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// Size of one page of DMA-able memory, and the required alignment of
/// every ring segment.
pub const PAGE_SIZE: usize = 4096;

/// A physical address as seen by the host controller.
///
/// The crate does arithmetic and comparisons on these; it never
/// dereferences one across the hardware boundary. Virtual access to ring
/// memory always goes through the [`crate::dma::DmaPage`] that owns it.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    pub fn offset<T: Sized>(&self, count: usize) -> Self {
        Self(self.0 + (count * std::mem::size_of::<T>()) as u64)
    }
}
