// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boundary to the platform's DMA memory allocator. The surrounding driver
//! supplies an implementation of [`DmaAllocator`]; rings own the pages they
//! allocate and hand every one back on teardown.

use std::ptr::NonNull;

use crate::common::PhysAddr;

/// Segment allocation failed; fatal to the construction of that ring.
#[derive(Debug, thiserror::Error)]
#[error("out of DMA memory")]
pub struct OutOfMemory;

/// One physically contiguous, page-aligned block of DMA-able memory,
/// mapped into the driver's address space and zeroed at allocation.
///
/// The handle carries no destructor of its own; whoever allocated the page
/// gets it back through [`DmaAllocator::release_page`].
#[derive(Debug)]
pub struct DmaPage {
    ptr: NonNull<u8>,
    len: usize,
    phys: PhysAddr,
}

// The pointer refers to memory exclusively owned by this handle; nothing
// aliases it through safe code.
unsafe impl Send for DmaPage {}
unsafe impl Sync for DmaPage {}

impl DmaPage {
    /// `ptr` must refer to `len` bytes of zeroed memory, aligned to `len`,
    /// that stay mapped until the page is returned to its allocator, with
    /// `phys` the physical address of the first byte.
    pub fn new(ptr: NonNull<u8>, len: usize, phys: PhysAddr) -> Self {
        assert_eq!(phys.0 as usize % len, 0, "page not aligned to its size");
        Self { ptr, len, phys }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn phys(&self) -> PhysAddr {
        self.phys
    }
}

/// Provider of DMA pages, implemented by the surrounding driver for its
/// platform. Allocation maps to `allocate_segment` and release to
/// `release_segment` at the driver boundary.
pub trait DmaAllocator: Send + Sync {
    /// One zeroed page, aligned to its own size and physically contiguous.
    /// Production implementations hand out [`crate::common::PAGE_SIZE`]
    /// bytes; tests may use shorter power-of-two pages.
    fn allocate_page(&self) -> Result<DmaPage, OutOfMemory>;

    /// Return a page previously obtained from this allocator.
    fn release_page(&self, page: DmaPage);
}
