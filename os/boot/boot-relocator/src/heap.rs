//! # Boot Heap
//!
//! The general-purpose allocator the loader uses while it assembles the boot
//! image, and which the relocator temporarily borrows memory from.
//!
//! The heap manages a small number of [`Region`]s, each with its own span
//! list (see [`region`]). Allocation is first-fit across regions in address
//! order, the same strategy as a classic embedded free-list allocator.
//!
//! ## Freezing
//!
//! While the relocator scans the heap it holds index references into the
//! region and span tables. Any allocation in that window would invalidate
//! them, so the scan runs under a [`FrozenHeap`] guard: the heap refuses to
//! allocate until the guard is dropped.
//!
//! ```rust
//! # use boot_relocator::addresses::Extent;
//! # use boot_relocator::heap::Heap;
//! let mut heap = Heap::new();
//! heap.add_region(Extent::new(0x10_0000, 0x1_0000).unwrap()).unwrap();
//! let before = heap.free_bytes();
//!
//! let p = heap.allocate(0x100, 0x10).unwrap();
//! heap.deallocate(p).unwrap();
//! assert_eq!(heap.free_bytes(), before);
//!
//! let frozen = heap.freeze();
//! assert!(frozen.is_frozen());
//! drop(frozen);
//! assert!(!heap.is_frozen());
//! ```

pub mod region;

use crate::addresses::{Extent, PhysicalAddress};
use crate::layout::REGION_HEADER_ALIGN;
use alloc::vec::Vec;
use core::ops::Deref;
pub use region::{HeadMove, Region, RegionId, Span, SpanState};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("The heap is frozen for a placement scan")]
    Frozen,
    #[error("No free span satisfies the request")]
    OutOfMemory,
    #[error("Region {0:?} overlaps an existing region")]
    Overlap(Extent),
    #[error("Region {0:?} cannot hold its own header")]
    RegionTooSmall(Extent),
    #[error("No allocation starts at {0:#x}")]
    UnknownAllocation(u64),
    #[error("Heap bookkeeping does not match the piece {0:?}")]
    Inconsistent(Extent),
}

/// Region-based first-fit heap.
///
/// # Invariants
/// - Regions are kept sorted by address and never overlap.
/// - Region identities are never reused.
#[derive(Debug, Default)]
pub struct Heap {
    regions: Vec<Region>,
    next_id: u32,
    frozen: bool,
}

impl Heap {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            regions: Vec::new(),
            next_id: 0,
            frozen: false,
        }
    }

    /// Hand `extent` to the heap as a new region.
    ///
    /// # Errors
    /// Fails if the extent overlaps an existing region or cannot hold a
    /// region header.
    pub fn add_region(&mut self, extent: Extent) -> Result<RegionId, HeapError> {
        if self.frozen {
            return Err(HeapError::Frozen);
        }
        if self.regions.iter().any(|r| r.extent().intersects(extent)) {
            return Err(HeapError::Overlap(extent));
        }

        let id = RegionId(self.next_id);
        let region = Region::new(id, extent)?;
        let index = self.regions.partition_point(|r| r.base() < extent.start());
        self.regions.insert(index, region);
        self.next_id += 1;

        log::debug!("heap: added region {id:?} {extent:?}");
        Ok(id)
    }

    #[inline]
    #[must_use]
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    #[must_use]
    pub fn region(&self, id: RegionId) -> Option<&Region> {
        self.regions.iter().find(|r| r.id() == id)
    }

    pub(crate) fn region_mut(&mut self, id: RegionId) -> Option<&mut Region> {
        self.regions.iter_mut().find(|r| r.id() == id)
    }

    /// Total number of free bytes across all regions.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.regions.iter().map(Region::free_bytes).sum()
    }

    #[inline]
    #[must_use]
    pub const fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Allocate `size` bytes aligned to `align` (a power of two).
    ///
    /// # Errors
    /// [`HeapError::Frozen`] during a placement scan,
    /// [`HeapError::OutOfMemory`] if no free span fits.
    pub fn allocate(&mut self, size: u64, align: u64) -> Result<PhysicalAddress, HeapError> {
        if self.frozen {
            return Err(HeapError::Frozen);
        }
        let size = size.max(1);
        let align = align.max(REGION_HEADER_ALIGN);
        self.regions
            .iter_mut()
            .find_map(|r| r.allocate_first_fit(size, align))
            .map(PhysicalAddress::new)
            .ok_or(HeapError::OutOfMemory)
    }

    /// Free an allocation previously returned by [`allocate`](Self::allocate).
    ///
    /// # Errors
    /// [`HeapError::UnknownAllocation`] if no allocation starts at `addr`.
    pub fn deallocate(&mut self, addr: PhysicalAddress) -> Result<(), HeapError> {
        if self.frozen {
            return Err(HeapError::Frozen);
        }
        let addr = addr.as_u64();
        let region = self
            .regions
            .iter_mut()
            .find(|r| r.extent().contains(addr))
            .ok_or(HeapError::UnknownAllocation(addr))?;
        region.deallocate(addr).map(|_| ())
    }

    /// Stop handing out memory until the returned guard is dropped.
    pub fn freeze(&mut self) -> FrozenHeap<'_> {
        debug_assert!(!self.frozen, "heap frozen twice");
        self.frozen = true;
        FrozenHeap { heap: self }
    }
}

/// Read-only view of a [`Heap`] that is not allowed to allocate.
///
/// Thaws the heap on drop.
pub struct FrozenHeap<'h> {
    heap: &'h mut Heap,
}

impl Deref for FrozenHeap<'_> {
    type Target = Heap;

    fn deref(&self) -> &Self::Target {
        self.heap
    }
}

impl Drop for FrozenHeap<'_> {
    fn drop(&mut self) {
        self.heap.frozen = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext(start: u64, len: u64) -> Extent {
        Extent::new(start, len).unwrap()
    }

    #[test]
    fn regions_stay_sorted_and_disjoint() {
        let mut heap = Heap::new();
        heap.add_region(ext(0x20_0000, 0x1000)).unwrap();
        heap.add_region(ext(0x10_0000, 0x1000)).unwrap();
        assert_eq!(
            heap.add_region(ext(0x10_0800, 0x1000)),
            Err(HeapError::Overlap(ext(0x10_0800, 0x1000)))
        );
        let bases: Vec<u64> = heap.regions().iter().map(Region::base).collect();
        assert_eq!(bases, [0x10_0000, 0x20_0000]);
    }

    #[test]
    fn allocation_falls_through_to_later_regions() {
        let mut heap = Heap::new();
        heap.add_region(ext(0x10_0000, 0x100)).unwrap();
        heap.add_region(ext(0x20_0000, 0x1000)).unwrap();
        let p = heap.allocate(0x200, 0x10).unwrap();
        assert!(p.as_u64() >= 0x20_0000);
    }

    #[test]
    fn frozen_heap_refuses_allocation() {
        let mut heap = Heap::new();
        heap.add_region(ext(0x10_0000, 0x1000)).unwrap();
        heap.frozen = true;
        assert_eq!(heap.allocate(0x10, 0x10), Err(HeapError::Frozen));
        heap.frozen = false;
        assert!(heap.allocate(0x10, 0x10).is_ok());
    }

    #[test]
    fn unknown_deallocation_is_reported() {
        let mut heap = Heap::new();
        heap.add_region(ext(0x10_0000, 0x1000)).unwrap();
        assert_eq!(
            heap.deallocate(PhysicalAddress::new(0x10_0100)),
            Err(HeapError::UnknownAllocation(0x10_0100))
        );
    }
}
