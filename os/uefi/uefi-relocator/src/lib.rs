//! # UEFI Relocator Backend
//!
//! Connects the [boot relocator](boot_relocator) to UEFI boot services.
//!
//! - [`UefiFirmware`] offers `CONVENTIONAL` memory from the live memory map
//!   and reserves it page by page as `LOADER_DATA`.
//! - [`seed_heap_region`] hands a block of boot-services pages to the
//!   loader heap.
//!
//! Everything here is only valid while boot services are active, i.e.
//! before `ExitBootServices`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

use boot_relocator::addresses::{Extent, align_down, align_up};
use boot_relocator::firmware::Firmware;
use boot_relocator::heap::{Heap, HeapError, RegionId};
use core::ptr::NonNull;
use uefi::Status;
use uefi::boot::{self, AllocateType, MemoryType};
use uefi::mem::memory_map::MemoryMap;

pub const PAGE_SIZE: u64 = 4096;

/// Descriptors the memory map may gain between sizing and scanning.
pub const EXTRA_DESCRIPTORS: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum UefiRelocatorError {
    #[error("A physical page allocation failed")]
    PhysicalAllocationFailed(#[source] uefi::Error),
    #[error("The requested page count does not fit the address space")]
    PageCount,
    #[error("The heap rejected the region")]
    Heap(#[from] HeapError),
}

impl From<UefiRelocatorError> for Status {
    fn from(value: UefiRelocatorError) -> Self {
        match value {
            UefiRelocatorError::PhysicalAllocationFailed(e) => e.status(),
            UefiRelocatorError::PageCount => Self::BAD_BUFFER_SIZE,
            UefiRelocatorError::Heap(_) => Self::OUT_OF_RESOURCES,
        }
    }
}

/// Boot services as the relocator's firmware collaborator.
///
/// Reservations are page-rounded. Two extents sharing a page cannot both be
/// reserved; the second request is refused and the relocator searches on.
#[derive(Debug, Default)]
pub struct UefiFirmware;

impl UefiFirmware {
    fn pages(extent: Extent) -> Option<(u64, usize)> {
        let start = align_down(extent.start(), PAGE_SIZE);
        let end = align_up(extent.end(), PAGE_SIZE)?;
        let pages = usize::try_from((end - start) / PAGE_SIZE).ok()?;
        Some((start, pages))
    }
}

impl Firmware for UefiFirmware {
    fn max_event_count(&self) -> usize {
        let descriptors = boot::memory_map(MemoryType::LOADER_DATA).map_or(0, |map| map.len());
        2 * (descriptors + EXTRA_DESCRIPTORS)
    }

    fn list_reserved_blocks(&self, visit: &mut dyn FnMut(Extent)) {
        let map = match boot::memory_map(MemoryType::LOADER_DATA) {
            Ok(map) => map,
            Err(e) => {
                log::warn!("Failed to get memory map: {e:?}");
                return;
            }
        };
        for desc in map.entries() {
            if desc.ty != MemoryType::CONVENTIONAL {
                continue;
            }
            let extent = desc
                .page_count
                .checked_mul(PAGE_SIZE)
                .and_then(|len| Extent::new(desc.phys_start, len));
            if let Some(extent) = extent {
                visit(extent);
            }
        }
    }

    fn reserve(&mut self, extent: Extent) -> bool {
        let Some((start, pages)) = Self::pages(extent) else {
            return false;
        };
        match boot::allocate_pages(AllocateType::Address(start), MemoryType::LOADER_DATA, pages) {
            Ok(_) => {
                log::debug!("reserved {pages} pages at {start:#x} for {extent:?}");
                true
            }
            Err(e) => {
                log::warn!("AllocatePages({start:#x}, {pages}) failed: {:?}", e.status());
                false
            }
        }
    }

    fn release(&mut self, extent: Extent) {
        let Some((start, pages)) = Self::pages(extent) else {
            return;
        };
        #[allow(clippy::cast_possible_truncation)]
        let Some(ptr) = NonNull::new(start as usize as *mut u8) else {
            return;
        };
        // SAFETY: the pages were allocated by `reserve` for this extent.
        if let Err(e) = unsafe { boot::free_pages(ptr, pages) } {
            log::warn!("FreePages({start:#x}, {pages}) failed: {:?}", e.status());
        }
    }
}

/// Allocate `pages` boot-services pages and register them as a heap region.
///
/// # Errors
/// Fails if boot services cannot provide the pages or the heap rejects them.
/// The pages are freed again in the latter case.
pub fn seed_heap_region(heap: &mut Heap, pages: usize) -> Result<RegionId, UefiRelocatorError> {
    let len = u64::try_from(pages)
        .ok()
        .and_then(|p| p.checked_mul(PAGE_SIZE))
        .ok_or(UefiRelocatorError::PageCount)?;
    let ptr = boot::allocate_pages(AllocateType::AnyPages, MemoryType::LOADER_DATA, pages)
        .map_err(UefiRelocatorError::PhysicalAllocationFailed)?;

    let base = ptr.as_ptr() as u64;
    let region = Extent::new(base, len)
        .ok_or(UefiRelocatorError::PageCount)
        .and_then(|extent| heap.add_region(extent).map_err(UefiRelocatorError::from));

    match region {
        Ok(id) => {
            log::info!("seeded heap region {id:?} with {pages} pages at {base:#x}");
            Ok(id)
        }
        Err(e) => {
            // SAFETY: the pages were allocated above and never handed out.
            if let Err(free) = unsafe { boot::free_pages(ptr, pages) } {
                log::warn!("FreePages({base:#x}, {pages}) failed: {:?}", free.status());
            }
            Err(e)
        }
    }
}
