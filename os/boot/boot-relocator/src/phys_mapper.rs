//! # Physical Memory Access
//!
//! Converts physical addresses into pointers usable in the current address
//! space. Before the kernel takes over, firmware usually runs identity
//! mapped; tests back the physical space with an ordinary buffer instead.

use crate::addresses::PhysicalAddress;

/// Converts physical addresses to *temporarily* usable pointers.
///
/// Typical patterns:
/// - **Loader**: identity mapping; the pointer value equals the address.
/// - **Tests**: an arena; the address is an offset into a host buffer.
pub trait PhysMapper {
    /// Pointer through which the bytes at `pa` can be reached.
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8;

    /// Borrow `len` bytes at `pa` as a mutable slice.
    ///
    /// # Safety
    /// - `[pa, pa + len)` must be mapped writable for the whole of `'a`.
    /// - No other reference to these bytes may exist for `'a`.
    unsafe fn phys_to_slice_mut<'a>(&self, pa: PhysicalAddress, len: usize) -> &'a mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.phys_to_ptr(pa), len) }
    }
}

/// Physical addresses are the pointers.
#[derive(Debug, Default, Copy, Clone)]
pub struct IdentityPhysMapper;

impl PhysMapper for IdentityPhysMapper {
    #[allow(clippy::cast_possible_truncation)]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        pa.as_u64() as usize as *mut u8
    }
}
