//! # Relocator Layout Constants

/// Exclusive upper bound of every search window.
///
/// Chunks may end exactly at this address but never beyond it.
pub const MAX_ADDRESS: u64 = u64::MAX;

/// Targets below this address are "legacy low" (real-mode reachable memory).
///
/// Sources for such targets are preferably placed in the post area so that
/// the scarce memory below 1 MiB stays available to other requests.
pub const LEGACY_LOW_LIMIT: u64 = 0x0010_0000; // 1 MiB

/// Bytes occupied by a heap region's header.
///
/// The header lives at the region's head; allocating over the head moves the
/// header past the allocation.
pub const REGION_HEADER_SIZE: u64 = 32;

/// Alignment of a region header.
pub const REGION_HEADER_ALIGN: u64 = 16;

/// Alignment of the generated relocation code buffer.
pub const RELOCATOR_CODE_ALIGN: u64 = 16;

/// Digit width of the event radix sort.
pub const RADIX_BITS: u32 = 8;

/// Number of buckets per radix pass.
pub const RADIX_BUCKETS: usize = 1 << RADIX_BITS;

/// Number of radix passes over a 64-bit position.
pub const RADIX_PASSES: u32 = u64::BITS / RADIX_BITS;

const _: () = {
    assert!(REGION_HEADER_ALIGN.is_power_of_two());
    assert!(REGION_HEADER_SIZE.is_multiple_of(REGION_HEADER_ALIGN));
    assert!(RELOCATOR_CODE_ALIGN.is_power_of_two());
    assert!(u64::BITS.is_multiple_of(RADIX_BITS));
    assert!(LEGACY_LOW_LIMIT < MAX_ADDRESS);
};
