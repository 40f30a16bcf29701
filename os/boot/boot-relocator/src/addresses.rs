//! # Physical Addresses and Extents
//!
//! The relocator only ever reasons about **physical** memory: there is no
//! paging in effect while it runs, and every address it hands out is the
//! address the bytes will have when the kernel takes over.
//!
//! [`PhysicalAddress`] is a thin, `#[repr(transparent)]` wrapper over `u64`
//! that carries this intent through the public API. [`Extent`] is the
//! half-open range `[start, end)` used everywhere internally; an extent
//! never wraps around the top of the address space.

use core::fmt;
use core::ops::Add;

/// Physical memory address.
///
/// ### Examples
/// ```rust
/// # use boot_relocator::addresses::PhysicalAddress;
/// let pa = PhysicalAddress::new(0x0010_1234);
/// assert_eq!(pa.align_down(0x1000).as_u64(), 0x0010_1000);
/// assert_eq!(pa.align_up(0x1000).map(PhysicalAddress::as_u64), Some(0x0010_2000));
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Adds `rhs` bytes, or `None` if the result leaves the address space.
    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Rounds up to `align` (a power of two), or `None` on overflow.
    #[inline]
    #[must_use]
    pub const fn align_up(self, align: u64) -> Option<Self> {
        match align_up(self.0, align) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Rounds down to `align` (a power of two).
    #[inline]
    #[must_use]
    pub const fn align_down(self, align: u64) -> Self {
        Self(align_down(self.0, align))
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned(self, align: u64) -> bool {
        is_aligned(self.0, align)
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<PhysicalAddress> for u64 {
    #[inline]
    fn from(value: PhysicalAddress) -> Self {
        value.0
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

/// Half-open physical range `[start, end)`.
///
/// ### Invariants
/// - `start <= end`; the empty extent is allowed but never committed.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Extent {
    start: u64,
    end: u64,
}

impl Extent {
    /// Extent of `len` bytes at `start`, or `None` if it would wrap.
    #[inline]
    #[must_use]
    pub const fn new(start: u64, len: u64) -> Option<Self> {
        match start.checked_add(len) {
            Some(end) => Some(Self { start, end }),
            None => None,
        }
    }

    /// Extent between two bounds, or `None` if `end < start`.
    #[inline]
    #[must_use]
    pub const fn from_bounds(start: u64, end: u64) -> Option<Self> {
        if end < start {
            None
        } else {
            Some(Self { start, end })
        }
    }

    #[inline]
    #[must_use]
    pub const fn start(self) -> u64 {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn end(self) -> u64 {
        self.end
    }

    #[inline]
    #[must_use]
    pub const fn len(self) -> u64 {
        self.end - self.start
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.start == self.end
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    /// Whether `other` lies completely inside `self`.
    #[inline]
    #[must_use]
    pub const fn covers(self, other: Self) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Whether the two extents share at least one byte.
    #[inline]
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Debug for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end)
    }
}

/// Align `x` upwards to `align` (must be a power of two); `None` on overflow.
#[inline]
#[must_use]
pub const fn align_up(x: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    match x.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Align `x` downwards to `align` (must be a power of two).
#[inline]
#[must_use]
pub const fn align_down(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    x & !(align - 1)
}

#[inline]
#[must_use]
pub const fn is_aligned(x: u64, align: u64) -> bool {
    debug_assert!(align.is_power_of_two());
    x & (align - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(0x1001, 0x1000), Some(0x2000));
        assert_eq!(align_up(0x1000, 0x1000), Some(0x1000));
        assert_eq!(align_up(u64::MAX - 2, 0x10), None);
        assert_eq!(align_down(0x1fff, 0x1000), 0x1000);
        assert!(is_aligned(0x20_0000, 0x20_0000));
        assert!(!is_aligned(0x20_0001, 2));
    }

    #[test]
    fn extents_reject_wrapping() {
        assert!(Extent::new(u64::MAX, 1).is_none());
        assert!(Extent::from_bounds(0x2000, 0x1000).is_none());
        let e = Extent::new(0x1000, 0x1000).unwrap();
        assert_eq!(e.end(), 0x2000);
        assert!(e.contains(0x1fff));
        assert!(!e.contains(0x2000));
    }

    #[test]
    fn extents_touching_do_not_intersect() {
        let a = Extent::from_bounds(0x1000, 0x2000).unwrap();
        let b = Extent::from_bounds(0x2000, 0x3000).unwrap();
        let c = Extent::from_bounds(0x1800, 0x2800).unwrap();
        assert!(!a.intersects(b));
        assert!(a.intersects(c));
        assert!(c.intersects(b));
        assert!(Extent::from_bounds(0x1000, 0x3000).unwrap().covers(c));
    }
}
