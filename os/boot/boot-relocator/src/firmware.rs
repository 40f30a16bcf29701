//! # Firmware Collaborator
//!
//! Memory that is not owned by the heap may still be borrowable from the
//! platform firmware (e.g. UEFI conventional memory). The relocator asks the
//! firmware which extents it could reserve, and reserves the pieces a
//! placement actually uses.

use crate::addresses::Extent;

/// Platform firmware memory enumeration and reservation.
pub trait Firmware {
    /// Upper bound of the number of sweep events [`list_reserved_blocks`](Self::list_reserved_blocks)
    /// may contribute (two per reported extent).
    ///
    /// Used to size the scan scratch buffers before the heap is frozen.
    fn max_event_count(&self) -> usize;

    /// Report every extent the firmware could hand out right now.
    ///
    /// Extents may overlap heap regions; those parts are masked out.
    fn list_reserved_blocks(&self, visit: &mut dyn FnMut(Extent));

    /// Reserve `extent` for the caller; `false` if the firmware refused.
    fn reserve(&mut self, extent: Extent) -> bool;

    /// Return an extent obtained through [`reserve`](Self::reserve).
    fn release(&mut self, extent: Extent);
}

/// A firmware reservation held by one relocator.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FirmwareBlock {
    pub extent: Extent,
}

/// Firmware that has nothing to lend; placements come from the heap only.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoFirmware;

impl Firmware for NoFirmware {
    fn max_event_count(&self) -> usize {
        0
    }

    fn list_reserved_blocks(&self, _visit: &mut dyn FnMut(Extent)) {}

    fn reserve(&mut self, _extent: Extent) -> bool {
        false
    }

    fn release(&mut self, _extent: Extent) {}
}
