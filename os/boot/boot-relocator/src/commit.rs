//! # Allocation Committer
//!
//! Turns the pieces of a found placement into real allocations and undoes
//! them again.
//!
//! | Piece origin   | Commit                              | Release                  |
//! |----------------|-------------------------------------|--------------------------|
//! | region body    | [`Region::split_at`] the free span  | [`Region::release`]      |
//! | region head    | [`Region::move_head`] past the piece| [`Region::restore_head`] |
//! | firmware       | [`Firmware::reserve`]               | [`Firmware::release`]    |
//!
//! Firmware reservations are the only step that can be refused at commit
//! time. The committer then rolls back whatever it already did for the
//! placement and reports [`RelocatorError::FirmwareReservationFailed`] so
//! the search can retry without the refused range.
//!
//! [`Region::split_at`]: crate::heap::Region::split_at
//! [`Region::release`]: crate::heap::Region::release
//! [`Region::move_head`]: crate::heap::Region::move_head
//! [`Region::restore_head`]: crate::heap::Region::restore_head

use crate::addresses::Extent;
use crate::error::RelocatorError;
use crate::firmware::{Firmware, FirmwareBlock};
use crate::heap::{HeadMove, Heap, HeapError, RegionId};
use crate::sweep::{Piece, PieceOrigin};
use alloc::vec::Vec;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SubChunkKind {
    /// Carved out of a free span of the region's body.
    InRegionBody { region: RegionId },
    /// Taken from the region's start by moving its header.
    AtRegionHead { region: RegionId, head: HeadMove },
    /// Reserved from the firmware.
    InFirmwareBlock,
}

/// How one part of a chunk was obtained; enough to give it back exactly.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SubChunk {
    kind: SubChunkKind,
    extent: Extent,
}

impl SubChunk {
    #[inline]
    #[must_use]
    pub const fn kind(&self) -> SubChunkKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub const fn extent(&self) -> Extent {
        self.extent
    }

    /// Everything taken out of the heap or the firmware for this sub-chunk.
    ///
    /// A head move gives away `[old_base, new_base)`, which starts below the
    /// extent when the piece did not begin at the region base.
    #[must_use]
    pub fn claimed(&self) -> Extent {
        match self.kind {
            SubChunkKind::AtRegionHead { head, .. } => {
                Extent::from_bounds(head.old_base, head.new_base).unwrap_or(self.extent)
            }
            _ => self.extent,
        }
    }
}

/// Commit all `pieces` of a placement.
///
/// Pieces are committed from the highest address down. On failure every
/// piece committed so far is released again before the error is returned.
///
/// Returns the sub-chunks in address order.
pub(crate) fn commit<F: Firmware>(
    heap: &mut Heap,
    firmware: &mut F,
    extra_blocks: &mut Vec<FirmwareBlock>,
    pieces: &[Piece],
) -> Result<Vec<SubChunk>, RelocatorError> {
    let mut committed = Vec::with_capacity(pieces.len());
    for piece in pieces.iter().rev() {
        match commit_piece(heap, firmware, extra_blocks, piece) {
            Ok(sub) => {
                log::debug!("committed {:?} as {:?}", sub.extent, sub.kind);
                committed.push(sub);
            }
            Err(failure) => {
                for sub in committed.iter().rev() {
                    if let Err(rollback) = release(heap, firmware, extra_blocks, sub) {
                        log::warn!("failed to roll back {:?}: {rollback}", sub.extent);
                    }
                }
                return Err(failure);
            }
        }
    }
    committed.reverse();
    Ok(committed)
}

fn commit_piece<F: Firmware>(
    heap: &mut Heap,
    firmware: &mut F,
    extra_blocks: &mut Vec<FirmwareBlock>,
    piece: &Piece,
) -> Result<SubChunk, RelocatorError> {
    let extent = piece.extent;
    let kind = match piece.origin {
        PieceOrigin::RegionBody(id) => {
            let region = heap
                .region_mut(id)
                .ok_or(HeapError::Inconsistent(extent))?;
            let index = region
                .span_index_at(extent.start())
                .ok_or(HeapError::Inconsistent(extent))?;
            region.split_at(index, extent)?;
            SubChunkKind::InRegionBody { region: id }
        }
        PieceOrigin::RegionHead(id) => {
            let region = heap
                .region_mut(id)
                .ok_or(HeapError::Inconsistent(extent))?;
            let head = region.move_head(extent.end())?;
            SubChunkKind::AtRegionHead { region: id, head }
        }
        PieceOrigin::Firmware => {
            if !firmware.reserve(extent) {
                return Err(RelocatorError::FirmwareReservationFailed(extent));
            }
            extra_blocks.push(FirmwareBlock { extent });
            SubChunkKind::InFirmwareBlock
        }
    };
    Ok(SubChunk { kind, extent })
}

/// Give one sub-chunk back to where it came from.
pub(crate) fn release<F: Firmware>(
    heap: &mut Heap,
    firmware: &mut F,
    extra_blocks: &mut Vec<FirmwareBlock>,
    sub: &SubChunk,
) -> Result<(), HeapError> {
    match sub.kind {
        SubChunkKind::InRegionBody { region } => heap
            .region_mut(region)
            .ok_or(HeapError::Inconsistent(sub.extent))?
            .release(sub.extent),
        SubChunkKind::AtRegionHead { region, head } => heap
            .region_mut(region)
            .ok_or(HeapError::Inconsistent(sub.extent))?
            .restore_head(&head),
        SubChunkKind::InFirmwareBlock => {
            firmware.release(sub.extent);
            if let Some(i) = extra_blocks.iter().position(|b| b.extent == sub.extent) {
                extra_blocks.remove(i);
            }
            Ok(())
        }
    }
}
