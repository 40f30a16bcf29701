use crate::addresses::{Extent, PhysicalAddress};
use crate::codegen::MoveDirection;
use crate::commit::SubChunk;
use alloc::vec::Vec;

/// One placed allocation: data is loaded at the source and moved to the
/// target right before control is handed over.
///
/// # Invariants
/// - The size is non-zero and source and target have the same length.
/// - The sub-chunk extents exactly tile the source extent.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Chunk {
    source: Extent,
    target: Extent,
    subchunks: Vec<SubChunk>,
}

impl Chunk {
    pub(crate) fn new(source: Extent, target: Extent, subchunks: Vec<SubChunk>) -> Self {
        debug_assert_eq!(source.len(), target.len());
        debug_assert_eq!(
            subchunks.iter().map(|s| s.extent().len()).sum::<u64>(),
            source.len()
        );
        Self {
            source,
            target,
            subchunks,
        }
    }

    #[inline]
    #[must_use]
    pub const fn source(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.source.start())
    }

    #[inline]
    #[must_use]
    pub const fn target(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.target.start())
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.source.len()
    }

    #[inline]
    #[must_use]
    pub const fn source_extent(&self) -> Extent {
        self.source
    }

    #[inline]
    #[must_use]
    pub const fn target_extent(&self) -> Extent {
        self.target
    }

    /// How the chunk was carved out, in address order.
    #[inline]
    #[must_use]
    pub fn subchunks(&self) -> &[SubChunk] {
        &self.subchunks
    }

    /// Copy direction needed to move the chunk; `None` if it is already in place.
    #[must_use]
    pub const fn direction(&self) -> Option<MoveDirection> {
        MoveDirection::between(self.source(), self.target())
    }

    pub(crate) fn into_subchunks(self) -> Vec<SubChunk> {
        self.subchunks
    }
}
