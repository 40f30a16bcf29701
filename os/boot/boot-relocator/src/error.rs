use crate::addresses::{Extent, PhysicalAddress};
use crate::codegen::CodegenError;
use crate::heap::HeapError;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum RelocatorError {
    #[error("Chunk at {target} with size {size:#x} leaves the address space")]
    OutOfRange { target: PhysicalAddress, size: u64 },
    #[error("Chunk at {target} with size {size:#x} overlaps a registered chunk")]
    Overlap { target: PhysicalAddress, size: u64 },
    #[error("No memory left for the requested placement")]
    OutOfMemory,
    #[error("Firmware refused to reserve {0:?}")]
    FirmwareReservationFailed(Extent),
    #[error("Chunks must not be empty")]
    InvalidSize,
    #[error("Alignment {0:#x} is not a power of two")]
    InvalidAlignment(u64),
    #[error(transparent)]
    Codegen(#[from] CodegenError),
    #[error(transparent)]
    Heap(#[from] HeapError),
}
