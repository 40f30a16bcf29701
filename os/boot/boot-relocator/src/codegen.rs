//! # Code Generator Collaborator
//!
//! The relocator does not know any instruction set. It asks a
//! [`CodeGenerator`] for the size of each stub up front (so the code buffer
//! can be placed before anything is emitted) and then for the bytes.

use crate::addresses::PhysicalAddress;

/// Copy direction of a mover stub.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MoveDirection {
    /// Ascending copy; safe when the target lies below the source.
    Forward,
    /// Descending copy; safe when the target lies above the source.
    Backward,
}

impl MoveDirection {
    /// Direction required to move `source` to `target`, `None` if nothing moves.
    ///
    /// ```rust
    /// # use boot_relocator::addresses::PhysicalAddress;
    /// # use boot_relocator::codegen::MoveDirection;
    /// let d = MoveDirection::between(PhysicalAddress::new(0x1000), PhysicalAddress::new(0x1800));
    /// assert_eq!(d, Some(MoveDirection::Backward));
    /// ```
    #[must_use]
    pub const fn between(source: PhysicalAddress, target: PhysicalAddress) -> Option<Self> {
        let (source, target) = (source.as_u64(), target.as_u64());
        if source < target {
            Some(Self::Backward)
        } else if source > target {
            Some(Self::Forward)
        } else {
            None
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum CodegenError {
    #[error("Stub needs {needed} bytes but only {available} are left")]
    BufferTooSmall { needed: usize, available: usize },
    #[error("Address {0} cannot be encoded by this architecture")]
    AddressNotEncodable(PhysicalAddress),
    #[error("Failed to synchronize caches")]
    CacheSync,
}

/// Architecture-specific emitter of mover and jumper stubs.
pub trait CodeGenerator {
    fn mover_stub_size(&self, direction: MoveDirection) -> usize;

    /// Emit a stub copying `size` bytes from `source` to `target` into the
    /// start of `buffer`.
    ///
    /// # Errors
    /// Fails if the buffer is too short or an operand cannot be encoded.
    fn emit_mover(
        &self,
        buffer: &mut [u8],
        source: PhysicalAddress,
        target: PhysicalAddress,
        size: u64,
        direction: MoveDirection,
    ) -> Result<(), CodegenError>;

    fn jumper_stub_size(&self) -> usize;

    /// Emit the terminal jump to `entry` into the start of `buffer`.
    ///
    /// # Errors
    /// Fails if the buffer is too short or `entry` cannot be encoded.
    fn emit_jumper(&self, buffer: &mut [u8], entry: PhysicalAddress) -> Result<(), CodegenError>;

    /// Make `[address, address + size)` coherent for instruction fetch.
    ///
    /// # Errors
    /// [`CodegenError::CacheSync`] if the architecture reports a failure.
    fn sync_caches(&self, address: PhysicalAddress, size: u64) -> Result<(), CodegenError>;
}
