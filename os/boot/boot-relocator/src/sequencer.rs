//! # Relocation Sequencer
//!
//! Emits the code that runs between the loader and the kernel:
//!
//! ```text
//! [mover chunk 0][mover chunk 1] ... [mover chunk n][jumper -> entry]
//! ```
//!
//! A chunk whose source lies below its target overlaps its own destination
//! from below, so it is copied from the top down (backward). A chunk whose
//! source lies above its target is copied from the bottom up (forward).
//! Chunks already in place only need their caches synchronized.
//!
//! Chunks are emitted in source order. Targets are pairwise disjoint, and
//! the movers assume no target overlaps the source of another chunk; chunks
//! that break this assumption are reported but not reordered.

use crate::addresses::{Extent, PhysicalAddress};
use crate::codegen::{CodeGenerator, CodegenError};
use crate::error::RelocatorError;
use crate::firmware::Firmware;
use crate::layout::{MAX_ADDRESS, RELOCATOR_CODE_ALIGN};
use crate::phys_mapper::PhysMapper;
use crate::relocator::Relocator;
use crate::sweep::SweepDirection;
use alloc::vec::Vec;

impl<F: Firmware, G: CodeGenerator, M: PhysMapper> Relocator<'_, F, G, M> {
    /// Emit the relocation code that moves every chunk into place and jumps
    /// to `entry`.
    ///
    /// The code buffer is placed in place (source equals target) with
    /// [`RELOCATOR_CODE_ALIGN`] and registered as a chunk of its own.
    ///
    /// Returns the address and size of the code.
    ///
    /// # Errors
    /// [`RelocatorError::OutOfMemory`] if the code buffer cannot be placed;
    /// code generator failures are passed through unchanged.
    pub fn prepare_relocs(
        &mut self,
        entry: PhysicalAddress,
    ) -> Result<(PhysicalAddress, usize), RelocatorError> {
        let total = self.relocators_size;
        let size = u64::try_from(total).map_err(|_| RelocatorError::OutOfMemory)?;
        let window = Extent::from_bounds(0, MAX_ADDRESS).ok_or(RelocatorError::OutOfMemory)?;

        let placed = self
            .place(window, size, RELOCATOR_CODE_ALIGN, SweepDirection::Ascending)?
            .ok_or(RelocatorError::OutOfMemory)?;
        let code = placed.extent;
        let code_address = self.register(placed, code);

        self.report_hazards();

        let mut order: Vec<usize> = (0..self.chunks.len())
            .filter(|&i| self.chunks[i].source_extent() != code)
            .collect();
        order.sort_by_key(|&i| self.chunks[i].source());

        // SAFETY: the code extent was just committed for this relocator alone.
        let buffer = unsafe { self.mapper.phys_to_slice_mut(code_address, total) };

        let mut offset = 0;
        for i in order {
            let chunk = &self.chunks[i];
            log::debug!(
                "chunk {:?} -> {:?} ({:#x} bytes): {:?}",
                chunk.source(),
                chunk.target(),
                chunk.size(),
                chunk.direction()
            );
            match chunk.direction() {
                None => self.codegen.sync_caches(chunk.source(), chunk.size())?,
                Some(direction) => {
                    let needed = self.codegen.mover_stub_size(direction);
                    self.codegen.emit_mover(
                        tail(buffer, offset, needed)?,
                        chunk.source(),
                        chunk.target(),
                        chunk.size(),
                        direction,
                    )?;
                    offset += needed;
                }
            }
        }

        let needed = self.codegen.jumper_stub_size();
        self.codegen
            .emit_jumper(tail(buffer, offset, needed)?, entry)?;
        self.codegen.sync_caches(code_address, size)?;

        log::info!(
            "relocator code at {code_address} ({total} bytes) jumps to {entry}"
        );
        Ok((code_address, total))
    }

    /// Warn about chunks whose target overlaps the source of another chunk.
    fn report_hazards(&self) {
        for (i, a) in self.chunks.iter().enumerate() {
            for (j, b) in self.chunks.iter().enumerate() {
                if i != j && a.target_extent().intersects(b.source_extent()) {
                    log::warn!(
                        "target {:?} of chunk {i} overlaps source {:?} of chunk {j}",
                        a.target_extent(),
                        b.source_extent()
                    );
                }
            }
        }
    }
}

fn tail(buffer: &mut [u8], offset: usize, needed: usize) -> Result<&mut [u8], CodegenError> {
    let available = buffer.len().saturating_sub(offset);
    if available < needed {
        return Err(CodegenError::BufferTooSmall { needed, available });
    }
    Ok(&mut buffer[offset..])
}
