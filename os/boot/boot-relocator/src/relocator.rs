//! # Relocator
//!
//! The chunk registry a loader talks to. Each chunk is a pair of ranges:
//!
//! - the **source**, where the loader writes the data now, and
//! - the **target**, where the kernel expects it once it runs.
//!
//! Sources are carved out of heap regions or reserved from the firmware.
//! Targets only need to be pairwise disjoint. Right before the hand-off,
//! [`prepare_relocs`](Relocator::prepare_relocs) emits the code that moves
//! every source to its target and jumps into the kernel.
//!
//! ```rust
//! # use boot_relocator::addresses::{Extent, PhysicalAddress};
//! # use boot_relocator::firmware::NoFirmware;
//! # use boot_relocator::heap::Heap;
//! # use boot_relocator::placement::Preference;
//! # use boot_relocator::relocator::Relocator;
//! # use boot_relocator::phys_mapper::IdentityPhysMapper;
//! # use boot_relocator::codegen::{CodeGenerator, CodegenError, MoveDirection};
//! # struct NoCode;
//! # impl CodeGenerator for NoCode {
//! #     fn mover_stub_size(&self, _: MoveDirection) -> usize { 0 }
//! #     fn emit_mover(&self, _: &mut [u8], _: PhysicalAddress, _: PhysicalAddress, _: u64, _: MoveDirection) -> Result<(), CodegenError> { Ok(()) }
//! #     fn jumper_stub_size(&self) -> usize { 0 }
//! #     fn emit_jumper(&self, _: &mut [u8], _: PhysicalAddress) -> Result<(), CodegenError> { Ok(()) }
//! #     fn sync_caches(&self, _: PhysicalAddress, _: u64) -> Result<(), CodegenError> { Ok(()) }
//! # }
//! let mut heap = Heap::new();
//! heap.add_region(Extent::new(0x10_0000, 0x10_0000).unwrap()).unwrap();
//! let before = heap.free_bytes();
//!
//! let mut firmware = NoFirmware;
//! let mut rel = Relocator::new(&mut heap, &mut firmware, &NoCode, &IdentityPhysMapper);
//! let (_, at) = rel
//!     .alloc_chunk_align(
//!         PhysicalAddress::new(0x10_0000),
//!         PhysicalAddress::new(0x20_0000),
//!         0x2000,
//!         0x1000,
//!         Preference::Low,
//!     )
//!     .unwrap();
//! assert!(at.is_aligned(0x1000));
//! rel.unload();
//!
//! assert_eq!(heap.free_bytes(), before);
//! ```

use crate::addresses::{Extent, PhysicalAddress};
use crate::chunk::Chunk;
use crate::codegen::CodeGenerator;
use crate::commit;
use crate::error::RelocatorError;
use crate::firmware::{Firmware, FirmwareBlock};
use crate::heap::Heap;
use crate::layout::MAX_ADDRESS;
use crate::phys_mapper::PhysMapper;
use crate::placement::{Placed, Preference};
use alloc::vec::Vec;

/// One relocation task.
///
/// Borrows the heap and the firmware for its whole lifetime; dropping the
/// relocator gives every chunk back.
pub struct Relocator<'a, F: Firmware, G: CodeGenerator, M: PhysMapper> {
    pub(crate) heap: &'a mut Heap,
    pub(crate) firmware: &'a mut F,
    pub(crate) codegen: &'a G,
    pub(crate) mapper: &'a M,
    pub(crate) chunks: Vec<Chunk>,
    /// Firmware reservations held by this relocator.
    pub(crate) extra_blocks: Vec<FirmwareBlock>,
    pub(crate) highest_address: u64,
    pub(crate) highest_non_post_address: u64,
    /// Lowest source placed in the post area, [`MAX_ADDRESS`] if none.
    pub(crate) post_area_start: u64,
    /// Bytes of relocation code needed for the chunks registered so far.
    pub(crate) relocators_size: usize,
}

impl<'a, F: Firmware, G: CodeGenerator, M: PhysMapper> Relocator<'a, F, G, M> {
    pub fn new(heap: &'a mut Heap, firmware: &'a mut F, codegen: &'a G, mapper: &'a M) -> Self {
        let relocators_size = codegen.jumper_stub_size();
        Self {
            heap,
            firmware,
            codegen,
            mapper,
            chunks: Vec::new(),
            extra_blocks: Vec::new(),
            highest_address: 0,
            highest_non_post_address: 0,
            post_area_start: MAX_ADDRESS,
            relocators_size,
        }
    }

    #[inline]
    #[must_use]
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    #[inline]
    #[must_use]
    pub fn heap(&self) -> &Heap {
        self.heap
    }

    /// Firmware reservations currently held.
    #[inline]
    #[must_use]
    pub fn firmware_blocks(&self) -> &[FirmwareBlock] {
        &self.extra_blocks
    }

    #[inline]
    #[must_use]
    pub const fn highest_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.highest_address)
    }

    #[inline]
    #[must_use]
    pub const fn highest_non_post_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.highest_non_post_address)
    }

    #[inline]
    #[must_use]
    pub const fn post_area_start(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.post_area_start)
    }

    /// Size of the code [`prepare_relocs`](Self::prepare_relocs) will emit.
    #[inline]
    #[must_use]
    pub const fn relocators_size(&self) -> usize {
        self.relocators_size
    }

    /// Place a chunk that must end up at `target`.
    ///
    /// Returns a pointer to the source the caller should fill.
    ///
    /// # Errors
    /// - [`RelocatorError::InvalidSize`] for empty chunks.
    /// - [`RelocatorError::OutOfRange`] if the target leaves the address space.
    /// - [`RelocatorError::Overlap`] if the target intersects a registered chunk.
    /// - [`RelocatorError::OutOfMemory`] if no source could be placed.
    pub fn alloc_chunk_addr(
        &mut self,
        target: PhysicalAddress,
        size: u64,
    ) -> Result<*mut u8, RelocatorError> {
        if size == 0 {
            return Err(RelocatorError::InvalidSize);
        }
        let target_extent = Extent::new(target.as_u64(), size)
            .ok_or(RelocatorError::OutOfRange { target, size })?;
        if self.collides(target_extent) {
            return Err(RelocatorError::Overlap { target, size });
        }

        let placed = self
            .place_fixed(target_extent)?
            .ok_or(RelocatorError::OutOfMemory)?;
        let source = self.register(placed, target_extent);
        Ok(self.mapper.phys_to_ptr(source))
    }

    /// Place a chunk anywhere in `[min, max)` at a multiple of `align`.
    ///
    /// The chunk is placed in place when possible (source equals target).
    /// Otherwise a target is picked first and the source is placed wherever
    /// it fits, falling back to the post area.
    ///
    /// Returns a pointer to the source and the target address.
    ///
    /// # Errors
    /// - [`RelocatorError::InvalidSize`] for empty chunks.
    /// - [`RelocatorError::InvalidAlignment`] if `align` is not a power of two.
    /// - [`RelocatorError::OutOfMemory`] if the window is too small or every
    ///   attempt failed. Nothing is changed in that case.
    pub fn alloc_chunk_align(
        &mut self,
        min: PhysicalAddress,
        max: PhysicalAddress,
        size: u64,
        align: u64,
        preference: Preference,
    ) -> Result<(*mut u8, PhysicalAddress), RelocatorError> {
        if size == 0 {
            return Err(RelocatorError::InvalidSize);
        }
        if !align.is_power_of_two() {
            return Err(RelocatorError::InvalidAlignment(align));
        }
        let window = Extent::from_bounds(min.as_u64(), max.as_u64())
            .filter(|w| w.len() >= size)
            .ok_or(RelocatorError::OutOfMemory)?;

        let (placed, target) = self
            .place_flexible(window, size, align, preference)?
            .ok_or(RelocatorError::OutOfMemory)?;
        let source = self.register(placed, target);
        Ok((self.mapper.phys_to_ptr(source), PhysicalAddress::new(target.start())))
    }

    /// Release every chunk and give the heap and firmware back.
    pub fn unload(mut self) {
        log::info!(
            "unloading relocator with {} chunks and {} firmware blocks",
            self.chunks.len(),
            self.extra_blocks.len()
        );
        self.release_all();
    }

    pub(crate) fn collides(&self, extent: Extent) -> bool {
        self.chunks
            .iter()
            .any(|c| c.target_extent().intersects(extent))
    }

    /// Record a committed placement as a chunk moving to `target`.
    pub(crate) fn register(&mut self, placed: Placed, target: Extent) -> PhysicalAddress {
        let source = placed.extent;
        let end = source.end();

        self.highest_address = self.highest_address.max(end);
        if source.start() < self.post_area_start {
            self.highest_non_post_address = self.highest_non_post_address.max(end);
        }
        log::debug!(
            "chunk {source:?} -> {target:?}, highest {:#x}, highest non-post {:#x}",
            self.highest_address,
            self.highest_non_post_address
        );

        let chunk = Chunk::new(source, target, placed.subchunks);
        if let Some(direction) = chunk.direction() {
            self.relocators_size += self.codegen.mover_stub_size(direction);
        }
        let address = chunk.source();
        self.chunks.push(chunk);
        address
    }

    fn release_all(&mut self) {
        while let Some(chunk) = self.chunks.pop() {
            let extent = chunk.source_extent();
            for sub in chunk.into_subchunks() {
                if let Err(e) =
                    commit::release(self.heap, self.firmware, &mut self.extra_blocks, &sub)
                {
                    log::warn!("failed to release {:?} of chunk {extent:?}: {e}", sub.extent());
                }
            }
        }
        self.relocators_size = self.codegen.jumper_stub_size();
    }
}

impl<F: Firmware, G: CodeGenerator, M: PhysMapper> Drop for Relocator<'_, F, G, M> {
    fn drop(&mut self) {
        self.release_all();
    }
}
