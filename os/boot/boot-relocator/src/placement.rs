//! # Placement Search
//!
//! Placement policies on top of the [event sweep](crate::sweep).
//!
//! ## Fixed targets
//!
//! A chunk with a fixed target inside the post area only looks for a source
//! at or above the target. Any other fixed target tries, in order:
//!
//! 1. a source at or above the target (lowest first),
//! 2. for targets below [`LEGACY_LOW_LIMIT`], the post area
//!    (feature `legacy-low`),
//! 3. a source below the target (highest first),
//! 4. the post area.
//!
//! ## Flexible targets
//!
//! A chunk that may live anywhere in `[min, max)` is first placed in place,
//! with source and target equal. If that fails, a target is chosen among the
//! memory that will be RAM at hand-off and shifted past registered chunks.
//! The source then goes into the gap between the chunks whose targets lie
//! below and above the window, so sources keep the order of their targets.
//! The post area is the last resort.
//!
//! ## Post area
//!
//! The post area is the memory above every source placed outside of it. It
//! grows downwards from the top of the address space and is searched from
//! the top.
//!
//! [`LEGACY_LOW_LIMIT`]: crate::layout::LEGACY_LOW_LIMIT

use crate::addresses::{Extent, align_down, align_up};
use crate::chunk::Chunk;
use crate::codegen::CodeGenerator;
use crate::commit::{self, SubChunk};
use crate::error::RelocatorError;
use crate::firmware::Firmware;
use crate::heap::Region;
use crate::layout::MAX_ADDRESS;
use crate::phys_mapper::PhysMapper;
use crate::relocator::Relocator;
use crate::sweep::{EventClass, EventRef, SweepDirection, SweepRequest, SweepScratch};
use alloc::vec::Vec;

/// Which end of a window is tried first.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Preference {
    Low,
    High,
}

impl Preference {
    #[inline]
    #[must_use]
    pub const fn direction(self) -> SweepDirection {
        match self {
            Self::Low => SweepDirection::Ascending,
            Self::High => SweepDirection::Descending,
        }
    }
}

/// A committed source range and how it was carved out.
#[derive(Debug)]
pub(crate) struct Placed {
    pub extent: Extent,
    pub subchunks: Vec<SubChunk>,
}

impl<F: Firmware, G: CodeGenerator, M: PhysMapper> Relocator<'_, F, G, M> {
    /// Find and commit a source range inside `window`.
    ///
    /// Firmware refusals shrink the window past the refused range and retry.
    /// `Ok(None)` if nothing fits.
    pub(crate) fn place(
        &mut self,
        window: Extent,
        size: u64,
        align: u64,
        direction: SweepDirection,
    ) -> Result<Option<Placed>, RelocatorError> {
        let mut window = window;
        loop {
            log::debug!(
                "trying to allocate in {window:?} aligned {align:#x} size {size:#x} ({direction:?})"
            );
            let request = SweepRequest {
                window,
                size,
                align,
                direction,
            };

            let mut scratch = self.collect_events();
            let found = {
                let frozen = self.heap.freeze();
                scratch.push_heap(&frozen);
                scratch.sort();
                match scratch.find(&request) {
                    Some(extent) => {
                        scratch.compose(frozen.regions(), extent)?;
                        Some(extent)
                    }
                    None => None,
                }
            };
            let Some(extent) = found else {
                return Ok(None);
            };

            match commit::commit(
                self.heap,
                self.firmware,
                &mut self.extra_blocks,
                scratch.pieces(),
            ) {
                Ok(subchunks) => {
                    log::debug!("allocated {extent:?}");
                    return Ok(Some(Placed { extent, subchunks }));
                }
                Err(RelocatorError::FirmwareReservationFailed(refused)) => {
                    log::warn!("firmware refused {refused:?}, retrying without it");
                    let shrunk = if direction.is_ascending() {
                        Extent::from_bounds(refused.end().max(window.start()), window.end())
                    } else {
                        Extent::from_bounds(window.start(), refused.start().min(window.end()))
                    };
                    match shrunk {
                        Some(w) if w != window && w.len() >= size => window = w,
                        _ => return Ok(None),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Events that do not refer into the heap, with room reserved for the heap's.
    fn collect_events(&self) -> SweepScratch {
        let subchunks: usize = self.chunks.iter().map(|c| c.subchunks().len()).sum();
        let mut scratch = SweepScratch::new();
        scratch.reserve(
            self.firmware.max_event_count()
                + 2 * (self.extra_blocks.len() + self.chunks.len() + subchunks),
        );

        self.firmware.list_reserved_blocks(&mut |extent| {
            scratch.push(EventClass::FirmwareAvail, extent, EventRef::None);
        });
        for block in &self.extra_blocks {
            log::trace!("firmware block {:?} is in use", block.extent);
            scratch.push(EventClass::FirmwareBlock, block.extent, EventRef::None);
        }
        for chunk in &self.chunks {
            scratch.push(EventClass::Collision, chunk.target_extent(), EventRef::None);
            // Memory given away by header moves is no longer part of any region.
            for sub in chunk.subchunks() {
                scratch.push(EventClass::FirmwareBlock, sub.claimed(), EventRef::None);
            }
        }

        scratch.prepare_for(self.heap());
        scratch
    }

    /// Search the post area, moving its boundary down on success.
    pub(crate) fn place_post(
        &mut self,
        size: u64,
        align: u64,
    ) -> Result<Option<Placed>, RelocatorError> {
        let Some(window) = Extent::from_bounds(self.highest_non_post_address, MAX_ADDRESS) else {
            return Ok(None);
        };
        let placed = self.place(window, size, align, SweepDirection::Descending)?;
        if let Some(placed) = &placed {
            self.post_area_start = self.post_area_start.min(placed.extent.start());
            log::debug!("post area now starts at {:#x}", self.post_area_start);
        }
        Ok(placed)
    }

    /// Place the source of a chunk with a fixed `target`.
    pub(crate) fn place_fixed(&mut self, target: Extent) -> Result<Option<Placed>, RelocatorError> {
        let size = target.len();

        if target.start() >= self.post_area_start {
            log::debug!("target {target:?} lies in the post area, searching above it only");
            return match Extent::from_bounds(target.start(), MAX_ADDRESS) {
                Some(above) => self.place(above, size, 1, SweepDirection::Ascending),
                None => Ok(None),
            };
        }

        if let Some(above) = Extent::from_bounds(target.start(), MAX_ADDRESS)
            && let Some(placed) = self.place(above, size, 1, SweepDirection::Ascending)?
        {
            return Ok(Some(placed));
        }

        #[cfg(feature = "legacy-low")]
        if target.start() < crate::layout::LEGACY_LOW_LIMIT
            && let Some(placed) = self.place_post(size, 1)?
        {
            return Ok(Some(placed));
        }

        if let Some(below) = Extent::from_bounds(0, target.start())
            && let Some(placed) = self.place(below, size, 1, SweepDirection::Descending)?
        {
            return Ok(Some(placed));
        }

        self.place_post(size, 1)
    }

    /// Place a chunk with a flexible target; returns the placement and the target.
    pub(crate) fn place_flexible(
        &mut self,
        window: Extent,
        size: u64,
        align: u64,
        preference: Preference,
    ) -> Result<Option<(Placed, Extent)>, RelocatorError> {
        if let Some(placed) = self.place(window, size, align, preference.direction())? {
            let target = placed.extent;
            return Ok(Some((placed, target)));
        }

        let Some(target) = self
            .select_target(window, size, align, preference)
            .and_then(|t| Extent::new(t, size))
        else {
            return Ok(None);
        };
        log::debug!("selected target {target:?}");

        let (min, max) = self.adjust_limits(window);
        if let Some(limits) = Extent::from_bounds(min, max)
            && let Some(placed) = self.place(limits, size, align, SweepDirection::Ascending)?
        {
            return Ok(Some((placed, target)));
        }

        Ok(self.place_post(size, align)?.map(|placed| (placed, target)))
    }

    /// Pick an aligned target in `window` that will be RAM at hand-off and
    /// does not intersect a registered chunk. Changes nothing.
    fn select_target(
        &self,
        window: Extent,
        size: u64,
        align: u64,
        preference: Preference,
    ) -> Option<u64> {
        let mut candidates: Vec<Extent> = self.heap.regions().iter().map(Region::extent).collect();
        self.firmware
            .list_reserved_blocks(&mut |extent| candidates.push(extent));

        let floor = window.start().max(1);
        let fits = |t: u64| {
            t >= floor && t.checked_add(size).is_some_and(|end| end <= window.end())
        };

        let candidate = candidates.iter().filter_map(|ram| {
            let lo = ram.start().max(floor);
            let hi = ram.end().min(window.end());
            let t = match preference {
                Preference::Low => align_up(lo, align)?,
                Preference::High => align_down(hi.checked_sub(size)?, align),
            };
            (t >= lo && t.checked_add(size)? <= hi).then_some(t)
        });
        let mut target = match preference {
            Preference::Low => candidate.min(),
            Preference::High => candidate.max(),
        }?;

        // Each step moves past a different chunk.
        for _ in 0..=self.chunks.len() {
            let extent = Extent::new(target, size)?;
            let Some(hit) = self
                .chunks
                .iter()
                .map(Chunk::target_extent)
                .find(|t| t.intersects(extent))
            else {
                break;
            };
            target = match preference {
                Preference::Low => align_up(hit.end(), align)?,
                Preference::High => align_down(hit.start().checked_sub(size)?, align),
            };
        }

        let extent = Extent::new(target, size)?;
        (fits(target) && !self.collides(extent)).then_some(target)
    }

    /// Source limits that keep sources in the order of their targets.
    ///
    /// Sources of chunks targeted entirely above the window cap the upper
    /// limit, sources of chunks targeted entirely below it raise the lower
    /// one. Chunks in the post area are ignored; the post area itself caps
    /// the upper limit.
    fn adjust_limits(&self, window: Extent) -> (u64, u64) {
        let mut min = 0;
        let mut max = self.post_area_start;
        for chunk in &self.chunks {
            let source = chunk.source_extent();
            if source.start() >= self.post_area_start {
                continue;
            }
            let target = chunk.target_extent();
            if target.start() >= window.end() {
                max = max.min(source.start());
            }
            if target.end() <= window.start() {
                min = min.max(source.end());
            }
        }
        log::debug!("adjusted limits to [{min:#x}, {max:#x})");
        (min, max)
    }
}
