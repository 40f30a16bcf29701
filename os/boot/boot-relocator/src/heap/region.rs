//! # Heap Regions
//!
//! A [`Region`] is one contiguous extent owned by the heap:
//!
//! ```text
//! base     head               body_start                                  end
//!  |pad|   | header (32 B)    | span | span | span | ...              span |
//!  +-------+------------------+------+------+------+---------------------+
//! ```
//!
//! - The header sits at `head = align_up(base, REGION_HEADER_ALIGN)`.
//! - The body `[body_start, end)` is tiled by [`Span`]s in address order.
//!   Neighbouring free spans are always merged.
//! - Allocations that cover the head move the header past the allocation
//!   (see [`Region::move_head`]); the move is undone by [`Region::restore_head`].
//!
//! All span bookkeeping changes go through the region's own operations so the
//! committer never rewrites span lists by hand.

use crate::addresses::{Extent, align_down, align_up};
use crate::heap::HeapError;
use crate::layout::{REGION_HEADER_ALIGN, REGION_HEADER_SIZE};
use alloc::vec;
use alloc::vec::Vec;

/// Stable identity of a region, independent of its position in the heap.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RegionId(pub(crate) u32);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SpanState {
    Free,
    Allocated,
}

/// A piece of a region's body, either free or handed out.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Span {
    extent: Extent,
    state: SpanState,
}

impl Span {
    const fn free(extent: Extent) -> Self {
        Self {
            extent,
            state: SpanState::Free,
        }
    }

    const fn allocated(extent: Extent) -> Self {
        Self {
            extent,
            state: SpanState::Allocated,
        }
    }

    #[inline]
    #[must_use]
    pub const fn extent(&self) -> Extent {
        self.extent
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> u64 {
        self.extent.start()
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.extent.end()
    }

    #[inline]
    #[must_use]
    pub const fn state(&self) -> SpanState {
        self.state
    }

    #[inline]
    #[must_use]
    pub const fn is_free(&self) -> bool {
        matches!(self.state, SpanState::Free)
    }
}

/// Record of a header relocation, sufficient to undo it exactly.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HeadMove {
    pub old_base: u64,
    pub old_head: u64,
    pub new_base: u64,
    pub new_head: u64,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Region {
    id: RegionId,
    base: u64,
    head: u64,
    end: u64,
    spans: Vec<Span>,
}

impl Region {
    /// Create a region covering `extent` with a single free span as its body.
    pub(crate) fn new(id: RegionId, extent: Extent) -> Result<Self, HeapError> {
        let head = align_up(extent.start(), REGION_HEADER_ALIGN)
            .ok_or(HeapError::RegionTooSmall(extent))?;
        let body_start = head
            .checked_add(REGION_HEADER_SIZE)
            .ok_or(HeapError::RegionTooSmall(extent))?;
        if body_start > extent.end() {
            return Err(HeapError::RegionTooSmall(extent));
        }

        let spans = match Extent::from_bounds(body_start, extent.end()) {
            Some(body) if !body.is_empty() => vec![Span::free(body)],
            _ => Vec::new(),
        };

        Ok(Self {
            id,
            base: extent.start(),
            head,
            end: extent.end(),
            spans,
        })
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> RegionId {
        self.id
    }

    /// Lowest address owned by the region (may precede the header).
    #[inline]
    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }

    /// Address of the region header.
    #[inline]
    #[must_use]
    pub const fn head(&self) -> u64 {
        self.head
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.end
    }

    #[inline]
    #[must_use]
    pub const fn body_start(&self) -> u64 {
        self.head + REGION_HEADER_SIZE
    }

    #[inline]
    #[must_use]
    pub fn extent(&self) -> Extent {
        Extent::from_bounds(self.base, self.end).unwrap_or_default()
    }

    #[inline]
    #[must_use]
    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.spans
            .iter()
            .filter(|s| s.is_free())
            .map(|s| s.extent.len())
            .sum()
    }

    /// The range that may be handed out by moving the header.
    ///
    /// Only exists while the first body span is free. It starts at the region
    /// base and stops early enough that the relocated header still fits into
    /// the first span.
    #[must_use]
    pub fn head_window(&self) -> Option<Extent> {
        let first = self.spans.first()?;
        if !first.is_free() || first.start() != self.body_start() {
            return None;
        }
        let limit = first.end().checked_sub(REGION_HEADER_SIZE)?;
        let end = align_down(limit, REGION_HEADER_ALIGN);
        if end <= self.base {
            return None;
        }
        Extent::from_bounds(self.base, end)
    }

    /// Index of the span containing `addr`.
    #[must_use]
    pub fn span_index_at(&self, addr: u64) -> Option<usize> {
        let index = self.spans.partition_point(|s| s.end() <= addr);
        self.spans
            .get(index)
            .filter(|s| s.extent.contains(addr))
            .map(|_| index)
    }

    /// Carve `piece` out of the free span at `index`.
    ///
    /// The span is replaced by up to three spans: a free residue before the
    /// piece, the allocated piece, and a free residue after it.
    ///
    /// Returns the allocated span.
    ///
    /// # Errors
    /// [`HeapError::Inconsistent`] if there is no free span at `index` or it
    /// does not cover `piece`.
    pub fn split_at(&mut self, index: usize, piece: Extent) -> Result<Span, HeapError> {
        let span = self
            .spans
            .get(index)
            .copied()
            .ok_or(HeapError::Inconsistent(piece))?;
        if !span.is_free() || piece.is_empty() || !span.extent.covers(piece) {
            return Err(HeapError::Inconsistent(piece));
        }

        let before = Extent::from_bounds(span.start(), piece.start())
            .filter(|e| !e.is_empty())
            .map(Span::free);
        let after = Extent::from_bounds(piece.end(), span.end())
            .filter(|e| !e.is_empty())
            .map(Span::free);
        let allocated = Span::allocated(piece);

        self.spans.splice(
            index..=index,
            before.into_iter().chain(Some(allocated)).chain(after),
        );
        Ok(allocated)
    }

    /// Coalesce the free span at `index` with free neighbours.
    ///
    /// Returns the index of the merged span. Allocated spans are left alone.
    pub fn merge_adjacent(&mut self, index: usize) -> usize {
        let Some(span) = self.spans.get(index) else {
            return index;
        };
        if !span.is_free() {
            return index;
        }

        let mut index = index;
        while let Some(next) = self.spans.get(index + 1).copied() {
            let current = self.spans[index];
            if !next.is_free() || current.end() != next.start() {
                break;
            }
            self.spans[index].extent =
                Extent::from_bounds(current.start(), next.end()).unwrap_or(current.extent);
            self.spans.remove(index + 1);
        }

        if index > 0 {
            let prev = self.spans[index - 1];
            let current = self.spans[index];
            if prev.is_free() && prev.end() == current.start() {
                self.spans[index - 1].extent =
                    Extent::from_bounds(prev.start(), current.end()).unwrap_or(prev.extent);
                self.spans.remove(index);
                index -= 1;
            }
        }
        index
    }

    /// Hand a previously carved `piece` back to the free spans.
    ///
    /// # Errors
    /// [`HeapError::Inconsistent`] if `piece` is not exactly an allocated span.
    pub fn release(&mut self, piece: Extent) -> Result<(), HeapError> {
        let index = self
            .span_index_at(piece.start())
            .ok_or(HeapError::Inconsistent(piece))?;
        let span = &mut self.spans[index];
        if span.is_free() || span.extent != piece {
            return Err(HeapError::Inconsistent(piece));
        }
        span.state = SpanState::Free;
        self.merge_adjacent(index);
        Ok(())
    }

    /// Give `[base, new_base)` away by moving the header behind it.
    ///
    /// `new_base` must lie inside the [head window](Self::head_window). The
    /// first span shrinks by the distance the header moved and disappears if
    /// nothing is left of it.
    ///
    /// # Errors
    /// [`HeapError::Inconsistent`] if the region has no head window or
    /// `new_base` lies outside of it.
    pub fn move_head(&mut self, new_base: u64) -> Result<HeadMove, HeapError> {
        let moved = Extent::from_bounds(self.base, new_base).unwrap_or_default();
        let window = self.head_window().ok_or(HeapError::Inconsistent(moved))?;
        if new_base <= window.start() || new_base > window.end() {
            return Err(HeapError::Inconsistent(moved));
        }

        let new_head =
            align_up(new_base, REGION_HEADER_ALIGN).ok_or(HeapError::Inconsistent(moved))?;
        let new_body = new_head + REGION_HEADER_SIZE;
        let first_end = self.spans[0].end();
        match Extent::from_bounds(new_body, first_end) {
            Some(rest) if !rest.is_empty() => self.spans[0].extent = rest,
            Some(_) => {
                self.spans.remove(0);
            }
            None => return Err(HeapError::Inconsistent(moved)),
        }

        let record = HeadMove {
            old_base: self.base,
            old_head: self.head,
            new_base,
            new_head,
        };
        self.base = new_base;
        self.head = new_head;
        Ok(record)
    }

    /// Undo a [`move_head`](Self::move_head).
    ///
    /// Header moves must be undone in reverse order of their application.
    ///
    /// # Errors
    /// [`HeapError::Inconsistent`] if `record` is not the most recent move.
    pub fn restore_head(&mut self, record: &HeadMove) -> Result<(), HeapError> {
        let moved = Extent::from_bounds(record.old_base, record.new_base).unwrap_or_default();
        if self.base != record.new_base || self.head != record.new_head {
            return Err(HeapError::Inconsistent(moved));
        }

        let reclaimed = Extent::from_bounds(
            record.old_head + REGION_HEADER_SIZE,
            record.new_head + REGION_HEADER_SIZE,
        )
        .ok_or(HeapError::Inconsistent(moved))?;

        self.base = record.old_base;
        self.head = record.old_head;
        if !reclaimed.is_empty() {
            self.spans.insert(0, Span::free(reclaimed));
            self.merge_adjacent(0);
        }
        Ok(())
    }

    /// First-fit allocation inside this region.
    pub(crate) fn allocate_first_fit(&mut self, size: u64, align: u64) -> Option<u64> {
        let found = self.spans.iter().enumerate().find_map(|(index, span)| {
            if !span.is_free() {
                return None;
            }
            let start = align_up(span.start(), align)?;
            let piece = Extent::new(start, size)?;
            span.extent.covers(piece).then_some((index, piece))
        });

        let (index, piece) = found?;
        self.split_at(index, piece).ok().map(|span| span.start())
    }

    /// Free the allocation starting at `addr`; returns its length.
    pub(crate) fn deallocate(&mut self, addr: u64) -> Result<u64, HeapError> {
        let span = self
            .span_index_at(addr)
            .map(|index| self.spans[index])
            .filter(|span| !span.is_free() && span.start() == addr)
            .ok_or(HeapError::UnknownAllocation(addr))?;
        self.release(span.extent)?;
        Ok(span.extent.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(start: u64, len: u64) -> Region {
        Region::new(RegionId(0), Extent::new(start, len).unwrap()).unwrap()
    }

    fn ext(start: u64, end: u64) -> Extent {
        Extent::from_bounds(start, end).unwrap()
    }

    #[test]
    fn new_region_has_one_free_body_span() {
        let r = region(0x1000, 0x1000);
        assert_eq!(r.head(), 0x1000);
        assert_eq!(r.body_start(), 0x1000 + REGION_HEADER_SIZE);
        assert_eq!(r.spans().len(), 1);
        assert_eq!(r.free_bytes(), 0x1000 - REGION_HEADER_SIZE);
    }

    #[test]
    fn split_leaves_two_residues_and_release_merges_them() {
        let mut r = region(0x1000, 0x1000);
        let before = r.clone();

        let span = r.split_at(0, ext(0x1400, 0x1800)).unwrap();
        assert_eq!(span.extent(), ext(0x1400, 0x1800));
        assert_eq!(r.spans().len(), 3);
        assert!(r.spans()[0].is_free());
        assert!(!r.spans()[1].is_free());
        assert!(r.spans()[2].is_free());

        r.release(ext(0x1400, 0x1800)).unwrap();
        assert_eq!(r, before);
    }

    #[test]
    fn split_at_span_edges_leaves_no_empty_residue() {
        let mut r = region(0x1000, 0x1000);
        let body = r.spans()[0].extent();
        r.split_at(0, ext(body.start(), 0x1800)).unwrap();
        assert_eq!(r.spans().len(), 2);
        r.split_at(1, ext(0x1800, body.end())).unwrap();
        assert_eq!(r.spans().len(), 2);
        assert_eq!(r.free_bytes(), 0);
    }

    #[test]
    fn split_rejects_pieces_outside_the_span() {
        let mut r = region(0x1000, 0x1000);
        assert!(r.split_at(0, ext(0x800, 0x1100)).is_err());
        assert!(r.split_at(1, ext(0x1100, 0x1200)).is_err());
    }

    #[test]
    fn merge_keeps_allocated_neighbours_apart() {
        let mut r = region(0x1000, 0x1000);
        r.split_at(0, ext(0x1100, 0x1200)).unwrap();
        r.split_at(2, ext(0x1200, 0x1300)).unwrap();
        r.release(ext(0x1100, 0x1200)).unwrap();
        // [body, 0x1200) free, [0x1200, 0x1300) allocated, [0x1300, end) free
        assert_eq!(r.spans().len(), 3);
        assert_eq!(r.spans()[0].end(), 0x1200);
    }

    #[test]
    fn head_move_round_trips() {
        let mut r = region(0x1000, 0x1000);
        let before = r.clone();
        let window = r.head_window().unwrap();
        assert_eq!(window.start(), 0x1000);
        assert_eq!(window.end(), 0x2000 - REGION_HEADER_SIZE);

        let record = r.move_head(0x1801).unwrap();
        assert_eq!(r.base(), 0x1801);
        assert_eq!(r.head(), 0x1810);
        assert_eq!(r.spans()[0].start(), 0x1810 + REGION_HEADER_SIZE);

        r.restore_head(&record).unwrap();
        assert_eq!(r, before);
    }

    #[test]
    fn head_move_to_window_end_consumes_first_span() {
        let mut r = region(0x1000, 0x1000);
        let window = r.head_window().unwrap();
        let before = r.clone();
        let record = r.move_head(window.end()).unwrap();
        assert!(r.spans().is_empty());
        assert_eq!(r.free_bytes(), 0);
        r.restore_head(&record).unwrap();
        assert_eq!(r, before);
    }

    #[test]
    fn no_head_window_behind_an_allocation() {
        let mut r = region(0x1000, 0x1000);
        let body = r.body_start();
        r.split_at(0, ext(body, body + 0x10)).unwrap();
        assert!(r.head_window().is_none());
        assert!(r.move_head(0x1100).is_err());
    }

    #[test]
    fn first_fit_respects_alignment() {
        let mut r = region(0x1000, 0x2000);
        let a = r.allocate_first_fit(0x100, 0x1000).unwrap();
        assert_eq!(a, 0x2000);
        let b = r.allocate_first_fit(0x10, 0x10).unwrap();
        assert_eq!(b, r.body_start());
        assert_eq!(r.deallocate(a).unwrap(), 0x100);
        assert!(r.deallocate(a).is_err());
    }
}
