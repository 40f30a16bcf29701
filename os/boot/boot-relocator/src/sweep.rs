//! # Event Sweep
//!
//! Finds free physical ranges by sweeping over interval boundaries.
//!
//! Every interval that matters for a placement contributes a start and an
//! end [`Event`]:
//!
//! | Class           | Interval                                   | Effect          |
//! |-----------------|--------------------------------------------|-----------------|
//! | `RegionHead`    | head window of a region                    | borrowable      |
//! | `RegionBody`    | a free span in a region body               | borrowable      |
//! | `FirmwareAvail` | memory the firmware could reserve          | borrowable      |
//! | `FirmwareBlock` | whole heap regions, held firmware blocks   | masks firmware  |
//! | `Collision`     | targets of registered chunks               | forbidden       |
//!
//! A position is *usable* when no collision is open and either a heap
//! interval is open, or a firmware interval is open without a firmware block
//! on top of it.
//!
//! Events are ordered with a stable start-before-end partition followed by an
//! LSD radix sort on the position, so equal positions keep starts in front of
//! ends. The sweep only looks at the nesting state once every event at a
//! position has been applied; touching intervals form one usable span.
//!
//! ## Scratch memory
//!
//! Heap events refer back into the region table by index. The heap must not
//! change while the sweep runs, so it is frozen for the scan and every buffer
//! the scan needs lives in a [`SweepScratch`] that is sized before the freeze.

use crate::addresses::{Extent, align_down, align_up};
use crate::heap::{Heap, HeapError, Region, RegionId};
use crate::layout::{RADIX_BITS, RADIX_BUCKETS, RADIX_PASSES};
use alloc::vec::Vec;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EventClass {
    RegionHead,
    RegionBody,
    FirmwareAvail,
    FirmwareBlock,
    Collision,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Edge {
    Start,
    End,
}

impl Edge {
    #[inline]
    #[must_use]
    pub const fn is_start(self) -> bool {
        matches!(self, Self::Start)
    }
}

/// Index back-reference from an event into the frozen heap's region table.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum EventRef {
    #[default]
    None,
    Region { region: usize },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Event {
    pub position: u64,
    pub class: EventClass,
    pub edge: Edge,
    pub origin: EventRef,
}

impl Event {
    const EMPTY: Self = Self {
        position: 0,
        class: EventClass::Collision,
        edge: Edge::Start,
        origin: EventRef::None,
    };
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SweepDirection {
    Ascending,
    Descending,
}

impl SweepDirection {
    #[inline]
    #[must_use]
    pub const fn is_ascending(self) -> bool {
        matches!(self, Self::Ascending)
    }
}

/// What a single scan looks for.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SweepRequest {
    /// Placements must lie inside this window.
    pub window: Extent,
    pub size: u64,
    /// Power of two.
    pub align: u64,
    pub direction: SweepDirection,
}

/// Where a piece of a found placement comes from.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PieceOrigin {
    /// Covers the start of the region; taken by moving the region header.
    RegionHead(RegionId),
    /// Inside a free span of the region body.
    RegionBody(RegionId),
    /// Memory to be reserved from the firmware.
    Firmware,
}

/// A maximal part of a placement with a single origin.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Piece {
    pub extent: Extent,
    pub origin: PieceOrigin,
}

/// Per-class nesting depth while sweeping.
#[derive(Debug, Default, Copy, Clone)]
struct Nesting {
    head: isize,
    body: isize,
    firmware_avail: isize,
    firmware_block: isize,
    collision: isize,
}

impl Nesting {
    fn apply(&mut self, event: &Event, direction: SweepDirection) {
        let delta = if event.edge.is_start() == direction.is_ascending() {
            1
        } else {
            -1
        };
        let counter = match event.class {
            EventClass::RegionHead => &mut self.head,
            EventClass::RegionBody => &mut self.body,
            EventClass::FirmwareAvail => &mut self.firmware_avail,
            EventClass::FirmwareBlock => &mut self.firmware_block,
            EventClass::Collision => &mut self.collision,
        };
        *counter += delta;
    }

    const fn usable(&self) -> bool {
        self.collision == 0
            && (self.head + self.body > 0 || (self.firmware_avail > 0 && self.firmware_block == 0))
    }
}

/// Buffers for one placement search.
pub struct SweepScratch {
    events: Vec<Event>,
    spare: Vec<Event>,
    counters: [usize; RADIX_BUCKETS],
    pieces: Vec<Piece>,
}

impl Default for SweepScratch {
    fn default() -> Self {
        Self::new()
    }
}

impl SweepScratch {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            events: Vec::new(),
            spare: Vec::new(),
            counters: [0; RADIX_BUCKETS],
            pieces: Vec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    #[inline]
    #[must_use]
    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    /// Reserve room for `additional` events.
    pub fn reserve(&mut self, additional: usize) {
        self.events.reserve(additional);
    }

    /// Add the start and end event of `extent`. Empty extents are ignored.
    pub fn push(&mut self, class: EventClass, extent: Extent, origin: EventRef) {
        if extent.is_empty() {
            return;
        }
        self.events.push(Event {
            position: extent.start(),
            class,
            edge: Edge::Start,
            origin,
        });
        self.events.push(Event {
            position: extent.end(),
            class,
            edge: Edge::End,
            origin,
        });
    }

    /// Size every buffer for the events `heap` will contribute.
    ///
    /// After this call, [`push_heap`](Self::push_heap), [`sort`](Self::sort)
    /// and [`compose`](Self::compose) do not allocate.
    pub fn prepare_for(&mut self, heap: &Heap) {
        let heap_events: usize = heap
            .regions()
            .iter()
            .map(|r| 2 + 2 * r.spans().len())
            .sum();
        self.events.reserve(heap_events);

        let total = self.events.len() + heap_events;
        self.spare.clear();
        self.spare.reserve(total);
        self.pieces.clear();
        self.pieces.reserve(total + 1);
    }

    /// Add the events of every region of the (frozen) heap.
    ///
    /// Each region blocks firmware memory over its whole extent. Its first
    /// free span is offered through the head window when one exists; all
    /// other free spans are offered as body memory.
    pub fn push_heap(&mut self, heap: &Heap) {
        for (index, region) in heap.regions().iter().enumerate() {
            let origin = EventRef::Region { region: index };
            self.push(EventClass::FirmwareBlock, region.extent(), origin);

            let head = region.head_window();
            for (position, span) in region.spans().iter().enumerate() {
                if !span.is_free() {
                    continue;
                }
                match head {
                    Some(window) if position == 0 => {
                        self.push(EventClass::RegionHead, window, origin);
                    }
                    _ => self.push(EventClass::RegionBody, span.extent(), origin),
                }
            }
        }
    }

    /// Order events by position, starts before ends at equal positions.
    #[allow(clippy::cast_possible_truncation)]
    pub fn sort(&mut self) {
        let len = self.events.len();

        self.spare.clear();
        self.spare
            .extend(self.events.iter().filter(|e| e.edge.is_start()).copied());
        self.spare
            .extend(self.events.iter().filter(|e| !e.edge.is_start()).copied());
        core::mem::swap(&mut self.events, &mut self.spare);

        for pass in 0..RADIX_PASSES {
            let shift = pass * RADIX_BITS;
            let digit = |e: &Event| ((e.position >> shift) as usize) & (RADIX_BUCKETS - 1);

            self.counters.fill(0);
            for e in &self.events {
                self.counters[digit(e)] += 1;
            }
            if self.counters.contains(&len) {
                // Every event shares this digit.
                continue;
            }

            let mut offset = 0;
            for count in &mut self.counters {
                let n = *count;
                *count = offset;
                offset += n;
            }

            self.spare.clear();
            self.spare.resize(len, Event::EMPTY);
            for e in &self.events {
                let slot = &mut self.counters[digit(e)];
                self.spare[*slot] = *e;
                *slot += 1;
            }
            core::mem::swap(&mut self.events, &mut self.spare);
        }
    }

    /// Scan the sorted events for a placement; returns the target extent.
    #[must_use]
    pub fn find(&self, request: &SweepRequest) -> Option<Extent> {
        let size = request.size;
        let align = request.align;
        let start = align_up(request.window.start().max(1), align)?;
        let last = align_down(request.window.end().checked_sub(size)?, align);
        if size == 0 || last < start {
            return None;
        }

        let direction = request.direction;
        let events = &self.events;
        let mut nesting = Nesting::default();
        let mut usable = false;
        let mut entered = 0;

        for k in 0..events.len() {
            let i = if direction.is_ascending() {
                k
            } else {
                events.len() - 1 - k
            };
            let event = &events[i];
            nesting.apply(event, direction);

            // Settle every event at this position before looking at the state.
            let next = if direction.is_ascending() {
                events.get(i + 1)
            } else {
                i.checked_sub(1).and_then(|j| events.get(j))
            };
            if next.is_some_and(|e| e.position == event.position) {
                continue;
            }

            let was = core::mem::replace(&mut usable, nesting.usable());
            match (was, usable) {
                (false, true) => entered = event.position,
                (true, false) => {
                    let target = match direction {
                        SweepDirection::Ascending => {
                            fit_ascending(entered, event.position, start, last, size, align)
                        }
                        SweepDirection::Descending => {
                            fit_descending(event.position, entered, start, last, size, align)
                        }
                    };
                    if let Some(target) = target {
                        return Extent::new(target, size);
                    }
                }
                _ => {}
            }
        }
        None
    }

    /// Split a found `target` into pieces of a single origin.
    ///
    /// Walks the gaps between event positions in ascending order and
    /// classifies each gap that intersects the target. Neighbouring gaps with
    /// the same origin are merged.
    ///
    /// # Errors
    /// [`HeapError::Inconsistent`] if part of the target is not usable.
    pub fn compose(&mut self, regions: &[Region], target: Extent) -> Result<(), HeapError> {
        self.pieces.clear();

        let mut nesting = Nesting::default();
        let mut head = None;
        let mut body = None;

        for (i, event) in self.events.iter().enumerate() {
            nesting.apply(event, SweepDirection::Ascending);
            match (event.class, event.edge, event.origin) {
                (EventClass::RegionHead, Edge::Start, EventRef::Region { region }) => {
                    head = Some(region);
                }
                (EventClass::RegionHead, Edge::End, EventRef::Region { region })
                    if head == Some(region) =>
                {
                    head = None;
                }
                (EventClass::RegionBody, Edge::Start, EventRef::Region { region }) => {
                    body = Some(region);
                }
                (EventClass::RegionBody, Edge::End, EventRef::Region { region })
                    if body == Some(region) =>
                {
                    body = None;
                }
                _ => {}
            }

            let Some(next) = self.events.get(i + 1).map(|e| e.position) else {
                break;
            };
            if event.position >= target.end() {
                break;
            }
            let gap = Extent::from_bounds(
                event.position.max(target.start()),
                next.min(target.end()),
            );
            let Some(gap) = gap.filter(|g| !g.is_empty()) else {
                continue;
            };

            let origin = Self::classify(&nesting, regions, head, body, gap)
                .ok_or(HeapError::Inconsistent(gap))?;
            Self::push_piece(&mut self.pieces, Piece { extent: gap, origin });
        }

        let covered: u64 = self.pieces.iter().map(|p| p.extent.len()).sum();
        let starts_right = self
            .pieces
            .first()
            .is_some_and(|p| p.extent.start() == target.start());
        if covered != target.len() || !starts_right {
            return Err(HeapError::Inconsistent(target));
        }
        Ok(())
    }

    fn classify(
        nesting: &Nesting,
        regions: &[Region],
        head: Option<usize>,
        body: Option<usize>,
        gap: Extent,
    ) -> Option<PieceOrigin> {
        if nesting.collision > 0 {
            return None;
        }
        if nesting.head > 0 {
            let region = regions.get(head?)?;
            return Some(if gap.start() < region.body_start() {
                PieceOrigin::RegionHead(region.id())
            } else {
                PieceOrigin::RegionBody(region.id())
            });
        }
        if nesting.body > 0 {
            return regions
                .get(body?)
                .map(|region| PieceOrigin::RegionBody(region.id()));
        }
        (nesting.firmware_avail > 0 && nesting.firmware_block == 0)
            .then_some(PieceOrigin::Firmware)
    }

    fn push_piece(pieces: &mut Vec<Piece>, piece: Piece) {
        if let Some(last) = pieces.last_mut() {
            let touching = last.extent.end() == piece.extent.start();
            let same = match (last.origin, piece.origin) {
                (a, b) if a == b => true,
                // The header move takes everything up to the end of the piece.
                (PieceOrigin::RegionHead(a), PieceOrigin::RegionBody(b)) => a == b,
                _ => false,
            };
            if touching
                && same
                && let Some(merged) = Extent::from_bounds(last.extent.start(), piece.extent.end())
            {
                last.extent = merged;
                return;
            }
        }
        pieces.push(piece);
    }
}

/// Lowest aligned target inside the usable span `[low, high)` and the window.
fn fit_ascending(low: u64, high: u64, start: u64, last: u64, size: u64, align: u64) -> Option<u64> {
    let target = align_up(low, align)?.max(start);
    (target <= last && target.checked_add(size)? <= high).then_some(target)
}

/// Highest aligned target inside the usable span `[low, high)` and the window.
fn fit_descending(low: u64, high: u64, start: u64, last: u64, size: u64, align: u64) -> Option<u64> {
    let target = align_down(high.checked_sub(size)?, align).min(last);
    (target >= start && target >= low).then_some(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::REGION_HEADER_SIZE;

    fn ext(start: u64, end: u64) -> Extent {
        Extent::from_bounds(start, end).unwrap()
    }

    fn request(start: u64, end: u64, size: u64, align: u64, direction: SweepDirection) -> SweepRequest {
        SweepRequest {
            window: ext(start, end),
            size,
            align,
            direction,
        }
    }

    fn firmware_only(avail: &[(u64, u64)], collisions: &[(u64, u64)]) -> SweepScratch {
        let mut scratch = SweepScratch::new();
        for &(s, e) in avail {
            scratch.push(EventClass::FirmwareAvail, ext(s, e), EventRef::None);
        }
        for &(s, e) in collisions {
            scratch.push(EventClass::Collision, ext(s, e), EventRef::None);
        }
        scratch.prepare_for(&Heap::new());
        scratch.sort();
        scratch
    }

    #[test]
    fn radix_sort_orders_positions_and_keeps_starts_first() {
        let mut scratch = SweepScratch::new();
        scratch.push(EventClass::FirmwareAvail, ext(0x3000, 0x1_0000_2000), EventRef::None);
        scratch.push(EventClass::Collision, ext(0x1000, 0x3000), EventRef::None);
        scratch.push(EventClass::FirmwareBlock, ext(0x1_0000_2000, 0x1_0000_2100), EventRef::None);
        scratch.push(EventClass::Collision, ext(0x7f, 0x1000), EventRef::None);
        scratch.prepare_for(&Heap::new());
        scratch.sort();

        let events = scratch.events();
        assert!(events.windows(2).all(|w| w[0].position <= w[1].position));
        for w in events.windows(2) {
            if w[0].position == w[1].position {
                assert!(w[0].edge.is_start() || !w[1].edge.is_start());
            }
        }
        assert_eq!(events.first().unwrap().position, 0x7f);
        assert_eq!(events.last().unwrap().position, 0x1_0000_2100);
    }

    #[test]
    fn sweep_direction_selects_the_end_of_the_window() {
        let scratch = firmware_only(&[(0x1000, 0x3000), (0x8000, 0xA000)], &[]);
        let low = scratch.find(&request(0, 0x10_0000, 0x1000, 0x1000, SweepDirection::Ascending));
        let high = scratch.find(&request(0, 0x10_0000, 0x1000, 0x1000, SweepDirection::Descending));
        assert_eq!(low, Some(ext(0x1000, 0x2000)));
        assert_eq!(high, Some(ext(0x9000, 0xA000)));
    }

    #[test]
    fn collisions_and_blocks_are_avoided() {
        let scratch = firmware_only(&[(0x1000, 0x9000)], &[(0x1000, 0x4800)]);
        let found = scratch.find(&request(0, 0x10_0000, 0x1000, 0x1000, SweepDirection::Ascending));
        assert_eq!(found, Some(ext(0x5000, 0x6000)));

        let mut blocked = SweepScratch::new();
        blocked.push(EventClass::FirmwareAvail, ext(0x1000, 0x3000), EventRef::None);
        blocked.push(EventClass::FirmwareBlock, ext(0x1000, 0x3000), EventRef::None);
        blocked.prepare_for(&Heap::new());
        blocked.sort();
        assert_eq!(
            blocked.find(&request(0, 0x10_0000, 0x10, 1, SweepDirection::Ascending)),
            None
        );
    }

    #[test]
    fn window_is_respected() {
        let scratch = firmware_only(&[(0x1000, 0x9000)], &[]);
        let found = scratch.find(&request(0x2100, 0x4000, 0x1000, 0x1000, SweepDirection::Ascending));
        assert_eq!(found, Some(ext(0x3000, 0x4000)));
        let found = scratch.find(&request(0x2100, 0x4fff, 0x1000, 0x1000, SweepDirection::Descending));
        assert_eq!(found, Some(ext(0x3000, 0x4000)));
        assert_eq!(
            scratch.find(&request(0x2100, 0x3fff, 0x1000, 0x1000, SweepDirection::Ascending)),
            None
        );
    }

    #[test]
    fn address_zero_is_never_returned() {
        let scratch = firmware_only(&[(0, 0x4000)], &[]);
        let found = scratch.find(&request(0, 0x4000, 0x10, 0x1000, SweepDirection::Ascending));
        assert_eq!(found, Some(ext(0x1000, 0x1010)));
    }

    #[test]
    fn touching_firmware_ranges_form_one_usable_span() {
        let scratch = firmware_only(&[(0x1000, 0x2000), (0x2000, 0x3000)], &[]);
        let found = scratch.find(&request(0, 0x10_0000, 0x2000, 1, SweepDirection::Ascending));
        assert_eq!(found, Some(ext(0x1000, 0x3000)));
    }

    #[test]
    fn heap_region_composes_into_head_and_firmware_pieces() {
        let mut heap = Heap::new();
        heap.add_region(ext(0x4000, 0x8000)).unwrap();
        let id = heap.regions()[0].id();

        let mut scratch = SweepScratch::new();
        scratch.push(EventClass::FirmwareAvail, ext(0x1000, 0x4000), EventRef::None);
        scratch.prepare_for(&heap);
        scratch.push_heap(&heap);
        scratch.sort();

        let target = scratch
            .find(&request(0x3000, 0x10_0000, 0x2000, 0x1000, SweepDirection::Ascending))
            .unwrap();
        assert_eq!(target, ext(0x3000, 0x5000));

        scratch.compose(heap.regions(), target).unwrap();
        assert_eq!(
            scratch.pieces(),
            &[
                Piece {
                    extent: ext(0x3000, 0x4000),
                    origin: PieceOrigin::Firmware
                },
                Piece {
                    extent: ext(0x4000, 0x5000),
                    origin: PieceOrigin::RegionHead(id)
                },
            ]
        );
    }

    #[test]
    fn body_pieces_start_behind_the_header() {
        let mut heap = Heap::new();
        heap.add_region(ext(0x4000, 0x8000)).unwrap();
        let id = heap.regions()[0].id();

        let mut scratch = SweepScratch::new();
        scratch.prepare_for(&heap);
        scratch.push_heap(&heap);
        scratch.sort();

        let start = 0x4000 + REGION_HEADER_SIZE;
        let target = ext(start, start + 0x100);
        scratch.compose(heap.regions(), target).unwrap();
        assert_eq!(scratch.pieces().len(), 1);
        assert_eq!(scratch.pieces()[0].origin, PieceOrigin::RegionBody(id));
    }

    #[test]
    fn body_gaps_behind_a_head_gap_join_the_head_piece() {
        let mut heap = Heap::new();
        heap.add_region(ext(0x4000, 0x8000)).unwrap();
        let id = heap.regions()[0].id();

        // Splits the head window into a gap before and a gap behind the header.
        let mut scratch = SweepScratch::new();
        scratch.push(EventClass::FirmwareAvail, ext(0x4030, 0x5000), EventRef::None);
        scratch.prepare_for(&heap);
        scratch.push_heap(&heap);
        scratch.sort();

        scratch.compose(heap.regions(), ext(0x4000, 0x4100)).unwrap();
        assert_eq!(
            scratch.pieces(),
            &[Piece {
                extent: ext(0x4000, 0x4100),
                origin: PieceOrigin::RegionHead(id)
            }]
        );
    }

    #[test]
    fn composing_unusable_memory_is_reported() {
        let mut scratch = firmware_only(&[(0x1000, 0x2000)], &[]);
        assert!(scratch.compose(&[], ext(0x1800, 0x2800)).is_err());
    }
}
