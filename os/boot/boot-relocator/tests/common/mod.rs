#![allow(dead_code)]

use boot_relocator::addresses::{Extent, PhysicalAddress};
use boot_relocator::codegen::{CodeGenerator, CodegenError, MoveDirection};
use boot_relocator::firmware::Firmware;
use boot_relocator::heap::{Heap, Region};
use boot_relocator::phys_mapper::PhysMapper;
use std::cell::{RefCell, UnsafeCell};

pub fn ext(start: u64, end: u64) -> Extent {
    Extent::from_bounds(start, end).unwrap()
}

pub fn pa(v: u64) -> PhysicalAddress {
    PhysicalAddress::new(v)
}

/// A heap with one region per extent.
pub fn heap_with(regions: &[(u64, u64)]) -> Heap {
    let mut heap = Heap::new();
    for &(start, end) in regions {
        heap.add_region(ext(start, end)).unwrap();
    }
    heap
}

pub fn snapshot(heap: &Heap) -> Vec<Region> {
    heap.regions().to_vec()
}

/// Firmware with a fixed set of reservable ranges.
#[derive(Debug, Default)]
pub struct MockFirmware {
    pub available: Vec<Extent>,
    pub reserved: Vec<Extent>,
    /// Reservations touching any of these are refused.
    pub refuse: Vec<Extent>,
    pub refusals: usize,
}

impl MockFirmware {
    pub fn new(available: &[(u64, u64)]) -> Self {
        Self {
            available: available.iter().map(|&(s, e)| ext(s, e)).collect(),
            ..Self::default()
        }
    }

    pub fn refusing(mut self, start: u64, end: u64) -> Self {
        self.refuse.push(ext(start, end));
        self
    }
}

impl Firmware for MockFirmware {
    fn max_event_count(&self) -> usize {
        2 * self.available.len()
    }

    fn list_reserved_blocks(&self, visit: &mut dyn FnMut(Extent)) {
        for &extent in &self.available {
            visit(extent);
        }
    }

    fn reserve(&mut self, extent: Extent) -> bool {
        if self.refuse.iter().any(|r| r.intersects(extent)) {
            self.refusals += 1;
            return false;
        }
        let inside = self.available.iter().any(|a| a.covers(extent));
        let taken = self.reserved.iter().any(|r| r.intersects(extent));
        if !inside || taken {
            return false;
        }
        self.reserved.push(extent);
        true
    }

    fn release(&mut self, extent: Extent) {
        let index = self
            .reserved
            .iter()
            .position(|r| *r == extent)
            .expect("released an extent that was never reserved");
        self.reserved.remove(index);
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Call {
    Mover {
        source: u64,
        target: u64,
        size: u64,
        direction: MoveDirection,
    },
    Jumper {
        entry: u64,
    },
    Sync {
        address: u64,
        size: u64,
    },
}

pub const MOCK_FORWARD_SIZE: usize = 4;
pub const MOCK_BACKWARD_SIZE: usize = 5;
pub const MOCK_JUMPER_SIZE: usize = 2;

/// Code generator that records what it was asked to emit.
#[derive(Debug, Default)]
pub struct RecordingCodegen {
    pub calls: RefCell<Vec<Call>>,
}

impl RecordingCodegen {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn movers(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Mover { .. }))
            .collect()
    }
}

impl CodeGenerator for RecordingCodegen {
    fn mover_stub_size(&self, direction: MoveDirection) -> usize {
        match direction {
            MoveDirection::Forward => MOCK_FORWARD_SIZE,
            MoveDirection::Backward => MOCK_BACKWARD_SIZE,
        }
    }

    fn emit_mover(
        &self,
        buffer: &mut [u8],
        source: PhysicalAddress,
        target: PhysicalAddress,
        size: u64,
        direction: MoveDirection,
    ) -> Result<(), CodegenError> {
        let n = self.mover_stub_size(direction);
        buffer[..n].fill(match direction {
            MoveDirection::Forward => 0xF0,
            MoveDirection::Backward => 0xB0,
        });
        self.calls.borrow_mut().push(Call::Mover {
            source: source.as_u64(),
            target: target.as_u64(),
            size,
            direction,
        });
        Ok(())
    }

    fn jumper_stub_size(&self) -> usize {
        MOCK_JUMPER_SIZE
    }

    fn emit_jumper(&self, buffer: &mut [u8], entry: PhysicalAddress) -> Result<(), CodegenError> {
        buffer[..MOCK_JUMPER_SIZE].fill(0xEE);
        self.calls.borrow_mut().push(Call::Jumper {
            entry: entry.as_u64(),
        });
        Ok(())
    }

    fn sync_caches(&self, address: PhysicalAddress, size: u64) -> Result<(), CodegenError> {
        self.calls.borrow_mut().push(Call::Sync {
            address: address.as_u64(),
            size,
        });
        Ok(())
    }
}

/// Backs the physical range `[base, base + len)` with host memory.
pub struct ArenaMapper {
    base: u64,
    memory: UnsafeCell<Box<[u8]>>,
}

impl ArenaMapper {
    pub fn new(base: u64, len: usize) -> Self {
        Self {
            base,
            memory: UnsafeCell::new(vec![0u8; len].into_boxed_slice()),
        }
    }

    pub fn read(&self, pa: u64, len: usize) -> Vec<u8> {
        let offset = usize::try_from(pa - self.base).unwrap();
        // SAFETY: tests only read after the relocator has finished writing.
        let memory = unsafe { &*self.memory.get() };
        memory[offset..offset + len].to_vec()
    }
}

impl PhysMapper for ArenaMapper {
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        let offset = pa.as_u64().wrapping_sub(self.base) as usize;
        // SAFETY: only the pointer is computed here; callers stay inside the arena.
        unsafe { (*self.memory.get()).as_mut_ptr().wrapping_add(offset) }
    }
}
