//! # Boot Relocator
//!
//! Physical memory relocation for a bootloader: load the pieces of a kernel
//! image wherever memory is free *now*, then move each piece to the address
//! the kernel expects right before jumping into it.
//!
//! ## Overview
//!
//! The final firmware memory map is only known at boot time, and the memory
//! a kernel wants may be occupied by the loader itself. The relocator
//! therefore separates every allocation into a **source** (where the loader
//! writes) and a **target** (where the bytes must be when the kernel runs).
//!
//! | Component | Module | Role |
//! |-----------|--------|------|
//! | Heap snapshot | [`heap`] | The loader's allocator, borrowed and healed again. |
//! | Event sweep | [`sweep`] | Finds free ranges from interval boundaries. |
//! | Placement search | [`placement`] | Window, alignment and preference policies. |
//! | Committer | [`commit`] | Carves placements out of regions and firmware, and undoes it. |
//! | Registry | [`relocator`] | Chunks, high-water marks, relocation code size. |
//! | Sequencer | [`sequencer`] | Emits movers and the final jump. |
//!
//! Collaborators the relocator does not implement itself are traits:
//! [`Firmware`](firmware::Firmware) (memory enumeration and reservation),
//! [`CodeGenerator`](codegen::CodeGenerator) (mover and jumper stubs) and
//! [`PhysMapper`](phys_mapper::PhysMapper) (physical memory access).
//!
//! ## Typical Usage
//!
//! ```text
//! let mut rel = Relocator::new(&mut heap, &mut firmware, &codegen, &mapper);
//! let src = rel.alloc_chunk_addr(kernel_target, kernel_size)?;   // fill src
//! let (src, tgt) = rel.alloc_chunk_align(min, max, size, 0x1000, Preference::High)?;
//! let (code, len) = rel.prepare_relocs(kernel_entry)?;
//! // exit boot services, jump to `code`
//! ```
//!
//! ## Design Notes
//!
//! - Single-threaded. Scans freeze the heap ([`heap::FrozenHeap`]) because
//!   sweep events refer into heap tables by index.
//! - Target ranges of the chunks in one relocator are pairwise disjoint.
//! - Teardown is exact: after [`Relocator::unload`] every region has the free
//!   bytes and spans it had before, and every firmware block is released.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod addresses;
pub mod chunk;
pub mod codegen;
pub mod commit;
pub mod error;
pub mod firmware;
pub mod heap;
pub mod layout;
pub mod phys_mapper;
pub mod placement;
pub mod relocator;
pub mod sequencer;
pub mod sweep;

pub use addresses::{Extent, PhysicalAddress};
pub use chunk::Chunk;
pub use codegen::{CodeGenerator, CodegenError, MoveDirection};
pub use error::RelocatorError;
pub use firmware::{Firmware, FirmwareBlock, NoFirmware};
pub use heap::{Heap, HeapError};
pub use phys_mapper::{IdentityPhysMapper, PhysMapper};
pub use placement::Preference;
pub use relocator::Relocator;
