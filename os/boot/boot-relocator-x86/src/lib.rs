//! # x86-64 Relocator Stubs
//!
//! Machine code for the relocation sequence on x86-64, run with paging set
//! up as identity mapping (or disabled) and interrupts off.
//!
//! ## Forward mover (33 bytes)
//!
//! ```asm
//! mov rsi, src            ; 48 BE imm64
//! mov rdi, dst            ; 48 BF imm64
//! mov rcx, len            ; 48 B9 imm64
//! cld                     ; FC
//! rep movsb               ; F3 A4
//! ```
//!
//! ## Backward mover (34 bytes)
//!
//! ```asm
//! mov rsi, src + len - 1  ; 48 BE imm64
//! mov rdi, dst + len - 1  ; 48 BF imm64
//! mov rcx, len            ; 48 B9 imm64
//! std                     ; FD
//! rep movsb               ; F3 A4
//! cld                     ; FC
//! ```
//!
//! ## Jumper (12 bytes)
//!
//! ```asm
//! mov rax, entry          ; 48 B8 imm64
//! jmp rax                 ; FF E0
//! ```
//!
//! Instruction fetch is coherent with data writes on x86, so cache
//! synchronization is a no-op.

#![cfg_attr(not(any(test, doctest)), no_std)]

use boot_relocator::addresses::PhysicalAddress;
use boot_relocator::codegen::{CodeGenerator, CodegenError, MoveDirection};

const MOV_RSI_IMM64: [u8; 2] = [0x48, 0xBE];
const MOV_RDI_IMM64: [u8; 2] = [0x48, 0xBF];
const MOV_RCX_IMM64: [u8; 2] = [0x48, 0xB9];
const MOV_RAX_IMM64: [u8; 2] = [0x48, 0xB8];
const JMP_RAX: [u8; 2] = [0xFF, 0xE0];
const CLD: u8 = 0xFC;
const STD: u8 = 0xFD;
const REP_MOVSB: [u8; 2] = [0xF3, 0xA4];

/// Size of a `mov r64, imm64`.
const MOV_IMM64_SIZE: usize = 10;

pub const FORWARD_MOVER_SIZE: usize = 3 * MOV_IMM64_SIZE + 1 + 2;
pub const BACKWARD_MOVER_SIZE: usize = 3 * MOV_IMM64_SIZE + 1 + 2 + 1;
pub const JUMPER_SIZE: usize = MOV_IMM64_SIZE + 2;

const _: () = {
    assert!(FORWARD_MOVER_SIZE == 33);
    assert!(BACKWARD_MOVER_SIZE == 34);
    assert!(JUMPER_SIZE == 12);
};

/// Code generator for x86-64 (long mode, flat addressing).
#[derive(Debug, Default, Copy, Clone)]
pub struct X86CodeGenerator;

impl CodeGenerator for X86CodeGenerator {
    fn mover_stub_size(&self, direction: MoveDirection) -> usize {
        match direction {
            MoveDirection::Forward => FORWARD_MOVER_SIZE,
            MoveDirection::Backward => BACKWARD_MOVER_SIZE,
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
        let mut out = Emitter::new(buffer, self.mover_stub_size(direction))?;
        match direction {
            MoveDirection::Forward => {
                out.mov_imm64(MOV_RSI_IMM64, source.as_u64());
                out.mov_imm64(MOV_RDI_IMM64, target.as_u64());
                out.mov_imm64(MOV_RCX_IMM64, size);
                out.byte(CLD);
                out.bytes(&REP_MOVSB);
            }
            MoveDirection::Backward => {
                let last = size.saturating_sub(1);
                let src_last = source
                    .checked_add(last)
                    .ok_or(CodegenError::AddressNotEncodable(source))?;
                let dst_last = target
                    .checked_add(last)
                    .ok_or(CodegenError::AddressNotEncodable(target))?;
                out.mov_imm64(MOV_RSI_IMM64, src_last.as_u64());
                out.mov_imm64(MOV_RDI_IMM64, dst_last.as_u64());
                out.mov_imm64(MOV_RCX_IMM64, size);
                out.byte(STD);
                out.bytes(&REP_MOVSB);
                out.byte(CLD);
            }
        }
        log::trace!("{direction:?} mover {source} -> {target} ({size:#x} bytes)");
        Ok(())
    }

    fn jumper_stub_size(&self) -> usize {
        JUMPER_SIZE
    }

    fn emit_jumper(&self, buffer: &mut [u8], entry: PhysicalAddress) -> Result<(), CodegenError> {
        let mut out = Emitter::new(buffer, JUMPER_SIZE)?;
        out.mov_imm64(MOV_RAX_IMM64, entry.as_u64());
        out.bytes(&JMP_RAX);
        Ok(())
    }

    fn sync_caches(&self, _address: PhysicalAddress, _size: u64) -> Result<(), CodegenError> {
        Ok(())
    }
}

/// Writes a stub of known size into the front of a buffer.
struct Emitter<'b> {
    buffer: &'b mut [u8],
    at: usize,
}

impl<'b> Emitter<'b> {
    fn new(buffer: &'b mut [u8], needed: usize) -> Result<Self, CodegenError> {
        if buffer.len() < needed {
            return Err(CodegenError::BufferTooSmall {
                needed,
                available: buffer.len(),
            });
        }
        Ok(Self { buffer, at: 0 })
    }

    fn byte(&mut self, b: u8) {
        self.buffer[self.at] = b;
        self.at += 1;
    }

    fn bytes(&mut self, bs: &[u8]) {
        self.buffer[self.at..self.at + bs.len()].copy_from_slice(bs);
        self.at += bs.len();
    }

    fn mov_imm64(&mut self, opcode: [u8; 2], imm: u64) {
        self.bytes(&opcode);
        self.bytes(&imm.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pa(v: u64) -> PhysicalAddress {
        PhysicalAddress::new(v)
    }

    #[test]
    fn forward_mover_encoding() {
        let mut buf = [0u8; FORWARD_MOVER_SIZE];
        X86CodeGenerator
            .emit_mover(&mut buf, pa(0x3000), pa(0x2000), 0x1000, MoveDirection::Forward)
            .unwrap();

        assert_eq!(&buf[0..2], &[0x48, 0xBE]);
        assert_eq!(&buf[2..10], &0x3000u64.to_le_bytes());
        assert_eq!(&buf[10..12], &[0x48, 0xBF]);
        assert_eq!(&buf[12..20], &0x2000u64.to_le_bytes());
        assert_eq!(&buf[20..22], &[0x48, 0xB9]);
        assert_eq!(&buf[22..30], &0x1000u64.to_le_bytes());
        assert_eq!(&buf[30..], &[0xFC, 0xF3, 0xA4]);
    }

    #[test]
    fn backward_mover_starts_at_the_last_byte() {
        let mut buf = [0u8; BACKWARD_MOVER_SIZE];
        X86CodeGenerator
            .emit_mover(&mut buf, pa(0x1000), pa(0x1800), 0x1000, MoveDirection::Backward)
            .unwrap();

        assert_eq!(&buf[2..10], &0x1fffu64.to_le_bytes());
        assert_eq!(&buf[12..20], &0x27ffu64.to_le_bytes());
        assert_eq!(&buf[22..30], &0x1000u64.to_le_bytes());
        assert_eq!(&buf[30..], &[0xFD, 0xF3, 0xA4, 0xFC]);
    }

    #[test]
    fn jumper_encoding() {
        let mut buf = [0u8; JUMPER_SIZE];
        X86CodeGenerator
            .emit_jumper(&mut buf, pa(0xFFFF_8000_0010_0000))
            .unwrap();
        assert_eq!(&buf[0..2], &[0x48, 0xB8]);
        assert_eq!(&buf[2..10], &0xFFFF_8000_0010_0000u64.to_le_bytes());
        assert_eq!(&buf[10..], &[0xFF, 0xE0]);
    }

    #[test]
    fn short_buffers_are_rejected() {
        let mut buf = [0u8; JUMPER_SIZE - 1];
        assert_eq!(
            X86CodeGenerator.emit_jumper(&mut buf, pa(0x1000)),
            Err(CodegenError::BufferTooSmall {
                needed: JUMPER_SIZE,
                available: JUMPER_SIZE - 1
            })
        );
    }

    #[test]
    fn stub_sizes() {
        let g = X86CodeGenerator;
        assert_eq!(g.mover_stub_size(MoveDirection::Forward), 33);
        assert_eq!(g.mover_stub_size(MoveDirection::Backward), 34);
        assert_eq!(g.jumper_stub_size(), 12);
    }
}
