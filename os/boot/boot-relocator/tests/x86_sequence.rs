mod common;

use boot_relocator::relocator::Relocator;
use boot_relocator_x86::{FORWARD_MOVER_SIZE, JUMPER_SIZE, X86CodeGenerator};
use common::*;

#[test]
fn emitted_code_moves_then_jumps() {
    let mut heap = heap_with(&[(0x100, 0x1000)]);
    let mut firmware = MockFirmware::new(&[(0x3000, 0x4000), (0x5000, 0x6000)]);
    let codegen = X86CodeGenerator;
    let mapper = ArenaMapper::new(0, 0x1_0000);

    let mut rel = Relocator::new(&mut heap, &mut firmware, &codegen, &mapper);
    rel.alloc_chunk_addr(pa(0x5000), 0x1000).unwrap();
    rel.alloc_chunk_addr(pa(0x2000), 0x1000).unwrap();
    assert_eq!(rel.relocators_size(), FORWARD_MOVER_SIZE + JUMPER_SIZE);

    let (code, len) = rel.prepare_relocs(pa(0x2000)).unwrap();
    assert_eq!(code.as_u64(), 0x100);
    assert_eq!(len, FORWARD_MOVER_SIZE + JUMPER_SIZE);

    let bytes = mapper.read(0x100, len);
    let (mover, jumper) = bytes.split_at(FORWARD_MOVER_SIZE);

    assert_eq!(&mover[0..2], &[0x48, 0xBE]);
    assert_eq!(&mover[2..10], &0x3000u64.to_le_bytes());
    assert_eq!(&mover[10..12], &[0x48, 0xBF]);
    assert_eq!(&mover[12..20], &0x2000u64.to_le_bytes());
    assert_eq!(&mover[20..22], &[0x48, 0xB9]);
    assert_eq!(&mover[22..30], &0x1000u64.to_le_bytes());
    assert_eq!(&mover[30..], &[0xFC, 0xF3, 0xA4]);

    assert_eq!(&jumper[0..2], &[0x48, 0xB8]);
    assert_eq!(&jumper[2..10], &0x2000u64.to_le_bytes());
    assert_eq!(&jumper[10..], &[0xFF, 0xE0]);

    rel.unload();
    assert!(firmware.reserved.is_empty());
}
