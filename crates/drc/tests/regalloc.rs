//! Register allocation over whole blocks: soundness on a mixed corpus and
//! retention of loop registers across the back edge.

use drc::{AllocConfig, IsaKind};
use drc_cfg::{DecodedBlock, ImageSource, Liveness, ScanConfig, scan_block};
use drc_ir::VReg;
use drc_ir::mips::gpr;
use drc_isa::encode::{mips, sh2};
use drc_regalloc::{Allocation, allocate};

const MIPS_BASE: u32 = 0x8000_0000;
const SH2_BASE: u32 = 0x0600_0000;

fn build(isa: IsaKind, bytes: &[u8], base: u32, config: &AllocConfig) -> (DecodedBlock, Allocation) {
    let src = ImageSource::new(base, bytes);
    let block = scan_block(isa, &src, base, &ScanConfig::default()).unwrap();
    let live = Liveness::analyze(&block, config.liveness_depth);
    let alloc = allocate(&block, &live, config);
    (block, alloc)
}

/// Every source is resident before its instruction and no slot is shared.
fn assert_sound(block: &DecodedBlock, alloc: &Allocation) {
    alloc.verify(block).unwrap();
    for (i, rec) in block.instrs.iter().enumerate() {
        if !rec.flushes_all() {
            let state = alloc.src_state(i);
            for r in rec.sources() {
                assert!(state.contains(r), "{r} not resident before {:#010x}", rec.addr);
            }
        }
        for st in [&alloc.regs[i].entry, &alloc.regs[i].cur] {
            let mapped: Vec<VReg> = st.map.iter().flatten().copied().collect();
            for (k, r) in mapped.iter().enumerate() {
                assert!(!mapped[k + 1..].contains(r), "{r} in two slots at {:#010x}", rec.addr);
            }
        }
    }
}

#[test]
fn test_mips_corpus_allocations_are_sound() {
    let programs: [&[u32]; 4] = [
        &[mips::addiu(2, 0, 5), mips::addu(3, 2, 4), mips::subu(5, 3, 2), mips::jr(31), mips::nop()],
        &[mips::lw(2, 4, 0), mips::sw(2, 4, 8), mips::ld(6, 4, 16), mips::daddu(7, 6, 6), mips::jr(31), mips::nop()],
        &[mips::div(4, 5), mips::mflo(2), mips::mfhi(3), mips::beq(2, 3, 1), mips::addiu(6, 0, 1), mips::jr(31), mips::nop()],
        &[mips::slt(2, 4, 5), mips::bnel(2, 0, 2), mips::sll(3, 4, 2), mips::or(6, 3, 2), mips::jal(0x40), mips::nop()],
    ];
    let config = AllocConfig::default();
    for words in programs {
        let (block, alloc) = build(IsaKind::Mips, &mips::assemble(words), MIPS_BASE, &config);
        assert_sound(&block, &alloc);
    }
}

#[test]
fn test_sh2_corpus_allocations_are_sound() {
    let programs: [&[u16]; 3] = [
        &[sh2::mov_imm(1, 5), sh2::add(2, 1), sh2::cmp_eq(1, 2), sh2::movt(3), sh2::rts(), sh2::nop()],
        &[sh2::mov_l_postinc(1, 4), sh2::mov_l_store(5, 1), sh2::mul_l(1, 5), sh2::sts_macl(0), sh2::rts(), sh2::nop()],
        &[sh2::tst(1, 1), sh2::bf(1), sh2::shll(2), sh2::extu_b(3, 2), sh2::jmp(3), sh2::nop()],
    ];
    let config = AllocConfig::default();
    for words in programs {
        let (block, alloc) = build(IsaKind::Sh2, &sh2::assemble(words), SH2_BASE, &config);
        assert_sound(&block, &alloc);
    }
}

#[test]
fn test_tight_mips_loop_keeps_counter_in_one_register() {
    // addiu r2, r2, 1; b start
    let words = [mips::addiu(2, 2, 1), mips::beq(0, 0, -2), mips::nop()];
    let (block, alloc) = build(IsaKind::Mips, &mips::assemble(&words), MIPS_BASE, &AllocConfig::default());
    assert_sound(&block, &alloc);
    assert_eq!(block.taken_index(1), Some(0));

    let pin = alloc.pins.iter().find(|p| p.reg == gpr(2)).unwrap();
    assert_eq!(pin.start, 0);
    assert_eq!(alloc.regs[0].cur.find(gpr(2)), Some(pin.slot));
    let back = alloc.regs[1].branch.as_ref().unwrap_or(&alloc.regs[1].cur);
    assert_eq!(back.find(gpr(2)), Some(pin.slot));
}

#[test]
fn test_tight_sh2_loop_keeps_counter_in_one_register() {
    // add #1, r1; bra start
    let words = [sh2::add_imm(1, 1), sh2::bra(-3), sh2::nop()];
    let (block, alloc) = build(IsaKind::Sh2, &sh2::assemble(&words), SH2_BASE, &AllocConfig::default());
    assert_sound(&block, &alloc);
    assert_eq!(block.taken_index(1), Some(0));

    let r1 = VReg::new(1);
    let pin = alloc.pins.iter().find(|p| p.reg == r1).unwrap();
    assert_eq!(alloc.regs[0].cur.find(r1), Some(pin.slot));
    let back = alloc.regs[1].branch.as_ref().unwrap_or(&alloc.regs[1].cur);
    assert_eq!(back.find(r1), Some(pin.slot));
}

#[test]
fn test_loop_retention_can_be_disabled() {
    let words = [mips::addiu(2, 2, 1), mips::beq(0, 0, -2), mips::nop()];
    let config = AllocConfig::default().with_loop_retention(false);
    let (block, alloc) = build(IsaKind::Mips, &mips::assemble(&words), MIPS_BASE, &config);
    assert_sound(&block, &alloc);
    assert!(alloc.pins.is_empty());
}
