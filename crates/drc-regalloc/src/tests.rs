use drc_cfg::{DecodedBlock, ImageSource, Liveness, ScanConfig, scan_block};
use drc_ir::mips::{HI, LO, gpr};
use drc_ir::{BTREG, CCREG, HOST_CCREG, HOST_DIV_HI, HOST_DIV_LO, RegState, sh2 as sh2_regs};
use drc_isa::IsaKind;
use drc_isa::encode::{mips, sh2};

use super::*;

const BASE: u32 = 0x8000_4000;

fn alloc_words(isa: IsaKind, bytes: &[u8], base: u32, config: &AllocConfig) -> (DecodedBlock, Liveness, Allocation) {
    let src = ImageSource::new(base, bytes);
    let block = scan_block(isa, &src, base, &ScanConfig::default()).unwrap();
    let live = Liveness::analyze(&block, config.liveness_depth);
    let alloc = allocate(&block, &live, config);
    alloc.verify(&block).unwrap();
    (block, live, alloc)
}

fn alloc_mips(words: &[u32], config: &AllocConfig) -> (DecodedBlock, Liveness, Allocation) {
    alloc_words(IsaKind::Mips, &mips::assemble(words), BASE, config)
}

/// Edge from the backward branch at `b` to its loop head.
fn back_edge(block: &DecodedBlock, live: &Liveness, alloc: &Allocation, b: usize) -> TransitionPlan {
    let t = block.taken_index(b).unwrap();
    let from = alloc.regs[b].branch.as_ref().unwrap();
    let needed = |r: VReg| {
        let mask = if r.is_upper() { live.before_upper[t] } else { live.before[t] };
        mask & r.bit() == 0
    };
    plan_transition(from, &alloc.regs[t].entry, needed, alloc.wide)
}

#[test]
fn test_sources_use_preferred_slots() {
    let (_, _, alloc) = alloc_mips(&[mips::addu(2, 5, 6), mips::jr(31), mips::nop()], &AllocConfig::default());
    let stat = &alloc.regs[0];
    assert_eq!(stat.src_slot(gpr(5)), Some(5));
    assert_eq!(stat.src_slot(gpr(6)), Some(6));
    assert_eq!(stat.cur.find(gpr(2)), Some(2));
    assert!(stat.cur.is_dirty(2));
    // r3 would land on the cycle counter's slot
    let (_, _, alloc) = alloc_mips(&[mips::addiu(3, 0, 1), mips::jr(31), mips::nop()], &AllocConfig::default());
    assert_eq!(alloc.regs[0].cur.find(gpr(3)), Some(HOST_CCREG + 1));
    assert_eq!(alloc.regs[0].cur.find(CCREG), Some(HOST_CCREG));
}

#[test]
fn test_preference_is_configurable() {
    let config = AllocConfig::default().with_preference(1, 3);
    let (_, _, alloc) = alloc_mips(&[mips::addiu(2, 0, 1), mips::jr(31), mips::nop()], &config);
    assert_eq!(alloc.regs[0].cur.find(gpr(2)), Some(5));
}

#[test]
fn test_overwritten_value_is_released() {
    let (_, _, alloc) = alloc_mips(
        &[mips::addiu(2, 0, 1), mips::addiu(2, 0, 2), mips::jr(31), mips::nop()],
        &AllocConfig::default(),
    );
    assert!(alloc.regs[0].cur.contains(gpr(2)));
    assert!(!alloc.regs[1].pre.contains(gpr(2)));
}

#[test]
fn test_constants_are_tracked() {
    let (_, _, alloc) = alloc_mips(
        &[mips::lui(4, 0x8001), mips::addiu(4, 4, 0x10), mips::jr(31), mips::nop()],
        &AllocConfig::default(),
    );
    assert_eq!(alloc.regs[0].cur.const_value(gpr(4)), Some(0xffff_ffff_8001_0000));
    assert_eq!(alloc.regs[1].cur.const_value(gpr(4)), Some(0xffff_ffff_8001_0010));
}

#[test]
fn test_eviction_prefers_value_not_needed_soon() {
    let mut words: Vec<u32> = (1..=11).map(|r| mips::addiu(r, 0, 1)).collect();
    words.push(mips::addiu(12, 0, 1));
    for pair in [(1, 2), (3, 4), (5, 6), (7, 8), (9, 10)] {
        words.push(mips::addu(13, pair.0, pair.1));
    }
    words.extend([mips::jr(31), mips::nop()]);
    let (_, _, alloc) = alloc_mips(&words, &AllocConfig::default());
    let full = &alloc.regs[10].cur;
    assert_eq!(full.free_count(), 0);
    let victim = full.find(gpr(11)).unwrap();
    assert_eq!(alloc.regs[11].cur.find(gpr(12)), Some(victim));
    assert!(!alloc.regs[11].cur.contains(gpr(11)));
}

#[test]
fn test_divide_results_use_fixed_slots() {
    let (_, _, alloc) = alloc_mips(
        &[mips::div(4, 5), mips::mflo(2), mips::jr(31), mips::nop()],
        &AllocConfig::default(),
    );
    assert_eq!(alloc.regs[0].cur.find(LO), Some(HOST_DIV_LO));
    assert_eq!(alloc.regs[0].cur.find(HI), Some(HOST_DIV_HI));
}

#[test]
fn test_delay_slot_keeps_branch_operands() {
    let (_, _, alloc) = alloc_mips(
        &[mips::beq(2, 3, 3), mips::addiu(4, 0, 1), mips::jr(31), mips::nop()],
        &AllocConfig::default(),
    );
    let branch = &alloc.regs[0].cur;
    let ds = &alloc.regs[1].cur;
    for r in [gpr(2), gpr(3)] {
        assert!(branch.contains(r));
        assert_eq!(branch.find(r), ds.find(r));
    }
    assert_eq!(alloc.regs[0].branch.as_ref(), Some(ds));
}

#[test]
fn test_clobbering_slot_captures_condition() {
    let (block, _, alloc) = alloc_mips(
        &[mips::beq(2, 3, 3), mips::addiu(2, 0, 0), mips::jr(31), mips::nop()],
        &AllocConfig::default(),
    );
    assert!(block.instrs[0].ds_clobbers);
    let bt = alloc.regs[0].cur.find(BTREG).unwrap();
    assert_eq!(alloc.regs[1].cur.find(BTREG), Some(bt));
    // the captured condition is dead once the branch leaves the block
    assert_ne!(alloc.regs[0].taken_dead & (1 << bt), 0);
    assert_eq!(alloc.regs[0].taken_dead & (1 << HOST_CCREG), 0);
}

#[test]
fn test_interpreted_instruction_flushes_everything() {
    let (_, _, alloc) = alloc_mips(
        &[mips::addiu(5, 0, 1), mips::special(2, 3, 0, 0, 28), mips::addu(6, 5, 5), mips::jr(31), mips::nop()],
        &AllocConfig::default(),
    );
    assert_eq!(alloc.regs[1].cur, {
        let mut st = RegState::block_entry();
        st.is32 = alloc.is32.after[1];
        st
    });
    assert!(alloc.regs[2].loads() != 0);
}

const LOOP: [u32; 6] = [
    mips::addiu(2, 0, 0),
    mips::addu(2, 2, 4),
    mips::bne(2, 5, -2),
    mips::nop(),
    mips::jr(31),
    mips::nop(),
];

#[test]
fn test_loop_registers_retained_across_back_edge() {
    let (block, live, alloc) = alloc_mips(&LOOP, &AllocConfig::default());
    assert_eq!(block.target_index[2], Some(1));
    let head = &alloc.regs[1].entry;
    let bottom = alloc.regs[2].branch.as_ref().unwrap();
    for r in [gpr(2), gpr(4), gpr(5)] {
        assert!(head.contains(r), "{r} not resident at loop head");
        assert_eq!(head.find(r), bottom.find(r));
    }
    assert!(alloc.pins.iter().any(|p| p.reg == gpr(4)));
    // nothing is stored or reloaded on the back edge
    assert!(back_edge(&block, &live, &alloc, 2).is_empty());
    assert_eq!(alloc.regs[1].loads(), 0);
}

#[test]
fn test_loop_without_retention_reloads() {
    let config = AllocConfig::default().with_loop_retention(false).with_hoist_loads(false);
    let (_, _, alloc) = alloc_mips(&LOOP, &config);
    assert!(alloc.pins.is_empty());
    assert!(!alloc.regs[1].entry.contains(gpr(4)));
    assert_ne!(alloc.regs[1].loads(), 0);
}

#[test]
fn test_clean_pass_marks_read_only_loop_values_clean() {
    let (_, _, alloc) = alloc_mips(&LOOP, &AllocConfig::default());
    let head = &alloc.regs[1].entry;
    let acc = head.find(gpr(2)).unwrap();
    let addend = head.find(gpr(4)).unwrap();
    assert!(head.is_dirty(acc));
    assert!(!head.is_dirty(addend));
    assert!(head.is_dirty(HOST_CCREG));
}

#[test]
fn test_loads_hoisted_into_previous_instruction() {
    let words = [mips::addu(2, 3, 4), mips::addu(5, 6, 7), mips::jr(31), mips::nop()];
    let (_, _, alloc) = alloc_mips(&words, &AllocConfig::default());
    let hoist = alloc.hoists.first().copied().unwrap();
    assert_eq!(hoist.at, 0);
    assert_eq!(hoist.reg, gpr(6));
    assert_eq!(alloc.regs[0].src[hoist.slot], Some(gpr(6)));
    assert_eq!(alloc.regs[1].loads() & (1 << hoist.slot), 0);

    let (_, _, plain) = alloc_mips(&words, &AllocConfig::default().with_hoist_loads(false));
    assert!(plain.hoists.is_empty());
    assert_ne!(plain.regs[1].loads() & (1 << hoist.slot), 0);
}

#[test]
fn test_wide_operands_load_upper_halves() {
    let (_, _, alloc) = alloc_mips(&[mips::daddu(2, 3, 4), mips::jr(31), mips::nop()], &AllocConfig::default());
    let stat = &alloc.regs[0];
    assert!(stat.src_slot(gpr(3).upper()).is_some());
    assert!(stat.src_slot(gpr(4).upper()).is_some());
    assert!(stat.cur.contains(gpr(2).upper()));
    // a 32-bit result makes the old upper word implicit
    let (_, _, alloc) = alloc_mips(
        &[mips::daddu(2, 3, 4), mips::addiu(2, 2, 1), mips::jr(31), mips::nop()],
        &AllocConfig::default(),
    );
    assert!(!alloc.regs[1].cur.contains(gpr(2).upper()));
    assert!(alloc.regs[1].cur.reg_is32(gpr(2)));
}

#[test]
fn test_sh2_allocation_never_uses_upper_halves() {
    let base = 0x0600_0000;
    let bytes = sh2::assemble(&[
        sh2::mov_imm(1, 10),
        sh2::add(2, 1),
        sh2::dt(1),
        sh2::bf(-4),
        sh2::rts(),
        sh2::nop(),
    ]);
    let (block, _, alloc) = alloc_words(IsaKind::Sh2, &bytes, base, &AllocConfig::default());
    assert!(!alloc.wide);
    for stat in &alloc.regs {
        assert!(stat.cur.map.iter().flatten().all(|r| !r.is_upper()));
    }
    let bf = block.instrs.iter().position(|r| r.is_branch()).unwrap();
    assert!(alloc.regs[bf].src_slot(sh2_regs::TBIT).is_some());
}

#[test]
fn test_verify_rejects_displaced_cycle_counter() {
    let (block, _, mut alloc) = alloc_mips(&[mips::addiu(2, 0, 1), mips::jr(31), mips::nop()], &AllocConfig::default());
    alloc.regs[0].cur.clear(HOST_CCREG);
    assert!(matches!(alloc.verify(&block), Err(AllocError::CycleCounter { .. })));
}
