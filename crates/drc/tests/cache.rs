//! Block cache behaviour seen through the translator: hits, write
//! notification, restore candidates and invalidation.

mod common;

use common::{MIPS_BASE, SH2_BASE, mips_translator, sh2_translator};
use drc::{BlockState, CpuContext, HostHooks, InstrClass, PageState, StubKind};
use drc_isa::encode::{mips, sh2};

const PAGE: u32 = MIPS_BASE >> 12;

fn leaf() -> Vec<u32> {
    vec![mips::addiu(2, 0, 1), mips::addu(3, 2, 4), mips::jr(31), mips::nop()]
}

#[test]
fn test_second_translation_is_a_hit() {
    let mut t = mips_translator(&leaf());
    let first = t.translate(MIPS_BASE).unwrap();
    let code = t.block(first).unwrap().code.clone();
    let second = t.translate(MIPS_BASE).unwrap();

    assert_eq!(first, second);
    assert_eq!(t.block(second).unwrap().code, code);
    let stats = t.stats();
    assert_eq!(stats.compiled, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(t.page_state(PAGE), PageState::Clean);
}

#[test]
fn test_blocks_compiled_side_by_side_all_hit() {
    let mut words = leaf();
    for k in 1..4u32 {
        words.resize(0x40 * k as usize, mips::nop());
        words.extend(leaf());
    }
    let mut t = mips_translator(&words);
    let starts: Vec<u32> = (0..4).map(|k| MIPS_BASE + k * 0x100).collect();
    let ids: Vec<_> = starts.iter().map(|&a| t.translate(a).unwrap()).collect();

    for (&addr, &id) in starts.iter().zip(&ids) {
        assert_eq!(t.translate(addr).unwrap(), id);
        let block = t.block(id).unwrap();
        assert_eq!(block.start, addr);
        assert!(block.is_live());
    }
    let stats = t.stats();
    assert_eq!(stats.compiled, 4);
    assert_eq!(stats.hits, 4);
    assert_eq!(stats.expired, 0);
    assert_eq!(stats.live_blocks, 4);
    common::assert_code_disjoint(&t);
}

#[test]
fn test_lookup_of_entry_inside_block() {
    let mut t = mips_translator(&leaf());
    let id = t.translate(MIPS_BASE).unwrap();
    let entry = t.block(id).unwrap().entry(MIPS_BASE).unwrap();
    assert_eq!(t.lookup_offset(MIPS_BASE).unwrap(), entry);
    assert_eq!(t.lookup(MIPS_BASE).unwrap(), t.host_ptr(entry));
}

#[test]
fn test_noop_notifications_keep_blocks() {
    let mut t = mips_translator(&leaf());
    let id = t.translate(MIPS_BASE).unwrap();

    assert!(!t.notify_write(MIPS_BASE, 0, Some(MIPS_BASE)));
    // next page: mapped, never compiled
    assert!(!t.notify_write(MIPS_BASE + 0x1000, 4, None));
    // same page, past the block
    assert!(!t.notify_write(MIPS_BASE + 0x800, 4, None));
    assert_eq!(t.notify_bulk_write(MIPS_BASE + 0x1000, 0x1000), 0);

    assert_eq!(t.block(id).unwrap().state, BlockState::Clean);
    assert_eq!(t.translate(MIPS_BASE).unwrap(), id);
    assert_eq!(t.stats().invalidations, 0);
    assert_eq!(t.stats().compiled, 1);
}

#[test]
fn test_write_into_block_forces_recompile() {
    let mut t = mips_translator(&leaf());
    let old = t.translate(MIPS_BASE).unwrap();
    assert_eq!(t.block(old).unwrap().summary.class_count(InstrClass::System), 0);

    // replace `addu` with `syscall`
    let affected = t.write(MIPS_BASE + 4, 4, u64::from(mips::syscall())).unwrap();
    assert!(!affected);
    assert_eq!(t.stats().invalidations, 1);
    assert_eq!(t.page_state(PAGE), PageState::Invalidated);
    assert!(t.block_at(MIPS_BASE).is_none());

    let new = t.translate(MIPS_BASE).unwrap();
    let block = t.block(new).unwrap();
    assert_eq!(block.state, BlockState::Clean);
    assert_eq!(block.summary.class_count(InstrClass::System), 1);
    assert_eq!(block.summary.end, MIPS_BASE + 8);
    assert_eq!(t.stats().compiled, 2);
    assert_eq!(t.page_state(PAGE), PageState::Clean);
}

#[test]
fn test_hot_block_is_restored_when_unchanged() {
    let mut t = mips_translator(&leaf());
    let id = t.translate(MIPS_BASE).unwrap();
    t.translate(MIPS_BASE).unwrap();
    t.translate(MIPS_BASE).unwrap();

    // same bytes written back over the block
    let running = t.write(MIPS_BASE, 4, u64::from(mips::addiu(2, 0, 1))).unwrap();
    assert!(!running);
    assert_eq!(t.block(id).unwrap().state, BlockState::Dirty);
    assert_eq!(t.page_state(PAGE), PageState::Dirty);
    assert!(t.block(id).unwrap().verify_entry.is_some());

    assert_eq!(t.translate(MIPS_BASE).unwrap(), id);
    let stats = t.stats();
    assert_eq!(stats.restores, 1);
    assert_eq!(stats.compiled, 1);
    assert_eq!(stats.invalidations, 0);
    assert_eq!(t.block(id).unwrap().state, BlockState::Clean);
    assert_eq!(t.page_state(PAGE), PageState::Clean);
}

#[test]
fn test_hot_block_with_changed_source_is_rebuilt() {
    let mut t = mips_translator(&leaf());
    let id = t.translate(MIPS_BASE).unwrap();
    t.translate(MIPS_BASE).unwrap();
    t.translate(MIPS_BASE).unwrap();

    t.write(MIPS_BASE, 4, u64::from(mips::addiu(2, 0, 7))).unwrap();
    assert_eq!(t.block(id).unwrap().state, BlockState::Dirty);
    assert!(!t.verify_block(MIPS_BASE));

    let new = t.translate(MIPS_BASE).unwrap();
    assert_eq!(t.block(new).unwrap().state, BlockState::Clean);
    let stats = t.stats();
    assert_eq!(stats.restores, 0);
    assert_eq!(stats.invalidations, 1);
    assert_eq!(stats.compiled, 2);
}

#[test]
fn test_verify_block_restores_candidate() {
    let mut t = mips_translator(&leaf());
    let id = t.translate(MIPS_BASE).unwrap();
    assert_eq!(t.notify_bulk_write(MIPS_BASE, 0x1000), 1);
    assert_eq!(t.block(id).unwrap().state, BlockState::Dirty);

    assert!(t.verify_block(MIPS_BASE));
    assert_eq!(t.block(id).unwrap().state, BlockState::Clean);
    assert_eq!(t.stats().restores, 1);
    // clean blocks verify trivially, unknown addresses do not
    assert!(t.verify_block(MIPS_BASE));
    assert!(!t.verify_block(MIPS_BASE + 0x100));
}

#[test]
fn test_constant_store_into_compiled_page_notifies() {
    // block A stores to block B's first instruction through a constant address
    let mut words = vec![
        mips::lui(8, 0x8000),
        mips::sw(9, 8, 0x100),
        mips::jr(31),
        mips::nop(),
    ];
    words.resize(0x40, mips::nop());
    words.extend([mips::addiu(2, 0, 1), mips::jr(31), mips::nop()]);
    let mut t = mips_translator(&words);

    let a = t.translate(MIPS_BASE).unwrap();
    assert_eq!(t.block(a).unwrap().summary.stub_count(StubKind::WriteNotify), 1);
    assert_eq!(t.block(a).unwrap().summary.stub_count(StubKind::WriteSlow), 0);
    let b = t.translate(MIPS_BASE + 0x100).unwrap();

    // what the notify stub reports for the store, with A running
    let affected = t.notify_write(MIPS_BASE + 0x100, 4, Some(MIPS_BASE));
    assert!(!affected);
    assert!(t.block(b).is_none_or(|blk| !blk.is_live()));
    assert_eq!(t.block(a).unwrap().state, BlockState::Clean);
    assert_eq!(t.stats().invalidations, 1);

    // a store into the running block reports it
    assert!(t.notify_write(MIPS_BASE + 4, 4, Some(MIPS_BASE)));
}

#[test]
fn test_unknown_encoding_defers_one_instruction() {
    let mut t = mips_translator(&[mips::addiu(2, 0, 1), 59 << 26, mips::nop()]);
    let id = t.translate(MIPS_BASE).unwrap();
    let summary = &t.block(id).unwrap().summary;
    assert_eq!(summary.instrs, 2);
    assert_eq!(summary.class_count(InstrClass::Invalid), 1);
    assert_eq!(summary.class_count(InstrClass::Alu), 1);
}

#[test]
fn test_sh2_unsupported_instruction_is_interpreted() {
    let mut t = sh2_translator(&[sh2::mov_imm(1, 5), sh2::addc(1, 2), sh2::rts(), sh2::nop()]);
    let id = t.translate(SH2_BASE).unwrap();
    let summary = &t.block(id).unwrap().summary;
    assert_eq!(summary.class_count(InstrClass::Interp), 1);
    assert_eq!(summary.instrs, 4);
    assert!(summary.to_string().contains("sh2"));
}

#[test]
fn test_unmapped_entry_is_an_error() {
    let mut t = mips_translator(&leaf());
    assert!(t.translate(0x1000_0000).is_err());
    assert_eq!(t.stats().compiled, 0);
}

#[test]
fn test_reset_drops_everything() {
    let mut t = mips_translator(&leaf());
    t.translate(MIPS_BASE).unwrap();
    t.reset();
    assert_eq!(t.blocks().count(), 0);
    assert_eq!(t.page_state(PAGE), PageState::Uncompiled);
    t.translate(MIPS_BASE).unwrap();
    let stats = t.teardown();
    assert_eq!(stats.compiled, 2);
    assert_eq!(stats.live_blocks, 1);
}

#[test]
fn test_contexts_share_one_translator() {
    let mut t = mips_translator(&leaf());
    t.translate(MIPS_BASE).unwrap();
    let a = t.new_context(HostHooks::default());
    let mut b = CpuContext::new(HostHooks::default());
    t.attach(&mut b);

    assert_eq!(a.translator, b.translator);
    assert_eq!(a.exit, b.exit);
    assert_eq!(a.memmap, b.memmap);
    assert_eq!(a.invalid_code, b.invalid_code);
    let code = t.code().as_ptr_range();
    assert!(code.contains(&a.exit));
    // both contexts see the same compiled block
    assert_eq!(t.translate(MIPS_BASE).unwrap(), t.block_at(MIPS_BASE).unwrap());
}
