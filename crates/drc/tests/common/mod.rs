//! Shared helpers for translator integration tests.

#![allow(dead_code)]

use drc::{CacheConfig, IsaKind, TranslatorConfig, TranslatorContext, image_memory};
use drc_isa::encode::{mips, sh2};

pub const MIPS_BASE: u32 = 0x8000_0000;
pub const SH2_BASE: u32 = 0x0600_0000;

/// A cache small enough to map quickly in tests.
pub fn small_cache() -> CacheConfig {
    CacheConfig::default()
        .with_buffer_size(1 << 20)
        .with_block_window(64 << 10)
        .with_hash_bits(8)
}

pub fn translator(isa: IsaKind, base: u32, image: &[u8], cache: CacheConfig) -> TranslatorContext {
    let memory = image_memory(base, image).unwrap();
    TranslatorContext::new(TranslatorConfig::new(isa).with_cache(cache), memory).unwrap()
}

pub fn mips_translator(words: &[u32]) -> TranslatorContext {
    translator(IsaKind::Mips, MIPS_BASE, &mips::assemble(words), small_cache())
}

pub fn sh2_translator(words: &[u16]) -> TranslatorContext {
    translator(IsaKind::Sh2, SH2_BASE, &sh2::assemble(words), small_cache())
}

/// Live blocks must sit inside the buffer and never share code bytes.
pub fn assert_code_disjoint(t: &TranslatorContext) {
    let size = t.code().len();
    let mut ranges: Vec<_> = t.blocks().filter(|(_, b)| b.is_live()).map(|(_, b)| b.code.clone()).collect();
    ranges.sort_by_key(|r| r.start);
    for r in &ranges {
        assert!(r.start < r.end && r.end <= size, "block code {r:?} outside buffer of {size:#x}");
    }
    for pair in ranges.windows(2) {
        assert!(pair[0].end <= pair[1].start, "blocks {:?} and {:?} overlap", pair[0], pair[1]);
    }
}
