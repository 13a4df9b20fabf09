//! Translator configuration.
//!
//! Every tuning constant lives in one of these structs so embedders can
//! trade memory against recompilation without touching the engine.

use drc_cfg::DEFAULT_MAX_INSTRS;
use drc_emit::EmitConfig;
use drc_isa::IsaKind;
use drc_regalloc::AllocConfig;
use drc_state::HOST_PAGE_SIZE;

use crate::error::{Error, Result};

/// Default size of the translated code buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 32 << 20;
/// Default space reserved for one block while it is emitted.
pub const DEFAULT_BLOCK_WINDOW: usize = 256 << 10;

/// Block cache sizing and eviction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// Bytes of executable memory for translated code.
    pub buffer_size: usize,
    /// Bytes a single block may use; emission that needs more shortens the block.
    pub block_window: usize,
    /// The buffer is expired in this many equal regions ahead of the write cursor.
    pub expiry_regions: usize,
    /// Expiration chunks processed after every compile.
    pub expiry_steps: usize,
    /// Lookups after which a block survives writes as a restore candidate
    /// instead of being invalidated.
    pub restore_threshold: u32,
    /// Maximum guest instructions per block.
    pub max_block: usize,
    /// log2 of the number of hash table buckets.
    pub hash_bits: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            block_window: DEFAULT_BLOCK_WINDOW,
            expiry_regions: 4,
            expiry_steps: 4,
            restore_threshold: 2,
            max_block: DEFAULT_MAX_INSTRS,
            hash_bits: 16,
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub const fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    #[must_use]
    pub const fn with_block_window(mut self, window: usize) -> Self {
        self.block_window = window;
        self
    }

    #[must_use]
    pub const fn with_expiry(mut self, regions: usize, steps: usize) -> Self {
        self.expiry_regions = regions;
        self.expiry_steps = steps;
        self
    }

    #[must_use]
    pub const fn with_restore_threshold(mut self, threshold: u32) -> Self {
        self.restore_threshold = threshold;
        self
    }

    #[must_use]
    pub const fn with_max_block(mut self, max: usize) -> Self {
        self.max_block = max;
        self
    }

    #[must_use]
    pub const fn with_hash_bits(mut self, bits: u32) -> Self {
        self.hash_bits = bits;
        self
    }

    /// Check that the sizes are usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self, reserved: usize) -> Result<()> {
        if self.buffer_size == 0 || self.buffer_size % HOST_PAGE_SIZE != 0 {
            return Err(Error::Config(format!(
                "buffer size {:#x} is not a positive multiple of {HOST_PAGE_SIZE:#x}",
                self.buffer_size
            )));
        }
        if self.block_window == 0 || reserved + self.block_window > self.buffer_size {
            return Err(Error::Config(format!(
                "block window {:#x} does not fit a buffer of {:#x}",
                self.block_window, self.buffer_size
            )));
        }
        if self.expiry_regions < 2 {
            return Err(Error::Config("at least two expiry regions are required".into()));
        }
        if self.expiry_steps == 0 {
            return Err(Error::Config("expiry must make progress on every compile".into()));
        }
        if self.max_block == 0 {
            return Err(Error::Config("blocks must hold at least one instruction".into()));
        }
        if !(4..=24).contains(&self.hash_bits) {
            return Err(Error::Config(format!("hash table size 2^{} out of range", self.hash_bits)));
        }
        Ok(())
    }
}

/// Everything a [`TranslatorContext`](crate::TranslatorContext) is built from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranslatorConfig {
    pub isa: IsaKind,
    pub alloc: AllocConfig,
    pub emit: EmitConfig,
    pub cache: CacheConfig,
}

impl TranslatorConfig {
    #[must_use]
    pub fn new(isa: IsaKind) -> Self {
        Self {
            isa,
            alloc: AllocConfig::default(),
            emit: EmitConfig::default(),
            cache: CacheConfig::default(),
        }
    }

    #[must_use]
    pub fn with_alloc(mut self, alloc: AllocConfig) -> Self {
        self.alloc = alloc;
        self
    }

    #[must_use]
    pub const fn with_emit(mut self, emit: EmitConfig) -> Self {
        self.emit = emit;
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sizes() {
        let config = CacheConfig::default();
        assert_eq!(config.buffer_size, 32 << 20);
        assert_eq!(config.block_window, 256 << 10);
        assert_eq!(config.max_block, 4096);
        assert!(config.validate(0x100).is_ok());
    }

    #[test]
    fn test_rejects_window_larger_than_buffer() {
        let config = CacheConfig::default().with_buffer_size(0x1000).with_block_window(0x1000);
        assert!(matches!(config.validate(0x100), Err(Error::Config(_))));
        let config = CacheConfig::default().with_buffer_size(0x1800);
        assert!(matches!(config.validate(0), Err(Error::Config(_))));
        let config = CacheConfig::default().with_expiry(1, 4);
        assert!(matches!(config.validate(0), Err(Error::Config(_))));
    }
}
