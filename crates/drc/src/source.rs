//! Guest memory as seen by the block scanner.

use drc_cfg::CodeSource;
use drc_state::GuestMemory;

use crate::cache::BlockCache;

/// Code reads from directly mapped guest RAM.
///
/// Pages that go through the host read hook are not compiled from: what
/// the hook returns may change without a store the translator sees.
pub(crate) struct GuestCode<'a> {
    pub(crate) memory: &'a GuestMemory,
    pub(crate) cache: &'a BlockCache,
}

impl CodeSource for GuestCode<'_> {
    fn fetch(&self, addr: u32, size: u32) -> Option<u32> {
        if !self.memory.map().is_direct(addr) {
            return None;
        }
        self.memory.read(addr, size).and_then(|v| u32::try_from(v).ok())
    }

    fn is_compiled(&self, addr: u32) -> bool {
        self.cache.has_clean(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    #[test]
    fn test_fetch_only_from_ram() {
        let mut memory = GuestMemory::new();
        memory.map_ram(0x1000, 0x1000).expect("map");
        memory.load(0x1000, &[0xDE, 0xAD, 0xBE, 0xEF]).expect("load");
        let cache = BlockCache::new(&CacheConfig::default(), 0x100, 0x10000);
        let src = GuestCode { memory: &memory, cache: &cache };
        assert_eq!(src.fetch(0x1000, 4), Some(0xDEAD_BEEF));
        assert_eq!(src.fetch(0x1002, 2), Some(0xBEEF));
        assert_eq!(src.fetch(0x3000, 4), None);
        assert!(!src.is_compiled(0x1000));
    }
}
