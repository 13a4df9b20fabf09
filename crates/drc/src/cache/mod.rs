//! Block cache: what is compiled, where it lives, and whether it is still
//! good.
//!
//! Blocks live in a [`BlockArena`]; everything else refers to them by
//! [`BlockId`]. Per-page lists are authoritative, the hash table is a
//! cache in front of them. Stores into a page with translations either
//! invalidate the affected blocks or, for blocks that have proven hot,
//! turn them into restore candidates that are checked against a shadow
//! copy of their source before they run again.

mod arena;
mod expire;
mod hash;
mod pages;

use std::ops::Range;

use drc_cfg::page_of;
use drc_emit::patch_jump;
use drc_state::InvalidCode;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

pub use arena::{Block, BlockId, BlockState};
pub use hash::HashEntry;
pub use pages::PageState;

use arena::BlockArena;
use expire::Expiry;
use hash::HashTable;
use pages::PageTable;

use crate::config::CacheConfig;

/// Counters kept over the lifetime of a translator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub compiled: u64,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub restores: u64,
    pub expired: u64,
    pub links_patched: u64,
    /// Times the write cursor went back to the start of the buffer.
    pub wraps: u64,
    pub live_blocks: usize,
    /// Bytes of translated code currently in the buffer.
    pub code_bytes: usize,
}

/// Result of looking up a guest address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Lookup {
    /// Clean translation; jump to `offset`.
    Hit { block: BlockId, offset: usize },
    /// A restore candidate contains the address.
    Dirty(BlockId),
    Miss,
}

/// An external jump site and the trampoline it falls back to.
#[derive(Clone, Copy, Debug)]
struct LinkSite {
    source: BlockId,
    target: u32,
    trampoline: usize,
}

pub(crate) struct BlockCache {
    pub(crate) arena: BlockArena,
    pub(crate) hash: HashTable,
    pub(crate) pages: PageTable,
    pub(crate) expiry: Expiry,
    sites: FxHashMap<usize, LinkSite>,
    /// Patched site to the block it jumps into.
    patched: FxHashMap<usize, BlockId>,
    pub(crate) stats: CacheStats,
}

impl BlockCache {
    pub(crate) fn new(config: &CacheConfig, code_start: usize, code_end: usize) -> Self {
        Self {
            arena: BlockArena::default(),
            hash: HashTable::new(config.hash_bits),
            pages: PageTable::default(),
            expiry: Expiry::new(code_start, code_end, config.expiry_regions),
            sites: FxHashMap::default(),
            patched: FxHashMap::default(),
            stats: CacheStats::default(),
        }
    }

    pub(crate) fn get(&self, id: BlockId) -> Option<&Block> {
        self.arena.get(id)
    }

    pub(crate) fn blocks(&self) -> impl Iterator<Item = (BlockId, &Block)> {
        self.arena.iter()
    }

    pub(crate) fn page_state(&self, page: u32) -> PageState {
        self.pages.state(page)
    }

    /// Whether a hash entry still names a usable translation.
    fn usable(&self, e: &HashEntry) -> bool {
        self.arena.get(e.block).is_some_and(|b| {
            b.is_live()
                && !self.expiry.reclaiming(&b.code)
                && (b.entry(e.addr) == Some(e.offset) || (b.start == e.addr && b.verify_entry == Some(e.offset)))
        })
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub(crate) fn lookup(&mut self, addr: u32) -> Lookup {
        if let Some(e) = self.hash.get(addr) {
            if self.usable(&e) {
                if let Some(b) = self.arena.get_mut(e.block) {
                    match b.state {
                        BlockState::Clean => {
                            b.heat = b.heat.saturating_add(1);
                            self.stats.hits += 1;
                            return Lookup::Hit { block: e.block, offset: e.offset };
                        }
                        BlockState::Dirty => return Lookup::Dirty(e.block),
                        BlockState::Invalid => {}
                    }
                }
            }
            self.hash.remove(addr, e.block);
        }

        if let Some((block, offset)) = self.find_clean(addr) {
            self.hash.insert(HashEntry { addr, offset, block });
            if let Some(b) = self.arena.get_mut(block) {
                b.heat = b.heat.saturating_add(1);
            }
            self.stats.hits += 1;
            return Lookup::Hit { block, offset };
        }
        if let Some(id) = self.find_dirty(addr) {
            return Lookup::Dirty(id);
        }
        self.stats.misses += 1;
        Lookup::Miss
    }

    /// Clean translation with an entry at `addr`, from the page lists.
    pub(crate) fn find_clean(&self, addr: u32) -> Option<(BlockId, usize)> {
        self.pages.clean(page_of(addr)).iter().find_map(|&id| {
            let b = self.arena.get(id)?;
            if self.expiry.reclaiming(&b.code) {
                return None;
            }
            b.entry(addr).map(|offset| (id, offset))
        })
    }

    /// Restore candidate with an entry at `addr`.
    pub(crate) fn find_dirty(&self, addr: u32) -> Option<BlockId> {
        self.pages.dirty(page_of(addr)).iter().copied().find(|&id| {
            self.arena
                .get(id)
                .is_some_and(|b| b.entry(addr).is_some() && !self.expiry.reclaiming(&b.code))
        })
    }

    /// Whether any clean translation starts at `addr`.
    pub(crate) fn has_clean(&self, addr: u32) -> bool {
        self.find_clean(addr).is_some()
    }

    // ========================================================================
    // Insertion
    // ========================================================================

    pub(crate) fn insert(&mut self, block: Block, invalid: &mut InvalidCode) -> BlockId {
        let entries = block.entries.clone();
        let pages = block.pages.clone();
        let code = block.code.clone();
        let links = block.links.clone();
        let id = self.arena.insert(block);

        for e in entries {
            self.hash.insert(HashEntry { addr: e.addr, offset: e.offset, block: id });
        }
        for page in pages {
            self.pages.add_clean(page, id, invalid);
        }
        for l in links.iter().filter(|l| l.is_external()) {
            if let Some(trampoline) = l.trampoline {
                self.sites.insert(l.site, LinkSite { source: id, target: l.target, trampoline });
            }
        }
        self.expiry.mark_occupied(&code);
        self.stats.compiled += 1;
        id
    }

    /// External jump sites of block `id`.
    pub(crate) fn link_sites(&self, id: BlockId) -> Vec<usize> {
        self.arena.get(id).map_or_else(Vec::new, |b| {
            b.links.iter().filter(|l| l.is_external() && l.trampoline.is_some()).map(|l| l.site).collect()
        })
    }

    // ========================================================================
    // Links
    // ========================================================================

    /// Guest address an external jump site leads to.
    pub(crate) fn site_target(&self, site: usize) -> Option<u32> {
        self.sites.get(&site).map(|s| s.target)
    }

    /// Block whose code contains `offset`.
    pub(crate) fn block_containing(&self, offset: usize) -> Option<BlockId> {
        if let Some(site) = self.sites.get(&offset) {
            return Some(site.source);
        }
        self.arena
            .iter()
            .find(|(_, b)| b.code.contains(&offset))
            .map(|(id, _)| id)
    }

    /// Aim external jump `site` straight at its clean target, if there is one.
    pub(crate) fn resolve_link(&mut self, site: usize, code: &mut [u8]) -> Option<usize> {
        let link = *self.sites.get(&site)?;
        let source = self.arena.get(link.source)?;
        if !source.is_live() || self.expiry.reclaiming(&source.code) {
            return None;
        }
        let (target, offset) = self.find_clean(link.target)?;
        patch_jump(code, site, offset).ok()?;
        if let Some(old) = self.patched.insert(site, target)
            && old != target
            && let Some(b) = self.arena.get_mut(old)
        {
            b.incoming.retain(|&s| s != site);
        }
        if let Some(b) = self.arena.get_mut(target)
            && !b.incoming.contains(&site)
        {
            b.incoming.push(site);
        }
        self.stats.links_patched += 1;
        trace!(site, target = format_args!("{:#010x}", link.target), offset, "linked");
        Some(offset)
    }

    /// Send `site` back through its trampoline.
    fn unpatch(&mut self, site: usize, code: &mut [u8]) {
        if let Some(link) = self.sites.get(&site) {
            // the trampoline is in the same block, always in range
            let _ = patch_jump(code, site, link.trampoline);
        }
        self.patched.remove(&site);
    }

    /// Undo every link into and out of block `id`.
    pub(crate) fn unlink(&mut self, id: BlockId, code: &mut [u8]) {
        let Some(block) = self.arena.get_mut(id) else { return };
        let incoming = std::mem::take(&mut block.incoming);
        let outgoing: Vec<usize> = block.links.iter().filter(|l| l.is_external()).map(|l| l.site).collect();
        block.links.retain(|l| !l.is_external());
        for site in incoming {
            self.unpatch(site, code);
        }
        for site in outgoing {
            if let Some(target) = self.patched.get(&site).copied()
                && let Some(b) = self.arena.get_mut(target)
            {
                b.incoming.retain(|&s| s != site);
            }
            self.unpatch(site, code);
            self.sites.remove(&site);
        }
    }

    // ========================================================================
    // Invalidation and restore
    // ========================================================================

    /// Drop block `id` from every lookup structure. The slot stays until
    /// its code region expires.
    pub(crate) fn invalidate(&mut self, id: BlockId, code: &mut [u8], invalid: &mut InvalidCode) {
        let Some(block) = self.arena.get_mut(id) else { return };
        if !block.is_live() {
            return;
        }
        block.state = BlockState::Invalid;
        let entries = block.entries.clone();
        let pages = block.pages.clone();
        let start = block.start;
        for e in entries {
            self.hash.remove(e.addr, id);
        }
        for page in pages {
            self.pages.remove(page, id, true, invalid);
        }
        self.unlink(id, code);
        self.stats.invalidations += 1;
        debug!(block = %id, start = format_args!("{start:#010x}"), "invalidated");
    }

    /// Turn block `id` into a restore candidate.
    pub(crate) fn make_dirty(&mut self, id: BlockId, code: &mut [u8], invalid: &mut InvalidCode) {
        let Some(block) = self.arena.get_mut(id) else { return };
        if block.state != BlockState::Clean {
            return;
        }
        block.state = BlockState::Dirty;
        let entries = block.entries.clone();
        let pages = block.pages.clone();
        let (start, verify) = (block.start, block.verify_entry);
        let incoming = block.incoming.clone();
        for e in entries {
            self.hash.remove(e.addr, id);
        }
        if let Some(offset) = verify {
            self.hash.insert(HashEntry { addr: start, offset, block: id });
        }
        for page in pages {
            self.pages.mark_dirty(page, id, invalid);
        }
        match verify {
            Some(offset) => {
                for site in incoming {
                    let _ = patch_jump(code, site, offset);
                }
            }
            None => {
                for site in incoming {
                    self.unpatch(site, code);
                }
                if let Some(b) = self.arena.get_mut(id) {
                    b.incoming.clear();
                }
            }
        }
        trace!(block = %id, start = format_args!("{start:#010x}"), "dirty");
    }

    /// Return restore candidate `id` to service after its source checked out.
    pub(crate) fn restore(&mut self, id: BlockId, code: &mut [u8], invalid: &mut InvalidCode) {
        let Some(block) = self.arena.get_mut(id) else { return };
        if block.state != BlockState::Dirty {
            return;
        }
        block.state = BlockState::Clean;
        let entries = block.entries.clone();
        let pages = block.pages.clone();
        let start = block.start;
        let clean = block.entry(start);
        let incoming = block.incoming.clone();
        self.hash.remove(start, id);
        for e in entries {
            self.hash.insert(HashEntry { addr: e.addr, offset: e.offset, block: id });
        }
        for page in pages {
            self.pages.mark_clean(page, id, invalid);
        }
        if let Some(offset) = clean {
            for site in incoming {
                let _ = patch_jump(code, site, offset);
            }
        }
        self.stats.restores += 1;
        debug!(block = %id, start = format_args!("{start:#010x}"), "restored");
    }

    /// Handle a store of `len` bytes at `addr`. Returns whether the block
    /// starting at `running` was affected.
    pub(crate) fn notify_write(
        &mut self,
        addr: u32,
        len: u32,
        running: Option<u32>,
        threshold: u32,
        code: &mut [u8],
        invalid: &mut InvalidCode,
    ) -> bool {
        if len == 0 {
            return false;
        }
        let last = addr.saturating_add(len - 1);
        let mut affected = false;
        for page in page_of(addr)..=page_of(last) {
            let hit: Vec<(BlockId, bool)> = self
                .pages
                .clean(page)
                .iter()
                .filter_map(|&id| {
                    let b = self.arena.get(id)?;
                    b.source_overlaps(addr, last)
                        .then(|| (id, b.heat >= threshold && b.shadow.is_some()))
                })
                .collect();
            for (id, hot) in hit {
                if running.is_some_and(|r| self.arena.get(id).is_some_and(|b| b.start == r)) {
                    affected = true;
                }
                if hot {
                    self.make_dirty(id, code, invalid);
                } else {
                    self.invalidate(id, code, invalid);
                }
            }
        }
        affected
    }

    /// Make every clean block on the pages of `addr..addr + len` a restore
    /// candidate. Returns how many blocks changed.
    pub(crate) fn notify_bulk_write(&mut self, addr: u32, len: u32, code: &mut [u8], invalid: &mut InvalidCode) -> usize {
        if len == 0 {
            return 0;
        }
        let last = addr.saturating_add(len - 1);
        let mut changed = 0;
        for page in page_of(addr)..=page_of(last) {
            let ids = self.pages.clean(page).to_vec();
            for id in ids {
                self.make_dirty(id, code, invalid);
                changed += 1;
            }
        }
        changed
    }

    // ========================================================================
    // Reclamation
    // ========================================================================

    /// Forget block `id` entirely and free its slot.
    pub(crate) fn reclaim(&mut self, id: BlockId, invalid: &mut InvalidCode) {
        let Some(block) = self.arena.remove(id) else { return };
        for page in block.pages.clone() {
            self.pages.remove(page, id, false, invalid);
        }
        for e in &block.entries {
            self.hash.remove(e.addr, id);
        }
        self.stats.expired += 1;
    }

    /// Code offsets of live translations.
    pub(crate) fn code_bytes(&self) -> usize {
        self.arena.iter().map(|(_, b)| b.code.len()).sum()
    }

    pub(crate) fn reclaiming(&self, range: &Range<usize>) -> bool {
        self.expiry.reclaiming(range)
    }

    pub(crate) fn clear(&mut self, invalid: &mut InvalidCode) {
        self.arena.clear();
        self.hash.clear();
        self.pages.clear();
        self.expiry.reset();
        self.sites.clear();
        self.patched.clear();
        invalid.reset();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use drc_emit::{EntryPoint, LinkKind, LinkRecord, jump_target};

    use super::*;
    use crate::summary::BlockSummary;

    pub(crate) fn dummy_block(start: u32) -> Block {
        block(start, start as usize..start as usize + 0x10, Vec::new())
    }

    fn block(start: u32, code: Range<usize>, links: Vec<LinkRecord>) -> Block {
        Block {
            start,
            source: start..start + 8,
            pages: page_of(start)..=page_of(start + 7),
            entries: vec![EntryPoint { addr: start, offset: code.start + 8 }],
            verify_entry: Some(code.start),
            code,
            links,
            state: BlockState::Clean,
            heat: 0,
            summary: BlockSummary::default(),
            shadow: Some(vec![0; 8].into_boxed_slice()),
            incoming: Vec::new(),
        }
    }

    fn cache() -> (BlockCache, InvalidCode, Vec<u8>) {
        let config = CacheConfig::default().with_hash_bits(8).with_expiry(4, 4);
        (BlockCache::new(&config, 0x100, 0x4100), InvalidCode::new(), vec![0; 0x4100])
    }

    /// Block at 0x1000 jumping to 0x2000 and the block at 0x2000.
    fn linked_pair(cache: &mut BlockCache, invalid: &mut InvalidCode, code: &mut [u8]) -> (BlockId, BlockId) {
        let link = LinkRecord {
            site: 0x110,
            target: 0x2000,
            kind: LinkKind::External,
            trampoline: Some(0x180),
        };
        patch_jump(code, 0x110, 0x180).expect("in range");
        let a = cache.insert(block(0x1000, 0x100..0x200, vec![link]), invalid);
        let b = cache.insert(block(0x2000, 0x300..0x400, Vec::new()), invalid);
        (a, b)
    }

    #[test]
    fn test_lookup_hits_after_insert() {
        let (mut cache, mut invalid, _) = cache();
        assert_eq!(cache.lookup(0x1000), Lookup::Miss);
        let id = cache.insert(dummy_block(0x1000), &mut invalid);
        assert_eq!(cache.lookup(0x1000), Lookup::Hit { block: id, offset: 0x1008 });
        assert_eq!(cache.stats.hits, 1);
        assert_eq!(cache.stats.misses, 1);
        assert_eq!(cache.page_state(1), PageState::Clean);
        assert!(!invalid.is_invalid(1));
    }

    #[test]
    fn test_lookup_falls_back_to_page_lists() {
        let (mut cache, mut invalid, _) = cache();
        let id = cache.insert(dummy_block(0x1000), &mut invalid);
        cache.hash.clear();
        assert_eq!(cache.lookup(0x1000), Lookup::Hit { block: id, offset: 0x1008 });
        assert!(cache.hash.peek(0x1000).is_some());
    }

    #[test]
    fn test_cold_write_invalidates() {
        let (mut cache, mut invalid, mut code) = cache();
        let id = cache.insert(dummy_block(0x1000), &mut invalid);
        assert!(!cache.notify_write(0x0FF0, 0x10, Some(0x1000), 2, &mut code, &mut invalid));
        assert!(cache.notify_write(0x1004, 4, Some(0x1000), 2, &mut code, &mut invalid));
        assert_eq!(cache.get(id).map(|b| b.state), Some(BlockState::Invalid));
        assert_eq!(cache.page_state(1), PageState::Invalidated);
        assert!(invalid.is_invalid(1));
        assert_eq!(cache.lookup(0x1000), Lookup::Miss);
        assert_eq!(cache.stats.invalidations, 1);
    }

    #[test]
    fn test_hot_write_leaves_restore_candidate() {
        let (mut cache, mut invalid, mut code) = cache();
        let id = cache.insert(dummy_block(0x1000), &mut invalid);
        cache.lookup(0x1000);
        cache.lookup(0x1000);
        cache.notify_write(0x1000, 4, None, 2, &mut code, &mut invalid);
        assert_eq!(cache.page_state(1), PageState::Dirty);
        assert_eq!(cache.lookup(0x1000), Lookup::Dirty(id));
        // the hash table hands out the verify entry
        assert_eq!(cache.hash.peek(0x1000).map(|e| e.offset), Some(0x1000));

        cache.restore(id, &mut code, &mut invalid);
        assert_eq!(cache.page_state(1), PageState::Clean);
        assert_eq!(cache.lookup(0x1000), Lookup::Hit { block: id, offset: 0x1008 });
        assert_eq!(cache.stats.restores, 1);
    }

    #[test]
    fn test_bulk_write_dirties_whole_pages() {
        let (mut cache, mut invalid, mut code) = cache();
        let a = cache.insert(dummy_block(0x1000), &mut invalid);
        let b = cache.insert(dummy_block(0x1800), &mut invalid);
        let c = cache.insert(dummy_block(0x3000), &mut invalid);
        assert_eq!(cache.notify_bulk_write(0x1FF0, 4, &mut code, &mut invalid), 2);
        assert_eq!(cache.get(a).map(|b| b.state), Some(BlockState::Dirty));
        assert_eq!(cache.get(b).map(|b| b.state), Some(BlockState::Dirty));
        assert_eq!(cache.get(c).map(|b| b.state), Some(BlockState::Clean));
        assert!(invalid.is_invalid(1));
    }

    #[test]
    fn test_link_is_undone_when_target_is_invalidated() {
        let (mut cache, mut invalid, mut code) = cache();
        let (_, b) = linked_pair(&mut cache, &mut invalid, &mut code);
        assert_eq!(cache.resolve_link(0x110, &mut code), Some(0x308));
        assert_eq!(jump_target(&code, 0x110), 0x308);
        assert_eq!(cache.get(b).map(|b| b.incoming.clone()), Some(vec![0x110]));

        cache.invalidate(b, &mut code, &mut invalid);
        assert_eq!(jump_target(&code, 0x110), 0x180);
        assert_eq!(cache.resolve_link(0x110, &mut code), None);
    }

    #[test]
    fn test_dirty_target_links_to_verify_entry() {
        let (mut cache, mut invalid, mut code) = cache();
        let (_, b) = linked_pair(&mut cache, &mut invalid, &mut code);
        cache.resolve_link(0x110, &mut code);
        cache.make_dirty(b, &mut code, &mut invalid);
        assert_eq!(jump_target(&code, 0x110), 0x300);
        cache.restore(b, &mut code, &mut invalid);
        assert_eq!(jump_target(&code, 0x110), 0x308);
    }

    #[test]
    fn test_invalidated_source_drops_its_links() {
        let (mut cache, mut invalid, mut code) = cache();
        let (a, b) = linked_pair(&mut cache, &mut invalid, &mut code);
        cache.resolve_link(0x110, &mut code);
        cache.invalidate(a, &mut code, &mut invalid);
        assert!(cache.get(b).is_some_and(|b| b.incoming.is_empty()));
        assert_eq!(cache.site_target(0x110), None);
        assert_eq!(jump_target(&code, 0x110), 0x180);
    }

    #[test]
    fn test_expiry_reclaims_region() {
        let (mut cache, mut invalid, mut code) = cache();
        let (a, b) = linked_pair(&mut cache, &mut invalid, &mut code);
        cache.resolve_link(0x110, &mut code);
        let far = cache.insert(block(0x3000, 0x1200..0x1300, Vec::new()), &mut invalid);

        cache.begin_expiry(0, &mut code, &mut invalid);
        assert!(cache.reclaiming(&(0x100..0x200)));
        assert!(!cache.has_clean(0x1000));
        cache.finish_expiry(&mut code, &mut invalid);

        assert!(cache.get(a).is_none());
        assert!(cache.get(b).is_none());
        assert!(cache.get(far).is_some());
        assert_eq!(cache.stats.expired, 2);
        assert_eq!(cache.page_state(1), PageState::Uncompiled);
        assert_eq!(cache.lookup(0x2000), Lookup::Miss);
        assert_eq!(cache.lookup(0x3000), Lookup::Hit { block: far, offset: 0x1208 });
    }

    #[test]
    fn test_ensure_expired_keeps_blocks_below_cursor() {
        let (mut cache, mut invalid, mut code) = cache();
        let (a, b) = linked_pair(&mut cache, &mut invalid, &mut code);
        let old = cache.insert(block(0x3000, 0x1200..0x1300, Vec::new()), &mut invalid);

        // cursor at 0x400 with a window reaching into region 1
        cache.ensure_expired(&(0x400..0x1400), &mut code, &mut invalid);
        assert!(cache.get(a).is_some_and(Block::is_live));
        assert!(cache.get(b).is_some_and(Block::is_live));
        assert!(cache.get(old).is_none());
        assert_eq!(cache.stats.expired, 1);

        // the same window again has nothing left to sweep
        cache.ensure_expired(&(0x400..0x1400), &mut code, &mut invalid);
        assert_eq!(cache.stats.expired, 1);

        // next lap starts over the oldest blocks
        cache.expiry.wrapped();
        cache.ensure_expired(&(0x100..0x180), &mut code, &mut invalid);
        assert!(cache.get(a).is_none());
        assert!(cache.get(b).is_none());
        assert_eq!(cache.stats.expired, 3);
    }

    #[test]
    fn test_ensure_expired_is_synchronous() {
        let (mut cache, mut invalid, mut code) = cache();
        cache.insert(dummy_block(0x2000), &mut invalid);
        cache.begin_expiry(1, &mut code, &mut invalid);
        cache.expire_steps(1, &mut code, &mut invalid);
        assert!(cache.expiry.active.is_some());
        cache.ensure_expired(&(0x2000..0x2004), &mut code, &mut invalid);
        assert!(cache.expiry.active.is_none());
        assert_eq!(cache.arena.len(), 0);
    }
}
