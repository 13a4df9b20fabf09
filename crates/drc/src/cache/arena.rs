//! Translated blocks, addressed by handle.
//!
//! Page lists, hash entries and links refer to blocks by [`BlockId`].
//! Invalidation only marks a block dead; its slot is reclaimed once the
//! code region it occupies expires, so a handle stays valid for as long
//! as anything can still name it.

use std::fmt;
use std::ops::{Range, RangeInclusive};

use drc_emit::{EntryPoint, LinkRecord};
use drc_state::GuestMemory;

use crate::summary::BlockSummary;

/// Handle of a block in the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl BlockId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
    /// Source bytes are known to match the translation.
    Clean,
    /// Source may have been overwritten; verify before running.
    Dirty,
    /// Removed from every lookup structure, waiting for its code to expire.
    Invalid,
}

/// One translated block.
#[derive(Debug)]
pub struct Block {
    /// Guest entry address.
    pub start: u32,
    /// Guest bytes the translation was built from.
    pub source: Range<u32>,
    pub pages: RangeInclusive<u32>,
    /// Code offsets in the translation buffer.
    pub code: Range<usize>,
    pub entries: Vec<EntryPoint>,
    pub verify_entry: Option<usize>,
    /// Jumps out of the block, resolved lazily.
    pub links: Vec<LinkRecord>,
    pub state: BlockState,
    /// Lookups that returned this block.
    pub heat: u32,
    pub summary: BlockSummary,
    /// Copy of `source` taken when the block was compiled.
    pub(crate) shadow: Option<Box<[u8]>>,
    /// Link sites in other blocks currently jumping here.
    pub(crate) incoming: Vec<usize>,
}

impl Block {
    /// Clean entry for guest address `addr`.
    #[must_use]
    pub fn entry(&self, addr: u32) -> Option<usize> {
        self.entries.iter().find(|e| e.addr == addr).map(|e| e.offset)
    }

    #[must_use]
    pub const fn is_live(&self) -> bool {
        !matches!(self.state, BlockState::Invalid)
    }

    #[must_use]
    pub const fn code_overlaps(&self, range: &Range<usize>) -> bool {
        self.code.start < range.end && range.start < self.code.end
    }

    /// Whether guest bytes `addr..=last` overlap the block's source.
    #[must_use]
    pub const fn source_overlaps(&self, addr: u32, last: u32) -> bool {
        addr < self.source.end && self.source.start <= last
    }

    /// Whether guest memory still holds the bytes the block was built from.
    #[must_use]
    pub fn source_matches(&self, memory: &GuestMemory) -> bool {
        let Some(shadow) = &self.shadow else { return false };
        memory
            .bytes(self.source.start, shadow.len())
            .is_some_and(|live| live == &shadow[..])
    }
}

/// Slot storage for blocks with handle reuse.
#[derive(Debug, Default)]
pub(crate) struct BlockArena {
    slots: Vec<Option<Block>>,
    free: Vec<BlockId>,
    occupied: usize,
}

impl BlockArena {
    pub(crate) fn insert(&mut self, block: Block) -> BlockId {
        self.occupied += 1;
        if let Some(id) = self.free.pop() {
            self.slots[id.index()] = Some(block);
            return id;
        }
        let id = BlockId(u32::try_from(self.slots.len()).unwrap_or(u32::MAX));
        self.slots.push(Some(block));
        id
    }

    pub(crate) fn get(&self, id: BlockId) -> Option<&Block> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    pub(crate) fn get_mut(&mut self, id: BlockId) -> Option<&mut Block> {
        self.slots.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Reclaim the slot of `id`.
    pub(crate) fn remove(&mut self, id: BlockId) -> Option<Block> {
        let block = self.slots.get_mut(id.index())?.take()?;
        self.occupied -= 1;
        self.free.push(id);
        Some(block)
    }

    /// Number of slots, occupied or not; handles index below this.
    pub(crate) const fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) const fn len(&self) -> usize {
        self.occupied
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (BlockId, &Block)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.as_ref().map(|b| (BlockId(i as u32), b)))
    }

    /// Occupied handles among slot indices `range`.
    pub(crate) fn ids_in(&self, range: Range<usize>) -> Vec<BlockId> {
        let end = range.end.min(self.slots.len());
        (range.start.min(end)..end)
            .filter(|&i| self.slots[i].is_some())
            .map(|i| BlockId(i as u32))
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.occupied = 0;
    }
}
