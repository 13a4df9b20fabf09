//! Two-way associative address to code table.
//!
//! Each bucket keeps the two most recently inserted entries for its hash.
//! An entry pushed out of the young table drops into a second generation
//! of the same shape, and a hit there moves it back, so two hot addresses
//! colliding with a third do not thrash.

use super::arena::BlockId;

const WAYS: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HashEntry {
    pub addr: u32,
    /// Code offset to jump to.
    pub offset: usize,
    pub block: BlockId,
}

type Bucket = [Option<HashEntry>; WAYS];

pub(crate) struct HashTable {
    young: Box<[Bucket]>,
    old: Box<[Bucket]>,
    mask: usize,
}

impl HashTable {
    pub(crate) fn new(bits: u32) -> Self {
        let buckets = 1usize << bits;
        Self {
            young: vec![[None; WAYS]; buckets].into_boxed_slice(),
            old: vec![[None; WAYS]; buckets].into_boxed_slice(),
            mask: buckets - 1,
        }
    }

    #[inline]
    const fn bucket(&self, addr: u32) -> usize {
        ((addr >> 16) ^ addr) as usize & self.mask
    }

    pub(crate) const fn bucket_count(&self) -> usize {
        self.mask + 1
    }

    pub(crate) fn get(&mut self, addr: u32) -> Option<HashEntry> {
        let b = self.bucket(addr);
        if let Some(way) = self.young[b].iter().position(|e| e.is_some_and(|e| e.addr == addr)) {
            // most recently used first
            self.young[b].swap(0, way);
            return self.young[b][0];
        }
        let way = self.old[b].iter().position(|e| e.is_some_and(|e| e.addr == addr))?;
        let hit = self.old[b][way].take()?;
        self.insert(hit);
        Some(hit)
    }

    /// Entry for `addr` without reordering anything.
    pub(crate) fn peek(&self, addr: u32) -> Option<HashEntry> {
        let b = self.bucket(addr);
        self.young[b]
            .iter()
            .chain(self.old[b].iter())
            .flatten()
            .find(|e| e.addr == addr)
            .copied()
    }

    pub(crate) fn insert(&mut self, entry: HashEntry) {
        let b = self.bucket(entry.addr);
        remove_from(&mut self.old[b], entry.addr);
        let bucket = &mut self.young[b];
        if bucket[0].is_some_and(|e| e.addr == entry.addr) {
            bucket[0] = Some(entry);
            return;
        }
        let demoted = if bucket[1].is_some_and(|e| e.addr == entry.addr) {
            None
        } else {
            bucket[1]
        };
        bucket[1] = bucket[0];
        bucket[0] = Some(entry);
        if let Some(demoted) = demoted {
            let old = &mut self.old[b];
            old[1] = old[0];
            old[0] = Some(demoted);
        }
    }

    /// Remove the entry for `addr` if it belongs to `block`.
    pub(crate) fn remove(&mut self, addr: u32, block: BlockId) {
        let b = self.bucket(addr);
        for bucket in [&mut self.young[b], &mut self.old[b]] {
            for way in bucket.iter_mut() {
                if way.is_some_and(|e| e.addr == addr && e.block == block) {
                    *way = None;
                }
            }
            if bucket[0].is_none() {
                bucket.swap(0, 1);
            }
        }
    }

    /// Drop entries of bucket `index` (both generations) for which `keep` is false.
    pub(crate) fn retain_bucket(&mut self, index: usize, mut keep: impl FnMut(&HashEntry) -> bool) -> usize {
        let mut dropped = 0;
        for bucket in [&mut self.young[index], &mut self.old[index]] {
            for way in bucket.iter_mut() {
                if way.as_ref().is_some_and(|e| !keep(e)) {
                    *way = None;
                    dropped += 1;
                }
            }
            if bucket[0].is_none() {
                bucket.swap(0, 1);
            }
        }
        dropped
    }

    pub(crate) fn clear(&mut self) {
        self.young.fill([None; WAYS]);
        self.old.fill([None; WAYS]);
    }
}

fn remove_from(bucket: &mut Bucket, addr: u32) {
    for way in bucket.iter_mut() {
        if way.is_some_and(|e| e.addr == addr) {
            *way = None;
        }
    }
    if bucket[0].is_none() {
        bucket.swap(0, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::arena::BlockArena;

    fn ids(n: usize) -> Vec<BlockId> {
        let mut arena = BlockArena::default();
        (0..n).map(|i| arena.insert(crate::cache::tests::dummy_block(i as u32 * 0x10))).collect()
    }

    fn entry(addr: u32, block: BlockId) -> HashEntry {
        HashEntry { addr, offset: addr as usize, block }
    }

    #[test]
    fn test_insert_and_get() {
        let ids = ids(1);
        let mut table = HashTable::new(4);
        assert_eq!(table.get(0x8000_0000), None);
        table.insert(entry(0x8000_0000, ids[0]));
        assert_eq!(table.get(0x8000_0000).map(|e| e.block), Some(ids[0]));
        table.insert(HashEntry { offset: 7, ..entry(0x8000_0000, ids[0]) });
        assert_eq!(table.get(0x8000_0000).map(|e| e.offset), Some(7));
    }

    #[test]
    fn test_third_collision_moves_to_second_generation() {
        let ids = ids(3);
        let mut table = HashTable::new(4);
        // same bucket: only bits above the table mask differ
        let (a, b, c) = (0x1000, 0x2000, 0x3000);
        assert_eq!(table.bucket(a), table.bucket(b));
        assert_eq!(table.bucket(b), table.bucket(c));
        table.insert(entry(a, ids[0]));
        table.insert(entry(b, ids[1]));
        table.insert(entry(c, ids[2]));
        assert!(table.young[table.bucket(a)].iter().flatten().all(|e| e.addr != a));
        // still found, and promoted back on the hit
        assert_eq!(table.get(a).map(|e| e.block), Some(ids[0]));
        assert!(table.young[table.bucket(a)].iter().flatten().any(|e| e.addr == a));
        assert_eq!(table.peek(b).map(|e| e.block), Some(ids[1]));
        assert_eq!(table.peek(c).map(|e| e.block), Some(ids[2]));
    }

    #[test]
    fn test_remove_only_matching_block() {
        let ids = ids(2);
        let mut table = HashTable::new(4);
        table.insert(entry(0x40, ids[0]));
        table.remove(0x40, ids[1]);
        assert!(table.peek(0x40).is_some());
        table.remove(0x40, ids[0]);
        assert!(table.peek(0x40).is_none());
    }

    #[test]
    fn test_retain_bucket() {
        let ids = ids(2);
        let mut table = HashTable::new(4);
        table.insert(entry(0x40, ids[0]));
        table.insert(entry(0x41, ids[1]));
        let dropped = (0..table.bucket_count())
            .map(|i| table.retain_bucket(i, |e| e.block != ids[0]))
            .sum::<usize>();
        assert_eq!(dropped, 1);
        assert!(table.peek(0x40).is_none());
        assert!(table.peek(0x41).is_some());
    }
}
