//! Phased reclamation of code buffer regions.
//!
//! The code area is split into equal regions. While the write cursor fills
//! one region, the next one is emptied a few chunks per compile: first the
//! links into and out of its blocks are undone, then hash entries pointing
//! at them are dropped, then the blocks leave their page lists and their
//! arena slots are reclaimed. Code the cursor is about to write over is
//! always empty first; if the incremental work falls behind, the remainder
//! runs at once. Blocks the cursor already wrote in the current lap stay.

use std::ops::Range;

use drc_state::InvalidCode;
use tracing::{debug, trace};

use super::BlockCache;
use super::arena::BlockId;

/// Chunks each phase is split into.
pub(crate) const CHUNKS: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    Links,
    Hash,
    Blocks,
}

#[derive(Clone, Debug)]
pub(crate) struct Active {
    pub(crate) region: usize,
    pub(crate) range: Range<usize>,
    pub(crate) phase: Phase,
    pub(crate) chunk: usize,
}

/// Region bookkeeping.
#[derive(Clone, Debug)]
pub(crate) struct Expiry {
    code_start: usize,
    region_size: usize,
    regions: usize,
    /// Region may hold blocks.
    occupied: Vec<bool>,
    /// Offsets below this were emptied or written during the current lap.
    swept: usize,
    pub(crate) active: Option<Active>,
}

impl Expiry {
    pub(crate) fn new(code_start: usize, code_end: usize, regions: usize) -> Self {
        let region_size = (code_end - code_start).div_ceil(regions);
        Self {
            code_start,
            region_size,
            regions,
            occupied: vec![false; regions],
            swept: code_start,
            active: None,
        }
    }

    pub(crate) fn region_of(&self, offset: usize) -> usize {
        (offset.saturating_sub(self.code_start) / self.region_size).min(self.regions - 1)
    }

    pub(crate) fn region_range(&self, region: usize) -> Range<usize> {
        let start = self.code_start + region * self.region_size;
        start..start + self.region_size
    }

    /// Regions overlapping code offsets `range`.
    pub(crate) fn regions_in(&self, range: &Range<usize>) -> Range<usize> {
        if range.is_empty() {
            return 0..0;
        }
        self.region_of(range.start)..self.region_of(range.end - 1) + 1
    }

    pub(crate) fn mark_occupied(&mut self, range: &Range<usize>) {
        for r in self.regions_in(range) {
            self.occupied[r] = true;
        }
    }

    pub(crate) const fn next_region(&self, region: usize) -> usize {
        (region + 1) % self.regions
    }

    /// Whether code in `range` belongs to the region being reclaimed.
    pub(crate) fn reclaiming(&self, range: &Range<usize>) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| range.start < a.range.end && a.range.start < range.end)
    }

    /// The cursor went back to the start of the code area.
    pub(crate) const fn wrapped(&mut self) {
        self.swept = self.code_start;
    }

    pub(crate) fn reset(&mut self) {
        self.occupied.fill(false);
        self.swept = self.code_start;
        self.active = None;
    }
}

impl BlockCache {
    /// Start reclaiming `region` unless it is empty or already being reclaimed.
    pub(crate) fn begin_expiry(&mut self, region: usize, code: &mut [u8], invalid: &mut InvalidCode) {
        let range = self.expiry.region_range(region);
        self.begin_expiry_in(region, range, code, invalid);
    }

    /// Start reclaiming the part `range` of `region`.
    fn begin_expiry_in(
        &mut self,
        region: usize,
        range: Range<usize>,
        code: &mut [u8],
        invalid: &mut InvalidCode,
    ) {
        if !self.expiry.occupied[region] || self.expiry.active.as_ref().is_some_and(|a| a.region == region) {
            return;
        }
        if self.expiry.active.is_some() {
            self.finish_expiry(code, invalid);
        }
        trace!(region, start = range.start, end = range.end, "expiry started");
        self.expiry.active = Some(Active {
            region,
            range,
            phase: Phase::Links,
            chunk: 0,
        });
    }

    /// Run up to `steps` chunks of the active expiration.
    pub(crate) fn expire_steps(&mut self, steps: usize, code: &mut [u8], invalid: &mut InvalidCode) {
        for _ in 0..steps {
            if !self.expire_chunk(code, invalid) {
                break;
            }
        }
    }

    pub(crate) fn finish_expiry(&mut self, code: &mut [u8], invalid: &mut InvalidCode) {
        while self.expire_chunk(code, invalid) {}
    }

    /// Make sure no block from an earlier lap occupies code offsets
    /// `range`, which starts at the write cursor.
    ///
    /// Each overlapped region is emptied from the cursor (or from where the
    /// last sweep stopped) to its end; blocks below the cursor were written
    /// during this lap and are kept.
    pub(crate) fn ensure_expired(&mut self, range: &Range<usize>, code: &mut [u8], invalid: &mut InvalidCode) {
        for region in self.expiry.regions_in(range) {
            let full = self.expiry.region_range(region);
            let from = full.start.max(self.expiry.swept).max(range.start);
            if from >= full.end {
                continue;
            }
            if self.expiry.occupied[region] {
                self.begin_expiry_in(region, from..full.end, code, invalid);
                self.finish_expiry(code, invalid);
            }
            self.expiry.swept = self.expiry.swept.max(full.end);
        }
    }

    /// One chunk of work; false once nothing is left.
    fn expire_chunk(&mut self, code: &mut [u8], invalid: &mut InvalidCode) -> bool {
        let Some(active) = self.expiry.active.clone() else { return false };
        let total = match active.phase {
            Phase::Links | Phase::Blocks => self.arena.capacity(),
            Phase::Hash => self.hash.bucket_count(),
        };
        let per_chunk = total.div_ceil(CHUNKS).max(1);
        let span = active.chunk * per_chunk..(active.chunk + 1) * per_chunk;
        match active.phase {
            Phase::Links => {
                for id in self.doomed(span, &active.range) {
                    self.unlink(id, code);
                }
            }
            Phase::Hash => {
                for index in span.start..span.end.min(total) {
                    let arena = &self.arena;
                    let range = &active.range;
                    self.hash.retain_bucket(index, |e| {
                        arena.get(e.block).is_some_and(|b| !b.code_overlaps(range))
                    });
                }
            }
            Phase::Blocks => {
                for id in self.doomed(span, &active.range) {
                    self.reclaim(id, invalid);
                }
            }
        }

        let next_chunk = active.chunk + 1;
        let next = if next_chunk < CHUNKS {
            Some((active.phase, next_chunk))
        } else {
            match active.phase {
                Phase::Links => Some((Phase::Hash, 0)),
                Phase::Hash => Some((Phase::Blocks, 0)),
                Phase::Blocks => None,
            }
        };
        match next {
            Some((phase, chunk)) => {
                if let Some(a) = self.expiry.active.as_mut() {
                    a.phase = phase;
                    a.chunk = chunk;
                }
            }
            None => {
                debug!(region = active.region, start = active.range.start, "region expired");
                // a partial sweep leaves this lap's blocks below the cursor
                if active.range.start == self.expiry.region_range(active.region).start {
                    self.expiry.occupied[active.region] = false;
                }
                self.expiry.active = None;
            }
        }
        true
    }

    fn doomed(&self, slots: Range<usize>, range: &Range<usize>) -> Vec<BlockId> {
        self.arena
            .ids_in(slots)
            .into_iter()
            .filter(|&id| self.arena.get(id).is_some_and(|b| b.code_overlaps(range)))
            .collect()
    }
}
