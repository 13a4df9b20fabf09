//! Block scanning.
//!
//! A block starts at an entry address and extends until an unconditional
//! control transfer, the end of the entry page (a delay slot may cross it),
//! an invalid encoding or the length cap. Scanning continues past an
//! unconditional jump when an earlier branch in the block targets code
//! further down the page, and past a call so the return address can be
//! entered directly.

use std::ops::RangeInclusive;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace, warn};

use drc_ir::{InstrKind, InstrRecord};
use drc_isa::{GuestIsa, IsaKind};

use crate::{DecodeError, PAGE_SIZE, Result, page_of};
use crate::source::CodeSource;

/// Default maximum number of guest instructions per block.
pub const DEFAULT_MAX_INSTRS: usize = 4096;

/// Block scanning limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScanConfig {
    /// Maximum number of instructions (a trailing delay slot may exceed it by one).
    pub max_instrs: usize,
    /// Continue scanning after calls at their return address.
    pub follow_calls: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_instrs: DEFAULT_MAX_INSTRS,
            follow_calls: true,
        }
    }
}

impl ScanConfig {
    #[must_use]
    pub const fn with_max_instrs(mut self, max_instrs: usize) -> Self {
        self.max_instrs = max_instrs;
        self
    }

    #[must_use]
    pub const fn with_follow_calls(mut self, follow: bool) -> Self {
        self.follow_calls = follow;
        self
    }
}

/// Why scanning stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// Unconditional control transfer with no known code beyond it.
    Unconditional,
    /// Reached the end of the entry page.
    PageBoundary,
    /// Reached the instruction cap.
    LengthCap,
    /// Next instruction is not in mapped memory.
    Unmapped,
    /// Next instruction is a known literal-pool word.
    Data,
    /// Cut short so no branch lands inside a delay slot.
    Truncated,
}

/// Literal-pool bytes read by folded PC-relative loads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataRange {
    pub addr: u32,
    pub len: u32,
}

/// Instructions of one block plus control-flow facts needed by later passes.
#[derive(Clone, Debug)]
pub struct DecodedBlock {
    pub isa: IsaKind,
    /// Entry address.
    pub start: u32,
    /// Address just past the last instruction.
    pub end: u32,
    pub instrs: Vec<InstrRecord>,
    /// Index of the branch target for branches whose target lies in the block.
    pub target_index: Vec<Option<usize>>,
    /// Instruction is reached by a branch or is an extra entry point.
    pub is_target: Vec<bool>,
    /// Indices entered directly from the dispatcher (call return addresses).
    pub entry_points: Vec<usize>,
    pub data_ranges: Vec<DataRange>,
    pub stop: StopReason,
}

impl DecodedBlock {
    #[must_use]
    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    /// Index of the instruction at `addr`.
    #[must_use]
    pub fn index_of(&self, addr: u32) -> Option<usize> {
        self.instrs.binary_search_by_key(&addr, |r| r.addr).ok()
    }

    /// Whether `addr` lies inside the guest range the block was built from.
    #[must_use]
    pub const fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Guest pages whose contents the translation depends on.
    #[must_use]
    pub fn covered_pages(&self) -> RangeInclusive<u32> {
        let last = self
            .data_ranges
            .iter()
            .map(|d| d.addr + d.len - 1)
            .fold(self.end.saturating_sub(1), u32::max);
        page_of(self.start)..=page_of(last)
    }

    /// Instruction `i` is the delay slot executed with branch `i - 1`.
    #[must_use]
    pub fn is_paired_ds(&self, i: usize) -> bool {
        i > 0 && i < self.len() && self.instrs[i].is_ds && self.instrs[i - 1].has_delay_slot()
    }

    /// Last index of the branch/delay-slot pair starting at `i`.
    #[must_use]
    pub fn pair_end(&self, i: usize) -> usize {
        if self.is_paired_ds(i + 1) { i + 1 } else { i }
    }

    /// Control merges here: the block start or a branch target.
    #[must_use]
    pub fn is_join(&self, i: usize) -> bool {
        i == 0 || self.is_target[i]
    }

    /// Internal target reached when branch `i` is taken.
    #[must_use]
    pub fn taken_index(&self, i: usize) -> Option<usize> {
        match self.instrs[i].kind {
            InstrKind::JumpReg { .. } => None,
            _ => self.target_index[i],
        }
    }

    /// Instruction whose outgoing state reaches `i` by sequential flow.
    ///
    /// A delay slot is reached from its branch. The instruction after a
    /// likely branch pair is reached from the branch itself, since the slot
    /// only runs on the taken path.
    #[must_use]
    pub fn fall_source(&self, i: usize) -> Option<usize> {
        if i == 0 || i >= self.len() {
            return None;
        }
        if self.is_paired_ds(i) {
            return Some(i - 1);
        }
        let prev = i - 1;
        if self.instrs[prev].next_addr() != self.instrs[i].addr {
            return None;
        }
        if self.is_paired_ds(prev) {
            let branch = &self.instrs[prev - 1];
            return if branch.is_unconditional() {
                None
            } else if branch.is_likely() {
                Some(prev - 1)
            } else {
                Some(prev)
            };
        }
        (!self.instrs[prev].is_unconditional()).then_some(prev)
    }

    /// Execution can run off the end of the block into the next instruction.
    #[must_use]
    pub fn falls_through(&self) -> bool {
        let Some(last) = self.instrs.last() else {
            return false;
        };
        let owner = if last.is_ds {
            &self.instrs[self.instrs.len() - 2]
        } else {
            last
        };
        !owner.is_unconditional()
    }
}

/// Scan the block entered at `start`.
///
/// # Errors
///
/// Returns an error if `start` is misaligned or not backed by guest memory.
pub fn scan_block(
    isa: IsaKind,
    src: &dyn CodeSource,
    start: u32,
    config: &ScanConfig,
) -> Result<DecodedBlock> {
    let decoder = isa.decoder();
    let size = decoder.insn_size();
    if start % size != 0 {
        return Err(DecodeError::Misaligned { addr: start, align: size });
    }
    if src.fetch(start, size).is_none() {
        return Err(DecodeError::Unmapped(start));
    }

    let mut scanner = Scanner::new(decoder, src, start, config);
    scanner.run(start);
    let block = scanner.finish(isa, start);
    debug!(
        isa = %isa,
        start = format_args!("{start:#010x}"),
        end = format_args!("{:#010x}", block.end),
        instrs = block.len(),
        stop = ?block.stop,
        "scanned block"
    );
    Ok(block)
}

struct Scanner<'a> {
    decoder: &'static dyn GuestIsa,
    src: &'a dyn CodeSource,
    config: &'a ScanConfig,
    page_start: u32,
    page_end: u64,
    instrs: Vec<InstrRecord>,
    /// Data ranges tagged with the index of the instruction that reads them.
    data: Vec<(usize, DataRange)>,
    /// Addresses of 16-bit units occupied by literals.
    literals: FxHashSet<u32>,
    return_addrs: Vec<u32>,
    stop: StopReason,
}

impl<'a> Scanner<'a> {
    fn new(
        decoder: &'static dyn GuestIsa,
        src: &'a dyn CodeSource,
        start: u32,
        config: &'a ScanConfig,
    ) -> Self {
        let page_start = start & !(PAGE_SIZE - 1);
        Self {
            decoder,
            src,
            config,
            page_start,
            page_end: u64::from(page_start) + u64::from(PAGE_SIZE),
            instrs: Vec::new(),
            data: Vec::new(),
            literals: FxHashSet::default(),
            return_addrs: Vec::new(),
            stop: StopReason::Unconditional,
        }
    }

    fn in_page(&self, addr: u32) -> bool {
        addr >= self.page_start && u64::from(addr) < self.page_end
    }

    fn decode(&mut self, addr: u32, raw: u32) -> InstrRecord {
        let mut rec = self.decoder.decode(addr, raw);
        self.fold_literal(&mut rec);
        rec
    }

    /// Turn a PC-relative load whose literal lies in the entry page into a constant.
    fn fold_literal(&mut self, rec: &mut InstrRecord) {
        let Some(lit) = self.decoder.literal_address(rec) else {
            return;
        };
        let InstrKind::Load { size, .. } = rec.kind else {
            return;
        };
        let len = size.bytes();
        if !self.in_page(lit) || !self.in_page(lit + len - 1) {
            return;
        }
        let Some(value) = self.src.fetch(lit, len) else {
            return;
        };
        rec.imm = match len {
            1 => i64::from(value as u8 as i8),
            2 => i64::from(value as u16 as i16),
            _ => i64::from(value as i32),
        };
        rec.kind = InstrKind::LoadConst;
        rec.rs1 = None;
        rec.rs2 = None;
        self.data
            .push((self.instrs.len(), DataRange { addr: lit, len }));
        for unit in (lit..lit + len).step_by(2) {
            self.literals.insert(unit);
        }
        trace!(
            addr = format_args!("{:#010x}", rec.addr),
            literal = format_args!("{lit:#010x}"),
            value = rec.imm,
            "folded literal load"
        );
    }

    fn run(&mut self, start: u32) {
        let size = self.decoder.insn_size();
        let max = self.config.max_instrs.max(1);
        let mut addr = start;
        loop {
            if self.instrs.len() >= max {
                self.stop = StopReason::LengthCap;
                return;
            }
            if u64::from(addr) >= self.page_end {
                self.stop = StopReason::PageBoundary;
                return;
            }
            if self.literals.contains(&addr) {
                self.stop = StopReason::Data;
                return;
            }
            let Some(raw) = self.src.fetch(addr, size) else {
                warn!(addr = format_args!("{addr:#010x}"), "decode stopped on unmapped address");
                self.stop = StopReason::Unmapped;
                return;
            };
            let rec = self.decode(addr, raw);
            let after = if rec.has_delay_slot() {
                let ds_addr = rec.next_addr();
                let ds = self
                    .src
                    .fetch(ds_addr, size)
                    .map(|raw| self.decode(ds_addr, raw));
                match ds {
                    Some(ds) if pairable(&rec, &ds) => {
                        let mut branch = rec;
                        let mut ds = ds;
                        // the link is written before the slot runs, so a link that is
                        // also a source needs the captured copy too
                        branch.ds_clobbers = (ds.writes() | branch.writes()) & branch.reads() != 0;
                        ds.is_ds = true;
                        let after = ds.next_addr();
                        self.instrs.push(branch);
                        self.instrs.push(ds);
                        after
                    }
                    _ => {
                        trace!(
                            addr = format_args!("{addr:#010x}"),
                            "branch and delay slot left to the interpreter"
                        );
                        self.data.retain(|&(i, _)| i < self.instrs.len());
                        self.instrs.push(interpret_pair(rec));
                        self.stop = StopReason::Unconditional;
                        return;
                    }
                }
            } else {
                let after = rec.next_addr();
                self.instrs.push(rec);
                after
            };

            let last = self.owner_of_last();
            if !last.is_unconditional() {
                addr = after;
                continue;
            }
            if last.is_call() && self.follow_call(after) {
                self.return_addrs.push(after);
                addr = after;
                continue;
            }
            if matches!(last.kind, InstrKind::Jump { .. } | InstrKind::JumpReg { .. })
                && self.branched_to(after)
            {
                trace!(addr = format_args!("{after:#010x}"), "continuing at earlier branch target");
                addr = after;
                continue;
            }
            self.stop = StopReason::Unconditional;
            return;
        }
    }

    fn owner_of_last(&self) -> &InstrRecord {
        let n = self.instrs.len();
        if n >= 2 && self.instrs[n - 1].is_ds {
            &self.instrs[n - 2]
        } else {
            &self.instrs[n - 1]
        }
    }

    fn follow_call(&self, ret: u32) -> bool {
        self.config.follow_calls
            && self.instrs.len() < self.config.max_instrs / 2
            && self.in_page(ret)
            && !self.src.is_compiled(ret)
    }

    /// Whether a branch before the terminating transfer targets `after`,
    /// the address right behind it.
    fn branched_to(&self, after: u32) -> bool {
        let n = self.instrs.len();
        let owner = if n >= 2 && self.instrs[n - 1].is_ds { n - 2 } else { n - 1 };
        self.in_page(after)
            && !self.literals.contains(&after)
            && self.instrs[..owner].iter().any(|r| r.target == Some(after))
    }

    fn finish(mut self, isa: IsaKind, start: u32) -> DecodedBlock {
        let mut external: FxHashSet<u32> = FxHashSet::default();
        let target_index = loop {
            let index: FxHashMap<u32, usize> = self
                .instrs
                .iter()
                .enumerate()
                .map(|(i, r)| (r.addr, i))
                .collect();
            let mut targets = vec![None; self.instrs.len()];
            let mut into_ds = None;
            for (i, rec) in self.instrs.iter().enumerate() {
                let Some(t) = rec.target.filter(|t| !external.contains(t)) else {
                    continue;
                };
                let Some(&ti) = index.get(&t) else {
                    continue;
                };
                if self.instrs[ti].is_ds {
                    into_ds = into_ds.min(Some(ti)).or(Some(ti));
                } else {
                    targets[i] = Some(ti);
                }
            }
            let Some(ds) = into_ds else {
                break targets;
            };
            let owner = ds - 1;
            if owner == 0 {
                external.insert(self.instrs[ds].addr);
            } else {
                debug!(
                    at = format_args!("{:#010x}", self.instrs[owner].addr),
                    "branch into delay slot, truncating block"
                );
                self.instrs.truncate(owner);
                self.data.retain(|&(i, _)| i < owner);
                self.stop = StopReason::Truncated;
            }
        };

        let mut is_target = vec![false; self.instrs.len()];
        for t in target_index.iter().flatten() {
            is_target[*t] = true;
        }
        let mut entry_points = Vec::new();
        for ret in &self.return_addrs {
            if let Ok(i) = self.instrs.binary_search_by_key(ret, |r| r.addr)
                && !self.instrs[i].is_ds
            {
                is_target[i] = true;
                entry_points.push(i);
            }
        }
        let end = self
            .instrs
            .last()
            .map_or(start, InstrRecord::next_addr);
        DecodedBlock {
            isa,
            start,
            end,
            instrs: self.instrs,
            target_index,
            is_target,
            entry_points,
            data_ranges: self.data.into_iter().map(|(_, d)| d).collect(),
            stop: self.stop,
        }
    }
}

/// A delay slot can be compiled with its branch unless it is itself a
/// branch, needs the interpreter or touches the branch's link register.
fn pairable(branch: &InstrRecord, ds: &InstrRecord) -> bool {
    if ds.is_branch() || ds.is_unconditional() || ds.flushes_all() {
        return false;
    }
    let link = branch.rt1.map_or(0, drc_ir::VReg::bit);
    (ds.reads() | ds.writes()) & link == 0
}

/// Replace a branch whose delay slot cannot be compiled with an
/// interpreter call covering both instructions.
fn interpret_pair(branch: InstrRecord) -> InstrRecord {
    let mut rec = InstrRecord::new(
        branch.addr,
        branch.raw,
        branch.size,
        InstrKind::Interp { ends_block: true },
    );
    rec.cycles = branch.cycles.saturating_add(1);
    rec
}
