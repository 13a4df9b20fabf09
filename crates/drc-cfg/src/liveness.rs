//! Backward liveness ("unneeded register") analysis.
//!
//! A register is unneeded at a point when its current value is never read
//! again before being overwritten or before control leaves the block in a
//! way that does not care about it. Branches intersect the sets of both
//! successors. Backward branches re-analyze the loop body with bounded
//! recursion, after which a settling sweep enforces the dataflow equations
//! so the result never claims a live value dead.

use tracing::{trace, trace_span};

use drc_ir::sh2::{SR, TBIT};
use drc_ir::{BTREG, InstrRecord, RegMask};
use drc_isa::IsaKind;

use crate::scan::DecodedBlock;

/// Default recursion depth for backward branches.
pub const DEFAULT_LIVENESS_DEPTH: u32 = 2;

/// Registers that carry nothing once control leaves a block.
#[must_use]
pub const fn exit_unneeded(isa: IsaKind) -> RegMask {
    match isa {
        // $zero is hard-wired
        IsaKind::Mips => 1 | BTREG.bit(),
        IsaKind::Sh2 => BTREG.bit(),
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Masks {
    lower: RegMask,
    upper: RegMask,
}

impl Masks {
    const fn and(self, other: Self) -> Self {
        Self {
            lower: self.lower & other.lower,
            upper: self.upper & other.upper,
        }
    }
}

struct Step {
    at: usize,
    before: Masks,
    after: Masks,
    ds: Option<(Masks, Masks)>,
}

/// Per-instruction unneeded-register masks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Liveness {
    /// Lower halves unneeded before each instruction.
    pub before: Vec<RegMask>,
    /// Lower halves unneeded after each instruction.
    pub after: Vec<RegMask>,
    /// Upper halves unneeded before each instruction.
    pub before_upper: Vec<RegMask>,
    /// Upper halves unneeded after each instruction.
    pub after_upper: Vec<RegMask>,
}

impl Liveness {
    /// Analyze `block`, following backward branches `max_depth` levels deep.
    #[must_use]
    pub fn analyze(block: &DecodedBlock, max_depth: u32) -> Self {
        let _span = trace_span!("liveness", start = format_args!("{:#010x}", block.start)).entered();
        let n = block.len();
        let mut analyzer = Analyzer {
            block,
            exit: Masks {
                lower: exit_unneeded(block.isa),
                upper: if block.isa == IsaKind::Mips {
                    exit_unneeded(block.isa)
                } else {
                    RegMask::MAX
                },
            },
            flags: block.isa == IsaKind::Sh2,
            max_depth,
            before: vec![Masks::default(); n],
            after: vec![Masks::default(); n],
        };
        if n > 0 {
            analyzer.sweep(0, n - 1, 0);
            analyzer.settle();
        }
        Self {
            before: analyzer.before.iter().map(|m| m.lower).collect(),
            after: analyzer.after.iter().map(|m| m.lower).collect(),
            before_upper: analyzer.before.iter().map(|m| m.upper).collect(),
            after_upper: analyzer.after.iter().map(|m| m.upper).collect(),
        }
    }

    /// Whether `reg`'s value is dead right after instruction `i`.
    #[must_use]
    pub fn unneeded_after(&self, i: usize, reg: drc_ir::VReg) -> bool {
        let mask = if reg.is_upper() { self.after_upper[i] } else { self.after[i] };
        mask & reg.bit() != 0
    }
}

struct Analyzer<'a> {
    block: &'a DecodedBlock,
    exit: Masks,
    /// `T` is needed whenever `SR` is.
    flags: bool,
    max_depth: u32,
    before: Vec<Masks>,
    after: Vec<Masks>,
}

impl Analyzer<'_> {
    fn instr(&self, i: usize) -> &InstrRecord {
        &self.block.instrs[i]
    }

    /// Unneeded set on entry to instruction `i` (block exit past the end).
    fn entry(&self, i: usize) -> Masks {
        if i < self.block.len() { self.before[i] } else { self.exit }
    }

    fn taken(&self, i: usize) -> Masks {
        self.block.taken_index(i).map_or(self.exit, |t| self.before[t])
    }

    fn fix_flags(&self, mut m: Masks) -> Masks {
        if self.flags && m.lower & SR.bit() == 0 {
            m.lower &= !TBIT.bit();
        }
        m
    }

    fn transfer(&self, m: Masks, rec: &InstrRecord) -> Masks {
        let writes = rec.writes();
        self.fix_flags(Masks {
            lower: (m.lower | writes) & !rec.reads(),
            upper: (m.upper | writes) & !rec.reads_upper(),
        })
    }

    fn step(&self, i: usize) -> Step {
        let rec = self.instr(i);
        let end = self.block.pair_end(i);
        let fall = (!rec.is_unconditional()).then(|| self.entry(end + 1));

        if rec.flushes_all() {
            return Step {
                at: i,
                before: self.exit,
                after: fall.unwrap_or(self.exit),
                ds: None,
            };
        }
        if !rec.is_branch() {
            let after = self.entry(i + 1);
            return Step {
                at: i,
                before: self.transfer(after, rec),
                after,
                ds: None,
            };
        }

        let taken = self.taken(i);
        let link = rec.writes();
        if end == i {
            let after = fall.map_or(taken, |f| taken.and(f));
            return Step {
                at: i,
                before: self.transfer(after, rec),
                after,
                ds: None,
            };
        }

        let ds = self.instr(end);
        let ds_after = if rec.is_likely() {
            taken
        } else {
            fall.map_or(taken, |f| taken.and(f))
        };
        let ds_after = self.fix_flags(ds_after);
        let mut ds_before = self.transfer(ds_after, ds);
        // branch operands stay live until the branch resolves after the slot
        if rec.ds_clobbers {
            ds_before.lower &= !BTREG.bit();
        } else {
            ds_before.lower &= !rec.reads();
            ds_before.upper &= !rec.reads_upper();
        }
        let ds_before = self.fix_flags(ds_before);
        let mut after = ds_before;
        if rec.is_likely()
            && let Some(f) = fall
        {
            after = after.and(f);
        }
        let after = self.fix_flags(after);
        // the link is written by the branch itself, ahead of the slot
        let before = self.fix_flags(Masks {
            lower: (after.lower | link) & !rec.reads(),
            upper: (after.upper | link) & !rec.reads_upper(),
        });
        Step {
            at: i,
            before,
            after,
            ds: Some((ds_before, ds_after)),
        }
    }

    fn apply(&mut self, s: &Step) {
        self.before[s.at] = s.before;
        self.after[s.at] = s.after;
        if let Some((b, a)) = s.ds {
            self.before[s.at + 1] = b;
            self.after[s.at + 1] = a;
        }
    }

    /// Intersect with the recomputed step; reports whether anything changed.
    fn narrow(&mut self, s: &Step) -> bool {
        let mut changed = false;
        let mut meet = |slot: &mut Masks, m: Masks| {
            let next = slot.and(m);
            changed |= next != *slot;
            *slot = next;
        };
        meet(&mut self.before[s.at], s.before);
        meet(&mut self.after[s.at], s.after);
        if let Some((b, a)) = s.ds {
            meet(&mut self.before[s.at + 1], b);
            meet(&mut self.after[s.at + 1], a);
        }
        changed
    }

    fn sweep(&mut self, lo: usize, hi: usize, depth: u32) {
        let mut i = hi + 1;
        while i > lo {
            i -= 1;
            if self.block.is_paired_ds(i) {
                continue;
            }
            let rec = self.instr(i);
            let backward = self.block.target_index[i].filter(|&t| t <= i);
            if let Some(t) = backward
                && rec.is_branch()
            {
                // Assume the loop exits, analyze the body, then merge the back edge.
                let end = self.block.pair_end(i);
                let seed = if rec.is_unconditional() {
                    self.exit
                } else {
                    self.entry(end + 1)
                };
                self.before[i] = seed;
                self.after[i] = seed;
                if depth < self.max_depth && t < i {
                    self.sweep(t, i - 1, depth + 1);
                } else {
                    self.before[t] = Masks::default();
                }
            }
            let step = self.step(i);
            self.apply(&step);
        }
    }

    /// Shrink the masks until every instruction satisfies its transfer equation.
    fn settle(&mut self) {
        let n = self.block.len();
        let mut rounds = 0;
        loop {
            let mut changed = false;
            for i in (0..n).rev() {
                if self.block.is_paired_ds(i) {
                    continue;
                }
                let step = self.step(i);
                changed |= self.narrow(&step);
            }
            rounds += 1;
            if !changed {
                break;
            }
        }
        trace!(rounds, "liveness settled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ImageSource, ScanConfig, scan_block};
    use drc_ir::mips::{RA, gpr};
    use drc_ir::sh2;
    use drc_isa::encode::{mips, sh2 as sh};

    const BASE: u32 = 0x8000_1000;

    fn live_mips(words: &[u32]) -> (DecodedBlock, Liveness) {
        let bytes = mips::assemble(words);
        let src = ImageSource::new(BASE, &bytes);
        let block = scan_block(IsaKind::Mips, &src, BASE, &ScanConfig::default()).unwrap();
        let live = Liveness::analyze(&block, DEFAULT_LIVENESS_DEPTH);
        (block, live)
    }

    #[test]
    fn test_overwritten_value_is_unneeded() {
        let (_, live) = live_mips(&[
            mips::addiu(2, 0, 1),
            mips::addiu(2, 0, 2),
            mips::jr(31),
            mips::nop(),
        ]);
        assert!(live.unneeded_after(0, gpr(2)));
        assert!(!live.unneeded_after(1, gpr(2)));
    }

    #[test]
    fn test_exit_needs_guest_registers() {
        let (_, live) = live_mips(&[mips::addiu(2, 0, 1), mips::jr(31), mips::nop()]);
        let last = live.after.len() - 1;
        assert_eq!(live.after[last], exit_unneeded(IsaKind::Mips));
        assert!(live.unneeded_after(last, BTREG));
        // the jump target stays live through the delay slot
        assert!(!live.unneeded_after(1, RA));
    }

    #[test]
    fn test_read_makes_register_needed() {
        let (_, live) = live_mips(&[
            mips::addiu(2, 0, 1),
            mips::addu(3, 2, 2),
            mips::addiu(2, 0, 9),
            mips::addiu(3, 0, 9),
            mips::jr(31),
            mips::nop(),
        ]);
        assert!(!live.unneeded_after(0, gpr(2)));
        assert!(live.unneeded_after(1, gpr(2)));
        assert!(live.unneeded_after(0, gpr(3)));
        assert!(live.unneeded_after(2, gpr(3)));
    }

    #[test]
    fn test_loop_dead_register_found() {
        let (block, live) = live_mips(&[
            mips::addiu(4, 0, 0),
            mips::addiu(2, 2, 1),
            mips::bne(2, 3, -2),
            mips::nop(),
            mips::addiu(4, 0, 5),
            mips::jr(31),
            mips::nop(),
        ]);
        assert_eq!(block.target_index[2], Some(1));
        assert!(live.unneeded_after(0, gpr(4)));
        assert!(!live.unneeded_after(3, gpr(2)));
        assert!(!live.unneeded_after(3, gpr(3)));
    }

    #[test]
    fn test_loop_carried_value_stays_needed() {
        // r6 is read at the loop head and written at the bottom.
        let (_, live) = live_mips(&[
            mips::addu(5, 6, 6),
            mips::addiu(6, 0, 1),
            mips::bne(5, 0, -3),
            mips::nop(),
            mips::addiu(6, 0, 2),
            mips::jr(31),
            mips::nop(),
        ]);
        assert!(!live.unneeded_after(1, gpr(6)));
        assert!(!live.unneeded_after(3, gpr(6)));
    }

    #[test]
    fn test_delay_slot_clobber_keeps_btreg_live() {
        let (block, live) = live_mips(&[mips::beq(2, 3, 4), mips::addiu(2, 0, 0), mips::jr(31), mips::nop()]);
        assert!(block.instrs[0].ds_clobbers);
        assert!(!live.unneeded_after(0, BTREG));
    }

    #[test]
    fn test_branch_sources_live_through_delay_slot() {
        let (_, live) = live_mips(&[mips::beq(2, 3, 4), mips::addiu(4, 0, 0), mips::jr(31), mips::nop()]);
        assert!(!live.unneeded_after(0, gpr(2)));
        assert!(!live.unneeded_after(0, gpr(3)));
    }

    #[test]
    fn test_wide_reads_keep_upper_halves() {
        let (_, live) = live_mips(&[
            mips::daddu(4, 2, 3),
            mips::addu(5, 2, 3),
            mips::addiu(4, 0, 0),
            mips::addiu(5, 0, 0),
            mips::addiu(2, 0, 0),
            mips::addiu(3, 0, 0),
            mips::jr(31),
            mips::nop(),
        ]);
        assert!(!live.unneeded_after(0, gpr(2)));
        assert!(live.unneeded_after(0, gpr(2).upper()));
    }

    #[test]
    fn test_sh2_t_bit_follows_sr() {
        let base = 0x0600_0000;
        let bytes = sh::assemble(&[
            sh::cmp_eq(1, 2),
            sh::bf(1),
            sh::add(1, 1),
            sh::nop(),
            sh::rts(),
            sh::nop(),
        ]);
        let src = ImageSource::new(base, &bytes);
        let block = scan_block(IsaKind::Sh2, &src, base, &ScanConfig::default()).unwrap();
        let live = Liveness::analyze(&block, DEFAULT_LIVENESS_DEPTH);
        assert!(!live.unneeded_after(0, sh2::TBIT));
        // SR (and so T) is needed at exit
        let last = block.len() - 1;
        assert!(!live.unneeded_after(last, sh2::TBIT));
        assert!(live.after_upper.iter().all(|&m| m == RegMask::MAX));
    }

    #[test]
    fn test_interpreted_instruction_needs_everything() {
        // DMULT runs in the interpreter, which reads the backing store.
        let dmult = mips::special(2, 3, 0, 0, 28);
        let (_, live) = live_mips(&[
            mips::addiu(5, 0, 1),
            dmult,
            mips::addiu(5, 0, 2),
            mips::jr(31),
            mips::nop(),
        ]);
        assert_eq!(live.before[1], exit_unneeded(IsaKind::Mips));
        assert!(!live.unneeded_after(0, gpr(5)));
        assert!(live.unneeded_after(1, gpr(5)));
    }

    #[test]
    fn test_link_that_is_also_the_target_is_captured() {
        let (block, live) = live_mips(&[mips::jalr(31, 31), mips::nop()]);
        assert!(block.instrs[0].ds_clobbers);
        assert!(!live.unneeded_after(0, RA));
        assert!(!live.unneeded_after(0, BTREG));
        assert_eq!(live.before[0] & RA.bit(), 0);
    }
}
