//! Back-to-front dirty-bit settlement.
//!
//! At a merge point a slot may be declared dirty or clean. Dirty keeps
//! stores off the back edge of a loop that modifies the value; clean keeps
//! stores off every exit when the value is only read. A slot is declared
//! dirty exactly when, along every path, the value is overwritten in place
//! before its slot is reassigned. Dirty bits elsewhere are then derived
//! forward from the fixed slot maps.

use drc_cfg::{DecodedBlock, Liveness, exit_unneeded};
use drc_ir::{BTREG, HOST_CCREG, HOST_REGS, RegMask, RegStat, SlotMask, VReg};
use drc_isa::IsaKind;

use crate::CC_MASK;

fn same_slots(a: &[Option<VReg>; HOST_REGS], b: &[Option<VReg>; HOST_REGS]) -> SlotMask {
    (0..HOST_REGS)
        .filter(|&hr| a[hr].is_some() && a[hr] == b[hr])
        .fold(0, |m, hr| m | (1 << hr))
}

/// Whether instruction `i` writes `reg` (either half).
fn writes(block: &DecodedBlock, i: usize, reg: VReg) -> bool {
    let rec = &block.instrs[i];
    rec.writes() & reg.bit() != 0 || (reg == BTREG && rec.ds_clobbers)
}

/// Successors of `i` whose entry state follows `i`'s outgoing state.
fn successors(block: &DecodedBlock, i: usize) -> Vec<usize> {
    let mut out = Vec::with_capacity(2);
    for next in [i + 1, i + 2] {
        if block.fall_source(next) == Some(i) {
            out.push(next);
        }
    }
    let owner = if block.is_paired_ds(i) { i - 1 } else { i };
    if block.instrs[owner].is_branch()
        && block.pair_end(owner) == i
        && let Some(t) = block.taken_index(owner)
    {
        out.push(t);
    }
    out
}

/// Whether control can leave the block from `i` without reaching a successor.
fn exits(block: &DecodedBlock, i: usize) -> bool {
    let rec = &block.instrs[i];
    if rec.flushes_all() {
        return true;
    }
    let seq = if block.is_paired_ds(i) {
        let b = &block.instrs[i - 1];
        (!b.is_unconditional() && !b.is_likely()).then_some(i + 1)
    } else if rec.is_likely() {
        // not-taken edge skips the slot
        Some(i + 2)
    } else if rec.has_delay_slot() {
        None
    } else {
        (!rec.is_unconditional()).then_some(i + 1)
    };
    let fall_out = seq.is_some_and(|s| block.fall_source(s) != Some(i));
    let owner = if block.is_paired_ds(i) { i - 1 } else { i };
    let taken_out = block.instrs[owner].is_branch()
        && block.pair_end(owner) == i
        && block.taken_index(owner).is_none();
    fall_out || taken_out
}

fn will_dirty(block: &DecodedBlock, regs: &[RegStat]) -> Vec<SlotMask> {
    let n = block.len();
    let mut wd: Vec<SlotMask> = vec![0; n];
    loop {
        let mut changed = false;
        for i in (0..n).rev() {
            let st = &regs[i];
            let after = if exits(block, i) {
                0
            } else {
                successors(block, i).iter().fold(SlotMask::MAX, |m, &s| {
                    m & wd[s] & same_slots(&st.cur.map, &regs[s].entry.map)
                })
            };
            let mut mask = 0;
            for hr in 0..HOST_REGS {
                let Some(reg) = st.entry.map[hr] else { continue };
                if hr == HOST_CCREG || st.src[hr] != Some(reg) || st.cur.map[hr] != Some(reg) {
                    continue;
                }
                if writes(block, i, reg) || after & (1 << hr) != 0 {
                    mask |= 1 << hr;
                }
            }
            if mask != wd[i] {
                wd[i] = mask;
                changed = true;
            }
        }
        if !changed {
            return wd;
        }
    }
}

/// Settle dirty bits and compute the dead slots of every taken edge.
pub(crate) fn settle_dirty(block: &DecodedBlock, live: &Liveness, regs: &mut [RegStat]) {
    let wd = will_dirty(block, regs);
    for i in 0..block.len() {
        let from = block
            .fall_source(i)
            .map_or(CC_MASK, |k| regs[k].cur.dirty & same_slots(&regs[k].cur.map, &regs[i].pre.map));
        let stat = &mut regs[i];
        stat.pre.dirty = from | CC_MASK;
        stat.entry.dirty = if block.is_join(i) {
            (wd[i] & stat.entry.occupied()) | CC_MASK
        } else {
            (stat.pre.dirty & same_slots(&stat.pre.map, &stat.entry.map)) | CC_MASK
        };
        if !block.instrs[i].flushes_all() {
            let kept = stat.entry.dirty
                & same_slots(&stat.entry.map, &stat.src)
                & same_slots(&stat.src, &stat.cur.map);
            let written = (0..HOST_REGS)
                .filter(|&hr| stat.cur.map[hr].is_some_and(|r| writes(block, i, r)))
                .fold(0, |m, hr| m | (1 << hr));
            stat.cur.dirty = kept | written | CC_MASK;
        }
        if block.is_paired_ds(i) {
            let cur = regs[i].cur.clone();
            regs[i - 1].branch = Some(cur);
        } else if let Some(branch) = stat.branch.as_mut() {
            *branch = stat.cur.clone();
        }
    }

    let (exit_lower, exit_upper) = exit_masks(block.isa);
    for b in 0..block.len() {
        let Some(state) = regs[b].branch.as_ref() else { continue };
        let (lower, upper) = block
            .taken_index(b)
            .map_or((exit_lower, exit_upper), |t| (live.before[t], live.before_upper[t]));
        let dead = (0..HOST_REGS)
            .filter(|&hr| hr != HOST_CCREG)
            .filter(|&hr| {
                state.map[hr].is_some_and(|r| {
                    let mask = if r.is_upper() { upper } else { lower };
                    mask & r.bit() != 0
                })
            })
            .fold(0, |m, hr| m | (1 << hr));
        regs[b].taken_dead = dead;
    }
}

/// Unneeded (lower, upper) masks where control leaves the block.
#[must_use]
pub(crate) const fn exit_masks(isa: IsaKind) -> (RegMask, RegMask) {
    let lower = exit_unneeded(isa);
    match isa {
        IsaKind::Mips => (lower, lower),
        IsaKind::Sh2 => (lower, RegMask::MAX),
    }
}
