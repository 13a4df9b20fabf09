//! Decisions taken from a first allocation pass: which loop-carried
//! registers stay in one host slot, and which loads move one instruction
//! earlier.

use tracing::debug;

use drc_cfg::DecodedBlock;
use drc_ir::{HOST_CCREG, HOST_DIV_HI, HOST_DIV_LO, HOST_REGS, InstrKind, RegStat, SlotMask, VReg, slots};

use crate::config::AllocConfig;
use crate::{Hoist, LoopPin};

/// Upper bound on slots instruction `k` needs at once.
fn operand_slots(block: &DecodedBlock, regs: &[RegStat], k: usize) -> usize {
    let stat = &regs[k];
    let rec = &block.instrs[k];
    let mut mask: SlotMask = 0;
    for r in rec.sources().flat_map(|r| [r, r.upper()]) {
        if let Some(hr) = stat.src_slot(r) {
            mask |= 1 << hr;
        }
    }
    for r in rec.dests().flat_map(|r| [r, r.upper()]) {
        if let Some(hr) = stat.cur.find(r) {
            mask |= 1 << hr;
        }
    }
    if block.is_paired_ds(k) {
        let owner = &block.instrs[k - 1];
        for r in owner.sources().flat_map(|r| [r, r.upper()]).chain([drc_ir::BTREG]) {
            if let Some(hr) = regs[k - 1].cur.find(r) {
                mask |= 1 << hr;
            }
        }
    }
    mask.count_ones() as usize
}

/// Whether slot `hr` holds only `reg` (or nothing) everywhere in `span`,
/// and `reg` never lives anywhere else.
fn slot_exclusive(regs: &[RegStat], span: std::ops::RangeInclusive<usize>, reg: VReg, hr: usize) -> bool {
    let ok = |map: &[Option<VReg>; HOST_REGS]| {
        map[hr].is_none_or(|r| r == reg)
            && map.iter().enumerate().all(|(s, m)| s == hr || *m != Some(reg))
    };
    regs[span].iter().all(|st| {
        ok(&st.entry.map)
            && ok(&st.src)
            && ok(&st.cur.map)
            && st.branch.as_ref().is_none_or(|b| ok(&b.map))
    })
}

/// Find registers to keep resident across backward branches.
pub(crate) fn find_pins(block: &DecodedBlock, regs: &[RegStat], config: &AllocConfig) -> Vec<LoopPin> {
    let mut pins: Vec<LoopPin> = Vec::new();
    for b in 0..block.len() {
        let rec = &block.instrs[b];
        if !rec.is_branch() || block.is_paired_ds(b) {
            continue;
        }
        let Some(start) = block.taken_index(b).filter(|&t| t <= b) else {
            continue;
        };
        let end = block.pair_end(b);
        let span = start..=end;
        let body = &block.instrs[span.clone()];
        if body.iter().any(|r| r.flushes_all() || r.is_call()) {
            continue;
        }
        let mut fixed: SlotMask = 1 << HOST_CCREG;
        if body
            .iter()
            .any(|r| matches!(r.kind, InstrKind::MulDiv { op } if op.is_divide()))
        {
            fixed |= (1 << HOST_DIV_LO) | (1 << HOST_DIV_HI);
        }

        // candidates in order of first appearance
        let mut candidates: Vec<VReg> = Vec::new();
        for r in body.iter().flat_map(|r| r.sources().chain(r.dests())) {
            if !r.is_internal() && !candidates.contains(&r) {
                candidates.push(r);
            }
        }
        for reg in candidates {
            let slot = span.clone().find_map(|k| {
                regs[k].src_slot(reg).or_else(|| regs[k].cur.find(reg))
            });
            let Some(slot) = slot else { continue };
            if fixed & (1 << slot) != 0 {
                continue;
            }
            let clash = pins.iter().any(|p| {
                p.start <= end && start <= p.end && (p.slot == slot || p.reg == reg)
            });
            if clash || !slot_exclusive(regs, span.clone(), reg, slot) {
                continue;
            }
            let fits = span.clone().all(|k| {
                let active = pins.iter().filter(|p| p.covers(k)).count() + 1;
                operand_slots(block, regs, k) + active + config.loop_min_free < HOST_REGS
            });
            if !fits {
                continue;
            }
            debug!(%reg, slot, start, end, "pin loop register");
            pins.push(LoopPin { reg, slot, start, end });
        }
    }
    pins
}

/// Find source loads that can move to the preceding instruction.
pub(crate) fn find_hoists(block: &DecodedBlock, regs: &[RegStat]) -> Vec<Hoist> {
    let mut hoists = Vec::new();
    for i in 1..block.len() {
        let p = i - 1;
        let prev = &block.instrs[p];
        if block.is_join(i)
            || block.is_paired_ds(i)
            || block.fall_source(i) != Some(p)
            || prev.is_branch()
            || prev.is_ds
            || prev.flushes_all()
        {
            continue;
        }
        let (here, there) = (&regs[i], &regs[p]);
        if there.cur.free_count() < 2 {
            continue;
        }
        let found = slots(here.loads()).find_map(|hr| {
            let reg = here.src[hr]?;
            let free = there.entry.map[hr].is_none() && there.src[hr].is_none() && there.cur.map[hr].is_none();
            let untouched = prev.writes() & reg.bit() == 0
                && !there.src.contains(&Some(reg))
                && !there.cur.contains(reg);
            (free && untouched).then_some(Hoist { at: p, reg, slot: hr })
        });
        hoists.extend(found);
    }
    hoists
}
