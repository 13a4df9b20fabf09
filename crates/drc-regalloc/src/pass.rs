//! One front-to-back allocation pass.

use tracing::{error, trace};

use drc_cfg::{DecodedBlock, Liveness};
use drc_ir::{
    AluOp, BTREG, HOST_CCREG, HOST_DIV_HI, HOST_DIV_LO, HOST_REGS, InstrKind, InstrRecord,
    RegState, RegStat, SlotMask, Src2, VREG_COUNT, VReg, Width,
};

use crate::config::AllocConfig;
use crate::is32::Is32;
use crate::{CC_MASK, Hoist, LoopPin};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    /// Placing sources: displaced values are judged before the instruction.
    Source,
    /// Placing destinations: displaced values are judged after it.
    Dest,
}

pub(crate) struct Pass<'a> {
    block: &'a DecodedBlock,
    live: &'a Liveness,
    is32: &'a Is32,
    config: &'a AllocConfig,
    wide: bool,
    pins: &'a [LoopPin],
    hoists: &'a [Hoist],
    regs: Vec<RegStat>,
}

impl<'a> Pass<'a> {
    pub(crate) fn new(
        block: &'a DecodedBlock,
        live: &'a Liveness,
        is32: &'a Is32,
        config: &'a AllocConfig,
        wide: bool,
        pins: &'a [LoopPin],
        hoists: &'a [Hoist],
    ) -> Self {
        Self {
            block,
            live,
            is32,
            config,
            wide,
            pins,
            hoists,
            regs: Vec::with_capacity(block.len()),
        }
    }

    pub(crate) fn run(mut self) -> Vec<RegStat> {
        for i in 0..self.block.len() {
            let stat = self.instr(i);
            trace!(i, src = %src_display(&stat), cur = %stat.cur, "alloc");
            if self.block.is_paired_ds(i) {
                self.regs[i - 1].branch = Some(stat.cur.clone());
            }
            self.regs.push(stat);
        }
        self.regs
    }

    fn rec(&self, i: usize) -> &'a InstrRecord {
        &self.block.instrs[i]
    }

    fn dead_before(&self, i: usize, reg: VReg) -> bool {
        let mask = if reg.is_upper() {
            self.live.before_upper[i]
        } else {
            self.live.before[i]
        };
        mask & reg.bit() != 0
    }

    fn dead_after(&self, i: usize, reg: VReg) -> bool {
        self.live.unneeded_after(i, reg) || self.rec(i).writes() & reg.bit() != 0
    }

    fn pin_for(&self, i: usize, reg: VReg) -> Option<&LoopPin> {
        self.pins.iter().find(|p| p.reg == reg && p.covers(i))
    }

    /// Slots pinned at `i` to registers other than `reg`.
    fn reserved(&self, i: usize, reg: Option<VReg>) -> SlotMask {
        self.pins
            .iter()
            .filter(|p| p.covers(i) && Some(p.reg) != reg)
            .fold(0, |m, p| m | (1 << p.slot))
    }

    fn pinned_here(&self, i: usize, st: &RegState, hr: usize) -> bool {
        st.map[hr].is_some_and(|r| self.pin_for(i, r).is_some_and(|p| p.slot == hr))
    }

    fn preferred(&self, reg: VReg) -> usize {
        let idx = reg.index() as usize + if reg.is_upper() { VREG_COUNT } else { 0 };
        let hr = (idx * self.config.pref_stride + self.config.pref_offset) % HOST_REGS;
        if hr == HOST_CCREG { (hr + 1) % HOST_REGS } else { hr }
    }

    /// State reaching `i` by fallthrough, with dead values dropped.
    fn pre_state(&self, i: usize) -> RegState {
        let mut st = match self.block.fall_source(i) {
            Some(k) => self.regs[k].cur.clone(),
            None => {
                let mut st = RegState::block_entry();
                st.is32 = self.is32.base;
                st
            }
        };
        for hr in 0..HOST_REGS {
            if hr == HOST_CCREG || self.pinned_here(i, &st, hr) {
                continue;
            }
            if let Some(reg) = st.map[hr]
                && self.dead_before(i, reg)
            {
                st.clear(hr);
            }
        }
        st
    }

    /// State every edge into `i` establishes.
    fn entry_state(&self, i: usize, pre: &RegState) -> RegState {
        let mut st = pre.clone();
        if self.block.is_join(i) {
            st.isconst = 0;
            st.constmap = [0; HOST_REGS];
        }
        st.is32 = self.is32.before[i];
        for pin in self.pins.iter().filter(|p| p.covers(i)) {
            if st.map[pin.slot] != Some(pin.reg) {
                if let Some(old) = st.find(pin.reg) {
                    st.clear(old);
                }
                st.assign(pin.slot, pin.reg);
            }
        }
        st
    }

    /// Slots of a branch's operands that its delay slot must leave alone.
    fn branch_locks(&self, b: usize) -> SlotMask {
        let rec = self.rec(b);
        let st = &self.regs[b].cur;
        if rec.is_likely() {
            return 0;
        }
        let regs: Vec<VReg> = if rec.ds_clobbers {
            vec![BTREG]
        } else {
            rec.sources()
                .flat_map(|r| [r, r.upper()])
                .collect()
        };
        regs.into_iter()
            .filter_map(|r| st.find(r))
            .fold(0, |m, hr| m | (1 << hr))
    }

    /// Slots touched by the previous instruction's operands.
    fn prev_operands(&self, i: usize) -> SlotMask {
        let Some(p) = i.checked_sub(1) else { return 0 };
        let (rec, stat) = (self.rec(p), &self.regs[p]);
        let srcs = rec.sources().filter_map(|r| stat.src_slot(r));
        let dsts = rec.dests().filter_map(|r| stat.cur.find(r));
        srcs.chain(dsts).fold(0, |m, hr| m | (1 << hr))
    }

    /// How soon `reg` is read again after `i`; 0 when it is not needed
    /// within the eviction window.
    fn urgency(&self, i: usize, reg: VReg) -> usize {
        let window = self.config.eviction_window;
        let n = self.block.len();
        let mut floor = 0;
        for k in (i + 1)..n.min(i + 1 + window) {
            let rec = self.rec(k);
            let reads = if reg.is_upper() { rec.reads_upper() } else { rec.reads() };
            if reads & reg.bit() != 0 {
                return window + 2 - (k - i);
            }
            if rec.writes() & reg.bit() != 0 || rec.flushes_all() {
                break;
            }
            // an allocated loop head expects it resident
            if rec.is_branch()
                && let Some(t) = self.block.taken_index(k)
                && self.regs.get(t).is_some_and(|s| s.entry.contains(reg))
            {
                floor = 1;
            }
            let owner = if self.block.is_paired_ds(k) { k - 1 } else { k };
            if self.rec(owner).is_unconditional() && self.block.pair_end(owner) == k {
                break;
            }
        }
        floor
    }

    fn choose(&self, i: usize, reg: VReg, phase: Phase, work: &RegState, locked: SlotMask) -> usize {
        if let Some(pin) = self.pin_for(i, reg) {
            return pin.slot;
        }
        let avoid = locked | self.reserved(i, Some(reg)) | CC_MASK;
        let usable = |hr: usize| avoid & (1 << hr) == 0;
        let dead = |hr: usize| {
            work.map[hr].is_none_or(|x| match phase {
                Phase::Source => self.dead_before(i, x),
                Phase::Dest => self.dead_after(i, x),
            })
        };

        let pref = self.preferred(reg);
        if usable(pref) && dead(pref) {
            return pref;
        }
        let prev = self.prev_operands(i);
        let mut free = (0..HOST_REGS).filter(|&hr| usable(hr) && work.map[hr].is_none());
        let first_free = free.clone().next();
        if let Some(hr) = free.find(|&hr| prev & (1 << hr) == 0).or(first_free) {
            return hr;
        }
        if let Some(hr) = (0..HOST_REGS).find(|&hr| usable(hr) && dead(hr)) {
            return hr;
        }
        let victim = (0..HOST_REGS).filter(|&hr| usable(hr)).min_by_key(|&hr| {
            let urgency = work.map[hr].map_or(0, |x| self.urgency(i, x));
            urgency * 2 + usize::from(work.is_dirty(hr))
        });
        match victim {
            Some(hr) => hr,
            None => {
                let addr = self.rec(i).addr;
                error!(addr = format_args!("{addr:#010x}"), %reg, "every host register is locked");
                panic!("register allocation exhausted at {addr:#010x}");
            }
        }
    }

    /// Compile-time value of `rec`'s first destination, if it folds.
    fn fold(rec: &InstrRecord, st: &RegState) -> Option<u64> {
        let val = |r: Option<VReg>| r.map_or(Some(0), |r| st.const_value(r));
        match rec.kind {
            InstrKind::LoadConst => Some(rec.imm as u64),
            InstrKind::Move { .. } => val(rec.rs1),
            InstrKind::Alu {
                op: op @ (AluOp::Add | AluOp::Or | AluOp::Xor | AluOp::And),
                width,
                src2: Src2::Imm,
            } => {
                let a = val(rec.rs1)?;
                let b = rec.imm as u64;
                let v = match op {
                    AluOp::Add => a.wrapping_add(b),
                    AluOp::Or => a | b,
                    AluOp::Xor => a ^ b,
                    _ => a & b,
                };
                Some(if width == Width::W32 {
                    i64::from(v as u32 as i32) as u64
                } else {
                    v
                })
            }
            InstrKind::Branch { link: true, .. }
            | InstrKind::Jump { link: true, .. }
            | InstrKind::JumpReg { link: true, .. } => Some(u64::from(rec.link_addr())),
            _ => None,
        }
    }

    fn instr(&self, i: usize) -> RegStat {
        let rec = self.rec(i);
        let pre = self.pre_state(i);
        let entry = self.entry_state(i, &pre);
        let mut stat = RegStat::new(pre);
        stat.entry = entry.clone();
        stat.src = entry.map;
        stat.u = self.live.after[i];
        stat.uu = self.live.after_upper[i];
        let mut work = entry;

        if rec.flushes_all() {
            let mut cur = RegState::block_entry();
            cur.is32 = self.is32.after[i];
            stat.cur = cur;
            return stat;
        }

        let mut locked: SlotMask = CC_MASK;
        if self.block.is_paired_ds(i) {
            locked |= self.branch_locks(i - 1);
        }
        for pin in self.pins.iter().filter(|p| p.covers(i)) {
            if work.map[pin.slot] == Some(pin.reg) {
                locked |= 1 << pin.slot;
            }
        }

        // sources
        let mut sources: Vec<VReg> = rec.sources().collect();
        if self.wide {
            let uppers: Vec<VReg> = rec
                .sources()
                .filter(|&r| rec.reads_wide(r) && !work.reg_is32(r))
                .map(VReg::upper)
                .collect();
            sources.extend(uppers);
        }
        for reg in sources {
            let hr = match work.find(reg) {
                Some(hr) => hr,
                None => {
                    let hr = self.choose(i, reg, Phase::Source, &work, locked);
                    work.assign(hr, reg);
                    hr
                }
            };
            locked |= 1 << hr;
        }
        stat.src = work.map;
        let folded = Self::fold(rec, &work);

        // destinations
        let divide = matches!(rec.kind, InstrKind::MulDiv { op } if op.is_divide());
        let mut dests: Vec<(VReg, Option<usize>)> = rec
            .dests()
            .enumerate()
            .map(|(n, d)| {
                let fixed = divide.then_some(if n == 0 { HOST_DIV_LO } else { HOST_DIV_HI });
                (d, fixed)
            })
            .collect();
        if self.wide {
            let uppers: Vec<(VReg, Option<usize>)> = rec
                .dests()
                .filter(|&d| !self.is32.after_has(i, d) && !self.live.unneeded_after(i, d.upper()))
                .map(|d| (d.upper(), None))
                .collect();
            dests.extend(uppers);
        }
        if rec.ds_clobbers {
            dests.push((BTREG, None));
        }
        for (d, _) in &dests {
            if let Some(hr) = work.find(*d) {
                locked |= 1 << hr;
            }
        }
        for &(d, fixed) in &dests {
            let hr = if let Some(hr) = fixed {
                if let Some(old) = work.find(d)
                    && old != hr
                {
                    work.clear(old);
                }
                if work.map[hr] != Some(d) {
                    work.assign(hr, d);
                }
                hr
            } else if let Some(hr) = work.find(d) {
                hr
            } else {
                let hr = self.choose(i, d, Phase::Dest, &work, locked);
                work.assign(hr, d);
                hr
            };
            work.set_dirty(hr);
            work.clear_const(hr);
            locked |= 1 << hr;
        }
        // an upper word made implicit by a 32-bit result
        if self.wide {
            for d in rec.dests() {
                let up = d.upper();
                if !dests.iter().any(|&(x, _)| x == up)
                    && let Some(hr) = work.find(up)
                {
                    work.clear(hr);
                }
            }
        }
        if let (Some(value), Some(rt1)) = (folded, rec.rt1)
            && let Some(hr) = work.find(rt1)
        {
            work.set_const(hr, value);
        }

        for h in self.hoists.iter().filter(|h| h.at == i) {
            let free = work.map[h.slot].is_none() && stat.src[h.slot].is_none();
            let reserved = self.reserved(i, Some(h.reg)) & (1 << h.slot) != 0;
            if free && !reserved && !work.contains(h.reg) && !stat.src.contains(&Some(h.reg)) {
                stat.src[h.slot] = Some(h.reg);
                work.map[h.slot] = Some(h.reg);
            }
        }

        work.is32 = self.is32.after[i];
        stat.cur = work;
        if rec.is_branch() && !rec.has_delay_slot() {
            stat.branch = Some(stat.cur.clone());
        }
        stat
    }
}

fn src_display(stat: &RegStat) -> String {
    let mut st = RegState::empty();
    st.map = stat.src;
    st.to_string()
}
