//! Register allocation state ("regstat").

use std::fmt;

use crate::host::{HOST_CCREG, HOST_REGS, SlotMask};
use crate::vreg::{CCREG, RegMask, VReg};

/// Host slot assignment plus dirty, 32-bit and constant tracking at one
/// program point.
///
/// Invariant: a virtual register half occupies at most one slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegState {
    /// Virtual register held by each host slot.
    pub map: [Option<VReg>; HOST_REGS],
    /// Slots whose value is newer than the backing store.
    pub dirty: SlotMask,
    /// Registers whose 64-bit value is the sign extension of the low word.
    pub is32: RegMask,
    /// Slots holding a value known at compile time.
    pub isconst: SlotMask,
    /// Known values for `isconst` slots (low word only).
    pub constmap: [u64; HOST_REGS],
}

impl Default for RegState {
    fn default() -> Self {
        Self::empty()
    }
}

impl RegState {
    /// No slot assigned.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            map: [None; HOST_REGS],
            dirty: 0,
            is32: 1,
            isconst: 0,
            constmap: [0; HOST_REGS],
        }
    }

    /// State on entry to a block: only the cycle counter is live in a host register.
    #[must_use]
    pub const fn block_entry() -> Self {
        let mut st = Self::empty();
        st.map[HOST_CCREG] = Some(CCREG);
        st.dirty = 1 << HOST_CCREG;
        st
    }

    /// Slot holding `reg`, if any.
    #[must_use]
    pub fn find(&self, reg: VReg) -> Option<usize> {
        self.map.iter().position(|&m| m == Some(reg))
    }

    #[must_use]
    pub fn contains(&self, reg: VReg) -> bool {
        self.find(reg).is_some()
    }

    #[must_use]
    pub const fn is_dirty(&self, hr: usize) -> bool {
        self.dirty & (1 << hr) != 0
    }

    #[must_use]
    pub const fn is_const(&self, hr: usize) -> bool {
        self.isconst & (1 << hr) != 0
    }

    /// Whether `reg`'s full value is the sign extension of its low word.
    #[must_use]
    pub const fn reg_is32(&self, reg: VReg) -> bool {
        self.is32 & reg.bit() != 0
    }

    /// Compile-time value of `reg`, if known.
    #[must_use]
    pub fn const_value(&self, reg: VReg) -> Option<u64> {
        self.find(reg)
            .filter(|&hr| self.is_const(hr))
            .map(|hr| self.constmap[hr])
    }

    /// Slots currently assigned.
    #[must_use]
    pub fn occupied(&self) -> SlotMask {
        self.map
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_some())
            .fold(0, |acc, (hr, _)| acc | (1 << hr))
    }

    /// Number of unassigned slots.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.map.iter().filter(|m| m.is_none()).count()
    }

    /// Assign `reg` to `hr`, dropping whatever the slot held.
    pub fn assign(&mut self, hr: usize, reg: VReg) {
        self.clear(hr);
        self.map[hr] = Some(reg);
    }

    /// Release `hr` without any writeback bookkeeping.
    pub fn clear(&mut self, hr: usize) {
        self.map[hr] = None;
        self.dirty &= !(1 << hr);
        self.isconst &= !(1 << hr);
        self.constmap[hr] = 0;
    }

    pub fn set_dirty(&mut self, hr: usize) {
        self.dirty |= 1 << hr;
    }

    pub fn set_const(&mut self, hr: usize, value: u64) {
        self.isconst |= 1 << hr;
        self.constmap[hr] = value;
    }

    pub fn clear_const(&mut self, hr: usize) {
        self.isconst &= !(1 << hr);
        self.constmap[hr] = 0;
    }

    /// Drop every assignment (values are assumed to be in the backing store).
    pub fn clear_all(&mut self) {
        for hr in 0..HOST_REGS {
            self.clear(hr);
        }
    }

    /// Drop every assignment except those in `keep`.
    pub fn retain_slots(&mut self, keep: SlotMask) {
        for hr in 0..HOST_REGS {
            if keep & (1 << hr) == 0 {
                self.clear(hr);
            }
        }
    }
}

impl fmt::Display for RegState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (hr, m) in self.map.iter().enumerate() {
            let Some(reg) = m else { continue };
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            write!(f, "h{hr}={reg}")?;
            if self.is_dirty(hr) {
                f.write_str("*")?;
            }
            if self.is_const(hr) {
                write!(f, "#{:x}", self.constmap[hr])?;
            }
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

/// Allocation result for one instruction.
///
/// The emitter walks `pre -> entry` on the fallthrough edge, then
/// `entry -> src` (writebacks and source loads) and `src -> cur`
/// (destination assignment) before the instruction body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegStat {
    /// State reaching the instruction by sequential fallthrough.
    pub pre: RegState,
    /// State every incoming edge must establish at the instruction's label.
    pub entry: RegState,
    /// Slot assignment while sources are read.
    pub src: [Option<VReg>; HOST_REGS],
    /// State after the instruction.
    pub cur: RegState,
    /// State after a branch's delay slot, used on the taken edge.
    pub branch: Option<RegState>,
    /// Slots of `branch` whose values are dead at the branch target.
    pub taken_dead: SlotMask,
    /// Registers (lower halves) unneeded after the instruction.
    pub u: RegMask,
    /// Registers (upper halves) unneeded after the instruction.
    pub uu: RegMask,
}

impl RegStat {
    #[must_use]
    pub fn new(pre: RegState) -> Self {
        Self {
            entry: pre.clone(),
            src: pre.map,
            cur: pre.clone(),
            pre,
            branch: None,
            taken_dead: 0,
            u: 0,
            uu: 0,
        }
    }

    /// Slot holding `reg` while sources are read.
    #[must_use]
    pub fn src_slot(&self, reg: VReg) -> Option<usize> {
        self.src.iter().position(|&m| m == Some(reg))
    }

    /// Slots that must be loaded from the backing store before the body.
    #[must_use]
    pub fn loads(&self) -> SlotMask {
        (0..HOST_REGS)
            .filter(|&hr| self.src[hr].is_some() && self.src[hr] != self.entry.map[hr])
            .fold(0, |acc, hr| acc | (1 << hr))
    }

    /// Highest number of slots simultaneously assigned.
    #[must_use]
    pub fn pressure(&self) -> usize {
        let src = self.src.iter().filter(|m| m.is_some()).count();
        src.max(HOST_REGS - self.cur.free_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vreg::mips;

    #[test]
    fn test_block_entry_holds_cycle_counter() {
        let st = RegState::block_entry();
        assert_eq!(st.find(CCREG), Some(HOST_CCREG));
        assert!(st.is_dirty(HOST_CCREG));
        assert_eq!(st.free_count(), HOST_REGS - 1);
    }

    #[test]
    fn test_assign_resets_slot_flags() {
        let mut st = RegState::empty();
        st.assign(4, mips::gpr(7));
        st.set_dirty(4);
        st.set_const(4, 0x1234);
        assert_eq!(st.const_value(mips::gpr(7)), Some(0x1234));
        st.assign(4, mips::gpr(8));
        assert!(!st.is_dirty(4));
        assert_eq!(st.const_value(mips::gpr(8)), None);
        assert_eq!(st.find(mips::gpr(7)), None);
    }

    #[test]
    fn test_display_marks_dirty_and_const() {
        let mut st = RegState::empty();
        st.assign(1, mips::gpr(2));
        st.set_dirty(1);
        st.assign(5, mips::gpr(9));
        st.set_const(5, 0x10);
        assert_eq!(st.to_string(), "h1=v2* h5=v9#10");
        assert_eq!(RegState::empty().to_string(), "-");
    }

    #[test]
    fn test_loads_are_new_source_slots() {
        let mut stat = RegStat::new(RegState::block_entry());
        stat.src[0] = Some(mips::gpr(4));
        assert_eq!(stat.loads(), 1);
    }
}
