//! Moves needed to go from one allocation state to another.
//!
//! Every edge between two program points is lowered the same way: write
//! back what the destination state no longer holds dirty, then load what
//! it expects resident. Writebacks always come before loads so a value can
//! move between slots through the backing store.

use drc_ir::{HOST_REGS, RegState, VReg};

/// Store a slot to the backing store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Writeback {
    pub slot: usize,
    pub reg: VReg,
    /// Also store the sign extension of the value into the upper word.
    pub sign_extend: bool,
}

/// Fill a slot from the backing store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Load {
    pub slot: usize,
    pub reg: VReg,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransitionPlan {
    pub writebacks: Vec<Writeback>,
    pub loads: Vec<Load>,
}

impl TransitionPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writebacks.is_empty() && self.loads.is_empty()
    }
}

/// Plan the edge `from -> to`.
///
/// `needed` tells whether a value may still be read after the edge; dead
/// dirty values are dropped without a store. `wide` enables upper-half
/// bookkeeping for 64-bit guests.
pub fn plan_transition(
    from: &RegState,
    to: &RegState,
    needed: impl Fn(VReg) -> bool,
    wide: bool,
) -> TransitionPlan {
    let mut plan = TransitionPlan::default();
    for hr in 0..HOST_REGS {
        let Some(reg) = from.map[hr] else { continue };
        if !from.is_dirty(hr) || !needed(reg) {
            continue;
        }
        let implied_upper = wide && !reg.is_upper() && from.reg_is32(reg) && !from.contains(reg.upper());
        let kept = to.map[hr] == Some(reg) && to.is_dirty(hr);
        // the target no longer knows the upper word is implied
        let upper_lost = implied_upper && !to.reg_is32(reg) && !to.contains(reg.upper());
        if !kept || upper_lost {
            plan.writebacks.push(Writeback {
                slot: hr,
                reg,
                sign_extend: implied_upper,
            });
        }
    }
    for hr in 0..HOST_REGS {
        if let Some(reg) = to.map[hr]
            && from.map[hr] != Some(reg)
        {
            plan.loads.push(Load { slot: hr, reg });
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use drc_ir::mips::gpr;

    fn state(entries: &[(usize, VReg, bool)]) -> RegState {
        let mut st = RegState::block_entry();
        for &(hr, reg, dirty) in entries {
            st.assign(hr, reg);
            if dirty {
                st.set_dirty(hr);
            }
        }
        st
    }

    #[test]
    fn test_identical_states_need_nothing() {
        let st = state(&[(0, gpr(2), true), (1, gpr(3), false)]);
        assert!(plan_transition(&st, &st, |_| true, false).is_empty());
    }

    #[test]
    fn test_moved_value_goes_through_memory() {
        let from = state(&[(0, gpr(2), true)]);
        let to = state(&[(5, gpr(2), false)]);
        let plan = plan_transition(&from, &to, |_| true, false);
        assert_eq!(plan.writebacks, vec![Writeback { slot: 0, reg: gpr(2), sign_extend: false }]);
        assert_eq!(plan.loads, vec![Load { slot: 5, reg: gpr(2) }]);
    }

    #[test]
    fn test_dead_value_is_dropped() {
        let from = state(&[(0, gpr(2), true)]);
        let to = RegState::block_entry();
        let plan = plan_transition(&from, &to, |r| r != gpr(2), false);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_clean_target_forces_store() {
        let from = state(&[(0, gpr(2), true)]);
        let to = state(&[(0, gpr(2), false)]);
        let plan = plan_transition(&from, &to, |_| true, false);
        assert_eq!(plan.writebacks.len(), 1);
        assert!(plan.loads.is_empty());
    }

    #[test]
    fn test_lost_sign_extension_is_materialized() {
        let mut from = state(&[(0, gpr(2), true)]);
        from.is32 |= gpr(2).bit();
        let mut to = from.clone();
        to.is32 &= !gpr(2).bit();
        let plan = plan_transition(&from, &to, |_| true, true);
        assert_eq!(plan.writebacks, vec![Writeback { slot: 0, reg: gpr(2), sign_extend: true }]);
        // a narrow guest never tracks upper words
        assert!(plan_transition(&from, &to, |_| true, false).is_empty());
    }

    #[test]
    fn test_cycle_counter_flushed_on_exit() {
        let from = RegState::block_entry();
        let plan = plan_transition(&from, &RegState::empty(), |_| true, false);
        assert_eq!(plan.writebacks.len(), 1);
        assert_eq!(plan.writebacks[0].reg, drc_ir::CCREG);
    }
}
