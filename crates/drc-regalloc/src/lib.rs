//! Host register allocation.
//!
//! The allocator walks a decoded block front to back and records, per
//! instruction, which host slot holds which virtual register (see
//! [`RegStat`]). Two passes run: the first discovers loops whose
//! carried values can stay in one host register and loads that can be
//! hoisted; the second allocates with those decisions fixed. A final
//! back-to-front pass settles dirty bits at merge points.

mod clean;
mod config;
mod error;
mod is32;
mod pass;
mod retention;
mod transition;
mod verify;

use tracing::{debug, debug_span};

use drc_cfg::{DecodedBlock, Liveness};
use drc_ir::{HOST_CCREG, HOST_REGS, RegState, RegStat, VReg};
use drc_isa::IsaKind;

pub use config::{AllocConfig, DEFAULT_EVICTION_WINDOW};
pub use error::AllocError;
pub use is32::Is32;
pub use transition::{Load, TransitionPlan, Writeback, plan_transition};

/// A register kept in one host slot over a loop body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoopPin {
    pub reg: VReg,
    pub slot: usize,
    /// Loop head (branch target).
    pub start: usize,
    /// Last instruction of the backward branch pair.
    pub end: usize,
}

impl LoopPin {
    #[must_use]
    pub const fn covers(&self, i: usize) -> bool {
        self.start <= i && i <= self.end
    }
}

/// A source loaded one instruction before its first use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Hoist {
    /// Instruction whose source loads carry the extra load.
    pub at: usize,
    pub reg: VReg,
    pub slot: usize,
}

/// Allocation of one block.
#[derive(Clone, Debug)]
pub struct Allocation {
    pub regs: Vec<RegStat>,
    pub is32: Is32,
    pub pins: Vec<LoopPin>,
    pub hoists: Vec<Hoist>,
    /// The guest has 64-bit registers.
    pub wide: bool,
}

impl Allocation {
    /// State while instruction `i` reads its sources.
    #[must_use]
    pub fn src_state(&self, i: usize) -> RegState {
        src_state(&self.regs[i])
    }

    /// Highest slot pressure anywhere in the block.
    #[must_use]
    pub fn peak_pressure(&self) -> usize {
        self.regs.iter().map(RegStat::pressure).max().unwrap_or(0)
    }

    /// Check the structural invariants of the allocation.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn verify(&self, block: &DecodedBlock) -> Result<(), AllocError> {
        verify::verify(self, block)
    }
}

/// State while the sources of `stat`'s instruction are read: slots kept
/// from `entry` keep their flags, newly loaded slots are clean.
#[must_use]
pub fn src_state(stat: &RegStat) -> RegState {
    let mut st = stat.entry.clone();
    for hr in 0..HOST_REGS {
        if stat.src[hr] != stat.entry.map[hr] {
            st.clear(hr);
            st.map[hr] = stat.src[hr];
        }
    }
    st
}

/// Allocate host registers for `block`.
///
/// # Panics
///
/// Panics if an instruction needs more simultaneously locked registers
/// than the host has, which no supported guest encoding can.
#[must_use]
pub fn allocate(block: &DecodedBlock, live: &Liveness, config: &AllocConfig) -> Allocation {
    let _span = debug_span!("regalloc", start = format_args!("{:#010x}", block.start)).entered();
    let wide = block.isa == IsaKind::Mips;
    let is32 = Is32::analyze(block, wide);

    let first = pass::Pass::new(block, live, &is32, config, wide, &[], &[]).run();
    let pins = if config.loop_retention {
        retention::find_pins(block, &first, config)
    } else {
        Vec::new()
    };
    let hoists = if config.hoist_loads {
        retention::find_hoists(block, &first)
    } else {
        Vec::new()
    };
    let mut regs = if pins.is_empty() && hoists.is_empty() {
        first
    } else {
        pass::Pass::new(block, live, &is32, config, wide, &pins, &hoists).run()
    };
    clean::settle_dirty(block, live, &mut regs);

    let alloc = Allocation {
        regs,
        is32,
        pins,
        hoists,
        wide,
    };
    debug!(
        instrs = block.len(),
        pins = alloc.pins.len(),
        hoists = alloc.hoists.len(),
        peak = alloc.peak_pressure(),
        "allocated"
    );
    if config.verify
        && let Err(err) = alloc.verify(block)
    {
        tracing::error!(%err, "allocation failed verification");
        panic!("unsound register allocation: {err}");
    }
    alloc
}

/// Slot index reserved for the cycle counter, as a mask.
pub(crate) const CC_MASK: drc_ir::SlotMask = 1 << HOST_CCREG;

#[cfg(test)]
mod tests;
