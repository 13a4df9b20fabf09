//! Allocator tuning.
//!
//! None of these affect correctness; they trade code size against
//! register shuffling.

use drc_cfg::DEFAULT_LIVENESS_DEPTH;

/// Default eviction look-ahead, in instructions.
pub const DEFAULT_EVICTION_WINDOW: usize = 9;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocConfig {
    /// How far ahead eviction looks for the next read of a candidate.
    pub eviction_window: usize,
    /// Preferred slot of register `r` is `(r * stride + offset) % HOST_REGS`.
    pub pref_stride: usize,
    pub pref_offset: usize,
    /// Keep loop-carried registers in one host register across backward branches.
    pub loop_retention: bool,
    /// Free registers that must remain at every point of a retained loop.
    pub loop_min_free: usize,
    /// Load sources one instruction early when a register is free.
    pub hoist_loads: bool,
    /// Recursion depth of liveness analysis at backward branches.
    pub liveness_depth: u32,
    /// Check allocation soundness after every block.
    pub verify: bool,
}

impl Default for AllocConfig {
    fn default() -> Self {
        Self {
            eviction_window: DEFAULT_EVICTION_WINDOW,
            pref_stride: 1,
            pref_offset: 0,
            loop_retention: true,
            loop_min_free: 1,
            hoist_loads: true,
            liveness_depth: DEFAULT_LIVENESS_DEPTH,
            verify: cfg!(debug_assertions),
        }
    }
}

impl AllocConfig {
    #[must_use]
    pub const fn with_eviction_window(mut self, window: usize) -> Self {
        self.eviction_window = window;
        self
    }

    #[must_use]
    pub const fn with_preference(mut self, stride: usize, offset: usize) -> Self {
        self.pref_stride = stride;
        self.pref_offset = offset;
        self
    }

    #[must_use]
    pub const fn with_loop_retention(mut self, enabled: bool) -> Self {
        self.loop_retention = enabled;
        self
    }

    #[must_use]
    pub const fn with_loop_min_free(mut self, free: usize) -> Self {
        self.loop_min_free = free;
        self
    }

    #[must_use]
    pub const fn with_hoist_loads(mut self, enabled: bool) -> Self {
        self.hoist_loads = enabled;
        self
    }

    #[must_use]
    pub const fn with_liveness_depth(mut self, depth: u32) -> Self {
        self.liveness_depth = depth;
        self
    }

    #[must_use]
    pub const fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }
}
