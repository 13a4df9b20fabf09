//! Host register slot model.
//!
//! The allocator works on abstract slots; `drc-emit` binds each slot to a
//! concrete x86-64 register (`rax rcx rdx rbx rbp rsi rdi r8 r9 r12 r13 r14`).

/// Number of allocatable host register slots.
pub const HOST_REGS: usize = 12;

/// Slot that holds the cycle counter at every block boundary.
pub const HOST_CCREG: usize = 3;

/// Slot that receives the quotient / low word of a hardware divide.
pub const HOST_DIV_LO: usize = 0;

/// Slot that receives the remainder / high word of a hardware divide.
pub const HOST_DIV_HI: usize = 2;

/// Slots clobbered by a call into host code (System V caller-saved).
pub const CALLER_SAVED_SLOTS: u32 = 0b0001_1110_0111;

/// Bitmask of host slots.
pub type SlotMask = u32;

/// Iterate over the slots set in `mask`.
pub fn slots(mask: SlotMask) -> impl Iterator<Item = usize> {
    (0..HOST_REGS).filter(move |hr| mask & (1 << hr) != 0)
}
