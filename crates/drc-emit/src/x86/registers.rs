//! Binding of allocator slots to x86-64 registers.
//!
//! Reserved: `r15` (context pointer), `rsp`, `r10`/`r11` (scratch for
//! address computation and 64-bit operands).
//! Allocatable, in slot order: `rax rcx rdx rbx rbp rsi rdi r8 r9 r12 r13 r14`.
//! Slot 3 (`rbx`) always holds the cycle counter.

use drc_ir::{HOST_CCREG, HOST_REGS, SlotMask, slots};

use super::encode::Reg;

pub const SLOT_REGS: [Reg; HOST_REGS] = [
    Reg::Rax,
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rbx,
    Reg::Rbp,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
    Reg::R12,
    Reg::R13,
    Reg::R14,
];

pub const CTX: Reg = Reg::R15;
pub const TMP0: Reg = Reg::R10;
pub const TMP1: Reg = Reg::R11;
pub const CC: Reg = SLOT_REGS[HOST_CCREG];

/// System V argument registers.
pub const ARGS: [Reg; 4] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx];

#[inline]
#[must_use]
pub const fn slot_reg(hr: usize) -> Reg {
    SLOT_REGS[hr]
}

/// Registers of the slots in `mask`, in slot order.
pub fn regs_of(mask: SlotMask) -> impl DoubleEndedIterator<Item = Reg> {
    slots(mask).collect::<Vec<_>>().into_iter().map(slot_reg)
}

#[cfg(test)]
mod tests {
    use drc_ir::CALLER_SAVED_SLOTS;

    use super::*;

    #[test]
    fn test_caller_saved_slots_are_sysv_volatile() {
        let volatile = [Reg::Rax, Reg::Rcx, Reg::Rdx, Reg::Rsi, Reg::Rdi, Reg::R8, Reg::R9];
        let regs: Vec<Reg> = regs_of(CALLER_SAVED_SLOTS).collect();
        assert_eq!(regs.len(), volatile.len());
        assert!(volatile.iter().all(|r| regs.contains(r)));
        assert_eq!(CC, Reg::Rbx);
        assert!(!SLOT_REGS.contains(&CTX) && !SLOT_REGS.contains(&TMP0) && !SLOT_REGS.contains(&TMP1));
    }
}
