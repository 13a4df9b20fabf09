//! Virtual register numbering.
//!
//! A virtual register names one 32-bit half of a guest or translator
//! register. Indices 0..=63 name lower halves; setting bit 6 selects the
//! matching upper half of a 64-bit value. Every index owns a 64-bit slot
//! in the register backing store of the CPU context.

use std::fmt;

/// Number of distinct virtual register indices (lower halves).
pub const VREG_COUNT: usize = 64;

/// A virtual register (guest register half or translator-internal value).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VReg(u8);

impl VReg {
    const UPPER_BIT: u8 = 64;

    /// Lower half of virtual register `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below [`VREG_COUNT`].
    #[must_use]
    pub const fn new(index: u8) -> Self {
        assert!((index as usize) < VREG_COUNT, "virtual register index out of range");
        Self(index)
    }

    /// Register index without the upper-half tag.
    #[must_use]
    pub const fn index(self) -> u8 {
        self.0 & (Self::UPPER_BIT - 1)
    }

    /// Raw encoding (index plus upper-half tag).
    #[must_use]
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Whether this names the upper 32 bits of a 64-bit value.
    #[must_use]
    pub const fn is_upper(self) -> bool {
        self.0 & Self::UPPER_BIT != 0
    }

    /// The upper half of this register.
    #[must_use]
    pub const fn upper(self) -> Self {
        Self(self.0 | Self::UPPER_BIT)
    }

    /// The lower half of this register.
    #[must_use]
    pub const fn lower(self) -> Self {
        Self(self.index())
    }

    /// Bit for this register in a 64-bit register mask (half-agnostic).
    #[must_use]
    pub const fn bit(self) -> u64 {
        1 << self.index()
    }

    /// Byte offset of this half inside the register backing store.
    #[must_use]
    pub const fn backing_offset(self) -> usize {
        self.index() as usize * 8 + if self.is_upper() { 4 } else { 0 }
    }

    /// Whether this is the hard-wired zero register of the MIPS guest.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Whether this is a translator-internal register.
    #[must_use]
    pub const fn is_internal(self) -> bool {
        self.index() >= FIRST_INTERNAL
    }
}

impl fmt::Display for VReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let index = self.index();
        let name = match index {
            48 => "cc".to_string(),
            49 => "bt".to_string(),
            _ => format!("v{index}"),
        };
        if self.is_upper() {
            write!(f, "{name}.hi")
        } else {
            f.write_str(&name)
        }
    }
}

/// Register mask with one bit per virtual register index.
pub type RegMask = u64;

/// Build a mask from a set of registers.
#[must_use]
pub fn mask_of(regs: impl IntoIterator<Item = VReg>) -> RegMask {
    regs.into_iter().fold(0, |acc, r| acc | r.bit())
}

/// First index reserved for translator-internal registers.
pub const FIRST_INTERNAL: u8 = 48;

/// Cycle counter (negative budget counting up towards zero).
pub const CCREG: VReg = VReg(48);
/// Branch condition or indirect target saved across a delay slot.
pub const BTREG: VReg = VReg(49);

/// Registers that hold nothing architectural at a block exit.
pub const SCRATCH_MASK: RegMask = BTREG.bit();

/// MIPS multiply/divide result registers.
pub mod mips {
    use super::VReg;

    /// High word of multiply/divide results.
    pub const HI: VReg = VReg(32);
    /// Low word of multiply/divide results.
    pub const LO: VReg = VReg(33);
    /// Link register written by `JAL`/`BLTZAL` family.
    pub const RA: VReg = VReg(31);

    /// General-purpose register `n` (0..=31).
    #[must_use]
    pub const fn gpr(n: u8) -> VReg {
        VReg::new(n & 31)
    }
}

/// SH-2 control and system registers.
pub mod sh2 {
    use super::VReg;

    /// Status register (the T bit is tracked separately in [`TBIT`]).
    pub const SR: VReg = VReg(32);
    /// Global base register.
    pub const GBR: VReg = VReg(33);
    /// Vector base register.
    pub const VBR: VReg = VReg(34);
    /// Multiply-accumulate high.
    pub const MACH: VReg = VReg(35);
    /// Multiply-accumulate low.
    pub const MACL: VReg = VReg(36);
    /// Procedure register (return address).
    pub const PR: VReg = VReg(37);
    /// The T bit of `SR`, held as 0 or 1.
    pub const TBIT: VReg = VReg(38);

    /// General-purpose register `n` (0..=15).
    #[must_use]
    pub const fn gpr(n: u8) -> VReg {
        VReg::new(n & 15)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upper_half_tagging() {
        let r = mips::gpr(5);
        let hi = r.upper();
        assert!(hi.is_upper());
        assert_eq!(hi.index(), 5);
        assert_eq!(hi.lower(), r);
        assert_eq!(hi.bit(), r.bit());
        assert_eq!(r.backing_offset(), 40);
        assert_eq!(hi.backing_offset(), 44);
    }

    #[test]
    fn test_internal_registers() {
        assert!(CCREG.is_internal());
        assert!(BTREG.is_internal());
        assert!(!sh2::TBIT.is_internal());
        assert_eq!(CCREG.to_string(), "cc");
        assert_eq!(mips::gpr(3).upper().to_string(), "v3.hi");
    }

    #[test]
    fn test_mask_of() {
        let m = mask_of([mips::gpr(1), mips::gpr(4), mips::gpr(4).upper()]);
        assert_eq!(m, 0b10010);
    }
}
