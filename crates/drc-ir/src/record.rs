//! Decoded instruction records.
//!
//! One [`InstrRecord`] exists per guest instruction of the block being
//! compiled. The record is guest-neutral: both the MIPS and the SH-2
//! decoders lower into the same closed [`InstrKind`] set, and every later
//! pass dispatches on [`InstrClass`].

use crate::vreg::{RegMask, VReg};

/// Operation width for MIPS-style 64-bit registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Width {
    /// 32-bit operation; the result is sign-extended to 64 bits.
    W32,
    /// Full 64-bit operation.
    W64,
}

/// Comparison used by set-on-condition ALU operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Ltu,
    Ge,
    Geu,
    Gt,
    Gtu,
}

/// Two-operand ALU operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Nor,
    /// Destination receives 1 if the comparison holds, else 0.
    Set(Cond),
    /// Destination receives 1 if `(a & b) == 0`, else 0.
    Test,
}

impl AluOp {
    /// Bitwise operations keep a sign-extended 32-bit input sign-extended.
    #[must_use]
    pub const fn is_logic(self) -> bool {
        matches!(self, Self::And | Self::Or | Self::Xor | Self::Nor)
    }

    /// Operations producing only 0 or 1.
    #[must_use]
    pub const fn is_predicate(self) -> bool {
        matches!(self, Self::Set(_) | Self::Test)
    }
}

/// Second ALU operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Src2 {
    /// Register operand `rs2` (`None` reads as zero).
    Reg,
    /// The record's immediate.
    Imm,
}

/// Shift and rotate operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShiftOp {
    Sll,
    Srl,
    Sra,
    Rotl,
    Rotr,
}

/// Shift amount source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShiftAmount {
    Imm(u8),
    /// Low bits of `rs2`.
    Reg,
}

/// Sign/zero extension and byte-swap operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExtOp {
    SignByte,
    SignHalf,
    ZeroByte,
    ZeroHalf,
    /// Swap the two low bytes, keep the upper half.
    SwapBytes,
    /// Swap the two 16-bit halves.
    SwapHalves,
}

/// Memory access size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemSize {
    Byte,
    Half,
    Word,
    Double,
}

impl MemSize {
    /// Access size in bytes.
    #[must_use]
    pub const fn bytes(self) -> u32 {
        match self {
            Self::Byte => 1,
            Self::Half => 2,
            Self::Word => 4,
            Self::Double => 8,
        }
    }
}

/// Effective-address computation for loads and stores.
///
/// Operands: loads use `rs1` as base and `rs2` as index; stores use `rs1`
/// as base, `rs2` as data and `rs3` as index. Base updates write `rt2`
/// for loads and `rt1` for stores.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddrMode {
    /// `base + imm`.
    Disp,
    /// `base + index`.
    Indexed,
    /// Access at `base`, then `base += size`.
    PostInc,
    /// `base -= size`, then access at `base`.
    PreDec,
}

/// Multiply and divide operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MulDivOp {
    /// Signed 32x32 -> 64 into `rt1` (low) and `rt2` (high).
    Mult,
    /// Unsigned 32x32 -> 64 into `rt1` (low) and `rt2` (high).
    Multu,
    /// Signed divide: quotient into `rt1`, remainder into `rt2`.
    Div,
    /// Unsigned divide: quotient into `rt1`, remainder into `rt2`.
    Divu,
    /// Low 32 bits of a 32x32 product into `rt1`.
    MulLow,
    /// Signed 16x16 -> 32 into `rt1`.
    MulsHalf,
    /// Unsigned 16x16 -> 32 into `rt1`.
    MuluHalf,
}

impl MulDivOp {
    /// Whether the operation runs on the host divider (fixed result registers).
    #[must_use]
    pub const fn is_divide(self) -> bool {
        matches!(self, Self::Div | Self::Divu)
    }
}

/// Conditional branch predicate, comparing `rs1` against `rs2` (or zero).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BranchCond {
    Eq,
    Ne,
    Lez,
    Gtz,
    Ltz,
    Gez,
}

impl BranchCond {
    /// The predicate that holds exactly when `self` does not.
    #[must_use]
    pub const fn invert(self) -> Self {
        match self {
            Self::Eq => Self::Ne,
            Self::Ne => Self::Eq,
            Self::Lez => Self::Gtz,
            Self::Gtz => Self::Lez,
            Self::Ltz => Self::Gez,
            Self::Gez => Self::Ltz,
        }
    }
}

/// Exception-raising system instructions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SystemKind {
    Syscall,
    Break,
    Trap,
}

/// Decoded operation with its sub-opcode fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InstrKind {
    Nop,
    Alu { op: AluOp, width: Width, src2: Src2 },
    Shift { op: ShiftOp, width: Width, amount: ShiftAmount, sets_t: bool },
    /// `rt1 = rs1` (`None` reads as zero).
    Move { width: Width },
    /// `rt1 = imm`.
    LoadConst,
    Ext { op: ExtOp },
    /// `rt1 = rs1 - 1; rt2 = (rt1 == 0)`.
    DecTest,
    Load { size: MemSize, signed: bool, mode: AddrMode },
    Store { size: MemSize, mode: AddrMode },
    MulDiv { op: MulDivOp },
    Branch { cond: BranchCond, width: Width, likely: bool, link: bool, delay: bool },
    Jump { link: bool, delay: bool },
    /// Jump to `rs1 + imm`.
    JumpReg { link: bool, delay: bool },
    System { kind: SystemKind },
    /// Executed by the interpreter hook.
    Interp { ends_block: bool },
    /// Unrecognized or reserved encoding.
    Invalid,
}

/// Fieldless instruction class used for per-stage dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InstrClass {
    Nop,
    Alu,
    Shift,
    Move,
    LoadConst,
    Ext,
    DecTest,
    Load,
    Store,
    MulDiv,
    CondBranch,
    Jump,
    JumpReg,
    System,
    Interp,
    Invalid,
}

impl InstrClass {
    /// All classes, in declaration order.
    pub const ALL: [Self; 16] = [
        Self::Nop,
        Self::Alu,
        Self::Shift,
        Self::Move,
        Self::LoadConst,
        Self::Ext,
        Self::DecTest,
        Self::Load,
        Self::Store,
        Self::MulDiv,
        Self::CondBranch,
        Self::Jump,
        Self::JumpReg,
        Self::System,
        Self::Interp,
        Self::Invalid,
    ];

    /// Short lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Nop => "nop",
            Self::Alu => "alu",
            Self::Shift => "shift",
            Self::Move => "move",
            Self::LoadConst => "const",
            Self::Ext => "ext",
            Self::DecTest => "dt",
            Self::Load => "load",
            Self::Store => "store",
            Self::MulDiv => "muldiv",
            Self::CondBranch => "branch",
            Self::Jump => "jump",
            Self::JumpReg => "jumpreg",
            Self::System => "system",
            Self::Interp => "interp",
            Self::Invalid => "invalid",
        }
    }
}

impl InstrKind {
    /// Dispatch class.
    #[must_use]
    pub const fn class(&self) -> InstrClass {
        match self {
            Self::Nop => InstrClass::Nop,
            Self::Alu { .. } => InstrClass::Alu,
            Self::Shift { .. } => InstrClass::Shift,
            Self::Move { .. } => InstrClass::Move,
            Self::LoadConst => InstrClass::LoadConst,
            Self::Ext { .. } => InstrClass::Ext,
            Self::DecTest => InstrClass::DecTest,
            Self::Load { .. } => InstrClass::Load,
            Self::Store { .. } => InstrClass::Store,
            Self::MulDiv { .. } => InstrClass::MulDiv,
            Self::Branch { .. } => InstrClass::CondBranch,
            Self::Jump { .. } => InstrClass::Jump,
            Self::JumpReg { .. } => InstrClass::JumpReg,
            Self::System { .. } => InstrClass::System,
            Self::Interp { .. } => InstrClass::Interp,
            Self::Invalid => InstrClass::Invalid,
        }
    }
}

/// One decoded guest instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstrRecord {
    /// Guest address.
    pub addr: u32,
    /// Raw encoding (16-bit encodings are zero-extended).
    pub raw: u32,
    /// Encoding size in bytes (2 or 4).
    pub size: u8,
    pub kind: InstrKind,
    pub rs1: Option<VReg>,
    pub rs2: Option<VReg>,
    pub rs3: Option<VReg>,
    pub rt1: Option<VReg>,
    pub rt2: Option<VReg>,
    /// Immediate, already sign- or zero-extended as the encoding requires.
    pub imm: i64,
    /// Estimated guest cycle cost.
    pub cycles: u8,
    /// Static branch target, if any.
    pub target: Option<u32>,
    /// Executes in the delay slot of the preceding branch.
    pub is_ds: bool,
    /// This branch's delay slot overwrites one of the branch's sources.
    pub ds_clobbers: bool,
}

impl InstrRecord {
    /// Create a record with no operands.
    #[must_use]
    pub const fn new(addr: u32, raw: u32, size: u8, kind: InstrKind) -> Self {
        Self {
            addr,
            raw,
            size,
            kind,
            rs1: None,
            rs2: None,
            rs3: None,
            rt1: None,
            rt2: None,
            imm: 0,
            cycles: 1,
            target: None,
            is_ds: false,
            ds_clobbers: false,
        }
    }

    #[must_use]
    pub const fn class(&self) -> InstrClass {
        self.kind.class()
    }

    /// Address of the next sequential instruction.
    #[must_use]
    pub const fn next_addr(&self) -> u32 {
        self.addr.wrapping_add(self.size as u32)
    }

    /// Return address written by linking branches (past the delay slot).
    #[must_use]
    pub const fn link_addr(&self) -> u32 {
        match self.kind {
            InstrKind::Branch { delay: false, .. }
            | InstrKind::Jump { delay: false, .. }
            | InstrKind::JumpReg { delay: false, .. } => self.next_addr(),
            _ => self.addr.wrapping_add(2 * self.size as u32),
        }
    }

    /// Conditional branch, jump or register jump.
    #[must_use]
    pub const fn is_branch(&self) -> bool {
        matches!(
            self.kind,
            InstrKind::Branch { .. } | InstrKind::Jump { .. } | InstrKind::JumpReg { .. }
        )
    }

    /// Branch followed by a delay slot.
    #[must_use]
    pub const fn has_delay_slot(&self) -> bool {
        matches!(
            self.kind,
            InstrKind::Branch { delay: true, .. }
                | InstrKind::Jump { delay: true, .. }
                | InstrKind::JumpReg { delay: true, .. }
        )
    }

    /// Branch-likely: the delay slot is nullified when not taken.
    #[must_use]
    pub const fn is_likely(&self) -> bool {
        matches!(self.kind, InstrKind::Branch { likely: true, .. })
    }

    /// Control never falls through to the next sequential instruction.
    #[must_use]
    pub const fn is_unconditional(&self) -> bool {
        matches!(
            self.kind,
            InstrKind::Jump { .. }
                | InstrKind::JumpReg { .. }
                | InstrKind::System { .. }
                | InstrKind::Interp { ends_block: true }
                | InstrKind::Invalid
        )
    }

    /// Subroutine call (the return address is a likely re-entry point).
    #[must_use]
    pub const fn is_call(&self) -> bool {
        matches!(
            self.kind,
            InstrKind::Jump { link: true, .. } | InstrKind::JumpReg { link: true, .. }
        )
    }

    /// Calls host code that may read any guest register from the backing store.
    #[must_use]
    pub const fn flushes_all(&self) -> bool {
        matches!(self.kind, InstrKind::Interp { .. } | InstrKind::Invalid | InstrKind::System { .. })
    }

    /// Source registers, in operand order.
    pub fn sources(&self) -> impl Iterator<Item = VReg> + '_ {
        [self.rs1, self.rs2, self.rs3].into_iter().flatten()
    }

    /// Destination registers, in operand order.
    pub fn dests(&self) -> impl Iterator<Item = VReg> + '_ {
        [self.rt1, self.rt2].into_iter().flatten()
    }

    /// Mask of registers whose lower half is read.
    #[must_use]
    pub fn reads(&self) -> RegMask {
        self.sources().fold(0, |m, r| m | r.bit())
    }

    /// Mask of registers whose upper half is read (64-bit operands).
    #[must_use]
    pub fn reads_upper(&self) -> RegMask {
        let wide = |r: Option<VReg>| r.map_or(0, VReg::bit);
        match self.kind {
            InstrKind::Alu { width: Width::W64, .. }
            | InstrKind::Branch { width: Width::W64, .. } => wide(self.rs1) | wide(self.rs2),
            InstrKind::Shift { width: Width::W64, .. } | InstrKind::Move { width: Width::W64 } => {
                wide(self.rs1)
            }
            InstrKind::Store { size: MemSize::Double, .. } => wide(self.rs2),
            _ => 0,
        }
    }

    /// Mask of registers written (both halves are defined by any write).
    #[must_use]
    pub fn writes(&self) -> RegMask {
        self.dests().fold(0, |m, r| m | r.bit())
    }

    /// Whether `reg` is read as a 64-bit value.
    #[must_use]
    pub fn reads_wide(&self, reg: VReg) -> bool {
        self.reads_upper() & reg.bit() != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vreg::mips;

    fn daddu(rd: u8, rs: u8, rt: u8) -> InstrRecord {
        let mut rec = InstrRecord::new(
            0x8000_0000,
            0,
            4,
            InstrKind::Alu { op: AluOp::Add, width: Width::W64, src2: Src2::Reg },
        );
        rec.rs1 = Some(mips::gpr(rs));
        rec.rs2 = Some(mips::gpr(rt));
        rec.rt1 = Some(mips::gpr(rd));
        rec
    }

    #[test]
    fn test_wide_alu_reads_upper_halves() {
        let rec = daddu(3, 1, 2);
        assert_eq!(rec.reads(), 0b110);
        assert_eq!(rec.reads_upper(), 0b110);
        assert_eq!(rec.writes(), 0b1000);
        assert!(rec.reads_wide(mips::gpr(1)));
    }

    #[test]
    fn test_store_double_reads_upper_of_data_only() {
        let mut rec = InstrRecord::new(
            0,
            0,
            4,
            InstrKind::Store { size: MemSize::Double, mode: AddrMode::Disp },
        );
        rec.rs1 = Some(mips::gpr(29));
        rec.rs2 = Some(mips::gpr(8));
        assert_eq!(rec.reads_upper(), mips::gpr(8).bit());
    }

    #[test]
    fn test_link_address_skips_delay_slot() {
        let rec = InstrRecord::new(0x1000, 0, 4, InstrKind::Jump { link: true, delay: true });
        assert_eq!(rec.link_addr(), 0x1008);
        assert!(rec.is_call());
        assert!(rec.is_unconditional());
        assert!(rec.has_delay_slot());
    }

    #[test]
    fn test_branch_cond_invert_is_involution() {
        for c in [
            BranchCond::Eq,
            BranchCond::Ne,
            BranchCond::Lez,
            BranchCond::Gtz,
            BranchCond::Ltz,
            BranchCond::Gez,
        ] {
            assert_eq!(c.invert().invert(), c);
        }
    }
}
