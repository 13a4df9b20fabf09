//! SH-2 decoder (16-bit big-endian encodings, 32-bit registers).

use drc_ir::sh2::{GBR, MACH, MACL, PR, SR, TBIT, VBR, gpr};
use drc_ir::{
    AddrMode, AluOp, BranchCond, Cond, ExtOp, InstrKind, InstrRecord, MemSize, MulDivOp,
    ShiftAmount, ShiftOp, Src2, SystemKind, VReg, Width,
};

use crate::{GuestIsa, IsaKind};

#[inline]
const fn get_n(raw: u32) -> u8 {
    ((raw >> 8) & 15) as u8
}

#[inline]
const fn get_m(raw: u32) -> u8 {
    ((raw >> 4) & 15) as u8
}

#[inline]
const fn simm8(raw: u32) -> i64 {
    raw as u8 as i8 as i64
}

#[inline]
const fn uimm8(raw: u32) -> i64 {
    (raw & 0xFF) as i64
}

#[inline]
const fn disp8_target(addr: u32, raw: u32) -> u32 {
    addr.wrapping_add(4).wrapping_add((simm8(raw) * 2) as u32)
}

#[inline]
const fn disp12_target(addr: u32, raw: u32) -> u32 {
    let disp = ((raw & 0xFFF) as i32) << 20 >> 20;
    addr.wrapping_add(4).wrapping_add((disp * 2) as u32)
}

/// SH-2 guest.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sh2;

impl GuestIsa for Sh2 {
    fn kind(&self) -> IsaKind {
        IsaKind::Sh2
    }

    fn insn_size(&self) -> u32 {
        2
    }

    fn has_upper_halves(&self) -> bool {
        false
    }

    fn decode(&self, addr: u32, raw: u32) -> InstrRecord {
        let raw = raw & 0xFFFF;
        let mut rec = match raw >> 12 {
            0x0 => group0(addr, raw),
            0x1 => {
                let mut rec = store(addr, raw, MemSize::Word, AddrMode::Disp, get_n(raw), get_m(raw));
                rec.imm = i64::from(raw & 15) * 4;
                rec
            }
            0x2 => group2(addr, raw),
            0x3 => group3(addr, raw),
            0x4 => group4(addr, raw),
            0x5 => {
                let mut rec = load(addr, raw, MemSize::Word, AddrMode::Disp, get_n(raw), gpr(get_m(raw)));
                rec.imm = i64::from(raw & 15) * 4;
                rec
            }
            0x6 => group6(addr, raw),
            0x7 => {
                let n = gpr(get_n(raw));
                let mut rec = alu(addr, raw, AluOp::Add, Src2::Imm, Some(n), None, Some(n));
                rec.imm = simm8(raw);
                rec
            }
            0x8 => group8(addr, raw),
            0x9 => {
                let mut rec = load(addr, raw, MemSize::Half, AddrMode::Disp, get_n(raw), gpr(0));
                rec.rs1 = None;
                rec.imm = i64::from(addr.wrapping_add(4).wrapping_add((raw & 0xFF) * 2));
                rec
            }
            0xA | 0xB => {
                let link = raw >> 12 == 0xB;
                let mut rec = record(addr, raw, InstrKind::Jump { link, delay: true });
                rec.target = Some(disp12_target(addr, raw));
                if link {
                    rec.rt1 = Some(PR);
                }
                rec
            }
            0xC => group_c(addr, raw),
            0xD => {
                let mut rec = load(addr, raw, MemSize::Word, AddrMode::Disp, get_n(raw), gpr(0));
                rec.rs1 = None;
                rec.imm = i64::from((addr & !3).wrapping_add(4).wrapping_add((raw & 0xFF) * 4));
                rec
            }
            0xE => {
                let mut rec = record(addr, raw, InstrKind::LoadConst);
                rec.rt1 = Some(gpr(get_n(raw)));
                rec.imm = simm8(raw);
                rec
            }
            _ => record(addr, raw, InstrKind::Invalid),
        };
        rec.cycles = cycles(&rec);
        rec
    }

    fn reg_name(&self, reg: VReg) -> String {
        const NAMED: [(VReg, &str); 7] = [
            (SR, "sr"),
            (GBR, "gbr"),
            (VBR, "vbr"),
            (MACH, "mach"),
            (MACL, "macl"),
            (PR, "pr"),
            (TBIT, "t"),
        ];
        if reg.index() < 16 && !reg.is_upper() {
            return format!("r{}", reg.index());
        }
        NAMED
            .iter()
            .find(|(r, _)| *r == reg)
            .map_or_else(|| reg.to_string(), |(_, name)| (*name).to_string())
    }

    fn literal_address(&self, rec: &InstrRecord) -> Option<u32> {
        match (rec.raw >> 12, rec.kind) {
            (0x9 | 0xD, InstrKind::Load { .. }) if rec.rs1.is_none() => u32::try_from(rec.imm).ok(),
            _ => None,
        }
    }
}

const fn record(addr: u32, raw: u32, kind: InstrKind) -> InstrRecord {
    InstrRecord::new(addr, raw, 2, kind)
}

const fn cycles(rec: &InstrRecord) -> u8 {
    match rec.kind {
        InstrKind::MulDiv { op: MulDivOp::Mult | MulDivOp::Multu } => 4,
        InstrKind::MulDiv { .. } | InstrKind::Jump { .. } | InstrKind::JumpReg { .. } => 2,
        InstrKind::Branch { delay: false, .. } => 3,
        InstrKind::Branch { .. } => 2,
        _ => 1,
    }
}

fn interp(addr: u32, raw: u32) -> InstrRecord {
    record(addr, raw, InstrKind::Interp { ends_block: false })
}

fn alu(
    addr: u32,
    raw: u32,
    op: AluOp,
    src2: Src2,
    rs1: Option<VReg>,
    rs2: Option<VReg>,
    rt1: Option<VReg>,
) -> InstrRecord {
    let mut rec = record(addr, raw, InstrKind::Alu { op, width: Width::W32, src2 });
    rec.rs1 = rs1;
    rec.rs2 = rs2;
    rec.rt1 = rt1;
    rec
}

/// Two-register ALU op `Rn = Rn op Rm`.
fn alu_nm(addr: u32, raw: u32, op: AluOp) -> InstrRecord {
    let n = gpr(get_n(raw));
    alu(addr, raw, op, Src2::Reg, Some(n), Some(gpr(get_m(raw))), Some(n))
}

/// Comparison `T = Rn cond Rm`.
fn cmp_nm(addr: u32, raw: u32, cond: Cond) -> InstrRecord {
    alu(
        addr,
        raw,
        AluOp::Set(cond),
        Src2::Reg,
        Some(gpr(get_n(raw))),
        Some(gpr(get_m(raw))),
        Some(TBIT),
    )
}

/// Comparison `T = reg cond imm`.
fn cmp_imm(addr: u32, raw: u32, op: AluOp, reg: VReg, imm: i64) -> InstrRecord {
    let mut rec = alu(addr, raw, op, Src2::Imm, Some(reg), None, Some(TBIT));
    rec.imm = imm;
    rec
}

fn mov(addr: u32, raw: u32, from: Option<VReg>, to: VReg) -> InstrRecord {
    let mut rec = record(addr, raw, InstrKind::Move { width: Width::W32 });
    rec.rs1 = from;
    rec.rt1 = Some(to);
    rec
}

fn load(addr: u32, raw: u32, size: MemSize, mode: AddrMode, n: u8, base: VReg) -> InstrRecord {
    load_into(addr, raw, size, mode, gpr(n), base)
}

fn load_into(
    addr: u32,
    raw: u32,
    size: MemSize,
    mode: AddrMode,
    to: VReg,
    base: VReg,
) -> InstrRecord {
    let mut rec = record(addr, raw, InstrKind::Load { size, signed: true, mode });
    rec.rs1 = Some(base);
    rec.rt1 = Some(to);
    if mode == AddrMode::PostInc && base != to {
        rec.rt2 = Some(base);
    }
    rec
}

fn store(addr: u32, raw: u32, size: MemSize, mode: AddrMode, n: u8, m: u8) -> InstrRecord {
    store_from(addr, raw, size, mode, gpr(n), gpr(m))
}

fn store_from(
    addr: u32,
    raw: u32,
    size: MemSize,
    mode: AddrMode,
    base: VReg,
    data: VReg,
) -> InstrRecord {
    let mut rec = record(addr, raw, InstrKind::Store { size, mode });
    rec.rs1 = Some(base);
    rec.rs2 = Some(data);
    if mode == AddrMode::PreDec {
        rec.rt1 = Some(base);
    }
    rec
}

const fn size_of_low2(raw: u32) -> MemSize {
    match raw & 3 {
        0 => MemSize::Byte,
        1 => MemSize::Half,
        _ => MemSize::Word,
    }
}

fn group0(addr: u32, raw: u32) -> InstrRecord {
    let n = get_n(raw);
    let m = get_m(raw);
    match raw & 0xF {
        0x2 => match m {
            0 => interp(addr, raw),
            1 => mov(addr, raw, Some(GBR), gpr(n)),
            2 => mov(addr, raw, Some(VBR), gpr(n)),
            _ => record(addr, raw, InstrKind::Invalid),
        },
        0x3 => match m {
            0 | 2 => {
                let link = m == 0;
                let mut rec = record(addr, raw, InstrKind::JumpReg { link, delay: true });
                rec.rs1 = Some(gpr(n));
                rec.imm = i64::from(addr.wrapping_add(4));
                if link {
                    rec.rt1 = Some(PR);
                }
                rec
            }
            _ => record(addr, raw, InstrKind::Invalid),
        },
        0x4..=0x6 => {
            let mut rec = store(addr, raw, size_of_low2(raw), AddrMode::Indexed, n, m);
            rec.rs3 = Some(gpr(0));
            rec
        }
        0x7 => {
            let mut rec = record(addr, raw, InstrKind::MulDiv { op: MulDivOp::MulLow });
            rec.rs1 = Some(gpr(n));
            rec.rs2 = Some(gpr(m));
            rec.rt1 = Some(MACL);
            rec
        }
        0x8 => match raw {
            0x0008 => constant(addr, raw, TBIT, 0),
            0x0018 => constant(addr, raw, TBIT, 1),
            0x0028 => {
                let mut rec = constant(addr, raw, MACL, 0);
                rec.rt2 = Some(MACH);
                rec
            }
            _ => record(addr, raw, InstrKind::Invalid),
        },
        0x9 => match raw & 0xFF {
            0x09 if n == 0 => record(addr, raw, InstrKind::Nop),
            0x19 if n == 0 => interp(addr, raw),
            0x29 => mov(addr, raw, Some(TBIT), gpr(n)),
            _ => record(addr, raw, InstrKind::Invalid),
        },
        0xA => match m {
            0 => mov(addr, raw, Some(MACH), gpr(n)),
            1 => mov(addr, raw, Some(MACL), gpr(n)),
            2 => mov(addr, raw, Some(PR), gpr(n)),
            _ => record(addr, raw, InstrKind::Invalid),
        },
        0xB => match raw {
            0x000B => {
                let mut rec = record(addr, raw, InstrKind::JumpReg { link: false, delay: true });
                rec.rs1 = Some(PR);
                rec
            }
            // SLEEP and RTE
            0x001B | 0x002B => record(addr, raw, InstrKind::Interp { ends_block: true }),
            _ => record(addr, raw, InstrKind::Invalid),
        },
        0xC..=0xE => {
            let mut rec = load(addr, raw, size_of_low2(raw), AddrMode::Indexed, n, gpr(m));
            rec.rs2 = Some(gpr(0));
            rec
        }
        // MAC.L
        0xF => interp(addr, raw),
        _ => record(addr, raw, InstrKind::Invalid),
    }
}

fn constant(addr: u32, raw: u32, reg: VReg, value: i64) -> InstrRecord {
    let mut rec = record(addr, raw, InstrKind::LoadConst);
    rec.rt1 = Some(reg);
    rec.imm = value;
    rec
}

fn group2(addr: u32, raw: u32) -> InstrRecord {
    let n = get_n(raw);
    let m = get_m(raw);
    match raw & 0xF {
        0x0..=0x2 => store(addr, raw, size_of_low2(raw), AddrMode::Disp, n, m),
        0x4..=0x6 => store(addr, raw, size_of_low2(raw), AddrMode::PreDec, n, m),
        // DIV0S
        0x7 => interp(addr, raw),
        0x8 => {
            let mut rec = cmp_nm(addr, raw, Cond::Eq);
            rec.kind = InstrKind::Alu { op: AluOp::Test, width: Width::W32, src2: Src2::Reg };
            rec
        }
        0x9 => alu_nm(addr, raw, AluOp::And),
        0xA => alu_nm(addr, raw, AluOp::Xor),
        0xB => alu_nm(addr, raw, AluOp::Or),
        // CMP/STR and XTRCT
        0xC | 0xD => interp(addr, raw),
        0xE | 0xF => {
            let op = if raw & 1 == 0 { MulDivOp::MuluHalf } else { MulDivOp::MulsHalf };
            let mut rec = record(addr, raw, InstrKind::MulDiv { op });
            rec.rs1 = Some(gpr(n));
            rec.rs2 = Some(gpr(m));
            rec.rt1 = Some(MACL);
            rec
        }
        _ => record(addr, raw, InstrKind::Invalid),
    }
}

fn group3(addr: u32, raw: u32) -> InstrRecord {
    match raw & 0xF {
        0x0 => cmp_nm(addr, raw, Cond::Eq),
        0x2 => cmp_nm(addr, raw, Cond::Geu),
        0x3 => cmp_nm(addr, raw, Cond::Ge),
        0x6 => cmp_nm(addr, raw, Cond::Gtu),
        0x7 => cmp_nm(addr, raw, Cond::Gt),
        0x8 => alu_nm(addr, raw, AluOp::Sub),
        0xC => alu_nm(addr, raw, AluOp::Add),
        0x5 | 0xD => {
            let op = if raw & 8 == 0 { MulDivOp::Multu } else { MulDivOp::Mult };
            let mut rec = record(addr, raw, InstrKind::MulDiv { op });
            rec.rs1 = Some(gpr(get_n(raw)));
            rec.rs2 = Some(gpr(get_m(raw)));
            rec.rt1 = Some(MACL);
            rec.rt2 = Some(MACH);
            rec
        }
        // DIV1, SUBC, SUBV, ADDC, ADDV
        0x4 | 0xA | 0xB | 0xE | 0xF => interp(addr, raw),
        _ => record(addr, raw, InstrKind::Invalid),
    }
}

fn shift(addr: u32, raw: u32, op: ShiftOp, amount: u8, sets_t: bool) -> InstrRecord {
    let n = gpr(get_n(raw));
    let mut rec = record(
        addr,
        raw,
        InstrKind::Shift { op, width: Width::W32, amount: ShiftAmount::Imm(amount), sets_t },
    );
    rec.rs1 = Some(n);
    rec.rt1 = Some(n);
    if sets_t {
        rec.rt2 = Some(TBIT);
    }
    rec
}

/// System register selected by the `m` field of `LDS`/`STS` (low nibble 2, 6, A)
/// and `LDC`/`STC` (low nibble 3, 7, E) in group 4.
const fn sysreg(raw: u32) -> Option<VReg> {
    match (raw & 0xF, (raw >> 4) & 0xF) {
        (0x2 | 0x6 | 0xA, 0) => Some(MACH),
        (0x2 | 0x6 | 0xA, 1) => Some(MACL),
        (0x2 | 0x6 | 0xA, 2) => Some(PR),
        (0x3 | 0x7 | 0xE, 1) => Some(GBR),
        (0x3 | 0x7 | 0xE, 2) => Some(VBR),
        _ => None,
    }
}

fn group4(addr: u32, raw: u32) -> InstrRecord {
    let n = get_n(raw);
    let rn = gpr(n);
    match raw & 0xFF {
        0x00 | 0x20 => shift(addr, raw, ShiftOp::Sll, 1, true),
        0x01 => shift(addr, raw, ShiftOp::Srl, 1, true),
        0x21 => shift(addr, raw, ShiftOp::Sra, 1, true),
        0x04 => shift(addr, raw, ShiftOp::Rotl, 1, true),
        0x05 => shift(addr, raw, ShiftOp::Rotr, 1, true),
        0x08 => shift(addr, raw, ShiftOp::Sll, 2, false),
        0x09 => shift(addr, raw, ShiftOp::Srl, 2, false),
        0x18 => shift(addr, raw, ShiftOp::Sll, 8, false),
        0x19 => shift(addr, raw, ShiftOp::Srl, 8, false),
        0x28 => shift(addr, raw, ShiftOp::Sll, 16, false),
        0x29 => shift(addr, raw, ShiftOp::Srl, 16, false),
        0x10 => {
            let mut rec = record(addr, raw, InstrKind::DecTest);
            rec.rs1 = Some(rn);
            rec.rt1 = Some(rn);
            rec.rt2 = Some(TBIT);
            rec
        }
        0x11 => cmp_imm(addr, raw, AluOp::Set(Cond::Ge), rn, 0),
        0x15 => cmp_imm(addr, raw, AluOp::Set(Cond::Gt), rn, 0),
        // STS.L / STC.L to @-Rn
        0x02 | 0x12 | 0x22 | 0x13 | 0x23 => match sysreg(raw) {
            Some(sys) => store_from(addr, raw, MemSize::Word, AddrMode::PreDec, rn, sys),
            None => record(addr, raw, InstrKind::Invalid),
        },
        // LDS.L / LDC.L from @Rm+
        0x06 | 0x16 | 0x26 | 0x17 | 0x27 => match sysreg(raw) {
            Some(sys) => load_into(addr, raw, MemSize::Word, AddrMode::PostInc, sys, rn),
            None => record(addr, raw, InstrKind::Invalid),
        },
        // LDS / LDC from Rm
        0x0A | 0x1A | 0x2A | 0x1E | 0x2E => match sysreg(raw) {
            Some(sys) => mov(addr, raw, Some(rn), sys),
            None => record(addr, raw, InstrKind::Invalid),
        },
        0x0B | 0x2B => {
            let link = raw & 0xFF == 0x0B;
            let mut rec = record(addr, raw, InstrKind::JumpReg { link, delay: true });
            rec.rs1 = Some(rn);
            if link {
                rec.rt1 = Some(PR);
            }
            rec
        }
        // STC.L SR
        0x03 => interp(addr, raw),
        // LDC Rm,SR / LDC.L @Rm+,SR may unmask interrupts.
        0x07 | 0x0E => record(addr, raw, InstrKind::Interp { ends_block: true }),
        // TAS.B, ROTCL, ROTCR
        0x1B | 0x24 | 0x25 => interp(addr, raw),
        _ if raw & 0xF == 0xF => interp(addr, raw),
        _ => record(addr, raw, InstrKind::Invalid),
    }
}

fn group6(addr: u32, raw: u32) -> InstrRecord {
    let n = get_n(raw);
    let m = get_m(raw);
    let ext = |op| {
        let mut rec = record(addr, raw, InstrKind::Ext { op });
        rec.rs1 = Some(gpr(m));
        rec.rt1 = Some(gpr(n));
        rec
    };
    match raw & 0xF {
        0x0..=0x2 => load(addr, raw, size_of_low2(raw), AddrMode::Disp, n, gpr(m)),
        0x3 => mov(addr, raw, Some(gpr(m)), gpr(n)),
        0x4..=0x6 => load(addr, raw, size_of_low2(raw), AddrMode::PostInc, n, gpr(m)),
        0x7 => alu(addr, raw, AluOp::Nor, Src2::Reg, Some(gpr(m)), None, Some(gpr(n))),
        0x8 => ext(ExtOp::SwapBytes),
        0x9 => ext(ExtOp::SwapHalves),
        // NEGC
        0xA => interp(addr, raw),
        0xB => alu(addr, raw, AluOp::Sub, Src2::Reg, None, Some(gpr(m)), Some(gpr(n))),
        0xC => ext(ExtOp::ZeroByte),
        0xD => ext(ExtOp::ZeroHalf),
        0xE => ext(ExtOp::SignByte),
        _ => ext(ExtOp::SignHalf),
    }
}

fn group8(addr: u32, raw: u32) -> InstrRecord {
    let m = get_m(raw);
    let disp = i64::from(raw & 15);
    match (raw >> 8) & 0xF {
        0x0 => {
            let mut rec = store(addr, raw, MemSize::Byte, AddrMode::Disp, m, 0);
            rec.imm = disp;
            rec
        }
        0x1 => {
            let mut rec = store(addr, raw, MemSize::Half, AddrMode::Disp, m, 0);
            rec.imm = disp * 2;
            rec
        }
        0x4 => {
            let mut rec = load(addr, raw, MemSize::Byte, AddrMode::Disp, 0, gpr(m));
            rec.imm = disp;
            rec
        }
        0x5 => {
            let mut rec = load(addr, raw, MemSize::Half, AddrMode::Disp, 0, gpr(m));
            rec.imm = disp * 2;
            rec
        }
        0x8 => cmp_imm(addr, raw, AluOp::Set(Cond::Eq), gpr(0), simm8(raw)),
        0x9 | 0xB | 0xD | 0xF => {
            let sense = (raw >> 8) & 0xF;
            let cond = if sense & 2 == 0 { BranchCond::Ne } else { BranchCond::Eq };
            let delay = sense >= 0xD;
            let mut rec = record(
                addr,
                raw,
                InstrKind::Branch { cond, width: Width::W32, likely: false, link: false, delay },
            );
            rec.rs1 = Some(TBIT);
            rec.target = Some(disp8_target(addr, raw));
            rec
        }
        _ => record(addr, raw, InstrKind::Invalid),
    }
}

fn group_c(addr: u32, raw: u32) -> InstrRecord {
    let r0 = gpr(0);
    let imm = uimm8(raw);
    match (raw >> 8) & 0xF {
        sub @ 0x0..=0x2 => {
            let mut rec = store_from(addr, raw, size_of_low2(sub), AddrMode::Disp, GBR, r0);
            rec.imm = imm << (sub & 3);
            rec
        }
        0x3 => {
            let mut rec = record(addr, raw, InstrKind::System { kind: SystemKind::Trap });
            rec.imm = imm;
            rec
        }
        sub @ 0x4..=0x6 => {
            let mut rec = load_into(addr, raw, size_of_low2(sub), AddrMode::Disp, r0, GBR);
            rec.imm = imm << (sub & 3);
            rec
        }
        0x7 => {
            let mut rec = record(addr, raw, InstrKind::LoadConst);
            rec.rt1 = Some(r0);
            rec.imm = i64::from((addr & !3).wrapping_add(4).wrapping_add((raw & 0xFF) * 4));
            rec
        }
        0x8 => cmp_imm(addr, raw, AluOp::Test, r0, imm),
        0x9 | 0xA | 0xB => {
            let op = match (raw >> 8) & 0xF {
                0x9 => AluOp::And,
                0xA => AluOp::Xor,
                _ => AluOp::Or,
            };
            let mut rec = alu(addr, raw, op, Src2::Imm, Some(r0), None, Some(r0));
            rec.imm = imm;
            rec
        }
        // TST.B / AND.B / XOR.B / OR.B @(R0,GBR)
        _ => interp(addr, raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::sh2 as asm;

    fn dec(raw: u16) -> InstrRecord {
        Sh2.decode(0x0600_1000, u32::from(raw))
    }

    #[test]
    fn test_decode_mov_imm() {
        let rec = dec(asm::mov_imm(3, -2));
        assert_eq!(rec.kind, InstrKind::LoadConst);
        assert_eq!(rec.rt1, Some(gpr(3)));
        assert_eq!(rec.imm, -2);
    }

    #[test]
    fn test_decode_add_reg() {
        let rec = dec(asm::add(1, 2));
        assert_eq!(rec.rs1, Some(gpr(1)));
        assert_eq!(rec.rs2, Some(gpr(2)));
        assert_eq!(rec.rt1, Some(gpr(1)));
    }

    #[test]
    fn test_compare_writes_t() {
        let rec = dec(asm::cmp_eq(4, 5));
        assert_eq!(rec.rt1, Some(TBIT));
        let rec = dec(asm::dt(7));
        assert_eq!(rec.kind, InstrKind::DecTest);
        assert_eq!(rec.rt2, Some(TBIT));
    }

    #[test]
    fn test_bt_has_no_delay_slot() {
        let rec = dec(asm::bt(-2));
        assert!(!rec.has_delay_slot());
        assert_eq!(rec.target, Some(0x0600_1000));
        assert_eq!(rec.rs1, Some(TBIT));
        let rec = dec(asm::bf_s(4));
        assert!(rec.has_delay_slot());
        assert_eq!(rec.target, Some(0x0600_100C));
    }

    #[test]
    fn test_bra_and_bsr_targets() {
        let rec = dec(asm::bra(-2));
        assert_eq!(rec.target, Some(0x0600_1000));
        assert!(rec.is_unconditional());
        let rec = dec(asm::bsr(0x10));
        assert_eq!(rec.rt1, Some(PR));
        assert_eq!(rec.link_addr(), 0x0600_1004);
    }

    #[test]
    fn test_rts_reads_pr() {
        let rec = dec(asm::rts());
        assert_eq!(rec.rs1, Some(PR));
        assert!(rec.has_delay_slot());
    }

    #[test]
    fn test_pc_relative_literal() {
        let rec = Sh2.decode(0x0600_1002, u32::from(asm::mov_l_pcrel(2, 3)));
        assert_eq!(Sh2.literal_address(&rec), Some(0x0600_1010));
        let rec = dec(asm::mov_w_pcrel(2, 1));
        assert_eq!(Sh2.literal_address(&rec), Some(0x0600_1006));
        assert_eq!(Sh2.literal_address(&dec(asm::mov_l_load(1, 2))), None);
    }

    #[test]
    fn test_post_increment_load() {
        let rec = dec(asm::mov_l_postinc(1, 2));
        assert_eq!(rec.rs1, Some(gpr(2)));
        assert_eq!(rec.rt1, Some(gpr(1)));
        assert_eq!(rec.rt2, Some(gpr(2)));
        let rec = dec(asm::mov_l_postinc(2, 2));
        assert_eq!(rec.rt2, None);
    }

    #[test]
    fn test_pre_decrement_store() {
        let rec = dec(asm::mov_l_predec(15, 3));
        assert_eq!(rec.kind, InstrKind::Store { size: MemSize::Word, mode: AddrMode::PreDec });
        assert_eq!(rec.rs1, Some(gpr(15)));
        assert_eq!(rec.rs2, Some(gpr(3)));
        assert_eq!(rec.rt1, Some(gpr(15)));
    }

    #[test]
    fn test_system_register_transfers() {
        let rec = dec(asm::sts_macl(4));
        assert_eq!(rec.rs1, Some(MACL));
        // STS.L PR,@-R15
        let rec = dec(0x4F22);
        assert_eq!(rec.rs2, Some(PR));
        // LDS.L @R15+,PR
        let rec = dec(0x4F26);
        assert_eq!(rec.rt1, Some(PR));
        assert_eq!(rec.rt2, Some(gpr(15)));
        // LDC R1,GBR
        let rec = dec(0x411E);
        assert_eq!(rec.rt1, Some(GBR));
    }

    #[test]
    fn test_interpreted_and_invalid() {
        assert_eq!(dec(asm::addc(1, 2)).kind, InstrKind::Interp { ends_block: false });
        assert_eq!(dec(0x002B).kind, InstrKind::Interp { ends_block: true });
        assert_eq!(dec(0xFFFF).kind, InstrKind::Invalid);
        assert_eq!(dec(0x0001).kind, InstrKind::Invalid);
    }

    #[test]
    fn test_reg_names() {
        assert_eq!(Sh2.reg_name(TBIT), "t");
        assert_eq!(Sh2.reg_name(gpr(15)), "r15");
        assert_eq!(Sh2.reg_name(SR), "sr");
    }
}
