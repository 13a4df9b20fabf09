//! MIPS III decoder (R4300-class, big-endian, one delay slot per branch).

use drc_ir::mips::{HI, LO, RA, gpr};
use drc_ir::{
    AddrMode, AluOp, BranchCond, Cond, InstrKind, InstrRecord, MemSize, MulDivOp, ShiftAmount,
    ShiftOp, Src2, SystemKind, VReg, Width,
};

use crate::{GuestIsa, IsaKind};

const NAMES: [&str; 32] = [
    "zero", "at", "v0", "v1", "a0", "a1", "a2", "a3", "t0", "t1", "t2", "t3", "t4", "t5", "t6",
    "t7", "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "t8", "t9", "k0", "k1", "gp", "sp", "fp",
    "ra",
];

#[inline]
const fn op(raw: u32) -> u32 {
    raw >> 26
}

#[inline]
const fn rs(raw: u32) -> u8 {
    ((raw >> 21) & 0x1F) as u8
}

#[inline]
const fn rt(raw: u32) -> u8 {
    ((raw >> 16) & 0x1F) as u8
}

#[inline]
const fn rd(raw: u32) -> u8 {
    ((raw >> 11) & 0x1F) as u8
}

#[inline]
const fn sa(raw: u32) -> u8 {
    ((raw >> 6) & 0x1F) as u8
}

#[inline]
const fn funct(raw: u32) -> u32 {
    raw & 0x3F
}

#[inline]
const fn simm16(raw: u32) -> i64 {
    raw as u16 as i16 as i64
}

#[inline]
const fn zimm16(raw: u32) -> i64 {
    (raw & 0xFFFF) as i64
}

/// Source operand: `$zero` reads as `None`.
fn src(n: u8) -> Option<VReg> {
    (n != 0).then(|| gpr(n))
}

/// Destination operand: writes to `$zero` are discarded.
fn dst(n: u8) -> Option<VReg> {
    (n != 0).then(|| gpr(n))
}

/// MIPS III guest.
#[derive(Clone, Copy, Debug, Default)]
pub struct Mips;

impl GuestIsa for Mips {
    fn kind(&self) -> IsaKind {
        IsaKind::Mips
    }

    fn insn_size(&self) -> u32 {
        4
    }

    fn has_upper_halves(&self) -> bool {
        true
    }

    fn decode(&self, addr: u32, raw: u32) -> InstrRecord {
        let mut rec = match op(raw) {
            0 => special(addr, raw),
            1 => regimm(addr, raw),
            2 | 3 => {
                let mut rec = record(addr, raw, InstrKind::Jump { link: op(raw) == 3, delay: true });
                rec.target = Some((addr.wrapping_add(4) & 0xF000_0000) | ((raw & 0x03FF_FFFF) << 2));
                if op(raw) == 3 {
                    rec.rt1 = Some(RA);
                }
                rec
            }
            4..=7 | 20..=23 => branch(addr, raw),
            8 | 9 => alu_imm(addr, raw, AluOp::Add, Width::W32, simm16(raw)),
            10 => alu_imm(addr, raw, AluOp::Set(Cond::Lt), Width::W64, simm16(raw)),
            11 => alu_imm(addr, raw, AluOp::Set(Cond::Ltu), Width::W64, simm16(raw)),
            12 => alu_imm(addr, raw, AluOp::And, Width::W64, zimm16(raw)),
            13 => alu_imm(addr, raw, AluOp::Or, Width::W64, zimm16(raw)),
            14 => alu_imm(addr, raw, AluOp::Xor, Width::W64, zimm16(raw)),
            15 => {
                let mut rec = record(addr, raw, InstrKind::LoadConst);
                rec.rt1 = dst(rt(raw));
                rec.imm = simm16(raw) << 16;
                rec
            }
            16 => cop0(addr, raw),
            17 => {
                // BC1x carries a delay slot the interpreter executes with it.
                let ends_block = rs(raw) == 8;
                record(addr, raw, InstrKind::Interp { ends_block })
            }
            24 | 25 => alu_imm(addr, raw, AluOp::Add, Width::W64, simm16(raw)),
            32 => load(addr, raw, MemSize::Byte, true),
            33 => load(addr, raw, MemSize::Half, true),
            35 => load(addr, raw, MemSize::Word, true),
            36 => load(addr, raw, MemSize::Byte, false),
            37 => load(addr, raw, MemSize::Half, false),
            39 => load(addr, raw, MemSize::Word, false),
            55 => load(addr, raw, MemSize::Double, true),
            40 => store(addr, raw, MemSize::Byte),
            41 => store(addr, raw, MemSize::Half),
            43 => store(addr, raw, MemSize::Word),
            63 => store(addr, raw, MemSize::Double),
            47 | 51 => record(addr, raw, InstrKind::Nop),
            // Unaligned, linked and coprocessor memory accesses.
            26 | 27 | 34 | 38 | 42 | 44..=46 | 48 | 49 | 52 | 53 | 56 | 57 | 60 | 61 => {
                record(addr, raw, InstrKind::Interp { ends_block: false })
            }
            _ => record(addr, raw, InstrKind::Invalid),
        };
        rec.cycles = cycles(&rec);
        rec
    }

    fn reg_name(&self, reg: VReg) -> String {
        let base = match reg.index() {
            i @ 0..=31 => NAMES[i as usize].to_string(),
            32 => "hi".to_string(),
            33 => "lo".to_string(),
            _ => reg.lower().to_string(),
        };
        if reg.is_upper() { format!("{base}.hi") } else { base }
    }
}

const fn record(addr: u32, raw: u32, kind: InstrKind) -> InstrRecord {
    InstrRecord::new(addr, raw, 4, kind)
}

const fn cycles(rec: &InstrRecord) -> u8 {
    match rec.kind {
        InstrKind::MulDiv { op } if op.is_divide() => 37,
        InstrKind::MulDiv { .. } => 5,
        InstrKind::Load { .. } | InstrKind::Store { .. } => 2,
        _ => 1,
    }
}

fn special(addr: u32, raw: u32) -> InstrRecord {
    let shift_imm = |op, width, amount| {
        let mut rec = record(addr, raw, InstrKind::Shift { op, width, amount, sets_t: false });
        rec.rs1 = src(rt(raw));
        rec.rt1 = dst(rd(raw));
        rec
    };
    let shift_var = |op, width| {
        let mut rec = record(
            addr,
            raw,
            InstrKind::Shift { op, width, amount: ShiftAmount::Reg, sets_t: false },
        );
        rec.rs1 = src(rt(raw));
        rec.rs2 = src(rs(raw));
        rec.rt1 = dst(rd(raw));
        rec
    };
    let alu = |op, width| {
        let mut rec = record(addr, raw, InstrKind::Alu { op, width, src2: Src2::Reg });
        rec.rs1 = src(rs(raw));
        rec.rs2 = src(rt(raw));
        rec.rt1 = dst(rd(raw));
        rec
    };
    let muldiv = |op| {
        let mut rec = record(addr, raw, InstrKind::MulDiv { op });
        rec.rs1 = src(rs(raw));
        rec.rs2 = src(rt(raw));
        rec.rt1 = Some(LO);
        rec.rt2 = Some(HI);
        rec
    };
    let mov = |from: Option<VReg>, to: Option<VReg>| {
        let mut rec = record(addr, raw, InstrKind::Move { width: Width::W64 });
        rec.rs1 = from;
        rec.rt1 = to;
        rec
    };

    match funct(raw) {
        0 if raw == 0 => record(addr, raw, InstrKind::Nop),
        0 => shift_imm(ShiftOp::Sll, Width::W32, ShiftAmount::Imm(sa(raw))),
        2 => shift_imm(ShiftOp::Srl, Width::W32, ShiftAmount::Imm(sa(raw))),
        3 => shift_imm(ShiftOp::Sra, Width::W32, ShiftAmount::Imm(sa(raw))),
        4 => shift_var(ShiftOp::Sll, Width::W32),
        6 => shift_var(ShiftOp::Srl, Width::W32),
        7 => shift_var(ShiftOp::Sra, Width::W32),
        8 | 9 => {
            let link = funct(raw) == 9;
            let mut rec = record(addr, raw, InstrKind::JumpReg { link, delay: true });
            rec.rs1 = src(rs(raw));
            if link {
                rec.rt1 = dst(rd(raw));
            }
            rec
        }
        12 => system(addr, raw, SystemKind::Syscall),
        13 => system(addr, raw, SystemKind::Break),
        15 => record(addr, raw, InstrKind::Nop),
        16 => mov(Some(HI), dst(rd(raw))),
        17 => mov(src(rs(raw)), Some(HI)),
        18 => mov(Some(LO), dst(rd(raw))),
        19 => mov(src(rs(raw)), Some(LO)),
        20 => shift_var(ShiftOp::Sll, Width::W64),
        22 => shift_var(ShiftOp::Srl, Width::W64),
        23 => shift_var(ShiftOp::Sra, Width::W64),
        24 => muldiv(MulDivOp::Mult),
        25 => muldiv(MulDivOp::Multu),
        26 => muldiv(MulDivOp::Div),
        27 => muldiv(MulDivOp::Divu),
        // 64-bit multiply/divide and conditional traps.
        28..=31 | 48..=52 | 54 => record(addr, raw, InstrKind::Interp { ends_block: false }),
        32 | 33 => alu(AluOp::Add, Width::W32),
        34 | 35 => alu(AluOp::Sub, Width::W32),
        36 => alu(AluOp::And, Width::W64),
        37 => alu(AluOp::Or, Width::W64),
        38 => alu(AluOp::Xor, Width::W64),
        39 => alu(AluOp::Nor, Width::W64),
        42 => alu(AluOp::Set(Cond::Lt), Width::W64),
        43 => alu(AluOp::Set(Cond::Ltu), Width::W64),
        44 | 45 => alu(AluOp::Add, Width::W64),
        46 | 47 => alu(AluOp::Sub, Width::W64),
        56 => shift_imm(ShiftOp::Sll, Width::W64, ShiftAmount::Imm(sa(raw))),
        58 => shift_imm(ShiftOp::Srl, Width::W64, ShiftAmount::Imm(sa(raw))),
        59 => shift_imm(ShiftOp::Sra, Width::W64, ShiftAmount::Imm(sa(raw))),
        60 => shift_imm(ShiftOp::Sll, Width::W64, ShiftAmount::Imm(sa(raw) + 32)),
        62 => shift_imm(ShiftOp::Srl, Width::W64, ShiftAmount::Imm(sa(raw) + 32)),
        63 => shift_imm(ShiftOp::Sra, Width::W64, ShiftAmount::Imm(sa(raw) + 32)),
        _ => record(addr, raw, InstrKind::Invalid),
    }
}

fn regimm(addr: u32, raw: u32) -> InstrRecord {
    let (cond, likely, link) = match rt(raw) {
        0 => (BranchCond::Ltz, false, false),
        1 => (BranchCond::Gez, false, false),
        2 => (BranchCond::Ltz, true, false),
        3 => (BranchCond::Gez, true, false),
        16 => (BranchCond::Ltz, false, true),
        17 => (BranchCond::Gez, false, true),
        18 => (BranchCond::Ltz, true, true),
        19 => (BranchCond::Gez, true, true),
        8..=12 | 14 => return record(addr, raw, InstrKind::Interp { ends_block: false }),
        _ => return record(addr, raw, InstrKind::Invalid),
    };
    let mut rec = record(
        addr,
        raw,
        InstrKind::Branch { cond, width: Width::W64, likely, link, delay: true },
    );
    rec.rs1 = src(rs(raw));
    if link {
        rec.rt1 = Some(RA);
    }
    rec.target = Some(branch_target(addr, raw));
    rec
}

fn branch(addr: u32, raw: u32) -> InstrRecord {
    let likely = op(raw) >= 20;
    let (cond, two_regs) = match op(raw) & 3 {
        0 => (BranchCond::Eq, true),
        1 => (BranchCond::Ne, true),
        2 => (BranchCond::Lez, false),
        _ => (BranchCond::Gtz, false),
    };
    if !two_regs && rt(raw) != 0 {
        return record(addr, raw, InstrKind::Invalid);
    }
    let mut rec = record(
        addr,
        raw,
        InstrKind::Branch { cond, width: Width::W64, likely, link: false, delay: true },
    );
    rec.rs1 = src(rs(raw));
    if two_regs {
        rec.rs2 = src(rt(raw));
    }
    rec.target = Some(branch_target(addr, raw));
    rec
}

const fn branch_target(addr: u32, raw: u32) -> u32 {
    addr.wrapping_add(4).wrapping_add((simm16(raw) << 2) as u32)
}

fn alu_imm(addr: u32, raw: u32, op: AluOp, width: Width, imm: i64) -> InstrRecord {
    let mut rec = record(addr, raw, InstrKind::Alu { op, width, src2: Src2::Imm });
    rec.rs1 = src(rs(raw));
    rec.rt1 = dst(rt(raw));
    rec.imm = imm;
    rec
}

fn load(addr: u32, raw: u32, size: MemSize, signed: bool) -> InstrRecord {
    let mut rec = record(addr, raw, InstrKind::Load { size, signed, mode: AddrMode::Disp });
    rec.rs1 = src(rs(raw));
    rec.rt1 = dst(rt(raw));
    rec.imm = simm16(raw);
    rec
}

fn store(addr: u32, raw: u32, size: MemSize) -> InstrRecord {
    let mut rec = record(addr, raw, InstrKind::Store { size, mode: AddrMode::Disp });
    rec.rs1 = src(rs(raw));
    rec.rs2 = src(rt(raw));
    rec.imm = simm16(raw);
    rec
}

fn system(addr: u32, raw: u32, kind: SystemKind) -> InstrRecord {
    let mut rec = record(addr, raw, InstrKind::System { kind });
    rec.imm = i64::from((raw >> 6) & 0xF_FFFF);
    rec
}

fn cop0(addr: u32, raw: u32) -> InstrRecord {
    // MFC0 only reads; MTC0, ERET and TLB operations can change the
    // execution environment and must return to the dispatcher.
    let ends_block = rs(raw) != 0 && rs(raw) != 1;
    record(addr, raw, InstrKind::Interp { ends_block })
}
