//! Instruction encoders for building guest programs in tests and demos.
//!
//! Only the encodings the recompiler's tests and the CLI demos need are
//! provided. Branch offsets are in instructions, relative to the
//! instruction after the branch (MIPS) or to `pc + 4` (SH-2).

/// MIPS III encoders.
pub mod mips {
    #[must_use]
    pub const fn special(rs: u8, rt: u8, rd: u8, sa: u8, funct: u32) -> u32 {
        ((rs as u32) << 21) | ((rt as u32) << 16) | ((rd as u32) << 11) | ((sa as u32) << 6) | funct
    }

    #[must_use]
    pub const fn itype(op: u32, rs: u8, rt: u8, imm: u16) -> u32 {
        (op << 26) | ((rs as u32) << 21) | ((rt as u32) << 16) | imm as u32
    }

    #[must_use]
    pub const fn nop() -> u32 {
        0
    }

    #[must_use]
    pub const fn addiu(rt: u8, rs: u8, imm: i16) -> u32 {
        itype(9, rs, rt, imm as u16)
    }

    #[must_use]
    pub const fn daddiu(rt: u8, rs: u8, imm: i16) -> u32 {
        itype(25, rs, rt, imm as u16)
    }

    #[must_use]
    pub const fn slti(rt: u8, rs: u8, imm: i16) -> u32 {
        itype(10, rs, rt, imm as u16)
    }

    #[must_use]
    pub const fn andi(rt: u8, rs: u8, imm: u16) -> u32 {
        itype(12, rs, rt, imm)
    }

    #[must_use]
    pub const fn ori(rt: u8, rs: u8, imm: u16) -> u32 {
        itype(13, rs, rt, imm)
    }

    #[must_use]
    pub const fn lui(rt: u8, imm: u16) -> u32 {
        itype(15, 0, rt, imm)
    }

    #[must_use]
    pub const fn addu(rd: u8, rs: u8, rt: u8) -> u32 {
        special(rs, rt, rd, 0, 33)
    }

    #[must_use]
    pub const fn subu(rd: u8, rs: u8, rt: u8) -> u32 {
        special(rs, rt, rd, 0, 35)
    }

    #[must_use]
    pub const fn and(rd: u8, rs: u8, rt: u8) -> u32 {
        special(rs, rt, rd, 0, 36)
    }

    #[must_use]
    pub const fn or(rd: u8, rs: u8, rt: u8) -> u32 {
        special(rs, rt, rd, 0, 37)
    }

    #[must_use]
    pub const fn slt(rd: u8, rs: u8, rt: u8) -> u32 {
        special(rs, rt, rd, 0, 42)
    }

    #[must_use]
    pub const fn daddu(rd: u8, rs: u8, rt: u8) -> u32 {
        special(rs, rt, rd, 0, 45)
    }

    #[must_use]
    pub const fn sll(rd: u8, rt: u8, sa: u8) -> u32 {
        special(0, rt, rd, sa, 0)
    }

    #[must_use]
    pub const fn srlv(rd: u8, rt: u8, rs: u8) -> u32 {
        special(rs, rt, rd, 0, 6)
    }

    #[must_use]
    pub const fn dsll32(rd: u8, rt: u8, sa: u8) -> u32 {
        special(0, rt, rd, sa, 60)
    }

    #[must_use]
    pub const fn mult(rs: u8, rt: u8) -> u32 {
        special(rs, rt, 0, 0, 24)
    }

    #[must_use]
    pub const fn div(rs: u8, rt: u8) -> u32 {
        special(rs, rt, 0, 0, 26)
    }

    #[must_use]
    pub const fn divu(rs: u8, rt: u8) -> u32 {
        special(rs, rt, 0, 0, 27)
    }

    #[must_use]
    pub const fn mfhi(rd: u8) -> u32 {
        special(0, 0, rd, 0, 16)
    }

    #[must_use]
    pub const fn mflo(rd: u8) -> u32 {
        special(0, 0, rd, 0, 18)
    }

    #[must_use]
    pub const fn jr(rs: u8) -> u32 {
        special(rs, 0, 0, 0, 8)
    }

    #[must_use]
    pub const fn jalr(rd: u8, rs: u8) -> u32 {
        special(rs, 0, rd, 0, 9)
    }

    #[must_use]
    pub const fn syscall() -> u32 {
        12
    }

    #[must_use]
    pub const fn lb(rt: u8, base: u8, off: i16) -> u32 {
        itype(32, base, rt, off as u16)
    }

    #[must_use]
    pub const fn lw(rt: u8, base: u8, off: i16) -> u32 {
        itype(35, base, rt, off as u16)
    }

    #[must_use]
    pub const fn ld(rt: u8, base: u8, off: i16) -> u32 {
        itype(55, base, rt, off as u16)
    }

    #[must_use]
    pub const fn sb(rt: u8, base: u8, off: i16) -> u32 {
        itype(40, base, rt, off as u16)
    }

    #[must_use]
    pub const fn sw(rt: u8, base: u8, off: i16) -> u32 {
        itype(43, base, rt, off as u16)
    }

    #[must_use]
    pub const fn sd(rt: u8, base: u8, off: i16) -> u32 {
        itype(63, base, rt, off as u16)
    }

    #[must_use]
    pub const fn beq(rs: u8, rt: u8, off: i16) -> u32 {
        itype(4, rs, rt, off as u16)
    }

    #[must_use]
    pub const fn bne(rs: u8, rt: u8, off: i16) -> u32 {
        itype(5, rs, rt, off as u16)
    }

    #[must_use]
    pub const fn blez(rs: u8, off: i16) -> u32 {
        itype(6, rs, 0, off as u16)
    }

    #[must_use]
    pub const fn bgtz(rs: u8, off: i16) -> u32 {
        itype(7, rs, 0, off as u16)
    }

    #[must_use]
    pub const fn bnel(rs: u8, rt: u8, off: i16) -> u32 {
        itype(21, rs, rt, off as u16)
    }

    #[must_use]
    pub const fn bgezal(rs: u8, off: i16) -> u32 {
        itype(1, rs, 17, off as u16)
    }

    #[must_use]
    pub const fn j(target: u32) -> u32 {
        (2 << 26) | ((target >> 2) & 0x03FF_FFFF)
    }

    #[must_use]
    pub const fn jal(target: u32) -> u32 {
        (3 << 26) | ((target >> 2) & 0x03FF_FFFF)
    }

    /// Serialize a program as big-endian bytes.
    #[must_use]
    pub fn assemble(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_be_bytes()).collect()
    }
}

/// SH-2 encoders.
pub mod sh2 {
    #[must_use]
    pub const fn nm(top: u16, n: u8, m: u8, low: u16) -> u16 {
        (top << 12) | ((n as u16 & 15) << 8) | ((m as u16 & 15) << 4) | low
    }

    #[must_use]
    pub const fn nop() -> u16 {
        0x0009
    }

    #[must_use]
    pub const fn mov_imm(n: u8, imm: i8) -> u16 {
        0xE000 | ((n as u16 & 15) << 8) | (imm as u8 as u16)
    }

    #[must_use]
    pub const fn add_imm(n: u8, imm: i8) -> u16 {
        0x7000 | ((n as u16 & 15) << 8) | (imm as u8 as u16)
    }

    #[must_use]
    pub const fn mov(n: u8, m: u8) -> u16 {
        nm(6, n, m, 3)
    }

    #[must_use]
    pub const fn add(n: u8, m: u8) -> u16 {
        nm(3, n, m, 0xC)
    }

    #[must_use]
    pub const fn sub(n: u8, m: u8) -> u16 {
        nm(3, n, m, 8)
    }

    #[must_use]
    pub const fn and(n: u8, m: u8) -> u16 {
        nm(2, n, m, 9)
    }

    #[must_use]
    pub const fn cmp_eq(n: u8, m: u8) -> u16 {
        nm(3, n, m, 0)
    }

    #[must_use]
    pub const fn cmp_gt(n: u8, m: u8) -> u16 {
        nm(3, n, m, 7)
    }

    #[must_use]
    pub const fn tst(n: u8, m: u8) -> u16 {
        nm(2, n, m, 8)
    }

    #[must_use]
    pub const fn dt(n: u8) -> u16 {
        nm(4, n, 1, 0)
    }

    #[must_use]
    pub const fn shll(n: u8) -> u16 {
        nm(4, n, 0, 0)
    }

    #[must_use]
    pub const fn shlr2(n: u8) -> u16 {
        nm(4, n, 0, 9)
    }

    #[must_use]
    pub const fn movt(n: u8) -> u16 {
        nm(0, n, 2, 9)
    }

    #[must_use]
    pub const fn extu_b(n: u8, m: u8) -> u16 {
        nm(6, n, m, 0xC)
    }

    #[must_use]
    pub const fn mul_l(n: u8, m: u8) -> u16 {
        nm(0, n, m, 7)
    }

    #[must_use]
    pub const fn dmuls_l(n: u8, m: u8) -> u16 {
        nm(3, n, m, 0xD)
    }

    #[must_use]
    pub const fn sts_macl(n: u8) -> u16 {
        nm(0, n, 1, 0xA)
    }

    /// `MOV.L @Rm,Rn`
    #[must_use]
    pub const fn mov_l_load(n: u8, m: u8) -> u16 {
        nm(6, n, m, 2)
    }

    /// `MOV.L @Rm+,Rn`
    #[must_use]
    pub const fn mov_l_postinc(n: u8, m: u8) -> u16 {
        nm(6, n, m, 6)
    }

    /// `MOV.L Rm,@Rn`
    #[must_use]
    pub const fn mov_l_store(n: u8, m: u8) -> u16 {
        nm(2, n, m, 2)
    }

    /// `MOV.L Rm,@-Rn`
    #[must_use]
    pub const fn mov_l_predec(n: u8, m: u8) -> u16 {
        nm(2, n, m, 6)
    }

    /// `MOV.B Rm,@Rn`
    #[must_use]
    pub const fn mov_b_store(n: u8, m: u8) -> u16 {
        nm(2, n, m, 0)
    }

    /// `MOV.L @(disp*4,PC),Rn`
    #[must_use]
    pub const fn mov_l_pcrel(n: u8, disp: u8) -> u16 {
        0xD000 | ((n as u16 & 15) << 8) | disp as u16
    }

    /// `MOV.W @(disp*2,PC),Rn`
    #[must_use]
    pub const fn mov_w_pcrel(n: u8, disp: u8) -> u16 {
        0x9000 | ((n as u16 & 15) << 8) | disp as u16
    }

    #[must_use]
    pub const fn bt(disp: i8) -> u16 {
        0x8900 | disp as u8 as u16
    }

    #[must_use]
    pub const fn bf(disp: i8) -> u16 {
        0x8B00 | disp as u8 as u16
    }

    #[must_use]
    pub const fn bf_s(disp: i8) -> u16 {
        0x8F00 | disp as u8 as u16
    }

    #[must_use]
    pub const fn bra(disp: i16) -> u16 {
        0xA000 | (disp as u16 & 0x0FFF)
    }

    #[must_use]
    pub const fn bsr(disp: i16) -> u16 {
        0xB000 | (disp as u16 & 0x0FFF)
    }

    #[must_use]
    pub const fn jmp(m: u8) -> u16 {
        nm(4, m, 2, 0xB)
    }

    #[must_use]
    pub const fn jsr(m: u8) -> u16 {
        nm(4, m, 0, 0xB)
    }

    #[must_use]
    pub const fn rts() -> u16 {
        0x000B
    }

    #[must_use]
    pub const fn trapa(imm: u8) -> u16 {
        0xC300 | imm as u16
    }

    /// `ADDC Rm,Rn` (interpreted).
    #[must_use]
    pub const fn addc(n: u8, m: u8) -> u16 {
        nm(3, n, m, 0xE)
    }

    /// Serialize a program as big-endian bytes.
    #[must_use]
    pub fn assemble(words: &[u16]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_be_bytes()).collect()
    }
}
