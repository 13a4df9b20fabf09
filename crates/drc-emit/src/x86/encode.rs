//! x86-64 machine code encoding.
//!
//! Only the forms the block emitter needs. Register-to-register ALU forms
//! use the `r/m, reg` opcodes; 32-bit operations zero the upper half of
//! the destination, which the emitter relies on.

use crate::buffer::{CodeBuffer, Label};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Reg {
    #[inline]
    const fn num(self) -> u8 {
        self as u8
    }

    #[inline]
    const fn low(self) -> u8 {
        self as u8 & 7
    }

    /// `spl bpl sil dil` are only reachable with a REX prefix.
    #[inline]
    const fn byte_needs_rex(self) -> bool {
        matches!(self, Self::Rsp | Self::Rbp | Self::Rsi | Self::Rdi)
    }
}

/// Condition codes (low nibble of `Jcc`/`SETcc`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Cc {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xA,
    Np = 0xB,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

impl Cc {
    #[must_use]
    pub const fn invert(self) -> Self {
        match self {
            Self::O => Self::No,
            Self::No => Self::O,
            Self::B => Self::Ae,
            Self::Ae => Self::B,
            Self::E => Self::Ne,
            Self::Ne => Self::E,
            Self::Be => Self::A,
            Self::A => Self::Be,
            Self::S => Self::Ns,
            Self::Ns => Self::S,
            Self::P => Self::Np,
            Self::Np => Self::P,
            Self::L => Self::Ge,
            Self::Ge => Self::L,
            Self::Le => Self::G,
            Self::G => Self::Le,
        }
    }
}

/// Memory operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mem {
    /// `[base + disp]`
    Base(Reg, i32),
    /// `[base + index]`
    Index(Reg, Reg),
}

/// Group-1 arithmetic (`/digit` of opcodes 80/81/83).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Arith {
    Add = 0,
    Or = 1,
    And = 4,
    Sub = 5,
    Xor = 6,
    Cmp = 7,
}

/// Group-2 shifts and rotates (`/digit` of C1/D1/D3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Shift {
    Rol = 0,
    Ror = 1,
    Shl = 4,
    Shr = 5,
    Sar = 7,
}

impl CodeBuffer<'_> {
    #[inline]
    fn rex(&mut self, w: bool, r: u8, x: u8, b: u8, force: bool) {
        let rex = 0x40 | (u8::from(w) << 3) | (((r >> 3) & 1) << 2) | (((x >> 3) & 1) << 1) | ((b >> 3) & 1);
        if rex != 0x40 || force {
            self.emit_u8(rex);
        }
    }

    #[inline]
    fn modrm(&mut self, mode: u8, reg: u8, rm: u8) {
        self.emit_u8(((mode & 3) << 6) | ((reg & 7) << 3) | (rm & 7));
    }

    fn mem_operand(&mut self, reg: u8, mem: Mem) {
        match mem {
            Mem::Base(base, disp) => {
                let mode = if disp == 0 && base.low() != 5 {
                    0b00
                } else if i8::try_from(disp).is_ok() {
                    0b01
                } else {
                    0b10
                };
                self.modrm(mode, reg, base.low());
                if base.low() == 4 {
                    self.emit_u8(0x24);
                }
                match mode {
                    0b01 => self.emit_u8(disp as u8),
                    0b10 => self.emit_u32(disp as u32),
                    _ => {}
                }
            }
            Mem::Index(base, index) => {
                // rbp/r13 as base have no disp-less form
                let mode = if base.low() == 5 { 0b01 } else { 0b00 };
                self.modrm(mode, reg, 4);
                self.emit_u8((index.low() << 3) | base.low());
                if mode == 0b01 {
                    self.emit_u8(0);
                }
            }
        }
    }

    /// `op reg, rm` with a register `rm`.
    fn op_rr(&mut self, w: bool, op: &[u8], reg: u8, rm: Reg, byte: bool) {
        let force = byte && rm.byte_needs_rex();
        self.rex(w, reg, 0, rm.num(), force);
        self.emit(op);
        self.modrm(0b11, reg, rm.low());
    }

    /// `op reg, [mem]`.
    fn op_rm(&mut self, w: bool, op: &[u8], reg: u8, mem: Mem, force: bool) {
        let (base, index) = match mem {
            Mem::Base(b, _) => (b.num(), 0),
            Mem::Index(b, i) => (b.num(), i.num()),
        };
        self.rex(w, reg, index, base, force);
        self.emit(op);
        self.mem_operand(reg, mem);
    }

    // ------------------------------------------------------------------
    // moves
    // ------------------------------------------------------------------

    pub fn mov32(&mut self, dst: Reg, src: Reg) {
        self.op_rr(false, &[0x89], src.num(), dst, false);
    }

    pub fn mov64(&mut self, dst: Reg, src: Reg) {
        self.op_rr(true, &[0x89], src.num(), dst, false);
    }

    /// `mov r32, imm32` (zero-extends; leaves flags alone).
    pub fn mov_imm32(&mut self, dst: Reg, imm: u32) {
        self.rex(false, 0, 0, dst.num(), false);
        self.emit_u8(0xB8 + dst.low());
        self.emit_u32(imm);
    }

    /// Shortest `mov` of a 64-bit constant.
    pub fn mov_imm64(&mut self, dst: Reg, imm: u64) {
        if let Ok(small) = u32::try_from(imm) {
            self.mov_imm32(dst, small);
        } else if let Ok(signed) = i32::try_from(imm as i64) {
            // C7 /0 sign-extends its imm32
            self.op_rr(true, &[0xC7], 0, dst, false);
            self.emit_u32(signed as u32);
        } else {
            self.rex(true, 0, 0, dst.num(), false);
            self.emit_u8(0xB8 + dst.low());
            self.emit_u64(imm);
        }
    }

    pub fn load32(&mut self, dst: Reg, mem: Mem) {
        self.op_rm(false, &[0x8B], dst.num(), mem, false);
    }

    pub fn load64(&mut self, dst: Reg, mem: Mem) {
        self.op_rm(true, &[0x8B], dst.num(), mem, false);
    }

    pub fn store8(&mut self, mem: Mem, src: Reg) {
        self.op_rm(false, &[0x88], src.num(), mem, src.byte_needs_rex());
    }

    pub fn store16(&mut self, mem: Mem, src: Reg) {
        self.emit_u8(0x66);
        self.op_rm(false, &[0x89], src.num(), mem, false);
    }

    pub fn store32(&mut self, mem: Mem, src: Reg) {
        self.op_rm(false, &[0x89], src.num(), mem, false);
    }

    pub fn store64(&mut self, mem: Mem, src: Reg) {
        self.op_rm(true, &[0x89], src.num(), mem, false);
    }

    /// `mov dword [mem], imm32`.
    pub fn store_imm32(&mut self, mem: Mem, imm: u32) {
        self.op_rm(false, &[0xC7], 0, mem, false);
        self.emit_u32(imm);
    }

    pub fn movzx8_mem(&mut self, dst: Reg, mem: Mem) {
        self.op_rm(false, &[0x0F, 0xB6], dst.num(), mem, false);
    }

    pub fn movzx16_mem(&mut self, dst: Reg, mem: Mem) {
        self.op_rm(false, &[0x0F, 0xB7], dst.num(), mem, false);
    }

    pub fn movzx8(&mut self, dst: Reg, src: Reg) {
        self.op_rr(false, &[0x0F, 0xB6], dst.num(), src, true);
    }

    pub fn movzx16(&mut self, dst: Reg, src: Reg) {
        self.op_rr(false, &[0x0F, 0xB7], dst.num(), src, false);
    }

    pub fn movsx8(&mut self, dst: Reg, src: Reg) {
        self.op_rr(false, &[0x0F, 0xBE], dst.num(), src, true);
    }

    pub fn movsx16(&mut self, dst: Reg, src: Reg) {
        self.op_rr(false, &[0x0F, 0xBF], dst.num(), src, false);
    }

    /// `movsxd r64, r32`.
    pub fn movsxd(&mut self, dst: Reg, src: Reg) {
        self.op_rr(true, &[0x63], dst.num(), src, false);
    }

    pub fn lea32(&mut self, dst: Reg, mem: Mem) {
        self.op_rm(false, &[0x8D], dst.num(), mem, false);
    }

    pub fn lea64(&mut self, dst: Reg, mem: Mem) {
        self.op_rm(true, &[0x8D], dst.num(), mem, false);
    }

    // ------------------------------------------------------------------
    // arithmetic
    // ------------------------------------------------------------------

    /// `op dst, src` (32 or 64 bits).
    pub fn arith(&mut self, w: bool, op: Arith, dst: Reg, src: Reg) {
        self.op_rr(w, &[((op as u8) << 3) | 1], src.num(), dst, false);
    }

    /// `op dst, imm` with the shortest immediate.
    pub fn arith_imm(&mut self, w: bool, op: Arith, dst: Reg, imm: i32) {
        if let Ok(small) = i8::try_from(imm) {
            self.op_rr(w, &[0x83], op as u8, dst, false);
            self.emit_u8(small as u8);
        } else {
            self.op_rr(w, &[0x81], op as u8, dst, false);
            self.emit_u32(imm as u32);
        }
    }

    /// `op dst, [mem]`.
    pub fn arith_mem(&mut self, w: bool, op: Arith, dst: Reg, mem: Mem) {
        self.op_rm(w, &[((op as u8) << 3) | 3], dst.num(), mem, false);
    }

    /// `cmp byte [mem], imm8`.
    pub fn cmp_mem8(&mut self, mem: Mem, imm: u8) {
        self.op_rm(false, &[0x80], Arith::Cmp as u8, mem, false);
        self.emit_u8(imm);
    }

    pub fn test(&mut self, w: bool, a: Reg, b: Reg) {
        self.op_rr(w, &[0x85], b.num(), a, false);
    }

    pub fn test_imm32(&mut self, a: Reg, imm: u32) {
        self.op_rr(false, &[0xF7], 0, a, false);
        self.emit_u32(imm);
    }

    pub fn shift_imm(&mut self, w: bool, op: Shift, reg: Reg, amount: u8) {
        if amount == 1 {
            self.op_rr(w, &[0xD1], op as u8, reg, false);
        } else {
            self.op_rr(w, &[0xC1], op as u8, reg, false);
            self.emit_u8(amount);
        }
    }

    /// Shift by `cl`.
    pub fn shift_cl(&mut self, w: bool, op: Shift, reg: Reg) {
        self.op_rr(w, &[0xD3], op as u8, reg, false);
    }

    /// `rol r16, 8`: swap the two low bytes.
    pub fn swap16(&mut self, reg: Reg) {
        self.emit_u8(0x66);
        self.op_rr(false, &[0xC1], Shift::Rol as u8, reg, false);
        self.emit_u8(8);
    }

    pub fn bswap(&mut self, w: bool, reg: Reg) {
        self.rex(w, 0, 0, reg.num(), false);
        self.emit(&[0x0F, 0xC8 + reg.low()]);
    }

    /// `imul dst, src`.
    pub fn imul(&mut self, w: bool, dst: Reg, src: Reg) {
        self.op_rr(w, &[0x0F, 0xAF], dst.num(), src, false);
    }

    /// Unsigned `edx:eax / src`.
    pub fn div32(&mut self, src: Reg) {
        self.op_rr(false, &[0xF7], 6, src, false);
    }

    /// Signed `edx:eax / src`.
    pub fn idiv32(&mut self, src: Reg) {
        self.op_rr(false, &[0xF7], 7, src, false);
    }

    /// Sign-extend `eax` into `edx`.
    pub fn cdq(&mut self) {
        self.emit_u8(0x99);
    }

    pub fn neg(&mut self, w: bool, reg: Reg) {
        self.op_rr(w, &[0xF7], 3, reg, false);
    }

    pub fn not(&mut self, w: bool, reg: Reg) {
        self.op_rr(w, &[0xF7], 2, reg, false);
    }

    pub fn setcc(&mut self, cc: Cc, reg: Reg) {
        self.op_rr(false, &[0x0F, 0x90 | cc as u8], 0, reg, true);
    }

    // ------------------------------------------------------------------
    // control flow
    // ------------------------------------------------------------------

    pub fn push(&mut self, reg: Reg) {
        self.rex(false, 0, 0, reg.num(), false);
        self.emit_u8(0x50 + reg.low());
    }

    pub fn pop(&mut self, reg: Reg) {
        self.rex(false, 0, 0, reg.num(), false);
        self.emit_u8(0x58 + reg.low());
    }

    pub fn call_mem(&mut self, mem: Mem) {
        self.op_rm(false, &[0xFF], 2, mem, false);
    }

    pub fn jmp_mem(&mut self, mem: Mem) {
        self.op_rm(false, &[0xFF], 4, mem, false);
    }

    pub fn jmp_reg(&mut self, reg: Reg) {
        self.op_rr(false, &[0xFF], 4, reg, false);
    }

    /// `jmp rel32` to `label`; returns the offset of the rel32 field.
    pub fn jmp(&mut self, label: Label) -> usize {
        self.emit_u8(0xE9);
        self.rel32_to(label)
    }

    /// `jcc rel32` to `label`; returns the offset of the rel32 field.
    pub fn jcc(&mut self, cc: Cc, label: Label) -> usize {
        self.emit(&[0x0F, 0x80 | cc as u8]);
        self.rel32_to(label)
    }

    pub fn ret(&mut self) {
        self.emit_u8(0xC3);
    }
}

#[cfg(test)]
mod tests {
    use super::Reg::*;
    use super::*;

    fn bytes(f: impl FnOnce(&mut CodeBuffer<'_>)) -> Vec<u8> {
        let mut mem = vec![0u8; 64];
        let mut buf = CodeBuffer::new(&mut mem, 0, 0, 64);
        f(&mut buf);
        let end = buf.finish().unwrap();
        mem.truncate(end);
        mem
    }

    #[test]
    fn test_register_moves() {
        assert_eq!(bytes(|b| b.mov32(Rax, Rcx)), [0x89, 0xC8]);
        assert_eq!(bytes(|b| b.mov64(Rdi, R15)), [0x4C, 0x89, 0xFF]);
        assert_eq!(bytes(|b| b.movsxd(R10, Rax)), [0x4C, 0x63, 0xD0]);
        assert_eq!(bytes(|b| b.mov_imm32(R10, 1)), [0x41, 0xBA, 1, 0, 0, 0]);
        assert_eq!(bytes(|b| b.mov_imm64(Rax, u64::MAX)), [0x48, 0xC7, 0xC0, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(bytes(|b| b.mov_imm64(R11, 0x7F00_0000_1000)).len(), 10);
    }

    #[test]
    fn test_memory_operands() {
        assert_eq!(bytes(|b| b.load32(R10, Mem::Base(R15, 0x200))), [0x45, 0x8B, 0x97, 0x00, 0x02, 0, 0]);
        assert_eq!(bytes(|b| b.load32(Rax, Mem::Base(Rbp, 0))), [0x8B, 0x45, 0x00]);
        assert_eq!(bytes(|b| b.load32(Rax, Mem::Base(R12, 0))), [0x41, 0x8B, 0x04, 0x24]);
        assert_eq!(bytes(|b| b.lea32(R10, Mem::Base(Rax, 0x10))), [0x44, 0x8D, 0x50, 0x10]);
        assert_eq!(bytes(|b| b.movzx8_mem(R10, Mem::Index(R11, R10))), [0x47, 0x0F, 0xB6, 0x14, 0x13]);
        assert_eq!(bytes(|b| b.store8(Mem::Base(R11, 0), R10)), [0x45, 0x88, 0x13]);
        assert_eq!(bytes(|b| b.cmp_mem8(Mem::Base(R11, 0), 0)), [0x41, 0x80, 0x3B, 0x00]);
        assert_eq!(
            bytes(|b| b.arith_mem(true, Arith::Add, R11, Mem::Base(R15, 0x208))),
            [0x4D, 0x03, 0x9F, 0x08, 0x02, 0, 0]
        );
    }

    #[test]
    fn test_byte_registers_get_rex() {
        assert_eq!(bytes(|b| b.movsx8(Rax, Rsi)), [0x40, 0x0F, 0xBE, 0xC6]);
        assert_eq!(bytes(|b| b.setcc(Cc::L, R10)), [0x41, 0x0F, 0x9C, 0xC2]);
        assert_eq!(bytes(|b| b.setcc(Cc::E, Rax)), [0x0F, 0x94, 0xC0]);
    }

    #[test]
    fn test_arith_and_shifts() {
        assert_eq!(bytes(|b| b.arith_imm(false, Arith::Add, Rbx, 5)), [0x83, 0xC3, 0x05]);
        assert_eq!(bytes(|b| b.arith_imm(false, Arith::Cmp, Rcx, 0x1000)), [0x81, 0xF9, 0x00, 0x10, 0, 0]);
        assert_eq!(bytes(|b| b.test(false, Rbx, Rbx)), [0x85, 0xDB]);
        assert_eq!(bytes(|b| b.shift_imm(false, Shift::Shr, R11, 12)), [0x41, 0xC1, 0xEB, 0x0C]);
        assert_eq!(bytes(|b| b.swap16(R10)), [0x66, 0x41, 0xC1, 0xC2, 0x08]);
        assert_eq!(bytes(|b| b.bswap(false, R10)), [0x41, 0x0F, 0xCA]);
        assert_eq!(bytes(|b| b.imul(true, R10, R11)), [0x4D, 0x0F, 0xAF, 0xD3]);
    }

    #[test]
    fn test_control_flow() {
        assert_eq!(bytes(|b| b.jmp_mem(Mem::Base(R15, 0x218))), [0x41, 0xFF, 0xA7, 0x18, 0x02, 0, 0]);
        assert_eq!(bytes(|b| b.call_mem(Mem::Base(R15, 0x230))), [0x41, 0xFF, 0x97, 0x30, 0x02, 0, 0]);
        assert_eq!(bytes(|b| b.push(R12)), [0x41, 0x54]);
        assert_eq!(bytes(|b| b.jmp_reg(Rax)), [0xFF, 0xE0]);
        let code = bytes(|b| {
            let l = b.new_label();
            b.jcc(Cc::Ns, l);
            b.bind(l);
        });
        assert_eq!(code, [0x0F, 0x89, 0, 0, 0, 0]);
        assert_eq!(Cc::L.invert(), Cc::Ge);
    }
}
