//! ALU, shift, move and multiply/divide lowering.
//!
//! 32-bit results are computed in the destination's lower slot; when the
//! destination also has an upper slot the result is sign-extended into it.
//! 64-bit operations assemble their operands in `r10`/`r11` and split the
//! result afterwards.

use drc_ir::{AluOp, Cond, ExtOp, HOST_DIV_HI, HOST_DIV_LO, MulDivOp, ShiftAmount, ShiftOp, Src2, VReg, Width};

use super::encode::{Arith, Cc, Mem, Reg, Shift};
use super::registers::{TMP0, TMP1, slot_reg};
use super::{BlockEmitter, Opnd};
use crate::error::{EmitError, Result};

const fn set_cc(cond: Cond) -> Cc {
    match cond {
        Cond::Eq => Cc::E,
        Cond::Ne => Cc::Ne,
        Cond::Lt => Cc::L,
        Cond::Ltu => Cc::B,
        Cond::Ge => Cc::Ge,
        Cond::Geu => Cc::Ae,
        Cond::Gt => Cc::G,
        Cond::Gtu => Cc::A,
    }
}

const fn shift_op(op: ShiftOp) -> Shift {
    match op {
        ShiftOp::Sll => Shift::Shl,
        ShiftOp::Srl => Shift::Shr,
        ShiftOp::Sra => Shift::Sar,
        ShiftOp::Rotl => Shift::Rol,
        ShiftOp::Rotr => Shift::Ror,
    }
}

impl BlockEmitter<'_, '_> {
    /// `op dst, src` for an immediate or register source.
    fn arith_opnd(&mut self, op: Arith, dst: Reg, src: Opnd) {
        match src {
            Opnd::Reg(r) => self.code.arith(false, op, dst, r),
            Opnd::Imm(k) => self.code.arith_imm(false, op, dst, k),
        }
    }

    /// `d = a op b` on a two-address machine.
    fn two_addr(&mut self, op: Arith, d: Reg, a: Opnd, b: Opnd, commutative: bool) {
        if b == Opnd::Reg(d) && a != b {
            if commutative {
                self.arith_opnd(op, d, a);
            } else {
                self.code.mov32(TMP0, d);
                self.opnd_to(d, a);
                self.code.arith(false, op, d, TMP0);
            }
            return;
        }
        self.opnd_to(d, a);
        self.arith_opnd(op, d, b);
    }

    /// Register holding `a`, materializing an immediate in `scratch`.
    fn in_reg(&mut self, a: Opnd, scratch: Reg) -> Reg {
        match a {
            Opnd::Reg(r) => r,
            Opnd::Imm(k) => {
                self.code.mov_imm32(scratch, k as u32);
                scratch
            }
        }
    }

    // ========================================================================
    // ALU
    // ========================================================================

    pub(super) fn alu(&mut self, i: usize, op: AluOp, width: Width, src2: Src2) -> Result<()> {
        let rec = self.rec(i);
        let Some(dst) = rec.rt1 else { return Ok(()) };
        let wide_src = width == Width::W64
            && [rec.rs1, if src2 == Src2::Reg { rec.rs2 } else { None }]
                .into_iter()
                .flatten()
                .any(|r| self.src_upper(i, r).is_some());
        let wide_dst = width == Width::W64 && self.dst_upper(i, dst).is_some();
        if wide_dst || (op.is_predicate() && wide_src) {
            return self.alu_wide(i, op, src2, dst);
        }

        let d = self.dst(i, dst)?;
        let a = self.src_opnd(i, rec.rs1)?;
        let b = match src2 {
            Src2::Reg => self.src_opnd(i, rec.rs2)?,
            Src2::Imm => Opnd::Imm(rec.imm as i32),
        };
        match op {
            AluOp::Add => match (a, b) {
                (Opnd::Reg(x), Opnd::Reg(y)) => self.code.lea32(d, Mem::Index(x, y)),
                (Opnd::Reg(x), Opnd::Imm(k)) | (Opnd::Imm(k), Opnd::Reg(x)) => {
                    self.code.lea32(d, Mem::Base(x, k));
                }
                (Opnd::Imm(x), Opnd::Imm(y)) => self.code.mov_imm32(d, x.wrapping_add(y) as u32),
            },
            AluOp::Sub => match b {
                Opnd::Imm(k) => match a {
                    Opnd::Reg(x) => self.code.lea32(d, Mem::Base(x, k.wrapping_neg())),
                    Opnd::Imm(x) => self.code.mov_imm32(d, x.wrapping_sub(k) as u32),
                },
                Opnd::Reg(_) => self.two_addr(Arith::Sub, d, a, b, false),
            },
            AluOp::And => self.two_addr(Arith::And, d, a, b, true),
            AluOp::Or => self.two_addr(Arith::Or, d, a, b, true),
            AluOp::Xor => self.two_addr(Arith::Xor, d, a, b, true),
            AluOp::Nor => {
                self.two_addr(Arith::Or, d, a, b, true);
                self.code.not(false, d);
            }
            AluOp::Set(cond) => {
                let lhs = self.in_reg(a, TMP1);
                self.arith_opnd(Arith::Cmp, lhs, b);
                self.code.setcc(set_cc(cond), TMP0);
                self.code.movzx8(d, TMP0);
            }
            AluOp::Test => {
                let lhs = self.in_reg(a, TMP1);
                match b {
                    Opnd::Reg(r) => self.code.test(false, lhs, r),
                    Opnd::Imm(k) => self.code.test_imm32(lhs, k as u32),
                }
                self.code.setcc(Cc::E, TMP0);
                self.code.movzx8(d, TMP0);
            }
        }
        self.extend_upper(i, dst, true)
    }

    fn alu_wide(&mut self, i: usize, op: AluOp, src2: Src2, dst: VReg) -> Result<()> {
        let rec = self.rec(i);
        let src = self.alloc.regs[i].src;
        self.wide_to(i, &src, TMP0, rec.rs1)?;
        match src2 {
            Src2::Reg => self.wide_to(i, &src, TMP1, rec.rs2)?,
            Src2::Imm => self.code.mov_imm64(TMP1, rec.imm as u64),
        }
        let arith = match op {
            AluOp::Add => Some(Arith::Add),
            AluOp::Sub => Some(Arith::Sub),
            AluOp::And => Some(Arith::And),
            AluOp::Or | AluOp::Nor => Some(Arith::Or),
            AluOp::Xor => Some(Arith::Xor),
            AluOp::Set(_) | AluOp::Test => None,
        };
        if let Some(arith) = arith {
            self.code.arith(true, arith, TMP0, TMP1);
            if op == AluOp::Nor {
                self.code.not(true, TMP0);
            }
            return self.split_wide(i, dst);
        }

        let d = self.dst(i, dst)?;
        match op {
            AluOp::Set(cond) => {
                self.code.arith(true, Arith::Cmp, TMP0, TMP1);
                self.code.setcc(set_cc(cond), TMP0);
            }
            _ => {
                self.code.test(true, TMP0, TMP1);
                self.code.setcc(Cc::E, TMP0);
            }
        }
        self.code.movzx8(d, TMP0);
        if let Some(hi) = self.dst_upper(i, dst) {
            self.code.mov_imm32(hi, 0);
        }
        Ok(())
    }

    // ========================================================================
    // Shifts
    // ========================================================================

    pub(super) fn shift(
        &mut self,
        i: usize,
        op: ShiftOp,
        width: Width,
        amount: ShiftAmount,
        sets_t: bool,
    ) -> Result<()> {
        let rec = self.rec(i);
        let Some(dst) = rec.rt1 else { return Ok(()) };
        let x86 = shift_op(op);
        if width == Width::W64 {
            let src = self.alloc.regs[i].src;
            self.wide_to(i, &src, TMP0, rec.rs1)?;
            match amount {
                ShiftAmount::Imm(n) => self.code.shift_imm(true, x86, TMP0, n & 63),
                ShiftAmount::Reg => {
                    let amt = self.src_opnd(i, rec.rs2)?;
                    self.shift_by_cl(true, x86, amt);
                }
            }
            return self.split_wide(i, dst);
        }

        let d = self.dst(i, dst)?;
        match amount {
            ShiftAmount::Imm(n) => {
                let value = self.src_opnd(i, rec.rs1)?;
                self.opnd_to(d, value);
                if n & 31 != 0 {
                    self.code.shift_imm(false, x86, d, n & 31);
                }
                if sets_t && let Some(t) = rec.rt2 {
                    let t = self.dst(i, t)?;
                    self.code.setcc(Cc::B, TMP0);
                    self.code.movzx8(t, TMP0);
                }
            }
            ShiftAmount::Reg => {
                let value = self.src_opnd(i, rec.rs1)?;
                self.opnd_to(TMP0, value);
                let amt = self.src_opnd(i, rec.rs2)?;
                self.shift_by_cl(false, x86, amt);
                self.code.mov32(d, TMP0);
            }
        }
        self.extend_upper(i, dst, true)
    }

    /// Shift `TMP0` by `amt`, borrowing `rcx` through `TMP1`.
    fn shift_by_cl(&mut self, w: bool, op: Shift, amt: Opnd) {
        match amt {
            Opnd::Imm(k) => {
                let mask = if w { 63 } else { 31 };
                let n = (k as u8) & mask;
                if n != 0 {
                    self.code.shift_imm(w, op, TMP0, n);
                }
            }
            Opnd::Reg(r) => {
                self.code.mov64(TMP1, Reg::Rcx);
                if r != Reg::Rcx {
                    self.code.mov32(Reg::Rcx, r);
                }
                self.code.shift_cl(w, op, TMP0);
                self.code.mov64(Reg::Rcx, TMP1);
            }
        }
    }

    // ========================================================================
    // Moves and extensions
    // ========================================================================

    pub(super) fn mov(&mut self, i: usize, width: Width) -> Result<()> {
        let rec = self.rec(i);
        let Some(dst) = rec.rt1 else { return Ok(()) };
        let d = self.dst(i, dst)?;
        let value = self.src_opnd(i, rec.rs1)?;
        let d_hi = (width == Width::W64).then(|| self.dst_upper(i, dst)).flatten();
        let Some(d_hi) = d_hi else {
            self.opnd_to(d, value);
            return self.extend_upper(i, dst, true);
        };
        // the upper word first, the lower slot may be one of its inputs
        match (value, rec.rs1.and_then(|r| self.src_upper(i, r))) {
            (_, Some(s_hi)) => self.code.mov32(TMP0, s_hi),
            (Opnd::Reg(lo), None) => {
                self.code.mov32(TMP0, lo);
                self.code.shift_imm(false, Shift::Sar, TMP0, 31);
            }
            (Opnd::Imm(k), None) => self.code.mov_imm32(TMP0, (k >> 31) as u32),
        }
        self.opnd_to(d, value);
        self.code.mov32(d_hi, TMP0);
        Ok(())
    }

    pub(super) fn load_const(&mut self, i: usize) -> Result<()> {
        let rec = self.rec(i);
        let Some(dst) = rec.rt1 else { return Ok(()) };
        self.write_const(i, dst, rec.imm as u64)
    }

    pub(super) fn ext(&mut self, i: usize, op: ExtOp) -> Result<()> {
        let rec = self.rec(i);
        let Some(dst) = rec.rt1 else { return Ok(()) };
        let d = self.dst(i, dst)?;
        let s = match self.src_opnd(i, rec.rs1)? {
            Opnd::Reg(r) => r,
            Opnd::Imm(_) => {
                self.code.mov_imm32(d, 0);
                return self.extend_upper(i, dst, true);
            }
        };
        match op {
            ExtOp::SignByte => self.code.movsx8(d, s),
            ExtOp::SignHalf => self.code.movsx16(d, s),
            ExtOp::ZeroByte => self.code.movzx8(d, s),
            ExtOp::ZeroHalf => self.code.movzx16(d, s),
            ExtOp::SwapBytes => {
                self.opnd_to(d, Opnd::Reg(s));
                self.code.swap16(d);
            }
            ExtOp::SwapHalves => {
                self.opnd_to(d, Opnd::Reg(s));
                self.code.shift_imm(false, Shift::Rol, d, 16);
            }
        }
        self.extend_upper(i, dst, true)
    }

    pub(super) fn dec_test(&mut self, i: usize) -> Result<()> {
        let rec = self.rec(i);
        let Some(dst) = rec.rt1 else { return Ok(()) };
        let d = self.dst(i, dst)?;
        let value = self.src_opnd(i, rec.rs1)?;
        self.opnd_to(d, value);
        self.code.arith_imm(false, Arith::Sub, d, 1);
        if let Some(t) = rec.rt2 {
            let t = self.dst(i, t)?;
            self.code.setcc(Cc::E, TMP0);
            self.code.movzx8(t, TMP0);
        }
        Ok(())
    }

    // ========================================================================
    // Multiply and divide
    // ========================================================================

    pub(super) fn muldiv(&mut self, i: usize, op: MulDivOp) -> Result<()> {
        let rec = self.rec(i);
        let a = self.src_opnd(i, rec.rs1)?;
        let b = self.src_opnd(i, rec.rs2)?;
        match op {
            MulDivOp::Mult | MulDivOp::Multu => {
                let signed = op == MulDivOp::Mult;
                self.widen_to(TMP0, a, signed);
                self.widen_to(TMP1, b, signed);
                self.code.imul(true, TMP0, TMP1);
                if let Some(lo) = rec.rt1 {
                    let d = self.dst(i, lo)?;
                    self.code.mov32(d, TMP0);
                    self.extend_upper(i, lo, true)?;
                }
                if let Some(hi) = rec.rt2 {
                    self.code.shift_imm(true, Shift::Shr, TMP0, 32);
                    let d = self.dst(i, hi)?;
                    self.code.mov32(d, TMP0);
                    self.extend_upper(i, hi, true)?;
                }
                Ok(())
            }
            MulDivOp::MulLow | MulDivOp::MulsHalf | MulDivOp::MuluHalf => {
                let Some(lo) = rec.rt1 else { return Ok(()) };
                self.opnd_to(TMP0, a);
                self.opnd_to(TMP1, b);
                match op {
                    MulDivOp::MulsHalf => {
                        self.code.movsx16(TMP0, TMP0);
                        self.code.movsx16(TMP1, TMP1);
                    }
                    MulDivOp::MuluHalf => {
                        self.code.movzx16(TMP0, TMP0);
                        self.code.movzx16(TMP1, TMP1);
                    }
                    _ => {}
                }
                self.code.imul(false, TMP0, TMP1);
                let d = self.dst(i, lo)?;
                self.code.mov32(d, TMP0);
                self.extend_upper(i, lo, true)
            }
            MulDivOp::Div | MulDivOp::Divu => self.divide(i, op == MulDivOp::Div, a, b),
        }
    }

    /// `a` zero- or sign-extended to 64 bits in `dst`.
    fn widen_to(&mut self, dst: Reg, a: Opnd, signed: bool) {
        match a {
            Opnd::Reg(r) if signed => self.code.movsxd(dst, r),
            Opnd::Reg(r) => self.code.mov32(dst, r),
            Opnd::Imm(k) if signed => self.code.mov_imm64(dst, i64::from(k) as u64),
            Opnd::Imm(k) => self.code.mov_imm32(dst, k as u32),
        }
    }

    /// Quotient to `rax`, remainder to `rdx`. Division by zero and the
    /// signed overflow case produce the guest's defined results instead of
    /// a host fault.
    fn divide(&mut self, i: usize, signed: bool, a: Opnd, b: Opnd) -> Result<()> {
        let rec = self.rec(i);
        let cur = &self.alloc.regs[i].cur;
        let in_place = |reg: Option<VReg>, slot: usize| reg.is_none_or(|r| cur.find(r) == Some(slot));
        if !in_place(rec.rt1, HOST_DIV_LO) || !in_place(rec.rt2, HOST_DIV_HI) {
            return Err(EmitError::DivideRegisters { addr: rec.addr });
        }
        let (rax, rdx) = (slot_reg(HOST_DIV_LO), slot_reg(HOST_DIV_HI));
        self.opnd_to(TMP0, a);
        self.opnd_to(TMP1, b);

        let by_zero = self.code.new_label();
        let done = self.code.new_label();
        self.code.test(false, TMP1, TMP1);
        self.code.jcc(Cc::E, by_zero);
        if signed {
            let normal = self.code.new_label();
            self.code.arith_imm(false, Arith::Cmp, TMP1, -1);
            self.code.jcc(Cc::Ne, normal);
            // x / -1 cannot trap when computed as a negation
            self.code.mov32(rax, TMP0);
            self.code.neg(false, rax);
            self.code.arith(false, Arith::Xor, rdx, rdx);
            self.code.jmp(done);
            self.code.bind(normal);
            self.code.mov32(rax, TMP0);
            self.code.cdq();
            self.code.idiv32(TMP1);
        } else {
            self.code.mov32(rax, TMP0);
            self.code.arith(false, Arith::Xor, rdx, rdx);
            self.code.div32(TMP1);
        }
        self.code.jmp(done);

        self.code.bind(by_zero);
        self.code.mov32(rdx, TMP0);
        if signed {
            // quotient is -1 for a non-negative dividend, 1 otherwise
            self.code.mov32(rax, TMP0);
            self.code.shift_imm(false, Shift::Sar, rax, 31);
            self.code.arith_imm(false, Arith::Or, rax, 1);
            self.code.neg(false, rax);
        } else {
            self.code.mov_imm32(rax, u32::MAX);
        }
        self.code.bind(done);

        if let Some(lo) = rec.rt1 {
            self.extend_upper(i, lo, true)?;
        }
        if let Some(hi) = rec.rt2 {
            self.extend_upper(i, hi, true)?;
        }
        Ok(())
    }
}
