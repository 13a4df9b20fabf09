//! Branches, jumps and host calls.
//!
//! A taken edge first checks the cycle counter, which generated code keeps
//! negative while budget remains. Internal targets are reached by moving
//! registers into the target's entry state and jumping to its label;
//! everything else stores the registers and leaves through a lazy-link
//! trampoline, the lookup hook or the dispatcher.

use drc_ir::{BTREG, BranchCond, CCREG, HOST_REGS, InstrKind, InstrRecord, RegState, VReg, Width};
use drc_state::CpuContext;

use super::encode::{Arith, Cc, Mem, Reg};
use super::registers::{CC, CTX, TMP0, TMP1};
use super::stubs::StubBody;
use super::{BlockEmitter, PendingLink, backing, ctx_field};
use crate::block::StubKind;
use crate::error::{EmitError, Result};
use crate::link::LinkKind;

/// Outcome of a branch condition known after the compare.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Taken {
    Always,
    Never,
    If(Cc),
}

type SlotMap = [Option<VReg>; HOST_REGS];

impl BlockEmitter<'_, '_> {
    pub(super) fn branch(&mut self, i: usize) -> Result<()> {
        let rec = self.rec(i);
        let likely = rec.is_likely();
        let delay = rec.has_delay_slot() && self.block.is_paired_ds(i + 1);
        let captured = rec.ds_clobbers && delay && !likely;

        let mut target_in_pc = false;
        if captured {
            self.capture(i)?;
        } else if matches!(rec.kind, InstrKind::JumpReg { .. }) && rec.rt1.is_some() && rec.rt1 == rec.rs1 {
            // the link overwrites the target register
            let src = self.alloc.regs[i].src;
            self.indirect_target(i, &src)?;
            self.code.store32(ctx_field(CpuContext::PC_OFFSET), TMP0);
            target_in_pc = true;
        }
        if let Some(link) = rec.rt1 {
            let ret = i64::from(rec.link_addr() as i32) as u64;
            self.write_const(i, link, ret)?;
        }

        if !delay {
            self.flush_cycles();
            let src = self.alloc.regs[i].src;
            let taken = self.compare(i, &src, rec)?;
            let stat = &self.alloc.regs[i];
            let from = stat.branch.clone().unwrap_or_else(|| stat.cur.clone());
            return self.conditional_taken(i, taken, &from, target_in_pc);
        }

        let d = i + 1;
        self.pending += u32::from(self.rec(d).cycles);
        if likely {
            self.flush_cycles();
            let cur = self.alloc.regs[i].cur.map;
            let taken = self.compare(i, &cur, rec)?;
            if taken == Taken::Never {
                return Ok(());
            }
            let fall = self.code.new_label();
            if let Taken::If(cc) = taken {
                self.code.jcc(cc.invert(), fall);
            }
            self.delay_slot(d)?;
            let from = self.alloc.regs[d].cur.clone();
            self.taken_path(i, &from, target_in_pc)?;
            self.code.bind(fall);
            return Ok(());
        }

        self.delay_slot(d)?;
        self.flush_cycles();
        let after = self.alloc.regs[d].cur.clone();
        let taken = if captured && matches!(rec.kind, InstrKind::Branch { .. }) {
            let bt = self.resident(d, &after.map, BTREG)?;
            self.code.test(false, bt, bt);
            Taken::If(Cc::Ne)
        } else {
            self.compare(d, &after.map, rec)?
        };
        self.conditional_taken(i, taken, &after, target_in_pc)
    }

    /// Run the delay slot paired with the branch before it.
    fn delay_slot(&mut self, d: usize) -> Result<()> {
        let stat = &self.alloc.regs[d];
        self.transition(&stat.pre, &stat.entry, self.needed_before(d));
        self.body(d)
    }

    /// Save what the delay slot would overwrite: the outcome of a
    /// conditional branch, or the target of a register jump.
    fn capture(&mut self, i: usize) -> Result<()> {
        let rec = self.rec(i);
        let bt = self.dst(i, BTREG)?;
        match rec.kind {
            InstrKind::JumpReg { .. } => {
                let src = self.alloc.regs[i].src;
                self.indirect_target(i, &src)?;
                self.code.mov32(bt, TMP0);
            }
            InstrKind::Branch { .. } => {
                let src = self.alloc.regs[i].src;
                match self.compare(i, &src, rec)? {
                    Taken::Always => self.code.mov_imm32(bt, 1),
                    Taken::Never => self.code.mov_imm32(bt, 0),
                    Taken::If(cc) => {
                        self.code.setcc(cc, TMP0);
                        self.code.movzx8(bt, TMP0);
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// `rs1 + imm` of a register jump into `r10`.
    fn indirect_target(&mut self, i: usize, map: &SlotMap) -> Result<()> {
        let rec = self.rec(i);
        let imm = rec.imm as i32;
        match rec.rs1 {
            Some(base) => {
                let b = self.resident(i, map, base)?;
                self.code.lea32(TMP0, Mem::Base(b, imm));
            }
            None => self.code.mov_imm32(TMP0, imm as u32),
        }
        Ok(())
    }

    /// Set the flags for `rec`'s condition from the registers in `map`.
    fn compare(&mut self, i: usize, map: &SlotMap, rec: &InstrRecord) -> Result<Taken> {
        let InstrKind::Branch { cond, width, .. } = rec.kind else {
            return Ok(Taken::Always);
        };
        let upper_resident = |r: &VReg| map.contains(&Some(r.upper()));
        let wide = width == Width::W64
            && self.alloc.wide
            && [rec.rs1, rec.rs2].iter().flatten().any(upper_resident);

        match cond {
            BranchCond::Eq | BranchCond::Ne => {
                let cc = if cond == BranchCond::Eq { Cc::E } else { Cc::Ne };
                match (rec.rs1, rec.rs2) {
                    (None, None) => {
                        return Ok(if cond == BranchCond::Eq { Taken::Always } else { Taken::Never });
                    }
                    _ if wide => {
                        self.wide_to(i, map, TMP0, rec.rs1)?;
                        self.wide_to(i, map, TMP1, rec.rs2)?;
                        self.code.arith(true, Arith::Cmp, TMP0, TMP1);
                    }
                    (Some(a), Some(b)) => {
                        let (a, b) = (self.resident(i, map, a)?, self.resident(i, map, b)?);
                        self.code.arith(false, Arith::Cmp, a, b);
                    }
                    (Some(a), None) | (None, Some(a)) => {
                        let a = self.resident(i, map, a)?;
                        self.code.test(false, a, a);
                    }
                }
                Ok(Taken::If(cc))
            }
            BranchCond::Lez | BranchCond::Gtz | BranchCond::Ltz | BranchCond::Gez => {
                let Some(a) = rec.rs1 else {
                    let zero_holds = matches!(cond, BranchCond::Lez | BranchCond::Gez);
                    return Ok(if zero_holds { Taken::Always } else { Taken::Never });
                };
                if wide {
                    self.wide_to(i, map, TMP0, Some(a))?;
                    self.code.test(true, TMP0, TMP0);
                } else {
                    let a = self.resident(i, map, a)?;
                    self.code.test(false, a, a);
                }
                Ok(Taken::If(match cond {
                    BranchCond::Lez => Cc::Le,
                    BranchCond::Gtz => Cc::G,
                    BranchCond::Ltz => Cc::L,
                    _ => Cc::Ge,
                }))
            }
        }
    }

    fn conditional_taken(&mut self, i: usize, taken: Taken, from: &RegState, target_in_pc: bool) -> Result<()> {
        match taken {
            Taken::Never => Ok(()),
            Taken::Always => self.taken_path(i, from, target_in_pc),
            Taken::If(cc) => {
                let skip = self.code.new_label();
                self.code.jcc(cc.invert(), skip);
                self.taken_path(i, from, target_in_pc)?;
                self.code.bind(skip);
                Ok(())
            }
        }
    }

    fn taken_path(&mut self, i: usize, from: &RegState, target_in_pc: bool) -> Result<()> {
        let rec = self.rec(i);
        if let InstrKind::JumpReg { .. } = rec.kind {
            return self.jump_indirect(i, from, target_in_pc);
        }
        let target = rec.target.ok_or(EmitError::MissingTarget { addr: rec.addr })?;
        match self.block.taken_index(i) {
            Some(t) => self.jump_internal(i, t, target, from),
            None => {
                self.jump_external(i, target, from);
                Ok(())
            }
        }
    }

    /// Jump to instruction `t` of this block.
    fn jump_internal(&mut self, i: usize, t: usize, target: u32, from: &RegState) -> Result<()> {
        let plan = self.exit_plan(from, self.needed_before(t));
        let addr = self.rec(i).addr;
        let out = self.add_stub(StubKind::CycleCheck, addr, None, 0, StubBody::CycleExit { plan, pc: target });
        self.code.test(false, CC, CC);
        self.code.jcc(Cc::Ns, out);

        let to = self.alloc.regs[t].entry.clone();
        self.transition(from, &to, self.needed_before(t));
        let label = self.label(t);
        let site = self.code.jmp(label);
        self.links.push(PendingLink {
            site,
            target,
            kind: LinkKind::Internal,
            trampoline: None,
        });
        Ok(())
    }

    /// Leave the block for guest address `target`.
    pub(super) fn jump_external(&mut self, i: usize, target: u32, from: &RegState) {
        self.flush(from, self.needed_at_exit());
        let addr = self.rec(i).addr;
        let out = self.add_stub(StubKind::CycleCheck, addr, None, 0, StubBody::Exit { pc: Some(target) });
        self.code.test(false, CC, CC);
        self.code.jcc(Cc::Ns, out);

        let trampoline = self.code.new_label();
        let site = self.code.jmp(trampoline);
        self.links.push(PendingLink {
            site,
            target,
            kind: LinkKind::External,
            trampoline: Some(trampoline),
        });
    }

    /// Jump to a target known only at run time, through the lookup hook.
    fn jump_indirect(&mut self, i: usize, from: &RegState, target_in_pc: bool) -> Result<()> {
        let rec = self.rec(i);
        let captured = from.contains(BTREG) && rec.ds_clobbers;
        if captured {
            let bt = self.resident(i, &from.map, BTREG)?;
            self.code.mov32(TMP0, bt);
        } else if target_in_pc {
            self.code.load32(TMP0, ctx_field(CpuContext::PC_OFFSET));
        } else {
            self.indirect_target(i, &from.map)?;
        }
        self.flush(from, self.needed_at_exit());
        if !target_in_pc {
            self.code.store32(ctx_field(CpuContext::PC_OFFSET), TMP0);
        }
        let out = self.add_stub(StubKind::Exit, rec.addr, None, 0, StubBody::Exit { pc: None });
        self.code.test(false, CC, CC);
        self.code.jcc(Cc::Ns, out);

        self.code.mov64(Reg::Rdi, CTX);
        self.code.mov32(Reg::Rsi, TMP0);
        // edx: the offset execution resumes at, patched once known
        let site_imm = self.code.current_offset() + 1;
        self.code.mov_imm32(Reg::Rdx, 0);
        self.code.call_mem(ctx_field(CpuContext::LOOKUP_HOOK_OFFSET));
        let resume = u32::try_from(self.code.current_offset()).unwrap_or(u32::MAX);
        self.code.patch(site_imm, &resume.to_le_bytes());
        self.code.jmp_reg(Reg::Rax);
        Ok(())
    }

    // ========================================================================
    // Host calls
    // ========================================================================

    /// Instructions run by the host: exceptions and interpreted encodings.
    pub(super) fn host_call(&mut self, i: usize) {
        let rec = self.rec(i);
        self.flush_cycles();
        let entry = self.alloc.regs[i].entry.clone();
        self.flush(&entry, self.needed_before(i));

        self.code.store_imm32(ctx_field(CpuContext::PC_OFFSET), rec.addr);
        self.code.mov64(Reg::Rdi, CTX);
        self.code.mov_imm32(Reg::Rsi, rec.addr);
        match rec.kind {
            InstrKind::System { .. } => {
                self.code.mov_imm32(Reg::Rdx, rec.imm as u32);
                self.code.call_mem(ctx_field(CpuContext::EXCEPTION_HOOK_OFFSET));
                self.code.jmp_mem(ctx_field(CpuContext::EXIT_OFFSET));
            }
            InstrKind::Interp { ends_block: false } => {
                self.code.call_mem(ctx_field(CpuContext::INTERP_HOOK_OFFSET));
                self.code.test(false, Reg::Rax, Reg::Rax);
                let out = self.add_stub(StubKind::Exit, rec.addr, None, 0, StubBody::Exit { pc: None });
                self.code.jcc(Cc::Ne, out);
                self.code.load32(CC, backing(CCREG));
            }
            _ => {
                self.code.call_mem(ctx_field(CpuContext::INTERP_HOOK_OFFSET));
                self.code.jmp_mem(ctx_field(CpuContext::EXIT_OFFSET));
            }
        }
    }
}
