//! Out-of-line slow paths.
//!
//! Stubs are collected while the block body is emitted and placed after
//! it, so the common path falls through without taken jumps. A stub that
//! calls the host saves the caller-saved slots it was told about and keeps
//! the stack 16-byte aligned across the call.

use drc_ir::SlotMask;
use drc_regalloc::TransitionPlan;
use drc_state::CpuContext;

use super::encode::{Arith, Cc, Mem, Reg, Shift};
use super::memory::StoreValue;
use super::registers::{CC, CTX, TMP0, TMP1, regs_of};
use super::{BlockEmitter, Opnd, ctx_field};
use crate::block::{StubKind, StubRecord};
use crate::buffer::Label;

/// Leaving the block after a store invalidated it.
pub(super) struct NotifyExit {
    /// Cycles of the instructions run since the last update.
    pub cycles: u32,
    pub plan: TransitionPlan,
    /// Guest address execution continues at.
    pub next: u32,
}

pub(super) enum StubBody {
    /// Address in `r10`; the value is returned in `r10`.
    ReadSlow { size: u32 },
    /// Address in `r10`.
    WriteSlow { size: u32, value: StoreValue },
    /// Address in `r10` unless constant. Without `exit` the block keeps
    /// running even if the store invalidated it.
    Notify { const_addr: Option<u32>, size: u32, exit: Option<NotifyExit> },
    /// Store the registers and leave with `pc` set.
    CycleExit { plan: TransitionPlan, pc: u32 },
    /// Registers are already stored; set `pc` unless it already is.
    Exit { pc: Option<u32> },
}

pub(super) struct Stub {
    pub kind: StubKind,
    /// Guest instruction the stub belongs to.
    pub addr: u32,
    pub label: Label,
    pub resume: Option<Label>,
    /// Slots preserved across a host call.
    pub save: SlotMask,
    pub body: StubBody,
    /// Code offset, once emitted.
    pub offset: Option<usize>,
}

impl Stub {
    pub(super) const fn record(&self) -> Option<StubRecord> {
        match self.offset {
            Some(offset) => Some(StubRecord {
                kind: self.kind,
                addr: self.addr,
                offset,
            }),
            None => None,
        }
    }
}

impl BlockEmitter<'_, '_> {
    pub(super) fn emit_stubs(&mut self) {
        let mut stubs = std::mem::take(&mut self.stubs);
        for stub in &mut stubs {
            stub.offset = Some(self.code.current_offset());
            self.code.bind(stub.label);
            self.stub(stub);
        }
        self.stubs = stubs;
    }

    fn stub(&mut self, stub: &Stub) {
        match &stub.body {
            StubBody::ReadSlow { size } => {
                self.save(stub.save);
                self.code.mov64(Reg::Rdi, CTX);
                self.code.mov32(Reg::Rsi, TMP0);
                self.code.mov_imm32(Reg::Rdx, *size);
                self.code.call_mem(ctx_field(CpuContext::READ_HOOK_OFFSET));
                self.code.mov64(TMP0, Reg::Rax);
                self.restore(stub.save);
                self.resume(stub);
            }
            StubBody::WriteSlow { size, value } => {
                self.save(stub.save);
                self.write_value(*size, *value);
                self.code.mov64(Reg::Rdi, CTX);
                self.code.mov32(Reg::Rsi, TMP0);
                self.code.mov_imm32(Reg::Rdx, *size);
                self.code.mov64(Reg::Rcx, TMP1);
                self.code.call_mem(ctx_field(CpuContext::WRITE_HOOK_OFFSET));
                self.restore(stub.save);
                self.resume(stub);
            }
            StubBody::Notify { const_addr, size, exit } => {
                if let Some(addr) = const_addr {
                    self.code.mov_imm32(TMP0, *addr);
                }
                self.save(stub.save);
                self.code.mov64(Reg::Rdi, CTX);
                self.code.mov32(Reg::Rsi, TMP0);
                self.code.mov_imm32(Reg::Rdx, *size);
                self.code.mov_imm32(Reg::Rcx, self.block.start);
                self.code.call_mem(ctx_field(CpuContext::NOTIFY_HOOK_OFFSET));
                match exit {
                    Some(exit) => {
                        // pops leave the flags alone
                        self.code.test(false, Reg::Rax, Reg::Rax);
                        self.restore(stub.save);
                        if let Some(resume) = stub.resume {
                            self.code.jcc(Cc::E, resume);
                        }
                        if exit.cycles != 0 {
                            let cycles = i32::try_from(exit.cycles).unwrap_or(i32::MAX);
                            self.code.arith_imm(false, Arith::Add, CC, cycles);
                        }
                        self.apply_writebacks(&exit.plan);
                        self.leave(Some(exit.next));
                    }
                    None => {
                        self.restore(stub.save);
                        self.resume(stub);
                    }
                }
            }
            StubBody::CycleExit { plan, pc } => {
                self.apply_writebacks(plan);
                self.leave(Some(*pc));
            }
            StubBody::Exit { pc } => self.leave(*pc),
        }
    }

    fn resume(&mut self, stub: &Stub) {
        if let Some(resume) = stub.resume {
            self.code.jmp(resume);
        }
    }

    /// Return to the dispatcher.
    fn leave(&mut self, pc: Option<u32>) {
        if let Some(pc) = pc {
            self.code.store_imm32(ctx_field(CpuContext::PC_OFFSET), pc);
        }
        self.code.jmp_mem(ctx_field(CpuContext::EXIT_OFFSET));
    }

    fn apply_writebacks(&mut self, plan: &TransitionPlan) {
        for wb in &plan.writebacks {
            self.writeback(*wb);
        }
    }

    /// The store value, as the write hook takes it, into `r11`. Runs after
    /// `save`, so `rdi` is free as a temporary.
    fn write_value(&mut self, size: u32, value: StoreValue) {
        if size != 8 {
            self.opnd_to(TMP1, value.lo);
            return;
        }
        match (value.hi, value.lo) {
            (Some(hi), lo) => {
                self.code.mov32(TMP1, hi);
                self.code.shift_imm(true, Shift::Shl, TMP1, 32);
                self.opnd_to(Reg::Rdi, lo);
                self.code.arith(true, Arith::Or, TMP1, Reg::Rdi);
            }
            (None, Opnd::Reg(lo)) => self.code.movsxd(TMP1, lo),
            (None, Opnd::Imm(k)) => self.code.mov_imm64(TMP1, i64::from(k) as u64),
        }
    }

    /// Push the slots in `mask`, padding to keep `rsp` 16-byte aligned.
    fn save(&mut self, mask: SlotMask) {
        let mut count = 0;
        for reg in regs_of(mask) {
            self.code.push(reg);
            count += 1;
        }
        if count % 2 == 1 {
            self.code.lea64(Reg::Rsp, Mem::Base(Reg::Rsp, -8));
        }
    }

    fn restore(&mut self, mask: SlotMask) {
        if mask.count_ones() % 2 == 1 {
            self.code.lea64(Reg::Rsp, Mem::Base(Reg::Rsp, 8));
        }
        for reg in regs_of(mask).rev() {
            self.code.pop(reg);
        }
    }

    /// Lazy-link trampolines for every external jump.
    pub(super) fn emit_trampolines(&mut self) {
        for n in 0..self.links.len() {
            let link = &self.links[n];
            let Some(trampoline) = link.trampoline else { continue };
            let (target, site) = (link.target, link.site);
            self.code.bind(trampoline);
            self.code.mov64(Reg::Rdi, CTX);
            self.code.mov_imm32(Reg::Rsi, target);
            self.code.mov_imm32(Reg::Rdx, u32::try_from(site).unwrap_or(u32::MAX));
            self.code.call_mem(ctx_field(CpuContext::LINK_HOOK_OFFSET));
            self.code.jmp_reg(Reg::Rax);
        }
    }
}
