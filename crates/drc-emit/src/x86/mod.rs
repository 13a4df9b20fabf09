//! x86-64 machine code for decoded blocks.
//!
//! The emitter walks the block in order and, for every instruction, first
//! performs the register moves its allocation asks for (see
//! [`drc_regalloc::plan_transition`]) and then the operation itself. Rare
//! paths are collected as stubs and emitted after the block body, followed
//! by one lazy-link trampoline per jump out of the block.
//!
//! # Module Structure
//!
//! - `encode` - instruction encodings on [`CodeBuffer`]
//! - `registers` - slot to register binding
//! - `ops` - ALU, shift, move and multiply/divide lowering
//! - `memory` - loads and stores with their access tiers
//! - `branch` - branches, host calls and trampolines
//! - `stubs` - out-of-line slow paths

mod branch;
pub mod encode;
mod memory;
mod ops;
pub mod registers;
mod stubs;

use tracing::{debug, debug_span, trace};

use drc_cfg::{DecodedBlock, Liveness, exit_unneeded};
use drc_ir::{
    BTREG, HOST_REGS, InstrKind, InstrRecord, RegMask, RegState, SlotMask, VReg,
};
use drc_isa::IsaKind;
use drc_regalloc::{Allocation, Load, TransitionPlan, Writeback, plan_transition, src_state};
use drc_state::{CpuContext, MemoryMap};

use crate::block::{EmittedBlock, EntryPoint, StubKind, StubRecord};
use crate::buffer::{CodeBuffer, Label};
use crate::config::EmitConfig;
use crate::error::{EmitError, Result};
use crate::link::{LinkKind, LinkRecord};

use encode::{Arith, Mem, Reg, Shift};
use registers::{CC, CTX, TMP0, TMP1, slot_reg};
use stubs::{Stub, StubBody};

/// Everything the emitter reads besides its configuration.
#[derive(Clone, Copy)]
pub struct EmitInput<'a> {
    pub block: &'a DecodedBlock,
    pub live: &'a Liveness,
    pub alloc: &'a Allocation,
    /// Decides which constant addresses can be accessed directly.
    pub map: &'a MemoryMap,
}

/// Emit `input.block` into `code`.
///
/// # Errors
///
/// Returns [`EmitError::Overflow`] when the block does not fit the
/// buffer's window; the other errors indicate an inconsistent allocation.
pub fn emit_block(code: CodeBuffer<'_>, input: &EmitInput<'_>, config: &EmitConfig) -> Result<EmittedBlock> {
    let _span = debug_span!("emit", start = format_args!("{:#010x}", input.block.start)).entered();
    BlockEmitter::new(code, input, config).run()
}

/// Memory operand for a context field.
pub(crate) const fn ctx_field(offset: usize) -> Mem {
    Mem::Base(CTX, offset as i32)
}

/// Memory operand for `reg`'s backing word.
pub(crate) const fn backing(reg: VReg) -> Mem {
    ctx_field(CpuContext::reg_offset(reg))
}

fn unneeded(lower: RegMask, upper: RegMask, reg: VReg) -> bool {
    let mask = if reg.is_upper() { upper } else { lower };
    mask & reg.bit() != 0
}

/// State with nothing resident and no upper word implied.
fn exit_state() -> RegState {
    RegState {
        is32: 0,
        ..RegState::empty()
    }
}

/// Unneeded (lower, upper) masks where control leaves the block.
const fn exit_masks(isa: IsaKind) -> (RegMask, RegMask) {
    let lower = exit_unneeded(isa);
    match isa {
        IsaKind::Mips => (lower, lower),
        IsaKind::Sh2 => (lower, RegMask::MAX),
    }
}

/// An ALU input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Opnd {
    Reg(Reg),
    Imm(i32),
}

/// A jump waiting for its final record.
struct PendingLink {
    site: usize,
    target: u32,
    kind: LinkKind,
    trampoline: Option<Label>,
}

pub(crate) struct BlockEmitter<'a, 'c> {
    code: CodeBuffer<'c>,
    block: &'a DecodedBlock,
    live: &'a Liveness,
    alloc: &'a Allocation,
    map: &'a MemoryMap,
    config: &'a EmitConfig,
    exit: (RegMask, RegMask),
    /// Label of every instruction other code jumps to.
    labels: Vec<Option<Label>>,
    stubs: Vec<Stub>,
    links: Vec<PendingLink>,
    entries: Vec<EntryPoint>,
    /// Cycles counted but not yet added to the cycle register.
    pending: u32,
}

impl<'a, 'c> BlockEmitter<'a, 'c> {
    fn new(code: CodeBuffer<'c>, input: &EmitInput<'a>, config: &'a EmitConfig) -> Self {
        let block = input.block;
        Self {
            code,
            block,
            live: input.live,
            alloc: input.alloc,
            map: input.map,
            config,
            exit: exit_masks(block.isa),
            labels: vec![None; block.len()],
            stubs: Vec::new(),
            links: Vec::new(),
            entries: Vec::new(),
            pending: 0,
        }
    }

    fn run(mut self) -> Result<EmittedBlock> {
        let block = self.block;
        let start = self.code.current_offset();
        for i in 0..block.len() {
            if block.is_join(i) || block.entry_points.contains(&i) {
                self.labels[i] = Some(self.code.new_label());
            }
        }

        let verify_entry = self.config.verify_entry.then(|| {
            let offset = self.code.current_offset();
            self.verify_prologue();
            offset
        });

        for i in 0..block.len() {
            if block.is_paired_ds(i) {
                continue;
            }
            self.instr(i)?;
        }
        if block.falls_through() {
            self.fall_off_end()?;
        }

        self.emit_stubs();
        self.emit_trampolines();
        let links = std::mem::take(&mut self.links);
        let stubs = std::mem::take(&mut self.stubs);
        let stub_records: Vec<StubRecord> = stubs.iter().filter_map(Stub::record).collect();
        let entries = std::mem::take(&mut self.entries);
        let links: Vec<LinkRecord> = links
            .into_iter()
            .map(|l| LinkRecord {
                site: l.site,
                target: l.target,
                kind: l.kind,
                trampoline: l.trampoline.and_then(|t| self.code.label_offset(t)),
            })
            .collect();
        let end = self.code.finish()?;

        let emitted = EmittedBlock {
            guest_start: block.start,
            start,
            end,
            entries,
            verify_entry,
            links,
            stubs: stub_records,
        };
        debug!(
            bytes = emitted.size(),
            entries = emitted.entries.len(),
            stubs = emitted.stubs.len(),
            links = emitted.links.len(),
            "emitted"
        );
        Ok(emitted)
    }

    // ========================================================================
    // Block structure
    // ========================================================================

    /// Ask the host whether the block still matches guest memory; fall into
    /// the clean entry when it does.
    fn verify_prologue(&mut self) {
        let start = self.block.start;
        let clean = self.code.new_label();
        self.code.mov64(Reg::Rdi, CTX);
        self.code.mov_imm32(Reg::Rsi, start);
        self.code.call_mem(ctx_field(CpuContext::VERIFY_HOOK_OFFSET));
        self.code.test(false, Reg::Rax, Reg::Rax);
        self.code.jcc(encode::Cc::Ne, clean);
        self.code.store32(backing(drc_ir::CCREG), CC);
        self.code.store_imm32(ctx_field(CpuContext::PC_OFFSET), start);
        self.code.jmp_mem(ctx_field(CpuContext::EXIT_OFFSET));
        self.code.bind(clean);
    }

    fn instr(&mut self, i: usize) -> Result<()> {
        self.enter(i);
        let rec = self.rec(i);
        trace!(addr = format_args!("{:#010x}", rec.addr), kind = rec.class().name(), "emit");
        self.pending += u32::from(rec.cycles);
        self.body(i)
    }

    /// Reach the state instruction `i` is entered with: from the previous
    /// instruction, and from the dispatcher when `i` is an entry point.
    fn enter(&mut self, i: usize) {
        let stat = &self.alloc.regs[i];
        let dispatch = i == 0 || self.block.entry_points.contains(&i);
        if self.block.fall_source(i).is_some() {
            if self.block.is_join(i) {
                self.flush_cycles();
            }
            self.transition(&stat.pre, &stat.entry, self.needed_before(i));
            if dispatch && let Some(label) = self.labels[i] {
                self.code.jmp(label);
            }
        } else {
            self.pending = 0;
        }
        if dispatch {
            let rec = self.rec(i);
            self.entries.push(EntryPoint {
                addr: rec.addr,
                offset: self.code.current_offset(),
            });
            let mut st = RegState::block_entry();
            st.is32 = self.alloc.is32.base;
            self.transition(&st, &stat.entry, self.needed_before(i));
        }
        if let Some(label) = self.labels[i] {
            self.code.bind(label);
        }
    }

    fn body(&mut self, i: usize) -> Result<()> {
        let rec = self.rec(i);
        if !rec.flushes_all() {
            self.load_sources(i);
        }
        match rec.kind {
            InstrKind::Nop => Ok(()),
            InstrKind::Alu { op, width, src2 } => self.alu(i, op, width, src2),
            InstrKind::Shift { op, width, amount, sets_t } => self.shift(i, op, width, amount, sets_t),
            InstrKind::Move { width } => self.mov(i, width),
            InstrKind::LoadConst => self.load_const(i),
            InstrKind::Ext { op } => self.ext(i, op),
            InstrKind::DecTest => self.dec_test(i),
            InstrKind::Load { size, signed, mode } => self.load(i, size, signed, mode),
            InstrKind::Store { size, mode } => self.store(i, size, mode),
            InstrKind::MulDiv { op } => self.muldiv(i, op),
            InstrKind::Branch { .. } | InstrKind::Jump { .. } | InstrKind::JumpReg { .. } => self.branch(i),
            InstrKind::System { .. } | InstrKind::Interp { .. } | InstrKind::Invalid => {
                self.host_call(i);
                Ok(())
            }
        }
    }

    /// Load the sources of `i` and store what its destinations displace.
    fn load_sources(&mut self, i: usize) {
        let stat = &self.alloc.regs[i];
        let src = src_state(stat);
        self.transition(&stat.entry, &src, self.needed_before(i));

        let rec = self.rec(i);
        let written = rec.writes() | if rec.ds_clobbers { BTREG.bit() } else { 0 };
        let (lower, upper) = (self.live.after[i], self.live.after_upper[i]);
        let plan = plan_transition(
            &src,
            &stat.cur,
            |r| written & r.bit() == 0 && !unneeded(lower, upper, r),
            self.alloc.wide,
        );
        for wb in &plan.writebacks {
            self.writeback(*wb);
        }
    }

    /// The last instruction runs into the code after the block.
    fn fall_off_end(&mut self) -> Result<()> {
        let n = self.block.len();
        let last = if n >= 2 && self.block.is_paired_ds(n - 1) && self.rec(n - 2).is_likely() {
            n - 2
        } else {
            n - 1
        };
        let from = self.alloc.regs[last].cur.clone();
        self.flush_cycles();
        self.jump_external(n - 1, self.block.end, &from);
        Ok(())
    }

    fn label(&mut self, i: usize) -> Label {
        if let Some(label) = self.labels[i] {
            return label;
        }
        let label = self.code.new_label();
        self.labels[i] = Some(label);
        label
    }

    // ========================================================================
    // Register state
    // ========================================================================

    fn rec(&self, i: usize) -> &'a InstrRecord {
        &self.block.instrs[i]
    }

    fn needed_before(&self, i: usize) -> impl Fn(VReg) -> bool + use<> {
        let (lower, upper) = (self.live.before[i], self.live.before_upper[i]);
        move |r| !unneeded(lower, upper, r)
    }

    fn needed_after(&self, i: usize) -> impl Fn(VReg) -> bool + use<> {
        let (lower, upper) = (self.live.after[i], self.live.after_upper[i]);
        move |r| !unneeded(lower, upper, r)
    }

    fn needed_at_exit(&self) -> impl Fn(VReg) -> bool + use<> {
        let (lower, upper) = self.exit;
        move |r| !unneeded(lower, upper, r)
    }

    fn transition(&mut self, from: &RegState, to: &RegState, needed: impl Fn(VReg) -> bool) {
        let plan = plan_transition(from, to, needed, self.alloc.wide);
        self.apply(from, &plan);
    }

    /// Store everything `needed` from `from` so control can leave the block.
    fn flush(&mut self, from: &RegState, needed: impl Fn(VReg) -> bool) {
        self.transition(from, &exit_state(), needed);
    }

    fn exit_plan(&self, from: &RegState, needed: impl Fn(VReg) -> bool) -> TransitionPlan {
        plan_transition(from, &exit_state(), needed, self.alloc.wide)
    }

    fn apply(&mut self, from: &RegState, plan: &TransitionPlan) {
        for wb in &plan.writebacks {
            self.writeback(*wb);
        }
        // upper words implied by a resident lower word, before its slot is reused
        let (derived, loaded): (Vec<&Load>, Vec<&Load>) = plan.loads.iter().partition(|ld| {
            self.alloc.wide
                && ld.reg.is_upper()
                && from.reg_is32(ld.reg.lower())
                && !from.contains(ld.reg)
                && from.contains(ld.reg.lower())
        });
        for ld in derived {
            if let Some(lo) = from.find(ld.reg.lower()) {
                let dst = slot_reg(ld.slot);
                self.code.mov32(dst, slot_reg(lo));
                self.code.shift_imm(false, Shift::Sar, dst, 31);
            }
        }
        for ld in loaded {
            self.code.load32(slot_reg(ld.slot), backing(ld.reg));
        }
    }

    fn writeback(&mut self, wb: Writeback) {
        let reg = slot_reg(wb.slot);
        self.code.store32(backing(wb.reg), reg);
        if wb.sign_extend {
            self.code.mov32(TMP1, reg);
            self.code.shift_imm(false, Shift::Sar, TMP1, 31);
            self.code.store32(backing(wb.reg.upper()), TMP1);
        }
    }

    /// Add the counted cycles to the cycle register.
    fn flush_cycles(&mut self) {
        if self.pending != 0 {
            let cycles = i32::try_from(self.pending).unwrap_or(i32::MAX);
            self.code.arith_imm(false, Arith::Add, CC, cycles);
            self.pending = 0;
        }
    }

    fn missing(&self, i: usize, reg: VReg) -> EmitError {
        EmitError::MissingRegister {
            addr: self.rec(i).addr,
            reg,
        }
    }

    /// Host register holding `reg` in slot map `map`.
    fn resident(&self, i: usize, map: &[Option<VReg>; HOST_REGS], reg: VReg) -> Result<Reg> {
        map.iter()
            .position(|&m| m == Some(reg))
            .map(slot_reg)
            .ok_or_else(|| self.missing(i, reg))
    }

    /// Host register of source `reg` of instruction `i`.
    fn src(&self, i: usize, reg: VReg) -> Result<Reg> {
        self.resident(i, &self.alloc.regs[i].src, reg)
    }

    /// Source operand; a missing register reads as zero.
    fn src_opnd(&self, i: usize, reg: Option<VReg>) -> Result<Opnd> {
        match reg {
            Some(r) => self.src(i, r).map(Opnd::Reg),
            None => Ok(Opnd::Imm(0)),
        }
    }

    /// Host register holding the upper word of source `reg`, when resident.
    fn src_upper(&self, i: usize, reg: VReg) -> Option<Reg> {
        if !self.alloc.wide {
            return None;
        }
        self.alloc.regs[i].src_slot(reg.upper()).map(slot_reg)
    }

    /// Host register receiving destination `reg` of instruction `i`.
    fn dst(&self, i: usize, reg: VReg) -> Result<Reg> {
        self.resident(i, &self.alloc.regs[i].cur.map, reg)
    }

    /// Host register receiving the upper word of destination `reg`.
    fn dst_upper(&self, i: usize, reg: VReg) -> Option<Reg> {
        if !self.alloc.wide {
            return None;
        }
        self.alloc.regs[i].cur.find(reg.upper()).map(slot_reg)
    }

    /// Slots a host call made from instruction `i` must preserve.
    fn live_slots(&self, i: usize, exclude: SlotMask) -> SlotMask {
        let stat = &self.alloc.regs[i];
        let src = stat
            .src
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_some())
            .fold(0, |acc, (hr, _)| acc | (1 << hr));
        (src | stat.cur.occupied()) & drc_ir::CALLER_SAVED_SLOTS & !exclude
    }

    fn add_stub(&mut self, kind: StubKind, addr: u32, resume: Option<Label>, save: SlotMask, body: StubBody) -> Label {
        let label = self.code.new_label();
        self.stubs.push(Stub {
            kind,
            addr,
            label,
            resume,
            save,
            body,
            offset: None,
        });
        label
    }

    // ========================================================================
    // Operand helpers
    // ========================================================================

    fn opnd_to(&mut self, dst: Reg, src: Opnd) {
        match src {
            Opnd::Reg(r) if r == dst => {}
            Opnd::Reg(r) => self.code.mov32(dst, r),
            Opnd::Imm(k) => self.code.mov_imm32(dst, k as u32),
        }
    }

    /// Full 64-bit value of `reg` (sign-extended when no upper word is
    /// resident) into `dst`.
    fn wide_to(&mut self, i: usize, map: &[Option<VReg>; HOST_REGS], dst: Reg, reg: Option<VReg>) -> Result<()> {
        let Some(reg) = reg else {
            self.code.mov_imm32(dst, 0);
            return Ok(());
        };
        let lo = self.resident(i, map, reg)?;
        let hi = self
            .alloc
            .wide
            .then(|| map.iter().position(|&m| m == Some(reg.upper())))
            .flatten()
            .map(slot_reg);
        match hi {
            Some(hi) => {
                self.code.mov32(dst, hi);
                self.code.shift_imm(true, Shift::Shl, dst, 32);
                self.code.arith(true, Arith::Or, dst, lo);
            }
            None => self.code.movsxd(dst, lo),
        }
        Ok(())
    }

    /// Split a 64-bit result in `TMP0` into `reg`'s halves.
    fn split_wide(&mut self, i: usize, reg: VReg) -> Result<()> {
        let lo = self.dst(i, reg)?;
        self.code.mov32(lo, TMP0);
        if let Some(hi) = self.dst_upper(i, reg) {
            self.code.shift_imm(true, Shift::Shr, TMP0, 32);
            self.code.mov32(hi, TMP0);
        }
        Ok(())
    }

    /// Give a 32-bit result its upper word, when one is allocated.
    fn extend_upper(&mut self, i: usize, reg: VReg, signed: bool) -> Result<()> {
        if let Some(hi) = self.dst_upper(i, reg) {
            if signed {
                let lo = self.dst(i, reg)?;
                self.code.mov32(hi, lo);
                self.code.shift_imm(false, Shift::Sar, hi, 31);
            } else {
                self.code.mov_imm32(hi, 0);
            }
        }
        Ok(())
    }

    /// Write a compile-time value to destination `reg`.
    fn write_const(&mut self, i: usize, reg: VReg, value: u64) -> Result<()> {
        let lo = self.dst(i, reg)?;
        self.code.mov_imm32(lo, value as u32);
        if let Some(hi) = self.dst_upper(i, reg) {
            self.code.mov_imm32(hi, (value >> 32) as u32);
        }
        Ok(())
    }
}
