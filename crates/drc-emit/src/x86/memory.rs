//! Guest loads and stores.
//!
//! Every access picks one of three tiers:
//!
//! - direct: a compile-time constant address on directly mapped RAM is
//!   accessed through its host address, baked into the code;
//! - inline: the page entry of the memory map is looked up at run time and
//!   the access goes straight to host memory unless the entry has
//!   [`SLOW_PATH`](drc_state::SLOW_PATH) set;
//! - stub: the access always goes through the host read/write hooks.
//!
//! Stores are followed by a check of the invalid-code table, which calls
//! the notify hook when the page holds translated code.

use drc_ir::{AddrMode, MemSize, VReg};
use drc_state::{CpuContext, GUEST_PAGE_SHIFT};

use super::encode::{Arith, Cc, Mem, Reg, Shift};
use super::registers::{TMP0, TMP1};
use super::stubs::{NotifyExit, StubBody};
use super::{BlockEmitter, Opnd, ctx_field};
use crate::block::StubKind;
use crate::buffer::Label;
use crate::error::Result;

/// Where the effective address lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Addr {
    Const(u32),
    /// In `r10`.
    Reg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Tier {
    Direct(u64),
    Inline,
    Stub,
}

/// Value a store writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct StoreValue {
    pub lo: Opnd,
    /// Upper word of a doubleword store; sign extension of `lo` when absent.
    pub hi: Option<Reg>,
}

impl BlockEmitter<'_, '_> {
    /// Compute the address of instruction `i`'s access. With `after_update`
    /// the base register already holds its post-access value.
    fn effective_address(
        &mut self,
        i: usize,
        mode: AddrMode,
        size: u32,
        base: Option<VReg>,
        index: Option<VReg>,
        after_update: bool,
    ) -> Result<Addr> {
        let rec = self.rec(i);
        let imm = rec.imm as i32;
        let Some(base) = base else {
            return Ok(Addr::Const(imm as u32));
        };
        let size = size as i32;

        if !after_update {
            let st = self.alloc.src_state(i);
            let known = |r: VReg| st.const_value(r).map(|v| v as u32);
            let folded = match mode {
                AddrMode::Disp => known(base).map(|b| b.wrapping_add(imm as u32)),
                AddrMode::Indexed => match (known(base), index.map_or(Some(0), known)) {
                    (Some(b), Some(x)) => Some(b.wrapping_add(x)),
                    _ => None,
                },
                AddrMode::PostInc => known(base),
                AddrMode::PreDec => known(base).map(|b| b.wrapping_sub(size as u32)),
            };
            if let Some(addr) = folded {
                return Ok(Addr::Const(addr));
            }
        }

        let updated = |s: &Self| -> Result<Reg> {
            match rec.rt1.filter(|&r| r == base).or(rec.rt2.filter(|&r| r == base)) {
                Some(r) => s.dst(i, r),
                None => s.src(i, base),
            }
        };
        match mode {
            AddrMode::Disp => {
                let b = self.src(i, base)?;
                self.code.lea32(TMP0, Mem::Base(b, imm));
            }
            AddrMode::Indexed => {
                let b = self.src(i, base)?;
                match index {
                    Some(x) => {
                        let x = self.src(i, x)?;
                        self.code.lea32(TMP0, Mem::Index(b, x));
                    }
                    None => self.code.mov32(TMP0, b),
                }
            }
            AddrMode::PostInc if after_update => {
                let b = updated(self)?;
                self.code.lea32(TMP0, Mem::Base(b, -size));
            }
            AddrMode::PostInc => {
                let b = self.src(i, base)?;
                self.code.mov32(TMP0, b);
            }
            AddrMode::PreDec if after_update => {
                let b = updated(self)?;
                self.code.mov32(TMP0, b);
            }
            AddrMode::PreDec => {
                let b = self.src(i, base)?;
                self.code.lea32(TMP0, Mem::Base(b, -size));
            }
        }
        Ok(Addr::Reg)
    }

    fn tier(&self, addr: Addr, size: u32) -> Tier {
        if let Addr::Const(a) = addr {
            let last = a.wrapping_add(size - 1);
            let one_page = a >> GUEST_PAGE_SHIFT == last >> GUEST_PAGE_SHIFT;
            if self.config.const_direct && one_page {
                if let Some(host) = self.map.host_addr(a) {
                    return Tier::Direct(host);
                }
                // known to be outside RAM
                return Tier::Stub;
            }
        }
        if self.config.inline_fast_path { Tier::Inline } else { Tier::Stub }
    }

    /// `r11 = memmap[r10 >> 12]`, branching to `slow` for hook pages.
    fn page_lookup(&mut self, slow: Label) {
        self.code.mov32(TMP1, TMP0);
        self.code.shift_imm(false, Shift::Shr, TMP1, GUEST_PAGE_SHIFT as u8);
        self.code.shift_imm(true, Shift::Shl, TMP1, 3);
        self.code.arith_mem(true, Arith::Add, TMP1, ctx_field(CpuContext::MEMMAP_OFFSET));
        self.code.load64(TMP1, Mem::Base(TMP1, 0));
        self.code.test_imm32(TMP1, drc_state::SLOW_PATH as u32);
        self.code.jcc(Cc::Ne, slow);
    }

    // ========================================================================
    // Loads
    // ========================================================================

    pub(super) fn load(&mut self, i: usize, size: MemSize, signed: bool, mode: AddrMode) -> Result<()> {
        let rec = self.rec(i);
        let bytes = size.bytes();
        let addr = self.effective_address(i, mode, bytes, rec.rs1, rec.rs2, false)?;
        let tier = self.tier(addr, bytes);
        if let (Addr::Const(a), Tier::Inline | Tier::Stub) = (addr, tier) {
            self.code.mov_imm32(TMP0, a);
        }

        let resume = self.code.new_label();
        let exclude = rec
            .rt1
            .map_or(0, |d| {
                let cur = &self.alloc.regs[i].cur;
                [cur.find(d), cur.find(d.upper())]
                    .into_iter()
                    .flatten()
                    .fold(0, |m, hr| m | (1 << hr))
            });
        let save = self.live_slots(i, exclude);
        match tier {
            Tier::Direct(host) => {
                self.code.mov_imm64(TMP1, host);
                self.raw_load(size, Mem::Base(TMP1, 0));
            }
            Tier::Inline => {
                let slow = self.add_stub(StubKind::ReadSlow, rec.addr, Some(resume), save, StubBody::ReadSlow { size: bytes });
                self.page_lookup(slow);
                self.raw_load(size, Mem::Index(TMP1, TMP0));
            }
            Tier::Stub => {
                let slow = self.add_stub(StubKind::ReadSlow, rec.addr, Some(resume), save, StubBody::ReadSlow { size: bytes });
                self.code.jmp(slow);
            }
        }
        self.code.bind(resume);

        if let Some(dst) = rec.rt1 {
            let d = self.dst(i, dst)?;
            match (size, signed) {
                (MemSize::Byte, true) => self.code.movsx8(d, TMP0),
                (MemSize::Byte, false) => self.code.movzx8(d, TMP0),
                (MemSize::Half, true) => self.code.movsx16(d, TMP0),
                (MemSize::Half, false) => self.code.movzx16(d, TMP0),
                (MemSize::Word | MemSize::Double, _) => self.code.mov32(d, TMP0),
            }
            if size == MemSize::Double {
                if let Some(hi) = self.dst_upper(i, dst) {
                    self.code.shift_imm(true, Shift::Shr, TMP0, 32);
                    self.code.mov32(hi, TMP0);
                }
            } else {
                self.extend_upper(i, dst, signed)?;
            }
        }
        if mode == AddrMode::PostInc
            && let Some(base) = rec.rt2
        {
            let b = self.dst(i, base)?;
            self.code.arith_imm(false, Arith::Add, b, bytes as i32);
        }
        Ok(())
    }

    /// Big-endian load into `r10`, zero-extended.
    fn raw_load(&mut self, size: MemSize, mem: Mem) {
        match size {
            MemSize::Byte => self.code.movzx8_mem(TMP0, mem),
            MemSize::Half => {
                self.code.movzx16_mem(TMP0, mem);
                self.code.swap16(TMP0);
            }
            MemSize::Word => {
                self.code.load32(TMP0, mem);
                self.code.bswap(false, TMP0);
            }
            MemSize::Double => {
                self.code.load64(TMP0, mem);
                self.code.bswap(true, TMP0);
            }
        }
    }

    // ========================================================================
    // Stores
    // ========================================================================

    pub(super) fn store(&mut self, i: usize, size: MemSize, mode: AddrMode) -> Result<()> {
        let rec = self.rec(i);
        let bytes = size.bytes();
        let addr = self.effective_address(i, mode, bytes, rec.rs1, rec.rs3, false)?;
        let tier = self.tier(addr, bytes);
        if let (Addr::Const(a), Tier::Inline | Tier::Stub) = (addr, tier) {
            self.code.mov_imm32(TMP0, a);
        }
        let value = StoreValue {
            lo: self.src_opnd(i, rec.rs2)?,
            hi: (size == MemSize::Double)
                .then(|| rec.rs2.and_then(|r| self.src_upper(i, r)))
                .flatten(),
        };

        let resume = self.code.new_label();
        let save = self.live_slots(i, 0);
        let body = StubBody::WriteSlow { size: bytes, value };
        match tier {
            Tier::Direct(host) => {
                self.code.mov_imm64(TMP1, host);
                self.raw_store(size, value);
            }
            Tier::Inline => {
                let slow = self.add_stub(StubKind::WriteSlow, rec.addr, Some(resume), save, body);
                self.page_lookup(slow);
                self.code.arith(true, Arith::Add, TMP1, TMP0);
                self.raw_store(size, value);
            }
            Tier::Stub => {
                let slow = self.add_stub(StubKind::WriteSlow, rec.addr, Some(resume), save, body);
                self.code.jmp(slow);
            }
        }
        self.code.bind(resume);

        if mode == AddrMode::PreDec
            && let Some(base) = rec.rt1
        {
            let b = self.dst(i, base)?;
            self.code.arith_imm(false, Arith::Sub, b, bytes as i32);
        }
        self.notify_check(i, addr, mode, bytes)
    }

    /// Big-endian store of `value` to `[r11]`.
    fn raw_store(&mut self, size: MemSize, value: StoreValue) {
        let at = Mem::Base(TMP1, 0);
        match size {
            MemSize::Byte => {
                self.opnd_to(TMP0, value.lo);
                self.code.store8(at, TMP0);
            }
            MemSize::Half => {
                self.opnd_to(TMP0, value.lo);
                self.code.swap16(TMP0);
                self.code.store16(at, TMP0);
            }
            MemSize::Word => {
                self.opnd_to(TMP0, value.lo);
                self.code.bswap(false, TMP0);
                self.code.store32(at, TMP0);
            }
            MemSize::Double => {
                match (value.hi, value.lo) {
                    (Some(hi), _) => self.code.mov32(TMP0, hi),
                    (None, Opnd::Reg(lo)) => {
                        self.code.mov32(TMP0, lo);
                        self.code.shift_imm(false, Shift::Sar, TMP0, 31);
                    }
                    (None, Opnd::Imm(k)) => self.code.mov_imm32(TMP0, (k >> 31) as u32),
                }
                self.code.bswap(false, TMP0);
                self.code.store32(at, TMP0);
                self.opnd_to(TMP0, value.lo);
                self.code.bswap(false, TMP0);
                self.code.store32(Mem::Base(TMP1, 4), TMP0);
            }
        }
    }

    /// Call the notify hook when the stored-to page holds translated code.
    fn notify_check(&mut self, i: usize, addr: Addr, mode: AddrMode, size: u32) -> Result<()> {
        let rec = self.rec(i);
        let const_addr = match addr {
            // code only lives in RAM
            Addr::Const(a) if !self.map.is_direct(a) => return Ok(()),
            Addr::Const(a) => {
                self.code.load64(TMP1, ctx_field(CpuContext::INVALID_CODE_OFFSET));
                self.code.cmp_mem8(Mem::Base(TMP1, (a >> GUEST_PAGE_SHIFT) as i32), 0);
                Some(a)
            }
            Addr::Reg => {
                self.effective_address(i, mode, size, rec.rs1, rec.rs3, true)?;
                self.code.mov32(TMP1, TMP0);
                self.code.shift_imm(false, Shift::Shr, TMP1, GUEST_PAGE_SHIFT as u8);
                self.code.arith_mem(true, Arith::Add, TMP1, ctx_field(CpuContext::INVALID_CODE_OFFSET));
                self.code.cmp_mem8(Mem::Base(TMP1, 0), 0);
                None
            }
        };

        let exit = (!rec.is_ds).then(|| {
            let cur = self.alloc.regs[i].cur.clone();
            NotifyExit {
                cycles: self.pending,
                plan: self.exit_plan(&cur, self.needed_after(i)),
                next: rec.next_addr(),
            }
        });
        let resume = self.code.new_label();
        let save = self.live_slots(i, 0);
        let stub = self.add_stub(
            StubKind::WriteNotify,
            rec.addr,
            Some(resume),
            save,
            StubBody::Notify { const_addr, size, exit },
        );
        self.code.jcc(Cc::E, stub);
        self.code.bind(resume);
        Ok(())
    }
}
