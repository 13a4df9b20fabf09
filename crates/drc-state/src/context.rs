//! Per-processor register context shared with generated code.
//!
//! Generated code keeps a pointer to the [`CpuContext`] in `r15` and
//! addresses every field through the offsets below, so the layout is
//! `#[repr(C)]` and the offsets are derived with `offset_of!`.

use std::ffi::c_void;
use std::mem::offset_of;
use std::ptr;

use drc_ir::{CCREG, VREG_COUNT, VReg};
use tracing::trace;

use crate::guest::{InvalidCode, MemoryMap};

/// Slow-path read: returns the zero-extended big-endian value.
pub type ReadHook = unsafe extern "C" fn(ctx: *mut CpuContext, addr: u32, size: u32) -> u64;
/// Slow-path write of the low `size` bytes of `value`.
pub type WriteHook = unsafe extern "C" fn(ctx: *mut CpuContext, addr: u32, size: u32, value: u64);
/// Execute one instruction at `addr`; nonzero asks generated code to exit.
pub type InterpHook = unsafe extern "C" fn(ctx: *mut CpuContext, addr: u32) -> u32;
/// Raise a system exception (`code` is the record immediate); sets `pc`.
pub type ExceptionHook = unsafe extern "C" fn(ctx: *mut CpuContext, addr: u32, code: u32);
/// Host code for guest `addr`, compiling it if needed. `site` is the code
/// offset generated code resumes at, which a compile must not overwrite.
pub type LookupHook = unsafe extern "C" fn(ctx: *mut CpuContext, addr: u32, site: u32) -> *const u8;
/// Resolve a lazy link: patch the jump at code offset `site`, return the target code.
pub type LinkHook = unsafe extern "C" fn(ctx: *mut CpuContext, target: u32, site: u32) -> *const u8;
/// Check that the block at `start` still matches guest memory; nonzero when clean.
pub type VerifyHook = unsafe extern "C" fn(ctx: *mut CpuContext, start: u32) -> u32;
/// A store hit a page holding translated code; nonzero when the block
/// starting at `running` was invalidated by it.
pub type NotifyHook =
    unsafe extern "C" fn(ctx: *mut CpuContext, addr: u32, size: u32, running: u32) -> u32;

/// Host functions called from generated code.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct HostHooks {
    pub read: ReadHook,
    pub write: WriteHook,
    pub interp: InterpHook,
    pub exception: ExceptionHook,
    pub lookup: LookupHook,
    pub link: LinkHook,
    pub verify: VerifyHook,
    pub notify: NotifyHook,
}

unsafe extern "C" fn unmapped_read(_ctx: *mut CpuContext, addr: u32, size: u32) -> u64 {
    trace!(addr = format_args!("{addr:#010x}"), size, "unmapped read");
    0
}

unsafe extern "C" fn unmapped_write(_ctx: *mut CpuContext, addr: u32, size: u32, _value: u64) {
    trace!(addr = format_args!("{addr:#010x}"), size, "unmapped write");
}

/// Leave generated code with `pc` at the instruction.
unsafe extern "C" fn exit_at(ctx: *mut CpuContext, addr: u32) -> u32 {
    if let Some(ctx) = unsafe { ctx.as_mut() } {
        ctx.pc = addr;
    }
    1
}

unsafe extern "C" fn exception_at(ctx: *mut CpuContext, addr: u32, _code: u32) {
    if let Some(ctx) = unsafe { ctx.as_mut() } {
        ctx.pc = addr;
    }
}

/// Send every lookup back to the dispatcher.
unsafe extern "C" fn exit_lookup(ctx: *mut CpuContext, addr: u32, _site: u32) -> *const u8 {
    match unsafe { ctx.as_mut() } {
        Some(ctx) => {
            ctx.pc = addr;
            ctx.exit
        }
        None => ptr::null(),
    }
}

unsafe extern "C" fn exit_link(ctx: *mut CpuContext, target: u32, site: u32) -> *const u8 {
    unsafe { exit_lookup(ctx, target, site) }
}

unsafe extern "C" fn never_clean(_ctx: *mut CpuContext, _start: u32) -> u32 {
    0
}

unsafe extern "C" fn ignore_notify(_ctx: *mut CpuContext, _addr: u32, _size: u32, _running: u32) -> u32 {
    0
}

impl HostHooks {
    /// Hooks that touch no translator state: unmapped accesses read zero,
    /// interpretation and lookups return to the dispatcher.
    #[must_use]
    pub const fn unhandled() -> Self {
        Self {
            read: unmapped_read,
            write: unmapped_write,
            interp: exit_at,
            exception: exception_at,
            lookup: exit_lookup,
            link: exit_link,
            verify: never_clean,
            notify: ignore_notify,
        }
    }
}

impl Default for HostHooks {
    fn default() -> Self {
        Self::unhandled()
    }
}

/// Register backing store and environment of one guest processor.
///
/// # Layout
///
/// ```text
/// offset 0:     regs[64] (u64; lower half at +0, upper half at +4)
/// offset 512:   pc
/// offset 516:   _pad0
/// offset 520:   memmap (*const u64)
/// offset 528:   invalid_code (*const u8)
/// offset 536:   exit (*const u8)
/// offset 544:   translator (*mut c_void)
/// offset 552:   user (*mut c_void)
/// offset 560:   hooks
/// ```
#[repr(C)]
#[derive(Debug)]
pub struct CpuContext {
    /// Backing store for every virtual register.
    pub regs: [u64; VREG_COUNT],
    /// Guest program counter, valid whenever generated code has exited.
    pub pc: u32,
    _pad0: u32,
    /// Per-page memory map (see [`MemoryMap`]).
    pub memmap: *const u64,
    /// Per-page "no translated code" flags (see [`InvalidCode`]).
    pub invalid_code: *const u8,
    /// Fixed re-entry point of the dispatcher.
    pub exit: *const u8,
    /// Opaque back-pointer to the owning translator.
    pub translator: *mut c_void,
    /// Opaque pointer for the embedding system's hooks.
    pub user: *mut c_void,
    pub hooks: HostHooks,
}

impl CpuContext {
    pub const REGS_OFFSET: usize = offset_of!(Self, regs);
    pub const PC_OFFSET: usize = offset_of!(Self, pc);
    pub const MEMMAP_OFFSET: usize = offset_of!(Self, memmap);
    pub const INVALID_CODE_OFFSET: usize = offset_of!(Self, invalid_code);
    pub const EXIT_OFFSET: usize = offset_of!(Self, exit);
    pub const READ_HOOK_OFFSET: usize = offset_of!(Self, hooks) + offset_of!(HostHooks, read);
    pub const WRITE_HOOK_OFFSET: usize = offset_of!(Self, hooks) + offset_of!(HostHooks, write);
    pub const INTERP_HOOK_OFFSET: usize = offset_of!(Self, hooks) + offset_of!(HostHooks, interp);
    pub const EXCEPTION_HOOK_OFFSET: usize =
        offset_of!(Self, hooks) + offset_of!(HostHooks, exception);
    pub const LOOKUP_HOOK_OFFSET: usize = offset_of!(Self, hooks) + offset_of!(HostHooks, lookup);
    pub const LINK_HOOK_OFFSET: usize = offset_of!(Self, hooks) + offset_of!(HostHooks, link);
    pub const VERIFY_HOOK_OFFSET: usize = offset_of!(Self, hooks) + offset_of!(HostHooks, verify);
    pub const NOTIFY_HOOK_OFFSET: usize = offset_of!(Self, hooks) + offset_of!(HostHooks, notify);

    /// A zeroed context with the given hooks and no tables attached.
    #[must_use]
    pub const fn new(hooks: HostHooks) -> Self {
        Self {
            regs: [0; VREG_COUNT],
            pc: 0,
            _pad0: 0,
            memmap: ptr::null(),
            invalid_code: ptr::null(),
            exit: ptr::null(),
            translator: ptr::null_mut(),
            user: ptr::null_mut(),
            hooks,
        }
    }

    /// Point generated code at the memory map and invalid-code tables.
    pub fn attach_tables(&mut self, map: &MemoryMap, invalid: &InvalidCode) {
        self.memmap = map.as_ptr();
        self.invalid_code = invalid.as_ptr();
    }

    /// Byte offset of `reg`'s backing word from the context pointer.
    #[must_use]
    pub const fn reg_offset(reg: VReg) -> usize {
        Self::REGS_OFFSET + reg.backing_offset()
    }

    /// 32-bit half named by `reg`.
    #[must_use]
    pub const fn half(&self, reg: VReg) -> u32 {
        let full = self.regs[reg.index() as usize];
        if reg.is_upper() { (full >> 32) as u32 } else { full as u32 }
    }

    pub const fn set_half(&mut self, reg: VReg, value: u32) {
        let slot = &mut self.regs[reg.index() as usize];
        *slot = if reg.is_upper() {
            (*slot & 0xFFFF_FFFF) | ((value as u64) << 32)
        } else {
            (*slot & !0xFFFF_FFFF) | value as u64
        };
    }

    /// Full 64-bit value of guest register `index`.
    #[must_use]
    pub const fn reg(&self, index: u8) -> u64 {
        self.regs[index as usize]
    }

    pub const fn set_reg(&mut self, index: u8, value: u64) {
        self.regs[index as usize] = value;
    }

    /// Remaining cycle budget (negative while cycles are left).
    #[must_use]
    pub const fn cycles(&self) -> i32 {
        self.half(CCREG) as i32
    }

    /// Run for `budget` cycles before generated code returns to the dispatcher.
    pub const fn set_budget(&mut self, budget: u32) {
        self.set_half(CCREG, budget.wrapping_neg());
    }
}

impl Default for CpuContext {
    fn default() -> Self {
        Self::new(HostHooks::unhandled())
    }
}

#[cfg(test)]
mod tests {
    use drc_ir::mips::gpr;

    use super::*;

    #[test]
    fn test_layout_offsets() {
        assert_eq!(CpuContext::REGS_OFFSET, 0);
        assert_eq!(CpuContext::PC_OFFSET, 512);
        assert_eq!(CpuContext::MEMMAP_OFFSET, 520);
        assert_eq!(CpuContext::EXIT_OFFSET, 536);
        assert_eq!(CpuContext::READ_HOOK_OFFSET, 560);
        assert_eq!(CpuContext::NOTIFY_HOOK_OFFSET, 560 + 7 * 8);
        assert_eq!(CpuContext::reg_offset(gpr(5).upper()), 44);
    }

    #[test]
    fn test_halves_share_one_backing_word() {
        let mut ctx = CpuContext::default();
        ctx.set_half(gpr(4), 0x8000_0000);
        ctx.set_half(gpr(4).upper(), 0xFFFF_FFFF);
        assert_eq!(ctx.reg(4), 0xFFFF_FFFF_8000_0000);
        assert_eq!(ctx.half(gpr(4)), 0x8000_0000);
    }

    #[test]
    fn test_cycle_budget_counts_up_to_zero() {
        let mut ctx = CpuContext::default();
        ctx.set_budget(100);
        assert_eq!(ctx.cycles(), -100);
    }

    #[test]
    fn test_unhandled_hooks_exit_to_dispatcher() {
        let mut ctx = CpuContext::default();
        let exit = 0x1234 as *const u8;
        ctx.exit = exit;
        let hooks = ctx.hooks;
        let code = unsafe { (hooks.lookup)(&raw mut ctx, 0x8000_0040, 0) };
        assert_eq!(code, exit);
        assert_eq!(ctx.pc, 0x8000_0040);
        assert_eq!(unsafe { (hooks.interp)(&raw mut ctx, 0x8000_0080) }, 1);
        assert_eq!(ctx.pc, 0x8000_0080);
        assert_eq!(unsafe { (hooks.read)(&raw mut ctx, 0, 4) }, 0);
    }
}
