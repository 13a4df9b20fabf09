//! Host hooks generated code calls back into the translator through.
//!
//! Each hook finds the translator through `ctx.translator`, set by
//! [`TranslatorContext::attach`]. A hook that cannot produce code leaves
//! `ctx.pc` at the wanted address and returns the exit trampoline, so the
//! dispatcher retries from Rust.

use drc_state::CpuContext;
use tracing::warn;

use crate::TranslatorContext;

/// # Safety
///
/// `ctx` must be a context attached to a live translator that nothing else
/// is borrowing.
unsafe fn translator<'a>(ctx: *mut CpuContext) -> (&'a mut CpuContext, &'a mut TranslatorContext) {
    let ctx = unsafe { &mut *ctx };
    let translator = unsafe { &mut *ctx.translator.cast::<TranslatorContext>() };
    (ctx, translator)
}

fn leave(ctx: &mut CpuContext, pc: u32) -> *const u8 {
    ctx.pc = pc;
    ctx.exit
}

/// Code for `addr` after an indirect jump; `site` is where execution
/// resumes in the calling block.
pub(crate) unsafe extern "C" fn lookup_hook(ctx: *mut CpuContext, addr: u32, site: u32) -> *const u8 {
    let (ctx, t) = unsafe { translator(ctx) };
    match t.lookup_from_code(addr, site as usize) {
        Ok(Some(offset)) => t.host_ptr(offset),
        Ok(None) => leave(ctx, addr),
        Err(err) => {
            warn!(addr = format_args!("{addr:#010x}"), %err, "lookup failed");
            leave(ctx, addr)
        }
    }
}

/// First run of an external jump: find or compile `target` and patch `site`.
pub(crate) unsafe extern "C" fn link_hook(ctx: *mut CpuContext, target: u32, site: u32) -> *const u8 {
    let (ctx, t) = unsafe { translator(ctx) };
    match t.link(target, site as usize) {
        Ok(Some(offset)) => t.host_ptr(offset),
        Ok(None) => leave(ctx, target),
        Err(err) => {
            warn!(target = format_args!("{target:#010x}"), %err, "link failed");
            leave(ctx, target)
        }
    }
}

/// Nonzero when the block at `start` still matches guest memory.
pub(crate) unsafe extern "C" fn verify_hook(ctx: *mut CpuContext, start: u32) -> u32 {
    let (_, t) = unsafe { translator(ctx) };
    u32::from(t.verify_block(start))
}

/// A store reached a page holding translated code. Nonzero when the block
/// starting at `running` was affected.
pub(crate) unsafe extern "C" fn notify_hook(ctx: *mut CpuContext, addr: u32, size: u32, running: u32) -> u32 {
    let (_, t) = unsafe { translator(ctx) };
    u32::from(t.notify_write(addr, size, Some(running)))
}
