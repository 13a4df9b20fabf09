//! Enter and exit trampolines at the start of the code buffer.
//!
//! `enter(ctx, code)` saves the callee-saved registers, loads the context
//! pointer and cycle counter and jumps into translated code. Every exit
//! from generated code lands on `exit`, which stores the cycle counter and
//! returns to the caller of `enter`. The stack is 16-byte aligned while
//! generated code runs, so hook calls need no adjustment.

use drc_emit::CodeBuffer;
use drc_emit::x86::encode::{Arith, Mem, Reg};
use drc_emit::x86::registers::{CC, CTX};
use drc_ir::CCREG;
use drc_state::CpuContext;

use crate::error::Result;

/// Bytes reserved for the trampolines; translated code starts after them.
pub(crate) const DISPATCH_SIZE: usize = 0x100;

const SAVED: [Reg; 6] = [Reg::Rbx, Reg::Rbp, Reg::R12, Reg::R13, Reg::R14, Reg::R15];

/// `enter(ctx, code)` as generated.
pub(crate) type EnterFn = unsafe extern "C" fn(*mut CpuContext, *const u8);

/// Offsets of the trampolines in the code buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Dispatcher {
    pub(crate) enter: usize,
    pub(crate) exit: usize,
}

impl Dispatcher {
    /// Write the trampolines to the start of `code`, mapped at `base`.
    pub(crate) fn emit(code: &mut [u8], base: u64) -> Result<Self> {
        let cc = Mem::Base(CTX, CpuContext::reg_offset(CCREG) as i32);
        let mut buf = CodeBuffer::new(code, base, 0, DISPATCH_SIZE);

        let enter = buf.current_offset();
        for reg in SAVED {
            buf.push(reg);
        }
        buf.arith_imm(true, Arith::Sub, Reg::Rsp, 8);
        buf.mov64(CTX, Reg::Rdi);
        buf.load32(CC, cc);
        buf.jmp_reg(Reg::Rsi);

        let exit = buf.current_offset();
        buf.store32(cc, CC);
        buf.arith_imm(true, Arith::Add, Reg::Rsp, 8);
        for reg in SAVED.iter().rev() {
            buf.pop(*reg);
        }
        buf.ret();
        buf.finish()?;
        Ok(Self { enter, exit })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trampolines_fit_reserved_space() {
        let mut code = vec![0u8; DISPATCH_SIZE + 0x10];
        let d = Dispatcher::emit(&mut code, 0x1000).expect("emit");
        assert_eq!(d.enter, 0);
        assert!(d.exit > d.enter && d.exit < DISPATCH_SIZE);
        // push rbx
        assert_eq!(code[0], 0x53);
        // mov r15, rdi
        assert!(code[..d.exit].windows(3).any(|w| w == [0x49, 0x89, 0xFF]));
        // jmp rsi, then ret closes the exit path
        assert!(code[..d.exit].ends_with(&[0xFF, 0xE6]));
        assert!(code[d.exit..DISPATCH_SIZE].contains(&0xC3));
        assert!(code[DISPATCH_SIZE..].iter().all(|&b| b == 0));
    }
}
