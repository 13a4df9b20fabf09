use drc_ir::VReg;
use thiserror::Error;

/// Code generation error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EmitError {
    #[error("code buffer overflow: block needs {needed:#x} bytes, window holds {limit:#x}")]
    Overflow { needed: usize, limit: usize },

    #[error("label {0} is referenced but never bound")]
    UnboundLabel(u32),

    #[error("{reg} is not in a host register at {addr:#010x}")]
    MissingRegister { addr: u32, reg: VReg },

    #[error("branch at {addr:#010x} has no static target")]
    MissingTarget { addr: u32 },

    #[error("divide at {addr:#010x} does not have its results in rax/rdx")]
    DivideRegisters { addr: u32 },

    #[error("jump from {from:#x} to {to:#x} is out of rel32 range")]
    OutOfRange { from: usize, to: usize },
}

pub type Result<T> = std::result::Result<T, EmitError>;
