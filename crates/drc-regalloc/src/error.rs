use thiserror::Error;

use drc_ir::VReg;

/// An allocation that breaks a structural invariant.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("{reg} not resident when read at {addr:#010x}")]
    MissingSource { addr: u32, reg: VReg },

    #[error("{reg} has no slot after being written at {addr:#010x}")]
    MissingDest { addr: u32, reg: VReg },

    #[error("{reg} held by two slots at {addr:#010x}")]
    Duplicate { addr: u32, reg: VReg },

    #[error("cycle counter displaced at {addr:#010x}")]
    CycleCounter { addr: u32 },

    #[error("branch operand {reg} lost in the delay slot at {addr:#010x}")]
    BranchOperand { addr: u32, reg: VReg },

    #[error("{reg} left its pinned slot at {addr:#010x}")]
    PinBroken { addr: u32, reg: VReg },
}
