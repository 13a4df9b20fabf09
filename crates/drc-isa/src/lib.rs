//! Guest instruction decoders.
//!
//! Each supported guest lowers its encodings into the shared
//! [`InstrRecord`] model from `drc-ir`. Decoding never fails: reserved or
//! unknown encodings become [`drc_ir::InstrKind::Invalid`] records and anything the
//! recompiler does not translate inline becomes [`drc_ir::InstrKind::Interp`].

pub mod encode;
mod mips;
mod sh2;

use std::fmt;

use drc_ir::{InstrRecord, VReg};

pub use mips::Mips;
pub use sh2::Sh2;

/// Supported guest instruction sets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IsaKind {
    /// MIPS III (R4300-class), 64-bit registers, 32-bit encodings.
    Mips,
    /// SH-2, 32-bit registers, 16-bit encodings.
    Sh2,
}

impl IsaKind {
    /// Decoder for this guest.
    #[must_use]
    pub fn decoder(self) -> &'static dyn GuestIsa {
        match self {
            Self::Mips => &Mips,
            Self::Sh2 => &Sh2,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Mips => "mips",
            Self::Sh2 => "sh2",
        }
    }
}

impl fmt::Display for IsaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A guest instruction set.
pub trait GuestIsa: Send + Sync {
    fn kind(&self) -> IsaKind;

    /// Encoding size in bytes.
    fn insn_size(&self) -> u32;

    /// Registers carry 64-bit values (upper halves are tracked).
    fn has_upper_halves(&self) -> bool;

    /// Decode one instruction at `addr`.
    fn decode(&self, addr: u32, raw: u32) -> InstrRecord;

    /// Assembly name of a virtual register.
    fn reg_name(&self, reg: VReg) -> String;

    /// Address of the embedded literal read by a PC-relative load.
    fn literal_address(&self, rec: &InstrRecord) -> Option<u32> {
        let _ = rec;
        None
    }
}
