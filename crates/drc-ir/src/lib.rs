//! Data model shared by every stage of the dynamic recompiler.
//!
//! This crate holds pure data types with no guest- or host-specific
//! behaviour: virtual registers, decoded instruction records and the
//! per-instruction register allocation state. Guest decoding lives in
//! `drc-isa`, host code generation in `drc-emit`.

mod host;
mod record;
mod regstat;
mod vreg;

pub use host::*;
pub use record::*;
pub use regstat::*;
pub use vreg::*;
