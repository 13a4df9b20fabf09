//! x86-64 code generation for the dynamic recompiler.
//!
//! [`emit_block`] lowers an allocated [`DecodedBlock`](drc_cfg::DecodedBlock)
//! into a window of the translation cache and reports where its entries,
//! stubs and jump sites ended up ([`EmittedBlock`]). The translator uses
//! the report to register entries in its lookup tables and to patch
//! lazy links with [`patch_jump`].

mod block;
mod buffer;
mod config;
mod error;
mod link;
pub mod x86;

pub use block::{EmittedBlock, EntryPoint, StubKind, StubRecord};
pub use buffer::{CodeBuffer, Label, rel32};
pub use config::EmitConfig;
pub use error::{EmitError, Result};
pub use link::{LinkKind, LinkRecord, jump_target, patch_jump};
pub use x86::{EmitInput, emit_block};

#[cfg(test)]
mod tests;
