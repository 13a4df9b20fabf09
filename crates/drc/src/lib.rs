//! DRC - dynamic recompiler for MIPS and SH-2 guests on x86-64.
//!
//! Guest code is translated block by block into an executable buffer the
//! first time it is jumped to. [`TranslatorContext`] owns that buffer and
//! the block cache in front of it: lookups go through a two-way hash table
//! backed by per-page block lists, guest stores into compiled pages
//! invalidate or dirty the affected blocks, and when the buffer is full the
//! write cursor wraps and the oldest region is expired in phases.
//!
//! # Example
//!
//! ```ignore
//! use drc::{TranslatorConfig, TranslatorContext, IsaKind, image_memory};
//!
//! let memory = image_memory(0x8000_0000, &image)?;
//! let mut translator = TranslatorContext::new(TranslatorConfig::new(IsaKind::Mips), memory)?;
//! let block = translator.translate(0x8000_0000)?;
//! println!("{}", translator.block(block).unwrap().summary);
//! ```

pub use drc_cfg::{DecodeError, StopReason};
pub use drc_emit::{EmitConfig, EmitError, StubKind};
pub use drc_ir::InstrClass;
pub use drc_isa::IsaKind;
pub use drc_regalloc::AllocConfig;
pub use drc_state::{CpuContext, GUEST_PAGE_SIZE, GuestMemory, HostHooks, MemoryError};

mod cache;
mod config;
mod dispatch;
mod error;
mod hooks;
pub mod metrics;
mod source;
mod summary;
mod translator;

pub use cache::{Block, BlockId, BlockState, CacheStats, PageState};
pub use config::{CacheConfig, DEFAULT_BLOCK_WINDOW, DEFAULT_BUFFER_SIZE, TranslatorConfig};
pub use error::{Error, Result};
pub use summary::BlockSummary;
pub use translator::TranslatorContext;

/// Guest memory with `image` loaded at `base`, mapped as RAM rounded up to
/// whole pages.
///
/// # Errors
///
/// Returns an error if `base` is not page aligned or the range wraps the
/// address space.
pub fn image_memory(base: u32, image: &[u8]) -> Result<GuestMemory> {
    let mut memory = GuestMemory::new();
    let size = image.len().max(1).next_multiple_of(GUEST_PAGE_SIZE as usize);
    memory.map_ram(base, size)?;
    memory.load(base, image)?;
    Ok(memory)
}
