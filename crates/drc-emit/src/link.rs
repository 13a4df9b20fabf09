//! Jump sites between and within blocks.
//!
//! Every direct jump to a guest address outside the block is emitted as
//! `jmp rel32` aimed at a lazy-link trampoline in the same block. The
//! trampoline asks the host to resolve the target; once the target is
//! compiled the translator re-aims the `rel32` straight at it with
//! [`patch_jump`]. Invalidating the target aims it back at the trampoline.

use crate::buffer::rel32;
use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LinkKind {
    /// Resolved when the block was emitted.
    Internal,
    /// Resolved at run time through the trampoline.
    External,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkRecord {
    /// Offset of the jump's rel32 field.
    pub site: usize,
    /// Guest address jumped to.
    pub target: u32,
    pub kind: LinkKind,
    /// Lazy-link trampoline of an external jump.
    pub trampoline: Option<usize>,
}

impl LinkRecord {
    #[must_use]
    pub const fn is_external(&self) -> bool {
        matches!(self.kind, LinkKind::External)
    }
}

/// Aim the rel32 field at `site` in `code` at offset `target`.
///
/// # Errors
///
/// Returns an error if the distance does not fit 32 bits.
pub fn patch_jump(code: &mut [u8], site: usize, target: usize) -> Result<()> {
    let rel = rel32(site, target)?;
    code[site..site + 4].copy_from_slice(&rel.to_le_bytes());
    Ok(())
}

/// Code offset a rel32 field at `site` currently jumps to.
#[must_use]
pub fn jump_target(code: &[u8], site: usize) -> usize {
    let mut rel = [0u8; 4];
    rel.copy_from_slice(&code[site..site + 4]);
    (site as i64 + 4 + i64::from(i32::from_le_bytes(rel))) as usize
}
