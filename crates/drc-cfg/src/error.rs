use thiserror::Error;

/// Errors produced while scanning a block.
///
/// Individual undecodable instructions are not errors: they become
/// interpreter-fallback records inside the block.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("no executable guest memory at {0:#010x}")]
    Unmapped(u32),

    #[error("entry address {addr:#010x} is not aligned to {align} bytes")]
    Misaligned { addr: u32, align: u32 },
}

pub type Result<T> = std::result::Result<T, DecodeError>;
