use thiserror::Error;

/// Translator errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error("memory error: {0}")]
    Memory(#[from] drc_state::MemoryError),
    #[error("decode error: {0}")]
    Decode(#[from] drc_cfg::DecodeError),
    #[error("emit error: {0}")]
    Emit(#[from] drc_emit::EmitError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("block at {0:#010x} does not fit the code buffer")]
    BlockTooLarge(u32),
    #[error("compiled block has no entry for {0:#010x}")]
    MissingEntry(u32),
}

pub type Result<T> = std::result::Result<T, Error>;
