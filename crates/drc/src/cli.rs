//! CLI definitions and argument types.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use drc::IsaKind;

/// Exit code for success.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code for failure.
pub const EXIT_FAILURE: i32 = 1;

#[derive(Parser)]
#[command(name = "drc")]
#[command(about = "Dynamic recompiler for MIPS and SH-2 guest code")]
#[command(version)]
pub struct Cli {
    /// Show metrics summary after execution
    #[arg(long, global = true)]
    pub metrics: bool,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress output (only show errors)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub silent: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Translate blocks of a raw image and print a summary per block
    Translate {
        #[command(flatten)]
        image: ImageArgs,

        /// Also translate up to N blocks reached through direct jumps
        #[arg(long, default_value = "0")]
        follow: usize,

        /// Code buffer size in bytes
        #[arg(long, value_parser = parse_addr_usize, default_value = "0x2000000")]
        buffer: usize,
    },
    /// Print the decoded block with liveness and register maps
    Dump {
        #[command(flatten)]
        image: ImageArgs,
    },
}

/// Where the guest image comes from and how to read it.
#[derive(clap::Args)]
pub struct ImageArgs {
    /// Raw big-endian guest image
    #[arg(value_name = "IMAGE")]
    pub input: PathBuf,

    /// Guest instruction set
    #[arg(long, value_enum)]
    pub isa: IsaArg,

    /// Guest address the image is loaded at (page aligned)
    #[arg(long, value_parser = parse_addr)]
    pub base: u32,

    /// Address of the first block (defaults to the base)
    #[arg(long, value_parser = parse_addr)]
    pub entry: Option<u32>,
}

impl ImageArgs {
    pub fn entry(&self) -> u32 {
        self.entry.unwrap_or(self.base)
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum IsaArg {
    /// MIPS III (R4300-class)
    Mips,
    /// Hitachi SH-2
    Sh2,
}

impl From<IsaArg> for IsaKind {
    fn from(arg: IsaArg) -> Self {
        match arg {
            IsaArg::Mips => Self::Mips,
            IsaArg::Sh2 => Self::Sh2,
        }
    }
}

// ============================================================================
// Value parsers
// ============================================================================

/// Parse a decimal or `0x`-prefixed hexadecimal address.
pub fn parse_addr(arg: &str) -> Result<u32, String> {
    let arg = arg.trim().replace('_', "");
    let parsed = match arg.strip_prefix("0x").or_else(|| arg.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => arg.parse(),
    };
    parsed.map_err(|e| format!("invalid address '{arg}': {e}"))
}

fn parse_addr_usize(arg: &str) -> Result<usize, String> {
    parse_addr(arg).map(|v| v as usize)
}
