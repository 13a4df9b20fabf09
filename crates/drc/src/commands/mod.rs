//! Command implementations.
//!
//! Each submodule handles a specific CLI command.

mod dump;
mod translate;

use std::path::Path;

use tracing::error;

use crate::cli::{Cli, Commands};

/// Dispatch CLI command to the appropriate handler.
pub fn run_command(cli: &Cli) -> i32 {
    match &cli.command {
        Commands::Translate { .. } => handle_translate(cli),
        Commands::Dump { .. } => handle_dump(cli),
    }
}

fn handle_translate(cli: &Cli) -> i32 {
    let Commands::Translate { image, follow, buffer } = &cli.command else {
        unreachable!("translate command variant mismatch");
    };
    translate::cmd_translate(image, *follow, *buffer)
}

fn handle_dump(cli: &Cli) -> i32 {
    let Commands::Dump { image } = &cli.command else {
        unreachable!("dump command variant mismatch");
    };
    dump::cmd_dump(image)
}

/// Read a guest image, logging the failure.
fn read_image(path: &Path) -> Option<Vec<u8>> {
    match std::fs::read(path) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            error!(path = %path.display(), error = %e, "failed to read image");
            None
        }
    }
}
