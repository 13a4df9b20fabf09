//! Translate command.

use std::collections::VecDeque;

use drc::{CacheConfig, DEFAULT_BLOCK_WINDOW, TranslatorConfig, TranslatorContext, image_memory};
use rustc_hash::FxHashSet;
use tracing::{error, info, warn};

use crate::cli::{EXIT_FAILURE, EXIT_SUCCESS, ImageArgs};
use crate::commands::read_image;

/// Handle the `translate` command.
///
/// Translates the entry block, then up to `follow` more blocks reached
/// through the direct jumps of blocks already translated, breadth first.
pub fn cmd_translate(args: &ImageArgs, follow: usize, buffer: usize) -> i32 {
    let Some(image) = read_image(&args.input) else {
        return EXIT_FAILURE;
    };
    info!(
        input = %args.input.display(),
        isa = %drc::IsaKind::from(args.isa),
        base = format_args!("{:#010x}", args.base),
        "translating"
    );

    let memory = match image_memory(args.base, &image) {
        Ok(memory) => memory,
        Err(e) => {
            error!(error = %e, "failed to map image");
            return EXIT_FAILURE;
        }
    };

    let cache = CacheConfig::default()
        .with_buffer_size(buffer)
        .with_block_window(DEFAULT_BLOCK_WINDOW.min(buffer / 4));
    let config = TranslatorConfig::new(args.isa.into()).with_cache(cache);
    let mut translator = match TranslatorContext::new(config, memory) {
        Ok(t) => t,
        Err(e) => {
            error!(error = %e, "failed to create translator");
            return EXIT_FAILURE;
        }
    };

    let mut queue = VecDeque::from([args.entry()]);
    let mut seen = FxHashSet::default();
    let mut remaining = follow + 1;
    while remaining > 0 {
        let Some(addr) = queue.pop_front() else { break };
        if !seen.insert(addr) {
            continue;
        }
        let id = match translator.translate(addr) {
            Ok(id) => id,
            Err(e) if addr == args.entry() => {
                error!(addr = format_args!("{addr:#010x}"), error = %e, "translation failed");
                return EXIT_FAILURE;
            }
            Err(e) => {
                warn!(addr = format_args!("{addr:#010x}"), error = %e, "skipping jump target");
                continue;
            }
        };
        remaining -= 1;
        let Some(block) = translator.block(id) else {
            continue;
        };
        println!("{}", block.summary);
        for link in block.links.iter().filter(|l| l.is_external()) {
            if !seen.contains(&link.target) {
                queue.push_back(link.target);
            }
        }
    }

    let stats = translator.stats();
    println!(
        "{} blocks, {} host bytes, {} links patched",
        stats.live_blocks, stats.code_bytes, stats.links_patched
    );
    EXIT_SUCCESS
}
