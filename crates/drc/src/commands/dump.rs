//! Dump command: decoded records with liveness and register maps.

use drc::{AllocConfig, IsaKind};
use drc_cfg::{DecodedBlock, ImageSource, Liveness, ScanConfig, scan_block};
use drc_ir::{RegMask, VREG_COUNT, VReg};
use drc_isa::GuestIsa;
use drc_regalloc::{Allocation, allocate};
use tracing::{error, info};

use crate::cli::{EXIT_FAILURE, EXIT_SUCCESS, ImageArgs};
use crate::commands::read_image;

/// Handle the `dump` command.
pub fn cmd_dump(args: &ImageArgs) -> i32 {
    let Some(image) = read_image(&args.input) else {
        return EXIT_FAILURE;
    };
    let isa = IsaKind::from(args.isa);
    let entry = args.entry();
    info!(input = %args.input.display(), %isa, entry = format_args!("{entry:#010x}"), "dumping");

    let source = ImageSource::new(args.base, &image);
    let block = match scan_block(isa, &source, entry, &ScanConfig::default()) {
        Ok(block) => block,
        Err(e) => {
            error!(error = %e, "decode failed");
            return EXIT_FAILURE;
        }
    };
    let config = AllocConfig::default();
    let live = Liveness::analyze(&block, config.liveness_depth);
    let alloc = allocate(&block, &live, &config);

    print!("{}", render(&block, &live, &alloc));
    EXIT_SUCCESS
}

fn render(block: &DecodedBlock, live: &Liveness, alloc: &Allocation) -> String {
    let decoder = block.isa.decoder();
    let mut out = format!(
        "block {:#010x}..{:#010x} {} {} instrs stop {:?} pressure {}\n",
        block.start,
        block.end,
        block.isa,
        block.len(),
        block.stop,
        alloc.peak_pressure()
    );
    for range in &block.data_ranges {
        out.push_str(&format!("  data {:#010x}+{}\n", range.addr, range.len));
    }
    for (i, rec) in block.instrs.iter().enumerate() {
        let raw = if rec.size == 2 {
            format!("{:04x}    ", rec.raw)
        } else {
            format!("{:08x}", rec.raw)
        };
        let marker = if block.is_target[i] { '>' } else { ' ' };
        let ds = if rec.is_ds { "ds" } else { "  " };
        out.push_str(&format!(
            "{marker} {:#010x} {raw} {ds} {:<8} dead [{}] regs {}\n",
            rec.addr,
            rec.class().name(),
            reg_names(decoder, live.after[i]),
            alloc.regs[i].cur
        ));
    }
    out
}

fn reg_names(decoder: &dyn GuestIsa, mask: RegMask) -> String {
    (0..VREG_COUNT as u8)
        .filter(|&r| mask & (1 << r) != 0)
        .map(|r| decoder.reg_name(VReg::new(r)))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use drc_isa::encode::mips;

    #[test]
    fn test_render_lists_every_record() {
        let image = mips::assemble(&[
            mips::addiu(2, 0, 5),
            mips::addu(3, 2, 2),
            mips::jr(31),
            mips::nop(),
        ]);
        let source = ImageSource::new(0x8000_0000, &image);
        let block = scan_block(IsaKind::Mips, &source, 0x8000_0000, &ScanConfig::default()).unwrap();
        let config = AllocConfig::default();
        let live = Liveness::analyze(&block, config.liveness_depth);
        let alloc = allocate(&block, &live, &config);

        let text = render(&block, &live, &alloc);
        assert!(text.starts_with("block 0x80000000..0x80000010 mips 4 instrs"));
        assert_eq!(text.lines().count(), 1 + block.len());
        assert!(text.contains("0x8000000c"));
        assert!(text.lines().nth(4).unwrap().contains(" ds "));
    }
}
