//! Forward analysis of registers holding sign-extended 32-bit values.
//!
//! On a 64-bit guest most arithmetic is 32-bit with a sign-extended
//! result. Knowing that lets the allocator skip the upper half entirely:
//! it is implied by bit 31 of the lower half. Merge points take the
//! intersection of every incoming edge.

use drc_cfg::DecodedBlock;
use drc_ir::{BTREG, CCREG, InstrKind, InstrRecord, MemSize, RegMask, Src2, Width};

/// Registers known to be sign-extended on block entry.
const MIPS_BASE: RegMask = 1 | CCREG.bit() | BTREG.bit();

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Is32 {
    /// Known sign-extended registers before each instruction.
    pub before: Vec<RegMask>,
    /// Known sign-extended registers after each instruction.
    pub after: Vec<RegMask>,
    /// What is known where the dispatcher enters.
    pub base: RegMask,
}

impl Is32 {
    /// Every register of a 32-bit guest is trivially sign-extended.
    #[must_use]
    pub fn all(n: usize) -> Self {
        Self {
            before: vec![RegMask::MAX; n],
            after: vec![RegMask::MAX; n],
            base: RegMask::MAX,
        }
    }

    #[must_use]
    pub fn analyze(block: &DecodedBlock, wide: bool) -> Self {
        let n = block.len();
        if !wide {
            return Self::all(n);
        }
        // incoming taken edges, keyed by target
        let mut taken_into: Vec<Vec<usize>> = vec![Vec::new(); n];
        for i in 0..n {
            if block.instrs[i].is_branch()
                && !block.is_paired_ds(i)
                && let Some(t) = block.taken_index(i)
            {
                taken_into[t].push(block.pair_end(i));
            }
        }

        let mut state = Self {
            before: vec![RegMask::MAX; n],
            after: vec![RegMask::MAX; n],
            base: MIPS_BASE,
        };
        loop {
            let mut changed = false;
            for i in 0..n {
                let mut inflow = RegMask::MAX;
                let mut reached = false;
                if let Some(k) = block.fall_source(i) {
                    inflow &= state.after[k];
                    reached = true;
                }
                for &k in &taken_into[i] {
                    inflow &= state.after[k];
                    reached = true;
                }
                if !reached || i == 0 || block.entry_points.contains(&i) {
                    inflow &= MIPS_BASE;
                }
                let out = transfer(inflow, &block.instrs[i]);
                changed |= inflow != state.before[i] || out != state.after[i];
                state.before[i] = inflow;
                state.after[i] = out;
            }
            if !changed {
                break;
            }
        }
        state
    }

    #[must_use]
    pub fn before_has(&self, i: usize, reg: drc_ir::VReg) -> bool {
        self.before[i] & reg.bit() != 0
    }

    #[must_use]
    pub fn after_has(&self, i: usize, reg: drc_ir::VReg) -> bool {
        self.after[i] & reg.bit() != 0
    }
}

fn transfer(m: RegMask, rec: &InstrRecord) -> RegMask {
    if rec.flushes_all() {
        return MIPS_BASE;
    }
    let is32 = |r: Option<drc_ir::VReg>| r.is_none_or(|r| m & r.bit() != 0);
    let result = match rec.kind {
        InstrKind::Nop => return m,
        InstrKind::Alu { op, width, src2 } => {
            width == Width::W32
                || op.is_predicate()
                || (op.is_logic() && is32(rec.rs1) && (src2 == Src2::Imm || is32(rec.rs2)))
        }
        InstrKind::Shift { width, .. } => width == Width::W32,
        InstrKind::Move { width } => width == Width::W32 || is32(rec.rs1),
        InstrKind::LoadConst => rec.imm == i64::from(rec.imm as i32),
        InstrKind::Load { size, signed, .. } => match size {
            MemSize::Double => false,
            MemSize::Word => signed,
            MemSize::Byte | MemSize::Half => true,
        },
        _ => true,
    };
    let mut out = m;
    // only the data destination of a load follows the access width
    let data_dest = rec.rt1.map_or(0, |r| r.bit());
    for d in rec.dests() {
        let sext = if matches!(rec.kind, InstrKind::Load { .. }) && d.bit() != data_dest {
            true
        } else {
            result
        };
        if sext {
            out |= d.bit();
        } else {
            out &= !d.bit();
        }
    }
    if rec.ds_clobbers {
        out |= BTREG.bit();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use drc_cfg::{ImageSource, ScanConfig, scan_block};
    use drc_ir::mips::{HI, LO, gpr};
    use drc_isa::IsaKind;
    use drc_isa::encode::mips;

    const BASE: u32 = 0x8000_2000;

    fn analyze(words: &[u32]) -> (DecodedBlock, Is32) {
        let bytes = mips::assemble(words);
        let src = ImageSource::new(BASE, &bytes);
        let block = scan_block(IsaKind::Mips, &src, BASE, &ScanConfig::default()).unwrap();
        let is32 = Is32::analyze(&block, true);
        (block, is32)
    }

    #[test]
    fn test_word_ops_produce_sign_extended_values() {
        let (_, a) = analyze(&[
            mips::addiu(2, 0, 5),
            mips::daddu(3, 2, 2),
            mips::and(4, 2, 2),
            mips::lw(5, 2, 0),
            mips::ld(6, 2, 0),
            mips::jr(31),
            mips::nop(),
        ]);
        assert!(a.after_has(0, gpr(2)));
        assert!(!a.after_has(1, gpr(3)));
        assert!(a.after_has(2, gpr(4)));
        assert!(a.after_has(3, gpr(5)));
        assert!(!a.after_has(4, gpr(6)));
        assert!(!a.before_has(0, gpr(31)));
    }

    #[test]
    fn test_merge_takes_intersection() {
        // r2 is 32-bit on the fallthrough edge but 64-bit around the loop.
        let (block, a) = analyze(&[
            mips::addiu(2, 0, 1),
            mips::daddu(2, 2, 2),
            mips::bne(2, 0, -2),
            mips::nop(),
            mips::jr(31),
            mips::nop(),
        ]);
        assert_eq!(block.target_index[2], Some(1));
        assert!(a.after_has(0, gpr(2)));
        assert!(!a.before_has(1, gpr(2)));
    }

    #[test]
    fn test_multiply_results_and_interpreted_code() {
        let (_, a) = analyze(&[
            mips::mult(4, 5),
            mips::special(2, 3, 0, 0, 28),
            mips::jr(31),
            mips::nop(),
        ]);
        assert!(a.after_has(0, HI) && a.after_has(0, LO));
        assert_eq!(a.after[1], MIPS_BASE);
    }

    #[test]
    fn test_narrow_guest_is_all_32_bit() {
        let a = Is32::all(3);
        assert!(a.before.iter().chain(&a.after).all(|&m| m == RegMask::MAX));
    }
}
