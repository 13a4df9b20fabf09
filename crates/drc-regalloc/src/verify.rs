//! Structural checks on a finished allocation.

use drc_cfg::DecodedBlock;
use drc_ir::{BTREG, CCREG, HOST_CCREG, HOST_REGS, VReg};

use crate::{AllocError, Allocation};

fn unique(map: &[Option<VReg>; HOST_REGS], addr: u32) -> Result<(), AllocError> {
    for (hr, reg) in map.iter().enumerate() {
        if let Some(reg) = *reg
            && map[hr + 1..].contains(&Some(reg))
        {
            return Err(AllocError::Duplicate { addr, reg });
        }
    }
    if map[HOST_CCREG] != Some(CCREG) {
        return Err(AllocError::CycleCounter { addr });
    }
    Ok(())
}

pub(crate) fn verify(alloc: &Allocation, block: &DecodedBlock) -> Result<(), AllocError> {
    for (i, (rec, stat)) in block.instrs.iter().zip(&alloc.regs).enumerate() {
        let addr = rec.addr;
        unique(&stat.pre.map, addr)?;
        unique(&stat.entry.map, addr)?;
        unique(&stat.src, addr)?;
        unique(&stat.cur.map, addr)?;
        if let Some(branch) = &stat.branch {
            unique(&branch.map, addr)?;
        }
        if rec.flushes_all() {
            continue;
        }

        for reg in rec.sources() {
            if stat.src_slot(reg).is_none() {
                return Err(AllocError::MissingSource { addr, reg });
            }
            if alloc.wide
                && rec.reads_wide(reg)
                && !stat.entry.reg_is32(reg)
                && stat.src_slot(reg.upper()).is_none()
            {
                return Err(AllocError::MissingSource { addr, reg: reg.upper() });
            }
        }
        for reg in rec.dests() {
            if !stat.cur.contains(reg) {
                return Err(AllocError::MissingDest { addr, reg });
            }
        }
        if rec.ds_clobbers && !stat.cur.contains(BTREG) {
            return Err(AllocError::MissingDest { addr, reg: BTREG });
        }

        // operands of the owning branch survive the slot untouched
        if block.is_paired_ds(i) {
            let branch = &block.instrs[i - 1];
            let before = &alloc.regs[i - 1].cur;
            let held: Vec<VReg> = if branch.is_likely() {
                Vec::new()
            } else if branch.ds_clobbers {
                vec![BTREG]
            } else {
                branch.sources().collect()
            };
            for reg in held {
                if before.find(reg).is_none() || before.find(reg) != stat.cur.find(reg) {
                    return Err(AllocError::BranchOperand { addr, reg });
                }
            }
        }

        for pin in alloc.pins.iter().filter(|p| p.covers(i)) {
            let kept = |map: &[Option<VReg>; HOST_REGS]| map[pin.slot] == Some(pin.reg);
            if !kept(&stat.entry.map) || !kept(&stat.src) || !kept(&stat.cur.map) {
                return Err(AllocError::PinBroken { addr, reg: pin.reg });
            }
        }
    }
    Ok(())
}
