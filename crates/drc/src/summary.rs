//! One-line description of a compiled block.

use std::fmt;
use std::ops::Range;

use drc_cfg::{DecodedBlock, StopReason};
use drc_emit::{EmittedBlock, StubKind};
use drc_ir::InstrClass;
use drc_isa::IsaKind;
use drc_regalloc::Allocation;

const STUB_KINDS: [StubKind; 5] = [
    StubKind::ReadSlow,
    StubKind::WriteSlow,
    StubKind::WriteNotify,
    StubKind::CycleCheck,
    StubKind::Exit,
];

/// What went into a translation and what came out.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockSummary {
    pub isa: Option<IsaKind>,
    pub start: u32,
    /// One past the last guest byte.
    pub end: u32,
    pub instrs: usize,
    /// Instruction count per class, classes that occur only.
    pub classes: Vec<(InstrClass, usize)>,
    pub code: Range<usize>,
    /// Stub count per kind, kinds that occur only.
    pub stubs: Vec<(StubKind, usize)>,
    pub external_links: usize,
    pub internal_links: usize,
    pub entries: usize,
    /// Most host registers in use at any instruction.
    pub peak_pressure: usize,
    /// Registers held across a loop.
    pub pins: usize,
    pub stop: Option<StopReason>,
}

impl BlockSummary {
    #[must_use]
    pub fn new(block: &DecodedBlock, alloc: &Allocation, emitted: &EmittedBlock) -> Self {
        let classes = InstrClass::ALL
            .iter()
            .map(|&c| (c, block.instrs.iter().filter(|r| r.class() == c).count()))
            .filter(|&(_, n)| n > 0)
            .collect();
        let stubs = STUB_KINDS
            .iter()
            .map(|&k| (k, emitted.stub_count(k)))
            .filter(|&(_, n)| n > 0)
            .collect();
        let external_links = emitted.external_links().count();
        Self {
            isa: Some(block.isa),
            start: block.start,
            end: block.end,
            instrs: block.len(),
            classes,
            code: emitted.start..emitted.end,
            stubs,
            external_links,
            internal_links: emitted.links.len() - external_links,
            entries: emitted.entries.len(),
            peak_pressure: alloc.peak_pressure(),
            pins: alloc.pins.len(),
            stop: Some(block.stop),
        }
    }

    #[must_use]
    pub fn host_bytes(&self) -> usize {
        self.code.len()
    }

    #[must_use]
    pub fn class_count(&self, class: InstrClass) -> usize {
        self.classes.iter().find(|(c, _)| *c == class).map_or(0, |&(_, n)| n)
    }

    #[must_use]
    pub fn stub_count(&self, kind: StubKind) -> usize {
        self.stubs.iter().find(|(k, _)| *k == kind).map_or(0, |&(_, n)| n)
    }
}

const fn stop_name(stop: StopReason) -> &'static str {
    match stop {
        StopReason::Unconditional => "jump",
        StopReason::PageBoundary => "page",
        StopReason::LengthCap => "cap",
        StopReason::Unmapped => "unmapped",
        StopReason::Data => "data",
        StopReason::Truncated => "truncated",
    }
}

impl fmt::Display for BlockSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let isa = self.isa.map_or("?", IsaKind::name);
        write!(
            f,
            "{:#010x}..{:#010x} {isa} {:>4} instrs {:>6} bytes",
            self.start,
            self.end,
            self.instrs,
            self.host_bytes()
        )?;
        f.write_str(" [")?;
        for (n, (class, count)) in self.classes.iter().enumerate() {
            if n > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}:{count}", class.name())?;
        }
        f.write_str("] stubs [")?;
        for (n, (kind, count)) in self.stubs.iter().enumerate() {
            if n > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}:{count}", kind.name())?;
        }
        write!(
            f,
            "] links {}/{} entries {} pressure {}",
            self.external_links, self.internal_links, self.entries, self.peak_pressure
        )?;
        if self.pins > 0 {
            write!(f, " pins {}", self.pins)?;
        }
        if let Some(stop) = self.stop {
            write!(f, " stop {}", stop_name(stop))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let summary = BlockSummary {
            isa: Some(IsaKind::Mips),
            start: 0x8000_0000,
            end: 0x8000_0010,
            instrs: 4,
            classes: vec![(InstrClass::Alu, 3), (InstrClass::Jump, 1)],
            code: 0x100..0x180,
            stubs: vec![(StubKind::Exit, 1)],
            external_links: 1,
            internal_links: 0,
            entries: 1,
            peak_pressure: 3,
            pins: 0,
            stop: Some(StopReason::Unconditional),
        };
        let line = summary.to_string();
        assert!(line.starts_with("0x80000000..0x80000010 mips"));
        assert!(line.contains("128 bytes"));
        assert!(line.contains("[alu:3 jump:1]"));
        assert!(line.contains("stubs [exit:1]"));
        assert!(line.ends_with("links 1/0 entries 1 pressure 3 stop jump"));
        assert_eq!(summary.class_count(InstrClass::Alu), 3);
        assert_eq!(summary.stub_count(StubKind::ReadSlow), 0);
    }
}
