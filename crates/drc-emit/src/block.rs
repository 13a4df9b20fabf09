//! What the emitter reports about one translated block.

use crate::link::{LinkKind, LinkRecord};

/// A guest address the dispatcher may enter the block at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryPoint {
    pub addr: u32,
    /// Code offset, from the start of the code region.
    pub offset: usize,
}

/// Out-of-line code paths.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StubKind {
    /// Load through the host read hook.
    ReadSlow,
    /// Store through the host write hook.
    WriteSlow,
    /// Store hit a page holding translated code.
    WriteNotify,
    /// Cycle budget ran out on an internal branch.
    CycleCheck,
    /// Return to the dispatcher.
    Exit,
}

impl StubKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ReadSlow => "read",
            Self::WriteSlow => "write",
            Self::WriteNotify => "notify",
            Self::CycleCheck => "cycles",
            Self::Exit => "exit",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StubRecord {
    pub kind: StubKind,
    /// Guest instruction the stub belongs to.
    pub addr: u32,
    pub offset: usize,
}

/// A successfully emitted block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmittedBlock {
    /// Guest start address.
    pub guest_start: u32,
    /// First code byte.
    pub start: usize,
    /// One past the last code byte.
    pub end: usize,
    /// Dispatcher entries; the first is the block start.
    pub entries: Vec<EntryPoint>,
    /// Entry that re-checks the guest source before running.
    pub verify_entry: Option<usize>,
    pub links: Vec<LinkRecord>,
    pub stubs: Vec<StubRecord>,
}

impl EmittedBlock {
    #[must_use]
    pub const fn size(&self) -> usize {
        self.end - self.start
    }

    /// Code offset of the clean entry for guest address `addr`.
    #[must_use]
    pub fn entry(&self, addr: u32) -> Option<usize> {
        self.entries.iter().find(|e| e.addr == addr).map(|e| e.offset)
    }

    /// Jumps to other blocks, resolved lazily.
    pub fn external_links(&self) -> impl Iterator<Item = &LinkRecord> {
        self.links.iter().filter(|l| l.kind == LinkKind::External)
    }

    #[must_use]
    pub fn stub_count(&self, kind: StubKind) -> usize {
        self.stubs.iter().filter(|s| s.kind == kind).count()
    }
}
