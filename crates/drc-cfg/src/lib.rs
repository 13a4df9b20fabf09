//! Block scanning and liveness analysis.
//!
//! [`scan_block`] walks guest code from an entry address and produces a
//! [`DecodedBlock`]: the ordered instruction records, resolved internal
//! branch targets, extra entry points and embedded literal ranges.
//! [`Liveness::analyze`] then computes, for every instruction boundary,
//! which virtual registers hold values that are never read again.

mod error;
mod liveness;
mod scan;
mod source;

pub use error::*;
pub use liveness::*;
pub use scan::*;
pub use source::*;

/// Guest page size used for block boundaries and invalidation.
pub const PAGE_SIZE: u32 = 0x1000;
/// Shift converting a guest address to its page number.
pub const PAGE_SHIFT: u32 = 12;

/// Page number of a guest address.
#[inline]
#[must_use]
pub const fn page_of(addr: u32) -> u32 {
    addr >> PAGE_SHIFT
}
