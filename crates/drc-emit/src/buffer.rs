//! Code buffer with forward-referenced labels.
//!
//! A [`CodeBuffer`] writes into a window `[start, limit)` of the
//! translation cache. Writes past the limit are dropped but still counted,
//! so a block that does not fit is detected once, in [`CodeBuffer::finish`],
//! instead of on every byte.

use crate::error::{EmitError, Result};

/// A branch target inside the block being emitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Label(u32);

impl Label {
    #[must_use]
    pub const fn id(self) -> u32 {
        self.0
    }
}

#[derive(Clone, Debug, Default)]
struct LabelState {
    /// Bound offset.
    offset: Option<usize>,
    /// rel32 fields that jump to this label.
    uses: Vec<usize>,
}

/// Emission window over executable memory.
pub struct CodeBuffer<'a> {
    code: &'a mut [u8],
    /// Host address of `code[0]`.
    base: u64,
    start: usize,
    pos: usize,
    limit: usize,
    labels: Vec<LabelState>,
}

impl<'a> CodeBuffer<'a> {
    /// Emit into `code[start..limit]`; `base` is the host address of `code[0]`.
    #[must_use]
    pub fn new(code: &'a mut [u8], base: u64, start: usize, limit: usize) -> Self {
        let limit = limit.min(code.len());
        Self {
            code,
            base,
            start,
            pos: start,
            limit,
            labels: Vec::new(),
        }
    }

    /// Offset of the next byte, from the start of the whole region.
    #[must_use]
    pub const fn current_offset(&self) -> usize {
        self.pos
    }

    #[must_use]
    pub const fn start(&self) -> usize {
        self.start
    }

    /// Host address of region offset `offset`.
    #[must_use]
    pub const fn addr_of(&self, offset: usize) -> u64 {
        self.base + offset as u64
    }

    /// Bytes emitted so far, dropped ones included.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.pos - self.start
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.pos == self.start
    }

    /// Whether everything emitted so far fits the window.
    #[must_use]
    pub const fn fits(&self) -> bool {
        self.pos <= self.limit
    }

    pub fn emit(&mut self, bytes: &[u8]) {
        let end = self.pos + bytes.len();
        if end <= self.limit {
            self.code[self.pos..end].copy_from_slice(bytes);
        }
        self.pos = end;
    }

    #[inline]
    pub fn emit_u8(&mut self, b: u8) {
        self.emit(&[b]);
    }

    #[inline]
    pub fn emit_u32(&mut self, v: u32) {
        self.emit(&v.to_le_bytes());
    }

    #[inline]
    pub fn emit_u64(&mut self, v: u64) {
        self.emit(&v.to_le_bytes());
    }

    /// Overwrite already emitted bytes; out-of-window patches are ignored.
    pub fn patch(&mut self, offset: usize, bytes: &[u8]) {
        let end = offset + bytes.len();
        if offset >= self.start && end <= self.pos.min(self.limit) {
            self.code[offset..end].copy_from_slice(bytes);
        }
    }

    pub fn new_label(&mut self) -> Label {
        let id = u32::try_from(self.labels.len()).unwrap_or(u32::MAX);
        self.labels.push(LabelState::default());
        Label(id)
    }

    /// Bind `label` to the current offset.
    pub fn bind(&mut self, label: Label) {
        let pos = self.pos;
        if let Some(state) = self.labels.get_mut(label.0 as usize) {
            state.offset = Some(pos);
        }
    }

    #[must_use]
    pub fn label_offset(&self, label: Label) -> Option<usize> {
        self.labels.get(label.0 as usize).and_then(|s| s.offset)
    }

    /// Emit a rel32 field targeting `label`; returns the field's offset.
    pub fn rel32_to(&mut self, label: Label) -> usize {
        let site = self.pos;
        if let Some(state) = self.labels.get_mut(label.0 as usize) {
            state.uses.push(site);
        }
        self.emit_u32(0);
        site
    }

    /// Resolve every label use and return the end offset.
    ///
    /// # Errors
    ///
    /// Returns [`EmitError::Overflow`] if the block did not fit its window
    /// and [`EmitError::UnboundLabel`] if a used label was never bound.
    pub fn finish(mut self) -> Result<usize> {
        if !self.fits() {
            return Err(EmitError::Overflow {
                needed: self.len(),
                limit: self.limit - self.start,
            });
        }
        let labels = std::mem::take(&mut self.labels);
        for (id, state) in labels.iter().enumerate() {
            if state.uses.is_empty() {
                continue;
            }
            let target = state
                .offset
                .ok_or(EmitError::UnboundLabel(u32::try_from(id).unwrap_or(u32::MAX)))?;
            for &site in &state.uses {
                let rel = rel32(site, target)?;
                self.patch(site, &rel.to_le_bytes());
            }
        }
        Ok(self.pos)
    }
}

/// Displacement stored at `site` for a jump landing on `target`.
///
/// # Errors
///
/// Returns [`EmitError::OutOfRange`] if the distance does not fit 32 bits.
pub fn rel32(site: usize, target: usize) -> Result<i32> {
    let rel = target as i64 - (site as i64 + 4);
    i32::try_from(rel).map_err(|_| EmitError::OutOfRange { from: site, to: target })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_and_offsets() {
        let mut mem = vec![0u8; 64];
        let mut buf = CodeBuffer::new(&mut mem, 0x1000, 8, 64);
        assert_eq!(buf.current_offset(), 8);
        buf.emit(&[0x90, 0x90]);
        buf.emit_u32(0xDEAD_BEEF);
        assert_eq!(buf.current_offset(), 14);
        assert_eq!(buf.addr_of(14), 0x100E);
        buf.patch(8, &[0xCC]);
        assert_eq!(buf.finish(), Ok(14));
        assert_eq!(&mem[8..14], &[0xCC, 0x90, 0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn test_forward_and_backward_labels() {
        let mut mem = vec![0u8; 64];
        let mut buf = CodeBuffer::new(&mut mem, 0, 0, 64);
        let back = buf.new_label();
        buf.bind(back);
        let fwd = buf.new_label();
        buf.emit_u8(0xE9);
        let site1 = buf.rel32_to(fwd);
        buf.emit_u8(0xE9);
        let site2 = buf.rel32_to(back);
        buf.bind(fwd);
        assert_eq!(buf.label_offset(fwd), Some(10));
        buf.finish().unwrap();
        assert_eq!(i32::from_le_bytes(mem[site1..site1 + 4].try_into().unwrap()), 5);
        assert_eq!(i32::from_le_bytes(mem[site2..site2 + 4].try_into().unwrap()), -10);
    }

    #[test]
    fn test_overflow_is_reported_once() {
        let mut mem = vec![0u8; 16];
        let mut buf = CodeBuffer::new(&mut mem, 0, 4, 12);
        buf.emit(&[0; 6]);
        assert!(buf.fits());
        buf.emit(&[1; 6]);
        assert!(!buf.fits());
        assert_eq!(buf.finish(), Err(EmitError::Overflow { needed: 12, limit: 8 }));
        // nothing past the window was touched
        assert!(mem[10..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_unbound_label_is_an_error() {
        let mut mem = vec![0u8; 16];
        let mut buf = CodeBuffer::new(&mut mem, 0, 0, 16);
        let l = buf.new_label();
        buf.rel32_to(l);
        assert_eq!(buf.finish(), Err(EmitError::UnboundLabel(0)));
    }
}
