//! Guest code access used by the block scanner.

/// Read access to guest code plus knowledge of what is already compiled.
pub trait CodeSource {
    /// Big-endian read of `size` bytes (1, 2 or 4) at `addr`.
    ///
    /// Returns `None` when the address is not backed by directly mapped
    /// guest memory.
    fn fetch(&self, addr: u32, size: u32) -> Option<u32>;

    /// Whether a translated block already starts at `addr`.
    fn is_compiled(&self, addr: u32) -> bool {
        let _ = addr;
        false
    }
}

/// A flat big-endian guest image mapped at `base`.
#[derive(Clone, Copy, Debug)]
pub struct ImageSource<'a> {
    pub base: u32,
    pub bytes: &'a [u8],
}

impl<'a> ImageSource<'a> {
    #[must_use]
    pub const fn new(base: u32, bytes: &'a [u8]) -> Self {
        Self { base, bytes }
    }
}

impl CodeSource for ImageSource<'_> {
    fn fetch(&self, addr: u32, size: u32) -> Option<u32> {
        let offset = addr.checked_sub(self.base)? as usize;
        let bytes = self.bytes.get(offset..offset + size as usize)?;
        Some(bytes.iter().fold(0, |acc, &b| (acc << 8) | u32::from(b)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_fetch_is_big_endian() {
        let bytes = [0x12, 0x34, 0x56, 0x78, 0x9A];
        let src = ImageSource::new(0x1000, &bytes);
        assert_eq!(src.fetch(0x1000, 4), Some(0x1234_5678));
        assert_eq!(src.fetch(0x1003, 2), Some(0x789A));
        assert_eq!(src.fetch(0x1004, 1), Some(0x9A));
        assert_eq!(src.fetch(0x1004, 2), None);
        assert_eq!(src.fetch(0x0FFF, 1), None);
        assert!(!src.is_compiled(0x1000));
    }
}
