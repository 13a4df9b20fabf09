//! Guest memory regions and the per-page tables generated code consults.
//!
//! Guest memory is big-endian. Every 4 KiB guest page has one entry in the
//! [`MemoryMap`]: for directly mapped RAM the entry is the host address of
//! the page minus its guest address, so `entry + guest_addr` is the host
//! address of any byte in it; pages without backing memory carry
//! [`SLOW_PATH`] and are accessed through the host read/write hooks.

use nix::sys::mman::ProtFlags;
use tracing::debug;

use crate::memory::{Mapping, MemoryError};

/// Guest page size covered by one memory-map entry.
pub const GUEST_PAGE_SIZE: u32 = 0x1000;
/// Shift from guest address to page number.
pub const GUEST_PAGE_SHIFT: u32 = 12;
/// Number of guest pages in the 32-bit address space.
pub const GUEST_PAGES: usize = 1 << (32 - GUEST_PAGE_SHIFT);
/// Memory-map entry bit routing an access to the host hooks.
pub const SLOW_PATH: u64 = 1;

/// Host-minus-guest offset per guest page.
pub struct MemoryMap {
    entries: Box<[u64]>,
}

impl MemoryMap {
    /// A map with every page on the slow path.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: vec![SLOW_PATH; GUEST_PAGES].into_boxed_slice(),
        }
    }

    #[must_use]
    pub fn entry(&self, page: u32) -> u64 {
        self.entries[page as usize]
    }

    /// Whether `addr` is backed by directly mapped memory.
    #[must_use]
    pub fn is_direct(&self, addr: u32) -> bool {
        self.entry(addr >> GUEST_PAGE_SHIFT) & SLOW_PATH == 0
    }

    /// Host address of guest byte `addr`, if directly mapped.
    #[must_use]
    pub fn host_addr(&self, addr: u32) -> Option<u64> {
        let entry = self.entry(addr >> GUEST_PAGE_SHIFT);
        (entry & SLOW_PATH == 0).then(|| entry.wrapping_add(u64::from(addr)))
    }

    /// Table base handed to generated code.
    #[must_use]
    pub fn as_ptr(&self) -> *const u64 {
        self.entries.as_ptr()
    }

    fn set(&mut self, page: u32, entry: u64) {
        self.entries[page as usize] = entry;
    }
}

impl Default for MemoryMap {
    fn default() -> Self {
        Self::new()
    }
}

/// A directly mapped guest RAM region.
struct Region {
    base: u32,
    map: Mapping,
}

impl Region {
    fn len(&self) -> u64 {
        self.map.size() as u64
    }

    fn contains(&self, addr: u32, len: usize) -> bool {
        let start = u64::from(addr);
        start >= u64::from(self.base) && start + len as u64 <= u64::from(self.base) + self.len()
    }
}

/// Guest physical memory: RAM regions plus the page map built from them.
pub struct GuestMemory {
    regions: Vec<Region>,
    map: MemoryMap,
}

impl GuestMemory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            regions: Vec::new(),
            map: MemoryMap::new(),
        }
    }

    /// Map `size` bytes of zeroed RAM at guest address `base`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is misaligned, wraps the address
    /// space, overlaps an existing region or cannot be allocated.
    pub fn map_ram(&mut self, base: u32, size: usize) -> Result<(), MemoryError> {
        if base % GUEST_PAGE_SIZE != 0 {
            return Err(MemoryError::Misaligned(base));
        }
        if size == 0 || u64::from(base) + size as u64 > 1 << 32 {
            return Err(MemoryError::InvalidSize(size));
        }
        let first = base >> GUEST_PAGE_SHIFT;
        let pages = size.div_ceil(GUEST_PAGE_SIZE as usize) as u32;
        if (first..first + pages).any(|p| self.map.entry(p) & SLOW_PATH == 0) {
            return Err(MemoryError::Overlap(base));
        }
        let map = Mapping::new(
            pages as usize * GUEST_PAGE_SIZE as usize,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        )?;
        let offset = (map.as_ptr() as u64).wrapping_sub(u64::from(base));
        for page in first..first + pages {
            self.map.set(page, offset);
        }
        debug!(
            base = format_args!("{base:#010x}"),
            size = format_args!("{size:#x}"),
            "mapped guest ram"
        );
        self.regions.push(Region { base, map });
        Ok(())
    }

    #[must_use]
    pub const fn map(&self) -> &MemoryMap {
        &self.map
    }

    fn region(&self, addr: u32, len: usize) -> Option<&Region> {
        self.regions.iter().find(|r| r.contains(addr, len))
    }

    /// Bytes `addr..addr + len`, if they lie in one region.
    #[must_use]
    pub fn bytes(&self, addr: u32, len: usize) -> Option<&[u8]> {
        let region = self.region(addr, len)?;
        let offset = (addr - region.base) as usize;
        Some(unsafe { std::slice::from_raw_parts(region.map.as_ptr().add(offset), len) })
    }

    /// Mutable bytes `addr..addr + len`, if they lie in one region.
    ///
    /// Writing through the slice bypasses write notification.
    pub fn bytes_mut(&mut self, addr: u32, len: usize) -> Option<&mut [u8]> {
        let region = self.region(addr, len)?;
        let offset = (addr - region.base) as usize;
        Some(unsafe { std::slice::from_raw_parts_mut(region.map.as_ptr().add(offset), len) })
    }

    /// Copy `data` into guest memory at `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is not inside one mapped region.
    pub fn load(&mut self, addr: u32, data: &[u8]) -> Result<(), MemoryError> {
        let dst = self
            .bytes_mut(addr, data.len())
            .ok_or(MemoryError::Unmapped { addr, len: data.len() })?;
        dst.copy_from_slice(data);
        Ok(())
    }

    /// Big-endian read of `size` bytes (1, 2, 4 or 8).
    #[must_use]
    pub fn read(&self, addr: u32, size: u32) -> Option<u64> {
        let bytes = self.bytes(addr, size as usize)?;
        Some(bytes.iter().fold(0, |acc, &b| (acc << 8) | u64::from(b)))
    }

    /// Big-endian write of the low `size` bytes of `value`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is not mapped.
    pub fn write(&mut self, addr: u32, size: u32, value: u64) -> Result<(), MemoryError> {
        let len = size as usize;
        let dst = self
            .bytes_mut(addr, len)
            .ok_or(MemoryError::Unmapped { addr, len })?;
        for (i, b) in dst.iter_mut().enumerate() {
            *b = (value >> (8 * (len - 1 - i))) as u8;
        }
        Ok(())
    }
}

impl Default for GuestMemory {
    fn default() -> Self {
        Self::new()
    }
}

// GuestMemory is Send but not Sync (contains raw pointer)
unsafe impl Send for GuestMemory {}

/// One byte per guest page: 1 when the page holds no translated code,
/// 0 when stores to it must notify the translator.
pub struct InvalidCode {
    flags: Box<[u8]>,
}

impl InvalidCode {
    #[must_use]
    pub fn new() -> Self {
        Self {
            flags: vec![1; GUEST_PAGES].into_boxed_slice(),
        }
    }

    /// Whether `page` is free of translated code.
    #[must_use]
    pub fn is_invalid(&self, page: u32) -> bool {
        self.flags[page as usize] != 0
    }

    /// Mark `page` as holding translated code.
    pub fn mark_compiled(&mut self, page: u32) {
        self.flags[page as usize] = 0;
    }

    /// Mark `page` as free of translated code.
    pub fn mark_invalid(&mut self, page: u32) {
        self.flags[page as usize] = 1;
    }

    /// Reset every page to "no code".
    pub fn reset(&mut self) {
        self.flags.fill(1);
    }

    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.flags.as_ptr()
    }
}

impl Default for InvalidCode {
    fn default() -> Self {
        Self::new()
    }
}
