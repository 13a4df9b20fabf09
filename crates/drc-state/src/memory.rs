//! Anonymous host mappings.
//!
//! Translated code lives in one [`ExecMemory`] region allocated at startup;
//! guest RAM regions use the same mapping helper without execute rights.

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};
use thiserror::Error;

/// Host page size assumed for mapping sizes.
pub const HOST_PAGE_SIZE: usize = 0x1000;

/// Memory allocation and access error.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("mmap failed: {0}")]
    MmapFailed(#[from] nix::Error),

    #[error("invalid memory size: {0:#x}")]
    InvalidSize(usize),

    #[error("guest range {addr:#010x}+{len:#x} is not mapped")]
    Unmapped { addr: u32, len: usize },

    #[error("guest region at {0:#010x} overlaps an existing region")]
    Overlap(u32),

    #[error("guest address {0:#010x} is not page aligned")]
    Misaligned(u32),
}

/// An owned anonymous mapping, unmapped on drop.
pub(crate) struct Mapping {
    ptr: NonNull<c_void>,
    size: usize,
}

impl Mapping {
    pub(crate) fn new(size: usize, prot: ProtFlags) -> Result<Self, MemoryError> {
        if size == 0 || size % HOST_PAGE_SIZE != 0 {
            return Err(MemoryError::InvalidSize(size));
        }
        let size_nz = NonZeroUsize::new(size).ok_or(MemoryError::InvalidSize(size))?;
        let ptr = unsafe {
            mmap_anonymous(None, size_nz, prot, MapFlags::MAP_PRIVATE | MapFlags::MAP_NORESERVE)?
        };
        Ok(Self { ptr, size })
    }

    pub(crate) const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr().cast::<u8>()
    }

    pub(crate) const fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr, self.size);
        }
    }
}

/// Readable, writable and executable region holding translated code.
///
/// The translator writes code through [`ExecMemory::as_mut_slice`] and
/// patches it in place while other translated code may jump into it, so
/// the region stays RWX for its whole lifetime.
pub struct ExecMemory {
    map: Mapping,
}

impl ExecMemory {
    /// Allocate `size` bytes of executable memory.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is zero or not page aligned, or if mmap fails.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        let map = Mapping::new(
            size,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
        )?;
        tracing::debug!(size, base = format_args!("{:p}", map.as_ptr()), "mapped code buffer");
        Ok(Self { map })
    }

    #[must_use]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.map.as_ptr()
    }

    /// Host address of the first byte.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.map.as_ptr() as u64
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.map.size()
    }

    #[must_use]
    pub const fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.map.as_ptr(), self.map.size()) }
    }

    pub const fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.map.as_ptr(), self.map.size()) }
    }
}

// ExecMemory is Send but not Sync (contains raw pointer)
unsafe impl Send for ExecMemory {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_memory_alloc() {
        let mut mem = ExecMemory::new(1 << 16).expect("allocation should succeed");
        assert_eq!(mem.size(), 1 << 16);
        assert_eq!(mem.base() % HOST_PAGE_SIZE as u64, 0);
        mem.as_mut_slice()[10] = 0xC3;
        assert_eq!(mem.as_slice()[10], 0xC3);
    }

    #[test]
    fn test_exec_memory_invalid_size() {
        assert!(matches!(ExecMemory::new(0), Err(MemoryError::InvalidSize(0))));
        assert!(matches!(ExecMemory::new(100), Err(MemoryError::InvalidSize(100))));
    }
}
