//! Volatile access to memory-mapped peripheral registers

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use memmap2::{MmapMut, MmapOptions};

/// One page-aligned window of peripheral registers mapped from a device file.
///
/// The base pointer is captured once; the mapping is held only to keep the
/// window alive.
pub struct RegWindow {
    ptr: *mut u8,
    len: usize,
    _map: MmapMut,
}

// The window refers to device registers, not shared Rust state.
unsafe impl Send for RegWindow {}
unsafe impl Sync for RegWindow {}

impl RegWindow {
    /// Map `len` bytes of `dev` starting at physical offset `base`.
    pub fn map(dev: &Path, base: u64, len: usize) -> Result<Self> {
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(dev)
            .with_context(|| format!("Failed to open {}", dev.display()))?;

        let mut map = unsafe {
            MmapOptions::new()
                .offset(base)
                .len(len)
                .map_mut(&f)
                .with_context(|| format!("Failed to map {:#X} of {}", base, dev.display()))?
        };

        Ok(Self {
            ptr: map.as_mut_ptr(),
            len: map.len(),
            _map: map,
        })
    }

    /// Read a 32-bit register at byte offset `off`.
    #[inline(always)]
    pub fn read(&self, off: usize) -> u32 {
        debug_assert!(off + 4 <= self.len && off % 4 == 0);
        unsafe { self.ptr.add(off).cast::<u32>().read_volatile() }
    }

    /// Write a 32-bit register at byte offset `off`.
    #[inline(always)]
    pub fn write(&self, off: usize, val: u32) {
        debug_assert!(off + 4 <= self.len && off % 4 == 0);
        unsafe { self.ptr.add(off).cast::<u32>().write_volatile(val) }
    }
}
