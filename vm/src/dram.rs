use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus::Device;
use crate::VmError;

/// Errors raised while placing host data (kernel image, DTB) into RAM.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum MemoryError {
    #[error("Out-of-bounds memory access at offset {0:#x}")]
    OutOfBounds(u64),

    #[error("{what} of {len} bytes does not fit in {capacity} bytes of RAM")]
    ImageTooLarge {
        what: String,
        len: usize,
        capacity: usize,
    },

    #[error("device tree at {dtb_offset:#x} overlaps the kernel image ending at {kernel_end:#x}")]
    Overlap { kernel_end: u64, dtb_offset: u64 },

    #[error("malformed ELF image: {0}")]
    Elf(String),
}

/// Flat, zero-initialised RAM. Offsets are relative to `base`.
pub struct Dram {
    pub base: u32,
    pub data: Vec<u8>,
}

impl Dram {
    pub fn new(base: u32, size: usize) -> Self {
        Self {
            base,
            data: vec![0; size],
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    fn check_bounds(&self, offset: u64, size: usize) -> Result<usize, MemoryError> {
        let off = usize::try_from(offset).map_err(|_| MemoryError::OutOfBounds(offset))?;
        let end = off.checked_add(size).ok_or(MemoryError::OutOfBounds(offset))?;
        if end > self.data.len() {
            return Err(MemoryError::OutOfBounds(offset));
        }
        Ok(off)
    }

    /// Copy `data` into RAM starting at `offset`.
    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<(), MemoryError> {
        let off = self.check_bounds(offset, data.len())?;
        self.data[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn zero_range(&mut self, offset: u64, len: usize) -> Result<(), MemoryError> {
        let off = self.check_bounds(offset, len)?;
        self.data[off..off + len].fill(0);
        Ok(())
    }
}

impl Device for Dram {
    fn name(&self) -> &'static str {
        "RAM"
    }

    fn read_byte(&mut self, offset: u32) -> Result<u8, VmError> {
        self.data
            .get(offset as usize)
            .copied()
            .ok_or(VmError::UnmappedAddress(self.base.wrapping_add(offset)))
    }

    fn write_byte(&mut self, offset: u32, value: u8) -> Result<(), VmError> {
        let base = self.base;
        let slot = self
            .data
            .get_mut(offset as usize)
            .ok_or(VmError::UnmappedAddress(base.wrapping_add(offset)))?;
        *slot = value;
        Ok(())
    }
}
