use crate::bus::Device;
use crate::VmError;

/// Large enough to cover mtime at 0xBFF8..0xBFFF.
pub const CLINT_SIZE: u32 = 0xC000;

pub const MSIP_OFFSET: u32 = 0x0000;
pub const MTIMECMP_OFFSET: u32 = 0x4000;
pub const MTIME_OFFSET: u32 = 0xBFF8;

/// Core-local interruptor for a single hart.
///
/// Time is not wall-clock: `mtime` is derived from the retired-instruction
/// counter, so a run is reproducible instruction for instruction.
pub struct Clint {
    pub msip: u32,
    pub mtimecmp: u64,
    retired: u64,
}

impl Default for Clint {
    fn default() -> Self {
        Self::new()
    }
}

impl Clint {
    pub fn new() -> Self {
        Self {
            msip: 0,
            mtimecmp: u64::MAX,
            retired: 0,
        }
    }

    /// Current mtime value: instructions retired so far, plus one.
    pub fn mtime(&self) -> u64 {
        self.retired.wrapping_add(1)
    }

    /// Advance by one retired instruction.
    pub fn tick(&mut self) {
        self.retired = self.retired.wrapping_add(1);
    }

    pub fn retired(&self) -> u64 {
        self.retired
    }

    pub fn timer_expired(&self) -> bool {
        self.mtime() >= self.mtimecmp
    }
}

fn byte_of(value: u64, index: u32) -> u8 {
    (value >> (index * 8)) as u8
}

fn with_byte(value: u64, index: u32, byte: u8) -> u64 {
    let shift = index * 8;
    (value & !(0xFFu64 << shift)) | ((byte as u64) << shift)
}

impl Device for Clint {
    fn name(&self) -> &'static str {
        "CLINT"
    }

    fn read_byte(&mut self, offset: u32) -> Result<u8, VmError> {
        log::trace!("[CLINT/TIMER] Read at {offset:x}");
        match offset {
            o if (MSIP_OFFSET..MSIP_OFFSET + 4).contains(&o) => {
                Ok(byte_of(self.msip as u64, o - MSIP_OFFSET))
            }
            o if (MTIMECMP_OFFSET..MTIMECMP_OFFSET + 8).contains(&o) => {
                Ok(byte_of(self.mtimecmp, o - MTIMECMP_OFFSET))
            }
            o if (MTIME_OFFSET..MTIME_OFFSET + 8).contains(&o) => {
                Ok(byte_of(self.mtime(), o - MTIME_OFFSET))
            }
            _ => Err(VmError::UnknownDeviceRegister {
                device: self.name().to_string(),
                offset,
            }),
        }
    }

    fn write_byte(&mut self, offset: u32, value: u8) -> Result<(), VmError> {
        log::trace!("[CLINT/TIMER] Write at {offset:x}: {value:02x}");
        match offset {
            o if (MSIP_OFFSET..MSIP_OFFSET + 4).contains(&o) => {
                self.msip = with_byte(self.msip as u64, o - MSIP_OFFSET, value) as u32;
                Ok(())
            }
            o if (MTIMECMP_OFFSET..MTIMECMP_OFFSET + 8).contains(&o) => {
                self.mtimecmp = with_byte(self.mtimecmp, o - MTIMECMP_OFFSET, value);
                Ok(())
            }
            // mtime follows the instruction counter and cannot be set
            o if (MTIME_OFFSET..MTIME_OFFSET + 8).contains(&o) => Ok(()),
            _ => Err(VmError::UnknownDeviceRegister {
                device: self.name().to_string(),
                offset,
            }),
        }
    }
}
