use crate::clint::{Clint, CLINT_SIZE};
use crate::config::MachineConfig;
use crate::dram::Dram;
use crate::uart::{Uart, UART_SIZE};
use crate::VmError;

/// A memory-mapped region's backing: byte-granular access at an offset
/// relative to the region base.
pub trait Device {
    fn name(&self) -> &'static str;
    fn read_byte(&mut self, offset: u32) -> Result<u8, VmError>;
    fn write_byte(&mut self, offset: u32, value: u8) -> Result<(), VmError>;
}

/// Physical address space as seen by the hart.
///
/// Only the byte accessors are required. Wider accesses are always composed
/// from them in little-endian order, so devices never see multi-byte traffic.
pub trait Bus {
    fn read_byte(&mut self, addr: u32) -> Result<u8, VmError>;
    fn write_byte(&mut self, addr: u32, val: u8) -> Result<(), VmError>;

    fn read16(&mut self, addr: u32) -> Result<u16, VmError> {
        let lo = self.read_byte(addr)? as u16;
        let hi = self.read_byte(addr.wrapping_add(1))? as u16;
        Ok(lo | (hi << 8))
    }

    fn read32(&mut self, addr: u32) -> Result<u32, VmError> {
        let lo = self.read16(addr)? as u32;
        let hi = self.read16(addr.wrapping_add(2))? as u32;
        Ok(lo | (hi << 16))
    }

    fn write16(&mut self, addr: u32, val: u16) -> Result<(), VmError> {
        self.write_byte(addr, val as u8)?;
        self.write_byte(addr.wrapping_add(1), (val >> 8) as u8)
    }

    fn write32(&mut self, addr: u32, val: u32) -> Result<(), VmError> {
        self.write16(addr, val as u16)?;
        self.write16(addr.wrapping_add(2), (val >> 16) as u16)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Ram,
    Uart,
    Clint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub kind: RegionKind,
    pub base: u32,
    pub size: u32,
}

impl Region {
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && addr - self.base < self.size
    }
}

/// RAM, UART and CLINT behind a fixed region table.
pub struct SystemBus {
    regions: [Region; 3],
    pub dram: Dram,
    pub uart: Uart,
    pub clint: Clint,
}

impl SystemBus {
    pub fn new(config: &MachineConfig) -> Result<Self, VmError> {
        config.validate()?;
        Ok(Self {
            // Lookup order: RAM first, it takes nearly all traffic
            regions: [
                Region {
                    kind: RegionKind::Ram,
                    base: config.ram_base,
                    size: config.ram_size,
                },
                Region {
                    kind: RegionKind::Uart,
                    base: config.uart_base,
                    size: UART_SIZE,
                },
                Region {
                    kind: RegionKind::Clint,
                    base: config.clint_base,
                    size: CLINT_SIZE,
                },
            ],
            dram: Dram::new(config.ram_base, config.ram_size as usize),
            uart: Uart::new(),
            clint: Clint::new(),
        })
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn dram_base(&self) -> u32 {
        self.dram.base
    }

    pub fn dram_size(&self) -> usize {
        self.dram.size()
    }

    /// Resolve `addr` to its device and the offset within that device.
    fn route(&mut self, addr: u32) -> Result<(&mut dyn Device, u32), VmError> {
        let region = self
            .regions
            .iter()
            .find(|r| r.contains(addr))
            .copied()
            .ok_or(VmError::UnmappedAddress(addr))?;
        let offset = addr - region.base;
        let device: &mut dyn Device = match region.kind {
            RegionKind::Ram => &mut self.dram,
            RegionKind::Uart => &mut self.uart,
            RegionKind::Clint => &mut self.clint,
        };
        Ok((device, offset))
    }
}

impl Bus for SystemBus {
    fn read_byte(&mut self, addr: u32) -> Result<u8, VmError> {
        let (device, offset) = self.route(addr)?;
        device.read_byte(offset)
    }

    fn write_byte(&mut self, addr: u32, val: u8) -> Result<(), VmError> {
        let (device, offset) = self.route(addr)?;
        device.write_byte(offset, val)
    }
}
