use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::registers::RegisterFile;
use crate::trace::TraceSink;
use crate::VmError;

/// RISC-V privilege levels, encoded as in mstatus.MPP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    User,
    Supervisor,
    /// Encoding 2 has no assigned level but fits the 2-bit field.
    Reserved,
    Machine,
}

impl Mode {
    pub fn bits(self) -> u32 {
        match self {
            Mode::User => 0b00,
            Mode::Supervisor => 0b01,
            Mode::Reserved => 0b10,
            Mode::Machine => 0b11,
        }
    }

    pub fn from_bits(bits: u32) -> Result<Mode, VmError> {
        match bits {
            0b00 => Ok(Mode::User),
            0b01 => Ok(Mode::Supervisor),
            0b10 => Ok(Mode::Reserved),
            0b11 => Ok(Mode::Machine),
            _ => Err(VmError::InvalidPrivilege(bits)),
        }
    }
}

// CSR addresses
pub const CSR_HVC0: u16 = 0x139;
pub const CSR_SSCRATCH: u16 = 0x140;
pub const CSR_MSTATUS: u16 = 0x300;
pub const CSR_MIE: u16 = 0x304;
pub const CSR_MTVEC: u16 = 0x305;
pub const CSR_MSCRATCH: u16 = 0x340;
pub const CSR_MEPC: u16 = 0x341;
pub const CSR_MCAUSE: u16 = 0x342;
pub const CSR_MTVAL: u16 = 0x343;
pub const CSR_MIP: u16 = 0x344;
pub const CSR_PMPCFG0: u16 = 0x3A0;
pub const CSR_PMPADDR0: u16 = 0x3B0;
pub const CSR_MVENDORID: u16 = 0xF11;
pub const CSR_MARCHID: u16 = 0xF12;
pub const CSR_MIMPID: u16 = 0xF13;
pub const CSR_MHARTID: u16 = 0xF14;

pub const MVENDORID_VALUE: u32 = 0xFF0F_F0FF;

// mstatus fields
pub const MSTATUS_MIE: u32 = 1 << 3;
pub const MSTATUS_MPIE: u32 = 1 << 7;
pub const MSTATUS_MPP_SHIFT: u32 = 11;
pub const MSTATUS_MPP: u32 = 0b11 << MSTATUS_MPP_SHIFT;

// mip/mie bits
pub const MIP_MSIP: u32 = 1 << 3;
pub const MIP_MTIP: u32 = 1 << 7;
pub const MIP_MEIP: u32 = 1 << 11;

/// Top bit of mcause: set for interrupts, clear for exceptions.
pub const INTERRUPT_FLAG: u32 = 0x8000_0000;
pub const CAUSE_MACHINE_TIMER_INTERRUPT: u32 = INTERRUPT_FLAG | 7;

/// Storage behind a CSR address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrField {
    Hvc0Console,
    Sscratch,
    Mstatus,
    Mie,
    Mtvec,
    Mscratch,
    Mepc,
    Mcause,
    Mtval,
    Mip,
    /// Accepted and discarded, reads as zero.
    Ignored,
    /// Fixed value, writes are discarded.
    ReadOnly(u32),
}

#[derive(Debug, Clone, Copy)]
pub struct CsrDescriptor {
    pub addr: u16,
    pub name: &'static str,
    pub description: &'static str,
    pub field: CsrField,
}

const fn csr(addr: u16, name: &'static str, description: &'static str, field: CsrField) -> CsrDescriptor {
    CsrDescriptor {
        addr,
        name,
        description,
        field,
    }
}

/// Every CSR this hart implements. Anything else is fatal.
pub static CSR_TABLE: [CsrDescriptor; 16] = [
    csr(CSR_HVC0, "hvc0", "Hypervisor console", CsrField::Hvc0Console),
    csr(CSR_SSCRATCH, "sscratch", "Scratch register for supervisor trap handlers", CsrField::Sscratch),
    csr(CSR_MSTATUS, "mstatus", "Machine status register", CsrField::Mstatus),
    csr(CSR_MIE, "mie", "Machine interrupt enable", CsrField::Mie),
    csr(CSR_MTVEC, "mtvec", "Machine trap-handler base address", CsrField::Mtvec),
    csr(CSR_MSCRATCH, "mscratch", "Scratch register for machine trap handlers", CsrField::Mscratch),
    csr(CSR_MEPC, "mepc", "Machine exception program counter", CsrField::Mepc),
    csr(CSR_MCAUSE, "mcause", "Machine trap cause", CsrField::Mcause),
    csr(CSR_MTVAL, "mtval", "Machine bad address or instruction", CsrField::Mtval),
    csr(CSR_MIP, "mip", "Machine interrupt pending", CsrField::Mip),
    csr(CSR_PMPCFG0, "pmpcfg0", "Physical memory protection configuration", CsrField::Ignored),
    csr(CSR_PMPADDR0, "pmpaddr0", "Physical memory protection address register", CsrField::Ignored),
    csr(CSR_MVENDORID, "mvendorid", "Machine vendor ID", CsrField::ReadOnly(MVENDORID_VALUE)),
    csr(CSR_MARCHID, "marchid", "Machine architecture ID", CsrField::ReadOnly(0)),
    csr(CSR_MIMPID, "mimpid", "Machine implementation ID", CsrField::ReadOnly(0)),
    csr(CSR_MHARTID, "mhartid", "Hardware thread ID", CsrField::ReadOnly(0)),
];

pub fn lookup(addr: u16) -> Option<&'static CsrDescriptor> {
    CSR_TABLE.iter().find(|d| d.addr == addr)
}

/// Machine-mode CSR state together with the trap and interrupt controller.
///
/// mstatus is never stored as a word. It is packed from, and unpacked into,
/// the MIE/MPIE/MPP flags on every access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsrBank {
    pub mie: u32,
    pub mip: u32,
    pub mtvec: u32,
    pub mepc: u32,
    pub mcause: u32,
    pub mtval: u32,
    pub mscratch: u32,
    pub sscratch: u32,
    interrupts_enabled: bool,
    previous_interrupt_enable: bool,
    previous_privilege: Mode,
    privilege: Mode,
    #[serde(skip)]
    console: VecDeque<u8>,
}

impl Default for CsrBank {
    fn default() -> Self {
        Self::new()
    }
}

impl CsrBank {
    pub fn new() -> Self {
        Self {
            mie: 0,
            mip: 0,
            mtvec: 0,
            mepc: 0,
            mcause: 0,
            mtval: 0,
            mscratch: 0,
            sscratch: 0,
            interrupts_enabled: false,
            previous_interrupt_enable: false,
            previous_privilege: Mode::User,
            privilege: Mode::Machine,
            console: VecDeque::new(),
        }
    }

    pub fn privilege(&self) -> Mode {
        self.privilege
    }

    pub fn set_privilege(&mut self, bits: u32) -> Result<(), VmError> {
        self.privilege = Mode::from_bits(bits)?;
        Ok(())
    }

    pub fn previous_privilege(&self) -> Mode {
        self.previous_privilege
    }

    pub fn set_previous_privilege(&mut self, bits: u32) -> Result<(), VmError> {
        self.previous_privilege = Mode::from_bits(bits)?;
        Ok(())
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts_enabled
    }

    pub fn set_interrupts_enabled(&mut self, enabled: bool) {
        self.interrupts_enabled = enabled;
    }

    pub fn previous_interrupt_enable(&self) -> bool {
        self.previous_interrupt_enable
    }

    pub fn mstatus(&self) -> u32 {
        let mut value = self.previous_privilege.bits() << MSTATUS_MPP_SHIFT;
        if self.interrupts_enabled {
            value |= MSTATUS_MIE;
        }
        if self.previous_interrupt_enable {
            value |= MSTATUS_MPIE;
        }
        value
    }

    /// Apply only the mstatus fields that differ from the current value.
    pub fn set_mstatus(&mut self, value: u32) -> Result<(), VmError> {
        let changed = self.mstatus() ^ value;
        if changed & MSTATUS_MIE != 0 {
            self.interrupts_enabled = value & MSTATUS_MIE != 0;
        }
        if changed & MSTATUS_MPIE != 0 {
            self.previous_interrupt_enable = value & MSTATUS_MPIE != 0;
        }
        if changed & MSTATUS_MPP != 0 {
            self.set_previous_privilege((value & MSTATUS_MPP) >> MSTATUS_MPP_SHIFT)?;
        }
        Ok(())
    }

    pub fn read(&mut self, addr: u16, pc: u32, trace: &mut dyn TraceSink) -> Result<u32, VmError> {
        let desc = lookup(addr).ok_or(VmError::UnknownCsr { csr: addr, pc })?;
        let value = match desc.field {
            CsrField::Hvc0Console | CsrField::Ignored => 0,
            CsrField::Sscratch => self.sscratch,
            CsrField::Mstatus => self.mstatus(),
            CsrField::Mie => self.mie,
            CsrField::Mtvec => self.mtvec,
            CsrField::Mscratch => self.mscratch,
            CsrField::Mepc => self.mepc,
            CsrField::Mcause => self.mcause,
            CsrField::Mtval => self.mtval,
            CsrField::Mip => self.mip,
            CsrField::ReadOnly(v) => v,
        };
        trace.csr_register_accessed(format_args!(
            "Read  CSR[0x{:x}], old value = {:08x} (register '{}': {})",
            addr, value, desc.name, desc.description
        ));
        Ok(value)
    }

    pub fn write(&mut self, addr: u16, value: u32, pc: u32, trace: &mut dyn TraceSink) -> Result<(), VmError> {
        let desc = lookup(addr).ok_or(VmError::UnknownCsr { csr: addr, pc })?;
        match desc.field {
            CsrField::Hvc0Console => self.console.push_back(value as u8),
            CsrField::Sscratch => self.sscratch = value,
            CsrField::Mstatus => self.set_mstatus(value)?,
            CsrField::Mie => self.mie = value,
            CsrField::Mtvec => self.mtvec = value,
            CsrField::Mscratch => self.mscratch = value,
            CsrField::Mepc => self.mepc = value,
            CsrField::Mcause => self.mcause = value,
            CsrField::Mtval => self.mtval = value,
            CsrField::Mip => self.mip = value,
            CsrField::Ignored | CsrField::ReadOnly(_) => {}
        }
        trace.csr_register_accessed(format_args!(
            "Write CSR[0x{:x}], new value = {:08x} (register '{}': {})",
            addr, value, desc.name, desc.description
        ));
        Ok(())
    }

    /// Next byte written to the hvc0 console CSR, if any.
    pub fn pop_console_output(&mut self) -> Option<u8> {
        self.console.pop_front()
    }

    pub fn signal_timer_interrupt(&mut self) {
        self.mip |= MIP_MTIP;
    }

    pub fn clear_timer_interrupt(&mut self) {
        self.mip &= !MIP_MTIP;
    }

    /// Take a pending, enabled interrupt if the global enable allows it.
    /// Returns whether the PC was redirected to the trap vector.
    pub fn check_interrupts(&mut self, regs: &mut RegisterFile, trace: &mut dyn TraceSink) -> Result<bool, VmError> {
        let pending = self.mip & self.mie;
        if pending == 0 || !self.interrupts_enabled {
            return Ok(false);
        }
        // External, then software, then timer
        let bit = [MIP_MEIP, MIP_MSIP, MIP_MTIP]
            .into_iter()
            .find(|&mask| pending & mask != 0)
            .unwrap_or(pending);
        let code = bit.trailing_zeros();
        self.enter_trap(INTERRUPT_FLAG | code, regs, trace)?;
        Ok(true)
    }

    pub fn enter_trap(&mut self, cause: u32, regs: &mut RegisterFile, trace: &mut dyn TraceSink) -> Result<(), VmError> {
        self.previous_interrupt_enable = self.interrupts_enabled;
        self.set_previous_privilege(self.privilege.bits())?;
        self.set_privilege(Mode::Machine.bits())?;
        self.interrupts_enabled = false;
        self.mepc = regs.pc;
        self.mcause = cause;
        self.mtval = if cause & INTERRUPT_FLAG == 0 { regs.pc } else { 0 };
        regs.pc = self.mtvec;

        trace.csr_register_accessed(format_args!(
            "[CPU Control] Trap taken: mcause = {:08x}, mepc = {:08x}, jumping to {:08x}",
            cause, self.mepc, regs.pc
        ));
        Ok(())
    }

    pub fn return_from_trap(&mut self, regs: &mut RegisterFile, trace: &mut dyn TraceSink) -> Result<(), VmError> {
        regs.pc = self.mepc;
        self.interrupts_enabled = self.previous_interrupt_enable;
        let old = self.privilege;
        self.set_privilege(self.previous_privilege.bits())?;
        self.set_previous_privilege(old.bits())?;

        trace.csr_register_accessed(format_args!(
            "[CPU Control] Trap return to {:08x}, privilege {:?}",
            regs.pc, self.privilege
        ));
        Ok(())
    }
}
