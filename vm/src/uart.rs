use std::collections::VecDeque;

use crate::bus::Device;
use crate::VmError;

/// The 8250 exposes eight byte-wide registers.
pub const UART_SIZE: u32 = 8;

// Registers (offset)
const RBR: u32 = 0x00; // Receiver Buffer (Read)
const THR: u32 = 0x00; // Transmitter Holding (Write)
const IER: u32 = 0x01; // Interrupt Enable
const IIR: u32 = 0x02; // Interrupt Identity (Read)
const FCR: u32 = 0x02; // FIFO Control (Write)
const LCR: u32 = 0x03; // Line Control
const MCR: u32 = 0x04; // Modem Control
const LSR: u32 = 0x05; // Line Status
const MSR: u32 = 0x06; // Modem Status
const SCR: u32 = 0x07; // Scratch

const LCR_DLAB: u8 = 0x80;
const LSR_DATA_READY: u8 = 0x01;
const LSR_THR_EMPTY: u8 = 0x20;
const LSR_TX_IDLE: u8 = 0x40;
const IIR_NO_INTERRUPT: u8 = 0x01;

/// Minimal 8250 model. Transmission is instantaneous, so the transmitter is
/// always reported empty and idle. No interrupts are raised.
pub struct Uart {
    pub input: VecDeque<u8>,
    pub output: VecDeque<u8>,

    pub ier: u8,
    pub fcr: u8,
    pub lcr: u8,
    pub mcr: u8,
    pub scr: u8,

    // Divisor latch, visible at RBR/IER while LCR.DLAB is set
    pub dll: u8,
    pub dlm: u8,
}

impl Default for Uart {
    fn default() -> Self {
        Self::new()
    }
}

impl Uart {
    pub fn new() -> Self {
        Self {
            input: VecDeque::new(),
            output: VecDeque::new(),
            ier: 0x00,
            fcr: 0x00,
            lcr: 0x00,
            mcr: 0x00,
            scr: 0x00,
            dll: 0x00,
            dlm: 0x00,
        }
    }

    fn dlab(&self) -> bool {
        (self.lcr & LCR_DLAB) != 0
    }

    fn lsr(&self) -> u8 {
        let mut lsr = LSR_THR_EMPTY | LSR_TX_IDLE;
        if !self.input.is_empty() {
            lsr |= LSR_DATA_READY;
        }
        lsr
    }

    // Interface for the Host
    pub fn push_input(&mut self, byte: u8) {
        self.input.push_back(byte);
    }

    pub fn pop_output(&mut self) -> Option<u8> {
        self.output.pop_front()
    }
}

impl Device for Uart {
    fn name(&self) -> &'static str {
        "UART"
    }

    fn read_byte(&mut self, offset: u32) -> Result<u8, VmError> {
        let val = match offset {
            RBR if self.dlab() => self.dll,
            RBR => self.input.pop_front().unwrap_or(0),
            IER if self.dlab() => self.dlm,
            IER => self.ier,
            IIR => IIR_NO_INTERRUPT,
            LCR => self.lcr,
            MCR => self.mcr,
            LSR => self.lsr(),
            MSR => 0,
            SCR => self.scr,
            _ => 0,
        };
        log::trace!("[UART] Read at {offset:x}: {val:02x}");
        Ok(val)
    }

    fn write_byte(&mut self, offset: u32, val: u8) -> Result<(), VmError> {
        log::trace!("[UART] Write at {offset:x}: {val:02x}");
        match offset {
            THR if self.dlab() => self.dll = val,
            THR => self.output.push_back(val),
            IER if self.dlab() => self.dlm = val,
            IER => self.ier = val,
            FCR => {
                self.fcr = val;
                if (val & 0x02) != 0 {
                    self.input.clear();
                }
            }
            LCR => self.lcr = val,
            MCR => self.mcr = val,
            SCR => self.scr = val,
            // LSR and MSR are read-only
            _ => {}
        }
        Ok(())
    }
}
