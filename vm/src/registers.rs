use std::fmt;

/// ABI names, indexed by register number.
pub const ABI_NAMES: [&str; 32] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4",
    "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4",
    "t5", "t6",
];

pub const REG_A0: usize = 10;
pub const REG_A1: usize = 11;

/// Integer register bank, program counter and the LR/SC reservation slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterFile {
    regs: [u32; 32],
    pub pc: u32,
    /// Address reserved by the last LR.W, or `None`.
    pub reservation: Option<u32>,
}

impl RegisterFile {
    pub fn new(pc: u32) -> Self {
        Self {
            regs: [0; 32],
            pc,
            reservation: None,
        }
    }

    pub fn read(&self, reg: usize) -> u32 {
        if reg == 0 {
            0
        } else {
            self.regs[reg]
        }
    }

    pub fn write(&mut self, reg: usize, val: u32) {
        if reg != 0 {
            self.regs[reg] = val;
        }
    }

    /// Re-assert the hardwired zero after every retired instruction.
    pub fn zero_x0(&mut self) {
        self.regs[0] = 0;
    }

    pub fn values(&self) -> [u32; 32] {
        self.regs
    }
}

/// Four registers per line, `x05,t0 : 0000002a`.
impl fmt::Display for RegisterFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in 0..8 {
            for col in 0..4 {
                let i = row * 4 + col;
                write!(f, "x{:02},{:<4}: {:08x}   ", i, ABI_NAMES[i], self.read(i))?;
            }
            writeln!(f)?;
        }
        write!(f, "pc: {:08x}", self.pc)
    }
}
