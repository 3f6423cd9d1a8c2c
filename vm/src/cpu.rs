use crate::bus::Bus;
use crate::csr::CsrBank;
use crate::decoder::{
    self, sign_extend_12, sign_extend_13, sign_extend_21, AtomicType, BType, IType, Op, RType,
    SType,
};
use crate::registers::RegisterFile;
use crate::trace::TraceSink;
use crate::VmError;

const INSN_ECALL: u32 = 0x0000_0073;
const INSN_EBREAK: u32 = 0x0010_0073;
const INSN_WFI: u32 = 0x1050_0073;
const INSN_MRET: u32 = 0x3020_0073;

// A-extension operations (funct5)
const AMO_ADD: u32 = 0b00000;
const AMO_SWAP: u32 = 0b00001;
const AMO_LR: u32 = 0b00010;
const AMO_SC: u32 = 0b00011;
const AMO_XOR: u32 = 0b00100;
const AMO_OR: u32 = 0b01000;
const AMO_AND: u32 = 0b01100;
const AMO_MIN: u32 = 0b10000;
const AMO_MAX: u32 = 0b10100;
const AMO_MINU: u32 = 0b11000;
const AMO_MAXU: u32 = 0b11100;

/// The hart: integer state plus machine-mode CSRs.
pub struct Cpu {
    pub regs: RegisterFile,
    pub csrs: CsrBank,
}

impl Cpu {
    pub fn new(pc: u32) -> Self {
        Self {
            regs: RegisterFile::new(pc),
            csrs: CsrBank::new(),
        }
    }

    pub fn pc(&self) -> u32 {
        self.regs.pc
    }

    pub fn read_reg(&self, reg: usize) -> u32 {
        self.regs.read(reg)
    }

    pub fn write_reg(&mut self, reg: usize, val: u32) {
        self.regs.write(reg, val);
    }

    /// Fetch and execute one instruction, then advance the PC unless the
    /// instruction redirected it.
    pub fn step(
        &mut self,
        bus: &mut dyn Bus,
        instruction_no: u64,
        trace: &mut dyn TraceSink,
    ) -> Result<(), VmError> {
        let pc = self.regs.pc;
        let insn = bus.read32(pc)?;
        trace.one_step_retired(instruction_no, &self.regs, insn);

        let redirected = self.execute(bus, insn, trace)?;
        if !redirected {
            self.regs.pc = pc.wrapping_add(4);
        }
        self.regs.zero_x0();
        Ok(())
    }

    /// Perform one instruction's architectural effect. Returns `true` when the
    /// PC was redirected (taken branch, jump or trap return).
    pub fn execute(
        &mut self,
        bus: &mut dyn Bus,
        insn: u32,
        trace: &mut dyn TraceSink,
    ) -> Result<bool, VmError> {
        let pc = self.regs.pc;
        let op = decoder::decode(insn).ok_or(VmError::UnimplementedInstruction { insn, pc })?;

        match op {
            Op::Lui(u) => {
                self.regs.write(u.rd, u.imm);
                trace.instruction_retired(format_args!("lui x{}, 0x{:x}", u.rd, u.imm >> 12));
                Ok(false)
            }
            Op::Auipc(u) => {
                self.regs.write(u.rd, pc.wrapping_add(u.imm));
                trace.instruction_retired(format_args!("auipc x{}, 0x{:x}", u.rd, u.imm >> 12));
                Ok(false)
            }
            Op::Jal(j) => {
                let target = pc.wrapping_add(sign_extend_21(j.imm) as u32);
                self.regs.pc = target;
                // rd last
                self.regs.write(j.rd, pc.wrapping_add(4));
                trace.instruction_retired(format_args!("jal x{}, 0x{:08x}", j.rd, target));
                Ok(true)
            }
            Op::Jalr(i) => {
                if i.funct3 != 0 {
                    return Err(VmError::UnimplementedInstruction { insn, pc });
                }
                let offset = sign_extend_12(i.imm);
                let target = self.regs.read(i.rs1).wrapping_add(offset as u32) & !1;
                self.regs.pc = target;
                // rd may alias rs1, so it is written after the target is known
                self.regs.write(i.rd, pc.wrapping_add(4));
                trace.instruction_retired(format_args!("jalr x{}, {}(x{})", i.rd, offset, i.rs1));
                Ok(true)
            }
            Op::Branch(b) => self.exec_branch(b, insn, trace),
            Op::Load(i) => self.exec_load(bus, i, insn, trace),
            Op::Store(s) => self.exec_store(bus, s, insn, trace),
            Op::OpImm(i) => self.exec_op_imm(i, insn, trace),
            Op::Op(r) => self.exec_op(r, insn, trace),
            Op::Amo(a) => self.exec_amo(bus, a, insn, trace),
            Op::System(i) => self.exec_system(i, insn, trace),
            Op::Fence => {
                trace.instruction_retired(format_args!("fence"));
                Ok(false)
            }
        }
    }

    fn exec_branch(&mut self, b: BType, insn: u32, trace: &mut dyn TraceSink) -> Result<bool, VmError> {
        let pc = self.regs.pc;
        let val1 = self.regs.read(b.rs1);
        let val2 = self.regs.read(b.rs2);
        let (name, taken) = match b.funct3 {
            0 => ("beq", val1 == val2),
            1 => ("bne", val1 != val2),
            4 => ("blt", (val1 as i32) < (val2 as i32)),
            5 => ("bge", (val1 as i32) >= (val2 as i32)),
            6 => ("bltu", val1 < val2),
            7 => ("bgeu", val1 >= val2),
            _ => return Err(VmError::UnimplementedInstruction { insn, pc }),
        };
        let target = pc.wrapping_add(sign_extend_13(b.imm) as u32);
        if taken {
            self.regs.pc = target;
        }
        trace.instruction_retired(format_args!(
            "{} x{}, x{}, 0x{:08x} ({})",
            name,
            b.rs1,
            b.rs2,
            target,
            if taken { "taken" } else { "not taken" }
        ));
        Ok(taken)
    }

    fn exec_load(
        &mut self,
        bus: &mut dyn Bus,
        i: IType,
        insn: u32,
        trace: &mut dyn TraceSink,
    ) -> Result<bool, VmError> {
        let pc = self.regs.pc;
        let offset = sign_extend_12(i.imm);
        let addr = self.regs.read(i.rs1).wrapping_add(offset as u32);
        let (name, val) = match i.funct3 {
            0 => ("lb", bus.read_byte(addr)? as i8 as i32 as u32),
            1 => ("lh", bus.read16(addr)? as i16 as i32 as u32),
            2 => ("lw", bus.read32(addr)?),
            4 => ("lbu", bus.read_byte(addr)? as u32),
            5 => ("lhu", bus.read16(addr)? as u32),
            _ => return Err(VmError::UnimplementedInstruction { insn, pc }),
        };
        self.regs.write(i.rd, val);
        trace.instruction_retired(format_args!(
            "{} x{}, {}(x{})  [0x{:08x}] = {:08x}",
            name, i.rd, offset, i.rs1, addr, val
        ));
        Ok(false)
    }

    fn exec_store(
        &mut self,
        bus: &mut dyn Bus,
        s: SType,
        insn: u32,
        trace: &mut dyn TraceSink,
    ) -> Result<bool, VmError> {
        let pc = self.regs.pc;
        let offset = sign_extend_12(s.imm);
        let addr = self.regs.read(s.rs1).wrapping_add(offset as u32);
        let val = self.regs.read(s.rs2);
        let name = match s.funct3 {
            0 => {
                bus.write_byte(addr, val as u8)?;
                "sb"
            }
            1 => {
                bus.write16(addr, val as u16)?;
                "sh"
            }
            2 => {
                bus.write32(addr, val)?;
                "sw"
            }
            _ => return Err(VmError::UnimplementedInstruction { insn, pc }),
        };
        // A plain store to the reserved word breaks the LR/SC pair
        if self.regs.reservation == Some(addr & !3) {
            self.regs.reservation = None;
        }
        trace.instruction_retired(format_args!(
            "{} x{}, {}(x{})  [0x{:08x}] = {:08x}",
            name, s.rs2, offset, s.rs1, addr, val
        ));
        Ok(false)
    }

    fn exec_op_imm(&mut self, i: IType, insn: u32, trace: &mut dyn TraceSink) -> Result<bool, VmError> {
        let pc = self.regs.pc;
        let unimplemented = VmError::UnimplementedInstruction { insn, pc };
        let val1 = self.regs.read(i.rs1);
        let imm = sign_extend_12(i.imm);
        let shamt = i.imm & 0x1F;
        let upper = i.imm >> 5;

        let (name, res) = match i.funct3 {
            0 => ("addi", val1.wrapping_add(imm as u32)),
            2 => ("slti", ((val1 as i32) < imm) as u32),
            3 => ("sltiu", (val1 < imm as u32) as u32),
            4 => ("xori", val1 ^ imm as u32),
            6 => ("ori", val1 | imm as u32),
            7 => ("andi", val1 & imm as u32),
            1 if upper == 0x00 => ("slli", val1 << shamt),
            5 if upper == 0x00 => ("srli", val1 >> shamt),
            5 if upper == 0x20 => ("srai", ((val1 as i32) >> shamt) as u32),
            _ => return Err(unimplemented),
        };
        self.regs.write(i.rd, res);
        match i.funct3 {
            1 | 5 => trace.instruction_retired(format_args!("{} x{}, x{}, {}", name, i.rd, i.rs1, shamt)),
            _ => trace.instruction_retired(format_args!("{} x{}, x{}, {}", name, i.rd, i.rs1, imm)),
        }
        Ok(false)
    }

    fn exec_op(&mut self, r: RType, insn: u32, trace: &mut dyn TraceSink) -> Result<bool, VmError> {
        let pc = self.regs.pc;
        let val1 = self.regs.read(r.rs1);
        let val2 = self.regs.read(r.rs2);
        let shamt = val2 & 0x1F;

        let (name, res) = match (r.funct7, r.funct3) {
            (0x00, 0) => ("add", val1.wrapping_add(val2)),
            (0x20, 0) => ("sub", val1.wrapping_sub(val2)),
            (0x00, 1) => ("sll", val1 << shamt),
            (0x00, 2) => ("slt", ((val1 as i32) < (val2 as i32)) as u32),
            (0x00, 3) => ("sltu", (val1 < val2) as u32),
            (0x00, 4) => ("xor", val1 ^ val2),
            (0x00, 5) => ("srl", val1 >> shamt),
            (0x20, 5) => ("sra", ((val1 as i32) >> shamt) as u32),
            (0x00, 6) => ("or", val1 | val2),
            (0x00, 7) => ("and", val1 & val2),
            // M extension
            (0x01, 0) => ("mul", val1.wrapping_mul(val2)),
            (0x01, 1) => {
                let prod = (val1 as i32 as i64) * (val2 as i32 as i64);
                ("mulh", (prod >> 32) as u32)
            }
            (0x01, 2) => {
                let prod = (val1 as i32 as i64).wrapping_mul(val2 as i64);
                ("mulhsu", (prod >> 32) as u32)
            }
            (0x01, 3) => {
                let prod = (val1 as u64) * (val2 as u64);
                ("mulhu", (prod >> 32) as u32)
            }
            (0x01, 4) => {
                let a = val1 as i32;
                let b = val2 as i32;
                let q = if b == 0 {
                    -1
                } else {
                    // i32::MIN / -1 wraps to i32::MIN
                    a.wrapping_div(b)
                };
                ("div", q as u32)
            }
            (0x01, 5) => ("divu", val1.checked_div(val2).unwrap_or(u32::MAX)),
            (0x01, 6) => {
                let a = val1 as i32;
                let b = val2 as i32;
                let r = if b == 0 { a } else { a.wrapping_rem(b) };
                ("rem", r as u32)
            }
            (0x01, 7) => ("remu", val1.checked_rem(val2).unwrap_or(val1)),
            _ => return Err(VmError::UnimplementedInstruction { insn, pc }),
        };
        self.regs.write(r.rd, res);
        trace.instruction_retired(format_args!("{} x{}, x{}, x{}", name, r.rd, r.rs1, r.rs2));
        Ok(false)
    }

    fn exec_amo(
        &mut self,
        bus: &mut dyn Bus,
        a: AtomicType,
        insn: u32,
        trace: &mut dyn TraceSink,
    ) -> Result<bool, VmError> {
        let pc = self.regs.pc;
        if a.funct3 != 2 {
            return Err(VmError::UnimplementedInstruction { insn, pc });
        }
        let addr = self.regs.read(a.rs1);
        let src = self.regs.read(a.rs2);

        match a.funct5 {
            AMO_LR => {
                let val = bus.read32(addr)?;
                self.regs.reservation = Some(addr);
                self.regs.write(a.rd, val);
                trace.instruction_retired(format_args!("lr.w x{}, (x{})  [0x{:08x}]", a.rd, a.rs1, addr));
            }
            AMO_SC => {
                let success = self.regs.reservation == Some(addr);
                if success {
                    bus.write32(addr, src)?;
                }
                self.regs.reservation = None;
                self.regs.write(a.rd, if success { 0 } else { 1 });
                trace.instruction_retired(format_args!(
                    "sc.w x{}, x{}, (x{})  [0x{:08x}] {}",
                    a.rd,
                    a.rs2,
                    a.rs1,
                    addr,
                    if success { "stored" } else { "failed" }
                ));
            }
            op => {
                let (name, combine): (&str, fn(u32, u32) -> u32) = match op {
                    AMO_SWAP => ("amoswap.w", |_: u32, src: u32| src),
                    AMO_ADD => ("amoadd.w", |old: u32, src: u32| old.wrapping_add(src)),
                    AMO_XOR => ("amoxor.w", |old: u32, src: u32| old ^ src),
                    AMO_AND => ("amoand.w", |old: u32, src: u32| old & src),
                    AMO_OR => ("amoor.w", |old: u32, src: u32| old | src),
                    AMO_MIN => ("amomin.w", |old: u32, src: u32| (old as i32).min(src as i32) as u32),
                    AMO_MAX => ("amomax.w", |old: u32, src: u32| (old as i32).max(src as i32) as u32),
                    AMO_MINU => ("amominu.w", |old: u32, src: u32| old.min(src)),
                    AMO_MAXU => ("amomaxu.w", |old: u32, src: u32| old.max(src)),
                    _ => return Err(VmError::UnimplementedInstruction { insn, pc }),
                };
                let old = bus.read32(addr)?;
                let new = combine(old, src);
                bus.write32(addr, new)?;
                if self.regs.reservation == Some(addr) {
                    self.regs.reservation = None;
                }
                // rd receives the value memory held before the operation
                self.regs.write(a.rd, old);
                trace.instruction_retired(format_args!(
                    "{} x{}, x{}, (x{})  [0x{:08x}] {:08x} -> {:08x}",
                    name, a.rd, a.rs2, a.rs1, addr, old, new
                ));
            }
        }
        Ok(false)
    }

    fn exec_system(&mut self, i: IType, insn: u32, trace: &mut dyn TraceSink) -> Result<bool, VmError> {
        let pc = self.regs.pc;
        let csr = i.imm as u16;

        match i.funct3 {
            0 => match insn {
                INSN_ECALL => {
                    trace.instruction_retired(format_args!("ecall (ignored)"));
                    Ok(false)
                }
                INSN_EBREAK => {
                    trace.instruction_retired(format_args!("ebreak (ignored)"));
                    Ok(false)
                }
                INSN_WFI => {
                    trace.instruction_retired(format_args!("wfi"));
                    Ok(false)
                }
                INSN_MRET => {
                    self.csrs.return_from_trap(&mut self.regs, trace)?;
                    trace.instruction_retired(format_args!("mret -> 0x{:08x}", self.regs.pc));
                    Ok(true)
                }
                _ => Err(VmError::UnimplementedInstruction { insn, pc }),
            },
            // CSRRW / CSRRS / CSRRC take their operand from rs1
            1..=3 => {
                let operand = self.regs.read(i.rs1);
                let old = self.csrs.read(csr, pc, trace)?;
                let (name, new) = match i.funct3 {
                    1 => ("csrrw", Some(operand)),
                    2 => ("csrrs", (i.rs1 != 0).then_some(old | operand)),
                    _ => ("csrrc", (i.rs1 != 0).then_some(old & !operand)),
                };
                if let Some(new) = new {
                    self.csrs.write(csr, new, pc, trace)?;
                }
                self.regs.write(i.rd, old);
                trace.instruction_retired(format_args!("{} x{}, 0x{:03x}, x{}", name, i.rd, csr, i.rs1));
                Ok(false)
            }
            // Immediate forms reuse the rs1 field as a 5-bit unsigned value
            5..=7 => {
                let zimm = i.rs1 as u32;
                let old = self.csrs.read(csr, pc, trace)?;
                let (name, new) = match i.funct3 {
                    5 => ("csrrwi", Some(zimm)),
                    6 => ("csrrsi", (zimm != 0).then_some(old | zimm)),
                    _ => ("csrrci", (zimm != 0).then_some(old & !zimm)),
                };
                if let Some(new) = new {
                    self.csrs.write(csr, new, pc, trace)?;
                }
                self.regs.write(i.rd, old);
                trace.instruction_retired(format_args!("{} x{}, 0x{:03x}, {}", name, i.rd, csr, zimm));
                Ok(false)
            }
            _ => Err(VmError::UnimplementedInstruction { insn, pc }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SystemBus;
    use crate::config::MachineConfig;
    use crate::csr::{CSR_HVC0, CSR_MEPC, CSR_MSCRATCH, CSR_MSTATUS, MSTATUS_MIE, MSTATUS_MPIE};
    use crate::trace::NullSink;

    // --- Test helpers ----------------------------------------------------

    fn encode_i(imm: i32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
        (((imm as u32) & 0xFFF) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
    }

    fn encode_r(funct7: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
        (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
    }

    fn encode_s(imm: i32, rs2: u32, rs1: u32, funct3: u32, opcode: u32) -> u32 {
        let imm = imm as u32;
        let imm11_5 = (imm >> 5) & 0x7F;
        let imm4_0 = imm & 0x1F;
        (imm11_5 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (imm4_0 << 7) | opcode
    }

    fn encode_b(imm: i32, rs2: u32, rs1: u32, funct3: u32, opcode: u32) -> u32 {
        // imm is a signed byte offset, must be multiple of 2
        let imm = imm as u32;
        let imm12 = (imm >> 12) & 0x1;
        let imm10_5 = (imm >> 5) & 0x3F;
        let imm4_1 = (imm >> 1) & 0xF;
        let imm11 = (imm >> 11) & 0x1;

        (imm12 << 31)
            | (imm10_5 << 25)
            | (rs2 << 20)
            | (rs1 << 15)
            | (funct3 << 12)
            | (imm4_1 << 8)
            | (imm11 << 7)
            | opcode
    }

    fn encode_amo(funct5: u32, rs2: u32, rs1: u32, rd: u32) -> u32 {
        encode_r(funct5 << 2, rs2, rs1, 0x2, rd, 0x2F)
    }

    fn encode_csr(csr: u32, rs1_or_zimm: u32, funct3: u32, rd: u32) -> u32 {
        (csr << 20) | (rs1_or_zimm << 15) | (funct3 << 12) | (rd << 7) | 0x73
    }

    fn make_bus() -> SystemBus {
        let config = MachineConfig {
            ram_size: 1024 * 1024, // 1MB
            ..MachineConfig::default()
        };
        SystemBus::new(&config).unwrap()
    }

    fn step(cpu: &mut Cpu, bus: &mut SystemBus) -> Result<(), VmError> {
        cpu.step(bus, 0, &mut NullSink)
    }

    /// Place `insn` at the current PC and execute it.
    fn run_one(cpu: &mut Cpu, bus: &mut SystemBus, insn: u32) {
        bus.write32(cpu.pc(), insn).unwrap();
        step(cpu, bus).unwrap();
    }

    #[test]
    fn test_auipc_at_reset_vector() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(0x8000_0000);
        bus.write32(0x8000_0000, 0x0000_0297).unwrap(); // auipc x5, 0

        step(&mut cpu, &mut bus).unwrap();
        assert_eq!(cpu.read_reg(5), 0x8000_0000);
        assert_eq!(cpu.pc(), 0x8000_0004);
    }

    #[test]
    fn test_addi() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(0x8000_0000);

        // ADDI x1, x0, -1
        run_one(&mut cpu, &mut bus, encode_i(-1, 0, 0, 1, 0x13));
        assert_eq!(cpu.read_reg(1), 0xFFFF_FFFF);

        // ADDI x1, x1, -2048 wraps
        run_one(&mut cpu, &mut bus, encode_i(-2048, 1, 0, 1, 0x13));
        assert_eq!(cpu.read_reg(1), 0xFFFF_F7FF);

        // ADDI x2, x0, 2047
        run_one(&mut cpu, &mut bus, encode_i(2047, 0, 0, 2, 0x13));
        assert_eq!(cpu.read_reg(2), 2047);
        assert_eq!(cpu.pc(), 0x8000_000C);
    }

    #[test]
    fn test_lui() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(0x8000_0000);

        // LUI x2, 0x12345
        let insn = (0x12345 << 12) | (2 << 7) | 0x37;
        run_one(&mut cpu, &mut bus, insn);
        assert_eq!(cpu.read_reg(2), 0x1234_5000);

        // LUI x3, 0xFFFFF
        run_one(&mut cpu, &mut bus, 0xFFFF_F1B7);
        assert_eq!(cpu.read_reg(3), 0xFFFF_F000);
    }

    #[test]
    fn test_add_wraparound() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(0x8000_0000);
        cpu.write_reg(1, 0xFFFF_FFFF);
        cpu.write_reg(2, 1);

        run_one(&mut cpu, &mut bus, encode_r(0x00, 2, 1, 0, 3, 0x33)); // add x3, x1, x2
        assert_eq!(cpu.read_reg(3), 0);

        run_one(&mut cpu, &mut bus, encode_r(0x20, 2, 3, 0, 4, 0x33)); // sub x4, x3, x2
        assert_eq!(cpu.read_reg(4), 0xFFFF_FFFF);
    }

    #[test]
    fn test_shift_amount_uses_low_five_bits() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(0x8000_0000);
        cpu.write_reg(1, 0x8000_0004);
        cpu.write_reg(2, 0xFFFF_FFE1); // low 5 bits = 1

        run_one(&mut cpu, &mut bus, encode_r(0x00, 2, 1, 1, 3, 0x33)); // sll
        run_one(&mut cpu, &mut bus, encode_r(0x00, 2, 1, 5, 4, 0x33)); // srl
        run_one(&mut cpu, &mut bus, encode_r(0x20, 2, 1, 5, 5, 0x33)); // sra
        assert_eq!(cpu.read_reg(3), 0x0000_0008);
        assert_eq!(cpu.read_reg(4), 0x4000_0002);
        assert_eq!(cpu.read_reg(5), 0xC000_0002);
    }

    #[test]
    fn test_shift_immediates() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(0x8000_0000);
        cpu.write_reg(1, 0xF000_0000);

        run_one(&mut cpu, &mut bus, encode_i(4, 1, 5, 2, 0x13)); // srli x2, x1, 4
        run_one(&mut cpu, &mut bus, encode_i(0x400 | 4, 1, 5, 3, 0x13)); // srai x3, x1, 4
        run_one(&mut cpu, &mut bus, encode_i(31, 2, 1, 4, 0x13)); // slli x4, x2, 31
        assert_eq!(cpu.read_reg(2), 0x0F00_0000);
        assert_eq!(cpu.read_reg(3), 0xFF00_0000);
        assert_eq!(cpu.read_reg(4), 0);

        // imm[11:5] = 0x01 is neither SRLI nor SRAI
        let bad = encode_i(0x20 | 4, 1, 5, 3, 0x13);
        bus.write32(cpu.pc(), bad).unwrap();
        let pc = cpu.pc();
        assert_eq!(
            step(&mut cpu, &mut bus),
            Err(VmError::UnimplementedInstruction { insn: bad, pc })
        );
    }

    #[test]
    fn test_set_less_than() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(0x8000_0000);
        cpu.write_reg(1, 0xFFFF_FFFF); // -1

        run_one(&mut cpu, &mut bus, encode_i(1, 1, 2, 2, 0x13)); // slti x2, x1, 1
        run_one(&mut cpu, &mut bus, encode_i(1, 1, 3, 3, 0x13)); // sltiu x3, x1, 1
        run_one(&mut cpu, &mut bus, encode_i(-1, 0, 3, 4, 0x13)); // sltiu x4, x0, -1
        assert_eq!(cpu.read_reg(2), 1);
        assert_eq!(cpu.read_reg(3), 0);
        assert_eq!(cpu.read_reg(4), 1);
    }

    #[test]
    fn test_load_store() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(0x8000_0000);
        cpu.write_reg(1, 0xDEAD_BEEF);
        cpu.write_reg(2, 0x8000_0100);

        run_one(&mut cpu, &mut bus, encode_s(8, 1, 2, 2, 0x23)); // sw x1, 8(x2)
        assert_eq!(bus.read32(0x8000_0108).unwrap(), 0xDEAD_BEEF);

        run_one(&mut cpu, &mut bus, encode_s(-4, 1, 2, 1, 0x23)); // sh x1, -4(x2)
        run_one(&mut cpu, &mut bus, encode_s(-1, 1, 2, 0, 0x23)); // sb x1, -1(x2)
        assert_eq!(bus.read32(0x8000_00FC).unwrap(), 0xEF00_BEEF);

        run_one(&mut cpu, &mut bus, encode_i(8, 2, 2, 3, 0x03)); // lw x3, 8(x2)
        assert_eq!(cpu.read_reg(3), 0xDEAD_BEEF);
    }

    #[test]
    fn test_load_sign_and_zero_extension() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(0x8000_0000);
        bus.write32(0x8000_0200, 0x0000_80FF).unwrap();
        cpu.write_reg(1, 0x8000_0200);

        run_one(&mut cpu, &mut bus, encode_i(0, 1, 0, 2, 0x03)); // lb
        run_one(&mut cpu, &mut bus, encode_i(0, 1, 4, 3, 0x03)); // lbu
        run_one(&mut cpu, &mut bus, encode_i(0, 1, 1, 4, 0x03)); // lh
        run_one(&mut cpu, &mut bus, encode_i(0, 1, 5, 5, 0x03)); // lhu
        assert_eq!(cpu.read_reg(2), 0xFFFF_FFFF);
        assert_eq!(cpu.read_reg(3), 0x0000_00FF);
        assert_eq!(cpu.read_reg(4), 0xFFFF_80FF);
        assert_eq!(cpu.read_reg(5), 0x0000_80FF);
    }

    #[test]
    fn test_x0_invariant() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(0x8000_0000);
        bus.write32(0x8000_0100, 0xDEAD_BEEF).unwrap();
        cpu.write_reg(2, 0x8000_0100);

        run_one(&mut cpu, &mut bus, encode_i(5, 0, 0, 0, 0x13)); // addi x0, x0, 5
        run_one(&mut cpu, &mut bus, encode_i(0, 2, 2, 0, 0x03)); // lw x0, 0(x2)
        assert_eq!(cpu.read_reg(0), 0);
    }

    #[test]
    fn test_branch_taken_and_not_taken() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(0x8000_0000);

        // BEQ x1, x2, +8 (pc + 8 when taken)
        let beq_insn = encode_b(8, 2, 1, 0x0, 0x63);
        bus.write32(0x8000_0000, beq_insn).unwrap();

        // Taken: x1 == x2
        cpu.write_reg(1, 5);
        cpu.write_reg(2, 5);
        step(&mut cpu, &mut bus).unwrap();
        assert_eq!(cpu.pc(), 0x8000_0008);

        // Not taken: x1 != x2
        cpu.write_reg(1, 1);
        cpu.write_reg(2, 2);
        cpu.regs.pc = 0x8000_0000;
        step(&mut cpu, &mut bus).unwrap();
        assert_eq!(cpu.pc(), 0x8000_0004);
    }

    #[test]
    fn test_branch_signed_vs_unsigned() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(0x8000_0010);
        cpu.write_reg(1, 0xFFFF_FFFF); // -1
        cpu.write_reg(2, 1);

        // BLT x1, x2, -16: taken, -1 < 1
        run_one(&mut cpu, &mut bus, encode_b(-16, 2, 1, 0x4, 0x63));
        assert_eq!(cpu.pc(), 0x8000_0000);

        // BLTU x1, x2, +64: not taken, 0xFFFFFFFF > 1
        run_one(&mut cpu, &mut bus, encode_b(64, 2, 1, 0x6, 0x63));
        assert_eq!(cpu.pc(), 0x8000_0004);

        // BGEU x1, x2, +64: taken
        run_one(&mut cpu, &mut bus, encode_b(64, 2, 1, 0x7, 0x63));
        assert_eq!(cpu.pc(), 0x8000_0044);
    }

    #[test]
    fn test_jal() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(0x8000_0000);

        // JAL x1, +0x10
        let jal = (0x10 >> 1 << 21) | (1 << 7) | 0x6F;
        run_one(&mut cpu, &mut bus, jal);
        assert_eq!(cpu.pc(), 0x8000_0010);
        assert_eq!(cpu.read_reg(1), 0x8000_0004);

        // JAL x0, -16 back to start
        run_one(&mut cpu, &mut bus, 0xFF1F_F06F);
        assert_eq!(cpu.pc(), 0x8000_0000);
        assert_eq!(cpu.read_reg(0), 0);
    }

    #[test]
    fn test_jalr_link_register_aliases_base() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(0x8000_0000);
        cpu.write_reg(1, 0x8000_0101);

        // JALR x1, 3(x1): target uses the old x1, low bit cleared
        run_one(&mut cpu, &mut bus, encode_i(3, 1, 0, 1, 0x67));
        assert_eq!(cpu.pc(), 0x8000_0104);
        assert_eq!(cpu.read_reg(1), 0x8000_0004);
    }

    #[test]
    fn test_m_extension_mul_div_rem() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(0x8000_0000);
        let m = |funct3: u32| encode_r(0x01, 2, 1, funct3, 3, 0x33);

        let cases: [(u32, u32, u32, u32); 16] = [
            // (funct3, rs1, rs2, expected)
            (0, 3, 4, 12),
            (0, 0xFFFF_FFFF, 0xFFFF_FFFF, 1),
            (1, 0xFFFF_FFFF, 0xFFFF_FFFF, 0),          // mulh -1 * -1
            (1, 0x8000_0000, 2, 0xFFFF_FFFF),          // mulh MIN * 2
            (2, 0xFFFF_FFFF, 0xFFFF_FFFF, 0xFFFF_FFFF), // mulhsu -1 * 0xFFFFFFFF
            (3, 0xFFFF_FFFF, 0xFFFF_FFFF, 0xFFFF_FFFE), // mulhu
            (4, (-7i32) as u32, 2, (-3i32) as u32),
            (4, 5, 0, 0xFFFF_FFFF),                    // div by zero
            (4, 0x8000_0000, 0xFFFF_FFFF, 0x8000_0000), // overflow
            (5, 7, 2, 3),
            (5, 7, 0, 0xFFFF_FFFF),
            (6, (-7i32) as u32, 2, (-1i32) as u32),    // sign of dividend
            (6, 9, 0, 9),
            (6, 0x8000_0000, 0xFFFF_FFFF, 0),
            (7, 7, 3, 1),
            (7, 7, 0, 7),
        ];

        for (funct3, a, b, expected) in cases {
            cpu.write_reg(1, a);
            cpu.write_reg(2, b);
            run_one(&mut cpu, &mut bus, m(funct3));
            assert_eq!(cpu.read_reg(3), expected, "funct3={funct3} a={a:#x} b={b:#x}");
        }
    }

    #[test]
    fn test_zicsr_basic_csrs() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(0x8000_0000);
        let mscratch = CSR_MSCRATCH as u32;

        // CSRRWI x1, mscratch, 5
        run_one(&mut cpu, &mut bus, encode_csr(mscratch, 5, 0x5, 1));
        assert_eq!(cpu.read_reg(1), 0);
        assert_eq!(cpu.csrs.mscratch, 5);

        // CSRRSI x2, mscratch, 0xA
        run_one(&mut cpu, &mut bus, encode_csr(mscratch, 0xA, 0x6, 2));
        assert_eq!(cpu.read_reg(2), 5);
        assert_eq!(cpu.csrs.mscratch, 0xF);

        // CSRRCI x3, mscratch, 0x3
        run_one(&mut cpu, &mut bus, encode_csr(mscratch, 0x3, 0x7, 3));
        assert_eq!(cpu.read_reg(3), 0xF);
        assert_eq!(cpu.csrs.mscratch, 0xC);

        // CSRRW x4, mscratch, x4 swaps
        cpu.write_reg(4, 0x1234_5678);
        run_one(&mut cpu, &mut bus, encode_csr(mscratch, 4, 0x1, 4));
        assert_eq!(cpu.read_reg(4), 0xC);
        assert_eq!(cpu.csrs.mscratch, 0x1234_5678);

        // CSRRC x5, mscratch, x6
        cpu.write_reg(6, 0x0000_0078);
        run_one(&mut cpu, &mut bus, encode_csr(mscratch, 6, 0x3, 5));
        assert_eq!(cpu.read_reg(5), 0x1234_5678);
        assert_eq!(cpu.csrs.mscratch, 0x1234_5600);
    }

    #[test]
    fn test_csr_read_with_x0_source_does_not_write() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(0x8000_0000);

        // csrr x1, hvc0 is CSRRS x1, hvc0, x0 and must not emit a character
        run_one(&mut cpu, &mut bus, encode_csr(CSR_HVC0 as u32, 0, 0x2, 1));
        assert_eq!(cpu.csrs.pop_console_output(), None);

        // csrw hvc0, x7
        cpu.write_reg(7, u32::from(b'#'));
        run_one(&mut cpu, &mut bus, encode_csr(CSR_HVC0 as u32, 7, 0x1, 0));
        assert_eq!(cpu.csrs.pop_console_output(), Some(b'#'));
    }

    #[test]
    fn test_mstatus_via_csr_instructions() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(0x8000_0000);

        // csrsi mstatus, 8 sets MIE
        run_one(&mut cpu, &mut bus, encode_csr(CSR_MSTATUS as u32, 8, 0x6, 0));
        assert!(cpu.csrs.interrupts_enabled());
        // csrr x1, mstatus
        run_one(&mut cpu, &mut bus, encode_csr(CSR_MSTATUS as u32, 0, 0x2, 1));
        assert_eq!(cpu.read_reg(1), MSTATUS_MIE);
    }

    #[test]
    fn test_unknown_csr_is_fatal() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(0x8000_0000);
        bus.write32(0x8000_0000, encode_csr(0x180, 0, 0x2, 1)).unwrap(); // csrr x1, satp
        assert_eq!(
            step(&mut cpu, &mut bus),
            Err(VmError::UnknownCsr { csr: 0x180, pc: 0x8000_0000 })
        );
    }

    #[test]
    fn test_mret_returns_to_mepc() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(0x8000_0000);
        cpu.csrs.mepc = 0x8000_0400;
        cpu.csrs.set_mstatus(MSTATUS_MPIE | (3 << 11)).unwrap();

        run_one(&mut cpu, &mut bus, 0x3020_0073);
        assert_eq!(cpu.pc(), 0x8000_0400);
        assert!(cpu.csrs.interrupts_enabled());

        // csrr x2, mepc
        run_one(&mut cpu, &mut bus, encode_csr(CSR_MEPC as u32, 0, 0x2, 2));
        assert_eq!(cpu.read_reg(2), 0x8000_0400);
    }

    #[test]
    fn test_ecall_ebreak_fence_are_no_ops() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(0x8000_0000);
        run_one(&mut cpu, &mut bus, 0x0000_0073);
        run_one(&mut cpu, &mut bus, 0x0010_0073);
        run_one(&mut cpu, &mut bus, 0x0FF0_000F);
        run_one(&mut cpu, &mut bus, 0x1050_0073);
        assert_eq!(cpu.pc(), 0x8000_0010);
        assert_eq!(cpu.regs.values(), [0; 32]);
    }

    #[test]
    fn test_a_extension_lr_sc_basic() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(0x8000_0000);
        let addr = 0x8000_0200;
        bus.write32(addr, 0xDEAD_BEEF).unwrap();
        cpu.write_reg(1, addr);
        cpu.write_reg(2, 0x0123_4567);

        run_one(&mut cpu, &mut bus, encode_amo(AMO_LR, 0, 1, 3)); // lr.w x3, (x1)
        assert_eq!(cpu.read_reg(3), 0xDEAD_BEEF);
        assert_eq!(cpu.regs.reservation, Some(addr));

        run_one(&mut cpu, &mut bus, encode_amo(AMO_SC, 2, 1, 4)); // sc.w x4, x2, (x1)
        assert_eq!(cpu.read_reg(4), 0);
        assert_eq!(bus.read32(addr).unwrap(), 0x0123_4567);
        assert_eq!(cpu.regs.reservation, None);

        // A second SC without a new LR fails
        cpu.write_reg(2, 0x7777_7777);
        run_one(&mut cpu, &mut bus, encode_amo(AMO_SC, 2, 1, 4));
        assert_eq!(cpu.read_reg(4), 1);
        assert_eq!(bus.read32(addr).unwrap(), 0x0123_4567);
    }

    #[test]
    fn test_sc_to_other_address_fails() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(0x8000_0000);
        cpu.write_reg(1, 0x8000_0300);
        cpu.write_reg(5, 0x8000_0304);
        cpu.write_reg(2, 0xAAAA_AAAA);

        run_one(&mut cpu, &mut bus, encode_amo(AMO_LR, 0, 1, 3));
        run_one(&mut cpu, &mut bus, encode_amo(AMO_SC, 2, 5, 4)); // sc.w x4, x2, (x5)
        assert_eq!(cpu.read_reg(4), 1);
        assert_eq!(bus.read32(0x8000_0304).unwrap(), 0);
        assert_eq!(cpu.regs.reservation, None);
    }

    #[test]
    fn test_store_breaks_reservation() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(0x8000_0000);
        cpu.write_reg(1, 0x8000_0300);

        run_one(&mut cpu, &mut bus, encode_amo(AMO_LR, 0, 1, 3));
        run_one(&mut cpu, &mut bus, encode_s(0, 0, 1, 0, 0x23)); // sb x0, 0(x1)
        run_one(&mut cpu, &mut bus, encode_amo(AMO_SC, 2, 1, 4));
        assert_eq!(cpu.read_reg(4), 1);
    }

    #[test]
    fn test_amo_returns_old_value_when_rd_aliases_rs2() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(0x8000_0000);
        let addr = 0x8000_0400;
        bus.write32(addr, 10).unwrap();
        cpu.write_reg(1, addr);
        cpu.write_reg(2, 5);

        // amoadd.w x2, x2, (x1)
        run_one(&mut cpu, &mut bus, encode_amo(AMO_ADD, 2, 1, 2));
        assert_eq!(cpu.read_reg(2), 10);
        assert_eq!(bus.read32(addr).unwrap(), 15);

        // amoor.w x3, x4, (x1)
        cpu.write_reg(4, 0x100);
        run_one(&mut cpu, &mut bus, encode_amo(AMO_OR, 4, 1, 3));
        assert_eq!(cpu.read_reg(3), 15);
        assert_eq!(bus.read32(addr).unwrap(), 0x10F);

        // amoswap.w x5, x0, (x1)
        run_one(&mut cpu, &mut bus, encode_amo(AMO_SWAP, 0, 1, 5));
        assert_eq!(cpu.read_reg(5), 0x10F);
        assert_eq!(bus.read32(addr).unwrap(), 0);

        // amomin.w / amomaxu.w against -1
        cpu.write_reg(6, 0xFFFF_FFFF);
        run_one(&mut cpu, &mut bus, encode_amo(AMO_MIN, 6, 1, 0));
        assert_eq!(bus.read32(addr).unwrap(), 0xFFFF_FFFF);
        cpu.write_reg(6, 1);
        run_one(&mut cpu, &mut bus, encode_amo(AMO_MAXU, 6, 1, 0));
        assert_eq!(bus.read32(addr).unwrap(), 0xFFFF_FFFF);
    }

    #[test]
    fn test_unimplemented_encodings_are_fatal() {
        let bad = [
            0x0000_0007,                      // FLW
            encode_r(0x02, 2, 1, 0, 3, 0x33), // unknown funct7
            encode_b(8, 2, 1, 0x2, 0x63),     // branch funct3 2
            encode_i(0, 1, 3, 2, 0x03),       // LD
            encode_r(0x00, 2, 1, 3, 3, 0x2F), // AMO with D width
            encode_amo(0b00101, 2, 1, 3),     // unknown funct5
            0x0020_0073,                      // SYSTEM funct3 0 with unknown imm
            encode_csr(0x340, 1, 0x4, 1),     // SYSTEM funct3 4
        ];
        for insn in bad {
            let mut bus = make_bus();
            let mut cpu = Cpu::new(0x8000_0000);
            bus.write32(0x8000_0000, insn).unwrap();
            assert_eq!(
                step(&mut cpu, &mut bus),
                Err(VmError::UnimplementedInstruction { insn, pc: 0x8000_0000 }),
                "insn {insn:#010x}"
            );
        }
    }

    #[test]
    fn test_access_outside_regions_is_fatal() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(0x8000_0000);
        cpu.write_reg(1, 0x4000_0000);
        bus.write32(0x8000_0000, encode_i(0, 1, 2, 2, 0x03)).unwrap(); // lw x2, 0(x1)
        assert_eq!(
            step(&mut cpu, &mut bus),
            Err(VmError::UnmappedAddress(0x4000_0000))
        );

        let mut cpu = Cpu::new(0x0000_1000);
        assert_eq!(
            step(&mut cpu, &mut bus),
            Err(VmError::UnmappedAddress(0x0000_1000))
        );
    }

    #[test]
    fn test_smoke_sum() {
        let mut bus = make_bus();
        let mut cpu = Cpu::new(0x8000_0000);

        // Data at 0x8000_0100
        let data: [u32; 5] = [1, 2, 3, 4, 5];
        for (i, val) in data.iter().enumerate() {
            bus.write32(0x8000_0100 + (i * 4) as u32, *val).unwrap();
        }

        let prog = [
            0x00100093, // addi x1, x0, 1
            0x01F09093, // slli x1, x1, 31
            0x10008093, // addi x1, x1, 0x100 -> Base
            0x00500113, // addi x2, x0, 5 -> Count
            0x00000193, // addi x3, x0, 0 -> Sum
            // loop:
            0x0000A203, // lw x4, 0(x1)
            0x004181B3, // add x3, x3, x4
            0x00408093, // addi x1, x1, 4
            0xFFF10113, // addi x2, x2, -1
            0xFE0118E3, // bne x2, x0, loop (-16)
            0x00100073, // ebreak
        ];
        for (i, val) in prog.iter().enumerate() {
            bus.write32(0x8000_0000 + (i * 4) as u32, *val).unwrap();
        }

        let end = 0x8000_0000 + (prog.len() * 4) as u32;
        let mut steps = 0;
        while cpu.pc() != end {
            steps += 1;
            assert!(steps <= 1000, "Infinite loop");
            step(&mut cpu, &mut bus).unwrap();
        }

        assert_eq!(cpu.read_reg(3), 15);
    }
}
