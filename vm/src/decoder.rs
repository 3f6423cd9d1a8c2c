//! Bit-field extraction for the RV32 base instruction formats.
//!
//! Immediates are returned exactly as they sit in the instruction word
//! (reassembled, but not sign-extended). The execution engine decides per
//! instruction whether a field is signed, because some of them (CSR addresses,
//! shift amounts) are used unsigned.

pub const OPCODE_LOAD: u32 = 0x03;
pub const OPCODE_MISC_MEM: u32 = 0x0F;
pub const OPCODE_OP_IMM: u32 = 0x13;
pub const OPCODE_AUIPC: u32 = 0x17;
pub const OPCODE_STORE: u32 = 0x23;
pub const OPCODE_AMO: u32 = 0x2F;
pub const OPCODE_OP: u32 = 0x33;
pub const OPCODE_LUI: u32 = 0x37;
pub const OPCODE_BRANCH: u32 = 0x63;
pub const OPCODE_JALR: u32 = 0x67;
pub const OPCODE_JAL: u32 = 0x6F;
pub const OPCODE_SYSTEM: u32 = 0x73;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RType {
    pub rd: usize,
    pub funct3: u32,
    pub rs1: usize,
    pub rs2: usize,
    pub funct7: u32,
}

/// R-type layout used by the A extension. The aq/rl ordering bits are
/// dropped since a single hart never reorders memory accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomicType {
    pub rd: usize,
    pub funct3: u32,
    pub rs1: usize,
    pub rs2: usize,
    pub funct5: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IType {
    pub rd: usize,
    pub funct3: u32,
    pub rs1: usize,
    /// instruction[31:20], 12 bits, unsigned.
    pub imm: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SType {
    pub funct3: u32,
    pub rs1: usize,
    pub rs2: usize,
    /// 12-bit offset, unsigned.
    pub imm: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BType {
    pub funct3: u32,
    pub rs1: usize,
    pub rs2: usize,
    /// 13-bit offset with bit 0 always clear, unsigned.
    pub imm: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UType {
    pub rd: usize,
    /// instruction[31:12] already in place, low 12 bits zero.
    pub imm: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JType {
    pub rd: usize,
    /// 21-bit offset with bit 0 always clear, unsigned.
    pub imm: u32,
}

/// Primary dispatch result. Secondary dispatch on funct3/funct7/funct5 is left
/// to the execution engine, which owns the policy for unknown combinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Lui(UType),
    Auipc(UType),
    Jal(JType),
    Jalr(IType),
    Branch(BType),
    Load(IType),
    Store(SType),
    OpImm(IType),
    Op(RType),
    Amo(AtomicType),
    System(IType),
    Fence,
}

#[inline]
pub fn opcode(insn: u32) -> u32 {
    insn & 0x7F
}

#[inline]
fn rd(insn: u32) -> usize {
    ((insn >> 7) & 0x1F) as usize
}

#[inline]
fn funct3(insn: u32) -> u32 {
    (insn >> 12) & 0x7
}

#[inline]
fn rs1(insn: u32) -> usize {
    ((insn >> 15) & 0x1F) as usize
}

#[inline]
fn rs2(insn: u32) -> usize {
    ((insn >> 20) & 0x1F) as usize
}

pub fn decode_r(insn: u32) -> RType {
    RType {
        rd: rd(insn),
        funct3: funct3(insn),
        rs1: rs1(insn),
        rs2: rs2(insn),
        funct7: (insn >> 25) & 0x7F,
    }
}

pub fn decode_atomic(insn: u32) -> AtomicType {
    AtomicType {
        rd: rd(insn),
        funct3: funct3(insn),
        rs1: rs1(insn),
        rs2: rs2(insn),
        funct5: (insn >> 27) & 0x1F,
    }
}

pub fn decode_i(insn: u32) -> IType {
    IType {
        rd: rd(insn),
        funct3: funct3(insn),
        rs1: rs1(insn),
        imm: (insn >> 20) & 0xFFF,
    }
}

pub fn decode_s(insn: u32) -> SType {
    let imm11_5 = (insn >> 25) & 0x7F;
    let imm4_0 = (insn >> 7) & 0x1F;
    SType {
        funct3: funct3(insn),
        rs1: rs1(insn),
        rs2: rs2(insn),
        imm: (imm11_5 << 5) | imm4_0,
    }
}

// B-type: imm[12|10:5] in bits 31:25, imm[4:1|11] in bits 11:7
pub fn decode_b(insn: u32) -> BType {
    let bit12 = (insn >> 31) & 1;
    let bit11 = (insn >> 7) & 1;
    let bits10_5 = (insn >> 25) & 0x3F;
    let bits4_1 = (insn >> 8) & 0xF;
    BType {
        funct3: funct3(insn),
        rs1: rs1(insn),
        rs2: rs2(insn),
        imm: (bit12 << 12) | (bit11 << 11) | (bits10_5 << 5) | (bits4_1 << 1),
    }
}

pub fn decode_u(insn: u32) -> UType {
    UType {
        rd: rd(insn),
        imm: insn & 0xFFFF_F000,
    }
}

// J-type: imm[20|10:1|11|19:12] in bits 31:12
pub fn decode_j(insn: u32) -> JType {
    let bit20 = (insn >> 31) & 1;
    let bits19_12 = (insn >> 12) & 0xFF;
    let bit11 = (insn >> 20) & 1;
    let bits10_1 = (insn >> 21) & 0x3FF;
    JType {
        rd: rd(insn),
        imm: (bit20 << 20) | (bits19_12 << 12) | (bit11 << 11) | (bits10_1 << 1),
    }
}

/// Returns `None` for opcodes outside RV32IMA + Zicsr.
pub fn decode(insn: u32) -> Option<Op> {
    let op = match opcode(insn) {
        OPCODE_LUI => Op::Lui(decode_u(insn)),
        OPCODE_AUIPC => Op::Auipc(decode_u(insn)),
        OPCODE_JAL => Op::Jal(decode_j(insn)),
        OPCODE_JALR => Op::Jalr(decode_i(insn)),
        OPCODE_BRANCH => Op::Branch(decode_b(insn)),
        OPCODE_LOAD => Op::Load(decode_i(insn)),
        OPCODE_STORE => Op::Store(decode_s(insn)),
        OPCODE_OP_IMM => Op::OpImm(decode_i(insn)),
        OPCODE_OP => Op::Op(decode_r(insn)),
        OPCODE_AMO => Op::Amo(decode_atomic(insn)),
        OPCODE_SYSTEM => Op::System(decode_i(insn)),
        OPCODE_MISC_MEM => Op::Fence,
        _ => return None,
    };
    Some(op)
}

/// Interpret the low `bits` bits of `value` as a two's-complement number.
///
/// When the field's sign bit is set the result is `field - 2^bits`.
#[inline]
pub fn sign_extend(value: u32, bits: u32) -> i32 {
    debug_assert!(bits > 0 && bits <= 32);
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

#[inline]
pub fn sign_extend_12(value: u32) -> i32 {
    sign_extend(value, 12)
}

#[inline]
pub fn sign_extend_13(value: u32) -> i32 {
    sign_extend(value, 13)
}

#[inline]
pub fn sign_extend_20(value: u32) -> i32 {
    sign_extend(value, 20)
}

#[inline]
pub fn sign_extend_21(value: u32) -> i32 {
    sign_extend(value, 21)
}

/// Full-width 32-bit two's-complement view of a register value.
#[inline]
pub fn as_signed(value: u32) -> i32 {
    value as i32
}
