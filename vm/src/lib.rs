pub mod bus;
pub mod clint;
pub mod config;
pub mod console;
pub mod cpu;
pub mod csr;
pub mod decoder;
pub mod dram;
pub mod emulator;
pub mod loader;
pub mod registers;
pub mod symbols;
pub mod trace;
pub mod uart;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dram::MemoryError;

/// Fatal conditions that terminate an emulation run.
///
/// The core never retries or masks these. They are propagated with `?` up to
/// the fetch-execute loop and inspected once by the host.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum VmError {
    #[error("unimplemented instruction 0x{insn:08x} at pc 0x{pc:08x}")]
    UnimplementedInstruction { insn: u32, pc: u32 },

    #[error("unknown CSR 0x{csr:03x} accessed at pc 0x{pc:08x}")]
    UnknownCsr { csr: u16, pc: u32 },

    #[error("access to unmapped address 0x{0:08x}")]
    UnmappedAddress(u32),

    #[error("privilege mode {0} is out of range (only 0-3 exist)")]
    InvalidPrivilege(u32),

    #[error("{device}: unimplemented register at offset 0x{offset:x}")]
    UnknownDeviceRegister { device: String, offset: u32 },

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("invalid machine configuration: {0}")]
    InvalidConfig(String),
}
