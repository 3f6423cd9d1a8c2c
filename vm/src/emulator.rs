use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::bus::SystemBus;
use crate::config::MachineConfig;
use crate::cpu::Cpu;
use crate::csr::{CsrBank, Mode};
use crate::loader::{self, BootInfo};
use crate::trace::{NullSink, TraceSink};
use crate::VmError;

const SNAPSHOT_VERSION: &str = "1.0";

/// Why a run stopped without a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// The configured instruction limit was reached.
    InstructionLimit(u64),
    /// The configured breakpoint instruction number retired.
    Breakpoint(u64),
}

/// Fetch-execute driver: one hart, its bus, and the trace sink it reports to.
///
/// Every retired instruction advances the CLINT by one tick, refreshes the
/// timer-pending bit and gives the trap controller a chance to take an
/// interrupt, in that order.
pub struct Emulator {
    pub cpu: Cpu,
    pub bus: SystemBus,
    trace: Box<dyn TraceSink>,
    config: MachineConfig,
    instret: u64,
}

impl Emulator {
    /// Build a machine that discards all trace output.
    pub fn new(config: MachineConfig) -> Result<Self, VmError> {
        Self::with_trace(config, Box::new(NullSink))
    }

    pub fn with_trace(config: MachineConfig, trace: Box<dyn TraceSink>) -> Result<Self, VmError> {
        let mut bus = SystemBus::new(&config)?;
        for byte in config.uart_input.bytes() {
            bus.uart.push_input(byte);
        }
        let cpu = Cpu::new(config.ram_base);

        Ok(Self {
            cpu,
            bus,
            trace,
            config,
            instret: 0,
        })
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn instructions_retired(&self) -> u64 {
        self.instret
    }

    /// Place the kernel (and optional device tree) in RAM and set the boot
    /// registers.
    pub fn load(&mut self, kernel: &[u8], dtb: Option<&[u8]>) -> Result<BootInfo, VmError> {
        loader::boot(&mut self.cpu, &mut self.bus.dram, kernel, dtb)
    }

    /// Queue a host keystroke for the guest's UART receiver.
    pub fn push_key(&mut self, byte: u8) {
        self.bus.uart.push_input(byte);
    }

    /// Collect pending console output from the UART transmitter and the hvc0
    /// CSR. Output is discarded when TTY output is disabled.
    pub fn drain_output(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(b) = self.bus.uart.pop_output() {
            out.push(b);
        }
        while let Some(b) = self.cpu.csrs.pop_console_output() {
            out.push(b);
        }
        if !self.config.tty_output {
            out.clear();
        }
        out
    }

    /// Execute a single instruction, then run the per-instruction timer and
    /// interrupt check.
    pub fn step(&mut self) -> Result<(), VmError> {
        let instruction_no = self.instret + 1;
        self.cpu.step(&mut self.bus, instruction_no, self.trace.as_mut())?;
        self.instret = instruction_no;

        self.bus.clint.tick();
        if self.bus.clint.timer_expired() {
            self.cpu.csrs.signal_timer_interrupt();
        } else {
            self.cpu.csrs.clear_timer_interrupt();
        }
        self.cpu
            .csrs
            .check_interrupts(&mut self.cpu.regs, self.trace.as_mut())?;
        Ok(())
    }

    fn stop_reason(&self) -> Option<StopReason> {
        if self.config.max_instructions.is_some_and(|limit| self.instret >= limit) {
            return Some(StopReason::InstructionLimit(self.instret));
        }
        if self.config.breakpoint_at == Some(self.instret) {
            return Some(StopReason::Breakpoint(self.instret));
        }
        None
    }

    /// Run up to `budget` instructions.
    ///
    /// Returns `Ok(None)` when the budget is used up, so a host can service
    /// its console between batches. A reached instruction limit is sticky:
    /// later calls return it again without executing anything.
    pub fn run_for(&mut self, budget: u64) -> Result<Option<StopReason>, VmError> {
        if let Some(reason @ StopReason::InstructionLimit(_)) = self.stop_reason() {
            return Ok(Some(reason));
        }
        for _ in 0..budget {
            self.step()?;
            if let Some(reason) = self.stop_reason() {
                log::info!("Run stopped: {reason:?}");
                return Ok(Some(reason));
            }
        }
        Ok(None)
    }

    /// Capture the architectural state of the hart plus a digest of RAM.
    pub fn snapshot(&self) -> MachineState {
        let mut hasher = Sha256::new();
        hasher.update(&self.bus.dram.data);

        MachineState {
            version: SNAPSHOT_VERSION.to_string(),
            instructions_retired: self.instret,
            pc: self.cpu.pc(),
            regs: self.cpu.regs.values(),
            reservation: self.cpu.regs.reservation,
            privilege: self.cpu.csrs.privilege(),
            mstatus: self.cpu.csrs.mstatus(),
            csrs: self.cpu.csrs.clone(),
            clint: ClintState {
                msip: self.bus.clint.msip,
                mtime: self.bus.clint.mtime(),
                mtimecmp: self.bus.clint.mtimecmp,
            },
            memory: MemRegionState {
                base: self.bus.dram_base(),
                size: self.bus.dram_size() as u64,
                sha256: hex::encode(hasher.finalize()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClintState {
    pub msip: u32,
    pub mtime: u64,
    pub mtimecmp: u64,
}

/// RAM is summarised by its digest rather than copied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemRegionState {
    pub base: u32,
    pub size: u64,
    pub sha256: String,
}

/// Serializable view of the machine, written by `--dump-state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineState {
    pub version: String,
    pub instructions_retired: u64,
    pub pc: u32,
    pub regs: [u32; 32],
    pub reservation: Option<u32>,
    pub privilege: Mode,
    pub mstatus: u32,
    pub csrs: CsrBank,
    pub clint: ClintState,
    pub memory: MemRegionState,
}
