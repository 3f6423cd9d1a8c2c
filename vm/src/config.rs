//! Machine and trace configuration.
//!
//! These replace module-level constants: the host builds them (from CLI flags
//! or a JSON file) and hands them to [`crate::emulator::Emulator::new`].

use serde::{Deserialize, Serialize};

use crate::VmError;

pub const DEFAULT_RAM_BASE: u32 = 0x8000_0000;
pub const DEFAULT_RAM_SIZE: u32 = 64 * 1024 * 1024;
pub const DEFAULT_UART_BASE: u32 = 0x1000_0000;
pub const DEFAULT_CLINT_BASE: u32 = 0x1100_0000;
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 250_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    pub ram_base: u32,
    pub ram_size: u32,
    pub uart_base: u32,
    pub clint_base: u32,
    /// Stop after this many retired instructions.
    pub max_instructions: Option<u64>,
    /// Stop when this instruction number has retired.
    pub breakpoint_at: Option<u64>,
    /// Forward UART and hvc0 output to the host.
    pub tty_output: bool,
    /// Bytes queued into the UART receive FIFO before the first instruction.
    pub uart_input: String,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            ram_base: DEFAULT_RAM_BASE,
            ram_size: DEFAULT_RAM_SIZE,
            uart_base: DEFAULT_UART_BASE,
            clint_base: DEFAULT_CLINT_BASE,
            max_instructions: None,
            breakpoint_at: None,
            tty_output: true,
            uart_input: String::new(),
        }
    }
}

impl MachineConfig {
    /// `(name, base, size)` for each region, in lookup priority order.
    pub fn regions(&self) -> [(&'static str, u32, u32); 3] {
        [
            ("RAM", self.ram_base, self.ram_size),
            ("UART", self.uart_base, crate::uart::UART_SIZE),
            ("CLINT", self.clint_base, crate::clint::CLINT_SIZE),
        ]
    }

    pub fn validate(&self) -> Result<(), VmError> {
        if self.ram_size == 0 {
            return Err(VmError::InvalidConfig("RAM size must be non-zero".into()));
        }
        let regions = self.regions();
        for (name, base, size) in regions {
            if base.checked_add(size - 1).is_none() {
                return Err(VmError::InvalidConfig(format!(
                    "{name} region 0x{base:08x}+0x{size:x} wraps the 32-bit address space"
                )));
            }
        }
        for (i, (name_a, base_a, size_a)) in regions.iter().enumerate() {
            for (name_b, base_b, size_b) in regions.iter().skip(i + 1) {
                let end_a = *base_a as u64 + *size_a as u64;
                let end_b = *base_b as u64 + *size_b as u64;
                if (*base_a as u64) < end_b && (*base_b as u64) < end_a {
                    return Err(VmError::InvalidConfig(format!(
                        "{name_a} region overlaps {name_b} region"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// What the trace reporter prints for each retired instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ReportType {
    None,
    /// One line per instruction: number, PC, raw word, disassembly.
    Short,
    /// Full register dump before every instruction.
    Long,
    OnlyProgress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    pub report_type: ReportType,
    pub start_traceout_at: u64,
    /// Exclusive upper bound of the traceout window.
    pub stop_traceout_at: Option<u64>,
    pub print_csr_activity: bool,
    pub progress_interval: u64,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            report_type: ReportType::OnlyProgress,
            start_traceout_at: 0,
            stop_traceout_at: None,
            print_csr_activity: false,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

/// On-disk form accepted by `--config`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub machine: MachineConfig,
    pub trace: TraceConfig,
}

impl ConfigFile {
    pub fn from_json(text: &str) -> Result<Self, VmError> {
        serde_json::from_str(text).map_err(|e| VmError::InvalidConfig(e.to_string()))
    }
}
