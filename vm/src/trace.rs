//! Observability hooks for the execution core.
//!
//! The core reports into a [`TraceSink`] after the fact and never looks at
//! what the sink does with it, so swapping sinks cannot change a run.

use std::fmt;
use std::io::Write;

use crate::config::{ReportType, TraceConfig};
use crate::registers::RegisterFile;
use crate::symbols::SymbolMap;

pub trait TraceSink {
    /// Called with the 1-based instruction number before it executes.
    fn one_step_retired(&mut self, _instruction_no: u64, _regs: &RegisterFile, _insn: u32) {}

    /// Disassembly-style description of the instruction just executed.
    fn instruction_retired(&mut self, _message: fmt::Arguments<'_>) {}

    fn csr_register_accessed(&mut self, _message: fmt::Arguments<'_>) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TraceSink for NullSink {}

/// Text reporter with the short/long/progress report styles.
pub struct Reporter<W: Write> {
    out: W,
    config: TraceConfig,
    symbols: Option<SymbolMap>,
    instruction_no: u64,
    last_progress_at: u64,
    in_window: bool,
}

impl<W: Write> Reporter<W> {
    pub fn new(out: W, config: TraceConfig) -> Self {
        Self {
            out,
            config,
            symbols: None,
            instruction_no: 0,
            last_progress_at: 0,
            in_window: false,
        }
    }

    pub fn with_symbols(mut self, symbols: SymbolMap) -> Self {
        self.symbols = Some(symbols);
        self
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn window_contains(&self, n: u64) -> bool {
        n >= self.config.start_traceout_at && self.config.stop_traceout_at.map_or(true, |stop| n < stop)
    }

    fn traces_instructions(&self) -> bool {
        matches!(self.config.report_type, ReportType::Short | ReportType::Long)
    }

    fn report_progress(&mut self, n: u64) {
        let interval = self.config.progress_interval;
        if interval == 0 || n - self.last_progress_at < interval {
            return;
        }
        self.last_progress_at = n;
        let _ = writeln!(self.out, "[{n}] Executed {interval} instructions");
        log::debug!("progress: {n} instructions retired");
    }
}

impl<W: Write> TraceSink for Reporter<W> {
    fn one_step_retired(&mut self, instruction_no: u64, regs: &RegisterFile, insn: u32) {
        self.instruction_no = instruction_no;
        self.in_window = self.traces_instructions() && self.window_contains(instruction_no);

        if !self.in_window {
            if self.config.report_type != ReportType::None {
                self.report_progress(instruction_no);
            }
            return;
        }

        match self.config.report_type {
            ReportType::Short => {
                let _ = write!(
                    self.out,
                    "({})  PC: {:08x} [{:08x}]",
                    instruction_no, regs.pc, insn
                );
            }
            ReportType::Long => {
                let location = self
                    .symbols
                    .as_ref()
                    .and_then(|s| s.lookup(regs.pc))
                    .map(|loc| format!(" {loc}"))
                    .unwrap_or_default();
                let _ = writeln!(self.out, "{regs}");
                let _ = writeln!(self.out, "===============================");
                let _ = writeln!(self.out, "Instruction no.:     {instruction_no}");
                let _ = writeln!(self.out, "===============================");
                let _ = writeln!(self.out, "Instruction pointer: 0x{:08x}{}", regs.pc, location);
                let _ = writeln!(self.out, "Instruction value:   0x{insn:08x}");
            }
            ReportType::None | ReportType::OnlyProgress => {}
        }
    }

    fn instruction_retired(&mut self, message: fmt::Arguments<'_>) {
        if !self.in_window {
            return;
        }
        match self.config.report_type {
            ReportType::Short => {
                let _ = writeln!(self.out, "   -> {message}");
            }
            ReportType::Long => {
                let _ = writeln!(self.out, "Executed instruction -> {message}\n");
            }
            ReportType::None | ReportType::OnlyProgress => {}
        }
    }

    fn csr_register_accessed(&mut self, message: fmt::Arguments<'_>) {
        if self.config.print_csr_activity {
            let _ = writeln!(self.out, "[{}] {}", self.instruction_no, message);
        }
    }
}
