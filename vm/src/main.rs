use clap::Parser;
use rv32ima_vm::config::{ConfigFile, MachineConfig, ReportType, TraceConfig};
use rv32ima_vm::console::{Console, KeyAction};
use rv32ima_vm::emulator::{Emulator, StopReason};
use rv32ima_vm::symbols::SymbolMap;
use rv32ima_vm::trace::Reporter;
use rv32ima_vm::VmError;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Instructions executed between console polls.
const BATCH: u64 = 10_000;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Kernel to boot: a raw `Image` or an ELF file
    #[arg(short, long)]
    kernel: PathBuf,

    /// Flattened device tree blob, copied to the top of RAM
    #[arg(long)]
    dtb: Option<PathBuf>,

    /// Kernel System.map, used to name the PC in traces and crash dumps
    #[arg(long)]
    system_map: Option<PathBuf>,

    /// JSON file with `machine` and `trace` sections. Flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// RAM size in MiB
    #[arg(long)]
    ram_mib: Option<u32>,

    /// Stop after this many instructions
    #[arg(long)]
    max_instructions: Option<u64>,

    /// Print the machine state when this instruction number retires
    #[arg(long)]
    breakpoint_at: Option<u64>,

    #[arg(long, value_enum)]
    report_type: Option<ReportType>,

    /// First instruction number to trace
    #[arg(long)]
    start_traceout_at: Option<u64>,

    /// Instruction number at which tracing stops again
    #[arg(long)]
    stop_traceout_at: Option<u64>,

    /// Log every CSR read and write
    #[arg(long)]
    print_csr_activity: bool,

    /// Discard guest console output
    #[arg(long)]
    no_tty_output: bool,

    /// Text fed to the guest UART before it starts
    #[arg(long)]
    uart_input: Option<String>,

    /// Write the final machine state as JSON
    #[arg(long)]
    dump_state: Option<PathBuf>,
}

enum Outcome {
    Limit(u64),
    Quit,
}

fn build_config(args: &Args) -> Result<(MachineConfig, TraceConfig), Box<dyn std::error::Error>> {
    let ConfigFile {
        mut machine,
        mut trace,
    } = match &args.config {
        Some(path) => ConfigFile::from_json(&fs::read_to_string(path)?)?,
        None => ConfigFile::default(),
    };

    if let Some(mib) = args.ram_mib {
        machine.ram_size = mib
            .checked_mul(1024 * 1024)
            .ok_or("Requested memory size is too large")?;
    }
    if args.max_instructions.is_some() {
        machine.max_instructions = args.max_instructions;
    }
    if args.breakpoint_at.is_some() {
        machine.breakpoint_at = args.breakpoint_at;
    }
    if args.no_tty_output {
        machine.tty_output = false;
    }
    if let Some(input) = &args.uart_input {
        machine.uart_input = input.clone();
    }

    if let Some(report_type) = args.report_type {
        trace.report_type = report_type;
    }
    if let Some(start) = args.start_traceout_at {
        trace.start_traceout_at = start;
    }
    if args.stop_traceout_at.is_some() {
        trace.stop_traceout_at = args.stop_traceout_at;
    }
    if args.print_csr_activity {
        trace.print_csr_activity = true;
    }

    Ok((machine, trace))
}

fn print_machine_state(emu: &Emulator, symbols: Option<&SymbolMap>) {
    let pc = emu.cpu.pc();
    eprintln!("{}", emu.cpu.regs);
    match symbols.and_then(|s| s.lookup(pc)) {
        Some(location) => eprintln!("PC 0x{pc:08x} is in {location}"),
        None => eprintln!("PC 0x{pc:08x}"),
    }
    eprintln!(
        "mstatus=0x{:08x} mepc=0x{:08x} mcause=0x{:08x} mtvec=0x{:08x} mtime={}",
        emu.cpu.csrs.mstatus(),
        emu.cpu.csrs.mepc,
        emu.cpu.csrs.mcause,
        emu.cpu.csrs.mtvec,
        emu.bus.clint.mtime()
    );
}

fn run(emu: &mut Emulator, console: &mut Console, symbols: Option<&SymbolMap>) -> Result<Outcome, VmError> {
    let stdout = io::stdout();
    loop {
        while let Some(action) = console.poll() {
            match action {
                KeyAction::Forward(byte) => emu.push_key(byte),
                KeyAction::Quit => return Ok(Outcome::Quit),
                KeyAction::Pending => {}
            }
        }

        let stop = emu.run_for(BATCH);

        let output = emu.drain_output();
        if !output.is_empty() {
            let mut lock = stdout.lock();
            let _ = lock.write_all(&output);
            let _ = lock.flush();
        }

        match stop? {
            Some(StopReason::InstructionLimit(n)) => return Ok(Outcome::Limit(n)),
            Some(StopReason::Breakpoint(n)) => {
                eprintln!("\n[MANAGER] Breakpoint at instruction {n}");
                print_machine_state(emu, symbols);
            }
            None => {}
        }
    }
}

fn dump_state(emu: &Emulator, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    fs::write(path, serde_json::to_string_pretty(&emu.snapshot())?)?;
    log::info!("Machine state written to {}", path.display());
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let (machine, trace) = build_config(&args)?;
    log::info!(
        "RAM 0x{:08x}+{} MiB, UART 0x{:08x}, CLINT 0x{:08x}",
        machine.ram_base,
        machine.ram_size / (1024 * 1024),
        machine.uart_base,
        machine.clint_base
    );

    let kernel = fs::read(&args.kernel)?;
    let dtb = args.dtb.as_ref().map(fs::read).transpose()?;
    let symbols = args
        .system_map
        .as_ref()
        .map(fs::read_to_string)
        .transpose()?
        .map(|text| SymbolMap::parse(&text));

    let mut reporter = Reporter::new(io::stdout(), trace);
    if let Some(symbols) = &symbols {
        reporter = reporter.with_symbols(symbols.clone());
    }
    let mut emu = Emulator::with_trace(machine, Box::new(reporter))?;
    emu.load(&kernel, dtb.as_deref())?;

    let mut console = Console::new();
    let outcome = run(&mut emu, &mut console, symbols.as_ref());
    // restore the terminal before printing anything else
    drop(console);

    let status = match outcome {
        Ok(Outcome::Limit(n)) => {
            println!("\n[MANAGER] Exited after {n} instructions");
            0
        }
        Ok(Outcome::Quit) => {
            println!("\nTerminated by user.");
            0
        }
        Err(err) => {
            eprintln!("\nFatal emulator error: {err}");
            print_machine_state(&emu, symbols.as_ref());
            1
        }
    };

    if let Some(path) = &args.dump_state {
        dump_state(&emu, path)?;
    }
    if status != 0 {
        std::process::exit(status);
    }
    Ok(())
}
