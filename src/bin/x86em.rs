//! CLI front end: `--try` runs a raw binary image directly, `--config` loads
//! the text configuration format; per-subsystem verbosity flags are wired to
//! `env_logger`'s module filters.

use std::fs;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use x86em::cpu::{Cpu, CpuState};
use x86em::reg::{EFlags, SegReg};

const DEFAULT_MEMORY_BYTES: usize = 1024 * 1024;
const MAX_INSTRUCTIONS_PER_RUN: u64 = 50_000_000;

#[derive(Parser, Debug)]
#[command(name = "x86em", about = "16/32-bit x86 CPU emulator core")]
struct Args {
    /// Loads a raw binary at 1000:0000 and runs it directly.
    #[arg(long = "try")]
    try_: Option<String>,

    /// Loads the text configuration format.
    #[arg(long)]
    config: Option<String>,

    /// Verbose decode/execute tracing.
    #[arg(long)]
    verbose_exec: bool,

    /// Verbose descriptor and tasking tracing.
    #[arg(long)]
    verbose_tasking: bool,
}

fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::from_default_env();
    if args.verbose_exec {
        builder.filter_module("x86em::exec", log::LevelFilter::Trace);
        builder.filter_module("x86em::decode", log::LevelFilter::Trace);
    }
    if args.verbose_tasking {
        builder.filter_module("x86em::tasking", log::LevelFilter::Debug);
        builder.filter_module("x86em::control_flow", log::LevelFilter::Debug);
    }
    builder.init();
}

fn run_try(path: &str) -> Result<(), x86em::Error> {
    let image = fs::read(path)?;
    let mut cpu = Cpu::new(DEFAULT_MEMORY_BYTES);
    cpu.reset();

    {
        let cs = cpu.regs.seg_mut(SegReg::Cs);
        cs.selector = 0x1000;
        cs.base = 0x1_0000;
    }
    cpu.regs.eip = 0;
    cpu.regs.seg_mut(SegReg::Ss).selector = 0x1000;
    cpu.regs.seg_mut(SegReg::Ss).base = 0x1_0000;
    cpu.regs.set(x86em::reg::Gpr::Esp, x86em::bits::Width::Word, 0x1000);
    cpu.regs.set_flag(EFlags::IF, false);

    let base = cpu.regs.seg_mut(SegReg::Cs).base;
    for (i, byte) in image.iter().enumerate() {
        cpu.mem.write(base + i as u32, 1, *byte as u32);
    }

    info!("loaded {} bytes from {path} at 1000:0000", image.len());
    match cpu.run(MAX_INSTRUCTIONS_PER_RUN) {
        CpuState::Halted => info!("halted after running to completion"),
        CpuState::Dead => error!("cpu died on an unrecoverable double fault"),
        CpuState::Alive => info!("instruction budget exhausted while still running"),
    }
    Ok(())
}

fn run_config(path: &str) -> Result<(), x86em::Error> {
    let text = fs::read_to_string(path)?;
    let config = x86em::config::parse(&text)?;
    info!(
        "parsed config: {} KiB memory, {} preload(s), {} fixed disk(s), {} floppy(ies)",
        config.memory_kib,
        config.preloads.len(),
        config.fixed_disks.len(),
        config.floppies.len()
    );

    let memory_bytes = (config.memory_kib as usize).max(1) * 1024;
    let mut cpu = Cpu::new(memory_bytes);
    cpu.reset();

    for preload in &config.preloads {
        let data = fs::read(&preload.path)?;
        let base = (preload.at.segment as u32) << 4;
        for (i, byte) in data.iter().enumerate() {
            cpu.mem.write(base + preload.at.offset as u32 + i as u32, 1, *byte as u32);
        }
    }

    if let Some((segment, eip)) = config.initial_cs_eip {
        let cs = cpu.regs.seg_mut(SegReg::Cs);
        cs.selector = segment;
        cs.base = (segment as u32) << 4;
        cpu.regs.eip = eip;
    }

    match cpu.run(MAX_INSTRUCTIONS_PER_RUN) {
        CpuState::Halted => info!("halted after running to completion"),
        CpuState::Dead => error!("cpu died on an unrecoverable double fault"),
        CpuState::Alive => info!("instruction budget exhausted while still running"),
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    let result = match (&args.try_, &args.config) {
        (Some(path), _) => run_try(path),
        (None, Some(path)) => run_config(path),
        (None, None) => {
            error!("one of --try or --config is required");
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
