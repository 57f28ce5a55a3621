// ArmVirt - ARMv7-A Platform Emulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use anyhow::Context;
use armvirt_core::boot::BootParams;
use armvirt_core::cp15::{regs, ControlRegisterFile};
use armvirt_core::memory::LinearMemory;
use armvirt_core::mmu::AccessKind;
use armvirt_core::snapshot::Snapshot;
use armvirt_core::system::builder::build_board_from_file;
use armvirt_core::{Board, SimulationError};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use tracing::{error, info};

const EXIT_OK: u8 = 0;
const EXIT_GUEST_FAULT: u8 = 1;
const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_RUNTIME_ERROR: u8 = 3;

fn parse_u32_addr(s: &str) -> Result<u32, String> {
    let trimmed = s.trim();
    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        u32::from_str_radix(&hex.replace('_', ""), 16)
            .map_err(|e| format!("Invalid hex address '{}': {}", s, e))
    } else {
        u32::from_str(trimmed).map_err(|e| format!("Invalid address '{}': {}", s, e))
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "ArmVirt platform tooling", long_about = None)]
struct Cli {
    /// Enable debug-level logging
    #[arg(short, long, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Dump the boot parameter block a manifest would produce.
    Atags(AtagsArgs),

    /// Print the control registers, interrupt queues and counters of a snapshot.
    Inspect(InspectArgs),

    /// Walk the page tables of a snapshot for one virtual address.
    Translate(TranslateArgs),
}

#[derive(Parser, Debug)]
struct AtagsArgs {
    /// Path to the machine manifest (YAML)
    #[arg(short, long)]
    system: PathBuf,

    /// Emit the words as a JSON array
    #[arg(long)]
    json: bool,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    /// Snapshot directory (state.json + memory.bin)
    #[arg(short, long)]
    snapshot: PathBuf,

    /// Emit a JSON report instead of text
    #[arg(long)]
    json: bool,
}

#[derive(Parser, Debug)]
struct TranslateArgs {
    /// Snapshot directory (state.json + memory.bin)
    #[arg(short, long)]
    snapshot: PathBuf,

    /// Virtual address to translate
    #[arg(short, long, value_parser = parse_u32_addr)]
    address: u32,

    /// Translate as a write access
    #[arg(long)]
    write: bool,

    /// Translate as an unprivileged access
    #[arg(long)]
    user: bool,

    /// Machine manifest the snapshot was taken on
    #[arg(long, conflicts_with = "ram_base")]
    system: Option<PathBuf>,

    /// Physical base of RAM when no manifest is given
    #[arg(long, value_parser = parse_u32_addr, default_value = "0")]
    ram_base: u32,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr so command output stays machine-readable
    let level = if cli.trace {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Atags(args) => run_atags(args),
        Commands::Inspect(args) => run_inspect(args),
        Commands::Translate(args) => run_translate(args),
    }
}

fn run_atags(args: AtagsArgs) -> ExitCode {
    let (manifest, board) = match build_board_from_file(&args.system) {
        Ok(built) => built,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    let params = BootParams::new(
        board.bus.ram.base_addr,
        board.bus.ram.size(),
        &manifest.boot,
    );
    let words = params.to_words();

    if args.json {
        println!("{}", serde_json::json!(words));
    } else {
        for (i, word) in words.iter().enumerate() {
            println!(
                "{:#010x}: {:#010x}",
                manifest.boot.atags_addr.wrapping_add(i as u32 * 4),
                word
            );
        }
    }
    ExitCode::from(EXIT_OK)
}

fn run_inspect(args: InspectArgs) -> ExitCode {
    let snap = match Snapshot::load_from_dir(&args.snapshot) {
        Ok(snap) => snap,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    let mut cp15 = ControlRegisterFile::new();
    if let Err(e) = cp15.restore(&snap.state.control_registers) {
        error!("Snapshot control registers rejected: {}", e);
        return ExitCode::from(EXIT_CONFIG_ERROR);
    }
    let state = &snap.state;
    let ctx = cp15.translation();

    if args.json {
        let registers: serde_json::Map<String, serde_json::Value> = cp15
            .registers()
            .into_iter()
            .map(|r| (r.name.to_string(), serde_json::json!(r.value)))
            .collect();
        let report = serde_json::json!({
            "registers": registers,
            "translation": ctx,
            "interrupts": state.interrupts,
            "execution": state.execution,
            "memory_bytes": snap.memory.len(),
        });
        println!("{}", report);
        return ExitCode::from(EXIT_OK);
    }

    println!("Control registers:");
    for r in cp15.registers() {
        println!("  {:<12} [{}] = {:#010x}", r.name, r.key, r.value);
    }

    println!("Translation:");
    println!("  enabled          {}", ctx.enabled);
    println!("  table_base_0     {:#010x}", ctx.table_base_0);
    println!("  table_base_1     {:#010x}", ctx.table_base_1);
    println!("  split_width      {}", ctx.split_width);
    println!("  asid             {}", ctx.asid);
    println!("  check_unaligned  {}", ctx.check_unaligned);
    for (domain, rights) in ctx.domain_rights.iter().enumerate() {
        println!("  domain {:<2}        {:?}", domain, rights);
    }
    println!("  vector_base      {:#010x}", cp15.vector_base());

    println!("Interrupts:");
    println!("  enabled          {}", state.interrupts.enabled);
    println!("  pending          {:?}", state.interrupts.pending);
    println!("  acknowledged     {:?}", state.interrupts.acknowledged);

    let exec = &state.execution;
    println!("Execution:");
    println!("  pc               {:#010x}", exec.pc);
    println!("  instructions     {}", exec.instructions);
    println!("  running          {}", exec.running);
    println!("  halted           {}", exec.halted);
    match exec.remaining {
        Some(n) => println!("  remaining        {}", n),
        None => println!("  remaining        unbounded"),
    }
    println!("RAM image: {} bytes", snap.memory.len());
    ExitCode::from(EXIT_OK)
}

/// Board shaped like the one the snapshot was taken on.
fn restore_board(
    snap: &Snapshot,
    system: Option<&Path>,
    ram_base: u32,
) -> anyhow::Result<Board> {
    let mut board = match system {
        Some(path) => build_board_from_file(path)?.1,
        None => Board::new(LinearMemory::new(snap.memory.len(), ram_base)),
    };
    board
        .apply_snapshot(snap)
        .context("Failed to restore snapshot onto board")?;
    Ok(board)
}

fn run_translate(args: TranslateArgs) -> ExitCode {
    let board = Snapshot::load_from_dir(&args.snapshot).and_then(|snap| {
        restore_board(&snap, args.system.as_deref(), args.ram_base)
    });
    let mut board = match board {
        Ok(board) => board,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let privileged = !args.user;
    let access = if args.write {
        AccessKind::write(privileged)
    } else {
        AccessKind::read(privileged)
    };
    info!(
        "Translating {:#010x} ({}, {})",
        args.address,
        if args.write { "write" } else { "read" },
        if privileged { "privileged" } else { "user" }
    );

    match board.translate(args.address, access) {
        Ok(pa) => {
            println!("{:#010x} -> {:#010x}", args.address, pa);
            ExitCode::from(EXIT_OK)
        }
        Err(SimulationError::Guest(fault)) => {
            println!("{:#010x} -> {}", args.address, fault);
            let fault_regs = [("DFSR", regs::DFSR), ("DFAR", regs::DFAR)];
            for (name, key) in fault_regs {
                match board.cp15.read(key) {
                    Ok(v) => println!("  {} = {:#010x}", name, v),
                    Err(e) => error!("{}: {}", name, e),
                }
            }
            ExitCode::from(EXIT_GUEST_FAULT)
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::from(EXIT_RUNTIME_ERROR)
        }
    }
}
