// ArmVirt - ARMv7-A Platform Emulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use super::Board;
use crate::memory::LinearMemory;
use crate::peripherals::gic::{
    GicCpuInterface, GicDistributor, CPU_INTERFACE_SIZE, DISTRIBUTOR_SIZE,
};
use crate::peripherals::stub::StubPeripheral;
use crate::{Peripheral, SchedulerConfig};
use anyhow::Context;
use armvirt_config::{parse_size, MachineManifest, PeripheralConfig};
use std::path::Path;
use tracing::info;

const DEFAULT_PERIPHERAL_SIZE: u32 = 0x1000;

/// Load a manifest from disk and assemble its board.
pub fn build_board_from_file(path: &Path) -> anyhow::Result<(MachineManifest, Board)> {
    info!("Loading machine manifest: {:?}", path);
    let manifest = MachineManifest::from_file(path)?;
    let board = build_board(&manifest)?;
    Ok((manifest, board))
}

/// Board plus the scheduler settings of the manifest's `run` block, ready
/// for `Machine::new` with an engine of the caller's choosing.
pub fn build_machine_parts(manifest: &MachineManifest) -> anyhow::Result<(Board, SchedulerConfig)> {
    let board = build_board(manifest)?;
    let config = SchedulerConfig::from(&manifest.run);
    tracing::debug!("Scheduler config for '{}': {:?}", manifest.name, config);
    Ok((board, config))
}

/// Assemble RAM, the interrupt controller front and the configured
/// peripherals into a board.
pub fn build_board(manifest: &MachineManifest) -> anyhow::Result<Board> {
    let ram_size = parse_size(&manifest.memory.size)?;
    let ram_size = usize::try_from(ram_size)
        .ok()
        .filter(|&s| manifest.memory.base as u64 + s as u64 <= 1 << 32)
        .with_context(|| {
            format!(
                "RAM of {} at {:#010x} does not fit the address space",
                manifest.memory.size, manifest.memory.base
            )
        })?;
    let mut board = Board::new(LinearMemory::new(ram_size, manifest.memory.base));
    info!(
        "Machine '{}': {} of RAM at {:#010x}",
        manifest.name, manifest.memory.size, manifest.memory.base
    );

    let gic = manifest.interrupt_controller;
    board.bus.map_peripheral(
        "gic_distributor",
        gic.distributor,
        DISTRIBUTOR_SIZE,
        None,
        Box::new(GicDistributor::new(board.interrupts.clone())),
    )?;
    board.bus.map_peripheral(
        "gic_cpu_interface",
        gic.cpu_interface,
        CPU_INTERFACE_SIZE,
        None,
        Box::new(GicCpuInterface::new(board.interrupts.clone())),
    )?;

    for p_cfg in &manifest.peripherals {
        let dev: Box<dyn Peripheral> = match p_cfg.r#type.as_str() {
            "stub" => Box::new(build_stub(p_cfg)?),
            other => {
                tracing::warn!(
                    "Unsupported peripheral type '{}' for id '{}'; skipping",
                    other,
                    p_cfg.id
                );
                continue;
            }
        };
        let size = match &p_cfg.size {
            Some(s) => u32::try_from(parse_size(s)?)
                .with_context(|| format!("Peripheral '{}' size {} is too large", p_cfg.id, s))?,
            None => DEFAULT_PERIPHERAL_SIZE,
        };
        board
            .bus
            .map_peripheral(&p_cfg.id, p_cfg.base_address, size, p_cfg.irq, dev)
            .with_context(|| format!("Failed to map peripheral '{}'", p_cfg.id))?;
    }

    Ok(board)
}

/// `config.value` is the default read value; `config.registers` maps word
/// offsets to specific values.
fn build_stub(p_cfg: &PeripheralConfig) -> anyhow::Result<StubPeripheral> {
    let default_val = match p_cfg.config.get("value") {
        Some(v) => v
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .with_context(|| format!("Stub '{}': 'value' must be a 32-bit integer", p_cfg.id))?,
        None => 0,
    };
    let mut stub = StubPeripheral::new(default_val);
    if let Some(regs) = p_cfg.config.get("registers").and_then(|v| v.as_mapping()) {
        for (offset, value) in regs {
            let offset = offset.as_u64().and_then(|v| u32::try_from(v).ok());
            let value = value.as_u64().and_then(|v| u32::try_from(v).ok());
            match (offset, value) {
                (Some(offset), Some(value)) => {
                    stub.values.insert(offset & !3, value);
                }
                _ => anyhow::bail!("Stub '{}': registers must map integers to integers", p_cfg.id),
            }
        }
    }
    Ok(stub)
}
