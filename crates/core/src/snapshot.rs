// ArmVirt - ARMv7-A Platform Emulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::cp15::Cp15Snapshot;
use crate::interrupt::InterruptSnapshot;
use crate::scheduler::ExecutionState;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub const SNAPSHOT_VERSION: u32 = 1;

const STATE_FILE: &str = "state.json";
const MEMORY_FILE: &str = "memory.bin";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MachineSnapshot {
    pub version: u32,
    pub control_registers: Cp15Snapshot,
    pub interrupts: InterruptSnapshot,
    pub execution: ExecutionState,
    /// Opaque engine state (registers, modes).
    #[serde(default)]
    pub engine: serde_json::Value,
    pub peripherals: HashMap<String, serde_json::Value>,
}

/// Machine state plus the raw RAM image it refers to.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub state: MachineSnapshot,
    pub memory: Vec<u8>,
}

impl Snapshot {
    pub fn save_to_dir<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create snapshot directory {:?}", dir))?;
        let json = serde_json::to_string_pretty(&self.state)?;
        std::fs::write(dir.join(STATE_FILE), json)
            .with_context(|| format!("Failed to write {:?}", dir.join(STATE_FILE)))?;
        std::fs::write(dir.join(MEMORY_FILE), &self.memory)
            .with_context(|| format!("Failed to write {:?}", dir.join(MEMORY_FILE)))?;
        tracing::info!(
            "Saved snapshot to {:?} ({} bytes of RAM)",
            dir,
            self.memory.len()
        );
        Ok(())
    }

    pub fn load_from_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let json = std::fs::read_to_string(dir.join(STATE_FILE))
            .with_context(|| format!("Failed to read {:?}", dir.join(STATE_FILE)))?;
        let state: MachineSnapshot =
            serde_json::from_str(&json).context("Failed to parse snapshot state")?;
        if state.version != SNAPSHOT_VERSION {
            anyhow::bail!(
                "unsupported snapshot version {} (supported: {})",
                state.version,
                SNAPSHOT_VERSION
            );
        }
        let memory = std::fs::read(dir.join(MEMORY_FILE))
            .with_context(|| format!("Failed to read {:?}", dir.join(MEMORY_FILE)))?;
        Ok(Self { state, memory })
    }
}
