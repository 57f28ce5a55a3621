// ArmVirt - ARMv7-A Platform Emulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Default schema version for YAML configs
fn default_schema_version() -> String {
    "1.0".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MemoryRange {
    pub base: u32,
    pub size: String, // e.g. "256MB"
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct InterruptControllerConfig {
    /// Base of the distributor register block.
    pub distributor: u32,
    /// Base of the CPU interface register block.
    pub cpu_interface: u32,
}

impl Default for InterruptControllerConfig {
    fn default() -> Self {
        // Cortex-A9 MPCore private memory region layout
        Self {
            distributor: 0x1E00_1000,
            cpu_interface: 0x1E00_0100,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PeripheralConfig {
    pub id: String,
    pub r#type: String, // "stub", ...
    pub base_address: u32,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub irq: Option<u32>,
    #[serde(default)]
    pub config: HashMap<String, serde_yaml::Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct InitrdConfig {
    pub addr: u32,
    pub size: u32,
}

fn default_kernel_addr() -> u32 {
    0x0000_8000
}

fn default_atags_addr() -> u32 {
    0x0000_0100
}

fn default_machine_type() -> u32 {
    // Versatile Express
    2272
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct BootConfig {
    #[serde(default = "default_kernel_addr")]
    pub kernel_addr: u32,
    #[serde(default = "default_atags_addr")]
    pub atags_addr: u32,
    #[serde(default = "default_machine_type")]
    pub machine_type: u32,
    #[serde(default)]
    pub cmdline: String,
    #[serde(default)]
    pub initrd: Option<InitrdConfig>,
    /// Decompressed ramdisk size advertised to the guest, in KiB.
    #[serde(default)]
    pub ramdisk_kib: u32,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            kernel_addr: default_kernel_addr(),
            atags_addr: default_atags_addr(),
            machine_type: default_machine_type(),
            cmdline: String::new(),
            initrd: None,
            ramdisk_kib: 0,
        }
    }
}

fn default_batch_size() -> u32 {
    100_000
}

/// Scheduler options recognised in the `run` block.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RunOptions {
    /// Instructions executed per scheduler batch before yielding to the host.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default)]
    pub stop_address: Option<u32>,
    #[serde(default)]
    pub stop_instruction: Option<u32>,
    #[serde(default)]
    pub stop_counter: Option<u64>,
    #[serde(default)]
    pub stop_at_every_branch: bool,
    #[serde(default)]
    pub stop_at_every_funccall: bool,
    #[serde(default)]
    pub suppress_interrupts: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            stop_address: None,
            stop_instruction: None,
            stop_counter: None,
            stop_at_every_branch: false,
            stop_at_every_funccall: false,
            suppress_interrupts: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MachineManifest {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub name: String,
    pub memory: MemoryRange,
    #[serde(default)]
    pub interrupt_controller: InterruptControllerConfig,
    #[serde(default)]
    pub peripherals: Vec<PeripheralConfig>,
    #[serde(default)]
    pub boot: BootConfig,
    #[serde(default)]
    pub run: RunOptions,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("unsupported schema_version '{0}' (supported: '1.0')")]
    UnsupportedSchema(String),
    #[error("run.batch_size must be greater than zero")]
    ZeroBatchSize,
    #[error("duplicate peripheral id '{0}'")]
    DuplicatePeripheral(String),
    #[error("initrd at {addr:#x} (+{size:#x}) overflows the 32-bit address space")]
    InitrdOverflow { addr: u32, size: u32 },
}

impl MachineManifest {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read machine manifest {:?}", path))?;
        let manifest = Self::from_yaml(&content)
            .with_context(|| format!("Invalid machine manifest {:?}", path))?;
        tracing::debug!(
            "Manifest '{}': {} peripheral(s), schema {}",
            manifest.name,
            manifest.peripherals.len(),
            manifest.schema_version
        );
        Ok(manifest)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let manifest: Self =
            serde_yaml::from_str(yaml).context("Failed to parse Machine Manifest YAML")?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.schema_version != "1.0" {
            return Err(ManifestError::UnsupportedSchema(self.schema_version.clone()));
        }
        if self.run.batch_size == 0 {
            return Err(ManifestError::ZeroBatchSize);
        }
        let mut seen = std::collections::HashSet::new();
        for p in &self.peripherals {
            if !seen.insert(p.id.as_str()) {
                return Err(ManifestError::DuplicatePeripheral(p.id.clone()));
            }
        }
        if let Some(initrd) = &self.boot.initrd {
            if initrd.addr.checked_add(initrd.size).is_none() {
                return Err(ManifestError::InitrdOverflow {
                    addr: initrd.addr,
                    size: initrd.size,
                });
            }
        }
        Ok(())
    }
}

pub fn parse_size(size_str: &str) -> Result<u64> {
    use human_size::{Byte, Size, SpecificSize};
    let s: Size = size_str
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid size format: {}", e))?;
    let bytes: SpecificSize<Byte> = s.into();
    Ok(bytes.value() as u64)
}
