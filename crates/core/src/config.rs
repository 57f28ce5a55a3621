// ArmVirt - ARMv7-A Platform Emulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Instructions executed per batch before yielding to the host.
    pub batch_size: u32,
    pub stop_address: Option<u32>,
    /// Raw instruction word that acts as a breakpoint.
    pub stop_instruction: Option<u32>,
    /// Stop once the instruction counter reaches this value.
    pub stop_counter: Option<u64>,
    pub stop_at_every_branch: bool,
    pub stop_at_every_funccall: bool,
    pub suppress_interrupts: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100_000,
            stop_address: None,
            stop_instruction: None,
            stop_counter: None,
            stop_at_every_branch: false,
            stop_at_every_funccall: false,
            suppress_interrupts: false,
        }
    }
}

impl From<&armvirt_config::RunOptions> for SchedulerConfig {
    fn from(run: &armvirt_config::RunOptions) -> Self {
        Self {
            batch_size: run.batch_size.max(1),
            stop_address: run.stop_address,
            stop_instruction: run.stop_instruction,
            stop_counter: run.stop_counter,
            stop_at_every_branch: run.stop_at_every_branch,
            stop_at_every_funccall: run.stop_at_every_funccall,
            suppress_interrupts: run.suppress_interrupts,
        }
    }
}
