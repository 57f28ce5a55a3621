// ArmVirt - ARMv7-A Platform Emulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

pub mod builder;

use crate::bus::SystemBus;
use crate::cp15::ControlRegisterFile;
use crate::interrupt::{InterruptController, IrqLine};
use crate::memory::LinearMemory;
use crate::mmu::{self, AccessKind};
use crate::snapshot::{MachineSnapshot, Snapshot, SNAPSHOT_VERSION};
use crate::{SimResult, SimulationError};

/// Everything on the platform except the execution engine.
pub struct Board {
    pub bus: SystemBus,
    pub cp15: ControlRegisterFile,
    pub interrupts: InterruptController,
}

impl Board {
    /// A board with only RAM mapped.
    pub fn new(ram: LinearMemory) -> Self {
        Self {
            bus: SystemBus::new(ram),
            cp15: ControlRegisterFile::new(),
            interrupts: InterruptController::new(),
        }
    }

    pub fn translate(&mut self, vaddr: u32, access: AccessKind) -> SimResult<u32> {
        mmu::translate(&mut self.cp15, &self.bus, vaddr, access)
    }

    pub fn peek_peripheral(&self, name: &str) -> Option<serde_json::Value> {
        self.bus
            .peripherals
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.dev.snapshot())
    }

    /// Board state with default execution counters and no engine state.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: MachineSnapshot {
                version: SNAPSHOT_VERSION,
                control_registers: self.cp15.snapshot(),
                interrupts: self.interrupts.snapshot(),
                execution: Default::default(),
                engine: serde_json::Value::Null,
                peripherals: self
                    .bus
                    .peripherals
                    .iter()
                    .map(|p| (p.name.clone(), p.dev.snapshot()))
                    .collect(),
            },
            memory: self.bus.ram.data.clone(),
        }
    }

    /// Restore every part of `snap`, or nothing: on error the board is left
    /// as it was.
    pub fn apply_snapshot(&mut self, snap: &Snapshot) -> SimResult<()> {
        if snap.memory.len() != self.bus.ram.data.len() {
            return Err(SimulationError::Configuration(format!(
                "snapshot holds {} bytes of RAM but the board has {}",
                snap.memory.len(),
                self.bus.ram.data.len()
            )));
        }
        let mut cp15 = ControlRegisterFile::new();
        cp15.restore(&snap.state.control_registers)?;

        // Peripherals validate their own state; undo the ones already
        // restored if a later one rejects its state.
        let mut previous = Vec::new();
        for idx in 0..self.bus.peripherals.len() {
            let p = &mut self.bus.peripherals[idx];
            let Some(state) = snap.state.peripherals.get(&p.name) else {
                continue;
            };
            previous.push((idx, p.dev.snapshot()));
            if let Err(e) = p.dev.restore(state) {
                self.roll_back_peripherals(previous);
                return Err(e);
            }
        }

        self.cp15 = cp15;
        self.interrupts.restore(&snap.state.interrupts);
        self.bus.ram.data.copy_from_slice(&snap.memory);
        Ok(())
    }

    fn roll_back_peripherals(&mut self, previous: Vec<(usize, serde_json::Value)>) {
        for (idx, state) in previous.into_iter().rev() {
            let p = &mut self.bus.peripherals[idx];
            if let Err(e) = p.dev.restore(&state) {
                tracing::warn!("Could not roll back peripheral '{}': {}", p.name, e);
            }
        }
    }

    /// Interrupt line of the named peripheral, for host-side event sources
    /// (timer expiry, I/O completion) that raise it between batches.
    pub fn peripheral_irq(&self, name: &str) -> Option<IrqLine> {
        self.bus
            .peripherals
            .iter()
            .find(|p| p.name == name)
            .and_then(|p| p.irq)
            .map(|irq| self.interrupts.line(irq))
    }
}
