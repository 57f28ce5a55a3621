// ArmVirt - ARMv7-A Platform Emulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Memory-mapped front of the interrupt controller, laid out like a GICv1
//! distributor and CPU interface. Priorities, targets and per-line enables
//! are stored for the guest to read back but do not gate delivery.

use super::{extract, merge};
use crate::interrupt::InterruptController;
use crate::{Peripheral, SimResult, Width};
use std::collections::BTreeMap;

pub const DISTRIBUTOR_SIZE: u32 = 0x1000;
pub const CPU_INTERFACE_SIZE: u32 = 0x100;

/// Interrupt ID returned by the acknowledge register when nothing is active.
pub const SPURIOUS_IRQ: u32 = 1023;

const GICD_CTLR: u32 = 0x000;
const GICD_TYPER: u32 = 0x004;
const GICD_IIDR: u32 = 0x008;
const GICD_ISENABLER: u32 = 0x100;
const GICD_ICENABLER: u32 = 0x180;
const GICD_ISPENDR: u32 = 0x200;
const GICD_ICPENDR: u32 = 0x280;
const GICD_SGIR: u32 = 0xF00;

/// 96 interrupt lines (ITLinesNumber = 2), one CPU interface.
const TYPER_VALUE: u32 = 0x0000_0002;
const IIDR_VALUE: u32 = 0x0200_043B;
const ENABLE_WORDS: u32 = 3;

#[derive(Debug)]
pub struct GicDistributor {
    controller: InterruptController,
    enable: [u32; ENABLE_WORDS as usize],
    regs: BTreeMap<u32, u32>,
}

impl GicDistributor {
    pub fn new(controller: InterruptController) -> Self {
        Self {
            controller,
            enable: [0; ENABLE_WORDS as usize],
            regs: BTreeMap::new(),
        }
    }

    /// Pending lines `base..base + 32` as a bitmap.
    fn pending_bits(&self, base: u32) -> u32 {
        self.controller
            .pending()
            .into_iter()
            .filter(|irq| (base..base + 32).contains(irq))
            .fold(0, |acc, irq| acc | 1 << (irq - base))
    }

    fn read_word(&self, offset: u32) -> u32 {
        match offset {
            GICD_CTLR => self.controller.is_enabled() as u32,
            GICD_TYPER => TYPER_VALUE,
            GICD_IIDR => IIDR_VALUE,
            o if (GICD_ISENABLER..GICD_ISENABLER + ENABLE_WORDS * 4).contains(&o) => {
                self.enable[((o - GICD_ISENABLER) / 4) as usize]
            }
            o if (GICD_ICENABLER..GICD_ICENABLER + ENABLE_WORDS * 4).contains(&o) => {
                self.enable[((o - GICD_ICENABLER) / 4) as usize]
            }
            o if (GICD_ISPENDR..GICD_ISPENDR + ENABLE_WORDS * 4).contains(&o) => {
                self.pending_bits((o - GICD_ISPENDR) / 4 * 32)
            }
            o if (GICD_ICPENDR..GICD_ICPENDR + ENABLE_WORDS * 4).contains(&o) => {
                self.pending_bits((o - GICD_ICPENDR) / 4 * 32)
            }
            o => self.regs.get(&o).copied().unwrap_or(0),
        }
    }

    fn write_word(&mut self, offset: u32, value: u32) {
        match offset {
            GICD_CTLR => self.controller.set_enabled(value & 1 != 0),
            GICD_TYPER | GICD_IIDR => {
                tracing::trace!("GICD write to read-only {:#x} ignored", offset);
            }
            o if (GICD_ISENABLER..GICD_ISENABLER + ENABLE_WORDS * 4).contains(&o) => {
                self.enable[((o - GICD_ISENABLER) / 4) as usize] |= value;
            }
            o if (GICD_ICENABLER..GICD_ICENABLER + ENABLE_WORDS * 4).contains(&o) => {
                self.enable[((o - GICD_ICENABLER) / 4) as usize] &= !value;
            }
            o if (GICD_ISPENDR..GICD_ISPENDR + ENABLE_WORDS * 4).contains(&o) => {
                let base = ((o - GICD_ISPENDR) / 4) * 32;
                for bit in (0..32).filter(|bit| value & (1 << bit) != 0) {
                    self.controller.raise(base + bit);
                }
            }
            o if (GICD_ICPENDR..GICD_ICPENDR + ENABLE_WORDS * 4).contains(&o) => {
                let base = ((o - GICD_ICPENDR) / 4) * 32;
                for bit in (0..32).filter(|bit| value & (1 << bit) != 0) {
                    self.controller.withdraw(base + bit);
                }
            }
            GICD_SGIR => self.controller.raise(value & 0xF),
            o => {
                self.regs.insert(o, value);
            }
        }
    }
}

impl Peripheral for GicDistributor {
    fn read(&mut self, offset: u32, width: Width) -> SimResult<u32> {
        Ok(extract(self.read_word(offset & !3), offset, width))
    }

    fn write(&mut self, offset: u32, width: Width, value: u32) -> SimResult<()> {
        let word = offset & !3;
        let value = match width {
            Width::Word => value,
            _ => merge(self.read_word(word), offset, width, value),
        };
        self.write_word(word, value);
        Ok(())
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "enable": self.enable,
            "regs": self.regs,
        })
    }

    fn restore(&mut self, state: &serde_json::Value) -> SimResult<()> {
        if state.is_null() {
            return Ok(());
        }
        let parsed: (Vec<u32>, BTreeMap<u32, u32>) = serde_json::from_value(serde_json::json!([
            state["enable"],
            state["regs"]
        ]))
        .map_err(|e| crate::SimulationError::Configuration(format!("GIC distributor state: {e}")))?;
        for (slot, v) in self.enable.iter_mut().zip(parsed.0) {
            *slot = v;
        }
        self.regs = parsed.1;
        Ok(())
    }
}

const GICC_IAR: u32 = 0x0C;
const GICC_EOIR: u32 = 0x10;
const GICC_RPR: u32 = 0x14;
const GICC_HPPIR: u32 = 0x18;
const GICC_IIDR: u32 = 0xFC;

const GICC_IIDR_VALUE: u32 = 0x0102_043B;

#[derive(Debug)]
pub struct GicCpuInterface {
    controller: InterruptController,
    regs: BTreeMap<u32, u32>,
}

impl GicCpuInterface {
    pub fn new(controller: InterruptController) -> Self {
        Self {
            controller,
            regs: BTreeMap::new(),
        }
    }

    fn read_word(&self, offset: u32) -> u32 {
        match offset {
            // The scheduler has already accepted the line; report it.
            GICC_IAR => self.controller.oldest_acknowledged().unwrap_or(SPURIOUS_IRQ),
            GICC_HPPIR => self.controller.next_pending().unwrap_or(SPURIOUS_IRQ),
            GICC_RPR => 0xFF,
            GICC_IIDR => GICC_IIDR_VALUE,
            GICC_EOIR => 0,
            o => self.regs.get(&o).copied().unwrap_or(0),
        }
    }
}

impl Peripheral for GicCpuInterface {
    fn read(&mut self, offset: u32, width: Width) -> SimResult<u32> {
        Ok(extract(self.read_word(offset & !3), offset, width))
    }

    fn write(&mut self, offset: u32, _width: Width, value: u32) -> SimResult<()> {
        match offset & !3 {
            GICC_EOIR => self.controller.complete(value & 0x3FF),
            GICC_IAR | GICC_RPR | GICC_HPPIR | GICC_IIDR => Ok(()),
            // CTLR, PMR, BPR and anything else is plain storage
            o => {
                self.regs.insert(o, value);
                Ok(())
            }
        }
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({ "regs": self.regs })
    }

    fn restore(&mut self, state: &serde_json::Value) -> SimResult<()> {
        if state.is_null() {
            return Ok(());
        }
        self.regs = serde_json::from_value(state["regs"].clone()).map_err(|e| {
            crate::SimulationError::Configuration(format!("GIC CPU interface state: {e}"))
        })?;
        Ok(())
    }
}
