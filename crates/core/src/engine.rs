// ArmVirt - ARMv7-A Platform Emulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! The seam between the platform and an instruction set implementation.
//!
//! The scheduler owns fetch, PC update, fault redirection and interrupt
//! entry. An [`ExecutionEngine`] only decodes and executes, touching the rest
//! of the machine through a [`SystemContext`].

use crate::bus::{SystemBus, Width};
use crate::cp15::{ControlRegisterFile, RegisterKey};
use crate::mmu::{self, status, AccessKind};
use crate::{GuestFault, SimResult, SimulationError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Exception {
    Reset,
    Undefined,
    SupervisorCall,
    PrefetchAbort,
    DataAbort,
    Irq,
    Fiq,
}

impl Exception {
    /// Offset of this exception's entry in the vector table.
    pub const fn vector_offset(self) -> u32 {
        match self {
            Exception::Reset => 0x00,
            Exception::Undefined => 0x04,
            Exception::SupervisorCall => 0x08,
            Exception::PrefetchAbort => 0x0C,
            Exception::DataAbort => 0x10,
            Exception::Irq => 0x18,
            Exception::Fiq => 0x1C,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchKind {
    Jump,
    /// Branch with link.
    Call,
    Return,
}

/// How an executed instruction hands control back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retire {
    /// Fall through to the next instruction.
    Next,
    Branch { target: u32, kind: BranchKind },
}

pub trait ExecutionEngine: Send {
    type Instruction;

    fn reset(&mut self);
    fn pc(&self) -> u32;
    fn set_pc(&mut self, pc: u32);
    fn register(&self, index: u8) -> u32;
    fn set_register(&mut self, index: u8, value: u32);
    fn is_privileged(&self) -> bool;
    /// CPSR.I
    fn irq_masked(&self) -> bool;

    /// Fails with [`GuestFault::Undefined`] for encodings the engine rejects.
    fn decode(&mut self, raw: u32) -> SimResult<Self::Instruction>;
    fn condition_passed(&self, instr: &Self::Instruction) -> bool;
    /// Execute without touching the PC; the scheduler applies the [`Retire`].
    fn execute(
        &mut self,
        instr: &Self::Instruction,
        sys: &mut SystemContext<'_>,
    ) -> SimResult<Retire>;
    /// Switch mode, bank the return state and jump to `vector`.
    fn enter_exception(&mut self, exception: Exception, vector: u32);

    fn snapshot(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
    fn restore(&mut self, _state: &serde_json::Value) -> SimResult<()> {
        Ok(())
    }
}

/// Everything an executing instruction may reach: virtual memory, the
/// coprocessor and the wait-for-interrupt request.
pub struct SystemContext<'a> {
    pub bus: &'a mut SystemBus,
    pub cp15: &'a mut ControlRegisterFile,
    privileged: bool,
    wait_for_interrupt: bool,
}

impl<'a> SystemContext<'a> {
    pub fn new(bus: &'a mut SystemBus, cp15: &'a mut ControlRegisterFile, privileged: bool) -> Self {
        Self {
            bus,
            cp15,
            privileged,
            wait_for_interrupt: false,
        }
    }

    pub fn privileged(&self) -> bool {
        self.privileged
    }

    pub fn translate(&mut self, vaddr: u32, access: AccessKind) -> SimResult<u32> {
        mmu::translate(self.cp15, self.bus, vaddr, access)
    }

    pub fn fetch(&mut self, vaddr: u32) -> SimResult<u32> {
        if vaddr % 4 != 0 {
            return Err(self.alignment_fault(vaddr, false));
        }
        let pa = self.translate(vaddr, AccessKind::fetch(self.privileged))?;
        self.bus.load(pa, Width::Word)
    }

    pub fn load(&mut self, vaddr: u32, width: Width) -> SimResult<u32> {
        self.load_as(vaddr, width, self.privileged)
    }

    pub fn store(&mut self, vaddr: u32, width: Width, value: u32) -> SimResult<()> {
        self.store_as(vaddr, width, value, self.privileged)
    }

    /// LDRT-style access checked as if from user mode.
    pub fn load_unprivileged(&mut self, vaddr: u32, width: Width) -> SimResult<u32> {
        self.load_as(vaddr, width, false)
    }

    pub fn store_unprivileged(&mut self, vaddr: u32, width: Width, value: u32) -> SimResult<()> {
        self.store_as(vaddr, width, value, false)
    }

    pub fn coprocessor_read(&mut self, key: RegisterKey) -> SimResult<u32> {
        self.cp15.read(key)
    }

    pub fn coprocessor_write(&mut self, key: RegisterKey, value: u32) -> SimResult<()> {
        self.cp15.write(key, value)
    }

    pub fn wait_for_interrupt(&mut self) {
        self.wait_for_interrupt = true;
    }

    pub fn waiting_for_interrupt(&self) -> bool {
        self.wait_for_interrupt
    }

    fn alignment_fault(&mut self, vaddr: u32, is_write: bool) -> SimulationError {
        self.cp15.set_memory_abort(vaddr, status::ALIGNMENT, is_write);
        GuestFault::Alignment { addr: vaddr }.into()
    }

    fn load_as(&mut self, vaddr: u32, width: Width, privileged: bool) -> SimResult<u32> {
        if vaddr % width.bytes() != 0 {
            if self.cp15.translation().check_unaligned {
                return Err(self.alignment_fault(vaddr, false));
            }
            let mut value = 0;
            for i in 0..width.bytes() {
                let byte = self.load_as(vaddr.wrapping_add(i), Width::Byte, privileged)?;
                value |= byte << (i * 8);
            }
            return Ok(value);
        }
        let pa = self.translate(vaddr, AccessKind::read(privileged))?;
        self.bus.load(pa, width)
    }

    fn store_as(&mut self, vaddr: u32, width: Width, value: u32, privileged: bool) -> SimResult<()> {
        if vaddr % width.bytes() != 0 {
            if self.cp15.translation().check_unaligned {
                return Err(self.alignment_fault(vaddr, true));
            }
            for i in 0..width.bytes() {
                self.store_as(
                    vaddr.wrapping_add(i),
                    Width::Byte,
                    (value >> (i * 8)) & 0xFF,
                    privileged,
                )?;
            }
            return Ok(());
        }
        let pa = self.translate(vaddr, AccessKind::write(privileged))?;
        self.bus.store(pa, width, value)
    }
}
