// ArmVirt - ARMv7-A Platform Emulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Priority-less interrupt controller.
//!
//! Each line moves Idle -> Pending -> Acknowledged -> Idle. Peripherals
//! append to `pending` at any time between scheduler batches; the scheduler
//! moves the head of `pending` to `acknowledged` when it delivers an IRQ,
//! and the guest closes it with an end-of-interrupt write.

use crate::{SimResult, SimulationError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptSnapshot {
    pub pending: Vec<u32>,
    pub acknowledged: Vec<u32>,
    pub enabled: bool,
}

#[derive(Debug, Default)]
struct InterruptQueues {
    pending: VecDeque<u32>,
    acknowledged: VecDeque<u32>,
    enabled: bool,
}

/// Shared handle to the interrupt queues. Clones refer to the same state.
#[derive(Debug, Clone, Default)]
pub struct InterruptController {
    queues: Arc<Mutex<InterruptQueues>>,
}

impl InterruptController {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, InterruptQueues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `irq`. Only an immediately repeated raise of the newest pending
    /// entry is suppressed; the same id may still appear further back.
    pub fn raise(&self, irq: u32) {
        let mut q = self.lock();
        if q.pending.back() == Some(&irq) {
            tracing::trace!("IRQ {} already at tail of pending queue", irq);
            return;
        }
        q.pending.push_back(irq);
        tracing::trace!("IRQ {} raised, {} pending", irq, q.pending.len());
    }

    pub fn is_pending(&self) -> bool {
        let q = self.lock();
        q.enabled && !q.pending.is_empty()
    }

    /// Move the head of `pending` to the tail of `acknowledged`.
    pub fn accept(&self) -> SimResult<u32> {
        let mut q = self.lock();
        let irq = q.pending.pop_front().ok_or_else(|| {
            SimulationError::ProtocolViolation("accept with no pending interrupt".to_string())
        })?;
        q.acknowledged.push_back(irq);
        tracing::debug!("IRQ {} accepted", irq);
        Ok(irq)
    }

    /// End-of-interrupt. `irq` must be the oldest acknowledged interrupt;
    /// on mismatch nothing changes.
    pub fn complete(&self, irq: u32) -> SimResult<()> {
        let mut q = self.lock();
        match q.acknowledged.front() {
            Some(&head) if head == irq => {
                q.acknowledged.pop_front();
                tracing::debug!("IRQ {} completed", irq);
                Ok(())
            }
            head => Err(SimulationError::ProtocolViolation(format!(
                "EOI for IRQ {} but oldest acknowledged is {:?}",
                irq, head
            ))),
        }
    }

    /// Drop every pending entry for `irq`. Acknowledged entries are kept.
    pub fn withdraw(&self, irq: u32) {
        let mut q = self.lock();
        let before = q.pending.len();
        q.pending.retain(|&p| p != irq);
        if q.pending.len() != before {
            tracing::debug!("IRQ {} withdrawn from pending queue", irq);
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        let mut q = self.lock();
        if q.enabled != enabled {
            tracing::debug!("Interrupt distribution {}", if enabled { "enabled" } else { "disabled" });
        }
        q.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    pub fn pending(&self) -> Vec<u32> {
        self.lock().pending.iter().copied().collect()
    }

    pub fn acknowledged(&self) -> Vec<u32> {
        self.lock().acknowledged.iter().copied().collect()
    }

    pub fn oldest_acknowledged(&self) -> Option<u32> {
        self.lock().acknowledged.front().copied()
    }

    pub fn next_pending(&self) -> Option<u32> {
        self.lock().pending.front().copied()
    }

    /// A raise-only handle for a peripheral wired to `irq`.
    pub fn line(&self, irq: u32) -> IrqLine {
        IrqLine {
            irq,
            controller: self.clone(),
        }
    }

    pub fn snapshot(&self) -> InterruptSnapshot {
        let q = self.lock();
        InterruptSnapshot {
            pending: q.pending.iter().copied().collect(),
            acknowledged: q.acknowledged.iter().copied().collect(),
            enabled: q.enabled,
        }
    }

    pub fn restore(&self, snap: &InterruptSnapshot) {
        let mut q = self.lock();
        q.pending = snap.pending.iter().copied().collect();
        q.acknowledged = snap.acknowledged.iter().copied().collect();
        q.enabled = snap.enabled;
    }
}

/// Interrupt-raise callback handed to peripherals.
#[derive(Debug, Clone)]
pub struct IrqLine {
    irq: u32,
    controller: InterruptController,
}

impl IrqLine {
    pub fn irq(&self) -> u32 {
        self.irq
    }

    pub fn raise(&self) {
        self.controller.raise(self.irq);
    }
}
