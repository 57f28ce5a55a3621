// ArmVirt - ARMv7-A Platform Emulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Cooperative run loop.
//!
//! The host calls [`Machine::run_batch`] repeatedly. Each call executes at
//! most one batch of steps and returns, so the host thread is never blocked
//! for longer than a batch. Interrupts raised between calls are picked up at
//! the top of the next step.

use crate::engine::{BranchKind, Exception, ExecutionEngine, Retire, SystemContext};
use crate::{GuestFault, Machine, SimResult, SimulationError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// PC reached the configured stop address.
    Breakpoint(u32),
    /// The instruction at this PC matched the configured stop instruction.
    BreakInstruction(u32),
    CounterReached(u64),
    Branch { from: u32, to: u32 },
    FunctionCall { from: u32, to: u32 },
    RemainingExhausted,
    ManualStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Budget used up; call again.
    Yielded { executed: u32 },
    /// Waiting for an interrupt; call again after a longer pause.
    Halted,
    Stopped(StopReason),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionState {
    /// PC as of the last stop, yield or snapshot.
    #[serde(default)]
    pub pc: u32,
    pub instructions: u64,
    pub running: bool,
    pub halted: bool,
    /// Instructions left before a `RemainingExhausted` stop.
    pub remaining: Option<u64>,
    /// Breakpoint address to step over on the next step after resuming.
    #[serde(default)]
    pub step_over: Option<u32>,
}

enum Step {
    Continue,
    Halted,
    Stop(StopReason),
}

impl<E: ExecutionEngine> Machine<E> {
    pub fn start(&mut self) {
        if self.state.running {
            return;
        }
        self.state.running = true;
        let pc = self.engine.pc();
        tracing::info!("Running from pc={:#010x}", pc);
        for observer in &self.observers {
            observer.on_state_changed(true, pc);
        }
    }

    /// Request a stop. Takes effect at the start of the next batch.
    pub fn stop(&mut self) {
        self.state.running = false;
    }

    /// Start, stopping after `count` more instructions.
    pub fn run_for(&mut self, count: u64) {
        self.state.remaining = Some(count);
        self.start();
    }

    /// Execute one bounded batch.
    pub fn run_batch(&mut self) -> SimResult<BatchOutcome> {
        if !self.state.running {
            return Ok(BatchOutcome::Stopped(self.finish(StopReason::ManualStop)));
        }
        if self.state.remaining == Some(0) {
            return Ok(BatchOutcome::Stopped(
                self.finish(StopReason::RemainingExhausted),
            ));
        }

        let mut budget = u64::from(self.config.batch_size.max(1));
        if let Some(remaining) = self.state.remaining {
            budget = budget.min(remaining);
        }
        if let Some(target) = self.config.stop_counter {
            if target > self.state.instructions {
                budget = budget.min(target - self.state.instructions);
            }
        }

        let mut executed = 0u32;
        while u64::from(executed) < budget {
            match self.step()? {
                Step::Continue => executed += 1,
                Step::Halted => {
                    self.state.pc = self.engine.pc();
                    return Ok(BatchOutcome::Halted);
                }
                Step::Stop(reason) => return Ok(BatchOutcome::Stopped(self.finish(reason))),
            }
        }
        self.state.pc = self.engine.pc();
        Ok(BatchOutcome::Yielded { executed })
    }

    /// Run batches until the machine stops, halts or `max_batches` have run.
    pub fn run(&mut self, max_batches: u32) -> SimResult<BatchOutcome> {
        self.start();
        let mut outcome = BatchOutcome::Yielded { executed: 0 };
        for _ in 0..max_batches {
            outcome = self.run_batch()?;
            if !matches!(outcome, BatchOutcome::Yielded { .. }) {
                break;
            }
        }
        Ok(outcome)
    }

    fn step(&mut self) -> SimResult<Step> {
        let interrupts = self.board.interrupts.clone();
        if !self.config.suppress_interrupts && interrupts.is_pending() {
            if self.state.halted {
                tracing::debug!("Woken from WFI by pending interrupt");
                self.state.halted = false;
            }
            if !self.engine.irq_masked() {
                let irq = interrupts.accept().map_err(|e| self.fatal(e))?;
                tracing::debug!("Delivering IRQ {}", irq);
                self.take_exception(Exception::Irq);
            }
        }
        if self.state.halted {
            return Ok(Step::Halted);
        }

        let pc = self.engine.pc();
        let step_over = self.state.step_over.take();
        if self.config.stop_address == Some(pc) && step_over != Some(pc) {
            return Ok(Step::Stop(StopReason::Breakpoint(pc)));
        }

        let privileged = self.engine.is_privileged();
        let fetched =
            SystemContext::new(&mut self.board.bus, &mut self.board.cp15, privileged).fetch(pc);
        let raw = match fetched {
            Ok(raw) => raw,
            Err(e) => return self.redirect(e, true),
        };
        for observer in &self.observers {
            observer.on_step_start(pc, raw);
        }

        if self.config.stop_instruction == Some(raw) && step_over != Some(pc) {
            return Ok(Step::Stop(StopReason::BreakInstruction(pc)));
        }

        let instr = match self.engine.decode(raw) {
            Ok(instr) => instr,
            Err(e) => return self.redirect(e, false),
        };

        let retire = if self.engine.condition_passed(&instr) {
            let mut sys = SystemContext::new(&mut self.board.bus, &mut self.board.cp15, privileged);
            let result = self.engine.execute(&instr, &mut sys);
            let wfi = sys.waiting_for_interrupt();
            match result {
                Ok(retire) => {
                    if wfi {
                        tracing::debug!("WFI at pc={:#010x}", pc);
                        self.state.halted = true;
                    }
                    retire
                }
                Err(e) => return self.redirect(e, false),
            }
        } else {
            Retire::Next
        };

        let next = match retire {
            Retire::Next => pc.wrapping_add(4),
            Retire::Branch { target, kind } => {
                for observer in &self.observers {
                    observer.on_branch(pc, target, kind);
                }
                target
            }
        };
        self.engine.set_pc(next);
        self.state.instructions += 1;

        let mut reason = None;
        if let Some(remaining) = self.state.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                reason = Some(StopReason::RemainingExhausted);
            }
        }
        if self.config.stop_counter == Some(self.state.instructions) {
            reason = Some(StopReason::CounterReached(self.state.instructions));
        }
        if let Retire::Branch { target, kind } = retire {
            if self.config.stop_at_every_branch {
                reason = Some(StopReason::Branch {
                    from: pc,
                    to: target,
                });
            }
            if self.config.stop_at_every_funccall && kind == BranchKind::Call {
                reason = Some(StopReason::FunctionCall {
                    from: pc,
                    to: target,
                });
            }
        }
        Ok(reason.map_or(Step::Continue, Step::Stop))
    }

    /// Turn a guest fault into an exception entry; anything else halts the run.
    fn redirect(&mut self, err: SimulationError, fetching: bool) -> SimResult<Step> {
        match err {
            SimulationError::Guest(fault) => {
                self.take_exception(exception_for(&fault, fetching));
                Ok(Step::Continue)
            }
            other => Err(self.fatal(other)),
        }
    }

    fn take_exception(&mut self, exception: Exception) {
        let pc = self.engine.pc();
        let vector = self
            .board
            .cp15
            .vector_base()
            .wrapping_add(exception.vector_offset());
        tracing::debug!("{:?} at pc={:#010x}, vector {:#010x}", exception, pc, vector);
        for observer in &self.observers {
            observer.on_exception(exception, pc);
        }
        self.engine.enter_exception(exception, vector);
    }

    fn finish(&mut self, reason: StopReason) -> StopReason {
        let pc = self.engine.pc();
        self.state.running = false;
        self.state.pc = pc;
        self.state.step_over = match reason {
            StopReason::Breakpoint(addr) | StopReason::BreakInstruction(addr) => Some(addr),
            _ => None,
        };
        if reason == StopReason::RemainingExhausted {
            self.state.remaining = None;
        }
        tracing::info!(
            "Stopped at pc={:#010x} after {} instructions: {:?}",
            pc,
            self.state.instructions,
            reason
        );
        for observer in &self.observers {
            observer.on_state_changed(false, pc);
        }
        reason
    }

    fn fatal(&mut self, err: SimulationError) -> SimulationError {
        let pc = self.engine.pc();
        self.state.running = false;
        self.state.pc = pc;
        tracing::error!("Halting at pc={:#010x}: {}", pc, err);
        for observer in &self.observers {
            observer.on_state_changed(false, pc);
        }
        SimulationError::Fatal {
            pc,
            source: Box::new(err),
        }
    }
}

fn exception_for(fault: &GuestFault, fetching: bool) -> Exception {
    match fault {
        GuestFault::Undefined { .. } => Exception::Undefined,
        GuestFault::SupervisorCall { .. } => Exception::SupervisorCall,
        _ if fetching => Exception::PrefetchAbort,
        _ => Exception::DataAbort,
    }
}
