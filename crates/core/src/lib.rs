// ArmVirt - ARMv7-A Platform Emulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

pub mod boot;
pub mod bus;
pub mod config;
pub mod cp15;
pub mod engine;
pub mod interrupt;
pub mod memory;
pub mod mmu;
pub mod peripherals;
pub mod scheduler;
pub mod snapshot;
pub mod system;

use std::sync::Arc;

pub use bus::Width;
pub use config::SchedulerConfig;
pub use cp15::RegisterKey;
pub use engine::{BranchKind, Exception, ExecutionEngine, Retire, SystemContext};
pub use scheduler::{BatchOutcome, ExecutionState, StopReason};
pub use system::Board;

mod tests;

/// Which table level produced a memory abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FaultLevel {
    Section,
    Page,
}

/// Faults the guest is expected to handle itself. The scheduler redirects
/// each of these into the matching exception vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GuestFault {
    #[error("translation fault ({level:?}) at {vaddr:#010x}")]
    Translation { level: FaultLevel, vaddr: u32 },
    #[error("permission fault ({level:?}) at {vaddr:#010x}")]
    Permission { level: FaultLevel, vaddr: u32 },
    #[error("domain fault ({level:?}, domain {domain}) at {vaddr:#010x}")]
    Domain {
        level: FaultLevel,
        domain: u8,
        vaddr: u32,
    },
    #[error("alignment fault at {addr:#010x}")]
    Alignment { addr: u32 },
    #[error("undefined instruction {raw:#010x}")]
    Undefined { raw: u32 },
    #[error("supervisor call {imm:#x}")]
    SupervisorCall { imm: u32 },
}

impl GuestFault {
    /// Fault status code written to DFSR/IFSR, for memory aborts only.
    pub fn status_code(&self) -> Option<u32> {
        use mmu::status;
        match *self {
            GuestFault::Translation { level, .. } => Some(match level {
                FaultLevel::Section => status::TRANSLATION_SECTION,
                FaultLevel::Page => status::TRANSLATION_PAGE,
            }),
            GuestFault::Permission { level, .. } => Some(match level {
                FaultLevel::Section => status::PERMISSION_SECTION,
                FaultLevel::Page => status::PERMISSION_PAGE,
            }),
            GuestFault::Domain { level, .. } => Some(match level {
                FaultLevel::Section => status::DOMAIN_SECTION,
                FaultLevel::Page => status::DOMAIN_PAGE,
            }),
            GuestFault::Alignment { .. } => Some(status::ALIGNMENT),
            GuestFault::Undefined { .. } | GuestFault::SupervisorCall { .. } => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error(transparent)]
    Guest(#[from] GuestFault),
    #[error("no bus region maps physical address {0:#010x}")]
    Unmapped(u32),
    #[error("configuration fault: {0}")]
    Configuration(String),
    #[error("unknown coprocessor register {0}")]
    UnknownRegister(RegisterKey),
    #[error("coprocessor register {key} does not permit {op}")]
    RegisterAccess { key: RegisterKey, op: &'static str },
    #[error("interrupt protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("execution engine error: {0}")]
    Engine(String),
    #[error("halted at pc={pc:#010x}: {source}")]
    Fatal {
        pc: u32,
        #[source]
        source: Box<SimulationError>,
    },
}

impl SimulationError {
    /// True for faults that are redirected into the guest instead of halting the run.
    pub fn is_guest_recoverable(&self) -> bool {
        matches!(self, SimulationError::Guest(_))
    }
}

pub type SimResult<T> = Result<T, SimulationError>;

/// Trait for observing simulation events without coupling the core to any presentation layer.
pub trait SimulationObserver: std::fmt::Debug + Send + Sync {
    fn on_state_changed(&self, _running: bool, _pc: u32) {}
    fn on_step_start(&self, _pc: u32, _opcode: u32) {}
    fn on_branch(&self, _from: u32, _to: u32, _kind: BranchKind) {}
    fn on_exception(&self, _exception: Exception, _pc: u32) {}
}

/// Trait representing a memory-mapped peripheral register block.
///
/// Reads take `&mut self` because some registers (interrupt acknowledge,
/// clear-on-read status) change device state when read.
pub trait Peripheral: std::fmt::Debug + Send {
    fn read(&mut self, offset: u32, width: Width) -> SimResult<u32>;
    fn write(&mut self, offset: u32, width: Width, value: u32) -> SimResult<()>;
    fn snapshot(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
    fn restore(&mut self, _state: &serde_json::Value) -> SimResult<()> {
        Ok(())
    }
}

pub struct Machine<E: ExecutionEngine> {
    pub engine: E,
    pub board: Board,
    pub config: SchedulerConfig,
    pub state: ExecutionState,
    pub observers: Vec<Arc<dyn SimulationObserver>>,
}

impl<E: ExecutionEngine> Machine<E> {
    pub fn new(engine: E, board: Board, config: SchedulerConfig) -> Self {
        Self {
            engine,
            board,
            config,
            state: ExecutionState::default(),
            observers: Vec::new(),
        }
    }

    pub fn add_observer(&mut self, observer: Arc<dyn SimulationObserver>) {
        self.observers.push(observer);
    }

    /// Copy the kernel (and optional initrd) into RAM, write the boot
    /// parameter block and point the core at the kernel entry.
    pub fn boot(
        &mut self,
        boot: &armvirt_config::BootConfig,
        kernel: &[u8],
        initrd: Option<&[u8]>,
    ) -> SimResult<()> {
        self.board.bus.load_image(boot.kernel_addr, kernel)?;

        let mut params = boot::BootParams::new(
            self.board.bus.ram.base_addr,
            self.board.bus.ram.size(),
            boot,
        );
        if let Some(data) = initrd {
            let addr = boot.initrd.map(|i| i.addr).ok_or_else(|| {
                SimulationError::Configuration(
                    "initrd image supplied but boot.initrd.addr is not configured".to_string(),
                )
            })?;
            self.board.bus.load_image(addr, data)?;
            params.initrd = Some((addr, data.len() as u32));
        }
        let end = params.write(&mut self.board.bus, boot.atags_addr)?;
        tracing::info!(
            "Boot parameter block at {:#010x}..{:#010x}, kernel entry {:#010x}",
            boot.atags_addr,
            end,
            boot.kernel_addr
        );

        self.engine.reset();
        self.engine.set_register(0, 0);
        self.engine.set_register(1, boot.machine_type);
        self.engine.set_register(2, boot.atags_addr);
        self.engine.set_pc(boot.kernel_addr);
        self.state = ExecutionState::default();
        Ok(())
    }

    pub fn snapshot(&self) -> snapshot::Snapshot {
        let mut snap = self.board.snapshot();
        snap.state.execution = ExecutionState {
            pc: self.engine.pc(),
            ..self.state.clone()
        };
        snap.state.engine = self.engine.snapshot();
        snap
    }

    /// Restore engine, board and execution state from `snap`. On error
    /// nothing changes.
    pub fn apply_snapshot(&mut self, snap: &snapshot::Snapshot) -> SimResult<()> {
        let previous = self.engine.snapshot();
        let previous_pc = self.engine.pc();
        self.restore_engine(&snap.state.engine, snap.state.execution.pc)?;
        if let Err(e) = self.board.apply_snapshot(snap) {
            if let Err(rollback) = self.restore_engine(&previous, previous_pc) {
                tracing::warn!("Could not roll back engine state: {}", rollback);
            }
            return Err(e);
        }
        self.state = snap.state.execution.clone();
        Ok(())
    }

    fn restore_engine(&mut self, state: &serde_json::Value, pc: u32) -> SimResult<()> {
        if state.is_null() {
            // Engine keeps no state of its own; at least restore the PC
            self.engine.set_pc(pc);
            Ok(())
        } else {
            self.engine.restore(state)
        }
    }
}
