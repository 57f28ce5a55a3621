// ArmVirt - ARMv7-A Platform Emulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

#[cfg(test)]
mod integration_tests {
    use crate::cp15::regs;
    use crate::memory::LinearMemory;
    use crate::peripherals::gic::GicCpuInterface;
    use crate::{
        BatchOutcome, Board, BranchKind, Exception, ExecutionEngine, GuestFault, Machine,
        RegisterKey, Retire, SchedulerConfig, SimResult, SimulationError, SimulationObserver,
        StopReason, SystemContext, Width,
    };
    use serde::{Deserialize, Serialize};
    use std::sync::{Arc, Mutex};

    const RAM_SIZE: usize = 0x1_0000;
    const PROGRAM: u32 = 0x1000;
    const L1_TABLE: u32 = 0x4000;

    const NOP: u32 = 0xE1A0_0000;
    const UDF: u32 = 0xE7F0_00F0;
    const WFI: u32 = 0xE320_F003;
    const BX_LR: u32 = 0xE12F_FF1E;
    /// `b .`
    const SPIN: u32 = 0xEAFF_FFFE;
    /// `subs pc, lr, #4`
    const IRQ_RETURN: u32 = 0xE25E_F004;
    const GICC: u32 = 0x2000_0000;

    fn b(from: u32, to: u32) -> u32 {
        0xEA00_0000 | ((to.wrapping_sub(from).wrapping_sub(8) >> 2) & 0x00FF_FFFF)
    }

    fn bl(from: u32, to: u32) -> u32 {
        b(from, to) | 0x0100_0000
    }

    fn svc(imm: u32) -> u32 {
        0xEF00_0000 | imm
    }

    fn ldr(rt: u32, rn: u32) -> u32 {
        0xE590_0000 | (rn << 16) | (rt << 12)
    }

    fn str_(rt: u32, rn: u32) -> u32 {
        0xE580_0000 | (rn << 16) | (rt << 12)
    }

    fn add_imm(rd: u32, rn: u32, imm: u32) -> u32 {
        0xE280_0000 | (rn << 16) | (rd << 12) | imm
    }

    fn cmp_imm(rn: u32, imm: u32) -> u32 {
        0xE350_0000 | (rn << 16) | imm
    }

    fn mcr(key: RegisterKey, rt: u32) -> u32 {
        0xEE00_0F10
            | ((key.crn() as u32) << 16)
            | ((key.op1() as u32) << 21)
            | (rt << 12)
            | ((key.op2() as u32) << 5)
            | key.crm() as u32
    }

    fn mrc(key: RegisterKey, rt: u32) -> u32 {
        mcr(key, rt) | (1 << 20)
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Nop,
        Branch { target: u32, link: bool },
        Return,
        ExceptionReturn,
        Svc(u32),
        Wfi,
        Ldr { rt: usize, rn: usize },
        Str { rt: usize, rn: usize },
        Mcr { key: RegisterKey, rt: usize },
        Mrc { key: RegisterKey, rt: usize },
        Mov { rd: usize, imm: u32 },
        Add { rd: usize, rn: usize, imm: u32 },
        Cmp { rn: usize, imm: u32 },
    }

    #[derive(Debug, Clone, Copy)]
    struct Instr {
        cond: u32,
        op: Op,
    }

    /// A tiny ARM-flavoured engine covering just what the scheduler tests need.
    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct TestEngine {
        regs: [u32; 16],
        pc: u32,
        privileged: bool,
        irq_masked: bool,
        z: bool,
        exceptions: Vec<(Exception, u32)>,
    }

    impl TestEngine {
        fn new() -> Self {
            Self {
                privileged: true,
                ..Self::default()
            }
        }
    }

    impl ExecutionEngine for TestEngine {
        type Instruction = Instr;

        fn reset(&mut self) {
            *self = Self::new();
        }

        fn pc(&self) -> u32 {
            self.pc
        }

        fn set_pc(&mut self, pc: u32) {
            self.pc = pc;
        }

        fn register(&self, index: u8) -> u32 {
            if index == 15 {
                self.pc
            } else {
                self.regs[index as usize]
            }
        }

        fn set_register(&mut self, index: u8, value: u32) {
            self.regs[index as usize] = value;
        }

        fn is_privileged(&self) -> bool {
            self.privileged
        }

        fn irq_masked(&self) -> bool {
            self.irq_masked
        }

        fn decode(&mut self, raw: u32) -> SimResult<Instr> {
            let cond = raw >> 28;
            let rd = ((raw >> 12) & 0xF) as usize;
            let rn = ((raw >> 16) & 0xF) as usize;
            let op = match (raw >> 24) & 0xF {
                0xA | 0xB => {
                    let offset = (((raw & 0x00FF_FFFF) << 8) as i32) >> 6;
                    Op::Branch {
                        target: self.pc.wrapping_add(8).wrapping_add(offset as u32),
                        link: raw & 0x0100_0000 != 0,
                    }
                }
                0xF => Op::Svc(raw & 0x00FF_FFFF),
                _ if raw & 0x0FFF_FFFF == 0x01A0_0000 => Op::Nop,
                _ if raw & 0x0FFF_FFFF == 0x012F_FF1E => Op::Return,
                _ if raw & 0x0FFF_FFFF == 0x0320_F003 => Op::Wfi,
                _ if raw & 0x0FFF_FFFF == 0x025E_F004 => Op::ExceptionReturn,
                _ if raw & 0x0FF0_0000 == 0x0590_0000 => Op::Ldr { rt: rd, rn },
                _ if raw & 0x0FF0_0000 == 0x0580_0000 => Op::Str { rt: rd, rn },
                _ if raw & 0x0FF0_0000 == 0x03A0_0000 => Op::Mov {
                    rd,
                    imm: (raw & 0xFF).rotate_right(((raw >> 8) & 0xF) * 2),
                },
                _ if raw & 0x0FF0_0000 == 0x0280_0000 => Op::Add {
                    rd,
                    rn,
                    imm: raw & 0xFF,
                },
                _ if raw & 0x0FF0_0000 == 0x0350_0000 => Op::Cmp {
                    rn,
                    imm: raw & 0xFF,
                },
                _ if raw & 0x0F00_0F10 == 0x0E00_0F10 => {
                    let key = RegisterKey::from_mcr(raw);
                    if raw & (1 << 20) != 0 {
                        Op::Mrc { key, rt: rd }
                    } else {
                        Op::Mcr { key, rt: rd }
                    }
                }
                _ => return Err(GuestFault::Undefined { raw }.into()),
            };
            Ok(Instr { cond, op })
        }

        fn condition_passed(&self, instr: &Instr) -> bool {
            match instr.cond {
                0x0 => self.z,
                0x1 => !self.z,
                0xE | 0xF => true,
                _ => false,
            }
        }

        fn execute(&mut self, instr: &Instr, sys: &mut SystemContext<'_>) -> SimResult<Retire> {
            match instr.op {
                Op::Nop => {}
                Op::Branch { target, link } => {
                    let kind = if link {
                        self.regs[14] = self.pc.wrapping_add(4);
                        BranchKind::Call
                    } else {
                        BranchKind::Jump
                    };
                    return Ok(Retire::Branch { target, kind });
                }
                Op::Return => {
                    return Ok(Retire::Branch {
                        target: self.regs[14],
                        kind: BranchKind::Return,
                    })
                }
                Op::ExceptionReturn => {
                    self.irq_masked = false;
                    return Ok(Retire::Branch {
                        target: self.regs[14].wrapping_sub(4),
                        kind: BranchKind::Return,
                    });
                }
                Op::Svc(imm) => return Err(GuestFault::SupervisorCall { imm }.into()),
                Op::Wfi => sys.wait_for_interrupt(),
                Op::Ldr { rt, rn } => self.regs[rt] = sys.load(self.regs[rn], Width::Word)?,
                Op::Str { rt, rn } => sys.store(self.regs[rn], Width::Word, self.regs[rt])?,
                Op::Mcr { key, rt } => sys.coprocessor_write(key, self.regs[rt])?,
                Op::Mrc { key, rt } => self.regs[rt] = sys.coprocessor_read(key)?,
                Op::Mov { rd, imm } => self.regs[rd] = imm,
                Op::Add { rd, rn, imm } => self.regs[rd] = self.regs[rn].wrapping_add(imm),
                Op::Cmp { rn, imm } => self.z = self.regs[rn] == imm,
            }
            Ok(Retire::Next)
        }

        fn enter_exception(&mut self, exception: Exception, vector: u32) {
            self.exceptions.push((exception, self.pc));
            self.regs[14] = self.pc.wrapping_add(4);
            self.privileged = true;
            self.irq_masked = true;
            self.pc = vector;
        }

        fn snapshot(&self) -> serde_json::Value {
            serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
        }

        fn restore(&mut self, state: &serde_json::Value) -> SimResult<()> {
            *self = serde_json::from_value(state.clone())
                .map_err(|e| SimulationError::Engine(e.to_string()))?;
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl SimulationObserver for Recorder {
        fn on_state_changed(&self, running: bool, pc: u32) {
            self.push(format!("state {} {:#x}", running, pc));
        }

        fn on_branch(&self, from: u32, to: u32, kind: BranchKind) {
            self.push(format!("branch {:#x}->{:#x} {:?}", from, to, kind));
        }

        fn on_exception(&self, exception: Exception, pc: u32) {
            self.push(format!("exception {:?} {:#x}", exception, pc));
        }
    }

    fn board(program: &[u32]) -> Board {
        let mut board = Board::new(LinearMemory::new(RAM_SIZE, 0));
        // Every vector spins in place
        for i in 0..8 {
            assert!(board.bus.ram.write_u32(i * 4, SPIN));
        }
        let bytes: Vec<u8> = program.iter().flat_map(|w| w.to_le_bytes()).collect();
        board.bus.load_image(PROGRAM, &bytes).unwrap();
        board
    }

    fn machine_with(program: &[u32], config: SchedulerConfig) -> Machine<TestEngine> {
        let mut m = Machine::new(TestEngine::new(), board(program), config);
        m.engine.set_pc(PROGRAM);
        m
    }

    fn counter(n: u64) -> SchedulerConfig {
        SchedulerConfig {
            stop_counter: Some(n),
            ..SchedulerConfig::default()
        }
    }

    /// Identity-map the first MiB, full access, domain 0 client.
    fn enable_mmu(m: &mut Machine<TestEngine>) {
        assert!(m.board.bus.ram.write_u32(L1_TABLE, 0x0000_0C02));
        m.board.cp15.write(regs::TTBR0, L1_TABLE).unwrap();
        m.board.cp15.write(regs::DACR, 1).unwrap();
        m.board.cp15.write(regs::SCTLR, 1).unwrap();
    }

    #[test]
    fn test_stop_counter_executes_exact_count() {
        let program = [NOP, b(0x1004, 0x1000)];
        let mut m = machine_with(
            &program,
            SchedulerConfig {
                batch_size: 64,
                ..counter(1000)
            },
        );
        let outcome = m.run(100).unwrap();
        assert_eq!(
            outcome,
            BatchOutcome::Stopped(StopReason::CounterReached(1000))
        );
        assert_eq!(m.state.instructions, 1000);
        assert_eq!(m.state.pc, 0x1000);
        assert!(!m.state.running);
    }

    #[test]
    fn test_batches_yield_to_host() {
        let mut m = machine_with(
            &[NOP, b(0x1004, 0x1000)],
            SchedulerConfig {
                batch_size: 10,
                ..SchedulerConfig::default()
            },
        );
        m.start();
        assert_eq!(
            m.run_batch().unwrap(),
            BatchOutcome::Yielded { executed: 10 }
        );
        assert_eq!(
            m.run_batch().unwrap(),
            BatchOutcome::Yielded { executed: 10 }
        );
        assert_eq!(m.state.instructions, 20);
        assert!(m.state.running);
    }

    #[test]
    fn test_manual_stop_is_observed_at_next_batch() {
        let mut m = machine_with(&[NOP, b(0x1004, 0x1000)], SchedulerConfig::default());
        m.start();
        m.stop();
        assert_eq!(
            m.run_batch().unwrap(),
            BatchOutcome::Stopped(StopReason::ManualStop)
        );
        assert_eq!(m.state.instructions, 0);
    }

    #[test]
    fn test_breakpoint_stops_and_resumes() {
        let program = [NOP, NOP, NOP, b(0x100C, 0x1000)];
        let mut m = machine_with(
            &program,
            SchedulerConfig {
                stop_address: Some(0x1008),
                ..SchedulerConfig::default()
            },
        );
        assert_eq!(
            m.run(10).unwrap(),
            BatchOutcome::Stopped(StopReason::Breakpoint(0x1008))
        );
        assert_eq!(m.state.instructions, 2);
        assert_eq!(m.engine.pc, 0x1008);

        // Resuming steps over the breakpoint once
        assert_eq!(
            m.run(10).unwrap(),
            BatchOutcome::Stopped(StopReason::Breakpoint(0x1008))
        );
        assert_eq!(m.state.instructions, 6);
    }

    #[test]
    fn test_stop_instruction() {
        let mut m = machine_with(
            &[NOP, NOP, UDF],
            SchedulerConfig {
                stop_instruction: Some(UDF),
                ..SchedulerConfig::default()
            },
        );
        assert_eq!(
            m.run(10).unwrap(),
            BatchOutcome::Stopped(StopReason::BreakInstruction(0x1008))
        );
        assert_eq!(m.state.instructions, 2);
        assert!(m.engine.exceptions.is_empty());
    }

    #[test]
    fn test_stop_at_every_branch_and_funccall() {
        let program = [b(0x1000, 0x1008), NOP, bl(0x1008, 0x1010), NOP, NOP];
        let mut m = machine_with(
            &program,
            SchedulerConfig {
                stop_at_every_branch: true,
                ..SchedulerConfig::default()
            },
        );
        assert_eq!(
            m.run(10).unwrap(),
            BatchOutcome::Stopped(StopReason::Branch {
                from: 0x1000,
                to: 0x1008
            })
        );

        let mut m = machine_with(
            &program,
            SchedulerConfig {
                stop_at_every_funccall: true,
                ..SchedulerConfig::default()
            },
        );
        assert_eq!(
            m.run(10).unwrap(),
            BatchOutcome::Stopped(StopReason::FunctionCall {
                from: 0x1008,
                to: 0x1010
            })
        );
        assert_eq!(m.state.instructions, 2);
        assert_eq!(m.engine.regs[14], 0x100C);
    }

    #[test]
    fn test_run_for_counts_down_remaining() {
        let mut m = machine_with(&[NOP, b(0x1004, 0x1000)], SchedulerConfig::default());
        m.run_for(7);
        assert_eq!(
            m.run(10).unwrap(),
            BatchOutcome::Stopped(StopReason::RemainingExhausted)
        );
        assert_eq!(m.state.instructions, 7);
        assert_eq!(m.state.remaining, None);
    }

    #[test]
    fn test_condition_codes_gate_execution() {
        // mov r0, #1; cmp r0, #1; addeq r2, r2, #5; cmp r0, #0; addeq r2, r2, #7
        let program = [
            0xE3A0_0001,
            cmp_imm(0, 1),
            add_imm(2, 2, 5) & 0x0FFF_FFFF,
            cmp_imm(0, 0),
            add_imm(2, 2, 7) & 0x0FFF_FFFF,
        ];
        let mut m = machine_with(&program, counter(5));
        m.run(10).unwrap();
        assert_eq!(m.engine.regs[2], 5);
        // Failed conditions still retire
        assert_eq!(m.engine.pc, 0x1014);
    }

    #[test]
    fn test_undefined_instruction_is_redirected() {
        let mut m = machine_with(&[UDF], SchedulerConfig::default());
        m.run_for(2);
        assert_eq!(
            m.run(10).unwrap(),
            BatchOutcome::Stopped(StopReason::RemainingExhausted)
        );
        assert_eq!(m.engine.exceptions, vec![(Exception::Undefined, 0x1000)]);
        assert_eq!(m.engine.pc, 0x04);
        // The faulting instruction did not retire
        assert_eq!(m.state.instructions, 2);
    }

    #[test]
    fn test_supervisor_call_is_redirected() {
        let mut m = machine_with(&[svc(0x42)], counter(1));
        m.run(10).unwrap();
        assert_eq!(m.engine.exceptions, vec![(Exception::SupervisorCall, 0x1000)]);
        assert_eq!(m.engine.pc, 0x08);
        assert_eq!(m.engine.regs[14], 0x1004);
    }

    #[test]
    fn test_prefetch_abort_on_unmapped_fetch() {
        let mut m = machine_with(&[b(0x1000, 0x0010_0000)], counter(2));
        enable_mmu(&mut m);
        m.run(10).unwrap();
        assert_eq!(
            m.engine.exceptions,
            vec![(Exception::PrefetchAbort, 0x0010_0000)]
        );
        assert_eq!(m.engine.pc, 0x0C);
        assert_eq!(m.board.cp15.read(regs::IFAR).unwrap(), 0x0010_0000);
        assert_eq!(m.board.cp15.read(regs::IFSR).unwrap(), 0b00101);
    }

    #[test]
    fn test_data_abort_on_unmapped_load() {
        let mut m = machine_with(&[ldr(0, 1)], counter(1));
        enable_mmu(&mut m);
        m.engine.regs[1] = 0x0020_0000;
        m.run(10).unwrap();
        assert_eq!(m.engine.exceptions, vec![(Exception::DataAbort, 0x1000)]);
        assert_eq!(m.engine.pc, 0x10);
        assert_eq!(m.board.cp15.read(regs::DFAR).unwrap(), 0x0020_0000);
        assert_eq!(m.board.cp15.read(regs::DFSR).unwrap(), 0b00101);
    }

    #[test]
    fn test_high_vectors() {
        let mut m = machine_with(&[UDF], SchedulerConfig::default());
        m.board.cp15.write(regs::SCTLR, 1 << 13).unwrap();
        // No RAM at the high vectors: the handler fetch is fatal
        let err = m.run(10).unwrap_err();
        assert!(matches!(
            err,
            SimulationError::Fatal {
                pc: 0xFFFF_0004,
                ..
            }
        ));
    }

    #[test]
    fn test_coprocessor_access_from_guest() {
        let program = [
            0xE3A0_0ACA, // mov r0, #0xCA000
            mcr(regs::TPIDRURW, 0),
            mrc(regs::MIDR, 3),
        ];
        let mut m = machine_with(&program, counter(3));
        m.run(10).unwrap();
        assert_eq!(m.board.cp15.read(regs::TPIDRURW).unwrap(), 0xCA000);
        assert_eq!(m.engine.regs[3], 0x410F_C090);
    }

    #[test]
    fn test_irq_is_accepted_and_delivered() {
        let mut m = machine_with(&[NOP, NOP], counter(1));
        m.board.interrupts.set_enabled(true);
        m.board.interrupts.raise(29);
        m.run(10).unwrap();
        assert_eq!(m.engine.exceptions, vec![(Exception::Irq, 0x1000)]);
        assert_eq!(m.board.interrupts.acknowledged(), vec![29]);
        assert_eq!(m.engine.pc, 0x18);
    }

    #[test]
    fn test_masked_or_disabled_interrupts_stay_pending() {
        let mut m = machine_with(&[NOP, NOP], counter(2));
        m.engine.irq_masked = true;
        m.board.interrupts.set_enabled(true);
        m.board.interrupts.raise(29);
        m.run(10).unwrap();
        assert!(m.engine.exceptions.is_empty());
        assert_eq!(m.board.interrupts.pending(), vec![29]);

        let mut m = machine_with(&[NOP, NOP], counter(2));
        m.board.interrupts.raise(29);
        m.run(10).unwrap();
        assert!(m.engine.exceptions.is_empty());
    }

    #[test]
    fn test_suppress_interrupts() {
        let mut m = machine_with(
            &[NOP, b(0x1004, 0x1000)],
            SchedulerConfig {
                suppress_interrupts: true,
                ..counter(10)
            },
        );
        m.board.interrupts.set_enabled(true);
        m.board.interrupts.raise(29);
        assert!(m.board.interrupts.is_pending());
        m.run(10).unwrap();
        assert!(m.engine.exceptions.is_empty());
        assert_eq!(m.board.interrupts.pending(), vec![29]);
        assert!(m.board.interrupts.acknowledged().is_empty());
    }

    #[test]
    fn test_wfi_halts_until_interrupt() {
        let mut m = machine_with(&[WFI, NOP], counter(3));
        m.board.interrupts.set_enabled(true);
        m.start();
        assert_eq!(m.run_batch().unwrap(), BatchOutcome::Halted);
        assert!(m.state.halted);
        assert_eq!(m.state.instructions, 1);
        assert_eq!(m.run_batch().unwrap(), BatchOutcome::Halted);
        assert_eq!(m.state.instructions, 1);

        m.board.interrupts.raise(40);
        assert_eq!(
            m.run_batch().unwrap(),
            BatchOutcome::Stopped(StopReason::CounterReached(3))
        );
        assert!(!m.state.halted);
        assert_eq!(m.engine.exceptions, vec![(Exception::Irq, 0x1004)]);
    }

    #[test]
    fn test_wfi_wakes_with_interrupts_masked() {
        let mut m = machine_with(&[WFI, NOP, NOP], counter(2));
        m.engine.irq_masked = true;
        m.board.interrupts.set_enabled(true);
        m.start();
        assert_eq!(m.run_batch().unwrap(), BatchOutcome::Halted);

        m.board.interrupts.raise(40);
        assert_eq!(
            m.run_batch().unwrap(),
            BatchOutcome::Stopped(StopReason::CounterReached(2))
        );
        assert!(m.engine.exceptions.is_empty());
        assert_eq!(m.engine.pc, 0x1008);
        assert_eq!(m.board.interrupts.pending(), vec![40]);
    }

    #[test]
    fn test_wfi_stays_halted_when_interrupts_suppressed() {
        let mut m = machine_with(
            &[WFI, NOP],
            SchedulerConfig {
                suppress_interrupts: true,
                ..SchedulerConfig::default()
            },
        );
        m.board.interrupts.set_enabled(true);
        m.board.interrupts.raise(40);
        m.start();
        assert_eq!(m.run_batch().unwrap(), BatchOutcome::Halted);
        assert_eq!(m.run_batch().unwrap(), BatchOutcome::Halted);
    }

    fn map_gicc(m: &mut Machine<TestEngine>) {
        let gicc = GicCpuInterface::new(m.board.interrupts.clone());
        m.board
            .bus
            .map_peripheral("gicc", GICC, 0x100, None, Box::new(gicc))
            .unwrap();
    }

    #[test]
    fn test_guest_drives_interrupt_protocol_through_gic() {
        let mut m = machine_with(&[NOP, NOP], counter(3));
        map_gicc(&mut m);
        // IRQ vector: ldr r0, [r1] (IAR); str r0, [r2] (EOIR); b .
        assert!(m.board.bus.ram.write_u32(0x18, ldr(0, 1)));
        assert!(m.board.bus.ram.write_u32(0x1C, str_(0, 2)));
        assert!(m.board.bus.ram.write_u32(0x20, SPIN));
        m.engine.regs[1] = GICC + 0x0C;
        m.engine.regs[2] = GICC + 0x10;

        m.board.interrupts.set_enabled(true);
        m.board.interrupts.raise(29);
        m.run(10).unwrap();
        assert_eq!(m.engine.regs[0], 29);
        assert!(m.board.interrupts.acknowledged().is_empty());
        assert_eq!(m.engine.pc, 0x20);
    }

    #[test]
    fn test_protocol_violation_is_fatal_with_pc() {
        let mut m = machine_with(&[str_(0, 1)], SchedulerConfig::default());
        let gicc = GicCpuInterface::new(m.board.interrupts.clone());
        m.board
            .bus
            .map_peripheral("gicc", 0x2000_0000, 0x100, None, Box::new(gicc))
            .unwrap();
        m.engine.regs[0] = 5;
        m.engine.regs[1] = 0x2000_0010;

        match m.run(10) {
            Err(SimulationError::Fatal { pc, source }) => {
                assert_eq!(pc, 0x1000);
                assert!(matches!(*source, SimulationError::ProtocolViolation(_)));
            }
            other => panic!("expected fatal error, got {:?}", other),
        }
        assert!(!m.state.running);
    }

    #[test]
    fn test_unknown_register_is_fatal() {
        let key = RegisterKey::new(15, 7, 15, 7);
        let mut m = machine_with(&[NOP, mcr(key, 0)], SchedulerConfig::default());
        let err = m.run(10).unwrap_err();
        match err {
            SimulationError::Fatal { pc, source } => {
                assert_eq!(pc, 0x1004);
                assert!(matches!(*source, SimulationError::UnknownRegister(k) if k == key));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(m.state.instructions, 1);
    }

    #[test]
    fn test_unmapped_physical_address_is_fatal() {
        let mut m = machine_with(&[ldr(0, 1)], SchedulerConfig::default());
        m.engine.regs[1] = 0x8000_0000;
        let err = m.run(10).unwrap_err();
        assert!(matches!(
            err,
            SimulationError::Fatal { pc: 0x1000, ref source }
                if matches!(**source, SimulationError::Unmapped(0x8000_0000))
        ));
    }

    #[test]
    fn test_observers_see_branches_exceptions_and_state() {
        let program = [bl(0x1000, 0x1010), svc(1), NOP, NOP, BX_LR];
        let mut m = machine_with(&program, counter(3));
        let recorder = Arc::new(Recorder::default());
        m.add_observer(recorder.clone());
        m.run(10).unwrap();

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "state true 0x1000",
                "branch 0x1000->0x1010 Call",
                "branch 0x1010->0x1004 Return",
                "exception SupervisorCall 0x1004",
                "branch 0x8->0x8 Jump",
                "state false 0x8",
            ]
        );
    }

    #[test]
    fn test_boot_sets_up_registers_and_tags() {
        let mut m = Machine::new(
            TestEngine::new(),
            Board::new(LinearMemory::new(RAM_SIZE, 0)),
            SchedulerConfig::default(),
        );
        let boot = armvirt_config::BootConfig {
            cmdline: "root=/dev/ram".to_string(),
            ..Default::default()
        };
        let kernel: Vec<u8> = NOP.to_le_bytes().to_vec();
        m.boot(&boot, &kernel, None).unwrap();

        assert_eq!(m.engine.pc, 0x8000);
        assert_eq!(m.engine.regs[0], 0);
        assert_eq!(m.engine.regs[1], 2272);
        assert_eq!(m.engine.regs[2], 0x100);
        assert_eq!(m.board.bus.ram.read_u32(0x8000), Some(NOP));
        assert_eq!(
            m.board.bus.ram.read_u32(0x104),
            Some(crate::boot::ATAG_CORE)
        );
    }

    #[test]
    fn test_boot_initrd_requires_address() {
        let mut m = Machine::new(
            TestEngine::new(),
            Board::new(LinearMemory::new(RAM_SIZE, 0)),
            SchedulerConfig::default(),
        );
        let boot = armvirt_config::BootConfig::default();
        let err = m.boot(&boot, &[0; 4], Some(&[1, 2, 3])).unwrap_err();
        assert!(matches!(err, SimulationError::Configuration(_)));
    }

    #[test]
    fn test_snapshot_round_trip_reproduces_trace() {
        // add r0, r0, #1; str r0, [r1]; ldr r3, [r1]; b loop
        let program = [add_imm(0, 0, 1), str_(0, 1), ldr(3, 1), b(0x100C, 0x1000)];

        let mut a = machine_with(&program, SchedulerConfig::default());
        map_gicc(&mut a);
        enable_mmu(&mut a);
        // GICC section, domain 0, full access
        assert!(a.board.bus.ram.write_u32(L1_TABLE + (0x200 << 2), 0x2000_0C02));
        // IRQ vector: ldr r4, [r5] (IAR); str r4, [r6] (EOIR); subs pc, lr, #4
        assert!(a.board.bus.ram.write_u32(0x18, ldr(4, 5)));
        assert!(a.board.bus.ram.write_u32(0x1C, str_(4, 6)));
        assert!(a.board.bus.ram.write_u32(0x20, IRQ_RETURN));
        a.engine.regs[1] = 0x3000;
        a.engine.regs[5] = GICC + 0x0C;
        a.engine.regs[6] = GICC + 0x10;
        a.board.interrupts.set_enabled(true);
        a.board.interrupts.raise(33);

        a.run_for(101);
        a.run(10).unwrap();
        assert_eq!(a.engine.exceptions, vec![(Exception::Irq, 0x1000)]);
        // Left pending across the snapshot
        a.board.interrupts.raise(34);
        let snap = a.snapshot();

        // Through JSON, as a saved snapshot would be
        let json = serde_json::to_string(&snap.state).unwrap();
        let state = serde_json::from_str(&json).unwrap();
        let restored = crate::snapshot::Snapshot {
            state,
            memory: snap.memory.clone(),
        };

        a.board.interrupts.raise(35);
        a.run_for(57);
        a.run(10).unwrap();

        let mut b = machine_with(&[], SchedulerConfig::default());
        map_gicc(&mut b);
        b.apply_snapshot(&restored).unwrap();
        assert_eq!(b.board.interrupts.pending(), vec![34]);
        b.board.interrupts.raise(35);
        b.run_for(57);
        b.run(10).unwrap();

        assert_eq!(a.engine, b.engine);
        assert_eq!(a.state, b.state);
        assert_eq!(a.board.bus.ram.data, b.board.bus.ram.data);
        assert_eq!(a.board.cp15.snapshot(), b.board.cp15.snapshot());
        assert_eq!(a.board.interrupts.snapshot(), b.board.interrupts.snapshot());

        let delivered = vec![
            (Exception::Irq, 0x1000),
            (Exception::Irq, 0x1008),
            (Exception::Irq, 0x1008),
        ];
        assert_eq!(b.engine.exceptions, delivered);
        assert!(b.board.interrupts.acknowledged().is_empty());
        assert!(b.board.interrupts.pending().is_empty());
        assert_eq!(b.engine.regs[4], 35);
        assert!(!b.engine.irq_masked);
        assert_eq!(
            b.board.translate(0x3000, crate::mmu::AccessKind::read(false)).unwrap(),
            0x3000
        );
        // 158 instructions, 9 of them in the handler, four per loop iteration
        assert_eq!(b.engine.regs[0], 38);
        // Stopped after the add, before its store
        assert_eq!(b.board.bus.ram.read_u32(0x3000), Some(37));
    }

    #[test]
    fn test_rejected_snapshot_leaves_machine_untouched() {
        let program = [add_imm(0, 0, 1), b(0x1004, 0x1000)];
        let mut a = machine_with(&program, SchedulerConfig::default());
        map_gicc(&mut a);
        a.run_for(20);
        a.run(10).unwrap();
        a.board.cp15.write(regs::VBAR, 0x800).unwrap();
        a.board.interrupts.raise(12);

        let mut b = machine_with(&program, SchedulerConfig::default());
        map_gicc(&mut b);
        b.run_for(7);
        b.run(10).unwrap();
        let engine = b.engine.clone();
        let state = b.state.clone();

        let mut bad_device = a.snapshot();
        bad_device
            .state
            .peripherals
            .insert("gicc".to_string(), serde_json::json!({ "regs": "bogus" }));
        assert!(matches!(
            b.apply_snapshot(&bad_device),
            Err(SimulationError::Configuration(_))
        ));

        let mut bad_engine = a.snapshot();
        bad_engine.state.engine = serde_json::json!("bogus");
        assert!(matches!(
            b.apply_snapshot(&bad_engine),
            Err(SimulationError::Engine(_))
        ));

        assert_eq!(b.engine, engine);
        assert_eq!(b.state, state);
        assert_eq!(b.board.cp15.vector_base(), 0);
        assert!(b.board.interrupts.pending().is_empty());

        b.apply_snapshot(&a.snapshot()).unwrap();
        assert_eq!(b.engine, a.engine);
        assert_eq!(b.board.interrupts.pending(), vec![12]);
    }
}
