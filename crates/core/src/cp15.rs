// ArmVirt - ARMv7-A Platform Emulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! System control coprocessor (CP15) register file.
//!
//! Registers are addressed by a packed `(CRn, opc1, CRm, opc2)` key. Every
//! key maps to exactly one slot; accessing a key with no slot is an error.
//! Writes to the translation-related registers keep a derived
//! [`TranslationContext`] in sync, which the MMU reads on every walk.

use crate::{SimResult, SimulationError};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Packed coprocessor register coordinate: `crn<<10 | op1<<7 | crm<<3 | op2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegisterKey(u16);

impl RegisterKey {
    pub const fn new(crn: u8, op1: u8, crm: u8, op2: u8) -> Self {
        Self(
            ((crn as u16 & 0xF) << 10)
                | ((op1 as u16 & 0x7) << 7)
                | ((crm as u16 & 0xF) << 3)
                | (op2 as u16 & 0x7),
        )
    }

    /// Key addressed by an MCR/MRC encoding.
    pub const fn from_mcr(inst: u32) -> Self {
        Self::new(
            ((inst >> 16) & 0xF) as u8,
            ((inst >> 21) & 0x7) as u8,
            (inst & 0xF) as u8,
            ((inst >> 5) & 0x7) as u8,
        )
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub const fn crn(self) -> u8 {
        ((self.0 >> 10) & 0xF) as u8
    }

    pub const fn op1(self) -> u8 {
        ((self.0 >> 7) & 0x7) as u8
    }

    pub const fn crm(self) -> u8 {
        ((self.0 >> 3) & 0xF) as u8
    }

    pub const fn op2(self) -> u8 {
        (self.0 & 0x7) as u8
    }
}

impl fmt::Display for RegisterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "c{}, {}, c{}, {}",
            self.crn(),
            self.op1(),
            self.crm(),
            self.op2()
        )
    }
}

pub mod regs {
    use super::RegisterKey as K;

    pub const MIDR: K = K::new(0, 0, 0, 0);
    pub const CTR: K = K::new(0, 0, 0, 1);
    pub const TCMTR: K = K::new(0, 0, 0, 2);
    pub const TLBTR: K = K::new(0, 0, 0, 3);
    pub const MPIDR: K = K::new(0, 0, 0, 5);
    pub const ID_PFR0: K = K::new(0, 0, 1, 0);
    pub const ID_PFR1: K = K::new(0, 0, 1, 1);
    pub const ID_DFR0: K = K::new(0, 0, 1, 2);
    pub const ID_AFR0: K = K::new(0, 0, 1, 3);
    pub const ID_MMFR0: K = K::new(0, 0, 1, 4);
    pub const ID_MMFR1: K = K::new(0, 0, 1, 5);
    pub const ID_MMFR2: K = K::new(0, 0, 1, 6);
    pub const ID_MMFR3: K = K::new(0, 0, 1, 7);
    pub const ID_ISAR0: K = K::new(0, 0, 2, 0);
    pub const ID_ISAR1: K = K::new(0, 0, 2, 1);
    pub const ID_ISAR2: K = K::new(0, 0, 2, 2);
    pub const ID_ISAR3: K = K::new(0, 0, 2, 3);
    pub const ID_ISAR4: K = K::new(0, 0, 2, 4);
    pub const ID_ISAR5: K = K::new(0, 0, 2, 5);
    pub const CCSIDR: K = K::new(0, 1, 0, 0);
    pub const CLIDR: K = K::new(0, 1, 0, 1);
    pub const AIDR: K = K::new(0, 1, 0, 7);
    pub const CSSELR: K = K::new(0, 2, 0, 0);

    pub const SCTLR: K = K::new(1, 0, 0, 0);
    pub const ACTLR: K = K::new(1, 0, 0, 1);
    pub const CPACR: K = K::new(1, 0, 0, 2);

    pub const TTBR0: K = K::new(2, 0, 0, 0);
    pub const TTBR1: K = K::new(2, 0, 0, 1);
    pub const TTBCR: K = K::new(2, 0, 0, 2);
    pub const DACR: K = K::new(3, 0, 0, 0);

    pub const DFSR: K = K::new(5, 0, 0, 0);
    pub const IFSR: K = K::new(5, 0, 0, 1);
    pub const ADFSR: K = K::new(5, 0, 1, 0);
    pub const AIFSR: K = K::new(5, 0, 1, 1);
    pub const DFAR: K = K::new(6, 0, 0, 0);
    pub const IFAR: K = K::new(6, 0, 0, 2);

    pub const ICIALLUIS: K = K::new(7, 0, 1, 0);
    pub const BPIALLIS: K = K::new(7, 0, 1, 6);
    pub const PAR: K = K::new(7, 0, 4, 0);
    pub const ICIALLU: K = K::new(7, 0, 5, 0);
    pub const ICIMVAU: K = K::new(7, 0, 5, 1);
    pub const CP15ISB: K = K::new(7, 0, 5, 4);
    pub const BPIALL: K = K::new(7, 0, 5, 6);
    pub const BPIMVA: K = K::new(7, 0, 5, 7);
    pub const DCIMVAC: K = K::new(7, 0, 6, 1);
    pub const DCISW: K = K::new(7, 0, 6, 2);
    pub const DCCMVAC: K = K::new(7, 0, 10, 1);
    pub const DCCSW: K = K::new(7, 0, 10, 2);
    pub const CP15DSB: K = K::new(7, 0, 10, 4);
    pub const CP15DMB: K = K::new(7, 0, 10, 5);
    pub const DCCMVAU: K = K::new(7, 0, 11, 1);
    pub const DCCIMVAC: K = K::new(7, 0, 14, 1);
    pub const DCCISW: K = K::new(7, 0, 14, 2);

    pub const TLBIALLIS: K = K::new(8, 0, 3, 0);
    pub const TLBIMVAIS: K = K::new(8, 0, 3, 1);
    pub const TLBIASIDIS: K = K::new(8, 0, 3, 2);
    pub const TLBIMVAAIS: K = K::new(8, 0, 3, 3);
    pub const ITLBIALL: K = K::new(8, 0, 5, 0);
    pub const ITLBIMVA: K = K::new(8, 0, 5, 1);
    pub const ITLBIASID: K = K::new(8, 0, 5, 2);
    pub const DTLBIALL: K = K::new(8, 0, 6, 0);
    pub const DTLBIMVA: K = K::new(8, 0, 6, 1);
    pub const DTLBIASID: K = K::new(8, 0, 6, 2);
    pub const TLBIALL: K = K::new(8, 0, 7, 0);
    pub const TLBIMVA: K = K::new(8, 0, 7, 1);
    pub const TLBIASID: K = K::new(8, 0, 7, 2);
    pub const TLBIMVAA: K = K::new(8, 0, 7, 3);

    pub const PRRR: K = K::new(10, 0, 2, 0);
    pub const NMRR: K = K::new(10, 0, 2, 1);
    pub const VBAR: K = K::new(12, 0, 0, 0);
    pub const CONTEXTIDR: K = K::new(13, 0, 0, 1);
    pub const TPIDRURW: K = K::new(13, 0, 0, 2);
    pub const TPIDRURO: K = K::new(13, 0, 0, 3);
    pub const TPIDRPRW: K = K::new(13, 0, 0, 4);
}

bitflags! {
    /// SCTLR bits the emulator interprets.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SystemControl: u32 {
        const M = 1 << 0;
        const A = 1 << 1;
        const C = 1 << 2;
        const Z = 1 << 11;
        const I = 1 << 12;
        const V = 1 << 13;
        const U = 1 << 22;
        const VE = 1 << 24;
        const EE = 1 << 25;
        const TE = 1 << 30;
    }
}

const SCTLR_RESET: u32 = 0x00C5_0078;
pub const HIGH_VECTORS: u32 = 0xFFFF_0000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainAccess {
    #[default]
    NoAccess,
    Client,
    Reserved,
    Manager,
}

impl DomainAccess {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 3 {
            0 => DomainAccess::NoAccess,
            1 => DomainAccess::Client,
            2 => DomainAccess::Reserved,
            _ => DomainAccess::Manager,
        }
    }
}

/// Translation state derived from SCTLR, TTBR0/1, TTBCR, DACR and CONTEXTIDR.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationContext {
    pub enabled: bool,
    pub table_base_0: u32,
    pub table_base_1: u32,
    /// TTBCR.N
    pub split_width: u8,
    pub asid: u8,
    pub domain_rights: [DomainAccess; 16],
    pub check_unaligned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPolicy {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessPolicy {
    fn readable(self) -> bool {
        !matches!(self, AccessPolicy::WriteOnly)
    }

    fn writable(self) -> bool {
        !matches!(self, AccessPolicy::ReadOnly)
    }
}

#[derive(Debug, Clone, Default)]
struct RegisterState {
    values: BTreeMap<RegisterKey, u32>,
    translation: TranslationContext,
}

impl RegisterState {
    fn get(&self, key: RegisterKey) -> u32 {
        self.values.get(&key).copied().unwrap_or(0)
    }
}

#[derive(Clone, Copy)]
enum ReadSlot {
    Constant(u32),
    Stored,
    Computed(fn(&RegisterState) -> u32),
}

#[derive(Clone, Copy)]
enum WriteSlot {
    Storage,
    SideEffecting(fn(&mut RegisterState, u32) -> SimResult<()>),
}

#[derive(Clone, Copy)]
struct RegisterSlot {
    name: &'static str,
    key: RegisterKey,
    policy: AccessPolicy,
    read: ReadSlot,
    write: WriteSlot,
    reset: u32,
}

impl RegisterSlot {
    fn constant(name: &'static str, key: RegisterKey, value: u32) -> Self {
        Self {
            name,
            key,
            policy: AccessPolicy::ReadOnly,
            read: ReadSlot::Constant(value),
            write: WriteSlot::Storage,
            reset: value,
        }
    }

    fn computed(name: &'static str, key: RegisterKey, f: fn(&RegisterState) -> u32) -> Self {
        Self {
            name,
            key,
            policy: AccessPolicy::ReadOnly,
            read: ReadSlot::Computed(f),
            write: WriteSlot::Storage,
            reset: 0,
        }
    }

    fn storage(name: &'static str, key: RegisterKey, reset: u32) -> Self {
        Self {
            name,
            key,
            policy: AccessPolicy::ReadWrite,
            read: ReadSlot::Stored,
            write: WriteSlot::Storage,
            reset,
        }
    }

    fn side_effect(
        name: &'static str,
        key: RegisterKey,
        reset: u32,
        f: fn(&mut RegisterState, u32) -> SimResult<()>,
    ) -> Self {
        Self {
            write: WriteSlot::SideEffecting(f),
            ..Self::storage(name, key, reset)
        }
    }

    /// Write-only maintenance operation with no modelled effect.
    fn operation(name: &'static str, key: RegisterKey) -> Self {
        Self {
            name,
            key,
            policy: AccessPolicy::WriteOnly,
            read: ReadSlot::Constant(0),
            write: WriteSlot::SideEffecting(maintenance),
            reset: 0,
        }
    }
}

fn maintenance(_: &mut RegisterState, _: u32) -> SimResult<()> {
    Ok(())
}

fn write_sctlr(state: &mut RegisterState, value: u32) -> SimResult<()> {
    apply_sctlr(state, value);
    Ok(())
}

fn apply_sctlr(state: &mut RegisterState, value: u32) {
    let sctlr = SystemControl::from_bits_retain(value) | SystemControl::U;
    let enabled = sctlr.contains(SystemControl::M);
    if enabled != state.translation.enabled {
        tracing::debug!("MMU {}", if enabled { "enabled" } else { "disabled" });
    }
    if sctlr.contains(SystemControl::VE) {
        tracing::warn!("SCTLR.VE set; vectored interrupts are not modelled");
    }
    state.translation.enabled = enabled;
    state.translation.check_unaligned = sctlr.contains(SystemControl::A);
    state.values.insert(regs::SCTLR, sctlr.bits());
}

fn table0_mask(split_width: u8) -> u32 {
    0xFFFF_FFFF << (14 - split_width as u32)
}

fn write_ttbr0(state: &mut RegisterState, value: u32) -> SimResult<()> {
    state.values.insert(regs::TTBR0, value);
    state.translation.table_base_0 = value & table0_mask(state.translation.split_width);
    tracing::debug!("TTBR0 <- {:#010x}", value);
    Ok(())
}

fn write_ttbr1(state: &mut RegisterState, value: u32) -> SimResult<()> {
    state.values.insert(regs::TTBR1, value);
    state.translation.table_base_1 = value & 0xFFFF_C000;
    Ok(())
}

fn write_ttbcr(state: &mut RegisterState, value: u32) -> SimResult<()> {
    if value & (1 << 31) != 0 {
        return Err(SimulationError::Unsupported(
            "TTBCR.EAE long-descriptor translation",
        ));
    }
    let n = (value & 7) as u8;
    if n != 0 {
        tracing::warn!("TTBCR.N = {}; walks through TTBR1 are not supported", n);
    }
    state.values.insert(regs::TTBCR, value);
    state.translation.split_width = n;
    state.translation.table_base_0 = state.get(regs::TTBR0) & table0_mask(n);
    Ok(())
}

fn write_dacr(state: &mut RegisterState, value: u32) -> SimResult<()> {
    state.values.insert(regs::DACR, value);
    for (d, rights) in state.translation.domain_rights.iter_mut().enumerate() {
        *rights = DomainAccess::from_bits(value >> (d * 2));
    }
    Ok(())
}

fn write_contextidr(state: &mut RegisterState, value: u32) -> SimResult<()> {
    state.values.insert(regs::CONTEXTIDR, value);
    state.translation.asid = (value & 0xFF) as u8;
    Ok(())
}

/// Cache geometry for the level/type selected by CSSELR.
fn read_ccsidr(state: &RegisterState) -> u32 {
    match state.get(regs::CSSELR) {
        // L1 data: 32 KiB, 4-way, 32-byte lines
        0 => 0xE00F_E019,
        // L1 instruction
        1 => 0x200F_E019,
        _ => 0,
    }
}

fn register_table() -> Vec<RegisterSlot> {
    use regs::*;
    type S = RegisterSlot;
    vec![
        S::constant("MIDR", MIDR, 0x410F_C090),
        S::constant("CTR", CTR, 0x8333_8003),
        S::constant("TCMTR", TCMTR, 0),
        S::constant("TLBTR", TLBTR, 0),
        S::constant("MPIDR", MPIDR, 0x8000_0000),
        S::constant("ID_PFR0", ID_PFR0, 0x0000_1031),
        S::constant("ID_PFR1", ID_PFR1, 0x0000_0011),
        S::constant("ID_DFR0", ID_DFR0, 0x0001_0444),
        S::constant("ID_AFR0", ID_AFR0, 0),
        S::constant("ID_MMFR0", ID_MMFR0, 0x0010_0103),
        S::constant("ID_MMFR1", ID_MMFR1, 0x2000_0000),
        S::constant("ID_MMFR2", ID_MMFR2, 0x0123_0000),
        S::constant("ID_MMFR3", ID_MMFR3, 0x0010_2111),
        S::constant("ID_ISAR0", ID_ISAR0, 0x0010_1111),
        S::constant("ID_ISAR1", ID_ISAR1, 0x1311_2111),
        S::constant("ID_ISAR2", ID_ISAR2, 0x2123_2041),
        S::constant("ID_ISAR3", ID_ISAR3, 0x1111_2131),
        S::constant("ID_ISAR4", ID_ISAR4, 0x0001_1142),
        S::constant("ID_ISAR5", ID_ISAR5, 0),
        S::computed("CCSIDR", CCSIDR, read_ccsidr),
        S::constant("CLIDR", CLIDR, 0x0920_0003),
        S::constant("AIDR", AIDR, 0),
        S::storage("CSSELR", CSSELR, 0),
        S::side_effect("SCTLR", SCTLR, SCTLR_RESET, write_sctlr),
        S::storage("ACTLR", ACTLR, 0),
        S::storage("CPACR", CPACR, 0),
        S::side_effect("TTBR0", TTBR0, 0, write_ttbr0),
        S::side_effect("TTBR1", TTBR1, 0, write_ttbr1),
        S::side_effect("TTBCR", TTBCR, 0, write_ttbcr),
        S::side_effect("DACR", DACR, 0, write_dacr),
        S::storage("DFSR", DFSR, 0),
        S::storage("IFSR", IFSR, 0),
        S::storage("ADFSR", ADFSR, 0),
        S::storage("AIFSR", AIFSR, 0),
        S::storage("DFAR", DFAR, 0),
        S::storage("IFAR", IFAR, 0),
        S::operation("ICIALLUIS", ICIALLUIS),
        S::operation("BPIALLIS", BPIALLIS),
        S::storage("PAR", PAR, 0),
        S::operation("ICIALLU", ICIALLU),
        S::operation("ICIMVAU", ICIMVAU),
        S::operation("CP15ISB", CP15ISB),
        S::operation("BPIALL", BPIALL),
        S::operation("BPIMVA", BPIMVA),
        S::operation("DCIMVAC", DCIMVAC),
        S::operation("DCISW", DCISW),
        S::operation("DCCMVAC", DCCMVAC),
        S::operation("DCCSW", DCCSW),
        S::operation("CP15DSB", CP15DSB),
        S::operation("CP15DMB", CP15DMB),
        S::operation("DCCMVAU", DCCMVAU),
        S::operation("DCCIMVAC", DCCIMVAC),
        S::operation("DCCISW", DCCISW),
        S::operation("TLBIALLIS", TLBIALLIS),
        S::operation("TLBIMVAIS", TLBIMVAIS),
        S::operation("TLBIASIDIS", TLBIASIDIS),
        S::operation("TLBIMVAAIS", TLBIMVAAIS),
        S::operation("ITLBIALL", ITLBIALL),
        S::operation("ITLBIMVA", ITLBIMVA),
        S::operation("ITLBIASID", ITLBIASID),
        S::operation("DTLBIALL", DTLBIALL),
        S::operation("DTLBIMVA", DTLBIMVA),
        S::operation("DTLBIASID", DTLBIASID),
        S::operation("TLBIALL", TLBIALL),
        S::operation("TLBIMVA", TLBIMVA),
        S::operation("TLBIASID", TLBIASID),
        S::operation("TLBIMVAA", TLBIMVAA),
        S::storage("PRRR", PRRR, 0x000A_81A8),
        S::storage("NMRR", NMRR, 0x44E0_48E0),
        S::storage("VBAR", VBAR, 0),
        S::side_effect("CONTEXTIDR", CONTEXTIDR, 0, write_contextidr),
        S::storage("TPIDRURW", TPIDRURW, 0),
        S::storage("TPIDRURO", TPIDRURO, 0),
        S::storage("TPIDRPRW", TPIDRPRW, 0),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cp15Snapshot {
    pub registers: BTreeMap<RegisterKey, u32>,
    pub translation: TranslationContext,
}

/// A readable register as shown to tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterView {
    pub key: RegisterKey,
    pub name: &'static str,
    pub value: u32,
}

pub struct ControlRegisterFile {
    slots: HashMap<RegisterKey, RegisterSlot>,
    state: RegisterState,
}

impl Default for ControlRegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ControlRegisterFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlRegisterFile")
            .field("slots", &self.slots.len())
            .field("translation", &self.state.translation)
            .finish()
    }
}

impl ControlRegisterFile {
    pub fn new() -> Self {
        let mut slots = HashMap::new();
        let mut state = RegisterState::default();
        for slot in register_table() {
            debug_assert!(
                !slots.contains_key(&slot.key),
                "duplicate CP15 slot {}",
                slot.key
            );
            if matches!(slot.read, ReadSlot::Stored) {
                state.values.insert(slot.key, slot.reset);
            }
            slots.insert(slot.key, slot);
        }
        let mut file = Self { slots, state };
        // Derive the translation context from the reset value
        apply_sctlr(&mut file.state, SCTLR_RESET);
        file
    }

    fn slot(&self, key: RegisterKey) -> SimResult<RegisterSlot> {
        self.slots
            .get(&key)
            .copied()
            .ok_or(SimulationError::UnknownRegister(key))
    }

    pub fn read(&self, key: RegisterKey) -> SimResult<u32> {
        let slot = self.slot(key)?;
        if !slot.policy.readable() {
            return Err(SimulationError::RegisterAccess { key, op: "read" });
        }
        Ok(match slot.read {
            ReadSlot::Constant(v) => v,
            ReadSlot::Stored => self.state.get(key),
            ReadSlot::Computed(f) => f(&self.state),
        })
    }

    pub fn write(&mut self, key: RegisterKey, value: u32) -> SimResult<()> {
        let slot = self.slot(key)?;
        if !slot.policy.writable() {
            return Err(SimulationError::RegisterAccess { key, op: "write" });
        }
        tracing::trace!("CP15 {} ({}) <- {:#010x}", slot.name, key, value);
        match slot.write {
            WriteSlot::Storage => {
                self.state.values.insert(key, value);
                Ok(())
            }
            WriteSlot::SideEffecting(f) => f(&mut self.state, value),
        }
    }

    /// Record a memory abort. The instruction-side registers mirror the
    /// data-side ones.
    pub fn set_memory_abort(&mut self, vaddr: u32, status: u32, is_write: bool) {
        let fsr = (status & 0x1F) | ((is_write as u32) << 11);
        for key in [regs::DFAR, regs::IFAR] {
            self.state.values.insert(key, vaddr);
        }
        for key in [regs::DFSR, regs::IFSR] {
            self.state.values.insert(key, fsr);
        }
        tracing::debug!("Memory abort at {:#010x}, FSR={:#x}", vaddr, fsr);
    }

    pub fn translation(&self) -> &TranslationContext {
        &self.state.translation
    }

    pub fn system_control(&self) -> SystemControl {
        SystemControl::from_bits_retain(self.state.get(regs::SCTLR))
    }

    /// Base address of the exception vector table.
    pub fn vector_base(&self) -> u32 {
        if self.system_control().contains(SystemControl::V) {
            HIGH_VECTORS
        } else {
            self.state.get(regs::VBAR) & !0x1F
        }
    }

    pub fn name(&self, key: RegisterKey) -> Option<&'static str> {
        self.slots.get(&key).map(|s| s.name)
    }

    /// All readable registers, ordered by key.
    pub fn registers(&self) -> Vec<RegisterView> {
        let mut views: Vec<RegisterView> = self
            .slots
            .values()
            .filter(|s| s.policy.readable())
            .filter_map(|s| {
                self.read(s.key).ok().map(|value| RegisterView {
                    key: s.key,
                    name: s.name,
                    value,
                })
            })
            .collect();
        views.sort_by_key(|v| v.key);
        views
    }

    pub fn snapshot(&self) -> Cp15Snapshot {
        Cp15Snapshot {
            registers: self.state.values.clone(),
            translation: self.state.translation,
        }
    }

    pub fn restore(&mut self, snap: &Cp15Snapshot) -> SimResult<()> {
        if let Some(&key) = snap.registers.keys().find(|k| !self.slots.contains_key(*k)) {
            return Err(SimulationError::UnknownRegister(key));
        }
        self.state.values = snap.registers.clone();
        self.state.translation = snap.translation;
        Ok(())
    }
}
