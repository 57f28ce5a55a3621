// ArmVirt - ARMv7-A Platform Emulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Short-descriptor (VMSAv7) page-table walker.
//!
//! No TLB is modelled: every translation walks the tables in RAM, so guest
//! TLB maintenance operations have nothing to invalidate. XN is not enforced.

use crate::bus::SystemBus;
use crate::cp15::{ControlRegisterFile, DomainAccess, TranslationContext};
use crate::{FaultLevel, GuestFault, SimResult, SimulationError};

/// Fault status codes, as recorded in the low bits of DFSR/IFSR.
pub mod status {
    pub const ALIGNMENT: u32 = 0b00001;
    pub const TRANSLATION_SECTION: u32 = 0b00101;
    pub const TRANSLATION_PAGE: u32 = 0b00111;
    pub const DOMAIN_SECTION: u32 = 0b01001;
    pub const DOMAIN_PAGE: u32 = 0b01011;
    pub const PERMISSION_SECTION: u32 = 0b01101;
    pub const PERMISSION_PAGE: u32 = 0b01111;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessKind {
    pub write: bool,
    pub privileged: bool,
    pub fetch: bool,
}

impl AccessKind {
    pub const fn read(privileged: bool) -> Self {
        Self {
            write: false,
            privileged,
            fetch: false,
        }
    }

    pub const fn write(privileged: bool) -> Self {
        Self {
            write: true,
            privileged,
            fetch: false,
        }
    }

    pub const fn fetch(privileged: bool) -> Self {
        Self {
            write: false,
            privileged,
            fetch: true,
        }
    }
}

/// Translate `vaddr`, recording any memory abort in the fault registers.
pub fn translate(
    cp15: &mut ControlRegisterFile,
    bus: &SystemBus,
    vaddr: u32,
    access: AccessKind,
) -> SimResult<u32> {
    let ctx = *cp15.translation();
    if !ctx.enabled {
        return Ok(vaddr);
    }
    match walk(&ctx, bus, vaddr, access) {
        Err(SimulationError::Guest(fault)) => {
            if let Some(code) = fault.status_code() {
                cp15.set_memory_abort(vaddr, code, access.write);
            }
            Err(fault.into())
        }
        result => result,
    }
}

/// Walk the tables without touching any register state.
pub fn walk(
    ctx: &TranslationContext,
    bus: &SystemBus,
    vaddr: u32,
    access: AccessKind,
) -> SimResult<u32> {
    let n = ctx.split_width as u32;
    if n > 0 && vaddr >> (32 - n) != 0 {
        return Err(SimulationError::Configuration(format!(
            "walk of {:#010x} needs TTBR1 (TTBCR.N = {}), which is not implemented",
            vaddr, n
        )));
    }

    let first = bus.read_descriptor(ctx.table_base_0 | ((vaddr >> 20) << 2))?;
    match first & 3 {
        0b10 => {
            if first & (1 << 18) != 0 {
                return Err(SimulationError::Unsupported("supersection descriptor"));
            }
            let domain = ((first >> 5) & 0xF) as u8;
            let ap2 = (first >> 15) & 1;
            let ap = (first >> 10) & 3;
            check_access(ctx, domain, ap2, ap, access, FaultLevel::Section, vaddr)?;
            Ok((first & 0xFFF0_0000) | (vaddr & 0x000F_FFFF))
        }
        0b01 => {
            let domain = ((first >> 5) & 0xF) as u8;
            let second_addr = (first & 0xFFFF_FC00) | (((vaddr >> 12) & 0xFF) << 2);
            let second = bus.read_descriptor(second_addr)?;
            match second & 3 {
                0b00 => Err(GuestFault::Translation {
                    level: FaultLevel::Page,
                    vaddr,
                }
                .into()),
                0b01 => Err(SimulationError::Unsupported("large page descriptor")),
                _ => {
                    let ap2 = (second >> 9) & 1;
                    let ap = (second >> 4) & 3;
                    check_access(ctx, domain, ap2, ap, access, FaultLevel::Page, vaddr)?;
                    Ok((second & 0xFFFF_F000) | (vaddr & 0xFFF))
                }
            }
        }
        // Fault and reserved encodings
        _ => Err(GuestFault::Translation {
            level: FaultLevel::Section,
            vaddr,
        }
        .into()),
    }
}

fn check_access(
    ctx: &TranslationContext,
    domain: u8,
    ap2: u32,
    ap: u32,
    access: AccessKind,
    level: FaultLevel,
    vaddr: u32,
) -> Result<(), GuestFault> {
    match ctx.domain_rights[domain as usize] {
        DomainAccess::Manager => Ok(()),
        DomainAccess::Client if permits(ap2, ap, access) => Ok(()),
        DomainAccess::Client => Err(GuestFault::Permission { level, vaddr }),
        DomainAccess::NoAccess | DomainAccess::Reserved => Err(GuestFault::Domain {
            level,
            domain,
            vaddr,
        }),
    }
}

/// AP[2], AP[1:0] access check. Instruction fetches count as reads.
fn permits(ap2: u32, ap: u32, access: AccessKind) -> bool {
    let AccessKind {
        write, privileged, ..
    } = access;
    match (ap2, ap) {
        (0, 1) => privileged,
        (0, 2) => privileged || !write,
        (0, 3) => true,
        (1, 1) => privileged && !write,
        (1, 2) | (1, 3) => !write,
        // (0, 0) is no access, (1, 0) is reserved
        _ => false,
    }
}
