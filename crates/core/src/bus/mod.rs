// ArmVirt - ARMv7-A Platform Emulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::memory::LinearMemory;
use crate::{GuestFault, Peripheral, SimResult, SimulationError};

/// Access width of a bus transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Half,
    Word,
}

impl Width {
    pub const fn bytes(self) -> u32 {
        match self {
            Width::Byte => 1,
            Width::Half => 2,
            Width::Word => 4,
        }
    }

    pub const fn mask(self) -> u32 {
        match self {
            Width::Byte => 0xFF,
            Width::Half => 0xFFFF,
            Width::Word => 0xFFFF_FFFF,
        }
    }
}

pub struct PeripheralEntry {
    pub name: String,
    pub base: u32,
    pub size: u32,
    pub irq: Option<u32>,
    pub dev: Box<dyn Peripheral>,
}

impl PeripheralEntry {
    fn contains(&self, addr: u32) -> bool {
        addr >= self.base && (addr - self.base) < self.size
    }

    /// Inclusive last address of the window.
    fn last(&self) -> u64 {
        self.base as u64 + self.size as u64 - 1
    }
}

/// Physical address router: one RAM window plus any number of peripheral
/// windows. Windows never overlap.
pub struct SystemBus {
    pub ram: LinearMemory,
    pub peripherals: Vec<PeripheralEntry>,
}

impl SystemBus {
    pub fn new(ram: LinearMemory) -> Self {
        Self {
            ram,
            peripherals: Vec::new(),
        }
    }

    /// Register a peripheral window, rejecting any overlap with RAM or an
    /// existing window.
    pub fn map_peripheral(
        &mut self,
        name: &str,
        base: u32,
        size: u32,
        irq: Option<u32>,
        dev: Box<dyn Peripheral>,
    ) -> SimResult<()> {
        if size == 0 || base as u64 + size as u64 > 1 << 32 {
            return Err(SimulationError::Configuration(format!(
                "peripheral '{}' window {:#010x}+{:#x} is empty or exceeds the address space",
                name, base, size
            )));
        }
        let entry = PeripheralEntry {
            name: name.to_string(),
            base,
            size,
            irq,
            dev,
        };

        let ram_first = self.ram.base_addr as u64;
        let ram_last = ram_first + self.ram.data.len() as u64;
        if !self.ram.data.is_empty() && (base as u64) < ram_last && entry.last() >= ram_first {
            return Err(SimulationError::Configuration(format!(
                "peripheral '{}' at {:#010x} overlaps RAM",
                name, base
            )));
        }
        if let Some(other) = self
            .peripherals
            .iter()
            .find(|p| base as u64 <= p.last() && entry.last() >= p.base as u64)
        {
            return Err(SimulationError::Configuration(format!(
                "peripheral '{}' at {:#010x} overlaps '{}' at {:#010x}",
                name, base, other.name, other.base
            )));
        }

        tracing::debug!("Mapped {} at {:#010x}..={:#010x}", name, base, entry.last());
        self.peripherals.push(entry);
        Ok(())
    }

    fn peripheral_index(&self, addr: u32) -> Option<usize> {
        self.peripherals.iter().position(|p| p.contains(addr))
    }

    pub fn load(&mut self, addr: u32, width: Width) -> SimResult<u32> {
        if let Some(idx) = self.peripheral_index(addr) {
            let p = &mut self.peripherals[idx];
            return p.dev.read(addr - p.base, width);
        }
        if !self.ram.contains(addr) {
            return Err(SimulationError::Unmapped(addr));
        }
        if addr % width.bytes() != 0 {
            return Err(GuestFault::Alignment { addr }.into());
        }
        let value = match width {
            Width::Byte => self.ram.read_u8(addr).map(u32::from),
            Width::Half => self.ram.read_u16(addr).map(u32::from),
            Width::Word => self.ram.read_u32(addr),
        };
        value.ok_or(SimulationError::Unmapped(addr))
    }

    pub fn store(&mut self, addr: u32, width: Width, value: u32) -> SimResult<()> {
        if let Some(idx) = self.peripheral_index(addr) {
            let p = &mut self.peripherals[idx];
            return p.dev.write(addr - p.base, width, value & width.mask());
        }
        if !self.ram.contains(addr) {
            return Err(SimulationError::Unmapped(addr));
        }
        if addr % width.bytes() != 0 {
            return Err(GuestFault::Alignment { addr }.into());
        }
        let stored = match width {
            Width::Byte => self.ram.write_u8(addr, value as u8),
            Width::Half => self.ram.write_u16(addr, value as u16),
            Width::Word => self.ram.write_u32(addr, value),
        };
        if stored {
            Ok(())
        } else {
            Err(SimulationError::Unmapped(addr))
        }
    }

    /// Store a word at an address that may not be naturally aligned, for
    /// boot-time structure writes. Decomposes into two halfword stores on a
    /// 2-byte boundary, otherwise four byte stores, little-endian.
    pub fn store_unaligned(&mut self, addr: u32, value: u32) -> SimResult<()> {
        match addr % 4 {
            0 => self.store(addr, Width::Word, value),
            2 => {
                self.store(addr, Width::Half, value & 0xFFFF)?;
                self.store(addr.wrapping_add(2), Width::Half, value >> 16)
            }
            _ => {
                for i in 0..4 {
                    self.store(addr.wrapping_add(i), Width::Byte, (value >> (i * 8)) & 0xFF)?;
                }
                Ok(())
            }
        }
    }

    /// Fetch a page-table descriptor. Tables must live in RAM.
    pub fn read_descriptor(&self, addr: u32) -> SimResult<u32> {
        self.ram
            .read_u32(addr & !3)
            .ok_or(SimulationError::Unmapped(addr))
    }

    /// Copy a raw image into RAM.
    pub fn load_image(&mut self, addr: u32, bytes: &[u8]) -> SimResult<()> {
        if self.ram.load_bytes(addr, bytes) {
            tracing::debug!("Loaded {} bytes at {:#010x}", bytes.len(), addr);
            Ok(())
        } else {
            Err(SimulationError::Configuration(format!(
                "image of {} bytes at {:#010x} does not fit in RAM {:#010x}+{:#x}",
                bytes.len(),
                addr,
                self.ram.base_addr,
                self.ram.size()
            )))
        }
    }
}
