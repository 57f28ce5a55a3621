// ArmVirt - ARMv7-A Platform Emulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

/// A simple flat memory storage
pub struct LinearMemory {
    pub data: Vec<u8>,
    pub base_addr: u32,
}

impl LinearMemory {
    pub fn new(size: usize, base_addr: u32) -> Self {
        Self {
            data: vec![0; size],
            base_addr,
        }
    }

    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// Offset of `addr..addr + len` inside this memory, if fully contained.
    fn offset(&self, addr: u32, len: usize) -> Option<usize> {
        let start = addr.checked_sub(self.base_addr)? as usize;
        let end = start.checked_add(len)?;
        (end <= self.data.len()).then_some(start)
    }

    pub fn contains(&self, addr: u32) -> bool {
        self.offset(addr, 1).is_some()
    }

    pub fn read_u8(&self, addr: u32) -> Option<u8> {
        self.offset(addr, 1).map(|off| self.data[off])
    }

    pub fn read_u16(&self, addr: u32) -> Option<u16> {
        let off = self.offset(addr, 2)?;
        Some(u16::from_le_bytes([self.data[off], self.data[off + 1]]))
    }

    pub fn read_u32(&self, addr: u32) -> Option<u32> {
        let off = self.offset(addr, 4)?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.data[off..off + 4]);
        Some(u32::from_le_bytes(bytes))
    }

    pub fn write_u8(&mut self, addr: u32, value: u8) -> bool {
        match self.offset(addr, 1) {
            Some(off) => {
                self.data[off] = value;
                true
            }
            None => false,
        }
    }

    pub fn write_u16(&mut self, addr: u32, value: u16) -> bool {
        match self.offset(addr, 2) {
            Some(off) => {
                self.data[off..off + 2].copy_from_slice(&value.to_le_bytes());
                true
            }
            None => false,
        }
    }

    pub fn write_u32(&mut self, addr: u32, value: u32) -> bool {
        match self.offset(addr, 4) {
            Some(off) => {
                self.data[off..off + 4].copy_from_slice(&value.to_le_bytes());
                true
            }
            None => false,
        }
    }

    /// Copy a whole image into memory. Nothing is written unless it fits.
    pub fn load_bytes(&mut self, addr: u32, bytes: &[u8]) -> bool {
        match self.offset(addr, bytes.len()) {
            Some(off) => {
                self.data[off..off + bytes.len()].copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }
}
