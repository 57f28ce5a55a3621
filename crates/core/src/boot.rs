// ArmVirt - ARMv7-A Platform Emulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! ATAG boot parameter block handed to the kernel in r2.

use crate::bus::SystemBus;
use crate::SimResult;
use armvirt_config::BootConfig;

pub const ATAG_NONE: u32 = 0x0000_0000;
pub const ATAG_CORE: u32 = 0x5441_0001;
pub const ATAG_MEM: u32 = 0x5441_0002;
pub const ATAG_RAMDISK: u32 = 0x5441_0004;
pub const ATAG_INITRD2: u32 = 0x5442_0005;
pub const ATAG_CMDLINE: u32 = 0x5441_0009;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootParams {
    pub mem_base: u32,
    pub mem_size: u32,
    pub ramdisk_kib: u32,
    /// (start, size in bytes)
    pub initrd: Option<(u32, u32)>,
    pub cmdline: String,
}

impl BootParams {
    pub fn new(mem_base: u32, mem_size: u32, boot: &BootConfig) -> Self {
        Self {
            mem_base,
            mem_size,
            ramdisk_kib: boot.ramdisk_kib,
            initrd: boot.initrd.map(|i| (i.addr, i.size)),
            cmdline: boot.cmdline.clone(),
        }
    }

    /// The tag list as little-endian words, NONE-terminated.
    pub fn to_words(&self) -> Vec<u32> {
        let mut words = vec![2, ATAG_CORE];
        words.extend([4, ATAG_MEM, self.mem_size, self.mem_base]);
        words.extend([5, ATAG_RAMDISK, 0, self.ramdisk_kib, 0]);
        if let Some((start, size)) = self.initrd {
            words.extend([4, ATAG_INITRD2, start, size]);
        }
        if !self.cmdline.is_empty() {
            // NUL-terminated, padded to a whole word
            let mut bytes = self.cmdline.as_bytes().to_vec();
            bytes.push(0);
            bytes.resize(bytes.len().div_ceil(4) * 4, 0);
            words.extend([2 + (bytes.len() / 4) as u32, ATAG_CMDLINE]);
            words.extend(
                bytes
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])),
            );
        }
        words.extend([0, ATAG_NONE]);
        words
    }

    /// Write the block at `addr` and return the first address past it.
    pub fn write(&self, bus: &mut SystemBus, addr: u32) -> SimResult<u32> {
        let mut cursor = addr;
        for word in self.to_words() {
            bus.store_unaligned(cursor, word)?;
            cursor = cursor.wrapping_add(4);
        }
        Ok(cursor)
    }
}
