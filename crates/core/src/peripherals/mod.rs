// ArmVirt - ARMv7-A Platform Emulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

pub mod gic;
pub mod stub;

use crate::Width;

/// Extract a sub-word access from a 32-bit register value.
pub(crate) fn extract(word: u32, offset: u32, width: Width) -> u32 {
    (word >> ((offset & 3) * 8)) & width.mask()
}

/// Merge a sub-word write into a 32-bit register value.
pub(crate) fn merge(word: u32, offset: u32, width: Width, value: u32) -> u32 {
    let shift = (offset & 3) * 8;
    let mask = width.mask() << shift;
    (word & !mask) | ((value << shift) & mask)
}
