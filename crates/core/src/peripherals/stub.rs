// ArmVirt - ARMv7-A Platform Emulator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::{SimResult, Width};
use std::collections::HashMap;

/// A register block that returns fixed values on read and ignores writes.
#[derive(Debug, serde::Serialize)]
pub struct StubPeripheral {
    pub values: HashMap<u32, u32>, // mapping word offset to value
    pub default_val: u32,
}

impl StubPeripheral {
    pub fn new(default_val: u32) -> Self {
        Self {
            values: HashMap::new(),
            default_val,
        }
    }
}

impl crate::Peripheral for StubPeripheral {
    fn read(&mut self, offset: u32, width: Width) -> SimResult<u32> {
        let val = self
            .values
            .get(&(offset & !3))
            .copied()
            .unwrap_or(self.default_val);
        Ok(super::extract(val, offset, width))
    }

    fn write(&mut self, offset: u32, _width: Width, value: u32) -> SimResult<()> {
        tracing::trace!("stub write {:#x} <- {:#x} ignored", offset, value);
        Ok(())
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
