// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::collections::BTreeMap;

use slog::debug;

use aal::AalError;
use aal::AalResult;
use aal::EepromPage;
use aal::ModuleEnvOps;
use aal::ModuleInfo;
use aal::ModuleType;
use aal::PowerMode;
use aal::PowerModeParams;
use aal::PowerModePolicy;
use aal::ETH_RESET_PHY;
use common::ports::ModuleIndex;
use common::ports::SlotIndex;

use super::StubHandle;
use crate::chaos::unfurl;

const EEPROM_LEN: u32 = 256;
const SFF8024_ID_QSFP28: u8 = 0x11;

/// The simulated state of a single transceiver module.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModuleState {
    /// Exposed through a port.
    pub mapped: bool,
    /// The port exposing the module is administratively up.
    pub up: bool,
    pub policy: PowerModePolicy,
    pub resets: u32,
}

#[derive(Default)]
pub(crate) struct ModuleData {
    modules: BTreeMap<(SlotIndex, ModuleIndex), ModuleState>,
}

// Every module reports the same identifier byte, followed by a pattern
// derived from its location.
fn eeprom_contents(slot: SlotIndex, module: ModuleIndex) -> Vec<u8> {
    let mut data: Vec<u8> = (0..EEPROM_LEN)
        .map(|i| (i as u8) ^ slot.wrapping_mul(16) ^ module)
        .collect();
    data[0] = SFF8024_ID_QSFP28;
    data
}

impl StubHandle {
    fn check_module(
        &self,
        slot: SlotIndex,
        module: ModuleIndex,
    ) -> AalResult<()> {
        match self.slot_modules(slot) {
            Some(n) if module < n => Ok(()),
            Some(_) => Err(AalError::InvalidArg(format!(
                "no module {module} in slot {slot}"
            ))),
            None => Err(AalError::InvalidArg(format!("no slot {slot}"))),
        }
    }

    fn with_module<F, T>(
        &self,
        slot: SlotIndex,
        module: ModuleIndex,
        f: F,
    ) -> AalResult<T>
    where
        F: FnOnce(&mut ModuleState) -> AalResult<T>,
    {
        self.check_module(slot, module)?;
        let mut data = self.modules.lock().unwrap();
        f(data.modules.entry((slot, module)).or_default())
    }

    /// Return the state of a module, if it has ever been touched.
    pub fn module_state(
        &self,
        slot: SlotIndex,
        module: ModuleIndex,
    ) -> Option<ModuleState> {
        let data = self.modules.lock().unwrap();
        data.modules.get(&(slot, module)).cloned()
    }

    /// The modules of `slot` currently exposed through a port.
    pub fn mapped_modules(&self, slot: SlotIndex) -> Vec<ModuleIndex> {
        let data = self.modules.lock().unwrap();
        data.modules
            .iter()
            .filter(|((s, _), m)| *s == slot && m.mapped)
            .map(|((_, module), _)| *module)
            .collect()
    }

    fn read_eeprom(
        &self,
        slot: SlotIndex,
        module: ModuleIndex,
        offset: u32,
        len: u32,
    ) -> AalResult<Vec<u8>> {
        self.check_module(slot, module)?;
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= EEPROM_LEN)
            .ok_or_else(|| {
                AalError::InvalidArg(format!(
                    "eeprom read of {len} bytes at {offset} out of range"
                ))
            })?;
        let data = eeprom_contents(slot, module);
        Ok(data[offset as usize..end as usize].to_vec())
    }
}

impl ModuleEnvOps for StubHandle {
    fn module_port_map(
        &self,
        slot: SlotIndex,
        module: ModuleIndex,
    ) -> AalResult<()> {
        unfurl!(self, module_port_map);
        self.with_module(slot, module, |m| {
            if m.mapped {
                return Err(AalError::Exists(format!(
                    "module {module} in slot {slot} already mapped"
                )));
            }
            m.mapped = true;
            Ok(())
        })?;
        debug!(self.log, "module mapped"; "slot" => slot, "module" => module);
        Ok(())
    }

    fn module_port_unmap(
        &self,
        slot: SlotIndex,
        module: ModuleIndex,
    ) -> AalResult<()> {
        unfurl!(self, module_port_unmap);
        self.with_module(slot, module, |m| {
            if !m.mapped {
                return Err(AalError::Missing(format!(
                    "module {module} in slot {slot} not mapped"
                )));
            }
            m.mapped = false;
            m.up = false;
            Ok(())
        })?;
        debug!(self.log, "module unmapped";
            "slot" => slot, "module" => module);
        Ok(())
    }

    fn module_port_up(
        &self,
        slot: SlotIndex,
        module: ModuleIndex,
    ) -> AalResult<()> {
        unfurl!(self, module_port_up);
        self.with_module(slot, module, |m| {
            if !m.mapped {
                return Err(AalError::Missing(format!(
                    "module {module} in slot {slot} not mapped"
                )));
            }
            m.up = true;
            Ok(())
        })
    }

    fn module_port_down(
        &self,
        slot: SlotIndex,
        module: ModuleIndex,
    ) -> AalResult<()> {
        unfurl!(self, module_port_down);
        self.with_module(slot, module, |m| {
            m.up = false;
            Ok(())
        })
    }

    fn get_module_info(
        &self,
        slot: SlotIndex,
        module: ModuleIndex,
    ) -> AalResult<ModuleInfo> {
        self.check_module(slot, module)?;
        Ok(ModuleInfo {
            module_type: ModuleType::Sff8636,
            eeprom_len: EEPROM_LEN,
        })
    }

    fn get_module_eeprom(
        &self,
        slot: SlotIndex,
        module: ModuleIndex,
        offset: u32,
        len: u32,
    ) -> AalResult<Vec<u8>> {
        self.read_eeprom(slot, module, offset, len)
    }

    fn get_module_eeprom_by_page(
        &self,
        slot: SlotIndex,
        module: ModuleIndex,
        page: &EepromPage,
    ) -> AalResult<Vec<u8>> {
        // Only the lower memory and upper page 00h are simulated.
        if page.page != 0 || page.bank != 0 {
            return Err(AalError::OperationUnsupported);
        }
        self.read_eeprom(slot, module, page.offset, page.length)
    }

    fn reset_module(
        &self,
        slot: SlotIndex,
        module: ModuleIndex,
        flags: &mut u32,
    ) -> AalResult<()> {
        if *flags & ETH_RESET_PHY == 0 {
            return Ok(());
        }
        self.with_module(slot, module, |m| {
            if m.up {
                return Err(AalError::InvalidArg(format!(
                    "module {module} in slot {slot} is in use"
                )));
            }
            m.resets += 1;
            Ok(())
        })?;
        *flags &= !ETH_RESET_PHY;
        Ok(())
    }

    fn get_module_power_mode(
        &self,
        slot: SlotIndex,
        module: ModuleIndex,
    ) -> AalResult<PowerModeParams> {
        self.with_module(slot, module, |m| {
            let mode = match (m.policy, m.up) {
                (PowerModePolicy::High, _) | (_, true) => PowerMode::High,
                (PowerModePolicy::Auto, false) => PowerMode::Low,
            };
            Ok(PowerModeParams {
                policy: m.policy,
                mode: Some(mode),
            })
        })
    }

    fn set_module_power_mode(
        &self,
        slot: SlotIndex,
        module: ModuleIndex,
        policy: PowerModePolicy,
    ) -> AalResult<()> {
        self.with_module(slot, module, |m| {
            m.policy = policy;
            Ok(())
        })
    }
}
