// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Per-slot line card records, and the table mapping each local port of a
//! slot to the module it exposes.
//!
//! Each record carries a table with one entry for every local port of the
//! chassis.  An entry is assigned while its local port is mapped to a module
//! of the slot, and carries the port object while the module is exposed to
//! the host.

use slog::debug;
use slog::error;

use aal::ChassisOps;
use common::ports::is_pluggable;
use common::ports::LocalPort;
use common::ports::ModuleIndex;
use common::ports::SlotIndex;

use crate::chassis::Chassis;
use crate::port::ModulePort;
use crate::types::ChassisError;
use crate::types::ChassisResult;

/// One entry in a slot's mapping table.
#[derive(Debug, Default)]
pub struct PortMapping {
    pub(crate) module_to_port: Option<LocalPort>,
    pub(crate) module: ModuleIndex,
    pub(crate) port: Option<ModulePort>,
}

impl PortMapping {
    /// The local port owning this entry's module, if assigned.
    pub fn local_port(&self) -> Option<LocalPort> {
        self.module_to_port
    }

    /// The assignment in the form reported by the device tools, where -1
    /// marks an unassigned entry.
    pub fn module_to_port(&self) -> i32 {
        self.module_to_port.map(i32::from).unwrap_or(-1)
    }

    pub fn module(&self) -> ModuleIndex {
        self.module
    }

    pub fn port(&self) -> Option<&ModulePort> {
        self.port.as_ref()
    }

    pub fn is_assigned(&self) -> bool {
        self.module_to_port.is_some()
    }
}

/// The state of a single slot.
#[derive(Debug)]
pub struct LineCard {
    slot_index: SlotIndex,
    pub(crate) max_ports: u16,
    pub(crate) module_offset: u16,
    pub(crate) active: bool,
    pub(crate) mapping: Vec<PortMapping>,
}

/// The offset translating a module index within `slot` into the
/// chassis-wide numbering.
pub fn module_offset(
    slot: SlotIndex,
    max_module_count: u8,
) -> ChassisResult<u16> {
    if !is_pluggable(slot) {
        return Ok(0);
    }
    (u16::from(slot) - 1)
        .checked_mul(u16::from(max_module_count))
        .ok_or_else(|| {
            ChassisError::Invalid(format!("module offset of slot {slot}"))
        })
}

/// The port number of `module`, one-based across the chassis.  This is also
/// the final octet of the port's MAC address, so it must fit in a byte.
pub fn port_number(module: ModuleIndex, module_offset: u16) -> Option<u8> {
    u16::from(module)
        .checked_add(1)
        .and_then(|n| n.checked_add(module_offset))
        .and_then(|n| u8::try_from(n).ok())
}

impl LineCard {
    /// Allocate a record with an unassigned mapping table of `table_size`
    /// entries.
    pub(crate) fn new(
        slot_index: SlotIndex,
        table_size: u16,
    ) -> ChassisResult<Self> {
        let mut mapping = Vec::new();
        mapping
            .try_reserve_exact(usize::from(table_size))
            .map_err(|e| {
                ChassisError::OutOfMemory(format!(
                    "mapping table for slot {slot_index}: {e}"
                ))
            })?;
        mapping.resize_with(usize::from(table_size), PortMapping::default);

        Ok(LineCard {
            slot_index,
            max_ports: 0,
            module_offset: 0,
            active: false,
            mapping,
        })
    }

    pub fn slot_index(&self) -> SlotIndex {
        self.slot_index
    }

    /// One more than the number of modules discovered on the card, or zero
    /// if the card is absent or has no modules.
    pub fn max_ports(&self) -> u16 {
        self.max_ports
    }

    pub fn module_offset(&self) -> u16 {
        self.module_offset
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn entry(&self, local_port: LocalPort) -> Option<&PortMapping> {
        self.mapping.get(usize::from(local_port))
    }

    pub(crate) fn entry_mut(
        &mut self,
        local_port: LocalPort,
    ) -> Option<&mut PortMapping> {
        self.mapping.get_mut(usize::from(local_port))
    }

    pub fn table_size(&self) -> usize {
        self.mapping.len()
    }

    /// The assigned local ports, with the module each one owns, in
    /// ascending order.
    pub fn assigned(&self) -> Vec<(LocalPort, ModuleIndex)> {
        self.mapping
            .iter()
            .filter_map(|m| m.module_to_port.map(|lp| (lp, m.module)))
            .collect()
    }

    /// The local ports carrying a port object, in ascending order.
    pub fn ports(&self) -> Vec<LocalPort> {
        self.mapping
            .iter()
            .filter(|m| m.port.is_some())
            .filter_map(|m| m.module_to_port)
            .collect()
    }

    // Check that `local_port` may be mapped to `module`.
    fn check_map(
        &self,
        local_port: LocalPort,
        module: ModuleIndex,
    ) -> ChassisResult<()> {
        let slot = self.slot_index;
        let Some(entry) = self.entry(local_port) else {
            return Err(ChassisError::InvalidMapping(format!(
                "slot {slot}: local port {local_port} exceeds table of {}",
                self.mapping.len()
            )));
        };
        if let Some(owner) = entry.module_to_port {
            return Err(ChassisError::InvalidMapping(format!(
                "slot {slot}: local port {local_port} already mapped to \
                 module {} as {owner}",
                entry.module
            )));
        }
        if let Some(other) = self.mapping.iter().find(|m| {
            m.module_to_port == Some(local_port)
                || (m.is_assigned() && m.module == module)
        }) {
            return Err(ChassisError::InvalidMapping(format!(
                "slot {slot}: module {module} or local port {local_port} \
                 already owned by local port {}",
                other.module_to_port()
            )));
        }
        if port_number(module, self.module_offset).is_none() {
            return Err(ChassisError::InvalidMapping(format!(
                "slot {slot}: module {module} with offset {} has no valid \
                 port number",
                self.module_offset
            )));
        }
        Ok(())
    }
}

impl<H: ChassisOps> Chassis<H> {
    /// Map `local_port` of `slot` to `module`, and tell the module
    /// environment that the module is now exposed.
    pub(crate) fn port_module_map(
        &mut self,
        slot: SlotIndex,
        local_port: LocalPort,
        module: ModuleIndex,
    ) -> ChassisResult<()> {
        self.line_card(slot)?.check_map(local_port, module)?;
        if let Some(owner) = self.local_port_owner(local_port) {
            return Err(ChassisError::InvalidMapping(format!(
                "slot {slot}: local port {local_port} already owned by slot \
                 {owner}"
            )));
        }
        self.hdl.module_port_map(slot, module)?;

        let card = self.line_card_mut(slot)?;
        if let Some(entry) = card.entry_mut(local_port) {
            entry.module_to_port = Some(local_port);
            entry.module = module;
        }
        debug!(self.log, "mapped module";
            "slot" => slot, "local_port" => local_port, "module" => module);
        Ok(())
    }

    // The slot whose table has `local_port` assigned, if any.
    fn local_port_owner(&self, local_port: LocalPort) -> Option<SlotIndex> {
        self.line_cards()
            .iter()
            .find(|card| {
                card.entry(local_port)
                    .is_some_and(|e| e.module_to_port == Some(local_port))
            })
            .map(|card| card.slot_index)
    }

    /// Undo `port_module_map()`.  Unmapping an unassigned entry is a no-op.
    pub(crate) fn port_module_unmap(
        &mut self,
        slot: SlotIndex,
        local_port: LocalPort,
    ) {
        let Ok(card) = self.line_card_mut(slot) else {
            error!(self.log, "unmap on unknown slot"; "slot" => slot);
            return;
        };
        let Some(entry) = card.entry_mut(local_port) else {
            return;
        };
        if entry.module_to_port.take().is_none() {
            return;
        }
        let module = entry.module;

        if let Err(e) = self.hdl.module_port_unmap(slot, module) {
            error!(self.log, "failed to unmap module";
                "slot" => slot,
                "local_port" => local_port,
                "module" => module,
                "error" => %e);
        }
    }
}
