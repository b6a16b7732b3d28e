// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Port objects: the net devices that expose a module to the host, and the
//! callbacks the host invokes on them.

use std::sync::Arc;

use slog::debug;
use slog::error;
use slog::info;
use slog::o;

use aal::reg::Ppad;
use aal::AalResult;
use aal::ChassisOps;
use aal::DevlinkPort;
use aal::DrvInfo;
use aal::EepromPage;
use aal::ModuleInfo;
use aal::NetdevHandler;
use aal::NetdevHdl;
use aal::PowerModeParams;
use common::network::MacAddr;
use common::ports::LocalPort;
use common::ports::ModuleIndex;
use common::ports::SlotIndex;

use crate::chassis::Chassis;
use crate::linecard::port_number;
use crate::types::ChassisError;
use crate::types::ChassisResult;

/// A module exposed to the host as a net device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModulePort {
    local_port: LocalPort,
    module: ModuleIndex,
    slot_index: SlotIndex,
    module_offset: u16,
    mac: MacAddr,
    dev: NetdevHdl,
}

impl ModulePort {
    pub fn local_port(&self) -> LocalPort {
        self.local_port
    }

    pub fn module(&self) -> ModuleIndex {
        self.module
    }

    pub fn slot_index(&self) -> SlotIndex {
        self.slot_index
    }

    pub fn module_offset(&self) -> u16 {
        self.module_offset
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn dev(&self) -> NetdevHdl {
        self.dev
    }
}

/// The callbacks registered with the host for a single port.  The handler
/// carries the identity of its port, so it never needs to reach back into
/// the mapping table.
pub struct PortNetdev<H: ChassisOps> {
    hdl: Arc<H>,
    log: slog::Logger,
    local_port: LocalPort,
    slot_index: SlotIndex,
    module: ModuleIndex,
}

impl<H: ChassisOps> NetdevHandler for PortNetdev<H> {
    fn open(&self) -> AalResult<()> {
        debug!(self.log, "open");
        self.hdl.module_port_up(self.slot_index, self.module)
    }

    fn stop(&self) -> AalResult<()> {
        debug!(self.log, "stop");
        self.hdl.module_port_down(self.slot_index, self.module)
    }

    fn devlink_port(&self) -> Option<DevlinkPort> {
        self.hdl.port_devlink_lookup(self.local_port)
    }

    fn drvinfo(&self) -> DrvInfo {
        let bus_info = self.hdl.bus_info();
        DrvInfo {
            driver: bus_info.device_kind,
            fw_version: bus_info.fw_rev.to_string(),
            bus_info: bus_info.device_name,
        }
    }

    fn module_info(&self) -> AalResult<ModuleInfo> {
        self.hdl.get_module_info(self.slot_index, self.module)
    }

    fn module_eeprom(&self, offset: u32, len: u32) -> AalResult<Vec<u8>> {
        self.hdl
            .get_module_eeprom(self.slot_index, self.module, offset, len)
    }

    fn module_eeprom_by_page(&self, page: &EepromPage) -> AalResult<Vec<u8>> {
        self.hdl
            .get_module_eeprom_by_page(self.slot_index, self.module, page)
    }

    fn reset(&self, flags: &mut u32) -> AalResult<()> {
        self.hdl.reset_module(self.slot_index, self.module, flags)
    }

    fn module_power_mode(&self) -> AalResult<PowerModeParams> {
        self.hdl.get_module_power_mode(self.slot_index, self.module)
    }

    fn set_module_power_mode(
        &self,
        params: &PowerModeParams,
    ) -> AalResult<()> {
        self.hdl
            .set_module_power_mode(self.slot_index, self.module, params.policy)
    }
}

impl<H: ChassisOps> Chassis<H> {
    // The port's address is the device's port base address, with the final
    // octet replaced by the port number.
    fn port_addr_get(&self, port_number: u8) -> ChassisResult<MacAddr> {
        let ppad = self.query(&Ppad::request(false, 0))?;
        Ok(ppad.mac.with_last_octet(port_number))
    }

    // Release the net device and the core port, in that order.
    fn port_unwind(&self, local_port: LocalPort, dev: NetdevHdl) {
        self.hdl.netdev_free(dev);
        self.hdl.port_fini(local_port);
    }

    /// Create the port object for the module mapped at `local_port`, and
    /// register it with the host.  On failure, everything done here is
    /// undone before returning.
    pub(crate) fn port_create(
        &mut self,
        slot: SlotIndex,
        local_port: LocalPort,
        module: ModuleIndex,
    ) -> ChassisResult<()> {
        let log = self.log.new(o!(
            "slot" => slot,
            "local_port" => local_port,
            "module" => module
        ));
        let module_offset = self.line_card(slot)?.module_offset;
        let port_number =
            port_number(module, module_offset).ok_or_else(|| {
                ChassisError::InvalidMapping(format!(
                    "module {module} with offset {module_offset} has no \
                     valid port number"
                ))
            })?;

        self.hdl
            .port_init(local_port, slot, port_number, self.base_mac)
            .map_err(|err| {
                error!(log, "failed to init core port"; "error" => %err);
                ChassisError::CorePortInitFailed { local_port, err }
            })?;

        let dev = match self
            .hdl
            .netdev_alloc(&self.bus_info.device_name, self.hdl.core_net())
        {
            Ok(dev) => dev,
            Err(e) => {
                error!(log, "failed to allocate netdev"; "error" => %e);
                self.hdl.port_fini(local_port);
                return Err(ChassisError::OutOfMemory(format!(
                    "netdev for port {local_port}: {e}"
                )));
            }
        };

        let mac = match self.port_addr_get(port_number).and_then(|mac| {
            self.hdl.netdev_set_addr(dev, mac)?;
            Ok(mac)
        }) {
            Ok(mac) => mac,
            Err(e) => {
                error!(log, "unable to get port mac address"; "error" => %e);
                self.port_unwind(local_port, dev);
                return Err(e);
            }
        };

        self.hdl.netdev_carrier_set(dev, false);

        let port = ModulePort {
            local_port,
            module,
            slot_index: slot,
            module_offset,
            mac,
            dev,
        };
        let handler = Arc::new(PortNetdev {
            hdl: self.hdl.clone(),
            log: log.clone(),
            local_port,
            slot_index: slot,
            module,
        });
        self.bind_port(slot, local_port, Some(port));

        if let Err(err) = self.hdl.netdev_register(dev, handler) {
            error!(log, "failed to register netdev"; "error" => %err);
            self.bind_port(slot, local_port, None);
            self.port_unwind(local_port, dev);
            return Err(ChassisError::InterfaceRegistrationFailed {
                local_port,
                err,
            });
        }

        self.hdl.port_eth_set(local_port, dev);
        info!(log, "created port"; "dev" => %dev, "mac" => %mac);
        Ok(())
    }

    /// Tear down the port object at `local_port`, in the reverse order of
    /// `port_create()`.  The mapping itself is left in place.
    pub(crate) fn port_remove(
        &mut self,
        slot: SlotIndex,
        local_port: LocalPort,
    ) {
        let dev = match self
            .line_card(slot)
            .ok()
            .and_then(|card| card.entry(local_port))
            .and_then(|entry| entry.port())
        {
            Some(port) => port.dev,
            None => {
                debug!(self.log, "no port to remove";
                    "slot" => slot, "local_port" => local_port);
                return;
            }
        };

        self.hdl.port_clear(local_port);
        // The host stops the device first if it is up.
        self.hdl.netdev_unregister(dev);
        self.bind_port(slot, local_port, None);
        self.hdl.netdev_free(dev);
        self.hdl.port_fini(local_port);
        info!(self.log, "removed port";
            "slot" => slot, "local_port" => local_port, "dev" => %dev);
    }

    fn bind_port(
        &mut self,
        slot: SlotIndex,
        local_port: LocalPort,
        port: Option<ModulePort>,
    ) {
        if let Some(entry) = self
            .line_card_mut(slot)
            .ok()
            .and_then(|card| card.entry_mut(local_port))
        {
            entry.port = port;
        }
    }
}
