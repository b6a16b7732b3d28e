// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::collections::BTreeMap;
use std::sync::Arc;

use slog::debug;
use slog::error;
use slog::info;

use aal::AalError;
use aal::AalResult;
use aal::CorePortOps;
use aal::DevlinkPort;
use aal::NetNs;
use aal::NetdevHandler;
use aal::NetdevHdl;
use aal::NetdevOps;
use common::network::MacAddr;
use common::ports::LocalPort;
use common::ports::SlotIndex;

use super::StubHandle;
use crate::chaos::unfurl;

const CORE_NET: NetNs = NetNs(1);

/// An entry in the simulated core port registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorePort {
    pub slot: SlotIndex,
    pub port_number: u8,
    pub switch_id: MacAddr,
    /// The net device bound with `port_eth_set()`.
    pub netdev: Option<NetdevHdl>,
}

// A net device allocated from the simulated network stack.
pub(crate) struct StubNetdev {
    parent: String,
    net: NetNs,
    mac: MacAddr,
    carrier: bool,
    up: bool,
    handler: Option<Arc<dyn NetdevHandler>>,
}

impl StubNetdev {
    fn registered(&self) -> bool {
        self.handler.is_some()
    }
}

#[derive(Default)]
pub(crate) struct NetdevData {
    next_hdl: u32,
    devs: BTreeMap<NetdevHdl, StubNetdev>,
}

impl StubHandle {
    /// The local ports currently initialized in the core registry.
    pub fn core_ports(&self) -> Vec<LocalPort> {
        self.core_ports.lock().unwrap().keys().copied().collect()
    }

    pub fn core_port(&self, local_port: LocalPort) -> Option<CorePort> {
        self.core_ports.lock().unwrap().get(&local_port).cloned()
    }

    /// The number of allocated net devices, whether registered or not.
    pub fn allocated_netdevs(&self) -> usize {
        self.netdevs.lock().unwrap().devs.len()
    }

    /// The net devices currently visible to the host.
    pub fn registered_netdevs(&self) -> Vec<NetdevHdl> {
        self.netdevs
            .lock()
            .unwrap()
            .devs
            .iter()
            .filter(|(_, d)| d.registered())
            .map(|(hdl, _)| *hdl)
            .collect()
    }

    /// The parent device name and namespace a net device was allocated with.
    pub fn netdev_origin(&self, dev: NetdevHdl) -> Option<(String, NetNs)> {
        let data = self.netdevs.lock().unwrap();
        data.devs.get(&dev).map(|d| (d.parent.clone(), d.net))
    }

    pub fn netdev_mac(&self, dev: NetdevHdl) -> Option<MacAddr> {
        self.netdevs.lock().unwrap().devs.get(&dev).map(|d| d.mac)
    }

    pub fn netdev_carrier(&self, dev: NetdevHdl) -> Option<bool> {
        self.netdevs.lock().unwrap().devs.get(&dev).map(|d| d.carrier)
    }

    pub fn netdev_is_up(&self, dev: NetdevHdl) -> bool {
        self.netdevs
            .lock()
            .unwrap()
            .devs
            .get(&dev)
            .map(|d| d.up)
            .unwrap_or(false)
    }

    /// The callbacks registered for a device.
    pub fn netdev_handler(
        &self,
        dev: NetdevHdl,
    ) -> Option<Arc<dyn NetdevHandler>> {
        let data = self.netdevs.lock().unwrap();
        data.devs.get(&dev).and_then(|d| d.handler.clone())
    }

    /// Administratively bring a registered device up, as the host would.
    pub fn netdev_open(&self, dev: NetdevHdl) -> AalResult<()> {
        let handler = self.netdev_handler(dev).ok_or_else(|| {
            AalError::Missing(format!("{dev} is not registered"))
        })?;
        // The handler calls back into the module environment, so no lock
        // may be held across it.
        handler.open()?;
        if let Some(d) = self.netdevs.lock().unwrap().devs.get_mut(&dev) {
            d.up = true;
        }
        Ok(())
    }

    /// Administratively bring a registered device down.
    pub fn netdev_close(&self, dev: NetdevHdl) -> AalResult<()> {
        let handler = self.netdev_handler(dev).ok_or_else(|| {
            AalError::Missing(format!("{dev} is not registered"))
        })?;
        if let Some(d) = self.netdevs.lock().unwrap().devs.get_mut(&dev) {
            d.up = false;
        }
        handler.stop()
    }
}

impl CorePortOps for StubHandle {
    fn max_ports(&self) -> u16 {
        self.max_ports
    }

    fn core_net(&self) -> NetNs {
        CORE_NET
    }

    fn port_init(
        &self,
        local_port: LocalPort,
        slot: SlotIndex,
        port_number: u8,
        switch_id: MacAddr,
    ) -> AalResult<()> {
        unfurl!(self, port_init);
        if local_port >= self.max_ports {
            return Err(AalError::InvalidArg(format!(
                "local port {local_port} out of range"
            )));
        }
        let mut ports = self.core_ports.lock().unwrap();
        if ports.contains_key(&local_port) {
            return Err(AalError::Exists(format!("local port {local_port}")));
        }
        ports.insert(
            local_port,
            CorePort {
                slot,
                port_number,
                switch_id,
                netdev: None,
            },
        );
        debug!(self.log, "core port initialized";
            "local_port" => local_port,
            "slot" => slot,
            "port_number" => port_number);
        Ok(())
    }

    fn port_fini(&self, local_port: LocalPort) {
        if self.core_ports.lock().unwrap().remove(&local_port).is_none() {
            error!(self.log, "fini of unknown core port";
                "local_port" => local_port);
        }
    }

    fn port_eth_set(&self, local_port: LocalPort, dev: NetdevHdl) {
        match self.core_ports.lock().unwrap().get_mut(&local_port) {
            Some(p) => p.netdev = Some(dev),
            None => error!(self.log, "eth_set on unknown core port";
                "local_port" => local_port),
        }
    }

    fn port_clear(&self, local_port: LocalPort) {
        if let Some(p) = self.core_ports.lock().unwrap().get_mut(&local_port) {
            p.netdev = None;
        }
    }

    fn port_devlink_lookup(
        &self,
        local_port: LocalPort,
    ) -> Option<DevlinkPort> {
        self.core_ports
            .lock()
            .unwrap()
            .get(&local_port)
            .map(|p| DevlinkPort {
                index: local_port as u32,
                local_port,
                slot: p.slot,
                port_number: p.port_number,
            })
    }
}

impl NetdevOps for StubHandle {
    fn netdev_alloc(&self, parent: &str, net: NetNs) -> AalResult<NetdevHdl> {
        unfurl!(self, netdev_alloc);
        let mut data = self.netdevs.lock().unwrap();
        let hdl = NetdevHdl(data.next_hdl);
        data.next_hdl += 1;
        data.devs.insert(
            hdl,
            StubNetdev {
                parent: parent.to_string(),
                net,
                mac: MacAddr::ZERO,
                carrier: true,
                up: false,
                handler: None,
            },
        );
        Ok(hdl)
    }

    fn netdev_set_addr(&self, dev: NetdevHdl, mac: MacAddr) -> AalResult<()> {
        unfurl!(self, netdev_set_addr);
        match self.netdevs.lock().unwrap().devs.get_mut(&dev) {
            Some(d) => {
                d.mac = mac;
                Ok(())
            }
            None => Err(AalError::Missing(dev.to_string())),
        }
    }

    fn netdev_carrier_set(&self, dev: NetdevHdl, up: bool) {
        if let Some(d) = self.netdevs.lock().unwrap().devs.get_mut(&dev) {
            d.carrier = up;
        }
    }

    fn netdev_register(
        &self,
        dev: NetdevHdl,
        handler: Arc<dyn NetdevHandler>,
    ) -> AalResult<()> {
        unfurl!(self, netdev_register);
        let mut data = self.netdevs.lock().unwrap();
        let d = data
            .devs
            .get_mut(&dev)
            .ok_or_else(|| AalError::Missing(dev.to_string()))?;
        if d.registered() {
            return Err(AalError::Exists(dev.to_string()));
        }
        d.handler = Some(handler);
        info!(self.log, "registered net device";
            "dev" => %dev, "mac" => %d.mac);
        Ok(())
    }

    fn netdev_unregister(&self, dev: NetdevHdl) {
        let (handler, was_up) = {
            let mut data = self.netdevs.lock().unwrap();
            match data.devs.get_mut(&dev) {
                Some(d) => {
                    let was_up = d.up;
                    d.up = false;
                    (d.handler.take(), was_up)
                }
                None => (None, false),
            }
        };

        let Some(handler) = handler else {
            error!(self.log, "unregister of unregistered net device";
                "dev" => %dev);
            return;
        };
        if was_up {
            if let Err(e) = handler.stop() {
                error!(self.log, "stop failed during unregister";
                    "dev" => %dev, "error" => %e);
            }
        }
        info!(self.log, "unregistered net device"; "dev" => %dev);
    }

    fn netdev_free(&self, dev: NetdevHdl) {
        let mut data = self.netdevs.lock().unwrap();
        match data.devs.get(&dev) {
            Some(d) if d.registered() => {
                error!(self.log, "free of registered net device";
                    "dev" => %dev);
            }
            Some(_) => {
                data.devs.remove(&dev);
            }
            None => {
                error!(self.log, "free of unknown net device"; "dev" => %dev);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use super::super::tests::test_logger;
    use super::*;
    use crate::stub::StubConfig;
    use aal::DrvInfo;
    use aal::EepromPage;
    use aal::ModuleInfo;
    use aal::PowerModeParams;

    #[derive(Default)]
    struct Counting {
        opens: AtomicU32,
        stops: AtomicU32,
    }

    impl NetdevHandler for Counting {
        fn open(&self) -> AalResult<()> {
            self.opens.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        fn stop(&self) -> AalResult<()> {
            self.stops.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        fn devlink_port(&self) -> Option<DevlinkPort> {
            None
        }
        fn drvinfo(&self) -> DrvInfo {
            DrvInfo::default()
        }
        fn module_info(&self) -> AalResult<ModuleInfo> {
            Err(AalError::OperationUnsupported)
        }
        fn module_eeprom(&self, _: u32, _: u32) -> AalResult<Vec<u8>> {
            Err(AalError::OperationUnsupported)
        }
        fn module_eeprom_by_page(&self, _: &EepromPage) -> AalResult<Vec<u8>> {
            Err(AalError::OperationUnsupported)
        }
        fn reset(&self, _: &mut u32) -> AalResult<()> {
            Err(AalError::OperationUnsupported)
        }
        fn module_power_mode(&self) -> AalResult<PowerModeParams> {
            Err(AalError::OperationUnsupported)
        }
        fn set_module_power_mode(&self, _: &PowerModeParams) -> AalResult<()> {
            Err(AalError::OperationUnsupported)
        }
    }

    #[test]
    fn test_unregister_stops_open_device() {
        let hdl =
            StubHandle::new(&test_logger(), &StubConfig::default()).unwrap();
        let handler = Arc::new(Counting::default());
        let dev = hdl.netdev_alloc("stub-0", hdl.core_net()).unwrap();
        hdl.netdev_register(dev, handler.clone()).unwrap();
        assert!(hdl.netdev_register(dev, handler.clone()).is_err());

        hdl.netdev_open(dev).unwrap();
        assert!(hdl.netdev_is_up(dev));
        assert_eq!(handler.opens.load(Ordering::Relaxed), 1);

        hdl.netdev_unregister(dev);
        assert_eq!(handler.stops.load(Ordering::Relaxed), 1);
        assert!(hdl.registered_netdevs().is_empty());
        assert_eq!(hdl.allocated_netdevs(), 1);

        hdl.netdev_free(dev);
        assert_eq!(hdl.allocated_netdevs(), 0);
    }

    #[test]
    fn test_unregister_closed_device() {
        let hdl =
            StubHandle::new(&test_logger(), &StubConfig::default()).unwrap();
        let handler = Arc::new(Counting::default());
        let dev = hdl.netdev_alloc("stub-0", hdl.core_net()).unwrap();
        hdl.netdev_register(dev, handler.clone()).unwrap();
        hdl.netdev_unregister(dev);
        assert_eq!(handler.stops.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_core_ports() {
        let hdl =
            StubHandle::new(&test_logger(), &StubConfig::default()).unwrap();
        hdl.port_init(5, 0, 5, MacAddr::ZERO).unwrap();
        assert!(hdl.port_init(5, 0, 5, MacAddr::ZERO).is_err());
        assert!(hdl.port_init(128, 0, 1, MacAddr::ZERO).is_err());

        hdl.port_eth_set(5, NetdevHdl(9));
        assert_eq!(hdl.core_port(5).unwrap().netdev, Some(NetdevHdl(9)));
        let dl = hdl.port_devlink_lookup(5).unwrap();
        assert_eq!(dl.port_number, 5);

        hdl.port_clear(5);
        assert_eq!(hdl.core_port(5).unwrap().netdev, None);
        hdl.port_fini(5);
        assert!(hdl.core_ports().is_empty());
    }
}
