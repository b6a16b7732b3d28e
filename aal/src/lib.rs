// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The abstraction layer between the chassis port manager and the services it
//! consumes: the register transport, the module environment, the core port
//! registry, the host network stack, and the line card hot-plug source.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use common::network::MacAddr;
use common::ports::LocalPort;
use common::ports::ModuleIndex;
use common::ports::SlotIndex;

mod netdev;
pub use netdev::*;

pub mod reg;
pub use reg::RegId;
pub use reg::Register;

/// A specialized Result type for operations against the device.
pub type AalResult<T> = Result<T, AalError>;

/// Error type conveying additional information about device errors
#[derive(Error, Debug)]
pub enum AalError {
    /// The register transport failed to execute a query.
    #[error("register {reg} query failed: {err}")]
    QueryFailed { reg: RegId, err: String },
    /// A register payload was too short or otherwise malformed.
    #[error("malformed {reg} payload: {len} bytes, expected {expected}")]
    Malformed {
        reg: RegId,
        len: usize,
        expected: usize,
    },
    /// An argument passed to the device layer is invalid or inappropriate.
    /// This indicates misbehavior from the caller.
    #[error("Invalid argument: {}", .0)]
    InvalidArg(String),
    /// This operation is unsupported by the device or its firmware
    #[error("Operation unsupported by the device")]
    OperationUnsupported,
    /// The service could not allocate the object being requested.
    #[error("Out of memory: {}", .0)]
    NoMemory(String),
    /// A general indication that a caller is trying to create something that
    /// already exists.
    #[error("Already exists: {}", .0)]
    Exists(String),
    /// A general indication that a caller is trying to modify something that
    /// is not present.
    #[error("Missing: {}", .0)]
    Missing(String),
    /// The device layer detected some internal inconsistency
    #[error("Internal error: {}", .0)]
    Internal(String),
    /// An error derived from a purposely triggered synthetic fault for testing
    /// purposes.
    #[error("Synthetic error: {}", .0)]
    Synthetic(String),
}

/// A firmware revision, as reported by the bus driver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct FwRev {
    /// Identifies the chip family rather than a capability level.
    pub major: u16,
    pub minor: u16,
    pub subminor: u16,
}

impl FwRev {
    pub const fn new(major: u16, minor: u16, subminor: u16) -> Self {
        FwRev {
            major,
            minor,
            subminor,
        }
    }

    /// Returns true if `self` is at least `required`, comparing only the
    /// minor and subminor fields.
    pub fn minor_subminor_at_least(&self, required: &FwRev) -> bool {
        (self.minor, self.subminor) >= (required.minor, required.subminor)
    }
}

impl fmt::Display for FwRev {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.subminor)
    }
}

/// Static information about the device, provided by the bus driver.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BusInfo {
    /// The kind of device, reported as the driver name to ethtool.
    pub device_kind: String,
    /// Bus-specific name of the device, e.g. "i2c-2-0048".
    pub device_name: String,
    pub fw_rev: FwRev,
}

/// Identifies the network namespace in which net devices are created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct NetNs(pub u32);

/// The devlink port associated with a local port in the core registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DevlinkPort {
    pub index: u32,
    pub local_port: LocalPort,
    pub slot: SlotIndex,
    pub port_number: u8,
}

/// Hot-plug notifications delivered by the line card event source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinecardEvent {
    /// The card in `slot` became active.
    Active { slot: SlotIndex },
    /// The card in `slot` became inactive or was removed.
    Inactive { slot: SlotIndex },
    /// A system status change occurred, and slot status should be re-read.
    SysEvent,
}

/// The register transport: synchronous request/response hardware queries.
pub trait RegisterOps {
    /// Static information about the device.
    fn bus_info(&self) -> BusInfo;

    /// Send a raw register query and return the raw response payload.
    fn reg_query(&self, id: RegId, payload: &[u8]) -> AalResult<Vec<u8>>;

    /// Pack `reg`, query the device, and unpack the response.
    fn query<R: Register>(&self, reg: &R) -> AalResult<R>
    where
        Self: Sized,
    {
        let rsp = self.reg_query(R::ID, &reg.pack())?;
        R::unpack(&rsp)
    }
}

/// The module environment: power, presence and EEPROM access to the
/// transceiver modules, keyed by (slot, module).
pub trait ModuleEnvOps {
    /// Note that `module` is now exposed through a port.
    fn module_port_map(
        &self,
        slot: SlotIndex,
        module: ModuleIndex,
    ) -> AalResult<()>;

    /// Note that `module` is no longer exposed through a port.
    fn module_port_unmap(
        &self,
        slot: SlotIndex,
        module: ModuleIndex,
    ) -> AalResult<()>;

    /// Enable the electrical/optical path of a module.
    fn module_port_up(
        &self,
        slot: SlotIndex,
        module: ModuleIndex,
    ) -> AalResult<()>;

    /// Disable the electrical/optical path of a module.
    fn module_port_down(
        &self,
        slot: SlotIndex,
        module: ModuleIndex,
    ) -> AalResult<()>;

    fn get_module_info(
        &self,
        slot: SlotIndex,
        module: ModuleIndex,
    ) -> AalResult<ModuleInfo>;

    fn get_module_eeprom(
        &self,
        slot: SlotIndex,
        module: ModuleIndex,
        offset: u32,
        len: u32,
    ) -> AalResult<Vec<u8>>;

    fn get_module_eeprom_by_page(
        &self,
        slot: SlotIndex,
        module: ModuleIndex,
        page: &EepromPage,
    ) -> AalResult<Vec<u8>>;

    /// Reset a module.  On success, the bits of the components that were
    /// reset are cleared from `flags`.
    fn reset_module(
        &self,
        slot: SlotIndex,
        module: ModuleIndex,
        flags: &mut u32,
    ) -> AalResult<()>;

    fn get_module_power_mode(
        &self,
        slot: SlotIndex,
        module: ModuleIndex,
    ) -> AalResult<PowerModeParams>;

    fn set_module_power_mode(
        &self,
        slot: SlotIndex,
        module: ModuleIndex,
        policy: PowerModePolicy,
    ) -> AalResult<()>;
}

/// The core port registry, which tracks the identity of every local port and
/// its association with devlink and the host network stack.
pub trait CorePortOps {
    /// The number of local ports supported by the device.
    fn max_ports(&self) -> u16;

    /// The network namespace owned by the core.
    fn core_net(&self) -> NetNs;

    /// Register the identity of a local port.
    fn port_init(
        &self,
        local_port: LocalPort,
        slot: SlotIndex,
        port_number: u8,
        switch_id: MacAddr,
    ) -> AalResult<()>;

    /// Release a local port registered with `port_init()`.
    fn port_fini(&self, local_port: LocalPort);

    /// Bind a registered net device to a local port.
    fn port_eth_set(&self, local_port: LocalPort, dev: NetdevHdl);

    /// Drop the registry's reference to the port's net device, so that
    /// observers no longer treat it as valid.
    fn port_clear(&self, local_port: LocalPort);

    fn port_devlink_lookup(&self, local_port: LocalPort)
        -> Option<DevlinkPort>;
}

/// The host network stack.
pub trait NetdevOps {
    /// Allocate an unregistered net device.
    fn netdev_alloc(&self, parent: &str, net: NetNs) -> AalResult<NetdevHdl>;

    fn netdev_set_addr(&self, dev: NetdevHdl, mac: MacAddr) -> AalResult<()>;

    fn netdev_carrier_set(&self, dev: NetdevHdl, up: bool);

    /// Make the device visible to the host.  The stack will invoke `handler`
    /// for open/stop and the administrative callbacks.
    fn netdev_register(
        &self,
        dev: NetdevHdl,
        handler: Arc<dyn NetdevHandler>,
    ) -> AalResult<()>;

    /// Remove the device from the host.  If the device is up, the stack first
    /// invokes the handler's `stop()`.
    fn netdev_unregister(&self, dev: NetdevHdl);

    /// Release an unregistered device.
    fn netdev_free(&self, dev: NetdevHdl);
}

/// The source of line card hot-plug events.
pub trait LinecardOps {
    /// The number of pluggable line card slots, or None if the device has no
    /// line card support at all.
    fn linecards_count(&self) -> Option<u8>;

    /// Register a channel on which hot-plug events are delivered.  Cards that
    /// are already active when the handler is registered are reported with
    /// an `Active` event.
    fn register_linecard_event_handler(
        &self,
        tx: tokio::sync::mpsc::UnboundedSender<LinecardEvent>,
    ) -> AalResult<()>;

    fn unregister_linecard_event_handler(&self);
}

/// Everything the chassis port manager needs from the device.
pub trait ChassisOps:
    RegisterOps
    + ModuleEnvOps
    + CorePortOps
    + NetdevOps
    + LinecardOps
    + Send
    + Sync
    + 'static
{
}

impl<T> ChassisOps for T where
    T: RegisterOps
        + ModuleEnvOps
        + CorePortOps
        + NetdevOps
        + LinecardOps
        + Send
        + Sync
        + 'static
{
}

#[cfg(test)]
mod tests {
    use super::FwRev;

    #[test]
    fn test_fw_rev_compare() {
        let required = FwRev::new(0, 2000, 1886);

        assert!(FwRev::new(30, 2000, 1886).minor_subminor_at_least(&required));
        assert!(FwRev::new(30, 2000, 2000).minor_subminor_at_least(&required));
        assert!(FwRev::new(0, 2001, 0).minor_subminor_at_least(&required));
        assert!(!FwRev::new(99, 2000, 1885).minor_subminor_at_least(&required));
        assert!(!FwRev::new(99, 1999, 9999).minor_subminor_at_least(&required));
    }

    #[test]
    fn test_fw_rev_display() {
        assert_eq!(FwRev::new(30, 2000, 1886).to_string(), "30.2000.1886");
    }
}
