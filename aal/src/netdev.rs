// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::AalResult;
use crate::DevlinkPort;

/// The `reset()` flag bit requesting a reset of the module's PHY.
pub const ETH_RESET_PHY: u32 = 1 << 6;

/// An opaque handle for a net device allocated by the host network stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NetdevHdl(pub u32);

impl fmt::Display for NetdevHdl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "netdev{}", self.0)
    }
}

/// Driver identification reported through ethtool.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DrvInfo {
    pub driver: String,
    pub fw_version: String,
    pub bus_info: String,
}

/// The SFF standard a module's EEPROM layout conforms to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleType {
    Sff8079,
    Sff8436,
    Sff8472,
    Sff8636,
}

/// Describes the EEPROM of a plugged module.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModuleInfo {
    pub module_type: ModuleType,
    pub eeprom_len: u32,
}

/// A paged EEPROM read request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EepromPage {
    pub offset: u32,
    pub length: u32,
    pub page: u8,
    pub bank: u8,
    pub i2c_address: u8,
}

/// The administrative power policy of a module.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PowerModePolicy {
    /// Always operate in high power mode.
    #[default]
    High,
    /// Operate in high power mode only while the port is up.
    Auto,
}

/// The operational power mode of a module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerMode {
    Low,
    High,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PowerModeParams {
    pub policy: PowerModePolicy,
    /// Only reported when a module is plugged in.
    pub mode: Option<PowerMode>,
}

/// The callbacks the host network stack invokes on a registered net device.
/// These play the role of the device's netdev and ethtool operations.
pub trait NetdevHandler: Send + Sync {
    /// The device was administratively brought up.
    fn open(&self) -> AalResult<()>;

    /// The device was administratively brought down, or is being
    /// unregistered while up.
    fn stop(&self) -> AalResult<()>;

    fn devlink_port(&self) -> Option<DevlinkPort>;

    fn drvinfo(&self) -> DrvInfo;

    fn module_info(&self) -> AalResult<ModuleInfo>;

    fn module_eeprom(&self, offset: u32, len: u32) -> AalResult<Vec<u8>>;

    fn module_eeprom_by_page(&self, page: &EepromPage) -> AalResult<Vec<u8>>;

    fn reset(&self, flags: &mut u32) -> AalResult<()>;

    fn module_power_mode(&self) -> AalResult<PowerModeParams>;

    fn set_module_power_mode(&self, params: &PowerModeParams)
        -> AalResult<()>;
}
