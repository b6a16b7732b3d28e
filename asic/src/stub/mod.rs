// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! An in-memory chassis, implementing every service the port manager
//! consumes.  The simulated device answers register queries from its
//! configuration, tracks the core port registry and the net devices the
//! manager creates, and lets a test or operator plug and unplug line cards.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::MutexGuard;

use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::info;
use slog::o;
use tokio::sync::mpsc;

use aal::reg::Mddq;
use aal::reg::Mgpir;
use aal::reg::Ppad;
use aal::reg::Spad;
use aal::AalError;
use aal::AalResult;
use aal::BusInfo;
use aal::FwRev;
use aal::LinecardEvent;
use aal::LinecardOps;
use aal::RegId;
use aal::Register;
use aal::RegisterOps;
use common::network::MacAddr;
use common::ports::is_pluggable;
use common::ports::SlotIndex;
use common::ports::MAIN_BOARD_SLOT;

use crate::chaos::unfurl;
use crate::chaos::ChaosConfig;

mod module;
mod netdev;

pub use module::ModuleState;
pub use netdev::CorePort;

/// The description of a single pluggable line card slot.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SlotConfig {
    /// The number of modules on the card in this slot.
    pub modules: u8,
    /// Whether the card is active when the simulation starts.
    pub active: bool,
    pub card_type: u8,
}

/// Describes the simulated chassis.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StubConfig {
    pub device_kind: String,
    pub device_name: String,
    pub fw_rev: FwRev,
    /// The number of local ports supported by the core.
    pub max_ports: u16,
    /// The number of modules on the main board.
    pub main_board_modules: u8,
    pub max_modules_per_slot: u8,
    /// The pluggable slots, starting at slot 1.
    pub slots: Vec<SlotConfig>,
    /// The address reported by SPAD, or None if the firmware does not
    /// support the register.
    pub base_mac: Option<MacAddr>,
    /// The address reported by PPAD.
    pub port_mac: MacAddr,
    pub faults: ChaosConfig,
}

impl Default for StubConfig {
    fn default() -> Self {
        StubConfig {
            device_kind: "chassis_stub".to_string(),
            device_name: "stub-0".to_string(),
            fw_rev: FwRev::new(30, 2000, 1886),
            max_ports: 128,
            main_board_modules: 4,
            max_modules_per_slot: 16,
            slots: Vec::new(),
            base_mac: None,
            port_mac: MacAddr::new(0x02, 0x08, 0x20, 0x00, 0x00, 0x00),
            faults: ChaosConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct SlotState {
    modules: u8,
    active: bool,
    card_type: u8,
}

pub struct StubHandle {
    log: slog::Logger,
    bus_info: BusInfo,
    max_ports: u16,
    max_modules_per_slot: u8,
    base_mac: Option<MacAddr>,
    port_mac: MacAddr,
    slots: Mutex<BTreeMap<SlotIndex, SlotState>>,
    modules: Mutex<module::ModuleData>,
    core_ports: Mutex<BTreeMap<u16, CorePort>>,
    netdevs: Mutex<netdev::NetdevData>,
    pub(crate) faults: Mutex<ChaosConfig>,

    event_tx: Mutex<Option<mpsc::UnboundedSender<LinecardEvent>>>,
}

impl StubHandle {
    pub fn new(log: &slog::Logger, config: &StubConfig) -> AalResult<Self> {
        if config.slots.len() >= SlotIndex::MAX as usize {
            return Err(AalError::InvalidArg(format!(
                "too many slots: {}",
                config.slots.len()
            )));
        }

        let mut slots = BTreeMap::new();
        slots.insert(
            MAIN_BOARD_SLOT,
            SlotState {
                modules: config.main_board_modules,
                active: true,
                card_type: 0,
            },
        );
        for (idx, slot) in config.slots.iter().enumerate() {
            slots.insert(
                idx as SlotIndex + 1,
                SlotState {
                    modules: slot.modules,
                    active: slot.active,
                    card_type: slot.card_type,
                },
            );
        }

        let log = log.new(o!("unit" => "stub"));
        info!(log, "simulated chassis";
            "fw" => %config.fw_rev,
            "max_ports" => config.max_ports,
            "slots" => config.slots.len());

        Ok(StubHandle {
            log,
            bus_info: BusInfo {
                device_kind: config.device_kind.clone(),
                device_name: config.device_name.clone(),
                fw_rev: config.fw_rev,
            },
            max_ports: config.max_ports,
            max_modules_per_slot: config.max_modules_per_slot,
            base_mac: config.base_mac,
            port_mac: config.port_mac,
            slots: Mutex::new(slots),
            modules: Mutex::new(module::ModuleData::default()),
            core_ports: Mutex::new(BTreeMap::new()),
            netdevs: Mutex::new(netdev::NetdevData::default()),
            faults: Mutex::new(config.faults.clone()),
            event_tx: Mutex::new(None),
        })
    }

    /// Access the fault configuration, to change which operations fail.
    pub fn faults(&self) -> MutexGuard<'_, ChaosConfig> {
        self.faults.lock().unwrap()
    }

    fn num_of_slots(&self) -> usize {
        self.slots.lock().unwrap().len() - 1
    }

    pub(crate) fn slot_modules(&self, slot: SlotIndex) -> Option<u8> {
        self.slots.lock().unwrap().get(&slot).map(|s| s.modules)
    }

    pub fn slot_is_active(&self, slot: SlotIndex) -> bool {
        self.slots
            .lock()
            .unwrap()
            .get(&slot)
            .map(|s| s.active)
            .unwrap_or(false)
    }

    /// Change the status reported for a slot, without announcing it.  The
    /// change will be noticed on the next system event.
    pub fn set_slot_status(
        &self,
        slot: SlotIndex,
        active: bool,
    ) -> AalResult<()> {
        if !is_pluggable(slot) {
            return Err(AalError::InvalidArg(
                "the main board cannot be deactivated".to_string(),
            ));
        }
        let mut slots = self.slots.lock().unwrap();
        match slots.get_mut(&slot) {
            Some(s) => {
                s.active = active;
                Ok(())
            }
            None => Err(AalError::InvalidArg(format!("no slot {slot}"))),
        }
    }

    /// Plug or unplug the card in a slot, and announce the change to the
    /// registered event handler.
    pub fn set_slot_active(
        &self,
        slot: SlotIndex,
        active: bool,
    ) -> AalResult<()> {
        self.set_slot_status(slot, active)?;
        info!(self.log, "slot status changed";
            "slot" => slot, "active" => active);
        self.send_event(match active {
            true => LinecardEvent::Active { slot },
            false => LinecardEvent::Inactive { slot },
        });
        Ok(())
    }

    /// Announce a system status change.
    pub fn raise_sys_event(&self) {
        self.send_event(LinecardEvent::SysEvent);
    }

    fn send_event(&self, event: LinecardEvent) {
        if let Some(tx) = self.event_tx.lock().unwrap().as_ref() {
            if tx.send(event).is_err() {
                debug!(self.log, "event handler has gone away";
                    "event" => ?event);
            }
        }
    }

    pub fn event_handler_registered(&self) -> bool {
        self.event_tx.lock().unwrap().is_some()
    }

    fn mgpir(&self, req: Mgpir) -> AalResult<Mgpir> {
        let num_of_modules =
            self.slot_modules(req.slot_index).ok_or_else(|| {
                AalError::InvalidArg(format!("no slot {}", req.slot_index))
            })?;
        let num_of_slots = self.num_of_slots() as u8;
        Ok(Mgpir {
            slot_index: req.slot_index,
            num_of_modules,
            num_of_slots,
            max_modules_per_slot: match num_of_slots {
                0 => 0,
                _ => self.max_modules_per_slot,
            },
            ..req
        })
    }

    fn mddq(&self, req: Mddq) -> AalResult<Mddq> {
        if !is_pluggable(req.slot_index) {
            return Err(AalError::InvalidArg(
                "slot info is only reported for line cards".to_string(),
            ));
        }
        let slots = self.slots.lock().unwrap();
        let slot = slots.get(&req.slot_index).ok_or_else(|| {
            AalError::InvalidArg(format!("no slot {}", req.slot_index))
        })?;
        Ok(Mddq {
            slot_index: req.slot_index,
            provisioned: slot.modules > 0,
            sr_valid: slot.active,
            lc_ready: slot.active,
            active: slot.active,
            card_type: slot.card_type,
            ..Default::default()
        })
    }
}

impl RegisterOps for StubHandle {
    fn bus_info(&self) -> BusInfo {
        self.bus_info.clone()
    }

    fn reg_query(&self, id: RegId, payload: &[u8]) -> AalResult<Vec<u8>> {
        debug!(self.log, "register query"; "reg" => %id);
        match id {
            RegId::Mgpir => {
                unfurl!(self, mgpir);
                Ok(self.mgpir(Mgpir::unpack(payload)?)?.pack())
            }
            RegId::Mddq => {
                unfurl!(self, mddq);
                Ok(self.mddq(Mddq::unpack(payload)?)?.pack())
            }
            RegId::Ppad => {
                unfurl!(self, ppad);
                let req = Ppad::unpack(payload)?;
                Ok(Ppad {
                    mac: self.port_mac,
                    ..req
                }
                .pack())
            }
            RegId::Spad => {
                unfurl!(self, spad);
                match self.base_mac {
                    Some(base_mac) => Ok(Spad { base_mac }.pack()),
                    None => Err(AalError::OperationUnsupported),
                }
            }
        }
    }
}

impl LinecardOps for StubHandle {
    fn linecards_count(&self) -> Option<u8> {
        match self.num_of_slots() {
            0 => None,
            n => Some(n as u8),
        }
    }

    fn register_linecard_event_handler(
        &self,
        tx: mpsc::UnboundedSender<LinecardEvent>,
    ) -> AalResult<()> {
        unfurl!(self, register_linecard_event_handler);
        let active: Vec<SlotIndex> = self
            .slots
            .lock()
            .unwrap()
            .iter()
            .filter(|(slot, s)| is_pluggable(**slot) && s.active)
            .map(|(slot, _)| *slot)
            .collect();

        // Cards that are already up are reported as if they had just been
        // plugged in.
        for slot in active {
            let _ = tx.send(LinecardEvent::Active { slot });
        }
        *self.event_tx.lock().unwrap() = Some(tx);
        info!(self.log, "registered line card event handler");
        Ok(())
    }

    fn unregister_linecard_event_handler(&self) {
        if self.event_tx.lock().unwrap().take().is_some() {
            info!(self.log, "unregistered line card event handler");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chaos::Chaos;
    use crate::chaos::Fault;

    pub fn test_logger() -> slog::Logger {
        use slog::Drain;
        let decorator =
            slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog::Logger::root(drain, o!())
    }

    pub fn two_slot_config() -> StubConfig {
        StubConfig {
            slots: vec![
                SlotConfig {
                    modules: 3,
                    active: true,
                    card_type: 1,
                },
                SlotConfig {
                    modules: 2,
                    active: false,
                    card_type: 1,
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_mgpir() {
        let hdl = StubHandle::new(&test_logger(), &two_slot_config()).unwrap();
        let main = hdl.query(&Mgpir::request(0)).unwrap();
        assert_eq!(main.num_of_modules, 4);
        assert_eq!(main.num_of_slots, 2);
        assert_eq!(main.max_modules_per_slot, 16);

        let card = hdl.query(&Mgpir::request(1)).unwrap();
        assert_eq!(card.slot_index, 1);
        assert_eq!(card.num_of_modules, 3);

        assert!(hdl.query(&Mgpir::request(3)).is_err());
    }

    #[test]
    fn test_mddq() {
        let hdl = StubHandle::new(&test_logger(), &two_slot_config()).unwrap();
        assert!(hdl.query(&Mddq::slot_info_request(1)).unwrap().active);
        assert!(!hdl.query(&Mddq::slot_info_request(2)).unwrap().active);

        hdl.set_slot_status(2, true).unwrap();
        assert!(hdl.query(&Mddq::slot_info_request(2)).unwrap().active);
        assert!(hdl.set_slot_status(0, false).is_err());
    }

    #[test]
    fn test_spad_unsupported() {
        let hdl = StubHandle::new(&test_logger(), &StubConfig::default())
            .unwrap();
        assert!(matches!(
            hdl.query(&Spad::request()),
            Err(AalError::OperationUnsupported)
        ));
        assert_eq!(hdl.linecards_count(), None);
    }

    #[test]
    fn test_register_fault() {
        let hdl = StubHandle::new(&test_logger(), &StubConfig::default())
            .unwrap();
        hdl.faults().ppad = Chaos::new(Fault::Always);
        assert!(matches!(
            hdl.query(&Ppad::request(false, 1)),
            Err(AalError::Synthetic(_))
        ));
    }

    #[test]
    fn test_event_replay() {
        let hdl = StubHandle::new(&test_logger(), &two_slot_config()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hdl.register_linecard_event_handler(tx).unwrap();
        assert_eq!(rx.try_recv().unwrap(), LinecardEvent::Active { slot: 1 });
        assert!(rx.try_recv().is_err());

        hdl.set_slot_active(2, true).unwrap();
        assert_eq!(rx.try_recv().unwrap(), LinecardEvent::Active { slot: 2 });
        hdl.set_slot_active(1, false).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            LinecardEvent::Inactive { slot: 1 }
        );

        hdl.unregister_linecard_event_handler();
        hdl.raise_sys_event();
        assert!(rx.try_recv().is_err());
    }
}
