// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The chassis manager: discovery of the slot layout, and the lifecycle of
//! each slot's ports as line cards come and go.

use std::sync::Arc;

use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use tokio::sync::mpsc;

use aal::reg::Mddq;
use aal::reg::Mgpir;
use aal::reg::Spad;
use aal::AalError;
use aal::BusInfo;
use aal::ChassisOps;
use aal::FwRev;
use aal::LinecardEvent;
use aal::Register;
use common::network::MacAddr;
use common::ports::is_pluggable;
use common::ports::LocalPort;
use common::ports::SlotIndex;
use common::ports::MAIN_BOARD_SLOT;

use crate::linecard::module_offset;
use crate::linecard::LineCard;
use crate::types::ChassisError;
use crate::types::ChassisResult;

/// The oldest firmware the manager works with.  The major number identifies
/// the chip type and is not checked.
pub const REQUIRED_FW_REV: FwRev = FwRev::new(0, 2000, 1886);

/// Owns the line card records of a chassis, and every port created on it.
pub struct Chassis<H: ChassisOps> {
    pub(crate) log: slog::Logger,
    pub(crate) hdl: Arc<H>,
    pub(crate) bus_info: BusInfo,
    pub(crate) base_mac: MacAddr,
    max_ports: u16,
    max_module_count: u8,
    num_of_slots: u8,
    line_cards: Vec<LineCard>,
    events_registered: bool,
    event_tx: mpsc::UnboundedSender<LinecardEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<LinecardEvent>>,
}

impl<H: ChassisOps> Chassis<H> {
    pub fn new(log: &slog::Logger, hdl: Arc<H>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let bus_info = hdl.bus_info();
        Chassis {
            log: log.new(o!("unit" => "chassis")),
            hdl,
            bus_info,
            base_mac: MacAddr::ZERO,
            max_ports: 0,
            max_module_count: 0,
            num_of_slots: 0,
            line_cards: Vec::new(),
            events_registered: false,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    pub fn log(&self) -> &slog::Logger {
        &self.log
    }

    pub fn handle(&self) -> &Arc<H> {
        &self.hdl
    }

    /// The number of slots, including the main board.
    pub fn num_of_slots(&self) -> u8 {
        self.num_of_slots
    }

    /// The number of local ports supported by the core.
    pub fn max_ports(&self) -> u16 {
        self.max_ports
    }

    /// The maximum number of modules in any one slot.
    pub fn max_module_count(&self) -> u8 {
        self.max_module_count
    }

    pub fn base_mac(&self) -> MacAddr {
        self.base_mac
    }

    pub fn is_initialized(&self) -> bool {
        !self.line_cards.is_empty()
    }

    pub fn events_registered(&self) -> bool {
        self.events_registered
    }

    pub fn line_cards(&self) -> &[LineCard] {
        &self.line_cards
    }

    /// Hand the receiving end of the hot-plug event channel to the caller.
    /// This may only be done once.
    pub fn take_event_receiver(
        &mut self,
    ) -> Option<mpsc::UnboundedReceiver<LinecardEvent>> {
        self.event_rx.take()
    }

    pub fn line_card(&self, slot: SlotIndex) -> ChassisResult<&LineCard> {
        self.line_cards.get(usize::from(slot)).ok_or_else(|| {
            ChassisError::Invalid(format!("no line card in slot {slot}"))
        })
    }

    pub(crate) fn line_card_mut(
        &mut self,
        slot: SlotIndex,
    ) -> ChassisResult<&mut LineCard> {
        self.line_cards.get_mut(usize::from(slot)).ok_or_else(|| {
            ChassisError::Invalid(format!("no line card in slot {slot}"))
        })
    }

    /// Execute a register query, identifying the register on failure.
    pub(crate) fn query<R: Register>(&self, reg: &R) -> ChassisResult<R> {
        self.hdl.query(reg).map_err(|err| {
            error!(self.log, "register query failed";
                "reg" => %R::ID, "error" => %err);
            ChassisError::TransportQueryFailed { reg: R::ID, err }
        })
    }

    fn fw_rev_validate(&self) -> ChassisResult<()> {
        let found = self.bus_info.fw_rev;
        if found.minor_subminor_at_least(&REQUIRED_FW_REV) {
            return Ok(());
        }
        let required = FwRev {
            major: found.major,
            ..REQUIRED_FW_REV
        };
        error!(self.log, "incompatible firmware";
            "found" => %found, "required" => %required);
        Err(ChassisError::IncompatibleFirmware { found, required })
    }

    fn get_peripheral_info(&mut self) -> ChassisResult<()> {
        let mgpir = self.query(&Mgpir::request(MAIN_BOARD_SLOT))?;

        // On a modular chassis, size everything for the largest card.
        // Otherwise, the main board is all there is.
        self.max_module_count = match mgpir.num_of_slots {
            0 => mgpir.num_of_modules,
            _ => mgpir.max_modules_per_slot,
        };
        self.num_of_slots =
            mgpir.num_of_slots.checked_add(1).ok_or_else(|| {
                ChassisError::Invalid(format!(
                    "{} line card slots reported",
                    mgpir.num_of_slots
                ))
            })?;
        info!(self.log, "peripheral info";
            "slots" => self.num_of_slots,
            "max_module_count" => self.max_module_count);
        Ok(())
    }

    fn base_mac_get(&mut self) -> ChassisResult<()> {
        match self.query(&Spad::request()) {
            Ok(spad) => {
                self.base_mac = spad.base_mac;
                Ok(())
            }
            Err(ChassisError::TransportQueryFailed {
                err: AalError::OperationUnsupported,
                ..
            }) => {
                warn!(self.log, "base mac not supported by firmware");
                self.base_mac = MacAddr::ZERO;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn line_cards_alloc(&mut self) -> ChassisResult<()> {
        let max_ports = self.hdl.max_ports();
        let mut cards = Vec::new();
        cards
            .try_reserve_exact(usize::from(self.num_of_slots))
            .map_err(|e| ChassisError::OutOfMemory(e.to_string()))?;
        for slot in 0..self.num_of_slots {
            cards.push(LineCard::new(slot, max_ports)?);
        }
        self.line_cards = cards;
        self.max_ports = max_ports;
        Ok(())
    }

    fn line_cards_free(&mut self) {
        self.line_cards = Vec::new();
    }

    /// Bring the chassis up: check the firmware, discover the slot layout,
    /// create the main board's ports, and start listening for line card
    /// events.
    pub fn init(&mut self) -> ChassisResult<()> {
        if self.is_initialized() {
            return Err(ChassisError::Invalid(
                "chassis already initialized".to_string(),
            ));
        }

        self.fw_rev_validate()?;
        self.get_peripheral_info().inspect_err(|e| {
            error!(self.log, "failed to get peripheral info"; "error" => %e);
        })?;
        self.base_mac_get().inspect_err(|e| {
            error!(self.log, "failed to get base mac"; "error" => %e);
        })?;
        self.line_cards_alloc().inspect_err(|e| {
            error!(self.log, "failed to allocate memory"; "error" => %e);
        })?;

        if let Err(e) = self.ports_create(MAIN_BOARD_SLOT) {
            error!(self.log, "failed to create ports"; "error" => %e);
            self.line_cards_free();
            return Err(e);
        }
        if let Ok(card) = self.line_card_mut(MAIN_BOARD_SLOT) {
            card.active = true;
        }

        if let Err(e) = self.linecards_register() {
            error!(self.log, "failed to register for line card events";
                "error" => %e);
            self.ports_remove(MAIN_BOARD_SLOT);
            self.line_cards_free();
            return Err(e);
        }

        info!(self.log, "chassis initialized";
            "fw" => %self.bus_info.fw_rev,
            "slots" => self.num_of_slots,
            "max_ports" => self.max_ports);
        Ok(())
    }

    /// Tear the chassis down, in the reverse order of `init()`.
    pub fn fini(mut self) {
        self.linecards_unregister();
        self.ports_remove(MAIN_BOARD_SLOT);
        if let Ok(card) = self.line_card_mut(MAIN_BOARD_SLOT) {
            card.active = false;
        }
        self.line_cards_free();
        info!(self.log, "chassis finished");
    }

    /// Discover the modules of `slot`, map each one to a local port, and
    /// create its port.  On failure, every port and mapping created here is
    /// removed again.
    pub(crate) fn ports_create(
        &mut self,
        slot: SlotIndex,
    ) -> ChassisResult<()> {
        let mgpir = self.query(&Mgpir::request(slot))?;
        let max_module_count = self.max_module_count;
        let card = self.line_card_mut(slot)?;
        if mgpir.num_of_modules == 0 {
            card.max_ports = 0;
            return Ok(());
        }

        // The main board and line cards are sized the same way: one more
        // than the number of modules reported.
        card.max_ports = u16::from(mgpir.num_of_modules) + 1;
        card.module_offset = module_offset(slot, max_module_count)?;
        let max_ports = card.max_ports;
        let offset = card.module_offset;

        // Fill out the module to local port mapping table
        let mut mapped: Vec<LocalPort> = Vec::new();
        for i in 1..max_ports {
            let res = i
                .checked_add(offset)
                .ok_or_else(|| {
                    ChassisError::InvalidMapping(format!(
                        "local port {i} + {offset} out of range"
                    ))
                })
                .and_then(|local_port| {
                    self.port_module_map(slot, local_port, (i - 1) as u8)
                        .map(|_| local_port)
                });
            match res {
                Ok(local_port) => mapped.push(local_port),
                Err(e) => {
                    error!(self.log, "failed to map module";
                        "slot" => slot, "module" => i - 1, "error" => %e);
                    self.unmap_all(slot, &mapped);
                    return Err(e);
                }
            }
        }

        // Create a port for each valid entry
        let assigned = self.line_card(slot)?.assigned();
        let mut created: Vec<LocalPort> = Vec::new();
        for (local_port, module) in assigned {
            if let Err(e) = self.port_create(slot, local_port, module) {
                for lp in created.iter().rev() {
                    self.port_remove(slot, *lp);
                }
                self.unmap_all(slot, &mapped);
                return Err(e);
            }
            created.push(local_port);
        }

        debug!(self.log, "created ports";
            "slot" => slot, "count" => created.len());
        Ok(())
    }

    fn unmap_all(&mut self, slot: SlotIndex, mapped: &[LocalPort]) {
        for local_port in mapped.iter().rev() {
            self.port_module_unmap(slot, *local_port);
        }
    }

    /// Remove every port of `slot`, and release its mappings.
    pub(crate) fn ports_remove(&mut self, slot: SlotIndex) {
        let assigned = match self.line_card(slot) {
            Ok(card) => card.assigned(),
            Err(_) => return,
        };
        for (local_port, _) in assigned {
            self.port_remove(slot, local_port);
            self.port_module_unmap(slot, local_port);
        }
    }

    /// Handle a line card becoming active.  A card that is already active is
    /// left alone.  The main board is brought up by `init()` alone, and is
    /// rejected here.
    pub fn got_active(&mut self, slot: SlotIndex) -> ChassisResult<()> {
        if !is_pluggable(slot) {
            error!(self.log, "activation of the main board"; "slot" => slot);
            return Err(ChassisError::Invalid(format!(
                "slot {slot} is not a line card slot"
            )));
        }
        if self.line_card(slot)?.active {
            debug!(self.log, "line card already active"; "slot" => slot);
            return Ok(());
        }

        match self.ports_create(slot) {
            Ok(()) => {
                let card = self.line_card_mut(slot)?;
                card.active = true;
                let max_ports = card.max_ports;
                info!(self.log, "line card active";
                    "slot" => slot, "max_ports" => max_ports);
                Ok(())
            }
            Err(e) => {
                error!(self.log, "failed to set line card";
                    "slot" => slot, "error" => %e);
                if let Ok(card) = self.line_card_mut(slot) {
                    card.max_ports = 0;
                }
                Err(e)
            }
        }
    }

    /// Handle a line card becoming inactive, or being pulled.  This cannot
    /// fail: problems are logged, and the teardown carries on.
    pub fn got_inactive(&mut self, slot: SlotIndex) {
        if !is_pluggable(slot) {
            error!(self.log, "deactivation of the main board"; "slot" => slot);
            return;
        }
        match self.line_card(slot) {
            Ok(card) if card.active => (),
            Ok(_) => {
                debug!(self.log, "line card already inactive"; "slot" => slot);
                return;
            }
            Err(e) => {
                error!(self.log, "deactivation of unknown slot";
                    "slot" => slot, "error" => %e);
                return;
            }
        }

        self.ports_remove(slot);
        if let Ok(card) = self.line_card_mut(slot) {
            card.active = false;
            card.max_ports = 0;
        }
        info!(self.log, "line card inactive"; "slot" => slot);
    }

    fn linecards_count(&self) -> u8 {
        self.hdl.linecards_count().unwrap_or(0)
    }

    fn linecards_register(&mut self) -> ChassisResult<()> {
        if self.linecards_count() == 0 {
            return Ok(());
        }
        self.hdl
            .register_linecard_event_handler(self.event_tx.clone())?;
        self.events_registered = true;
        Ok(())
    }

    fn linecards_unregister(&mut self) {
        if !self.events_registered {
            return;
        }
        for slot in 1..=self.linecards_count() {
            if self.line_card(slot).map(|c| c.active).unwrap_or(false) {
                self.got_inactive(slot);
            }
        }
        self.hdl.unregister_linecard_event_handler();
        self.events_registered = false;
    }

    /// Act on the status reported for a line card slot.
    pub fn linecard_status_process(&mut self, status: &Mddq) {
        let slot = status.slot_index;
        let active = match self.line_card(slot) {
            Ok(card) => card.active,
            Err(e) => {
                error!(self.log, "status for unknown slot";
                    "slot" => slot, "error" => %e);
                return;
            }
        };
        match (status.active, active) {
            (true, false) => {
                // got_active() has already logged any failure, and the card
                // will be retried on the next status change.
                let _ = self.got_active(slot);
            }
            (false, true) => self.got_inactive(slot),
            _ => (),
        }
    }

    /// Re-read the status of every line card slot, and activate or
    /// deactivate the cards whose status has changed.
    pub fn sys_event_handler(&mut self) {
        let Some(count) = self.hdl.linecards_count() else {
            return;
        };
        for slot in 1..=count {
            match self.query(&Mddq::slot_info_request(slot)) {
                Ok(status) => self.linecard_status_process(&status),
                Err(e) => {
                    error!(self.log, "failed to query slot status";
                        "slot" => slot, "error" => %e);
                }
            }
        }
    }

    /// Dispatch a single hot-plug event.
    pub fn handle_event(&mut self, event: LinecardEvent) {
        debug!(self.log, "line card event"; "event" => ?event);
        match event {
            LinecardEvent::Active { slot } => {
                let _ = self.got_active(slot);
            }
            LinecardEvent::Inactive { slot } => self.got_inactive(slot),
            LinecardEvent::SysEvent => self.sys_event_handler(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use aal::CorePortOps;
    use aal::NetdevHandler;
    use aal::NetdevOps;
    use aal::PowerModeParams;
    use aal::PowerModePolicy;
    use aal::RegId;
    use aal::ETH_RESET_PHY;
    use asic::chaos::Chaos;
    use asic::chaos::Fault;
    use asic::stub::SlotConfig;
    use asic::stub::StubHandle;
    use asic::StubConfig;
    use pretty_assertions::assert_eq;
    use slog::Drain;

    fn test_log() -> slog::Logger {
        let decorator =
            slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog::Logger::root(drain, o!())
    }

    fn slot(modules: u8) -> SlotConfig {
        SlotConfig {
            modules,
            active: false,
            card_type: 1,
        }
    }

    // Two line card slots of up to 16 modules, holding cards of 3 and 2
    // modules.  As on real modular systems, the main board carries no
    // modules of its own.
    fn modular_config() -> StubConfig {
        StubConfig {
            base_mac: Some(MacAddr::new(0x02, 0x00, 0x00, 0x00, 0x00, 0x00)),
            main_board_modules: 0,
            slots: vec![slot(3), slot(2)],
            ..Default::default()
        }
    }

    fn new_chassis(
        config: &StubConfig,
    ) -> (Chassis<StubHandle>, Arc<StubHandle>) {
        let log = test_log();
        let hdl = Arc::new(StubHandle::new(&log, config).unwrap());
        (Chassis::new(&log, hdl.clone()), hdl)
    }

    // Nothing created by the manager remains anywhere in the device.
    fn assert_nothing_left(hdl: &StubHandle) {
        assert!(hdl.core_ports().is_empty());
        assert!(hdl.registered_netdevs().is_empty());
        assert_eq!(hdl.allocated_netdevs(), 0);
    }

    // Every assigned entry of `slot` carries a port, and the device agrees
    // with the table.
    fn assert_slot_consistent(
        chassis: &Chassis<StubHandle>,
        hdl: &StubHandle,
        slot: SlotIndex,
    ) {
        let card = chassis.line_card(slot).unwrap();
        let assigned = card.assigned();
        let local_ports: Vec<LocalPort> =
            assigned.iter().map(|(lp, _)| *lp).collect();
        assert_eq!(card.ports(), local_ports);

        let mut modules: Vec<u8> = assigned.iter().map(|(_, m)| *m).collect();
        modules.sort();
        assert_eq!(hdl.mapped_modules(slot), modules);
        for lp in local_ports {
            let entry = card.entry(lp).unwrap();
            assert_eq!(entry.module_to_port(), i32::from(lp));
            let dev = entry.port().unwrap().dev();
            assert_eq!(hdl.core_port(lp).unwrap().netdev, Some(dev));
        }
    }

    fn assert_slot_reset(chassis: &Chassis<StubHandle>, slot: SlotIndex) {
        let card = chassis.line_card(slot).unwrap();
        assert!(!card.is_active());
        assert_eq!(card.max_ports(), 0);
        for lp in 0..card.table_size() as LocalPort {
            let entry = card.entry(lp).unwrap();
            assert_eq!(entry.module_to_port(), -1);
            assert!(entry.port().is_none());
        }
    }

    fn port_dev(
        chassis: &Chassis<StubHandle>,
        slot: SlotIndex,
        local_port: LocalPort,
    ) -> aal::NetdevHdl {
        chassis
            .line_card(slot)
            .unwrap()
            .entry(local_port)
            .unwrap()
            .port()
            .unwrap()
            .dev()
    }

    #[test]
    fn test_init_modular() {
        let (mut chassis, hdl) = new_chassis(&modular_config());
        chassis.init().unwrap();

        assert_eq!(chassis.num_of_slots(), 3);
        assert_eq!(chassis.max_module_count(), 16);
        assert_eq!(chassis.max_ports(), 128);
        assert_eq!(
            chassis.base_mac(),
            MacAddr::new(0x02, 0x00, 0x00, 0x00, 0x00, 0x00)
        );
        assert!(chassis.events_registered());
        assert!(hdl.event_handler_registered());

        let main = chassis.line_card(0).unwrap();
        assert!(main.is_active());
        assert_eq!(main.max_ports(), 0);
        assert!(main.assigned().is_empty());

        for slot in 1..3 {
            let card = chassis.line_card(slot).unwrap();
            assert_eq!(card.table_size(), 128);
            assert_slot_reset(&chassis, slot);
        }
        assert!(chassis.line_card(3).is_err());

        chassis.fini();
        assert_nothing_left(&hdl);
        assert!(!hdl.event_handler_registered());
    }

    #[test]
    fn test_init_twice() {
        let (mut chassis, hdl) = new_chassis(&modular_config());
        chassis.init().unwrap();
        assert!(matches!(chassis.init(), Err(ChassisError::Invalid(_))));
        chassis.fini();
        assert_nothing_left(&hdl);
    }

    #[test]
    fn test_non_modular() {
        let config = StubConfig {
            main_board_modules: 6,
            ..Default::default()
        };
        let (mut chassis, hdl) = new_chassis(&config);
        chassis.init().unwrap();

        assert_eq!(chassis.num_of_slots(), 1);
        assert_eq!(chassis.max_module_count(), 6);
        assert!(!chassis.events_registered());
        assert!(!hdl.event_handler_registered());
        assert!(chassis.line_card(1).is_err());

        let main = chassis.line_card(0).unwrap();
        assert!(main.is_active());
        assert_eq!(main.max_ports(), 7);
        assert_eq!(main.module_offset(), 0);
        assert_eq!(
            main.assigned(),
            vec![(1, 0), (2, 1), (3, 2), (4, 3), (5, 4), (6, 5)]
        );
        assert_slot_consistent(&chassis, &hdl, 0);
        assert_eq!(hdl.registered_netdevs().len(), 6);

        // The firmware doesn't report a base address.
        assert!(chassis.base_mac().is_null());

        // There are no slots to poll.
        chassis.sys_event_handler();
        assert_eq!(hdl.registered_netdevs().len(), 6);

        chassis.fini();
        assert_nothing_left(&hdl);
        assert!(hdl.mapped_modules(0).is_empty());
    }

    #[test]
    fn test_port_identity() {
        let (mut chassis, hdl) = new_chassis(&modular_config());
        chassis.init().unwrap();
        chassis.got_active(2).unwrap();

        // Slot 2 follows one slot of up to 16 modules.
        let card = chassis.line_card(2).unwrap();
        assert_eq!(card.module_offset(), 16);
        assert_eq!(card.max_ports(), 3);
        assert_eq!(card.assigned(), vec![(17, 0), (18, 1)]);
        assert_slot_consistent(&chassis, &hdl, 2);

        let port = card.entry(18).unwrap().port().unwrap();
        assert_eq!(port.local_port(), 18);
        assert_eq!(port.module(), 1);
        assert_eq!(port.slot_index(), 2);
        assert_eq!(port.module_offset(), 16);
        assert_eq!(port.mac(), MacAddr::new(0x02, 0x08, 0x20, 0x00, 0x00, 18));
        assert_eq!(hdl.netdev_mac(port.dev()), Some(port.mac()));
        assert_eq!(hdl.netdev_carrier(port.dev()), Some(false));
        assert_eq!(
            hdl.netdev_origin(port.dev()),
            Some(("stub-0".to_string(), hdl.core_net()))
        );

        let core = hdl.core_port(18).unwrap();
        assert_eq!(core.slot, 2);
        assert_eq!(core.port_number, 18);
        assert_eq!(core.switch_id, chassis.base_mac());

        chassis.fini();
        assert_nothing_left(&hdl);
    }

    #[test]
    fn test_full_lifecycle() {
        let (mut chassis, hdl) = new_chassis(&modular_config());
        chassis.init().unwrap();

        chassis.got_active(1).unwrap();
        let card = chassis.line_card(1).unwrap();
        assert!(card.is_active());
        assert_eq!(card.max_ports(), 4);
        assert_eq!(card.module_offset(), 0);
        assert_eq!(card.assigned(), vec![(1, 0), (2, 1), (3, 2)]);
        assert_slot_consistent(&chassis, &hdl, 1);
        assert_eq!(hdl.mapped_modules(1), vec![0, 1, 2]);
        assert_eq!(hdl.registered_netdevs().len(), 3);

        chassis.got_inactive(1);
        assert_slot_reset(&chassis, 1);
        assert!(hdl.mapped_modules(1).is_empty());
        assert_nothing_left(&hdl);

        // The card can come back.
        chassis.got_active(1).unwrap();
        assert_eq!(chassis.line_card(1).unwrap().ports(), vec![1, 2, 3]);
        assert_slot_consistent(&chassis, &hdl, 1);

        chassis.fini();
        assert_nothing_left(&hdl);
    }

    #[test]
    fn test_idempotent_activation() {
        let (mut chassis, hdl) = new_chassis(&modular_config());
        chassis.init().unwrap();

        chassis.got_active(1).unwrap();
        let devs = hdl.registered_netdevs();
        chassis.got_active(1).unwrap();
        assert_eq!(hdl.registered_netdevs(), devs);
        assert_eq!(hdl.allocated_netdevs(), 3);
        assert_eq!(chassis.line_card(1).unwrap().ports(), vec![1, 2, 3]);

        chassis.got_inactive(1);
        chassis.got_inactive(1);
        assert_slot_reset(&chassis, 1);

        chassis.fini();
        assert_nothing_left(&hdl);
    }

    #[test]
    fn test_open_and_remove() {
        let (mut chassis, hdl) = new_chassis(&modular_config());
        chassis.init().unwrap();
        chassis.got_active(2).unwrap();

        let dev = port_dev(&chassis, 2, 17);
        hdl.netdev_open(dev).unwrap();
        assert!(hdl.netdev_is_up(dev));
        assert!(hdl.module_state(2, 0).unwrap().up);

        hdl.netdev_close(dev).unwrap();
        assert!(!hdl.module_state(2, 0).unwrap().up);
        hdl.netdev_open(dev).unwrap();

        // Pulling the card stops the open port on its way out.
        chassis.got_inactive(2);
        let state = hdl.module_state(2, 0).unwrap();
        assert!(!state.up);
        assert!(!state.mapped);

        chassis.fini();
        assert_nothing_left(&hdl);
    }

    #[test]
    fn test_port_callbacks() {
        let (mut chassis, hdl) = new_chassis(&modular_config());
        chassis.init().unwrap();
        chassis.got_active(1).unwrap();

        let handler = hdl.netdev_handler(port_dev(&chassis, 1, 2)).unwrap();

        let info = handler.drvinfo();
        assert_eq!(info.driver, "chassis_stub");
        assert_eq!(info.fw_version, "30.2000.1886");
        assert_eq!(info.bus_info, "stub-0");

        let dl = handler.devlink_port().unwrap();
        assert_eq!(dl.local_port, 2);
        assert_eq!(dl.slot, 1);
        assert_eq!(dl.port_number, 2);

        assert_eq!(handler.module_info().unwrap().eeprom_len, 256);
        assert_eq!(handler.module_eeprom(0, 16).unwrap().len(), 16);

        let params = PowerModeParams {
            policy: PowerModePolicy::Auto,
            mode: None,
        };
        handler.set_module_power_mode(&params).unwrap();
        assert_eq!(
            handler.module_power_mode().unwrap().policy,
            PowerModePolicy::Auto
        );
        assert_eq!(
            hdl.module_state(1, 1).unwrap().policy,
            PowerModePolicy::Auto
        );

        let mut flags = ETH_RESET_PHY;
        handler.reset(&mut flags).unwrap();
        assert_eq!(flags, 0);
        assert_eq!(hdl.module_state(1, 1).unwrap().resets, 1);

        drop(handler);
        chassis.fini();
        assert_nothing_left(&hdl);
    }

    #[test]
    fn test_firmware_gate() {
        for (fw, ok) in [
            (FwRev::new(30, 2000, 1885), false),
            (FwRev::new(30, 1999, 9999), false),
            (FwRev::new(0, 2000, 1886), true),
            (FwRev::new(99, 2001, 0), true),
        ] {
            let config = StubConfig {
                fw_rev: fw,
                main_board_modules: 2,
                ..modular_config()
            };
            let (mut chassis, hdl) = new_chassis(&config);
            let res = chassis.init();
            assert_eq!(res.is_ok(), ok, "fw {fw}");
            if ok {
                chassis.fini();
            } else {
                match res {
                    Err(ChassisError::IncompatibleFirmware {
                        found,
                        required,
                    }) => {
                        assert_eq!(found, fw);
                        assert_eq!(required, FwRev::new(30, 2000, 1886));
                    }
                    _ => panic!("unexpected result: {res:?}"),
                }
                assert!(!chassis.is_initialized());
                assert_eq!(chassis.num_of_slots(), 0);
                assert!(!hdl.event_handler_registered());
            }
            assert_nothing_left(&hdl);
        }
    }

    #[test]
    fn test_spad_failure() {
        let (mut chassis, hdl) = new_chassis(&modular_config());
        hdl.faults().spad = Chaos::new(Fault::Always);
        assert!(matches!(
            chassis.init(),
            Err(ChassisError::TransportQueryFailed {
                reg: RegId::Spad,
                ..
            })
        ));
        assert!(!chassis.is_initialized());
        assert_nothing_left(&hdl);
    }

    #[test]
    fn test_peripheral_info_failure() {
        let (mut chassis, hdl) = new_chassis(&modular_config());
        hdl.faults().mgpir = Chaos::new(Fault::Nth(1));
        assert!(matches!(
            chassis.init(),
            Err(ChassisError::TransportQueryFailed {
                reg: RegId::Mgpir,
                ..
            })
        ));
        assert!(!chassis.is_initialized());

        // The fault was a one-shot, so a second attempt succeeds.
        chassis.init().unwrap();
        chassis.fini();
        assert_nothing_left(&hdl);
    }

    #[test]
    fn test_init_rollback_main_board() {
        // The third of the main board's four ports fails to register.
        let (mut chassis, hdl) = new_chassis(&StubConfig::default());
        hdl.faults().netdev_register = Chaos::new(Fault::Nth(3));
        assert!(matches!(
            chassis.init(),
            Err(ChassisError::InterfaceRegistrationFailed {
                local_port: 3,
                ..
            })
        ));
        assert!(!chassis.is_initialized());
        assert_nothing_left(&hdl);
        assert!(hdl.mapped_modules(0).is_empty());
    }

    #[test]
    fn test_init_rollback_event_registration() {
        let config = StubConfig {
            main_board_modules: 2,
            ..modular_config()
        };
        let (mut chassis, hdl) = new_chassis(&config);
        hdl.faults().register_linecard_event_handler =
            Chaos::new(Fault::Always);
        assert!(matches!(chassis.init(), Err(ChassisError::Device(_))));
        assert!(!chassis.is_initialized());
        assert!(!chassis.events_registered());
        assert!(!hdl.event_handler_registered());
        assert_nothing_left(&hdl);
        assert!(hdl.mapped_modules(0).is_empty());
    }

    // Activate slot 1 with a fault injected, and check that nothing of the
    // attempt is left behind.
    fn check_activation_rollback<F>(inject: F) -> ChassisError
    where
        F: FnOnce(&StubHandle),
    {
        let (mut chassis, hdl) = new_chassis(&modular_config());
        chassis.init().unwrap();

        inject(&hdl);
        let err = chassis.got_active(1).unwrap_err();

        assert_slot_reset(&chassis, 1);
        assert!(hdl.mapped_modules(1).is_empty());
        assert_nothing_left(&hdl);

        chassis.fini();
        assert_nothing_left(&hdl);
        err
    }

    #[test]
    fn test_rollback_core_port_init() {
        let err = check_activation_rollback(|hdl| {
            hdl.faults().port_init = Chaos::new(Fault::Nth(2))
        });
        assert!(matches!(
            err,
            ChassisError::CorePortInitFailed { local_port: 2, .. }
        ));
    }

    #[test]
    fn test_rollback_netdev_alloc() {
        let err = check_activation_rollback(|hdl| {
            hdl.faults().netdev_alloc = Chaos::new(Fault::Nth(3))
        });
        assert!(matches!(err, ChassisError::OutOfMemory(_)));
    }

    #[test]
    fn test_rollback_addr_query() {
        let err = check_activation_rollback(|hdl| {
            hdl.faults().ppad = Chaos::new(Fault::Nth(2))
        });
        assert!(matches!(
            err,
            ChassisError::TransportQueryFailed {
                reg: RegId::Ppad,
                ..
            }
        ));
    }

    #[test]
    fn test_rollback_set_addr() {
        let err = check_activation_rollback(|hdl| {
            hdl.faults().netdev_set_addr = Chaos::new(Fault::Nth(1))
        });
        assert!(matches!(err, ChassisError::Device(_)));
    }

    #[test]
    fn test_rollback_netdev_register() {
        let err = check_activation_rollback(|hdl| {
            hdl.faults().netdev_register = Chaos::new(Fault::Nth(3))
        });
        assert!(matches!(
            err,
            ChassisError::InterfaceRegistrationFailed { local_port: 3, .. }
        ));
    }

    #[test]
    fn test_rollback_module_map() {
        let err = check_activation_rollback(|hdl| {
            hdl.faults().module_port_map = Chaos::new(Fault::Nth(2))
        });
        assert!(matches!(err, ChassisError::Device(_)));
    }

    #[test]
    fn test_rollback_capacity_query() {
        let err = check_activation_rollback(|hdl| {
            hdl.faults().mgpir = Chaos::new(Fault::Always)
        });
        assert!(matches!(
            err,
            ChassisError::TransportQueryFailed {
                reg: RegId::Mgpir,
                ..
            }
        ));
    }

    #[test]
    fn test_local_port_collision() {
        // A main board with modules of its own shares local ports with the
        // first line card.
        let config = StubConfig {
            main_board_modules: 2,
            ..modular_config()
        };
        let (mut chassis, hdl) = new_chassis(&config);
        chassis.init().unwrap();
        let devs = hdl.registered_netdevs();

        // The clash is caught while mapping, before the module environment
        // hears of it.
        assert!(matches!(
            chassis.port_module_map(1, 1, 0),
            Err(ChassisError::InvalidMapping(_))
        ));
        assert!(matches!(
            chassis.got_active(1),
            Err(ChassisError::InvalidMapping(_))
        ));
        assert_slot_reset(&chassis, 1);
        assert!(hdl.mapped_modules(1).is_empty());
        let owners: Vec<SlotIndex> = chassis
            .line_cards()
            .iter()
            .filter(|c| c.entry(1).is_some_and(|e| e.local_port() == Some(1)))
            .map(|c| c.slot_index())
            .collect();
        assert_eq!(owners, vec![0]);

        // The main board is untouched.
        assert_slot_consistent(&chassis, &hdl, 0);
        assert_eq!(hdl.registered_netdevs(), devs);
        assert_eq!(hdl.core_ports(), vec![1, 2]);

        chassis.fini();
        assert_nothing_left(&hdl);
    }

    #[test]
    fn test_failed_activation_retried() {
        let (mut chassis, hdl) = new_chassis(&modular_config());
        chassis.init().unwrap();
        hdl.faults().netdev_register = Chaos::new(Fault::Nth(2));
        assert!(chassis.got_active(1).is_err());

        // The card still reports itself as active, so the next status scan
        // tries again.
        hdl.set_slot_status(1, true).unwrap();
        chassis.sys_event_handler();
        assert!(chassis.line_card(1).unwrap().is_active());
        assert_eq!(chassis.line_card(1).unwrap().ports(), vec![1, 2, 3]);

        chassis.fini();
        assert_nothing_left(&hdl);
    }

    #[test]
    fn test_mapping_uniqueness() {
        let (mut chassis, hdl) = new_chassis(&modular_config());
        chassis.init().unwrap();
        chassis.got_active(1).unwrap();

        // Local port 2 is already mapped to module 1.
        assert!(matches!(
            chassis.port_module_map(1, 2, 7),
            Err(ChassisError::InvalidMapping(_))
        ));
        // As is module 1 itself.
        assert!(matches!(
            chassis.port_module_map(1, 9, 1),
            Err(ChassisError::InvalidMapping(_))
        ));
        // Beyond the end of the table.
        assert!(matches!(
            chassis.port_module_map(1, 128, 0),
            Err(ChassisError::InvalidMapping(_))
        ));
        assert!(matches!(
            chassis.port_module_map(3, 1, 0),
            Err(ChassisError::Invalid(_))
        ));
        assert_slot_consistent(&chassis, &hdl, 1);
        assert_eq!(hdl.mapped_modules(1), vec![0, 1, 2]);

        chassis.fini();
        assert_nothing_left(&hdl);
    }

    #[test]
    fn test_mac_octet_bound() {
        // Numbering the second card's modules would run past 255.
        let config = StubConfig {
            max_ports: 512,
            max_modules_per_slot: 250,
            slots: vec![slot(1), slot(8)],
            ..modular_config()
        };
        let (mut chassis, hdl) = new_chassis(&config);
        chassis.init().unwrap();

        assert!(matches!(
            chassis.got_active(2),
            Err(ChassisError::InvalidMapping(_))
        ));
        assert_slot_reset(&chassis, 2);
        assert!(hdl.mapped_modules(2).is_empty());

        chassis.fini();
        assert_nothing_left(&hdl);
    }

    #[test]
    fn test_empty_card() {
        let config = StubConfig {
            slots: vec![slot(0)],
            ..modular_config()
        };
        let (mut chassis, hdl) = new_chassis(&config);
        chassis.init().unwrap();

        chassis.got_active(1).unwrap();
        let card = chassis.line_card(1).unwrap();
        assert!(card.is_active());
        assert_eq!(card.max_ports(), 0);
        assert!(card.ports().is_empty());

        chassis.fini();
        assert_nothing_left(&hdl);
    }

    #[test]
    fn test_sys_event() {
        let (mut chassis, hdl) = new_chassis(&modular_config());
        chassis.init().unwrap();

        hdl.set_slot_status(2, true).unwrap();
        chassis.sys_event_handler();
        assert!(!chassis.line_card(1).unwrap().is_active());
        assert!(chassis.line_card(2).unwrap().is_active());

        // A failed query for slot 1 doesn't prevent slot 2 from being
        // handled.
        hdl.faults().mddq = Chaos::new(Fault::Nth(1));
        hdl.set_slot_status(1, true).unwrap();
        hdl.set_slot_status(2, false).unwrap();
        chassis.sys_event_handler();
        assert!(!chassis.line_card(1).unwrap().is_active());
        assert_slot_reset(&chassis, 2);

        chassis.sys_event_handler();
        assert!(chassis.line_card(1).unwrap().is_active());

        chassis.fini();
        assert_nothing_left(&hdl);
    }

    #[test]
    fn test_handle_event() {
        let (mut chassis, hdl) = new_chassis(&modular_config());
        chassis.init().unwrap();

        chassis.handle_event(LinecardEvent::Active { slot: 2 });
        assert_eq!(chassis.line_card(2).unwrap().ports(), vec![17, 18]);
        chassis.handle_event(LinecardEvent::Inactive { slot: 2 });
        assert_slot_reset(&chassis, 2);

        hdl.set_slot_status(1, true).unwrap();
        chassis.handle_event(LinecardEvent::SysEvent);
        assert!(chassis.line_card(1).unwrap().is_active());

        chassis.fini();
        assert_nothing_left(&hdl);
    }

    #[test]
    fn test_main_board_events_ignored() {
        let config = StubConfig {
            main_board_modules: 2,
            ..modular_config()
        };
        let (mut chassis, hdl) = new_chassis(&config);
        chassis.init().unwrap();
        let devs = hdl.registered_netdevs();
        assert_eq!(devs.len(), 2);

        chassis.handle_event(LinecardEvent::Inactive { slot: 0 });
        chassis.got_inactive(MAIN_BOARD_SLOT);
        assert!(matches!(
            chassis.got_active(MAIN_BOARD_SLOT),
            Err(ChassisError::Invalid(_))
        ));
        chassis.handle_event(LinecardEvent::Active { slot: 0 });

        assert!(chassis.line_card(0).unwrap().is_active());
        assert_slot_consistent(&chassis, &hdl, 0);
        assert_eq!(hdl.registered_netdevs(), devs);
        assert_eq!(hdl.core_ports(), vec![1, 2]);

        chassis.fini();
        assert_nothing_left(&hdl);
    }

    #[test]
    fn test_fini_deactivates_cards() {
        let (mut chassis, hdl) = new_chassis(&modular_config());
        chassis.init().unwrap();
        chassis.got_active(1).unwrap();
        chassis.got_active(2).unwrap();
        assert_eq!(hdl.registered_netdevs().len(), 5);

        chassis.fini();
        assert_nothing_left(&hdl);
        assert!(!hdl.event_handler_registered());
        for slot in 0..3 {
            assert!(hdl.mapped_modules(slot).is_empty());
        }
    }

    #[test]
    fn test_unknown_slot() {
        let (mut chassis, hdl) = new_chassis(&modular_config());
        chassis.init().unwrap();
        assert!(matches!(
            chassis.got_active(9),
            Err(ChassisError::Invalid(_))
        ));
        chassis.got_inactive(9);
        chassis.handle_event(LinecardEvent::Active { slot: 9 });
        assert_nothing_left(&hdl);
        chassis.fini();
    }

    #[test]
    fn test_registered_netdev_not_freed() {
        // The rollback checks rely on the simulated stack refusing to free a
        // device that is still registered.
        let (mut chassis, hdl) = new_chassis(&modular_config());
        chassis.init().unwrap();
        chassis.got_active(1).unwrap();
        hdl.netdev_free(port_dev(&chassis, 1, 1));
        assert_eq!(hdl.allocated_netdevs(), 3);
        chassis.fini();
        assert_nothing_left(&hdl);
    }
}
