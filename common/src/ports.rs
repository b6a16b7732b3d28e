// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Identifiers for the physical and logical entities in a modular chassis.

/// A physical bay in the chassis.  Slot 0 is always the main board; removable
/// line cards live in slots 1 and up.
pub type SlotIndex = u8;

/// A chassis-wide logical port number, assigned to a module while it is
/// mapped.
pub type LocalPort = u16;

/// A transceiver module, indexed locally within its slot.
pub type ModuleIndex = u8;

/// The slot occupied by the main board.
pub const MAIN_BOARD_SLOT: SlotIndex = 0;

/// Returns true if `slot` holds a removable line card.
pub const fn is_pluggable(slot: SlotIndex) -> bool {
    slot != MAIN_BOARD_SLOT
}
