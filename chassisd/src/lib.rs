// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Line card, module and port lifecycle management for a modular switch
//! chassis.  The chassis discovers its slot layout at startup, exposes every
//! transceiver module of an active card as a host net device, and tracks
//! cards as they are inserted, activated and removed.

pub mod chassis;
pub mod events;
pub mod linecard;
pub mod port;
pub mod types;

pub use chassis::Chassis;
