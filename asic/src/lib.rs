// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Device backends for the chassis port manager.
//!
//! The only backend is a simulated chassis, which keeps all of its state in
//! memory and can be told to fail any of its fallible operations.

pub mod chaos;
pub mod stub;

pub use stub::StubConfig;
pub use stub::StubHandle as Handle;
