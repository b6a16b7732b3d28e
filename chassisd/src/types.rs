// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! General types used throughout the chassis port manager.

use std::convert;

use aal::AalError;
use aal::FwRev;
use aal::RegId;
use common::ports::LocalPort;

pub type ChassisResult<T> = Result<T, ChassisError>;

#[derive(Debug, thiserror::Error)]
pub enum ChassisError {
    #[error(
        "Firmware version {found} is incompatible (required >= {required})"
    )]
    IncompatibleFirmware { found: FwRev, required: FwRev },
    #[error("Failed to query {reg} register: {err}")]
    TransportQueryFailed { reg: RegId, err: AalError },
    #[error("Out of memory: {0}")]
    OutOfMemory(String),
    #[error("Port {local_port}: failed to init core port: {err}")]
    CorePortInitFailed { local_port: LocalPort, err: AalError },
    #[error("Port {local_port}: failed to register netdev: {err}")]
    InterfaceRegistrationFailed { local_port: LocalPort, err: AalError },
    #[error("Invalid mapping: {0}")]
    InvalidMapping(String),
    #[error("Invalid argument: {0}")]
    Invalid(String),
    #[error("Device error: {0}")]
    Device(AalError),
}

impl convert::From<AalError> for ChassisError {
    fn from(err: AalError) -> Self {
        ChassisError::Device(err)
    }
}
