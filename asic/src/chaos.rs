// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Synthetic fault injection for the simulated chassis.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use rand::random;
use serde::Deserialize;
use serde::Serialize;
use slog::Logger;

use aal::AalError;
use aal::AalResult;

/// When an operation should fail.
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Fault {
    #[default]
    Never,
    Always,
    /// Fail only the nth call, counting from 1.
    Nth(u32),
    /// Fail each call with a probability between 0.0 and 1.0.
    Probability(f64),
}

/// A fault, along with the number of times the operation it guards has been
/// invoked.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(try_from = "Fault", into = "Fault")]
pub struct Chaos {
    fault: Fault,
    calls: AtomicU32,
}

impl Chaos {
    /// Create a new chaos value.  Panics if a probability is outside the
    /// range [0.0, 1.0].
    pub fn new(fault: Fault) -> Self {
        match Chaos::try_from(fault) {
            Ok(c) => c,
            Err(e) => panic!("{e}"),
        }
    }

    pub fn fault(&self) -> Fault {
        self.fault
    }

    /// The number of calls observed so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Count a call, and return a synthetic error if this call should fail.
    pub fn unfurled(&self, log: &Logger, message: &str) -> AalResult<()> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        let fail = match self.fault {
            Fault::Never => false,
            Fault::Always => true,
            Fault::Nth(n) => call == n,
            Fault::Probability(p) => p > random::<f64>(),
        };
        if fail {
            slog::error!(log, "chaos error: {}", message; "call" => call);
            return Err(AalError::Synthetic(message.into()));
        }
        Ok(())
    }
}

impl TryFrom<Fault> for Chaos {
    type Error = String;

    fn try_from(fault: Fault) -> Result<Self, Self::Error> {
        if let Fault::Probability(p) = fault {
            if !(0.0..=1.0).contains(&p) {
                return Err(format!("probability {p} out of range"));
            }
        }
        Ok(Chaos {
            fault,
            calls: AtomicU32::new(0),
        })
    }
}

impl From<Chaos> for Fault {
    fn from(c: Chaos) -> Self {
        c.fault
    }
}

// The call count is not carried into a copy.
impl Clone for Chaos {
    fn clone(&self) -> Self {
        Chaos {
            fault: self.fault,
            calls: AtomicU32::new(0),
        }
    }
}

/// The faults to inject into each fallible operation of the simulated
/// chassis.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ChaosConfig {
    pub mgpir: Chaos,
    pub mddq: Chaos,
    pub ppad: Chaos,
    pub spad: Chaos,
    pub module_port_map: Chaos,
    pub module_port_unmap: Chaos,
    pub module_port_up: Chaos,
    pub module_port_down: Chaos,
    pub port_init: Chaos,
    pub netdev_alloc: Chaos,
    pub netdev_set_addr: Chaos,
    pub netdev_register: Chaos,
    pub register_linecard_event_handler: Chaos,
}

/// A convenience macro for unfurling chaos.  The $name should be a `Chaos`
/// member of [`ChaosConfig`], and `handle` a [`crate::stub::StubHandle`].
macro_rules! unfurl {
    ($handle:ident, $name:ident) => {
        $handle
            .faults
            .lock()
            .unwrap()
            .$name
            .unfurled(&$handle.log, stringify!($name))?
    };
}
pub(crate) use unfurl;
