// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The event dispatcher: a single task that owns the chassis, and feeds it
//! hot-plug events, periodic status polls and, finally, the shutdown.

use std::time::Duration;

use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use tokio::sync::oneshot;
use tokio::time::Interval;
use tokio::time::MissedTickBehavior;

use aal::ChassisOps;

use crate::chassis::Chassis;

// Wait for the next poll, or forever if polling is disabled.
async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Dispatch events to `chassis` until `shutdown` fires or its sender is
/// dropped, then tear the chassis down.  If `poll_interval` is set, the
/// status of every slot is re-read on that period, in addition to any
/// status change events raised by the device.
pub async fn run<H: ChassisOps>(
    mut chassis: Chassis<H>,
    poll_interval: Option<Duration>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let log = chassis.log().new(o!("unit" => "events"));

    let Some(mut events) = chassis.take_event_receiver() else {
        error!(log, "line card events already claimed");
        chassis.fini();
        return;
    };
    let mut events_open = true;

    let mut ticker = poll_interval.map(|period| {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    info!(log, "dispatching line card events";
        "poll_interval" => ?poll_interval);
    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!(log, "shutting down");
                break;
            }
            event = events.recv(), if events_open => match event {
                Some(event) => chassis.handle_event(event),
                None => {
                    debug!(log, "event source closed");
                    events_open = false;
                }
            },
            _ = tick(&mut ticker) => chassis.sys_event_handler(),
        }
    }

    chassis.fini();
}
