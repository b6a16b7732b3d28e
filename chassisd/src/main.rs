// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::sync::Arc;

use anyhow::Context;
use futures::stream::StreamExt;
use libc::c_int;
use signal_hook::consts::SIGHUP;
use signal_hook::consts::SIGINT;
use signal_hook::consts::SIGQUIT;
use signal_hook::consts::SIGTERM;
use signal_hook_tokio::Signals;
use slog::error;
use slog::info;
use structopt::StructOpt;
use tokio::sync::oneshot;

use chassisd::events;
use chassisd::Chassis;

mod config;

#[derive(Debug, StructOpt)]
#[structopt(name = "chassisd", about = "line card and port manager")]
pub(crate) enum Args {
    /// Run the chassis manager against a simulated chassis.
    Run(Opt),
}

#[derive(Debug, Default, StructOpt)]
#[structopt(name = "chassisd", about = "line card and port manager")]
pub(crate) struct Opt {
    #[structopt(
        long,
        about = "send log data to the named file rather than stdout"
    )]
    log_file: Option<String>,

    #[structopt(
        long,
        short = "l",
        about = "log format",
        help = "format logs for 'human' or 'json' consumption"
    )]
    log_format: Option<common::logging::LogFormat>,

    #[structopt(
        long,
        help = "line card status poll interval in ms, or 0 to disable"
    )]
    poll_interval_ms: Option<u64>,

    #[structopt(long, help = "file describing the simulated chassis")]
    sim_config: Option<String>,
}

async fn wait_for_signal(log: &slog::Logger, mut signals: Signals) {
    let log = log.new(slog::o!("unit" => "signal_handler"));
    let handle = signals.handle();
    while let Some(signal) = signals.next().await {
        match signal {
            SIGTERM | SIGQUIT | SIGINT | SIGHUP => {
                info!(log, "received signal"; "sig" => signal);
                handle.close();
                return;
            }
            _ => unreachable!(),
        }
    }
}

async fn run_chassisd(opt: Opt) -> anyhow::Result<()> {
    let config = config::build_config(&opt)?;

    let log = common::logging::init(
        "chassisd",
        &config.log_file,
        config.log_format,
    )?;
    info!(log, "chassisd config: {config:#?}");

    // Install the handler before the chassis comes up, so that an early
    // signal is not lost.
    const SIGNALS: &[c_int] = &[SIGTERM, SIGQUIT, SIGINT, SIGHUP];
    let signals = Signals::new(SIGNALS).context("installing signal handler")?;

    let hdl = asic::Handle::new(&log, &config.stub_config)
        .context("creating simulated chassis")?;
    let mut chassis = Chassis::new(&log, Arc::new(hdl));
    if let Err(e) = chassis.init() {
        error!(log, "chassis initialization failed"; "error" => %e);
        return Err(e.into());
    }

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let dispatcher = tokio::spawn(events::run(
        chassis,
        config.poll_interval(),
        shutdown_rx,
    ));

    wait_for_signal(&log, signals).await;

    info!(log, "shutting down chassis manager");
    let _ = shutdown_tx.send(());
    dispatcher.await.context("waiting for the event dispatcher")?;

    info!(log, "done");
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::from_args();

    match args {
        Args::Run(opt) => run_chassisd(opt).await,
    }
}
