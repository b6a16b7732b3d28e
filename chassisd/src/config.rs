// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Configuration for the chassis daemon.

use std::time::Duration;

use anyhow::Context;

use asic::StubConfig;
use common::logging::LogFormat;

const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

#[derive(Debug)]
pub struct Config {
    /// If set, where the log should be written.  If not set, the log goes to
    /// stdout.
    pub log_file: Option<String>,

    /// Output log info in unstructured text or json?
    pub log_format: LogFormat,

    /// How often to re-read the status of every line card slot, in
    /// milliseconds.  Zero disables polling, leaving the daemon to rely on
    /// the events raised by the device.
    pub poll_interval_ms: u64,

    /// File describing the simulated chassis.
    pub sim_config: Option<String>,

    pub stub_config: StubConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_file: None,
            log_format: LogFormat::Json,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            sim_config: None,
            stub_config: StubConfig::default(),
        }
    }
}

impl Config {
    pub fn poll_interval(&self) -> Option<Duration> {
        match self.poll_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

fn parse_stub_config(txt: &str) -> anyhow::Result<StubConfig> {
    toml::from_str(txt).context("parsing simulated chassis config")
}

// Use the command-line arguments to update the run-time config.
fn update_from_cli(
    opts: &crate::Opt,
    config: &mut Config,
) -> anyhow::Result<()> {
    if let Some(log_file) = &opts.log_file {
        config.log_file = Some(log_file.to_string());
    }

    if let Some(log_format) = opts.log_format {
        config.log_format = log_format;
    }

    if let Some(poll_interval_ms) = opts.poll_interval_ms {
        config.poll_interval_ms = poll_interval_ms;
    }

    if let Some(path) = &opts.sim_config {
        let txt = std::fs::read_to_string(path)
            .with_context(|| format!("reading {path}"))?;
        config.stub_config = parse_stub_config(&txt)?;
        config.sim_config = Some(path.to_string());
    }

    Ok(())
}

/// This builds a Config struct containing the tunable settings used to
/// adjust the daemon's behavior.  Defaults are overridden by any command line
/// options.
pub(crate) fn build_config(opts: &crate::Opt) -> anyhow::Result<Config> {
    let mut config = Config::default();
    update_from_cli(opts, &mut config)?;
    Ok(config)
}
