// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Largest number of queues a single direction may carry.  Doorbell masks are
/// 32 bits wide, one bit per queue.
pub const MAX_QUEUES_PER_DIRECTION: u8 = 32;

/// Number of buffer slots in every queue.
pub const BUFFERS_PER_QUEUE: u8 = 128;

/// Configuration for a set of emulated QDIO adapters.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Config {
    #[serde(default, rename = "adapter")]
    pub adapters: BTreeMap<String, Adapter>,
}

impl FromStr for Config {
    type Err = ParseError;

    /// Parses configuration from TOML text, checking value ranges.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let cfg = toml::from_str::<Config>(raw)?;
        for (name, adapter) in cfg.adapters.iter() {
            adapter.validate(name)?;
        }
        Ok(cfg)
    }
}

/// Adapter model generation.
///
/// Determines which doorbell functions the adapter accepts.  Anything outside
/// of the supported set is presented to the guest as a specification
/// exception.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Generation {
    /// Read, write and sync doorbells.
    Legacy,
    /// Legacy functions plus multiple-write.
    #[default]
    Enhanced,
}

/// A single adapter, keyed by name in the `[adapter.<name>]` table.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Adapter {
    /// Subchannel number the adapter is attached at.
    pub subchannel: u32,

    #[serde(default)]
    pub generation: Generation,

    /// Grant the lightweight buffer-state instructions when a guest asks.
    #[serde(default = "default_true")]
    pub qebsm: bool,

    /// Grant thin-interrupt indicators when a guest asks.
    #[serde(default = "default_true")]
    pub thin_interrupts: bool,

    #[serde(default = "default_max_queues")]
    pub max_input_queues: u8,

    #[serde(default = "default_max_queues")]
    pub max_output_queues: u8,

    /// Worker poll cadence when no doorbell arrives.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Buffers serviced from one queue before the worker moves to the next.
    #[serde(default = "default_output_batch")]
    pub output_batch: u8,

    /// Owe a notification for every output completion, not only for buffers
    /// which requested one explicitly.
    #[serde(default = "default_true")]
    pub notify_output: bool,
}

impl Adapter {
    fn validate(&self, name: &str) -> Result<(), ParseError> {
        let queue_range = 1..=MAX_QUEUES_PER_DIRECTION;
        if !queue_range.contains(&self.max_input_queues) {
            return Err(ParseError::OutOfRange(
                name.to_string(),
                "max_input_queues",
            ));
        }
        if !queue_range.contains(&self.max_output_queues) {
            return Err(ParseError::OutOfRange(
                name.to_string(),
                "max_output_queues",
            ));
        }
        if !(1..=BUFFERS_PER_QUEUE).contains(&self.output_batch) {
            return Err(ParseError::OutOfRange(
                name.to_string(),
                "output_batch",
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ParseError::OutOfRange(
                name.to_string(),
                "poll_interval_ms",
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
fn default_max_queues() -> u8 {
    MAX_QUEUES_PER_DIRECTION
}
fn default_poll_interval_ms() -> u64 {
    50
}
fn default_output_batch() -> u8 {
    16
}

/// Errors which may be returned when parsing adapter configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("adapter {0}: {1} out of range")]
    OutOfRange(String, &'static str),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    Config::from_str(&contents)
}
