// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Gate configuration.

use super::cmd::KnockError;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;

pub const DEF_PROTECTED_PORT: u16 = 1234;
pub const DEF_TIMEOUT_MS: u64 = 30_000;
pub const DEF_MAX_PORTS: usize = 10;
pub const DEF_MAX_ENTRIES: u32 = 8192;
pub const DEF_SHUTDOWN_GRACE_MS: u64 = 1_000;
pub const DEF_TRIGGER_POLL_MS: u64 = 100;

/// Configuration for a single gate instance.
///
/// Every field has a default so that a partial TOML document (or an
/// empty one) is a valid configuration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct GateCfg {
    /// The primary port guarded by the gate.
    pub protected_port: u16,

    /// Further ports guarded by the gate.
    pub additional_ports: Vec<u16>,

    /// How long an authorization lives, in milliseconds. This is also
    /// the period of the reaper.
    pub timeout_ms: u64,

    /// The maximum number of distinct protected ports.
    pub max_ports: usize,

    /// The maximum number of simultaneous authorizations.
    pub max_entries: u32,

    /// How long `stop()` waits for each background task before
    /// giving up on it.
    pub shutdown_grace_ms: u64,

    /// How often the trigger listener wakes to check for
    /// cancellation while its source is idle.
    pub trigger_poll_ms: u64,
}

impl Default for GateCfg {
    fn default() -> Self {
        Self {
            protected_port: DEF_PROTECTED_PORT,
            additional_ports: vec![],
            timeout_ms: DEF_TIMEOUT_MS,
            max_ports: DEF_MAX_PORTS,
            max_entries: DEF_MAX_ENTRIES,
            shutdown_grace_ms: DEF_SHUTDOWN_GRACE_MS,
            trigger_poll_ms: DEF_TRIGGER_POLL_MS,
        }
    }
}

impl GateCfg {
    /// Parse a configuration from a TOML document and validate it.
    pub fn from_toml(s: &str) -> Result<Self, KnockError> {
        let cfg: Self = toml::from_str(s)
            .map_err(|e| KnockError::BadConfig(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// The distinct protected ports, sorted ascending.
    pub fn protected_ports(&self) -> Vec<u16> {
        let ports: BTreeSet<u16> = core::iter::once(self.protected_port)
            .chain(self.additional_ports.iter().copied())
            .collect();
        ports.into_iter().collect()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn trigger_poll(&self) -> Duration {
        Duration::from_millis(self.trigger_poll_ms)
    }

    pub fn validate(&self) -> Result<(), KnockError> {
        if self.timeout_ms == 0 {
            return Err(KnockError::BadConfig(
                "timeout_ms must be non-zero".to_string(),
            ));
        }

        if self.max_entries == 0 {
            return Err(KnockError::BadConfig(
                "max_entries must be non-zero".to_string(),
            ));
        }

        if self.trigger_poll_ms == 0 {
            return Err(KnockError::BadConfig(
                "trigger_poll_ms must be non-zero".to_string(),
            ));
        }

        if self.protected_ports().contains(&0) {
            return Err(KnockError::BadConfig(
                "port 0 cannot be protected".to_string(),
            ));
        }

        let count = self.protected_ports().len();
        if count > self.max_ports {
            return Err(KnockError::MaxPorts { count, max: self.max_ports });
        }

        Ok(())
    }
}
