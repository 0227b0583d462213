// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration for the switch controller

use camino::{Utf8Path, Utf8PathBuf};
use cutover_types::RoleName;
use dropshot::{ConfigDropshot, ConfigLogging};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub log: ConfigLogging,
    pub dropshot: ConfigDropshot,
    #[serde(default)]
    pub switch: SwitchConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub intent: IntentConfig,
    /// Members of each deployment color, keyed by role name.
    pub roles: BTreeMap<RoleName, RoleConfig>,
    /// The role that is active when the controller starts with an empty
    /// active-role record.
    pub initial_active: RoleName,
}

impl Config {
    /// Load a `Config` from the given TOML file
    pub fn from_file<P: AsRef<Utf8Path>>(
        path: P,
    ) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|error| {
            ConfigError::Io { error, path: path.to_owned() }
        })?;
        let config: Config =
            toml::from_str(&data).map_err(|error| ConfigError::Parse {
                error,
                path: path.to_owned(),
            })?;
        config.validate().map_err(|message| ConfigError::Invalid {
            message,
            path: path.to_owned(),
        })?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.roles.len() < 2 {
            return Err(format!(
                "at least two roles must be configured (found {})",
                self.roles.len()
            ));
        }
        if !self.roles.contains_key(&self.initial_active) {
            return Err(format!(
                "initial_active role {:?} is not configured",
                self.initial_active.as_str()
            ));
        }
        if self.switch.lifecycle_port == self.switch.sidecar_port {
            return Err("lifecycle_port and sidecar_port must differ".into());
        }
        Ok(())
    }
}

/// Timing and fan-out parameters of the switch protocol.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    /// how long to wait for the old role to report `PAUSED`
    #[serde_as(as = "DurationSeconds<u64>")]
    pub drain_timeout_secs: Duration,
    /// how long to wait for the new role to report `ACTIVE`
    #[serde_as(as = "DurationSeconds<u64>")]
    pub activation_timeout_secs: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub health_check_interval_ms: Duration,
    /// per-request timeout for status queries and lifecycle commands
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout_secs: Duration,
    /// per-request timeout for desired-state pushes to sidecars
    #[serde_as(as = "DurationSeconds<u64>")]
    pub push_timeout_secs: Duration,
    pub lifecycle_port: u16,
    pub sidecar_port: u16,
    /// maximum number of per-endpoint requests in flight at once
    pub max_concurrency: usize,
    /// retries after the first attempt to write the intent record
    pub intent_retries: usize,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub intent_retry_delay_ms: Duration,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        SwitchConfig {
            drain_timeout_secs: Duration::from_secs(10),
            activation_timeout_secs: Duration::from_secs(10),
            health_check_interval_ms: Duration::from_millis(500),
            request_timeout_secs: Duration::from_secs(5),
            push_timeout_secs: Duration::from_secs(3),
            lifecycle_port: 8080,
            sidecar_port: 8082,
            max_concurrency: 16,
            intent_retries: 3,
            intent_retry_delay_ms: Duration::from_millis(500),
        }
    }
}

#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub name: String,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub duration_secs: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        LeaseConfig {
            name: "consumer-switch".to_string(),
            duration_secs: cutover_lease::DEFAULT_LEASE_DURATION,
        }
    }
}

/// Where and how the durable switch intent is recorded.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentConfig {
    /// Keys are matched to roles as `<key_prefix>-<role>-`.
    pub key_prefix: String,
    /// Directory holding one file per worker key. When unset the record is
    /// kept in memory.
    pub directory: Option<Utf8PathBuf>,
    /// Worker keys to create at startup if they do not exist yet.
    pub keys: Vec<String>,
}

impl Default for IntentConfig {
    fn default() -> Self {
        IntentConfig {
            key_prefix: "consumer".to_string(),
            directory: None,
            keys: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoleConfig {
    /// Name of the service fronting this role, used in log messages.
    pub service: String,
    /// Member hosts. An entry without a port is addressed on the lifecycle
    /// port.
    pub hosts: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {path}")]
    Io {
        #[source]
        error: std::io::Error,
        path: Utf8PathBuf,
    },
    #[error("Failed to parse config file: {path}")]
    Parse {
        #[source]
        error: toml::de::Error,
        path: Utf8PathBuf,
    },
    #[error("Invalid config file {path}: {message}")]
    Invalid { message: String, path: Utf8PathBuf },
}
