// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration for the switch sidecar

use camino::{Utf8Path, Utf8PathBuf};
use cutover_types::WorkerEndpoint;
use dropshot::{ConfigDropshot, ConfigLogging};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use std::time::Duration;
use thiserror::Error;

/// Environment variable consulted when `reconciler.hostname` is not set.
pub const HOSTNAME_ENV: &str = "HOSTNAME";

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub log: ConfigLogging,
    pub dropshot: ConfigDropshot,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

impl Config {
    /// Load a `Config` from the given TOML file
    ///
    /// An empty `reconciler.hostname` is filled in from the environment.
    pub fn from_file<P: AsRef<Utf8Path>>(
        path: P,
    ) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|error| {
            ConfigError::Io { error, path: path.to_owned() }
        })?;
        let mut config: Config =
            toml::from_str(&data).map_err(|error| ConfigError::Parse {
                error,
                path: path.to_owned(),
            })?;
        if config.reconciler.hostname.is_empty() {
            config.reconciler.hostname =
                std::env::var(HOSTNAME_ENV).unwrap_or_default();
        }
        config.validate().map_err(|message| ConfigError::Invalid {
            message,
            path: path.to_owned(),
        })?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        let hostname = &self.reconciler.hostname;
        if hostname.is_empty() {
            return Err(format!(
                "reconciler.hostname is not set and ${HOSTNAME_ENV} is empty"
            ));
        }
        if hostname.starts_with('.') || hostname.contains('/') {
            return Err(format!(
                "reconciler.hostname {hostname:?} cannot name a fallback file"
            ));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Name of this worker's entry in the fallback directory.
    pub hostname: String,
    pub fallback_dir: Utf8PathBuf,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub interval_secs: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        ReconcilerConfig {
            hostname: String::new(),
            fallback_dir: Utf8PathBuf::from("/etc/consumer-state"),
            interval_secs: Duration::from_secs(5),
        }
    }
}

/// How to reach the local worker's lifecycle surface.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub worker: WorkerEndpoint,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout_secs: Duration,
    /// retries after the first attempt of each call
    pub max_retries: usize,
    /// delay before the first retry; each later retry waits twice as long
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_initial_interval_ms: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        LifecycleConfig {
            worker: WorkerEndpoint::new("localhost", 8080),
            request_timeout_secs: Duration::from_secs(5),
            max_retries: 3,
            retry_initial_interval_ms: Duration::from_millis(500),
        }
    }
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

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use camino_tempfile::Utf8TempDir;

    fn write(dir: &Utf8TempDir, contents: &str) -> Utf8PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn parse_with_defaults() {
        let dir = Utf8TempDir::new().unwrap();
        let config = Config::from_file(write(
            &dir,
            r#"
            [log]
            mode = "stderr-terminal"
            level = "info"

            [dropshot]
            bind_address = "127.0.0.1:8082"

            [reconciler]
            hostname = "consumer-blue-0"

            [lifecycle]
            worker = "127.0.0.1:9090"
            max_retries = 5
            "#,
        ))
        .unwrap();

        assert_eq!(config.reconciler.hostname, "consumer-blue-0");
        assert_eq!(
            config.reconciler.fallback_dir,
            Utf8PathBuf::from("/etc/consumer-state")
        );
        assert_eq!(config.reconciler.interval_secs, Duration::from_secs(5));
        assert_eq!(config.lifecycle.worker, WorkerEndpoint::new("127.0.0.1", 9090));
        assert_eq!(config.lifecycle.max_retries, 5);
        assert_eq!(
            config.lifecycle.retry_initial_interval_ms,
            Duration::from_millis(500)
        );
        assert_eq!(config.lifecycle.request_timeout_secs, Duration::from_secs(5));
    }

    #[test]
    fn rejects_path_like_hostname() {
        let dir = Utf8TempDir::new().unwrap();
        let result = Config::from_file(write(
            &dir,
            r#"
            [log]
            mode = "stderr-terminal"
            level = "info"

            [dropshot]
            bind_address = "127.0.0.1:8082"

            [reconciler]
            hostname = "../etc/passwd"
            "#,
        ));
        assert_matches!(result, Err(ConfigError::Invalid { .. }));
    }
}
