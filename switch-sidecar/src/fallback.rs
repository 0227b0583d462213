// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The durable fallback copy of a worker's desired state: one JSON file per
//! worker, named by hostname, in a shared directory.

use camino::{Utf8Path, Utf8PathBuf};
use cutover_types::DesiredState;
use slog::{o, warn, Logger};

#[derive(Clone, Debug)]
pub struct FileFallback {
    path: Utf8PathBuf,
    log: Logger,
}

impl FileFallback {
    pub fn new(log: &Logger, dir: &Utf8Path, hostname: &str) -> FileFallback {
        let path = dir.join(hostname);
        FileFallback {
            log: log.new(o!("component" => "FileFallback", "path" => path.to_string())),
            path,
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// The desired state recorded for this worker. A missing file means
    /// there is none; an unreadable or malformed one is logged and treated
    /// the same way.
    pub async fn load(&self) -> Option<DesiredState> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return None;
            }
            Err(err) => {
                warn!(self.log, "failed to read fallback file"; "error" => %err);
                return None;
            }
        };
        match serde_json::from_slice(&data) {
            Ok(desired) => Some(desired),
            Err(err) => {
                warn!(
                    self.log,
                    "failed to parse fallback file";
                    "error" => %err,
                    "raw" => String::from_utf8_lossy(&data).into_owned(),
                );
                None
            }
        }
    }
}
