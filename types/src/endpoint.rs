// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Network address of one worker's HTTP surface, `host:port`.
///
/// Ordering is lexicographic on the host and then numeric on the port, which
/// gives probe reports a stable order.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct WorkerEndpoint {
    host: String,
    port: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid worker endpoint {input:?}: {reason}")]
pub struct ParseEndpointError {
    input: String,
    reason: &'static str,
}

impl WorkerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        WorkerEndpoint { host: host.into(), port }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The same host, addressed on a different port.
    pub fn with_port(&self, port: u16) -> Self {
        WorkerEndpoint { host: self.host.clone(), port }
    }

    /// Builds a plain-HTTP URL for `path` on this endpoint.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self, path)
    }
}

impl fmt::Display for WorkerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for WorkerEndpoint {
    type Err = ParseEndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| ParseEndpointError { input: s.to_string(), reason };
        let (host, port) = s.rsplit_once(':').ok_or_else(|| err("no port"))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(err("empty host"));
        }
        let port = port.parse::<u16>().map_err(|_| err("bad port"))?;
        Ok(WorkerEndpoint::new(host, port))
    }
}

impl From<SocketAddr> for WorkerEndpoint {
    fn from(addr: SocketAddr) -> Self {
        WorkerEndpoint::new(addr.ip().to_string(), addr.port())
    }
}

impl TryFrom<String> for WorkerEndpoint {
    type Error = ParseEndpointError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WorkerEndpoint> for String {
    fn from(value: WorkerEndpoint) -> Self {
        value.to_string()
    }
}
