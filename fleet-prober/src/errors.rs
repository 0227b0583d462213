// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use cutover_types::{LifecycleState, WorkerEndpoint};
use std::collections::BTreeMap;
use std::time::Duration;

/// Failure of one request against one endpoint.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("request failed")]
    Request(#[source] reqwest::Error),
    #[error("unexpected response status {0}")]
    UnexpectedStatus(reqwest::StatusCode),
    #[error("malformed status response")]
    Decode(#[source] serde_json::Error),
    #[error("request task did not complete: {0}")]
    TaskFailed(String),
}

impl EndpointError {
    /// Whether the endpoint could not be reached at all (as opposed to
    /// answering with something we did not accept).
    pub fn is_unreachable(&self) -> bool {
        match self {
            EndpointError::Request(e) => e.is_connect() || e.is_timeout(),
            EndpointError::UnexpectedStatus(_)
            | EndpointError::Decode(_)
            | EndpointError::TaskFailed(_) => false,
        }
    }
}

/// Aggregate failure of a fan-out operation: the endpoints that failed and
/// why, out of how many were attempted.
#[derive(Debug, thiserror::Error)]
#[error("{operation}: {} of {total} endpoints failed", .failures.len())]
pub struct FanOutError {
    pub operation: &'static str,
    pub failures: BTreeMap<WorkerEndpoint, EndpointError>,
    pub total: usize,
}

impl FanOutError {
    pub fn failed_count(&self) -> usize {
        self.failures.len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("cancelled while waiting for endpoints to reach {target}")]
    Cancelled { target: LifecycleState },
    #[error(
        "timed out after {timeout:?} waiting for endpoints to reach {target} \
         ({} of {} converged)",
        .last_states.values().filter(|s| **s == *target).count(),
        .last_states.len()
    )]
    Timeout {
        target: LifecycleState,
        timeout: Duration,
        /// States observed by the final probe.
        last_states: BTreeMap<WorkerEndpoint, LifecycleState>,
    },
}
