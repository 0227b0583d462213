// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::fan_out::{FanOut, DEFAULT_MAX_CONCURRENCY};
use crate::{EndpointError, FanOutError, WaitError};
use cutover_types::desired::DESIRED_STATE_PATH;
use cutover_types::lifecycle::STATUS_PATH;
use cutover_types::{
    DesiredState, LifecycleCommand, LifecycleState, StatusResponse,
    WorkerEndpoint,
};
use futures::stream;
use futures::StreamExt;
use slog::{debug, info, o, warn, Logger};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Per-request timeout used when none is configured.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of probing a set of endpoints.
///
/// `states` has an entry for every probed endpoint. An endpoint whose probe
/// failed maps to [`LifecycleState::Unknown`] and also appears in `errors`.
#[derive(Debug, Default)]
pub struct ProbeReport {
    pub states: BTreeMap<WorkerEndpoint, LifecycleState>,
    pub errors: BTreeMap<WorkerEndpoint, EndpointError>,
}

impl ProbeReport {
    /// Whether every one of `endpoints` was observed in `target`.
    pub fn all_in(
        &self,
        target: LifecycleState,
        endpoints: &[WorkerEndpoint],
    ) -> bool {
        target != LifecycleState::Unknown
            && endpoints.iter().all(|ep| self.states.get(ep) == Some(&target))
    }

    /// Whether at least one probed endpoint was observed in `target`.
    pub fn any_in(&self, target: LifecycleState) -> bool {
        self.states.values().any(|s| *s == target)
    }

    pub fn count_in(&self, target: LifecycleState) -> usize {
        self.states.values().filter(|s| **s == target).count()
    }
}

/// Issues status queries and lifecycle commands against many workers at
/// once.
#[derive(Clone, Debug)]
pub struct FleetProber {
    client: reqwest::Client,
    max_concurrency: usize,
    log: Logger,
}

impl FleetProber {
    pub fn new(
        log: &Logger,
        request_timeout: Duration,
        max_concurrency: usize,
    ) -> Result<FleetProber, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .timeout(request_timeout)
            .build()?;
        Ok(FleetProber::with_client(log, client, max_concurrency))
    }

    /// Builds a prober around an existing client. Timeouts are whatever the
    /// client was configured with.
    pub fn with_client(
        log: &Logger,
        client: reqwest::Client,
        max_concurrency: usize,
    ) -> FleetProber {
        let max_concurrency = if max_concurrency == 0 {
            DEFAULT_MAX_CONCURRENCY
        } else {
            max_concurrency
        };
        FleetProber {
            client,
            max_concurrency,
            log: log.new(o!("component" => "FleetProber")),
        }
    }

    /// Queries `GET /lifecycle/status` on every endpoint.
    ///
    /// An endpoint listed more than once is queried once and reported once.
    pub async fn probe(&self, endpoints: &[WorkerEndpoint]) -> ProbeReport {
        let results = self
            .fan_out(endpoints, |client, endpoint| async move {
                fetch_status(&client, &endpoint).await
            })
            .await;

        let mut report = ProbeReport::default();
        for (endpoint, result) in results {
            match result {
                Ok(state) => {
                    report.states.insert(endpoint, state);
                }
                Err(error) => {
                    report
                        .states
                        .insert(endpoint.clone(), LifecycleState::Unknown);
                    report.errors.insert(endpoint, error);
                }
            }
        }
        if !report.errors.is_empty() {
            debug!(
                self.log,
                "probe saw failures";
                "failed" => report.errors.len(),
                "total" => report.states.len(),
            );
        }
        report
    }

    /// Sends `command` to every endpoint. Every endpoint is attempted even if
    /// others fail.
    ///
    /// An endpoint listed more than once is sent the command once, and the
    /// error's `total` counts distinct endpoints.
    pub async fn broadcast(
        &self,
        endpoints: &[WorkerEndpoint],
        command: LifecycleCommand,
    ) -> Result<(), FanOutError> {
        let results = self
            .fan_out(endpoints, move |client, endpoint| async move {
                post(&client, endpoint.url(command.path()), None).await
            })
            .await;

        let total = results.len();
        let result = collect_failures(command.as_str(), results);
        match &result {
            Ok(()) => info!(
                self.log,
                "broadcast lifecycle command";
                "command" => %command,
                "endpoints" => total,
            ),
            Err(error) => warn!(
                self.log,
                "lifecycle command failed on some endpoints";
                "command" => %command,
                "failed" => error.failed_count(),
                "total" => error.total,
            ),
        }
        result
    }

    /// Posts `desired` to `POST /desired-state` on every endpoint.
    ///
    /// Pushes are bounded to the configured concurrency, like the other fan
    /// out operations, but are driven on the calling task.
    pub async fn push_desired_state(
        &self,
        endpoints: &[WorkerEndpoint],
        desired: &DesiredState,
    ) -> Result<(), FanOutError> {
        let mut unique = endpoints.to_vec();
        unique.sort();
        unique.dedup();
        let total = unique.len();

        let failures: BTreeMap<_, _> = stream::iter(unique)
            .map(|endpoint| async move {
                let url = endpoint.url(DESIRED_STATE_PATH);
                let result = post(&self.client, url, Some(desired)).await;
                (endpoint, result)
            })
            .buffered(self.max_concurrency)
            .filter_map(|(endpoint, result)| async move {
                result.err().map(|error| (endpoint, error))
            })
            .collect()
            .await;

        if failures.is_empty() {
            debug!(
                self.log,
                "pushed desired state";
                "lifecycle" => &desired.lifecycle,
                "endpoints" => total,
            );
            Ok(())
        } else {
            Err(FanOutError { operation: "push desired state", failures, total })
        }
    }

    /// Polls every `poll_interval` (the first poll is immediate) until every
    /// endpoint reports `target`.
    ///
    /// Returns [`WaitError::Cancelled`] promptly when `cancel` fires, even
    /// with a poll in flight; requests already issued are left to complete
    /// or time out on their own. Once `timeout` has elapsed a final probe is
    /// made, and if it does not show convergence the result is
    /// [`WaitError::Timeout`] carrying that probe's states.
    pub async fn wait_until(
        &self,
        endpoints: &[WorkerEndpoint],
        target: LifecycleState,
        timeout: Duration,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), WaitError> {
        let deadline = Instant::now() + timeout;
        let mut ticker =
            tokio::time::interval(poll_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    return Err(WaitError::Cancelled { target });
                }

                _ = tokio::time::sleep_until(deadline) => {
                    let report = self
                        .probe_cancellable(endpoints, cancel)
                        .await
                        .ok_or(WaitError::Cancelled { target })?;
                    if report.all_in(target, endpoints) {
                        return Ok(());
                    }
                    warn!(
                        self.log,
                        "timed out waiting for endpoints";
                        "target" => %target,
                        "converged" => report.count_in(target),
                        "total" => endpoints.len(),
                        "timeout" => ?timeout,
                    );
                    return Err(WaitError::Timeout {
                        target,
                        timeout,
                        last_states: report.states,
                    });
                }

                _ = ticker.tick() => {
                    let report = self
                        .probe_cancellable(endpoints, cancel)
                        .await
                        .ok_or(WaitError::Cancelled { target })?;
                    if report.all_in(target, endpoints) {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Runs a probe on its own task so that giving up on it (because `cancel`
    /// fired) does not abort the requests it has issued. Returns `None` if
    /// cancelled.
    async fn probe_cancellable(
        &self,
        endpoints: &[WorkerEndpoint],
        cancel: &CancellationToken,
    ) -> Option<ProbeReport> {
        let prober = self.clone();
        let endpoints = endpoints.to_vec();
        let probe =
            tokio::spawn(async move { prober.probe(&endpoints).await });
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            joined = probe => match joined {
                Ok(report) => Some(report),
                // The probe task itself never panics; treat a failed join
                // like a probe that saw nothing.
                Err(_) => Some(ProbeReport::default()),
            },
        }
    }

    async fn fan_out<T, F, Fut>(
        &self,
        endpoints: &[WorkerEndpoint],
        work: F,
    ) -> BTreeMap<WorkerEndpoint, Result<T, EndpointError>>
    where
        T: Send + 'static,
        F: Fn(reqwest::Client, WorkerEndpoint) -> Fut,
        Fut: Future<Output = Result<T, EndpointError>> + Send + 'static,
    {
        let mut set = FanOut::new(self.max_concurrency);
        for endpoint in endpoints {
            set.spawn(
                endpoint.clone(),
                work(self.client.clone(), endpoint.clone()),
            );
        }
        if set.len() < endpoints.len() {
            debug!(
                self.log,
                "ignoring duplicate endpoints";
                "listed" => endpoints.len(),
                "distinct" => set.len(),
            );
        }
        set.join_all().await
    }
}

async fn fetch_status(
    client: &reqwest::Client,
    endpoint: &WorkerEndpoint,
) -> Result<LifecycleState, EndpointError> {
    let response = client
        .get(endpoint.url(STATUS_PATH))
        .send()
        .await
        .map_err(EndpointError::Request)?;
    check_status(&response)?;
    let body = response.bytes().await.map_err(EndpointError::Request)?;
    let status: StatusResponse =
        serde_json::from_slice(&body).map_err(EndpointError::Decode)?;
    Ok(status.state)
}

async fn post(
    client: &reqwest::Client,
    url: String,
    body: Option<&DesiredState>,
) -> Result<(), EndpointError> {
    let mut request = client.post(url);
    if let Some(body) = body {
        request = request.json(body);
    }
    let response = request.send().await.map_err(EndpointError::Request)?;
    check_status(&response)
}

fn check_status(response: &reqwest::Response) -> Result<(), EndpointError> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(EndpointError::UnexpectedStatus(status))
    }
}

fn collect_failures(
    operation: &'static str,
    results: BTreeMap<WorkerEndpoint, Result<(), EndpointError>>,
) -> Result<(), FanOutError> {
    let total = results.len();
    let failures: BTreeMap<_, _> = results
        .into_iter()
        .filter_map(|(endpoint, result)| result.err().map(|e| (endpoint, e)))
        .collect();
    if failures.is_empty() {
        Ok(())
    } else {
        Err(FanOutError { operation, failures, total })
    }
}
