// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Talking to the local worker's lifecycle and fault surfaces.

use crate::config::LifecycleConfig;
use cutover_common::backoff::{
    lifecycle_call_policy, retry_notify, BackoffError,
};
use cutover_types::lifecycle::STATUS_PATH;
use cutover_types::{
    FaultSetting, LifecycleCommand, LifecycleState, StatusResponse,
    WorkerEndpoint,
};
use display_error_chain::DisplayErrorChain;
use slog::{debug, info, o, warn, Logger};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("{operation} request to {url} failed")]
    Request {
        operation: &'static str,
        url: String,
        #[source]
        err: reqwest::Error,
    },
    #[error("{operation} request to {url} returned {status}")]
    UnexpectedStatus {
        operation: &'static str,
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("malformed status response from {url}")]
    Decode {
        url: String,
        #[source]
        err: serde_json::Error,
    },
}

/// The operations the reconciler needs from the worker it manages.
pub trait WorkerLifecycle: Send + Sync + 'static {
    /// The worker's current lifecycle state.
    fn status(
        &self,
    ) -> impl Future<Output = Result<LifecycleState, LifecycleError>> + Send;

    /// Asks the worker to pause or resume.
    fn send(
        &self,
        command: LifecycleCommand,
    ) -> impl Future<Output = Result<(), LifecycleError>> + Send;

    /// Applies one fault-injection parameter.
    fn set_fault(
        &self,
        setting: FaultSetting,
    ) -> impl Future<Output = Result<(), LifecycleError>> + Send;
}

/// HTTP client for a worker's lifecycle surface. Every call is retried with
/// exponential backoff.
#[derive(Clone, Debug)]
pub struct LifecycleClient {
    client: reqwest::Client,
    worker: WorkerEndpoint,
    max_retries: usize,
    retry_initial_interval: Duration,
    log: Logger,
}

impl LifecycleClient {
    pub fn new(
        log: &Logger,
        config: &LifecycleConfig,
    ) -> Result<LifecycleClient, reqwest::Error> {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(config.request_timeout_secs)
            .timeout(config.request_timeout_secs)
            .build()?;
        Ok(LifecycleClient {
            client,
            worker: config.worker.clone(),
            max_retries: config.max_retries,
            retry_initial_interval: config.retry_initial_interval_ms,
            log: log.new(o!(
                "component" => "LifecycleClient",
                "worker" => config.worker.to_string(),
            )),
        })
    }

    /// Reads the worker's state once, without retrying.
    pub async fn check_status(&self) -> Result<LifecycleState, LifecycleError> {
        let url = self.worker.url(STATUS_PATH);
        let response = self.client.get(&url).send().await.map_err(|err| {
            LifecycleError::Request { operation: "status", url: url.clone(), err }
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(LifecycleError::UnexpectedStatus {
                operation: "status",
                url,
                status,
            });
        }
        let body = response.bytes().await.map_err(|err| {
            LifecycleError::Request { operation: "status", url: url.clone(), err }
        })?;
        let parsed: StatusResponse = serde_json::from_slice(&body)
            .map_err(|err| LifecycleError::Decode { url, err })?;
        Ok(parsed.state)
    }

    async fn post_once(
        &self,
        command: LifecycleCommand,
    ) -> Result<(), LifecycleError> {
        let operation = command.as_str();
        let url = self.worker.url(command.path());
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|err| LifecycleError::Request {
                operation,
                url: url.clone(),
                err,
            })?;
        check_success(operation, url, response.status())
    }

    async fn put_once(
        &self,
        setting: FaultSetting,
    ) -> Result<(), LifecycleError> {
        let operation = setting.name();
        let url = self.worker.url(setting.path());
        let response = self
            .client
            .put(&url)
            .json(&setting.body())
            .send()
            .await
            .map_err(|err| LifecycleError::Request {
                operation,
                url: url.clone(),
                err,
            })?;
        check_success(operation, url, response.status())
    }

    async fn with_retries<T, F, Fut>(
        &self,
        operation: &'static str,
        mut attempt: F,
    ) -> Result<T, LifecycleError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LifecycleError>>,
    {
        retry_notify(
            lifecycle_call_policy(self.retry_initial_interval, self.max_retries),
            || {
                let call = attempt();
                async move { call.await.map_err(BackoffError::transient) }
            },
            |error: LifecycleError, delay: Duration| {
                warn!(
                    self.log,
                    "lifecycle call failed, will retry";
                    "operation" => operation,
                    "retry_in" => ?delay,
                    "error" => %DisplayErrorChain::new(&error),
                );
            },
        )
        .await
    }
}

fn check_success(
    operation: &'static str,
    url: String,
    status: reqwest::StatusCode,
) -> Result<(), LifecycleError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(LifecycleError::UnexpectedStatus { operation, url, status })
    }
}

impl WorkerLifecycle for LifecycleClient {
    async fn status(&self) -> Result<LifecycleState, LifecycleError> {
        let state = self.with_retries("status", || self.check_status()).await?;
        debug!(self.log, "worker status"; "state" => %state);
        Ok(state)
    }

    async fn send(
        &self,
        command: LifecycleCommand,
    ) -> Result<(), LifecycleError> {
        info!(self.log, "sending lifecycle command"; "command" => %command);
        self.with_retries(command.as_str(), || self.post_once(command)).await
    }

    async fn set_fault(
        &self,
        setting: FaultSetting,
    ) -> Result<(), LifecycleError> {
        self.with_retries(setting.name(), || self.put_once(setting)).await?;
        info!(self.log, "fault injection applied"; "fault" => setting.name());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use cutover_test_utils::dev::test_setup_log;
    use httptest::matchers::{all_of, eq, json_decoded, request};
    use httptest::responders::{json_encoded, status_code};
    use httptest::Expectation;

    fn client(
        log: &Logger,
        server: &httptest::Server,
        max_retries: usize,
    ) -> LifecycleClient {
        let config = LifecycleConfig {
            worker: WorkerEndpoint::from(server.addr()),
            request_timeout_secs: Duration::from_secs(2),
            max_retries,
            retry_initial_interval_ms: Duration::from_millis(10),
        };
        LifecycleClient::new(log, &config).unwrap()
    }

    #[tokio::test]
    async fn status_is_retried() {
        let logctx = test_setup_log("status_is_retried");
        let server = httptest::Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/lifecycle/status",
            ))
            .times(2)
            .respond_with(httptest::cycle![
                status_code(503),
                json_encoded(serde_json::json!({ "status": "paused" })),
            ]),
        );

        let state = client(&logctx.log, &server, 3).status().await.unwrap();
        assert_eq!(state, LifecycleState::Paused);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn command_gives_up_after_retries() {
        let logctx = test_setup_log("command_gives_up_after_retries");
        let server = httptest::Server::run();
        // one attempt and two retries
        server.expect(
            Expectation::matching(request::method_path(
                "POST",
                "/lifecycle/resume",
            ))
            .times(3)
            .respond_with(status_code(500)),
        );

        let error = client(&logctx.log, &server, 2)
            .send(LifecycleCommand::Resume)
            .await
            .unwrap_err();
        assert_matches!(
            error,
            LifecycleError::UnexpectedStatus { operation: "resume", status, .. }
                if status.as_u16() == 500
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn fault_body() {
        let logctx = test_setup_log("fault_body");
        let server = httptest::Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("PUT", "/fault/commit-delay"),
                request::body(json_decoded(eq(
                    serde_json::json!({ "delayMs": 250 })
                ))),
            ])
            .times(1)
            .respond_with(status_code(204)),
        );

        client(&logctx.log, &server, 0)
            .set_fault(FaultSetting::CommitDelay { delay_ms: 250 })
            .await
            .unwrap();
        logctx.cleanup_successful();
    }
}
