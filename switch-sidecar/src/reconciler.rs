// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One reconcile cycle: bring the worker's lifecycle state in line with its
//! desired state.
//!
//! The desired state comes from the last push, if there has been one since
//! the process started, and otherwise from the fallback file. A desired state
//! that was fully applied once is not applied again until it changes.

use crate::fallback::FileFallback;
use crate::lifecycle::WorkerLifecycle;
use crate::stats::SidecarStats;
use cutover_types::{DesiredState, LifecycleCommand, LifecycleState};
use display_error_chain::DisplayErrorChain;
use schemars::JsonSchema;
use serde::Serialize;
use slog::{debug, error, info, o, warn, Logger};
use std::sync::Arc;
use tokio::sync::watch;

/// What a reconcile cycle did.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// neither a push nor a fallback file
    NoDesiredState,
    /// the desired state was already applied
    UpToDate,
    /// the worker's state could not be read; retried next cycle
    StatusUnavailable,
    Corrected {
        command: LifecycleCommand,
        from: LifecycleState,
    },
    AlreadyConverged,
    /// the desired lifecycle names no state a worker can be commanded into
    UnknownLifecycle {
        lifecycle: String,
    },
    /// the command failed; retried next cycle
    CommandFailed {
        command: LifecycleCommand,
    },
}

pub struct Reconciler<W> {
    worker: W,
    pushed: watch::Receiver<Option<DesiredState>>,
    fallback: FileFallback,
    last_applied: Option<DesiredState>,
    stats: Arc<SidecarStats>,
    log: Logger,
}

impl<W: WorkerLifecycle> Reconciler<W> {
    pub fn new(
        log: &Logger,
        worker: W,
        pushed: watch::Receiver<Option<DesiredState>>,
        fallback: FileFallback,
        stats: Arc<SidecarStats>,
    ) -> Reconciler<W> {
        Reconciler {
            worker,
            pushed,
            fallback,
            last_applied: None,
            stats,
            log: log.new(o!("component" => "Reconciler")),
        }
    }

    pub fn last_applied(&self) -> Option<&DesiredState> {
        self.last_applied.as_ref()
    }

    /// Waits for the next push. Returns false if pushes can no longer
    /// arrive.
    pub(crate) async fn push_changed(&mut self) -> bool {
        self.pushed.changed().await.is_ok()
    }

    async fn desired(&mut self) -> Option<DesiredState> {
        let pushed = self.pushed.borrow_and_update().clone();
        match pushed {
            Some(desired) => Some(desired),
            None => self.fallback.load().await,
        }
    }

    pub async fn reconcile_once(&mut self) -> ReconcileOutcome {
        let Some(desired) = self.desired().await else {
            debug!(self.log, "no desired state available");
            return ReconcileOutcome::NoDesiredState;
        };
        if self.last_applied.as_ref() == Some(&desired) {
            debug!(
                self.log,
                "desired state already applied";
                "lifecycle" => &desired.lifecycle,
            );
            return ReconcileOutcome::UpToDate;
        }

        let actual = match self.worker.status().await {
            Ok(actual) => actual,
            Err(error) => {
                warn!(
                    self.log,
                    "failed to read worker status, will retry next cycle";
                    "error" => %DisplayErrorChain::new(&error),
                );
                return ReconcileOutcome::StatusUnavailable;
            }
        };
        self.stats.set_current_state(actual);

        let Some((target, command)) = desired
            .desired_lifecycle()
            .and_then(|target| target.command().map(|c| (target, c)))
        else {
            warn!(
                self.log,
                "unknown desired lifecycle state";
                "lifecycle" => &desired.lifecycle,
            );
            return ReconcileOutcome::UnknownLifecycle {
                lifecycle: desired.lifecycle.clone(),
            };
        };

        let outcome = if actual == target {
            debug!(self.log, "worker already in desired state"; "state" => %target);
            ReconcileOutcome::AlreadyConverged
        } else {
            info!(
                self.log,
                "lifecycle mismatch, applying correction";
                "desired" => %target,
                "actual" => %actual,
            );
            self.stats.record_command(command);
            if let Err(error) = self.worker.send(command).await {
                error!(
                    self.log,
                    "lifecycle command failed";
                    "command" => %command,
                    "error" => %DisplayErrorChain::new(&error),
                );
                self.stats.record_command_error(command);
                return ReconcileOutcome::CommandFailed { command };
            }
            ReconcileOutcome::Corrected { command, from: actual }
        };

        if let Some(fault) = &desired.fault {
            for setting in fault.settings() {
                if let Err(error) = self.worker.set_fault(setting).await {
                    warn!(
                        self.log,
                        "failed to apply fault setting";
                        "fault" => setting.name(),
                        "error" => %DisplayErrorChain::new(&error),
                    );
                    self.stats.record_fault_error();
                }
            }
        }

        self.stats.record_applied(target);
        info!(
            self.log,
            "reconcile succeeded";
            "lifecycle" => &desired.lifecycle,
            "has_fault" => desired.fault.is_some(),
        );
        self.last_applied = Some(desired);
        outcome
    }
}
