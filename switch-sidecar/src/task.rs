// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The reconcile loop and the handle used to push desired state into it.

use crate::lifecycle::WorkerLifecycle;
use crate::reconciler::{ReconcileOutcome, Reconciler};
use chrono::{DateTime, Utc};
use cutover_types::DesiredState;
use schemars::JsonSchema;
use serde::Serialize;
use slog::{debug, info, o, Logger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Why a reconcile cycle ran.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ActivationReason {
    Timer,
    Push,
}

#[derive(Clone, Debug, Serialize, JsonSchema)]
pub struct LastReconcile {
    pub iteration: u64,
    pub reason: ActivationReason,
    pub start_time: DateTime<Utc>,
    pub elapsed: Duration,
    pub outcome: ReconcileOutcome,
}

/// Published by the reconcile loop after every cycle.
#[derive(Clone, Debug, Default, Serialize, JsonSchema)]
pub struct ReconcileStatus {
    /// number of cycles started so far
    pub iteration: u64,
    pub last: Option<LastReconcile>,
}

/// Write side of the pushed desired state. Pushing replaces the cached value
/// and wakes the reconcile loop; it never waits for the worker.
#[derive(Clone, Debug)]
pub struct DesiredStateHandle {
    tx: Arc<watch::Sender<Option<DesiredState>>>,
}

impl DesiredStateHandle {
    /// A handle and the receiver to give to the [`Reconciler`].
    pub fn new() -> (DesiredStateHandle, watch::Receiver<Option<DesiredState>>)
    {
        let (tx, rx) = watch::channel(None);
        (DesiredStateHandle { tx: Arc::new(tx) }, rx)
    }

    pub fn push(&self, desired: DesiredState) {
        self.tx.send_replace(Some(desired));
    }

    /// The most recently pushed desired state.
    pub fn current(&self) -> Option<DesiredState> {
        self.tx.borrow().clone()
    }
}

/// Runs a [`Reconciler`] every `period`, and immediately after each push.
pub struct ReconcilerTask<W> {
    reconciler: Reconciler<W>,
    period: Duration,
    cancel: CancellationToken,
    status_tx: watch::Sender<ReconcileStatus>,
    /// counts iterations of the loop, for debuggability
    iteration: u64,
    log: Logger,
}

impl<W: WorkerLifecycle> ReconcilerTask<W> {
    pub fn new(
        log: &Logger,
        reconciler: Reconciler<W>,
        period: Duration,
        cancel: CancellationToken,
    ) -> (ReconcilerTask<W>, watch::Receiver<ReconcileStatus>) {
        let (status_tx, status_rx) = watch::channel(ReconcileStatus::default());
        let task = ReconcilerTask {
            reconciler,
            period,
            cancel,
            status_tx,
            iteration: 0,
            log: log.new(o!("component" => "ReconcilerTask")),
        };
        (task, status_rx)
    }

    /// Body of the tokio task that drives reconciliation. The first cycle
    /// runs immediately.
    pub async fn run(mut self) {
        info!(self.log, "starting reconcile loop"; "period" => ?self.period);
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pushes_open = true;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    info!(self.log, "reconcile loop stopped");
                    return;
                }

                changed = self.reconciler.push_changed(), if pushes_open => {
                    if changed {
                        self.activate(ActivationReason::Push).await;
                    } else {
                        pushes_open = false;
                    }
                }

                _ = interval.tick() => {
                    self.activate(ActivationReason::Timer).await;
                }
            }
        }
    }

    async fn activate(&mut self, reason: ActivationReason) {
        self.iteration += 1;
        let iteration = self.iteration;
        let start_time = Utc::now();
        let start_instant = Instant::now();
        debug!(
            self.log,
            "activating";
            "reason" => ?reason,
            "iteration" => iteration,
        );
        self.status_tx.send_modify(|status| status.iteration = iteration);

        let outcome = self.reconciler.reconcile_once().await;

        let elapsed = start_instant.elapsed();
        debug!(
            self.log,
            "activation complete";
            "elapsed" => ?elapsed,
            "iteration" => iteration,
            "outcome" => ?outcome,
        );
        self.status_tx.send_modify(|status| {
            status.last = Some(LastReconcile {
                iteration,
                reason,
                start_time,
                elapsed,
                outcome,
            });
        });
    }
}
