// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::lifecycle::LifecycleClient;
use crate::stats::SidecarStats;
use crate::task::{DesiredStateHandle, ReconcileStatus};
use slog::Logger;
use std::sync::Arc;
use tokio::sync::watch;

pub struct ServerContext {
    desired: DesiredStateHandle,
    worker: LifecycleClient,
    stats: Arc<SidecarStats>,
    status: watch::Receiver<ReconcileStatus>,
    log: Logger,
}

impl ServerContext {
    pub fn new(
        desired: DesiredStateHandle,
        worker: LifecycleClient,
        stats: Arc<SidecarStats>,
        status: watch::Receiver<ReconcileStatus>,
        log: Logger,
    ) -> Self {
        Self { desired, worker, stats, status, log }
    }

    pub fn desired(&self) -> &DesiredStateHandle {
        &self.desired
    }

    pub fn worker(&self) -> &LifecycleClient {
        &self.worker
    }

    pub fn stats(&self) -> &SidecarStats {
        &self.stats
    }

    pub fn reconcile_status(&self) -> ReconcileStatus {
        self.status.borrow().clone()
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }
}
