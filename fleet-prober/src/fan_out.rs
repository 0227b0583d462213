// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::EndpointError;
use cutover_types::WorkerEndpoint;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// The default number of per-endpoint requests in flight at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 16;

/// A set of per-endpoint tasks which run on distinct tokio tasks, at most
/// `max_concurrency` at a time.
///
/// Every spawned task runs to completion regardless of how its siblings fare.
/// [`FanOut::join_all`] returns exactly one result per spawned endpoint: a
/// task that panics or is cancelled still shows up, as
/// [`EndpointError::TaskFailed`].
pub struct FanOut<T> {
    semaphore: Arc<Semaphore>,
    set: JoinSet<(WorkerEndpoint, Result<T, EndpointError>)>,
    spawned: BTreeSet<WorkerEndpoint>,
}

impl<T: 'static + Send> FanOut<T> {
    pub fn new(max_concurrency: usize) -> FanOut<T> {
        FanOut {
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            set: JoinSet::new(),
            spawned: BTreeSet::new(),
        }
    }

    /// Spawns `work` for `endpoint` immediately. It starts executing once a
    /// concurrency slot is free.
    ///
    /// Spawning twice for the same endpoint is a no-op.
    pub fn spawn<F>(&mut self, endpoint: WorkerEndpoint, work: F)
    where
        F: Future<Output = Result<T, EndpointError>> + Send + 'static,
    {
        if !self.spawned.insert(endpoint.clone()) {
            return;
        }
        let semaphore = Arc::clone(&self.semaphore);
        self.set.spawn(async move {
            // Hold onto the permit until the work finishes.
            let Ok(permit) = semaphore.acquire_owned().await else {
                let err = EndpointError::TaskFailed(
                    "concurrency limiter closed".to_string(),
                );
                return (endpoint, Err(err));
            };
            let output = work.await;
            drop(permit);
            (endpoint, output)
        });
    }

    /// Number of distinct endpoints spawned so far.
    pub fn len(&self) -> usize {
        self.spawned.len()
    }

    /// Waits for every task and returns one result per spawned endpoint.
    pub async fn join_all(mut self) -> BTreeMap<WorkerEndpoint, Result<T, EndpointError>> {
        let mut results = BTreeMap::new();
        let mut last_join_error = None;
        while let Some(joined) = self.set.join_next().await {
            match joined {
                Ok((endpoint, result)) => {
                    self.spawned.remove(&endpoint);
                    results.insert(endpoint, result);
                }
                Err(error) => last_join_error = Some(error.to_string()),
            }
        }
        // Anything left over belonged to a task that never returned.
        let message = last_join_error
            .unwrap_or_else(|| "task exited without a result".to_string());
        for endpoint in self.spawned {
            results.insert(endpoint, Err(EndpointError::TaskFailed(message.clone())));
        }
        results
    }
}
