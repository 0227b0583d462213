// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Polling for a condition to become true, for tests that observe background
//! work.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Result of one check of the condition passed to [`wait_for_condition`].
#[derive(Debug)]
pub enum CondCheckError<E> {
    /// the condition does not hold yet; keep polling
    NotYet,
    /// the condition can never hold; stop polling
    Failed(E),
}

impl<E> From<E> for CondCheckError<E> {
    fn from(error: E) -> Self {
        CondCheckError::Failed(error)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error<E: std::fmt::Debug> {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("condition failed: {0:?}")]
    PermanentError(E),
}

/// Calls `cond` every `poll_interval` until it returns `Ok`, returns
/// `CondCheckError::Failed`, or `poll_max` has elapsed.
pub async fn wait_for_condition<O, E, Func, Fut>(
    mut cond: Func,
    poll_interval: &Duration,
    poll_max: &Duration,
) -> Result<O, Error<E>>
where
    E: std::fmt::Debug,
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<O, CondCheckError<E>>>,
{
    let start = Instant::now();
    loop {
        match cond().await {
            Ok(output) => return Ok(output),
            Err(CondCheckError::Failed(error)) => {
                return Err(Error::PermanentError(error));
            }
            Err(CondCheckError::NotYet) => {}
        }
        if start.elapsed() > *poll_max {
            return Err(Error::TimedOut(start.elapsed()));
        }
        tokio::time::sleep(*poll_interval).await;
    }
}
