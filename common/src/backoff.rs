// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Module providing utilities for retrying operations with exponential backoff.

use std::time::Duration;

pub use ::backoff::future::{retry, retry_notify};
pub use ::backoff::Error as BackoffError;
pub use ::backoff::{backoff::Backoff, ExponentialBackoff, Notify};

/// A backoff policy that gives up after a fixed number of retries.
///
/// The wrapped [`ExponentialBackoff`] decides how long to wait between
/// attempts; this type only caps how many times it is consulted. An operation
/// run under `LimitedBackoff` with `max_retries = 3` is attempted at most four
/// times.
#[derive(Debug, Clone)]
pub struct LimitedBackoff {
    inner: ExponentialBackoff,
    max_retries: usize,
    retries: usize,
}

impl LimitedBackoff {
    pub fn new(inner: ExponentialBackoff, max_retries: usize) -> Self {
        LimitedBackoff { inner, max_retries, retries: 0 }
    }

    /// Number of retries handed out since the last reset.
    pub fn retries(&self) -> usize {
        self.retries
    }
}

impl Backoff for LimitedBackoff {
    fn reset(&mut self) {
        self.retries = 0;
        self.inner.reset();
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.retries >= self.max_retries {
            return None;
        }
        let delay = self.inner.next_backoff()?;
        self.retries += 1;
        Some(delay)
    }
}

/// Return a backoff policy for calls to a local worker's lifecycle API: the
/// delay starts at `initial_interval` and doubles on each retry, up to
/// `max_retries` retries.
pub fn lifecycle_call_policy(
    initial_interval: Duration,
    max_retries: usize,
) -> LimitedBackoff {
    LimitedBackoff::new(
        deterministic_policy(initial_interval, 2.0, Duration::from_secs(30)),
        max_retries,
    )
}

/// Return a backoff policy that waits the same `delay` between each of up to
/// `max_retries` retries.
pub fn fixed_delay_policy(delay: Duration, max_retries: usize) -> LimitedBackoff {
    LimitedBackoff::new(deterministic_policy(delay, 1.0, delay), max_retries)
}

fn deterministic_policy(
    initial_interval: Duration,
    multiplier: f64,
    max_interval: Duration,
) -> ExponentialBackoff {
    let current_interval = initial_interval;
    ExponentialBackoff {
        current_interval,
        initial_interval,
        randomization_factor: 0.0,
        multiplier,
        max_interval,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn lifecycle_policy_doubles_then_stops() {
        let mut policy = lifecycle_call_policy(Duration::from_millis(500), 3);
        assert_eq!(policy.next_backoff(), Some(Duration::from_millis(500)));
        assert_eq!(policy.next_backoff(), Some(Duration::from_millis(1000)));
        assert_eq!(policy.next_backoff(), Some(Duration::from_millis(2000)));
        assert_eq!(policy.next_backoff(), None);
        assert_eq!(policy.retries(), 3);

        policy.reset();
        assert_eq!(policy.next_backoff(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn fixed_policy_keeps_delay() {
        let mut policy = fixed_delay_policy(Duration::from_millis(20), 2);
        assert_eq!(policy.next_backoff(), Some(Duration::from_millis(20)));
        assert_eq!(policy.next_backoff(), Some(Duration::from_millis(20)));
        assert_eq!(policy.next_backoff(), None);
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_retries() {
        let attempts = AtomicUsize::new(0);
        let result: Result<(), &str> = retry(
            fixed_delay_policy(Duration::from_millis(1), 3),
            || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(BackoffError::transient("nope"))
            },
        )
        .await;
        assert_eq!(result, Err("nope"));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }
}
