// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Switch counters exposed on `/metrics`.

use cutover_types::RoleName;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct SwitchStats {
    attempts: AtomicU64,
    successes: AtomicU64,
    aborts: AtomicU64,
    rollbacks: AtomicU64,
    dual_active: AtomicU64,
    last_duration_ms: AtomicU64,
    active_role: Mutex<Option<RoleName>>,
}

/// A point-in-time copy of [`SwitchStats`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SwitchMetrics {
    pub switch_attempts: u64,
    pub switch_successes: u64,
    pub switch_aborts: u64,
    pub switch_rollbacks: u64,
    pub dual_active_detected: u64,
    /// duration of the last committed switch, in milliseconds
    pub last_switch_duration_ms: u64,
    pub active_role: Option<RoleName>,
}

impl SwitchStats {
    pub fn new() -> SwitchStats {
        SwitchStats::default()
    }

    pub fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, duration: Duration, active: &RoleName) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.last_duration_ms.store(millis, Ordering::Relaxed);
        self.set_active(active);
    }

    pub fn record_abort(&self) {
        self.aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollback(&self, active: &RoleName) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        self.set_active(active);
    }

    pub fn record_dual_active(&self) {
        self.dual_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_active(&self, active: &RoleName) {
        let mut current = match self.active_role.lock() {
            Ok(current) => current,
            Err(poisoned) => poisoned.into_inner(),
        };
        *current = Some(active.clone());
    }

    pub fn snapshot(&self) -> SwitchMetrics {
        let active_role = match self.active_role.lock() {
            Ok(current) => current.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        SwitchMetrics {
            switch_attempts: self.attempts.load(Ordering::Relaxed),
            switch_successes: self.successes.load(Ordering::Relaxed),
            switch_aborts: self.aborts.load(Ordering::Relaxed),
            switch_rollbacks: self.rollbacks.load(Ordering::Relaxed),
            dual_active_detected: self.dual_active.load(Ordering::Relaxed),
            last_switch_duration_ms: self.last_duration_ms.load(Ordering::Relaxed),
            active_role,
        }
    }
}
