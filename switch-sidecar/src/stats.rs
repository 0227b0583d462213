// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sidecar counters exposed on `/metrics`.

use cutover_types::{LifecycleCommand, LifecycleState};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct SidecarStats {
    pause_commands: AtomicU64,
    resume_commands: AtomicU64,
    pause_errors: AtomicU64,
    resume_errors: AtomicU64,
    fault_errors: AtomicU64,
    reconciliations_applied: AtomicU64,
    current_state: Mutex<Option<LifecycleState>>,
}

/// A point-in-time copy of [`SidecarStats`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SidecarCounters {
    /// lifecycle commands sent, by command
    pub lifecycle_commands: BTreeMap<String, u64>,
    /// lifecycle commands that failed, by command
    pub lifecycle_command_errors: BTreeMap<String, u64>,
    pub fault_errors: u64,
    pub reconciliations_applied: u64,
    /// state the worker was last brought into (or found in)
    pub current_state: Option<LifecycleState>,
}

impl SidecarStats {
    pub fn new() -> SidecarStats {
        SidecarStats::default()
    }

    fn command_counter(&self, command: LifecycleCommand) -> &AtomicU64 {
        match command {
            LifecycleCommand::Pause => &self.pause_commands,
            LifecycleCommand::Resume => &self.resume_commands,
        }
    }

    fn error_counter(&self, command: LifecycleCommand) -> &AtomicU64 {
        match command {
            LifecycleCommand::Pause => &self.pause_errors,
            LifecycleCommand::Resume => &self.resume_errors,
        }
    }

    pub fn record_command(&self, command: LifecycleCommand) {
        self.command_counter(command).fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command_error(&self, command: LifecycleCommand) {
        self.error_counter(command).fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fault_error(&self) {
        self.fault_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_applied(&self, state: LifecycleState) {
        self.reconciliations_applied.fetch_add(1, Ordering::Relaxed);
        self.set_current_state(state);
    }

    pub fn set_current_state(&self, state: LifecycleState) {
        let mut current = match self.current_state.lock() {
            Ok(current) => current,
            Err(poisoned) => poisoned.into_inner(),
        };
        *current = Some(state);
    }

    pub fn snapshot(&self) -> SidecarCounters {
        let by_command = |counter: fn(&Self, LifecycleCommand) -> &AtomicU64|
         -> BTreeMap<String, u64> {
            [LifecycleCommand::Pause, LifecycleCommand::Resume]
                .into_iter()
                .map(|command| {
                    (
                        command.as_str().to_string(),
                        counter(self, command).load(Ordering::Relaxed),
                    )
                })
                .collect()
        };
        let current_state = match self.current_state.lock() {
            Ok(current) => *current,
            Err(poisoned) => *poisoned.into_inner(),
        };
        SidecarCounters {
            lifecycle_commands: by_command(Self::command_counter),
            lifecycle_command_errors: by_command(Self::error_counter),
            fault_errors: self.fault_errors.load(Ordering::Relaxed),
            reconciliations_applied: self
                .reconciliations_applied
                .load(Ordering::Relaxed),
            current_state,
        }
    }
}
