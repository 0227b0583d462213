// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The worker lifecycle surface: `GET /lifecycle/status`,
//! `POST /lifecycle/pause` and `POST /lifecycle/resume`.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const STATUS_PATH: &str = "/lifecycle/status";

/// Lifecycle state reported by a worker.
///
/// `Unknown` stands for "unreachable or malformed" as well as any state name
/// this crate does not recognise. It never compares equal to a wait target.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Active,
    /// Transitional: the worker has been asked to pause and is finishing
    /// in-flight work.
    Draining,
    Paused,
    #[serde(other)]
    Unknown,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Active => "ACTIVE",
            LifecycleState::Draining => "DRAINING",
            LifecycleState::Paused => "PAUSED",
            LifecycleState::Unknown => "UNKNOWN",
        }
    }

    /// Case-insensitive parse; anything unrecognised is `Unknown`.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => LifecycleState::Active,
            "DRAINING" => LifecycleState::Draining,
            "PAUSED" => LifecycleState::Paused,
            _ => LifecycleState::Unknown,
        }
    }

    /// The command that moves a worker into this state, if there is one.
    pub fn command(&self) -> Option<LifecycleCommand> {
        match self {
            LifecycleState::Active => Some(LifecycleCommand::Resume),
            LifecycleState::Paused => Some(LifecycleCommand::Pause),
            LifecycleState::Draining | LifecycleState::Unknown => None,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleCommand {
    Pause,
    Resume,
}

impl LifecycleCommand {
    pub fn path(&self) -> &'static str {
        match self {
            LifecycleCommand::Pause => "/lifecycle/pause",
            LifecycleCommand::Resume => "/lifecycle/resume",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleCommand::Pause => "pause",
            LifecycleCommand::Resume => "resume",
        }
    }
}

impl fmt::Display for LifecycleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of `GET /lifecycle/status`. Some workers name the field `status`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StatusResponse {
    #[serde(alias = "status")]
    pub state: LifecycleState,
}
