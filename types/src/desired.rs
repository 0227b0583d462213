// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Desired state as pushed to a sidecar (`POST /desired-state`) and as stored
//! in the durable intent record.

use crate::lifecycle::LifecycleState;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const DESIRED_STATE_PATH: &str = "/desired-state";

/// Target state for one worker.
///
/// `lifecycle` is kept as the raw string the writer sent. Comparison against
/// the worker's reported state is case-insensitive, and a value that names
/// neither `ACTIVE` nor `PAUSED` is reported rather than rejected.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DesiredState {
    pub lifecycle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<FaultConfig>,
}

impl DesiredState {
    pub fn new(lifecycle: LifecycleState) -> Self {
        DesiredState { lifecycle: lifecycle.as_str().to_string(), fault: None }
    }

    /// The lifecycle state this desired state asks for, if it is one a
    /// worker can be commanded into.
    pub fn desired_lifecycle(&self) -> Option<LifecycleState> {
        match LifecycleState::parse_lenient(&self.lifecycle) {
            s @ (LifecycleState::Active | LifecycleState::Paused) => Some(s),
            LifecycleState::Draining | LifecycleState::Unknown => None,
        }
    }

    /// Serialises this desired state the way it is stored in the intent
    /// record and fallback files.
    pub fn to_json(&self) -> String {
        // Serialising a struct of strings and integers cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Fault-injection parameters for a worker. A zero field is unset.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct FaultConfig {
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub processing_delay_ms: u64,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub error_rate_percent: u32,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub commit_delay_ms: u64,
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

impl FaultConfig {
    /// The worker fault calls needed to apply this configuration, one per
    /// non-zero parameter.
    pub fn settings(&self) -> Vec<FaultSetting> {
        let mut settings = Vec::new();
        if self.processing_delay_ms > 0 {
            settings.push(FaultSetting::ProcessingDelay {
                delay_ms: self.processing_delay_ms,
            });
        }
        if self.error_rate_percent > 0 {
            settings.push(FaultSetting::ErrorRate {
                error_rate_percent: self.error_rate_percent,
            });
        }
        if self.commit_delay_ms > 0 {
            settings
                .push(FaultSetting::CommitDelay { delay_ms: self.commit_delay_ms });
        }
        settings
    }
}

/// One call on the worker fault surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultSetting {
    ProcessingDelay { delay_ms: u64 },
    ErrorRate { error_rate_percent: u32 },
    CommitDelay { delay_ms: u64 },
}

impl FaultSetting {
    pub fn path(&self) -> &'static str {
        match self {
            FaultSetting::ProcessingDelay { .. } => "/fault/processing-delay",
            FaultSetting::ErrorRate { .. } => "/fault/error-rate",
            FaultSetting::CommitDelay { .. } => "/fault/commit-delay",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FaultSetting::ProcessingDelay { .. } => "processing_delay",
            FaultSetting::ErrorRate { .. } => "error_rate",
            FaultSetting::CommitDelay { .. } => "commit_delay",
        }
    }

    /// JSON body of the `PUT` request.
    pub fn body(&self) -> serde_json::Value {
        match self {
            FaultSetting::ProcessingDelay { delay_ms }
            | FaultSetting::CommitDelay { delay_ms } => {
                serde_json::json!({ "delayMs": delay_ms })
            }
            FaultSetting::ErrorRate { error_rate_percent } => {
                serde_json::json!({ "errorRatePercent": error_rate_percent })
            }
        }
    }
}

/// Response to an accepted desired-state push.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PushAccepted {
    pub status: String,
}

impl PushAccepted {
    pub fn accepted() -> Self {
        PushAccepted { status: "accepted".to_string() }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn desired_lifecycle_is_case_insensitive() {
        let parse = |s: &str| serde_json::from_str::<DesiredState>(s).unwrap();
        assert_eq!(
            parse(r#"{"lifecycle":"paused"}"#).desired_lifecycle(),
            Some(LifecycleState::Paused)
        );
        assert_eq!(
            parse(r#"{"lifecycle":"Active"}"#).desired_lifecycle(),
            Some(LifecycleState::Active)
        );
        assert_eq!(parse(r#"{"lifecycle":"SLEEPING"}"#).desired_lifecycle(), None);
        assert_eq!(parse(r#"{"lifecycle":"DRAINING"}"#).desired_lifecycle(), None);
    }

    #[test]
    fn intent_json_shape() {
        assert_eq!(
            DesiredState::new(LifecycleState::Paused).to_json(),
            r#"{"lifecycle":"PAUSED"}"#
        );
    }

    #[test]
    fn fault_settings_skip_zero_fields() {
        let desired: DesiredState = serde_json::from_str(
            r#"{"lifecycle":"ACTIVE","fault":{"processingDelayMs":250,"commitDelayMs":0,"errorRatePercent":5}}"#,
        )
        .unwrap();
        let fault = desired.fault.unwrap();
        assert_eq!(
            fault.settings(),
            vec![
                FaultSetting::ProcessingDelay { delay_ms: 250 },
                FaultSetting::ErrorRate { error_rate_percent: 5 },
            ]
        );
        assert_eq!(
            fault.settings()[1].body(),
            serde_json::json!({ "errorRatePercent": 5 })
        );
        assert!(FaultConfig::default().settings().is_empty());
    }
}
