// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// The stored form of a lease.
///
/// `resource_version` is managed by the backend: it is assigned on create,
/// must match the stored value on update, and changes on every successful
/// update.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    pub holder_identity: String,
    pub acquire_time: DateTime<Utc>,
    pub renew_time: DateTime<Utc>,
    pub lease_duration_seconds: u32,
    #[serde(default)]
    pub resource_version: u64,
}

impl LeaseRecord {
    pub fn new(
        holder: &str,
        now: DateTime<Utc>,
        lease_duration_seconds: u32,
    ) -> LeaseRecord {
        LeaseRecord {
            holder_identity: holder.to_string(),
            acquire_time: now,
            renew_time: now,
            lease_duration_seconds,
            resource_version: 0,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.renew_time
            + TimeDelta::seconds(i64::from(self.lease_duration_seconds))
    }

    /// A lease is held when it names a holder and has not yet expired.
    pub fn is_held_at(&self, now: DateTime<Utc>) -> bool {
        !self.holder_identity.is_empty() && now < self.expires_at()
    }

    /// Whether `holder` would be refused this lease at `now`.
    pub fn excludes(&self, holder: &str, now: DateTime<Utc>) -> bool {
        self.is_held_at(now) && self.holder_identity != holder
    }
}
