// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An advisory, expiring lease over one named record in a key-value backend.
//!
//! The lease gives mutual exclusion only while its holder keeps it fresh and
//! the backend stays reachable: a lease whose `renew_time + duration` has
//! passed can be taken over by anybody. Nothing here renews a lease in the
//! background; callers that need a lease for longer than its duration must
//! call [`LeaseClient::renew`] themselves.

use chrono::{DateTime, Utc};
use slog::{debug, info, o, warn, Logger};
use std::sync::Arc;
use std::time::Duration;

mod backend;
mod record;

pub use backend::{BackendError, InMemoryLeaseBackend, LeaseBackend};
pub use record::LeaseRecord;

pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error(
        "lease {lease:?} is held by {holder:?} (expires at {})",
        .expires_at.to_rfc3339()
    )]
    Contention { lease: String, holder: String, expires_at: DateTime<Utc> },
    #[error("lease {lease:?} does not exist")]
    NotFound { lease: String },
    #[error("lease {lease:?}: backend error")]
    Backend {
        lease: String,
        #[source]
        err: BackendError,
    },
}

/// Client for one named lease.
#[derive(Clone)]
pub struct LeaseClient {
    backend: Arc<dyn LeaseBackend>,
    name: String,
    duration_seconds: u32,
    log: Logger,
}

impl LeaseClient {
    pub fn new(
        log: &Logger,
        backend: Arc<dyn LeaseBackend>,
        name: impl Into<String>,
        duration: Duration,
    ) -> LeaseClient {
        let name = name.into();
        let duration_seconds =
            u32::try_from(duration.as_secs()).unwrap_or(u32::MAX).max(1);
        LeaseClient {
            backend,
            log: log.new(o!("component" => "LeaseClient", "lease" => name.clone())),
            name,
            duration_seconds,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Takes the lease for `holder`.
    ///
    /// Creates the record if there is none. Fails with
    /// [`LeaseError::Contention`] if a different holder has an unexpired
    /// lease; otherwise overwrites the holder and both timestamps.
    pub async fn acquire(&self, holder: &str) -> Result<LeaseRecord, LeaseError> {
        let now = Utc::now();
        let record = match self.read().await? {
            None => {
                let record = LeaseRecord::new(holder, now, self.duration_seconds);
                match self.backend.create(&self.name, record).await {
                    Ok(record) => {
                        info!(self.log, "lease created and acquired"; "holder" => holder);
                        return Ok(record);
                    }
                    Err(BackendError::AlreadyExists) => {
                        return Err(self.lost_race(holder).await);
                    }
                    Err(err) => return Err(self.backend_error(err)),
                }
            }
            Some(current) => current,
        };

        if record.excludes(holder, now) {
            return Err(self.contention(&record));
        }
        if !record.holder_identity.is_empty()
            && record.holder_identity != holder
        {
            warn!(
                self.log,
                "lease expired, taking over";
                "previous_holder" => &record.holder_identity,
                "holder" => holder,
            );
        }

        let next = LeaseRecord {
            holder_identity: holder.to_string(),
            acquire_time: now,
            renew_time: now,
            lease_duration_seconds: self.duration_seconds,
            resource_version: record.resource_version,
        };
        let stored = self.store(holder, next).await?;
        info!(self.log, "lease acquired"; "holder" => holder);
        Ok(stored)
    }

    /// Moves the lease from `from` to `to`.
    ///
    /// Succeeds if `from` holds the lease or nobody does (the holder is empty
    /// or the lease has expired). Fails with [`LeaseError::Contention`] if a
    /// third party holds it and [`LeaseError::NotFound`] if there is no
    /// record.
    pub async fn transfer(
        &self,
        from: &str,
        to: &str,
    ) -> Result<LeaseRecord, LeaseError> {
        let now = Utc::now();
        let record = self
            .read()
            .await?
            .ok_or_else(|| LeaseError::NotFound { lease: self.name.clone() })?;
        if record.excludes(from, now) && record.holder_identity != to {
            return Err(self.contention(&record));
        }
        let next = LeaseRecord {
            holder_identity: to.to_string(),
            acquire_time: now,
            renew_time: now,
            lease_duration_seconds: self.duration_seconds,
            resource_version: record.resource_version,
        };
        let stored = self.store(to, next).await?;
        info!(self.log, "lease transferred"; "from" => from, "to" => to);
        Ok(stored)
    }

    /// Bumps the renew time, leaving the holder alone.
    pub async fn renew(&self) -> Result<LeaseRecord, LeaseError> {
        let record = self
            .read()
            .await?
            .ok_or_else(|| LeaseError::NotFound { lease: self.name.clone() })?;
        let holder = record.holder_identity.clone();
        let next = LeaseRecord { renew_time: Utc::now(), ..record };
        let stored = self.store(&holder, next).await?;
        debug!(self.log, "lease renewed");
        Ok(stored)
    }

    /// Clears the holder. The record itself is kept.
    pub async fn release(&self) -> Result<(), LeaseError> {
        let record = self
            .read()
            .await?
            .ok_or_else(|| LeaseError::NotFound { lease: self.name.clone() })?;
        let previous = record.holder_identity.clone();
        let next = LeaseRecord { holder_identity: String::new(), ..record };
        self.store("", next).await?;
        info!(self.log, "lease released"; "previous_holder" => previous);
        Ok(())
    }

    /// The current holder, or an empty string if there is none (or no
    /// record at all). Expiry is not taken into account.
    pub async fn holder(&self) -> Result<String, LeaseError> {
        Ok(self
            .read()
            .await?
            .map(|record| record.holder_identity)
            .unwrap_or_default())
    }

    /// The stored record, if any.
    pub async fn read(&self) -> Result<Option<LeaseRecord>, LeaseError> {
        self.backend.get(&self.name).await.map_err(|err| self.backend_error(err))
    }

    async fn store(
        &self,
        holder: &str,
        record: LeaseRecord,
    ) -> Result<LeaseRecord, LeaseError> {
        match self.backend.update(&self.name, record).await {
            Ok(stored) => Ok(stored),
            Err(BackendError::Conflict) => Err(self.lost_race(holder).await),
            Err(BackendError::NotFound) => {
                Err(LeaseError::NotFound { lease: self.name.clone() })
            }
            Err(err) => Err(self.backend_error(err)),
        }
    }

    /// Builds the error for a write that lost a race with another writer,
    /// naming whoever holds the lease now.
    async fn lost_race(&self, attempted_by: &str) -> LeaseError {
        match self.read().await {
            Ok(Some(record)) => {
                debug!(
                    self.log,
                    "lost lease write race";
                    "attempted_by" => attempted_by,
                    "holder" => &record.holder_identity,
                );
                self.contention(&record)
            }
            Ok(None) => LeaseError::NotFound { lease: self.name.clone() },
            Err(err) => err,
        }
    }

    fn contention(&self, record: &LeaseRecord) -> LeaseError {
        LeaseError::Contention {
            lease: self.name.clone(),
            holder: record.holder_identity.clone(),
            expires_at: record.expires_at(),
        }
    }

    fn backend_error(&self, err: BackendError) -> LeaseError {
        LeaseError::Backend { lease: self.name.clone(), err }
    }
}
