// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Storage for lease records.

use crate::LeaseRecord;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("lease record already exists")]
    AlreadyExists,
    #[error("lease record was modified concurrently")]
    Conflict,
    #[error("lease record not found")]
    NotFound,
    #[error("lease backend unavailable: {0}")]
    Unavailable(String),
}

/// Get/create/update of named lease records with optimistic concurrency.
#[async_trait]
pub trait LeaseBackend: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<LeaseRecord>, BackendError>;

    /// Stores a new record, failing with [`BackendError::AlreadyExists`] if
    /// one is present. Returns the record as stored.
    async fn create(
        &self,
        name: &str,
        record: LeaseRecord,
    ) -> Result<LeaseRecord, BackendError>;

    /// Replaces the record if its `resource_version` still matches the
    /// stored one, failing with [`BackendError::Conflict`] otherwise.
    /// Returns the record as stored.
    async fn update(
        &self,
        name: &str,
        record: LeaseRecord,
    ) -> Result<LeaseRecord, BackendError>;
}

/// A [`LeaseBackend`] that keeps records in process memory.
#[derive(Debug, Default)]
pub struct InMemoryLeaseBackend {
    records: Mutex<BTreeMap<String, LeaseRecord>>,
}

impl InMemoryLeaseBackend {
    pub fn new() -> InMemoryLeaseBackend {
        InMemoryLeaseBackend::default()
    }

    fn records(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, LeaseRecord>>, BackendError>
    {
        self.records
            .lock()
            .map_err(|_| BackendError::Unavailable("lock poisoned".to_string()))
    }
}

#[async_trait]
impl LeaseBackend for InMemoryLeaseBackend {
    async fn get(&self, name: &str) -> Result<Option<LeaseRecord>, BackendError> {
        Ok(self.records()?.get(name).cloned())
    }

    async fn create(
        &self,
        name: &str,
        mut record: LeaseRecord,
    ) -> Result<LeaseRecord, BackendError> {
        let mut records = self.records()?;
        if records.contains_key(name) {
            return Err(BackendError::AlreadyExists);
        }
        record.resource_version = 1;
        records.insert(name.to_string(), record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        name: &str,
        mut record: LeaseRecord,
    ) -> Result<LeaseRecord, BackendError> {
        let mut records = self.records()?;
        let stored = records.get_mut(name).ok_or(BackendError::NotFound)?;
        if stored.resource_version != record.resource_version {
            return Err(BackendError::Conflict);
        }
        record.resource_version += 1;
        *stored = record.clone();
        Ok(record)
    }
}
