// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The durable switch intent record.
//!
//! The record holds one entry per worker, keyed `<prefix>-<role>-<suffix>`,
//! whose value is the serialized [`DesiredState`] for that worker. Sidecars
//! fall back to it when they have not received a push, so it is written
//! before any worker is commanded.

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use cutover_common::backoff::{fixed_delay_policy, retry_notify, BackoffError};
use cutover_types::{DesiredState, LifecycleState, RoleName};
use display_error_chain::DisplayErrorChain;
use slog::{info, o, warn, Logger};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum IntentError {
    #[error("intent key {0:?} is not a valid file name")]
    InvalidKey(String),
    #[error("I/O error on {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("intent store unavailable: {0}")]
    Unavailable(String),
}

/// Storage for the intent record's entries.
#[async_trait]
pub trait IntentStore: Send + Sync {
    /// Reads every entry.
    async fn load(&self) -> Result<BTreeMap<String, String>, IntentError>;

    /// Writes the given entries, leaving all others alone.
    async fn store(
        &self,
        entries: &BTreeMap<String, String>,
    ) -> Result<(), IntentError>;
}

/// An intent record kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryIntentStore {
    entries: Mutex<BTreeMap<String, String>>,
    failures_left: AtomicUsize,
}

impl InMemoryIntentStore {
    pub fn new() -> InMemoryIntentStore {
        InMemoryIntentStore::default()
    }

    pub fn with_entries<I, K, V>(entries: I) -> InMemoryIntentStore
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let entries =
            entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        InMemoryIntentStore {
            entries: Mutex::new(entries),
            failures_left: AtomicUsize::new(0),
        }
    }

    /// Makes the next `count` calls to [`IntentStore::store`] fail.
    pub fn fail_next_stores(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.lock().map(|entries| entries.clone()).unwrap_or_default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>, IntentError>
    {
        self.entries
            .lock()
            .map_err(|_| IntentError::Unavailable("lock poisoned".to_string()))
    }
}

#[async_trait]
impl IntentStore for InMemoryIntentStore {
    async fn load(&self) -> Result<BTreeMap<String, String>, IntentError> {
        Ok(self.lock()?.clone())
    }

    async fn store(
        &self,
        entries: &BTreeMap<String, String>,
    ) -> Result<(), IntentError> {
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            })
            .is_ok();
        if fail {
            return Err(IntentError::Unavailable("injected failure".to_string()));
        }
        let mut stored = self.lock()?;
        for (key, value) in entries {
            stored.insert(key.clone(), value.clone());
        }
        Ok(())
    }
}

/// An intent record backed by a directory: each file name is a worker key
/// and each file body is that worker's desired state.
///
/// This is the layout a sidecar's fallback reads, so sharing the directory
/// between the controller and the sidecars delivers the intent to them.
#[derive(Clone, Debug)]
pub struct DirectoryIntentStore {
    dir: Utf8PathBuf,
}

impl DirectoryIntentStore {
    pub fn new(dir: impl Into<Utf8PathBuf>) -> DirectoryIntentStore {
        DirectoryIntentStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> Result<Utf8PathBuf, IntentError> {
        if key.is_empty()
            || key.starts_with('.')
            || key.contains('/')
            || key.contains('\0')
        {
            return Err(IntentError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(key))
    }
}

fn io_error(path: &Utf8Path) -> impl FnOnce(std::io::Error) -> IntentError + '_ {
    move |err| IntentError::Io { path: path.to_owned(), err }
}

#[async_trait]
impl IntentStore for DirectoryIntentStore {
    async fn load(&self) -> Result<BTreeMap<String, String>, IntentError> {
        let mut entries = BTreeMap::new();
        let mut dir =
            tokio::fs::read_dir(&self.dir).await.map_err(io_error(&self.dir))?;
        while let Some(entry) =
            dir.next_entry().await.map_err(io_error(&self.dir))?
        {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            // Hidden files are in-progress writes.
            if name.starts_with('.') {
                continue;
            }
            let path = self.dir.join(&name);
            let file_type =
                entry.file_type().await.map_err(io_error(&path))?;
            if !file_type.is_file() {
                continue;
            }
            let body =
                tokio::fs::read_to_string(&path).await.map_err(io_error(&path))?;
            entries.insert(name, body);
        }
        Ok(entries)
    }

    async fn store(
        &self,
        entries: &BTreeMap<String, String>,
    ) -> Result<(), IntentError> {
        for (key, value) in entries {
            let path = self.entry_path(key)?;
            let tmp = self.dir.join(format!(".{key}.tmp"));
            tokio::fs::write(&tmp, value).await.map_err(io_error(&tmp))?;
            tokio::fs::rename(&tmp, &path).await.map_err(io_error(&path))?;
        }
        Ok(())
    }
}

/// The key prefix shared by every worker of `role`.
pub fn role_key_prefix(prefix: &str, role: &RoleName) -> String {
    format!("{prefix}-{role}-")
}

/// Writes per-role lifecycle intent to an [`IntentStore`] with a bounded,
/// fixed-delay retry.
#[derive(Clone)]
pub struct IntentWriter {
    store: Arc<dyn IntentStore>,
    prefix: String,
    retries: usize,
    retry_delay: Duration,
    log: Logger,
}

impl IntentWriter {
    pub fn new(
        log: &Logger,
        store: Arc<dyn IntentStore>,
        prefix: impl Into<String>,
        retries: usize,
        retry_delay: Duration,
    ) -> IntentWriter {
        IntentWriter {
            store,
            prefix: prefix.into(),
            retries,
            retry_delay,
            log: log.new(o!("component" => "IntentWriter")),
        }
    }

    /// Sets every existing entry belonging to one of `targets`' roles to that
    /// role's lifecycle state. Returns the number of entries written.
    ///
    /// The whole read-modify-write is attempted once and then retried up to
    /// the configured number of times.
    pub async fn persist(
        &self,
        targets: &[(&RoleName, LifecycleState)],
    ) -> Result<usize, IntentError> {
        let prefixes: Vec<_> = targets
            .iter()
            .map(|(role, state)| {
                (role_key_prefix(&self.prefix, role), DesiredState::new(*state))
            })
            .collect();

        let store = &self.store;
        let prefixes = &prefixes;
        let written = retry_notify(
            fixed_delay_policy(self.retry_delay, self.retries),
            || async move {
                let entries =
                    store.load().await.map_err(BackoffError::transient)?;
                let updates: BTreeMap<_, _> = entries
                    .into_keys()
                    .filter_map(|key| {
                        let (_, desired) =
                            prefixes.iter().find(|(p, _)| key.starts_with(p))?;
                        Some((key, desired.to_json()))
                    })
                    .collect();
                store.store(&updates).await.map_err(BackoffError::transient)?;
                Ok::<_, BackoffError<IntentError>>(updates.len())
            },
            |error: IntentError, delay: Duration| {
                warn!(
                    self.log,
                    "failed to write switch intent, will retry";
                    "retry_in" => ?delay,
                    "error" => %DisplayErrorChain::new(&error),
                );
            },
        )
        .await?;

        let summary = targets
            .iter()
            .map(|(role, state)| format!("{role}={state}"))
            .collect::<Vec<_>>()
            .join(",");
        info!(
            self.log,
            "switch intent written";
            "targets" => summary,
            "entries" => written,
        );
        Ok(written)
    }

    /// Creates any of `keys` that does not exist yet: `ACTIVE` for keys of
    /// the `active` role and `PAUSED` for everything else.
    pub async fn seed(
        &self,
        keys: &[String],
        active: &RoleName,
    ) -> Result<usize, IntentError> {
        let existing = self.store.load().await?;
        let active_prefix = role_key_prefix(&self.prefix, active);
        let missing: BTreeMap<_, _> = keys
            .iter()
            .filter(|key| !existing.contains_key(*key))
            .map(|key| {
                let state = if key.starts_with(&active_prefix) {
                    LifecycleState::Active
                } else {
                    LifecycleState::Paused
                };
                (key.clone(), DesiredState::new(state).to_json())
            })
            .collect();
        self.store.store(&missing).await?;
        if !missing.is_empty() {
            info!(self.log, "seeded intent record"; "entries" => missing.len());
        }
        Ok(missing.len())
    }
}
