// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The watched active-role record and change notifications on it.

use async_trait::async_trait;
use cutover_types::RoleName;
use tokio::sync::watch;

/// Storage for the record naming the active role.
#[async_trait]
pub trait ActiveRoleStore: Send + Sync {
    async fn read(&self) -> anyhow::Result<Option<RoleName>>;
    async fn write(&self, active: &RoleName) -> anyhow::Result<()>;
}

/// One observed change of the active-role record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoleChange {
    pub previous: Option<RoleName>,
    pub current: Option<RoleName>,
}

/// A stream of changes to the active-role record.
#[async_trait]
pub trait RoleChangeSubscription: Send {
    /// Waits for the next change. `None` means the subscription is closed
    /// and no further changes will be delivered.
    async fn next_change(&mut self) -> Option<RoleChange>;
}

/// An active-role record kept in process memory.
///
/// Writes are observed by every [`WatchSubscription`]. Writes that land
/// faster than a subscriber consumes them coalesce: the subscriber sees one
/// change from the value it last saw to the latest value.
#[derive(Debug)]
pub struct InMemoryActiveRole {
    tx: watch::Sender<Option<RoleName>>,
}

impl InMemoryActiveRole {
    pub fn new(initial: Option<RoleName>) -> InMemoryActiveRole {
        let (tx, _) = watch::channel(initial);
        InMemoryActiveRole { tx }
    }

    pub fn get(&self) -> Option<RoleName> {
        self.tx.borrow().clone()
    }

    pub fn set(&self, active: RoleName) {
        self.tx.send_replace(Some(active));
    }

    pub fn subscribe(&self) -> WatchSubscription {
        let rx = self.tx.subscribe();
        let last = rx.borrow().clone();
        WatchSubscription { rx, last }
    }
}

#[async_trait]
impl ActiveRoleStore for InMemoryActiveRole {
    async fn read(&self) -> anyhow::Result<Option<RoleName>> {
        Ok(self.get())
    }

    async fn write(&self, active: &RoleName) -> anyhow::Result<()> {
        self.set(active.clone());
        Ok(())
    }
}

/// Change notifications from an [`InMemoryActiveRole`]. Writes that do not
/// change the value are not reported.
#[derive(Debug)]
pub struct WatchSubscription {
    rx: watch::Receiver<Option<RoleName>>,
    last: Option<RoleName>,
}

#[async_trait]
impl RoleChangeSubscription for WatchSubscription {
    async fn next_change(&mut self) -> Option<RoleChange> {
        loop {
            self.rx.changed().await.ok()?;
            let current = self.rx.borrow_and_update().clone();
            if current != self.last {
                let previous = std::mem::replace(&mut self.last, current.clone());
                return Some(RoleChange { previous, current });
            }
        }
    }
}
