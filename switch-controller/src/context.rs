// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::records::InMemoryActiveRole;
use crate::stats::SwitchStats;
use cutover_types::RoleName;
use slog::Logger;
use std::collections::BTreeSet;
use std::sync::Arc;

pub struct ServerContext {
    active: Arc<InMemoryActiveRole>,
    stats: Arc<SwitchStats>,
    roles: BTreeSet<RoleName>,
    log: Logger,
}

impl ServerContext {
    pub fn new(
        active: Arc<InMemoryActiveRole>,
        stats: Arc<SwitchStats>,
        roles: BTreeSet<RoleName>,
        log: Logger,
    ) -> Self {
        Self { active, stats, roles, log }
    }

    pub fn active(&self) -> &InMemoryActiveRole {
        &self.active
    }

    pub fn stats(&self) -> &SwitchStats {
        &self.stats
    }

    pub fn is_known_role(&self, role: &RoleName) -> bool {
        self.roles.contains(role)
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }
}
