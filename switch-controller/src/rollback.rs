// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Undoing a switch that got as far as resuming the new role.
//!
//! Rollback mirrors the forward path: pause `new`, wait for it, resume `old`,
//! wait for it, then put every record back the way it was. Each step runs
//! regardless of whether the previous one worked; a failed step is logged and
//! makes the rollback unclean but never stops it.

use crate::switch::{RollbackReason, SwitchController, SwitchFleet, SwitchOutcome};
use cutover_types::{LifecycleCommand, LifecycleState};
use display_error_chain::DisplayErrorChain;
use slog::{error, info, warn, Logger};

impl SwitchController {
    pub(crate) async fn rollback(
        &self,
        log: &Logger,
        fleet: &SwitchFleet<'_>,
        reason: RollbackReason,
    ) -> SwitchOutcome {
        let SwitchFleet { old, new, old_endpoints, new_endpoints, holder } =
            fleet;
        warn!(
            log,
            "rolling back switch";
            "reason" => ?reason,
            "restoring" => %old,
            "pausing" => %new,
        );
        let mut clean = true;

        if let Err(error) =
            self.prober.broadcast(new_endpoints, LifecycleCommand::Pause).await
        {
            error!(
                log,
                "rollback: failed to pause new role";
                "role" => %new,
                "failed" => error.failed_count(),
                "endpoints" => error.total,
            );
            clean = false;
        }

        if let Err(error) = self
            .wait_for(
                new_endpoints,
                LifecycleState::Paused,
                self.config.drain_timeout_secs,
            )
            .await
        {
            error!(
                log,
                "rollback: new role did not pause";
                "role" => %new,
                "error" => %DisplayErrorChain::new(&error),
            );
            clean = false;
        }

        if let Err(error) =
            self.prober.broadcast(old_endpoints, LifecycleCommand::Resume).await
        {
            error!(
                log,
                "rollback: failed to resume old role";
                "role" => %old,
                "failed" => error.failed_count(),
                "endpoints" => error.total,
            );
            clean = false;
        }

        if let Err(error) = self
            .wait_for(
                old_endpoints,
                LifecycleState::Active,
                self.config.activation_timeout_secs,
            )
            .await
        {
            error!(
                log,
                "rollback: old role did not become active";
                "role" => %old,
                "error" => %DisplayErrorChain::new(&error),
            );
            clean = false;
        }

        // The operator's write of `new` is reverted. The resulting change
        // event names the role the run loop already considers active, so it
        // does not start another switch.
        if let Err(error) = self.active.write(old).await {
            error!(
                log,
                "rollback: failed to restore active role";
                "role" => %old,
                "error" => format!("{error:#}"),
            );
            clean = false;
        }

        clean &= self.restore_intent(log, old, new).await;

        // Sidecars were already told the forward state in step 7.
        self.push_desired_states(
            log,
            &[
                (old_endpoints, LifecycleState::Active),
                (new_endpoints, LifecycleState::Paused),
            ],
        )
        .await;

        if let Err(error) = self.lease.transfer(holder, old.as_str()).await {
            error!(
                log,
                "rollback: failed to hand switch lease back to old role";
                "error" => %DisplayErrorChain::new(&error),
            );
            clean = false;
        }
        clean &= self.release_lease(log).await;

        self.stats.record_rollback(old);
        info!(log, "rollback completed"; "active" => %old, "clean" => clean);
        SwitchOutcome::RolledBack { reason, clean }
    }
}
