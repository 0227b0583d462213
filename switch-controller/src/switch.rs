// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The switch protocol.
//!
//! A switch from `old` to `new` pauses every worker of `old` before resuming
//! any worker of `new` ("pause first, resume second"), so that at most one
//! role consumes at a time. The steps are:
//!
//! 1. write the intent record (old paused, new active), with retries
//! 2. take the switch lease as `switch-<old>-to-<new>`
//! 3. resolve both roles' endpoints
//! 4. pause the `old` workers not already reporting `PAUSED`
//! 5. wait for `old` to report `PAUSED`
//! 6. resume the `new` workers not already reporting `ACTIVE`
//! 7. push the final desired state to every sidecar (best-effort)
//! 8. wait for `new` to report `ACTIVE`
//! 9. check that no `old` worker is still `ACTIVE`
//! 10. hand the lease to `new`, release it, and record the result
//!
//! Nothing has touched a worker until step 4, so failures before it simply
//! abort. A failure in step 4 or 5 resumes `old` and aborts. Any failure from
//! step 6 on rolls the whole switch back (see `rollback.rs`).
//!
//! Re-running a switch that already committed sends no lifecycle commands:
//! steps 4 and 6 find every worker in its target state, and both waits
//! succeed on their first poll.

use crate::config::SwitchConfig;
use crate::intent::IntentWriter;
use crate::records::{ActiveRoleStore, RoleChange, RoleChangeSubscription};
use crate::resolver::EndpointResolver;
use crate::stats::SwitchStats;
use cutover_fleet_prober::FleetProber;
use cutover_lease::LeaseClient;
use cutover_types::{
    DesiredState, LifecycleCommand, LifecycleState, RoleName, WorkerEndpoint,
};
use display_error_chain::DisplayErrorChain;
use slog::{crit, debug, error, info, o, warn, Logger};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a switch stopped before any worker of the new role was resumed. The
/// old role is left (or put back) in charge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortReason {
    IntentNotPersisted,
    LeaseUnavailable,
    EndpointsUnresolved,
    PauseFailed,
    DrainTimedOut,
}

/// Why a switch was rolled back after the new role was (partially) resumed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RollbackReason {
    ResumeFailed,
    ActivationTimedOut,
    DualActive,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SwitchOutcome {
    Committed {
        duration: Duration,
    },
    /// No worker of `new` was resumed. Once the intent record has been
    /// written (every reason except `IntentNotPersisted` and
    /// `LeaseUnavailable`), it is restored to name `old` as active so that it
    /// agrees with the fleet again; under `LeaseUnavailable` the intent
    /// belongs to the lease holder's switch and is left alone.
    Aborted {
        reason: AbortReason,
    },
    /// `clean` is false if any rollback step failed.
    RolledBack {
        reason: RollbackReason,
        clean: bool,
    },
}

/// Lease holder identity used while a switch is in flight.
pub fn switch_holder(old: &RoleName, new: &RoleName) -> String {
    format!("switch-{old}-to-{new}")
}

/// Endpoints of both roles taking part in a switch.
pub(crate) struct SwitchFleet<'a> {
    pub old: &'a RoleName,
    pub new: &'a RoleName,
    pub old_endpoints: Vec<WorkerEndpoint>,
    pub new_endpoints: Vec<WorkerEndpoint>,
    pub holder: String,
}

pub struct SwitchController {
    pub(crate) log: Logger,
    pub(crate) config: SwitchConfig,
    pub(crate) prober: FleetProber,
    pub(crate) push_prober: FleetProber,
    pub(crate) lease: LeaseClient,
    pub(crate) intent: IntentWriter,
    pub(crate) resolver: Arc<dyn EndpointResolver>,
    pub(crate) active: Arc<dyn ActiveRoleStore>,
    pub(crate) stats: Arc<SwitchStats>,
    pub(crate) cancel: CancellationToken,
}

impl SwitchController {
    pub fn new(
        log: &Logger,
        config: SwitchConfig,
        lease: LeaseClient,
        intent: IntentWriter,
        resolver: Arc<dyn EndpointResolver>,
        active: Arc<dyn ActiveRoleStore>,
    ) -> Result<SwitchController, reqwest::Error> {
        let log = log.new(o!("component" => "SwitchController"));
        let prober = FleetProber::new(
            &log,
            config.request_timeout_secs,
            config.max_concurrency,
        )?;
        let push_prober = FleetProber::new(
            &log,
            config.push_timeout_secs,
            config.max_concurrency,
        )?;
        Ok(SwitchController {
            log,
            config,
            prober,
            push_prober,
            lease,
            intent,
            resolver,
            active,
            stats: Arc::new(SwitchStats::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn stats(&self) -> Arc<SwitchStats> {
        Arc::clone(&self.stats)
    }

    /// Token that stops [`SwitchController::run`] and cuts short any wait in
    /// progress.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Processes active-role changes one at a time until cancelled or until
    /// `subscription` closes.
    pub async fn run<S: RoleChangeSubscription>(&self, mut subscription: S) {
        let mut last_active = match self.active.read().await {
            Ok(active) => active,
            Err(error) => {
                warn!(
                    self.log,
                    "failed to read initial active role";
                    "error" => format!("{error:#}"),
                );
                None
            }
        };
        if let Some(active) = &last_active {
            info!(self.log, "initialized active role"; "active" => %active);
            self.stats.set_active(active);
        }

        loop {
            let change = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!(self.log, "switch controller stopping");
                    return;
                }
                change = subscription.next_change() => change,
            };
            let Some(change) = change else {
                info!(self.log, "active role subscription closed");
                return;
            };
            last_active = self.handle_change(change, last_active).await;
        }
    }

    /// Reacts to one change event and returns the new last known active
    /// role.
    async fn handle_change(
        &self,
        change: RoleChange,
        last_active: Option<RoleName>,
    ) -> Option<RoleName> {
        let RoleChange { previous, current } = change;
        let Some(current) = current else {
            warn!(self.log, "active role record cleared; ignoring");
            return last_active;
        };
        if last_active.as_ref() == Some(&current) {
            debug!(
                self.log,
                "active role already in effect; nothing to do";
                "active" => %current,
            );
            return last_active;
        }
        let Some(previous) = previous else {
            info!(self.log, "active role set"; "active" => %current);
            self.stats.set_active(&current);
            return Some(current);
        };

        info!(self.log, "active role changed"; "from" => %previous, "to" => %current);
        match self.handle_switch(&previous, &current).await {
            SwitchOutcome::Committed { .. } => Some(current),
            SwitchOutcome::RolledBack { .. } => Some(previous),
            SwitchOutcome::Aborted { .. } => last_active,
        }
    }

    /// Switches the fleet from `old` to `new`.
    pub async fn handle_switch(
        &self,
        old: &RoleName,
        new: &RoleName,
    ) -> SwitchOutcome {
        let start = Instant::now();
        self.stats.record_attempt();
        let log = self.log.new(o!(
            "from" => old.to_string(),
            "to" => new.to_string(),
        ));
        info!(log, "starting switch");

        // Step 1: the intent record must name the target state of every
        // worker before any of them is told to change.
        if let Err(error) = self
            .intent
            .persist(&[(old, LifecycleState::Paused), (new, LifecycleState::Active)])
            .await
        {
            error!(
                log,
                "failed to write switch intent, aborting switch";
                "error" => %DisplayErrorChain::new(&error),
            );
            return self.aborted(&log, AbortReason::IntentNotPersisted);
        }

        // Step 2
        let holder = switch_holder(old, new);
        if let Err(error) = self.lease.acquire(&holder).await {
            error!(
                log,
                "failed to acquire switch lease, aborting switch";
                "error" => %DisplayErrorChain::new(&error),
            );
            return self.aborted(&log, AbortReason::LeaseUnavailable);
        }

        // Step 3
        let (old_endpoints, new_endpoints) =
            match self.resolve_both(old, new).await {
                Ok(endpoints) => endpoints,
                Err(error) => {
                    error!(
                        log,
                        "failed to resolve endpoints, aborting switch";
                        "error" => %DisplayErrorChain::new(&error),
                    );
                    self.restore_intent(&log, old, new).await;
                    self.release_lease(&log).await;
                    return self.aborted(&log, AbortReason::EndpointsUnresolved);
                }
            };
        info!(
            log,
            "resolved endpoints";
            "old_endpoints" => old_endpoints.len(),
            "new_endpoints" => new_endpoints.len(),
        );
        let fleet =
            SwitchFleet { old, new, old_endpoints, new_endpoints, holder };

        // Step 4
        let to_pause =
            self.not_yet_in(&fleet.old_endpoints, LifecycleState::Paused).await;
        info!(
            log,
            "pausing old role";
            "role" => %old,
            "endpoints" => to_pause.len(),
            "already_paused" => fleet.old_endpoints.len() - to_pause.len(),
        );
        if let Err(error) =
            self.prober.broadcast(&to_pause, LifecycleCommand::Pause).await
        {
            error!(
                log,
                "failed to pause old role, aborting switch";
                "role" => %old,
                "failed" => error.failed_count(),
                "endpoints" => error.total,
                "error" => %DisplayErrorChain::new(&error),
            );
            self.resume_and_abort(&log, &fleet).await;
            return self.aborted(&log, AbortReason::PauseFailed);
        }

        // Step 5
        info!(
            log,
            "waiting for old role to pause";
            "role" => %old,
            "timeout" => ?self.config.drain_timeout_secs,
        );
        if let Err(error) = self
            .wait_for(&fleet.old_endpoints, LifecycleState::Paused, self.config.drain_timeout_secs)
            .await
        {
            error!(
                log,
                "old role did not pause, aborting switch";
                "role" => %old,
                "endpoints" => fleet.old_endpoints.len(),
                "error" => %DisplayErrorChain::new(&error),
            );
            self.resume_and_abort(&log, &fleet).await;
            return self.aborted(&log, AbortReason::DrainTimedOut);
        }

        // Step 6
        let to_resume =
            self.not_yet_in(&fleet.new_endpoints, LifecycleState::Active).await;
        info!(
            log,
            "resuming new role";
            "role" => %new,
            "endpoints" => to_resume.len(),
            "already_active" => fleet.new_endpoints.len() - to_resume.len(),
        );
        if let Err(error) =
            self.prober.broadcast(&to_resume, LifecycleCommand::Resume).await
        {
            error!(
                log,
                "failed to resume new role, rolling back";
                "role" => %new,
                "failed" => error.failed_count(),
                "endpoints" => error.total,
                "error" => %DisplayErrorChain::new(&error),
            );
            return self.rollback(&log, &fleet, RollbackReason::ResumeFailed).await;
        }

        // Step 7
        self.push_desired_states(
            &log,
            &[
                (&fleet.old_endpoints, LifecycleState::Paused),
                (&fleet.new_endpoints, LifecycleState::Active),
            ],
        )
        .await;

        // Step 8
        info!(log, "waiting for new role to become active"; "role" => %new);
        if let Err(error) = self
            .wait_for(
                &fleet.new_endpoints,
                LifecycleState::Active,
                self.config.activation_timeout_secs,
            )
            .await
        {
            error!(
                log,
                "new role did not become active, rolling back";
                "role" => %new,
                "endpoints" => fleet.new_endpoints.len(),
                "error" => %DisplayErrorChain::new(&error),
            );
            return self
                .rollback(&log, &fleet, RollbackReason::ActivationTimedOut)
                .await;
        }

        // Step 9
        if self.dual_active(&fleet).await {
            crit!(
                log,
                "DUAL ACTIVE DETECTED: workers of both roles are active";
                "old_endpoints" => fleet.old_endpoints.len(),
                "new_endpoints" => fleet.new_endpoints.len(),
            );
            self.stats.record_dual_active();
            return self.rollback(&log, &fleet, RollbackReason::DualActive).await;
        }

        // Step 10
        if let Err(error) =
            self.lease.transfer(&fleet.holder, new.as_str()).await
        {
            warn!(
                log,
                "failed to hand switch lease to new role";
                "error" => %DisplayErrorChain::new(&error),
            );
        }
        self.release_lease(&log).await;

        let duration = start.elapsed();
        self.stats.record_success(duration, new);
        info!(log, "switch completed"; "duration" => ?duration);
        SwitchOutcome::Committed { duration }
    }

    async fn resolve_both(
        &self,
        old: &RoleName,
        new: &RoleName,
    ) -> Result<
        (Vec<WorkerEndpoint>, Vec<WorkerEndpoint>),
        crate::resolver::ResolveError,
    > {
        let old_endpoints = self.resolver.resolve(old).await?;
        let new_endpoints = self.resolver.resolve(new).await?;
        Ok((old_endpoints, new_endpoints))
    }

    pub(crate) async fn wait_for(
        &self,
        endpoints: &[WorkerEndpoint],
        target: LifecycleState,
        timeout: Duration,
    ) -> Result<(), cutover_fleet_prober::WaitError> {
        self.prober
            .wait_until(
                endpoints,
                target,
                timeout,
                self.config.health_check_interval_ms,
                &self.cancel,
            )
            .await
    }

    /// The endpoints that do not currently report `target`, including any
    /// that could not be probed.
    async fn not_yet_in(
        &self,
        endpoints: &[WorkerEndpoint],
        target: LifecycleState,
    ) -> Vec<WorkerEndpoint> {
        let report = self.prober.probe(endpoints).await;
        endpoints
            .iter()
            .filter(|ep| report.states.get(*ep) != Some(&target))
            .cloned()
            .collect()
    }

    /// Whether any worker of each role reports `ACTIVE`.
    async fn dual_active(&self, fleet: &SwitchFleet<'_>) -> bool {
        let (old, new) = tokio::join!(
            self.prober.probe(&fleet.old_endpoints),
            self.prober.probe(&fleet.new_endpoints),
        );
        old.any_in(LifecycleState::Active) && new.any_in(LifecycleState::Active)
    }

    /// Pushes each group's desired state to the sidecars next to its
    /// workers. Failures are logged and otherwise ignored.
    pub(crate) async fn push_desired_states(
        &self,
        log: &Logger,
        groups: &[(&Vec<WorkerEndpoint>, LifecycleState)],
    ) {
        for (endpoints, lifecycle) in groups {
            let sidecars: Vec<_> =
                endpoints.iter().map(|ep| self.sidecar_endpoint(ep)).collect();
            let desired = DesiredState::new(*lifecycle);
            match self.push_prober.push_desired_state(&sidecars, &desired).await
            {
                Ok(()) => debug!(
                    log,
                    "pushed desired state to sidecars";
                    "lifecycle" => %lifecycle,
                    "sidecars" => sidecars.len(),
                ),
                Err(error) => warn!(
                    log,
                    "desired state push failed (best-effort)";
                    "lifecycle" => %lifecycle,
                    "failed" => error.failed_count(),
                    "sidecars" => error.total,
                ),
            }
        }
    }

    /// The sidecar that sits next to the worker at `endpoint`: the same host
    /// on the sidecar port, if `endpoint` uses the lifecycle port.
    pub(crate) fn sidecar_endpoint(
        &self,
        endpoint: &WorkerEndpoint,
    ) -> WorkerEndpoint {
        if endpoint.port() == self.config.lifecycle_port {
            endpoint.with_port(self.config.sidecar_port)
        } else {
            endpoint.clone()
        }
    }

    /// Puts the old role back in charge after a failed pause or drain.
    async fn resume_and_abort(&self, log: &Logger, fleet: &SwitchFleet<'_>) {
        info!(log, "aborting switch, resuming old role"; "role" => %fleet.old);
        if let Err(error) = self
            .prober
            .broadcast(&fleet.old_endpoints, LifecycleCommand::Resume)
            .await
        {
            error!(
                log,
                "failed to resume old role during abort";
                "role" => %fleet.old,
                "failed" => error.failed_count(),
                "endpoints" => error.total,
            );
        }
        self.restore_intent(log, fleet.old, fleet.new).await;
        self.release_lease(log).await;
    }

    /// Points the intent record back at `old`, undoing step 1.
    pub(crate) async fn restore_intent(
        &self,
        log: &Logger,
        old: &RoleName,
        new: &RoleName,
    ) -> bool {
        match self
            .intent
            .persist(&[
                (old, LifecycleState::Active),
                (new, LifecycleState::Paused),
            ])
            .await
        {
            Ok(_) => true,
            Err(error) => {
                error!(
                    log,
                    "failed to restore switch intent";
                    "role" => %old,
                    "error" => %DisplayErrorChain::new(&error),
                );
                false
            }
        }
    }

    pub(crate) async fn release_lease(&self, log: &Logger) -> bool {
        match self.lease.release().await {
            Ok(()) => true,
            Err(error) => {
                error!(
                    log,
                    "failed to release switch lease";
                    "error" => %DisplayErrorChain::new(&error),
                );
                false
            }
        }
    }

    fn aborted(&self, log: &Logger, reason: AbortReason) -> SwitchOutcome {
        self.stats.record_abort();
        warn!(log, "switch aborted"; "reason" => ?reason);
        SwitchOutcome::Aborted { reason }
    }
}
