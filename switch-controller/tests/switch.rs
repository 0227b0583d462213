// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end tests of the switch protocol against simulated workers.

use assert_matches::assert_matches;
use cutover_lease::{InMemoryLeaseBackend, LeaseClient};
use cutover_switch_controller::intent::{InMemoryIntentStore, IntentWriter};
use cutover_switch_controller::records::InMemoryActiveRole;
use cutover_switch_controller::resolver::StaticResolver;
use cutover_switch_controller::{
    switch_holder, AbortReason, RoleConfig, RollbackReason, SwitchConfig,
    SwitchController, SwitchOutcome,
};
use cutover_test_utils::dev::poll::{wait_for_condition, CondCheckError};
use cutover_test_utils::dev::test_setup_log;
use cutover_test_utils::SimWorker;
use cutover_types::{DesiredState, LifecycleCommand, LifecycleState, RoleName};
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const LEASE_NAME: &str = "consumer-switch";

fn role(name: &str) -> RoleName {
    RoleName::new(name).unwrap()
}

fn test_config() -> SwitchConfig {
    SwitchConfig {
        drain_timeout_secs: Duration::from_secs(1),
        activation_timeout_secs: Duration::from_secs(1),
        health_check_interval_ms: Duration::from_millis(20),
        request_timeout_secs: Duration::from_secs(2),
        push_timeout_secs: Duration::from_secs(2),
        // The simulated workers also stand in for their sidecars, so no
        // endpoint may be rewritten onto a sidecar port.
        lifecycle_port: 1,
        sidecar_port: 2,
        max_concurrency: 4,
        intent_retries: 3,
        intent_retry_delay_ms: Duration::from_millis(1),
    }
}

fn intent_value(state: LifecycleState) -> String {
    DesiredState::new(state).to_json()
}

/// Two roles of two simulated workers each, with `blue` active, and a
/// controller wired to in-memory records.
struct TestFleet {
    blue: Vec<SimWorker>,
    green: Vec<SimWorker>,
    intent: Arc<InMemoryIntentStore>,
    lease_backend: Arc<InMemoryLeaseBackend>,
    active: Arc<InMemoryActiveRole>,
    controller: Arc<SwitchController>,
}

impl TestFleet {
    fn start(log: &Logger) -> TestFleet {
        let blue: Vec<_> = (0..2)
            .map(|_| SimWorker::start(log, LifecycleState::Active).unwrap())
            .collect();
        let green: Vec<_> = (0..2)
            .map(|_| SimWorker::start(log, LifecycleState::Paused).unwrap())
            .collect();

        let mut roles = BTreeMap::new();
        for (name, sims) in [("blue", &blue), ("green", &green)] {
            roles.insert(
                role(name),
                RoleConfig {
                    service: format!("consumer-{name}"),
                    hosts: sims
                        .iter()
                        .map(|sim| sim.endpoint().to_string())
                        .collect(),
                },
            );
        }

        let intent = Arc::new(InMemoryIntentStore::with_entries([
            ("consumer-blue-0", intent_value(LifecycleState::Active)),
            ("consumer-blue-1", intent_value(LifecycleState::Active)),
            ("consumer-green-0", intent_value(LifecycleState::Paused)),
            ("consumer-green-1", intent_value(LifecycleState::Paused)),
        ]));
        let lease_backend = Arc::new(InMemoryLeaseBackend::new());
        let active = Arc::new(InMemoryActiveRole::new(Some(role("blue"))));

        let config = test_config();
        let writer = IntentWriter::new(
            log,
            intent.clone(),
            "consumer",
            config.intent_retries,
            config.intent_retry_delay_ms,
        );
        let lease = lease_client(log, &lease_backend);
        let resolver =
            Arc::new(StaticResolver::new(roles, config.lifecycle_port));
        let controller = SwitchController::new(
            log,
            config,
            lease,
            writer,
            resolver,
            active.clone(),
        )
        .unwrap();

        TestFleet {
            blue,
            green,
            intent,
            lease_backend,
            active,
            controller: Arc::new(controller),
        }
    }

    fn states(sims: &[SimWorker]) -> Vec<LifecycleState> {
        sims.iter().map(|sim| sim.state()).collect()
    }

    fn all_commands(&self) -> Vec<LifecycleCommand> {
        self.blue
            .iter()
            .chain(self.green.iter())
            .flat_map(|sim| sim.commands())
            .collect()
    }

    fn clear_commands(&self) {
        for sim in self.blue.iter().chain(self.green.iter()) {
            sim.clear_commands();
        }
    }

    fn assert_intent(&self, blue: LifecycleState, green: LifecycleState) {
        let snapshot = self.intent.snapshot();
        assert_eq!(snapshot["consumer-blue-0"], intent_value(blue));
        assert_eq!(snapshot["consumer-blue-1"], intent_value(blue));
        assert_eq!(snapshot["consumer-green-0"], intent_value(green));
        assert_eq!(snapshot["consumer-green-1"], intent_value(green));
    }

    /// Spawns the controller's run loop and waits until it has read the
    /// initial active role, so that later writes are seen as changes.
    async fn start_run_loop(&self) -> tokio::task::JoinHandle<()> {
        let task = tokio::spawn({
            let controller = self.controller.clone();
            let subscription = self.active.subscribe();
            async move { controller.run(subscription).await }
        });
        wait_for_metric(&self.controller, |m| m.active_role.is_some()).await;
        task
    }

    async fn lease_holder(&self, log: &Logger) -> String {
        lease_client(log, &self.lease_backend).holder().await.unwrap()
    }

    async fn shutdown(self) {
        for sim in self.blue.into_iter().chain(self.green) {
            sim.shutdown().await.unwrap();
        }
    }
}

fn lease_client(
    log: &Logger,
    backend: &Arc<InMemoryLeaseBackend>,
) -> LeaseClient {
    LeaseClient::new(
        log,
        backend.clone(),
        LEASE_NAME,
        Duration::from_secs(30),
    )
}

#[tokio::test]
async fn test_switch_commits() {
    let logctx = test_setup_log("test_switch_commits");
    let log = &logctx.log;
    let fleet = TestFleet::start(log);
    fleet.blue[0].drain_polls(2);

    let outcome =
        fleet.controller.handle_switch(&role("blue"), &role("green")).await;
    assert_matches!(outcome, SwitchOutcome::Committed { .. });

    assert_eq!(TestFleet::states(&fleet.blue), vec![LifecycleState::Paused; 2]);
    assert_eq!(
        TestFleet::states(&fleet.green),
        vec![LifecycleState::Active; 2]
    );
    for sim in &fleet.blue {
        assert_eq!(sim.commands(), vec![LifecycleCommand::Pause]);
        assert_eq!(
            sim.pushes().last().and_then(|d| d.desired_lifecycle()),
            Some(LifecycleState::Paused)
        );
    }
    for sim in &fleet.green {
        assert_eq!(sim.commands(), vec![LifecycleCommand::Resume]);
        assert_eq!(
            sim.pushes().last().and_then(|d| d.desired_lifecycle()),
            Some(LifecycleState::Active)
        );
    }
    // The draining worker was polled until it finished pausing.
    assert!(fleet.blue[0].status_queries() >= 3);

    fleet.assert_intent(LifecycleState::Paused, LifecycleState::Active);
    assert_eq!(fleet.lease_holder(log).await, "");

    let metrics = fleet.controller.stats().snapshot();
    assert_eq!(metrics.switch_attempts, 1);
    assert_eq!(metrics.switch_successes, 1);
    assert_eq!(metrics.switch_aborts, 0);
    assert_eq!(metrics.switch_rollbacks, 0);
    assert_eq!(metrics.active_role, Some(role("green")));

    fleet.shutdown().await;
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_rerun_of_committed_switch_sends_nothing() {
    let logctx = test_setup_log("test_rerun_of_committed_switch_sends_nothing");
    let log = &logctx.log;
    let fleet = TestFleet::start(log);

    let outcome =
        fleet.controller.handle_switch(&role("blue"), &role("green")).await;
    assert_matches!(outcome, SwitchOutcome::Committed { .. });
    fleet.clear_commands();
    let queries_before: Vec<_> = fleet
        .blue
        .iter()
        .chain(fleet.green.iter())
        .map(|sim| sim.status_queries())
        .collect();

    let outcome =
        fleet.controller.handle_switch(&role("blue"), &role("green")).await;
    assert_matches!(outcome, SwitchOutcome::Committed { .. });
    assert!(fleet.all_commands().is_empty());

    // Each worker is queried by the check before its command, by the first
    // (and only) poll of its wait, and by the dual-active check.
    let queries_after: Vec<_> = fleet
        .blue
        .iter()
        .chain(fleet.green.iter())
        .map(|sim| sim.status_queries())
        .collect();
    for (before, after) in queries_before.iter().zip(&queries_after) {
        assert_eq!(after - before, 3);
    }

    assert_eq!(TestFleet::states(&fleet.blue), vec![LifecycleState::Paused; 2]);
    assert_eq!(
        TestFleet::states(&fleet.green),
        vec![LifecycleState::Active; 2]
    );
    fleet.assert_intent(LifecycleState::Paused, LifecycleState::Active);
    assert_eq!(fleet.lease_holder(log).await, "");
    let metrics = fleet.controller.stats().snapshot();
    assert_eq!(metrics.switch_attempts, 2);
    assert_eq!(metrics.switch_successes, 2);

    fleet.shutdown().await;
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_pause_failure_resumes_old_role() {
    let logctx = test_setup_log("test_pause_failure_resumes_old_role");
    let log = &logctx.log;
    let fleet = TestFleet::start(log);
    fleet.blue[1].reject_commands(true);

    let outcome =
        fleet.controller.handle_switch(&role("blue"), &role("green")).await;
    assert_eq!(
        outcome,
        SwitchOutcome::Aborted { reason: AbortReason::PauseFailed }
    );

    // The worker that did pause was told to resume, and nothing of the new
    // role was touched.
    assert_eq!(
        fleet.blue[0].commands(),
        vec![LifecycleCommand::Pause, LifecycleCommand::Resume]
    );
    assert_eq!(TestFleet::states(&fleet.blue), vec![LifecycleState::Active; 2]);
    for sim in &fleet.green {
        assert!(sim.commands().is_empty());
        assert_eq!(sim.state(), LifecycleState::Paused);
    }

    fleet.assert_intent(LifecycleState::Active, LifecycleState::Paused);
    assert_eq!(fleet.lease_holder(log).await, "");
    let metrics = fleet.controller.stats().snapshot();
    assert_eq!(metrics.switch_aborts, 1);
    assert_eq!(metrics.switch_successes, 0);

    fleet.shutdown().await;
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_drain_timeout_aborts() {
    let logctx = test_setup_log("test_drain_timeout_aborts");
    let log = &logctx.log;
    let fleet = TestFleet::start(log);
    fleet.blue[0].ignore_commands(true);

    let start = tokio::time::Instant::now();
    let outcome =
        fleet.controller.handle_switch(&role("blue"), &role("green")).await;
    assert_eq!(
        outcome,
        SwitchOutcome::Aborted { reason: AbortReason::DrainTimedOut }
    );
    assert!(start.elapsed() >= test_config().drain_timeout_secs);

    assert_eq!(TestFleet::states(&fleet.blue), vec![LifecycleState::Active; 2]);
    assert_eq!(
        fleet.blue[1].commands(),
        vec![LifecycleCommand::Pause, LifecycleCommand::Resume]
    );
    for sim in &fleet.green {
        assert!(sim.commands().is_empty());
    }
    fleet.assert_intent(LifecycleState::Active, LifecycleState::Paused);

    fleet.shutdown().await;
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_lease_contention_aborts_without_commands() {
    let logctx = test_setup_log("test_lease_contention_aborts_without_commands");
    let log = &logctx.log;
    let fleet = TestFleet::start(log);

    let other = switch_holder(&role("green"), &role("blue"));
    lease_client(log, &fleet.lease_backend).acquire(&other).await.unwrap();

    let outcome =
        fleet.controller.handle_switch(&role("blue"), &role("green")).await;
    assert_eq!(
        outcome,
        SwitchOutcome::Aborted { reason: AbortReason::LeaseUnavailable }
    );
    assert!(fleet.all_commands().is_empty());
    assert_eq!(fleet.lease_holder(log).await, other);
    fleet.assert_intent(LifecycleState::Active, LifecycleState::Paused);

    fleet.shutdown().await;
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_intent_failure_has_no_side_effects() {
    let logctx = test_setup_log("test_intent_failure_has_no_side_effects");
    let log = &logctx.log;
    let fleet = TestFleet::start(log);
    // one attempt plus three retries
    fleet.intent.fail_next_stores(4);

    let outcome =
        fleet.controller.handle_switch(&role("blue"), &role("green")).await;
    assert_eq!(
        outcome,
        SwitchOutcome::Aborted { reason: AbortReason::IntentNotPersisted }
    );
    assert!(fleet.all_commands().is_empty());
    assert!(fleet.blue.iter().all(|sim| sim.status_queries() == 0));
    fleet.assert_intent(LifecycleState::Active, LifecycleState::Paused);
    let record = lease_client(log, &fleet.lease_backend).read().await.unwrap();
    assert!(record.is_none());

    fleet.shutdown().await;
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_intent_retry_succeeds() {
    let logctx = test_setup_log("test_intent_retry_succeeds");
    let log = &logctx.log;
    let fleet = TestFleet::start(log);
    fleet.intent.fail_next_stores(3);

    let outcome =
        fleet.controller.handle_switch(&role("blue"), &role("green")).await;
    assert_matches!(outcome, SwitchOutcome::Committed { .. });
    fleet.assert_intent(LifecycleState::Paused, LifecycleState::Active);

    fleet.shutdown().await;
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_unknown_role_aborts() {
    let logctx = test_setup_log("test_unknown_role_aborts");
    let log = &logctx.log;
    let fleet = TestFleet::start(log);

    let outcome =
        fleet.controller.handle_switch(&role("blue"), &role("red")).await;
    assert_eq!(
        outcome,
        SwitchOutcome::Aborted { reason: AbortReason::EndpointsUnresolved }
    );
    assert!(fleet.all_commands().is_empty());
    fleet.assert_intent(LifecycleState::Active, LifecycleState::Paused);
    assert_eq!(fleet.lease_holder(log).await, "");

    fleet.shutdown().await;
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_resume_failure_rolls_back() {
    let logctx = test_setup_log("test_resume_failure_rolls_back");
    let log = &logctx.log;
    let fleet = TestFleet::start(log);
    fleet.green[0].reject_commands(true);
    // as if an operator had asked for the switch
    fleet.active.set(role("green"));

    let outcome =
        fleet.controller.handle_switch(&role("blue"), &role("green")).await;
    // The rejected worker also refuses the rollback's pause.
    assert_eq!(
        outcome,
        SwitchOutcome::RolledBack {
            reason: RollbackReason::ResumeFailed,
            clean: false,
        }
    );

    assert_eq!(TestFleet::states(&fleet.blue), vec![LifecycleState::Active; 2]);
    assert_eq!(
        TestFleet::states(&fleet.green),
        vec![LifecycleState::Paused; 2]
    );
    assert_eq!(
        fleet.green[1].commands(),
        vec![LifecycleCommand::Resume, LifecycleCommand::Pause]
    );
    for sim in &fleet.blue {
        assert_eq!(
            sim.commands(),
            vec![LifecycleCommand::Pause, LifecycleCommand::Resume]
        );
        assert_eq!(
            sim.pushes().last().and_then(|d| d.desired_lifecycle()),
            Some(LifecycleState::Active)
        );
    }

    assert_eq!(fleet.active.get(), Some(role("blue")));
    fleet.assert_intent(LifecycleState::Active, LifecycleState::Paused);
    assert_eq!(fleet.lease_holder(log).await, "");

    let metrics = fleet.controller.stats().snapshot();
    assert_eq!(metrics.switch_rollbacks, 1);
    assert_eq!(metrics.switch_successes, 0);
    assert_eq!(metrics.active_role, Some(role("blue")));

    fleet.shutdown().await;
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_activation_timeout_rolls_back() {
    let logctx = test_setup_log("test_activation_timeout_rolls_back");
    let log = &logctx.log;
    let fleet = TestFleet::start(log);
    fleet.green[1].ignore_commands(true);

    let outcome =
        fleet.controller.handle_switch(&role("blue"), &role("green")).await;
    assert_eq!(
        outcome,
        SwitchOutcome::RolledBack {
            reason: RollbackReason::ActivationTimedOut,
            clean: true,
        }
    );
    assert_eq!(TestFleet::states(&fleet.blue), vec![LifecycleState::Active; 2]);
    assert_eq!(
        TestFleet::states(&fleet.green),
        vec![LifecycleState::Paused; 2]
    );
    fleet.assert_intent(LifecycleState::Active, LifecycleState::Paused);

    fleet.shutdown().await;
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_dual_active_rolls_back() {
    let logctx = test_setup_log("test_dual_active_rolls_back");
    let log = &logctx.log;
    let fleet = TestFleet::start(log);
    // Answers the check before the pause and the drain wait, then comes back
    // on its own.
    fleet.blue[0].report_state_after(2, LifecycleState::Active);

    let outcome =
        fleet.controller.handle_switch(&role("blue"), &role("green")).await;
    assert_eq!(
        outcome,
        SwitchOutcome::RolledBack {
            reason: RollbackReason::DualActive,
            clean: true,
        }
    );
    assert_eq!(TestFleet::states(&fleet.blue), vec![LifecycleState::Active; 2]);
    assert_eq!(
        TestFleet::states(&fleet.green),
        vec![LifecycleState::Paused; 2]
    );

    let metrics = fleet.controller.stats().snapshot();
    assert_eq!(metrics.dual_active_detected, 1);
    assert_eq!(metrics.switch_rollbacks, 1);

    fleet.shutdown().await;
    logctx.cleanup_successful();
}

async fn wait_for_metric<F>(controller: &SwitchController, check: F)
where
    F: Fn(&cutover_switch_controller::SwitchMetrics) -> bool,
{
    let stats = controller.stats();
    wait_for_condition(
        || {
            let done = check(&stats.snapshot());
            async move {
                if done {
                    Ok(())
                } else {
                    Err(CondCheckError::<()>::NotYet)
                }
            }
        },
        &Duration::from_millis(20),
        &Duration::from_secs(10),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn test_run_loop_switches_once() {
    let logctx = test_setup_log("test_run_loop_switches_once");
    let log = &logctx.log;
    let fleet = TestFleet::start(log);

    let task = fleet.start_run_loop().await;

    fleet.active.set(role("green"));
    wait_for_metric(&fleet.controller, |m| m.switch_successes == 1).await;
    assert_eq!(
        TestFleet::states(&fleet.green),
        vec![LifecycleState::Active; 2]
    );

    // Writing the same value again is not a change.
    fleet.clear_commands();
    fleet.active.set(role("green"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(fleet.all_commands().is_empty());
    assert_eq!(fleet.controller.stats().snapshot().switch_attempts, 1);

    fleet.active.set(role("blue"));
    wait_for_metric(&fleet.controller, |m| m.switch_successes == 2).await;
    assert_eq!(TestFleet::states(&fleet.blue), vec![LifecycleState::Active; 2]);
    assert_eq!(
        TestFleet::states(&fleet.green),
        vec![LifecycleState::Paused; 2]
    );

    fleet.controller.cancel_token().cancel();
    task.await.unwrap();
    fleet.shutdown().await;
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_run_loop_ignores_rollback_write() {
    let logctx = test_setup_log("test_run_loop_ignores_rollback_write");
    let log = &logctx.log;
    let fleet = TestFleet::start(log);
    fleet.green[0].reject_commands(true);

    let task = fleet.start_run_loop().await;

    fleet.active.set(role("green"));
    wait_for_metric(&fleet.controller, |m| m.switch_rollbacks == 1).await;
    assert_eq!(fleet.active.get(), Some(role("blue")));

    // The rollback's write back to `blue` must not start another switch.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let metrics = fleet.controller.stats().snapshot();
    assert_eq!(metrics.switch_attempts, 1);
    assert_eq!(TestFleet::states(&fleet.blue), vec![LifecycleState::Active; 2]);

    fleet.controller.cancel_token().cancel();
    task.await.unwrap();
    fleet.shutdown().await;
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_run_loop_switches_one_at_a_time() {
    let logctx = test_setup_log("test_run_loop_switches_one_at_a_time");
    let log = &logctx.log;
    let fleet = TestFleet::start(log);
    // Keep the first switch in its drain wait for a while.
    fleet.blue[0].drain_polls(15);

    let task = fleet.start_run_loop().await;

    fleet.active.set(role("green"));
    wait_for_condition(
        || {
            let paused = !fleet.blue[0].commands().is_empty();
            async move {
                if paused {
                    Ok(())
                } else {
                    Err(CondCheckError::<()>::NotYet)
                }
            }
        },
        &Duration::from_millis(5),
        &Duration::from_secs(10),
    )
    .await
    .unwrap();

    // Asking to go back while the first switch is draining must not start a
    // second switch alongside it.
    fleet.active.set(role("blue"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    for sim in &fleet.blue {
        assert_eq!(sim.commands(), vec![LifecycleCommand::Pause]);
    }
    for sim in &fleet.green {
        assert!(sim.commands().is_empty());
    }
    assert_eq!(fleet.controller.stats().snapshot().switch_attempts, 1);

    // The second switch runs once the first has finished.
    wait_for_metric(&fleet.controller, |m| m.switch_successes == 2).await;
    for sim in &fleet.blue {
        assert_eq!(
            sim.commands(),
            vec![LifecycleCommand::Pause, LifecycleCommand::Resume]
        );
    }
    for sim in &fleet.green {
        assert_eq!(
            sim.commands(),
            vec![LifecycleCommand::Resume, LifecycleCommand::Pause]
        );
    }
    assert_eq!(TestFleet::states(&fleet.blue), vec![LifecycleState::Active; 2]);
    assert_eq!(
        TestFleet::states(&fleet.green),
        vec![LifecycleState::Paused; 2]
    );
    let metrics = fleet.controller.stats().snapshot();
    assert_eq!(metrics.switch_attempts, 2);
    assert_eq!(metrics.active_role, Some(role("blue")));

    fleet.controller.cancel_token().cancel();
    task.await.unwrap();
    fleet.shutdown().await;
    logctx.cleanup_successful();
}
