// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use assert_matches::assert_matches;
use chrono::{TimeDelta, Utc};
use cutover_lease::{
    BackendError, InMemoryLeaseBackend, LeaseBackend, LeaseClient, LeaseError,
    LeaseRecord, DEFAULT_LEASE_DURATION,
};
use cutover_test_utils::dev::test_setup_log;
use std::sync::Arc;

const LEASE: &str = "consumer-switch";

fn client(
    log: &slog::Logger,
    backend: &Arc<InMemoryLeaseBackend>,
) -> LeaseClient {
    LeaseClient::new(log, backend.clone(), LEASE, DEFAULT_LEASE_DURATION)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquire_has_one_winner() {
    let logctx = test_setup_log("concurrent_acquire_has_one_winner");
    let backend = Arc::new(InMemoryLeaseBackend::new());

    let attempts = (0..16).map(|i| {
        let lease = client(&logctx.log, &backend);
        tokio::spawn(async move {
            let holder = format!("switch-{i}");
            let result = lease.acquire(&holder).await;
            (holder, result)
        })
    });
    let results: Vec<_> = futures::future::join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let winners: Vec<_> =
        results.iter().filter(|(_, result)| result.is_ok()).collect();
    assert_eq!(winners.len(), 1, "results: {results:?}");
    let winner = &winners[0].0;

    for (holder, result) in &results {
        if holder == winner {
            continue;
        }
        assert_matches!(
            result,
            Err(LeaseError::Contention { holder: named, .. }) => {
                assert_eq!(named, winner);
            }
        );
    }
    assert_eq!(client(&logctx.log, &backend).holder().await.unwrap(), *winner);
    logctx.cleanup_successful();
}

#[tokio::test]
async fn live_lease_is_exclusive() {
    let logctx = test_setup_log("live_lease_is_exclusive");
    let backend = Arc::new(InMemoryLeaseBackend::new());
    let lease = client(&logctx.log, &backend);

    let record = lease.acquire("switch-blue-to-green").await.unwrap();
    assert_eq!(record.lease_duration_seconds, 30);

    // Re-acquiring as the same holder is fine.
    lease.acquire("switch-blue-to-green").await.unwrap();

    let err = lease.acquire("switch-green-to-blue").await.unwrap_err();
    assert_matches!(
        err,
        LeaseError::Contention { ref holder, expires_at, .. } => {
            assert_eq!(holder, "switch-blue-to-green");
            assert!(expires_at > Utc::now());
        }
    );
    assert!(err.to_string().contains("switch-blue-to-green"));
    logctx.cleanup_successful();
}

#[tokio::test]
async fn expired_lease_can_be_taken_over() {
    let logctx = test_setup_log("expired_lease_can_be_taken_over");
    let backend = Arc::new(InMemoryLeaseBackend::new());
    let stale = Utc::now() - TimeDelta::seconds(31);
    backend
        .create(LEASE, LeaseRecord::new("switch-crashed", stale, 30))
        .await
        .unwrap();

    let lease = client(&logctx.log, &backend);
    let record = lease.acquire("switch-blue-to-green").await.unwrap();
    assert_eq!(record.holder_identity, "switch-blue-to-green");
    assert!(record.renew_time > stale);
    assert_eq!(lease.holder().await.unwrap(), "switch-blue-to-green");
    logctx.cleanup_successful();
}

#[tokio::test]
async fn release_clears_holder_but_keeps_record() {
    let logctx = test_setup_log("release_clears_holder_but_keeps_record");
    let backend = Arc::new(InMemoryLeaseBackend::new());
    let lease = client(&logctx.log, &backend);

    // Nothing to release, renew or read yet.
    assert_matches!(lease.release().await, Err(LeaseError::NotFound { .. }));
    assert_matches!(lease.renew().await, Err(LeaseError::NotFound { .. }));
    assert_eq!(lease.holder().await.unwrap(), "");

    lease.acquire("switch-blue-to-green").await.unwrap();
    lease.release().await.unwrap();
    let record = lease.read().await.unwrap().expect("record is kept");
    assert_eq!(record.holder_identity, "");
    assert_eq!(lease.holder().await.unwrap(), "");

    // An unheld lease is free for anyone.
    lease.acquire("switch-green-to-blue").await.unwrap();
    logctx.cleanup_successful();
}

#[tokio::test]
async fn renew_only_moves_renew_time() {
    let logctx = test_setup_log("renew_only_moves_renew_time");
    let backend = Arc::new(InMemoryLeaseBackend::new());
    let earlier = Utc::now() - TimeDelta::seconds(10);
    backend
        .create(LEASE, LeaseRecord::new("switch-blue-to-green", earlier, 30))
        .await
        .unwrap();

    let lease = client(&logctx.log, &backend);
    let renewed = lease.renew().await.unwrap();
    assert_eq!(renewed.holder_identity, "switch-blue-to-green");
    assert_eq!(renewed.acquire_time, earlier);
    assert!(renewed.renew_time > earlier);
    logctx.cleanup_successful();
}

#[tokio::test]
async fn transfer_moves_holder() {
    let logctx = test_setup_log("transfer_moves_holder");
    let backend = Arc::new(InMemoryLeaseBackend::new());
    let lease = client(&logctx.log, &backend);

    assert_matches!(
        lease.transfer("switch-blue-to-green", "green").await,
        Err(LeaseError::NotFound { .. })
    );

    lease.acquire("switch-blue-to-green").await.unwrap();
    lease.transfer("switch-blue-to-green", "green").await.unwrap();
    assert_eq!(lease.holder().await.unwrap(), "green");

    // A third party cannot move a live lease.
    assert_matches!(
        lease.transfer("switch-blue-to-green", "blue").await,
        Err(LeaseError::Contention { holder, .. }) if holder == "green"
    );

    // Once released, anybody can.
    lease.release().await.unwrap();
    lease.transfer("switch-blue-to-green", "blue").await.unwrap();
    assert_eq!(lease.holder().await.unwrap(), "blue");
    logctx.cleanup_successful();
}

#[tokio::test]
async fn stale_update_is_rejected() {
    let backend = InMemoryLeaseBackend::new();
    let now = Utc::now();
    let created =
        backend.create(LEASE, LeaseRecord::new("a", now, 30)).await.unwrap();
    assert_matches!(
        backend.create(LEASE, LeaseRecord::new("b", now, 30)).await,
        Err(BackendError::AlreadyExists)
    );

    let updated = backend
        .update(
            LEASE,
            LeaseRecord { holder_identity: "b".to_string(), ..created.clone() },
        )
        .await
        .unwrap();
    assert_ne!(updated.resource_version, created.resource_version);

    // `created` carries the old version.
    assert_matches!(
        backend.update(LEASE, created).await,
        Err(BackendError::Conflict)
    );
    assert_matches!(
        backend.update("missing", updated).await,
        Err(BackendError::NotFound)
    );
}
