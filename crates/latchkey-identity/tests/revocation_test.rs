//! Tests for the revocation freshness worker.
//!
//! These tests verify critical invariants:
//! - Only expired cache entries are fetched; fresh ones are skipped
//! - A fresh checkpoint delays the next cycle by the minimum interval
//! - Checks wait for the sync subsystem to report `Live`
//! - A failing distribution point never stalls the others

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use latchkey_harness::{
    MemoryCrlStore, ScriptedAcmeClient, ScriptedRegistrar, SimClock, liveness_channel,
};
use latchkey_identity::{
    acme::AcmeClient,
    revocation::{
        Clock, CrlRegistrar, CrlStore, RevocationCheckpoint, RevocationEntry, RevocationWorker,
        RevocationWorkerConfig, SyncState, register_distribution_points,
    },
};

fn expired(url: &str) -> RevocationEntry {
    RevocationEntry { url: url.into(), expires_at: SystemTime::UNIX_EPOCH }
}

fn worker_over(
    store: &Arc<MemoryCrlStore>,
    acme: &Arc<ScriptedAcmeClient>,
    registrar: &Arc<ScriptedRegistrar>,
    clock: &Arc<SimClock>,
    liveness: latchkey_identity::revocation::LivenessReceiver,
    min_interval: Duration,
) -> RevocationWorker {
    RevocationWorker::new(
        Arc::clone(store) as Arc<dyn CrlStore>,
        Arc::clone(acme) as Arc<dyn AcmeClient>,
        Arc::clone(registrar) as Arc<dyn CrlRegistrar>,
        Arc::clone(clock) as Arc<dyn Clock>,
        liveness,
        RevocationWorkerConfig { min_interval, ..RevocationWorkerConfig::default() },
    )
}

#[tokio::test]
async fn unknown_distribution_points_are_registered_expired() {
    let store = MemoryCrlStore::new();
    let urls = vec!["https://crl.example/a".to_owned(), "https://crl.example/b".to_owned()];

    let added = register_distribution_points(&store, &urls)
        .await
        .expect("registration should succeed");
    assert_eq!(added, 2);

    let entries = store.entries().await.expect("entries should load");
    assert_eq!(entries.len(), 2);
    for entry in &entries {
        assert_eq!(
            entry.expires_at,
            SystemTime::UNIX_EPOCH,
            "new entries start expired so the next cycle fetches them"
        );
    }

    // Known URLs are left alone.
    let added = register_distribution_points(&store, &urls)
        .await
        .expect("registration should succeed");
    assert_eq!(added, 0);
}

#[tokio::test(start_paused = true)]
async fn cycle_refreshes_only_expired_entries() {
    let clock = Arc::new(SimClock::new());
    let fresh_until = clock.now() + Duration::from_secs(3600);
    let store = Arc::new(MemoryCrlStore::seeded(
        vec![
            expired("https://crl.example/stale"),
            RevocationEntry { url: "https://crl.example/fresh".into(), expires_at: fresh_until },
        ],
        None,
    ));
    let acme = Arc::new(ScriptedAcmeClient::new());
    acme.set_crl_document("https://crl.example/stale", b"crl-bytes".to_vec());
    let registrar = Arc::new(ScriptedRegistrar::new());
    let next_expiry = clock.now() + Duration::from_secs(7200);
    registrar.accept("https://crl.example/stale", false, Some(next_expiry));

    let (_liveness_tx, liveness) = liveness_channel(SyncState::Live);
    let mut worker =
        worker_over(&store, &acme, &registrar, &clock, liveness, Duration::from_secs(60));
    worker.run_cycle().await;

    assert_eq!(acme.fetched_crls(), vec!["https://crl.example/stale".to_owned()]);
    assert_eq!(registrar.registered(), vec!["https://crl.example/stale".to_owned()]);

    let entries = store.entries().await.expect("entries should load");
    let stale = entries
        .iter()
        .find(|entry| entry.url == "https://crl.example/stale")
        .expect("entry should remain");
    assert_eq!(stale.expires_at, next_expiry, "the engine's expiration is persisted");

    let checkpoint = store.checkpoint().await.expect("checkpoint should load");
    assert!(checkpoint.is_some(), "a completed cycle persists its checkpoint");
}

#[tokio::test(start_paused = true)]
async fn failing_distribution_points_do_not_stall_the_others() {
    let clock = Arc::new(SimClock::new());
    let store = Arc::new(MemoryCrlStore::seeded(
        vec![
            expired("https://crl.example/unfetchable"),
            expired("https://crl.example/rejected"),
            expired("https://crl.example/good"),
        ],
        None,
    ));
    let acme = Arc::new(ScriptedAcmeClient::new());
    // No document for `unfetchable`: the fetch 404s.
    acme.set_crl_document("https://crl.example/rejected", b"crl-bytes".to_vec());
    acme.set_crl_document("https://crl.example/good", b"crl-bytes".to_vec());
    let registrar = Arc::new(ScriptedRegistrar::new());
    registrar.fail("https://crl.example/rejected");
    let good_expiry = clock.now() + Duration::from_secs(3600);
    registrar.accept("https://crl.example/good", true, Some(good_expiry));

    let (_liveness_tx, liveness) = liveness_channel(SyncState::Live);
    let mut worker =
        worker_over(&store, &acme, &registrar, &clock, liveness, Duration::from_secs(60));
    worker.run_cycle().await;

    // All three were attempted; only the good one registered.
    assert_eq!(acme.fetched_crls().len(), 3);
    assert_eq!(registrar.registered(), vec!["https://crl.example/good".to_owned()]);

    let entries = store.entries().await.expect("entries should load");
    for entry in &entries {
        if entry.url == "https://crl.example/good" {
            assert_eq!(entry.expires_at, good_expiry);
        } else {
            // Failed entries keep their expiration and are retried next
            // cycle.
            assert_eq!(entry.expires_at, SystemTime::UNIX_EPOCH);
        }
    }
    assert!(
        store.checkpoint().await.expect("checkpoint should load").is_some(),
        "partial failures still complete the cycle"
    );
}

#[tokio::test(start_paused = true)]
async fn fresh_checkpoint_delays_the_next_cycle() {
    let clock = Arc::new(SimClock::new());
    let min_interval = Duration::from_secs(3600);
    let store = Arc::new(MemoryCrlStore::seeded(
        vec![expired("https://crl.example/a")],
        Some(RevocationCheckpoint { last_check: clock.now() }),
    ));
    let acme = Arc::new(ScriptedAcmeClient::new());
    acme.set_crl_document("https://crl.example/a", b"crl-bytes".to_vec());
    let registrar = Arc::new(ScriptedRegistrar::new());

    let (_liveness_tx, liveness) = liveness_channel(SyncState::Live);
    let started = tokio::time::Instant::now();
    let handle =
        worker_over(&store, &acme, &registrar, &clock, liveness, min_interval).spawn();

    // Poll until the first fetch happens; virtual time advances through the
    // worker's own sleep.
    while acme.fetched_crls().is_empty() {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    assert!(
        started.elapsed() >= min_interval,
        "the worker must wait out the minimum interval before checking"
    );

    handle.stop();
    handle.stopped().await;
}

#[tokio::test(start_paused = true)]
async fn checks_wait_for_liveness_and_tolerate_flapping() {
    let clock = Arc::new(SimClock::new());
    let store = Arc::new(MemoryCrlStore::seeded(vec![expired("https://crl.example/a")], None));
    let acme = Arc::new(ScriptedAcmeClient::new());
    acme.set_crl_document("https://crl.example/a", b"crl-bytes".to_vec());
    let registrar = Arc::new(ScriptedRegistrar::new());

    let (liveness_tx, liveness) = liveness_channel(SyncState::Offline);
    let handle = worker_over(&store, &acme, &registrar, &clock, liveness, Duration::from_secs(60))
        .spawn();

    // Flap through non-live states; no check may run.
    for state in [SyncState::Syncing, SyncState::Offline, SyncState::Syncing] {
        liveness_tx.send(state).expect("worker should be listening");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(acme.fetched_crls().is_empty(), "checks must wait for Live");
    }

    liveness_tx.send(SyncState::Live).expect("worker should be listening");
    while acme.fetched_crls().is_empty() {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    assert_eq!(acme.fetched_crls(), vec!["https://crl.example/a".to_owned()]);

    handle.stop();
    handle.stopped().await;
}

#[tokio::test(start_paused = true)]
async fn unavailable_store_skips_the_cycle() {
    let clock = Arc::new(SimClock::new());
    let store = Arc::new(MemoryCrlStore::seeded(vec![expired("https://crl.example/a")], None));
    let acme = Arc::new(ScriptedAcmeClient::new());
    let registrar = Arc::new(ScriptedRegistrar::new());

    let (_liveness_tx, liveness) = liveness_channel(SyncState::Live);
    let mut worker =
        worker_over(&store, &acme, &registrar, &clock, liveness, Duration::from_secs(60));

    store.set_failing(true);
    worker.run_cycle().await;
    assert!(acme.fetched_crls().is_empty(), "nothing is fetched without the store");

    store.set_failing(false);
    worker.run_cycle().await;
    assert_eq!(acme.fetched_crls().len(), 1, "the entry is retried once the store is back");
}

#[tokio::test(start_paused = true)]
async fn unavailable_store_is_retried_at_a_bounded_pace() {
    let clock = Arc::new(SimClock::new());
    let store = Arc::new(MemoryCrlStore::seeded(vec![expired("https://crl.example/a")], None));
    let acme = Arc::new(ScriptedAcmeClient::new());
    let registrar = Arc::new(ScriptedRegistrar::new());

    store.set_failing(true);
    let (_liveness_tx, liveness) = liveness_channel(SyncState::Live);
    let handle = worker_over(&store, &acme, &registrar, &clock, liveness, Duration::from_secs(60))
        .spawn();

    // Ten minutes of store outage. The worker keeps probing, but paced by
    // its retry delay, not in a tight loop.
    tokio::time::sleep(Duration::from_secs(600)).await;
    let operations = store.operations();
    assert!(operations >= 2, "the worker keeps probing the store");
    assert!(
        operations <= 40,
        "retries must be paced, got {operations} store operations in ten minutes"
    );

    handle.stop();
    handle.stopped().await;
}

#[tokio::test(start_paused = true)]
async fn stop_is_observed_between_entries() {
    let clock = Arc::new(SimClock::new());
    let store = Arc::new(MemoryCrlStore::seeded(
        vec![
            expired("https://crl.example/a"),
            expired("https://crl.example/b"),
            expired("https://crl.example/c"),
        ],
        None,
    ));
    let acme = Arc::new(ScriptedAcmeClient::new());
    for url in ["https://crl.example/a", "https://crl.example/b", "https://crl.example/c"] {
        acme.set_crl_document(url, b"crl-bytes".to_vec());
    }
    acme.delay_crl_fetches(Duration::from_secs(10));
    let registrar = Arc::new(ScriptedRegistrar::new());

    let (_liveness_tx, liveness) = liveness_channel(SyncState::Live);
    let handle = worker_over(&store, &acme, &registrar, &clock, liveness, Duration::from_secs(60))
        .spawn();

    // Stop while the first fetch is still in flight; the remaining entries
    // must not be fetched.
    while acme.fetched_crls().is_empty() {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    handle.stop();
    handle.stopped().await;

    assert_eq!(acme.fetched_crls(), vec!["https://crl.example/a".to_owned()]);
}

#[tokio::test]
async fn stopped_worker_terminates() {
    let clock = Arc::new(SimClock::new());
    let store = Arc::new(MemoryCrlStore::new());
    let acme = Arc::new(ScriptedAcmeClient::new());
    let registrar = Arc::new(ScriptedRegistrar::new());

    let (_liveness_tx, liveness) = liveness_channel(SyncState::Offline);
    let handle = worker_over(&store, &acme, &registrar, &clock, liveness, Duration::from_secs(60))
        .spawn();
    handle.stop();
    handle.stopped().await;
}
