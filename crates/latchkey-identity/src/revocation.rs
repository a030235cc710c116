//! Revocation freshness worker.
//!
//! A single long-lived background task per identity keeping the cached
//! revocation-list entries fresh. States:
//!
//! ```text
//! Idle -> WaitingForInterval -> WaitingForLiveness -> Checking -> Idle
//! ```
//!
//! The worker waits until `last_check + min_interval`, then until the sync
//! subsystem reports `Live`, then refreshes every expired entry (one fetch
//! per URL, failures isolated per URL), persists the checkpoint, and loops.
//! Its only durable state is the checkpoint, so restarting it is always
//! safe.

use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use latchkey_core::{
    engine::CrlRegistration,
    error::TransactionError,
    transaction::CryptoTransactionProvider,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{acme::AcmeClient, error::StoreError};

/// Default minimum interval between freshness checks.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default pause before retrying an unavailable store.
pub const DEFAULT_STORE_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Status of the external sync subsystem as observed by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Not connected.
    Offline,

    /// Connected, still catching up.
    Syncing,

    /// Online and caught up; checks may run.
    Live,
}

/// Liveness signal source the worker observes.
pub type LivenessReceiver = watch::Receiver<SyncState>;

/// Wall-clock source, injected so worker timing is testable.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> SystemTime;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// One cached revocation-list entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationEntry {
    /// Distribution point the list is fetched from.
    pub url: String,

    /// When the cached list expires and must be refreshed.
    pub expires_at: SystemTime,
}

/// Persisted checkpoint enforcing the minimum inter-check interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationCheckpoint {
    /// When the last check cycle completed.
    pub last_check: SystemTime,
}

/// Persistence facility for the revocation cache and checkpoint.
#[async_trait]
pub trait CrlStore: Send + Sync {
    /// All cached entries.
    async fn entries(&self) -> Result<Vec<RevocationEntry>, StoreError>;

    /// Insert or replace the entry for `entry.url`.
    async fn upsert_entry(&self, entry: RevocationEntry) -> Result<(), StoreError>;

    /// The persisted checkpoint, if a check ever completed.
    async fn checkpoint(&self) -> Result<Option<RevocationCheckpoint>, StoreError>;

    /// Persist the checkpoint.
    async fn save_checkpoint(&self, checkpoint: RevocationCheckpoint) -> Result<(), StoreError>;
}

/// Registers fetched revocation lists with the crypto engine.
#[async_trait]
pub trait CrlRegistrar: Send + Sync {
    /// Register a fetched document, returning the engine's verdict.
    async fn register_crl(
        &self,
        url: &str,
        document: &[u8],
    ) -> Result<CrlRegistration, TransactionError>;
}

#[async_trait]
impl CrlRegistrar for CryptoTransactionProvider {
    async fn register_crl(
        &self,
        url: &str,
        document: &[u8],
    ) -> Result<CrlRegistration, TransactionError> {
        self.transaction("register-crl", |tx| {
            let url = url.to_owned();
            let document = document.to_vec();
            Box::pin(async move {
                let mut group = tx.require_group()?;
                Ok(group.register_crl(&url, &document).await?)
            })
        })
        .await
    }
}

/// Record distribution points discovered by group operations.
///
/// Unknown URLs are inserted already expired so the next check cycle
/// fetches them; known URLs are left alone. Returns how many were new.
pub async fn register_distribution_points(
    store: &dyn CrlStore,
    urls: &[String],
) -> Result<usize, StoreError> {
    let known: HashSet<String> = store.entries().await?.into_iter().map(|e| e.url).collect();
    let mut added = 0;
    for url in urls {
        if known.contains(url) {
            continue;
        }
        store
            .upsert_entry(RevocationEntry {
                url: url.clone(),
                expires_at: SystemTime::UNIX_EPOCH,
            })
            .await?;
        added += 1;
    }
    if added > 0 {
        tracing::debug!(added, "registered new revocation distribution points");
    }
    Ok(added)
}

/// Worker configuration.
#[derive(Debug, Clone, Copy)]
pub struct RevocationWorkerConfig {
    /// Minimum interval between check cycles.
    pub min_interval: Duration,

    /// Pause before retrying when the store cannot be read.
    pub store_retry_delay: Duration,
}

impl Default for RevocationWorkerConfig {
    fn default() -> Self {
        Self {
            min_interval: DEFAULT_MIN_INTERVAL,
            store_retry_delay: DEFAULT_STORE_RETRY_DELAY,
        }
    }
}

#[derive(Error, Debug)]
enum RefreshError {
    #[error(transparent)]
    Fetch(#[from] crate::error::AcmeError),

    #[error(transparent)]
    Register(#[from] TransactionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Background task keeping cached revocation lists fresh.
pub struct RevocationWorker {
    store: Arc<dyn CrlStore>,
    fetcher: Arc<dyn AcmeClient>,
    registrar: Arc<dyn CrlRegistrar>,
    clock: Arc<dyn Clock>,
    liveness: LivenessReceiver,
    config: RevocationWorkerConfig,
    cancel: CancellationToken,
}

impl RevocationWorker {
    /// Build a worker over its collaborators.
    pub fn new(
        store: Arc<dyn CrlStore>,
        fetcher: Arc<dyn AcmeClient>,
        registrar: Arc<dyn CrlRegistrar>,
        clock: Arc<dyn Clock>,
        liveness: LivenessReceiver,
        config: RevocationWorkerConfig,
    ) -> Self {
        Self {
            store,
            fetcher,
            registrar,
            clock,
            liveness,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn the worker loop onto the current runtime.
    pub fn spawn(self) -> RevocationWorkerHandle {
        let cancel = self.cancel.clone();
        let join = tokio::spawn(self.run());
        RevocationWorkerHandle { cancel, join }
    }

    /// Run the worker loop until cancelled.
    pub async fn run(mut self) {
        loop {
            if !self.wait_for_interval().await {
                break;
            }
            if !self.wait_for_liveness().await {
                break;
            }
            self.run_cycle().await;
        }
        tracing::debug!("revocation worker stopped");
    }

    /// One freshness cycle: refresh every expired entry, then persist the
    /// checkpoint. Normally driven by [`RevocationWorker::run`]; public so
    /// tests can exercise a cycle without the surrounding waits.
    pub async fn run_cycle(&mut self) {
        let now = self.clock.now();
        let entries = match self.store.entries().await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(error = %err, "revocation store unavailable, skipping cycle");
                return;
            },
        };

        for entry in entries {
            if self.cancel.is_cancelled() {
                return;
            }
            if entry.expires_at > now {
                continue;
            }
            // Failures stay per-URL; a dead distribution point must not
            // stall freshness for the others.
            if let Err(err) = self.refresh_entry(&entry).await {
                tracing::warn!(
                    url = %entry.url,
                    error = %err,
                    "revocation refresh failed, entry retried next cycle"
                );
            }
        }

        let checkpoint = RevocationCheckpoint { last_check: self.clock.now() };
        if let Err(err) = self.store.save_checkpoint(checkpoint).await {
            tracing::warn!(error = %err, "failed to persist revocation checkpoint");
        }
    }

    async fn refresh_entry(&self, entry: &RevocationEntry) -> Result<(), RefreshError> {
        let document = self.fetcher.fetch_crl(&entry.url).await?;
        let registration = self.registrar.register_crl(&entry.url, &document).await?;
        if registration.dirty {
            tracing::info!(url = %entry.url, "revocation list changed a credential status");
        }
        if let Some(expiration) = registration.expiration {
            self.store
                .upsert_entry(RevocationEntry { url: entry.url.clone(), expires_at: expiration })
                .await?;
        }
        Ok(())
    }

    /// Wait until `last_check + min_interval`. Returns false when
    /// cancelled.
    async fn wait_for_interval(&mut self) -> bool {
        let last_check = match self.store.checkpoint().await {
            Ok(checkpoint) => checkpoint.map(|c| c.last_check),
            Err(err) => {
                // An unreadable store must not turn the loop into a spin;
                // pause before consulting it again.
                tracing::warn!(error = %err, "checkpoint unavailable, pausing before retry");
                return tokio::select! {
                    () = self.cancel.cancelled() => false,
                    () = tokio::time::sleep(self.config.store_retry_delay) => true,
                };
            },
        };
        let wait = last_check
            .map(|last| {
                (last + self.config.min_interval)
                    .duration_since(self.clock.now())
                    .unwrap_or(Duration::ZERO)
            })
            .unwrap_or(Duration::ZERO);
        if wait.is_zero() {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(wait) => true,
        }
    }

    /// Wait until the sync subsystem reports `Live`. Tolerates the signal
    /// flapping by simply re-waiting. Returns false when cancelled or when
    /// the signal source went away.
    async fn wait_for_liveness(&mut self) -> bool {
        loop {
            if *self.liveness.borrow_and_update() == SyncState::Live {
                return true;
            }
            tokio::select! {
                () = self.cancel.cancelled() => return false,
                changed = self.liveness.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                },
            }
        }
    }
}

/// Handle to a spawned [`RevocationWorker`].
pub struct RevocationWorkerHandle {
    cancel: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

impl RevocationWorkerHandle {
    /// Request the worker to stop at the next step/entry boundary.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for the worker task to finish.
    pub async fn stopped(self) {
        let _ = self.join.await;
    }
}
