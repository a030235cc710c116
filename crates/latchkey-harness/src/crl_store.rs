//! Revocation cache storage and timing helpers.
//!
//! [`MemoryCrlStore`] keeps the whole cache as one CBOR document behind a
//! mutex, round-tripping through the wire encoding on every access so tests
//! cover the persisted representation, not just the in-memory types.
//! [`SimClock`] pairs a wall-clock origin with the tokio clock, so wall time
//! advances with `tokio::time` under `start_paused` test runtimes.

use std::{
    sync::Mutex,
    time::SystemTime,
};

use async_trait::async_trait;
use latchkey_identity::{
    error::StoreError,
    revocation::{Clock, LivenessReceiver, RevocationCheckpoint, RevocationEntry, SyncState},
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CrlCache {
    entries: Vec<RevocationEntry>,
    checkpoint: Option<RevocationCheckpoint>,
}

/// In-memory CBOR-encoded revocation cache.
#[derive(Default)]
pub struct MemoryCrlStore {
    blob: Mutex<Vec<u8>>,
    failing: Mutex<bool>,
    reads: Mutex<u64>,
}

impl MemoryCrlStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-seeded with `entries` and `checkpoint`.
    pub fn seeded(
        entries: Vec<RevocationEntry>,
        checkpoint: Option<RevocationCheckpoint>,
    ) -> Self {
        let store = Self::new();
        store.save(&CrlCache { entries, checkpoint });
        store
    }

    /// Make every store operation fail until called again with `false`.
    pub fn set_failing(&self, failing: bool) {
        *lock(&self.failing) = failing;
    }

    /// How many store operations have been attempted, failures included.
    pub fn operations(&self) -> u64 {
        *lock(&self.reads)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        *lock(&self.reads) += 1;
        if *lock(&self.failing) {
            return Err(StoreError("scripted store failure".into()));
        }
        Ok(())
    }

    fn load(&self) -> Result<CrlCache, StoreError> {
        let blob = lock(&self.blob);
        if blob.is_empty() {
            return Ok(CrlCache::default());
        }
        ciborium::from_reader(blob.as_slice())
            .map_err(|err| StoreError(format!("corrupt revocation cache: {err}")))
    }

    fn save(&self, cache: &CrlCache) {
        let mut blob = Vec::new();
        // Serializing fully in-memory types into a Vec cannot fail.
        if ciborium::into_writer(cache, &mut blob).is_ok() {
            *lock(&self.blob) = blob;
        }
    }
}

#[async_trait]
impl latchkey_identity::revocation::CrlStore for MemoryCrlStore {
    async fn entries(&self) -> Result<Vec<RevocationEntry>, StoreError> {
        self.check_available()?;
        Ok(self.load()?.entries)
    }

    async fn upsert_entry(&self, entry: RevocationEntry) -> Result<(), StoreError> {
        self.check_available()?;
        let mut cache = self.load()?;
        match cache.entries.iter_mut().find(|existing| existing.url == entry.url) {
            Some(existing) => *existing = entry,
            None => cache.entries.push(entry),
        }
        self.save(&cache);
        Ok(())
    }

    async fn checkpoint(&self) -> Result<Option<RevocationCheckpoint>, StoreError> {
        self.check_available()?;
        Ok(self.load()?.checkpoint)
    }

    async fn save_checkpoint(&self, checkpoint: RevocationCheckpoint) -> Result<(), StoreError> {
        self.check_available()?;
        let mut cache = self.load()?;
        cache.checkpoint = Some(checkpoint);
        self.save(&cache);
        Ok(())
    }
}

/// Wall clock driven by the tokio clock.
///
/// `now()` is the construction-time origin plus the tokio time elapsed
/// since, so `tokio::time::advance` moves wall time too.
pub struct SimClock {
    origin: SystemTime,
    started: tokio::time::Instant,
}

impl SimClock {
    /// Clock starting at the current wall time. Must be built inside a
    /// tokio runtime.
    pub fn new() -> Self {
        Self { origin: SystemTime::now(), started: tokio::time::Instant::now() }
    }

    /// The clock's wall-time origin.
    pub fn origin(&self) -> SystemTime {
        self.origin
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SimClock {
    fn now(&self) -> SystemTime {
        self.origin + self.started.elapsed()
    }
}

/// A liveness signal starting in `initial`, with its sender for tests to
/// drive transitions.
pub fn liveness_channel(initial: SyncState) -> (watch::Sender<SyncState>, LivenessReceiver) {
    watch::channel(initial)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
