//! In-memory fake of the pairwise (double-ratchet) engine.
//!
//! Sessions are plain entries in a map; ciphertexts are readable
//! placeholders of the form `p:{session}:{counter}:{plaintext}`. Like the
//! group fake, `begin`/`rollback` snapshot the whole store so tests can
//! observe transaction atomicity, and a session can be scripted to fail on
//! creation to exercise partial batch bootstrap.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use bytes::Bytes;
use latchkey_core::{
    engine::{PairwiseEngine, PreKey},
    error::PairwiseError,
    ids::SessionId,
};

#[derive(Clone)]
struct FakeSession {
    sent: u64,
    seen: HashSet<u64>,
}

#[derive(Clone, Default)]
struct PairwiseStore {
    sessions: HashMap<SessionId, FakeSession>,
}

/// Scriptable in-memory [`PairwiseEngine`].
pub struct FakePairwiseEngine {
    store: PairwiseStore,
    snapshot: Option<PairwiseStore>,
    fail_on_session: Option<SessionId>,
}

impl FakePairwiseEngine {
    /// Fresh engine with no sessions.
    pub fn new() -> Self {
        Self { store: PairwiseStore::default(), snapshot: None, fail_on_session: None }
    }

    /// Make `create_session` fail for this exact session id.
    pub fn fail_on_session(&mut self, session_id: SessionId) {
        self.fail_on_session = Some(session_id);
    }

    /// A valid one-time prekey with the given id.
    pub fn prekey(id: u16) -> PreKey {
        PreKey { id, data: Bytes::from(format!("pk:{id}").into_bytes()) }
    }

    fn session_mut(&mut self, session_id: &SessionId) -> Result<&mut FakeSession, PairwiseError> {
        self.store
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| PairwiseError::SessionNotFound(session_id.clone()))
    }
}

impl Default for FakePairwiseEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PairwiseEngine for FakePairwiseEngine {
    async fn begin(&mut self) -> Result<(), PairwiseError> {
        if self.snapshot.is_some() {
            return Err(PairwiseError::Engine("transaction already open".into()));
        }
        self.snapshot = Some(self.store.clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), PairwiseError> {
        if self.snapshot.take().is_none() {
            return Err(PairwiseError::Engine("no open transaction".into()));
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), PairwiseError> {
        match self.snapshot.take() {
            Some(snapshot) => {
                self.store = snapshot;
                Ok(())
            },
            None => Err(PairwiseError::Engine("no open transaction".into())),
        }
    }

    async fn session_exists(&mut self, session_id: &SessionId) -> Result<bool, PairwiseError> {
        Ok(self.store.sessions.contains_key(session_id))
    }

    async fn create_session(
        &mut self,
        prekey: &PreKey,
        session_id: &SessionId,
    ) -> Result<(), PairwiseError> {
        if self.fail_on_session.as_ref() == Some(session_id) {
            return Err(PairwiseError::Engine("scripted session failure".into()));
        }
        if !prekey.data.starts_with(b"pk:") {
            return Err(PairwiseError::Engine("malformed prekey".into()));
        }
        if self.store.sessions.contains_key(session_id) {
            return Err(PairwiseError::SessionExists(session_id.clone()));
        }
        self.store
            .sessions
            .insert(session_id.clone(), FakeSession { sent: 0, seen: HashSet::new() });
        Ok(())
    }

    async fn delete_session(&mut self, session_id: &SessionId) -> Result<(), PairwiseError> {
        self.store
            .sessions
            .remove(session_id)
            .map(|_| ())
            .ok_or_else(|| PairwiseError::SessionNotFound(session_id.clone()))
    }

    async fn encrypt(
        &mut self,
        session_id: &SessionId,
        plaintext: &[u8],
    ) -> Result<Bytes, PairwiseError> {
        let session = self.session_mut(session_id)?;
        let counter = session.sent;
        session.sent += 1;
        let mut ciphertext = format!("p:{session_id}:{counter}:").into_bytes();
        ciphertext.extend_from_slice(plaintext);
        Ok(Bytes::from(ciphertext))
    }

    async fn encrypt_batched(
        &mut self,
        session_ids: &[SessionId],
        plaintext: &[u8],
    ) -> Result<HashMap<SessionId, Bytes>, PairwiseError> {
        let mut out = HashMap::with_capacity(session_ids.len());
        for session_id in session_ids {
            let ciphertext = self.encrypt(session_id, plaintext).await?;
            out.insert(session_id.clone(), ciphertext);
        }
        Ok(out)
    }

    async fn decrypt(
        &mut self,
        session_id: &SessionId,
        ciphertext: &[u8],
    ) -> Result<Bytes, PairwiseError> {
        let prefix = format!("p:{session_id}:").into_bytes();
        let id = session_id.clone();
        let session = self.session_mut(session_id)?;
        let rest = ciphertext
            .strip_prefix(prefix.as_slice())
            .ok_or_else(|| PairwiseError::Engine("ciphertext for another session".into()))?;
        // The payload is raw bytes; only the header up to the counter
        // delimiter is text.
        let delimiter = rest
            .iter()
            .position(|byte| *byte == b':')
            .ok_or_else(|| PairwiseError::Engine("malformed ciphertext".into()))?;
        let counter: u64 = std::str::from_utf8(&rest[..delimiter])
            .ok()
            .and_then(|text| text.parse().ok())
            .ok_or_else(|| PairwiseError::Engine("malformed ciphertext".into()))?;
        if !session.seen.insert(counter) {
            return Err(PairwiseError::DuplicateMessage(id));
        }
        Ok(Bytes::copy_from_slice(&rest[delimiter + 1..]))
    }

    async fn local_fingerprint(&mut self) -> Result<String, PairwiseError> {
        Ok("fp:local".into())
    }

    async fn remote_fingerprint(
        &mut self,
        session_id: &SessionId,
    ) -> Result<String, PairwiseError> {
        self.session_mut(session_id)?;
        Ok(format!("fp:{session_id}"))
    }

    async fn fingerprint_from_prekey(&mut self, prekey: &PreKey) -> Result<String, PairwiseError> {
        Ok(format!("fp:pk:{}", prekey.id))
    }

    async fn new_prekeys(&mut self, from: u16, count: u16) -> Result<Vec<PreKey>, PairwiseError> {
        Ok((0..count).map(|offset| Self::prekey(from + offset)).collect())
    }

    async fn new_last_resort_prekey(&mut self) -> Result<PreKey, PairwiseError> {
        Ok(Self::prekey(u16::MAX))
    }
}
