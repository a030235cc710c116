//! Pairwise session manager: per-peer session lifecycle over the pairwise
//! engine.
//!
//! A [`PairwiseContext`] only exists inside a transaction. It keeps a
//! known-session cache so repeated existence checks for the same peer skip
//! the engine, mirroring how the session store is consulted during message
//! fan-out.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;

use crate::{
    engine::{PairwiseEngine, PreKey},
    error::PairwiseError,
    ids::{PreKeyBundleMap, SessionId},
};

/// Pairwise protocol surface of one transaction.
pub struct PairwiseContext<'tx> {
    pub(crate) engine: &'tx mut dyn PairwiseEngine,
    pub(crate) known_sessions: &'tx mut HashSet<SessionId>,
}

impl PairwiseContext<'_> {
    /// Whether a session with this peer exists.
    ///
    /// Queryable before `create_session` to avoid duplicate session
    /// creation. Positive answers are cached for the lifetime of the
    /// provider.
    pub async fn session_exists(&mut self, session_id: &SessionId) -> Result<bool, PairwiseError> {
        if self.known_sessions.contains(session_id) {
            return Ok(true);
        }
        let exists = self.engine.session_exists(session_id).await?;
        if exists {
            self.known_sessions.insert(session_id.clone());
        }
        Ok(exists)
    }

    /// Create a session from a one-time prekey.
    pub async fn create_session(
        &mut self,
        prekey: &PreKey,
        session_id: &SessionId,
    ) -> Result<(), PairwiseError> {
        self.engine.create_session(prekey, session_id).await?;
        self.known_sessions.insert(session_id.clone());
        Ok(())
    }

    /// Delete a session.
    pub async fn delete_session(&mut self, session_id: &SessionId) -> Result<(), PairwiseError> {
        self.known_sessions.remove(session_id);
        self.engine.delete_session(session_id).await
    }

    /// Batch session bootstrap over a domain → user → client → prekey map.
    ///
    /// Creates one session per leaf entry, deriving each session id from its
    /// (domain, user, client) triple. This bootstrap is NOT atomic as a
    /// whole: it iterates sequentially and a failure partway through leaves
    /// previously-created sessions intact. Callers must handle partial
    /// completion, typically by re-querying [`PairwiseContext::session_exists`]
    /// before retrying the batch.
    ///
    /// Returns the number of sessions created.
    pub async fn create_sessions(
        &mut self,
        prekeys: &PreKeyBundleMap,
    ) -> Result<usize, PairwiseError> {
        let mut created = 0;
        for (domain, users) in prekeys {
            for (user, clients) in users {
                for (client, prekey) in clients {
                    let session_id = SessionId::from_parts(domain, user, client);
                    self.create_session(prekey, &session_id).await?;
                    created += 1;
                }
            }
        }
        tracing::debug!(created, "batch session bootstrap finished");
        Ok(created)
    }

    /// Encrypt for one established session.
    pub async fn encrypt(
        &mut self,
        session_id: &SessionId,
        plaintext: &[u8],
    ) -> Result<Bytes, PairwiseError> {
        self.engine.encrypt(session_id, plaintext).await
    }

    /// Encrypt one plaintext for many sessions (group fan-out over the
    /// pairwise protocol). Returns a ciphertext per session id.
    pub async fn encrypt_batched(
        &mut self,
        session_ids: &[SessionId],
        plaintext: &[u8],
    ) -> Result<HashMap<SessionId, Bytes>, PairwiseError> {
        self.engine.encrypt_batched(session_ids, plaintext).await
    }

    /// Encrypt a first-contact message before a session formally exists.
    ///
    /// Establishes the session from the prekey, then encrypts with it.
    pub async fn encrypt_with_prekey(
        &mut self,
        prekey: &PreKey,
        session_id: &SessionId,
        plaintext: &[u8],
    ) -> Result<Bytes, PairwiseError> {
        self.create_session(prekey, session_id).await?;
        self.engine.encrypt(session_id, plaintext).await
    }

    /// Decrypt from one established session.
    pub async fn decrypt(
        &mut self,
        session_id: &SessionId,
        ciphertext: &[u8],
    ) -> Result<Bytes, PairwiseError> {
        self.engine.decrypt(session_id, ciphertext).await
    }

    /// Fingerprint of the local identity key.
    pub async fn local_fingerprint(&mut self) -> Result<String, PairwiseError> {
        self.engine.local_fingerprint().await
    }

    /// Fingerprint of the remote identity key of a session.
    pub async fn remote_fingerprint(
        &mut self,
        session_id: &SessionId,
    ) -> Result<String, PairwiseError> {
        self.engine.remote_fingerprint(session_id).await
    }

    /// Fingerprint of the identity key inside a prekey bundle.
    pub async fn fingerprint_from_prekey(
        &mut self,
        prekey: &PreKey,
    ) -> Result<String, PairwiseError> {
        self.engine.fingerprint_from_prekey(prekey).await
    }

    /// Generate `count` one-time prekeys starting at id `from`.
    pub async fn new_prekeys(&mut self, from: u16, count: u16) -> Result<Vec<PreKey>, PairwiseError> {
        self.engine.new_prekeys(from, count).await
    }

    /// The last-resort prekey under the engine's reserved id.
    pub async fn new_last_resort_prekey(&mut self) -> Result<PreKey, PairwiseError> {
        self.engine.new_last_resort_prekey().await
    }
}
