//! Session engine facade: typed contracts for the opaque crypto engine.
//!
//! The actual group-keying and pairwise-ratchet primitives live behind these
//! traits; this crate never implements them. The coordinator drives both
//! engines through the transaction hooks so that multi-step operations are
//! atomic with respect to the underlying key stores.
//!
//! Implementations are not safe for concurrent mutation. All access is
//! serialized by [`crate::transaction::CryptoTransactionProvider`].

use std::{
    collections::HashMap,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    error::{GroupError, PairwiseError},
    ids::{GroupId, QualifiedClientId, QualifiedUserId, SessionId},
};

/// A signed, single-use credential bundle allowing this client to be added
/// to a group by another party.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPackage(Bytes);

impl KeyPackage {
    /// Wrap serialized key package bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Serialized key package bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Serialized welcome message inviting this client into an existing group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Welcome(Bytes);

impl Welcome {
    /// Wrap serialized welcome bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Serialized welcome bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Serialized public group state used for external joins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo(Bytes);

impl GroupInfo {
    /// Wrap serialized public group state.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Serialized public group state bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Public signature key of a sender that is external to the group
/// (the distribution service's removal key).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalSenderKey(Bytes);

impl ExternalSenderKey {
    /// Wrap a serialized external sender public key.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Serialized public key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// PEM-encoded device certificate issued by the identity enrollment flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate(String);

impl Certificate {
    /// Wrap a PEM certificate chain.
    pub fn new(pem: impl Into<String>) -> Self {
        Self(pem.into())
    }

    /// PEM text of the certificate chain.
    pub fn as_pem(&self) -> &str {
        &self.0
    }
}

/// One-time prekey for bootstrapping a pairwise session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKey {
    /// Prekey id; the engine reserves the maximum id for the last-resort
    /// prekey.
    pub id: u16,

    /// Serialized public prekey bundle.
    pub data: Bytes,
}

/// Result of a keying-material-changing operation.
///
/// The caller must transmit this to the distribution service and report
/// acceptance via `commit_accepted` before the epoch advances. Replaying the
/// producing operation without acceptance is not idempotent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitBundle {
    /// Serialized commit message.
    pub commit: Bytes,

    /// Welcome for members added by this commit, when any.
    pub welcome: Option<Welcome>,

    /// Refreshed public group state for external joiners.
    pub group_info: GroupInfo,

    /// Certificate-revocation distribution points newly discovered while
    /// validating member credentials. Must be forwarded to the revocation
    /// freshness worker.
    pub crl_new_distribution_points: Vec<String>,
}

/// Result of processing a welcome message or an external join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WelcomeBundle {
    /// Group this client just joined.
    pub group_id: GroupId,

    /// Newly discovered certificate-revocation distribution points.
    pub crl_new_distribution_points: Vec<String>,
}

/// One decrypted message produced by `decrypt_message`.
///
/// Handshake messages decrypt to zero bundles; buffered out-of-order
/// messages can release several bundles at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedMessage {
    /// Application payload; `None` for protocol-internal messages.
    pub message: Option<Bytes>,

    /// Sender of the message when the engine could attribute it.
    pub sender: Option<QualifiedClientId>,

    /// True when processing this message advanced the group epoch.
    pub has_epoch_changed: bool,

    /// Hint to delay the next own commit, when the engine suggests one.
    pub commit_delay: Option<Duration>,

    /// Newly discovered certificate-revocation distribution points.
    pub crl_new_distribution_points: Vec<String>,
}

/// Verification status of a device credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    /// Certificate present and valid.
    Valid,

    /// Certificate expired.
    Expired,

    /// Certificate revoked by its issuer.
    Revoked,
}

/// End-to-end identity of one device as seen inside a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Device this identity belongs to.
    pub client_id: QualifiedClientId,

    /// Verification status of the device credential.
    pub status: CredentialStatus,

    /// Thumbprint of the credential public key.
    pub thumbprint: String,

    /// The device certificate, when an end-to-end identity credential is
    /// in use.
    pub certificate: Option<Certificate>,
}

/// Outcome of registering a revocation list with the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrlRegistration {
    /// True when the new list changed the status of a known credential.
    pub dirty: bool,

    /// When the registered list itself expires, if the engine knows.
    pub expiration: Option<SystemTime>,
}

/// Group-keying engine operations, one method per engine primitive.
///
/// Stale-epoch operations fail with [`GroupError::StaleEpoch`] rather than
/// silently applying; an already-processed message fails with
/// [`GroupError::DuplicateMessage`], distinct from wrong-key failures.
#[async_trait]
pub trait GroupEngine: Send {
    /// Begin an engine-level transaction over the group key store.
    async fn begin(&mut self) -> Result<(), GroupError>;

    /// Commit the current engine-level transaction.
    async fn commit(&mut self) -> Result<(), GroupError>;

    /// Roll back the current engine-level transaction, discarding every
    /// mutation made since [`GroupEngine::begin`].
    async fn rollback(&mut self) -> Result<(), GroupError>;

    /// Generate at least `amount` fresh key packages. The engine may
    /// over-provision.
    async fn generate_key_packages(&mut self, amount: usize) -> Result<Vec<KeyPackage>, GroupError>;

    /// Number of issued key packages that have not been consumed.
    async fn valid_key_package_count(&mut self) -> Result<u64, GroupError>;

    /// Establish a group at epoch 0 with this client as sole member.
    async fn create_conversation(
        &mut self,
        group_id: &GroupId,
        external_senders: &[ExternalSenderKey],
    ) -> Result<(), GroupError>;

    /// Join an existing group from its public group state, without an
    /// invitation.
    async fn join_by_external_commit(
        &mut self,
        group_info: &GroupInfo,
    ) -> Result<WelcomeBundle, GroupError>;

    /// Process a welcome message; the group is usable afterwards.
    async fn process_welcome(&mut self, welcome: &Welcome) -> Result<WelcomeBundle, GroupError>;

    /// Add members from their key packages, producing a commit.
    async fn add_members(
        &mut self,
        group_id: &GroupId,
        key_packages: &[KeyPackage],
    ) -> Result<CommitBundle, GroupError>;

    /// Remove members, producing a commit.
    async fn remove_members(
        &mut self,
        group_id: &GroupId,
        members: &[QualifiedClientId],
    ) -> Result<CommitBundle, GroupError>;

    /// Rotate own keying material, producing a commit.
    async fn update_keying_material(&mut self, group_id: &GroupId)
    -> Result<CommitBundle, GroupError>;

    /// Commit all buffered proposals. `None` when there is nothing to
    /// commit.
    async fn commit_pending_proposals(
        &mut self,
        group_id: &GroupId,
    ) -> Result<Option<CommitBundle>, GroupError>;

    /// The distribution service accepted the previously produced commit;
    /// only now does the epoch advance from the engine's perspective.
    async fn commit_accepted(&mut self, group_id: &GroupId) -> Result<(), GroupError>;

    /// Encrypt an application message for the group.
    async fn encrypt_message(
        &mut self,
        group_id: &GroupId,
        plaintext: &[u8],
    ) -> Result<Bytes, GroupError>;

    /// Decrypt a group message. Zero bundles for handshake messages.
    async fn decrypt_message(
        &mut self,
        group_id: &GroupId,
        ciphertext: &[u8],
    ) -> Result<Vec<DecryptedMessage>, GroupError>;

    /// Current epoch of the group.
    async fn conversation_epoch(&mut self, group_id: &GroupId) -> Result<u64, GroupError>;

    /// Whether the group exists in the local store.
    async fn conversation_exists(&mut self, group_id: &GroupId) -> Result<bool, GroupError>;

    /// Current member set of the group.
    async fn members(&mut self, group_id: &GroupId) -> Result<Vec<QualifiedClientId>, GroupError>;

    /// Export a secret of `length` bytes from the group's key schedule.
    async fn derive_secret(&mut self, group_id: &GroupId, length: u32) -> Result<Bytes, GroupError>;

    /// Install an enrolled device certificate. Returns newly discovered
    /// revocation distribution points.
    async fn save_x509_credential(
        &mut self,
        certificate: &Certificate,
    ) -> Result<Vec<String>, GroupError>;

    /// Rotate the credential used in the given group after enrollment.
    async fn rotate_credential(&mut self, group_id: &GroupId) -> Result<(), GroupError>;

    /// Whether an end-to-end identity credential is active for this client.
    async fn is_e2ei_enabled(&mut self) -> Result<bool, GroupError>;

    /// Per-device verification identities inside a group.
    async fn device_identities(
        &mut self,
        group_id: &GroupId,
        clients: &[QualifiedClientId],
    ) -> Result<Vec<DeviceIdentity>, GroupError>;

    /// Per-user verification identities inside a group, keyed by user id.
    async fn user_identities(
        &mut self,
        group_id: &GroupId,
        users: &[QualifiedUserId],
    ) -> Result<HashMap<String, Vec<DeviceIdentity>>, GroupError>;

    /// Delete issued key packages that can no longer be consumed.
    async fn remove_stale_key_packages(&mut self) -> Result<(), GroupError>;

    /// Register a revocation list document fetched from `url`.
    async fn register_crl(
        &mut self,
        url: &str,
        document: &[u8],
    ) -> Result<CrlRegistration, GroupError>;
}

/// Pairwise (double-ratchet) engine operations.
#[async_trait]
pub trait PairwiseEngine: Send {
    /// Begin an engine-level transaction over the session store.
    async fn begin(&mut self) -> Result<(), PairwiseError>;

    /// Commit the current engine-level transaction.
    async fn commit(&mut self) -> Result<(), PairwiseError>;

    /// Roll back the current engine-level transaction.
    async fn rollback(&mut self) -> Result<(), PairwiseError>;

    /// Whether a session exists in the session store.
    async fn session_exists(&mut self, session_id: &SessionId) -> Result<bool, PairwiseError>;

    /// Create a session from a one-time prekey.
    async fn create_session(
        &mut self,
        prekey: &PreKey,
        session_id: &SessionId,
    ) -> Result<(), PairwiseError>;

    /// Delete a session. Deleting an unknown session is an error.
    async fn delete_session(&mut self, session_id: &SessionId) -> Result<(), PairwiseError>;

    /// Encrypt for one established session.
    async fn encrypt(
        &mut self,
        session_id: &SessionId,
        plaintext: &[u8],
    ) -> Result<Bytes, PairwiseError>;

    /// Encrypt one plaintext for many sessions (group fan-out over the
    /// pairwise protocol).
    async fn encrypt_batched(
        &mut self,
        session_ids: &[SessionId],
        plaintext: &[u8],
    ) -> Result<HashMap<SessionId, Bytes>, PairwiseError>;

    /// Decrypt from one established session.
    async fn decrypt(
        &mut self,
        session_id: &SessionId,
        ciphertext: &[u8],
    ) -> Result<Bytes, PairwiseError>;

    /// Fingerprint of the local identity key.
    async fn local_fingerprint(&mut self) -> Result<String, PairwiseError>;

    /// Fingerprint of the remote identity key of a session.
    async fn remote_fingerprint(&mut self, session_id: &SessionId) -> Result<String, PairwiseError>;

    /// Fingerprint of the identity key inside a prekey bundle.
    async fn fingerprint_from_prekey(&mut self, prekey: &PreKey) -> Result<String, PairwiseError>;

    /// Generate `count` one-time prekeys starting at id `from`.
    async fn new_prekeys(&mut self, from: u16, count: u16) -> Result<Vec<PreKey>, PairwiseError>;

    /// The last-resort prekey under the engine's reserved id.
    async fn new_last_resort_prekey(&mut self) -> Result<PreKey, PairwiseError>;
}
