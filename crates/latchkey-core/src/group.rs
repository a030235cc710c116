//! Group session manager: conversation lifecycle over the group engine.
//!
//! A [`GroupContext`] only exists inside a transaction, so every operation
//! here already holds exclusive access to the underlying store. On top of the
//! raw engine calls it enforces the commit lifecycle: a group with a produced
//! but not yet accepted commit rejects further commit-producing calls with
//! [`GroupError::PendingCommit`] instead of silently double-applying.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;

use crate::{
    engine::{
        Certificate, CommitBundle, CrlRegistration, DecryptedMessage, DeviceIdentity,
        ExternalSenderKey, GroupEngine, GroupInfo, KeyPackage, Welcome, WelcomeBundle,
    },
    error::GroupError,
    ids::{GroupId, QualifiedClientId, QualifiedUserId},
};

/// Group protocol surface of one transaction.
///
/// Produced commits must be transmitted to the distribution service and
/// acknowledged via [`GroupContext::commit_accepted`] before the epoch
/// advances; until then the group is marked pending and further
/// commit-producing calls fail.
pub struct GroupContext<'tx> {
    pub(crate) engine: &'tx mut dyn GroupEngine,
    pub(crate) pending_commits: &'tx mut HashSet<GroupId>,
}

impl GroupContext<'_> {
    /// Generate at least `amount` fresh key packages.
    ///
    /// The engine may over-provision; callers must not assume an exact
    /// count.
    pub async fn generate_key_packages(
        &mut self,
        amount: usize,
    ) -> Result<Vec<KeyPackage>, GroupError> {
        let packages = self.engine.generate_key_packages(amount).await?;
        debug_assert!(packages.len() >= amount);
        Ok(packages)
    }

    /// Number of issued key packages not yet consumed by an add.
    pub async fn valid_key_package_count(&mut self) -> Result<u64, GroupError> {
        self.engine.valid_key_package_count().await
    }

    /// Establish a group at epoch 0 with this client as sole member.
    pub async fn create_conversation(
        &mut self,
        group_id: &GroupId,
        external_senders: &[ExternalSenderKey],
    ) -> Result<(), GroupError> {
        self.engine.create_conversation(group_id, external_senders).await?;
        tracing::debug!(group = %group_id, "created conversation at epoch 0");
        Ok(())
    }

    /// Join an existing group from its public group state.
    pub async fn join_by_external_commit(
        &mut self,
        group_info: &GroupInfo,
    ) -> Result<WelcomeBundle, GroupError> {
        self.engine.join_by_external_commit(group_info).await
    }

    /// Process a welcome message, returning the joined group id.
    pub async fn process_welcome(&mut self, welcome: &Welcome) -> Result<WelcomeBundle, GroupError> {
        let bundle = self.engine.process_welcome(welcome).await?;
        tracing::debug!(group = %bundle.group_id, "joined group from welcome");
        Ok(bundle)
    }

    /// Add members from their key packages, producing a commit.
    ///
    /// The bundle's `crl_new_distribution_points` must be forwarded to the
    /// revocation freshness worker.
    pub async fn add_members(
        &mut self,
        group_id: &GroupId,
        key_packages: &[KeyPackage],
    ) -> Result<CommitBundle, GroupError> {
        if key_packages.is_empty() {
            return Err(GroupError::NothingToCommit(group_id.clone()));
        }
        self.guard_no_pending(group_id)?;
        let bundle = self.engine.add_members(group_id, key_packages).await?;
        self.mark_pending(group_id);
        Ok(bundle)
    }

    /// Remove members, producing a commit.
    ///
    /// A second remove before `commit_accepted` fails with
    /// [`GroupError::PendingCommit`] so a retried removal can never
    /// double-apply; callers must confirm acceptance of the first commit
    /// before retrying.
    pub async fn remove_members(
        &mut self,
        group_id: &GroupId,
        members: &[QualifiedClientId],
    ) -> Result<CommitBundle, GroupError> {
        if members.is_empty() {
            return Err(GroupError::NothingToCommit(group_id.clone()));
        }
        self.guard_no_pending(group_id)?;
        let bundle = self.engine.remove_members(group_id, members).await?;
        self.mark_pending(group_id);
        Ok(bundle)
    }

    /// Rotate own keying material, producing a commit.
    pub async fn update_keying_material(
        &mut self,
        group_id: &GroupId,
    ) -> Result<CommitBundle, GroupError> {
        self.guard_no_pending(group_id)?;
        let bundle = self.engine.update_keying_material(group_id).await?;
        self.mark_pending(group_id);
        Ok(bundle)
    }

    /// Commit all buffered proposals. `None` when there is nothing to
    /// commit.
    pub async fn commit_pending_proposals(
        &mut self,
        group_id: &GroupId,
    ) -> Result<Option<CommitBundle>, GroupError> {
        self.guard_no_pending(group_id)?;
        let bundle = self.engine.commit_pending_proposals(group_id).await?;
        if bundle.is_some() {
            self.mark_pending(group_id);
        }
        Ok(bundle)
    }

    /// The distribution service accepted the previously produced commit.
    ///
    /// Clears the pending marker; only after this call does the epoch
    /// advance from the engine's perspective.
    pub async fn commit_accepted(&mut self, group_id: &GroupId) -> Result<(), GroupError> {
        self.engine.commit_accepted(group_id).await?;
        self.pending_commits.remove(group_id);
        tracing::debug!(group = %group_id, "commit accepted");
        Ok(())
    }

    /// True when a produced commit for this group awaits acceptance.
    pub fn has_pending_commit(&self, group_id: &GroupId) -> bool {
        self.pending_commits.contains(group_id)
    }

    /// Encrypt an application message for the group.
    pub async fn encrypt_message(
        &mut self,
        group_id: &GroupId,
        plaintext: &[u8],
    ) -> Result<Bytes, GroupError> {
        self.engine.encrypt_message(group_id, plaintext).await
    }

    /// Decrypt a group message.
    ///
    /// Handshake messages decrypt to zero bundles; this is expected, not an
    /// error. An already-processed message fails with
    /// [`GroupError::DuplicateMessage`] so duplicate delivery stays
    /// distinguishable from wrong-key failures.
    pub async fn decrypt_message(
        &mut self,
        group_id: &GroupId,
        ciphertext: &[u8],
    ) -> Result<Vec<DecryptedMessage>, GroupError> {
        self.engine.decrypt_message(group_id, ciphertext).await
    }

    /// Current epoch of the group.
    pub async fn conversation_epoch(&mut self, group_id: &GroupId) -> Result<u64, GroupError> {
        self.engine.conversation_epoch(group_id).await
    }

    /// Whether the group exists in the local store.
    pub async fn conversation_exists(&mut self, group_id: &GroupId) -> Result<bool, GroupError> {
        self.engine.conversation_exists(group_id).await
    }

    /// Current member set of the group.
    pub async fn members(&mut self, group_id: &GroupId) -> Result<Vec<QualifiedClientId>, GroupError> {
        self.engine.members(group_id).await
    }

    /// Export a secret of `length` bytes from the group's key schedule.
    pub async fn derive_secret(
        &mut self,
        group_id: &GroupId,
        length: u32,
    ) -> Result<Bytes, GroupError> {
        self.engine.derive_secret(group_id, length).await
    }

    /// Install a device certificate obtained from identity enrollment.
    ///
    /// Returns newly discovered revocation distribution points for the
    /// revocation freshness worker.
    pub async fn install_certificate(
        &mut self,
        certificate: &Certificate,
    ) -> Result<Vec<String>, GroupError> {
        let distribution_points = self.engine.save_x509_credential(certificate).await?;
        tracing::info!(
            new_distribution_points = distribution_points.len(),
            "installed device certificate"
        );
        Ok(distribution_points)
    }

    /// Rotate the credential in each given group after enrollment.
    pub async fn rotate_credentials(&mut self, groups: &[GroupId]) -> Result<(), GroupError> {
        for group_id in groups {
            self.engine.rotate_credential(group_id).await?;
        }
        Ok(())
    }

    /// Whether an end-to-end identity credential is active for this client.
    pub async fn is_end_to_end_identity_active(&mut self) -> Result<bool, GroupError> {
        self.engine.is_e2ei_enabled().await
    }

    /// Per-device verification identities inside a group.
    pub async fn device_identities(
        &mut self,
        group_id: &GroupId,
        clients: &[QualifiedClientId],
    ) -> Result<Vec<DeviceIdentity>, GroupError> {
        self.engine.device_identities(group_id, clients).await
    }

    /// Per-user verification identities inside a group, keyed by user id.
    pub async fn user_identities(
        &mut self,
        group_id: &GroupId,
        users: &[QualifiedUserId],
    ) -> Result<HashMap<String, Vec<DeviceIdentity>>, GroupError> {
        self.engine.user_identities(group_id, users).await
    }

    /// Delete issued key packages that can no longer be consumed.
    pub async fn remove_stale_key_packages(&mut self) -> Result<(), GroupError> {
        self.engine.remove_stale_key_packages().await
    }

    /// Register a revocation list document fetched from `url`.
    ///
    /// Called by the revocation freshness worker when an expired cache
    /// entry is refreshed.
    pub async fn register_crl(
        &mut self,
        url: &str,
        document: &[u8],
    ) -> Result<CrlRegistration, GroupError> {
        self.engine.register_crl(url, document).await
    }

    fn guard_no_pending(&self, group_id: &GroupId) -> Result<(), GroupError> {
        if self.pending_commits.contains(group_id) {
            return Err(GroupError::PendingCommit(group_id.clone()));
        }
        Ok(())
    }

    fn mark_pending(&mut self, group_id: &GroupId) {
        self.pending_commits.insert(group_id.clone());
    }
}
