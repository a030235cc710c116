//! In-memory fake of the group session engine.
//!
//! Behaves like the real engine at the contract level: epoch only advances
//! after commit acceptance, stale or duplicate ciphertexts fail with
//! distinct errors, key packages are single-use, and `begin`/`rollback`
//! snapshot and restore the whole store so transaction atomicity is
//! observable from tests.
//!
//! Wire shapes are readable placeholders, not real cryptography:
//! key packages are `kp:{client}:{seq}`, welcomes `w:{group-bytes}`,
//! group info `gi:{group-bytes}`, application ciphertexts
//! `g:{epoch}:{seq}:{plaintext}` and handshake messages start with `h:`.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use bytes::Bytes;
use latchkey_core::{
    engine::{
        Certificate, CommitBundle, CredentialStatus, CrlRegistration, DecryptedMessage,
        DeviceIdentity, ExternalSenderKey, GroupEngine, GroupInfo, KeyPackage, Welcome,
        WelcomeBundle,
    },
    error::GroupError,
    ids::{GroupId, QualifiedClientId, QualifiedUserId},
};

#[derive(Clone)]
struct StagedCommit {
    epoch: u64,
    members: Vec<QualifiedClientId>,
}

#[derive(Clone)]
struct FakeGroup {
    epoch: u64,
    members: Vec<QualifiedClientId>,
    staged: Option<StagedCommit>,
    processed: HashSet<u64>,
    next_seq: u64,
}

#[derive(Clone, Default)]
struct GroupStore {
    groups: HashMap<GroupId, FakeGroup>,
    issued_packages: HashSet<Vec<u8>>,
    consumed_packages: HashSet<Vec<u8>>,
    installed_certificates: Vec<Certificate>,
    e2ei_enabled: bool,
}

/// Scriptable in-memory [`GroupEngine`].
pub struct FakeGroupEngine {
    identity: QualifiedClientId,
    store: GroupStore,
    snapshot: Option<GroupStore>,
    package_seq: u64,
    /// Distribution points reported by the next member-adding or
    /// credential-installing operation.
    pending_distribution_points: Vec<String>,
    crl_expirations: HashMap<String, std::time::SystemTime>,
}

impl FakeGroupEngine {
    /// Engine owned by `identity`.
    pub fn new(identity: QualifiedClientId) -> Self {
        Self {
            identity,
            store: GroupStore::default(),
            snapshot: None,
            package_seq: 0,
            pending_distribution_points: Vec::new(),
            crl_expirations: HashMap::new(),
        }
    }

    /// Script the distribution points surfaced by the next add/install.
    pub fn set_distribution_points(&mut self, urls: Vec<String>) {
        self.pending_distribution_points = urls;
    }

    /// Script the expiration returned when a CRL for `url` is registered.
    pub fn set_crl_expiration(&mut self, url: impl Into<String>, expires: std::time::SystemTime) {
        self.crl_expirations.insert(url.into(), expires);
    }

    /// A key package as another client would publish it.
    pub fn key_package_for(client: &QualifiedClientId, seq: u64) -> KeyPackage {
        KeyPackage::new(format!("kp:{client}:{seq}").into_bytes())
    }

    /// A welcome message for `group_id`, as carried inside a commit bundle.
    pub fn welcome_for(group_id: &GroupId) -> Welcome {
        let mut bytes = b"w:".to_vec();
        bytes.extend_from_slice(group_id.as_bytes());
        Welcome::new(bytes)
    }

    /// Public group state for `group_id`.
    pub fn group_info_for(group_id: &GroupId) -> GroupInfo {
        let mut bytes = b"gi:".to_vec();
        bytes.extend_from_slice(group_id.as_bytes());
        GroupInfo::new(bytes)
    }

    /// A handshake message: decrypts to zero bundles.
    pub fn handshake_message() -> Bytes {
        Bytes::from_static(b"h:")
    }

    fn group(&self, group_id: &GroupId) -> Result<&FakeGroup, GroupError> {
        self.store.groups.get(group_id).ok_or_else(|| GroupError::NotFound(group_id.clone()))
    }

    fn group_mut(&mut self, group_id: &GroupId) -> Result<&mut FakeGroup, GroupError> {
        self.store.groups.get_mut(group_id).ok_or_else(|| GroupError::NotFound(group_id.clone()))
    }

    fn take_distribution_points(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending_distribution_points)
    }

    fn stage_commit(
        &mut self,
        group_id: &GroupId,
        members: Vec<QualifiedClientId>,
    ) -> Result<CommitBundle, GroupError> {
        let points = self.take_distribution_points();
        let group = self.group_mut(group_id)?;
        if group.staged.is_some() {
            return Err(GroupError::Engine("commit already staged".into()));
        }
        let epoch = group.epoch + 1;
        group.staged = Some(StagedCommit { epoch, members });
        Ok(CommitBundle {
            commit: Bytes::from(format!("c:{epoch}").into_bytes()),
            welcome: Some(Self::welcome_for(group_id)),
            group_info: Self::group_info_for(group_id),
            crl_new_distribution_points: points,
        })
    }

    fn parse_group_ref(bytes: &[u8], prefix: &[u8]) -> Result<GroupId, GroupError> {
        bytes
            .strip_prefix(prefix)
            .map(GroupId::from)
            .ok_or_else(|| GroupError::Engine("malformed group reference".into()))
    }
}

/// Parse a decimal header field terminated by `:`, returning it with the
/// rest of the input.
fn split_field(bytes: &[u8]) -> Option<(u64, &[u8])> {
    let delimiter = bytes.iter().position(|byte| *byte == b':')?;
    let value = std::str::from_utf8(&bytes[..delimiter]).ok()?.parse().ok()?;
    Some((value, &bytes[delimiter + 1..]))
}

#[async_trait]
impl GroupEngine for FakeGroupEngine {
    async fn begin(&mut self) -> Result<(), GroupError> {
        if self.snapshot.is_some() {
            return Err(GroupError::Engine("transaction already open".into()));
        }
        self.snapshot = Some(self.store.clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), GroupError> {
        if self.snapshot.take().is_none() {
            return Err(GroupError::Engine("no open transaction".into()));
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), GroupError> {
        match self.snapshot.take() {
            Some(snapshot) => {
                self.store = snapshot;
                Ok(())
            },
            None => Err(GroupError::Engine("no open transaction".into())),
        }
    }

    async fn generate_key_packages(&mut self, amount: usize) -> Result<Vec<KeyPackage>, GroupError> {
        // Over-provision by two, like the real engine is allowed to.
        let mut packages = Vec::with_capacity(amount + 2);
        for _ in 0..amount + 2 {
            self.package_seq += 1;
            let package = Self::key_package_for(&self.identity, self.package_seq);
            self.store.issued_packages.insert(package.as_bytes().to_vec());
            packages.push(package);
        }
        Ok(packages)
    }

    async fn valid_key_package_count(&mut self) -> Result<u64, GroupError> {
        Ok(self.store.issued_packages.len() as u64)
    }

    async fn create_conversation(
        &mut self,
        group_id: &GroupId,
        _external_senders: &[ExternalSenderKey],
    ) -> Result<(), GroupError> {
        if self.store.groups.contains_key(group_id) {
            return Err(GroupError::AlreadyExists(group_id.clone()));
        }
        self.store.groups.insert(
            group_id.clone(),
            FakeGroup {
                epoch: 0,
                members: vec![self.identity.clone()],
                staged: None,
                processed: HashSet::new(),
                next_seq: 0,
            },
        );
        Ok(())
    }

    async fn join_by_external_commit(
        &mut self,
        group_info: &GroupInfo,
    ) -> Result<WelcomeBundle, GroupError> {
        let group_id = Self::parse_group_ref(group_info.as_bytes(), b"gi:")?;
        self.store.groups.insert(
            group_id.clone(),
            FakeGroup {
                epoch: 1,
                members: vec![self.identity.clone()],
                staged: None,
                processed: HashSet::new(),
                next_seq: 0,
            },
        );
        let points = self.take_distribution_points();
        Ok(WelcomeBundle { group_id, crl_new_distribution_points: points })
    }

    async fn process_welcome(&mut self, welcome: &Welcome) -> Result<WelcomeBundle, GroupError> {
        let group_id = Self::parse_group_ref(welcome.as_bytes(), b"w:")?;
        self.store.groups.insert(
            group_id.clone(),
            FakeGroup {
                epoch: 1,
                members: vec![self.identity.clone()],
                staged: None,
                processed: HashSet::new(),
                next_seq: 0,
            },
        );
        let points = self.take_distribution_points();
        Ok(WelcomeBundle { group_id, crl_new_distribution_points: points })
    }

    async fn add_members(
        &mut self,
        group_id: &GroupId,
        key_packages: &[KeyPackage],
    ) -> Result<CommitBundle, GroupError> {
        let mut members = self.group(group_id)?.members.clone();
        for package in key_packages {
            let bytes = package.as_bytes().to_vec();
            if self.store.consumed_packages.contains(&bytes) {
                return Err(GroupError::ConsumedKeyPackage);
            }
            let text = std::str::from_utf8(&bytes)
                .map_err(|_| GroupError::Engine("malformed key package".into()))?;
            let client: QualifiedClientId = text
                .strip_prefix("kp:")
                .and_then(|rest| rest.rsplit_once(':'))
                .and_then(|(client, _seq)| client.parse().ok())
                .ok_or_else(|| GroupError::Engine("malformed key package".into()))?;
            self.store.consumed_packages.insert(bytes.clone());
            self.store.issued_packages.remove(&bytes);
            members.push(client);
        }
        self.stage_commit(group_id, members)
    }

    async fn remove_members(
        &mut self,
        group_id: &GroupId,
        members: &[QualifiedClientId],
    ) -> Result<CommitBundle, GroupError> {
        let remaining: Vec<_> = self
            .group(group_id)?
            .members
            .iter()
            .filter(|member| !members.contains(member))
            .cloned()
            .collect();
        self.stage_commit(group_id, remaining)
    }

    async fn update_keying_material(
        &mut self,
        group_id: &GroupId,
    ) -> Result<CommitBundle, GroupError> {
        let members = self.group(group_id)?.members.clone();
        self.stage_commit(group_id, members)
    }

    async fn commit_pending_proposals(
        &mut self,
        group_id: &GroupId,
    ) -> Result<Option<CommitBundle>, GroupError> {
        // The fake never buffers proposals, so there is nothing to commit.
        self.group(group_id)?;
        Ok(None)
    }

    async fn commit_accepted(&mut self, group_id: &GroupId) -> Result<(), GroupError> {
        let group = self.group_mut(group_id)?;
        if let Some(staged) = group.staged.take() {
            group.epoch = staged.epoch;
            group.members = staged.members;
        }
        Ok(())
    }

    async fn encrypt_message(
        &mut self,
        group_id: &GroupId,
        plaintext: &[u8],
    ) -> Result<Bytes, GroupError> {
        let group = self.group_mut(group_id)?;
        let seq = group.next_seq;
        group.next_seq += 1;
        let mut ciphertext = format!("g:{}:{}:", group.epoch, seq).into_bytes();
        ciphertext.extend_from_slice(plaintext);
        Ok(Bytes::from(ciphertext))
    }

    async fn decrypt_message(
        &mut self,
        group_id: &GroupId,
        ciphertext: &[u8],
    ) -> Result<Vec<DecryptedMessage>, GroupError> {
        if ciphertext.starts_with(b"h:") {
            // Handshake messages carry no application payload.
            self.group(group_id)?;
            return Ok(Vec::new());
        }
        let id = group_id.clone();
        let group = self.group_mut(group_id)?;
        // Header is `g:{epoch}:{seq}:`; everything after is raw payload
        // bytes.
        let rest = ciphertext.strip_prefix(b"g:").ok_or_else(|| GroupError::WrongKey(id.clone()))?;
        let (epoch, rest) = split_field(rest).ok_or_else(|| GroupError::WrongKey(id.clone()))?;
        let (seq, payload) = split_field(rest).ok_or_else(|| GroupError::WrongKey(id.clone()))?;
        if epoch != group.epoch {
            return Err(GroupError::StaleEpoch { group: id, epoch });
        }
        if !group.processed.insert(seq) {
            return Err(GroupError::DuplicateMessage(id));
        }
        Ok(vec![DecryptedMessage {
            message: Some(Bytes::copy_from_slice(payload)),
            sender: None,
            has_epoch_changed: false,
            commit_delay: None,
            crl_new_distribution_points: Vec::new(),
        }])
    }

    async fn conversation_epoch(&mut self, group_id: &GroupId) -> Result<u64, GroupError> {
        Ok(self.group(group_id)?.epoch)
    }

    async fn conversation_exists(&mut self, group_id: &GroupId) -> Result<bool, GroupError> {
        Ok(self.store.groups.contains_key(group_id))
    }

    async fn members(&mut self, group_id: &GroupId) -> Result<Vec<QualifiedClientId>, GroupError> {
        Ok(self.group(group_id)?.members.clone())
    }

    async fn derive_secret(&mut self, group_id: &GroupId, length: u32) -> Result<Bytes, GroupError> {
        let epoch = self.group(group_id)?.epoch;
        let id = group_id.as_bytes();
        let secret: Vec<u8> = (0..length as usize)
            .map(|i| id.get(i % id.len().max(1)).copied().unwrap_or(0) ^ (epoch as u8))
            .collect();
        Ok(Bytes::from(secret))
    }

    async fn save_x509_credential(
        &mut self,
        certificate: &Certificate,
    ) -> Result<Vec<String>, GroupError> {
        self.store.installed_certificates.push(certificate.clone());
        self.store.e2ei_enabled = true;
        Ok(self.take_distribution_points())
    }

    async fn rotate_credential(&mut self, group_id: &GroupId) -> Result<(), GroupError> {
        self.group(group_id)?;
        Ok(())
    }

    async fn is_e2ei_enabled(&mut self) -> Result<bool, GroupError> {
        Ok(self.store.e2ei_enabled)
    }

    async fn device_identities(
        &mut self,
        group_id: &GroupId,
        clients: &[QualifiedClientId],
    ) -> Result<Vec<DeviceIdentity>, GroupError> {
        let certificate = self.store.installed_certificates.last().cloned();
        let group = self.group(group_id)?;
        Ok(group
            .members
            .iter()
            .filter(|member| clients.contains(member))
            .map(|member| DeviceIdentity {
                client_id: member.clone(),
                status: CredentialStatus::Valid,
                thumbprint: format!("tp:{member}"),
                certificate: certificate.clone(),
            })
            .collect())
    }

    async fn user_identities(
        &mut self,
        group_id: &GroupId,
        users: &[QualifiedUserId],
    ) -> Result<HashMap<String, Vec<DeviceIdentity>>, GroupError> {
        let clients: Vec<QualifiedClientId> = self
            .group(group_id)?
            .members
            .iter()
            .filter(|member| users.contains(&member.user_id))
            .cloned()
            .collect();
        let identities = self.device_identities(group_id, &clients).await?;
        let mut by_user: HashMap<String, Vec<DeviceIdentity>> = HashMap::new();
        for identity in identities {
            by_user.entry(identity.client_id.user_id.to_string()).or_default().push(identity);
        }
        Ok(by_user)
    }

    async fn remove_stale_key_packages(&mut self) -> Result<(), GroupError> {
        self.store.issued_packages.clear();
        Ok(())
    }

    async fn register_crl(
        &mut self,
        url: &str,
        document: &[u8],
    ) -> Result<CrlRegistration, GroupError> {
        Ok(CrlRegistration {
            dirty: document.starts_with(b"dirty"),
            expiration: self.crl_expirations.get(url).copied(),
        })
    }
}
