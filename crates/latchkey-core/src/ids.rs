//! Qualified identifiers for users, clients, groups, and pairwise sessions.
//!
//! All identifiers are qualified by a federation domain. The encoded forms
//! round-trip through `Display`/`parse` and are the only representations that
//! cross the engine facade.

use std::{collections::BTreeMap, fmt, str::FromStr};

use bytes::Bytes;
use thiserror::Error;

use crate::engine::PreKey;

/// Error returned when an encoded identifier does not match the expected
/// shape.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed identifier: {0}")]
pub struct ParseIdError(pub String);

/// A user qualified by the federation domain that owns the account.
///
/// Encoded as `user@domain`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedUserId {
    /// Opaque per-domain user identifier.
    pub user: String,

    /// Federation domain owning the account.
    pub domain: String,
}

impl QualifiedUserId {
    /// Build a qualified user id from its parts.
    pub fn new(user: impl Into<String>, domain: impl Into<String>) -> Self {
        Self { user: user.into(), domain: domain.into() }
    }
}

impl fmt::Display for QualifiedUserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.domain)
    }
}

impl FromStr for QualifiedUserId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user, domain) =
            s.split_once('@').ok_or_else(|| ParseIdError(format!("missing '@' in {s:?}")))?;
        if user.is_empty() || domain.is_empty() {
            return Err(ParseIdError(format!("empty user or domain in {s:?}")));
        }
        Ok(Self::new(user, domain))
    }
}

/// A single device of a qualified user.
///
/// Encoded as `user@domain/client`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedClientId {
    /// Owning user.
    pub user_id: QualifiedUserId,

    /// Opaque per-user device identifier.
    pub client: String,
}

impl QualifiedClientId {
    /// Build a qualified client id from its parts.
    pub fn new(user_id: QualifiedUserId, client: impl Into<String>) -> Self {
        Self { user_id, client: client.into() }
    }
}

impl fmt::Display for QualifiedClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.client)
    }
}

impl FromStr for QualifiedClientId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user, client) =
            s.split_once('/').ok_or_else(|| ParseIdError(format!("missing '/' in {s:?}")))?;
        if client.is_empty() {
            return Err(ParseIdError(format!("empty client in {s:?}")));
        }
        Ok(Self::new(user.parse()?, client))
    }
}

/// Opaque group (conversation) identifier assigned by the distribution
/// service.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(Bytes);

impl GroupId {
    /// Wrap raw identifier bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<&[u8]> for GroupId {
    fn from(bytes: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(bytes))
    }
}

/// Identifier of a pairwise session with one remote device.
///
/// Derived from the (domain, user, client) triple as `user@domain_client`.
/// [`SessionId::from_parts`] is the single derivation point; every batch
/// bootstrap entry goes through it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    /// Derive the session id for a remote device.
    pub fn from_parts(domain: &str, user: &str, client: &str) -> Self {
        Self(format!("{user}@{domain}_{client}"))
    }

    /// Derive the session id for a qualified client.
    pub fn from_client(client: &QualifiedClientId) -> Self {
        Self::from_parts(&client.user_id.domain, &client.user_id.user, &client.client)
    }

    /// Encoded session id as stored by the pairwise engine.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Nested prekey mapping used for batch session bootstrap:
/// domain → user → client → prekey.
///
/// `BTreeMap` keeps iteration order deterministic, which matters because the
/// bootstrap is sequential and explicitly non-atomic.
pub type PreKeyBundleMap = BTreeMap<String, BTreeMap<String, BTreeMap<String, PreKey>>>;
