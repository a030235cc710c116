//! Failure taxonomy for the coordination core.
//!
//! Strongly-typed errors per layer: group protocol failures, pairwise
//! protocol failures, and transaction-level failures. Engine-internal
//! conditions that have no protocol meaning here surface as the `Engine`
//! variants.
//!
//! Transaction-scoped operations never partially apply: the coordinator
//! rolls both engines back on the first failure and surfaces it unchanged.

use thiserror::Error;

use crate::ids::{GroupId, SessionId};

/// Errors from group protocol operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GroupError {
    /// Operation referenced a group this client is not a member of
    #[error("unknown group {0}")]
    NotFound(GroupId),

    /// `create_conversation` for a group that already exists locally
    #[error("group {0} already exists")]
    AlreadyExists(GroupId),

    /// Keying operation against an epoch the engine has moved past
    #[error("stale epoch {epoch} for group {group}")]
    StaleEpoch {
        /// Group the operation targeted
        group: GroupId,
        /// Epoch the operation was built against
        epoch: u64,
    },

    /// A produced commit has not been accepted yet; a second
    /// commit-producing call would risk epoch divergence
    #[error("commit already pending for group {0}")]
    PendingCommit(GroupId),

    /// Commit-producing call with nothing to commit (empty member list,
    /// no pending proposals)
    #[error("nothing to commit for group {0}")]
    NothingToCommit(GroupId),

    /// Message was already processed; duplicate delivery is benign for
    /// callers and must stay distinguishable from wrong-key failures
    #[error("duplicate message for group {0}")]
    DuplicateMessage(GroupId),

    /// Ciphertext could not be decrypted with current keying material
    #[error("wrong key material for group {0}")]
    WrongKey(GroupId),

    /// A key package was already consumed by another add
    #[error("key package already consumed")]
    ConsumedKeyPackage,

    /// Opaque failure inside the crypto engine
    #[error("group engine error: {0}")]
    Engine(String),
}

impl GroupError {
    /// Returns true if this failure means the message was already applied
    /// and the caller can drop the delivery without further handling.
    pub fn is_benign_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateMessage(_))
    }
}

/// Errors from pairwise protocol operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PairwiseError {
    /// Operation referenced a session that was never created or was deleted
    #[error("unknown session {0}")]
    SessionNotFound(SessionId),

    /// `create_session` for a session that already exists
    #[error("session {0} already exists")]
    SessionExists(SessionId),

    /// Message was already decrypted by this session
    #[error("duplicate message for session {0}")]
    DuplicateMessage(SessionId),

    /// Opaque failure inside the crypto engine
    #[error("pairwise engine error: {0}")]
    Engine(String),
}

/// Errors surfaced by [`crate::transaction::CryptoTransactionProvider`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    /// The group protocol is not available for this identity; callers must
    /// match on [`crate::transaction::GroupProtocol`] before group calls
    #[error("group protocol is not supported for this identity")]
    Unsupported,

    /// Group protocol failure inside the transaction
    #[error(transparent)]
    Group(#[from] GroupError),

    /// Pairwise protocol failure inside the transaction
    #[error(transparent)]
    Pairwise(#[from] PairwiseError),

    /// The underlying stores failed to begin, commit, or roll back
    #[error("storage error: {0}")]
    Storage(String),
}
