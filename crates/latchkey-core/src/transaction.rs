//! Crypto transaction coordinator.
//!
//! [`CryptoTransactionProvider`] is the sole mutual-exclusion point over the
//! two session engines: at most one transaction is in flight per identity's
//! stores. One provider exists per logged-in identity, each with its own
//! async mutex, so multiple identities proceed independently while a second
//! caller against the same identity blocks until the first transaction
//! completes. The engines themselves are not safe for concurrent mutation.
//!
//! Atomicity is call-scoped with an explicit multi-operation handle: the
//! [`Transaction`] passed to the operation closure stays valid across await
//! points, every mutation inside it commits together on normal return, and a
//! failed operation observes none of its mutations afterwards.

use std::{
    collections::HashSet,
    future::Future,
    pin::Pin,
    sync::Arc,
};

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    engine::{GroupEngine, PairwiseEngine},
    error::TransactionError,
    group::GroupContext,
    ids::{GroupId, QualifiedClientId, SessionId},
    pairwise::PairwiseContext,
};

/// Boxed future returned by transaction operations.
pub type TxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransactionError>> + Send + 'a>>;

/// Whether the group protocol is available inside this transaction.
///
/// A tagged variant instead of a nullable sub-context: callers must handle
/// [`GroupProtocol::Unsupported`] explicitly before any group operation.
pub enum GroupProtocol<'tx> {
    /// The group protocol is not available for this identity.
    Unsupported,

    /// Group operations for the lifetime of this borrow.
    Active(GroupContext<'tx>),
}

struct ProviderState {
    group_engine: Option<Box<dyn GroupEngine>>,
    pairwise_engine: Box<dyn PairwiseEngine>,

    // Groups with a produced but not yet accepted commit. Survives across
    // transactions; snapshotted and restored when a transaction fails.
    pending_commits: HashSet<GroupId>,

    // Positive session-existence cache for the pairwise context.
    known_sessions: HashSet<SessionId>,
}

/// One in-flight transaction against an identity's stores.
///
/// Holds the per-identity lock for its whole lifetime. Handed to the
/// operation closure by [`CryptoTransactionProvider::transaction`]; the
/// coordinator commits or rolls back when the closure returns, so mutating
/// manager calls cannot exist outside a transaction.
pub struct Transaction {
    state: OwnedMutexGuard<ProviderState>,
}

impl Transaction {
    /// Group protocol sub-context, or `Unsupported` for identities without
    /// the group protocol.
    pub fn group(&mut self) -> GroupProtocol<'_> {
        let state = &mut *self.state;
        match state.group_engine.as_deref_mut() {
            None => GroupProtocol::Unsupported,
            Some(engine) => GroupProtocol::Active(GroupContext {
                engine,
                pending_commits: &mut state.pending_commits,
            }),
        }
    }

    /// Group sub-context, failing with [`TransactionError::Unsupported`]
    /// when the identity has no group protocol.
    pub fn require_group(&mut self) -> Result<GroupContext<'_>, TransactionError> {
        match self.group() {
            GroupProtocol::Unsupported => Err(TransactionError::Unsupported),
            GroupProtocol::Active(context) => Ok(context),
        }
    }

    /// Pairwise protocol sub-context. Always available.
    pub fn pairwise(&mut self) -> PairwiseContext<'_> {
        let state = &mut *self.state;
        PairwiseContext {
            engine: state.pairwise_engine.as_mut(),
            known_sessions: &mut state.known_sessions,
        }
    }
}

/// Per-identity coordinator serializing access to the session engines.
pub struct CryptoTransactionProvider {
    identity: QualifiedClientId,
    state: Arc<Mutex<ProviderState>>,
}

impl CryptoTransactionProvider {
    /// Build a provider for one identity.
    ///
    /// `group_engine` is `None` for identities where the group protocol is
    /// unsupported; transactions then expose [`GroupProtocol::Unsupported`].
    pub fn new(
        identity: QualifiedClientId,
        pairwise_engine: Box<dyn PairwiseEngine>,
        group_engine: Option<Box<dyn GroupEngine>>,
    ) -> Self {
        Self {
            identity,
            state: Arc::new(Mutex::new(ProviderState {
                group_engine,
                pairwise_engine,
                pending_commits: HashSet::new(),
                known_sessions: HashSet::new(),
            })),
        }
    }

    /// Identity whose stores this provider guards.
    pub fn identity(&self) -> &QualifiedClientId {
        &self.identity
    }

    /// Run `op` inside an exclusive transaction over this identity's stores.
    ///
    /// Acquires the per-identity lock, begins an engine-level transaction on
    /// both engines, and executes `op` with the [`Transaction`] handle. On
    /// `Ok` both engines commit (group first, then pairwise); on `Err` both
    /// roll back and the operation's failure is surfaced unchanged, with no
    /// partial state observable.
    ///
    /// `name` labels the transaction in logs.
    pub async fn transaction<T, F>(&self, name: &'static str, op: F) -> Result<T, TransactionError>
    where
        T: Send,
        F: for<'a> FnOnce(&'a mut Transaction) -> TxFuture<'a, T> + Send,
    {
        let mut state = Arc::clone(&self.state).lock_owned().await;
        tracing::debug!(name, identity = %self.identity, "transaction started");

        state
            .pairwise_engine
            .begin()
            .await
            .map_err(|err| TransactionError::Storage(err.to_string()))?;
        if let Some(group) = state.group_engine.as_deref_mut() {
            if let Err(err) = group.begin().await {
                rollback_pairwise(&mut state).await;
                return Err(TransactionError::Storage(err.to_string()));
            }
        }

        let pending_before = state.pending_commits.clone();
        let sessions_before = state.known_sessions.clone();

        let mut tx = Transaction { state };
        let result = op(&mut tx).await;
        let mut state = tx.state;

        match result {
            Ok(value) => {
                if let Some(group) = state.group_engine.as_deref_mut() {
                    if let Err(err) = group.commit().await {
                        rollback_pairwise(&mut state).await;
                        state.pending_commits = pending_before;
                        state.known_sessions = sessions_before;
                        return Err(TransactionError::Storage(err.to_string()));
                    }
                }
                if let Err(err) = state.pairwise_engine.commit().await {
                    // The group engine already committed; only the pairwise
                    // caches are known to be stale.
                    rollback_pairwise(&mut state).await;
                    state.known_sessions = sessions_before;
                    return Err(TransactionError::Storage(err.to_string()));
                }
                tracing::debug!(name, "transaction committed");
                Ok(value)
            },
            Err(err) => {
                if let Some(group) = state.group_engine.as_deref_mut() {
                    if let Err(rollback_err) = group.rollback().await {
                        tracing::error!(name, error = %rollback_err, "group rollback failed");
                    }
                }
                rollback_pairwise(&mut state).await;
                state.pending_commits = pending_before;
                state.known_sessions = sessions_before;
                tracing::debug!(name, error = %err, "transaction rolled back");
                Err(err)
            },
        }
    }
}

async fn rollback_pairwise(state: &mut OwnedMutexGuard<ProviderState>) {
    if let Err(err) = state.pairwise_engine.rollback().await {
        tracing::error!(error = %err, "pairwise rollback failed");
    }
}
