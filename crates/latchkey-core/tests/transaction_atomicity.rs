//! Tests for the crypto transaction coordinator.
//!
//! These tests verify critical invariants:
//! - Mutations inside a committed transaction persist
//! - A failed transaction observes none of its mutations afterwards
//! - Transactions against the same identity never interleave
//! - Identities without the group protocol surface `Unsupported`

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use latchkey_core::{
    error::{GroupError, TransactionError},
    ids::{GroupId, QualifiedClientId, QualifiedUserId, SessionId},
    transaction::{CryptoTransactionProvider, GroupProtocol},
};
use latchkey_harness::{FakeGroupEngine, FakePairwiseEngine};

fn alice() -> QualifiedClientId {
    QualifiedClientId::new(QualifiedUserId::new("alice", "chat.example"), "dev1")
}

fn bob_session() -> SessionId {
    SessionId::from_parts("chat.example", "bob", "dev1")
}

fn provider() -> CryptoTransactionProvider {
    let identity = alice();
    CryptoTransactionProvider::new(
        identity.clone(),
        Box::new(FakePairwiseEngine::new()),
        Some(Box::new(FakeGroupEngine::new(identity))),
    )
}

#[tokio::test]
async fn committed_transaction_persists() {
    let provider = provider();
    let group_id = GroupId::new(vec![1, 2, 3]);

    provider
        .transaction("create", |tx| {
            let group_id = group_id.clone();
            Box::pin(async move {
                let mut group = tx.require_group()?;
                group.create_conversation(&group_id, &[]).await?;
                let prekey = FakePairwiseEngine::prekey(7);
                tx.pairwise().create_session(&prekey, &bob_session()).await?;
                Ok(())
            })
        })
        .await
        .expect("transaction should commit");

    // A later transaction observes both mutations.
    let (exists, has_session) = provider
        .transaction("observe", |tx| {
            let group_id = group_id.clone();
            Box::pin(async move {
                let exists = tx.require_group()?.conversation_exists(&group_id).await?;
                let has_session = tx.pairwise().session_exists(&bob_session()).await?;
                Ok((exists, has_session))
            })
        })
        .await
        .expect("observation should succeed");
    assert!(exists, "committed group should be visible");
    assert!(has_session, "committed session should be visible");
}

#[tokio::test]
async fn failed_transaction_rolls_back_both_engines() {
    let provider = provider();
    let group_id = GroupId::new(vec![9, 9]);

    let err = provider
        .transaction("doomed", |tx| {
            let group_id = group_id.clone();
            Box::pin(async move {
                tx.require_group()?.create_conversation(&group_id, &[]).await?;
                let prekey = FakePairwiseEngine::prekey(1);
                tx.pairwise().create_session(&prekey, &bob_session()).await?;
                Err::<(), _>(TransactionError::Storage("injected failure".into()))
            })
        })
        .await
        .expect_err("transaction should fail");
    assert_eq!(err, TransactionError::Storage("injected failure".into()));

    // Neither mutation is observable afterwards.
    let (exists, has_session) = provider
        .transaction("observe", |tx| {
            let group_id = group_id.clone();
            Box::pin(async move {
                let exists = tx.require_group()?.conversation_exists(&group_id).await?;
                let has_session = tx.pairwise().session_exists(&bob_session()).await?;
                Ok((exists, has_session))
            })
        })
        .await
        .expect("observation should succeed");
    assert!(!exists, "rolled-back group must not be visible");
    assert!(!has_session, "rolled-back session must not be visible");
}

#[tokio::test]
async fn protocol_error_is_surfaced_unchanged() {
    let provider = provider();
    let group_id = GroupId::new(vec![5]);

    let err = provider
        .transaction("decrypt-unknown", |tx| {
            let group_id = group_id.clone();
            Box::pin(async move {
                tx.require_group()?.decrypt_message(&group_id, b"g:0:0:x").await?;
                Ok(())
            })
        })
        .await
        .expect_err("unknown group should fail");
    assert_eq!(err, TransactionError::Group(GroupError::NotFound(group_id)));
}

#[tokio::test]
async fn group_protocol_unsupported_without_group_engine() {
    let provider =
        CryptoTransactionProvider::new(alice(), Box::new(FakePairwiseEngine::new()), None);

    let err = provider
        .transaction("needs-group", |tx| {
            Box::pin(async move {
                tx.require_group()?;
                Ok(())
            })
        })
        .await
        .expect_err("group protocol should be unavailable");
    assert_eq!(err, TransactionError::Unsupported);

    // The tagged variant is observable without failing the transaction,
    // and the pairwise protocol stays available.
    provider
        .transaction("pairwise-only", |tx| {
            Box::pin(async move {
                assert!(matches!(tx.group(), GroupProtocol::Unsupported));
                let prekey = FakePairwiseEngine::prekey(3);
                tx.pairwise().create_session(&prekey, &bob_session()).await?;
                Ok(())
            })
        })
        .await
        .expect("pairwise transaction should commit");
}

#[tokio::test]
async fn transactions_against_one_identity_never_interleave() {
    let provider = Arc::new(provider());
    let in_flight = Arc::new(AtomicBool::new(false));

    let mut tasks = Vec::new();
    for i in 0..8u16 {
        let provider = Arc::clone(&provider);
        let in_flight = Arc::clone(&in_flight);
        tasks.push(tokio::spawn(async move {
            provider
                .transaction("exclusive", |tx| {
                    Box::pin(async move {
                        assert!(
                            !in_flight.swap(true, Ordering::SeqCst),
                            "another transaction was in flight"
                        );
                        // Hold the transaction across an await point.
                        let prekey = FakePairwiseEngine::prekey(i);
                        let session = SessionId::from_parts("chat.example", "peer", &i.to_string());
                        tx.pairwise().create_session(&prekey, &session).await?;
                        tokio::task::yield_now().await;
                        in_flight.store(false, Ordering::SeqCst);
                        Ok(())
                    })
                })
                .await
                .expect("transaction should commit");
        }));
    }
    for task in tasks {
        task.await.expect("task should not panic");
    }
}
