//! Tests for the group session manager.
//!
//! These tests verify critical invariants:
//! - A produced commit pins the group until acceptance; further
//!   commit-producing calls fail with `PendingCommit`
//! - The epoch advances only after `commit_accepted`
//! - Duplicate deliveries stay distinguishable from wrong-key failures
//! - Newly discovered revocation distribution points are surfaced

use latchkey_core::{
    error::GroupError,
    ids::{GroupId, QualifiedClientId, QualifiedUserId},
    transaction::CryptoTransactionProvider,
};
use latchkey_harness::{FakeGroupEngine, FakePairwiseEngine};
use proptest::prelude::*;

fn client(user: &str, device: &str) -> QualifiedClientId {
    QualifiedClientId::new(QualifiedUserId::new(user, "chat.example"), device)
}

fn provider_with(engine: FakeGroupEngine) -> CryptoTransactionProvider {
    CryptoTransactionProvider::new(
        client("alice", "dev1"),
        Box::new(FakePairwiseEngine::new()),
        Some(Box::new(engine)),
    )
}

fn provider() -> CryptoTransactionProvider {
    provider_with(FakeGroupEngine::new(client("alice", "dev1")))
}

async fn create_group(provider: &CryptoTransactionProvider, group_id: &GroupId) {
    provider
        .transaction("create", |tx| {
            let group_id = group_id.clone();
            Box::pin(async move {
                tx.require_group()?.create_conversation(&group_id, &[]).await?;
                Ok(())
            })
        })
        .await
        .expect("group creation should commit");
}

#[tokio::test]
async fn key_package_generation_may_over_provision() {
    let provider = provider();
    let (packages, count) = provider
        .transaction("key-packages", |tx| {
            Box::pin(async move {
                let mut group = tx.require_group()?;
                let packages = group.generate_key_packages(5).await?;
                let count = group.valid_key_package_count().await?;
                Ok((packages, count))
            })
        })
        .await
        .expect("generation should succeed");
    assert!(packages.len() >= 5, "engine must produce at least the requested amount");
    assert!(count >= 5, "issued packages should be counted");
}

#[tokio::test]
async fn epoch_advances_only_after_commit_accepted() {
    let provider = provider();
    let group_id = GroupId::new(vec![1]);
    create_group(&provider, &group_id).await;

    let bob = client("bob", "dev1");
    let package = FakeGroupEngine::key_package_for(&bob, 1);

    let epoch_before = provider
        .transaction("add", |tx| {
            let group_id = group_id.clone();
            let package = package.clone();
            Box::pin(async move {
                let mut group = tx.require_group()?;
                let bundle = group.add_members(&group_id, &[package]).await?;
                assert!(bundle.welcome.is_some(), "adds must carry a welcome");
                assert!(group.has_pending_commit(&group_id));
                Ok(group.conversation_epoch(&group_id).await?)
            })
        })
        .await
        .expect("add should succeed");
    assert_eq!(epoch_before, 0, "epoch must not advance before acceptance");

    let (epoch_after, members) = provider
        .transaction("accept", |tx| {
            let group_id = group_id.clone();
            Box::pin(async move {
                let mut group = tx.require_group()?;
                group.commit_accepted(&group_id).await?;
                assert!(!group.has_pending_commit(&group_id));
                let epoch = group.conversation_epoch(&group_id).await?;
                let members = group.members(&group_id).await?;
                Ok((epoch, members))
            })
        })
        .await
        .expect("acceptance should succeed");
    assert_eq!(epoch_after, 1, "epoch advances on acceptance");
    assert!(members.contains(&bob), "accepted add should be in the member set");
}

#[tokio::test]
async fn second_commit_before_acceptance_is_rejected() {
    let provider = provider();
    let group_id = GroupId::new(vec![2]);
    create_group(&provider, &group_id).await;

    let bob = client("bob", "dev1");
    let err = provider
        .transaction("double-remove", |tx| {
            let group_id = group_id.clone();
            let bob = bob.clone();
            Box::pin(async move {
                let mut group = tx.require_group()?;
                group.remove_members(&group_id, std::slice::from_ref(&bob)).await?;
                // A retried removal before acceptance must not double-apply.
                match group.remove_members(&group_id, &[bob]).await {
                    Err(err) => Ok(err),
                    Ok(_) => panic!("second remove must be rejected"),
                }
            })
        })
        .await
        .expect("transaction should commit");
    assert_eq!(err, GroupError::PendingCommit(group_id));
}

#[tokio::test]
async fn pending_marker_survives_across_transactions() {
    let provider = provider();
    let group_id = GroupId::new(vec![3]);
    create_group(&provider, &group_id).await;

    provider
        .transaction("rotate", |tx| {
            let group_id = group_id.clone();
            Box::pin(async move {
                tx.require_group()?.update_keying_material(&group_id).await?;
                Ok(())
            })
        })
        .await
        .expect("rotation should commit");

    let err = provider
        .transaction("rotate-again", |tx| {
            let group_id = group_id.clone();
            Box::pin(async move {
                tx.require_group()?.update_keying_material(&group_id).await?;
                Ok(())
            })
        })
        .await
        .expect_err("second commit before acceptance should fail");
    assert_eq!(
        err,
        GroupError::PendingCommit(group_id).into(),
        "pending marker must outlive the producing transaction"
    );
}

#[tokio::test]
async fn failed_transaction_restores_pending_marker() {
    let provider = provider();
    let group_id = GroupId::new(vec![4]);
    create_group(&provider, &group_id).await;

    provider
        .transaction("doomed-rotate", |tx| {
            let group_id = group_id.clone();
            Box::pin(async move {
                tx.require_group()?.update_keying_material(&group_id).await?;
                Err::<(), _>(GroupError::Engine("injected failure".into()).into())
            })
        })
        .await
        .expect_err("transaction should fail");

    // The produced commit was rolled back with the transaction, so the
    // group is not pinned.
    provider
        .transaction("rotate", |tx| {
            let group_id = group_id.clone();
            Box::pin(async move {
                tx.require_group()?.update_keying_material(&group_id).await?;
                Ok(())
            })
        })
        .await
        .expect("rotation after rollback should succeed");
}

#[tokio::test]
async fn empty_member_changes_have_nothing_to_commit() {
    let provider = provider();
    let group_id = GroupId::new(vec![5]);
    create_group(&provider, &group_id).await;

    provider
        .transaction("empty-changes", |tx| {
            let group_id = group_id.clone();
            Box::pin(async move {
                let mut group = tx.require_group()?;
                assert_eq!(
                    group.add_members(&group_id, &[]).await,
                    Err(GroupError::NothingToCommit(group_id.clone()))
                );
                assert_eq!(
                    group.remove_members(&group_id, &[]).await,
                    Err(GroupError::NothingToCommit(group_id.clone()))
                );
                assert_eq!(group.commit_pending_proposals(&group_id).await, Ok(None));
                assert!(!group.has_pending_commit(&group_id), "nothing was produced");
                Ok(())
            })
        })
        .await
        .expect("transaction should commit");
}

#[tokio::test]
async fn consumed_key_package_is_rejected() {
    let provider = provider();
    let first = GroupId::new(vec![6]);
    let second = GroupId::new(vec![7]);
    create_group(&provider, &first).await;
    create_group(&provider, &second).await;

    let package = FakeGroupEngine::key_package_for(&client("bob", "dev1"), 1);
    let err = provider
        .transaction("reuse-package", |tx| {
            let first = first.clone();
            let second = second.clone();
            let package = package.clone();
            Box::pin(async move {
                let mut group = tx.require_group()?;
                group.add_members(&first, std::slice::from_ref(&package)).await?;
                match group.add_members(&second, &[package]).await {
                    Err(err) => Ok(err),
                    Ok(_) => panic!("reused key package must be rejected"),
                }
            })
        })
        .await
        .expect("transaction should commit");
    assert_eq!(err, GroupError::ConsumedKeyPackage);
}

#[tokio::test]
async fn message_round_trip_and_duplicate_detection() {
    let provider = provider();
    let group_id = GroupId::new(vec![8]);
    create_group(&provider, &group_id).await;

    let ciphertext = provider
        .transaction("encrypt", |tx| {
            let group_id = group_id.clone();
            Box::pin(
                async move { Ok(tx.require_group()?.encrypt_message(&group_id, b"hi").await?) },
            )
        })
        .await
        .expect("encryption should succeed");

    let (bundles, duplicate) = provider
        .transaction("decrypt-twice", |tx| {
            let group_id = group_id.clone();
            let ciphertext = ciphertext.clone();
            Box::pin(async move {
                let mut group = tx.require_group()?;
                let bundles = group.decrypt_message(&group_id, &ciphertext).await?;
                let duplicate = match group.decrypt_message(&group_id, &ciphertext).await {
                    Err(err) => err,
                    Ok(_) => panic!("second delivery must be rejected"),
                };
                Ok((bundles, duplicate))
            })
        })
        .await
        .expect("transaction should commit");

    assert_eq!(bundles.len(), 1);
    assert_eq!(bundles[0].message.as_deref(), Some(b"hi".as_slice()));
    assert_eq!(duplicate, GroupError::DuplicateMessage(group_id));
    assert!(duplicate.is_benign_duplicate(), "duplicates are droppable by callers");
}

#[tokio::test]
async fn handshake_messages_decrypt_to_zero_bundles() {
    let provider = provider();
    let group_id = GroupId::new(vec![9]);
    create_group(&provider, &group_id).await;

    let bundles = provider
        .transaction("handshake", |tx| {
            let group_id = group_id.clone();
            Box::pin(async move {
                let handshake = FakeGroupEngine::handshake_message();
                Ok(tx.require_group()?.decrypt_message(&group_id, &handshake).await?)
            })
        })
        .await
        .expect("handshake processing should succeed");
    assert!(bundles.is_empty(), "handshake messages carry no application payload");
}

#[tokio::test]
async fn stale_ciphertext_fails_with_stale_epoch() {
    let provider = provider();
    let group_id = GroupId::new(vec![10]);
    create_group(&provider, &group_id).await;

    let old_ciphertext = provider
        .transaction("encrypt-epoch-0", |tx| {
            let group_id = group_id.clone();
            Box::pin(
                async move { Ok(tx.require_group()?.encrypt_message(&group_id, b"old").await?) },
            )
        })
        .await
        .expect("encryption should succeed");

    provider
        .transaction("advance-epoch", |tx| {
            let group_id = group_id.clone();
            Box::pin(async move {
                let mut group = tx.require_group()?;
                group.update_keying_material(&group_id).await?;
                group.commit_accepted(&group_id).await?;
                Ok(())
            })
        })
        .await
        .expect("rotation should commit");

    let err = provider
        .transaction("decrypt-stale", |tx| {
            let group_id = group_id.clone();
            let old_ciphertext = old_ciphertext.clone();
            Box::pin(async move {
                match tx.require_group()?.decrypt_message(&group_id, &old_ciphertext).await {
                    Err(err) => Ok(err),
                    Ok(_) => panic!("stale ciphertext must be rejected"),
                }
            })
        })
        .await
        .expect("transaction should commit");
    assert_eq!(err, GroupError::StaleEpoch { group: group_id, epoch: 0 });
}

#[tokio::test]
async fn welcome_and_external_join_yield_usable_groups() {
    let group_id = GroupId::new(vec![11]);

    let welcomed_provider = provider();
    let joined = welcomed_provider
        .transaction("welcome", |tx| {
            let group_id = group_id.clone();
            Box::pin(async move {
                let welcome = FakeGroupEngine::welcome_for(&group_id);
                Ok(tx.require_group()?.process_welcome(&welcome).await?)
            })
        })
        .await
        .expect("welcome should succeed");
    assert_eq!(joined.group_id, group_id);

    let joining_provider = provider();
    let joined = joining_provider
        .transaction("external-join", |tx| {
            let group_id = group_id.clone();
            Box::pin(async move {
                let info = FakeGroupEngine::group_info_for(&group_id);
                Ok(tx.require_group()?.join_by_external_commit(&info).await?)
            })
        })
        .await
        .expect("external join should succeed");
    assert_eq!(joined.group_id, group_id);
}

#[tokio::test]
async fn new_distribution_points_are_surfaced_on_adds() {
    let mut engine = FakeGroupEngine::new(client("alice", "dev1"));
    engine.set_distribution_points(vec!["https://crl.example/ca1".into()]);
    let provider = provider_with(engine);
    let group_id = GroupId::new(vec![12]);
    create_group(&provider, &group_id).await;

    let bundle = provider
        .transaction("add", |tx| {
            let group_id = group_id.clone();
            Box::pin(async move {
                let package = FakeGroupEngine::key_package_for(&client("bob", "dev1"), 1);
                Ok(tx.require_group()?.add_members(&group_id, &[package]).await?)
            })
        })
        .await
        .expect("add should succeed");
    assert_eq!(bundle.crl_new_distribution_points, vec!["https://crl.example/ca1".to_owned()]);
}

#[tokio::test]
async fn certificate_install_enables_end_to_end_identity() {
    let provider = provider();
    let (points, active) = provider
        .transaction("install", |tx| {
            Box::pin(async move {
                let mut group = tx.require_group()?;
                let certificate = latchkey_core::engine::Certificate::new("pem");
                let points = group.install_certificate(&certificate).await?;
                let active = group.is_end_to_end_identity_active().await?;
                Ok((points, active))
            })
        })
        .await
        .expect("install should succeed");
    assert!(points.is_empty(), "no distribution points were scripted");
    assert!(active, "installing a certificate activates the identity");
}

proptest! {
    /// Group messages round trip for arbitrary payloads, the empty payload
    /// included.
    #[test]
    fn group_encrypt_decrypt_round_trips(
        payload in proptest::collection::vec(any::<u8>(), 0..256),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime should build");
        runtime.block_on(async {
            let provider = provider();
            let group_id = GroupId::new(vec![13]);
            create_group(&provider, &group_id).await;
            let bundles = provider
                .transaction("round-trip", |tx| {
                    let group_id = group_id.clone();
                    let payload = payload.clone();
                    Box::pin(async move {
                        let mut group = tx.require_group()?;
                        let ciphertext = group.encrypt_message(&group_id, &payload).await?;
                        Ok(group.decrypt_message(&group_id, &ciphertext).await?)
                    })
                })
                .await
                .expect("round trip should commit");
            prop_assert_eq!(bundles.len(), 1);
            prop_assert_eq!(bundles[0].message.as_deref(), Some(payload.as_slice()));
            Ok(())
        })?;
    }
}
