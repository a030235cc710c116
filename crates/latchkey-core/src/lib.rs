//! Trust/session coordination core for an end-to-end-encrypted messaging
//! client.
//!
//! Arbitrates access to two parallel cryptographic session engines, a
//! group-keying protocol and a pairwise double-ratchet protocol, through one
//! atomic-operation boundary. The engines themselves are external
//! collaborators implemented behind the facade traits in [`engine`].
//!
//! # Components
//!
//! - [`engine`]: typed facade traits and payload types for the opaque
//!   crypto engine
//! - [`transaction`]: the crypto transaction coordinator; per-identity
//!   mutual exclusion, commit/rollback over both engines
//! - [`group`]: group (conversation) lifecycle inside a transaction
//! - [`pairwise`]: per-peer session lifecycle inside a transaction
//! - [`ids`]: qualified identifiers
//! - [`error`]: failure taxonomy

pub mod engine;
pub mod error;
pub mod group;
pub mod ids;
pub mod pairwise;
pub mod transaction;

pub use engine::{
    Certificate, CommitBundle, CredentialStatus, CrlRegistration, DecryptedMessage,
    DeviceIdentity, ExternalSenderKey, GroupEngine, GroupInfo, KeyPackage, PairwiseEngine, PreKey,
    Welcome, WelcomeBundle,
};
pub use error::{GroupError, PairwiseError, TransactionError};
pub use group::GroupContext;
pub use ids::{
    GroupId, ParseIdError, PreKeyBundleMap, QualifiedClientId, QualifiedUserId, SessionId,
};
pub use pairwise::PairwiseContext;
pub use transaction::{CryptoTransactionProvider, GroupProtocol, Transaction, TxFuture};
