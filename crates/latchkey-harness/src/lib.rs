//! Test harness for the Latchkey coordination layer.
//!
//! In-memory fakes for every external collaborator the coordinator drives:
//! the group and pairwise crypto engines, the ACME-style enrollment
//! backend, and the revocation cache store. All fakes are deterministic and
//! scriptable, so tests can inject failures at exact points and observe
//! rollback, retry, and isolation behavior without real cryptography or a
//! network.
//!
//! Engine fakes snapshot their whole store on `begin` and restore it on
//! `rollback`, which makes transaction atomicity directly observable: after
//! a failed transaction the fake's state is byte-for-byte what it was
//! before.

pub mod crl_store;
pub mod fake_acme;
pub mod fake_group;
pub mod fake_pairwise;

pub use crl_store::{MemoryCrlStore, SimClock, liveness_channel};
pub use fake_acme::{CountingInstaller, ScriptedAcmeClient, ScriptedRegistrar};
pub use fake_group::FakeGroupEngine;
pub use fake_pairwise::FakePairwiseEngine;
