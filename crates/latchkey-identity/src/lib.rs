//! Device identity lifecycle for the Latchkey coordination core.
//!
//! Two independent long-running concerns:
//!
//! - [`enrollment`]: the ACME-style certificate issuance state machine,
//!   strictly sequential and nonce-chained, installing its certificate into
//!   the group session manager on success
//! - [`revocation`]: the background worker keeping cached revocation-list
//!   entries fresh, gated on a sync-liveness signal
//!
//! The HTTP client, the liveness stream, and the checkpoint store are
//! external collaborators defined only by the traits in [`acme`] and
//! [`revocation`].

pub mod acme;
pub mod enrollment;
pub mod error;
pub mod revocation;

pub use acme::{
    AccessToken, AccountResponse, AcmeClient, AcmeDirectory, AuthorizationResponse, BackendNonce,
    Challenge, ChallengeResponse, DpopToken, FinalizeResponse, IdentityClaims, Nonce, OrderResponse,
    OrderState, OrderStatus,
};
pub use enrollment::{
    CertificateInstaller, Enrollment, EnrollmentCause, EnrollmentError, EnrollmentStep, RetryPolicy,
};
pub use error::{AcmeError, StoreError};
pub use revocation::{
    Clock, CrlRegistrar, CrlStore, LivenessReceiver, RevocationCheckpoint, RevocationEntry,
    RevocationWorker, RevocationWorkerConfig, RevocationWorkerHandle, SyncState, SystemClock,
    register_distribution_points,
};
