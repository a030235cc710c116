//! ACME-style network client interface for identity enrollment.
//!
//! The HTTP plumbing is an external collaborator; this module only defines
//! the typed request surface the enrollment state machine drives, plus the
//! nonce types that enforce strict chaining. ACME nonces are deliberately
//! not `Clone`: each request consumes the previous response's nonce by
//! value, so reusing or skipping one is unrepresentable.

use async_trait::async_trait;
use latchkey_core::engine::Certificate;

use crate::error::AcmeError;

/// Anti-replay nonce threaded through the ACME request chain.
///
/// Not `Clone` on purpose; see the module docs.
#[derive(Debug, PartialEq, Eq)]
pub struct Nonce(String);

impl Nonce {
    /// Wrap a nonce returned by the server.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Encoded nonce value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Nonce issued by the messaging backend for the DPoP token exchange.
///
/// A separate chain from [`Nonce`]; also consumed by value.
#[derive(Debug, PartialEq, Eq)]
pub struct BackendNonce(String);

impl BackendNonce {
    /// Wrap a backend nonce.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Encoded nonce value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Endpoint directory fetched at the start of every enrollment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcmeDirectory {
    /// Endpoint issuing fresh nonces.
    pub new_nonce: String,

    /// Account creation endpoint.
    pub new_account: String,

    /// Order creation endpoint.
    pub new_order: String,
}

/// Response to account creation.
#[derive(Debug, PartialEq, Eq)]
pub struct AccountResponse {
    /// Nonce for the next request.
    pub nonce: Nonce,
}

/// Response to order creation.
#[derive(Debug, PartialEq, Eq)]
pub struct OrderResponse {
    /// URL of the order's authorization resource.
    pub authorization_url: String,

    /// URL to poll the order at.
    pub order_url: String,

    /// Nonce for the next request.
    pub nonce: Nonce,
}

/// One challenge inside an authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Challenge validation endpoint.
    pub url: String,

    /// Identity-provider target for this challenge.
    pub target: String,
}

/// Response to authorization creation, carrying both required challenges.
#[derive(Debug, PartialEq, Eq)]
pub struct AuthorizationResponse {
    /// Proof-of-possession challenge against the messaging backend.
    pub dpop_challenge: Challenge,

    /// OpenID Connect challenge against the identity provider.
    pub oidc_challenge: Challenge,

    /// Nonce for the next request.
    pub nonce: Nonce,
}

/// Response to a challenge validation.
#[derive(Debug, PartialEq, Eq)]
pub struct ChallengeResponse {
    /// Nonce for the next request.
    pub nonce: Nonce,
}

/// State of an order as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    /// All challenges validated; the order can be finalized.
    Ready,

    /// Challenges still outstanding.
    Pending,

    /// The order failed server-side.
    Invalid,
}

/// Response to polling an order.
#[derive(Debug, PartialEq, Eq)]
pub struct OrderStatus {
    /// Current order state.
    pub state: OrderState,

    /// Finalization endpoint.
    pub finalize_url: String,

    /// Nonce for the next request.
    pub nonce: Nonce,
}

/// Response to order finalization.
#[derive(Debug, PartialEq, Eq)]
pub struct FinalizeResponse {
    /// Endpoint to download the issued certificate from.
    pub certificate_url: String,

    /// Nonce for the next request.
    pub nonce: Nonce,
}

/// Signed proof-of-possession token for the backend access-token exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DpopToken(pub String);

/// Access token issued by the messaging backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken(pub String);

/// Claims identifying the device being enrolled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityClaims {
    /// Human-readable display name bound into the certificate.
    pub display_name: String,

    /// Stable user handle bound into the certificate.
    pub handle: String,

    /// Team the user belongs to, when any.
    pub team: Option<String>,

    /// OIDC id token obtained from the identity provider.
    pub id_token: String,
}

/// Network client capable of the ACME-style enrollment requests and of
/// fetching revocation-list documents by URL.
///
/// Timeout policy is the implementation's concern; the state machine only
/// observes success or [`AcmeError`].
#[async_trait]
pub trait AcmeClient: Send + Sync {
    /// Fetch the endpoint directory.
    async fn directory(&self) -> Result<AcmeDirectory, AcmeError>;

    /// Obtain a fresh nonce to start the chain.
    async fn fresh_nonce(&self, url: &str) -> Result<Nonce, AcmeError>;

    /// Create the ACME account.
    async fn create_account(&self, url: &str, nonce: Nonce) -> Result<AccountResponse, AcmeError>;

    /// Create the certificate order.
    async fn create_order(&self, url: &str, nonce: Nonce) -> Result<OrderResponse, AcmeError>;

    /// Create the authorization carrying the DPoP and OIDC challenges.
    async fn create_authorization(
        &self,
        url: &str,
        nonce: Nonce,
    ) -> Result<AuthorizationResponse, AcmeError>;

    /// Obtain a challenge nonce from the messaging backend.
    async fn backend_nonce(&self) -> Result<BackendNonce, AcmeError>;

    /// Build and sign the DPoP token for these claims.
    async fn dpop_token(
        &self,
        claims: &IdentityClaims,
        nonce: BackendNonce,
    ) -> Result<DpopToken, AcmeError>;

    /// Exchange the DPoP token for a backend access token.
    async fn backend_access_token(&self, token: &DpopToken) -> Result<AccessToken, AcmeError>;

    /// Validate the DPoP challenge with the access token.
    async fn validate_dpop_challenge(
        &self,
        challenge: &Challenge,
        token: &AccessToken,
        nonce: Nonce,
    ) -> Result<ChallengeResponse, AcmeError>;

    /// Validate the OIDC challenge with the id token.
    async fn validate_oidc_challenge(
        &self,
        challenge: &Challenge,
        id_token: &str,
        nonce: Nonce,
    ) -> Result<ChallengeResponse, AcmeError>;

    /// Poll the order state.
    async fn check_order(&self, order_url: &str, nonce: Nonce) -> Result<OrderStatus, AcmeError>;

    /// Finalize the order.
    async fn finalize(
        &self,
        finalize_url: &str,
        nonce: Nonce,
    ) -> Result<FinalizeResponse, AcmeError>;

    /// Download the issued certificate.
    async fn certificate(&self, cert_url: &str, nonce: Nonce) -> Result<Certificate, AcmeError>;

    /// Fetch a revocation-list document by URL.
    async fn fetch_crl(&self, url: &str) -> Result<Vec<u8>, AcmeError>;
}
