//! Identity enrollment state machine.
//!
//! A strictly sequential, single-attempt pipeline: each step consumes the
//! nonce returned by the previous network response and produces the nonce
//! for the next. On failure at any step the machine stops immediately and
//! reports which step failed; later steps never execute, and a failed
//! attempt is abandoned, never resumed. On success the issued certificate
//! has already been installed into the group session manager.
//!
//! Cancellation is observed between steps, never mid-request, and abandons
//! the attempt without touching server-side state; the server is
//! authoritative for partial progress.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use latchkey_core::{
    engine::Certificate,
    error::TransactionError,
    transaction::CryptoTransactionProvider,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    acme::{AcmeClient, AccessToken, DpopToken, IdentityClaims, OrderState},
    error::AcmeError,
};

/// Steps of the enrollment pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EnrollmentStep {
    /// Fetch the endpoint directory.
    Directory,
    /// Obtain the initial nonce.
    InitialNonce,
    /// Create the ACME account.
    CreateAccount,
    /// Create the certificate order.
    CreateOrder,
    /// Create the authorization.
    CreateAuthorization,
    /// Obtain the backend challenge nonce.
    BackendNonceFetch,
    /// Build and sign the DPoP token.
    DpopToken,
    /// Exchange the DPoP token for an access token.
    AccessToken,
    /// Validate the DPoP challenge.
    DpopChallenge,
    /// Validate the OIDC challenge.
    OidcChallenge,
    /// Poll the order state.
    CheckOrder,
    /// Finalize the order.
    FinalizeOrder,
    /// Download the issued certificate.
    FetchCertificate,
    /// Install the certificate into the group session manager.
    InstallCertificate,
}

impl EnrollmentStep {
    /// All steps in execution order.
    pub const ALL: [Self; 14] = [
        Self::Directory,
        Self::InitialNonce,
        Self::CreateAccount,
        Self::CreateOrder,
        Self::CreateAuthorization,
        Self::BackendNonceFetch,
        Self::DpopToken,
        Self::AccessToken,
        Self::DpopChallenge,
        Self::OidcChallenge,
        Self::CheckOrder,
        Self::FinalizeOrder,
        Self::FetchCertificate,
        Self::InstallCertificate,
    ];
}

impl fmt::Display for EnrollmentStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Directory => "directory",
            Self::InitialNonce => "initial-nonce",
            Self::CreateAccount => "create-account",
            Self::CreateOrder => "create-order",
            Self::CreateAuthorization => "create-authorization",
            Self::BackendNonceFetch => "backend-nonce",
            Self::DpopToken => "dpop-token",
            Self::AccessToken => "access-token",
            Self::DpopChallenge => "dpop-challenge",
            Self::OidcChallenge => "oidc-challenge",
            Self::CheckOrder => "check-order",
            Self::FinalizeOrder => "finalize-order",
            Self::FetchCertificate => "fetch-certificate",
            Self::InstallCertificate => "install-certificate",
        };
        f.write_str(name)
    }
}

/// Why an enrollment step failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnrollmentCause {
    /// The network client reported a failure
    #[error(transparent)]
    Acme(#[from] AcmeError),

    /// Installing the certificate into the session stores failed
    #[error(transparent)]
    Install(#[from] TransactionError),

    /// The attempt was cancelled before the step ran
    #[error("enrollment cancelled")]
    Cancelled,
}

/// Terminal failure of one enrollment attempt.
///
/// Tags exactly which step failed so callers can present precise
/// diagnostics. The attempt is over; restarting enrollment starts from
/// scratch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("enrollment failed at {step}: {cause}")]
pub struct EnrollmentError {
    /// The step that failed; later steps never executed.
    pub step: EnrollmentStep,

    /// Underlying failure.
    pub cause: EnrollmentCause,
}

/// Installs an enrolled certificate into the session stores.
///
/// Implemented by the transaction provider; returns newly discovered
/// revocation distribution points.
#[async_trait]
pub trait CertificateInstaller: Send + Sync {
    /// Install the certificate, atomically with respect to the key stores.
    async fn install(&self, certificate: &Certificate) -> Result<Vec<String>, TransactionError>;
}

#[async_trait]
impl CertificateInstaller for CryptoTransactionProvider {
    async fn install(&self, certificate: &Certificate) -> Result<Vec<String>, TransactionError> {
        self.transaction("install-certificate", |tx| {
            let certificate = certificate.clone();
            Box::pin(async move {
                let mut group = tx.require_group()?;
                Ok(group.install_certificate(&certificate).await?)
            })
        })
        .await
    }
}

/// Bounded retry for the access-token exchange.
///
/// The backend is eventually consistent right after client registration and
/// can briefly answer 404; a bounded backoff replaces the fixed delay the
/// protocol does not actually require.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first.
    pub attempts: u32,

    /// Delay before the second attempt; doubles per retry.
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 3, initial_delay: Duration::from_millis(200) }
    }
}

/// Upper bound on the doubling access-token backoff.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// One enrollment attempt.
///
/// Not persisted; a failed attempt is abandoned, not resumed.
pub struct Enrollment<'a> {
    acme: &'a dyn AcmeClient,
    installer: &'a dyn CertificateInstaller,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl<'a> Enrollment<'a> {
    /// Build an enrollment attempt over the given collaborators.
    pub fn new(acme: &'a dyn AcmeClient, installer: &'a dyn CertificateInstaller) -> Self {
        Self { acme, installer, retry: RetryPolicy::default(), cancel: CancellationToken::new() }
    }

    /// Override the access-token retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Token cancelling this attempt. Cancellation is observed between
    /// steps; server-side state is left as-is.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the attempt to completion.
    ///
    /// On success the certificate has been installed exactly once and is
    /// returned. On failure the error names the failing step.
    pub async fn enroll(&self, claims: &IdentityClaims) -> Result<Certificate, EnrollmentError> {
        use EnrollmentStep as Step;

        self.checkpoint(Step::Directory)?;
        let directory =
            self.acme.directory().await.map_err(|e| fail(Step::Directory, e))?;

        self.checkpoint(Step::InitialNonce)?;
        let nonce = self
            .acme
            .fresh_nonce(&directory.new_nonce)
            .await
            .map_err(|e| fail(Step::InitialNonce, e))?;

        self.checkpoint(Step::CreateAccount)?;
        let account = self
            .acme
            .create_account(&directory.new_account, nonce)
            .await
            .map_err(|e| fail(Step::CreateAccount, e))?;
        let nonce = account.nonce;

        self.checkpoint(Step::CreateOrder)?;
        let order = self
            .acme
            .create_order(&directory.new_order, nonce)
            .await
            .map_err(|e| fail(Step::CreateOrder, e))?;
        let nonce = order.nonce;

        self.checkpoint(Step::CreateAuthorization)?;
        let authorization = self
            .acme
            .create_authorization(&order.authorization_url, nonce)
            .await
            .map_err(|e| fail(Step::CreateAuthorization, e))?;
        let nonce = authorization.nonce;

        self.checkpoint(Step::BackendNonceFetch)?;
        let backend_nonce =
            self.acme.backend_nonce().await.map_err(|e| fail(Step::BackendNonceFetch, e))?;

        self.checkpoint(Step::DpopToken)?;
        let dpop_token = self
            .acme
            .dpop_token(claims, backend_nonce)
            .await
            .map_err(|e| fail(Step::DpopToken, e))?;

        self.checkpoint(Step::AccessToken)?;
        let access_token = self.access_token_with_retry(&dpop_token).await?;

        self.checkpoint(Step::DpopChallenge)?;
        let response = self
            .acme
            .validate_dpop_challenge(&authorization.dpop_challenge, &access_token, nonce)
            .await
            .map_err(|e| fail(Step::DpopChallenge, e))?;
        let nonce = response.nonce;

        self.checkpoint(Step::OidcChallenge)?;
        let response = self
            .acme
            .validate_oidc_challenge(&authorization.oidc_challenge, &claims.id_token, nonce)
            .await
            .map_err(|e| fail(Step::OidcChallenge, e))?;
        let nonce = response.nonce;

        self.checkpoint(Step::CheckOrder)?;
        let status = self
            .acme
            .check_order(&order.order_url, nonce)
            .await
            .map_err(|e| fail(Step::CheckOrder, e))?;
        if status.state != OrderState::Ready {
            return Err(fail(
                Step::CheckOrder,
                AcmeError::OrderNotReady(format!("{:?}", status.state)),
            ));
        }
        let nonce = status.nonce;

        self.checkpoint(Step::FinalizeOrder)?;
        let finalize = self
            .acme
            .finalize(&status.finalize_url, nonce)
            .await
            .map_err(|e| fail(Step::FinalizeOrder, e))?;
        let nonce = finalize.nonce;

        self.checkpoint(Step::FetchCertificate)?;
        let certificate = self
            .acme
            .certificate(&finalize.certificate_url, nonce)
            .await
            .map_err(|e| fail(Step::FetchCertificate, e))?;

        self.checkpoint(Step::InstallCertificate)?;
        let distribution_points =
            self.installer.install(&certificate).await.map_err(|cause| EnrollmentError {
                step: Step::InstallCertificate,
                cause: EnrollmentCause::Install(cause),
            })?;

        tracing::info!(
            handle = %claims.handle,
            new_distribution_points = distribution_points.len(),
            "enrollment succeeded"
        );
        Ok(certificate)
    }

    async fn access_token_with_retry(
        &self,
        token: &DpopToken,
    ) -> Result<AccessToken, EnrollmentError> {
        let mut delay = self.retry.initial_delay;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.acme.backend_access_token(token).await {
                Ok(access) => return Ok(access),
                Err(err) if err.is_transient() && attempt < self.retry.attempts => {
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "access token not available yet, backing off"
                    );
                    tokio::select! {
                        () = self.cancel.cancelled() => {
                            return Err(EnrollmentError {
                                step: EnrollmentStep::AccessToken,
                                cause: EnrollmentCause::Cancelled,
                            });
                        },
                        () = tokio::time::sleep(delay) => {},
                    }
                    delay = delay.saturating_mul(2).min(MAX_RETRY_DELAY);
                },
                Err(err) => return Err(fail(EnrollmentStep::AccessToken, err)),
            }
        }
    }

    fn checkpoint(&self, step: EnrollmentStep) -> Result<(), EnrollmentError> {
        if self.cancel.is_cancelled() {
            return Err(EnrollmentError { step, cause: EnrollmentCause::Cancelled });
        }
        Ok(())
    }
}

fn fail(step: EnrollmentStep, cause: AcmeError) -> EnrollmentError {
    EnrollmentError { step, cause: EnrollmentCause::Acme(cause) }
}
