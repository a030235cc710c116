//! Scripted network client for enrollment and revocation tests.
//!
//! [`ScriptedAcmeClient`] plays the server side of the enrollment pipeline:
//! it issues a deterministic nonce chain (`n1`, `n2`, ...), verifies that
//! every request carries exactly the nonce the previous response handed
//! out, counts calls per pipeline step, and can be scripted to fail at any
//! step. [`CountingInstaller`] and [`ScriptedRegistrar`] stand in for the
//! transaction provider on the installation and revocation seams.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::SystemTime,
};

use async_trait::async_trait;
use latchkey_core::{
    engine::{Certificate, CrlRegistration},
    error::TransactionError,
};
use latchkey_identity::{
    acme::{
        AccessToken, AccountResponse, AcmeClient, AcmeDirectory, AuthorizationResponse,
        BackendNonce, Challenge, ChallengeResponse, DpopToken, FinalizeResponse, IdentityClaims,
        Nonce, OrderResponse, OrderState, OrderStatus,
    },
    enrollment::{CertificateInstaller, EnrollmentStep},
    error::AcmeError,
    revocation::CrlRegistrar,
};

struct AcmeScript {
    seq: u64,
    expected_nonce: Option<String>,
    expected_backend_nonce: Option<String>,
    calls: HashMap<EnrollmentStep, u32>,
    failures: HashMap<EnrollmentStep, AcmeError>,
    transient_token_failures: u32,
    order_state: OrderState,
    crl_documents: HashMap<String, Vec<u8>>,
    crl_fetch_delay: std::time::Duration,
    fetched_crls: Vec<String>,
}

/// Deterministic in-memory [`AcmeClient`].
pub struct ScriptedAcmeClient {
    inner: Mutex<AcmeScript>,
}

impl ScriptedAcmeClient {
    /// A client that answers every request successfully.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(AcmeScript {
                seq: 0,
                expected_nonce: None,
                expected_backend_nonce: None,
                calls: HashMap::new(),
                failures: HashMap::new(),
                transient_token_failures: 0,
                order_state: OrderState::Ready,
                crl_documents: HashMap::new(),
                crl_fetch_delay: std::time::Duration::ZERO,
                fetched_crls: Vec::new(),
            }),
        }
    }

    /// Fail the request backing `step` with `error`, every time it is made.
    pub fn fail_at(&self, step: EnrollmentStep, error: AcmeError) {
        self.lock().failures.insert(step, error);
    }

    /// Answer the first `count` access-token exchanges with a 404, then
    /// succeed.
    pub fn fail_access_token_transiently(&self, count: u32) {
        self.lock().transient_token_failures = count;
    }

    /// State the order reports when polled.
    pub fn set_order_state(&self, state: OrderState) {
        self.lock().order_state = state;
    }

    /// Serve `document` when the list at `url` is fetched.
    pub fn set_crl_document(&self, url: impl Into<String>, document: impl Into<Vec<u8>>) {
        self.lock().crl_documents.insert(url.into(), document.into());
    }

    /// Hold every revocation-list fetch for `delay` before answering.
    pub fn delay_crl_fetches(&self, delay: std::time::Duration) {
        self.lock().crl_fetch_delay = delay;
    }

    /// How many times the request backing `step` was made.
    pub fn calls(&self, step: EnrollmentStep) -> u32 {
        self.lock().calls.get(&step).copied().unwrap_or(0)
    }

    /// Total calls across every step strictly after `step` in pipeline
    /// order.
    pub fn calls_after(&self, step: EnrollmentStep) -> u32 {
        EnrollmentStep::ALL
            .iter()
            .filter(|candidate| **candidate > step)
            .map(|candidate| self.calls(*candidate))
            .sum()
    }

    /// URLs whose revocation lists were fetched, in order.
    pub fn fetched_crls(&self) -> Vec<String> {
        self.lock().fetched_crls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AcmeScript> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn enter(&self, step: EnrollmentStep) -> Result<(), AcmeError> {
        let mut script = self.lock();
        *script.calls.entry(step).or_insert(0) += 1;
        match script.failures.get(&step) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn issue_nonce(&self) -> Nonce {
        let mut script = self.lock();
        script.seq += 1;
        let value = format!("n{}", script.seq);
        script.expected_nonce = Some(value.clone());
        Nonce::new(value)
    }

    fn consume_nonce(&self, url: &str, nonce: &Nonce) -> Result<(), AcmeError> {
        let mut script = self.lock();
        match script.expected_nonce.take() {
            Some(expected) if expected == nonce.as_str() => Ok(()),
            _ => Err(AcmeError::NonceMismatch(url.to_owned())),
        }
    }
}

impl Default for ScriptedAcmeClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AcmeClient for ScriptedAcmeClient {
    async fn directory(&self) -> Result<AcmeDirectory, AcmeError> {
        self.enter(EnrollmentStep::Directory)?;
        Ok(AcmeDirectory {
            new_nonce: "https://acme.test/new-nonce".into(),
            new_account: "https://acme.test/new-account".into(),
            new_order: "https://acme.test/new-order".into(),
        })
    }

    async fn fresh_nonce(&self, _url: &str) -> Result<Nonce, AcmeError> {
        self.enter(EnrollmentStep::InitialNonce)?;
        Ok(self.issue_nonce())
    }

    async fn create_account(&self, url: &str, nonce: Nonce) -> Result<AccountResponse, AcmeError> {
        self.enter(EnrollmentStep::CreateAccount)?;
        self.consume_nonce(url, &nonce)?;
        Ok(AccountResponse { nonce: self.issue_nonce() })
    }

    async fn create_order(&self, url: &str, nonce: Nonce) -> Result<OrderResponse, AcmeError> {
        self.enter(EnrollmentStep::CreateOrder)?;
        self.consume_nonce(url, &nonce)?;
        Ok(OrderResponse {
            authorization_url: "https://acme.test/authz/1".into(),
            order_url: "https://acme.test/order/1".into(),
            nonce: self.issue_nonce(),
        })
    }

    async fn create_authorization(
        &self,
        url: &str,
        nonce: Nonce,
    ) -> Result<AuthorizationResponse, AcmeError> {
        self.enter(EnrollmentStep::CreateAuthorization)?;
        self.consume_nonce(url, &nonce)?;
        Ok(AuthorizationResponse {
            dpop_challenge: Challenge {
                url: "https://acme.test/challenge/dpop".into(),
                target: "https://backend.test".into(),
            },
            oidc_challenge: Challenge {
                url: "https://acme.test/challenge/oidc".into(),
                target: "https://idp.test".into(),
            },
            nonce: self.issue_nonce(),
        })
    }

    async fn backend_nonce(&self) -> Result<BackendNonce, AcmeError> {
        self.enter(EnrollmentStep::BackendNonceFetch)?;
        let mut script = self.lock();
        script.expected_backend_nonce = Some("bn1".into());
        Ok(BackendNonce::new("bn1"))
    }

    async fn dpop_token(
        &self,
        claims: &IdentityClaims,
        nonce: BackendNonce,
    ) -> Result<DpopToken, AcmeError> {
        self.enter(EnrollmentStep::DpopToken)?;
        let mut script = self.lock();
        match script.expected_backend_nonce.take() {
            Some(expected) if expected == nonce.as_str() => {},
            _ => return Err(AcmeError::NonceMismatch("backend".into())),
        }
        Ok(DpopToken(format!("dpop:{}:{}", claims.handle, nonce.as_str())))
    }

    async fn backend_access_token(&self, token: &DpopToken) -> Result<AccessToken, AcmeError> {
        self.enter(EnrollmentStep::AccessToken)?;
        let mut script = self.lock();
        if script.transient_token_failures > 0 {
            script.transient_token_failures -= 1;
            return Err(AcmeError::Status {
                url: "https://backend.test/access-token".into(),
                status: 404,
            });
        }
        Ok(AccessToken(format!("access:{}", token.0)))
    }

    async fn validate_dpop_challenge(
        &self,
        challenge: &Challenge,
        _token: &AccessToken,
        nonce: Nonce,
    ) -> Result<ChallengeResponse, AcmeError> {
        self.enter(EnrollmentStep::DpopChallenge)?;
        self.consume_nonce(&challenge.url, &nonce)?;
        Ok(ChallengeResponse { nonce: self.issue_nonce() })
    }

    async fn validate_oidc_challenge(
        &self,
        challenge: &Challenge,
        _id_token: &str,
        nonce: Nonce,
    ) -> Result<ChallengeResponse, AcmeError> {
        self.enter(EnrollmentStep::OidcChallenge)?;
        self.consume_nonce(&challenge.url, &nonce)?;
        Ok(ChallengeResponse { nonce: self.issue_nonce() })
    }

    async fn check_order(&self, order_url: &str, nonce: Nonce) -> Result<OrderStatus, AcmeError> {
        self.enter(EnrollmentStep::CheckOrder)?;
        self.consume_nonce(order_url, &nonce)?;
        let state = self.lock().order_state;
        Ok(OrderStatus {
            state,
            finalize_url: "https://acme.test/finalize/1".into(),
            nonce: self.issue_nonce(),
        })
    }

    async fn finalize(
        &self,
        finalize_url: &str,
        nonce: Nonce,
    ) -> Result<FinalizeResponse, AcmeError> {
        self.enter(EnrollmentStep::FinalizeOrder)?;
        self.consume_nonce(finalize_url, &nonce)?;
        Ok(FinalizeResponse {
            certificate_url: "https://acme.test/cert/1".into(),
            nonce: self.issue_nonce(),
        })
    }

    async fn certificate(&self, cert_url: &str, nonce: Nonce) -> Result<Certificate, AcmeError> {
        self.enter(EnrollmentStep::FetchCertificate)?;
        self.consume_nonce(cert_url, &nonce)?;
        Ok(Certificate::new("-----BEGIN CERTIFICATE-----\ntest\n-----END CERTIFICATE-----"))
    }

    async fn fetch_crl(&self, url: &str) -> Result<Vec<u8>, AcmeError> {
        let (document, delay) = {
            let mut script = self.lock();
            script.fetched_crls.push(url.to_owned());
            (script.crl_documents.get(url).cloned(), script.crl_fetch_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        document.ok_or_else(|| AcmeError::Status { url: url.to_owned(), status: 404 })
    }
}

/// [`CertificateInstaller`] recording every installed certificate.
#[derive(Default)]
pub struct CountingInstaller {
    installed: Mutex<Vec<Certificate>>,
    distribution_points: Mutex<Vec<String>>,
    fail: Mutex<bool>,
}

impl CountingInstaller {
    /// Installer that accepts every certificate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Distribution points returned by subsequent installs.
    pub fn set_distribution_points(&self, urls: Vec<String>) {
        *lock(&self.distribution_points) = urls;
    }

    /// Make every install fail.
    pub fn fail_installs(&self) {
        *lock(&self.fail) = true;
    }

    /// Certificates installed so far, in order.
    pub fn installed(&self) -> Vec<Certificate> {
        lock(&self.installed).clone()
    }
}

#[async_trait]
impl CertificateInstaller for CountingInstaller {
    async fn install(&self, certificate: &Certificate) -> Result<Vec<String>, TransactionError> {
        if *lock(&self.fail) {
            return Err(TransactionError::Storage("scripted install failure".into()));
        }
        lock(&self.installed).push(certificate.clone());
        Ok(lock(&self.distribution_points).clone())
    }
}

/// Verdict scripted per URL for [`ScriptedRegistrar`].
#[derive(Clone)]
enum RegistrarVerdict {
    Accept(CrlRegistration),
    Fail,
}

/// [`CrlRegistrar`] with per-URL scripted verdicts.
#[derive(Default)]
pub struct ScriptedRegistrar {
    verdicts: Mutex<HashMap<String, RegistrarVerdict>>,
    registered: Mutex<Vec<String>>,
}

impl ScriptedRegistrar {
    /// Registrar accepting every document as clean and non-expiring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept documents for `url` with the given expiration.
    pub fn accept(&self, url: impl Into<String>, dirty: bool, expiration: Option<SystemTime>) {
        lock(&self.verdicts)
            .insert(url.into(), RegistrarVerdict::Accept(CrlRegistration { dirty, expiration }));
    }

    /// Fail registration for `url`.
    pub fn fail(&self, url: impl Into<String>) {
        lock(&self.verdicts).insert(url.into(), RegistrarVerdict::Fail);
    }

    /// URLs registered so far, in order.
    pub fn registered(&self) -> Vec<String> {
        lock(&self.registered).clone()
    }
}

#[async_trait]
impl CrlRegistrar for ScriptedRegistrar {
    async fn register_crl(
        &self,
        url: &str,
        _document: &[u8],
    ) -> Result<CrlRegistration, TransactionError> {
        let verdict = lock(&self.verdicts).get(url).cloned();
        match verdict {
            Some(RegistrarVerdict::Fail) => {
                Err(TransactionError::Storage(format!("scripted registration failure for {url}")))
            },
            Some(RegistrarVerdict::Accept(registration)) => {
                lock(&self.registered).push(url.to_owned());
                Ok(registration)
            },
            None => {
                lock(&self.registered).push(url.to_owned());
                Ok(CrlRegistration { dirty: false, expiration: None })
            },
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
