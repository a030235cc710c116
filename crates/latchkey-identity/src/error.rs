//! Error types for identity enrollment and revocation freshness.

use thiserror::Error;

/// Errors from the ACME-style network client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcmeError {
    /// Network unreachable or request aborted
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-2xx response from the enrollment backend
    #[error("unexpected status {status} from {url}")]
    Status {
        /// Request URL
        url: String,
        /// HTTP status code
        status: u16,
    },

    /// A request carried a nonce the server did not expect
    #[error("nonce mismatch at {0}")]
    NonceMismatch(String),

    /// The order is not ready to be finalized
    #[error("order not ready: {0}")]
    OrderNotReady(String),

    /// Response body could not be parsed
    #[error("malformed response: {0}")]
    Decode(String),
}

impl AcmeError {
    /// Returns true if this failure may resolve on its own shortly.
    ///
    /// Transport failures and server-side errors are transient; the backend
    /// also answers 404 while a freshly registered client has not propagated
    /// yet. Nonce mismatches and malformed responses are never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => *status == 404 || *status >= 500,
            Self::NonceMismatch(_) | Self::OrderNotReady(_) | Self::Decode(_) => false,
        }
    }
}

/// Errors from the persistence facility backing the revocation cache.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("store error: {0}")]
pub struct StoreError(pub String);
