/// Domain error taxonomy shared by the store, the vault and the OAuth flow
use thiserror::Error;

use crate::crypto::CryptoError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A required field on a domain entity is missing or invalid
    #[error("{field} {reason}")]
    Validation {
        field: &'static str,
        reason: &'static str,
    },
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// The `state` parameter could not be decoded
    #[error("malformed oauth state")]
    BadState,
    /// The decoded state was never issued, was already consumed, expired, or
    /// was bound to another redirect
    #[error("invalid oauth state")]
    InvalidState,
    #[error("{resource} {key} not found")]
    NotFound {
        resource: &'static str,
        key: String,
    },
    #[error("{resource} with {field} {value} already exists")]
    Conflict {
        resource: &'static str,
        field: &'static str,
        value: String,
    },
    #[error("forbidden: {0}")]
    Forbidden(&'static str),
    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),
    /// The identity provider rejected or failed a request
    #[error("provider error: {0}")]
    Provider(String),
    #[error("system randomness unavailable")]
    Entropy,
    /// The underlying persistence layer failed
    #[error("store error: {0}")]
    Store(String),
}

impl Error {
    pub fn validation(field: &'static str, reason: &'static str) -> Self {
        Self::Validation { field, reason }
    }

    pub fn not_found(resource: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            resource,
            key: key.to_string(),
        }
    }

    /// Stable machine-readable kind, used in structured error responses
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "validation_error",
            Error::Crypto(_) => "crypto_error",
            Error::BadState => "bad_state",
            Error::InvalidState => "invalid_state",
            Error::NotFound { .. } => "not_found",
            Error::Conflict { .. } => "conflict",
            Error::Forbidden(_) => "forbidden",
            Error::Unauthorized(_) => "unauthorized",
            Error::Provider(_) => "provider_error",
            Error::Entropy => "entropy_error",
            Error::Store(_) => "store_error",
        }
    }
}
