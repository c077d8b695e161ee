//! Unified error handling for parleyd.
//!
//! `StoreError` is the closed error set shared by the persistence contract,
//! the authenticator and validator plugins, and the account handlers. Handler
//! code maps it onto a ctrl reply with `decode_store_error`.

use thiserror::Error;

/// Errors crossing the persistence and plugin boundaries.
///
/// This set is closed: adapters and plugins must map their internal failures
/// onto one of these variants. Anything unexpected becomes `Internal`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Entity is absent.
    #[error("not found")]
    NotFound,

    /// Uniqueness violation: auth secret or validated credential.
    #[error("duplicate value")]
    Duplicate,

    /// Validator response mismatch. Soft inside credential updates.
    #[error("credentials mismatch")]
    Credentials,

    /// Required credentials missing, retries exceeded, or an attempt to
    /// delete the last credential of a required method.
    #[error("policy violation")]
    Policy,

    /// Syntactically invalid input, unknown auth scheme.
    #[error("malformed input")]
    Malformed,

    /// Operation not applicable to this auth level or scheme.
    #[error("unsupported operation")]
    Unsupported,

    /// Any other storage or backend failure.
    #[error("internal: {0}")]
    Internal(String),
}

impl StoreError {
    /// Static error code for logging and metrics labels.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Duplicate => "duplicate",
            Self::Credentials => "credentials",
            Self::Policy => "policy",
            Self::Malformed => "malformed",
            Self::Unsupported => "unsupported",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => StoreError::Duplicate,
            _ => StoreError::Internal(err.to_string()),
        }
    }
}
