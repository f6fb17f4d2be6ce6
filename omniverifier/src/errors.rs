//! Error types for the engine.
//!
//! Two layers: [`DbError`] categorises store faults (constraint violations are
//! recoverable business signals, everything else is infrastructure), and
//! [`Error`] is the engine surface that callers match on. Infrastructure
//! errors stay local to the loop that hit them; business errors (credits,
//! not-found, bad input) surface to the caller.

use thiserror::Error;

use crate::provider::ProviderError;
use crate::types::{BatchStatus, UserBatchId};

/// Unified error type for store operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// Entity not found by the given identifier
    #[error("entity not found")]
    NotFound,

    /// Unique constraint violation
    #[error("unique constraint violation: {message}")]
    UniqueViolation {
        constraint: Option<String>,
        message: String,
    },

    /// Foreign key constraint violation
    #[error("foreign key constraint violation: {message}")]
    ForeignKeyViolation {
        constraint: Option<String>,
        message: String,
    },

    /// Check constraint violation
    #[error("check constraint violation: {message}")]
    CheckViolation {
        constraint: Option<String>,
        message: String,
    },

    /// Catch-all for non-recoverable errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => DbError::NotFound,
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() {
                    DbError::UniqueViolation {
                        constraint: db_err.constraint().map(|s| s.to_string()),
                        message: db_err.message().to_string(),
                    }
                } else if db_err.is_foreign_key_violation() {
                    DbError::ForeignKeyViolation {
                        constraint: db_err.constraint().map(|s| s.to_string()),
                        message: db_err.message().to_string(),
                    }
                } else if db_err.is_check_violation() {
                    DbError::CheckViolation {
                        constraint: db_err.constraint().map(|s| s.to_string()),
                        message: db_err.message().to_string(),
                    }
                } else {
                    DbError::Other(anyhow::Error::from(err))
                }
            }
            _ => DbError::Other(anyhow::Error::from(err)),
        }
    }
}

/// Engine-level error.
#[derive(Debug, Error)]
pub enum Error {
    /// Requested resource not found
    #[error("{resource} with ID {id} not found")]
    NotFound { resource: &'static str, id: String },

    /// Not enough credits to cover a deduction
    #[error("insufficient credits: need {required}, have {available}")]
    InsufficientCredits { required: i64, available: i64 },

    /// A batch was asked to move through a transition its status does not allow
    #[error("batch {batch_id} cannot move from {from} to {to}")]
    InvalidTransition {
        batch_id: UserBatchId,
        from: BatchStatus,
        to: BatchStatus,
    },

    /// Invalid request data or business rule violation
    #[error("{0}")]
    BadRequest(String),

    /// Store operation error
    #[error(transparent)]
    Database(#[from] DbError),

    /// Verification provider error
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Enrichment source could not be parsed
    #[error("enrichment source error: {0}")]
    EnrichmentSource(String),

    /// Object storage error
    #[error("object storage error: {0}")]
    ObjectStore(String),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Database(DbError::from(err))
    }
}

/// Type alias for engine operation results
pub type Result<T> = std::result::Result<T, Error>;
