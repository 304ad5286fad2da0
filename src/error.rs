//! Store Error Types
//!
//! Error taxonomy shared by the repository, the unit of work and the
//! composite operations built on top of them.

use thiserror::Error;

/// PostgreSQL SQLSTATE for `unique_violation`
const PG_UNIQUE_VIOLATION: &str = "23505";
/// PostgreSQL SQLSTATE for `foreign_key_violation`
const PG_FOREIGN_KEY_VIOLATION: &str = "23503";

/// Relational store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Referenced row is absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Uniqueness violation (e.g. duplicate username)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Caller-supplied precondition violated
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Transfer would drive the source account below zero
    #[error("Insufficient funds: account {account_id} at {balance} after debit of {amount}")]
    InsufficientFunds {
        account_id: i64,
        balance: i64,
        amount: i64,
    },

    /// Unexpected store failure (connection lost, commit failed, ...)
    #[error("Internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "NOT_FOUND",
            StoreError::Conflict(_) => "CONFLICT",
            StoreError::Validation(_) => "VALIDATION_FAILED",
            StoreError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            StoreError::Internal(_) => "INTERNAL",
        }
    }

    /// True when the failure is caused by a missing referent
    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                Some(PG_UNIQUE_VIOLATION) => StoreError::Conflict(db_err.message().to_string()),
                Some(PG_FOREIGN_KEY_VIOLATION) => {
                    StoreError::NotFound(db_err.message().to_string())
                }
                _ => StoreError::Internal(e.to_string()),
            },
            _ => StoreError::Internal(e.to_string()),
        }
    }
}

impl From<validator::ValidationErrors> for StoreError {
    fn from(e: validator::ValidationErrors) -> Self {
        StoreError::Validation(e.to_string())
    }
}
