//! Storage error model.
//!
//! These are **infrastructure errors**: a run that hits one aborts without
//! advancing its checkpoint. Data problems on individual jobs are not errors at
//! this level; they become `error` state transitions on the job itself.

use thiserror::Error;

use vectorsync_core::DomainError;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// A statement failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// A persisted row could not be mapped to a domain type.
    #[error("invalid row in {table}: {reason}")]
    InvalidRow { table: &'static str, reason: String },

    /// A table name failed the identifier check.
    #[error("unsafe table name: '{0}'")]
    UnsafeIdentifier(String),
}

impl StoreError {
    pub fn invalid_row(table: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidRow {
            table,
            reason: reason.into(),
        }
    }

    pub fn from_domain(table: &'static str, err: DomainError) -> Self {
        Self::invalid_row(table, err.to_string())
    }
}

/// Map SQLx errors to `StoreError`.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            StoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Connection(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Connection(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::Io(io) => StoreError::Connection(format!("io error in {}: {}", operation, io)),
        sqlx::Error::Tls(tls) => {
            StoreError::Connection(format!("tls error in {}: {}", operation, tls))
        }
        sqlx::Error::ColumnDecode { index, source } => StoreError::Storage(format!(
            "failed to decode column {} in {}: {}",
            index, operation, source
        )),
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
