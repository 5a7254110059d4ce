// Error taxonomy shared by the stores and the transport.

use thiserror::Error;

/// Errors raised by the SQLite-backed repositories and the blob store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A query failed. Usually transient (busy database, pool timeout).
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Stored bytes no longer decode, or the schema does not match. Fatal for the store.
    #[error("corrupt data in {what}: {detail}")]
    Corrupt { what: &'static str, detail: String },
    #[error("encode {what}: {detail}")]
    Encode { what: &'static str, detail: String },
    #[error("blob {0} not found")]
    MissingBlob(i64),
    /// The payload can never be stored as sent (conflicting agent id, out-of-range value).
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("store is closed")]
    Closed,
}

impl StoreError {
    pub(crate) fn corrupt(what: &'static str, detail: impl std::fmt::Display) -> Self {
        StoreError::Corrupt {
            what,
            detail: detail.to_string(),
        }
    }

    pub(crate) fn encode(what: &'static str, detail: impl std::fmt::Display) -> Self {
        StoreError::Encode {
            what,
            detail: detail.to_string(),
        }
    }

    pub(crate) fn rejected(detail: impl std::fmt::Display) -> Self {
        StoreError::Rejected(detail.to_string())
    }

    /// True when the store instance can no longer be trusted and the caller should stop
    /// sending work to it.
    pub fn is_fatal(&self) -> bool {
        match self {
            StoreError::Corrupt { .. } | StoreError::MissingBlob(_) => true,
            StoreError::Database(e) => matches!(
                e,
                sqlx::Error::ColumnDecode { .. }
                    | sqlx::Error::ColumnNotFound(_)
                    | sqlx::Error::TypeNotFound { .. }
            ),
            StoreError::Encode { .. } | StoreError::Rejected(_) | StoreError::Closed => false,
        }
    }

    /// True when the same payload would fail the same way on every retry.
    pub fn is_payload_error(&self) -> bool {
        matches!(self, StoreError::Encode { .. } | StoreError::Rejected(_))
    }

    /// True for a unique-constraint violation (two writers inserting the same new key).
    pub fn is_conflict(&self) -> bool {
        match self {
            StoreError::Database(sqlx::Error::Database(db)) => db.is_unique_violation(),
            _ => false,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of a single delivery attempt over the collector channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Network error or collector unavailable. Retried with backoff.
    #[error("collector unavailable: {0}")]
    Unavailable(String),
    /// The collector refused the payload. Retrying would fail identically.
    #[error("collector rejected request: {0}")]
    Rejected(String),
    #[error("channel closed")]
    Closed,
}

impl CallError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CallError::Unavailable(_))
    }
}

/// Errors raised while shutting a transport down.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timed out after {timeout_secs}s draining {resource}")]
    DrainTimeout {
        resource: &'static str,
        timeout_secs: u64,
    },
}
