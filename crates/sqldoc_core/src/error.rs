//! Error taxonomy shared by store, session and command execution.
//!
//! # Responsibility
//! - Give callers one error type with distinct kinds for disposal, misuse,
//!   concurrency conflicts and provider failures.
//!
//! # Invariants
//! - Provider errors (`rusqlite::Error`) are carried unchanged.
//! - `ConcurrencyConflict` is never folded into a generic failure.

use std::error::Error;
use std::fmt::{Display, Formatter};

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by store, session and command operations.
#[derive(Debug)]
pub enum StoreError {
    /// Operation attempted on a disposed session.
    Disposed,
    /// Caller or index contract misuse.
    InvalidOperation(String),
    /// Conditional document update matched no row.
    ConcurrencyConflict {
        document_id: i64,
        expected_version: i64,
    },
    /// Content or index value could not be (de)serialized.
    Serialization(serde_json::Error),
    /// Index value has an unsupported shape or name.
    InvalidIndex(String),
    /// Persisted row cannot be decoded.
    InvalidData(String),
    /// Store configuration rejected at open time.
    Config(String),
    /// Underlying SQLite error.
    Db(rusqlite::Error),
}

impl StoreError {
    pub(crate) fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation(message.into())
    }

    /// Returns whether this error is an optimistic concurrency conflict.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disposed => write!(f, "session has been disposed"),
            Self::InvalidOperation(message) => write!(f, "invalid operation: {message}"),
            Self::ConcurrencyConflict {
                document_id,
                expected_version,
            } => write!(
                f,
                "concurrency conflict on document {document_id}: expected version {expected_version}"
            ),
            Self::Serialization(err) => write!(f, "serialization failed: {err}"),
            Self::InvalidIndex(message) => write!(f, "invalid index: {message}"),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
            Self::Config(message) => write!(f, "invalid store configuration: {message}"),
            Self::Db(err) => write!(f, "{err}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Serialization(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::Disposed
            | Self::InvalidOperation(_)
            | Self::ConcurrencyConflict { .. }
            | Self::InvalidIndex(_)
            | Self::InvalidData(_)
            | Self::Config(_) => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value)
    }
}
