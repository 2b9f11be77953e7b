//! Archive Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. The underlying `sqlx`/IO error is
//! kept as a child frame, the kind on top tells the caller what to do.

use derive_more::{Display, Error};

/// An archive error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for archive operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Input was rejected before anything touched the database.
    #[display("invalid input: {_0}")]
    Validation(#[error(not(source))] &'static str),
    /// The content has already been imported. Re-importing the same file is
    /// an expected, recoverable outcome.
    #[display("duplicate entry")]
    DuplicateEntry,
    /// A uniqueness constraint other than the entry path fired.
    #[display("conflict: {_0}")]
    Conflict(#[error(not(source))] &'static str),
    #[display("not found: {_0}")]
    NotFound(#[error(not(source))] &'static str),
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
    /// Placing, reading or removing media bytes failed.
    #[display("media storage error")]
    Storage,
    /// Reading a media stream failed.
    #[display("I/O error")]
    Io,
    /// The operation did not finish before its deadline.
    #[display("deadline exceeded")]
    Timeout,
    /// A database row could not be converted into a domain type.
    #[display("invalid archive data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(e) if e.is_unique_violation())
}

pub(crate) fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(e) if e.is_foreign_key_violation())
}
