use crate::db::DbError;
use crate::retry::classify;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type StoreResult<T> = Result<T, StoreError>;

/// Message shown to end users when contention outlasts every retry.
pub const TRANSIENT_USER_MESSAGE: &str =
    "Storage is temporarily busy. Please try again in a moment.";

/// Error type shared by every storage backend and the reliability layer.
#[derive(Debug)]
pub enum StoreError {
    /// Failure reported by the embedded SQL engine.
    Db(DbError),
    /// Engine-specific failure from a non-SQL backend.
    Backend {
        backend: &'static str,
        message: String,
    },
    /// `begin` on a manager whose transaction is still active.
    AlreadyActive,
    NoActiveTransaction,
    /// The deadline fired and the transaction was rolled back.
    TransactionTimedOut,
    UnknownSavepoint(String),
    /// Release targeted a savepoint that is not the most recent one.
    SavepointNotLatest(String),
    DuplicateSavepoint(String),
    InvalidIdentifier(String),
    InvalidData(String),
    /// Unique or other constraint violation in a non-SQL backend.
    Constraint(String),
    /// Backend cannot be used on this host.
    Unavailable(String),
    /// Backend was closed; no further operations are accepted.
    Closed,
    Serialization(serde_json::Error),
    Io(std::io::Error),
}

impl StoreError {
    pub fn backend(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            backend,
            message: message.into(),
        }
    }

    /// Returns `true` for lock/busy contention worth retrying.
    pub fn is_transient(&self) -> bool {
        classify(self).is_retryable()
    }

    /// Returns the text that may be shown to end users.
    ///
    /// Transient failures get a generic message; internal details stay in
    /// logs.
    pub fn user_message(&self) -> String {
        if self.is_transient() {
            TRANSIENT_USER_MESSAGE.to_string()
        } else {
            self.to_string()
        }
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::Backend { backend, message } => write!(f, "{backend} backend: {message}"),
            Self::AlreadyActive => write!(f, "transaction is already active"),
            Self::NoActiveTransaction => write!(f, "no active transaction"),
            Self::TransactionTimedOut => {
                write!(f, "transaction exceeded its deadline and was rolled back")
            }
            Self::UnknownSavepoint(name) => write!(f, "savepoint `{name}` does not exist"),
            Self::SavepointNotLatest(name) => {
                write!(f, "savepoint `{name}` is not the most recent savepoint")
            }
            Self::DuplicateSavepoint(name) => write!(f, "savepoint `{name}` already exists"),
            Self::InvalidIdentifier(name) => write!(f, "invalid identifier `{name}`"),
            Self::InvalidData(message) => write!(f, "invalid data: {message}"),
            Self::Constraint(message) => write!(f, "constraint violation: {message}"),
            Self::Unavailable(message) => write!(f, "backend unavailable: {message}"),
            Self::Closed => write!(f, "storage backend is closed"),
            Self::Serialization(err) => write!(f, "serialization failed: {err}"),
            Self::Io(err) => write!(f, "io failure: {err}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Serialization(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}
