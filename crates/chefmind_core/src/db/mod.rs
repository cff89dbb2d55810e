//! SQLite bootstrap, schema migrations and connection pooling.
//!
//! # Responsibility
//! - Open and configure SQLite connections for the embedded SQL backend.
//! - Apply schema migrations in deterministic order.
//! - Provide the optional fixed-size connection pool and periodic
//!   maintenance statements.
//!
//! # Invariants
//! - Migration version is tracked via `PRAGMA user_version`.
//! - No application table is read or written before migrations succeed.
//! - Pool size is fixed when the pool is constructed.

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

pub mod maintenance;
pub mod migrations;
mod open;
pub mod pool;

pub use open::{configure_connection, open_db, open_db_in_memory, PragmaOptions};

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
    UnsupportedSchemaVersion {
        db_version: u32,
        latest_supported: u32,
    },
    /// Filesystem failure while preparing the database location.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    PoolExhausted {
        waited_ms: u128,
    },
    PoolClosed,
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::UnsupportedSchemaVersion {
                db_version,
                latest_supported,
            } => write!(
                f,
                "database schema version {db_version} is newer than supported {latest_supported}"
            ),
            Self::Io { path, source } => {
                write!(f, "cannot prepare database path `{}`: {source}", path.display())
            }
            Self::PoolExhausted { waited_ms } => {
                write!(f, "no pooled connection became available within {waited_ms}ms")
            }
            Self::PoolClosed => write!(f, "connection pool is closed"),
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::Io { source, .. } => Some(source),
            Self::UnsupportedSchemaVersion { .. }
            | Self::PoolExhausted { .. }
            | Self::PoolClosed => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}
