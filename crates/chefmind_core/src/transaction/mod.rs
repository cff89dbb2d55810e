//! Transaction control shared by every storage backend.
//!
//! # Responsibility
//! - Describe the control statements a transaction issues.
//! - Let each backend realise those statements natively through
//!   [`TransactionDriver`].
//! - Drive the lifecycle state machine in [`TransactionManager`].
//!
//! # Invariants
//! - Savepoint names are validated identifiers before reaching a driver.
//! - A driver sees `Begin` before any savepoint statement and exactly one
//!   `Commit` or `Rollback` per `Begin`.

mod manager;

pub use manager::{TransactionManager, TransactionOptions, TransactionState};

use crate::store::StoreResult;

pub const DEFAULT_TRANSACTION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Locking mode requested when a transaction begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    Deferred,
    #[default]
    Immediate,
    Exclusive,
}

impl IsolationLevel {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Deferred => "DEFERRED",
            Self::Immediate => "IMMEDIATE",
            Self::Exclusive => "EXCLUSIVE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatement {
    Begin(IsolationLevel),
    Commit,
    Rollback,
    Savepoint(String),
    ReleaseSavepoint(String),
    RollbackToSavepoint(String),
}

impl TxStatement {
    /// SQL text for engines that speak SQL transactions.
    ///
    /// Rolling back to a savepoint also releases it; SQLite would otherwise
    /// keep it open after the manager has dropped it.
    pub fn to_sql(&self) -> String {
        match self {
            Self::Begin(level) => format!("BEGIN {} TRANSACTION", level.as_sql()),
            Self::Commit => "COMMIT".to_string(),
            Self::Rollback => "ROLLBACK".to_string(),
            Self::Savepoint(name) => format!("SAVEPOINT {name}"),
            Self::ReleaseSavepoint(name) => format!("RELEASE SAVEPOINT {name}"),
            Self::RollbackToSavepoint(name) => {
                format!("ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}")
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Begin(_) => "begin",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
            Self::Savepoint(_) => "savepoint",
            Self::ReleaseSavepoint(_) => "release",
            Self::RollbackToSavepoint(_) => "rollback_to",
        }
    }
}

/// Backend-side realisation of transaction control.
pub trait TransactionDriver: Send + Sync {
    fn execute_statement(&self, statement: &TxStatement) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::{IsolationLevel, TxStatement};

    #[test]
    fn statements_render_sqlite_syntax() {
        assert_eq!(
            TxStatement::Begin(IsolationLevel::Immediate).to_sql(),
            "BEGIN IMMEDIATE TRANSACTION"
        );
        assert_eq!(
            TxStatement::RollbackToSavepoint("sp_1".into()).to_sql(),
            "ROLLBACK TO SAVEPOINT sp_1; RELEASE SAVEPOINT sp_1"
        );
        assert_eq!(
            TxStatement::ReleaseSavepoint("sp_1".into()).to_sql(),
            "RELEASE SAVEPOINT sp_1"
        );
    }
}
