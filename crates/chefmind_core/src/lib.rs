//! Resilient local data access for ChefMind.
//! Backends, retries, transactions and health checks behind one facade.

pub mod bootstrap;
pub mod config;
pub mod db;
pub mod health;
pub mod logging;
pub mod model;
pub mod retry;
pub mod service;
pub mod store;
pub mod transaction;

pub use bootstrap::{select_backend, BackendSelection, FallbackStep, HostEnvironment};
pub use config::{DatabaseLocation, ObjectStoreSettings, SqliteSettings, StorageConfig};
pub use health::{ConnectionStatus, HealthChecker, HealthDetails, HealthProbe, HealthReport};
pub use logging::{default_log_level, init_logging, logging_status, LogSettings, LoggingError};
pub use model::{Condition, Query, Record, RecordId, Row, SortDirection};
pub use retry::{ErrorClass, RetryAttempt, RetryPolicy};
pub use service::DataAccess;
pub use store::{
    BackendKind, MemoryBackend, ObjectStoreBackend, ObjectStoreSchema, SqlBackend,
    StorageBackend, StoreError, StoreResult,
};
pub use transaction::{IsolationLevel, TransactionManager, TransactionOptions, TransactionState};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
