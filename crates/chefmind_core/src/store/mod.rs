//! Storage backend abstraction and its three implementations.
//!
//! # Responsibility
//! - Define the CRUD/query contract every backend fulfils.
//! - Provide the embedded SQL, object-store and in-memory engines.
//!
//! # Invariants
//! - Backends are interchangeable: the same operation sequence yields the
//!   same records, ids and ordering on every backend.
//! - Ids are assigned by the backend, unique and increasing per table.
//! - `created_at`/`updated_at` are set by the backend on every write.
//! - A closed backend rejects every operation with [`StoreError::Closed`].
//!
//! # See also
//! - `transaction` for the driver half of the contract.
//! - `health` for the probe half of the contract.

mod error;
mod journal;
pub mod memory;
pub mod object_store;
pub mod schema;
pub mod sql;

pub use error::{StoreError, StoreResult, TRANSIENT_USER_MESSAGE};
pub use memory::{MemoryBackend, MemorySnapshot};
pub use object_store::{ObjectStoreBackend, ObjectStoreSchema};
pub use sql::SqlBackend;

use crate::db::maintenance::MaintenanceReport;
use crate::db::pool::PoolStatus;
use crate::health::HealthProbe;
use crate::model::{Query, Record, RecordId, Row};
use crate::transaction::TransactionDriver;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    EmbeddedSql,
    ObjectStore,
    Memory,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EmbeddedSql => "sqlite",
            Self::ObjectStore => "object_store",
            Self::Memory => "memory",
        }
    }
}

/// Contract shared by every storage engine.
///
/// Object safe; the rest of the crate holds backends as
/// `Arc<dyn StorageBackend>`.
pub trait StorageBackend: HealthProbe + TransactionDriver {
    fn kind(&self) -> BackendKind;

    /// Records matching `query`, ordered and paginated.
    fn find(&self, table: &str, query: &Query) -> StoreResult<Vec<Record>>;

    /// First match in query order; pagination in `query` is ignored.
    fn find_one(&self, table: &str, query: &Query) -> StoreResult<Option<Record>> {
        let single = query.clone().limit(1).offset(0);
        Ok(self.find(table, &single)?.into_iter().next())
    }

    /// Inserts `data` and returns the stored record with its new id.
    fn insert(&self, table: &str, data: &Row) -> StoreResult<Record>;

    /// Merges `data` into record `id`; `Ok(None)` when it does not exist.
    fn update(&self, table: &str, id: RecordId, data: &Row) -> StoreResult<Option<Record>>;

    /// Deletes record `id`; `Ok(false)` when it did not exist.
    fn delete(&self, table: &str, id: RecordId) -> StoreResult<bool>;

    /// Matching record count; limit and offset are ignored.
    fn count(&self, table: &str, query: &Query) -> StoreResult<usize>;

    fn bulk_insert(&self, table: &str, rows: &[Row]) -> StoreResult<Vec<Record>> {
        rows.iter().map(|row| self.insert(table, row)).collect()
    }

    /// Removes every record of `table`; ids are not reused afterwards.
    fn clear(&self, table: &str) -> StoreResult<usize>;

    /// Application tables, sorted by name.
    fn list_tables(&self) -> StoreResult<Vec<String>>;

    fn supports_raw_query(&self) -> bool {
        false
    }

    /// Runs native SQL; engines without SQL log a warning and return nothing.
    fn raw_query(&self, sql: &str, _params: &[Value]) -> StoreResult<Vec<Row>> {
        warn!(
            "event=raw_query module=store status=unsupported backend={} sql_len={}",
            self.kind().as_str(),
            sql.len()
        );
        Ok(Vec::new())
    }

    fn raw_query_one(&self, sql: &str, params: &[Value]) -> StoreResult<Option<Row>> {
        Ok(self.raw_query(sql, params)?.into_iter().next())
    }

    /// Pool counters for engines that pool connections.
    fn pool_status(&self) -> Option<PoolStatus> {
        None
    }

    /// Housekeeping; engines without it log a warning and return `None`.
    fn run_maintenance(&self, _now_ms: i64) -> StoreResult<Option<MaintenanceReport>> {
        warn!(
            "event=maintenance module=store status=unsupported backend={}",
            self.kind().as_str()
        );
        Ok(None)
    }

    /// Releases engine resources; later calls fail with `Closed`.
    fn close(&self) -> StoreResult<()>;
}
