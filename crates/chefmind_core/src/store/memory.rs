//! In-process fallback backend.
//!
//! # Responsibility
//! - Keep every table in memory with the same id and timestamp rules as
//!   the persistent engines.
//! - Export and import the full store as a serialisable snapshot.
//!
//! # Invariants
//! - Ids are `last_id + 1` per table and are never reused, even after
//!   `clear`.
//! - Known application tables always exist; other tables appear on first
//!   insert.

use super::journal::SnapshotJournal;
use super::schema::{
    conform_payload, conform_query, table_schema_version, validate_table, HEALTH_CHECK_TABLE,
    KNOWN_TABLES,
};
use super::{BackendKind, StorageBackend, StoreError, StoreResult};
use crate::health::{HealthProbe, StorageFootprint, INTEGRITY_OK};
use crate::model::clock::now_epoch_ms;
use crate::model::record::{
    apply_changes, normalize_payload, CREATED_AT_FIELD, ID_FIELD, UPDATED_AT_FIELD,
};
use crate::model::{Query, Record, RecordId, Row};
use crate::transaction::{TransactionDriver, TxStatement};
use log::info;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const LOCK_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Serialisable image of one table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub last_id: RecordId,
    pub records: Vec<Row>,
}

/// Serialisable image of the whole store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub tables: BTreeMap<String, TableSnapshot>,
}

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    last_id: RecordId,
    rows: BTreeMap<RecordId, Row>,
}

type TableMap = BTreeMap<String, MemoryTable>;

pub struct MemoryBackend {
    tables: RwLock<BTreeMap<String, Arc<Mutex<MemoryTable>>>>,
    journal: SnapshotJournal<TableMap>,
    closed: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let tables = KNOWN_TABLES
            .iter()
            .map(|table| (table.to_string(), Arc::new(Mutex::new(MemoryTable::default()))))
            .collect();
        Self {
            tables: RwLock::new(tables),
            journal: SnapshotJournal::new("memory"),
            closed: AtomicBool::new(false),
        }
    }

    /// Copies the full store.
    pub fn snapshot(&self) -> StoreResult<MemorySnapshot> {
        self.ensure_open()?;
        let tables = self
            .capture()
            .into_iter()
            .map(|(name, table)| {
                let snapshot = TableSnapshot {
                    last_id: table.last_id,
                    records: table.rows.into_values().collect(),
                };
                (name, snapshot)
            })
            .collect();
        Ok(MemorySnapshot { tables })
    }

    /// Replaces the full store with `snapshot`.
    ///
    /// # Errors
    /// - [`StoreError::InvalidIdentifier`] for an unsafe table name.
    /// - [`StoreError::InvalidData`] for records without integer reserved
    ///   fields, duplicate ids, or ids above `last_id`.
    pub fn restore(&self, snapshot: &MemorySnapshot) -> StoreResult<()> {
        self.ensure_open()?;
        let mut image = TableMap::new();
        for (name, table) in &snapshot.tables {
            validate_table(name)?;
            let mut rows = BTreeMap::new();
            for fields in &table.records {
                let record = Record::from_fields(name.as_str(), 0, fields.clone())?;
                if record.id() > table.last_id {
                    return Err(StoreError::InvalidData(format!(
                        "record {} in `{name}` is above last id {}",
                        record.id(),
                        table.last_id
                    )));
                }
                if rows.insert(record.id(), record.into_fields()).is_some() {
                    return Err(StoreError::InvalidData(format!(
                        "duplicate id in `{name}` snapshot"
                    )));
                }
            }
            image.insert(
                name.clone(),
                MemoryTable {
                    last_id: table.last_id,
                    rows,
                },
            );
        }
        for table in KNOWN_TABLES {
            image.entry(table.to_string()).or_default();
        }

        self.reinstate(image);
        info!(
            "event=memory_restore module=store status=ok tables={}",
            snapshot.tables.len()
        );
        Ok(())
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn table(&self, name: &str) -> Option<Arc<Mutex<MemoryTable>>> {
        self.tables.read().get(name).cloned()
    }

    fn table_or_create(&self, name: &str) -> Arc<Mutex<MemoryTable>> {
        if let Some(table) = self.table(name) {
            return table;
        }
        Arc::clone(self.tables.write().entry(name.to_string()).or_default())
    }

    fn capture(&self) -> TableMap {
        self.tables
            .read()
            .iter()
            .map(|(name, table)| (name.clone(), table.lock().clone()))
            .collect()
    }

    fn reinstate(&self, mut image: TableMap) {
        let mut tables = self.tables.write();
        tables.retain(|name, _| image.contains_key(name));
        for (name, handle) in tables.iter() {
            if let Some(content) = image.remove(name) {
                *handle.lock() = content;
            }
        }
        for (name, content) in image {
            tables.insert(name, Arc::new(Mutex::new(content)));
        }
    }

    fn to_record(table: &str, fields: &Row) -> StoreResult<Record> {
        Record::from_fields(table, table_schema_version(table), fields.clone())
    }
}

impl StorageBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn find(&self, table: &str, query: &Query) -> StoreResult<Vec<Record>> {
        self.ensure_open()?;
        validate_table(table)?;
        query.validate()?;
        let query = &conform_query(table, query);
        let Some(handle) = self.table(table) else {
            return Ok(Vec::new());
        };
        let records = {
            let guard = handle.lock();
            guard
                .rows
                .values()
                .map(|fields| Self::to_record(table, fields))
                .collect::<StoreResult<Vec<_>>>()?
        };
        Ok(query.apply(records))
    }

    fn insert(&self, table: &str, data: &Row) -> StoreResult<Record> {
        self.ensure_open()?;
        validate_table(table)?;
        let changes = conform_payload(table, normalize_payload(data)?);
        let now = now_epoch_ms();

        let handle = self.table_or_create(table);
        let mut guard = handle.lock();
        let id = guard.last_id + 1;
        let mut fields = Row::new();
        apply_changes(&mut fields, &changes);
        fields.insert(ID_FIELD.to_string(), Value::from(id));
        fields.insert(CREATED_AT_FIELD.to_string(), Value::from(now));
        fields.insert(UPDATED_AT_FIELD.to_string(), Value::from(now));

        let record = Self::to_record(table, &fields)?;
        guard.last_id = id;
        guard.rows.insert(id, fields);
        Ok(record)
    }

    fn update(&self, table: &str, id: RecordId, data: &Row) -> StoreResult<Option<Record>> {
        self.ensure_open()?;
        validate_table(table)?;
        let changes = conform_payload(table, normalize_payload(data)?);
        let Some(handle) = self.table(table) else {
            return Ok(None);
        };

        let mut guard = handle.lock();
        let Some(stored) = guard.rows.get_mut(&id) else {
            return Ok(None);
        };
        apply_changes(stored, &changes);
        stored.insert(UPDATED_AT_FIELD.to_string(), Value::from(now_epoch_ms()));
        Self::to_record(table, stored).map(Some)
    }

    fn delete(&self, table: &str, id: RecordId) -> StoreResult<bool> {
        self.ensure_open()?;
        validate_table(table)?;
        Ok(self
            .table(table)
            .map(|handle| handle.lock().rows.remove(&id).is_some())
            .unwrap_or(false))
    }

    fn count(&self, table: &str, query: &Query) -> StoreResult<usize> {
        self.ensure_open()?;
        validate_table(table)?;
        query.validate()?;
        let query = &conform_query(table, query);
        let Some(handle) = self.table(table) else {
            return Ok(0);
        };
        let guard = handle.lock();
        let records = guard
            .rows
            .values()
            .map(|fields| Self::to_record(table, fields))
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(query.count(records.iter()))
    }

    fn clear(&self, table: &str) -> StoreResult<usize> {
        self.ensure_open()?;
        validate_table(table)?;
        Ok(self
            .table(table)
            .map(|handle| {
                let mut guard = handle.lock();
                let removed = guard.rows.len();
                guard.rows.clear();
                removed
            })
            .unwrap_or(0))
    }

    fn list_tables(&self) -> StoreResult<Vec<String>> {
        self.ensure_open()?;
        Ok(self
            .tables
            .read()
            .keys()
            .filter(|name| name.as_str() != HEALTH_CHECK_TABLE)
            .cloned()
            .collect())
    }

    fn close(&self) -> StoreResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.tables.write().clear();
            info!("event=backend_close module=store status=ok backend=memory");
        }
        Ok(())
    }
}

impl TransactionDriver for MemoryBackend {
    fn execute_statement(&self, statement: &TxStatement) -> StoreResult<()> {
        self.ensure_open()?;
        self.journal.apply(
            statement,
            || Ok(self.capture()),
            |image| {
                self.reinstate(image);
                Ok(())
            },
        )
    }
}

impl HealthProbe for MemoryBackend {
    fn probe_connectivity(&self) -> StoreResult<()> {
        self.ensure_open()?;
        match self.tables.try_read_for(LOCK_PROBE_TIMEOUT) {
            Some(_) => Ok(()),
            None => Err(StoreError::backend("memory", "table map lock is unavailable")),
        }
    }

    fn probe_read(&self) -> StoreResult<()> {
        self.list_tables().map(|_| ())
    }

    fn probe_write(&self) -> StoreResult<()> {
        let mut probe = Row::new();
        probe.insert("probed_at".to_string(), Value::from(now_epoch_ms()));
        let record = self.insert(HEALTH_CHECK_TABLE, &probe)?;
        let removed = self.delete(HEALTH_CHECK_TABLE, record.id())?;
        self.tables.write().remove(HEALTH_CHECK_TABLE);
        if removed {
            Ok(())
        } else {
            Err(StoreError::backend("memory", "probe record was not removed"))
        }
    }

    fn probe_storage(&self) -> StoreResult<StorageFootprint> {
        let encoded = serde_json::to_vec(&self.snapshot()?)?;
        Ok(StorageFootprint {
            bytes: u64::try_from(encoded.len()).unwrap_or(u64::MAX),
            page_count: None,
        })
    }

    fn probe_integrity(&self) -> StoreResult<String> {
        self.ensure_open()?;
        let mut problems = Vec::new();
        for (name, table) in self.capture() {
            for (key, fields) in &table.rows {
                let id = fields.get(ID_FIELD).and_then(Value::as_i64);
                let created = fields.get(CREATED_AT_FIELD).and_then(Value::as_i64);
                let updated = fields.get(UPDATED_AT_FIELD).and_then(Value::as_i64);
                match (id, created, updated) {
                    (Some(id), Some(created), Some(updated)) => {
                        if id != *key {
                            problems.push(format!("{name}: row {key} carries id {id}"));
                        }
                        if id > table.last_id {
                            problems.push(format!("{name}: id {id} above last id"));
                        }
                        if created > updated {
                            problems.push(format!("{name}: row {key} updated before created"));
                        }
                    }
                    _ => problems.push(format!("{name}: row {key} lacks reserved fields")),
                }
            }
        }

        if problems.is_empty() {
            Ok(INTEGRITY_OK.to_string())
        } else {
            Ok(problems.join("; "))
        }
    }
}
