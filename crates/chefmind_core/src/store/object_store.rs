//! Structured object-store backend for browser-class hosts.
//!
//! # Responsibility
//! - Model a versioned database of named object stores with
//!   auto-increment keys and secondary indexes.
//! - Optionally persist each store as a JSON document under a directory.
//!
//! # Invariants
//! - Only stores declared in the schema exist; writes to other names fail.
//! - Unique indexes never map one key to two records.
//! - Records whose indexed field is absent are left out of that index.
//! - A persisted database newer than the requested schema version is
//!   refused.
//! - While a transaction is open nothing is written to disk; the final
//!   state is persisted on commit or rollback.
//! - Outside a transaction a change becomes visible only after its store
//!   was written to disk.

use super::journal::SnapshotJournal;
use super::schema::{
    conform_payload, conform_query, table_schema_version, validate_table, HEALTH_CHECK_TABLE,
    KNOWN_TABLES, LOOKUP_COLUMNS,
};
use super::{BackendKind, StorageBackend, StoreError, StoreResult};
use crate::db::migrations::latest_version;
use crate::health::{HealthProbe, StorageFootprint, INTEGRITY_OK};
use crate::model::clock::now_epoch_ms;
use crate::model::query::compare_values;
use crate::model::record::{
    apply_changes, normalize_payload, CREATED_AT_FIELD, ID_FIELD, UPDATED_AT_FIELD,
};
use crate::model::{Query, Record, RecordId, Row};
use crate::transaction::{TransactionDriver, TxStatement};
use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

const BACKEND: &str = "object_store";
const META_FILE: &str = "meta.json";
const LOCK_PROBE_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_DATABASE_NAME: &str = "ChefMindDB";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub key_path: String,
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDef {
    pub name: String,
    pub indexes: Vec<IndexDef>,
}

impl StoreDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indexes: Vec::new(),
        }
    }

    pub fn with_index(mut self, key_path: impl Into<String>, unique: bool) -> Self {
        let key_path = key_path.into();
        self.indexes.push(IndexDef {
            name: format!("by_{key_path}"),
            key_path,
            unique,
        });
        self
    }
}

/// Versioned layout of an object-store database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStoreSchema {
    pub database: String,
    pub version: u32,
    pub stores: Vec<StoreDef>,
}

impl ObjectStoreSchema {
    /// Application stores plus the health probe store.
    pub fn chefmind() -> Self {
        let stores = KNOWN_TABLES
            .iter()
            .chain(std::iter::once(&HEALTH_CHECK_TABLE))
            .map(|table| {
                LOOKUP_COLUMNS
                    .iter()
                    .filter(|(owner, _, _)| owner == table)
                    .fold(StoreDef::new(*table), |store, (_, column, unique)| {
                        store.with_index(*column, *unique)
                    })
            })
            .collect();
        Self {
            database: DEFAULT_DATABASE_NAME.to_string(),
            version: latest_version(),
            stores,
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_store(mut self, store: StoreDef) -> Self {
        self.stores.retain(|existing| existing.name != store.name);
        self.stores.push(store);
        self
    }

    pub fn store(&self, name: &str) -> Option<&StoreDef> {
        self.stores.iter().find(|store| store.name == name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedStore {
    key_generator: RecordId,
    records: Vec<Row>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedMeta {
    database: String,
    version: u32,
}

/// Index key ordered like stored values compare.
#[derive(Debug, Clone)]
struct IndexKey(Value);

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_values(&self.0, &other.0)
    }
}

#[derive(Debug, Clone)]
struct ObjectStore {
    def: StoreDef,
    key_generator: RecordId,
    records: BTreeMap<RecordId, Row>,
    indexes: BTreeMap<String, BTreeMap<IndexKey, BTreeSet<RecordId>>>,
}

impl ObjectStore {
    fn new(def: StoreDef) -> Self {
        let indexes = def
            .indexes
            .iter()
            .map(|index| (index.name.clone(), BTreeMap::new()))
            .collect();
        Self {
            def,
            key_generator: 0,
            records: BTreeMap::new(),
            indexes,
        }
    }

    fn from_persisted(def: StoreDef, persisted: PersistedStore) -> StoreResult<Self> {
        let mut store = Self::new(def);
        store.key_generator = persisted.key_generator;
        for fields in persisted.records {
            let record = Record::from_fields(store.def.name.as_str(), 0, fields)?;
            let id = record.id();
            let fields = record.into_fields();
            store.check_unique(&fields, None)?;
            store.index_record(id, &fields);
            store.key_generator = store.key_generator.max(id);
            store.records.insert(id, fields);
        }
        Ok(store)
    }

    fn to_persisted(&self) -> PersistedStore {
        PersistedStore {
            key_generator: self.key_generator,
            records: self.records.values().cloned().collect(),
        }
    }

    fn check_unique(&self, fields: &Row, exclude: Option<RecordId>) -> StoreResult<()> {
        for index in self.def.indexes.iter().filter(|index| index.unique) {
            let Some(value) = fields.get(&index.key_path).filter(|value| !value.is_null()) else {
                continue;
            };
            let clash = self
                .indexes
                .get(&index.name)
                .and_then(|entries| entries.get(&IndexKey(value.clone())))
                .map(|ids| ids.iter().any(|id| Some(*id) != exclude))
                .unwrap_or(false);
            if clash {
                return Err(StoreError::Constraint(format!(
                    "unique index `{}.{}` already contains {value}",
                    self.def.name, index.key_path
                )));
            }
        }
        Ok(())
    }

    fn index_record(&mut self, id: RecordId, fields: &Row) {
        for index in &self.def.indexes {
            if let Some(value) = fields.get(&index.key_path).filter(|value| !value.is_null()) {
                self.indexes
                    .entry(index.name.clone())
                    .or_default()
                    .entry(IndexKey(value.clone()))
                    .or_default()
                    .insert(id);
            }
        }
    }

    fn unindex_record(&mut self, id: RecordId, fields: &Row) {
        for index in &self.def.indexes {
            let Some(value) = fields.get(&index.key_path) else {
                continue;
            };
            if let Some(entries) = self.indexes.get_mut(&index.name) {
                let key = IndexKey(value.clone());
                if let Some(ids) = entries.get_mut(&key) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        entries.remove(&key);
                    }
                }
            }
        }
    }

    /// Ids worth scanning for `query`, narrowed through an index when the
    /// first equality condition has one.
    fn candidates(&self, query: &Query) -> Vec<RecordId> {
        let narrowed = query.first_equality().and_then(|(field, value)| {
            if value.is_null() {
                return None;
            }
            let index = self.def.indexes.iter().find(|index| index.key_path == field)?;
            let ids = self
                .indexes
                .get(&index.name)
                .and_then(|entries| entries.get(&IndexKey(value.clone())))
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default();
            Some(ids)
        });
        narrowed.unwrap_or_else(|| self.records.keys().copied().collect())
    }

    fn records_for(&self, query: &Query) -> StoreResult<Vec<Record>> {
        let version = table_schema_version(&self.def.name);
        self.candidates(query)
            .into_iter()
            .filter_map(|id| self.records.get(&id))
            .map(|fields| Record::from_fields(self.def.name.as_str(), version, fields.clone()))
            .collect()
    }

    fn verify(&self, problems: &mut Vec<String>) {
        let name = &self.def.name;
        for (key, fields) in &self.records {
            match fields.get(ID_FIELD).and_then(Value::as_i64) {
                Some(id) if id == *key && id <= self.key_generator => {}
                _ => problems.push(format!("{name}: record {key} has an inconsistent key")),
            }
        }

        for index in &self.def.indexes {
            let entries = self.indexes.get(&index.name);
            for (id, fields) in &self.records {
                let Some(value) = fields.get(&index.key_path).filter(|value| !value.is_null())
                else {
                    continue;
                };
                let indexed = entries
                    .and_then(|entries| entries.get(&IndexKey(value.clone())))
                    .map(|ids| ids.contains(id))
                    .unwrap_or(false);
                if !indexed {
                    problems.push(format!("{name}.{}: record {id} missing", index.name));
                }
            }
            for (key, ids) in entries.into_iter().flatten() {
                if index.unique && ids.len() > 1 {
                    problems.push(format!("{name}.{}: duplicate key {}", index.name, key.0));
                }
                for id in ids {
                    let matches = self
                        .records
                        .get(id)
                        .and_then(|fields| fields.get(&index.key_path))
                        .map(|value| compare_values(value, &key.0) == Ordering::Equal)
                        .unwrap_or(false);
                    if !matches {
                        problems.push(format!("{name}.{}: stale entry for {id}", index.name));
                    }
                }
            }
        }
    }
}

type StoreImage = BTreeMap<String, ObjectStore>;

pub struct ObjectStoreBackend {
    schema: ObjectStoreSchema,
    stores: RwLock<BTreeMap<String, Arc<Mutex<ObjectStore>>>>,
    journal: SnapshotJournal<StoreImage>,
    persist_dir: Option<PathBuf>,
    closed: AtomicBool,
}

impl ObjectStoreBackend {
    /// Opens the database described by `schema`.
    ///
    /// With `persist_dir`, existing store documents are loaded and the
    /// database is upgraded to `schema.version`.
    ///
    /// # Errors
    /// - [`StoreError::Unavailable`] when the persisted version is newer.
    /// - [`StoreError::Io`]/[`StoreError::Serialization`] for unreadable files.
    pub fn open(schema: ObjectStoreSchema, persist_dir: Option<PathBuf>) -> StoreResult<Self> {
        for store in &schema.stores {
            validate_table(&store.name)?;
        }
        let database_dir = persist_dir.map(|dir| dir.join(&schema.database));

        let mut stores = BTreeMap::new();
        match &database_dir {
            None => {
                for def in &schema.stores {
                    stores.insert(def.name.clone(), ObjectStore::new(def.clone()));
                }
            }
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let stored_version = read_meta(dir)?.map(|meta| meta.version).unwrap_or(0);
                if stored_version > schema.version {
                    return Err(StoreError::Unavailable(format!(
                        "database `{}` is at version {stored_version}, newer than requested {}",
                        schema.database, schema.version
                    )));
                }
                for def in &schema.stores {
                    let store = match read_store(dir, &def.name)? {
                        Some(persisted) => ObjectStore::from_persisted(def.clone(), persisted)?,
                        None => ObjectStore::new(def.clone()),
                    };
                    stores.insert(def.name.clone(), store);
                }
                if stored_version < schema.version {
                    info!(
                        "event=object_store_upgrade module=store status=ok database={} from_version={} to_version={}",
                        schema.database, stored_version, schema.version
                    );
                }
            }
        }

        let backend = Self {
            stores: RwLock::new(
                stores
                    .into_iter()
                    .map(|(name, store)| (name, Arc::new(Mutex::new(store))))
                    .collect(),
            ),
            journal: SnapshotJournal::new(BACKEND),
            persist_dir: database_dir,
            closed: AtomicBool::new(false),
            schema,
        };
        backend.persist_all()?;
        info!(
            "event=object_store_open module=store status=ok database={} version={} persistent={}",
            backend.schema.database,
            backend.schema.version,
            backend.persist_dir.is_some()
        );
        Ok(backend)
    }

    /// Opens a non-persistent database with the application schema.
    pub fn in_memory() -> StoreResult<Self> {
        Self::open(ObjectStoreSchema::chefmind(), None)
    }

    pub fn schema(&self) -> &ObjectStoreSchema {
        &self.schema
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(AtomicOrdering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn store(&self, name: &str) -> StoreResult<Arc<Mutex<ObjectStore>>> {
        self.ensure_open()?;
        validate_table(name)?;
        self.stores
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::backend(BACKEND, format!("object store `{name}` not found")))
    }

    fn persist(&self, store: &ObjectStore) -> StoreResult<()> {
        let Some(dir) = &self.persist_dir else {
            return Ok(());
        };
        if self.journal.is_open() {
            return Ok(());
        }
        write_json(&dir.join(format!("{}.json", store.def.name)), &store.to_persisted())
    }

    /// Applies `change` to `store`, writing the changed store to disk first
    /// when it is persisted outside a transaction. A failed write leaves
    /// `store` untouched.
    fn write_through(
        &self,
        store: &mut ObjectStore,
        change: impl FnOnce(&mut ObjectStore),
    ) -> StoreResult<()> {
        if self.persist_dir.is_none() || self.journal.is_open() {
            change(store);
            return Ok(());
        }
        let mut staged = store.clone();
        change(&mut staged);
        self.persist(&staged)?;
        *store = staged;
        Ok(())
    }

    fn persist_all(&self) -> StoreResult<()> {
        let Some(dir) = &self.persist_dir else {
            return Ok(());
        };
        for store in self.stores.read().values() {
            self.persist(&store.lock())?;
        }
        write_json(
            &dir.join(META_FILE),
            &PersistedMeta {
                database: self.schema.database.clone(),
                version: self.schema.version,
            },
        )
    }

    fn capture(&self) -> StoreImage {
        self.stores
            .read()
            .iter()
            .map(|(name, store)| (name.clone(), store.lock().clone()))
            .collect()
    }

    fn reinstate(&self, mut image: StoreImage) {
        let stores = self.stores.read();
        for (name, handle) in stores.iter() {
            if let Some(content) = image.remove(name) {
                *handle.lock() = content;
            }
        }
    }
}

impl StorageBackend for ObjectStoreBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ObjectStore
    }

    fn find(&self, table: &str, query: &Query) -> StoreResult<Vec<Record>> {
        query.validate()?;
        let query = &conform_query(table, query);
        let handle = self.store(table)?;
        let records = handle.lock().records_for(query)?;
        Ok(query.apply(records))
    }

    fn insert(&self, table: &str, data: &Row) -> StoreResult<Record> {
        let changes = conform_payload(table, normalize_payload(data)?);
        let handle = self.store(table)?;
        let mut store = handle.lock();

        let id = store.key_generator + 1;
        let now = now_epoch_ms();
        let mut fields = Row::new();
        apply_changes(&mut fields, &changes);
        fields.insert(ID_FIELD.to_string(), Value::from(id));
        fields.insert(CREATED_AT_FIELD.to_string(), Value::from(now));
        fields.insert(UPDATED_AT_FIELD.to_string(), Value::from(now));

        store.check_unique(&fields, None)?;
        let record = Record::from_fields(table, table_schema_version(table), fields.clone())?;
        self.write_through(&mut store, |store| {
            store.key_generator = id;
            store.index_record(id, &fields);
            store.records.insert(id, fields);
        })?;
        Ok(record)
    }

    fn update(&self, table: &str, id: RecordId, data: &Row) -> StoreResult<Option<Record>> {
        let changes = conform_payload(table, normalize_payload(data)?);
        let handle = self.store(table)?;
        let mut store = handle.lock();

        let Some(previous) = store.records.get(&id).cloned() else {
            return Ok(None);
        };
        let mut fields = previous.clone();
        apply_changes(&mut fields, &changes);
        fields.insert(UPDATED_AT_FIELD.to_string(), Value::from(now_epoch_ms()));

        store.check_unique(&fields, Some(id))?;
        let record = Record::from_fields(table, table_schema_version(table), fields.clone())?;
        self.write_through(&mut store, |store| {
            store.unindex_record(id, &previous);
            store.index_record(id, &fields);
            store.records.insert(id, fields);
        })?;
        Ok(Some(record))
    }

    fn delete(&self, table: &str, id: RecordId) -> StoreResult<bool> {
        let handle = self.store(table)?;
        let mut store = handle.lock();
        if !store.records.contains_key(&id) {
            return Ok(false);
        }
        self.write_through(&mut store, |store| {
            if let Some(previous) = store.records.remove(&id) {
                store.unindex_record(id, &previous);
            }
        })?;
        Ok(true)
    }

    fn count(&self, table: &str, query: &Query) -> StoreResult<usize> {
        query.validate()?;
        let query = &conform_query(table, query);
        let handle = self.store(table)?;
        let records = handle.lock().records_for(query)?;
        Ok(query.count(records.iter()))
    }

    fn clear(&self, table: &str) -> StoreResult<usize> {
        let handle = self.store(table)?;
        let mut store = handle.lock();
        let removed = store.records.len();
        self.write_through(&mut store, |store| {
            store.records.clear();
            for entries in store.indexes.values_mut() {
                entries.clear();
            }
        })?;
        Ok(removed)
    }

    fn list_tables(&self) -> StoreResult<Vec<String>> {
        self.ensure_open()?;
        Ok(self
            .stores
            .read()
            .keys()
            .filter(|name| name.as_str() != HEALTH_CHECK_TABLE)
            .cloned()
            .collect())
    }

    fn close(&self) -> StoreResult<()> {
        if self.closed.load(AtomicOrdering::Acquire) {
            return Ok(());
        }
        if self.journal.is_open() {
            warn!("event=backend_close module=store status=rollback backend=object_store");
            self.execute_statement(&TxStatement::Rollback)?;
        }
        self.persist_all()?;
        self.closed.store(true, AtomicOrdering::Release);
        info!("event=backend_close module=store status=ok backend=object_store");
        Ok(())
    }
}

impl TransactionDriver for ObjectStoreBackend {
    fn execute_statement(&self, statement: &TxStatement) -> StoreResult<()> {
        self.ensure_open()?;
        self.journal.apply(
            statement,
            || Ok(self.capture()),
            |image| {
                self.reinstate(image);
                Ok(())
            },
        )?;
        if matches!(statement, TxStatement::Commit | TxStatement::Rollback) {
            self.persist_all()?;
        }
        Ok(())
    }
}

impl HealthProbe for ObjectStoreBackend {
    fn probe_connectivity(&self) -> StoreResult<()> {
        self.ensure_open()?;
        match self.stores.try_read_for(LOCK_PROBE_TIMEOUT) {
            Some(_) => Ok(()),
            None => Err(StoreError::backend(BACKEND, "store map lock is unavailable")),
        }
    }

    fn probe_read(&self) -> StoreResult<()> {
        self.list_tables().map(|_| ())
    }

    fn probe_write(&self) -> StoreResult<()> {
        let mut probe = Row::new();
        probe.insert("probed_at".to_string(), Value::from(now_epoch_ms()));
        let record = self.insert(HEALTH_CHECK_TABLE, &probe)?;
        if self.delete(HEALTH_CHECK_TABLE, record.id())? {
            Ok(())
        } else {
            Err(StoreError::backend(BACKEND, "probe record was not removed"))
        }
    }

    fn probe_storage(&self) -> StoreResult<StorageFootprint> {
        self.ensure_open()?;
        let mut bytes = 0u64;
        for store in self.stores.read().values() {
            let encoded = serde_json::to_vec(&store.lock().to_persisted())?;
            bytes = bytes.saturating_add(u64::try_from(encoded.len()).unwrap_or(u64::MAX));
        }
        Ok(StorageFootprint {
            bytes,
            page_count: None,
        })
    }

    fn probe_integrity(&self) -> StoreResult<String> {
        self.ensure_open()?;
        let mut problems = Vec::new();
        for store in self.stores.read().values() {
            store.lock().verify(&mut problems);
        }
        if problems.is_empty() {
            Ok(INTEGRITY_OK.to_string())
        } else {
            Ok(problems.join("; "))
        }
    }
}

fn read_meta(dir: &Path) -> StoreResult<Option<PersistedMeta>> {
    read_json(&dir.join(META_FILE))
}

fn read_store(dir: &Path, name: &str) -> StoreResult<Option<PersistedStore>> {
    read_json(&dir.join(format!("{name}.json")))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let staging = path.with_extension("json.tmp");
    std::fs::write(&staging, serde_json::to_vec(value)?)?;
    std::fs::rename(&staging, path)?;
    Ok(())
}
