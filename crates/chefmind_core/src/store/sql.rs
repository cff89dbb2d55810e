//! Embedded SQL backend on SQLite.
//!
//! # Responsibility
//! - Translate backend-neutral queries into parameterised SQL.
//! - Route work to the shared connection or, outside transactions, to the
//!   optional connection pool.
//!
//! # Invariants
//! - Identifiers are validated before being spliced into SQL; values are
//!   always bound as parameters.
//! - While a transaction is open every operation uses the shared
//!   connection, so it participates in that transaction.
//! - `NULL` columns are omitted from returned records.

use super::schema::{
    conform_payload, conform_query, table_schema_version, validate_table, HEALTH_CHECK_TABLE,
};
use super::{BackendKind, StorageBackend, StoreError, StoreResult};
use crate::config::{DatabaseLocation, SqliteSettings};
use crate::db::maintenance::{self, MaintenanceReport};
use crate::db::pool::{ConnectionPool, PoolStatus, SqlitePool};
use crate::db::{open_db, open_db_in_memory, DbError};
use crate::health::{HealthProbe, StorageFootprint};
use crate::model::clock::now_epoch_ms;
use crate::model::record::normalize_payload;
use crate::model::{Condition, Query, Record, RecordId, Row};
use crate::transaction::{TransactionDriver, TxStatement};
use log::{info, warn};
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode, OptionalExtension};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct SqlBackend {
    conn: Mutex<Option<Connection>>,
    pool: Option<Arc<dyn ConnectionPool>>,
    in_transaction: AtomicBool,
    closed: AtomicBool,
    location: String,
}

impl SqlBackend {
    /// Opens the configured database, applying migrations and pragmas.
    ///
    /// A pool is attached for file databases when `pool_size > 0`; a pool
    /// that cannot be opened is logged and skipped.
    pub fn open(settings: &SqliteSettings) -> StoreResult<Self> {
        match &settings.location {
            DatabaseLocation::Memory => Self::in_memory(),
            DatabaseLocation::File(path) => {
                let options = settings.pragma_options();
                let conn = open_db(path, &options)?;
                let backend = Self::from_connection(conn, path.display().to_string());
                if settings.pool_size == 0 {
                    return Ok(backend);
                }
                match SqlitePool::open(
                    path,
                    settings.pool_size,
                    options,
                    settings.pool_acquire_timeout,
                ) {
                    Ok(pool) => Ok(backend.with_pool(Arc::new(pool))),
                    Err(err) => {
                        warn!(
                            "event=pool_open module=store status=skipped backend=sqlite error={}",
                            err
                        );
                        Ok(backend)
                    }
                }
            }
        }
    }

    pub fn in_memory() -> StoreResult<Self> {
        Ok(Self::from_connection(open_db_in_memory()?, ":memory:"))
    }

    /// Wraps an already-migrated connection.
    pub fn from_connection(conn: Connection, location: impl Into<String>) -> Self {
        Self {
            conn: Mutex::new(Some(conn)),
            pool: None,
            in_transaction: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            location: location.into(),
        }
    }

    pub fn with_pool(mut self, pool: Arc<dyn ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::Acquire)
    }

    fn with_conn<T>(&self, op: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }

        if let Some(pool) = self.pool.as_ref().filter(|_| !self.in_transaction()) {
            let handle = pool.get_connection().map_err(|err| match err {
                DbError::PoolClosed => StoreError::Closed,
                other => other.into(),
            })?;
            let result = op(handle.connection());
            pool.release_connection(handle);
            return result.map_err(map_constraint);
        }

        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        op(conn).map_err(map_constraint)
    }
}

impl StorageBackend for SqlBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::EmbeddedSql
    }

    fn find(&self, table: &str, query: &Query) -> StoreResult<Vec<Record>> {
        validate_table(table)?;
        query.validate()?;
        let query = &conform_query(table, query);

        let mut params = Vec::new();
        let mut sql = format!("SELECT * FROM \"{table}\"{}", where_clause(query, &mut params));
        match &query.order_by {
            Some(order) => sql.push_str(&format!(
                " ORDER BY \"{}\" {}, id ASC",
                order.field,
                order.direction.as_sql()
            )),
            None => sql.push_str(" ORDER BY id ASC"),
        }
        sql.push_str(" LIMIT ? OFFSET ?");
        params.push(SqlValue::Integer(i64::from(query.effective_limit())));
        params.push(SqlValue::Integer(i64::from(query.offset)));

        let version = table_schema_version(table);
        self.with_conn(|conn| {
            let rows = select_rows(conn, &sql, &params, false)?;
            rows.into_iter()
                .map(|fields| Record::from_fields(table, version, fields))
                .collect()
        })
    }

    fn insert(&self, table: &str, data: &Row) -> StoreResult<Record> {
        validate_table(table)?;
        let normalized = conform_payload(table, normalize_payload(data)?);
        let now = now_epoch_ms();

        let mut columns = Vec::with_capacity(normalized.len() + 2);
        let mut values = Vec::with_capacity(normalized.len() + 2);
        for (field, value) in normalized.iter().filter(|(_, value)| !value.is_null()) {
            columns.push(format!("\"{field}\""));
            values.push(to_sql_value(value));
        }
        columns.push("created_at".to_string());
        columns.push("updated_at".to_string());
        values.push(SqlValue::Integer(now));
        values.push(SqlValue::Integer(now));

        let placeholders = (1..=values.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO \"{table}\" ({}) VALUES ({placeholders})",
            columns.join(", ")
        );

        self.with_conn(|conn| {
            conn.execute(&sql, params_from_iter(values.iter()))?;
            let id = conn.last_insert_rowid();
            select_by_id(conn, table, id)?.ok_or_else(|| {
                StoreError::InvalidData(format!("inserted row {id} in `{table}` vanished"))
            })
        })
    }

    fn update(&self, table: &str, id: RecordId, data: &Row) -> StoreResult<Option<Record>> {
        validate_table(table)?;
        let normalized = conform_payload(table, normalize_payload(data)?);

        let mut assignments = Vec::with_capacity(normalized.len() + 1);
        let mut values = Vec::with_capacity(normalized.len() + 2);
        for (field, value) in &normalized {
            assignments.push(format!("\"{field}\" = ?"));
            values.push(to_sql_value(value));
        }
        assignments.push("updated_at = ?".to_string());
        values.push(SqlValue::Integer(now_epoch_ms()));
        values.push(SqlValue::Integer(id));

        let sql = format!(
            "UPDATE \"{table}\" SET {} WHERE id = ?",
            assignments.join(", ")
        );
        self.with_conn(|conn| {
            let changed = conn.execute(&sql, params_from_iter(values.iter()))?;
            if changed == 0 {
                return Ok(None);
            }
            select_by_id(conn, table, id)
        })
    }

    fn delete(&self, table: &str, id: RecordId) -> StoreResult<bool> {
        validate_table(table)?;
        let sql = format!("DELETE FROM \"{table}\" WHERE id = ?1");
        self.with_conn(|conn| Ok(conn.execute(&sql, [id])? > 0))
    }

    fn count(&self, table: &str, query: &Query) -> StoreResult<usize> {
        validate_table(table)?;
        query.validate()?;
        let query = &conform_query(table, query);
        let mut params = Vec::new();
        let sql = format!(
            "SELECT COUNT(*) FROM \"{table}\"{}",
            where_clause(query, &mut params)
        );
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))?;
            Ok(usize::try_from(count).unwrap_or_default())
        })
    }

    fn clear(&self, table: &str) -> StoreResult<usize> {
        validate_table(table)?;
        let sql = format!("DELETE FROM \"{table}\"");
        self.with_conn(|conn| Ok(conn.execute(&sql, [])?))
    }

    fn list_tables(&self) -> StoreResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name != ?1
                 ORDER BY name",
            )?;
            let names = stmt
                .query_map([HEALTH_CHECK_TABLE], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        })
    }

    fn supports_raw_query(&self) -> bool {
        true
    }

    fn raw_query(&self, sql: &str, params: &[Value]) -> StoreResult<Vec<Row>> {
        let bound: Vec<SqlValue> = params.iter().map(to_sql_value).collect();
        self.with_conn(|conn| select_rows(conn, sql, &bound, true))
    }

    fn pool_status(&self) -> Option<PoolStatus> {
        self.pool.as_ref().map(|pool| pool.status())
    }

    fn run_maintenance(&self, now_ms: i64) -> StoreResult<Option<MaintenanceReport>> {
        self.with_conn(|conn| Ok(Some(maintenance::run_maintenance(conn, now_ms)?)))
    }

    fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(pool) = &self.pool {
            pool.close_all()?;
        }
        let conn = self.conn.lock().take();
        if let Some(conn) = conn {
            conn.close().map_err(|(_, err)| StoreError::from(err))?;
        }
        info!(
            "event=backend_close module=store status=ok backend=sqlite location={}",
            self.location
        );
        Ok(())
    }
}

impl TransactionDriver for SqlBackend {
    fn execute_statement(&self, statement: &TxStatement) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        let result = conn.execute_batch(&statement.to_sql());
        self.in_transaction
            .store(!conn.is_autocommit(), Ordering::Release);
        result.map_err(StoreError::from)
    }
}

impl HealthProbe for SqlBackend {
    fn probe_connectivity(&self) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
    }

    fn probe_read(&self) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' LIMIT 1",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
            Ok(())
        })
    }

    fn probe_write(&self) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS health_check (id INTEGER PRIMARY KEY, probed_at INTEGER);",
            )?;
            conn.execute(
                "INSERT OR REPLACE INTO health_check (id, probed_at) VALUES (1, ?1)",
                [now_epoch_ms()],
            )?;
            conn.execute("DELETE FROM health_check WHERE id = 1", [])?;
            Ok(())
        })
    }

    fn probe_storage(&self) -> StoreResult<StorageFootprint> {
        self.with_conn(|conn| {
            let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
            let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
            let page_count = u64::try_from(page_count).unwrap_or_default();
            let page_size = u64::try_from(page_size).unwrap_or_default();
            Ok(StorageFootprint {
                bytes: page_count.saturating_mul(page_size),
                page_count: Some(page_count),
            })
        })
    }

    fn probe_integrity(&self) -> StoreResult<String> {
        self.with_conn(|conn| {
            let verdict: String =
                conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
            Ok(verdict)
        })
    }
}

fn where_clause(query: &Query, params: &mut Vec<SqlValue>) -> String {
    if query.conditions.is_empty() {
        return String::new();
    }

    let mut predicates = Vec::with_capacity(query.conditions.len());
    for (field, condition) in &query.conditions {
        match condition {
            Condition::Eq(value) => {
                predicates.push(format!("\"{field}\" IS ?"));
                params.push(to_sql_value(value));
            }
            Condition::Prefix(prefix) => {
                predicates.push(format!("substr(\"{field}\", 1, ?) = ?"));
                params.push(SqlValue::Integer(
                    i64::try_from(prefix.chars().count()).unwrap_or(i64::MAX),
                ));
                params.push(SqlValue::Text(prefix.clone()));
            }
        }
    }
    format!(" WHERE {}", predicates.join(" AND "))
}

fn select_by_id(conn: &Connection, table: &str, id: RecordId) -> StoreResult<Option<Record>> {
    let sql = format!("SELECT * FROM \"{table}\" WHERE id = ?");
    let mut rows = select_rows(conn, &sql, &[SqlValue::Integer(id)], false)?;
    match rows.pop() {
        Some(fields) => Ok(Some(Record::from_fields(
            table,
            table_schema_version(table),
            fields,
        )?)),
        None => Ok(None),
    }
}

fn select_rows(
    conn: &Connection,
    sql: &str,
    params: &[SqlValue],
    keep_nulls: bool,
) -> StoreResult<Vec<Row>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(params_from_iter(params.iter()))?;

    let mut collected = Vec::new();
    while let Some(row) = rows.next()? {
        let mut fields = Row::new();
        for (index, name) in names.iter().enumerate() {
            let value = from_sql_value(row.get_ref(index)?);
            if keep_nulls || !value.is_null() {
                fields.insert(name.clone(), value);
            }
        }
        collected.push(fields);
    }
    Ok(collected)
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => SqlValue::Integer(integer),
            None => SqlValue::Real(number.as_f64().unwrap_or_default()),
        },
        Value::String(text) => SqlValue::Text(text.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

fn from_sql_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(integer) => Value::from(integer),
        ValueRef::Real(real) => serde_json::Number::from_f64(real)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Array(bytes.iter().map(|byte| Value::from(*byte)).collect()),
    }
}

fn map_constraint(err: StoreError) -> StoreError {
    match err {
        StoreError::Db(crate::db::DbError::Sqlite(sqlite))
            if sqlite.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) =>
        {
            StoreError::Constraint(sqlite.to_string())
        }
        other => other,
    }
}
