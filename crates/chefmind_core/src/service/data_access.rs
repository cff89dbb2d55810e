//! Data-access facade.
//!
//! # Responsibility
//! - Route every backend call through the retry policy.
//! - Run atomic units of work through the transaction manager.
//! - Expose health, readiness, pool and selection diagnostics.
//!
//! # Invariants
//! - One facade owns one backend for its whole lifetime.
//! - Work inside a transaction is not retried per statement; the unit is
//!   retried as a whole.
//! - After `shutdown` the backend rejects further work.

use crate::bootstrap::{select_backend, BackendSelection, HostEnvironment, SelectedBackend};
use crate::config::StorageConfig;
use crate::db::maintenance::MaintenanceReport;
use crate::db::pool::PoolStatus;
use crate::health::{HealthChecker, HealthReport};
use crate::model::clock::now_epoch_ms;
use crate::model::{Query, Record, RecordId, Row};
use crate::retry::RetryPolicy;
use crate::store::{BackendKind, StorageBackend, StoreResult};
use crate::transaction::{TransactionManager, TransactionOptions, DEFAULT_TRANSACTION_TIMEOUT};
use log::info;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct DataAccess {
    backend: Arc<dyn StorageBackend>,
    selection: BackendSelection,
    retry: RetryPolicy,
    health: HealthChecker,
    transaction_timeout: Duration,
    shut_down: AtomicBool,
}

impl DataAccess {
    /// Selects a backend for `config` and starts periodic health checks.
    pub fn bootstrap(config: &StorageConfig) -> StoreResult<Self> {
        let started_at = Instant::now();
        let SelectedBackend { backend, selection } = select_backend(config)?;
        let access = Self::from_parts(
            backend,
            selection,
            config.retry.clone(),
            config.transaction_timeout,
        );
        if !config.health_check_interval.is_zero() {
            access
                .health
                .start_periodic_check(config.health_check_interval);
        }
        info!(
            "event=data_access_init module=service status=ok backend={} fallback_steps={} duration_ms={}",
            access.selection.active.as_str(),
            access.selection.fallback_chain.len(),
            started_at.elapsed().as_millis()
        );
        Ok(access)
    }

    /// Wraps an already-open backend with default policies.
    pub fn with_backend(backend: Arc<dyn StorageBackend>) -> Self {
        let selection = BackendSelection {
            active: backend.kind(),
            host: HostEnvironment::detect(),
            fallback_chain: Vec::new(),
            seeded_records: 0,
        };
        Self::from_parts(
            backend,
            selection,
            RetryPolicy::default(),
            DEFAULT_TRANSACTION_TIMEOUT,
        )
    }

    pub fn from_parts(
        backend: Arc<dyn StorageBackend>,
        selection: BackendSelection,
        retry: RetryPolicy,
        transaction_timeout: Duration,
    ) -> Self {
        Self {
            health: HealthChecker::new(Arc::clone(&backend)),
            backend,
            selection,
            retry,
            transaction_timeout,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Replaces the health checker, e.g. to shorten the readiness poll.
    pub fn with_health_checker(
        mut self,
        configure: impl FnOnce(HealthChecker) -> HealthChecker,
    ) -> Self {
        self.health = configure(HealthChecker::new(Arc::clone(&self.backend)));
        self
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.selection.active
    }

    pub fn selection(&self) -> &BackendSelection {
        &self.selection
    }

    pub fn find(&self, table: &str, query: &Query) -> StoreResult<Vec<Record>> {
        self.retry.execute(|| self.backend.find(table, query))
    }

    pub fn find_one(&self, table: &str, query: &Query) -> StoreResult<Option<Record>> {
        self.retry.execute(|| self.backend.find_one(table, query))
    }

    pub fn insert(&self, table: &str, data: &Row) -> StoreResult<Record> {
        self.retry.execute(|| self.backend.insert(table, data))
    }

    pub fn update(&self, table: &str, id: RecordId, data: &Row) -> StoreResult<Option<Record>> {
        self.retry.execute(|| self.backend.update(table, id, data))
    }

    pub fn delete(&self, table: &str, id: RecordId) -> StoreResult<bool> {
        self.retry.execute(|| self.backend.delete(table, id))
    }

    pub fn count(&self, table: &str, query: &Query) -> StoreResult<usize> {
        self.retry.execute(|| self.backend.count(table, query))
    }

    /// Inserts all rows atomically.
    pub fn bulk_insert(&self, table: &str, rows: &[Row]) -> StoreResult<Vec<Record>> {
        self.transaction(&self.transaction_options(), |backend| {
            backend.bulk_insert(table, rows)
        })
    }

    pub fn clear(&self, table: &str) -> StoreResult<usize> {
        self.retry.execute(|| self.backend.clear(table))
    }

    pub fn raw_query(&self, sql: &str, params: &[Value]) -> StoreResult<Vec<Row>> {
        self.retry.execute(|| self.backend.raw_query(sql, params))
    }

    pub fn raw_query_one(&self, sql: &str, params: &[Value]) -> StoreResult<Option<Row>> {
        self.retry.execute(|| self.backend.raw_query_one(sql, params))
    }

    pub fn supports_raw_query(&self) -> bool {
        self.backend.supports_raw_query()
    }

    /// Default options with this facade's configured deadline.
    pub fn transaction_options(&self) -> TransactionOptions {
        TransactionOptions {
            timeout: self.transaction_timeout,
            ..TransactionOptions::default()
        }
    }

    /// Runs `operation` atomically against the backend.
    pub fn transaction<T>(
        &self,
        options: &TransactionOptions,
        mut operation: impl FnMut(&dyn StorageBackend) -> StoreResult<T>,
    ) -> StoreResult<T> {
        self.transaction_manager_with(options.timeout)
            .execute(options, |backend: &(dyn StorageBackend + 'static)| {
                operation(backend)
            })
    }

    /// Manager for manual begin/savepoint/commit control.
    pub fn transaction_manager(&self) -> TransactionManager {
        self.transaction_manager_with(self.transaction_timeout)
    }

    fn transaction_manager_with(&self, timeout: Duration) -> TransactionManager {
        TransactionManager::with_policy(Arc::clone(&self.backend), self.retry.clone(), timeout)
    }

    /// Most recent health report, if any check has run.
    pub fn health_status(&self) -> Option<HealthReport> {
        self.health.last_report()
    }

    pub fn check_health(&self) -> HealthReport {
        self.health.check_health()
    }

    pub fn health_history(&self) -> Vec<HealthReport> {
        self.health.history()
    }

    pub fn health_summary(&self) -> String {
        self.health.summary()
    }

    pub fn wait_for_ready(&self, timeout: Duration) -> bool {
        self.health.wait_for_healthy(timeout)
    }

    pub fn connection_pool_status(&self) -> Option<PoolStatus> {
        self.backend.pool_status()
    }

    /// Record counts per application table.
    pub fn stats(&self) -> StoreResult<BTreeMap<String, usize>> {
        let tables = self.retry.execute(|| self.backend.list_tables())?;
        let everything = Query::new();
        tables
            .into_iter()
            .map(|table| {
                let count = self.count(&table, &everything)?;
                Ok((table, count))
            })
            .collect()
    }

    pub fn run_maintenance(&self) -> StoreResult<Option<MaintenanceReport>> {
        self.retry
            .execute(|| self.backend.run_maintenance(now_epoch_ms()))
    }

    /// Stops background checks and closes the backend; repeat calls are
    /// no-ops.
    pub fn shutdown(&self) -> StoreResult<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.health.stop_periodic_check();
        self.backend.close()?;
        info!(
            "event=data_access_shutdown module=service status=ok backend={}",
            self.selection.active.as_str()
        );
        Ok(())
    }
}
