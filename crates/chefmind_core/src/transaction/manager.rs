//! Transaction lifecycle, savepoint stack and deadline enforcement.
//!
//! # Invariants
//! - At most one transaction is active per manager.
//! - The savepoint stack is empty whenever the state is not `Active`.
//! - Only the most recent savepoint may be released.
//! - An active transaction older than its timeout is rolled back by the
//!   watchdog and can no longer commit.

use super::{IsolationLevel, TransactionDriver, TxStatement, DEFAULT_TRANSACTION_TIMEOUT};
use crate::model::ident::is_valid_identifier;
use crate::retry::RetryPolicy;
use crate::store::{StorageBackend, StoreError, StoreResult};
use log::{error, info, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Inactive,
    Active,
    Committed,
    RolledBack,
    /// A control statement failed; the next `begin` starts over.
    Error,
}

impl TransactionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
            Self::Error => "error",
        }
    }
}

/// Options for [`TransactionManager::execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionOptions {
    /// Retries of the whole unit of work on transient contention.
    pub max_retries: u32,
    pub timeout: Duration,
    pub isolation: IsolationLevel,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            max_retries: crate::retry::DEFAULT_MAX_RETRIES,
            timeout: DEFAULT_TRANSACTION_TIMEOUT,
            isolation: IsolationLevel::Immediate,
        }
    }
}

struct TxInner {
    state: TransactionState,
    savepoints: Vec<String>,
    /// Bumped on every begin/finish so stale watchdogs stand down.
    generation: u64,
    timed_out: bool,
}

struct TxShared {
    inner: Mutex<TxInner>,
    finished: Condvar,
}

pub struct TransactionManager<D: ?Sized + TransactionDriver + 'static = dyn StorageBackend> {
    driver: Arc<D>,
    retry: RetryPolicy,
    timeout: Duration,
    tx_id: Uuid,
    shared: Arc<TxShared>,
}

impl<D: ?Sized + TransactionDriver + 'static> TransactionManager<D> {
    pub fn new(driver: Arc<D>) -> Self {
        Self::with_policy(driver, RetryPolicy::default(), DEFAULT_TRANSACTION_TIMEOUT)
    }

    pub fn with_policy(driver: Arc<D>, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            driver,
            retry,
            timeout,
            tx_id: Uuid::new_v4(),
            shared: Arc::new(TxShared {
                inner: Mutex::new(TxInner {
                    state: TransactionState::Inactive,
                    savepoints: Vec::new(),
                    generation: 0,
                    timed_out: false,
                }),
                finished: Condvar::new(),
            }),
        }
    }

    pub fn tx_id(&self) -> Uuid {
        self.tx_id
    }

    pub fn state(&self) -> TransactionState {
        self.shared.inner.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    /// Savepoint names, oldest first.
    pub fn savepoints(&self) -> Vec<String> {
        self.shared.inner.lock().savepoints.clone()
    }

    /// Starts a transaction and arms the deadline watchdog.
    ///
    /// # Errors
    /// - [`StoreError::AlreadyActive`] when a transaction is already open.
    /// - The driver error when `BEGIN` fails after retries; state becomes
    ///   `Error`.
    pub fn begin(&self, isolation: IsolationLevel) -> StoreResult<()> {
        let mut inner = self.shared.inner.lock();
        if inner.state == TransactionState::Active {
            return Err(StoreError::AlreadyActive);
        }

        inner.savepoints.clear();
        inner.timed_out = false;
        if let Err(err) = self.run(&TxStatement::Begin(isolation)) {
            inner.state = TransactionState::Error;
            error!(
                "event=tx_begin module=transaction status=error tx_id={} isolation={} error={}",
                self.tx_id,
                isolation.as_sql(),
                err
            );
            return Err(err);
        }

        inner.state = TransactionState::Active;
        inner.generation += 1;
        let generation = inner.generation;
        drop(inner);

        info!(
            "event=tx_begin module=transaction status=ok tx_id={} isolation={}",
            self.tx_id,
            isolation.as_sql()
        );
        self.arm_watchdog(generation);
        Ok(())
    }

    /// Commits the active transaction.
    ///
    /// A failed commit is followed by a rollback and the commit error is
    /// returned.
    pub fn commit(&self) -> StoreResult<()> {
        let mut inner = self.shared.inner.lock();
        if inner.state != TransactionState::Active {
            return Err(if inner.timed_out {
                StoreError::TransactionTimedOut
            } else {
                StoreError::NoActiveTransaction
            });
        }

        match self.run(&TxStatement::Commit) {
            Ok(()) => {
                self.finish(&mut inner, TransactionState::Committed);
                info!(
                    "event=tx_commit module=transaction status=ok tx_id={}",
                    self.tx_id
                );
                Ok(())
            }
            Err(err) => {
                inner.state = TransactionState::Error;
                error!(
                    "event=tx_commit module=transaction status=error tx_id={} error={}",
                    self.tx_id, err
                );
                self.rollback_locked(&mut inner);
                Err(err)
            }
        }
    }

    /// Rolls back the current transaction; never fails.
    ///
    /// No-op when nothing is open. A failing `ROLLBACK` is logged and leaves
    /// the state at `Error`.
    pub fn rollback(&self) {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            TransactionState::Inactive
            | TransactionState::RolledBack
            | TransactionState::Committed => {}
            TransactionState::Active | TransactionState::Error => {
                self.rollback_locked(&mut inner);
            }
        }
    }

    /// Opens a named savepoint inside the active transaction.
    pub fn savepoint(&self, name: &str) -> StoreResult<()> {
        validate_savepoint_name(name)?;
        let mut inner = self.active_inner()?;
        if inner.savepoints.iter().any(|existing| existing == name) {
            return Err(StoreError::DuplicateSavepoint(name.to_string()));
        }

        self.run(&TxStatement::Savepoint(name.to_string()))?;
        inner.savepoints.push(name.to_string());
        Ok(())
    }

    /// Releases the most recent savepoint, keeping its changes.
    pub fn release_savepoint(&self, name: &str) -> StoreResult<()> {
        validate_savepoint_name(name)?;
        let mut inner = self.active_inner()?;
        match inner.savepoints.iter().position(|existing| existing == name) {
            None => return Err(StoreError::UnknownSavepoint(name.to_string())),
            Some(index) if index + 1 != inner.savepoints.len() => {
                return Err(StoreError::SavepointNotLatest(name.to_string()));
            }
            Some(_) => {}
        }

        self.run(&TxStatement::ReleaseSavepoint(name.to_string()))?;
        inner.savepoints.pop();
        Ok(())
    }

    /// Undoes work since `name`; it and every later savepoint are discarded.
    pub fn rollback_to_savepoint(&self, name: &str) -> StoreResult<()> {
        validate_savepoint_name(name)?;
        let mut inner = self.active_inner()?;
        let index = inner
            .savepoints
            .iter()
            .position(|existing| existing == name)
            .ok_or_else(|| StoreError::UnknownSavepoint(name.to_string()))?;

        self.run(&TxStatement::RollbackToSavepoint(name.to_string()))?;
        inner.savepoints.truncate(index);
        Ok(())
    }

    /// Runs `operation` as one unit of work.
    ///
    /// Each attempt uses a fresh transaction; the unit is retried as a whole
    /// on transient contention, up to `options.max_retries` times.
    pub fn execute<T, F>(&self, options: &TransactionOptions, mut operation: F) -> StoreResult<T>
    where
        F: FnMut(&D) -> StoreResult<T>,
    {
        let unit_retry = self.retry.clone().with_max_retries(options.max_retries);
        unit_retry.execute(|| {
            let attempt = TransactionManager::with_policy(
                Arc::clone(&self.driver),
                self.retry.clone(),
                options.timeout,
            );
            attempt.begin(options.isolation)?;
            match operation(&*self.driver) {
                Ok(value) => {
                    attempt.commit()?;
                    Ok(value)
                }
                Err(err) => {
                    warn!(
                        "event=tx_execute module=transaction status=rollback tx_id={} error={}",
                        attempt.tx_id, err
                    );
                    attempt.rollback();
                    Err(err)
                }
            }
        })
    }

    fn run(&self, statement: &TxStatement) -> StoreResult<()> {
        self.retry
            .execute(|| self.driver.execute_statement(statement))
    }

    fn active_inner(&self) -> StoreResult<parking_lot::MutexGuard<'_, TxInner>> {
        let inner = self.shared.inner.lock();
        if inner.state != TransactionState::Active {
            return Err(if inner.timed_out {
                StoreError::TransactionTimedOut
            } else {
                StoreError::NoActiveTransaction
            });
        }
        Ok(inner)
    }

    fn rollback_locked(&self, inner: &mut TxInner) {
        match self.run(&TxStatement::Rollback) {
            Ok(()) => {
                self.finish(inner, TransactionState::RolledBack);
                info!(
                    "event=tx_rollback module=transaction status=ok tx_id={}",
                    self.tx_id
                );
            }
            Err(err) => {
                self.finish(inner, TransactionState::Error);
                error!(
                    "event=tx_rollback module=transaction status=error tx_id={} error={}",
                    self.tx_id, err
                );
            }
        }
    }

    fn finish(&self, inner: &mut TxInner, state: TransactionState) {
        inner.state = state;
        inner.savepoints.clear();
        inner.generation += 1;
        self.shared.finished.notify_all();
    }

    fn arm_watchdog(&self, generation: u64) {
        let shared = Arc::clone(&self.shared);
        let driver = Arc::clone(&self.driver);
        let retry = self.retry.clone();
        let timeout = self.timeout;
        let tx_id = self.tx_id;

        let spawned = thread::Builder::new()
            .name("chefmind-tx-watchdog".to_string())
            .spawn(move || {
                let deadline = Instant::now() + timeout;
                let mut inner = shared.inner.lock();
                while inner.generation == generation && inner.state == TransactionState::Active {
                    if shared.finished.wait_until(&mut inner, deadline).timed_out() {
                        break;
                    }
                }
                if inner.generation != generation || inner.state != TransactionState::Active {
                    return;
                }

                warn!(
                    "event=tx_timeout module=transaction status=rollback tx_id={} timeout_ms={}",
                    tx_id,
                    timeout.as_millis()
                );
                let outcome = retry.execute(|| driver.execute_statement(&TxStatement::Rollback));
                inner.timed_out = true;
                inner.savepoints.clear();
                inner.generation += 1;
                inner.state = match outcome {
                    Ok(()) => TransactionState::RolledBack,
                    Err(err) => {
                        error!(
                            "event=tx_timeout module=transaction status=error tx_id={} error={}",
                            tx_id, err
                        );
                        TransactionState::Error
                    }
                };
                shared.finished.notify_all();
            });

        if let Err(err) = spawned {
            error!(
                "event=tx_watchdog module=transaction status=error tx_id={} error={}",
                self.tx_id, err
            );
        }
    }
}

fn validate_savepoint_name(name: &str) -> StoreResult<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}
