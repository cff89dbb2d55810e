use chefmind_core::retry::{classify, ErrorClass, RetryAttempt};
use chefmind_core::{RetryPolicy, Row, SqlBackend, SqliteSettings, StorageBackend, StoreError};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn quick_policy() -> RetryPolicy {
    RetryPolicy::new()
        .with_base_delay(Duration::from_millis(2))
        .with_jitter(false)
}

#[test]
fn transient_errors_are_retried_until_exhausted() {
    let mut calls = 0;
    let result: Result<(), StoreError> = quick_policy().execute(|| {
        calls += 1;
        Err(StoreError::backend("sqlite", "database is locked"))
    });

    assert!(matches!(result, Err(StoreError::Backend { .. })));
    assert_eq!(calls, 4);
}

#[test]
fn permanent_errors_fail_immediately() {
    let mut calls = 0;
    let result: Result<(), StoreError> = quick_policy().execute(|| {
        calls += 1;
        Err(StoreError::backend("sqlite", "no such column: flavour"))
    });

    assert!(result.is_err());
    assert_eq!(calls, 1);
}

#[test]
fn success_after_transient_failures_returns_value() {
    let mut calls = 0;
    let value = quick_policy()
        .execute(|| {
            calls += 1;
            if calls < 3 {
                Err(StoreError::backend("sqlite", "SQLITE_BUSY"))
            } else {
                Ok(calls * 10)
            }
        })
        .unwrap();

    assert_eq!(value, 30);
}

#[test]
fn callback_sees_each_retry_with_backoff() {
    let seen: Arc<Mutex<Vec<RetryAttempt>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let policy = RetryPolicy::new()
        .with_max_retries(2)
        .with_base_delay(Duration::from_millis(5))
        .with_jitter(false)
        .on_retry(move |attempt| sink.lock().push(attempt.clone()));

    let _ = policy.execute(|| -> Result<(), StoreError> {
        Err(StoreError::backend("sqlite", "database schema has changed"))
    });

    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].attempt, 1);
    assert_eq!(seen[0].delay, Duration::from_millis(5));
    assert_eq!(seen[1].attempt, 2);
    assert_eq!(seen[1].delay, Duration::from_millis(10));
    assert!(seen.iter().all(|attempt| attempt.class == ErrorClass::SchemaChanged));
    assert!(seen.iter().all(|attempt| attempt.max_retries == 2));
}

#[test]
fn zero_retry_policy_runs_once() {
    let mut calls = 0;
    let _ = RetryPolicy::none().execute(|| -> Result<(), StoreError> {
        calls += 1;
        Err(StoreError::backend("sqlite", "database is locked"))
    });
    assert_eq!(calls, 1);
}

#[test]
fn real_busy_database_recovers_once_lock_is_released() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("busy.db");
    let settings = SqliteSettings {
        busy_timeout: Duration::ZERO,
        ..SqliteSettings::file(&path)
    };
    let backend = SqlBackend::open(&settings).unwrap();

    let locker = Connection::open(&path).unwrap();
    locker.execute_batch("BEGIN EXCLUSIVE;").unwrap();

    let payload: Row = json!({"title": "Braised Pork"}).as_object().cloned().unwrap();
    let blocked = backend.insert("recipes", &payload).unwrap_err();
    assert_eq!(classify(&blocked), ErrorClass::Busy);
    assert!(blocked.is_transient());

    let release = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        locker.execute_batch("COMMIT;").unwrap();
    });

    let policy = RetryPolicy::new()
        .with_max_retries(6)
        .with_base_delay(Duration::from_millis(50))
        .with_jitter(false);
    let record = policy
        .execute(|| backend.insert("recipes", &payload))
        .unwrap();
    release.join().unwrap();

    assert_eq!(record.get_str("title"), Some("Braised Pork"));
}
