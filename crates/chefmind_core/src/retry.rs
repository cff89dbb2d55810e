//! Retry policy for transient storage contention.
//!
//! # Responsibility
//! - Classify storage errors into retryable contention and permanent faults.
//! - Re-run an operation with capped exponential backoff plus jitter.
//!
//! # Invariants
//! - Only busy/locked/protocol/schema-changed contention is retried.
//! - An operation runs at most `max_retries + 1` times.
//! - After the last retry the original error is returned unchanged.
//! - The retry notification fires before each wait, never after success.

use crate::db::DbError;
use crate::logging::{sanitize_message, MAX_LOGGED_ERROR_CHARS};
use crate::store::{StoreError, StoreResult};
use log::warn;
use rand::Rng;
use rusqlite::ErrorCode;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);
pub const PROBE_MAX_RETRIES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Busy,
    Locked,
    Protocol,
    SchemaChanged,
    Permanent,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Permanent)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Busy => "busy",
            Self::Locked => "locked",
            Self::Protocol => "protocol",
            Self::SchemaChanged => "schema_changed",
            Self::Permanent => "permanent",
        }
    }
}

/// Classifies an error by engine code first, then by message text.
pub fn classify(err: &StoreError) -> ErrorClass {
    match err {
        StoreError::Db(DbError::Sqlite(sqlite)) => match sqlite.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) => ErrorClass::Busy,
            Some(ErrorCode::DatabaseLocked) => ErrorClass::Locked,
            Some(ErrorCode::FileLockingProtocolFailed) => ErrorClass::Protocol,
            Some(ErrorCode::SchemaChanged) => ErrorClass::SchemaChanged,
            _ => classify_message(&sqlite.to_string()),
        },
        StoreError::Backend { message, .. } => classify_message(message),
        _ => ErrorClass::Permanent,
    }
}

fn classify_message(message: &str) -> ErrorClass {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("sqlite_busy") || lowered.contains("database is busy") {
        ErrorClass::Busy
    } else if lowered.contains("sqlite_locked")
        || lowered.contains("database is locked")
        || lowered.contains("database table is locked")
    {
        ErrorClass::Locked
    } else if lowered.contains("sqlite_protocol") {
        ErrorClass::Protocol
    } else if lowered.contains("sqlite_schema") || lowered.contains("database schema has changed")
    {
        ErrorClass::SchemaChanged
    } else {
        ErrorClass::Permanent
    }
}

/// Passed to the retry notification before each backoff wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryAttempt {
    /// 1-based index of the retry about to happen.
    pub attempt: u32,
    pub max_retries: u32,
    pub delay: Duration,
    pub class: ErrorClass,
    pub message: String,
}

pub type RetryCallback = Arc<dyn Fn(&RetryAttempt) + Send + Sync>;

#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
    on_retry: Option<RetryCallback>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: true,
            on_retry: None,
        }
    }
}

impl Debug for RetryPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorter preset used by health probes.
    pub fn probe() -> Self {
        Self {
            max_retries: PROBE_MAX_RETRIES,
            ..Self::default()
        }
    }

    /// Never retries; useful for callers that own their own loop.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn on_retry(mut self, callback: impl Fn(&RetryAttempt) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(callback));
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Backoff before retry `attempt` (0-based), without jitter.
    ///
    /// `min(max_delay, base_delay * 2^attempt)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let backoff = self.backoff_delay(attempt);
        if !self.jitter || self.base_delay.is_zero() {
            return backoff;
        }
        let spread = rand::thread_rng().gen::<f64>() * self.base_delay.as_secs_f64();
        backoff + Duration::from_secs_f64(spread)
    }

    /// Runs `operation`, retrying transient failures with backoff.
    pub fn execute<T, F>(&self, mut operation: F) -> StoreResult<T>
    where
        F: FnMut() -> StoreResult<T>,
    {
        let mut attempt = 0;
        loop {
            let err = match operation() {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let class = classify(&err);
            if !class.is_retryable() || attempt >= self.max_retries {
                return Err(err);
            }

            let delay = self.delay_for(attempt);
            let notice = RetryAttempt {
                attempt: attempt + 1,
                max_retries: self.max_retries,
                delay,
                class,
                message: err.to_string(),
            };
            match &self.on_retry {
                Some(callback) => callback(&notice),
                None => warn!(
                    "event=retry module=retry status=retrying attempt={} max_retries={} delay_ms={} error_class={} error={}",
                    notice.attempt,
                    notice.max_retries,
                    notice.delay.as_millis(),
                    class.as_str(),
                    sanitize_message(&notice.message, MAX_LOGGED_ERROR_CHARS)
                ),
            }

            thread::sleep(delay);
            attempt += 1;
        }
    }
}
