//! Backend health probing and reporting.
//!
//! # Responsibility
//! - Define the probes each backend answers ([`HealthProbe`]).
//! - Assemble probe outcomes into a [`HealthReport`].
//! - Run checks on demand, periodically, or until the backend is ready.
//!
//! # Invariants
//! - Probes run in a fixed order and the first failure ends the check.
//! - A report is healthy only when every probe passed.
//! - History keeps at most the most recent [`DEFAULT_HISTORY_LIMIT`] reports.

mod checker;

pub use checker::{HealthChecker, DEFAULT_HISTORY_LIMIT, DEFAULT_POLL_INTERVAL};

use crate::store::StoreResult;
use serde::{Deserialize, Serialize};

/// Integrity probe result for a sound store.
pub const INTEGRITY_OK: &str = "ok";

/// Storage footprint reported by [`HealthProbe::probe_storage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StorageFootprint {
    pub bytes: u64,
    /// Only engines with paged files report this.
    pub page_count: Option<u64>,
}

pub trait HealthProbe: Send + Sync {
    /// Trivial round trip proving the backend answers.
    fn probe_connectivity(&self) -> StoreResult<()>;

    /// Reads catalogue metadata.
    fn probe_read(&self) -> StoreResult<()>;

    /// Writes and removes a disposable record.
    fn probe_write(&self) -> StoreResult<()>;

    fn probe_storage(&self) -> StoreResult<StorageFootprint>;

    /// Structural self-check; returns [`INTEGRITY_OK`] when sound.
    fn probe_integrity(&self) -> StoreResult<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }
}

/// Per-probe outcomes; fields stay at their defaults for probes that never
/// ran.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HealthDetails {
    pub can_execute: bool,
    pub can_read: bool,
    pub can_write: bool,
    pub storage_bytes: Option<u64>,
    pub page_count: Option<u64>,
    pub integrity_check: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub is_healthy: bool,
    pub connection_status: ConnectionStatus,
    pub response_time_ms: u64,
    /// Epoch milliseconds when the check started.
    pub checked_at_ms: i64,
    pub details: HealthDetails,
}

impl HealthReport {
    pub fn summary(&self) -> String {
        if self.is_healthy {
            format!(
                "Healthy - {}, {}ms response time",
                self.connection_status.as_str(),
                self.response_time_ms
            )
        } else {
            format!(
                "Unhealthy - {}",
                self.details.error.as_deref().unwrap_or("unknown error")
            )
        }
    }
}
