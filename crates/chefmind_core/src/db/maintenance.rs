//! Periodic housekeeping for the embedded SQL database.
//!
//! # Invariants
//! - Only expired/inactive sessions and old completed sync jobs are deleted.
//! - Space reclamation runs after the purges so freed pages are returned.

use super::DbResult;
use log::info;
use rusqlite::{params, Connection};
use std::time::Instant;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;
pub const SESSION_INACTIVITY_MS: i64 = 30 * DAY_MS;
pub const COMPLETED_SYNC_RETENTION_MS: i64 = 7 * DAY_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MaintenanceReport {
    pub expired_sessions: usize,
    pub purged_sync_jobs: usize,
}

/// Purges stale rows, reclaims free pages and refreshes planner statistics.
///
/// `now_ms` is epoch milliseconds; passing it in keeps retention windows
/// testable.
pub fn run_maintenance(conn: &Connection, now_ms: i64) -> DbResult<MaintenanceReport> {
    let started_at = Instant::now();

    let expired_sessions = conn.execute(
        "DELETE FROM user_sessions
         WHERE (expires_at IS NOT NULL AND expires_at < ?1)
            OR (last_activity IS NOT NULL AND last_activity < ?2)",
        params![now_ms, now_ms - SESSION_INACTIVITY_MS],
    )?;
    let purged_sync_jobs = conn.execute(
        "DELETE FROM sync_queue WHERE status = 'completed' AND updated_at < ?1",
        params![now_ms - COMPLETED_SYNC_RETENTION_MS],
    )?;

    conn.execute_batch("PRAGMA incremental_vacuum; ANALYZE;")?;

    info!(
        "event=db_maintenance module=db status=ok expired_sessions={} purged_sync_jobs={} duration_ms={}",
        expired_sessions,
        purged_sync_jobs,
        started_at.elapsed().as_millis()
    );

    Ok(MaintenanceReport {
        expired_sessions,
        purged_sync_jobs,
    })
}
