//! Connection bootstrap utilities for SQLite.
//!
//! # Responsibility
//! - Open file or in-memory SQLite connections.
//! - Apply the fixed runtime pragma set used by the embedded SQL backend.
//! - Trigger schema migrations before returning a usable connection.
//!
//! # Invariants
//! - Returned connections have `foreign_keys=ON`.
//! - Returned connections from `open_db*` have migrations fully applied.
//! - The parent directory of a file database exists before opening.

use super::migrations::apply_migrations;
use super::{DbError, DbResult};
use log::{error, info, warn};
use rusqlite::Connection;
use std::path::Path;
use std::time::{Duration, Instant};

const CACHE_SIZE_KIB: i64 = -20_000;
const MMAP_SIZE_BYTES: i64 = 256 * 1024 * 1024;

/// Caller-tunable part of the connection pragma set.
///
/// Everything else (`synchronous`, cache, temp store, mmap, auto-vacuum)
/// is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PragmaOptions {
    pub enable_wal: bool,
    pub busy_timeout: Duration,
}

impl Default for PragmaOptions {
    fn default() -> Self {
        Self {
            enable_wal: true,
            busy_timeout: Duration::from_millis(10_000),
        }
    }
}

/// Opens a SQLite database file and applies all pending migrations.
///
/// Creates the parent directory when it does not exist yet.
///
/// # Side effects
/// - Emits `db_open` logging events with duration and status.
pub fn open_db(path: impl AsRef<Path>, options: &PragmaOptions) -> DbResult<Connection> {
    let path = path.as_ref();
    let started_at = Instant::now();
    info!(
        "event=db_open module=db status=start mode=file path={}",
        path.display()
    );

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        if let Err(source) = std::fs::create_dir_all(parent) {
            error!(
                "event=db_open module=db status=error mode=file error_code=db_dir_failed error={}",
                source
            );
            return Err(DbError::Io {
                path: parent.to_path_buf(),
                source,
            });
        }
    }

    let conn = Connection::open(path).map_err(|err| {
        error!(
            "event=db_open module=db status=error mode=file duration_ms={} error_code=db_open_failed error={}",
            started_at.elapsed().as_millis(),
            err
        );
        DbError::from(err)
    })?;

    finish_open(conn, options, "file", started_at)
}

/// Opens an in-memory SQLite database and applies all pending migrations.
///
/// WAL is never requested for in-memory databases.
pub fn open_db_in_memory() -> DbResult<Connection> {
    let started_at = Instant::now();
    info!("event=db_open module=db status=start mode=memory");

    let conn = Connection::open_in_memory().map_err(|err| {
        error!(
            "event=db_open module=db status=error mode=memory duration_ms={} error_code=db_open_failed error={}",
            started_at.elapsed().as_millis(),
            err
        );
        DbError::from(err)
    })?;

    let options = PragmaOptions {
        enable_wal: false,
        ..PragmaOptions::default()
    };
    finish_open(conn, &options, "memory", started_at)
}

/// Applies the runtime pragma set without running migrations.
///
/// Used by pooled connections that share an already-migrated file.
pub fn configure_connection(conn: &Connection, options: &PragmaOptions) -> DbResult<()> {
    conn.busy_timeout(options.busy_timeout)?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;
         PRAGMA temp_store = MEMORY;",
    )?;
    conn.pragma_update(None, "cache_size", CACHE_SIZE_KIB)?;
    // File databases answer `mmap_size` with the applied size, in-memory
    // databases with no row at all.
    let mut mmap = conn.prepare(&format!("PRAGMA mmap_size = {MMAP_SIZE_BYTES}"))?;
    mmap.query([])?.next()?;

    if options.enable_wal {
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            warn!(
                "event=db_configure module=db status=degraded journal_mode={}",
                mode
            );
        }
    }

    Ok(())
}

fn finish_open(
    mut conn: Connection,
    options: &PragmaOptions,
    mode: &str,
    started_at: Instant,
) -> DbResult<Connection> {
    match bootstrap_connection(&mut conn, options) {
        Ok(()) => {
            info!(
                "event=db_open module=db status=ok mode={} duration_ms={}",
                mode,
                started_at.elapsed().as_millis()
            );
            Ok(conn)
        }
        Err(err) => {
            error!(
                "event=db_open module=db status=error mode={} duration_ms={} error_code=db_bootstrap_failed error={}",
                mode,
                started_at.elapsed().as_millis(),
                err
            );
            Err(err)
        }
    }
}

fn bootstrap_connection(conn: &mut Connection, options: &PragmaOptions) -> DbResult<()> {
    // auto_vacuum only takes effect before the first table is created.
    conn.execute_batch("PRAGMA auto_vacuum = INCREMENTAL;")?;
    configure_connection(conn, options)?;
    apply_migrations(conn)?;
    Ok(())
}
