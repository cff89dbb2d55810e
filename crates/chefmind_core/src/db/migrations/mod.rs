//! Ordered schema migrations for the embedded SQL backend.
//!
//! # Responsibility
//! - Keep the ChefMind table set versioned in one ordered list.
//! - Bring a connection up to the newest version inside one transaction.
//!
//! # Invariants
//! - Versions are contiguous and strictly increasing.
//! - `PRAGMA user_version` always equals the last applied version.
//! - A database written by a newer binary is refused, never downgraded.

use crate::db::{DbError, DbResult};
use log::info;
use rusqlite::Connection;

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "init",
    sql: include_str!("0001_init.sql"),
}];

/// Returns the newest schema version this build can write.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |migration| migration.version)
}

/// Reads the schema version currently recorded in the database.
pub fn current_version(conn: &Connection) -> DbResult<u32> {
    let version = conn.query_row("PRAGMA user_version;", [], |row| row.get::<_, u32>(0))?;
    Ok(version)
}

/// Applies every migration newer than the recorded version.
///
/// # Errors
/// - [`DbError::UnsupportedSchemaVersion`] when the file is ahead of this build.
/// - [`DbError::Sqlite`] when a migration statement fails; nothing is applied.
pub fn apply_migrations(conn: &mut Connection) -> DbResult<()> {
    let from = current_version(conn)?;
    let latest = latest_version();

    if from > latest {
        return Err(DbError::UnsupportedSchemaVersion {
            db_version: from,
            latest_supported: latest,
        });
    }
    if from == latest {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for migration in MIGRATIONS.iter().filter(|migration| migration.version > from) {
        tx.execute_batch(migration.sql)?;
        tx.pragma_update(None, "user_version", migration.version)?;
        info!(
            "event=db_migrate module=db status=applied version={} name={}",
            migration.version, migration.name
        );
    }
    tx.commit()?;

    Ok(())
}
