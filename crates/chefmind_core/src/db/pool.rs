//! Fixed-size SQLite connection pool.
//!
//! # Responsibility
//! - Hand out validated connections to one database file.
//! - Report total/available/active counts for diagnostics.
//!
//! # Invariants
//! - The slot count never changes after construction.
//! - A connection is owned by exactly one caller or sits idle in its slot.
//! - Connections that fail validation are reopened before being handed out.
//! - After `close_all`, no connection is handed out and every connection
//!   coming back is closed.

use super::open::configure_connection;
use super::{DbError, DbResult, PragmaOptions};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Connection counts reported by a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub total_connections: usize,
    pub available_connections: usize,
    pub active_connections: usize,
}

/// A connection checked out of a pool.
///
/// Must be handed back through [`ConnectionPool::release_connection`].
#[derive(Debug)]
pub struct PooledConnection {
    slot: usize,
    conn: Connection,
}

impl PooledConnection {
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn slot(&self) -> usize {
        self.slot
    }
}

pub trait ConnectionPool: Send + Sync {
    /// Waits for an idle connection and checks it out.
    fn get_connection(&self) -> DbResult<PooledConnection>;

    /// Returns a checked-out connection to its slot.
    fn release_connection(&self, handle: PooledConnection);

    fn status(&self) -> PoolStatus;

    /// Closes idle connections and refuses further checkouts. Returns the
    /// number of connections closed now.
    fn close_all(&self) -> DbResult<usize>;
}

pub struct SqlitePool {
    path: PathBuf,
    options: PragmaOptions,
    acquire_timeout: Duration,
    slots: Mutex<Vec<Option<Connection>>>,
    released: Condvar,
    closed: AtomicBool,
}

impl SqlitePool {
    /// Opens `size` connections against an already-migrated database file.
    ///
    /// Slots whose connection fails to open are dropped with an error log;
    /// the pool fails only when no connection could be opened at all.
    pub fn open(
        path: impl AsRef<Path>,
        size: usize,
        options: PragmaOptions,
        acquire_timeout: Duration,
    ) -> DbResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut slots = Vec::with_capacity(size);
        let mut last_error = None;

        for index in 0..size {
            match open_pooled(&path, &options) {
                Ok(conn) => slots.push(Some(conn)),
                Err(err) => {
                    error!(
                        "event=pool_open module=db status=error slot={} error={}",
                        index, err
                    );
                    last_error = Some(err);
                }
            }
        }

        if slots.is_empty() {
            return Err(last_error.unwrap_or(DbError::PoolExhausted { waited_ms: 0 }));
        }

        info!(
            "event=pool_open module=db status=ok size={} requested={}",
            slots.len(),
            size
        );

        Ok(Self {
            path,
            options,
            acquire_timeout,
            slots: Mutex::new(slots),
            released: Condvar::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn checkout(&self, slot: usize, conn: Connection) -> DbResult<PooledConnection> {
        if is_healthy(&conn) {
            return Ok(PooledConnection { slot, conn });
        }

        warn!("event=pool_validate module=db status=reopen slot={}", slot);
        match open_pooled(&self.path, &self.options) {
            Ok(fresh) => Ok(PooledConnection { slot, conn: fresh }),
            Err(err) => {
                self.slots.lock()[slot] = Some(conn);
                self.released.notify_one();
                Err(err)
            }
        }
    }
}

impl ConnectionPool for SqlitePool {
    fn get_connection(&self) -> DbResult<PooledConnection> {
        let started_at = Instant::now();
        let deadline = started_at + self.acquire_timeout;
        let mut slots = self.slots.lock();

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(DbError::PoolClosed);
            }
            let idle = slots
                .iter_mut()
                .enumerate()
                .find_map(|(slot, conn)| conn.take().map(|conn| (slot, conn)));
            if let Some((slot, conn)) = idle {
                drop(slots);
                debug!("event=pool_acquire module=db status=ok slot={}", slot);
                return self.checkout(slot, conn);
            }

            if self.released.wait_until(&mut slots, deadline).timed_out() {
                let waited_ms = started_at.elapsed().as_millis();
                warn!(
                    "event=pool_acquire module=db status=timeout waited_ms={}",
                    waited_ms
                );
                return Err(DbError::PoolExhausted { waited_ms });
            }
        }
    }

    fn release_connection(&self, handle: PooledConnection) {
        if self.closed.load(Ordering::Acquire) {
            if let Err((_, err)) = handle.conn.close() {
                warn!(
                    "event=pool_close module=db status=error slot={} error={}",
                    handle.slot, err
                );
            }
            return;
        }
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(handle.slot) {
            *slot = Some(handle.conn);
        }
        drop(slots);
        self.released.notify_one();
    }

    fn status(&self) -> PoolStatus {
        if self.closed.load(Ordering::Acquire) {
            return PoolStatus {
                total_connections: 0,
                available_connections: 0,
                active_connections: 0,
            };
        }
        let slots = self.slots.lock();
        let total = slots.len();
        let available = slots.iter().filter(|slot| slot.is_some()).count();
        PoolStatus {
            total_connections: total,
            available_connections: available,
            active_connections: total - available,
        }
    }

    fn close_all(&self) -> DbResult<usize> {
        let idle: Vec<Connection> = {
            let mut slots = self.slots.lock();
            self.closed.store(true, Ordering::Release);
            slots.iter_mut().filter_map(Option::take).collect()
        };
        self.released.notify_all();

        let mut closed = 0;
        let mut first_error = None;
        for conn in idle {
            match conn.close() {
                Ok(()) => closed += 1,
                Err((_, err)) => {
                    warn!("event=pool_close module=db status=error error={}", err);
                    first_error.get_or_insert(err);
                }
            }
        }
        info!("event=pool_close module=db status=ok closed={}", closed);
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(closed),
        }
    }
}

fn open_pooled(path: &Path, options: &PragmaOptions) -> DbResult<Connection> {
    let conn = Connection::open(path)?;
    configure_connection(&conn, options)?;
    Ok(conn)
}

fn is_healthy(conn: &Connection) -> bool {
    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
        .map(|value| value == 1)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::{ConnectionPool, SqlitePool};
    use crate::db::{open_db, DbError, PragmaOptions};
    use std::time::Duration;

    fn pool_with(size: usize) -> (tempfile::TempDir, SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.db");
        open_db(&path, &PragmaOptions::default()).unwrap();
        let pool = SqlitePool::open(
            &path,
            size,
            PragmaOptions::default(),
            Duration::from_millis(50),
        )
        .unwrap();
        (dir, pool)
    }

    #[test]
    fn status_tracks_checkouts() {
        let (_dir, pool) = pool_with(2);
        let handle = pool.get_connection().unwrap();

        let status = pool.status();
        assert_eq!(status.total_connections, 2);
        assert_eq!(status.available_connections, 1);
        assert_eq!(status.active_connections, 1);

        pool.release_connection(handle);
        assert_eq!(pool.status().available_connections, 2);
    }

    #[test]
    fn close_all_closes_idle_and_returned_connections() {
        let (_dir, pool) = pool_with(2);
        let held = pool.get_connection().unwrap();

        assert_eq!(pool.close_all().unwrap(), 1);
        assert!(matches!(
            pool.get_connection().unwrap_err(),
            DbError::PoolClosed
        ));

        pool.release_connection(held);
        assert_eq!(pool.status().total_connections, 0);
        assert!(matches!(
            pool.get_connection().unwrap_err(),
            DbError::PoolClosed
        ));
    }

    #[test]
    fn exhausted_pool_times_out() {
        let (_dir, pool) = pool_with(1);
        let _held = pool.get_connection().unwrap();

        let err = pool.get_connection().unwrap_err();
        assert!(matches!(err, DbError::PoolExhausted { .. }));
    }

    #[test]
    fn pooled_connections_see_migrated_schema() {
        let (_dir, pool) = pool_with(1);
        let handle = pool.get_connection().unwrap();
        let count: i64 = handle
            .connection()
            .query_row("SELECT COUNT(*) FROM recipes", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
        pool.release_connection(handle);
    }
}
