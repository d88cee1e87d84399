//! `DuckDB` connection pooling.
//!
//! Every connection is a clone of one root connection, so all of them share a
//! single database instance and see each other's committed writes. Connections
//! are kept per access mode and handed out as [`PooledConnection`] guards that
//! return themselves to the idle list on drop. A sync run releases every idle
//! connection through [`DuckDbConnectionManager::release_idle`] when it
//! finishes.

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ::duckdb::Connection;

/// Access mode for database connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Read-only access.
    ReadOnly,
    /// Read-write access.
    ReadWrite,
}

impl AccessMode {
    const fn slot(self) -> usize {
        match self {
            Self::ReadOnly => 0,
            Self::ReadWrite => 1,
        }
    }
}

struct PoolInner {
    db_path: PathBuf,
    max_idle: usize,
    root: Mutex<Option<Connection>>,
    idle: Mutex<[Vec<Connection>; 2]>,
}

/// Connection pool for a single `DuckDB` database file.
#[derive(Clone)]
pub struct DuckDbConnectionManager {
    inner: Arc<PoolInner>,
}

impl DuckDbConnectionManager {
    /// Create a pool for `path` keeping at most `max_idle` idle connections per mode.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, max_idle: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                db_path: path.into(),
                max_idle: max_idle.max(1),
                root: Mutex::new(None),
                idle: Mutex::new([Vec::new(), Vec::new()]),
            }),
        }
    }

    /// Take an idle connection for `mode`, opening a new one when none is idle.
    ///
    /// # Errors
    /// Returns an error if the database file cannot be opened or configured.
    ///
    /// # Panics
    /// Panics if the pool mutex is poisoned.
    pub fn acquire(&self, mode: AccessMode) -> Result<PooledConnection, ::duckdb::Error> {
        let reused = self
            .inner
            .idle
            .lock()
            .expect("duckdb connection pool mutex poisoned")[mode.slot()]
        .pop();

        let connection = match reused {
            Some(connection) => connection,
            None => self.open_connection()?,
        };

        Ok(PooledConnection {
            mode,
            pool: Arc::clone(&self.inner),
            connection: Some(connection),
        })
    }

    /// Number of idle connections currently held for `mode`.
    ///
    /// # Panics
    /// Panics if the pool mutex is poisoned.
    #[must_use]
    pub fn idle_count(&self, mode: AccessMode) -> usize {
        self.inner
            .idle
            .lock()
            .expect("duckdb connection pool mutex poisoned")[mode.slot()]
        .len()
    }

    /// Close every idle connection and the root handle. Connections currently
    /// checked out are unaffected and return to the pool when dropped.
    ///
    /// # Panics
    /// Panics if the pool mutex is poisoned.
    pub fn release_idle(&self) {
        let mut idle = self
            .inner
            .idle
            .lock()
            .expect("duckdb connection pool mutex poisoned");
        for slot in idle.iter_mut() {
            slot.clear();
        }
        drop(idle);

        self.inner
            .root
            .lock()
            .expect("duckdb root connection mutex poisoned")
            .take();
    }

    fn open_connection(&self) -> Result<Connection, ::duckdb::Error> {
        let mut root = self
            .inner
            .root
            .lock()
            .expect("duckdb root connection mutex poisoned");
        if let Some(connection) = root.as_ref() {
            return connection.try_clone();
        }

        let connection = Connection::open(self.inner.db_path.as_path())?;
        connection.execute_batch("PRAGMA disable_progress_bar;")?;
        let handle = connection.try_clone()?;
        *root = Some(connection);
        Ok(handle)
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        self.inner.db_path.as_path()
    }
}

/// A pooled connection that returns to the pool when dropped.
pub struct PooledConnection {
    mode: AccessMode,
    pool: Arc<PoolInner>,
    connection: Option<Connection>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.connection
            .as_ref()
            .expect("pooled connection unexpectedly missing")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };

        let mut idle = self
            .pool
            .idle
            .lock()
            .expect("duckdb connection pool mutex poisoned");
        let slot = &mut idle[self.mode.slot()];
        if slot.len() < self.pool.max_idle {
            slot.push(connection);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn connections_return_to_their_mode_slot() {
        let temp = tempdir().expect("tempdir");
        let manager = DuckDbConnectionManager::new(temp.path().join("pool.duckdb"), 2);

        {
            let _writer = manager.acquire(AccessMode::ReadWrite).expect("writer");
        }

        assert_eq!(manager.idle_count(AccessMode::ReadWrite), 1);
        assert_eq!(manager.idle_count(AccessMode::ReadOnly), 0);

        manager.release_idle();
        assert_eq!(manager.idle_count(AccessMode::ReadWrite), 0);
    }
}
