//! Shared SQLite connection handling for the persistence layer.
//!
//! rusqlite is blocking; every call is bounced through
//! `tokio::task::spawn_blocking` so the async runtime's worker threads never
//! stall on disk I/O. A single connection is shared behind a mutex — the
//! spec requires one writer, many concurrent readers, and WAL mode gives us
//! that without a separate reader pool.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::error::EngineError;

/// A cloneable handle to a single shared SQLite connection.
#[derive(Clone)]
pub struct SqliteHandle {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteHandle {
    /// Open (or create) the database file at `path` and enable WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let conn = Connection::open(path).map_err(|e| EngineError::Internal(e.to_string()))?;
        Self::configure(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a private in-memory database. Useful for tests.
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn =
            Connection::open_in_memory().map_err(|e| EngineError::Internal(e.to_string()))?;
        Self::configure(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn configure(conn: &Connection) -> Result<(), EngineError> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        Ok(())
    }

    /// Run `f` against the connection on a blocking-pool thread.
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection) -> Result<T, EngineError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await
        .map_err(|e| EngineError::Internal(format!("blocking task panicked: {e}")))?
    }

    /// Run `f` with mutable access — used for schema migrations.
    pub async fn with_conn_mut<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&mut Connection) -> Result<T, EngineError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| EngineError::Internal(format!("blocking task panicked: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn executes_statement_on_blocking_pool() {
        let handle = SqliteHandle::open_in_memory().unwrap();
        handle
            .with_conn(|conn| {
                conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY)")
                    .map_err(EngineError::from)
            })
            .await
            .unwrap();

        let count: i64 = handle
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
                    .map_err(EngineError::from)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
