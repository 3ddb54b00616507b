//! SQLite connection pool for one namespace
//!
//! Thin wrapper over an r2d2 pool that adds a close switch: once closed,
//! the r2d2 pool is released and every checkout fails.

use crate::error::{NodeError, Result};
use parking_lot::RwLock;
use r2d2::ManageConnection;
use r2d2_sqlite::SqliteConnectionManager;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const MAX_CONNECTIONS: u32 = 4;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const PRAGMAS: &str = "PRAGMA journal_mode=WAL;
     PRAGMA synchronous=NORMAL;
     PRAGMA foreign_keys=ON;";

/// A connection checked out of a [`Pool`], returned on drop
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Cloneable handle to a pool of connections on one database file
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    namespace: String,
    path: PathBuf,
    /// `None` once closed
    pool: RwLock<Option<r2d2::Pool<SqliteConnectionManager>>>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("namespace", &self.inner.namespace)
            .field("path", &self.inner.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Pool {
    /// Open a pool. A first connection is made directly so a bad path
    /// fails here with the SQLite error.
    pub fn open(namespace: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let manager =
            SqliteConnectionManager::file(&path).with_init(|conn| conn.execute_batch(PRAGMAS));
        drop(manager.connect()?);

        let pool = r2d2::Pool::builder()
            .max_size(MAX_CONNECTIONS)
            .connection_timeout(CONNECT_TIMEOUT)
            .build(manager)?;

        Ok(Self {
            inner: Arc::new(PoolInner {
                namespace: namespace.into(),
                path,
                pool: RwLock::new(Some(pool)),
            }),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Check out a connection
    pub fn get(&self) -> Result<PooledConnection> {
        let pool = self.inner.pool.read().clone().ok_or_else(|| {
            NodeError::Connection(format!("pool for {} is closed", self.inner.namespace))
        })?;
        Ok(pool.get()?)
    }

    /// Prove a connection can reach the database
    pub fn ping(&self) -> Result<()> {
        let conn = self.get()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    /// Close the pool; checked-out connections are dropped on return
    pub fn close(&self) {
        self.inner.pool.write().take();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pool.read().is_none()
    }

    /// Whether both handles refer to the same underlying pool
    pub fn ptr_eq(&self, other: &Pool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_pool_ping_and_close() {
        let temp = tempdir().unwrap();
        let pool = Pool::open("model", temp.path().join("model.db")).unwrap();

        pool.ping().unwrap();
        assert!(!pool.is_closed());

        pool.close();
        assert!(pool.is_closed());
        assert!(matches!(pool.ping(), Err(NodeError::Connection(_))));
        // Closing twice is harmless
        pool.close();
        assert!(pool.clone().is_closed());
    }

    #[test]
    fn test_connections_share_the_database() {
        let temp = tempdir().unwrap();
        let pool = Pool::open("model", temp.path().join("model.db")).unwrap();

        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        a.execute_batch("CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (7);")
            .unwrap();
        let v: i64 = b.query_row("SELECT v FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(v, 7);
    }

    #[test]
    fn test_connections_use_wal_and_foreign_keys() {
        let temp = tempdir().unwrap();
        let pool = Pool::open("model", temp.path().join("model.db")).unwrap();
        let conn = pool.get().unwrap();

        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |r| r.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        let fk: i64 = conn.query_row("PRAGMA foreign_keys", [], |r| r.get(0)).unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn test_clones_are_the_same_pool() {
        let temp = tempdir().unwrap();
        let pool = Pool::open("model", temp.path().join("model.db")).unwrap();
        let other = Pool::open("model", temp.path().join("model.db")).unwrap();

        assert!(pool.ptr_eq(&pool.clone()));
        assert!(!pool.ptr_eq(&other));
    }

    #[test]
    fn test_open_fails_for_missing_directory() {
        let temp = tempdir().unwrap();
        let result = Pool::open("model", temp.path().join("missing/model.db"));
        assert!(matches!(result, Err(NodeError::Database(_))));
    }
}
