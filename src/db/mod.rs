use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tokio::task;
use crate::error::{Result, FactgraphError};

/// Pragmas applied to every connection. `busy_timeout` comes first so the
/// remaining pragmas wait instead of failing while another writer holds the lock.
const CONNECTION_PRAGMAS: &str = "PRAGMA busy_timeout = 5000; \
     PRAGMA journal_mode = WAL; \
     PRAGMA synchronous = NORMAL; \
     PRAGMA foreign_keys = ON; \
     PRAGMA temp_store = MEMORY; \
     PRAGMA cache_size = -16384;";

/// Database connection wrapper
///
/// Cheap to clone; each call opens its own connection on the blocking pool so
/// concurrent readers and writers never share a handle.
#[derive(Debug, Clone)]
pub struct Db {
    path: PathBuf,
}

impl Db {
    /// Create a new database connection manager
    pub fn new<P: AsRef<Path>>(db_path: P) -> Self {
        Self {
            path: db_path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a new database connection with the standard pragmas
    pub fn open_connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(CONNECTION_PRAGMAS)?;
        Ok(conn)
    }

    /// Execute a closure with a database connection in a blocking task
    pub async fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        task::spawn_blocking(move || {
            let mut conn = db.open_connection()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| FactgraphError::StoreUnavailable(format!("database task failed: {}", e)))?
    }

    /// Apply all pending schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        self.with_connection(migrate::run_migrations).await
    }
}

pub mod migrate;

/// Fresh migrated database in a temp dir, shared by module tests.
#[cfg(test)]
pub(crate) async fn test_db() -> (Db, tempfile::TempDir) {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let db = Db::new(temp_dir.path().join("test.db"));
    db.migrate().await.unwrap();
    (db, temp_dir)
}
