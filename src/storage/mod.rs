//! SQLite storage engine with WAL mode and a bounded reader pool
//!
//! One writer connection lives inside the [`writer::WriteCoordinator`];
//! readers use independent connections (WAL readers never block).

pub mod audit;
pub mod lock;
pub mod migrations;
pub mod writer;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};

use crate::error::{HoardError, Result};

/// Minimum SQLite version: upsert and partial indexes landed in 3.24.
const MIN_SQLITE_VERSION: i32 = 3_024_000;

/// Default busy-wait timeout while a writer commits
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

/// A single read connection to the storage file
pub struct Storage {
    db_path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

/// Bounded reader pool handing out connections round-robin
pub struct StoragePool {
    pool: Vec<Arc<Mutex<Connection>>>,
    next: AtomicUsize,
}

impl Storage {
    /// Open (or create) the storage file and run pending migrations.
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = open_connection(db_path, DEFAULT_BUSY_TIMEOUT_MS)?;
        migrations::migrate(&conn, None)?;
        Ok(Self {
            db_path: db_path.to_path_buf(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open without running migrations (the caller already migrated).
    pub fn open_existing(db_path: &Path, busy_timeout_ms: u64) -> Result<Self> {
        let conn = open_connection(db_path, busy_timeout_ms)?;
        Ok(Self {
            db_path: db_path.to_path_buf(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        configure_pragmas(&conn, DEFAULT_BUSY_TIMEOUT_MS)?;
        migrations::migrate(&conn, None)?;
        Ok(Self {
            db_path: PathBuf::from(":memory:"),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Execute a function with the read connection
    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            db_path: self.db_path.clone(),
            conn: self.conn.clone(),
        }
    }
}

impl StoragePool {
    /// Open `pool_size` independent reader connections.
    pub fn new(db_path: &Path, pool_size: usize, busy_timeout_ms: u64) -> Result<Self> {
        let mut pool = Vec::with_capacity(pool_size);
        for _ in 0..pool_size.max(1) {
            let conn = open_connection(db_path, busy_timeout_ms)?;
            pool.push(Arc::new(Mutex::new(conn)));
        }
        Ok(Self {
            pool,
            next: AtomicUsize::new(0),
        })
    }

    /// Execute a function with a pooled connection (round-robin)
    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        let conn = self.pool[idx].lock();
        f(&conn)
    }
}

/// Open a connection with the standard pragmas applied
pub fn open_connection(db_path: &Path, busy_timeout_ms: u64) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(db_path, flags)?;
    assert_engine_version(&conn)?;
    configure_pragmas(&conn, busy_timeout_ms)?;
    Ok(conn)
}

/// WAL journaling, relaxed sync, foreign keys, busy timeout
fn configure_pragmas(conn: &Connection, busy_timeout_ms: u64) -> Result<()> {
    conn.execute_batch(&format!(
        "PRAGMA journal_mode=WAL;\n\
         PRAGMA synchronous=NORMAL;\n\
         PRAGMA foreign_keys=ON;\n\
         PRAGMA busy_timeout={};",
        busy_timeout_ms
    ))?;
    Ok(())
}

/// Reject engines too old for upsert and partial indexes
fn assert_engine_version(_conn: &Connection) -> Result<()> {
    let version = rusqlite::version_number();
    if version < MIN_SQLITE_VERSION {
        return Err(HoardError::Storage(format!(
            "SQLite {} is too old; need at least 3.24 for upsert and partial indexes",
            rusqlite::version()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory() {
        let storage = Storage::open_in_memory().unwrap();
        let count: i64 = storage
            .with_connection(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_open_on_disk_and_pool() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("hoard.db");
        let _storage = Storage::open(&db_path).unwrap();

        let pool = StoragePool::new(&db_path, 4, DEFAULT_BUSY_TIMEOUT_MS).unwrap();
        for _ in 0..8 {
            let one: i64 = pool
                .with_connection(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get(0))?))
                .unwrap();
            assert_eq!(one, 1);
        }
    }

    #[test]
    fn test_wal_mode_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("hoard.db");
        let storage = Storage::open(&db_path).unwrap();
        let mode: String = storage
            .with_connection(|conn| Ok(conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
