//! Cross-process advisory locks for serialising database writes
//!
//! Two lock files sit next to the database:
//!
//! * `<db>.lock` - write lock, held for the duration of each write
//!   transaction. Prevents two processes from writing concurrently.
//! * `<db>.server` - server singleton lock, held for the whole life of
//!   a daemon process. Prevents two daemons on the same database file.
//!
//! They use distinct files so the daemon can hold the singleton and
//! still take per-transaction write locks. Readers never take either
//! lock; WAL mode guarantees non-blocking reads.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::{HoardError, Result};

const ACQUIRE_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// flock(2)-based advisory lock on a sidecar file
#[derive(Debug)]
pub struct AdvisoryLock {
    lock_path: PathBuf,
    file: Option<File>,
}

impl AdvisoryLock {
    pub fn new(lock_path: PathBuf) -> Self {
        Self {
            lock_path,
            file: None,
        }
    }

    /// Blocking acquire with a deadline. Polls non-blocking so a
    /// timeout can surface as a distinguished error.
    pub fn acquire(&mut self, timeout: Duration) -> Result<()> {
        let file = self.open_lock_file()?;
        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    self.file = Some(file);
                    return Ok(());
                }
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(ACQUIRE_RETRY_INTERVAL);
                }
                Err(_) => {
                    return Err(HoardError::LockTimeout {
                        path: self.lock_path.display().to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
            }
        }
    }

    /// Non-blocking acquire; returns false when another process holds it
    pub fn try_acquire(&mut self) -> Result<bool> {
        let file = self.open_lock_file()?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                self.file = Some(file);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = file.unlock();
        }
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    fn open_lock_file(&self) -> Result<File> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.lock_path)?)
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Exclusive write lock on `<db>.lock`, taken per write transaction
pub struct WriteLock {
    inner: AdvisoryLock,
    timeout: Duration,
}

impl WriteLock {
    pub fn new(db_path: &Path, timeout: Duration) -> Self {
        Self {
            inner: AdvisoryLock::new(sidecar_path(db_path, "lock")),
            timeout,
        }
    }

    pub fn acquire(&mut self) -> Result<()> {
        self.inner.acquire(self.timeout)
    }

    pub fn release(&mut self) {
        self.inner.release()
    }
}

/// Daemon singleton lock on `<db>.server`, held for the process lifetime
#[derive(Debug)]
pub struct ServerLock {
    inner: AdvisoryLock,
}

impl ServerLock {
    /// Acquire non-blocking or fail with an operator-readable message.
    pub fn acquire(db_path: &Path) -> Result<Self> {
        let mut inner = AdvisoryLock::new(sidecar_path(db_path, "server"));
        if !inner.try_acquire()? {
            return Err(HoardError::Lock(
                "Another hoard server is already running on this database.\n\
                 Only one server may write to a database at a time.\n\
                 Stop the other process first, or use a different storage.db_path."
                    .to_string(),
            ));
        }
        Ok(Self { inner })
    }

    pub fn is_held(&self) -> bool {
        self.inner.is_held()
    }
}

fn sidecar_path(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "hoard.db".to_string());
    name.push('.');
    name.push_str(suffix);
    db_path.with_file_name(name)
}
