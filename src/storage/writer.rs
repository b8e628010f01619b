//! Single-writer coordinator
//!
//! Serialises all database writes through one worker thread owning one
//! connection, and holds the cross-process `<db>.lock` advisory lock
//! around each write transaction so concurrent processes (a second
//! daemon's tooling, background sync) are serialised too.
//!
//! Each submitted closure runs inside `BEGIN IMMEDIATE` .. `COMMIT`;
//! a closure error rolls back and surfaces to the caller. A closure
//! that calls `submit` again from the worker thread executes inline,
//! joining the outer transaction without re-locking.

use std::cell::RefCell;
use std::path::Path;
use std::sync::mpsc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use rusqlite::Connection;
use tracing::{error, warn};

use crate::error::{HoardError, Result};
use crate::storage::lock::WriteLock;
use crate::storage::open_connection;

thread_local! {
    static WRITER_CONN: RefCell<Option<Connection>> = const { RefCell::new(None) };
}

type Task = Box<dyn FnOnce(std::result::Result<&Connection, HoardError>) + Send>;

enum Command {
    Run(Task),
    Stop,
}

/// Options for the coordinator's connection and lock behaviour
#[derive(Debug, Clone)]
pub struct WriterOptions {
    pub busy_timeout_ms: u64,
    pub lock_timeout_ms: u64,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5000,
            lock_timeout_ms: 30_000,
        }
    }
}

/// Entry point for all mutations of the storage file
pub struct WriteCoordinator {
    sender: mpsc::Sender<Command>,
    handle: Option<JoinHandle<()>>,
    writer_thread: ThreadId,
}

impl WriteCoordinator {
    /// Spawn the worker thread and open its connection.
    pub fn new(db_path: &Path, options: WriterOptions) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Command>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();

        let path = db_path.to_path_buf();
        let handle = thread::Builder::new()
            .name("hoard-writer".to_string())
            .spawn(move || {
                let conn = match open_connection(&path, options.busy_timeout_ms) {
                    Ok(conn) => conn,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                WRITER_CONN.with(|cell| *cell.borrow_mut() = Some(conn));
                let _ = ready_tx.send(Ok(()));

                let mut lock =
                    WriteLock::new(&path, Duration::from_millis(options.lock_timeout_ms));

                while let Ok(command) = receiver.recv() {
                    match command {
                        Command::Run(task) => match lock.acquire() {
                            Ok(()) => {
                                WRITER_CONN.with(|cell| {
                                    let conn = cell.borrow();
                                    task(Ok(conn.as_ref().expect("writer connection installed")));
                                });
                                lock.release();
                            }
                            Err(e) => task(Err(e)),
                        },
                        Command::Stop => break,
                    }
                }

                WRITER_CONN.with(|cell| {
                    cell.borrow_mut().take();
                });
            })
            .map_err(|e| HoardError::Internal(format!("spawn writer thread: {}", e)))?;

        ready_rx
            .recv()
            .map_err(|_| HoardError::Internal("writer thread exited during startup".into()))??;

        Ok(Self {
            sender,
            writer_thread: handle.thread().id(),
            handle: Some(handle),
        })
    }

    /// Execute a write closure on the worker thread, atomically.
    ///
    /// Observable order across calls is the order in which `submit`
    /// returns to callers.
    pub fn submit<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if thread::current().id() == self.writer_thread {
            // Reentrant call from inside a running write closure: run
            // inline, joining the outer transaction.
            return WRITER_CONN.with(|cell| {
                let conn = cell.borrow();
                let conn = conn
                    .as_ref()
                    .ok_or_else(|| HoardError::Internal("writer connection unavailable".into()))?;
                f(conn)
            });
        }

        let (tx, rx) = mpsc::channel::<Result<T>>();
        let task: Task = Box::new(move |conn_result| {
            let outcome = conn_result.and_then(|conn| run_in_transaction(conn, f));
            let _ = tx.send(outcome);
        });

        self.sender
            .send(Command::Run(task))
            .map_err(|_| HoardError::Internal("write coordinator is stopped".into()))?;
        rx.recv()
            .map_err(|_| HoardError::Internal("write coordinator dropped the task".into()))?
    }

    /// Drain the queue, close the connection, release the lock.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.sender.send(Command::Stop);
            if handle.join().is_err() {
                error!("writer thread panicked during shutdown");
            }
        }
    }
}

impl Drop for WriteCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_in_transaction<T, F>(conn: &Connection, f: F) -> Result<T>
where
    F: FnOnce(&Connection) -> Result<T>,
{
    conn.execute_batch("BEGIN IMMEDIATE")?;
    match f(conn) {
        Ok(value) => {
            if !conn.is_autocommit() {
                conn.execute_batch("COMMIT")?;
            }
            Ok(value)
        }
        Err(e) => {
            if !conn.is_autocommit() {
                if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                    warn!(error = %rollback_err, "rollback failed after write error");
                }
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn setup() -> (tempfile::TempDir, std::path::PathBuf, WriteCoordinator) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("hoard.db");
        // Migrate via a throwaway connection first.
        let _ = Storage::open(&db_path).unwrap();
        let writer = WriteCoordinator::new(&db_path, WriterOptions::default()).unwrap();
        (dir, db_path, writer)
    }

    #[test]
    fn test_submit_commits() {
        let (_dir, db_path, writer) = setup();
        writer
            .submit(|conn| {
                conn.execute(
                    "INSERT INTO system_config (key, value, updated_at) VALUES ('k', 'v', 'now')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        let storage = Storage::open(&db_path).unwrap();
        let value: String = storage
            .with_connection(|conn| {
                Ok(conn.query_row(
                    "SELECT value FROM system_config WHERE key = 'k'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(value, "v");
    }

    #[test]
    fn test_failed_closure_rolls_back() {
        let (_dir, db_path, writer) = setup();
        let result: Result<()> = writer.submit(|conn| {
            conn.execute(
                "INSERT INTO system_config (key, value, updated_at) VALUES ('gone', 'v', 'now')",
                [],
            )?;
            Err(HoardError::Validation("abort".into()))
        });
        assert!(result.is_err());

        let storage = Storage::open(&db_path).unwrap();
        let count: i64 = storage
            .with_connection(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM system_config WHERE key = 'gone'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_writes_are_serialised() {
        let (_dir, db_path, writer) = setup();
        let writer = std::sync::Arc::new(writer);
        let mut handles = Vec::new();
        for i in 0..8 {
            let writer = writer.clone();
            handles.push(std::thread::spawn(move || {
                writer
                    .submit(move |conn| {
                        conn.execute(
                            "INSERT INTO system_config (key, value, updated_at)
                             VALUES (?1, 'v', 'now')",
                            [format!("key-{}", i)],
                        )?;
                        Ok(())
                    })
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let storage = Storage::open(&db_path).unwrap();
        let count: i64 = storage
            .with_connection(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM system_config WHERE key LIKE 'key-%'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(count, 8);
    }
}
