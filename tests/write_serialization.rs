//! Concurrent write serialization: two coordinators (modelling two
//! processes contending on the advisory lock) each submit N memory
//! writes; every committed row is complete with its sidecars.

use std::sync::Arc;

use hoard::config::Config;
use hoard::memory::store::memory_write;
use hoard::storage::writer::{WriteCoordinator, WriterOptions};
use hoard::storage::Storage;
use hoard::types::{MemoryInput, MemoryType, ScopeType, Sensitivity};

fn input(content: String) -> MemoryInput {
    MemoryInput {
        content,
        memory_type: MemoryType::Observation,
        scope_type: ScopeType::User,
        scope_id: None,
        slot: None,
        tags: vec!["load".to_string()],
        relations: vec![],
        expires_at: None,
        sensitivity: Sensitivity::Normal,
        source_agent: Some("writer".to_string()),
        source_agent_version: None,
        source_session_id: None,
        source_conversation_id: None,
        source_context: None,
    }
}

#[test]
fn concurrent_writers_commit_every_row_completely() {
    const N: usize = 25;

    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("hoard.db");
    let _ = Storage::open(&db_path).unwrap();

    // Two coordinators on the same storage file: each owns its own
    // connection and its own advisory-lock handle, the same shape as
    // two daemon-side processes.
    let first = Arc::new(WriteCoordinator::new(&db_path, WriterOptions::default()).unwrap());
    let second = Arc::new(WriteCoordinator::new(&db_path, WriterOptions::default()).unwrap());

    let mut handles = Vec::new();
    for (label, writer) in [("first", first.clone()), ("second", second.clone())] {
        let writer = writer.clone();
        handles.push(std::thread::spawn(move || {
            let config = Config::default();
            for i in 0..N {
                let content = format!("{} writes entry {}", label, i);
                let config = config.clone();
                writer
                    .submit(move |conn| {
                        memory_write(conn, &input(content), "writer", None, &config).map(|_| ())
                    })
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let storage = Storage::open(&db_path).unwrap();
    storage
        .with_connection(|conn| {
            let memories: i64 =
                conn.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?;
            assert_eq!(memories as usize, 2 * N);

            // no partially written rows: sidecars match the memory count
            let counters: i64 =
                conn.query_row("SELECT COUNT(*) FROM memory_counters", [], |row| row.get(0))?;
            assert_eq!(counters, memories);

            let tagged: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT memory_id) FROM memory_tags",
                [],
                |row| row.get(0),
            )?;
            assert_eq!(tagged, memories);

            let created_events: i64 = conn.query_row(
                "SELECT COUNT(*) FROM memory_events WHERE event_type = 'created'",
                [],
                |row| row.get(0),
            )?;
            assert_eq!(created_events, memories);

            // three jobs per write
            let jobs: i64 =
                conn.query_row("SELECT COUNT(*) FROM background_jobs", [], |row| row.get(0))?;
            assert_eq!(jobs, memories * 3);
            Ok(())
        })
        .unwrap();
}

#[test]
fn second_coordinator_waits_for_long_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("hoard.db");
    let _ = Storage::open(&db_path).unwrap();

    let slow = Arc::new(WriteCoordinator::new(&db_path, WriterOptions::default()).unwrap());
    let fast = Arc::new(WriteCoordinator::new(&db_path, WriterOptions::default()).unwrap());

    let slow_clone = slow.clone();
    let slow_handle = std::thread::spawn(move || {
        slow_clone
            .submit(|conn| {
                conn.execute(
                    "INSERT INTO system_config (key, value, updated_at)
                     VALUES ('slow', '1', 'now')",
                    [],
                )?;
                std::thread::sleep(std::time::Duration::from_millis(300));
                Ok(())
            })
            .unwrap();
    });

    // give the slow writer time to take the lock
    std::thread::sleep(std::time::Duration::from_millis(50));
    let started = std::time::Instant::now();
    fast.submit(|conn| {
        conn.execute(
            "INSERT INTO system_config (key, value, updated_at)
             VALUES ('fast', '1', 'now')",
            [],
        )?;
        Ok(())
    })
    .unwrap();
    // the fast writer had to wait for the advisory lock
    assert!(started.elapsed() >= std::time::Duration::from_millis(200));

    slow_handle.join().unwrap();

    let storage = Storage::open(&db_path).unwrap();
    let count: i64 = storage
        .with_connection(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM system_config WHERE key IN ('slow', 'fast')",
                [],
                |row| row.get(0),
            )?)
        })
        .unwrap();
    assert_eq!(count, 2);
}
