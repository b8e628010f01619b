//! End-to-end ingest and search: filesystem connector -> sync ->
//! hybrid search through the tool dispatcher.

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};

use hoard::auth::limits::RateLimiter;
use hoard::auth::Principal;
use hoard::config::{Config, ConnectorSettings, DataPaths};
use hoard::embedding::EmbedderRegistry;
use hoard::mcp::ServerState;
use hoard::storage::writer::{WriteCoordinator, WriterOptions};
use hoard::storage::{Storage, StoragePool};

fn server_state(data_dir: &Path, mut config: Config) -> ServerState {
    let paths = DataPaths::resolve(data_dir, &config);
    let _ = Storage::open(&paths.db_path).unwrap();
    config.storage.db_path = Some(paths.db_path.display().to_string());

    ServerState {
        readers: StoragePool::new(&paths.db_path, 2, 5000).unwrap(),
        writer: Arc::new(WriteCoordinator::new(&paths.db_path, WriterOptions::default()).unwrap()),
        limiter: RateLimiter::new(config.security.rate_limits.clone()),
        embedders: Arc::new(EmbedderRegistry::new()),
        config,
        paths,
    }
}

fn local_files_config(docs_dir: &Path) -> Config {
    let mut config = Config::default();
    let mut settings = ConnectorSettings {
        enabled: true,
        ..Default::default()
    };
    settings.extra.insert(
        "paths".to_string(),
        json!([docs_dir.display().to_string()]),
    );
    config.connectors.insert("local_files".to_string(), settings);
    config
}

#[test]
fn sync_then_search_finds_document() {
    let dir = tempfile::tempdir().unwrap();
    let docs = dir.path().join("data");
    std::fs::create_dir_all(&docs).unwrap();
    std::fs::write(docs.join("note.md"), "Hoard search test").unwrap();

    let state = server_state(dir.path(), local_files_config(&docs));
    let admin = Principal::admin();

    let report = state
        .call_tool("ingest.sync", &json!({}), &admin, true)
        .unwrap();
    let connectors = report["connectors"].as_array().unwrap();
    assert_eq!(connectors.len(), 1);
    assert_eq!(connectors[0]["stats"]["entities_seen"], json!(1));

    let response = state
        .call_tool(
            "data.search",
            &json!({ "query": "Hoard", "limit": 1 }),
            &admin,
            true,
        )
        .unwrap();
    let results = response["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    let content = results[0]["chunks"][0]["content"].as_str().unwrap();
    assert!(content.contains("Hoard search test"));
    assert_eq!(response["next_cursor"], Value::Null);
}

#[test]
fn missing_file_is_tombstoned_then_revived() {
    let dir = tempfile::tempdir().unwrap();
    let docs = dir.path().join("data");
    std::fs::create_dir_all(&docs).unwrap();
    for name in ["a.md", "b.md", "c.md"] {
        std::fs::write(docs.join(name), format!("document {}", name)).unwrap();
    }

    let state = server_state(dir.path(), local_files_config(&docs));
    let admin = Principal::admin();

    state
        .call_tool("ingest.sync", &json!({}), &admin, true)
        .unwrap();

    // b disappears from the source
    std::fs::remove_file(docs.join("b.md")).unwrap();
    let report = state
        .call_tool("ingest.sync", &json!({}), &admin, true)
        .unwrap();
    assert_eq!(
        report["connectors"][0]["stats"]["entities_tombstoned"],
        json!(1)
    );

    let tombstones = state
        .readers
        .with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT source_id, tombstoned_at IS NOT NULL FROM entities ORDER BY source_id",
            )?;
            let rows: Vec<(String, bool)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .unwrap();
    assert_eq!(tombstones.len(), 3);
    for (source_id, tombstoned) in &tombstones {
        let expect = source_id.ends_with("b.md");
        assert_eq!(
            *tombstoned, expect,
            "unexpected tombstone state for {}",
            source_id
        );
    }

    // the file comes back and the tombstone clears
    std::fs::write(docs.join("b.md"), "document b.md").unwrap();
    state
        .call_tool("ingest.sync", &json!({}), &admin, true)
        .unwrap();
    let remaining: i64 = state
        .readers
        .with_connection(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM entities WHERE tombstoned_at IS NOT NULL",
                [],
                |row| row.get(0),
            )?)
        })
        .unwrap();
    assert_eq!(remaining, 0);
}

#[test]
fn tombstoned_documents_disappear_from_search() {
    let dir = tempfile::tempdir().unwrap();
    let docs = dir.path().join("data");
    std::fs::create_dir_all(&docs).unwrap();
    std::fs::write(docs.join("note.md"), "Hoard search test").unwrap();

    let state = server_state(dir.path(), local_files_config(&docs));
    let admin = Principal::admin();

    state
        .call_tool("ingest.sync", &json!({}), &admin, true)
        .unwrap();
    std::fs::remove_file(docs.join("note.md")).unwrap();
    state
        .call_tool("ingest.sync", &json!({}), &admin, true)
        .unwrap();

    let response = state
        .call_tool(
            "data.search",
            &json!({ "query": "Hoard", "limit": 5 }),
            &admin,
            true,
        )
        .unwrap();
    assert!(response["results"].as_array().unwrap().is_empty());
}

#[test]
fn get_entity_and_chunk_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let docs = dir.path().join("data");
    std::fs::create_dir_all(&docs).unwrap();
    std::fs::write(docs.join("note.md"), "Hoard search test").unwrap();

    let state = server_state(dir.path(), local_files_config(&docs));
    let admin = Principal::admin();

    state
        .call_tool("ingest.sync", &json!({}), &admin, true)
        .unwrap();
    let search = state
        .call_tool(
            "data.search",
            &json!({ "query": "Hoard", "limit": 1 }),
            &admin,
            true,
        )
        .unwrap();
    let entity_id = search["results"][0]["entity_id"].as_str().unwrap();
    let chunk_id = search["results"][0]["chunks"][0]["chunk_id"]
        .as_str()
        .unwrap();

    let entity = state
        .call_tool("data.get", &json!({ "entity_id": entity_id }), &admin, true)
        .unwrap();
    assert_eq!(entity["entity"]["source"], json!("local_files"));
    assert_eq!(entity["entity"]["chunks"].as_array().unwrap().len(), 1);

    let chunk = state
        .call_tool(
            "data.get_chunk",
            &json!({ "chunk_id": chunk_id, "context_chunks": 1 }),
            &admin,
            true,
        )
        .unwrap();
    assert_eq!(
        chunk["chunk"]["content"].as_str().unwrap(),
        "Hoard search test"
    );
}

#[test]
fn embeddings_build_then_hybrid_search() {
    let dir = tempfile::tempdir().unwrap();
    let docs = dir.path().join("data");
    std::fs::create_dir_all(&docs).unwrap();
    std::fs::write(docs.join("note.md"), "Hoard hybrid retrieval exercise").unwrap();

    let mut config = local_files_config(&docs);
    config.vectors.enabled = true;
    config.vectors.dimensions = 64;
    let state = server_state(dir.path(), config);
    let admin = Principal::admin();

    state
        .call_tool("ingest.sync", &json!({}), &admin, true)
        .unwrap();
    let built = state
        .call_tool("ingest.embeddings.build", &json!({}), &admin, true)
        .unwrap();
    assert_eq!(built["built"], json!(1));

    let response = state
        .call_tool(
            "data.search",
            &json!({ "query": "hybrid retrieval", "limit": 5 }),
            &admin,
            true,
        )
        .unwrap();
    let chunk = &response["results"][0]["chunks"][0];
    assert!(chunk["bm25_score"].is_number());
    assert!(chunk["vector_score"].is_number());
}
