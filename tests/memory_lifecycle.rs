//! Memory lifecycle scenarios: write/query/retract, duplicate and
//! conflict detection, proposals.

use std::path::Path;
use std::sync::Arc;

use serde_json::json;

use hoard::auth::limits::RateLimiter;
use hoard::auth::Principal;
use hoard::config::{Config, DataPaths};
use hoard::embedding::EmbedderRegistry;
use hoard::mcp::ServerState;
use hoard::storage::writer::{WriteCoordinator, WriterOptions};
use hoard::storage::{Storage, StoragePool};
use hoard::worker::{detect_conflicts, detect_duplicates, store_memory_embedding};

fn server_state(data_dir: &Path, config: Config) -> ServerState {
    let paths = DataPaths::resolve(data_dir, &config);
    let _ = Storage::open(&paths.db_path).unwrap();
    ServerState {
        readers: StoragePool::new(&paths.db_path, 2, 5000).unwrap(),
        writer: Arc::new(WriteCoordinator::new(&paths.db_path, WriterOptions::default()).unwrap()),
        limiter: RateLimiter::new(config.security.rate_limits.clone()),
        embedders: Arc::new(EmbedderRegistry::new()),
        config,
        paths,
    }
}

fn write_memory(state: &ServerState, admin: &Principal, content: &str, slot: Option<&str>) -> String {
    let mut arguments = json!({
        "content": content,
        "memory_type": "preference",
        "scope_type": "user",
    });
    if let Some(slot) = slot {
        arguments["slot"] = json!(slot);
    }
    let response = state
        .call_tool("memory.write", &arguments, admin, true)
        .unwrap();
    response["memory"]["id"].as_str().unwrap().to_string()
}

#[test]
fn write_query_retract_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let state = server_state(dir.path(), Config::default());
    let admin = Principal::admin();

    let id = write_memory(&state, &admin, "dark mode", Some("pref:theme"));

    let query = json!({ "slot": "pref:theme" });
    let response = state
        .call_tool("memory.query", &query, &admin, true)
        .unwrap();
    let results = response["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["id"].as_str().unwrap(), id);

    state
        .call_tool("memory.retract", &json!({ "id": id }), &admin, true)
        .unwrap();
    let response = state
        .call_tool("memory.query", &query, &admin, true)
        .unwrap();
    assert!(response["results"].as_array().unwrap().is_empty());

    // the audit view still returns the retracted row
    let fetched = state
        .call_tool("memory.get", &json!({ "id": id }), &admin, true)
        .unwrap();
    assert!(fetched["memory"]["retracted_at"].is_string());
}

#[test]
fn duplicate_detection_clusters_identical_vectors() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.vectors.enabled = true;
    config.vectors.dimensions = 4;
    let state = server_state(dir.path(), config.clone());
    let admin = Principal::admin();

    let earlier = write_memory(&state, &admin, "the user prefers dark mode", None);
    let later = write_memory(&state, &admin, "the user prefers dark mode", None);

    // identical f32[4] embeddings at cosine 1.0
    let vector = [0.5_f32, 0.5, 0.5, 0.5];
    let blob = hoard::embedding::encode_embedding(&vector, 4).unwrap();
    for id in [&earlier, &later] {
        let id = id.clone();
        let blob = blob.clone();
        let (model, version) = (config.vectors.model_name.clone(), config.vectors.model_version.clone());
        state
            .writer
            .submit(move |conn| store_memory_embedding(conn, &id, &blob, &model, &version, 4))
            .unwrap();
    }

    let later_for_job = later.clone();
    let config_for_job = config.clone();
    state
        .writer
        .submit(move |conn| detect_duplicates(conn, &later_for_job, &config_for_job))
        .unwrap();

    let response = state
        .call_tool("memory.duplicates.list", &json!({}), &admin, true)
        .unwrap();
    let clusters = response["duplicates"].as_array().unwrap();
    assert_eq!(clusters.len(), 1);
    let members = clusters[0]["members"].as_array().unwrap();
    assert_eq!(members.len(), 2);
    let canonical: Vec<&str> = members
        .iter()
        .filter(|m| m["is_canonical"].as_bool().unwrap())
        .map(|m| m["memory_id"].as_str().unwrap())
        .collect();
    assert_eq!(canonical, vec![earlier.as_str()]);

    // idempotent: a second run adds no cluster
    let later_for_job = later.clone();
    state
        .writer
        .submit(move |conn| detect_duplicates(conn, &later_for_job, &config))
        .unwrap();
    let response = state
        .call_tool("memory.duplicates.list", &json!({}), &admin, true)
        .unwrap();
    assert_eq!(response["duplicates"].as_array().unwrap().len(), 1);
}

#[test]
fn conflict_detection_groups_slot_writers() {
    let dir = tempfile::tempdir().unwrap();
    let state = server_state(dir.path(), Config::default());
    let admin = Principal::admin();

    let _first = write_memory(&state, &admin, "dark mode", Some("pref:theme"));
    let second = write_memory(&state, &admin, "light mode", Some("pref:theme"));

    state
        .writer
        .submit(move |conn| detect_conflicts(conn, &second).map(|_| ()))
        .unwrap();

    let response = state
        .call_tool("memory.conflicts.list", &json!({}), &admin, true)
        .unwrap();
    let conflicts = response["conflicts"].as_array().unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0]["slot"], json!("pref:theme"));
    assert_eq!(conflicts[0]["members"].as_array().unwrap().len(), 2);

    // a third writer of the slot joins the existing open cluster
    let third = write_memory(&state, &admin, "high contrast", Some("pref:theme"));
    state
        .writer
        .submit(move |conn| detect_conflicts(conn, &third).map(|_| ()))
        .unwrap();
    let response = state
        .call_tool("memory.conflicts.list", &json!({}), &admin, true)
        .unwrap();
    let conflicts = response["conflicts"].as_array().unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0]["members"].as_array().unwrap().len(), 3);

    // resolving closes the cluster
    let conflict_id = conflicts[0]["id"].as_str().unwrap();
    state
        .call_tool(
            "memory.conflicts.resolve",
            &json!({ "id": conflict_id, "resolution": "kept latest" }),
            &admin,
            true,
        )
        .unwrap();
    let response = state
        .call_tool("memory.conflicts.list", &json!({}), &admin, true)
        .unwrap();
    assert!(response["conflicts"].as_array().unwrap().is_empty());
}

#[test]
fn proposal_approval_materialises_memory() {
    let dir = tempfile::tempdir().unwrap();
    let state = server_state(dir.path(), Config::default());
    let admin = Principal::admin();

    let proposal = state
        .call_tool(
            "memory.propose",
            &json!({
                "memory": {
                    "content": "the project uses sqlite",
                    "memory_type": "fact",
                    "scope_type": "user",
                },
                "ttl_days": 3,
            }),
            &admin,
            true,
        )
        .unwrap();
    let proposal_id = proposal["proposal"]["id"].as_str().unwrap();
    assert_eq!(proposal["proposal"]["status"], json!("pending"));

    let outcome = state
        .call_tool(
            "memory.review",
            &json!({ "id": proposal_id, "approved": true }),
            &admin,
            true,
        )
        .unwrap();
    assert_eq!(outcome["status"], json!("approved"));
    let memory_id = outcome["memory"]["id"].as_str().unwrap();

    let fetched = state
        .call_tool("memory.get", &json!({ "id": memory_id }), &admin, true)
        .unwrap();
    assert_eq!(
        fetched["memory"]["content"],
        json!("the project uses sqlite")
    );
}

#[test]
fn supersession_hides_old_memory_from_queries() {
    let dir = tempfile::tempdir().unwrap();
    let state = server_state(dir.path(), Config::default());
    let admin = Principal::admin();

    let old = write_memory(&state, &admin, "the api key lives in .env", None);
    let new = write_memory(&state, &admin, "the api key lives in the keychain", None);

    state
        .call_tool(
            "memory.supersede",
            &json!({ "id": old, "superseded_by": new }),
            &admin,
            true,
        )
        .unwrap();

    let response = state
        .call_tool(
            "memory.query",
            &json!({ "query": "api key" }),
            &admin,
            true,
        )
        .unwrap();
    let results = response["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0]["content"]
        .as_str()
        .unwrap()
        .contains("keychain"));
}
