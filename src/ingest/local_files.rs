//! Built-in filesystem connector
//!
//! Walks configured paths recursively, emitting one document entity
//! per readable file with token-window chunks.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::config::ConnectorSettings;
use crate::error::{HoardError, Result};
use crate::ingest::chunking::chunk_text;
use crate::ingest::store::compute_content_hash;
use crate::ingest::{Connector, ScanStream};
use crate::types::{ChunkInput, Discovery, EntityInput};

pub struct LocalFilesConnector;

const NAME: &str = "local_files";
const VERSION: &str = "0.1.0";

impl Connector for LocalFilesConnector {
    fn name(&self) -> &'static str {
        NAME
    }

    fn version(&self) -> &'static str {
        VERSION
    }

    fn source_name(&self) -> &'static str {
        NAME
    }

    fn discover(&self, settings: &ConnectorSettings) -> Discovery {
        let paths = configured_paths(settings);
        if paths.is_empty() {
            return Discovery::failed("No paths configured");
        }
        let missing: Vec<String> = paths
            .iter()
            .filter(|p| !p.exists())
            .map(|p| p.display().to_string())
            .collect();
        if !missing.is_empty() {
            return Discovery::failed(format!("Missing paths: {}", missing.join(", ")));
        }
        let files = collect_files(&paths, &include_extensions(settings));
        Discovery::ok(
            format!("Found {} files", files.len()),
            Some(files.len() as u64),
        )
    }

    fn scan(&self, settings: &ConnectorSettings) -> Result<ScanStream> {
        let paths = configured_paths(settings);
        if paths.is_empty() {
            return Err(HoardError::Connector(
                "local_files: no paths configured".to_string(),
            ));
        }
        let files = collect_files(&paths, &include_extensions(settings));
        let chunk_params = chunk_params(settings);

        Ok(Box::new(files.into_iter().filter_map(move |path| {
            scan_file(&path, chunk_params).transpose()
        })))
    }
}

fn scan_file(
    path: &Path,
    (max_tokens, overlap_tokens): (usize, usize),
) -> Result<Option<(EntityInput, Vec<ChunkInput>)>> {
    // Unreadable files are skipped, not fatal to the scan.
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => return Ok(None),
    };

    let (created_at, updated_at) = file_times(path);
    let extension_tag = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase());

    let entity = EntityInput {
        source: NAME.to_string(),
        source_id: path.display().to_string(),
        entity_type: "document".to_string(),
        title: path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned()),
        uri: Some(format!("file://{}", path.display())),
        tags: extension_tag.into_iter().collect(),
        content_hash: Some(compute_content_hash(&content)),
        connector_name: Some(NAME.to_string()),
        connector_version: Some(VERSION.to_string()),
        created_at,
        updated_at,
        ..Default::default()
    };

    let chunks = chunk_text(&content, max_tokens, overlap_tokens)
        .into_iter()
        .map(|span| ChunkInput {
            content: span.text,
            char_offset_start: Some(span.start as i64),
            char_offset_end: Some(span.end as i64),
            chunk_type: "semantic".to_string(),
        })
        .collect();

    Ok(Some((entity, chunks)))
}

pub(crate) fn configured_paths(settings: &ConnectorSettings) -> Vec<PathBuf> {
    settings
        .get_str_list("paths")
        .into_iter()
        .map(|raw| PathBuf::from(shellexpand::tilde(&raw).into_owned()))
        .collect()
}

pub(crate) fn include_extensions(settings: &ConnectorSettings) -> Vec<String> {
    settings
        .get_str_list("include_extensions")
        .into_iter()
        .map(|ext| ext.to_lowercase())
        .collect()
}

pub(crate) fn chunk_params(settings: &ConnectorSettings) -> (usize, usize) {
    let max_tokens = settings
        .extra
        .get("chunk_max_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(400) as usize;
    let overlap = settings
        .extra
        .get("chunk_overlap_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(50) as usize;
    (max_tokens, overlap)
}

pub(crate) fn collect_files(paths: &[PathBuf], include_exts: &[String]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for base in paths {
        if base.is_file() {
            if extension_allowed(base, include_exts) {
                files.push(base.clone());
            }
            continue;
        }
        walk_dir(base, include_exts, &mut files);
    }
    files.sort();
    files
}

fn walk_dir(dir: &Path, include_exts: &[String], files: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk_dir(&path, include_exts, files);
        } else if path.is_file() && extension_allowed(&path, include_exts) {
            files.push(path);
        }
    }
}

fn extension_allowed(path: &Path, include_exts: &[String]) -> bool {
    if include_exts.is_empty() {
        return true;
    }
    path.extension()
        .map(|ext| include_exts.contains(&format!(".{}", ext.to_string_lossy().to_lowercase())))
        .unwrap_or(false)
}

fn file_times(path: &Path) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(_) => return (None, None),
    };
    let created = metadata.created().ok().map(DateTime::<Utc>::from);
    let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
    (created, modified)
}
