//! Inbox connector: a drop directory agents write notes into
//!
//! `ingest.inbox.put` writes files here; the next sync pass indexes
//! them like any other source.

use std::path::PathBuf;

use crate::config::{Config, ConnectorSettings};
use crate::error::{HoardError, Result};
use crate::ingest::chunking::chunk_text;
use crate::ingest::local_files::{chunk_params, collect_files, include_extensions};
use crate::ingest::store::compute_content_hash;
use crate::ingest::{Connector, ScanStream};
use crate::types::{now_iso, ChunkInput, Discovery, EntityInput};

pub struct InboxConnector;

const NAME: &str = "inbox";
const VERSION: &str = "0.1.0";

impl Connector for InboxConnector {
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
        let path = match inbox_path(settings) {
            Some(path) => path,
            None => return Discovery::failed("Inbox path not configured"),
        };
        if !path.exists() {
            return Discovery::failed(format!("Inbox path not found: {}", path.display()));
        }
        let files = collect_files(&[path], &include_extensions(settings));
        Discovery::ok(
            format!("Found {} inbox files", files.len()),
            Some(files.len() as u64),
        )
    }

    fn scan(&self, settings: &ConnectorSettings) -> Result<ScanStream> {
        let path = inbox_path(settings)
            .ok_or_else(|| HoardError::Connector("inbox: path not configured".to_string()))?;
        if !path.exists() {
            return Ok(Box::new(std::iter::empty()));
        }
        let files = collect_files(&[path], &include_extensions(settings));
        let (max_tokens, overlap) = chunk_params(settings);

        Ok(Box::new(files.into_iter().filter_map(move |file| {
            let content = match std::fs::read_to_string(&file) {
                Ok(content) => content,
                Err(_) => return None,
            };
            let mut tags = vec!["inbox".to_string(), "agent".to_string()];
            if let Some(ext) = file.extension() {
                tags.push(ext.to_string_lossy().to_lowercase());
            }
            let entity = EntityInput {
                source: NAME.to_string(),
                source_id: file.display().to_string(),
                entity_type: "document".to_string(),
                title: file.file_name().map(|n| n.to_string_lossy().into_owned()),
                uri: Some(format!("file://{}", file.display())),
                tags,
                content_hash: Some(compute_content_hash(&content)),
                connector_name: Some(NAME.to_string()),
                connector_version: Some(VERSION.to_string()),
                ..Default::default()
            };
            let chunks = chunk_text(&content, max_tokens, overlap)
                .into_iter()
                .map(|span| ChunkInput {
                    content: span.text,
                    char_offset_start: Some(span.start as i64),
                    char_offset_end: Some(span.end as i64),
                    chunk_type: "semantic".to_string(),
                })
                .collect();
            Some(Ok((entity, chunks)))
        })))
    }
}

fn inbox_path(settings: &ConnectorSettings) -> Option<PathBuf> {
    settings
        .get_str("path")
        .map(|raw| PathBuf::from(shellexpand::tilde(raw).into_owned()))
}

/// Write a note into the inbox directory (`ingest.inbox.put`).
///
/// Returns the path of the written file.
pub fn write_inbox_entry(
    config: &Config,
    content: &str,
    title: Option<&str>,
    tags: &[String],
) -> Result<PathBuf> {
    let settings = config
        .connectors
        .get(NAME)
        .ok_or_else(|| HoardError::Validation("Inbox connector is not configured".to_string()))?;
    let dir = inbox_path(settings)
        .ok_or_else(|| HoardError::Validation("Inbox path not configured".to_string()))?;
    std::fs::create_dir_all(&dir)?;

    let slug = slugify(title.unwrap_or("inbox"));
    let stamp = now_iso().replace([':', '-'], "");
    let mut path = dir.join(format!("{}_{}.md", stamp, slug));
    for idx in 1..1000 {
        if !path.exists() {
            break;
        }
        path = dir.join(format!("{}_{}_{}.md", stamp, slug, idx));
    }

    let body = if tags.is_empty() {
        content.to_string()
    } else {
        format!("---\ntags: [{}]\n---\n\n{}", tags.join(", "), content)
    };
    std::fs::write(&path, body)?;
    Ok(path)
}

fn slugify(value: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for ch in value.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= 60 {
            break;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "inbox".to_string()
    } else {
        slug
    }
}
