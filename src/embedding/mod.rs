//! Embedding backends and vector blob codec
//!
//! The sentence-embedding model is an external collaborator behind the
//! [`Embedder`] trait; the crate ships a deterministic feature-hashing
//! implementation so the pipeline works without a model download.
//! Absence of a usable backend degrades search to BM25-only.
//!
//! Vectors are stored as little-endian IEEE-754 f32 arrays of length
//! `4 * dims`, L2-normalised.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::VectorsSection;
use crate::error::{HoardError, Result};

/// Trait for embedding generators
pub trait Embedder: Send + Sync {
    /// Encode a batch of texts into L2-normalised vectors
    fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embedding dimensions
    fn dims(&self) -> usize;

    /// Model name recorded next to stored vectors
    fn model_name(&self) -> &str;

    /// Model version recorded next to stored vectors
    fn model_version(&self) -> &str;
}

/// Deterministic feature-hashing embedder
///
/// Unigrams are TF-weighted and hashed into the vector with a signed
/// hashing trick; bigrams contribute at half weight.
pub struct HashEmbedder {
    dimensions: usize,
    version: String,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            version: "1.0.0".to_string(),
        }
    }

    fn tokenize(text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|s| s.len() > 1)
            .map(String::from)
            .collect()
    }

    fn hash_index(token: &str, dimensions: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        (hasher.finish() as usize) % dimensions
    }

    fn hash_sign(token: &str) -> f32 {
        let mut hasher = DefaultHasher::new();
        format!("{}_sign", token).hash(&mut hasher);
        if hasher.finish() % 2 == 0 {
            1.0
        } else {
            -1.0
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let tokens = Self::tokenize(text);
        let mut vector = vec![0.0_f32; self.dimensions];
        if tokens.is_empty() {
            return vector;
        }

        let mut tf: HashMap<&str, f32> = HashMap::new();
        for token in &tokens {
            *tf.entry(token).or_insert(0.0) += 1.0;
        }

        let doc_len = tokens.len() as f32;
        for (token, count) in tf {
            let weight = (1.0 + count / doc_len).ln() * (1.0 + token.len() as f32 * 0.1);
            vector[Self::hash_index(token, self.dimensions)] += weight * Self::hash_sign(token);
        }

        for window in tokens.windows(2) {
            let bigram = format!("{}_{}", window[0], window[1]);
            vector[Self::hash_index(&bigram, self.dimensions)] += 0.5 * Self::hash_sign(&bigram);
        }

        l2_normalize(&mut vector);
        vector
    }
}

impl Embedder for HashEmbedder {
    fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dims(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        "hash-embedder"
    }

    fn model_version(&self) -> &str {
        &self.version
    }
}

/// Lazy per-model-name cache of embedder instances
#[derive(Default)]
pub struct EmbedderRegistry {
    cache: Mutex<HashMap<String, Arc<dyn Embedder>>>,
}

impl EmbedderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the active embedder for the vectors configuration.
    pub fn get(&self, config: &VectorsSection) -> Result<Arc<dyn Embedder>> {
        let mut cache = self.cache.lock();
        if let Some(embedder) = cache.get(&config.model_name) {
            return Ok(embedder.clone());
        }
        let embedder = create_embedder(config)?;
        cache.insert(config.model_name.clone(), embedder.clone());
        Ok(embedder)
    }
}

/// Create an embedder from configuration
pub fn create_embedder(config: &VectorsSection) -> Result<Arc<dyn Embedder>> {
    match config.model_name.as_str() {
        "hash-embedder" => Ok(Arc::new(HashEmbedder::new(config.dimensions))),
        other => Err(HoardError::Embedding(format!(
            "No embedding backend available for model '{}'",
            other
        ))),
    }
}

/// Serialize an L2-normalised vector to little-endian f32 bytes
pub fn encode_embedding(vector: &[f32], expected_dims: usize) -> Result<Vec<u8>> {
    if vector.len() != expected_dims {
        return Err(HoardError::Embedding(format!(
            "Expected {} dims, got {}",
            expected_dims,
            vector.len()
        )));
    }
    let mut normalized = vector.to_vec();
    l2_normalize(&mut normalized);
    let mut bytes = Vec::with_capacity(normalized.len() * 4);
    for value in normalized {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    Ok(bytes)
}

/// Deserialize little-endian f32 bytes, validating the length
pub fn decode_embedding(blob: &[u8], expected_dims: usize) -> Result<Vec<f32>> {
    if blob.len() != expected_dims * 4 {
        return Err(HoardError::Embedding(format!(
            "Embedding blob of {} bytes does not match {} dims",
            blob.len(),
            expected_dims
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Check blob length and that the norm is within 1% of unit
pub fn validate_embedding_blob(blob: &[u8], expected_dims: usize) -> bool {
    match decode_embedding(blob, expected_dims) {
        Ok(vector) => {
            let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
            (norm - 1.0).abs() < 0.01
        }
        Err(_) => false,
    }
}

/// Embed every chunk still missing a vector for the embedder's model,
/// in batches, marking any ANN index stale afterwards.
pub fn build_chunk_embeddings(
    conn: &rusqlite::Connection,
    embedder: &dyn Embedder,
    batch_size: usize,
    source: Option<&str>,
) -> Result<u64> {
    let batch_size = batch_size.max(1);
    let mut total = 0u64;

    loop {
        let mut sql = String::from(
            "SELECT chunks.id, chunks.content
             FROM chunks
             JOIN entities ON entities.id = chunks.entity_id
             LEFT JOIN embeddings
                 ON embeddings.chunk_id = chunks.id AND embeddings.model = ?1
             WHERE embeddings.chunk_id IS NULL
               AND entities.tombstoned_at IS NULL",
        );
        let mut params: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(embedder.model_name().to_string())];
        if let Some(source) = source {
            sql.push_str(" AND entities.source = ?2");
            params.push(Box::new(source.to_string()));
        }
        sql.push_str(" LIMIT ?");
        params.push(Box::new(batch_size as i64));

        let mut stmt = conn.prepare(&sql)?;
        let bind: Vec<&dyn rusqlite::ToSql> = params.iter().map(|b| b.as_ref()).collect();
        let batch: Vec<(String, String)> = stmt
            .query_map(bind.as_slice(), |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if batch.is_empty() {
            break;
        }

        let contents: Vec<String> = batch.iter().map(|(_, content)| content.clone()).collect();
        let vectors = embedder.encode(&contents)?;
        let mut upsert = conn.prepare_cached(
            "INSERT INTO embeddings (chunk_id, model, vector, dims)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(chunk_id) DO UPDATE SET
                 model = excluded.model,
                 vector = excluded.vector,
                 dims = excluded.dims,
                 created_at = CURRENT_TIMESTAMP",
        )?;
        for ((chunk_id, _), vector) in batch.iter().zip(vectors.iter()) {
            let blob = encode_embedding(vector, embedder.dims())?;
            upsert.execute(rusqlite::params![
                chunk_id,
                embedder.model_name(),
                blob,
                embedder.dims() as i64
            ])?;
            total += 1;
        }
    }

    if total > 0 {
        mark_ann_stale(conn, embedder.model_name())?;
    }
    Ok(total)
}

fn mark_ann_stale(conn: &rusqlite::Connection, model_name: &str) -> Result<()> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM embeddings WHERE model = ?1",
        rusqlite::params![model_name],
        |row| row.get(0),
    )?;
    conn.execute(
        "INSERT INTO ann_index_meta (id, backend, model_name, vectors_count, updated_at, state)
         VALUES (1, 'exact', ?1, ?2, ?3, 'stale')
         ON CONFLICT(id) DO UPDATE SET
             model_name = excluded.model_name,
             vectors_count = excluded.vectors_count,
             updated_at = excluded.updated_at,
             state = 'stale'",
        rusqlite::params![model_name, count, crate::types::now_iso()],
    )?;
    Ok(())
}

/// Cosine similarity; for pre-normalised vectors this is the dot product
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Dot product for pre-normalised vectors
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_round_trip() {
        let vector = vec![0.5_f32, -0.5, 0.5, 0.5];
        let blob = encode_embedding(&vector, 4).unwrap();
        assert_eq!(blob.len(), 16);
        let decoded = decode_embedding(&blob, 4).unwrap();
        for (a, b) in vector.iter().zip(decoded.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_blob_length_mismatch_rejected() {
        let blob = vec![0u8; 17];
        assert!(decode_embedding(&blob, 4).is_err());
        assert!(!validate_embedding_blob(&blob, 4));
    }

    #[test]
    fn test_encode_normalizes() {
        let vector = vec![3.0_f32, 4.0, 0.0, 0.0];
        let blob = encode_embedding(&vector, 4).unwrap();
        assert!(validate_embedding_blob(&blob, 4));
    }

    #[test]
    fn test_hash_embedder_deterministic_and_normalised() {
        let embedder = HashEmbedder::new(64);
        let a = embedder
            .encode(&["the quick brown fox".to_string()])
            .unwrap();
        let b = embedder
            .encode(&["the quick brown fox".to_string()])
            .unwrap();
        assert_eq!(a, b);
        let norm: f32 = a[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_hash_embedder_similarity_ordering() {
        let embedder = HashEmbedder::new(256);
        let texts = vec![
            "the quick brown fox jumps over the lazy dog".to_string(),
            "a quick brown fox leaps over a lazy dog".to_string(),
            "quantum physics and thermodynamics".to_string(),
        ];
        let vectors = embedder.encode(&texts).unwrap();
        let similar = cosine_similarity(&vectors[0], &vectors[1]);
        let different = cosine_similarity(&vectors[0], &vectors[2]);
        assert!(similar > different);
    }

    #[test]
    fn test_registry_caches_by_model_name() {
        let registry = EmbedderRegistry::new();
        let config = VectorsSection::default();
        let a = registry.get(&config).unwrap();
        let b = registry.get(&config).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_build_chunk_embeddings_fills_missing() {
        use crate::ingest::store::{replace_chunks, upsert_entity};
        use crate::types::{ChunkInput, EntityInput};

        let storage = crate::storage::Storage::open_in_memory().unwrap();
        let embedder = HashEmbedder::new(16);
        storage
            .with_connection(|conn| {
                let entity = EntityInput {
                    source: "local_files".to_string(),
                    source_id: "doc".to_string(),
                    entity_type: "document".to_string(),
                    content_hash: Some("h".to_string()),
                    ..Default::default()
                };
                let entity_id = upsert_entity(conn, &entity)?;
                replace_chunks(
                    conn,
                    &entity_id,
                    &[ChunkInput::new("alpha"), ChunkInput::new("beta")],
                )?;

                assert_eq!(build_chunk_embeddings(conn, &embedder, 1, None)?, 2);
                // second run is a no-op
                assert_eq!(build_chunk_embeddings(conn, &embedder, 1, None)?, 0);

                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM embeddings WHERE model = 'hash-embedder'",
                    [],
                    |row| row.get(0),
                )?;
                assert_eq!(count, 2);

                let state: String = conn.query_row(
                    "SELECT state FROM ann_index_meta WHERE id = 1",
                    [],
                    |row| row.get(0),
                )?;
                assert_eq!(state, "stale");
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_unknown_backend_errors() {
        let config = VectorsSection {
            model_name: "sentence-transformers/all-MiniLM-L6-v2".to_string(),
            ..Default::default()
        };
        assert!(create_embedder(&config).is_err());
    }
}
