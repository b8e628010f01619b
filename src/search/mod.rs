//! Search over chunked entities: BM25, vector, hybrid RRF fusion,
//! and the unified ranker joining entities and memories.

pub mod bm25;
pub mod hybrid;
pub mod vector;

pub use bm25::{search_chunks_flat, search_entities_bm25, ChunkHit};
pub use hybrid::{hybrid_search, unified_search, EntityResult, ScoredChunk, UnifiedHit};
pub use vector::{vector_search, AnnBackend, AnnParams, ExactScanBackend};

use crate::types::Sensitivity;

/// Entity sensitivity filter for a caller's maximum tier.
///
/// Returns a SQL condition on the `entities` alias, or `None` when the
/// caller may see everything.
pub(crate) fn sensitivity_filter(max_tier: Sensitivity, alias: &str) -> Option<String> {
    match max_tier {
        Sensitivity::Restricted => None,
        Sensitivity::Sensitive => Some(format!("{}.sensitivity != 'restricted'", alias)),
        Sensitivity::Normal => Some(format!("{}.sensitivity = 'normal'", alias)),
    }
}
