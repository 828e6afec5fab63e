//! Retrieval across the dual index.
//!
//! A query is embedded once, fanned out to both backends, and the ranked
//! lists are merged with reciprocal-rank fusion. Hits are hydrated from the
//! ledger, and only documents in `Indexed` or `Degraded` state are served;
//! dead-lettered and in-flight documents never appear in results.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::db::{Chunk, Database, ProcessingState};
use crate::embedding::EmbeddingGenerator;
use crate::error::{ServiceError, ServiceResult};
use crate::index::{IndexHit, IndexWriter, QueryRequest};

/// Rank constant for reciprocal-rank fusion; the conventional value.
const RRF_K: f32 = 60.0;

pub struct SearchService {
    db: Arc<Database>,
    embedder: Arc<dyn EmbeddingGenerator>,
    vector_index: Arc<dyn IndexWriter>,
    fulltext_index: Arc<dyn IndexWriter>,
}

/// A retrievable chunk with its fused score.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub chunk: Chunk,
    pub score: f32,
}

impl SearchService {
    pub fn new(
        db: Arc<Database>,
        embedder: Arc<dyn EmbeddingGenerator>,
        vector_index: Arc<dyn IndexWriter>,
        fulltext_index: Arc<dyn IndexWriter>,
    ) -> Self {
        Self {
            db,
            embedder,
            vector_index,
            fulltext_index,
        }
    }

    /// Retrieve the top `limit` chunks for a query across both backends.
    pub async fn search(&self, query: &str, limit: usize) -> ServiceResult<Vec<SearchResult>> {
        debug!(query = %query, limit, "Searching dual index");

        let vector = self
            .embedder
            .embed(std::slice::from_ref(&query.to_string()))
            .await?
            .pop()
            .ok_or_else(|| ServiceError::Internal {
                message: "embedding service returned no vector for query".to_string(),
            })?;

        let request = QueryRequest {
            text: query.to_string(),
            vector,
        };

        // Oversample per backend so fusion has something to merge.
        let fetch = (limit * 2).max(limit);
        let (vector_hits, fulltext_hits) = tokio::join!(
            self.vector_index.query(&request, fetch),
            self.fulltext_index.query(&request, fetch),
        );
        let fused = reciprocal_rank_fusion(&[&vector_hits?, &fulltext_hits?]);

        let mut results = Vec::new();
        for (chunk_id, score) in fused {
            if results.len() >= limit {
                break;
            }
            let Some(chunk) = self.db.get_chunk(&chunk_id)? else {
                continue;
            };
            let Some(document) = self.db.get_document(&chunk.document_id)? else {
                continue;
            };
            if !matches!(
                document.state,
                ProcessingState::Indexed | ProcessingState::Degraded
            ) {
                continue;
            }
            results.push(SearchResult { chunk, score });
        }

        debug!(results = results.len(), "Search completed");
        Ok(results)
    }
}

/// Merge ranked hit lists: each hit contributes `1 / (k + rank)` to its
/// chunk's fused score, so agreement between backends outranks a single high
/// position in either one.
fn reciprocal_rank_fusion(lists: &[&[IndexHit]]) -> Vec<(String, f32)> {
    let mut scores: HashMap<String, f32> = HashMap::new();

    for hits in lists {
        for (rank, hit) in hits.iter().enumerate() {
            *scores.entry(hit.chunk_id.clone()).or_insert(0.0) +=
                1.0 / (RRF_K + rank as f32 + 1.0);
        }
    }

    let mut fused: Vec<(String, f32)> = scores.into_iter().collect();
    fused.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    fused
}
