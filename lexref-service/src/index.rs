//! Dual index writers.
//!
//! The vector and full-text backends are independently-owned external systems
//! with no shared transaction. Both writers upsert keyed by chunk id, so
//! re-applying a write after a retry leaves the index unchanged. The
//! orchestrator reconciles the two through per-chunk write statuses in the
//! ledger, never through the backends themselves.

mod fulltext;
mod vector;

pub use fulltext::FullTextIndexWriter;
pub use vector::VectorIndexWriter;

use async_trait::async_trait;

use crate::db::IndexBackend;
use crate::error::ServiceResult;

/// One chunk's worth of index payload.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub chunk_id: String,
    pub document_id: String,
    pub ordinal: i32,
    pub page_number: i32,
    pub content: String,
    pub vector: Vec<f32>,
}

/// A retrieval query. The orchestrator computes the query embedding once and
/// hands both representations over; each backend uses the one it understands.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub text: String,
    pub vector: Vec<f32>,
}

/// A scored chunk reference returned by a backend.
#[derive(Debug, Clone)]
pub struct IndexHit {
    pub chunk_id: String,
    pub score: f32,
}

/// Seam over one retrieval backend.
#[async_trait]
pub trait IndexWriter: Send + Sync {
    fn backend(&self) -> IndexBackend;

    /// Idempotent upsert keyed by chunk id.
    async fn upsert(&self, entries: &[IndexEntry]) -> ServiceResult<()>;

    /// Top-k retrieval.
    async fn query(&self, request: &QueryRequest, limit: usize) -> ServiceResult<Vec<IndexHit>>;
}

/// Normalize a backend base URL to always end with a single slash stripped.
pub(crate) fn normalize_base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}
