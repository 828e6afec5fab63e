//! Ingestion orchestrator.
//!
//! The orchestrator exclusively owns state transitions: stage adapters report
//! success or failure, and this module records the outcome in the ledger.
//! `enqueue_document` is the only inbound call the core exposes to the rest
//! of the system.

mod cancellation;
mod processing;
mod workers;

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::blob::{BlobStore, compute_content_hash};
use crate::config::Config;
use crate::db::{Database, Document, ProcessingState};
use crate::embedding::EmbeddingGenerator;
use crate::error::{ProcessingError, ServiceError, ServiceResult};
use crate::index::IndexWriter;
use crate::ocr::TextExtractor;

/// Orchestrator coordinating the ledger, the blob store, and the four
/// external stage collaborators.
pub struct IngestService {
    pub config: Arc<Config>,
    pub db: Arc<Database>,
    pub blobs: Arc<BlobStore>,
    pub extractor: Arc<dyn TextExtractor>,
    pub embedder: Arc<dyn EmbeddingGenerator>,
    pub vector_index: Arc<dyn IndexWriter>,
    pub fulltext_index: Arc<dyn IndexWriter>,
    /// Cancellation tokens for documents currently held by a worker
    processing_cancellation_tokens: DashMap<String, CancellationToken>,
}

impl IngestService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        db: Arc<Database>,
        blobs: Arc<BlobStore>,
        extractor: Arc<dyn TextExtractor>,
        embedder: Arc<dyn EmbeddingGenerator>,
        vector_index: Arc<dyn IndexWriter>,
        fulltext_index: Arc<dyn IndexWriter>,
    ) -> Self {
        Self {
            config,
            db,
            blobs,
            extractor,
            embedder,
            vector_index,
            fulltext_index,
            processing_cancellation_tokens: DashMap::new(),
        }
    }

    /// Store an uploaded document and enqueue it for ingestion.
    ///
    /// Re-submitting identical content is idempotent: the existing ledger row
    /// is returned as long as it has not been dead-lettered.
    pub fn enqueue_document(&self, content: &[u8], filename: &str) -> ServiceResult<Document> {
        let max = self.config.pipeline.max_document_size_bytes;
        if content.len() as u64 > max {
            return Err(ServiceError::Processing(ProcessingError::FileTooLarge {
                size: content.len() as u64,
                max,
            }));
        }

        let content_hash = compute_content_hash(content);
        if let Some(existing_id) = self.db.get_document_by_hash(&content_hash)? {
            info!(
                doc_id = %existing_id,
                filename = %filename,
                "Duplicate upload, reusing existing document"
            );
            return self.document_status(&existing_id);
        }

        let doc_id = Uuid::new_v4().to_string();
        let blob_ref = self.blobs.put(&doc_id, filename, content)?;

        let now = Utc::now();
        let document = Document {
            id: doc_id.clone(),
            filename: filename.to_string(),
            blob_ref,
            content_hash,
            state: ProcessingState::Queued,
            resume_state: None,
            retry_count: 0,
            next_retry_at: None,
            last_error: None,
            chunk_count: 0,
            created_at: now,
            updated_at: now,
        };
        self.db.insert_document(&document)?;

        info!(doc_id = %doc_id, filename = %filename, "Document enqueued for ingestion");
        Ok(document)
    }

    /// Reset a dead-lettered document to `Queued` for another attempt.
    pub fn reenqueue_document(&self, document_id: &str) -> ServiceResult<bool> {
        let requeued = self.db.reenqueue_document(document_id)?;
        if requeued {
            info!(doc_id = %document_id, "Dead-lettered document re-enqueued");
        }
        Ok(requeued)
    }

    /// Cancel a document's processing, e.g. because it was deleted upstream.
    /// In-flight stage results are discarded rather than committed.
    pub fn cancel_document(&self, document_id: &str) -> ServiceResult<bool> {
        let marked = self.db.cancel_document(document_id, "cancelled")?;
        let signalled = self.cancel_processing_token(document_id);
        if marked || signalled {
            info!(doc_id = %document_id, "Document cancelled");
        }
        Ok(marked || signalled)
    }

    /// Current ledger state for a document; queryable at any time.
    pub fn document_status(&self, document_id: &str) -> ServiceResult<Document> {
        self.db
            .get_document(document_id)?
            .ok_or_else(|| ServiceError::DocumentNotFound {
                document_id: document_id.to_string(),
            })
    }
}
