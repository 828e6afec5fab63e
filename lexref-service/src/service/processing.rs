//! Stage execution for claimed documents.
//!
//! A worker holds one claimed document and advances it stage by stage. Every
//! transition is a compare-and-set against the ledger, so an external change
//! (cancellation, another process) makes the worker discard its result and
//! release the claim instead of overwriting newer state.

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chunker;
use crate::db::{Chunk, Document, IndexBackend, IndexWriteStatus, ProcessingState};
use crate::error::{
    FailureKind, ProcessingError, ServiceError, ServiceResult, error_chain,
};
use crate::index::{IndexEntry, IndexWriter};
use crate::service::IngestService;

impl IngestService {
    /// Advance a claimed document through the pipeline until it parks.
    ///
    /// The claim already moved the document into a running state; each
    /// completed stage commits its checkpoint and immediately claims the next
    /// stage. A failed compare-and-set means the document changed under us
    /// and the claim is released.
    pub(crate) async fn process_document(&self, document: &Document) {
        let doc_id = &document.id;
        let token = self.register_processing_token(doc_id);
        let mut state = document.state;

        loop {
            let result = match state {
                ProcessingState::OcrRunning => self.run_ocr_stage(document, &token).await,
                ProcessingState::Chunking => self.run_chunking_stage(document).await,
                ProcessingState::Embedding => self.run_embedding_stage(document, &token).await,
                ProcessingState::Indexing => self.run_indexing_stage(document, &token).await,
                other => {
                    warn!(doc_id = %doc_id, state = %other.as_str(), "Claimed document is not in a runnable state");
                    break;
                }
            };

            match result {
                Ok(()) => {
                    if token.is_cancelled() {
                        info!(doc_id = %doc_id, stage = %state.as_str(), "Cancelled, discarding stage result");
                        break;
                    }
                    let Some(done) = state.on_success() else {
                        break;
                    };
                    match self.db.record_transition(doc_id, state, done) {
                        Ok(true) => {}
                        Ok(false) => {
                            info!(doc_id = %doc_id, stage = %state.as_str(), "State changed externally, releasing claim");
                            break;
                        }
                        Err(e) => {
                            error!(doc_id = %doc_id, error = %e, "Failed to record stage completion");
                            break;
                        }
                    }
                    if done == ProcessingState::Indexed {
                        info!(doc_id = %doc_id, "Document fully indexed");
                        break;
                    }
                    // Continue straight into the next stage under this claim.
                    let Some(next) = done.next_running() else {
                        break;
                    };
                    match self.db.record_transition(doc_id, done, next) {
                        Ok(true) => state = next,
                        Ok(false) => {
                            info!(doc_id = %doc_id, "Document claimed elsewhere, releasing");
                            break;
                        }
                        Err(e) => {
                            error!(doc_id = %doc_id, error = %e, "Failed to claim next stage");
                            break;
                        }
                    }
                }
                Err(ServiceError::Processing(ProcessingError::Cancelled { .. })) => {
                    info!(doc_id = %doc_id, stage = %state.as_str(), "Document processing cancelled mid-stage");
                    break;
                }
                Err(e) => {
                    self.handle_stage_failure(document, state, &e);
                    break;
                }
            }
        }

        self.unregister_processing_token(doc_id);
    }

    /// The single retry-vs-terminal decision point.
    fn handle_stage_failure(&self, document: &Document, state: ProcessingState, error: &ServiceError) {
        let doc_id = &document.id;
        let reason = error_chain(error);
        let policy = self.config.pipeline.retry_policy();
        let failures = document.retry_count + 1;

        match error.failure_kind() {
            FailureKind::Permanent => {
                error!(
                    doc_id = %doc_id,
                    stage = %state.as_str(),
                    error = %reason,
                    "Permanent failure, dead-lettering document"
                );
                self.dead_letter(doc_id, state, &reason);
            }
            FailureKind::Transient if !policy.is_exhausted(failures) => {
                let delay = policy.jittered_delay_for(document.retry_count);
                let next_retry_at = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                let resume = state
                    .retry_checkpoint()
                    .unwrap_or(ProcessingState::Queued);

                warn!(
                    doc_id = %doc_id,
                    stage = %state.as_str(),
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "Transient stage failure, scheduling retry"
                );

                match self
                    .db
                    .record_failure(doc_id, state, resume, failures, next_retry_at, &reason)
                {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(doc_id = %doc_id, "State changed externally, retry not recorded")
                    }
                    Err(e) => warn!(doc_id = %doc_id, error = %e, "Failed to record retry"),
                }
            }
            FailureKind::Transient => {
                // Retries exhausted. If exactly one index backend finished,
                // the document stays queryable there and is flagged degraded
                // instead of dead-lettered.
                if state == ProcessingState::Indexing
                    && let Some(lagging) = self.diverged_backend(doc_id)
                {
                    error!(
                        doc_id = %doc_id,
                        backend = %lagging,
                        retries = document.retry_count,
                        error = %reason,
                        "Index backends diverged after retry exhaustion, marking document degraded"
                    );
                    match self.db.mark_degraded(doc_id, state, &reason) {
                        Ok(true) => {}
                        Ok(false) => info!(doc_id = %doc_id, "State changed externally"),
                        Err(e) => {
                            warn!(doc_id = %doc_id, error = %e, "Failed to mark document degraded")
                        }
                    }
                    return;
                }

                error!(
                    doc_id = %doc_id,
                    stage = %state.as_str(),
                    retries = document.retry_count,
                    error = %reason,
                    "Retries exhausted, dead-lettering document"
                );
                self.dead_letter(doc_id, state, &reason);
            }
        }
    }

    fn dead_letter(&self, doc_id: &str, expected: ProcessingState, reason: &str) {
        match self.db.mark_dead_lettered(doc_id, expected, reason) {
            Ok(true) => {}
            Ok(false) => info!(doc_id = %doc_id, "State changed externally, not dead-lettering"),
            Err(e) => error!(doc_id = %doc_id, error = %e, "Failed to dead-letter document"),
        }
    }

    /// Exactly one backend fully written? Returns the one that is not.
    fn diverged_backend(&self, doc_id: &str) -> Option<IndexBackend> {
        let vector = self.db.unwritten_count(doc_id, IndexBackend::Vector).ok()?;
        let fulltext = self
            .db
            .unwritten_count(doc_id, IndexBackend::FullText)
            .ok()?;
        match (vector, fulltext) {
            (0, n) if n > 0 => Some(IndexBackend::FullText),
            (n, 0) if n > 0 => Some(IndexBackend::Vector),
            _ => None,
        }
    }

    async fn run_ocr_stage(
        &self,
        document: &Document,
        token: &CancellationToken,
    ) -> ServiceResult<()> {
        let bytes = self.blobs.get(&document.blob_ref)?;
        let extracted = self.extractor.extract(&document.filename, &bytes).await?;

        if token.is_cancelled() {
            return Err(ServiceError::Processing(ProcessingError::Cancelled {
                document_id: document.id.clone(),
            }));
        }

        info!(doc_id = %document.id, pages = extracted.pages.len(), "Text extracted");
        self.db.save_extraction(&document.id, &extracted)?;
        Ok(())
    }

    async fn run_chunking_stage(&self, document: &Document) -> ServiceResult<()> {
        if self.db.chunk_count(&document.id)? > 0 {
            info!(doc_id = %document.id, "Chunks already exist, skipping chunking");
            return Ok(());
        }

        let extracted = self.db.get_extraction(&document.id)?.ok_or_else(|| {
            ServiceError::Processing(ProcessingError::MissingExtraction {
                document_id: document.id.clone(),
            })
        })?;

        let cfg = &self.config.pipeline;
        let spans = chunker::chunk_pages(&extracted.pages, cfg.chunk_size, cfg.chunk_overlap);
        if spans.is_empty() {
            return Err(ServiceError::Processing(ProcessingError::NoChunks {
                document_id: document.id.clone(),
            }));
        }

        let now = Utc::now();
        let chunks: Vec<Chunk> = spans
            .into_iter()
            .map(|span| Chunk {
                id: Uuid::new_v4().to_string(),
                document_id: document.id.clone(),
                ordinal: span.ordinal,
                page_number: span.page_number,
                start_offset: span.start_offset as i64,
                end_offset: span.end_offset as i64,
                content: span.content,
                vector_status: IndexWriteStatus::Pending,
                fulltext_status: IndexWriteStatus::Pending,
                created_at: now,
            })
            .collect();

        self.db.insert_chunks(&chunks)?;
        info!(doc_id = %document.id, chunks = chunks.len(), "Chunks created");
        Ok(())
    }

    async fn run_embedding_stage(
        &self,
        document: &Document,
        token: &CancellationToken,
    ) -> ServiceResult<()> {
        let pending = self.db.get_chunks_without_embeddings(&document.id)?;
        if pending.is_empty() {
            info!(doc_id = %document.id, "All chunks already have embeddings");
            return Ok(());
        }

        let total = self.db.chunk_count(&document.id)?;
        let mut embedded = total - pending.len();
        info!(
            doc_id = %document.id,
            remaining = pending.len(),
            already_embedded = embedded,
            total,
            "Generating embeddings for remaining chunks"
        );

        let batch_size = self.config.pipeline.embed_batch_size.max(1);
        for batch in pending.chunks(batch_size) {
            if token.is_cancelled() {
                return Err(ServiceError::Processing(ProcessingError::Cancelled {
                    document_id: document.id.clone(),
                }));
            }

            let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
            let vectors = self.embedder.embed(&texts).await?;
            if vectors.len() != batch.len() {
                return Err(ServiceError::Embedding(
                    crate::error::EmbeddingError::Misaligned {
                        expected: batch.len(),
                        got: vectors.len(),
                    },
                ));
            }

            // Position-indexed alignment: vector i belongs to batch chunk i.
            for (chunk, vector) in batch.iter().zip(vectors.iter()) {
                self.db.insert_embedding(&chunk.id, vector)?;
            }

            embedded += batch.len();
            debug!(doc_id = %document.id, progress = embedded, total, "Embedding progress");
        }

        info!(doc_id = %document.id, chunks = total, "Embedding generation complete");
        Ok(())
    }

    async fn run_indexing_stage(
        &self,
        document: &Document,
        token: &CancellationToken,
    ) -> ServiceResult<()> {
        let vector_pending = self
            .db
            .get_chunks_pending_index(&document.id, IndexBackend::Vector)?;
        let fulltext_pending = self
            .db
            .get_chunks_pending_index(&document.id, IndexBackend::FullText)?;

        if vector_pending.is_empty() && fulltext_pending.is_empty() {
            info!(doc_id = %document.id, "All chunks already written to both indexes");
            return Ok(());
        }

        info!(
            doc_id = %document.id,
            vector_pending = vector_pending.len(),
            fulltext_pending = fulltext_pending.len(),
            "Writing chunks to index backends"
        );

        // The writers run concurrently and retry independently; neither waits
        // for the other's progress.
        let (vector_result, fulltext_result) = tokio::join!(
            self.write_chunks_to_index(
                self.vector_index.as_ref(),
                document,
                &vector_pending,
                token
            ),
            self.write_chunks_to_index(
                self.fulltext_index.as_ref(),
                document,
                &fulltext_pending,
                token
            ),
        );

        match (vector_result, fulltext_result) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), _) | (_, Err(e)) => Err(e),
        }
    }

    /// Send pending chunks to one backend, recording each chunk's outcome so
    /// a retry never re-sends a `Written` chunk.
    async fn write_chunks_to_index(
        &self,
        writer: &dyn IndexWriter,
        document: &Document,
        chunks: &[Chunk],
        token: &CancellationToken,
    ) -> ServiceResult<()> {
        for chunk in chunks {
            if token.is_cancelled() {
                return Err(ServiceError::Processing(ProcessingError::Cancelled {
                    document_id: document.id.clone(),
                }));
            }

            let vector = self.db.get_embedding(&chunk.id)?.ok_or_else(|| {
                ServiceError::Internal {
                    message: format!("chunk {} has no embedding", chunk.id),
                }
            })?;

            let entry = IndexEntry {
                chunk_id: chunk.id.clone(),
                document_id: chunk.document_id.clone(),
                ordinal: chunk.ordinal,
                page_number: chunk.page_number,
                content: chunk.content.clone(),
                vector,
            };

            match writer.upsert(std::slice::from_ref(&entry)).await {
                Ok(()) => {
                    self.db
                        .mark_chunk_status(&chunk.id, writer.backend(), IndexWriteStatus::Written)?;
                }
                Err(e) => {
                    self.db
                        .mark_chunk_status(&chunk.id, writer.backend(), IndexWriteStatus::Failed)?;
                    return Err(e);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobStore;
    use crate::config::{Config, PipelineConfig, StorageConfig};
    use crate::db::Database;
    use crate::embedding::EmbeddingGenerator;
    use crate::error::{EmbeddingError, IndexError, OcrError};
    use crate::index::{IndexHit, QueryRequest};
    use crate::ocr::{ExtractedPage, ExtractedText, TextExtractor};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};
    use tempfile::TempDir;

    /// Consume one pre-armed failure if any remain.
    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    struct FakeExtractor {
        pages: usize,
        transient_failures: AtomicUsize,
        permanent: bool,
        calls: AtomicUsize,
    }

    impl FakeExtractor {
        fn new(pages: usize) -> Self {
            Self {
                pages,
                transient_failures: AtomicUsize::new(0),
                permanent: false,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing_first(pages: usize, failures: usize) -> Self {
            Self {
                transient_failures: AtomicUsize::new(failures),
                ..Self::new(pages)
            }
        }

        fn permanent_failure() -> Self {
            Self {
                permanent: true,
                ..Self::new(1)
            }
        }
    }

    #[async_trait]
    impl TextExtractor for FakeExtractor {
        async fn extract(&self, _filename: &str, _content: &[u8]) -> ServiceResult<ExtractedText> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.permanent {
                return Err(OcrError::UnsupportedFormat {
                    format: "docx".to_string(),
                }
                .into());
            }
            if take_failure(&self.transient_failures) {
                return Err(OcrError::Extraction {
                    status: 503,
                    message: "ocr workers saturated".to_string(),
                }
                .into());
            }
            Ok(ExtractedText {
                pages: (1..=self.pages)
                    .map(|n| ExtractedPage {
                        number: n as i32,
                        text: format!("page {n} alpha beta gamma delta epsilon zeta"),
                    })
                    .collect(),
            })
        }
    }

    struct FakeEmbedder {
        transient_failures: AtomicUsize,
        calls: AtomicUsize,
    }

    impl FakeEmbedder {
        fn new() -> Self {
            Self {
                transient_failures: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing_first(failures: usize) -> Self {
            Self {
                transient_failures: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingGenerator for FakeEmbedder {
        async fn embed(&self, texts: &[String]) -> ServiceResult<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if take_failure(&self.transient_failures) {
                return Err(EmbeddingError::RateLimited {
                    message: "quota exceeded".to_string(),
                }
                .into());
            }
            // Vector derived from the text so alignment is observable.
            Ok(texts.iter().map(|t| vec![t.len() as f32, 0.5]).collect())
        }
    }

    struct FakeIndex {
        kind: IndexBackend,
        transient_failures: AtomicUsize,
        always_fail: bool,
        upsert_calls: AtomicUsize,
        /// chunk_id -> times written
        store: StdMutex<HashMap<String, usize>>,
    }

    impl FakeIndex {
        fn new(kind: IndexBackend) -> Self {
            Self {
                kind,
                transient_failures: AtomicUsize::new(0),
                always_fail: false,
                upsert_calls: AtomicUsize::new(0),
                store: StdMutex::new(HashMap::new()),
            }
        }

        fn failing_first(kind: IndexBackend, failures: usize) -> Self {
            Self {
                transient_failures: AtomicUsize::new(failures),
                ..Self::new(kind)
            }
        }

        fn unavailable(kind: IndexBackend) -> Self {
            Self {
                always_fail: true,
                ..Self::new(kind)
            }
        }

        fn written(&self) -> HashMap<String, usize> {
            self.store.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl IndexWriter for FakeIndex {
        fn backend(&self) -> IndexBackend {
            self.kind
        }

        async fn upsert(&self, entries: &[IndexEntry]) -> ServiceResult<()> {
            self.upsert_calls.fetch_add(1, Ordering::SeqCst);
            if self.always_fail || take_failure(&self.transient_failures) {
                return Err(IndexError::Write {
                    backend: self.kind,
                    status: 503,
                    message: "backend unavailable".to_string(),
                }
                .into());
            }
            let mut store = self.store.lock().unwrap();
            for entry in entries {
                *store.entry(entry.chunk_id.clone()).or_insert(0) += 1;
            }
            Ok(())
        }

        async fn query(&self, _request: &QueryRequest, _limit: usize) -> ServiceResult<Vec<IndexHit>> {
            Ok(Vec::new())
        }
    }

    struct Harness {
        service: Arc<IngestService>,
        db: Arc<Database>,
        extractor: Arc<FakeExtractor>,
        embedder: Arc<FakeEmbedder>,
        vector: Arc<FakeIndex>,
        fulltext: Arc<FakeIndex>,
        _dir: TempDir,
    }

    fn harness(
        extractor: FakeExtractor,
        embedder: FakeEmbedder,
        vector: FakeIndex,
        fulltext: FakeIndex,
        max_retries: u32,
    ) -> Harness {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(Config {
            storage: StorageConfig {
                data_dir: dir.path().to_path_buf(),
                intake_dir: None,
            },
            pipeline: PipelineConfig {
                worker_count: 1,
                poll_interval_secs: 0,
                max_retries,
                retry_base_delay_ms: 1,
                retry_max_delay_ms: 2,
                chunk_size: 4,
                chunk_overlap: 1,
                embed_batch_size: 2,
                max_document_size_bytes: 1024 * 1024,
            },
            ..Default::default()
        });
        let db = Arc::new(Database::open(&dir.path().join("ledger.db")).unwrap());
        let blobs = Arc::new(BlobStore::open(dir.path()).unwrap());
        let extractor = Arc::new(extractor);
        let embedder = Arc::new(embedder);
        let vector = Arc::new(vector);
        let fulltext = Arc::new(fulltext);
        let service = Arc::new(IngestService::new(
            config,
            db.clone(),
            blobs,
            extractor.clone(),
            embedder.clone(),
            vector.clone(),
            fulltext.clone(),
        ));
        Harness {
            service,
            db,
            extractor,
            embedder,
            vector,
            fulltext,
            _dir: dir,
        }
    }

    /// Run claim/advance loops to quiescence. Claims use a far-future clock
    /// so retry delays never stall the test.
    async fn drive(h: &Harness) {
        let clock = Utc::now() + chrono::Duration::days(1);
        for _ in 0..50 {
            match h.db.claim_next(clock).unwrap() {
                Some(doc) => h.service.process_document(&doc).await,
                None => break,
            }
        }
    }

    #[tokio::test]
    async fn three_page_document_reaches_indexed_end_to_end() {
        let h = harness(
            FakeExtractor::new(3),
            FakeEmbedder::new(),
            FakeIndex::new(IndexBackend::Vector),
            FakeIndex::new(IndexBackend::FullText),
            5,
        );

        let doc = h.service.enqueue_document(b"%PDF three pages", "ruling.pdf").unwrap();
        drive(&h).await;

        let final_doc = h.service.document_status(&doc.id).unwrap();
        assert_eq!(final_doc.state, ProcessingState::Indexed);
        assert_eq!(final_doc.retry_count, 0);

        // 3 pages x 8 words, window 4 step 3 -> 3 chunks per page.
        let chunks = h.db.get_chunks(&doc.id).unwrap();
        assert_eq!(chunks.len(), 9);

        let vector_written = h.vector.written();
        let fulltext_written = h.fulltext.written();
        for chunk in &chunks {
            assert_eq!(chunk.vector_status, IndexWriteStatus::Written);
            assert_eq!(chunk.fulltext_status, IndexWriteStatus::Written);
            assert_eq!(vector_written.get(&chunk.id), Some(&1));
            assert_eq!(fulltext_written.get(&chunk.id), Some(&1));
        }
    }

    #[tokio::test]
    async fn embedding_vectors_align_with_chunk_ordinals() {
        let h = harness(
            FakeExtractor::new(2),
            FakeEmbedder::new(),
            FakeIndex::new(IndexBackend::Vector),
            FakeIndex::new(IndexBackend::FullText),
            5,
        );

        let doc = h.service.enqueue_document(b"aligned", "doc.pdf").unwrap();
        drive(&h).await;

        // The fake embedder encodes the text length into the vector, so any
        // positional mix-up between batch input and output is visible here.
        for chunk in h.db.get_chunks(&doc.id).unwrap() {
            let embedding = h.db.get_embedding(&chunk.id).unwrap().unwrap();
            assert_eq!(embedding[0], chunk.content.len() as f32);
        }
    }

    #[tokio::test]
    async fn transient_embedding_failures_retry_until_success() {
        let h = harness(
            FakeExtractor::new(1),
            FakeEmbedder::failing_first(2),
            FakeIndex::new(IndexBackend::Vector),
            FakeIndex::new(IndexBackend::FullText),
            5,
        );

        let doc = h.service.enqueue_document(b"retry me", "doc.pdf").unwrap();
        drive(&h).await;

        let final_doc = h.service.document_status(&doc.id).unwrap();
        assert_eq!(final_doc.state, ProcessingState::Indexed);
        // Two failed attempts recorded; the third attempt succeeded.
        assert_eq!(final_doc.retry_count, 2);
        assert!(h.embedder.calls.load(Ordering::SeqCst) >= 3);
        // OCR ran once; retries resumed from the chunking-done checkpoint.
        assert_eq!(h.extractor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn permanent_extraction_error_dead_letters_without_retry() {
        let h = harness(
            FakeExtractor::permanent_failure(),
            FakeEmbedder::new(),
            FakeIndex::new(IndexBackend::Vector),
            FakeIndex::new(IndexBackend::FullText),
            5,
        );

        let doc = h.service.enqueue_document(b"bad format", "doc.docx").unwrap();
        drive(&h).await;

        let final_doc = h.service.document_status(&doc.id).unwrap();
        assert_eq!(final_doc.state, ProcessingState::DeadLettered);
        assert!(final_doc.last_error.unwrap().contains("Unsupported document format"));
        assert_eq!(h.extractor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_bounded_by_max_retries() {
        let h = harness(
            FakeExtractor::failing_first(1, usize::MAX),
            FakeEmbedder::new(),
            FakeIndex::new(IndexBackend::Vector),
            FakeIndex::new(IndexBackend::FullText),
            2,
        );

        let doc = h.service.enqueue_document(b"never works", "doc.pdf").unwrap();
        drive(&h).await;

        let final_doc = h.service.document_status(&doc.id).unwrap();
        assert_eq!(final_doc.state, ProcessingState::DeadLettered);
        // Initial attempt plus two retries.
        assert_eq!(h.extractor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn partial_index_failure_degrades_instead_of_dead_lettering() {
        let h = harness(
            FakeExtractor::new(1),
            FakeEmbedder::new(),
            FakeIndex::new(IndexBackend::Vector),
            FakeIndex::unavailable(IndexBackend::FullText),
            1,
        );

        let doc = h.service.enqueue_document(b"half indexed", "doc.pdf").unwrap();
        drive(&h).await;

        let final_doc = h.service.document_status(&doc.id).unwrap();
        assert_eq!(final_doc.state, ProcessingState::Degraded);
        assert!(final_doc.last_error.unwrap().contains("fulltext"));

        // The healthy backend holds every chunk exactly once; nothing made it
        // into the full-text side.
        let chunks = h.db.get_chunks(&doc.id).unwrap();
        let vector_written = h.vector.written();
        for chunk in &chunks {
            assert_eq!(vector_written.get(&chunk.id), Some(&1));
            assert_ne!(chunk.fulltext_status, IndexWriteStatus::Written);
        }
        assert_eq!(chunks[0].fulltext_status, IndexWriteStatus::Failed);
        assert_eq!(h.fulltext.written().len(), 0);
    }

    #[tokio::test]
    async fn retry_never_resends_written_chunks() {
        let h = harness(
            FakeExtractor::new(2),
            FakeEmbedder::new(),
            FakeIndex::new(IndexBackend::Vector),
            FakeIndex::failing_first(IndexBackend::FullText, 1),
            5,
        );

        let doc = h.service.enqueue_document(b"resume safe", "doc.pdf").unwrap();
        drive(&h).await;

        let final_doc = h.service.document_status(&doc.id).unwrap();
        assert_eq!(final_doc.state, ProcessingState::Indexed);

        let chunks = h.db.get_chunks(&doc.id).unwrap();
        // The vector side finished on the first indexing attempt; the retry
        // only replayed the full-text side.
        assert_eq!(
            h.vector.upsert_calls.load(Ordering::SeqCst),
            chunks.len()
        );
        for (_, writes) in h.vector.written() {
            assert_eq!(writes, 1);
        }
        for (_, writes) in h.fulltext.written() {
            assert_eq!(writes, 1);
        }
    }

    #[tokio::test]
    async fn restart_requeues_and_finishes_without_duplicate_work() {
        let h = harness(
            FakeExtractor::new(1),
            FakeEmbedder::new(),
            FakeIndex::new(IndexBackend::Vector),
            FakeIndex::new(IndexBackend::FullText),
            5,
        );

        let doc = h.service.enqueue_document(b"crashy", "doc.pdf").unwrap();

        // Claim and then "crash" before processing anything.
        let claimed = h.db.claim_next(Utc::now()).unwrap().unwrap();
        assert_eq!(claimed.state, ProcessingState::OcrRunning);
        drop(claimed);

        assert_eq!(h.db.requeue_in_flight().unwrap(), 1);
        drive(&h).await;

        let final_doc = h.service.document_status(&doc.id).unwrap();
        assert_eq!(final_doc.state, ProcessingState::Indexed);
        assert_eq!(h.extractor.calls.load(Ordering::SeqCst), 1);
        for (_, writes) in h.vector.written() {
            assert_eq!(writes, 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_never_hand_out_the_same_document() {
        let h = harness(
            FakeExtractor::new(1),
            FakeEmbedder::new(),
            FakeIndex::new(IndexBackend::Vector),
            FakeIndex::new(IndexBackend::FullText),
            5,
        );

        for i in 0..4 {
            h.service
                .enqueue_document(format!("document body {i}").as_bytes(), &format!("doc{i}.pdf"))
                .unwrap();
        }

        let claimed = Arc::new(StdMutex::new(Vec::new()));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let db = h.db.clone();
            let claimed = claimed.clone();
            handles.push(tokio::spawn(async move {
                while let Some(doc) = db.claim_next(Utc::now()).unwrap() {
                    claimed.lock().unwrap().push(doc.id);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut ids = claimed.lock().unwrap().clone();
        let total = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(total, 4);
        assert_eq!(ids.len(), 4);
    }

    #[tokio::test]
    async fn cancellation_discards_in_flight_results() {
        let h = harness(
            FakeExtractor::new(1),
            FakeEmbedder::new(),
            FakeIndex::new(IndexBackend::Vector),
            FakeIndex::new(IndexBackend::FullText),
            5,
        );

        let doc = h.service.enqueue_document(b"cancel me", "doc.pdf").unwrap();
        let claimed = h.db.claim_next(Utc::now()).unwrap().unwrap();

        // Cancelled while the worker holds the claim.
        assert!(h.service.cancel_document(&doc.id).unwrap());
        h.service.process_document(&claimed).await;

        let final_doc = h.service.document_status(&doc.id).unwrap();
        assert_eq!(final_doc.state, ProcessingState::DeadLettered);
        assert_eq!(final_doc.last_error.as_deref(), Some("cancelled"));
        // The stage result was discarded: no chunks, nothing indexed.
        assert_eq!(h.db.chunk_count(&doc.id).unwrap(), 0);
        assert!(h.vector.written().is_empty());
    }

    #[tokio::test]
    async fn duplicate_upload_reuses_the_existing_document() {
        let h = harness(
            FakeExtractor::new(1),
            FakeEmbedder::new(),
            FakeIndex::new(IndexBackend::Vector),
            FakeIndex::new(IndexBackend::FullText),
            5,
        );

        let first = h.service.enqueue_document(b"same bytes", "a.pdf").unwrap();
        let second = h.service.enqueue_document(b"same bytes", "b.pdf").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(h.db.list_documents().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn oversized_uploads_are_rejected() {
        let h = harness(
            FakeExtractor::new(1),
            FakeEmbedder::new(),
            FakeIndex::new(IndexBackend::Vector),
            FakeIndex::new(IndexBackend::FullText),
            5,
        );

        let body = vec![0u8; 2 * 1024 * 1024];
        let err = h.service.enqueue_document(&body, "huge.pdf").unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Processing(ProcessingError::FileTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn dead_lettered_document_can_be_reenqueued() {
        let h = harness(
            FakeExtractor::permanent_failure(),
            FakeEmbedder::new(),
            FakeIndex::new(IndexBackend::Vector),
            FakeIndex::new(IndexBackend::FullText),
            5,
        );

        let doc = h.service.enqueue_document(b"try again", "doc.docx").unwrap();
        drive(&h).await;
        assert_eq!(
            h.service.document_status(&doc.id).unwrap().state,
            ProcessingState::DeadLettered
        );

        assert!(h.service.reenqueue_document(&doc.id).unwrap());
        let requeued = h.service.document_status(&doc.id).unwrap();
        assert_eq!(requeued.state, ProcessingState::Queued);
        assert_eq!(requeued.retry_count, 0);
    }
}
